//! Agent Dispatch — capability-aware task dispatcher for remote workers.

pub mod config;
pub mod dispatch;
pub mod error;
