//! Task dispatch — capability-aware assignment of tasks to remote workers.
//!
//! Core components:
//! - `model` — Worker/task types, stats and observer events
//! - `protocol` — Wire messages exchanged with workers
//! - `registry` — Connected workers, their status and capabilities
//! - `results` — Pending task results keyed by task id
//! - `queue` — FIFO of tasks waiting for an eligible worker
//! - `dispatcher` — Coordinates registry, queue and results under one lock
//! - `liveness` — Heartbeat scan that probes and reaps workers
//! - `router` — Applies inbound worker frames to the dispatcher
//! - `ws` — WebSocket + REST transport

pub mod dispatcher;
pub mod liveness;
pub mod model;
pub mod protocol;
pub mod queue;
pub mod registry;
pub mod results;
pub mod router;
pub mod ws;

pub use dispatcher::Dispatcher;
pub use liveness::{ScanReport, spawn_liveness_task};
pub use model::{
    DispatchEvent, DispatchStats, RemovalCause, Task, TaskId, WorkerId, WorkerInfo, WorkerStatus,
};
pub use protocol::{ServerMessage, WorkerMessage};
pub use registry::{Outbound, RegistrationInfo, WorkerConnection};
pub use results::{TaskHandle, TaskResult};
pub use ws::{dispatch_routes, serve};
