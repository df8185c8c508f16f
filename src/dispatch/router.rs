//! Message router — decodes inbound worker frames and applies them to the dispatcher.

use tracing::{debug, warn};

use super::dispatcher::Dispatcher;
use super::model::WorkerId;
use super::protocol::{self, WorkerMessage};
use super::registry::RegistrationInfo;
use crate::error::{DispatchError, ProtocolError};

/// Route one text frame from `worker_id`. Malformed or unknown frames are
/// logged and dropped.
pub async fn route_message(dispatcher: &Dispatcher, worker_id: WorkerId, text: &str) {
    match protocol::decode(text) {
        Ok(message) => route(dispatcher, worker_id, message).await,
        Err(ProtocolError::Malformed { kind, reason }) if kind == "register" => {
            let error = DispatchError::Registration { worker_id, reason };
            warn!(worker_id = %worker_id, error = %error, "Dropping malformed registration");
        }
        Err(e) => {
            warn!(worker_id = %worker_id, error = %e, "Dropping malformed message");
        }
    }
}

/// Apply an already decoded message.
pub async fn route(dispatcher: &Dispatcher, worker_id: WorkerId, message: WorkerMessage) {
    debug!(worker_id = %worker_id, kind = message.kind(), "Message from worker");

    match message {
        WorkerMessage::Register {
            capabilities,
            name,
            version,
            platform,
        } => {
            let registration = RegistrationInfo {
                capabilities,
                name,
                version,
                platform,
            };
            if let Err(e) = dispatcher.register_worker(worker_id, registration).await {
                warn!(worker_id = %worker_id, error = %e, "Registration rejected");
            }
        }
        WorkerMessage::TaskComplete { task_id, response } => {
            dispatcher.complete_task(worker_id, task_id, response).await;
        }
        WorkerMessage::TaskProgress { task_id, progress } => {
            dispatcher.report_progress(worker_id, task_id, progress).await;
        }
        WorkerMessage::Heartbeat => {
            dispatcher.heartbeat(worker_id).await;
        }
        WorkerMessage::Error { error } => {
            dispatcher.report_error(worker_id, error).await;
        }
        WorkerMessage::Capabilities { capabilities } => {
            if let Err(e) = dispatcher.update_capabilities(worker_id, capabilities).await {
                warn!(worker_id = %worker_id, error = %e, "Capability update rejected");
            }
        }
        WorkerMessage::Unknown => {
            warn!(worker_id = %worker_id, "Unknown message type from worker");
        }
    }
}
