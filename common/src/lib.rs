pub mod broker;
pub mod brokers;
pub mod config;
pub mod dag;
pub mod errors;
pub mod eventloop;
pub mod events;
pub mod future;
pub mod patterns;
pub mod queue;
pub mod task;

use serde::{Deserialize, Serialize};

pub use broker::{Broker, BrokerCore};
pub use errors::{BrokerError, FailureKind, FutureError, SubmitError, TaskFailure};
pub use events::{EventPayload, Event};
pub use future::TaskFuture;
pub use task::{
    NewTask, Outcome, OutputChunk, Task, TaskFilter, TaskId, TaskSpec, TaskStatus, TaskUpdate,
};

/* --------- Estructuras para el broker HTTP --------- */

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTasksRequest {
    pub tasks: Vec<NewTask>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTasksResponse {
    pub ids: Vec<TaskId>,
}

/// Cuerpo de fetch, delete, heartbeat y lectura de salida.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskIdsRequest {
    pub ids: Vec<TaskId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TasksResponse {
    pub tasks: Vec<Task>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetStatusRequest {
    pub ids: Vec<TaskId>,
    pub status: TaskStatus,
    pub outcome: Option<Outcome>,
}

/// Ids que de verdad cambiaron de estado.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetStatusResponse {
    pub changed: Vec<TaskId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquireResponse {
    pub acquired: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputResponse {
    pub chunks: Vec<OutputChunk>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishRequest {
    /// Id del proceso que publica; ese mismo proceso lo ignora al leer.
    pub origin: String,
    pub events: Vec<String>,
    pub payload: EventPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteEvent {
    pub seq: u64,
    pub origin: String,
    pub events: Vec<String>,
    pub payload: EventPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsResponse {
    /// Valor de `since` para el próximo poll.
    pub next: u64,
    pub events: Vec<RemoteEvent>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OkResponse {
    pub ok: bool,
}
