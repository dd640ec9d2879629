pub mod job;
pub mod priority;
pub mod resources;
pub mod sandbox;
pub mod scheduler;
pub mod worker;

pub use job::ExecutionStrategy;
pub use worker::{StopHandle, Worker, WorkerConfig};
