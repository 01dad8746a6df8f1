pub mod channel_manager;
pub mod config;
pub mod confirm_tracker;
pub mod coordinator;
pub mod error;
pub mod matcher;
pub mod memory_broker;
pub mod partition;
pub mod store;
pub mod task;
pub mod watchdog;
pub mod worker;

#[cfg(feature = "distributed")]
pub mod amqp;
#[cfg(feature = "distributed")]
pub mod postgres_store;
#[cfg(feature = "distributed")]
mod telemetry;

pub use error::*;
pub use task::{CreateOutcome, CreatedTask, SubTask, Task, TaskResult, TaskStatus, TaskView};

#[cfg(feature = "distributed")]
pub use telemetry::init_tracing;
