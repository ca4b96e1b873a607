pub mod db;
pub mod error;
pub mod executor;
pub mod heartbeat;
pub mod schedule;
pub mod scheduler;
pub mod service;
pub mod types;

pub use error::{CronError, Result};
pub use executor::CronExecutor;
pub use heartbeat::HeartbeatService;
pub use scheduler::Scheduler;
pub use service::CronService;
pub use types::{CronJob, HEARTBEAT_JOB_ID, HEARTBEAT_MESSAGE_MARKER};
