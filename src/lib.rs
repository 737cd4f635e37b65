pub mod config;
pub mod context;
pub mod controller;
pub mod error;
pub mod heartbeat;
pub mod helpers;
pub mod http;
pub mod monitor;
pub mod process_inspect;
pub mod registry;

pub use context::SupervisorContext;
pub use error::{Result, SupervisorError};
pub use registry::{ProcessConfig, ProcessInfo, ProcessState, ProcessType, RestartPolicy};
