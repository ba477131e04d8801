//! Container lifecycle: manager, native engine and log capture.

mod engine;
mod logs;
mod manager;

pub use engine::NativeEngine;
pub use logs::{LogQuery, STDERR_LOG, STDOUT_LOG, follow_logs, read_logs, spawn_log_pump};
pub use manager::{ContainerFilter, ContainerManager};
