//! Small host-side helpers shared across the crate.

mod process;
mod time;

pub use process::{is_process_alive, kill_process, signal_process};
pub use time::{parse_duration_arg, parse_time_arg};
