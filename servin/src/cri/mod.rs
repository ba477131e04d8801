//! Kubernetes-compatible Container Runtime Interface over HTTP+JSON.

mod server;
mod types;

pub use server::{CriServer, DEFAULT_CRI_PORT, cri_router};
pub use types::*;
