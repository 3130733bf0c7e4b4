//! Session lifecycle.
//!
//! A session provisions one Connect container, waits for it, mints an API
//! key, runs the caller's command and always removes the container.

mod guard;
mod orchestrator;
mod state;

pub use guard::ContainerGuard;
pub use orchestrator::{
    CONFIG_MOUNT_PATH, CONNECT_CONTAINER_PORT, LICENSE_MOUNT_PATH, PreparedSession,
    SESSION_LABEL, SessionConfig, SessionOrchestrator, SessionReport, default_min_version,
    ensure_port_free,
};
pub use state::{SessionState, StateTracker};
