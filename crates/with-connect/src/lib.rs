//! Run a command against a throwaway Posit Connect server.
//!
//! A session starts a licensed Connect container, waits for it to answer
//! its health endpoint, mints an API key through the bootstrap endpoint,
//! runs the caller's command with `CONNECT_SERVER` and `CONNECT_API_KEY`
//! set, and removes the container on every exit path.

pub mod bootstrap;
pub mod container;
pub mod error;
pub mod image;
pub mod interrupt;
pub mod readiness;
pub mod runner;
pub mod session;
