//! Admin API and process plumbing for the usage accounting daemon

pub mod api;
pub mod error;
pub mod logging;
pub mod shutdown;

pub use api::{router, AppState};
pub use error::ApiError;
