//! Common types shared across the quota crates
//!
//! The user record lives here so that the store, the engine and the HTTP
//! layer agree on one shape without depending on each other.

pub mod error;
pub mod user;
pub mod validation;

pub use error::*;
pub use user::*;
pub use validation::*;
