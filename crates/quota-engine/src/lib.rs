//! Usage accounting and quota enforcement for proxy users
//!
//! Log lines flow through [`parser`] into the [`registry`]; the
//! [`enforcement`] loop persists the registry and applies [`policy`] to each
//! user; [`service`] ties boot and administrative lifecycle together.

pub mod config;
pub mod enforcement;
pub mod error;
pub mod ingest;
pub mod metrics;
pub mod parser;
pub mod policy;
pub mod registry;
pub mod retry;
pub mod service;
pub mod source;

pub use config::{
    DefaultsConfig, EnforcementConfig, IngestConfig, IngestSource, LogFormat, LoggingConfig,
    RetryConfig, ServerConfig, ServiceConfig,
};
pub use enforcement::{EnforcementLoop, TickReport};
pub use error::{EngineError, Result};
pub use ingest::{IngestLoop, LineOutcome};
pub use metrics::UsageMetrics;
pub use parser::{parse_line, MalformedLine, UsageEntry};
pub use policy::{evaluate, LockDecision, PolicyEnforcer};
pub use registry::UserRegistry;
pub use retry::RetryPolicy;
pub use service::UsageService;
pub use source::{accept_tcp_source, open_source, FileFollower, LineSource, ReaderSource};
