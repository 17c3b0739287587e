//! CLI subcommands other than running the broker itself.

pub mod service;

pub use service::{ServiceError, ServiceManager};
