//! Shared building blocks for gateway services
//!
//! - logging setup
//! - shutdown signal handling

pub mod logging;
pub mod shutdown;
