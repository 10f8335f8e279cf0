//! `pipebridge` Core Library
//!
//! Shared functionality for `pipebridge` components:
//! - Tagged output messages and their wire representation
//! - Configuration resolution and hierarchy
//! - Queue overflow and fan-out policies
//! - Common error types

pub mod config;
pub mod error;
pub mod message;
pub mod policy;
pub mod tracing_init;

pub use config::Config;
pub use error::{Error, Result};
pub use message::Message;
pub use policy::{FanoutPolicy, OverflowPolicy};
