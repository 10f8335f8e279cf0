//! Connection sessions.
//!
//! Each websocket connection gets a [`ConnectionChannel`] bound to the
//! shared bridge; the [`ConnectionRegistry`] tracks which ones are alive.

mod channel;
mod registry;
mod types;

pub use channel::{ConnectionChannel, REJECTED_NOTICE, on_bridge_message};
pub use registry::{ConnectionRegistry, RegistrationGuard};
pub use types::{ChannelError, CloseReason, ConnectionInfo, RegistryError, RegistryStats};
