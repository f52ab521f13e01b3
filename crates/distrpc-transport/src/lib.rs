//! Credential resolution and channel lifecycle for the distributed RPC
//! transport layer.

#![warn(missing_docs)]

mod channel;
mod credentials;

pub use channel::{Channel, ChannelConfig, ChannelError, ChannelState, KEEPALIVE_INTERVAL, KEEPALIVE_TIMEOUT};
pub use credentials::{CredentialConfig, CredentialProvider, Credentials, TlsCredentials};
