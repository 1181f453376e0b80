//! Connection to a remote game server: transport, wire format and the
//! session state machine built on top of them.

pub mod ndjson;
pub mod server;
pub mod session;
pub mod wire;

#[cfg(test)]
pub(crate) mod fake;
