// # -----------------------------
// # crates/common/src/lib.rs
// # -----------------------------
//! Building blocks shared by every coordinator instance: the wire codec, the
//! local channel transport, the process-table collaborator, durable file
//! writes and the configuration layer.

pub mod config;
pub mod fs;
pub mod process_utils;
pub mod protocol;
pub mod transport;

pub use config::CoordConfig;
pub use protocol::{decode, encode, DecodeError, Message, SettingsUpdate, SharedSettings};
pub use transport::{connect, try_bind, Connection, Endpoint, FrameError, Listener, TransportError};
