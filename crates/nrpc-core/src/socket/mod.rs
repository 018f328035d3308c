//! Session layer: the server and client halves of the handshake and the
//! forward/reverse call channels.

pub(crate) mod channel;
mod client;
mod metadata;
mod server;
mod session;

pub use client::ClientSocket;
pub use metadata::SocketMetadata;
pub use server::ServerSocket;
pub use session::{Session, SessionSnapshot};
