//! A full-duplex WebSocket connection engine for an already-upgraded transport.
//!
//! This crate does not speak HTTP and does not perform the Upgrade handshake: it picks up
//! where that handshake left off, given any `AsyncRead + AsyncWrite` transport and the role
//! ([`frame::Role::Client`] or [`frame::Role::Server`]) that transport plays. From there
//! [`connection::Conn`] runs an independent read loop and write loop for the life of the
//! connection, implementing frame masking, fragmentation, control frames, and the close
//! handshake from [RFC 6455](https://datatracker.ietf.org/doc/html/rfc6455).

pub mod close;
pub mod config;
pub mod connection;
pub mod error;
pub mod frame;
pub mod message;
mod lifecycle;
mod read;
mod write;

pub use close::{CloseError, StatusCode};
pub use config::ConnConfig;
pub use connection::{Conn, ReadChunk, ReadHandle, WriteHandle};
pub use error::Error;
pub use frame::Role;
pub use message::MessageType;
