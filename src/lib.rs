//! linefetch: single-request file transfer over TCP.
//!
//! A client sends one newline-terminated path; the server validates it
//! against a root directory, streams the file back and closes the
//! connection.
//!
//! - `server`: accept loop, one task per connection
//! - `handler`: per-connection request/validate/stream state machine
//! - `resolver`: path validation against the root directory
//! - `client`: the requesting side
//! - `protocol`: request and status line codec

pub mod client;
pub mod config;
pub mod error;
pub mod handler;
pub mod protocol;
pub mod resolver;
pub mod server;

pub use client::Requester;
pub use error::{Result, TransferError};
pub use server::Server;
