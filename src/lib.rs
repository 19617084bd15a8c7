//! Callback-driven engine for managing many concurrent TCP connections.
//!
//! A [`TcpNode`] accepts inbound connections, dials outbound ones and moves
//! opaque byte buffers to and from every peer using three background threads.
//! Nothing blocks the caller: outcomes, including every failure, are reported
//! through registered callbacks.
//!
//! The engine is written against the [`Socket`] trait. [`TcpSocket`] is the
//! default implementation; others can be injected with
//! [`TcpNode::with_socket_factory`].

#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]

#[cfg(not(target_os = "linux"))]
compile_error!("This crate is only compatible with Linux systems.");

mod callback;
pub mod config;
pub mod error;
pub mod net;
mod node;
pub mod peer;
mod registry;

pub use config::Config;
pub use error::{Error, FailureKind, Message, Result};
pub use net::{ConnectProgress, IpVersion, ReceiveOutcome, Socket, SocketFactory, TcpSocket};
pub use node::TcpNode;
pub use peer::{DisconnectReason, Peer, PeerId};
