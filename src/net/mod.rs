//! Socket abstraction the engine is written against, and its default
//! implementation over the Linux socket API.

mod socket;
pub(crate) mod sys;
mod tcp;

#[cfg(test)]
pub(crate) mod mock;

pub use socket::{ConnectProgress, IpVersion, ReceiveOutcome, Socket, SocketFactory};
pub use tcp::TcpSocket;
