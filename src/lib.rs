//! Reliable, flow-controlled byte streams over RDMA verbs.
//!
//! A connection pairs a two-sided send/receive control channel with a
//! one-sided RDMA-write data channel: at connect time each side registers
//! a double-mapped circular sink buffer and tells the peer where it lives;
//! afterwards `write` pushes bytes straight into the peer's sink with
//! write-with-immediate, and `read` drains the local sink. A fixed credit
//! scheme bounds outstanding work in both channels, replenished by acks
//! piggy-backed on immediate data and by explicit flow-control messages.
//!
//! No thread drives a connection. Progress happens inside `read`/`write`/
//! `close`, or when the owning event loop polls the connection's notifier
//! fd (one epoll handle multiplexing connection-manager events, completion
//! events, and buffered-byte availability).
//!
//! ```no_run
//! use rdma_stream::{ConnConfig, RdmaConnection};
//!
//! # fn main() -> std::io::Result<()> {
//! let server = RdmaConnection::new(ConnConfig::default());
//! server.listen("10.0.0.1:18515".parse().unwrap())?;
//! let peer = server.accept_sync()?;
//!
//! let mut buf = [0u8; 4096];
//! let n = peer.read(&mut buf, true)?;
//! peer.write(&buf[..n])?;
//! peer.close();
//! # Ok(())
//! # }
//! ```

mod config;
mod connection;
mod event;
mod flow;
mod msg_pool;
mod protocol;
mod ring;
mod ring_buffer;
mod verbs;
mod window;

pub use config::ConnConfig;
pub use connection::{ConnStats, ConnectionState, RdmaConnection, StateListener};
pub use event::{EventSet, Notifier};
pub use protocol::{MAX_ACKS_PER_IMM, MAX_BYTES_PER_WRITE, PROTOCOL_MAGIC, PROTOCOL_VERSION};
pub use ring_buffer::{DoubleMapping, RingBuffer};
