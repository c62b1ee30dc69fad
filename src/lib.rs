//! Reliable multi-stream messaging over a single RDMA RC queue pair.
//!
//! `rcmux` layers a backpressured, multi-stream `send`/`recv` abstraction on
//! top of raw RDMA verbs. Applications submit transfers against a 32-bit
//! stream identifier and get back a [`Handle`] whose `wait()` blocks until
//! the transfer has landed exactly once in a matching receiver-posted
//! buffer. Per-stream delivery is FIFO; distinct streams are independent.
//!
//! The crate has two layers:
//!
//! - [`rdma`](crate::Context): safe, `Arc`-based wrappings of the verbs
//!   resources the core consumes — device context, protection domain,
//!   memory region and a reliable-connected queue pair with its completion
//!   queues. Resources are acquired on construction and released in
//!   reverse order on drop.
//! - [`StreamContext`]: the messaging context. Each context owns two
//!   background I/O threads that pair local sends with peer-advertised
//!   receive tickets per stream and carry the payload with a single RDMA
//!   WRITE-with-immediate.
//!
//! Connection bring-up needs an out-of-band exchange of a small handshake
//! record; the [`ctrl`] module provides a TCP-based [`ctrl::Connecter`]
//! for that purpose.
//!
//! # Example
//!
//! Loopback transfer between two QPs on the same device:
//!
//! ```no_run
//! use rcmux::{Context, Mr, Pd, RcQp, RcQpConfig, StreamContext};
//!
//! # fn main() -> rcmux::Result<()> {
//! let ctx = Context::open(None, 1, 0)?;
//! let pd = Pd::new(ctx)?;
//!
//! let qp1 = RcQp::create(pd.clone(), RcQpConfig::default())?;
//! let qp2 = RcQp::create(pd.clone(), RcQpConfig::default())?;
//! qp1.bring_up(&qp2.handshake()?)?;
//! qp2.bring_up(&qp1.handshake()?)?;
//!
//! let src = Mr::alloc(pd.clone(), 4096)?;
//! let dst = Mr::alloc(pd.clone(), 4096)?;
//!
//! let tx = StreamContext::create(qp1)?;
//! let rx = StreamContext::create(qp2)?;
//!
//! let sent = tx.send(7, src.addr() as u64, 255, src.lkey());
//! let recvd = rx.recv(7, dst.addr() as u64, 255, dst.rkey());
//! sent.wait()?;
//! recvd.wait()?;
//! # Ok(())
//! # }
//! ```

#[cfg(not(target_os = "linux"))]
compile_error!("`rcmux` currently only supports Linux");

/// Shared util functions.
mod utils;

/// Crate-wide error type.
mod error;

/// Verbs-level resource wrappings.
mod rdma;

/// The multi-stream messaging context.
mod stream;

/// Connection bootstrap utilities.
pub mod ctrl;

pub use error::{Error, Result};

pub use rdma::context::Context;
pub use rdma::cq::{Wc, WcOpcode, WcStatus};
pub use rdma::gid::Gid;
pub use rdma::mr::{Mr, RemoteMr};
pub use rdma::pd::Pd;
pub use rdma::qp::{HandshakeData, QpState, RcQp, RcQpConfig};

/// Type aliases for RDMA-related quantities.
pub use rdma::types;

pub use stream::{Handle, HostMemCopy, MemCopy, StreamContext, StreamOptions};
