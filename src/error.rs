use std::io;

use thiserror::Error;

use crate::rdma::cq::WcStatus;
use crate::rdma::qp::QpState;

/// Errors surfaced by this crate.
///
/// Setup failures are returned synchronously from the constructing call.
/// Data-plane failures are recorded once on the owning context and mirrored
/// into every pending and future [`Handle`](crate::Handle).
#[derive(Debug, Error)]
pub enum Error {
    /// The named RDMA device does not exist on this host.
    #[error("RDMA device `{0}` not found")]
    DeviceNotFound(String),

    /// A device was found but could not be opened.
    #[error("failed to open RDMA device: {0}")]
    DeviceOpenFailed(#[source] io::Error),

    /// `ibv_alloc_pd` refused the allocation.
    #[error("failed to allocate protection domain: {0}")]
    PdAllocFailed(#[source] io::Error),

    /// `ibv_reg_mr` refused the registration.
    #[error("failed to register memory region: {0}")]
    MrRegFailed(#[source] io::Error),

    /// CQ or QP creation failed.
    #[error("failed to create queue pair: {0}")]
    QpCreateFailed(#[source] io::Error),

    /// `bring_up` called on a QP that is neither RESET nor already RTS.
    #[error("cannot bring up queue pair from state {0:?}")]
    QpNotReset(QpState),

    /// A RESET→INIT→RTR→RTS transition was rejected by the driver.
    #[error("queue pair transition to {0:?} failed: {1}")]
    QpTransitionFailed(QpState, #[source] io::Error),

    /// An `ibv_query_*` call failed.
    #[error("failed to query {0}: {1}")]
    QueryFailed(&'static str, #[source] io::Error),

    /// Rejected submission: zero length, out-of-bounds range, wrong API
    /// version, or a QP that is not ready.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A verbs post operation returned a nonzero errno.
    #[error("failed to post {0}: {1}")]
    PostFailed(&'static str, #[source] io::Error),

    /// `ibv_poll_cq` itself failed.
    #[error("failed to poll completion queue: {0}")]
    PollFailed(#[source] io::Error),

    /// A work completion carried a non-success status.
    #[error("work completion failed: {0}")]
    CompletionFailed(#[source] WcStatus),

    /// The context hit a fatal data-plane error. All in-flight and future
    /// operations on the context resolve to this.
    #[error("transport failed: {0}")]
    TransportFailed(String),

    /// The context was destroyed while the operation was still pending.
    #[error("operation cancelled")]
    Cancelled,

    /// Control-channel or thread-spawn I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Control-channel JSON codec error.
    #[error("control message codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;
