//! Type aliases for RDMA-related operations.

/// Port number is a [`u8`] that identifies a port on a local switch or an HCA.
pub type PortNum = u8;

/// Local identifier (LID) is a [`u16`] that identifies a port on a switch or an HCA in the cluster.
pub type Lid = u16;

/// QP number (QPN) is a [`u32`] that identifies a local queue pair.
pub type Qpn = u32;

/// Local key (LKey) is a [`u32`] that identifies a local memory region.
pub type LKey = u32;

/// Remote key (RKey) is a [`u32`] that identifies a remote memory region.
pub type RKey = u32;

/// Work request identifier (WrId) is a [`u64`] that can be designated by the user to identify a work request.
pub type WrId = u64;

/// Immediate data (ImmData) is a [`u32`] that can be carried in RDMA send-type work requests.
pub type ImmData = u32;

/// Stream identifier is a [`u32`] that multiplexes independent ordered flows over a single QP.
pub type StreamId = u32;
