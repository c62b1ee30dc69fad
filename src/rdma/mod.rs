// RDMA contexts.
pub mod context;

// RDMA completion queues.
pub mod cq;

// RDMA device GIDs.
pub mod gid;

// Local RDMA memory regions.
pub mod mr;

// RDMA protection domains.
pub mod pd;

// RDMA reliable-connected queue pairs.
pub mod qp;

// Related types.
pub mod types;
