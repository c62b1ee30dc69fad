// The public messaging context.
mod context;

// Completion handles returned to the user.
mod handle;

// Per-stream FIFO correlation state.
mod matcher;

// The recv-side I/O engine.
mod recv_engine;

// The send-side I/O engine.
mod send_engine;

// Ticket and command records.
mod ticket;

// The deprecated V2 copy-path engines.
mod v2;

pub use context::{StreamContext, StreamOptions};
pub use handle::Handle;
pub use v2::{HostMemCopy, MemCopy};
