use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_queue::SegQueue;

use crate::error::{Error, Result};
use crate::rdma::mr::Mr;
use crate::rdma::qp::{QpState, RcQp};
use crate::rdma::types::{LKey, RKey, StreamId};

use super::handle::Handle;
use super::recv_engine::RecvEngine;
use super::send_engine::SendEngine;
use super::ticket::{Command, Ticket, TICKET_BYTES};
use super::v2::{MemCopy, RecvEngineV2, SendEngineV2};

/// State shared between the user-facing context and the two I/O engines.
///
/// The queues are the only cross-thread channel; all other engine state is
/// thread-confined.
pub(crate) struct Shared {
    /// Set on destruction or on a fatal data-plane error; observed by the
    /// engines to exit their loops.
    pub(crate) finalized: AtomicBool,

    /// Set on the first fatal data-plane error, before `finalized`.
    pub(crate) failed: AtomicBool,

    /// User `send` submissions.
    pub(crate) local_send: SegQueue<Command>,

    /// User `recv` submissions.
    pub(crate) local_recv: SegQueue<Command>,

    /// Local recv tickets awaiting advertisement to the peer.
    pub(crate) forward: SegQueue<Ticket>,

    /// Peer-advertised recv tickets awaiting a local send.
    pub(crate) remote: SegQueue<Ticket>,
}

impl Shared {
    fn new() -> Self {
        Self {
            finalized: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            local_send: SegQueue::new(),
            local_recv: SegQueue::new(),
            forward: SegQueue::new(),
            remote: SegQueue::new(),
        }
    }

    /// Record a fatal data-plane error and ask both engines to exit.
    pub(crate) fn fatal(&self) {
        self.failed.store(true, Ordering::Release);
        self.finalized.store(true, Ordering::Release);
    }

    /// Fail every submission still sitting in the ingress queues.
    pub(crate) fn drain_failing(&self, detail: &str) {
        while let Some((_, handle)) = self.local_send.pop() {
            handle.fail_transport(detail);
        }
        while let Some((_, handle)) = self.local_recv.pop() {
            handle.fail_transport(detail);
        }
    }

    fn drain_cancelling(&self) {
        while let Some((_, handle)) = self.local_send.pop() {
            handle.fail_cancelled();
        }
        while let Some((_, handle)) = self.local_recv.pop() {
            handle.fail_cancelled();
        }
    }
}

/// Which data-plane verb a context was constructed for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ApiVersion {
    /// RDMA WRITE-with-immediate straight into the user buffer.
    V1,
    /// Plain SEND through staging buffers plus a byte-copy callback.
    V2,
}

/// Options recognized at context construction.
#[derive(Clone, Copy, Debug, Default)]
pub struct StreamOptions {
    /// Number of pre-posted control slots on the recv side.
    /// Defaults to the QP's recv queue depth.
    pub control_slots: Option<u32>,
}

struct ContextInner {
    shared: Arc<Shared>,
    api: ApiVersion,
    send_thread: Option<JoinHandle<()>>,
    recv_thread: Option<JoinHandle<()>>,
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        self.shared.finalized.store(true, Ordering::Release);
        if let Some(t) = self.send_thread.take() {
            let _ = t.join();
        }
        if let Some(t) = self.recv_thread.take() {
            let _ = t.join();
        }
        // The engines are gone; anything still queued was never claimed.
        if self.shared.failed.load(Ordering::Acquire) {
            self.shared.drain_failing("context failed");
        } else {
            self.shared.drain_cancelling();
        }
    }
}

/// The multi-stream messaging context.
///
/// Consumes a brought-up RC queue pair and runs two background I/O
/// threads over it. `send`/`recv` never block; the returned [`Handle`]s
/// do. Cheaply cloneable; dropping the last clone finalizes the context,
/// joins both threads and cancels still-pending submissions.
#[derive(Clone)]
pub struct StreamContext {
    inner: Arc<ContextInner>,
}

impl StreamContext {
    /// Create a context over a brought-up (RTS) queue pair.
    pub fn create(qp: RcQp) -> Result<Self> {
        Self::create_with_options(qp, StreamOptions::default())
    }

    /// Like [`StreamContext::create`], with explicit options.
    pub fn create_with_options(qp: RcQp, options: StreamOptions) -> Result<Self> {
        if qp.state()? != QpState::Rts {
            return Err(Error::InvalidArgument(
                "queue pair must be RTS before creating a context".to_owned(),
            ));
        }

        let config = qp.config();
        let send_slots = config.send_cq_depth as usize;
        let recv_slots = options.control_slots.unwrap_or(config.recv_cq_depth) as usize;
        if recv_slots == 0 || recv_slots > config.recv_cq_depth as usize {
            return Err(Error::InvalidArgument(format!(
                "control_slots must be in 1..={}",
                config.recv_cq_depth
            )));
        }

        let pd = qp.pd();
        let ctrl_send = Mr::alloc(pd.clone(), send_slots * TICKET_BYTES)?;
        let ctrl_recv = Mr::alloc(pd, recv_slots * TICKET_BYTES)?;

        let shared = Arc::new(Shared::new());

        let send_engine = SendEngine::new(qp.clone(), ctrl_send, shared.clone());
        let send_thread = thread::Builder::new()
            .name("rcmux-send".to_owned())
            .spawn(move || send_engine.run())?;

        let recv_engine = RecvEngine::new(qp, ctrl_recv, shared.clone());
        let recv_thread = thread::Builder::new()
            .name("rcmux-recv".to_owned())
            .spawn(move || recv_engine.run())?;

        Ok(Self {
            inner: Arc::new(ContextInner {
                shared,
                api: ApiVersion::V1,
                send_thread: Some(send_thread),
                recv_thread: Some(recv_thread),
            }),
        })
    }

    /// Create a context using the deprecated V2 copy path.
    ///
    /// Data moves through the two caller-registered staging buffers with
    /// plain SENDs; `mem_cpy` shuttles bytes between staging slots and
    /// user addresses. Both staging buffers must belong to the QP's
    /// protection domain and hold at least one slot per queue entry.
    #[deprecated(note = "the V2 copy path is retained for compatibility; use `create` instead")]
    pub fn create_v2(
        qp: RcQp,
        device_send_buffer: Mr,
        device_recv_buffer: Mr,
        mem_cpy: Arc<dyn MemCopy>,
    ) -> Result<Self> {
        if qp.state()? != QpState::Rts {
            return Err(Error::InvalidArgument(
                "queue pair must be RTS before creating a context".to_owned(),
            ));
        }
        let pd = qp.pd();
        if device_send_buffer.pd().as_ptr() != pd.as_ptr()
            || device_recv_buffer.pd().as_ptr() != pd.as_ptr()
        {
            return Err(Error::InvalidArgument(
                "staging buffers must belong to the queue pair's protection domain".to_owned(),
            ));
        }

        let config = qp.config();
        let send_slot_size = device_send_buffer.len() / config.send_cq_depth as usize;
        let recv_slot_size = device_recv_buffer.len() / config.recv_cq_depth as usize;
        if send_slot_size == 0 || recv_slot_size == 0 {
            return Err(Error::InvalidArgument(
                "staging buffers are too small for the configured queue depths".to_owned(),
            ));
        }

        let shared = Arc::new(Shared::new());

        let send_engine = SendEngineV2::new(
            qp.clone(),
            device_send_buffer,
            send_slot_size,
            mem_cpy.clone(),
            shared.clone(),
        );
        let send_thread = thread::Builder::new()
            .name("rcmux-send".to_owned())
            .spawn(move || send_engine.run())?;

        let recv_engine =
            RecvEngineV2::new(qp, device_recv_buffer, recv_slot_size, mem_cpy, shared.clone());
        let recv_thread = thread::Builder::new()
            .name("rcmux-recv".to_owned())
            .spawn(move || recv_engine.run())?;

        Ok(Self {
            inner: Arc::new(ContextInner {
                shared,
                api: ApiVersion::V2,
                send_thread: Some(send_thread),
                recv_thread: Some(recv_thread),
            }),
        })
    }

    fn submit(&self, api: ApiVersion, is_send: bool, ticket: Ticket) -> Handle {
        if self.inner.api != api {
            return Handle::invalid(format!(
                "context was created for the {:?} API",
                self.inner.api
            ));
        }
        if ticket.length == 0 {
            return Handle::invalid("zero-length submission");
        }

        let shared = &self.inner.shared;
        if shared.failed.load(Ordering::Acquire) {
            return Handle::transport_failed("context failed");
        }
        if shared.finalized.load(Ordering::Acquire) {
            return Handle::cancelled();
        }

        let handle = Handle::pending();
        let queue = if is_send {
            &shared.local_send
        } else {
            &shared.local_recv
        };
        queue.push((ticket, handle.clone()));

        // The engines may have failed and drained between the check above
        // and the push; reclaim so no handle is stranded.
        if shared.failed.load(Ordering::Acquire) {
            shared.drain_failing("context failed");
        }
        handle
    }

    /// Submit a send of `length` bytes at `addr` (registered under `lkey`)
    /// on the given stream.
    ///
    /// The returned handle resolves once the transfer has been
    /// acknowledged by the peer NIC.
    pub fn send(&self, stream_id: StreamId, addr: u64, length: u32, lkey: LKey) -> Handle {
        self.submit(
            ApiVersion::V1,
            true,
            Ticket {
                stream_id,
                length,
                addr,
                key: lkey,
            },
        )
    }

    /// Submit a recv of exactly `length` bytes into `addr` (registered
    /// under `rkey`) on the given stream.
    ///
    /// The returned handle resolves once the full `length` bytes have been
    /// DMA'd into the buffer.
    pub fn recv(&self, stream_id: StreamId, addr: u64, length: u32, rkey: RKey) -> Handle {
        self.submit(
            ApiVersion::V1,
            false,
            Ticket {
                stream_id,
                length,
                addr,
                key: rkey,
            },
        )
    }

    fn check_region(mr: &Mr, offset: usize, length: u32) -> Option<Handle> {
        let end = offset.checked_add(length as usize);
        if end.map_or(true, |end| end > mr.len()) {
            return Some(Handle::invalid(format!(
                "range {}..{} exceeds MR length {}",
                offset,
                offset.saturating_add(length as usize),
                mr.len()
            )));
        }
        None
    }

    /// Bounds-checked [`StreamContext::send`] over a registered region.
    pub fn send_region(&self, stream_id: StreamId, mr: &Mr, offset: usize, length: u32) -> Handle {
        if let Some(rejected) = Self::check_region(mr, offset, length) {
            return rejected;
        }
        self.send(stream_id, mr.addr() as u64 + offset as u64, length, mr.lkey())
    }

    /// Bounds-checked [`StreamContext::recv`] over a registered region.
    pub fn recv_region(&self, stream_id: StreamId, mr: &Mr, offset: usize, length: u32) -> Handle {
        if let Some(rejected) = Self::check_region(mr, offset, length) {
            return rejected;
        }
        self.recv(stream_id, mr.addr() as u64 + offset as u64, length, mr.rkey())
    }

    /// Submit a send on a V2 context. The bytes are staged through the
    /// device send buffer by the injected copy capability.
    #[deprecated(note = "the V2 copy path is retained for compatibility; use `send` instead")]
    pub fn send_v2(&self, stream_id: StreamId, addr: u64, length: u32) -> Handle {
        self.submit(
            ApiVersion::V2,
            true,
            Ticket {
                stream_id,
                length,
                addr,
                key: 0,
            },
        )
    }

    /// Submit a recv on a V2 context. No rkey is needed; the payload is
    /// copied out of the device recv buffer by the injected capability.
    #[deprecated(note = "the V2 copy path is retained for compatibility; use `recv` instead")]
    pub fn recv_v2(&self, stream_id: StreamId, addr: u64, length: u32) -> Handle {
        self.submit(
            ApiVersion::V2,
            false,
            Ticket {
                stream_id,
                length,
                addr,
                key: 0,
            },
        )
    }
}
