use std::collections::{HashMap, VecDeque};
use std::ptr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::rdma::cq::{WcOpcode, WcStatus};
use crate::rdma::mr::Mr;
use crate::rdma::qp::RcQp;
use crate::rdma::types::WrId;

use super::context::Shared;
use super::handle::Handle;
use super::matcher::StreamMatcher;
use super::ticket::{Ticket, TICKET_BYTES};

/// Completions reaped per CQ poll.
pub(crate) const POLL_BATCH: usize = 32;

/// Send-queue slots kept free under the configured depth.
pub(crate) const SEND_HEADROOM: usize = 16;

/// How long the engine keeps reaping outstanding completions on finalize.
pub(crate) const DRAIN_BUDGET: Duration = Duration::from_millis(200);

/// The send-side I/O engine.
///
/// Owns the QP send queue: every `ibv_post_send` of the context goes
/// through this thread, which keeps the outstanding-work-request
/// accounting single-writer. It advertises local recv tickets to the peer
/// as small SENDs out of a slot pool, pairs local sends with
/// peer-advertised recv tickets per stream, and carries each pair with one
/// RDMA WRITE-with-immediate whose immediate data is the stream id.
pub(crate) struct SendEngine {
    qp: RcQp,
    ctrl_mr: Mr,
    shared: Arc<Shared>,

    matcher: StreamMatcher,
    pending_forwards: VecDeque<Ticket>,

    /// Free 20-byte slots in the control-send buffer.
    free_slots: Vec<usize>,

    /// Data writes in flight, keyed by `wr_id`.
    inflight: HashMap<WrId, Handle>,
    next_wr_id: WrId,

    /// Signaled posts not yet reaped, tickets included.
    outstanding: usize,
    max_outstanding: usize,
}

impl SendEngine {
    pub(crate) fn new(qp: RcQp, ctrl_mr: Mr, shared: Arc<Shared>) -> Self {
        let slot_count = ctrl_mr.len() / TICKET_BYTES;
        let depth = qp.config().send_cq_depth as usize;
        Self {
            qp,
            ctrl_mr,
            shared,
            matcher: StreamMatcher::new(),
            pending_forwards: VecDeque::new(),
            free_slots: (0..slot_count).rev().collect(),
            inflight: HashMap::new(),
            next_wr_id: 0,
            outstanding: 0,
            max_outstanding: depth.saturating_sub(SEND_HEADROOM).max(1),
        }
    }

    pub(crate) fn run(mut self) {
        while !self.shared.finalized.load(Ordering::Acquire) {
            self.pump();
            match self.step() {
                Ok(true) => {}
                Ok(false) => thread::yield_now(),
                Err(e) => {
                    log::error!("send engine: {}", e);
                    self.shared.fatal();
                    self.resolve_pending(true, &e.to_string());
                    return;
                }
            }
        }

        if self.shared.failed.load(Ordering::Acquire) {
            self.resolve_pending(true, "context failed");
            return;
        }
        self.drain_completions();
        self.resolve_pending(false, "");
    }

    /// Drain the ingress queues into engine-confined state.
    fn pump(&mut self) {
        while let Some(cmd) = self.shared.local_send.pop() {
            self.matcher.push_local(cmd);
        }
        while let Some(ticket) = self.shared.remote.pop() {
            self.matcher.push_remote(ticket);
        }
        while let Some(ticket) = self.shared.forward.pop() {
            self.pending_forwards.push_back(ticket);
        }
    }

    fn step(&mut self) -> Result<bool> {
        let posted = self.post_ready()?;
        let reaped = self.reap()?;
        Ok(posted || reaped > 0)
    }

    fn slot_addr(&self, slot: usize) -> u64 {
        self.ctrl_mr.addr() as u64 + (slot * TICKET_BYTES) as u64
    }

    /// Post whatever is ready, respecting the outstanding-WR cap.
    fn post_ready(&mut self) -> Result<bool> {
        let mut progressed = false;

        // Ticket advertisements first: they unblock the peer's matcher.
        while self.outstanding < self.max_outstanding && !self.pending_forwards.is_empty() {
            let Some(slot) = self.free_slots.pop() else {
                break;
            };
            let ticket = self.pending_forwards.pop_front().unwrap();
            let addr = self.slot_addr(slot);
            unsafe {
                ptr::copy_nonoverlapping(ticket.to_bytes().as_ptr(), addr as *mut u8, TICKET_BYTES)
            };
            if let Err(e) = self.qp.post_send_send(
                slot as WrId,
                addr,
                TICKET_BYTES as u32,
                self.ctrl_mr.lkey(),
                true,
            ) {
                self.free_slots.push(slot);
                return Err(e);
            }
            self.outstanding += 1;
            progressed = true;
        }

        // Then one WRITE-with-immediate per matched pair.
        while self.outstanding < self.max_outstanding {
            let Some(((ticket, handle), peer)) = self.matcher.pop_match() else {
                break;
            };
            if ticket.length != peer.length {
                let detail = format!(
                    "length mismatch on stream {}: send {} vs recv {}",
                    ticket.stream_id, ticket.length, peer.length
                );
                handle.fail_transport(&detail);
                return Err(Error::TransportFailed(detail));
            }

            let wr_id = self.next_wr_id;
            self.next_wr_id += 1;
            if let Err(e) = self.qp.post_send_write_with_imm(
                wr_id,
                ticket.addr,
                peer.addr,
                ticket.length,
                ticket.stream_id,
                ticket.key,
                peer.key,
                true,
            ) {
                handle.fail_transport(&e.to_string());
                return Err(e);
            }
            self.inflight.insert(wr_id, handle);
            self.outstanding += 1;
            progressed = true;
        }

        Ok(progressed)
    }

    /// Reap the send CQ, freeing ticket slots and signalling send handles.
    fn reap(&mut self) -> Result<usize> {
        let wcs = self.qp.poll_send_cq_once(POLL_BATCH)?;
        for wc in &wcs {
            if wc.status != WcStatus::Success {
                return Err(Error::TransportFailed(format!(
                    "send completion failed: {}",
                    wc.status
                )));
            }
            self.outstanding = self.outstanding.saturating_sub(1);
            match wc.opcode {
                WcOpcode::Send => self.free_slots.push(wc.wr_id as usize),
                WcOpcode::RdmaWrite => match self.inflight.remove(&wc.wr_id) {
                    Some(handle) => handle.complete(),
                    None => {
                        return Err(Error::TransportFailed(format!(
                            "write completion for unknown wr_id {}",
                            wc.wr_id
                        )))
                    }
                },
                other => {
                    return Err(Error::TransportFailed(format!(
                        "unexpected send completion opcode {:?}",
                        other
                    )))
                }
            }
        }
        Ok(wcs.len())
    }

    /// Reap already-posted work on finalize, bounded so a dead peer cannot
    /// wedge destruction.
    fn drain_completions(&mut self) {
        let deadline = Instant::now() + DRAIN_BUDGET;
        while self.outstanding > 0 && Instant::now() < deadline {
            match self.reap() {
                Ok(0) => thread::yield_now(),
                Ok(_) => {}
                Err(e) => {
                    log::warn!("send engine: drain stopped: {}", e);
                    return;
                }
            }
        }
        if self.outstanding > 0 {
            log::warn!(
                "send engine: exiting with {} unreaped completions",
                self.outstanding
            );
        }
    }

    /// Resolve every handle this engine still knows about.
    fn resolve_pending(&mut self, transport: bool, detail: &str) {
        self.pump();
        let mut handles: Vec<Handle> = Vec::new();
        handles.extend(self.matcher.drain_local().into_iter().map(|(_, h)| h));
        handles.extend(self.inflight.drain().map(|(_, h)| h));
        while let Some((_, handle)) = self.shared.local_send.pop() {
            handles.push(handle);
        }
        for handle in handles {
            if transport {
                handle.fail_transport(detail);
            } else {
                handle.fail_cancelled();
            }
        }
    }
}
