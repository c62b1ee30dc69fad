use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;

use crate::error::{Error, Result};
use crate::rdma::cq::{WcOpcode, WcStatus};
use crate::rdma::mr::Mr;
use crate::rdma::qp::RcQp;
use crate::rdma::types::WrId;

use super::context::Shared;
use super::handle::Handle;
use super::matcher::StreamFifos;
use super::send_engine::POLL_BATCH;
use super::ticket::{Command, Ticket, TICKET_BYTES};

/// The recv-side I/O engine.
///
/// Keeps the QP recv queue primed with fixed-size control slots, records
/// local recv submissions in a per-stream in-flight table, hands their
/// tickets to the send engine for advertisement, and reaps the recv CQ:
/// an incoming WRITE-with-immediate fulfills the in-flight head of the
/// stream named by the immediate; an incoming SEND carries a peer ticket
/// for the send engine's matcher.
pub(crate) struct RecvEngine {
    qp: RcQp,
    ctrl_mr: Mr,
    slots: usize,
    shared: Arc<Shared>,

    /// Local recv submissions awaiting their immediate, per stream.
    inflight: StreamFifos<Command>,
}

impl RecvEngine {
    pub(crate) fn new(qp: RcQp, ctrl_mr: Mr, shared: Arc<Shared>) -> Self {
        let slots = ctrl_mr.len() / TICKET_BYTES;
        Self {
            qp,
            ctrl_mr,
            slots,
            shared,
            inflight: StreamFifos::new(),
        }
    }

    pub(crate) fn run(mut self) {
        if let Err(e) = self.prime() {
            log::error!("recv engine: {}", e);
            self.shared.fatal();
            self.resolve_pending(true, &e.to_string());
            return;
        }

        while !self.shared.finalized.load(Ordering::Acquire) {
            self.pump();
            match self.reap() {
                Ok(0) => thread::yield_now(),
                Ok(_) => {}
                Err(e) => {
                    log::error!("recv engine: {}", e);
                    self.shared.fatal();
                    self.resolve_pending(true, &e.to_string());
                    return;
                }
            }
        }

        let failed = self.shared.failed.load(Ordering::Acquire);
        self.resolve_pending(failed, "context failed");
    }

    fn slot_addr(&self, slot: usize) -> u64 {
        self.ctrl_mr.addr() as u64 + (slot * TICKET_BYTES) as u64
    }

    fn post_slot(&self, slot: usize) -> Result<()> {
        self.qp.post_recv(
            slot as WrId,
            self.slot_addr(slot),
            TICKET_BYTES as u32,
            self.ctrl_mr.lkey(),
        )
    }

    /// Pre-post the whole control slot pool so that incoming immediates
    /// and tickets never starve the recv queue.
    fn prime(&self) -> Result<()> {
        for slot in 0..self.slots {
            self.post_slot(slot)?;
        }
        Ok(())
    }

    /// Record local recv submissions and queue their tickets for
    /// advertisement to the peer.
    fn pump(&mut self) {
        while let Some((ticket, handle)) = self.shared.local_recv.pop() {
            self.inflight.push(ticket.stream_id, (ticket, handle));
            self.shared.forward.push(ticket);
        }
    }

    fn reap(&mut self) -> Result<usize> {
        let wcs = self.qp.poll_recv_cq_once(POLL_BATCH)?;
        for wc in &wcs {
            if wc.status != WcStatus::Success {
                return Err(Error::TransportFailed(format!(
                    "recv completion failed: {}",
                    wc.status
                )));
            }
            match wc.opcode {
                WcOpcode::RecvRdmaImm => {
                    let stream_id = wc.imm_data;
                    let Some((ticket, handle)) = self.inflight.pop_front(stream_id) else {
                        return Err(Error::TransportFailed(format!(
                            "immediate for stream {} with no pending recv",
                            stream_id
                        )));
                    };
                    if wc.byte_len != ticket.length {
                        let detail = format!(
                            "stream {} delivered {} bytes into a {}-byte recv",
                            stream_id, wc.byte_len, ticket.length
                        );
                        handle.fail_transport(&detail);
                        return Err(Error::TransportFailed(detail));
                    }
                    handle.complete();
                }
                WcOpcode::Recv => {
                    if wc.byte_len as usize != TICKET_BYTES {
                        return Err(Error::TransportFailed(format!(
                            "malformed {}-byte control frame",
                            wc.byte_len
                        )));
                    }
                    let slot = wc.wr_id as usize;
                    let mut buf = [0u8; TICKET_BYTES];
                    unsafe {
                        std::ptr::copy_nonoverlapping(
                            self.slot_addr(slot) as *const u8,
                            buf.as_mut_ptr(),
                            TICKET_BYTES,
                        )
                    };
                    self.shared.remote.push(Ticket::from_bytes(&buf));
                }
                other => {
                    return Err(Error::TransportFailed(format!(
                        "unexpected recv completion opcode {:?}",
                        other
                    )))
                }
            }
            self.post_slot(wc.wr_id as usize)?;
        }
        Ok(wcs.len())
    }

    /// Resolve every handle this engine still knows about.
    fn resolve_pending(&mut self, transport: bool, detail: &str) {
        self.pump();
        let mut handles: Vec<Handle> = Vec::new();
        handles.extend(self.inflight.drain_all().into_iter().map(|(_, h)| h));
        while let Some((_, handle)) = self.shared.local_recv.pop() {
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
