//! Engines for the deprecated V2 copy path.
//!
//! V2 replaces the WRITE-with-immediate data plane with plain SENDs into a
//! caller-registered staging buffer, followed by a byte copy to the final
//! address. The extra copy exists to serve buffers the NIC can reach but
//! the CPU cannot address directly; the copy routine is injected rather
//! than baked in.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::ptr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use crate::error::{Error, Result};
use crate::rdma::cq::{WcOpcode, WcStatus};
use crate::rdma::mr::Mr;
use crate::rdma::qp::RcQp;
use crate::rdma::types::WrId;

use super::context::Shared;
use super::handle::Handle;
use super::matcher::StreamFifos;
use super::send_engine::{DRAIN_BUDGET, POLL_BATCH, SEND_HEADROOM};
use super::ticket::Command;

/// Byte-copy capability between staging slots and user addresses.
///
/// Addresses are the raw values registered with the MRs; for device
/// staging buffers this is typically a DMA-capable copy routine.
pub trait MemCopy: Send + Sync {
    /// Copy `len` bytes from `src` to `dst`.
    fn copy(&self, dst: u64, src: u64, len: u64) -> io::Result<()>;
}

/// [`MemCopy`] over plain host memory.
pub struct HostMemCopy;

impl MemCopy for HostMemCopy {
    fn copy(&self, dst: u64, src: u64, len: u64) -> io::Result<()> {
        unsafe { ptr::copy_nonoverlapping(src as *const u8, dst as *mut u8, len as usize) };
        Ok(())
    }
}

/// Send-side engine of the V2 copy path.
///
/// Stages each submission into a free slot of the device send buffer via
/// the injected copy capability, then posts a plain SEND carrying the
/// stream id as immediate data. No ticket exchange; the peer must have a
/// recv outstanding when the SEND lands.
pub(crate) struct SendEngineV2 {
    qp: RcQp,
    staging: Mr,
    slot_size: usize,
    mem_cpy: Arc<dyn MemCopy>,
    shared: Arc<Shared>,

    queue: VecDeque<Command>,
    free_slots: Vec<usize>,
    inflight: HashMap<WrId, (usize, Handle)>,
    next_wr_id: WrId,

    outstanding: usize,
    max_outstanding: usize,
}

impl SendEngineV2 {
    pub(crate) fn new(
        qp: RcQp,
        staging: Mr,
        slot_size: usize,
        mem_cpy: Arc<dyn MemCopy>,
        shared: Arc<Shared>,
    ) -> Self {
        let depth = qp.config().send_cq_depth as usize;
        Self {
            qp,
            staging,
            slot_size,
            mem_cpy,
            shared,
            queue: VecDeque::new(),
            free_slots: (0..depth).rev().collect(),
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
                    log::error!("send engine (v2): {}", e);
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

    fn pump(&mut self) {
        while let Some(cmd) = self.shared.local_send.pop() {
            self.queue.push_back(cmd);
        }
    }

    fn step(&mut self) -> Result<bool> {
        let posted = self.stage_and_post()?;
        let reaped = self.reap()?;
        Ok(posted || reaped > 0)
    }

    fn stage_and_post(&mut self) -> Result<bool> {
        let mut progressed = false;
        while self.outstanding < self.max_outstanding && !self.queue.is_empty() {
            let Some(slot) = self.free_slots.pop() else {
                break;
            };
            let (ticket, handle) = self.queue.pop_front().unwrap();
            if ticket.length as usize > self.slot_size {
                handle.fail_invalid(&format!(
                    "message of {} bytes exceeds the {}-byte staging slot",
                    ticket.length, self.slot_size
                ));
                self.free_slots.push(slot);
                continue;
            }

            let dst = self.staging.addr() as u64 + (slot * self.slot_size) as u64;
            if let Err(e) = self.mem_cpy.copy(dst, ticket.addr, ticket.length as u64) {
                let detail = format!("staging copy failed: {}", e);
                handle.fail_transport(&detail);
                return Err(Error::TransportFailed(detail));
            }

            let wr_id = self.next_wr_id;
            self.next_wr_id += 1;
            if let Err(e) = self.qp.post_send_send_with_imm(
                wr_id,
                dst,
                ticket.length,
                self.staging.lkey(),
                ticket.stream_id,
                true,
            ) {
                handle.fail_transport(&e.to_string());
                return Err(e);
            }
            self.inflight.insert(wr_id, (slot, handle));
            self.outstanding += 1;
            progressed = true;
        }
        Ok(progressed)
    }

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
            match (wc.opcode, self.inflight.remove(&wc.wr_id)) {
                (WcOpcode::Send, Some((slot, handle))) => {
                    self.free_slots.push(slot);
                    handle.complete();
                }
                _ => {
                    return Err(Error::TransportFailed(format!(
                        "unexpected send completion: opcode {:?}, wr_id {}",
                        wc.opcode, wc.wr_id
                    )))
                }
            }
        }
        Ok(wcs.len())
    }

    fn drain_completions(&mut self) {
        let deadline = Instant::now() + DRAIN_BUDGET;
        while self.outstanding > 0 && Instant::now() < deadline {
            match self.reap() {
                Ok(0) => thread::yield_now(),
                Ok(_) => {}
                Err(e) => {
                    log::warn!("send engine (v2): drain stopped: {}", e);
                    return;
                }
            }
        }
    }

    fn resolve_pending(&mut self, transport: bool, detail: &str) {
        self.pump();
        let mut handles: Vec<Handle> = Vec::new();
        handles.extend(self.queue.drain(..).map(|(_, h)| h));
        handles.extend(self.inflight.drain().map(|(_, (_, h))| h));
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

/// Recv-side engine of the V2 copy path.
///
/// Pre-posts one recv per staging slot; an incoming SEND's immediate names
/// the stream, and the payload is copied from the slot to the in-flight
/// recv's address by the injected capability.
pub(crate) struct RecvEngineV2 {
    qp: RcQp,
    staging: Mr,
    slot_size: usize,
    slots: usize,
    mem_cpy: Arc<dyn MemCopy>,
    shared: Arc<Shared>,

    inflight: StreamFifos<Command>,
}

impl RecvEngineV2 {
    pub(crate) fn new(
        qp: RcQp,
        staging: Mr,
        slot_size: usize,
        mem_cpy: Arc<dyn MemCopy>,
        shared: Arc<Shared>,
    ) -> Self {
        let slots = qp.config().recv_cq_depth as usize;
        Self {
            qp,
            staging,
            slot_size,
            slots,
            mem_cpy,
            shared,
            inflight: StreamFifos::new(),
        }
    }

    fn slot_addr(&self, slot: usize) -> u64 {
        self.staging.addr() as u64 + (slot * self.slot_size) as u64
    }

    fn post_slot(&self, slot: usize) -> Result<()> {
        self.qp.post_recv(
            slot as WrId,
            self.slot_addr(slot),
            self.slot_size as u32,
            self.staging.lkey(),
        )
    }

    pub(crate) fn run(mut self) {
        let primed: Result<()> = (0..self.slots).try_for_each(|slot| self.post_slot(slot));
        if let Err(e) = primed {
            log::error!("recv engine (v2): {}", e);
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
                    log::error!("recv engine (v2): {}", e);
                    self.shared.fatal();
                    self.resolve_pending(true, &e.to_string());
                    return;
                }
            }
        }

        let failed = self.shared.failed.load(Ordering::Acquire);
        self.resolve_pending(failed, "context failed");
    }

    fn pump(&mut self) {
        while let Some((ticket, handle)) = self.shared.local_recv.pop() {
            self.inflight.push(ticket.stream_id, (ticket, handle));
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
            if wc.opcode != WcOpcode::Recv {
                return Err(Error::TransportFailed(format!(
                    "unexpected recv completion opcode {:?}",
                    wc.opcode
                )));
            }

            let stream_id = wc.imm_data;
            let Some((ticket, handle)) = self.inflight.pop_front(stream_id) else {
                return Err(Error::TransportFailed(format!(
                    "message for stream {} with no pending recv",
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

            let slot = wc.wr_id as usize;
            if let Err(e) = self
                .mem_cpy
                .copy(ticket.addr, self.slot_addr(slot), wc.byte_len as u64)
            {
                let detail = format!("delivery copy failed: {}", e);
                handle.fail_transport(&detail);
                return Err(Error::TransportFailed(detail));
            }
            self.post_slot(slot)?;
            handle.complete();
        }
        Ok(wcs.len())
    }

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
