use std::ptr::NonNull;
use std::sync::Arc;
use std::{fmt, io, mem, ptr};

use rdma_sys::*;
use serde::{Deserialize, Serialize};

use super::context::Context;
use super::cq::{Cq, Wc};
use super::gid::Gid;
use super::pd::Pd;
use super::types::*;
use crate::error::{Error, Result};
use crate::utils::interop::{from_c_ret, last_os_error};
use crate::utils::select::Select;

/// Queue pair state.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum QpState {
    /// Freshly created.
    Reset,
    /// Initialized.
    Init,
    /// Ready To Receive.
    Rtr,
    /// Ready To Send.
    Rts,
    /// Any other state (draining, error, ...).
    Unknown,
}

impl From<u32> for QpState {
    fn from(state: u32) -> Self {
        match state {
            ibv_qp_state::IBV_QPS_RESET => QpState::Reset,
            ibv_qp_state::IBV_QPS_INIT => QpState::Init,
            ibv_qp_state::IBV_QPS_RTR => QpState::Rtr,
            ibv_qp_state::IBV_QPS_RTS => QpState::Rts,
            _ => QpState::Unknown,
        }
    }
}

/// Handshake record exchanged between peers before bring-up.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct HandshakeData {
    pub gid: Gid,
    pub lid: Lid,
    pub qp_num: Qpn,
}

/// Size of the fixed handshake wire record.
pub const HANDSHAKE_BYTES: usize = 26;

impl HandshakeData {
    /// Encode into the fixed 26-byte wire record:
    /// 16-byte GID, LID (LE), QP number (LE), 4 reserved bytes.
    pub fn to_bytes(&self) -> [u8; HANDSHAKE_BYTES] {
        let mut buf = [0u8; HANDSHAKE_BYTES];
        buf[0..16].copy_from_slice(&self.gid.as_bytes());
        buf[16..18].copy_from_slice(&self.lid.to_le_bytes());
        buf[18..22].copy_from_slice(&self.qp_num.to_le_bytes());
        buf
    }

    /// Decode from the fixed 26-byte wire record.
    pub fn from_bytes(buf: &[u8; HANDSHAKE_BYTES]) -> Self {
        let mut gid = [0u8; 16];
        gid.copy_from_slice(&buf[0..16]);
        Self {
            gid: Gid::from(gid),
            lid: u16::from_le_bytes([buf[16], buf[17]]),
            qp_num: u32::from_le_bytes([buf[18], buf[19], buf[20], buf[21]]),
        }
    }
}

/// Queue pair depth configuration.
///
/// The send queue doubles as the cap on outstanding signaled work requests;
/// the recv queue bounds the pre-posted control slots.
#[derive(Clone, Copy, Debug)]
pub struct RcQpConfig {
    /// Send queue and send CQ depth.
    pub send_cq_depth: u32,

    /// Recv queue and recv CQ depth.
    pub recv_cq_depth: u32,
}

impl Default for RcQpConfig {
    fn default() -> Self {
        Self {
            send_cq_depth: 128,
            recv_cq_depth: 1024,
        }
    }
}

/// Maximum inline payload configured on the send queue.
const MAX_INLINE_DATA: u32 = 64;

struct RcQpInner {
    pd: Pd,
    qp: NonNull<ibv_qp>,
    send_cq: Cq,
    recv_cq: Cq,
    config: RcQpConfig,
}

unsafe impl Send for RcQpInner {}
unsafe impl Sync for RcQpInner {}

impl Drop for RcQpInner {
    fn drop(&mut self) {
        // The QP goes first; the CQs and PD follow as fields drop.
        unsafe { ibv_destroy_qp(self.qp.as_ptr()) };
    }
}

/// Reliable-connected queue pair with its two completion queues.
///
/// This type is a simple wrapper of an `Arc` and can be cheaply cloned.
/// The send side and the recv side may be driven from different threads
/// without cross-side contention.
#[derive(Clone)]
pub struct RcQp {
    inner: Arc<RcQpInner>,
}

impl fmt::Debug for RcQp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("RcQp<{:p}>", self.inner.qp.as_ptr()))
    }
}

impl RcQp {
    /// Create an RC queue pair in the RESET state.
    pub fn create(pd: Pd, config: RcQpConfig) -> Result<Self> {
        let send_cq = Cq::new(pd.context(), config.send_cq_depth)?;
        let recv_cq = Cq::new(pd.context(), config.recv_cq_depth)?;

        let mut init_attr = ibv_qp_init_attr {
            qp_context: ptr::null_mut(),
            send_cq: send_cq.as_ptr(),
            recv_cq: recv_cq.as_ptr(),
            srq: ptr::null_mut(),
            cap: ibv_qp_cap {
                max_send_wr: config.send_cq_depth,
                max_recv_wr: config.recv_cq_depth,
                max_send_sge: 1,
                max_recv_sge: 1,
                max_inline_data: MAX_INLINE_DATA,
            },
            qp_type: ibv_qp_type::IBV_QPT_RC,
            sq_sig_all: 0,
        };

        let qp = NonNull::new(unsafe { ibv_create_qp(pd.as_ptr(), &mut init_attr) })
            .ok_or_else(|| Error::QpCreateFailed(last_os_error()))?;

        Ok(Self {
            inner: Arc::new(RcQpInner {
                pd,
                qp,
                send_cq,
                recv_cq,
                config,
            }),
        })
    }

    /// Open the named device (or the first found) on its first port and
    /// create a default-configured RC queue pair on a fresh protection
    /// domain.
    pub fn on_device(dev_name: Option<&str>) -> Result<Self> {
        let ctx = Context::open(dev_name, 1, 0)?;
        let pd = Pd::new(ctx)?;
        Self::create(pd, RcQpConfig::default())
    }

    /// Get the underlying `ibv_qp` pointer.
    #[inline]
    pub fn as_ptr(&self) -> *mut ibv_qp {
        self.inner.qp.as_ptr()
    }

    /// Get the protection domain of this queue pair.
    #[inline]
    pub fn pd(&self) -> Pd {
        self.inner.pd.clone()
    }

    /// Get the context of this queue pair.
    #[inline]
    pub fn context(&self) -> Context {
        self.inner.pd.context()
    }

    /// Get the depth configuration of this queue pair.
    #[inline]
    pub fn config(&self) -> RcQpConfig {
        self.inner.config
    }

    /// Get the queue pair number.
    #[inline]
    pub fn qp_num(&self) -> Qpn {
        unsafe { (*self.inner.qp.as_ptr()).qp_num }
    }

    /// Query the current state of the queue pair.
    pub fn state(&self) -> Result<QpState> {
        let mut attr = unsafe { mem::zeroed::<ibv_qp_attr>() };
        let mut init_attr = unsafe { mem::zeroed::<ibv_qp_init_attr>() };
        let ret = unsafe {
            ibv_query_qp(
                self.inner.qp.as_ptr(),
                &mut attr,
                ibv_qp_attr_mask::IBV_QP_STATE.0 as i32,
                &mut init_attr,
            )
        };
        if ret != 0 {
            return Err(Error::QueryFailed(
                "qp state",
                io::Error::from_raw_os_error(ret),
            ));
        }
        Ok(QpState::from(attr.qp_state))
    }

    /// Get the handshake record to hand to the remote peer.
    pub fn handshake(&self) -> Result<HandshakeData> {
        let ctx = self.context();
        Ok(HandshakeData {
            gid: ctx.gid(),
            lid: ctx.lid(),
            qp_num: self.qp_num(),
        })
    }

    fn modify_reset_to_init(&self) -> Result<()> {
        let mut attr = unsafe { mem::zeroed::<ibv_qp_attr>() };
        attr.qp_state = ibv_qp_state::IBV_QPS_INIT;
        attr.pkey_index = 0;
        attr.port_num = self.context().port_num();
        attr.qp_access_flags = (ibv_access_flags::IBV_ACCESS_LOCAL_WRITE
            | ibv_access_flags::IBV_ACCESS_REMOTE_WRITE
            | ibv_access_flags::IBV_ACCESS_REMOTE_READ)
            .0;

        let attr_mask = ibv_qp_attr_mask::IBV_QP_STATE
            | ibv_qp_attr_mask::IBV_QP_PKEY_INDEX
            | ibv_qp_attr_mask::IBV_QP_PORT
            | ibv_qp_attr_mask::IBV_QP_ACCESS_FLAGS;

        let ret = unsafe { ibv_modify_qp(self.inner.qp.as_ptr(), &mut attr, attr_mask.0 as i32) };
        from_c_ret(ret).map_err(|e| Error::QpTransitionFailed(QpState::Init, e))
    }

    fn modify_init_to_rtr(&self, peer: &HandshakeData) -> Result<()> {
        let ctx = self.context();

        let mut attr = unsafe { mem::zeroed::<ibv_qp_attr>() };
        attr.qp_state = ibv_qp_state::IBV_QPS_RTR;
        attr.path_mtu = ctx.mtu_raw();
        attr.dest_qp_num = peer.qp_num;
        attr.rq_psn = 0;
        attr.max_dest_rd_atomic = 16;
        attr.min_rnr_timer = 12;

        attr.ah_attr.grh.dgid = ibv_gid::from(peer.gid);
        attr.ah_attr.grh.flow_label = 0;
        attr.ah_attr.grh.sgid_index = ctx.gid_index();
        attr.ah_attr.grh.hop_limit = 0xFF;
        attr.ah_attr.grh.traffic_class = 0;
        attr.ah_attr.dlid = peer.lid;
        attr.ah_attr.sl = 0;
        attr.ah_attr.src_path_bits = 0;
        attr.ah_attr.port_num = ctx.port_num();
        attr.ah_attr.is_global = 1;

        let attr_mask = ibv_qp_attr_mask::IBV_QP_STATE
            | ibv_qp_attr_mask::IBV_QP_AV
            | ibv_qp_attr_mask::IBV_QP_PATH_MTU
            | ibv_qp_attr_mask::IBV_QP_DEST_QPN
            | ibv_qp_attr_mask::IBV_QP_RQ_PSN
            | ibv_qp_attr_mask::IBV_QP_MAX_DEST_RD_ATOMIC
            | ibv_qp_attr_mask::IBV_QP_MIN_RNR_TIMER;

        let ret = unsafe { ibv_modify_qp(self.inner.qp.as_ptr(), &mut attr, attr_mask.0 as i32) };
        from_c_ret(ret).map_err(|e| Error::QpTransitionFailed(QpState::Rtr, e))
    }

    fn modify_rtr_to_rts(&self) -> Result<()> {
        let mut attr = unsafe { mem::zeroed::<ibv_qp_attr>() };
        attr.qp_state = ibv_qp_state::IBV_QPS_RTS;
        attr.sq_psn = 0;
        attr.max_rd_atomic = 16;
        attr.timeout = 14;
        attr.retry_cnt = 7;
        attr.rnr_retry = 7;

        let attr_mask = ibv_qp_attr_mask::IBV_QP_STATE
            | ibv_qp_attr_mask::IBV_QP_SQ_PSN
            | ibv_qp_attr_mask::IBV_QP_MAX_QP_RD_ATOMIC
            | ibv_qp_attr_mask::IBV_QP_TIMEOUT
            | ibv_qp_attr_mask::IBV_QP_RETRY_CNT
            | ibv_qp_attr_mask::IBV_QP_RNR_RETRY;

        let ret = unsafe { ibv_modify_qp(self.inner.qp.as_ptr(), &mut attr, attr_mask.0 as i32) };
        from_c_ret(ret).map_err(|e| Error::QpTransitionFailed(QpState::Rts, e))
    }

    /// Drive the queue pair to RTS against the given remote peer.
    ///
    /// Idempotent when the queue pair is already RTS. Fails with
    /// [`Error::QpNotReset`] in any other non-RESET state.
    pub fn bring_up(&self, peer: &HandshakeData) -> Result<()> {
        match self.state()? {
            QpState::Rts => Ok(()),
            QpState::Reset => {
                self.modify_reset_to_init()?;
                self.modify_init_to_rtr(peer)?;
                self.modify_rtr_to_rts()
            }
            other => Err(Error::QpNotReset(other)),
        }
    }

    fn post_send_wr(
        &self,
        op: &'static str,
        wr_id: WrId,
        laddr: u64,
        length: u32,
        lkey: LKey,
        opcode: u32,
        imm: ImmData,
        remote: Option<(u64, RKey)>,
        signaled: bool,
    ) -> Result<()> {
        let mut sge = ibv_sge {
            addr: laddr,
            length,
            lkey,
        };
        let mut wr = unsafe { mem::zeroed::<ibv_send_wr>() };
        wr.wr_id = wr_id;
        wr.next = ptr::null_mut();
        wr.sg_list = &mut sge;
        wr.num_sge = 1;
        wr.opcode = opcode;
        wr.send_flags = signaled.select_val(ibv_send_flags::IBV_SEND_SIGNALED.0, 0);
        wr.imm_data_invalidated_rkey_union = imm_data_invalidated_rkey_union_t { imm_data: imm };
        if let Some((raddr, rkey)) = remote {
            wr.wr.rdma = rdma_t {
                remote_addr: raddr,
                rkey,
            };
        }

        let ret = unsafe {
            let mut bad_wr = ptr::null_mut();
            ibv_post_send(self.inner.qp.as_ptr(), &mut wr, &mut bad_wr)
        };
        from_c_ret(ret).map_err(|e| Error::PostFailed(op, explain_post_err(e)))
    }

    /// Post a two-sided SEND.
    pub fn post_send_send(
        &self,
        wr_id: WrId,
        laddr: u64,
        length: u32,
        lkey: LKey,
        signaled: bool,
    ) -> Result<()> {
        self.post_send_wr(
            "send",
            wr_id,
            laddr,
            length,
            lkey,
            ibv_wr_opcode::IBV_WR_SEND,
            0,
            None,
            signaled,
        )
    }

    /// Post a two-sided SEND carrying immediate data.
    pub fn post_send_send_with_imm(
        &self,
        wr_id: WrId,
        laddr: u64,
        length: u32,
        lkey: LKey,
        imm: ImmData,
        signaled: bool,
    ) -> Result<()> {
        self.post_send_wr(
            "send with imm",
            wr_id,
            laddr,
            length,
            lkey,
            ibv_wr_opcode::IBV_WR_SEND_WITH_IMM,
            imm,
            None,
            signaled,
        )
    }

    /// Post a one-sided RDMA WRITE.
    #[allow(clippy::too_many_arguments)]
    pub fn post_send_write(
        &self,
        wr_id: WrId,
        laddr: u64,
        raddr: u64,
        length: u32,
        lkey: LKey,
        rkey: RKey,
        signaled: bool,
    ) -> Result<()> {
        self.post_send_wr(
            "write",
            wr_id,
            laddr,
            length,
            lkey,
            ibv_wr_opcode::IBV_WR_RDMA_WRITE,
            0,
            Some((raddr, rkey)),
            signaled,
        )
    }

    /// Post a one-sided RDMA WRITE carrying immediate data. The immediate
    /// consumes a pre-posted recv work request on the remote side.
    #[allow(clippy::too_many_arguments)]
    pub fn post_send_write_with_imm(
        &self,
        wr_id: WrId,
        laddr: u64,
        raddr: u64,
        length: u32,
        imm: ImmData,
        lkey: LKey,
        rkey: RKey,
        signaled: bool,
    ) -> Result<()> {
        self.post_send_wr(
            "write with imm",
            wr_id,
            laddr,
            length,
            lkey,
            ibv_wr_opcode::IBV_WR_RDMA_WRITE_WITH_IMM,
            imm,
            Some((raddr, rkey)),
            signaled,
        )
    }

    /// Post a one-sided RDMA READ.
    #[allow(clippy::too_many_arguments)]
    pub fn post_send_read(
        &self,
        wr_id: WrId,
        laddr: u64,
        raddr: u64,
        length: u32,
        lkey: LKey,
        rkey: RKey,
        signaled: bool,
    ) -> Result<()> {
        self.post_send_wr(
            "read",
            wr_id,
            laddr,
            length,
            lkey,
            ibv_wr_opcode::IBV_WR_RDMA_READ,
            0,
            Some((raddr, rkey)),
            signaled,
        )
    }

    /// Post a recv work request.
    pub fn post_recv(&self, wr_id: WrId, addr: u64, length: u32, lkey: LKey) -> Result<()> {
        let mut sge = ibv_sge {
            addr,
            length,
            lkey,
        };
        let mut wr = ibv_recv_wr {
            wr_id,
            next: ptr::null_mut(),
            sg_list: &mut sge,
            num_sge: 1,
        };
        let ret = unsafe {
            let mut bad_wr = ptr::null_mut();
            ibv_post_recv(self.inner.qp.as_ptr(), &mut wr, &mut bad_wr)
        };
        from_c_ret(ret).map_err(|e| Error::PostFailed("recv", explain_post_err(e)))
    }

    fn zeroed_wcs(num: usize) -> Vec<ibv_wc> {
        (0..num).map(|_| unsafe { mem::zeroed() }).collect()
    }

    fn poll_cq_once(cq: &Cq, max: usize) -> Result<Vec<Wc>> {
        let mut raw = Self::zeroed_wcs(max);
        let polled = cq.poll(&mut raw).map_err(Error::PollFailed)?;
        Ok(raw[..polled].iter().map(Wc::from).collect())
    }

    /// Poll the send CQ once, returning 0 to `max` completions without
    /// blocking. Statuses are reported, not judged.
    pub fn poll_send_cq_once(&self, max: usize) -> Result<Vec<Wc>> {
        Self::poll_cq_once(&self.inner.send_cq, max)
    }

    /// Poll the recv CQ once, returning 0 to `max` completions without
    /// blocking. Statuses are reported, not judged.
    pub fn poll_recv_cq_once(&self, max: usize) -> Result<Vec<Wc>> {
        Self::poll_cq_once(&self.inner.recv_cq, max)
    }

    fn wait_until_completion(cq: &Cq, num: usize) -> Result<Vec<Wc>> {
        let mut out = Vec::with_capacity(num);
        let mut raw = Self::zeroed_wcs(num);
        while out.len() < num {
            let polled = cq.poll(&mut raw[..num - out.len()]).map_err(Error::PollFailed)?;
            if polled == 0 {
                std::hint::spin_loop();
                continue;
            }
            out.extend(raw[..polled].iter().map(Wc::from));
        }
        Ok(out)
    }

    /// Spin on the send CQ until at least `num` completions are collected
    /// or a poll error occurs.
    pub fn wait_until_send_completion(&self, num: usize) -> Result<Vec<Wc>> {
        Self::wait_until_completion(&self.inner.send_cq, num)
    }

    /// Spin on the recv CQ until at least `num` completions are collected
    /// or a poll error occurs.
    pub fn wait_until_recv_completion(&self, num: usize) -> Result<Vec<Wc>> {
        Self::wait_until_completion(&self.inner.recv_cq, num)
    }
}

/// Attach an explanation to the common `ibv_post_send`/`ibv_post_recv`
/// errnos.
fn explain_post_err(e: io::Error) -> io::Error {
    let explanation = match e.raw_os_error() {
        Some(libc::EINVAL) => "invalid work request",
        Some(libc::ENOMEM) => "work queue is full, or not enough resources",
        Some(libc::EFAULT) => "invalid QP",
        _ => return e,
    };
    io::Error::new(e.kind(), format!("{} ({})", e, explanation))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_layout() {
        let hs = HandshakeData {
            gid: Gid::from([
                0xfe, 0x80, 0, 0, 0, 0, 0, 0, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08,
            ]),
            lid: 0x1234,
            qp_num: 0xdeadbeef,
        };
        let bytes = hs.to_bytes();
        assert_eq!(bytes.len(), HANDSHAKE_BYTES);
        assert_eq!(&bytes[0..2], &[0xfe, 0x80]);
        // LID and QPN are little-endian on the wire.
        assert_eq!(&bytes[16..18], &[0x34, 0x12]);
        assert_eq!(&bytes[18..22], &[0xef, 0xbe, 0xad, 0xde]);
        assert_eq!(&bytes[22..26], &[0, 0, 0, 0]);
        assert_eq!(HandshakeData::from_bytes(&bytes), hs);
    }
}
