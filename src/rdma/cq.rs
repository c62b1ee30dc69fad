use std::ffi::CStr;
use std::fmt;
use std::io;
use std::mem;
use std::ptr::{self, NonNull};

use rdma_sys::*;

use super::context::Context;
use crate::error::{Error as CrateError, Result};
use crate::utils::interop::last_os_error;

/// Work completion opcode.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WcOpcode {
    Send,
    RdmaWrite,
    RdmaRead,
    CompSwap,
    FetchAdd,
    BindMw,
    Recv,
    RecvRdmaImm,
}

impl From<u32> for WcOpcode {
    fn from(code: u32) -> Self {
        match code {
            ibv_wc_opcode::IBV_WC_SEND => WcOpcode::Send,
            ibv_wc_opcode::IBV_WC_RDMA_WRITE => WcOpcode::RdmaWrite,
            ibv_wc_opcode::IBV_WC_RDMA_READ => WcOpcode::RdmaRead,
            ibv_wc_opcode::IBV_WC_COMP_SWAP => WcOpcode::CompSwap,
            ibv_wc_opcode::IBV_WC_FETCH_ADD => WcOpcode::FetchAdd,
            ibv_wc_opcode::IBV_WC_BIND_MW => WcOpcode::BindMw,
            ibv_wc_opcode::IBV_WC_RECV => WcOpcode::Recv,
            ibv_wc_opcode::IBV_WC_RECV_RDMA_WITH_IMM => WcOpcode::RecvRdmaImm,
            other => panic!("work completion with unknown opcode {}", other),
        }
    }
}

/// Work completion status.
///
/// Variants mirror the driver's `ibv_wc_status` constants; the display
/// text is taken from `ibv_wc_status_str` rather than restated here.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum WcStatus {
    Success = ibv_wc_status::IBV_WC_SUCCESS,
    LocLenErr = ibv_wc_status::IBV_WC_LOC_LEN_ERR,
    LocQpOpErr = ibv_wc_status::IBV_WC_LOC_QP_OP_ERR,
    LocEecOpErr = ibv_wc_status::IBV_WC_LOC_EEC_OP_ERR,
    LocProtErr = ibv_wc_status::IBV_WC_LOC_PROT_ERR,
    WrFlushErr = ibv_wc_status::IBV_WC_WR_FLUSH_ERR,
    MwBindErr = ibv_wc_status::IBV_WC_MW_BIND_ERR,
    BadRespErr = ibv_wc_status::IBV_WC_BAD_RESP_ERR,
    LocAccessErr = ibv_wc_status::IBV_WC_LOC_ACCESS_ERR,
    RemInvReqErr = ibv_wc_status::IBV_WC_REM_INV_REQ_ERR,
    RemAccessErr = ibv_wc_status::IBV_WC_REM_ACCESS_ERR,
    RemOpErr = ibv_wc_status::IBV_WC_REM_OP_ERR,
    RetryExcErr = ibv_wc_status::IBV_WC_RETRY_EXC_ERR,
    RnrRetryExcErr = ibv_wc_status::IBV_WC_RNR_RETRY_EXC_ERR,
    LocRddViolErr = ibv_wc_status::IBV_WC_LOC_RDD_VIOL_ERR,
    RemInvRdReqErr = ibv_wc_status::IBV_WC_REM_INV_RD_REQ_ERR,
    RemAbortErr = ibv_wc_status::IBV_WC_REM_ABORT_ERR,
    InvEecnErr = ibv_wc_status::IBV_WC_INV_EECN_ERR,
    InvEecStateErr = ibv_wc_status::IBV_WC_INV_EEC_STATE_ERR,
    FatalErr = ibv_wc_status::IBV_WC_FATAL_ERR,
    RespTimeoutErr = ibv_wc_status::IBV_WC_RESP_TIMEOUT_ERR,
    GeneralErr = ibv_wc_status::IBV_WC_GENERAL_ERR,
}

impl From<u32> for WcStatus {
    fn from(code: u32) -> Self {
        assert!(
            code <= ibv_wc_status::IBV_WC_GENERAL_ERR,
            "work completion with unknown status {}",
            code
        );
        // SAFETY: repr(u32) with one variant per status code in the
        // checked range.
        unsafe { mem::transmute(code) }
    }
}

impl fmt::Display for WcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = unsafe { CStr::from_ptr(ibv_wc_status_str(*self as u32)) };
        write!(f, "{} (status {})", msg.to_string_lossy(), *self as u32)
    }
}

impl std::error::Error for WcStatus {}

/// Work completion entry.
#[derive(Clone, Copy, Debug)]
pub struct Wc {
    /// User-designated identifier of the completed work request.
    pub wr_id: u64,

    /// Completion status.
    pub status: WcStatus,

    /// Opcode of the completed work request.
    pub opcode: WcOpcode,

    /// Number of bytes processed or transferred.
    pub byte_len: u32,

    /// Immediate data carried by the incoming request, if any.
    pub imm_data: u32,
}

impl Wc {
    /// Get the completion status as a `Result`.
    ///
    /// On success, return the number of bytes processed or transferred.
    #[inline]
    pub fn result(&self) -> Result<usize> {
        if self.status == WcStatus::Success {
            Ok(self.byte_len as usize)
        } else {
            Err(CrateError::CompletionFailed(self.status))
        }
    }
}

impl From<&ibv_wc> for Wc {
    fn from(wc: &ibv_wc) -> Self {
        Self {
            wr_id: wc.wr_id,
            status: WcStatus::from(wc.status),
            opcode: WcOpcode::from(wc.opcode),
            byte_len: wc.byte_len,
            imm_data: unsafe { wc.imm_data_invalidated_rkey_union.imm_data },
        }
    }
}

/// Completion queue.
///
/// Owned by the queue pair that created it; the original exposes no
/// standalone CQ surface and neither does this crate.
pub(crate) struct Cq {
    _ctx: Context,
    cq: NonNull<ibv_cq>,
}

unsafe impl Send for Cq {}
unsafe impl Sync for Cq {}

impl Cq {
    pub(crate) fn new(ctx: Context, depth: u32) -> Result<Self> {
        let cq = NonNull::new(unsafe {
            ibv_create_cq(
                ctx.as_ptr(),
                depth as i32,
                ptr::null_mut(),
                ptr::null_mut(),
                0,
            )
        })
        .ok_or_else(|| CrateError::QpCreateFailed(last_os_error()))?;

        Ok(Self { _ctx: ctx, cq })
    }

    #[inline]
    pub(crate) fn as_ptr(&self) -> *mut ibv_cq {
        self.cq.as_ptr()
    }

    /// Non-blocking poll of up to `wc.len()` completion entries.
    ///
    /// Statuses are reported, not judged; checking them is the caller's
    /// responsibility.
    pub(crate) fn poll(&self, wc: &mut [ibv_wc]) -> io::Result<usize> {
        let num = unsafe { ibv_poll_cq(self.cq.as_ptr(), wc.len() as i32, wc.as_mut_ptr()) };
        if num < 0 {
            Err(io::Error::other("ibv_poll_cq failed"))
        } else {
            Ok(num as usize)
        }
    }
}

impl Drop for Cq {
    fn drop(&mut self) {
        unsafe { ibv_destroy_cq(self.cq.as_ptr()) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_conversion() {
        assert_eq!(WcStatus::from(0), WcStatus::Success);
        assert_eq!(
            WcStatus::from(ibv_wc_status::IBV_WC_WR_FLUSH_ERR),
            WcStatus::WrFlushErr
        );
        assert_eq!(
            WcStatus::from(ibv_wc_status::IBV_WC_RETRY_EXC_ERR) as u32,
            ibv_wc_status::IBV_WC_RETRY_EXC_ERR
        );
        // The display text is owned by the driver; just check the status
        // code is carried along.
        assert!(format!("{}", WcStatus::RnrRetryExcErr)
            .contains(&format!("status {}", WcStatus::RnrRetryExcErr as u32)));
    }

    #[test]
    fn test_opcode_conversion() {
        assert_eq!(WcOpcode::from(ibv_wc_opcode::IBV_WC_SEND), WcOpcode::Send);
        assert_eq!(
            WcOpcode::from(ibv_wc_opcode::IBV_WC_RDMA_WRITE),
            WcOpcode::RdmaWrite
        );
        assert_eq!(WcOpcode::from(ibv_wc_opcode::IBV_WC_RECV), WcOpcode::Recv);
        assert_eq!(
            WcOpcode::from(ibv_wc_opcode::IBV_WC_RECV_RDMA_WITH_IMM),
            WcOpcode::RecvRdmaImm
        );
    }
}
