use std::ffi::c_void;
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use rdma_sys::*;
use serde::{Deserialize, Serialize};

use super::pd::Pd;
use super::types::{LKey, RKey};
use crate::error::{Error, Result};
use crate::utils::interop::last_os_error;

/// Release action invoked on the backing buffer after deregistration.
type ReleaseFn = Box<dyn FnOnce(*mut u8) + Send>;

struct MrInner {
    pd: Pd,
    mr: NonNull<ibv_mr>,

    addr: *mut u8,
    len: usize,

    /// `None` when the caller keeps ownership of the buffer.
    release: Option<ReleaseFn>,
}

unsafe impl Send for MrInner {}
unsafe impl Sync for MrInner {}

impl Drop for MrInner {
    fn drop(&mut self) {
        unsafe { ibv_dereg_mr(self.mr.as_ptr()) };
        if let Some(release) = self.release.take() {
            release(self.addr);
        }
    }
}

/// Local memory region.
///
/// A contiguous byte range registered with an RDMA device. Address, length
/// and the two keys never change after registration. The region either
/// borrows its backing storage (the caller guarantees it outlives the MR)
/// or owns it through a release action run on destruction.
///
/// This type is a simple wrapper of an `Arc` and can be cheaply cloned.
#[derive(Clone)]
pub struct Mr {
    inner: Arc<MrInner>,
}

impl fmt::Debug for Mr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mr")
            .field("addr", &self.inner.addr)
            .field("len", &self.inner.len)
            .finish()
    }
}

impl Mr {
    fn reg_inner(pd: Pd, addr: *mut u8, len: usize, release: Option<ReleaseFn>) -> Result<Self> {
        if len == 0 {
            return Err(Error::InvalidArgument(
                "zero-length memory regions are disallowed".to_owned(),
            ));
        }

        let mr = NonNull::new(unsafe {
            ibv_reg_mr(
                pd.as_ptr(),
                addr as *mut c_void,
                len,
                (ibv_access_flags::IBV_ACCESS_LOCAL_WRITE
                    | ibv_access_flags::IBV_ACCESS_REMOTE_WRITE
                    | ibv_access_flags::IBV_ACCESS_REMOTE_READ)
                    .0 as i32,
            )
        })
        .ok_or_else(|| Error::MrRegFailed(last_os_error()))?;

        Ok(Self {
            inner: Arc::new(MrInner {
                pd,
                mr,
                addr,
                len,
                release,
            }),
        })
    }

    /// Register a memory region over a caller-owned buffer.
    ///
    /// The caller must guarantee that the buffer outlives the returned MR
    /// and every clone of it.
    pub fn reg(pd: Pd, addr: *mut u8, len: usize) -> Result<Self> {
        Self::reg_inner(pd, addr, len, None)
    }

    /// Register a memory region that owns its backing buffer.
    ///
    /// `release` is invoked exactly once with the buffer address after the
    /// region has been deregistered. This is how device (e.g. GPU) buffers
    /// with custom deallocators are wrapped.
    pub fn reg_owned(
        pd: Pd,
        addr: *mut u8,
        len: usize,
        release: impl FnOnce(*mut u8) + Send + 'static,
    ) -> Result<Self> {
        Self::reg_inner(pd, addr, len, Some(Box::new(release)))
    }

    /// Allocate a zeroed heap buffer of `len` bytes and register it.
    /// The buffer is owned by the region and freed on destruction.
    pub fn alloc(pd: Pd, len: usize) -> Result<Self> {
        if len == 0 {
            return Err(Error::InvalidArgument(
                "zero-length memory regions are disallowed".to_owned(),
            ));
        }

        let buf = vec![0u8; len].into_boxed_slice();
        let addr = Box::into_raw(buf) as *mut u8;
        Self::reg_inner(pd, addr, len, Some(Box::new(move |p| unsafe {
            drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(p, len)));
        })))
    }

    /// Get the underlying `ibv_mr` pointer.
    #[inline]
    pub fn as_ptr(&self) -> *mut ibv_mr {
        self.inner.mr.as_ptr()
    }

    /// Get the protection domain of this region.
    #[inline]
    pub fn pd(&self) -> Pd {
        self.inner.pd.clone()
    }

    /// Get the start address of the registered range.
    #[inline]
    pub fn addr(&self) -> *mut u8 {
        self.inner.addr
    }

    /// Get the length of the registered range.
    #[inline]
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.inner.len
    }

    /// Get the local key of this region.
    #[inline]
    pub fn lkey(&self) -> LKey {
        unsafe { (*self.inner.mr.as_ptr()).lkey }
    }

    /// Get the remote key of this region.
    #[inline]
    pub fn rkey(&self) -> RKey {
        unsafe { (*self.inner.mr.as_ptr()).rkey }
    }
}

/// Remote memory region descriptor.
///
/// Contains the information a peer needs to address this region in RDMA
/// one-sided operations; holds no local resources.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RemoteMr {
    pub addr: u64,
    pub len: u64,
    pub rkey: RKey,
}

impl RemoteMr {
    pub fn new(addr: u64, len: u64, rkey: RKey) -> Self {
        Self { addr, len, rkey }
    }
}

impl From<&Mr> for RemoteMr {
    fn from(mr: &Mr) -> Self {
        Self {
            addr: mr.addr() as u64,
            len: mr.len() as u64,
            rkey: mr.rkey(),
        }
    }
}
