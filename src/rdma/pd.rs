use std::ptr::NonNull;
use std::sync::Arc;

use rdma_sys::*;

use super::context::Context;
use crate::error::{Error, Result};
use crate::utils::interop::last_os_error;

struct PdInner {
    ctx: Context,
    pd: NonNull<ibv_pd>,
}

unsafe impl Send for PdInner {}
unsafe impl Sync for PdInner {}

impl Drop for PdInner {
    fn drop(&mut self) {
        unsafe { ibv_dealloc_pd(self.pd.as_ptr()) };
    }
}

/// Protection domain.
///
/// This type is a simple wrapper of an `Arc` and can be cheaply cloned.
/// The domain is deallocated when the last clone and every MR and QP
/// derived from it are dropped.
#[derive(Clone)]
pub struct Pd {
    inner: Arc<PdInner>,
}

impl Pd {
    /// Allocate a protection domain for the given RDMA device context.
    pub fn new(ctx: Context) -> Result<Self> {
        let pd = NonNull::new(unsafe { ibv_alloc_pd(ctx.as_ptr()) })
            .ok_or_else(|| Error::PdAllocFailed(last_os_error()))?;

        Ok(Self {
            inner: Arc::new(PdInner { ctx, pd }),
        })
    }

    /// Get the underlying `ibv_pd` pointer.
    #[inline]
    pub fn as_ptr(&self) -> *mut ibv_pd {
        self.inner.pd.as_ptr()
    }

    /// Get the underlying [`Context`].
    #[inline]
    pub fn context(&self) -> Context {
        self.inner.ctx.clone()
    }
}
