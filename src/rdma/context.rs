use std::ffi::CStr;
use std::fmt;
use std::mem;
use std::ptr::NonNull;
use std::sync::Arc;

use rdma_sys::*;

use super::gid::Gid;
use super::types::{Lid, PortNum};
use crate::error::{Error, Result};
use crate::utils::interop::last_os_error;

/// Ownership holder of the device context.
struct ContextInner {
    ctx: NonNull<ibv_context>,

    port_num: PortNum,
    gid_index: u8,

    /// Port attributes at open time; LID and path MTU never change while
    /// the port stays active.
    lid: Lid,
    active_mtu: u32,
    gid: Gid,
}

unsafe impl Send for ContextInner {}
unsafe impl Sync for ContextInner {}

impl Drop for ContextInner {
    fn drop(&mut self) {
        unsafe { ibv_close_device(self.ctx.as_ptr()) };
    }
}

/// Device context.
///
/// This type is a reference to the underlying `ibv_context` and can be
/// cheaply cloned. The device is closed when the last clone (and every
/// resource derived from it) is dropped.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("lid", &self.inner.lid)
            .field("gid", &self.inner.gid)
            .finish()
    }
}

impl Context {
    /// Open an RDMA device and bind to the given port and GID index.
    ///
    /// If `dev_name` is `None`, the first device found is used. GID index 0
    /// is appropriate on an InfiniBand fabric; RoCE setups usually need a
    /// different index.
    pub fn open(dev_name: Option<&str>, port_num: PortNum, gid_index: u8) -> Result<Self> {
        let mut num_devices = 0i32;
        let list = unsafe { ibv_get_device_list(&mut num_devices) };
        if list.is_null() {
            return Err(Error::DeviceOpenFailed(last_os_error()));
        }

        let mut found = None;
        for i in 0..num_devices as usize {
            let dev = unsafe { *list.add(i) };
            if dev.is_null() {
                break;
            }
            match dev_name {
                Some(wanted) => {
                    let name = unsafe { CStr::from_ptr(ibv_get_device_name(dev)) };
                    if name.to_string_lossy() == wanted {
                        found = Some(dev);
                        break;
                    }
                }
                None => {
                    found = Some(dev);
                    break;
                }
            }
        }

        let Some(dev) = found else {
            unsafe { ibv_free_device_list(list) };
            return Err(Error::DeviceNotFound(
                dev_name.unwrap_or("<any>").to_owned(),
            ));
        };

        let ctx = unsafe { ibv_open_device(dev) };
        unsafe { ibv_free_device_list(list) };
        let ctx = NonNull::new(ctx).ok_or_else(|| Error::DeviceOpenFailed(last_os_error()))?;

        let mut port_attr = unsafe { mem::zeroed::<ibv_port_attr>() };
        let ret = unsafe { ___ibv_query_port(ctx.as_ptr(), port_num, &mut port_attr) };
        if ret != 0 {
            unsafe { ibv_close_device(ctx.as_ptr()) };
            return Err(Error::QueryFailed(
                "port",
                std::io::Error::from_raw_os_error(ret),
            ));
        }

        let mut gid = unsafe { mem::zeroed::<ibv_gid>() };
        let ret = unsafe { ibv_query_gid(ctx.as_ptr(), port_num, gid_index as i32, &mut gid) };
        if ret != 0 {
            unsafe { ibv_close_device(ctx.as_ptr()) };
            return Err(Error::QueryFailed(
                "gid",
                std::io::Error::from_raw_os_error(ret),
            ));
        }

        Ok(Self {
            inner: Arc::new(ContextInner {
                ctx,
                port_num,
                gid_index,
                lid: port_attr.lid,
                active_mtu: port_attr.active_mtu,
                gid: Gid::from(gid),
            }),
        })
    }

    /// Get the underlying `ibv_context` pointer.
    #[inline]
    pub fn as_ptr(&self) -> *mut ibv_context {
        self.inner.ctx.as_ptr()
    }

    /// Get the bound port number.
    #[inline]
    pub fn port_num(&self) -> PortNum {
        self.inner.port_num
    }

    /// Get the bound GID index.
    #[inline]
    pub fn gid_index(&self) -> u8 {
        self.inner.gid_index
    }

    /// Get the LID of the bound port.
    #[inline]
    pub fn lid(&self) -> Lid {
        self.inner.lid
    }

    /// Get the active path MTU of the bound port, as the raw `ibv_mtu` value.
    #[inline]
    pub(crate) fn mtu_raw(&self) -> u32 {
        self.inner.active_mtu
    }

    /// Get the GID of the bound port at the bound GID index.
    #[inline]
    pub fn gid(&self) -> Gid {
        self.inner.gid
    }
}
