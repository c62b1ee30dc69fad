use std::fmt;
use std::net::Ipv6Addr;

use rdma_sys::ibv_gid;
use serde::{Deserialize, Serialize};

/// A 128-bit port identifier, stored as its 16 raw bytes.
///
/// Kept as plain bytes so it drops straight into the fixed handshake
/// record; conversion to the driver's `ibv_gid` union happens only at the
/// FFI boundary.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gid([u8; 16]);

impl Gid {
    /// The raw 16 bytes, as they appear in the handshake record.
    #[inline]
    pub fn as_bytes(&self) -> [u8; 16] {
        self.0
    }
}

impl fmt::Debug for Gid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // GIDs are 128-bit like IPv6 addresses and read best in that
        // notation (RoCE GIDs literally embed one).
        write!(f, "Gid({})", Ipv6Addr::from(self.0))
    }
}

impl From<[u8; 16]> for Gid {
    #[inline]
    fn from(raw: [u8; 16]) -> Self {
        Self(raw)
    }
}

impl From<ibv_gid> for Gid {
    #[inline]
    fn from(gid: ibv_gid) -> Self {
        Self(unsafe { gid.raw })
    }
}

impl From<Gid> for ibv_gid {
    #[inline]
    fn from(gid: Gid) -> Self {
        ibv_gid { raw: gid.0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RAW: [u8; 16] = [
        0xfe, 0x80, 0, 0, 0, 0, 0, 0, 0x12, 0x34, 0x56, 0x78, 0x9a, 0xbc, 0xde, 0xf0,
    ];

    #[test]
    fn test_byte_roundtrip() {
        let gid = Gid::from(RAW);
        assert_eq!(gid.as_bytes(), RAW);
        assert_eq!(Gid::from(gid.as_bytes()), gid);
    }

    #[test]
    fn test_ffi_roundtrip() {
        let gid = Gid::from(RAW);
        let ffi = ibv_gid::from(gid);
        assert_eq!(Gid::from(ffi), gid);
    }

    #[test]
    fn test_debug_reads_as_ipv6() {
        let repr = format!("{:?}", Gid::from(RAW));
        assert!(repr.starts_with("Gid(fe80:"), "unexpected repr: {repr}");
    }
}
