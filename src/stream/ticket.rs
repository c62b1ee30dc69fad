use crate::rdma::types::StreamId;

use super::handle::Handle;

/// Size of one ticket on the control channel.
pub(crate) const TICKET_BYTES: usize = 20;

/// A pending local submission, or a peer's advertised recv slot.
/// Immutable once enqueued.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct Ticket {
    pub stream_id: StreamId,
    pub length: u32,
    pub addr: u64,
    /// lkey for a local send, rkey for an advertised recv slot.
    pub key: u32,
}

impl Ticket {
    /// Encode into the fixed 20-byte little-endian control-channel frame:
    /// `stream_id | length | addr | key`.
    pub fn to_bytes(self) -> [u8; TICKET_BYTES] {
        let mut buf = [0u8; TICKET_BYTES];
        buf[0..4].copy_from_slice(&self.stream_id.to_le_bytes());
        buf[4..8].copy_from_slice(&self.length.to_le_bytes());
        buf[8..16].copy_from_slice(&self.addr.to_le_bytes());
        buf[16..20].copy_from_slice(&self.key.to_le_bytes());
        buf
    }

    /// Decode from a 20-byte control-channel frame.
    pub fn from_bytes(buf: &[u8; TICKET_BYTES]) -> Self {
        Self {
            stream_id: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            length: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            addr: u64::from_le_bytes([
                buf[8], buf[9], buf[10], buf[11], buf[12], buf[13], buf[14], buf[15],
            ]),
            key: u32::from_le_bytes([buf[16], buf[17], buf[18], buf[19]]),
        }
    }
}

/// A ticket paired with the completion handle signalled when it resolves.
pub(crate) type Command = (Ticket, Handle);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_layout() {
        let ticket = Ticket {
            stream_id: 7,
            length: 0x1000,
            addr: 0x0102_0304_0506_0708,
            key: 0xaabb_ccdd,
        };
        let bytes = ticket.to_bytes();
        assert_eq!(&bytes[0..4], &[7, 0, 0, 0]);
        assert_eq!(&bytes[4..8], &[0, 0x10, 0, 0]);
        assert_eq!(&bytes[8..16], &[8, 7, 6, 5, 4, 3, 2, 1]);
        assert_eq!(&bytes[16..20], &[0xdd, 0xcc, 0xbb, 0xaa]);
    }

    #[test]
    fn test_roundtrip() {
        let ticket = Ticket {
            stream_id: u32::MAX,
            length: 16 * 1024 * 1024,
            addr: u64::MAX - 1,
            key: 42,
        };
        assert_eq!(Ticket::from_bytes(&ticket.to_bytes()), ticket);
    }
}
