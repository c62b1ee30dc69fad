use std::collections::{BTreeMap, VecDeque};

use crate::rdma::types::StreamId;

use super::ticket::{Command, Ticket};

/// Per-stream FIFO queues keyed by stream identifier.
///
/// FIFO order within a stream is preserved end-to-end; distinct streams
/// are fully independent. Thread-confined to one I/O engine.
pub(crate) struct StreamFifos<T> {
    fifos: BTreeMap<StreamId, VecDeque<T>>,
}

impl<T> StreamFifos<T> {
    pub fn new() -> Self {
        Self {
            fifos: BTreeMap::new(),
        }
    }

    /// Append at the tail of the stream's FIFO.
    pub fn push(&mut self, stream_id: StreamId, item: T) {
        self.fifos.entry(stream_id).or_default().push_back(item);
    }

    /// Pop the head of the stream's FIFO. Empty streams are pruned so that
    /// key iteration only visits streams with pending items.
    pub fn pop_front(&mut self, stream_id: StreamId) -> Option<T> {
        let queue = self.fifos.get_mut(&stream_id)?;
        let item = queue.pop_front();
        if queue.is_empty() {
            self.fifos.remove(&stream_id);
        }
        item
    }

    pub fn contains(&self, stream_id: StreamId) -> bool {
        self.fifos.contains_key(&stream_id)
    }

    /// Remove and return every queued item, across all streams.
    pub fn drain_all(&mut self) -> Vec<T> {
        let mut out = Vec::new();
        for (_, mut queue) in std::mem::take(&mut self.fifos) {
            out.extend(queue.drain(..));
        }
        out
    }
}

/// Correlates local send submissions with the peer's advertised recv
/// tickets, per stream.
///
/// Heads of the two FIFOs for the same stream pair 1:1 and in submission
/// order. Owned by the send engine; no locking.
pub(crate) struct StreamMatcher {
    local: StreamFifos<Command>,
    remote: StreamFifos<Ticket>,
}

impl StreamMatcher {
    pub fn new() -> Self {
        Self {
            local: StreamFifos::new(),
            remote: StreamFifos::new(),
        }
    }

    /// Record a local send submission.
    pub fn push_local(&mut self, cmd: Command) {
        self.local.push(cmd.0.stream_id, cmd);
    }

    /// Record a recv ticket advertised by the peer.
    pub fn push_remote(&mut self, ticket: Ticket) {
        self.remote.push(ticket.stream_id, ticket);
    }

    /// Pop one `(local send, remote recv)` pair whose stream has both heads
    /// present, if any.
    pub fn pop_match(&mut self) -> Option<(Command, Ticket)> {
        let Self { local, remote } = self;
        let stream_id = local
            .fifos
            .keys()
            .copied()
            .find(|id| remote.contains(*id))?;
        let cmd = local.pop_front(stream_id)?;
        let ticket = remote.pop_front(stream_id)?;
        Some((cmd, ticket))
    }

    /// Remove every still-unmatched local send command.
    pub fn drain_local(&mut self) -> Vec<Command> {
        self.remote = StreamFifos::new();
        self.local.drain_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::handle::Handle;

    fn ticket(stream_id: StreamId, length: u32) -> Ticket {
        Ticket {
            stream_id,
            length,
            addr: 0x1000,
            key: 1,
        }
    }

    fn command(stream_id: StreamId, length: u32) -> Command {
        (ticket(stream_id, length), Handle::pending())
    }

    #[test]
    fn test_no_match_until_both_sides_present() {
        let mut matcher = StreamMatcher::new();
        matcher.push_local(command(3, 64));
        assert!(matcher.pop_match().is_none());

        matcher.push_remote(ticket(4, 64));
        assert!(matcher.pop_match().is_none());

        matcher.push_remote(ticket(3, 64));
        let (cmd, remote) = matcher.pop_match().unwrap();
        assert_eq!(cmd.0.stream_id, 3);
        assert_eq!(remote.stream_id, 3);
        assert!(matcher.pop_match().is_none());
    }

    #[test]
    fn test_fifo_order_within_stream() {
        let mut matcher = StreamMatcher::new();
        for length in [1, 2, 3] {
            matcher.push_local(command(0, length));
            matcher.push_remote(ticket(0, length));
        }
        for expected in [1, 2, 3] {
            let (cmd, remote) = matcher.pop_match().unwrap();
            assert_eq!(cmd.0.length, expected);
            assert_eq!(remote.length, expected);
        }
    }

    #[test]
    fn test_streams_are_independent() {
        let mut matcher = StreamMatcher::new();
        matcher.push_local(command(0, 10));
        matcher.push_local(command(1, 20));
        // Only stream 1 has a remote ticket; stream 0 must not match.
        matcher.push_remote(ticket(1, 20));

        let (cmd, _) = matcher.pop_match().unwrap();
        assert_eq!(cmd.0.stream_id, 1);
        assert!(matcher.pop_match().is_none());
        // Stream 0 is still waiting for a remote ticket.
        matcher.push_remote(ticket(0, 10));
        let (cmd, _) = matcher.pop_match().unwrap();
        assert_eq!(cmd.0.stream_id, 0);
    }

    #[test]
    fn test_drain_returns_unmatched_commands() {
        let mut matcher = StreamMatcher::new();
        matcher.push_local(command(0, 10));
        matcher.push_local(command(7, 20));
        matcher.push_remote(ticket(9, 30));

        let drained = matcher.drain_local();
        assert_eq!(drained.len(), 2);
        assert!(matcher.pop_match().is_none());
    }
}
