//! Resend log for stateful reconnect
//!
//! Outbound: every sequenced message written while reconnect is enabled is
//! kept with its sequence number until the client acknowledges it. The log is
//! bounded in bytes; once full, writers wait for an ack (or cancellation).
//! After the transport reconnects the unacknowledged tail is replayed.
//!
//! Inbound: the client numbers its messages the same way. After a reconnect
//! it announces where it restarts with a `Sequence` message, and messages the
//! server already processed are skipped.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct BufferEntry {
    pub sequence_id: u64,
    pub bytes: Arc<[u8]>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BufferError {
    /// The write was canceled while waiting for space
    Canceled,
    /// The client restarted past messages the server never saw
    SequenceGap { expected: u64, received: u64 },
}

impl std::fmt::Display for BufferError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BufferError::Canceled => write!(f, "Buffered write was canceled."),
            BufferError::SequenceGap { expected, received } => write!(
                f,
                "Sequence ID {} is greater than the next expected ID {}.",
                received, expected
            ),
        }
    }
}

impl std::error::Error for BufferError {}

struct BufferState {
    entries: VecDeque<BufferEntry>,
    buffered_bytes: usize,
    /// Room held by writers that have not committed yet
    reserved_bytes: usize,
    next_sequence: u64,
    /// Sequence of the inbound message being processed
    current_received: u64,
    /// Highest inbound sequence processed so far
    latest_received: u64,
    ack_pending: bool,
}

pub struct MessageBuffer {
    capacity: usize,
    state: Mutex<BufferState>,
    space: Notify,
}

impl MessageBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(BufferState {
                entries: VecDeque::new(),
                buffered_bytes: 0,
                reserved_bytes: 0,
                next_sequence: 1,
                current_received: 0,
                latest_received: 0,
                ack_pending: false,
            }),
            space: Notify::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait until the log has room for `len` more bytes and hold that room.
    ///
    /// Sequence numbers are assigned by [`BufferReservation::commit`], so a
    /// writer reserves first and commits once it owns the transport. A single
    /// message larger than the whole capacity is accepted once the log and
    /// every other reservation are empty.
    pub async fn reserve(
        &self,
        len: usize,
        cancel: &CancellationToken,
    ) -> Result<BufferReservation<'_>, BufferError> {
        loop {
            let notified = self.space.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state();
                let used = state.buffered_bytes + state.reserved_bytes;
                if used == 0 || used + len <= self.capacity {
                    state.reserved_bytes += len;
                    return Ok(BufferReservation {
                        buffer: self,
                        len,
                        committed: false,
                    });
                }
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = cancel.cancelled() => return Err(BufferError::Canceled),
            }
        }
    }

    fn release(&self, len: usize) {
        self.state().reserved_bytes -= len;
        self.space.notify_waiters();
    }

    /// Drop every entry up to and including `sequence_id`.
    pub fn ack(&self, sequence_id: u64) {
        let mut state = self.state();
        let mut freed = false;
        while state
            .entries
            .front()
            .is_some_and(|entry| entry.sequence_id <= sequence_id)
        {
            if let Some(entry) = state.entries.pop_front() {
                state.buffered_bytes -= entry.bytes.len();
                freed = true;
            }
        }
        drop(state);
        if freed {
            self.space.notify_waiters();
        }
    }

    /// Account for one inbound sequenced message. Returns false for a
    /// duplicate the client replayed after reconnecting.
    pub fn should_process(&self) -> bool {
        let mut state = self.state();
        state.current_received += 1;
        if state.current_received <= state.latest_received {
            return false;
        }
        state.latest_received = state.current_received;
        state.ack_pending = true;
        true
    }

    /// The client's next message carries `sequence_id`.
    pub fn reset_sequence(&self, sequence_id: u64) -> Result<(), BufferError> {
        let mut state = self.state();
        let expected = state.latest_received + 1;
        if sequence_id > expected {
            return Err(BufferError::SequenceGap {
                expected,
                received: sequence_id,
            });
        }
        state.current_received = sequence_id.saturating_sub(1);
        Ok(())
    }

    /// Sequence number to acknowledge, if anything arrived since the last ack.
    pub fn take_pending_ack(&self) -> Option<u64> {
        let mut state = self.state();
        if !state.ack_pending {
            return None;
        }
        state.ack_pending = false;
        Some(state.latest_received)
    }

    /// An ack taken with [`take_pending_ack`](Self::take_pending_ack) could not be sent.
    pub fn restore_pending_ack(&self) {
        self.state().ack_pending = true;
    }

    /// First unacknowledged sequence number and every unacknowledged message.
    pub fn replay(&self) -> (u64, Vec<Arc<[u8]>>) {
        let state = self.state();
        let first = state
            .entries
            .front()
            .map(|entry| entry.sequence_id)
            .unwrap_or(state.next_sequence);
        let entries = state.entries.iter().map(|entry| entry.bytes.clone()).collect();
        (first, entries)
    }

    pub fn buffered_bytes(&self) -> usize {
        self.state().buffered_bytes
    }

    pub fn len(&self) -> usize {
        self.state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state().entries.is_empty()
    }
}

/// Room held in a [`MessageBuffer`]; released on drop unless committed.
pub struct BufferReservation<'a> {
    buffer: &'a MessageBuffer,
    len: usize,
    committed: bool,
}

impl BufferReservation<'_> {
    /// Record `bytes` under the next sequence number.
    pub fn commit(mut self, bytes: Arc<[u8]>) -> u64 {
        let mut state = self.buffer.state();
        state.reserved_bytes -= self.len;
        let sequence_id = state.next_sequence;
        state.next_sequence += 1;
        state.buffered_bytes += bytes.len();
        state.entries.push_back(BufferEntry { sequence_id, bytes });
        self.committed = true;
        sequence_id
    }
}

impl Drop for BufferReservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.buffer.release(self.len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn bytes(s: &str) -> Arc<[u8]> {
        Arc::from(s.as_bytes())
    }

    async fn push(
        buffer: &MessageBuffer,
        bytes: Arc<[u8]>,
        token: &CancellationToken,
    ) -> Result<u64, BufferError> {
        let reservation = buffer.reserve(bytes.len(), token).await?;
        Ok(reservation.commit(bytes))
    }

    #[tokio::test]
    async fn test_ack_trims_and_replay_returns_tail() {
        let buffer = MessageBuffer::new(1024);
        let token = CancellationToken::new();
        assert_eq!(push(&buffer, bytes("a"), &token).await, Ok(1));
        assert_eq!(push(&buffer, bytes("bb"), &token).await, Ok(2));
        assert_eq!(push(&buffer, bytes("ccc"), &token).await, Ok(3));

        buffer.ack(2);
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.buffered_bytes(), 3);

        let (first, entries) = buffer.replay();
        assert_eq!(first, 3);
        assert_eq!(entries, vec![bytes("ccc")]);

        buffer.ack(3);
        assert!(buffer.is_empty());
        assert_eq!(buffer.replay().0, 4);
    }

    #[tokio::test]
    async fn test_full_buffer_waits_for_ack() {
        let buffer = Arc::new(MessageBuffer::new(4));
        let token = CancellationToken::new();
        push(&buffer, bytes("1234"), &token).await.unwrap();

        let pending = {
            let buffer = buffer.clone();
            let token = token.clone();
            tokio::spawn(async move { push(&buffer, bytes("5"), &token).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pending.is_finished());

        buffer.ack(1);
        assert_eq!(pending.await.unwrap(), Ok(2));
    }

    #[tokio::test]
    async fn test_oversized_message_accepted_when_empty() {
        let buffer = MessageBuffer::new(2);
        let token = CancellationToken::new();
        assert!(push(&buffer, bytes("too large"), &token).await.is_ok());
    }

    #[tokio::test]
    async fn test_blocked_push_canceled() {
        let buffer = MessageBuffer::new(1);
        let token = CancellationToken::new();
        push(&buffer, bytes("x"), &token).await.unwrap();

        token.cancel();
        assert_eq!(push(&buffer, bytes("y"), &token).await, Err(BufferError::Canceled));
    }

    #[tokio::test]
    async fn test_dropped_reservation_frees_room() {
        let buffer = MessageBuffer::new(4);
        let token = CancellationToken::new();
        let held = buffer.reserve(4, &token).await.unwrap();

        token.cancel();
        assert!(buffer.reserve(1, &token).await.is_err());
        drop(held);

        let token = CancellationToken::new();
        assert_eq!(push(&buffer, bytes("abcd"), &token).await, Ok(1));
        assert_eq!(buffer.buffered_bytes(), 4);
    }

    #[tokio::test]
    async fn test_sequence_follows_commit_order() {
        let buffer = MessageBuffer::new(64);
        let token = CancellationToken::new();
        let first = buffer.reserve(1, &token).await.unwrap();
        let second = buffer.reserve(1, &token).await.unwrap();

        assert_eq!(second.commit(bytes("b")), 1);
        assert_eq!(first.commit(bytes("a")), 2);
        assert_eq!(buffer.replay().1, vec![bytes("b"), bytes("a")]);
    }

    #[test]
    fn test_inbound_duplicates_skipped_after_reset() {
        let buffer = MessageBuffer::new(16);
        assert!(buffer.should_process());
        assert!(buffer.should_process());
        assert!(buffer.should_process());
        assert_eq!(buffer.take_pending_ack(), Some(3));
        assert_eq!(buffer.take_pending_ack(), None);

        // Client restarts from 2: messages 2 and 3 were already processed.
        buffer.reset_sequence(2).unwrap();
        assert!(!buffer.should_process());
        assert!(!buffer.should_process());
        assert!(buffer.should_process());
        assert_eq!(buffer.take_pending_ack(), Some(4));
    }

    #[test]
    fn test_sequence_gap_rejected() {
        let buffer = MessageBuffer::new(16);
        buffer.should_process();
        assert_eq!(
            buffer.reset_sequence(5),
            Err(BufferError::SequenceGap {
                expected: 2,
                received: 5
            })
        );
        assert!(buffer.reset_sequence(2).is_ok());
    }
}
