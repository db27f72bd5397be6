//! Connection lifetime state and heartbeat bookkeeping
//!
//! [`ConnectionLifetime`] does no I/O and owns no timer. The connection
//! handler feeds it send/receive events and calls [`ConnectionLifetime::tick`]
//! from a periodic heartbeat; the returned [`HeartbeatAction`] says whether a
//! keep-alive ping is due or the client has timed out.

use std::time::Duration;
use tokio::time::Instant;

/// Lifecycle of one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Waiting for the handshake
    Negotiating,
    /// Handshake done, messages flowing
    Active,
    /// Close decided; in-flight work is unwinding
    Draining,
    Closed,
}

/// What the heartbeat should do right now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    Idle,
    /// Nothing was written within the keep-alive interval
    SendPing,
    /// Nothing was received within the client timeout interval
    TimedOut,
}

#[derive(Debug)]
pub struct ConnectionLifetime {
    state: ConnectionState,
    keep_alive_interval: Duration,
    client_timeout_interval: Duration,
    last_sent: Instant,
    /// `None` until the first post-handshake message arrives
    last_received: Option<Instant>,
}

impl ConnectionLifetime {
    pub fn new(keep_alive_interval: Duration, client_timeout_interval: Duration, now: Instant) -> Self {
        Self {
            state: ConnectionState::Negotiating,
            keep_alive_interval,
            client_timeout_interval,
            last_sent: now,
            last_received: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Handshake succeeded.
    pub fn activate(&mut self, now: Instant) {
        if self.state == ConnectionState::Negotiating {
            self.state = ConnectionState::Active;
            self.last_sent = now;
        }
    }

    pub fn begin_draining(&mut self) {
        if matches!(self.state, ConnectionState::Negotiating | ConnectionState::Active) {
            self.state = ConnectionState::Draining;
        }
    }

    pub fn close(&mut self) {
        self.state = ConnectionState::Closed;
    }

    /// A message physically arrived from the client.
    pub fn on_message_received(&mut self, now: Instant) {
        self.last_received = Some(now);
    }

    /// A frame was written to the client.
    pub fn on_message_sent(&mut self, now: Instant) {
        self.last_sent = now;
    }

    /// Evaluate both timers at `now`.
    ///
    /// Running hub methods do not count as client activity; only receipts
    /// reset the timeout clock. A client that never sent anything after the
    /// handshake is never timed out here.
    pub fn tick(&self, now: Instant) -> HeartbeatAction {
        if self.state != ConnectionState::Active {
            return HeartbeatAction::Idle;
        }
        if let Some(last_received) = self.last_received {
            if now.saturating_duration_since(last_received) >= self.client_timeout_interval {
                return HeartbeatAction::TimedOut;
            }
        }
        if now.saturating_duration_since(self.last_sent) >= self.keep_alive_interval {
            return HeartbeatAction::SendPing;
        }
        HeartbeatAction::Idle
    }
}
