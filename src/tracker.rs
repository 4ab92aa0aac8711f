//! Correlates queued packets with the node's transmit log lines.
//!
//! The firmware reports a transmission as three lines:
//!
//! ```text
//! Started Tx (id=0x1a2b fr=... to=...)
//! Packet TX: 120ms
//! Completed sending ...
//! ```
//!
//! Only one transmission is attributed at a time. A new `Started Tx` line
//! replaces whatever was being tracked before it, even when its id is
//! unreadable.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

pub const POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const CONFIRM_TIMEOUT: Duration = Duration::from_secs(45);

const STARTED_MARKER: &str = "Started Tx (id=";
const DURATION_MARKER: &str = "Packet TX";
const COMPLETED_MARKER: &str = "Completed sending";

/// Parser slot for the transmission currently on air.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Idle,
    Started { id: u32 },
    Timed { id: u32, duration_ms: u32 },
}

pub struct TxTracker {
    state: Mutex<TxState>,
    /// id -> (on-air ms, when confirmed)
    confirmed: Mutex<HashMap<u32, (u32, Instant)>>,
    poll_interval: Duration,
    timeout: Duration,
}

impl Default for TxTracker {
    fn default() -> Self {
        Self::new(POLL_INTERVAL, CONFIRM_TIMEOUT)
    }
}

impl TxTracker {
    pub fn new(poll_interval: Duration, timeout: Duration) -> Self {
        Self {
            state: Mutex::new(TxState::Idle),
            confirmed: Mutex::new(HashMap::new()),
            poll_interval,
            timeout,
        }
    }

    pub fn state(&self) -> TxState {
        *self.state.lock()
    }

    /// Confirmations not yet collected by a waiter.
    pub fn pending(&self) -> usize {
        self.confirmed.lock().len()
    }

    /// Feed one status line. Lines that don't advance the state are ignored.
    pub fn on_status(&self, line: &str) {
        let mut state = self.state.lock();

        if line.contains(STARTED_MARKER) {
            match parse_started_id(line) {
                Some(id) => {
                    log::debug!("Tx started: id={:#x}", id);
                    *state = TxState::Started { id };
                }
                None => {
                    log::debug!("Unparseable Tx start: {}", line);
                    *state = TxState::Idle;
                }
            }
            return;
        }

        let current = *state;
        match current {
            TxState::Idle => {}
            TxState::Started { id } | TxState::Timed { id, .. }
                if line.contains(DURATION_MARKER) =>
            {
                if let Some(duration_ms) = parse_duration_ms(line) {
                    log::debug!("Tx {:#x} on air for {} ms", id, duration_ms);
                    *state = TxState::Timed { id, duration_ms };
                }
            }
            TxState::Timed { id, duration_ms } if line.contains(COMPLETED_MARKER) => {
                log::debug!("Tx {} ({:#x}) completed in {} ms", id, id, duration_ms);
                let now = Instant::now();
                let mut confirmed = self.confirmed.lock();
                // Nobody waits longer than the timeout, so older entries are
                // broadcasts or late arrivals that will never be collected.
                confirmed.retain(|_, (_, at)| now.duration_since(*at) < self.timeout);
                confirmed.insert(id, (duration_ms, now));
                *state = TxState::Idle;
            }
            _ => {}
        }
    }

    /// Wait until `packet_id` is confirmed and return its on-air duration in
    /// milliseconds, or `None` once the timeout has passed.
    pub async fn wait_for_tx(&self, packet_id: u32) -> Option<u32> {
        log::debug!("Waiting for tx {}", packet_id);
        let started = Instant::now();
        loop {
            // The guard is a temporary; the map is never locked across the sleep.
            let confirmed = self.confirmed.lock().remove(&packet_id);
            if let Some((duration_ms, _)) = confirmed {
                log::info!("{} sent in {} ms", packet_id, duration_ms);
                return Some(duration_ms);
            }
            if started.elapsed() >= self.timeout {
                log::warn!("{} timed out", packet_id);
                return None;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

/// `Started Tx (id=0x1a2b fr=...` -> 0x1a2b. The `0x` prefix is optional.
fn parse_started_id(line: &str) -> Option<u32> {
    let (_, rest) = line.split_once(STARTED_MARKER)?;
    let token = rest
        .split(|c: char| c.is_whitespace() || c == ')')
        .next()?;
    let hex = token
        .strip_prefix("0x")
        .or_else(|| token.strip_prefix("0X"))
        .unwrap_or(token);
    u32::from_str_radix(hex, 16).ok()
}

/// `Packet TX: 120ms` -> 120.
fn parse_duration_ms(line: &str) -> Option<u32> {
    let value = line.rsplit(':').next()?.trim();
    value.trim_end_matches("ms").trim().parse().ok()
}
