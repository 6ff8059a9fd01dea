use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use ahash::RandomState;
use rand::Rng;
use tokio::time::Instant;

use crate::msg::Address;
use crate::store::EidPrefix;
use crate::timers::TimerId;

/// Retransmit timeouts double on every fire, capped here.
pub const MAX_RETRANSMIT_TIMEOUT: Duration = Duration::from_secs(32);

/// What an outstanding nonce was issued for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    MapRequest,
    Smr,
    RlocProbe,
    InfoRequest,
}

/// Enough context to rebuild the message on retransmit and to route the
/// reply or timeout back into the right state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestContext {
    MapRequest { eid: EidPrefix, resolver: SocketAddr, smr_invoked: bool },
    Smr { eid: EidPrefix, dst: SocketAddr },
    RlocProbe { eid: EidPrefix, rloc: Address },
    InfoRequest { ms: SocketAddr },
}

#[derive(Debug)]
pub struct NonceEntry {
    pub value: u64,
    pub purpose: RequestKind,
    pub context: RequestContext,
    pub issued_at: Instant,
    pub retries_left: u8,
    pub timeout: Duration,
    pub timer: Option<TimerId>,
}

/// What to do when an outstanding nonce's retransmit timer fires.
#[derive(Debug)]
pub enum TimerVerdict {
    /// Send the message again and re-arm with the (doubled) timeout.
    Retransmit { timeout: Duration, context: RequestContext },
    /// Out of retries: the entry is gone, deliver the timeout event.
    Expired { context: RequestContext },
}

/// Issues 64-bit nonces and tracks the outstanding ones. A reply consumes
/// its nonce exactly once; anything arriving with an unknown nonce is the
/// caller's cue to drop the message.
#[derive(Default)]
pub struct NonceRegistry {
    outstanding: HashMap<u64, NonceEntry, RandomState>,
}

impl NonceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Draw a fresh nonce and record it. Collisions within the outstanding
    /// set are redrawn transparently.
    pub fn issue(
        &mut self,
        purpose: RequestKind,
        context: RequestContext,
        initial_timeout: Duration,
        max_retries: u8,
    ) -> u64 {
        let mut rng = rand::rng();
        let value = loop {
            let candidate: u64 = rng.random();
            if !self.outstanding.contains_key(&candidate) {
                break candidate;
            }
        };
        self.outstanding.insert(
            value,
            NonceEntry {
                value,
                purpose,
                context,
                issued_at: Instant::now(),
                retries_left: max_retries,
                timeout: initial_timeout,
                timer: None,
            },
        );
        value
    }

    /// Attach the retransmit timer scheduled for this nonce.
    pub fn set_timer(&mut self, value: u64, timer: TimerId) {
        if let Some(entry) = self.outstanding.get_mut(&value) {
            entry.timer = Some(timer);
        }
    }

    /// Remove and return the entry iff `value` is outstanding. The caller
    /// cancels the returned entry's timer.
    pub fn consume(&mut self, value: u64) -> Option<NonceEntry> {
        self.outstanding.remove(&value)
    }

    pub fn get(&self, value: u64) -> Option<&NonceEntry> {
        self.outstanding.get(&value)
    }

    /// Step the retransmit state machine for a fired timer. `None` means
    /// the nonce was consumed or cancelled before the fire was processed.
    pub fn on_timer_fired(&mut self, value: u64) -> Option<TimerVerdict> {
        let entry = self.outstanding.get_mut(&value)?;
        if entry.retries_left == 0 {
            let entry = self.outstanding.remove(&value)?;
            return Some(TimerVerdict::Expired { context: entry.context });
        }
        entry.retries_left -= 1;
        entry.timeout = (entry.timeout * 2).min(MAX_RETRANSMIT_TIMEOUT);
        Some(TimerVerdict::Retransmit { timeout: entry.timeout, context: entry.context.clone() })
    }

    /// The outstanding map-request for an EID prefix, for coalescing.
    pub fn find_map_request(&self, eid: &EidPrefix) -> Option<&NonceEntry> {
        self.outstanding.values().find(|e| {
            matches!(&e.context,
                RequestContext::MapRequest { eid: pending, .. } if pending == eid)
        })
    }

    pub fn find_info_request(&self) -> Option<&NonceEntry> {
        self.outstanding.values().find(|e| e.purpose == RequestKind::InfoRequest)
    }

    pub fn iter(&self) -> impl Iterator<Item = &NonceEntry> {
        self.outstanding.values()
    }

    pub fn len(&self) -> usize {
        self.outstanding.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outstanding.is_empty()
    }
}
