//! 🔁 The per-batch delivery state machine, with its retry bookkeeping.
//!
//! ```text
//!            dispatch                 ack
//!  Pending ───────────▶ InFlight ───────────▶ Acked ──(archive)──▶ BackedUp
//!     │                  │   ▲
//!     │ (nothing to      │   │ dispatch after backoff
//!     │  send)           ▼   │
//!     └──▶ Acked       Retrying ──(deadline)──▶ BackedUp
//!
//!  InFlight ──(permanent rejection | ceiling reached)──▶ BackedUp
//! ```
//!
//! Pure and synchronous: the caller brings the clock and the outcome, the machine says
//! what happens next. Illegal moves come back as [`InvalidTransition`] instead of
//! quietly corrupting the attempt count.

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use super::DeliveryOutcome;

/// 🚦 Where a batch is in its delivery life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DeliveryState {
    Pending,
    InFlight,
    Retrying,
    Acked,
    BackedUp,
}

impl fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// 💀 Somebody asked the machine to do something it cannot do from its current state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot {action} a batch that is {from}")]
pub struct InvalidTransition {
    pub from: DeliveryState,
    pub action: &'static str,
}

/// ⏳ Retry ceiling plus exponential backoff bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// 🔢 maximum TOTAL attempts per batch, first one included
    pub ceiling: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl RetryPolicy {
    /// ⏳ Delay after the `attempt`-th failed attempt: `min(cap, base * 2^(attempt-1))`.
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let multiplier = 2u32.checked_pow(exponent).unwrap_or(u32::MAX);
        self.base.saturating_mul(multiplier).min(self.cap)
    }
}

/// 🧾 Per-batch retry bookkeeping. Lives exactly as long as the batch is unresolved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryState {
    pub attempts: u32,
    pub last_attempt_at: Option<Instant>,
    pub next_backoff: Option<Duration>,
}

/// 🎰 One batch's state plus its retry state, advanced by explicit transitions.
#[derive(Debug, Clone, Copy)]
pub struct DeliveryMachine {
    policy: RetryPolicy,
    state: DeliveryState,
    retry: RetryState,
}

impl DeliveryMachine {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            state: DeliveryState::Pending,
            retry: RetryState::default(),
        }
    }

    pub fn state(&self) -> DeliveryState {
        self.state
    }

    pub fn retry(&self) -> &RetryState {
        &self.retry
    }

    pub fn attempts(&self) -> u32 {
        self.retry.attempts
    }

    /// 🏁 Acked or BackedUp. Acked can still be archived, but nothing else happens to it.
    pub fn is_terminal(&self) -> bool {
        matches!(self.state, DeliveryState::Acked | DeliveryState::BackedUp)
    }

    /// 🚀 Pending | Retrying → InFlight. Returns the attempt number (1-based).
    pub fn dispatch(&mut self, now: Instant) -> Result<u32, InvalidTransition> {
        match self.state {
            DeliveryState::Pending | DeliveryState::Retrying => {
                self.state = DeliveryState::InFlight;
                self.retry.attempts += 1;
                self.retry.last_attempt_at = Some(now);
                self.retry.next_backoff = None;
                Ok(self.retry.attempts)
            }
            from => Err(InvalidTransition {
                from,
                action: "dispatch",
            }),
        }
    }

    /// 📬 InFlight → Acked | Retrying | BackedUp, depending on the outcome and the ceiling.
    pub fn resolve(&mut self, outcome: &DeliveryOutcome) -> Result<DeliveryState, InvalidTransition> {
        if self.state != DeliveryState::InFlight {
            return Err(InvalidTransition {
                from: self.state,
                action: "resolve",
            });
        }

        self.state = if outcome.is_acked() {
            DeliveryState::Acked
        } else if outcome.is_retriable() && self.retry.attempts < self.policy.ceiling {
            self.retry.next_backoff = Some(self.policy.backoff_after(self.retry.attempts));
            DeliveryState::Retrying
        } else {
            DeliveryState::BackedUp
        };
        Ok(self.state)
    }

    /// 🫙 Pending → Acked without an attempt: there was nothing to send.
    pub fn skip_empty(&mut self) -> Result<(), InvalidTransition> {
        match self.state {
            DeliveryState::Pending => {
                self.state = DeliveryState::Acked;
                Ok(())
            }
            from => Err(InvalidTransition {
                from,
                action: "skip",
            }),
        }
    }

    /// 🛑 Pending | Retrying → BackedUp: the shutdown deadline passed before the next attempt.
    pub fn abandon(&mut self) -> Result<(), InvalidTransition> {
        match self.state {
            DeliveryState::Pending | DeliveryState::Retrying => {
                self.state = DeliveryState::BackedUp;
                self.retry.next_backoff = None;
                Ok(())
            }
            from => Err(InvalidTransition {
                from,
                action: "abandon",
            }),
        }
    }

    /// 🗄️ Acked → BackedUp: every-batch backup policy persists delivered batches too.
    pub fn archive(&mut self) -> Result<(), InvalidTransition> {
        match self.state {
            DeliveryState::Acked => {
                self.state = DeliveryState::BackedUp;
                Ok(())
            }
            DeliveryState::BackedUp => Ok(()),
            from => Err(InvalidTransition {
                from,
                action: "archive",
            }),
        }
    }
}
