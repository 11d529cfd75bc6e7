//! 🛑 Shutdown signalling: "wrap it up" followed, eventually, by "no really, stop".
//!
//! One [`ShutdownTrigger`], many [`ShutdownListener`]s (one per worker), glued together
//! by a `tokio::sync::watch` channel. Triggering records a hard deadline of
//! `now + grace`. Workers use it two ways:
//! - sources and buffers stop on `requested()` and flush what they have
//! - delivery keeps going until `deadline_passed()`, then sends leftovers to backup
//!
//! Triggering twice keeps the first deadline. Ctrl-C mashing does not shorten the grace.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Running,
    Draining { deadline: Instant },
}

/// 🔴 The big red button.
#[derive(Debug, Clone)]
pub struct ShutdownTrigger {
    tx: Arc<watch::Sender<Phase>>,
    grace: Duration,
}

impl ShutdownTrigger {
    pub fn new(grace: Duration) -> Self {
        let (tx, _) = watch::channel(Phase::Running);
        Self {
            tx: Arc::new(tx),
            grace,
        }
    }

    pub fn listener(&self) -> ShutdownListener {
        ShutdownListener {
            rx: self.tx.subscribe(),
        }
    }

    /// 🛑 Start draining. The deadline is fixed by the first call.
    pub fn trigger(&self) {
        let grace = self.grace;
        self.tx.send_if_modified(|phase| match phase {
            Phase::Running => {
                *phase = Phase::Draining {
                    deadline: Instant::now() + grace,
                };
                true
            }
            Phase::Draining { .. } => false,
        });
    }
}

/// 👂 A worker's view of the shutdown state.
#[derive(Debug, Clone)]
pub struct ShutdownListener {
    rx: watch::Receiver<Phase>,
}

impl ShutdownListener {
    /// 🏝️ A listener nobody will ever trigger.
    pub fn never() -> Self {
        let (_, rx) = watch::channel(Phase::Running);
        Self { rx }
    }

    pub fn is_requested(&self) -> bool {
        matches!(*self.rx.borrow(), Phase::Draining { .. })
    }

    pub fn deadline(&self) -> Option<Instant> {
        match *self.rx.borrow() {
            Phase::Running => None,
            Phase::Draining { deadline } => Some(deadline),
        }
    }

    pub fn deadline_passed(&self) -> bool {
        self.deadline()
            .is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// ⏳ Resolves once shutdown has been requested. Pends forever if the trigger is gone.
    pub async fn requested(&mut self) {
        let draining = self
            .rx
            .wait_for(|phase| matches!(phase, Phase::Draining { .. }))
            .await
            .is_ok();
        if !draining {
            std::future::pending::<()>().await;
        }
    }

    /// ⏰ Resolves once shutdown has been requested AND its deadline has passed.
    pub async fn deadline_reached(&mut self) {
        self.requested().await;
        if let Some(deadline) = self.deadline() {
            tokio::time::sleep_until(deadline).await;
        }
    }
}
