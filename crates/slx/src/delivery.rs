//! 📡 The Delivery Client: ship it, wait for the nod, and know when to give up.
//!
//! 🎬 *[a batch stands at the edge of the network. the endpoint is 40ms away.]*
//! *[or 180 seconds away. or on fire. the batch does not know which.]*
//! *[the client starts a timer.]*
//!
//! Per batch, the client:
//! 1. skips the network entirely when the transformer left nothing to send
//! 2. dispatches the framed body, bounded by the acknowledgment timeout
//! 3. classifies the outcome (ack / nack / timeout / transport error)
//! 4. lets the [`DeliveryMachine`] decide: done, retry after backoff, or hand to backup
//! 5. checks the shutdown deadline before every new attempt, and during every backoff
//!
//! An attempt already in flight always finishes. A new one never starts after the deadline.
//!
//! 🧠 Knowledge graph:
//! - outcomes are values, never `Err`s; the only errors here are broken invariants
//! - retry state is owned by the machine, one per batch, dropped with the report
//! - the endpoint is a cloneable backend shared by every lane; each request is owned
//!   by exactly one attempt
//!
//! ⚠️ "Have you tried turning it off and on again?" is not a retry policy. This is.

pub mod retry;

use std::fmt;
use std::ops::RangeInclusive;
use std::time::Duration;

use anyhow::{Context, Result, bail, ensure};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::trace;

use crate::backends::{Endpoint, EndpointBackend};
use crate::common::ChannelId;
use crate::composers::EndpointType;
use crate::oplog::{OpEvent, OperationalLog};
use crate::supervisors::shutdown::ShutdownListener;
pub use retry::{DeliveryMachine, DeliveryState, InvalidTransition, RetryPolicy, RetryState};

/// ⏱️ Accepted acknowledgment timeouts, in seconds.
pub const ACK_TIMEOUT_RANGE_SECS: RangeInclusive<u64> = 180..=600;

/// 🔧 `[delivery]` config section.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct DeliveryConfig {
    #[serde(default)]
    pub endpoint_type: EndpointType,
    #[serde(default = "default_ack_timeout_secs")]
    pub ack_timeout_secs: u64,
    /// 🔢 maximum total attempts per batch
    #[serde(default = "default_retry_ceiling")]
    pub retry_ceiling: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
}

fn default_ack_timeout_secs() -> u64 {
    180
}

fn default_retry_ceiling() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    1000
}

fn default_backoff_cap_ms() -> u64 {
    30_000
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            endpoint_type: EndpointType::default(),
            ack_timeout_secs: default_ack_timeout_secs(),
            retry_ceiling: default_retry_ceiling(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
        }
    }
}

impl DeliveryConfig {
    /// 🚨 Startup-time sanity checks. Better to refuse to start than to retry forever.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            ACK_TIMEOUT_RANGE_SECS.contains(&self.ack_timeout_secs),
            "💀 delivery.ack_timeout_secs = {} is outside {}..={} seconds. \
             Too short and healthy endpoints look dead; too long and dead ones look healthy.",
            self.ack_timeout_secs,
            ACK_TIMEOUT_RANGE_SECS.start(),
            ACK_TIMEOUT_RANGE_SECS.end()
        );
        ensure!(
            self.retry_ceiling >= 1,
            "💀 delivery.retry_ceiling must allow at least one attempt. Zero attempts is just backup with extra steps."
        );
        ensure!(
            self.backoff_base_ms > 0,
            "💀 delivery.backoff_base_ms must be positive."
        );
        ensure!(
            self.backoff_cap_ms >= self.backoff_base_ms,
            "💀 delivery.backoff_cap_ms ({}) is smaller than delivery.backoff_base_ms ({}).",
            self.backoff_cap_ms,
            self.backoff_base_ms
        );
        Ok(())
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            ceiling: self.retry_ceiling,
            base: Duration::from_millis(self.backoff_base_ms),
            cap: Duration::from_millis(self.backoff_cap_ms),
        }
    }
}

/// 🙅 An explicit "no" from the endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub status: u16,
    pub reason: String,
    pub retriable: bool,
}

/// 📬 What one attempt came back with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Acked,
    Nacked(Rejection),
    TimedOut,
    TransportError(String),
}

impl DeliveryOutcome {
    pub fn is_acked(&self) -> bool {
        matches!(self, DeliveryOutcome::Acked)
    }

    /// 🔁 Timeouts and transport errors are always worth another go. Nacks say so themselves.
    pub fn is_retriable(&self) -> bool {
        match self {
            DeliveryOutcome::Acked => false,
            DeliveryOutcome::Nacked(rejection) => rejection.retriable,
            DeliveryOutcome::TimedOut | DeliveryOutcome::TransportError(_) => true,
        }
    }
}

impl fmt::Display for DeliveryOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryOutcome::Acked => f.write_str("acked"),
            DeliveryOutcome::Nacked(r) => write!(
                f,
                "nacked({} {}, {})",
                r.status,
                r.reason,
                if r.retriable { "transient" } else { "permanent" }
            ),
            DeliveryOutcome::TimedOut => f.write_str("timed_out"),
            DeliveryOutcome::TransportError(reason) => write!(f, "transport_error({reason})"),
        }
    }
}

/// 🏷️ Turn an HTTP status into an outcome.
///
/// | Status | Outcome |
/// |---|---|
/// | 2xx | `Acked` |
/// | 408, 429, 5xx | transient `Nacked` |
/// | everything else (401/403 auth, 400/413 malformed, ...) | permanent `Nacked` |
pub fn classify_status(status: u16, reason: impl Into<String>) -> DeliveryOutcome {
    match status {
        200..=299 => DeliveryOutcome::Acked,
        408 | 429 | 500..=599 => DeliveryOutcome::Nacked(Rejection {
            status,
            reason: reason.into(),
            retriable: true,
        }),
        _ => DeliveryOutcome::Nacked(Rejection {
            status,
            reason: reason.into(),
            retriable: false,
        }),
    }
}

/// 🏁 How a batch's delivery ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// ✅ acknowledged (or nothing needed sending)
    Acked,
    /// 🙅 a non-retriable rejection
    Rejected,
    /// 🔁 the retry ceiling ran out
    Exhausted,
    /// 🛑 the shutdown deadline arrived first
    Abandoned,
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Resolution::Acked => "acked",
            Resolution::Rejected => "rejected",
            Resolution::Exhausted => "exhausted",
            Resolution::Abandoned => "abandoned",
        };
        f.write_str(label)
    }
}

/// 📦 A framed body ready for the endpoint. Owned by exactly one in-flight attempt at a time.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryRequest {
    pub channel: ChannelId,
    pub sequence: u64,
    pub endpoint_type: EndpointType,
    pub body: String,
    pub event_count: usize,
}

impl DeliveryRequest {
    pub fn is_empty(&self) -> bool {
        self.event_count == 0
    }
}

/// 🧾 What the client hands back once a batch is resolved.
#[derive(Debug, Clone)]
pub struct DeliveryReport {
    pub machine: DeliveryMachine,
    pub resolution: Resolution,
    pub last_outcome: Option<DeliveryOutcome>,
}

impl DeliveryReport {
    pub fn attempts(&self) -> u32 {
        self.machine.attempts()
    }

    pub fn state(&self) -> DeliveryState {
        self.machine.state()
    }
}

/// 📡 Drives one batch at a time through the delivery state machine.
#[derive(Debug, Clone)]
pub(crate) struct DeliveryClient {
    endpoint: EndpointBackend,
    policy: RetryPolicy,
    ack_timeout: Duration,
    oplog: OperationalLog,
}

impl DeliveryClient {
    pub(crate) fn new(
        endpoint: EndpointBackend,
        config: &DeliveryConfig,
        oplog: OperationalLog,
    ) -> Self {
        Self {
            endpoint,
            policy: config.retry_policy(),
            ack_timeout: config.ack_timeout(),
            oplog,
        }
    }

    /// 🚀 Deliver one batch until it is Acked or needs backup.
    pub(crate) async fn deliver(
        &self,
        request: &DeliveryRequest,
        shutdown: &mut ShutdownListener,
    ) -> Result<DeliveryReport> {
        let mut machine = DeliveryMachine::new(self.policy);

        if request.is_empty() {
            machine.skip_empty()?;
            return Ok(self.resolved(request, machine, Resolution::Acked, None));
        }

        loop {
            if shutdown.deadline_passed() {
                machine.abandon()?;
                return Ok(self.resolved(request, machine, Resolution::Abandoned, None));
            }

            let attempt = machine.dispatch(Instant::now())?;
            trace!(
                "📡 dispatching {}#{} attempt {attempt} ({} events, {} bytes)",
                request.channel,
                request.sequence,
                request.event_count,
                request.body.len()
            );
            let outcome =
                match tokio::time::timeout(self.ack_timeout, self.endpoint.dispatch(request)).await
                {
                    Ok(outcome) => outcome,
                    Err(_) => DeliveryOutcome::TimedOut,
                };

            self.oplog.record(OpEvent::DeliveryAttempt {
                channel: request.channel.clone(),
                sequence: request.sequence,
                attempt,
                outcome: outcome.to_string(),
                acked: outcome.is_acked(),
            });

            let next = machine
                .resolve(&outcome)
                .context("💀 The delivery state machine rejected an outcome it should have expected.")?;

            match next {
                DeliveryState::Acked => {
                    return Ok(self.resolved(request, machine, Resolution::Acked, Some(outcome)));
                }
                DeliveryState::BackedUp => {
                    let resolution = if outcome.is_retriable() {
                        Resolution::Exhausted
                    } else {
                        Resolution::Rejected
                    };
                    return Ok(self.resolved(request, machine, resolution, Some(outcome)));
                }
                DeliveryState::Retrying => {
                    let backoff = machine.retry().next_backoff.unwrap_or_default();
                    trace!(
                        "⏳ {}#{} backing off {backoff:?} after {outcome}",
                        request.channel, request.sequence
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = shutdown.deadline_reached() => {
                            machine.abandon()?;
                            return Ok(self.resolved(request, machine, Resolution::Abandoned, Some(outcome)));
                        }
                    }
                }
                other => bail!(
                    "💀 Batch {}#{} ended an attempt in state {other}. States do not work like that.",
                    request.channel,
                    request.sequence
                ),
            }
        }
    }

    fn resolved(
        &self,
        request: &DeliveryRequest,
        machine: DeliveryMachine,
        resolution: Resolution,
        last_outcome: Option<DeliveryOutcome>,
    ) -> DeliveryReport {
        self.oplog.record(OpEvent::DeliveryResolved {
            channel: request.channel.clone(),
            sequence: request.sequence,
            attempts: machine.attempts(),
            resolution,
        });
        DeliveryReport {
            machine,
            resolution,
            last_outcome,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::in_mem::{InMemoryEndpoint, ScriptedReply};
    use crate::oplog::OpLogConfig;
    use crate::supervisors::shutdown::ShutdownTrigger;

    fn config(ceiling: u32) -> DeliveryConfig {
        DeliveryConfig {
            retry_ceiling: ceiling,
            ..DeliveryConfig::default()
        }
    }

    fn request(event_count: usize) -> DeliveryRequest {
        DeliveryRequest {
            channel: ChannelId::new("app"),
            sequence: 0,
            endpoint_type: EndpointType::Event,
            body: "{\"event\":\"x\"}\n".repeat(event_count),
            event_count,
        }
    }

    fn client(endpoint: &InMemoryEndpoint, ceiling: u32) -> (DeliveryClient, OperationalLog) {
        let oplog = OperationalLog::new(&OpLogConfig {
            journal: true,
            ..OpLogConfig::default()
        });
        let client = DeliveryClient::new(
            EndpointBackend::InMemory(endpoint.clone()),
            &config(ceiling),
            oplog.clone(),
        );
        (client, oplog)
    }

    fn never_shutting_down() -> ShutdownListener {
        ShutdownListener::never()
    }

    #[test]
    fn the_one_where_status_codes_sort_themselves_out() {
        assert!(classify_status(200, "ok").is_acked());
        assert!(classify_status(503, "busy").is_retriable());
        assert!(classify_status(429, "slow down").is_retriable());
        assert!(classify_status(408, "too slow").is_retriable());
        assert!(!classify_status(403, "invalid token").is_retriable());
        assert!(!classify_status(400, "no data").is_retriable());
        assert!(!classify_status(413, "too big").is_retriable());
        assert!(DeliveryOutcome::TimedOut.is_retriable());
    }

    #[test]
    fn the_one_where_ack_timeouts_outside_the_range_are_refused() {
        let mut c = DeliveryConfig::default();
        assert!(c.validate().is_ok());
        c.ack_timeout_secs = 30;
        assert!(c.validate().is_err());
        c.ack_timeout_secs = 601;
        assert!(c.validate().is_err());
        c.ack_timeout_secs = 600;
        c.backoff_cap_ms = 10;
        assert!(c.validate().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn the_one_where_a_timeout_then_an_ack_takes_two_attempts() -> Result<()> {
        let endpoint = InMemoryEndpoint::scripted(vec![
            ScriptedReply::Hang,
            ScriptedReply::Outcome(DeliveryOutcome::Acked),
        ]);
        let (client, oplog) = client(&endpoint, 3);

        let started = Instant::now();
        let report = client.deliver(&request(2), &mut never_shutting_down()).await?;

        assert_eq!(report.resolution, Resolution::Acked);
        assert_eq!(report.attempts(), 2);
        assert_eq!(report.state(), DeliveryState::Acked);
        // ⏱️ 180s ack timeout + 1s backoff, in virtual time
        assert!(Instant::now() - started >= Duration::from_secs(181));
        assert_eq!(endpoint.received().await.len(), 2);
        assert_eq!(oplog.snapshot().totals.delivery_attempts, 2);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn the_one_where_a_permanent_rejection_skips_the_retries() -> Result<()> {
        let endpoint = InMemoryEndpoint::scripted(vec![ScriptedReply::Outcome(classify_status(
            403,
            "invalid token",
        ))]);
        let (client, _) = client(&endpoint, 3);

        let report = client.deliver(&request(1), &mut never_shutting_down()).await?;
        assert_eq!(report.resolution, Resolution::Rejected);
        assert_eq!(report.attempts(), 1);
        assert_eq!(report.state(), DeliveryState::BackedUp);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn the_one_where_the_ceiling_runs_out() -> Result<()> {
        let endpoint = InMemoryEndpoint::scripted(vec![
            ScriptedReply::Outcome(classify_status(503, "busy")),
            ScriptedReply::Outcome(DeliveryOutcome::TransportError("reset".into())),
            ScriptedReply::Outcome(classify_status(500, "oops")),
            ScriptedReply::Outcome(DeliveryOutcome::Acked),
        ]);
        let (client, _) = client(&endpoint, 3);

        let report = client.deliver(&request(1), &mut never_shutting_down()).await?;
        assert_eq!(report.resolution, Resolution::Exhausted);
        assert_eq!(report.attempts(), 3);
        assert_eq!(endpoint.received().await.len(), 3);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn the_one_where_empty_batches_never_touch_the_network() -> Result<()> {
        let endpoint = InMemoryEndpoint::default();
        let (client, _) = client(&endpoint, 3);

        let report = client.deliver(&request(0), &mut never_shutting_down()).await?;
        assert_eq!(report.resolution, Resolution::Acked);
        assert_eq!(report.attempts(), 0);
        assert!(endpoint.received().await.is_empty());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn the_one_where_the_deadline_cuts_the_backoff_short() -> Result<()> {
        let endpoint = InMemoryEndpoint::scripted(vec![
            ScriptedReply::Outcome(classify_status(503, "busy")),
            ScriptedReply::Outcome(DeliveryOutcome::Acked),
        ]);
        let oplog = OperationalLog::default();
        let slow_backoff = DeliveryConfig {
            backoff_base_ms: 60_000,
            backoff_cap_ms: 60_000,
            ..DeliveryConfig::default()
        };
        let client = DeliveryClient::new(
            EndpointBackend::InMemory(endpoint.clone()),
            &slow_backoff,
            oplog,
        );

        let trigger = ShutdownTrigger::new(Duration::from_secs(5));
        let mut listener = trigger.listener();
        trigger.trigger();

        let report = client.deliver(&request(1), &mut listener).await?;
        assert_eq!(report.resolution, Resolution::Abandoned);
        assert_eq!(report.attempts(), 1);
        assert_eq!(endpoint.received().await.len(), 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn the_one_where_nothing_starts_after_the_deadline() -> Result<()> {
        let endpoint = InMemoryEndpoint::default();
        let (client, _) = client(&endpoint, 3);

        let trigger = ShutdownTrigger::new(Duration::ZERO);
        let mut listener = trigger.listener();
        trigger.trigger();

        let report = client.deliver(&request(1), &mut listener).await?;
        assert_eq!(report.resolution, Resolution::Abandoned);
        assert_eq!(report.attempts(), 0);
        assert!(endpoint.received().await.is_empty());
        Ok(())
    }
}
