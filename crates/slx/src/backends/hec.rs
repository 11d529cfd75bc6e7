//! 📡 HTTP Event Collector endpoint: one POST per attempt, a token in the header, and
//! (optionally) a polite follow-up asking "did you actually index that?".
//!
//! 🎬 *[the request leaves. the collector replies 200. but did it INDEX it?]*
//! *[with indexer acknowledgment on, 200 only means "I got the envelope".]*
//! *[we keep asking until it says "yes, it's on disk", or the ack timeout says "enough".]*
//!
//! 🧠 Knowledge graph:
//! - `Authorization: Splunk <token>` on every request, collector path picked by endpoint type
//! - status → outcome goes through `delivery::classify_status` (2xx ack, 408/429/5xx transient,
//!   other 4xx permanent); anything that never got a status is a transport error
//! - indexer ack: send `X-Splunk-Request-Channel`, read `ackId`, poll `/services/collector/ack`
//!   every `poll_interval_ms`. The whole exchange sits inside the caller's ack timeout,
//!   so the poll loop itself never gives up
//! - the reqwest `Client` is cloned into every lane; clones share one connection pool

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, trace};

use crate::backends::Endpoint;
use crate::delivery::{DeliveryOutcome, DeliveryRequest, Rejection, classify_status};

const REQUEST_CHANNEL_HEADER: &str = "X-Splunk-Request-Channel";
const ACK_PATH: &str = "/services/collector/ack";

/// 🔧 `[endpoint.Hec]`
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct HecEndpointConfig {
    /// 🌐 scheme + host (+ port), e.g. `https://hec.example.com:8088`
    pub url: String,
    pub token: String,
    #[serde(default)]
    pub indexer_ack: Option<IndexerAckConfig>,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_connect_timeout_secs() -> u64 {
    10
}

/// 🔧 `[endpoint.Hec.indexer_ack]`
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct IndexerAckConfig {
    /// 🆔 the request channel GUID the collector expects
    pub channel: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_poll_interval_ms() -> u64 {
    1000
}

/// 📡 The real thing.
#[derive(Debug, Clone)]
pub(crate) struct HecEndpoint {
    client: reqwest::Client,
    base_url: String,
    authorization: String,
    indexer_ack: Option<IndexerAckConfig>,
}

impl HecEndpoint {
    pub(crate) fn new(config: &HecEndpointConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .context("💀 Failed to build the HTTP client. TLS backend having a moment?")?;
        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            authorization: format!("Splunk {}", config.token),
            indexer_ack: config.indexer_ack.clone(),
        })
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        let builder = self
            .client
            .post(format!("{}{path}", self.base_url))
            .header(AUTHORIZATION, &self.authorization);
        match &self.indexer_ack {
            Some(ack) => builder.header(REQUEST_CHANNEL_HEADER, &ack.channel),
            None => builder,
        }
    }

    /// 🔁 Ask the collector about `ack_id` until it says yes.
    async fn await_indexer_ack(&self, ack: &IndexerAckConfig, ack_id: u64) -> DeliveryOutcome {
        let poll_interval = Duration::from_millis(ack.poll_interval_ms);
        loop {
            tokio::time::sleep(poll_interval).await;

            let response = match self
                .post(ACK_PATH)
                .json(&json!({ "acks": [ack_id] }))
                .send()
                .await
            {
                Ok(response) => response,
                Err(e) => return DeliveryOutcome::TransportError(e.to_string()),
            };
            let status = response.status().as_u16();
            let text = match response.text().await {
                Ok(text) => text,
                Err(e) => return DeliveryOutcome::TransportError(e.to_string()),
            };
            if !(200..=299).contains(&status) {
                return classify_status(status, describe_reply(&text));
            }

            let acked = serde_json::from_str::<Value>(&text)
                .ok()
                .and_then(|reply| reply["acks"][ack_id.to_string()].as_bool())
                .unwrap_or(false);
            if acked {
                debug!("✅ indexer acknowledged ackId {ack_id}");
                return DeliveryOutcome::Acked;
            }
            trace!("⏳ ackId {ack_id} not indexed yet");
        }
    }
}

/// 💬 Collector replies look like `{"text":"Invalid token","code":4}`. Make that readable.
fn describe_reply(body: &str) -> String {
    match serde_json::from_str::<Value>(body) {
        Ok(reply) => match (reply["text"].as_str(), reply["code"].as_i64()) {
            (Some(text), Some(code)) => format!("{text} (code {code})"),
            (Some(text), None) => text.to_string(),
            _ => body.chars().take(200).collect(),
        },
        Err(_) => body.chars().take(200).collect(),
    }
}

#[async_trait]
impl Endpoint for HecEndpoint {
    async fn dispatch(&self, request: &DeliveryRequest) -> DeliveryOutcome {
        let response = match self
            .post(request.endpoint_type.collector_path())
            .body(request.body.clone())
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => return DeliveryOutcome::TransportError(e.to_string()),
        };

        let status = response.status().as_u16();
        let text = match response.text().await {
            Ok(text) => text,
            Err(e) => return DeliveryOutcome::TransportError(e.to_string()),
        };
        let outcome = classify_status(status, describe_reply(&text));

        let Some(ack) = &self.indexer_ack else {
            return outcome;
        };
        if !outcome.is_acked() {
            return outcome;
        }

        match serde_json::from_str::<Value>(&text)
            .ok()
            .and_then(|reply| reply["ackId"].as_u64())
        {
            Some(ack_id) => self.await_indexer_ack(ack, ack_id).await,
            None => DeliveryOutcome::Nacked(Rejection {
                status,
                reason: "indexer acknowledgment is configured but the collector returned no ackId"
                    .to_string(),
                retriable: false,
            }),
        }
    }
}
