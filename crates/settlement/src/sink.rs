use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use visitproof_domain::model::SettlementPayload;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SinkError {
    #[error("reward request failed: {0}")]
    Transport(String),
    #[error("reward service rejected delivery: status {0}")]
    Rejected(u16),
}

/// Where accepted reward jobs go. The sink must be idempotent on the
/// delivery key: redelivering an already-settled key is a no-op downstream.
#[async_trait]
pub trait RewardSink: Send + Sync {
    async fn deliver(&self, key: &str, payload: &SettlementPayload) -> Result<(), SinkError>;
}

pub struct HttpRewardSink {
    endpoint: String,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct RewardRequestBody<'a> {
    idempotency_key: &'a str,
    user_id: &'a str,
    place_id: &'a str,
    mission_id: &'a str,
    amount: i64,
}

impl HttpRewardSink {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl RewardSink for HttpRewardSink {
    async fn deliver(&self, key: &str, payload: &SettlementPayload) -> Result<(), SinkError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&RewardRequestBody {
                idempotency_key: key,
                user_id: payload.user_id.as_str(),
                place_id: payload.place_id.as_str(),
                mission_id: payload.mission_id.as_str(),
                amount: payload.amount,
            })
            .send()
            .await
            .map_err(|err| SinkError::Transport(err.to_string()))?;

        if !response.status().is_success() {
            return Err(SinkError::Rejected(response.status().as_u16()));
        }
        Ok(())
    }
}
