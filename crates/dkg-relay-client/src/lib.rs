//! DKG Relay Client
//!
//! Client library used by operator nodes, the API server and the CLI to talk
//! to the DKG relay service.

use dkg_relay::{OperatorId, RunResult, SignedMessage, TopicView, DEFAULT_TOPIC};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument, warn};

/// Environment variable holding the relay's base URL
pub const RELAY_ADDR_ENV: &str = "MESSENGER_SRV_ADDR";

/// Relay address used when none is configured
pub const DEFAULT_RELAY_ADDR: &str = "http://127.0.0.1:3000";

/// Attempts made by [`RelayClient::register_operator_node`]
const REGISTRATION_ATTEMPTS: usize = 3;

/// Client errors
#[derive(Debug, Error)]
pub enum ClientError {
    /// Transport failure
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Relay answered with a non-success status
    #[error("{operation} failed with status {status}: {body}")]
    Status {
        operation: &'static str,
        status: StatusCode,
        body: String,
    },

    /// Node could not be registered
    #[error("failed to register node after {attempts} tries: {errors:?}")]
    Registration { attempts: usize, errors: Vec<String> },

    /// Payload could not be encoded
    #[error("serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, ClientError>;

/// HTTP client for the relay service
#[derive(Clone)]
pub struct RelayClient {
    /// HTTP client
    client: Client,
    /// Relay service URL
    url: String,
    /// Request timeout
    timeout: Duration,
}

impl RelayClient {
    /// Create a new relay client
    pub fn new(url: &str) -> Self {
        Self {
            client: Client::new(),
            url: url.trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(30),
        }
    }

    /// Create a client from `MESSENGER_SRV_ADDR`
    pub fn from_env() -> Self {
        let url = std::env::var(RELAY_ADDR_ENV)
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_RELAY_ADDR.to_string());
        Self::new(&url)
    }

    /// Set request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Register this operator on the default topic
    ///
    /// Tried up to three times; every failure is reported if none succeed.
    #[instrument(skip(self))]
    pub async fn register_operator_node(&self, id: &str, addr: &str) -> Result<()> {
        let body = RegisterNodeRequest {
            name: id.to_string(),
            srv_addr: addr.to_string(),
        };
        let mut errors = Vec::new();

        for attempt in 1..=REGISTRATION_ATTEMPTS {
            let result = self
                .client
                .post(format!("{}/register_node", self.url))
                .query(&[("subscribes_to", DEFAULT_TOPIC)])
                .json(&body)
                .timeout(self.timeout)
                .send()
                .await;

            match result {
                Ok(response) if response.status() == StatusCode::OK => {
                    debug!(attempt, "node registered");
                    return Ok(());
                }
                Ok(response) => {
                    let err = status_error("register_node", response).await;
                    warn!(attempt, error = %err, "registration attempt failed");
                    errors.push(err.to_string());
                }
                Err(e) => {
                    warn!(attempt, error = %e, "registration attempt failed");
                    errors.push(e.to_string());
                }
            }
        }

        Err(ClientError::Registration {
            attempts: REGISTRATION_ATTEMPTS,
            errors,
        })
    }

    /// Create the topic for a run from its participating operators
    #[instrument(skip(self))]
    pub async fn create_topic(&self, request_id: &str, operators: &[OperatorId]) -> Result<TopicView> {
        let req = CreateTopicRequest {
            topic_name: request_id.to_string(),
            subscribers: operators.iter().map(|id| id.to_string()).collect(),
        };

        let response = self
            .client
            .post(format!("{}/topics", self.url))
            .json(&req)
            .timeout(self.timeout)
            .send()
            .await?;
        let response = check("create_topic", response).await?;
        Ok(response.json().await?)
    }

    /// Publish a raw payload to a topic
    #[instrument(skip(self, payload), fields(len = payload.len()))]
    pub async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/publish", self.url))
            .query(&[("topic_name", topic)])
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(payload)
            .timeout(self.timeout)
            .send()
            .await?;
        check("publish", response).await?;
        debug!(topic, "message published");
        Ok(())
    }

    /// Publish a signed DKG message to its run's topic
    pub async fn broadcast_dkg_message(&self, msg: &SignedMessage) -> Result<()> {
        let payload = msg
            .to_envelope()
            .map_err(|e| ClientError::Serialization(e.to_string()))?;
        self.publish(&msg.request_id(), payload).await
    }

    /// Push every operator's signed output for a run
    pub async fn stream_dkg_output<T: Serialize>(
        &self,
        request_id: &str,
        outputs: &std::collections::BTreeMap<OperatorId, T>,
    ) -> Result<()> {
        self.stream("dkgoutput", request_id, outputs).await
    }

    /// Push the blame output of a failed run
    pub async fn stream_dkg_blame<T: Serialize>(&self, request_id: &str, blame: &T) -> Result<()> {
        self.stream("dkgblame", request_id, blame).await
    }

    /// Fetch a run's result, if one was recorded
    #[instrument(skip(self))]
    pub async fn get_data(&self, request_id: &str) -> Result<Option<RunResult>> {
        let response = self
            .client
            .get(format!("{}/data/{}", self.url, request_id))
            .timeout(self.timeout)
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = check("get_data", response).await?;
        Ok(Some(response.json().await?))
    }

    /// Check the relay is reachable
    pub async fn ping(&self) -> Result<()> {
        let response = self
            .client
            .get(format!("{}/ping", self.url))
            .timeout(self.timeout)
            .send()
            .await?;
        check("ping", response).await?;
        Ok(())
    }

    async fn stream<T: Serialize + ?Sized>(
        &self,
        kind: &'static str,
        request_id: &str,
        data: &T,
    ) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/stream/{}", self.url, kind))
            .query(&[("request_id", request_id)])
            .json(data)
            .timeout(self.timeout)
            .send()
            .await?;
        check(kind, response).await?;
        debug!(request_id, kind, "result streamed");
        Ok(())
    }
}

async fn check(operation: &'static str, response: reqwest::Response) -> Result<reqwest::Response> {
    if response.status().is_success() {
        Ok(response)
    } else {
        Err(status_error(operation, response).await)
    }
}

async fn status_error(operation: &'static str, response: reqwest::Response) -> ClientError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    ClientError::Status {
        operation,
        status,
        body,
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct RegisterNodeRequest {
    name: String,
    srv_addr: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct CreateTopicRequest {
    topic_name: String,
    subscribers: Vec<String>,
}
