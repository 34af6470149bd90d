//! Relay handle
//!
//! Ties the registry, the result store, the dispatcher and the job runner
//! together behind the operations the HTTP service exposes.

use crate::dispatcher::Dispatcher;
use crate::egress::EgressWorker;
use crate::message::Message;
use crate::registry::{
    subscriber_job_id, Registration, Registry, Retired, SharedRegistry, TopicView,
};
use crate::runner::{Job, JobRunner, Task};
use crate::store::{ResultStore, RunResult, StoredResult};
use crate::telemetry;
use crate::{RelayConfig, RelayError, Result};
use reqwest::Client;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

/// Job id prefix for topic dispatchers
const TOPIC_JOB_PREFIX: &str = "TOPIC__";

/// What a node registration did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistrationStatus {
    /// New subscriber; a worker was started
    Created,
    /// Known subscriber added to another topic
    Joined,
    /// Known member; address refreshed
    Updated,
}

struct Inner {
    config: RelayConfig,
    registry: SharedRegistry,
    results: ResultStore,
    inbound: mpsc::Sender<Message>,
    runner: JobRunner,
    client: Client,
}

/// Cloneable handle to a running relay
#[derive(Clone)]
pub struct Relay {
    inner: Arc<Inner>,
}

impl Relay {
    /// Build the relay and start its runner and dispatcher
    ///
    /// Must be called from within a tokio runtime.
    pub async fn start(config: RelayConfig) -> Result<Self> {
        let registry = Registry::new(&config.default_topic).shared();
        let (inbound, inbound_rx) = mpsc::channel(config.inbound_capacity.max(1));
        let (runner, queue) = JobRunner::new(config.job_queue_capacity);
        tokio::spawn(queue.run());

        let dispatcher = Dispatcher::new(inbound_rx, registry.clone());
        runner
            .add_job(Job::new(
                format!("{TOPIC_JOB_PREFIX}{}", config.default_topic),
                Task::Dispatch(dispatcher),
            ))
            .await?;

        info!(default_topic = %config.default_topic, "relay started");

        Ok(Self {
            inner: Arc::new(Inner {
                results: ResultStore::new(config.result_ttl),
                config,
                registry,
                inbound,
                runner,
                client: Client::new(),
            }),
        })
    }

    pub fn config(&self) -> &RelayConfig {
        &self.inner.config
    }

    pub fn results(&self) -> &ResultStore {
        &self.inner.results
    }

    /// Queue a payload for fan-out; waits while the inbound queue is full
    pub async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        if topic.is_empty() {
            return Err(RelayError::InvalidRequest("empty topic name".to_string()));
        }
        if self.inner.registry.read().await.topic(topic).is_none() {
            return Err(RelayError::TopicNotFound(topic.to_string()));
        }

        self.inner
            .inbound
            .send(Message::new(topic, payload))
            .await
            .map_err(|_| RelayError::ShuttingDown)?;
        telemetry::message_published();
        Ok(())
    }

    /// Register an operator node on a topic
    ///
    /// The first registration of a name starts its egress worker; later ones
    /// only refresh the address or add topic membership.
    pub async fn register_node(
        &self,
        topic: &str,
        name: &str,
        address: &str,
    ) -> Result<RegistrationStatus> {
        let registration = self.inner.registry.write().await.register(
            topic,
            name,
            address,
            self.inner.config.outbound_capacity,
        )?;

        match registration {
            Registration::Created(subscriber) => {
                let job_id = subscriber.job_id.clone();
                let cancel = subscriber.cancel.clone();
                let worker = EgressWorker::new(
                    subscriber,
                    self.inner.registry.clone(),
                    self.inner.client.clone(),
                    &self.inner.config,
                );
                let job = Job::new(job_id, Task::Egress(worker)).with_cancel(cancel);
                if let Err(e) = self.inner.runner.add_job(job).await {
                    self.inner.registry.write().await.unregister(name);
                    return Err(e);
                }
                info!(topic, subscriber = name, address, "node registered");
                Ok(RegistrationStatus::Created)
            }
            Registration::Joined => {
                info!(topic, subscriber = name, address, "node joined topic");
                Ok(RegistrationStatus::Joined)
            }
            Registration::Updated => {
                info!(topic, subscriber = name, address, "node address updated");
                Ok(RegistrationStatus::Updated)
            }
        }
    }

    /// Remove a node from every topic and stop its worker
    pub async fn unregister_node(&self, name: &str) -> bool {
        let retired = self.inner.registry.write().await.unregister(name);
        match retired {
            Some(retired) => {
                retire(&[retired]);
                true
            }
            None => false,
        }
    }

    /// Create or replace a topic from registered default-topic members
    pub async fn create_topic(&self, name: &str, subscribers: &[String]) -> Result<TopicView> {
        let (view, retired) = self
            .inner
            .registry
            .write()
            .await
            .create_or_update_topic(name, subscribers)?;
        retire(&retired);

        info!(
            topic = name,
            members = view.subscribers.len(),
            requested = subscribers.len(),
            "topic created"
        );
        Ok(view)
    }

    pub async fn topic(&self, name: &str) -> Result<TopicView> {
        self.inner
            .registry
            .read()
            .await
            .topic(name)
            .ok_or_else(|| RelayError::TopicNotFound(name.to_string()))
    }

    pub async fn topics(&self) -> Vec<TopicView> {
        self.inner.registry.read().await.topics()
    }

    /// Delete a topic; subscribers left with no topic are retired
    pub async fn delete_topic(&self, name: &str) -> Result<()> {
        let retired = self.inner.registry.write().await.delete_topic(name)?;
        retire(&retired);
        info!(topic = name, retired = retired.len(), "topic deleted");
        Ok(())
    }

    /// Record the terminal result of a run
    pub fn put_result(&self, request_id: &str, result: RunResult) {
        self.inner.results.put(request_id, result);
    }

    pub fn get_result(&self, request_id: &str) -> Option<StoredResult> {
        self.inner.results.get(request_id)
    }

    /// Number of running jobs, the dispatcher included
    pub fn active_jobs(&self) -> usize {
        self.inner.runner.job_count()
    }

    pub fn is_worker_running(&self, subscriber: &str) -> bool {
        self.inner.runner.is_running(&subscriber_job_id(subscriber))
    }

    /// Stop the dispatcher and every worker
    pub fn shutdown(&self) {
        info!("relay shutting down");
        self.inner.runner.shutdown();
    }
}

fn retire(retired: &[Retired]) {
    for subscriber in retired {
        info!(subscriber = %subscriber.name, job = %subscriber.job_id, "retiring subscriber");
        subscriber.cancel();
    }
}
