//! Subscriber egress worker
//!
//! One worker per subscriber. It is the only reader of the subscriber's
//! outbound queue and the only user of its retry ledger, so neither needs a
//! lock. Failed deliveries go back to the tail of the same queue and are tried
//! again after whatever is already pending, with a linear backoff.

use crate::message::Message;
use crate::registry::{DeliveryTarget, NewSubscriber, SharedRegistry};
use crate::telemetry::{self, DropReason};
use crate::{RelayConfig, RelayError, Result};
use reqwest::{header::CONTENT_TYPE, Client, StatusCode};
use std::collections::{HashMap, VecDeque};
use tokio::sync::mpsc::{
    self,
    error::{TryRecvError, TrySendError},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Bookkeeping decision for one dequeued message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    /// Never seen this payload
    First,
    /// Nth retry of a payload seen before
    Retry(u32),
    /// Retry budget spent
    Exhausted(u32),
}

/// Per-subscriber delivery attempt counts keyed by payload hash
///
/// Bounded: the oldest hash is evicted once `capacity` is reached.
#[derive(Debug)]
pub struct RetryLedger {
    counts: HashMap<String, u32>,
    order: VecDeque<String>,
    capacity: usize,
}

impl RetryLedger {
    pub fn new(capacity: usize) -> Self {
        Self {
            counts: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Record that `hash` is about to be attempted
    pub fn next_attempt(&mut self, hash: &str, max_retries: u32) -> Attempt {
        if let Some(count) = self.counts.get_mut(hash) {
            if *count >= max_retries {
                return Attempt::Exhausted(*count);
            }
            *count += 1;
            return Attempt::Retry(*count);
        }

        while self.counts.len() >= self.capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.counts.remove(&oldest);
                }
                None => break,
            }
        }
        self.counts.insert(hash.to_string(), 0);
        self.order.push_back(hash.to_string());
        Attempt::First
    }

    /// Drop a hash whose message was abandoned
    pub fn forget(&mut self, hash: &str) {
        if self.counts.remove(hash).is_some() {
            self.order.retain(|h| h != hash);
        }
    }

}

/// Delivers one subscriber's outbound queue to its `/consume` endpoint
pub struct EgressWorker {
    name: String,
    inbox: mpsc::Receiver<Message>,
    requeue: mpsc::Sender<Message>,
    backlog: VecDeque<Message>,
    registry: SharedRegistry,
    client: Client,
    retries: RetryLedger,
    config: RelayConfig,
}

impl EgressWorker {
    pub fn new(
        subscriber: NewSubscriber,
        registry: SharedRegistry,
        client: Client,
        config: &RelayConfig,
    ) -> Self {
        Self {
            name: subscriber.name,
            inbox: subscriber.inbox,
            requeue: subscriber.outbound,
            backlog: VecDeque::new(),
            registry,
            client,
            retries: RetryLedger::new(config.retry_ledger_capacity),
            config: config.clone(),
        }
    }

    /// Drain the queue until cancelled
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(subscriber = %self.name, "egress worker started");

        loop {
            let msg = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                msg = self.next_message() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };
            self.report_depth();
            self.process(msg, &cancel).await;
        }
        telemetry::outbound_queue_depth(&self.name, 0);

        info!(
            subscriber = %self.name,
            pending = self.backlog.len(),
            "egress worker stopped"
        );
    }

    async fn next_message(&mut self) -> Option<Message> {
        match self.inbox.try_recv() {
            Ok(msg) => return Some(msg),
            Err(TryRecvError::Empty) => {}
            Err(TryRecvError::Disconnected) => return self.backlog.pop_front(),
        }
        if let Some(msg) = self.backlog.pop_front() {
            return Some(msg);
        }
        self.inbox.recv().await
    }

    async fn process(&mut self, msg: Message, cancel: &CancellationToken) {
        let hash = msg.content_hash();

        match self.retries.next_attempt(&hash, self.config.max_retries) {
            Attempt::First => {}
            Attempt::Retry(retry) => {
                telemetry::delivery_retried();
                let backoff = self.config.backoff_for(retry);
                debug!(subscriber = %self.name, hash = %hash, attempt = retry, ?backoff, "backing off");
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
            Attempt::Exhausted(attempts) => {
                self.retries.forget(&hash);
                let err = RelayError::RetriesExhausted {
                    subscriber: self.name.clone(),
                    attempts: attempts + 1,
                };
                error!(topic = %msg.topic, hash = %hash, "dropping message: {err}");
                telemetry::message_dropped(DropReason::RetriesExhausted);
                return;
            }
        }

        let target = self
            .registry
            .read()
            .await
            .delivery_target(&self.name, &msg.topic);
        let address = match target {
            DeliveryTarget::Deliver(address) => address,
            DeliveryTarget::NotSubscribed | DeliveryTarget::Retired => {
                self.retries.forget(&hash);
                warn!(
                    subscriber = %self.name,
                    topic = %msg.topic,
                    "dropping message: {}",
                    RelayError::TopicNotFound(msg.topic.clone())
                );
                telemetry::message_dropped(DropReason::NotSubscribed);
                return;
            }
        };

        let result = tokio::select! {
            _ = cancel.cancelled() => return,
            result = self.deliver(&address, &msg) => result,
        };

        match result {
            Ok(()) => {
                telemetry::message_delivered();
                debug!(subscriber = %self.name, topic = %msg.topic, "message delivered");
            }
            Err(e) => {
                telemetry::delivery_failed();
                warn!(
                    subscriber = %self.name,
                    topic = %msg.topic,
                    hash = %hash,
                    error = %e,
                    "delivery failed, re-queueing"
                );
                self.requeue(msg);
            }
        }
    }

    async fn deliver(&self, address: &str, msg: &Message) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/consume", address.trim_end_matches('/')))
            .header(CONTENT_TYPE, "application/json")
            .body(msg.payload.clone())
            .timeout(self.config.delivery_timeout)
            .send()
            .await
            .map_err(|e| RelayError::Delivery(e.to_string()))?;

        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(RelayError::Delivery(format!(
                "subscriber {} answered {status}: {body}",
                self.name
            )));
        }
        Ok(())
    }

    fn report_depth(&self) {
        let queued = self.requeue.max_capacity() - self.requeue.capacity();
        telemetry::outbound_queue_depth(&self.name, queued + self.backlog.len());
    }

    fn requeue(&mut self, msg: Message) {
        match self.requeue.try_send(msg) {
            Ok(()) => {}
            Err(TrySendError::Full(msg)) | Err(TrySendError::Closed(msg)) => {
                self.backlog.push_back(msg)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Registration, Registry};
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

    impl RetryLedger {
        fn attempts(&self, hash: &str) -> Option<u32> {
            self.counts.get(hash).copied()
        }

        fn len(&self) -> usize {
            self.counts.len()
        }
    }

    /// Fails the first `failures` requests and records when each one arrived
    struct FlakyConsumer {
        failures: usize,
        arrivals: Arc<Mutex<Vec<Instant>>>,
    }

    impl Respond for FlakyConsumer {
        fn respond(&self, _request: &Request) -> ResponseTemplate {
            let mut arrivals = self.arrivals.lock().unwrap();
            arrivals.push(Instant::now());
            if arrivals.len() <= self.failures {
                ResponseTemplate::new(500)
            } else {
                ResponseTemplate::new(200)
            }
        }
    }

    fn test_config() -> RelayConfig {
        RelayConfig::default()
            .with_retry_backoff(Duration::from_millis(5))
            .with_delivery_timeout(Duration::from_secs(2))
    }

    async fn spawn_worker(
        server: &MockServer,
        config: &RelayConfig,
    ) -> (
        SharedRegistry,
        mpsc::Sender<Message>,
        CancellationToken,
        tokio::task::JoinHandle<()>,
    ) {
        let registry = Registry::new("default").shared();
        let registration = registry
            .write()
            .await
            .register("default", "2", &server.uri(), config.outbound_capacity)
            .unwrap();
        let Registration::Created(new) = registration else {
            panic!("expected a new subscriber");
        };
        let outbound = new.outbound.clone();
        let cancel = new.cancel.clone();
        let worker = EgressWorker::new(new, registry.clone(), Client::new(), config);
        let handle = tokio::spawn(worker.run(cancel.clone()));
        (registry, outbound, cancel, handle)
    }

    async fn wait_for_requests(server: &MockServer, count: usize) -> Vec<wiremock::Request> {
        for _ in 0..400 {
            let requests = server.received_requests().await.unwrap_or_default();
            if requests.len() >= count {
                return requests;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {count} requests");
    }

    #[test]
    fn test_ledger_counts_retries() {
        let mut ledger = RetryLedger::new(8);

        assert_eq!(ledger.next_attempt("h", 2), Attempt::First);
        assert_eq!(ledger.next_attempt("h", 2), Attempt::Retry(1));
        assert_eq!(ledger.next_attempt("h", 2), Attempt::Retry(2));
        assert_eq!(ledger.next_attempt("h", 2), Attempt::Exhausted(2));
        assert_eq!(ledger.attempts("h"), Some(2));

        ledger.forget("h");
        assert_eq!(ledger.len(), 0);
        assert_eq!(ledger.next_attempt("h", 2), Attempt::First);
    }

    #[test]
    fn test_ledger_evicts_oldest() {
        let mut ledger = RetryLedger::new(2);
        ledger.next_attempt("a", 10);
        ledger.next_attempt("b", 10);
        ledger.next_attempt("c", 10);

        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger.attempts("a"), None);
        assert_eq!(ledger.attempts("c"), Some(0));
    }

    #[tokio::test]
    async fn test_delivers_in_fifo_order() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/consume"))
            .respond_with(ResponseTemplate::new(200))
            .expect(3)
            .mount(&server)
            .await;

        let (_registry, outbound, _cancel, _handle) = spawn_worker(&server, &test_config()).await;
        for body in ["one", "two", "three"] {
            outbound
                .send(Message::new("default", body.as_bytes().to_vec()))
                .await
                .unwrap();
        }

        let requests = wait_for_requests(&server, 3).await;
        let bodies: Vec<_> = requests.iter().map(|r| r.body.clone()).collect();
        assert_eq!(bodies, vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]);
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/consume"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(3)
            .expect(3)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/consume"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let (_registry, outbound, _cancel, _handle) = spawn_worker(&server, &test_config()).await;
        outbound
            .send(Message::new("default", b"payload".to_vec()))
            .await
            .unwrap();

        wait_for_requests(&server, 4).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(server.received_requests().await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_backoff_grows_linearly_between_attempts() {
        let server = MockServer::start().await;
        let arrivals = Arc::new(Mutex::new(Vec::new()));
        Mock::given(method("POST"))
            .and(path("/consume"))
            .respond_with(FlakyConsumer {
                failures: 3,
                arrivals: arrivals.clone(),
            })
            .expect(4)
            .mount(&server)
            .await;

        let unit = Duration::from_millis(100);
        let config = test_config().with_retry_backoff(unit);
        let (_registry, outbound, _cancel, _handle) = spawn_worker(&server, &config).await;
        outbound
            .send(Message::new("default", b"payload".to_vec()))
            .await
            .unwrap();

        wait_for_requests(&server, 4).await;
        for _ in 0..100 {
            if arrivals.lock().unwrap().len() >= 4 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let arrivals = arrivals.lock().unwrap().clone();
        let gaps: Vec<Duration> = arrivals.windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(gaps.len(), 3);
        for (retry, gap) in gaps.iter().enumerate() {
            let backoff = config.backoff_for(retry as u32 + 1);
            assert!(*gap >= backoff, "retry {} waited {gap:?}, expected {backoff:?}", retry + 1);
        }
        assert!(gaps[0] < gaps[1] && gaps[1] < gaps[2], "gaps {gaps:?}");
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/consume"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let config = test_config().with_max_retries(3);
        let (_registry, outbound, _cancel, _handle) = spawn_worker(&server, &config).await;
        outbound
            .send(Message::new("default", b"doomed".to_vec()))
            .await
            .unwrap();

        wait_for_requests(&server, 4).await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(server.received_requests().await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_drops_when_not_subscribed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/consume"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let (_registry, outbound, _cancel, _handle) = spawn_worker(&server, &test_config()).await;
        outbound
            .send(Message::new("deleted-run", b"stale".to_vec()))
            .await
            .unwrap();
        outbound
            .send(Message::new("default", b"fresh".to_vec()))
            .await
            .unwrap();

        let requests = wait_for_requests(&server, 1).await;
        assert_eq!(requests[0].body, b"fresh".to_vec());
    }

    #[tokio::test]
    async fn test_address_change_applies_to_queued_messages() {
        let old = MockServer::start().await;
        let new = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/consume"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&new)
            .await;

        let (registry, outbound, _cancel, _handle) = spawn_worker(&old, &test_config()).await;
        let updated = registry
            .write()
            .await
            .register("default", "2", &new.uri(), 4)
            .unwrap();
        assert!(matches!(updated, Registration::Updated));

        outbound
            .send(Message::new("default", b"moved".to_vec()))
            .await
            .unwrap();

        wait_for_requests(&new, 1).await;
        assert!(old.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_interrupts_backoff() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/consume"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let config = test_config().with_retry_backoff(Duration::from_secs(60));
        let (_registry, outbound, cancel, handle) = spawn_worker(&server, &config).await;
        outbound
            .send(Message::new("default", b"slow".to_vec()))
            .await
            .unwrap();
        wait_for_requests(&server, 1).await;

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("worker should stop while backing off")
            .unwrap();
        assert_eq!(server.received_requests().await.unwrap().len(), 1);
    }
}
