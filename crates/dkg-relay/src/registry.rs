//! Topic registry
//!
//! Holds every topic and every registered subscriber. The whole registry sits
//! behind one `RwLock`; callers take the lock, do their bookkeeping and drop it
//! before touching a queue or the network.

use crate::message::Message;
use crate::{RelayError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

/// Registry shared between the HTTP handlers, the dispatcher and the workers
pub type SharedRegistry = Arc<RwLock<Registry>>;

/// Job id prefix for egress workers
const SUBSCRIBER_JOB_PREFIX: &str = "SUBSCRIBER__";

/// Runner job id of a subscriber's egress worker
pub fn subscriber_job_id(name: &str) -> String {
    format!("{SUBSCRIBER_JOB_PREFIX}{name}")
}

/// Registered operator node
#[derive(Debug)]
struct Subscriber {
    address: String,
    outbound: mpsc::Sender<Message>,
    topics: BTreeSet<String>,
    job_id: String,
    cancel: CancellationToken,
}

#[derive(Debug, Default)]
struct Topic {
    subscribers: BTreeSet<String>,
}

/// Serialisable view of a subscriber
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriberView {
    pub name: String,
    pub srv_addr: String,
}

/// Serialisable view of a topic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicView {
    pub topic_name: String,
    pub subscribers: Vec<SubscriberView>,
}

/// Everything needed to start a new subscriber's egress worker
#[derive(Debug)]
pub struct NewSubscriber {
    pub name: String,
    pub job_id: String,
    pub inbox: mpsc::Receiver<Message>,
    pub outbound: mpsc::Sender<Message>,
    pub cancel: CancellationToken,
}

/// Outcome of a node registration
#[derive(Debug)]
pub enum Registration {
    /// First registration; a worker must be started
    Created(NewSubscriber),
    /// Known subscriber joined another topic, address refreshed
    Joined,
    /// Already a member of the topic, address refreshed
    Updated,
}

/// Subscriber removed from the registry whose worker must stop
#[derive(Debug, Clone)]
pub struct Retired {
    pub name: String,
    pub job_id: String,
    pub cancel: CancellationToken,
}

impl Retired {
    /// Stop the subscriber's worker
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// Where an egress worker should send a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryTarget {
    /// Subscriber is still on the topic; POST to this address
    Deliver(String),
    /// Subscriber left the topic, or the topic is gone
    NotSubscribed,
    /// Subscriber no longer exists
    Retired,
}

/// In-memory directory of topics and subscribers
#[derive(Debug)]
pub struct Registry {
    default_topic: String,
    topics: BTreeMap<String, Topic>,
    subscribers: BTreeMap<String, Subscriber>,
}

impl Registry {
    /// Create a registry holding only the default topic
    pub fn new(default_topic: &str) -> Self {
        let mut topics = BTreeMap::new();
        topics.insert(default_topic.to_string(), Topic::default());
        Self {
            default_topic: default_topic.to_string(),
            topics,
            subscribers: BTreeMap::new(),
        }
    }

    /// Wrap for sharing
    pub fn shared(self) -> SharedRegistry {
        Arc::new(RwLock::new(self))
    }

    /// Create or replace a topic
    ///
    /// Members are the requested names that are already on the default topic.
    /// Replacing a topic unlinks its previous members first; any subscriber left
    /// without a topic is retired and returned.
    pub fn create_or_update_topic(
        &mut self,
        name: &str,
        subscriber_names: &[String],
    ) -> Result<(TopicView, Vec<Retired>)> {
        if name.is_empty() {
            return Err(RelayError::InvalidRequest("empty topic name".to_string()));
        }
        if name == self.default_topic {
            return Err(RelayError::InvalidRequest(format!(
                "topic {name} cannot be recreated"
            )));
        }

        let members: BTreeSet<String> = {
            let default = self
                .topics
                .get(&self.default_topic)
                .ok_or_else(|| RelayError::TopicNotFound(self.default_topic.clone()))?;
            subscriber_names
                .iter()
                .filter(|s| default.subscribers.contains(*s))
                .cloned()
                .collect()
        };

        let previous = self.topics.remove(name).unwrap_or_default();
        for member in &members {
            if let Some(sub) = self.subscribers.get_mut(member) {
                sub.topics.insert(name.to_string());
            }
        }
        self.topics.insert(
            name.to_string(),
            Topic {
                subscribers: members.clone(),
            },
        );

        let dropped: Vec<String> = previous
            .subscribers
            .difference(&members)
            .cloned()
            .collect();
        let retired = self.unlink(name, dropped);

        let view = self.view(name).ok_or_else(|| RelayError::TopicNotFound(name.to_string()))?;
        Ok((view, retired))
    }

    /// Snapshot of one topic
    pub fn topic(&self, name: &str) -> Option<TopicView> {
        self.view(name)
    }

    /// Snapshot of every topic
    pub fn topics(&self) -> Vec<TopicView> {
        self.topics.keys().filter_map(|name| self.view(name)).collect()
    }

    /// Remove a topic
    ///
    /// Messages already queued for its members stay queued; workers drop them
    /// when they find the membership gone.
    pub fn delete_topic(&mut self, name: &str) -> Result<Vec<Retired>> {
        if name == self.default_topic {
            return Err(RelayError::InvalidRequest(format!(
                "topic {name} cannot be deleted"
            )));
        }
        let topic = self
            .topics
            .remove(name)
            .ok_or_else(|| RelayError::TopicNotFound(name.to_string()))?;

        Ok(self.unlink(name, topic.subscribers.into_iter().collect()))
    }

    /// Register a node on a topic
    pub fn register(
        &mut self,
        topic_name: &str,
        name: &str,
        address: &str,
        outbound_capacity: usize,
    ) -> Result<Registration> {
        if name.is_empty() || address.is_empty() {
            return Err(RelayError::InvalidRequest(format!(
                "empty name {name:?} or subscriber's address {address:?}"
            )));
        }
        let topic = self
            .topics
            .get_mut(topic_name)
            .ok_or_else(|| RelayError::TopicNotFound(topic_name.to_string()))?;

        if let Some(sub) = self.subscribers.get_mut(name) {
            sub.address = address.to_string();
            if topic.subscribers.insert(name.to_string()) {
                sub.topics.insert(topic_name.to_string());
                return Ok(Registration::Joined);
            }
            return Ok(Registration::Updated);
        }

        let (outbound, inbox) = mpsc::channel(outbound_capacity.max(1));
        let job_id = subscriber_job_id(name);
        let cancel = CancellationToken::new();

        topic.subscribers.insert(name.to_string());
        self.subscribers.insert(
            name.to_string(),
            Subscriber {
                address: address.to_string(),
                outbound: outbound.clone(),
                topics: BTreeSet::from([topic_name.to_string()]),
                job_id: job_id.clone(),
                cancel: cancel.clone(),
            },
        );

        Ok(Registration::Created(NewSubscriber {
            name: name.to_string(),
            job_id,
            inbox,
            outbound,
            cancel,
        }))
    }

    /// Remove a subscriber from every topic
    pub fn unregister(&mut self, name: &str) -> Option<Retired> {
        let sub = self.subscribers.remove(name)?;
        for topic in sub.topics.iter() {
            if let Some(t) = self.topics.get_mut(topic) {
                t.subscribers.remove(name);
            }
        }
        Some(Retired {
            name: name.to_string(),
            job_id: sub.job_id,
            cancel: sub.cancel,
        })
    }

    /// Outbound queues of a topic's members, in name order
    pub fn fan_out_targets(&self, topic: &str) -> Option<Vec<(String, mpsc::Sender<Message>)>> {
        let topic = self.topics.get(topic)?;
        Some(
            topic
                .subscribers
                .iter()
                .filter_map(|name| {
                    self.subscribers
                        .get(name)
                        .map(|sub| (name.clone(), sub.outbound.clone()))
                })
                .collect(),
        )
    }

    /// Resolve where a subscriber's copy of a message should go
    pub fn delivery_target(&self, name: &str, topic: &str) -> DeliveryTarget {
        match self.subscribers.get(name) {
            None => DeliveryTarget::Retired,
            Some(sub) if sub.topics.contains(topic) => DeliveryTarget::Deliver(sub.address.clone()),
            Some(_) => DeliveryTarget::NotSubscribed,
        }
    }

    fn unlink(&mut self, topic: &str, names: Vec<String>) -> Vec<Retired> {
        let mut orphans = Vec::new();
        for name in names {
            if let Some(sub) = self.subscribers.get_mut(&name) {
                sub.topics.remove(topic);
                if sub.topics.is_empty() {
                    orphans.push(name);
                }
            }
        }
        orphans
            .iter()
            .filter_map(|name| self.unregister(name))
            .collect()
    }

    fn view(&self, name: &str) -> Option<TopicView> {
        let topic = self.topics.get(name)?;
        Some(TopicView {
            topic_name: name.to_string(),
            subscribers: topic
                .subscribers
                .iter()
                .filter_map(|sub| {
                    self.subscribers.get(sub).map(|s| SubscriberView {
                        name: sub.clone(),
                        srv_addr: s.address.clone(),
                    })
                })
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn registry_with(nodes: &[&str]) -> Registry {
        let mut registry = Registry::new("default");
        for node in nodes {
            registry
                .register("default", node, &format!("http://{node}"), 4)
                .unwrap();
        }
        registry
    }

    #[test]
    fn test_register_creates_once() {
        let mut registry = Registry::new("default");

        let first = registry.register("default", "1", "http://a", 4).unwrap();
        assert!(matches!(first, Registration::Created(ref s) if s.job_id == "SUBSCRIBER__1"));

        let second = registry.register("default", "1", "http://b", 4).unwrap();
        assert!(matches!(second, Registration::Updated));
        assert_eq!(registry.subscriber_count(), 1);
        assert_eq!(
            registry.delivery_target("1", "default"),
            DeliveryTarget::Deliver("http://b".to_string())
        );
    }

    #[test]
    fn test_register_validation() {
        let mut registry = Registry::new("default");

        assert!(matches!(
            registry.register("missing", "1", "http://a", 4),
            Err(RelayError::TopicNotFound(_))
        ));
        assert!(matches!(
            registry.register("default", "", "http://a", 4),
            Err(RelayError::InvalidRequest(_))
        ));
        assert!(matches!(
            registry.register("default", "1", "", 4),
            Err(RelayError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_topic_membership_is_intersection_with_default() {
        let mut registry = registry_with(&["1", "2", "3"]);

        let (view, retired) = registry
            .create_or_update_topic("abc123", &names(&["1", "3", "9"]))
            .unwrap();

        assert!(retired.is_empty());
        let members: Vec<_> = view.subscribers.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(members, vec!["1", "3"]);
        assert_eq!(
            registry.delivery_target("2", "abc123"),
            DeliveryTarget::NotSubscribed
        );
    }

    #[test]
    fn test_recreate_topic_replaces_members() {
        let mut registry = registry_with(&["1", "2", "3"]);
        registry
            .create_or_update_topic("run", &names(&["1", "2"]))
            .unwrap();

        let (view, retired) = registry
            .create_or_update_topic("run", &names(&["2", "3"]))
            .unwrap();

        assert!(retired.is_empty());
        assert_eq!(view.subscribers.len(), 2);
        assert_eq!(registry.delivery_target("1", "run"), DeliveryTarget::NotSubscribed);
        assert!(matches!(
            registry.delivery_target("3", "run"),
            DeliveryTarget::Deliver(_)
        ));
        assert_eq!(registry.topics().len(), 2);
    }

    #[test]
    fn test_default_topic_cannot_be_recreated() {
        let mut registry = registry_with(&["1", "2"]);

        assert!(matches!(
            registry.create_or_update_topic("default", &names(&["1"])),
            Err(RelayError::InvalidRequest(_))
        ));
        assert_eq!(registry.subscriber_count(), 2);
        let members: Vec<_> = registry
            .topic("default")
            .unwrap()
            .subscribers
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(members, names(&["1", "2"]));
    }

    #[test]
    fn test_delete_topic_retires_orphans() {
        let mut registry = registry_with(&["1"]);
        registry.register_orphan_topic("side", "7");

        let retired = registry.delete_topic("side").unwrap();
        assert_eq!(retired.len(), 1);
        assert_eq!(retired[0].name, "7");
        assert_eq!(registry.delivery_target("7", "side"), DeliveryTarget::Retired);

        assert!(matches!(
            registry.delete_topic("side"),
            Err(RelayError::TopicNotFound(_))
        ));
        assert!(matches!(
            registry.delete_topic("default"),
            Err(RelayError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_delete_topic_keeps_default_members() {
        let mut registry = registry_with(&["1", "2"]);
        registry
            .create_or_update_topic("run", &names(&["1", "2"]))
            .unwrap();

        let retired = registry.delete_topic("run").unwrap();
        assert!(retired.is_empty());
        assert_eq!(registry.subscriber_count(), 2);
        assert!(registry.topic("run").is_none());
        assert_eq!(registry.delivery_target("1", "run"), DeliveryTarget::NotSubscribed);
    }

    #[test]
    fn test_unregister_removes_everywhere() {
        let mut registry = registry_with(&["1", "2"]);
        registry
            .create_or_update_topic("run", &names(&["1", "2"]))
            .unwrap();

        let retired = registry.unregister("1").unwrap();
        assert_eq!(retired.job_id, "SUBSCRIBER__1");
        assert!(registry.unregister("1").is_none());

        let targets = registry.fan_out_targets("run").unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].0, "2");
    }

    impl Registry {
        fn subscriber_count(&self) -> usize {
            self.subscribers.len()
        }

        fn register_orphan_topic(&mut self, topic: &str, node: &str) {
            self.topics.insert(topic.to_string(), Topic::default());
            self.register(topic, node, "http://orphan", 4).unwrap();
        }
    }
}
