//! Incoming dispatcher
//!
//! Single consumer of the shared inbound queue. Each message is routed to
//! every member of its topic except the operator that signed it. Sends to a
//! full subscriber queue wait, so one slow subscriber holds up the fan-out of
//! every message behind it.

use crate::message::{decode_route, Message};
use crate::registry::SharedRegistry;
use crate::telemetry::{self, DropReason};
use crate::RelayError;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct Dispatcher {
    inbound: mpsc::Receiver<Message>,
    registry: SharedRegistry,
}

impl Dispatcher {
    pub fn new(inbound: mpsc::Receiver<Message>, registry: SharedRegistry) -> Self {
        Self { inbound, registry }
    }

    /// Drain the inbound queue until cancelled or every publisher is gone
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("dispatcher started");

        loop {
            let msg = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                msg = self.inbound.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };
            self.dispatch(msg, &cancel).await;
        }

        info!("dispatcher stopped");
    }

    /// Fan one message out; returns the number of copies queued
    pub async fn dispatch(&self, msg: Message, cancel: &CancellationToken) -> usize {
        let targets = self.registry.read().await.fan_out_targets(&msg.topic);
        let Some(targets) = targets else {
            error!(
                topic = %msg.topic,
                "dropping message: {}",
                RelayError::TopicNotFound(msg.topic.clone())
            );
            telemetry::message_dropped(DropReason::UnknownTopic);
            return 0;
        };

        let route = match decode_route(&msg.payload) {
            Ok(route) => route,
            Err(e) => {
                error!(topic = %msg.topic, error = %e, "dropping message");
                telemetry::message_dropped(DropReason::Decode);
                return 0;
            }
        };
        debug!(
            topic = %msg.topic,
            sender = route.sender,
            round = ?route.round,
            "received message"
        );

        let sender = route.sender_name();
        let mut queued = 0;
        for (name, queue) in targets {
            if name == sender {
                continue;
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                sent = queue.send(msg.clone()) => match sent {
                    Ok(()) => {
                        queued += 1;
                        telemetry::outbound_queue_depth(&name, queue.max_capacity() - queue.capacity());
                    }
                    Err(_) => warn!(topic = %msg.topic, subscriber = %name, "subscriber queue closed"),
                },
            }
        }
        telemetry::messages_fanned_out(queued);
        queued
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{DkgMessage, SignedMessage};
    use crate::registry::{Registration, Registry};

    fn envelope(signer: u64) -> Vec<u8> {
        SignedMessage {
            message: DkgMessage {
                msg_type: 0,
                identifier: vec![0xab, 0xc1, 0x23],
                data: b"{\"Round\":1}".to_vec(),
            },
            signer,
            signature: Vec::new(),
        }
        .to_envelope()
        .unwrap()
    }

    async fn setup(nodes: &[&str]) -> (Dispatcher, Vec<(String, mpsc::Receiver<Message>)>) {
        let registry = Registry::new("default").shared();
        let mut inboxes = Vec::new();
        {
            let mut reg = registry.write().await;
            for node in nodes {
                if let Registration::Created(new) =
                    reg.register("default", node, "http://unused", 8).unwrap()
                {
                    inboxes.push((new.name, new.inbox));
                }
            }
            let names: Vec<String> = nodes.iter().map(|s| s.to_string()).collect();
            reg.create_or_update_topic("abc123", &names).unwrap();
        }
        let (_tx, rx) = mpsc::channel(1);
        (Dispatcher::new(rx, registry), inboxes)
    }

    #[tokio::test]
    async fn test_fan_out_skips_sender() {
        let (dispatcher, mut inboxes) = setup(&["1", "2", "3"]).await;
        let payload = envelope(1);

        let queued = dispatcher
            .dispatch(Message::new("abc123", payload.clone()), &CancellationToken::new())
            .await;
        assert_eq!(queued, 2);

        for (name, inbox) in inboxes.iter_mut() {
            match name.as_str() {
                "1" => assert!(inbox.try_recv().is_err()),
                _ => {
                    let msg = inbox.try_recv().unwrap();
                    assert_eq!(msg.payload, payload);
                    assert_eq!(msg.topic, "abc123");
                    assert!(inbox.try_recv().is_err());
                }
            }
        }
    }

    #[tokio::test]
    async fn test_unknown_topic_dropped() {
        let (dispatcher, mut inboxes) = setup(&["1", "2"]).await;

        let queued = dispatcher
            .dispatch(Message::new("nope", envelope(1)), &CancellationToken::new())
            .await;
        assert_eq!(queued, 0);
        assert!(inboxes.iter_mut().all(|(_, inbox)| inbox.try_recv().is_err()));
    }

    #[tokio::test]
    async fn test_undecodable_dropped() {
        let (dispatcher, mut inboxes) = setup(&["1", "2"]).await;

        let queued = dispatcher
            .dispatch(Message::new("abc123", b"garbage".to_vec()), &CancellationToken::new())
            .await;
        assert_eq!(queued, 0);
        assert!(inboxes.iter_mut().all(|(_, inbox)| inbox.try_recv().is_err()));
    }

    #[tokio::test]
    async fn test_sender_outside_topic_reaches_everyone() {
        let (dispatcher, _inboxes) = setup(&["1", "2", "3"]).await;

        let queued = dispatcher
            .dispatch(Message::new("abc123", envelope(9)), &CancellationToken::new())
            .await;
        assert_eq!(queued, 3);
    }
}
