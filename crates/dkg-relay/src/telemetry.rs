//! Relay metrics
//!
//! Recorded through the `metrics` facade. Nothing is kept unless the host
//! process installs a recorder; the service installs a Prometheus one.

use metrics::{counter, gauge};

pub const MESSAGES_PUBLISHED: &str = "dkg_relay_messages_published_total";
pub const MESSAGES_FANNED_OUT: &str = "dkg_relay_messages_fanned_out_total";
pub const MESSAGES_DELIVERED: &str = "dkg_relay_messages_delivered_total";
pub const DELIVERY_FAILURES: &str = "dkg_relay_delivery_failures_total";
pub const DELIVERY_RETRIES: &str = "dkg_relay_delivery_retries_total";
pub const MESSAGES_DROPPED: &str = "dkg_relay_messages_dropped_total";
pub const OUTBOUND_QUEUE_DEPTH: &str = "dkg_relay_outbound_queue_depth";

/// Why a message was abandoned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    UnknownTopic,
    Decode,
    RetriesExhausted,
    NotSubscribed,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::UnknownTopic => "unknown_topic",
            DropReason::Decode => "decode",
            DropReason::RetriesExhausted => "retries_exhausted",
            DropReason::NotSubscribed => "not_subscribed",
        }
    }
}

pub fn message_published() {
    counter!(MESSAGES_PUBLISHED).increment(1);
}

pub fn messages_fanned_out(copies: usize) {
    counter!(MESSAGES_FANNED_OUT).increment(copies as u64);
}

pub fn message_delivered() {
    counter!(MESSAGES_DELIVERED).increment(1);
}

pub fn delivery_failed() {
    counter!(DELIVERY_FAILURES).increment(1);
}

pub fn delivery_retried() {
    counter!(DELIVERY_RETRIES).increment(1);
}

pub fn message_dropped(reason: DropReason) {
    counter!(MESSAGES_DROPPED, "reason" => reason.as_str()).increment(1);
}

/// Messages waiting for a subscriber, backlog included
pub fn outbound_queue_depth(subscriber: &str, depth: usize) {
    gauge!(OUTBOUND_QUEUE_DEPTH, "subscriber" => subscriber.to_string()).set(depth as f64);
}
