//! Result store
//!
//! Terminal outcome of each DKG run, keyed by hex request id. Operators push
//! results out of band; clients poll for them.

use crate::message::OperatorId;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Outcome of a DKG run
///
/// Signed outputs and blame are mutually exclusive. The store does not check
/// this; whoever writes is responsible for sending only one of them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunResult {
    /// Signed output of every operator
    DkgOutputs(BTreeMap<OperatorId, serde_json::Value>),
    /// Fault attribution for a failed run
    BlameOutput(serde_json::Value),
}

/// Stored result with the time it was written
#[derive(Debug, Clone, PartialEq)]
pub struct StoredResult {
    pub result: RunResult,
    pub recorded_at: DateTime<Utc>,
}

/// Result store
#[derive(Clone)]
pub struct ResultStore {
    results: Arc<DashMap<String, StoredResult>>,
    ttl: chrono::Duration,
}

impl ResultStore {
    /// Create a store whose entries expire after `ttl`
    pub fn new(ttl: Duration) -> Self {
        Self {
            results: Arc::new(DashMap::new()),
            ttl: chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX),
        }
    }

    /// Record a result; the last write wins
    pub fn put(&self, request_id: &str, result: RunResult) -> Option<StoredResult> {
        let stored = StoredResult {
            result,
            recorded_at: Utc::now(),
        };
        let previous = self.results.insert(request_id.to_string(), stored);
        if previous.is_some() {
            warn!(request_id, "overwriting existing run result");
        }
        previous
    }

    pub fn get(&self, request_id: &str) -> Option<StoredResult> {
        self.results
            .get(request_id)
            .map(|entry| entry.value().clone())
    }

    /// Drop expired results; returns how many were removed
    pub fn cleanup(&self) -> usize {
        let Some(cutoff) = Utc::now().checked_sub_signed(self.ttl) else {
            return 0;
        };
        let before = self.results.len();
        self.results.retain(|_, v| v.recorded_at > cutoff);
        let removed = before.saturating_sub(self.results.len());
        if removed > 0 {
            debug!(removed, "expired run results");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

impl Default for ResultStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(24 * 60 * 60))
    }
}
