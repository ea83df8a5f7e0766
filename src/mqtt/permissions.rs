//! Publish permission cache owned by a session task.

use crate::config::PERMISSION_PRUNE_BATCH;
use crate::security::{Action, PolicyEvaluator, SessionIdentity};
use std::collections::{HashMap, VecDeque};

/// Per-session memo of publish authorization decisions.
///
/// Entries are evicted by insertion order, `PERMISSION_PRUNE_BATCH` at a time once the map
/// grows past its capacity. Hits never refresh an entry. The cache is owned by one session
/// task and is therefore unsynchronized.
#[derive(Debug)]
pub struct PermissionCache {
    capacity: usize,
    decisions: HashMap<String, bool>,
    order: VecDeque<String>,
    hits: u64,
    misses: u64,
}

impl PermissionCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            decisions: HashMap::with_capacity(capacity + 1),
            order: VecDeque::with_capacity(capacity + 1),
            hits: 0,
            misses: 0,
        }
    }

    /// Decide whether `identity` may publish to `topic`, consulting `policy` on a miss.
    pub fn authorize(
        &mut self,
        policy: &dyn PolicyEvaluator,
        identity: &SessionIdentity,
        topic: &str,
    ) -> bool {
        if let Some(allowed) = self.decisions.get(topic) {
            self.hits += 1;
            return *allowed;
        }
        self.misses += 1;
        let allowed = policy.evaluate(identity, topic, Action::Publish);
        self.insert(topic.to_string(), allowed);
        allowed
    }

    fn insert(&mut self, topic: String, allowed: bool) {
        self.order.push_back(topic.clone());
        self.decisions.insert(topic, allowed);
        if self.decisions.len() > self.capacity {
            self.prune();
        }
    }

    fn prune(&mut self) {
        for _ in 0..PERMISSION_PRUNE_BATCH {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.decisions.remove(&oldest);
        }
    }

    pub fn len(&self) -> usize {
        self.decisions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decisions.is_empty()
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.decisions.contains_key(topic)
    }

    /// (hits, misses) since the session started.
    pub fn counters(&self) -> (u64, u64) {
        (self.hits, self.misses)
    }
}
