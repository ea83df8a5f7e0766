//! Subscription registry: topic filters, queue groups and delivery targets.

use crate::messaging::{MqttTopicMatcher, QueueSelector, TopicMatcher};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Registry-assigned, monotonically increasing; ordering by id is insertion order.
pub type SubscriptionId = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    session_id: u64,
    filter: String,
    group: Option<String>,
    identifier: Option<u32>,
    delivered: u64,
    max_deliveries: u64,
}

impl Entry {
    fn group_key(&self) -> Option<String> {
        self.group
            .as_ref()
            .map(|group| format!("{group}/{}", self.filter))
    }
}

/// One delivery chosen by [`SubscriptionRegistry::route`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTarget {
    pub session_id: u64,
    pub subscription_id: SubscriptionId,
    /// MQTT 5 subscription identifier supplied with the SUBSCRIBE, echoed on delivery.
    pub identifier: Option<u32>,
}

#[derive(Debug, Default)]
struct Inner {
    entries: BTreeMap<SubscriptionId, Entry>,
    by_filter: HashMap<String, Vec<SubscriptionId>>,
    by_session: HashMap<u64, Vec<SubscriptionId>>,
    /// Live members per queue group key.
    group_members: HashMap<String, usize>,
    selector: QueueSelector,
    next_id: SubscriptionId,
}

impl Inner {
    fn remove(&mut self, id: SubscriptionId) -> Option<Entry> {
        let entry = self.entries.remove(&id)?;
        if let Some(ids) = self.by_filter.get_mut(&entry.filter) {
            ids.retain(|other| *other != id);
            if ids.is_empty() {
                self.by_filter.remove(&entry.filter);
            }
        }
        if let Some(ids) = self.by_session.get_mut(&entry.session_id) {
            ids.retain(|other| *other != id);
            if ids.is_empty() {
                self.by_session.remove(&entry.session_id);
            }
        }
        if let Some(key) = entry.group_key() {
            let remaining = match self.group_members.get_mut(&key) {
                Some(members) => {
                    *members = members.saturating_sub(1);
                    *members
                }
                None => 0,
            };
            if remaining == 0 {
                self.group_members.remove(&key);
                self.selector.forget(&key);
            }
        }
        Some(entry)
    }
}

/// Process-wide index from topic filters to the sessions interested in them.
///
/// Lock order: callers holding the broker's session map lock may take this lock, never the
/// reverse.
pub struct SubscriptionRegistry {
    inner: Mutex<Inner>,
    matcher: Arc<dyn TopicMatcher>,
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new(Arc::new(MqttTopicMatcher))
    }
}

impl std::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("subscriptions", &self.count())
            .finish()
    }
}

impl SubscriptionRegistry {
    pub fn new(matcher: Arc<dyn TopicMatcher>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            matcher,
        }
    }

    /// Register `filter` for `session_id`. `max_deliveries` of 0 means unlimited.
    pub fn subscribe(
        &self,
        session_id: u64,
        filter: &str,
        queue_group: Option<&str>,
        max_deliveries: u64,
    ) -> SubscriptionId {
        self.subscribe_with_identifier(session_id, filter, queue_group, max_deliveries, None)
    }

    pub fn subscribe_with_identifier(
        &self,
        session_id: u64,
        filter: &str,
        queue_group: Option<&str>,
        max_deliveries: u64,
        identifier: Option<u32>,
    ) -> SubscriptionId {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        let entry = Entry {
            session_id,
            filter: filter.to_string(),
            group: queue_group.map(str::to_string),
            identifier,
            delivered: 0,
            max_deliveries,
        };
        if let Some(key) = entry.group_key() {
            *inner.group_members.entry(key).or_insert(0) += 1;
        }
        inner.entries.insert(id, entry);
        inner
            .by_filter
            .entry(filter.to_string())
            .or_default()
            .push(id);
        inner.by_session.entry(session_id).or_default().push(id);
        id
    }

    /// Remove one subscription. Unknown ids, or ids owned by another session, are ignored.
    pub fn unsubscribe(&self, session_id: u64, id: SubscriptionId) -> bool {
        let mut inner = self.inner.lock();
        match inner.entries.get(&id) {
            Some(entry) if entry.session_id == session_id => inner.remove(id).is_some(),
            _ => false,
        }
    }

    /// Drop every subscription of `session_id` in one locked pass; returns how many were removed.
    pub fn remove_session(&self, session_id: u64) -> usize {
        let mut inner = self.inner.lock();
        let Some(ids) = inner.by_session.remove(&session_id) else {
            return 0;
        };
        let mut removed = 0;
        for id in ids {
            if inner.remove(id).is_some() {
                removed += 1;
            }
        }
        removed
    }

    /// Delivery targets for a message published on `topic`: every plain match plus one
    /// member per matching queue group. Subscriptions that reach their delivery limit are
    /// removed before this returns.
    pub fn route(&self, topic: &str) -> Vec<RouteTarget> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let mut matched: Vec<SubscriptionId> = inner
            .by_filter
            .iter()
            .filter(|(filter, _)| self.matcher.matches(filter, topic))
            .flat_map(|(_, ids)| ids.iter().copied())
            .collect();
        matched.sort_unstable();

        let mut chosen = Vec::new();
        let mut groups: BTreeMap<String, Vec<SubscriptionId>> = BTreeMap::new();
        for id in matched {
            let Some(entry) = inner.entries.get(&id) else {
                continue;
            };
            match entry.group_key() {
                Some(key) => groups.entry(key).or_default().push(id),
                None => chosen.push(id),
            }
        }
        for (key, members) in &groups {
            if let Some(idx) = inner.selector.select(key, members.len()) {
                chosen.push(members[idx]);
            }
        }

        let mut targets = Vec::with_capacity(chosen.len());
        let mut exhausted = Vec::new();
        for id in chosen {
            let Some(entry) = inner.entries.get_mut(&id) else {
                continue;
            };
            entry.delivered += 1;
            targets.push(RouteTarget {
                session_id: entry.session_id,
                subscription_id: id,
                identifier: entry.identifier,
            });
            if entry.max_deliveries > 0 && entry.delivered >= entry.max_deliveries {
                exhausted.push(id);
            }
        }
        for id in exhausted {
            inner.remove(id);
        }
        targets
    }

    pub fn count(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Entries registered for exactly `filter` (group members included).
    pub fn count_for_filter(&self, filter: &str) -> usize {
        self.inner
            .lock()
            .by_filter
            .get(filter)
            .map_or(0, Vec::len)
    }

    pub fn count_for_session(&self, session_id: u64) -> usize {
        self.inner
            .lock()
            .by_session
            .get(&session_id)
            .map_or(0, Vec::len)
    }

    /// Sessions referenced by at least one entry.
    pub fn sessions(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.inner.lock().by_session.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Times a subscription has been chosen by `route`; `None` once it is gone.
    pub fn delivered(&self, id: SubscriptionId) -> Option<u64> {
        self.inner.lock().entries.get(&id).map(|e| e.delivered)
    }
}
