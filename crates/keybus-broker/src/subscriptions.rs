// Exact-key and prefix subscription bookkeeping.
//
// Only the hub dispatcher task touches this structure, so it needs no
// internal locking. Entries are ordered multisets: the same client may
// subscribe to the same key several times and unsubscribing removes one
// occurrence at a time.
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Default)]
pub struct SubscriptionIndex {
    key_subs: HashMap<String, Vec<u64>>,
    prefix_subs: HashMap<String, Vec<u64>>,
}

impl SubscriptionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe_key(&mut self, uid: u64, key: &str) {
        self.key_subs.entry(key.to_string()).or_default().push(uid);
    }

    /// Removing an absent subscription is a silent no-op.
    pub fn unsubscribe_key(&mut self, uid: u64, key: &str) {
        remove_one(&mut self.key_subs, uid, key);
    }

    pub fn subscribe_prefix(&mut self, uid: u64, prefix: &str) {
        self.prefix_subs
            .entry(prefix.to_string())
            .or_default()
            .push(uid);
    }

    pub fn unsubscribe_prefix(&mut self, uid: u64, prefix: &str) {
        remove_one(&mut self.prefix_subs, uid, prefix);
    }

    /// Drop every occurrence of `uid` from both maps.
    pub fn unsubscribe_all(&mut self, uid: u64) {
        purge(&mut self.key_subs, uid);
        purge(&mut self.prefix_subs, uid);
    }

    /// Clients to notify for a change to `key`: its exact subscribers plus
    /// everyone holding a covering prefix. Deduplicated at read time; the
    /// empty prefix matches every key.
    pub fn subscribers(&self, key: &str) -> BTreeSet<u64> {
        let mut out = BTreeSet::new();
        if let Some(uids) = self.key_subs.get(key) {
            out.extend(uids.iter().copied());
        }
        for (prefix, uids) in &self.prefix_subs {
            if key.starts_with(prefix.as_str()) {
                out.extend(uids.iter().copied());
            }
        }
        out
    }

    pub fn has_subscriptions(&self, uid: u64) -> bool {
        self.key_subs.values().any(|uids| uids.contains(&uid))
            || self.prefix_subs.values().any(|uids| uids.contains(&uid))
    }
}

fn remove_one(map: &mut HashMap<String, Vec<u64>>, uid: u64, key: &str) {
    if let Some(uids) = map.get_mut(key) {
        if let Some(index) = uids.iter().position(|entry| *entry == uid) {
            uids.remove(index);
        }
        if uids.is_empty() {
            map.remove(key);
        }
    }
}

fn purge(map: &mut HashMap<String, Vec<u64>>, uid: u64) {
    map.retain(|_, uids| {
        uids.retain(|entry| *entry != uid);
        !uids.is_empty()
    });
}
