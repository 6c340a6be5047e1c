//! In-memory value store, bounded by keys (LRU) and values per key.

use std::collections::HashMap;
use std::num::NonZeroUsize;

use lru::LruCache;
use tracing::trace;

use crate::common::{Id, Value, ValueError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Successful outcome of [ValueStore::put].
pub enum StoreOutcome {
    /// A new value under this key.
    Inserted,
    /// The same value was already stored, its expiry may have been extended.
    Refreshed,
}

#[derive(Debug)]
/// Values stored under keys, validated before insertion.
pub struct ValueStore {
    values: LruCache<Id, Vec<Value>>,
    /// Values put by this node, kept for republishing even if evicted from `values`.
    local: HashMap<Id, Vec<Value>>,
    max_values_per_key: usize,
}

impl ValueStore {
    pub fn new(max_keys: usize, max_values_per_key: usize) -> Self {
        Self {
            values: LruCache::new(NonZeroUsize::new(max_keys).unwrap_or(NonZeroUsize::MIN)),
            local: HashMap::new(),
            max_values_per_key: max_values_per_key.max(1),
        }
    }

    // === Getters ===

    /// Number of keys with stored values.
    pub fn keys(&self) -> usize {
        self.values.len()
    }

    /// Total number of stored values.
    pub fn len(&self) -> usize {
        self.values.iter().map(|(_, values)| values.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    // === Public Methods ===

    /// Validate and store a value at unix time `now`.
    ///
    /// A value with the same id but different content is rejected with [ValueError::Conflict].
    pub fn put(&mut self, key: Id, value: Value, now: u64) -> Result<StoreOutcome, ValueError> {
        value.validate(now)?;

        let max_values_per_key = self.max_values_per_key;
        let values = self.values.get_or_insert_mut(key, Vec::new);

        if let Some(existing) = values.iter_mut().find(|v| v.id() == value.id()) {
            if !existing.same_content(&value) {
                return Err(ValueError::Conflict);
            }

            if value.expires() > existing.expires() {
                *existing = value;
            }

            return Ok(StoreOutcome::Refreshed);
        }

        values.push(value);

        if values.len() > max_values_per_key {
            // Drop the value expiring soonest.
            if let Some(position) = values
                .iter()
                .enumerate()
                .min_by_key(|(_, v)| v.expires())
                .map(|(i, _)| i)
            {
                let dropped = values.remove(position);
                trace!(?key, id = dropped.id(), "Too many values for key, dropped one");
            }
        }

        Ok(StoreOutcome::Inserted)
    }

    /// Store a value put by this node, and remember it for republishing.
    pub fn put_local(&mut self, key: Id, value: Value, now: u64) -> Result<StoreOutcome, ValueError> {
        let outcome = self.put(key, value.clone(), now)?;

        let local = self.local.entry(key).or_default();
        match local.iter_mut().find(|v| v.id() == value.id()) {
            Some(existing) => *existing = value,
            None => local.push(value),
        }

        Ok(outcome)
    }

    /// Non-expired values under `key`, newest first, optionally filtered by user type.
    pub fn get(&mut self, key: &Id, now: u64, user_type: Option<&str>) -> Vec<Value> {
        let mut values: Vec<Value> = self
            .values
            .get(key)
            .map(|values| {
                values
                    .iter()
                    .filter(|v| !v.is_expired(now))
                    .filter(|v| user_type.map_or(true, |t| v.user_type() == t))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        values.sort_by(|a, b| b.created().cmp(&a.created()).then(a.id().cmp(&b.id())));

        values
    }

    /// Remove all values whose expiry time has passed, returning how many were removed.
    pub fn expire_sweep(&mut self, now: u64) -> usize {
        let mut removed = 0;
        let mut empty = vec![];

        for (key, values) in self.values.iter_mut() {
            let before = values.len();
            values.retain(|v| !v.is_expired(now));
            removed += before - values.len();

            if values.is_empty() {
                empty.push(*key);
            }
        }

        for key in empty {
            self.values.pop(&key);
        }

        // Our own values are renewed on republish, others' are dropped once they expire.
        self.local.retain(|_, values| {
            values.retain(|v| !v.is_expired(now));
            !values.is_empty()
        });

        removed
    }

    /// Values put by this node, to be republished.
    pub fn local_values(&self) -> Vec<(Id, Value)> {
        self.local
            .iter()
            .flat_map(|(key, values)| values.iter().map(|v| (*key, v.clone())))
            .collect()
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use bytes::Bytes;
    use ed25519_dalek::SigningKey;

    use super::*;
    use crate::common::unix_now;

    const TTL: Duration = Duration::from_secs(600);

    fn store() -> ValueStore {
        ValueStore::new(16, 4)
    }

    #[test]
    fn put_then_get_signed_value() {
        let mut store = store();
        let key = Id::from_key("k");
        let value = Value::text("v", TTL).sign(&SigningKey::from_bytes(&[1; 32]));

        assert_eq!(store.put(key, value.clone(), unix_now()), Ok(StoreOutcome::Inserted));

        let values = store.get(&key, unix_now(), None);
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].id(), value.id());
        assert_eq!(values[0].data(), value.data());
    }

    #[test]
    fn tampered_value_is_rejected() {
        let mut store = store();
        let key = Id::from_key("k");
        let value = Value::text("v", TTL).sign(&SigningKey::from_bytes(&[1; 32]));

        let tampered = Value::from_parts(
            value.id(),
            value.owner().copied(),
            value.signature().copied(),
            Bytes::from_static(b"forged"),
            value.user_type().to_string(),
            value.created(),
            value.expires(),
        );

        assert_eq!(
            store.put(key, tampered, unix_now()),
            Err(ValueError::InvalidSignature)
        );
        assert!(store.get(&key, unix_now(), None).is_empty());
    }

    #[test]
    fn same_value_twice_is_idempotent() {
        let mut store = store();
        let key = Id::from_key("k");
        let value = Value::text("v", TTL);

        store.put(key, value.clone(), unix_now()).unwrap();
        assert_eq!(store.put(key, value, unix_now()), Ok(StoreOutcome::Refreshed));

        assert_eq!(store.len(), 1);
    }

    #[test]
    fn conflicting_value_is_rejected() {
        let mut store = store();
        let key = Id::from_key("k");
        let value = Value::text("v", TTL);

        store.put(key, value.clone(), unix_now()).unwrap();

        let conflicting = Value::from_parts(
            value.id(),
            None,
            None,
            Bytes::from_static(b"w"),
            value.user_type().to_string(),
            value.created(),
            value.expires(),
        );

        assert_eq!(
            store.put(key, conflicting, unix_now()),
            Err(ValueError::Conflict)
        );
        assert_eq!(
            store.get(&key, unix_now(), None)[0].data(),
            &Bytes::from_static(b"v")
        );
    }

    #[test]
    fn refresh_extends_expiry() {
        let mut store = store();
        let key = Id::from_key("k");
        let value = Value::text("v", Duration::from_secs(10));
        let renewed = value.renewed(TTL, None);

        store.put(key, value.clone(), unix_now()).unwrap();
        store.put(key, renewed.clone(), unix_now()).unwrap();

        assert_eq!(store.get(&key, unix_now(), None)[0].expires(), renewed.expires());
    }

    #[test]
    fn expire_sweep() {
        let mut store = store();
        let key = Id::from_key("k");

        let short = Value::text("short", Duration::from_secs(10));
        let long = Value::text("long", TTL);

        store.put(key, short.clone(), unix_now()).unwrap();
        store.put(key, long, unix_now()).unwrap();

        let later = short.expires();
        assert_eq!(store.get(&key, later, None).len(), 1);

        assert_eq!(store.expire_sweep(later), 1);
        assert_eq!(store.len(), 1);

        assert_eq!(store.expire_sweep(later + TTL.as_secs()), 1);
        assert!(store.is_empty());
    }

    #[test]
    fn get_filters_by_user_type_newest_first() {
        let mut store = store();
        let key = Id::from_key("k");

        let older = Value::from_parts(1, None, None, Bytes::from_static(b"a"), "text/plain".into(), 100, u64::MAX / 2);
        let newer = Value::from_parts(2, None, None, Bytes::from_static(b"b"), "text/plain".into(), 200, u64::MAX / 2);
        let other = Value::from_parts(3, None, None, Bytes::from_static(b"{}"), "application/json".into(), 300, u64::MAX / 2);

        for value in [older, newer, other] {
            store.put(key, value, 150).unwrap();
        }

        let ids: Vec<u64> = store.get(&key, 150, None).iter().map(|v| v.id()).collect();
        assert_eq!(ids, vec![3, 2, 1]);

        let ids: Vec<u64> = store
            .get(&key, 150, Some("text/plain"))
            .iter()
            .map(|v| v.id())
            .collect();
        assert_eq!(ids, vec![2, 1]);
    }

    #[test]
    fn bounded_values_per_key() {
        let mut store = store();
        let key = Id::from_key("k");

        for _ in 0..6 {
            store.put(key, Value::text("v", TTL), unix_now()).unwrap();
        }

        assert_eq!(store.len(), 4);
    }

    #[test]
    fn bounded_keys() {
        let mut store = ValueStore::new(2, 4);

        for key in ["a", "b", "c"] {
            store
                .put(Id::from_key(key), Value::text("v", TTL), unix_now())
                .unwrap();
        }

        assert_eq!(store.keys(), 2);
        assert!(store.get(&Id::from_key("a"), unix_now(), None).is_empty());
    }

    #[test]
    fn local_values_survive_eviction() {
        let mut store = ValueStore::new(1, 4);

        store
            .put_local(Id::from_key("mine"), Value::text("v", TTL), unix_now())
            .unwrap();
        store
            .put(Id::from_key("theirs"), Value::text("v", TTL), unix_now())
            .unwrap();

        assert_eq!(store.local_values().len(), 1);
        assert_eq!(store.local_values()[0].0, Id::from_key("mine"));
    }
}
