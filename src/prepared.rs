//! Cache of prepared statements, indexed both ways.

use std::collections::HashMap;
use std::sync::Mutex;

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::frame::request::QueryId;

/// Logical identity of a prepared statement, the SHA-256 digest of its
/// text. Distinct texts colliding on this key are treated as fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PrepKey([u8; 32]);

impl PrepKey {
    pub fn of(text: &str) -> Self {
        PrepKey(Sha256::digest(text.as_bytes()).into())
    }
}

/// A prepared statement handle as held by callers. Carries no
/// server-side state itself; the client resolves it against the cache
/// (and re-prepares) on every execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedQuery {
    text: String,
    key: PrepKey,
}

impl PreparedQuery {
    pub fn new(text: impl Into<String>) -> Self {
        let text = text.into();
        let key = PrepKey::of(&text);
        PreparedQuery { text, key }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub(crate) fn key(&self) -> PrepKey {
        self.key
    }
}

struct Entry {
    text: String,
    id: QueryId,
}

struct Maps {
    by_key: HashMap<PrepKey, Entry>,
    by_id: HashMap<QueryId, String>,
}

/// Bi-directional mapping between logical prepared queries and their
/// server-assigned ids, and between ids and the originating text. All
/// operations run under one lock so both indices stay consistent.
pub struct PreparedQueries {
    capacity: usize,
    maps: Mutex<Maps>,
}

impl PreparedQueries {
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::InvalidCacheSize);
        }
        Ok(PreparedQueries {
            capacity,
            maps: Mutex::new(Maps {
                by_key: HashMap::new(),
                by_id: HashMap::new(),
            }),
        })
    }

    /// Records a PREPARE result for `query`.
    pub fn insert(&self, query: &PreparedQuery, id: QueryId) -> Result<()> {
        let mut maps = self.maps.lock().unwrap();
        if let Some(entry) = maps.by_key.get(&query.key()) {
            if entry.text != query.text {
                return Err(Error::HashCollision(
                    entry.text.clone(),
                    query.text.clone(),
                ));
            }
            if entry.id != id {
                let stale = entry.id.clone();
                maps.by_id.remove(&stale);
            }
        } else if maps.by_key.len() >= self.capacity {
            // at capacity: drop an arbitrary entry to make room
            if let Some(key) = maps.by_key.keys().next().copied() {
                if let Some(evicted) = maps.by_key.remove(&key) {
                    maps.by_id.remove(&evicted.id);
                }
            }
        }
        maps.by_id.insert(id.clone(), query.text.clone());
        maps.by_key.insert(
            query.key(),
            Entry {
                text: query.text.clone(),
                id,
            },
        );
        Ok(())
    }

    /// Server-assigned id for `query`, if prepared before.
    pub fn lookup(&self, query: &PreparedQuery) -> Result<Option<QueryId>> {
        let maps = self.maps.lock().unwrap();
        match maps.by_key.get(&query.key()) {
            Some(entry) if entry.text == query.text => Ok(Some(entry.id.clone())),
            Some(entry) => Err(Error::HashCollision(
                entry.text.clone(),
                query.text.clone(),
            )),
            None => Ok(None),
        }
    }

    /// Original query text behind a server-assigned id; consulted when
    /// a host reports the id as unprepared.
    pub fn text_for(&self, id: &QueryId) -> Option<String> {
        self.maps.lock().unwrap().by_id.get(id).cloned()
    }

    /// Snapshot of all cached texts, for re-preparing against a host.
    pub fn all_texts(&self) -> Vec<String> {
        self.maps
            .lock()
            .unwrap()
            .by_key
            .values()
            .map(|e| e.text.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn id(byte: u8) -> QueryId {
        QueryId(Bytes::copy_from_slice(&[byte]))
    }

    #[test]
    fn insert_then_lookup_both_ways() {
        let cache = PreparedQueries::new(8).unwrap();
        let q = PreparedQuery::new("SELECT * FROM t WHERE k = ?");
        cache.insert(&q, id(1)).unwrap();

        assert_eq!(cache.lookup(&q).unwrap(), Some(id(1)));
        assert_eq!(cache.text_for(&id(1)).as_deref(), Some(q.text()));
        assert!(cache.text_for(&id(2)).is_none());
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(matches!(
            PreparedQueries::new(0),
            Err(Error::InvalidCacheSize)
        ));
    }

    #[test]
    fn eviction_keeps_both_indices_aligned() {
        let cache = PreparedQueries::new(1).unwrap();
        let a = PreparedQuery::new("SELECT a FROM t");
        let b = PreparedQuery::new("SELECT b FROM t");
        cache.insert(&a, id(1)).unwrap();
        cache.insert(&b, id(2)).unwrap();

        assert_eq!(cache.lookup(&b).unwrap(), Some(id(2)));
        assert_eq!(cache.lookup(&a).unwrap(), None);
        assert!(cache.text_for(&id(1)).is_none());
    }

    #[test]
    fn reinserting_the_same_query_updates_its_id() {
        let cache = PreparedQueries::new(4).unwrap();
        let q = PreparedQuery::new("SELECT a FROM t");
        cache.insert(&q, id(1)).unwrap();
        cache.insert(&q, id(7)).unwrap();
        assert_eq!(cache.lookup(&q).unwrap(), Some(id(7)));
    }
}
