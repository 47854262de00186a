// # KV / pub-sub substrate (§6 "KV/pub-sub substrate (consumed)")
//
// Trait boundary for the external key-value store and pub/sub channel the
// engine is specified against but does not implement. `InMemoryKvStore` is
// the reference implementation used by tests and by `bin/server.rs` when
// no external store is configured, grounded on the teacher's
// `common::concurrent_map` sharded-map pattern generalized to the small
// fixed operation set the spec requires (get/set/incr/sets/sorted
// sets/hashes/pub-sub).

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::error::Result;

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;
    async fn del(&self, key: &str) -> Result<()>;
    async fn incr(&self, key: &str) -> Result<i64>;
    async fn keys(&self, prefix: &str) -> Result<Vec<String>>;

    async fn sadd(&self, key: &str, member: &str) -> Result<()>;
    async fn srem(&self, key: &str, member: &str) -> Result<()>;
    async fn smembers(&self, key: &str) -> Result<HashSet<String>>;
    async fn sismember(&self, key: &str, member: &str) -> Result<bool>;

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()>;
    async fn zrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>>;
    async fn zrangebyscore(&self, key: &str, min: f64, max: f64) -> Result<Vec<String>>;
    async fn zrem(&self, key: &str, member: &str) -> Result<()>;
    async fn zcard(&self, key: &str) -> Result<u64>;

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()>;
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>>;
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>>;
    async fn hdel(&self, key: &str, field: &str) -> Result<()>;

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<()>;
    async fn subscribe(&self, channel: &str) -> Result<broadcast::Receiver<Vec<u8>>>;
}

#[derive(Default)]
struct ZSet {
    scores: BTreeMap<String, f64>,
}

impl ZSet {
    fn sorted(&self) -> Vec<(String, f64)> {
        let mut entries: Vec<_> = self.scores.iter().map(|(m, s)| (m.clone(), *s)).collect();
        entries.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap().then_with(|| a.0.cmp(&b.0)));
        entries
    }
}

/// Reference KV/pub-sub implementation: every structure is process-local
/// and non-persistent, matching the spec's "no multi-key transactions
/// required" and "atomicity of single ops is assumed" contract.
pub struct InMemoryKvStore {
    strings: DashMap<String, String>,
    sets: DashMap<String, HashSet<String>>,
    zsets: DashMap<String, ZSet>,
    hashes: DashMap<String, HashMap<String, String>>,
    channels: DashMap<String, broadcast::Sender<Vec<u8>>>,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self {
            strings: DashMap::new(),
            sets: DashMap::new(),
            zsets: DashMap::new(),
            hashes: DashMap::new(),
            channels: DashMap::new(),
        }
    }

    fn channel(&self, name: &str) -> broadcast::Sender<Vec<u8>> {
        self.channels
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(1024).0)
            .clone()
    }
}

impl Default for InMemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.strings.get(key).map(|v| v.clone()))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.strings.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.strings.remove(key);
        self.sets.remove(key);
        self.zsets.remove(key);
        self.hashes.remove(key);
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let mut entry = self.strings.entry(key.to_string()).or_insert_with(|| "0".to_string());
        let next = entry.parse::<i64>().unwrap_or(0) + 1;
        *entry = next.to_string();
        Ok(next)
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .strings
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|k| k.starts_with(prefix))
            .collect())
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        self.sets.entry(key.to_string()).or_default().insert(member.to_string());
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> Result<()> {
        if let Some(mut set) = self.sets.get_mut(key) {
            set.remove(member);
        }
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<HashSet<String>> {
        Ok(self.sets.get(key).map(|set| set.clone()).unwrap_or_default())
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool> {
        Ok(self.sets.get(key).map(|set| set.contains(member)).unwrap_or(false))
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        self.zsets
            .entry(key.to_string())
            .or_default()
            .scores
            .insert(member.to_string(), score);
        Ok(())
    }

    async fn zrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        let Some(zset) = self.zsets.get(key) else {
            return Ok(Vec::new());
        };
        let sorted = zset.sorted();
        let len = sorted.len() as isize;
        let normalize = |i: isize| -> isize {
            if i < 0 {
                (len + i).max(0)
            } else {
                i.min(len)
            }
        };
        let start = normalize(start) as usize;
        let stop = (normalize(stop) + 1).max(0) as usize;
        Ok(sorted
            .into_iter()
            .skip(start)
            .take(stop.saturating_sub(start))
            .map(|(m, _)| m)
            .collect())
    }

    async fn zrangebyscore(&self, key: &str, min: f64, max: f64) -> Result<Vec<String>> {
        let Some(zset) = self.zsets.get(key) else {
            return Ok(Vec::new());
        };
        Ok(zset
            .sorted()
            .into_iter()
            .filter(|(_, score)| *score >= min && *score <= max)
            .map(|(m, _)| m)
            .collect())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<()> {
        if let Some(mut zset) = self.zsets.get_mut(key) {
            zset.scores.remove(member);
        }
        Ok(())
    }

    async fn zcard(&self, key: &str) -> Result<u64> {
        Ok(self.zsets.get(key).map(|z| z.scores.len() as u64).unwrap_or(0))
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        self.hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        Ok(self.hashes.get(key).and_then(|h| h.get(field).cloned()))
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        Ok(self.hashes.get(key).map(|h| h.clone()).unwrap_or_default())
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<()> {
        if let Some(mut h) = self.hashes.get_mut(key) {
            h.remove(field);
        }
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<()> {
        let _ = self.channel(channel).send(payload.to_vec());
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<broadcast::Receiver<Vec<u8>>> {
        Ok(self.channel(channel).subscribe())
    }
}

/// Process-level convenience constructor, used by `bin/server.rs` when no
/// external store is configured.
pub fn in_memory() -> Arc<dyn KvStore> {
    Arc::new(InMemoryKvStore::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn string_roundtrip() {
        let kv = InMemoryKvStore::new();
        kv.set("k", "v").await.unwrap();
        assert_eq!(kv.get("k").await.unwrap(), Some("v".to_string()));
        kv.del("k").await.unwrap();
        assert_eq!(kv.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn incr_starts_at_one() {
        let kv = InMemoryKvStore::new();
        assert_eq!(kv.incr("counter").await.unwrap(), 1);
        assert_eq!(kv.incr("counter").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn set_operations() {
        let kv = InMemoryKvStore::new();
        kv.sadd("members", "a").await.unwrap();
        kv.sadd("members", "b").await.unwrap();
        assert!(kv.sismember("members", "a").await.unwrap());
        kv.srem("members", "a").await.unwrap();
        assert!(!kv.sismember("members", "a").await.unwrap());
        assert_eq!(kv.smembers("members").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn sorted_set_range_respects_score_order() {
        let kv = InMemoryKvStore::new();
        kv.zadd("z", "c", 3.0).await.unwrap();
        kv.zadd("z", "a", 1.0).await.unwrap();
        kv.zadd("z", "b", 2.0).await.unwrap();
        assert_eq!(kv.zrange("z", 0, -1).await.unwrap(), vec!["a", "b", "c"]);
        assert_eq!(kv.zrangebyscore("z", 2.0, 3.0).await.unwrap(), vec!["b", "c"]);
        assert_eq!(kv.zcard("z").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn hash_operations() {
        let kv = InMemoryKvStore::new();
        kv.hset("h", "f1", "v1").await.unwrap();
        assert_eq!(kv.hget("h", "f1").await.unwrap(), Some("v1".to_string()));
        kv.hdel("h", "f1").await.unwrap();
        assert!(kv.hgetall("h").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn publish_subscribe_delivers_payload() {
        let kv = InMemoryKvStore::new();
        let mut rx = kv.subscribe("chan").await.unwrap();
        kv.publish("chan", b"hello").await.unwrap();
        let received = rx.recv().await.unwrap();
        assert_eq!(received, b"hello");
    }
}
