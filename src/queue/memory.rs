//! In-process `WorkStore`
//!
//! All state sits behind one async mutex so each trait call is atomic, the
//! same guarantee a server-side script gives on a shared store. TTLs are
//! enforced lazily on access.

use crate::error::{EngineError, EngineResult};
use crate::queue::store::{AddMode, ClaimedEntry, QueueKeys, WorkStore};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

#[derive(Debug, Default)]
struct SortedSet {
    scores: HashMap<String, i64>,
    ordered: BTreeSet<(i64, String)>,
}

impl SortedSet {
    fn insert(&mut self, member: String, score: i64) {
        if let Some(old) = self.scores.insert(member.clone(), score) {
            self.ordered.remove(&(old, member.clone()));
        }
        self.ordered.insert((score, member));
    }

    fn remove(&mut self, member: &str) -> bool {
        match self.scores.remove(member) {
            Some(score) => {
                self.ordered.remove(&(score, member.to_string()));
                true
            }
            None => false,
        }
    }

    fn first(&self) -> Option<(i64, String)> {
        self.ordered.iter().next().cloned()
    }
}

#[derive(Debug)]
struct Value {
    data: String,
    expires_at: Option<Instant>,
}

impl Value {
    fn live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Debug, Default)]
struct Inner {
    sets: HashMap<String, SortedSet>,
    values: BTreeMap<String, Value>,
}

impl Inner {
    fn live_value(&mut self, key: &str) -> Option<&mut Value> {
        let now = Instant::now();
        if self.values.get(key).is_some_and(|v| !v.live(now)) {
            self.values.remove(key);
        }
        self.values.get_mut(key)
    }
}

/// Shared store kept in process memory
#[derive(Debug, Default)]
pub struct MemoryWorkStore {
    inner: Mutex<Inner>,
    unavailable: AtomicBool,
    latency_ms: AtomicU64,
}

impl MemoryWorkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with a store error until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Delay every call by `latency` until set back to zero.
    pub fn set_latency(&self, latency: Duration) {
        let ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.latency_ms.store(ms, Ordering::SeqCst);
    }

    async fn enter(&self) -> EngineResult<()> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            Err(EngineError::Store("store unavailable".to_string()))
        } else {
            Ok(())
        }
    }

    /// Score of a member, if present.
    pub async fn score(&self, key: &str, member: &str) -> Option<i64> {
        let inner = self.inner.lock().await;
        inner.sets.get(key)?.scores.get(member).copied()
    }
}

#[async_trait]
impl WorkStore for MemoryWorkStore {
    async fn put_payloads(&self, entries: Vec<(String, String)>) -> EngineResult<()> {
        self.enter().await?;
        let mut inner = self.inner.lock().await;
        for (key, data) in entries {
            inner.values.insert(
                key,
                Value {
                    data,
                    expires_at: None,
                },
            );
        }
        Ok(())
    }

    async fn zadd(
        &self,
        key: &str,
        members: Vec<(String, i64)>,
        mode: AddMode,
    ) -> EngineResult<usize> {
        self.enter().await?;
        let mut inner = self.inner.lock().await;
        let set = inner.sets.entry(key.to_string()).or_default();
        let mut written = 0;
        for (member, score) in members {
            let present = set.scores.contains_key(&member);
            let write = match mode {
                AddMode::Always => true,
                AddMode::IfAbsent => !present,
                AddMode::IfPresent => present,
            };
            if write {
                set.insert(member, score);
                written += 1;
            }
        }
        Ok(written)
    }

    async fn claim_due(
        &self,
        keys: QueueKeys<'_>,
        now: i64,
        claim_ttl: Duration,
    ) -> EngineResult<Option<ClaimedEntry>> {
        self.enter().await?;
        let mut inner = self.inner.lock().await;
        let Some(set) = inner.sets.get_mut(keys.index) else {
            return Ok(None);
        };
        let Some((score, member)) = set.first() else {
            return Ok(None);
        };
        if score > now {
            return Ok(None);
        }
        set.remove(&member);
        let payload_key = format!("{}{member}", keys.payload_prefix);
        let payload = inner.values.remove(&payload_key).map(|v| v.data);
        inner.values.insert(
            format!("{}{member}", keys.claim_prefix),
            Value {
                data: now.to_string(),
                expires_at: Some(Instant::now() + claim_ttl),
            },
        );
        Ok(Some(ClaimedEntry {
            member,
            payload,
            score,
        }))
    }

    async fn add_unclaimed(
        &self,
        keys: QueueKeys<'_>,
        members: Vec<(String, i64)>,
    ) -> EngineResult<usize> {
        self.enter().await?;
        let mut inner = self.inner.lock().await;
        let mut added = 0;
        for (member, score) in members {
            let claim_key = format!("{}{member}", keys.claim_prefix);
            if inner.live_value(&claim_key).is_some() {
                continue;
            }
            let set = inner.sets.entry(keys.index.to_string()).or_default();
            if !set.scores.contains_key(&member) {
                set.insert(member, score);
                added += 1;
            }
        }
        Ok(added)
    }

    async fn release(&self, keys: QueueKeys<'_>, member: &str, score: i64) -> EngineResult<()> {
        self.enter().await?;
        let mut inner = self.inner.lock().await;
        inner
            .sets
            .entry(keys.index.to_string())
            .or_default()
            .insert(member.to_string(), score);
        inner.values.remove(&format!("{}{member}", keys.claim_prefix));
        Ok(())
    }

    async fn remove_members(&self, keys: QueueKeys<'_>, members: &[String]) -> EngineResult<usize> {
        self.enter().await?;
        let mut inner = self.inner.lock().await;
        let mut removed = 0;
        if let Some(set) = inner.sets.get_mut(keys.index) {
            for member in members {
                if set.remove(member) {
                    removed += 1;
                }
            }
        }
        for member in members {
            inner.values.remove(&format!("{}{member}", keys.payload_prefix));
            inner.values.remove(&format!("{}{member}", keys.claim_prefix));
        }
        Ok(removed)
    }

    async fn card(&self, key: &str) -> EngineResult<u64> {
        self.enter().await?;
        let inner = self.inner.lock().await;
        Ok(inner.sets.get(key).map_or(0, |s| s.scores.len() as u64))
    }

    async fn range_after(
        &self,
        key: &str,
        after: Option<&(i64, String)>,
        limit: usize,
    ) -> EngineResult<Vec<(String, i64)>> {
        self.enter().await?;
        let inner = self.inner.lock().await;
        let Some(set) = inner.sets.get(key) else {
            return Ok(Vec::new());
        };
        let lower = after.map_or(Bound::Unbounded, Bound::Excluded);
        Ok(set
            .ordered
            .range((lower, Bound::Unbounded))
            .take(limit)
            .map(|(score, member)| (member.clone(), *score))
            .collect())
    }

    async fn get(&self, key: &str) -> EngineResult<Option<String>> {
        self.enter().await?;
        let mut inner = self.inner.lock().await;
        Ok(inner.live_value(key).map(|v| v.data.clone()))
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> EngineResult<bool> {
        self.enter().await?;
        let mut inner = self.inner.lock().await;
        if inner.live_value(key).is_some() {
            return Ok(false);
        }
        inner.values.insert(
            key.to_string(),
            Value {
                data: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> EngineResult<()> {
        self.enter().await?;
        let mut inner = self.inner.lock().await;
        inner.values.insert(
            key.to_string(),
            Value {
                data: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn compare_and_expire(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> EngineResult<bool> {
        self.enter().await?;
        let mut inner = self.inner.lock().await;
        match inner.live_value(key) {
            Some(v) if v.data == value => {
                v.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn compare_and_delete(&self, key: &str, value: &str) -> EngineResult<bool> {
        self.enter().await?;
        let mut inner = self.inner.lock().await;
        let matches = inner.live_value(key).is_some_and(|v| v.data == value);
        if matches {
            inner.values.remove(key);
        }
        Ok(matches)
    }

    async fn count_prefix(&self, prefix: &str) -> EngineResult<u64> {
        self.enter().await?;
        let inner = self.inner.lock().await;
        let now = Instant::now();
        // keys sharing a prefix are contiguous in the ordered map
        let count = inner
            .values
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .filter(|(_, v)| v.live(now))
            .count();
        Ok(count as u64)
    }
}
