//! Narrow interface onto the shared key/sorted-set store

use crate::error::EngineResult;
use async_trait::async_trait;
use std::time::Duration;

/// How a sorted-set insert treats members that already exist
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddMode {
    /// Insert or overwrite the score
    Always,
    /// Only insert members that are not present (NX)
    IfAbsent,
    /// Only update members that are present (XX)
    IfPresent,
}

/// Store keys one queue operates on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueKeys<'a> {
    /// Sorted set of members scored by due time
    pub index: &'a str,
    pub payload_prefix: &'a str,
    /// Marker written under `claim_prefix + member` while a member is claimed
    pub claim_prefix: &'a str,
}

/// Entry removed from the due index by an atomic claim
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedEntry {
    pub member: String,
    /// Payload stored under `payload_prefix + member`; `None` when it was missing
    pub payload: Option<String>,
    pub score: i64,
}

/// Operations the scheduling engine needs from the shared store.
///
/// Every method is a single atomic operation on the store side. For a
/// Redis-like backend `claim_due`, `add_unclaimed`, `release`,
/// `compare_and_expire` and `compare_and_delete` are server-side scripts.
#[async_trait]
pub trait WorkStore: Send + Sync {
    /// Write payload values, keyed by full key.
    async fn put_payloads(&self, entries: Vec<(String, String)>) -> EngineResult<()>;

    /// Add members with scores to a sorted set; returns how many were written.
    async fn zadd(&self, key: &str, members: Vec<(String, i64)>, mode: AddMode)
        -> EngineResult<usize>;

    /// Take the lowest-scored member if its score is `<= now`: remove it from
    /// the index, read and delete its payload and mark it claimed for
    /// `claim_ttl`, all as one step.
    async fn claim_due(
        &self,
        keys: QueueKeys<'_>,
        now: i64,
        claim_ttl: Duration,
    ) -> EngineResult<Option<ClaimedEntry>>;

    /// Insert members that are neither indexed nor currently claimed; returns
    /// how many were added.
    async fn add_unclaimed(&self, keys: QueueKeys<'_>, members: Vec<(String, i64)>)
        -> EngineResult<usize>;

    /// Index a claimed member again with `score` and clear its claim marker,
    /// as one step.
    async fn release(&self, keys: QueueKeys<'_>, member: &str, score: i64) -> EngineResult<()>;

    /// Remove members from the index together with their payloads and claim
    /// markers.
    async fn remove_members(&self, keys: QueueKeys<'_>, members: &[String]) -> EngineResult<usize>;

    async fn card(&self, key: &str) -> EngineResult<u64>;

    /// Up to `limit` members in ascending `(score, member)` order that sort
    /// strictly after `after`, or from the start when `after` is `None`.
    async fn range_after(
        &self,
        key: &str,
        after: Option<&(i64, String)>,
        limit: usize,
    ) -> EngineResult<Vec<(String, i64)>>;

    async fn get(&self, key: &str) -> EngineResult<Option<String>>;

    /// SET key value NX EX ttl
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> EngineResult<bool>;

    /// SET key value EX ttl
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> EngineResult<()>;

    /// Extend the TTL only if the stored value equals `value`.
    async fn compare_and_expire(&self, key: &str, value: &str, ttl: Duration)
        -> EngineResult<bool>;

    /// Delete only if the stored value equals `value`.
    async fn compare_and_delete(&self, key: &str, value: &str) -> EngineResult<bool>;

    /// Number of live keys starting with `prefix`.
    async fn count_prefix(&self, prefix: &str) -> EngineResult<u64>;
}
