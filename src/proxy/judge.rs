//! Judge routing: per user and protocol round-robin over verification endpoints
//!
//! The routing table is an immutable map published through an `ArcSwap`.
//! Readers load the current snapshot without locking; writers serialize on a
//! mutex, build a complete replacement table and publish it in one store.

use crate::error::{EngineError, EngineResult};
use crate::proxy::models::Protocol;
use arc_swap::ArcSwap;
use regex::Regex;
use reqwest::Url;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// An endpoint that echoes back what it received
#[derive(Debug, Clone)]
pub struct Judge {
    pub url: String,
    /// Scheme of the judge URL, `Http` or `Https`
    pub protocol: Protocol,
    /// Optional content check; when absent the echoed header set is validated
    pub regex: Option<Regex>,
}

impl Judge {
    pub fn new(url: &str, regex: Option<&str>) -> EngineResult<Self> {
        let parsed = Url::parse(url).map_err(|e| EngineError::InvalidJudge(format!("{url}: {e}")))?;
        let protocol = match parsed.scheme() {
            "http" => Protocol::Http,
            "https" => Protocol::Https,
            other => {
                return Err(EngineError::InvalidJudge(format!(
                    "{url}: unsupported scheme {other}"
                )))
            }
        };
        let regex = match regex.map(str::trim).filter(|r| !r.is_empty()) {
            Some(pattern) => Some(
                Regex::new(pattern)
                    .map_err(|e| EngineError::InvalidJudge(format!("{url}: {e}")))?,
            ),
            None => None,
        };
        Ok(Self {
            url: parsed.to_string(),
            protocol,
            regex,
        })
    }
}

#[derive(Debug)]
struct JudgeEntry {
    judges: Vec<Arc<Judge>>,
    cursor: AtomicU64,
}

impl JudgeEntry {
    fn new(judges: Vec<Arc<Judge>>, cursor: u64) -> Self {
        Self {
            judges,
            cursor: AtomicU64::new(cursor),
        }
    }

    fn next(&self) -> Option<Arc<Judge>> {
        let len = self.judges.len() as u64;
        if len == 0 {
            return None;
        }
        // wrapping add; the modulo is taken against this snapshot's length
        let n = self.cursor.fetch_add(1, Ordering::Relaxed);
        self.judges.get((n % len) as usize).cloned()
    }
}

type UserJudges = HashMap<Protocol, Arc<JudgeEntry>>;
type JudgeTable = HashMap<i64, Arc<UserJudges>>;

/// Lock-free-read routing table of judges
pub struct JudgeRouter {
    table: ArcSwap<JudgeTable>,
    writer: Mutex<()>,
}

impl Default for JudgeRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl JudgeRouter {
    pub fn new() -> Self {
        Self {
            table: ArcSwap::from_pointee(HashMap::new()),
            writer: Mutex::new(()),
        }
    }

    /// Pick the next judge for a user and judge protocol.
    pub fn select(&self, user_id: i64, protocol: Protocol) -> Option<Arc<Judge>> {
        let table = self.table.load();
        table.get(&user_id)?.get(&protocol)?.next()
    }

    /// Replace every judge of one user.
    pub fn replace_user(&self, user_id: i64, judges: Vec<Judge>) {
        let shared: Vec<Arc<Judge>> = judges.into_iter().map(Arc::new).collect();
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.table.load_full();
        let mut next: JudgeTable = (*current).clone();
        next.insert(user_id, Arc::new(merge(None, &shared)));
        self.table.store(Arc::new(next));
    }

    /// Append a judge set to one user's existing judges.
    pub fn add(&self, user_id: i64, judges: Vec<Judge>) {
        self.add_to_users(&[user_id], judges);
    }

    /// Append the same judge set to many users under one lock acquisition.
    pub fn add_to_users(&self, user_ids: &[i64], judges: Vec<Judge>) {
        if user_ids.is_empty() || judges.is_empty() {
            return;
        }
        let shared: Vec<Arc<Judge>> = judges.into_iter().map(Arc::new).collect();
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.table.load_full();
        let mut next: JudgeTable = (*current).clone();
        for user_id in user_ids {
            let existing = current.get(user_id);
            let merged = merge(existing.map(|u| u.as_ref()), &shared);
            next.insert(*user_id, Arc::new(merged));
        }
        self.table.store(Arc::new(next));
    }

    pub fn remove_user(&self, user_id: i64) {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.table.load_full();
        if !current.contains_key(&user_id) {
            return;
        }
        let mut next: JudgeTable = (*current).clone();
        next.remove(&user_id);
        self.table.store(Arc::new(next));
    }

    /// Judge URLs registered for a user and protocol, in rotation order.
    pub fn judges_for(&self, user_id: i64, protocol: Protocol) -> Vec<String> {
        let table = self.table.load();
        table
            .get(&user_id)
            .and_then(|u| u.get(&protocol))
            .map(|e| e.judges.iter().map(|j| j.url.clone()).collect())
            .unwrap_or_default()
    }

    pub fn user_count(&self) -> usize {
        self.table.load().len()
    }
}

fn merge(existing: Option<&UserJudges>, added: &[Arc<Judge>]) -> UserJudges {
    let mut out: UserJudges = HashMap::new();
    let mut lists: HashMap<Protocol, (Vec<Arc<Judge>>, u64)> = HashMap::new();
    if let Some(existing) = existing {
        for (protocol, entry) in existing {
            lists.insert(
                *protocol,
                (entry.judges.clone(), entry.cursor.load(Ordering::Relaxed)),
            );
        }
    }
    for judge in added {
        let (list, _) = lists.entry(judge.protocol).or_insert_with(|| (Vec::new(), 0));
        if !list.iter().any(|j| j.url == judge.url) {
            list.push(Arc::clone(judge));
        }
    }
    for (protocol, (list, cursor)) in lists {
        out.insert(protocol, Arc::new(JudgeEntry::new(list, cursor)));
    }
    out
}
