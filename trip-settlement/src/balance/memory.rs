//! In-process backend with Redis WATCH semantics, for tests and local runs

use super::backend::{KvBackend, Write};
use crate::error::StoreResult;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Debug, Default)]
struct State {
    entries: HashMap<String, Entry>,
    // Bumped on every write or delete, never removed
    versions: HashMap<String, u64>,
    clock: u64,
}

impl State {
    fn version(&self, key: &str) -> u64 {
        self.versions.get(key).copied().unwrap_or(0)
    }

    fn touch(&mut self, key: &str) {
        self.clock += 1;
        self.versions.insert(key.to_string(), self.clock);
    }

    fn live(&self, key: &str) -> Option<&Entry> {
        let now = Instant::now();
        self.entries.get(key).filter(|entry| entry.is_live(now))
    }

    fn apply(&mut self, write: Write) {
        match write {
            Write::Set { key, value, ttl } => {
                self.touch(&key);
                let expires_at = ttl.map(|ttl| Instant::now() + ttl);
                self.entries.insert(key, Entry { value, expires_at });
            }
            Write::Delete { key } => {
                if self.entries.remove(&key).is_some() {
                    self.touch(&key);
                }
            }
        }
    }
}

/// Watched keys and the versions they had when the transaction opened
#[derive(Debug)]
pub struct MemoryTxn {
    watched: Vec<(String, u64)>,
}

/// Shared in-memory keyspace. Clones see the same data.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<State>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live keys and values, ordered by key
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        let state = self.state.lock();
        let now = Instant::now();
        state
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_live(now))
            .map(|(key, entry)| (key.clone(), entry.value.clone()))
            .collect()
    }
}

#[async_trait]
impl KvBackend for MemoryBackend {
    type Txn = MemoryTxn;

    async fn watch(&self, keys: &[String]) -> StoreResult<MemoryTxn> {
        let state = self.state.lock();
        let watched = keys
            .iter()
            .map(|key| (key.clone(), state.version(key)))
            .collect();
        Ok(MemoryTxn { watched })
    }

    async fn read(&self, _txn: &mut MemoryTxn, key: &str) -> StoreResult<Option<String>> {
        Ok(self.state.lock().live(key).map(|entry| entry.value.clone()))
    }

    async fn commit(&self, txn: MemoryTxn, writes: Vec<Write>) -> StoreResult<bool> {
        let mut state = self.state.lock();

        let unchanged = txn
            .watched
            .iter()
            .all(|(key, version)| state.version(key) == *version);
        if !unchanged {
            return Ok(false);
        }

        for write in writes {
            state.apply(write);
        }
        Ok(true)
    }

    async fn release(&self, _txn: MemoryTxn) {}

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.state.lock().live(key).map(|entry| entry.value.clone()))
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        self.state.lock().apply(Write::set(key, value));
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str) -> StoreResult<bool> {
        let mut state = self.state.lock();
        if state.live(key).is_some() {
            return Ok(false);
        }
        state.apply(Write::set(key, value));
        Ok(true)
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.state.lock().apply(Write::delete(key));
        Ok(())
    }

    async fn scan(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let state = self.state.lock();
        let now = Instant::now();
        let pattern: Vec<char> = pattern.chars().collect();

        Ok(state
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_live(now))
            .filter(|(key, _)| {
                let key: Vec<char> = key.chars().collect();
                glob_match(&pattern, &key)
            })
            .map(|(key, _)| key.clone())
            .collect())
    }
}

/// Redis `KEYS`/`SCAN MATCH` glob: `*`, `?`, `[set]`, `[^set]`, `[a-z]`, `\x`
pub(crate) fn glob_match(pattern: &[char], text: &[char]) -> bool {
    match pattern.first() {
        None => text.is_empty(),
        Some('*') => (0..=text.len()).any(|skip| glob_match(&pattern[1..], &text[skip..])),
        Some('?') => !text.is_empty() && glob_match(&pattern[1..], &text[1..]),
        Some('[') => {
            let Some((&c, rest)) = text.split_first() else {
                return false;
            };
            match match_class(&pattern[1..], c) {
                Some((true, after)) => glob_match(after, rest),
                Some((false, _)) => false,
                // Unterminated class matches a literal '['
                None => c == '[' && glob_match(&pattern[1..], rest),
            }
        }
        Some('\\') if pattern.len() > 1 => {
            text.first() == Some(&pattern[1]) && glob_match(&pattern[2..], &text[1..])
        }
        Some(&p) => text.first() == Some(&p) && glob_match(&pattern[1..], &text[1..]),
    }
}

// Returns whether `c` is in the class and the pattern after the closing ']'
fn match_class(class: &[char], c: char) -> Option<(bool, &[char])> {
    let (negated, mut i) = match class.first() {
        Some('^') => (true, 1),
        _ => (false, 0),
    };
    let mut matched = false;

    while i < class.len() {
        match class[i] {
            ']' => return Some((matched != negated, &class[i + 1..])),
            '\\' if i + 1 < class.len() => {
                matched |= class[i + 1] == c;
                i += 2;
            }
            lo if i + 2 < class.len() && class[i + 1] == '-' && class[i + 2] != ']' => {
                let hi = class[i + 2];
                let (lo, hi) = if lo <= hi { (lo, hi) } else { (hi, lo) };
                matched |= lo <= c && c <= hi;
                i += 3;
            }
            other => {
                matched |= other == c;
                i += 1;
            }
        }
    }

    None
}
