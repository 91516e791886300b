//! Statement fingerprinting and the per-session prepared statement cache.
//!
//! A [`StatementKey`] is the canonical form of a parameterized SQL string:
//! whitespace collapsed, placeholders renumbered in order of first appearance.
//! Two statements with the same key reuse one server-side prepared statement.
//!
//! The cache is owned by a single session and dies with it: prepared
//! statements are session-scoped in PostgreSQL, so the cache is never shared.

use std::collections::HashMap;

use xxhash_rust::xxh3::xxh3_64;

/// Canonical identity of a parameterized SQL statement.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct StatementKey {
    text: String,
    hash: u64,
}

impl StatementKey {
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn hash(&self) -> u64 {
        self.hash
    }
}

/// Compute the canonical key for a SQL string.
pub fn fingerprint(sql: &str) -> StatementKey {
    let text = normalize(sql);
    let hash = xxh3_64(text.as_bytes());
    StatementKey { text, hash }
}

/// Collapse whitespace runs and renumber `$n` placeholders sequentially by
/// first appearance, so `$2 … $1` and `$1 … $2` with the same shape agree.
fn normalize(sql: &str) -> String {
    let collapsed: String = sql.split_whitespace().collect::<Vec<_>>().join(" ");

    let mut out = String::with_capacity(collapsed.len());
    let mut mapping: HashMap<u32, u32> = HashMap::new();
    let mut next: u32 = 1;

    let mut chars = collapsed.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '$' && chars.peek().is_some_and(|n| n.is_ascii_digit()) {
            let mut num: u32 = 0;
            while let Some(&d) = chars.peek() {
                if let Some(v) = d.to_digit(10) {
                    num = num * 10 + v;
                    chars.next();
                } else {
                    break;
                }
            }
            let canonical = *mapping.entry(num).or_insert_with(|| {
                let n = next;
                next += 1;
                n
            });
            out.push('$');
            out.push_str(&canonical.to_string());
        } else {
            out.push(c);
        }
    }
    out
}

struct CacheEntry<H> {
    handle: H,
    last_used: u64,
}

/// Bounded LRU of prepared statement handles, keyed by fingerprint hash.
///
/// Eviction hands the displaced handle back to the caller so the underlying
/// prepared statement can be closed at the protocol level (dropping a
/// `postgres::Statement` does exactly that).
pub struct StatementCache<H> {
    cap: usize,
    tick: u64,
    entries: HashMap<u64, CacheEntry<H>>,
}

impl<H> StatementCache<H> {
    pub fn new(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            tick: 0,
            entries: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up a handle, refreshing its recency.
    pub fn get(&mut self, key: &StatementKey) -> Option<&H> {
        self.tick += 1;
        let tick = self.tick;
        self.entries.get_mut(&key.hash).map(|e| {
            e.last_used = tick;
            &e.handle
        })
    }

    /// Insert a handle, evicting the least recently used entry when full.
    /// Returns the evicted handle, if any.
    pub fn put(&mut self, key: &StatementKey, handle: H) -> Option<H> {
        self.tick += 1;
        let mut evicted = None;
        if !self.entries.contains_key(&key.hash) && self.entries.len() >= self.cap {
            if let Some((&oldest, _)) = self.entries.iter().min_by_key(|(_, e)| e.last_used) {
                evicted = self.entries.remove(&oldest).map(|e| e.handle);
            }
        }
        self.entries.insert(
            key.hash,
            CacheEntry {
                handle,
                last_used: self.tick,
            },
        );
        evicted
    }

    /// Drop every entry (session close).
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
