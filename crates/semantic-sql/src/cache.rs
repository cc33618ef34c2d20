//! Two-tier semantic cache (C10).
//!
//! L1 is an in-process map guarded by a mutex — every lookup costs one map
//! operation. L2 is a pluggable persistent store behind the [`L2Store`]
//! trait: the real backing table (keyed by `cache_key`, last-write-wins on
//! `last_hit_at`/`hit_count`, akin to a ReplacingMergeTree) lives in the host
//! SQL engine and is out of scope for this crate (§1) — only the trait is
//! depended on. Writes to L2 go through a small background [`WorkerPool`] so
//! a cache miss never blocks on storage latency.
//!
//! `expires_at` has no nullable "never" representation in the storage model,
//! so a sentinel instant — any date on or after year 2099 — stands in for
//! "never expires" (`never_expires`/`is_never`).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Datelike, Duration as ChronoDuration, Utc};
use serde_json::{Map, Value};

use crate::workpool::WorkerPool;

/// Default cap on L1 entries before the oldest 10% are evicted (§4.10).
pub const L1_MAX_SIZE: usize = 10_000;

/// A single persisted cache row (§3 CacheEntry).
#[derive(Debug, Clone, PartialEq)]
pub struct CacheRow {
    pub cache_key: String,
    pub function_name: String,
    pub args_json: String,
    pub args_preview: String,
    pub result: String,
    pub result_type: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub ttl_seconds: u64,
    pub hit_count: u64,
    pub last_hit_at: DateTime<Utc>,
    pub result_bytes: u64,
    pub first_session_id: String,
    pub first_caller_id: String,
}

/// The sentinel instant representing "never expires" in storage.
pub fn never_expires() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2100-01-01T00:00:00Z").unwrap().with_timezone(&Utc)
}

/// Any date on or after year 2099 reads back as "never expires" (§4.10).
pub fn is_never(expires_at: &DateTime<Utc>) -> bool {
    expires_at.year() >= 2099
}

#[derive(Debug, Clone, Default)]
pub struct ClearFilter {
    pub function_name: Option<String>,
    pub older_than_days: Option<i64>,
    pub cache_key: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct FunctionStats {
    pub entries: u64,
    pub hits: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub l1_entries: usize,
    pub l1_max_size: usize,
    pub l2_available: bool,
    pub l2_entries: u64,
    pub l2_total_hits: u64,
    pub l2_total_bytes: u64,
    pub by_function: HashMap<String, FunctionStats>,
}

/// External collaborator: the persistent L2 backing store (§1, §4.10). This
/// crate never constructs SQL against it directly — only through this trait
/// — so the host engine's actual table layout can differ freely.
pub trait L2Store: Send + Sync {
    fn get(&self, cache_key: &str) -> Option<CacheRow>;
    fn upsert(&self, row: CacheRow);
    fn clear(&self, filter: &ClearFilter) -> usize;
    fn stats(&self) -> CacheStats;
    /// `order_by` is pre-validated against an allowlist by the caller before
    /// reaching here (§4.10's SQL-injection note on the `list_entries` path).
    fn list_entries(&self, function_name: Option<&str>, limit: usize, offset: usize, order_by: &str) -> Vec<CacheRow>;
}

/// Deterministic, key-sorted JSON for cache-key hashing: `Map`'s own
/// iteration order isn't guaranteed sorted across all builds, so keys are
/// explicitly collected into a `BTreeMap` before serializing.
pub fn canonical_json(args: &Map<String, Value>) -> String {
    let sorted: std::collections::BTreeMap<&String, &Value> = args.iter().collect();
    serde_json::to_string(&sorted).unwrap_or_default()
}

#[derive(Debug, Clone)]
pub struct CacheLookup {
    pub hit: bool,
    pub result: Option<Value>,
    pub result_type: Option<String>,
}

impl CacheLookup {
    fn hit(result: Value, result_type: String) -> Self {
        CacheLookup { hit: true, result: Some(result), result_type: Some(result_type) }
    }
    fn miss() -> Self {
        CacheLookup { hit: false, result: None, result_type: None }
    }
}

#[derive(Debug, Clone)]
struct L1Entry {
    result: Value,
    result_type: String,
    created_at: DateTime<Utc>,
    /// `None` means this entry never expires.
    expires_at: Option<DateTime<Utc>>,
}

pub struct SemanticCache {
    l1: Mutex<HashMap<String, L1Entry>>,
    l1_max_size: usize,
    l1_eviction_fraction: f64,
    l2: Option<Arc<dyn L2Store>>,
    writer: WorkerPool,
}

impl SemanticCache {
    pub fn new(l2: Option<Arc<dyn L2Store>>) -> Self {
        Self::with_l1_capacity(l2, L1_MAX_SIZE)
    }

    pub fn with_l1_capacity(l2: Option<Arc<dyn L2Store>>, l1_max_size: usize) -> Self {
        Self::with_config(l2, l1_max_size, 0.10)
    }

    /// Built from a [`crate::config::Config`]'s `l1_max_size` /
    /// `l1_eviction_fraction` knobs.
    pub fn with_config(l2: Option<Arc<dyn L2Store>>, l1_max_size: usize, l1_eviction_fraction: f64) -> Self {
        SemanticCache {
            l1: Mutex::new(HashMap::new()),
            l1_max_size,
            l1_eviction_fraction,
            l2,
            writer: WorkerPool::new("semantic-cache-l2", 4),
        }
    }

    /// `md5(function_name + ":" + canonical_json(args))` (§4.10).
    pub fn make_cache_key(function_name: &str, args: &Map<String, Value>) -> String {
        let canonical = canonical_json(args);
        let digest = md5::compute(format!("{function_name}:{canonical}").as_bytes());
        format!("{digest:x}")
    }

    pub fn get(&self, function_name: &str, args: &Map<String, Value>) -> CacheLookup {
        let cache_key = Self::make_cache_key(function_name, args);
        let now = Utc::now();

        if let Some(entry) = self.l1_get(&cache_key) {
            if entry.expires_at.is_some_and(|exp| now > exp) {
                self.l1_evict(&cache_key);
            } else {
                self.record_hit_async(&cache_key);
                return CacheLookup::hit(entry.result, entry.result_type);
            }
        }

        let Some(l2) = &self.l2 else {
            return CacheLookup::miss();
        };
        let Some(row) = l2.get(&cache_key) else {
            return CacheLookup::miss();
        };
        let expires_at = if is_never(&row.expires_at) { None } else { Some(row.expires_at) };
        if expires_at.is_some_and(|exp| now > exp) {
            return CacheLookup::miss();
        }
        let result: Value = serde_json::from_str(&row.result).unwrap_or_else(|_| Value::String(row.result.clone()));
        self.l1_set(cache_key.clone(), result.clone(), row.result_type.clone(), row.created_at, expires_at);
        self.record_hit_async(&cache_key);
        CacheLookup::hit(result, row.result_type)
    }

    /// Writes through both tiers; `ttl_seconds == 0` means "never expires".
    pub fn set(
        &self,
        function_name: &str,
        args: &Map<String, Value>,
        result: Value,
        result_type: &str,
        ttl_seconds: u64,
        session_id: &str,
        caller_id: &str,
    ) -> String {
        let cache_key = Self::make_cache_key(function_name, args);
        let created_at = Utc::now();
        let expires_at = if ttl_seconds > 0 { Some(created_at + ChronoDuration::seconds(ttl_seconds as i64)) } else { None };
        self.l1_set(cache_key.clone(), result.clone(), result_type.to_string(), created_at, expires_at);

        if let Some(l2) = self.l2.clone() {
            let args_json = canonical_json(args);
            let args_preview = args_json.chars().take(200).collect::<String>();
            let result_str = stringify_result(&result);
            let result_bytes = result_str.len() as u64;
            let row = CacheRow {
                cache_key: cache_key.clone(),
                function_name: function_name.to_string(),
                args_json,
                args_preview,
                result: result_str,
                result_type: result_type.to_string(),
                created_at,
                expires_at: expires_at.unwrap_or_else(never_expires),
                ttl_seconds,
                hit_count: 1,
                last_hit_at: created_at,
                result_bytes,
                first_session_id: session_id.to_string(),
                first_caller_id: caller_id.to_string(),
            };
            self.writer.submit(move || l2.upsert(row));
        }

        cache_key
    }

    fn record_hit_async(&self, cache_key: &str) {
        let Some(l2) = self.l2.clone() else { return };
        let key = cache_key.to_string();
        self.writer.submit(move || {
            if let Some(mut row) = l2.get(&key) {
                row.hit_count += 1;
                row.last_hit_at = Utc::now();
                l2.upsert(row);
            }
        });
    }

    fn l1_get(&self, key: &str) -> Option<L1Entry> {
        self.l1.lock().unwrap().get(key).cloned()
    }

    fn l1_evict(&self, key: &str) {
        self.l1.lock().unwrap().remove(key);
    }

    fn l1_set(&self, key: String, result: Value, result_type: String, created_at: DateTime<Utc>, expires_at: Option<DateTime<Utc>>) {
        let mut l1 = self.l1.lock().unwrap();
        if l1.len() >= self.l1_max_size && !l1.contains_key(&key) {
            let mut items: Vec<(String, DateTime<Utc>)> = l1.iter().map(|(k, v)| (k.clone(), v.created_at)).collect();
            items.sort_by_key(|(_, created)| *created);
            let evict_count = ((self.l1_max_size as f64 * self.l1_eviction_fraction) as usize).max(1);
            for (evict_key, _) in items.into_iter().take(evict_count) {
                l1.remove(&evict_key);
            }
        }
        l1.insert(key, L1Entry { result, result_type, created_at, expires_at });
    }

    /// L1 doesn't index by function name, so a `function_name`-only filter
    /// (no explicit key, no age cutoff) can only be honored fully at L2 — the
    /// L1 side is cleared wholesale in that case, matching the source's own
    /// documented quirk.
    pub fn clear(&self, filter: ClearFilter) -> usize {
        let mut cleared = 0usize;
        {
            let mut l1 = self.l1.lock().unwrap();
            if let Some(key) = &filter.cache_key {
                if l1.remove(key).is_some() {
                    cleared += 1;
                }
            } else if let Some(days) = filter.older_than_days {
                let cutoff = Utc::now() - ChronoDuration::days(days);
                let keys: Vec<String> = l1.iter().filter(|(_, e)| e.created_at <= cutoff).map(|(k, _)| k.clone()).collect();
                for k in &keys {
                    l1.remove(k);
                }
                cleared += keys.len();
            } else {
                cleared = l1.len();
                l1.clear();
            }
        }
        if let Some(l2) = &self.l2 {
            cleared = cleared.max(l2.clear(&filter));
        }
        cleared
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats { l1_entries: self.l1.lock().unwrap().len(), l1_max_size: self.l1_max_size, ..Default::default() };
        if let Some(l2) = &self.l2 {
            let l2_stats = l2.stats();
            stats.l2_available = true;
            stats.l2_entries = l2_stats.l2_entries;
            stats.l2_total_hits = l2_stats.l2_total_hits;
            stats.l2_total_bytes = l2_stats.l2_total_bytes;
            stats.by_function = l2_stats.by_function;
        }
        stats
    }

    const VALID_ORDER_COLUMNS: &'static [&'static str] = &["last_hit_at", "created_at", "hit_count", "result_bytes", "function_name"];

    pub fn list_entries(&self, function_name: Option<&str>, limit: usize, offset: usize, order_by: &str) -> Vec<CacheRow> {
        let column = order_by.split_whitespace().next().unwrap_or("");
        let safe_order_by = if Self::VALID_ORDER_COLUMNS.contains(&column) { order_by } else { "last_hit_at DESC" };
        self.l2.as_ref().map(|l2| l2.list_entries(function_name, limit, offset, safe_order_by)).unwrap_or_default()
    }

    pub fn prune_expired(&self) -> usize {
        let now = Utc::now();
        let mut l1 = self.l1.lock().unwrap();
        let keys: Vec<String> = l1.iter().filter(|(_, e)| e.expires_at.is_some_and(|exp| now > exp)).map(|(k, _)| k.clone()).collect();
        for k in &keys {
            l1.remove(k);
        }
        keys.len()
    }
}

fn stringify_result(result: &Value) -> String {
    match result {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Reference in-memory [`L2Store`] — a host integration swaps this for its
/// real persistent table; tests use it to exercise the cache without one.
#[derive(Default)]
pub struct InMemoryL2Store {
    rows: Mutex<HashMap<String, CacheRow>>,
}

impl InMemoryL2Store {
    pub fn new() -> Self {
        InMemoryL2Store::default()
    }
}

impl L2Store for InMemoryL2Store {
    fn get(&self, cache_key: &str) -> Option<CacheRow> {
        self.rows.lock().unwrap().get(cache_key).cloned()
    }

    fn upsert(&self, row: CacheRow) {
        self.rows.lock().unwrap().insert(row.cache_key.clone(), row);
    }

    fn clear(&self, filter: &ClearFilter) -> usize {
        let mut rows = self.rows.lock().unwrap();
        if let Some(key) = &filter.cache_key {
            return if rows.remove(key).is_some() { 1 } else { 0 };
        }
        let now = Utc::now();
        let keys: Vec<String> = rows
            .values()
            .filter(|row| filter.function_name.as_deref().is_none_or(|f| row.function_name == f))
            .filter(|row| filter.older_than_days.is_none_or(|d| row.created_at <= now - ChronoDuration::days(d)))
            .map(|row| row.cache_key.clone())
            .collect();
        for key in &keys {
            rows.remove(key);
        }
        keys.len()
    }

    fn stats(&self) -> CacheStats {
        let rows = self.rows.lock().unwrap();
        let mut by_function: HashMap<String, FunctionStats> = HashMap::new();
        let mut total_hits = 0u64;
        let mut total_bytes = 0u64;
        for row in rows.values() {
            let entry = by_function.entry(row.function_name.clone()).or_default();
            entry.entries += 1;
            entry.hits += row.hit_count;
            entry.bytes += row.result_bytes;
            total_hits += row.hit_count;
            total_bytes += row.result_bytes;
        }
        CacheStats { l1_entries: 0, l1_max_size: 0, l2_available: true, l2_entries: rows.len() as u64, l2_total_hits: total_hits, l2_total_bytes: total_bytes, by_function }
    }

    fn list_entries(&self, function_name: Option<&str>, limit: usize, offset: usize, order_by: &str) -> Vec<CacheRow> {
        let rows = self.rows.lock().unwrap();
        let mut matching: Vec<CacheRow> = rows.values().filter(|r| function_name.is_none_or(|f| r.function_name == f)).cloned().collect();
        let desc = order_by.to_ascii_uppercase().ends_with("DESC");
        let column = order_by.split_whitespace().next().unwrap_or("last_hit_at");
        matching.sort_by(|a, b| {
            let ord = match column {
                "created_at" => a.created_at.cmp(&b.created_at),
                "hit_count" => a.hit_count.cmp(&b.hit_count),
                "result_bytes" => a.result_bytes.cmp(&b.result_bytes),
                "function_name" => a.function_name.cmp(&b.function_name),
                _ => a.last_hit_at.cmp(&b.last_hit_at),
            };
            if desc { ord.reverse() } else { ord }
        });
        matching.into_iter().skip(offset).take(limit).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn args(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn cache_key_is_order_independent_across_arg_insertion() {
        let a = args(&[("b", json!(2)), ("a", json!(1))]);
        let b = args(&[("a", json!(1)), ("b", json!(2))]);
        assert_eq!(SemanticCache::make_cache_key("f", &a), SemanticCache::make_cache_key("f", &b));
    }

    #[test]
    fn different_function_names_produce_different_keys() {
        let a = args(&[("x", json!(1))]);
        assert_ne!(SemanticCache::make_cache_key("f", &a), SemanticCache::make_cache_key("g", &a));
    }

    #[test]
    fn l1_only_roundtrip() {
        let cache = SemanticCache::new(None);
        let a = args(&[("text", json!("hello"))]);
        assert!(!cache.get("f", &a).hit);
        cache.set("f", &a, json!("world"), "VARCHAR", 0, "sess-1", "caller-1");
        let lookup = cache.get("f", &a);
        assert!(lookup.hit);
        assert_eq!(lookup.result, Some(json!("world")));
    }

    #[test]
    fn ttl_zero_never_expires() {
        let cache = SemanticCache::new(None);
        let a = args(&[("x", json!(1))]);
        cache.set("f", &a, json!(true), "BOOLEAN", 0, "s", "c");
        assert!(cache.get("f", &a).hit);
    }

    #[test]
    fn l1_eviction_keeps_newest_entries() {
        let cache = SemanticCache::with_l1_capacity(None, 10);
        for i in 0..10 {
            let a = args(&[("i", json!(i))]);
            cache.set("f", &a, json!(i), "INTEGER", 0, "s", "c");
        }
        // Triggers eviction of the oldest entry (10% of 10 == 1).
        let a = args(&[("i", json!(10))]);
        cache.set("f", &a, json!(10), "INTEGER", 0, "s", "c");

        let first = args(&[("i", json!(0))]);
        assert!(!cache.get("f", &first).hit);
        let newest = args(&[("i", json!(10))]);
        assert!(cache.get("f", &newest).hit);
    }

    #[test]
    fn never_expires_sentinel_reads_back_as_never() {
        assert!(is_never(&never_expires()));
        assert!(!is_never(&Utc::now()));
    }

    #[test]
    fn l2_hit_populates_l1() {
        let l2 = Arc::new(InMemoryL2Store::new());
        let cache = SemanticCache::new(Some(l2.clone()));
        let a = args(&[("x", json!(1))]);
        let key = SemanticCache::make_cache_key("f", &a);
        l2.upsert(CacheRow {
            cache_key: key,
            function_name: "f".to_string(),
            args_json: canonical_json(&a),
            args_preview: "x".to_string(),
            result: "42".to_string(),
            result_type: "INTEGER".to_string(),
            created_at: Utc::now(),
            expires_at: never_expires(),
            ttl_seconds: 0,
            hit_count: 0,
            last_hit_at: Utc::now(),
            result_bytes: 2,
            first_session_id: "s".to_string(),
            first_caller_id: "c".to_string(),
        });
        let lookup = cache.get("f", &a);
        assert!(lookup.hit);
        assert_eq!(lookup.result, Some(json!(42)));
    }

    #[test]
    fn list_entries_rejects_unsafe_order_by() {
        let l2 = Arc::new(InMemoryL2Store::new());
        let cache = SemanticCache::new(Some(l2));
        let a = args(&[("x", json!(1))]);
        cache.set("f", &a, json!(1), "INTEGER", 0, "s", "c");
        // `order_by` containing injection-shaped text falls back to the default.
        let rows = cache.list_entries(None, 10, 0, "hit_count; DROP TABLE cache --");
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn prune_expired_removes_only_past_entries() {
        let cache = SemanticCache::new(None);
        let a = args(&[("x", json!(1))]);
        cache.set("f", &a, json!(1), "INTEGER", 0, "s", "c");
        assert_eq!(cache.prune_expired(), 0);
    }
}
