//! # Key/Value Store
//!
//! The shared cache store behind locks, transactions, version vectors,
//! retry records and dead letters.
//!
//! ## Backends
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     KeyValueStore (trait)                               │
//! │                                                                         │
//! │  ┌──────────────────────────────┐   ┌──────────────────────────────┐   │
//! │  │  RedisStore                  │   │  MemoryStore                 │   │
//! │  │  ──────────                  │   │  ───────────                 │   │
//! │  │  ConnectionManager           │   │  One mutex over a HashMap    │   │
//! │  │  (auto-reconnect, cloneable) │   │  of strings, hashes, sets    │   │
//! │  │  Lua for check-and-delete    │   │  TTL via tokio::time::Instant│   │
//! │  │  and check-and-expire        │   │  (pausable in tests)         │   │
//! │  └──────────────────────────────┘   └──────────────────────────────┘   │
//! │                                                                         │
//! │  Chosen once at construction. Nothing falls back from one to the other.│
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};

// =============================================================================
// Trait
// =============================================================================

/// Minimal command set the engine needs from the shared cache store.
///
/// Every conditional write is atomic with respect to other callers.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Short backend name for logs ("redis", "memory").
    fn backend(&self) -> &'static str;

    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Unconditional set, optionally expiring after `ttl`.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()>;

    /// SET NX with expiry. Returns true when the key was written.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool>;

    /// Deletes keys and returns how many existed.
    async fn delete(&self, keys: &[String]) -> StoreResult<u64>;

    /// Deletes `key` and `also` together, only if `key` currently holds
    /// `expected`. Returns true when the delete happened.
    async fn delete_if_equals(&self, key: &str, expected: &str, also: &[String])
        -> StoreResult<bool>;

    /// Resets the expiry of `key` and `also`, only if `key` currently holds
    /// `expected`.
    async fn expire_if_equals(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
        also: &[String],
    ) -> StoreResult<bool>;

    async fn exists(&self, key: &str) -> StoreResult<bool>;

    /// Sets the expiry of an existing key. Returns false if it does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool>;

    async fn hset(&self, key: &str, fields: &[(String, String)]) -> StoreResult<()>;

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>>;

    async fn hget_all(&self, key: &str) -> StoreResult<HashMap<String, String>>;

    /// Atomically adds `delta` to an integer hash field and returns the result.
    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> StoreResult<i64>;

    /// Returns true if the member was newly added.
    async fn sadd(&self, key: &str, member: &str) -> StoreResult<bool>;

    /// Returns true if the member was present.
    async fn srem(&self, key: &str, member: &str) -> StoreResult<bool>;

    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>>;

    /// Keys matching a glob pattern (`*` and `?`).
    async fn scan_keys(&self, pattern: &str) -> StoreResult<Vec<String>>;
}

// =============================================================================
// Redis Backend
// =============================================================================

const DELETE_IF_EQUALS: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', unpack(KEYS))
end
return 0
"#;

const EXPIRE_IF_EQUALS: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    for _, key in ipairs(KEYS) do
        redis.call('PEXPIRE', key, ARGV[2])
    end
    return 1
end
return 0
"#;

/// Redis-backed store using a self-reconnecting connection manager.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    delete_script: redis::Script,
    expire_script: redis::Script,
}

impl RedisStore {
    /// Connects to Redis at `url`.
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let client =
            redis::Client::open(url).map_err(|e| StoreError::Connection(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        info!(url = %url, "Connected to Redis");

        Ok(RedisStore {
            conn,
            delete_script: redis::Script::new(DELETE_IF_EQUALS),
            expire_script: redis::Script::new(EXPIRE_IF_EQUALS),
        })
    }
}

fn millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl KeyValueStore for RedisStore {
    fn backend(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(millis(ttl));
        }
        let _: () = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn delete(&self, keys: &[String]) -> StoreResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        let removed: u64 = conn.del(keys).await?;
        Ok(removed)
    }

    async fn delete_if_equals(
        &self,
        key: &str,
        expected: &str,
        also: &[String],
    ) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let mut invocation = self.delete_script.prepare_invoke();
        invocation.key(key);
        for extra in also {
            invocation.key(extra.as_str());
        }
        invocation.arg(expected);
        let removed: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(removed > 0)
    }

    async fn expire_if_equals(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
        also: &[String],
    ) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let mut invocation = self.expire_script.prepare_invoke();
        invocation.key(key);
        for extra in also {
            invocation.key(extra.as_str());
        }
        invocation.arg(expected).arg(millis(ttl));
        let updated: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(updated == 1)
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let exists: bool = conn.exists(key).await?;
        Ok(exists)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let updated: i64 = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(updated == 1)
    }

    async fn hset(&self, key: &str, fields: &[(String, String)]) -> StoreResult<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let _: () = conn.hset_multiple(key, fields).await?;
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.hget(key, field).await?;
        Ok(value)
    }

    async fn hget_all(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn.hgetall(key).await?;
        Ok(fields)
    }

    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> StoreResult<i64> {
        let mut conn = self.conn.clone();
        let value: i64 = conn.hincr(key, field, delta).await?;
        Ok(value)
    }

    async fn sadd(&self, key: &str, member: &str) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let added: i64 = conn.sadd(key, member).await?;
        Ok(added > 0)
    }

    async fn srem(&self, key: &str, member: &str) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.srem(key, member).await?;
        Ok(removed > 0)
    }

    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = conn.smembers(key).await?;
        Ok(members)
    }

    async fn scan_keys(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        keys.sort();
        keys.dedup();
        debug!(pattern = %pattern, count = keys.len(), "Scanned keys");
        Ok(keys)
    }
}

// =============================================================================
// In-Memory Backend
// =============================================================================

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Hash(HashMap<String, String>),
    Set(BTreeSet<String>),
}

#[derive(Debug, Clone)]
struct Slot {
    value: Value,
    expires_at: Option<Instant>,
}

impl Slot {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

/// In-process store with the same semantics as [`RedisStore`].
///
/// Expiry uses `tokio::time::Instant`, so tests running with a paused clock
/// can advance past a TTL without sleeping for real.
#[derive(Debug, Default)]
pub struct MemoryStore {
    slots: Mutex<HashMap<String, Slot>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::Command(format!(
        "WRONGTYPE Operation against key '{}' holding the wrong kind of value",
        key
    ))
}

/// Returns the live slot for `key`, evicting it first if it has expired.
fn live<'a>(slots: &'a mut HashMap<String, Slot>, key: &str) -> Option<&'a mut Slot> {
    let now = Instant::now();
    if slots.get(key).is_some_and(|slot| !slot.is_live(now)) {
        slots.remove(key);
    }
    slots.get_mut(key)
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut slots = self.slots.lock().await;
        match live(&mut slots, key) {
            Some(Slot {
                value: Value::Str(s),
                ..
            }) => Ok(Some(s.clone())),
            Some(_) => Err(wrong_type(key)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let mut slots = self.slots.lock().await;
        slots.insert(
            key.to_string(),
            Slot {
                value: Value::Str(value.to_string()),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let mut slots = self.slots.lock().await;
        if live(&mut slots, key).is_some() {
            return Ok(false);
        }
        slots.insert(
            key.to_string(),
            Slot {
                value: Value::Str(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn delete(&self, keys: &[String]) -> StoreResult<u64> {
        let mut slots = self.slots.lock().await;
        let mut removed = 0;
        for key in keys {
            if live(&mut slots, key).is_some() {
                slots.remove(key);
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn delete_if_equals(
        &self,
        key: &str,
        expected: &str,
        also: &[String],
    ) -> StoreResult<bool> {
        let mut slots = self.slots.lock().await;
        let matches = matches!(
            live(&mut slots, key),
            Some(Slot { value: Value::Str(s), .. }) if s == expected
        );
        if !matches {
            return Ok(false);
        }
        slots.remove(key);
        for extra in also {
            slots.remove(extra);
        }
        Ok(true)
    }

    async fn expire_if_equals(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
        also: &[String],
    ) -> StoreResult<bool> {
        let mut slots = self.slots.lock().await;
        let matches = matches!(
            live(&mut slots, key),
            Some(Slot { value: Value::Str(s), .. }) if s == expected
        );
        if !matches {
            return Ok(false);
        }
        let expires_at = Some(Instant::now() + ttl);
        for k in std::iter::once(key).chain(also.iter().map(String::as_str)) {
            if let Some(slot) = live(&mut slots, k) {
                slot.expires_at = expires_at;
            }
        }
        Ok(true)
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let mut slots = self.slots.lock().await;
        Ok(live(&mut slots, key).is_some())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let mut slots = self.slots.lock().await;
        match live(&mut slots, key) {
            Some(slot) => {
                slot.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn hset(&self, key: &str, fields: &[(String, String)]) -> StoreResult<()> {
        let mut slots = self.slots.lock().await;
        if live(&mut slots, key).is_none() {
            slots.insert(
                key.to_string(),
                Slot {
                    value: Value::Hash(HashMap::new()),
                    expires_at: None,
                },
            );
        }
        match slots.get_mut(key) {
            Some(Slot {
                value: Value::Hash(hash),
                ..
            }) => {
                for (field, value) in fields {
                    hash.insert(field.clone(), value.clone());
                }
                Ok(())
            }
            _ => Err(wrong_type(key)),
        }
    }

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        let mut slots = self.slots.lock().await;
        match live(&mut slots, key) {
            Some(Slot {
                value: Value::Hash(hash),
                ..
            }) => Ok(hash.get(field).cloned()),
            Some(_) => Err(wrong_type(key)),
            None => Ok(None),
        }
    }

    async fn hget_all(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        let mut slots = self.slots.lock().await;
        match live(&mut slots, key) {
            Some(Slot {
                value: Value::Hash(hash),
                ..
            }) => Ok(hash.clone()),
            Some(_) => Err(wrong_type(key)),
            None => Ok(HashMap::new()),
        }
    }

    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> StoreResult<i64> {
        let mut slots = self.slots.lock().await;
        if live(&mut slots, key).is_none() {
            slots.insert(
                key.to_string(),
                Slot {
                    value: Value::Hash(HashMap::new()),
                    expires_at: None,
                },
            );
        }
        match slots.get_mut(key) {
            Some(Slot {
                value: Value::Hash(hash),
                ..
            }) => {
                let current = match hash.get(field) {
                    Some(raw) => raw.parse::<i64>().map_err(|_| {
                        StoreError::Command(format!(
                            "hash value at '{}'.'{}' is not an integer",
                            key, field
                        ))
                    })?,
                    None => 0,
                };
                let next = current + delta;
                hash.insert(field.to_string(), next.to_string());
                Ok(next)
            }
            _ => Err(wrong_type(key)),
        }
    }

    async fn sadd(&self, key: &str, member: &str) -> StoreResult<bool> {
        let mut slots = self.slots.lock().await;
        if live(&mut slots, key).is_none() {
            slots.insert(
                key.to_string(),
                Slot {
                    value: Value::Set(BTreeSet::new()),
                    expires_at: None,
                },
            );
        }
        match slots.get_mut(key) {
            Some(Slot {
                value: Value::Set(set),
                ..
            }) => Ok(set.insert(member.to_string())),
            _ => Err(wrong_type(key)),
        }
    }

    async fn srem(&self, key: &str, member: &str) -> StoreResult<bool> {
        let mut slots = self.slots.lock().await;
        let (removed, now_empty) = match live(&mut slots, key) {
            Some(Slot {
                value: Value::Set(set),
                ..
            }) => (set.remove(member), set.is_empty()),
            Some(_) => return Err(wrong_type(key)),
            None => return Ok(false),
        };
        if now_empty {
            slots.remove(key);
        }
        Ok(removed)
    }

    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>> {
        let mut slots = self.slots.lock().await;
        match live(&mut slots, key) {
            Some(Slot {
                value: Value::Set(set),
                ..
            }) => Ok(set.iter().cloned().collect()),
            Some(_) => Err(wrong_type(key)),
            None => Ok(Vec::new()),
        }
    }

    async fn scan_keys(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let mut slots = self.slots.lock().await;
        let now = Instant::now();
        slots.retain(|_, slot| slot.is_live(now));

        let mut keys: Vec<String> = slots
            .keys()
            .filter(|key| glob_match(pattern, key))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}

/// Redis-style glob supporting `*` and `?`.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((sp, st)) = star {
            pi = sp + 1;
            ti = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }

    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_nx_only_once() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(10);
        assert!(store.set_nx_ex("lock:a", "x", ttl).await.unwrap());
        assert!(!store.set_nx_ex("lock:a", "y", ttl).await.unwrap());
        assert_eq!(store.get("lock:a").await.unwrap(), Some("x".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_expire() {
        let store = MemoryStore::new();
        store
            .set("k", "v", Some(Duration::from_secs(2)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1900)).await;
        assert!(store.exists("k").await.unwrap());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!store.exists("k").await.unwrap());
        assert!(store.set_nx_ex("k", "w", Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_if_equals_checks_value() {
        let store = MemoryStore::new();
        store.set("lock:r", "token-1", None).await.unwrap();
        store
            .hset("lock:meta:r", &[("holder_id".into(), "a".into())])
            .await
            .unwrap();

        let also = vec!["lock:meta:r".to_string()];
        assert!(!store.delete_if_equals("lock:r", "token-2", &also).await.unwrap());
        assert!(store.exists("lock:r").await.unwrap());

        assert!(store.delete_if_equals("lock:r", "token-1", &also).await.unwrap());
        assert!(!store.exists("lock:r").await.unwrap());
        assert!(!store.exists("lock:meta:r").await.unwrap());
    }

    #[tokio::test]
    async fn test_hash_and_set_commands() {
        let store = MemoryStore::new();
        assert_eq!(store.hincr_by("h", "count", 2).await.unwrap(), 2);
        assert_eq!(store.hincr_by("h", "count", 3).await.unwrap(), 5);
        assert_eq!(store.hget("h", "count").await.unwrap(), Some("5".into()));

        assert!(store.sadd("s", "a").await.unwrap());
        assert!(!store.sadd("s", "a").await.unwrap());
        assert_eq!(store.smembers("s").await.unwrap(), vec!["a".to_string()]);
        assert!(store.srem("s", "a").await.unwrap());
        assert!(store.smembers("s").await.unwrap().is_empty());

        assert!(store.get("h").await.is_err());
    }

    #[tokio::test]
    async fn test_scan_keys() {
        let store = MemoryStore::new();
        for key in ["lock:meta:a", "lock:meta:b", "lock:a", "knowledge:1:related:k1"] {
            store.set(key, "1", None).await.unwrap();
        }
        assert_eq!(
            store.scan_keys("lock:meta:*").await.unwrap(),
            vec!["lock:meta:a".to_string(), "lock:meta:b".to_string()]
        );
        assert_eq!(
            store.scan_keys("knowledge:*:related:k1").await.unwrap().len(),
            1
        );
    }

    #[test]
    fn test_glob_match() {
        assert!(glob_match("a*c", "abbbc"));
        assert!(glob_match("a?c", "abc"));
        assert!(!glob_match("a?c", "abbc"));
        assert!(glob_match("*", ""));
        assert!(!glob_match("lock:*", "transaction:1"));
    }
}
