//! In-Memory Adapters
//!
//! Process-local implementations of the [`KeyValueStore`] and [`OrderStore`]
//! ports. Used by tests, the simulation binary and single-node setups.
//!
//! Every key-value command takes one global mutex, so each command (and
//! each [`ServerScript`]) is atomic with respect to every other command,
//! matching the single-threaded execution model of Redis.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::domain::ports::{
    KeyValueStore, OrderStore, PendingOrder, PersistOutcome, ServerScript, UserId, VoucherId,
};
use crate::error::{Error, Result};

// =============================================================================
// Key-Value Store
// =============================================================================

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Hash(HashMap<String, String>),
    Set(HashSet<String>),
}

#[derive(Debug, Clone)]
struct Slot {
    value: Value,
    expires_at: Option<Instant>,
}

impl Slot {
    fn new(value: Value, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Keyspace guarded by the store mutex.
#[derive(Debug, Default)]
struct Keyspace {
    slots: HashMap<String, Slot>,
}

impl Keyspace {
    /// Live slot for `key`, evicting it first if its TTL has passed.
    fn live(&mut self, key: &str) -> Option<&mut Slot> {
        let now = Instant::now();
        if self.slots.get(key).is_some_and(|slot| slot.is_expired(now)) {
            self.slots.remove(key);
        }
        self.slots.get_mut(key)
    }

    fn get_str(&mut self, key: &str) -> Result<Option<String>> {
        match self.live(key) {
            None => Ok(None),
            Some(Slot {
                value: Value::Str(s),
                ..
            }) => Ok(Some(s.clone())),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn hash_field(&mut self, key: &str, field: &str) -> Result<Option<String>> {
        match self.live(key) {
            None => Ok(None),
            Some(Slot {
                value: Value::Hash(h),
                ..
            }) => Ok(h.get(field).cloned()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn is_member(&mut self, key: &str, member: &str) -> Result<bool> {
        match self.live(key) {
            None => Ok(false),
            Some(Slot {
                value: Value::Set(s),
                ..
            }) => Ok(s.contains(member)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn add_member(&mut self, key: &str, member: &str) -> Result<bool> {
        if self.live(key).is_none() {
            self.slots
                .insert(key.to_string(), Slot::new(Value::Set(HashSet::new()), None));
        }
        match self.slots.get_mut(key) {
            Some(Slot {
                value: Value::Set(s),
                ..
            }) => Ok(s.insert(member.to_string())),
            _ => Err(wrong_type(key)),
        }
    }

    /// INCRBY semantics, keeping any existing TTL.
    fn incr_by(&mut self, key: &str, delta: i64) -> Result<i64> {
        match self.live(key) {
            None => {
                self.slots
                    .insert(key.to_string(), Slot::new(Value::Str(delta.to_string()), None));
                Ok(delta)
            }
            Some(Slot {
                value: Value::Str(s),
                ..
            }) => {
                let current: i64 = s
                    .parse()
                    .map_err(|_| Error::Substrate(format!("value at {} is not an integer", key)))?;
                let next = current
                    .checked_add(delta)
                    .ok_or_else(|| Error::Substrate(format!("increment overflow at {}", key)))?;
                *s = next.to_string();
                Ok(next)
            }
            Some(_) => Err(wrong_type(key)),
        }
    }
}

fn wrong_type(key: &str) -> Error {
    Error::Substrate(format!(
        "WRONGTYPE operation against key {} holding the wrong kind of value",
        key
    ))
}

fn script_arg<'a>(values: &'a [String], index: usize, script: ServerScript) -> Result<&'a str> {
    values
        .get(index)
        .map(String::as_str)
        .ok_or_else(|| Error::Substrate(format!("script {} missing argument {}", script, index)))
}

/// In-memory key-value substrate.
#[derive(Debug, Default)]
pub struct InMemoryKeyValueStore {
    keyspace: Mutex<Keyspace>,
    commands: AtomicU64,
    unavailable: AtomicBool,
}

impl InMemoryKeyValueStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of commands served so far (each script counts as one).
    pub fn command_count(&self) -> u64 {
        self.commands.load(Ordering::Relaxed)
    }

    /// Simulate the store being unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Remaining physical TTL of a key, `None` if absent or persistent.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let mut keyspace = self.keyspace.lock();
        let slot = keyspace.live(key)?;
        slot.expires_at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Whether a live key exists.
    pub fn contains(&self, key: &str) -> bool {
        self.keyspace.lock().live(key).is_some()
    }

    fn begin(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::Substrate("connection refused".to_string()));
        }
        self.commands.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn release_lock(keyspace: &mut Keyspace, keys: &[String], args: &[String]) -> Result<i64> {
        let key = script_arg(keys, 0, ServerScript::ReleaseLock)?;
        let token = script_arg(args, 0, ServerScript::ReleaseLock)?;
        if keyspace.get_str(key)?.as_deref() == Some(token) {
            keyspace.slots.remove(key);
            Ok(1)
        } else {
            Ok(0)
        }
    }

    fn admit_order(keyspace: &mut Keyspace, keys: &[String], args: &[String]) -> Result<i64> {
        let script = ServerScript::AdmitOrder;
        let stock_key = script_arg(keys, 0, script)?;
        let order_key = script_arg(keys, 1, script)?;
        let window_key = script_arg(keys, 2, script)?;
        let user = script_arg(args, 0, script)?;
        let now: i64 = script_arg(args, 1, script)?
            .parse()
            .map_err(|_| Error::Substrate("script seckill: now is not an integer".to_string()))?;

        let Some(stock) = keyspace.get_str(stock_key)? else {
            return Ok(5);
        };

        // A bound that is present but not a number fails the script, as a
        // comparison against nil would
        let mut bound = |field: &str| -> Result<Option<i64>> {
            match keyspace.hash_field(window_key, field)? {
                None => Ok(None),
                Some(raw) => raw.parse::<i64>().map(Some).map_err(|_| {
                    Error::Substrate(format!("script seckill: {} of {} is not a number", field, window_key))
                }),
            }
        };
        if bound("beginTime")?.is_some_and(|begin| now < begin) {
            return Ok(3);
        }
        if bound("endTime")?.is_some_and(|end| now > end) {
            return Ok(4);
        }

        let stock = stock
            .parse::<i64>()
            .map_err(|_| Error::Substrate(format!("value at {} is not an integer", stock_key)))?;
        if stock < 1 {
            return Ok(1);
        }
        if keyspace.is_member(order_key, user)? {
            return Ok(2);
        }

        keyspace.incr_by(stock_key, -1)?;
        keyspace.add_member(order_key, user)?;
        Ok(0)
    }
}

#[async_trait]
impl KeyValueStore for InMemoryKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.begin()?;
        self.keyspace.lock().get_str(key)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.begin()?;
        self.keyspace
            .lock()
            .slots
            .insert(key.to_string(), Slot::new(Value::Str(value.to_string()), ttl));
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        self.begin()?;
        let mut keyspace = self.keyspace.lock();
        if keyspace.live(key).is_some() {
            return Ok(false);
        }
        keyspace.slots.insert(
            key.to_string(),
            Slot::new(Value::Str(value.to_string()), Some(ttl)),
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.begin()?;
        let mut keyspace = self.keyspace.lock();
        let existed = keyspace.live(key).is_some();
        keyspace.slots.remove(key);
        Ok(existed)
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        self.begin()?;
        self.keyspace.lock().incr_by(key, 1)
    }

    async fn hset_all(&self, key: &str, fields: &[(String, String)]) -> Result<()> {
        self.begin()?;
        let mut keyspace = self.keyspace.lock();
        if keyspace.live(key).is_none() {
            keyspace
                .slots
                .insert(key.to_string(), Slot::new(Value::Hash(HashMap::new()), None));
        }
        match keyspace.slots.get_mut(key) {
            Some(Slot {
                value: Value::Hash(h),
                ..
            }) => {
                h.extend(fields.iter().cloned());
                Ok(())
            }
            _ => Err(wrong_type(key)),
        }
    }

    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>> {
        self.begin()?;
        match self.keyspace.lock().live(key) {
            None => Ok(HashMap::new()),
            Some(Slot {
                value: Value::Hash(h),
                ..
            }) => Ok(h.clone()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool> {
        self.begin()?;
        self.keyspace.lock().add_member(key, member)
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool> {
        self.begin()?;
        self.keyspace.lock().is_member(key, member)
    }

    async fn eval(&self, script: ServerScript, keys: &[String], args: &[String]) -> Result<i64> {
        self.begin()?;
        let mut keyspace = self.keyspace.lock();
        match script {
            ServerScript::ReleaseLock => Self::release_lock(&mut keyspace, keys, args),
            ServerScript::AdmitOrder => Self::admit_order(&mut keyspace, keys, args),
        }
    }
}

// =============================================================================
// Order Store
// =============================================================================

#[derive(Debug, Default)]
struct OrderTables {
    stock: HashMap<VoucherId, i64>,
    orders: Vec<PendingOrder>,
}

impl OrderTables {
    fn has_order(&self, user: UserId, voucher: VoucherId) -> bool {
        self.orders
            .iter()
            .any(|o| o.user_id == user && o.voucher_id == voucher)
    }

    fn decrement_stock(&mut self, voucher: VoucherId) -> bool {
        match self.stock.get_mut(&voucher) {
            Some(stock) if *stock >= 1 => {
                *stock -= 1;
                true
            }
            _ => false,
        }
    }
}

/// In-memory durable store. One mutex covers both tables, which makes
/// [`OrderStore::commit_order`] a single transaction.
#[derive(Debug, Default)]
pub struct InMemoryOrderStore {
    tables: Mutex<OrderTables>,
    unavailable: AtomicBool,
}

impl InMemoryOrderStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed durable stock for a voucher.
    pub fn with_voucher(self, voucher: VoucherId, stock: i64) -> Self {
        self.set_stock(voucher, stock);
        self
    }

    pub fn set_stock(&self, voucher: VoucherId, stock: i64) {
        self.tables.lock().stock.insert(voucher, stock);
    }

    /// Durable stock for a voucher.
    pub fn stock(&self, voucher: VoucherId) -> Option<i64> {
        self.tables.lock().stock.get(&voucher).copied()
    }

    /// Snapshot of all persisted orders, in insertion order.
    pub fn orders(&self) -> Vec<PendingOrder> {
        self.tables.lock().orders.clone()
    }

    pub fn order_count(&self) -> usize {
        self.tables.lock().orders.len()
    }

    /// Simulate the database being unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::DurableStore("database unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl OrderStore for InMemoryOrderStore {
    async fn has_order(&self, user: UserId, voucher: VoucherId) -> Result<bool> {
        self.check()?;
        Ok(self.tables.lock().has_order(user, voucher))
    }

    async fn decrement_stock(&self, voucher: VoucherId) -> Result<bool> {
        self.check()?;
        Ok(self.tables.lock().decrement_stock(voucher))
    }

    async fn insert_order(&self, order: &PendingOrder) -> Result<()> {
        self.check()?;
        self.tables.lock().orders.push(order.clone());
        Ok(())
    }

    async fn commit_order(&self, order: &PendingOrder) -> Result<PersistOutcome> {
        self.check()?;
        let mut tables = self.tables.lock();
        if tables.has_order(order.user_id, order.voucher_id) {
            return Ok(PersistOutcome::Duplicate);
        }
        if !tables.decrement_stock(order.voucher_id) {
            return Ok(PersistOutcome::OutOfStock);
        }
        tables.orders.push(order.clone());
        Ok(PersistOutcome::Persisted)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn keys(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_string_roundtrip_and_ttl() {
        let store = InMemoryKeyValueStore::new();
        store.set("k", "v", Some(Duration::from_millis(30))).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
        assert!(store.ttl("k").is_some());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_if_absent() {
        let store = InMemoryKeyValueStore::new();
        assert!(store.set_if_absent("lock:a", "t1", Duration::from_secs(10)).await.unwrap());
        assert!(!store.set_if_absent("lock:a", "t2", Duration::from_secs(10)).await.unwrap());
        assert_eq!(store.get("lock:a").await.unwrap().as_deref(), Some("t1"));
    }

    #[tokio::test]
    async fn test_incr_from_absent() {
        let store = InMemoryKeyValueStore::new();
        assert_eq!(store.incr("icr:x").await.unwrap(), 1);
        assert_eq!(store.incr("icr:x").await.unwrap(), 2);

        store.set("text", "abc", None).await.unwrap();
        assert!(store.incr("text").await.is_err());
    }

    #[tokio::test]
    async fn test_hash_and_set() {
        let store = InMemoryKeyValueStore::new();
        store
            .hset_all("h", &[("a".into(), "1".into()), ("b".into(), "2".into())])
            .await
            .unwrap();
        let all = store.hget_all("h").await.unwrap();
        assert_eq!(all.get("b").map(String::as_str), Some("2"));
        assert!(store.hget_all("missing").await.unwrap().is_empty());

        assert!(store.sadd("s", "u1").await.unwrap());
        assert!(!store.sadd("s", "u1").await.unwrap());
        assert!(store.sismember("s", "u1").await.unwrap());
        assert!(store.get("s").await.is_err());
    }

    #[tokio::test]
    async fn test_release_script_checks_token() {
        let store = InMemoryKeyValueStore::new();
        store.set("lock:r", "mine", None).await.unwrap();

        let other = store
            .eval(ServerScript::ReleaseLock, &keys(&["lock:r"]), &keys(&["theirs"]))
            .await
            .unwrap();
        assert_eq!(other, 0);
        assert!(store.contains("lock:r"));

        let own = store
            .eval(ServerScript::ReleaseLock, &keys(&["lock:r"]), &keys(&["mine"]))
            .await
            .unwrap();
        assert_eq!(own, 1);
        assert!(!store.contains("lock:r"));
    }

    #[tokio::test]
    async fn test_admit_script_codes() {
        let store = InMemoryKeyValueStore::new();
        let k = keys(&["seckill:stock:1", "seckill:order:1", "seckill:window:1"]);

        let code = store.eval(ServerScript::AdmitOrder, &k, &keys(&["7", "100"])).await.unwrap();
        assert_eq!(code, 5);

        store.set("seckill:stock:1", "1", None).await.unwrap();
        store
            .hset_all(
                "seckill:window:1",
                &[("beginTime".into(), "50".into()), ("endTime".into(), "200".into())],
            )
            .await
            .unwrap();

        assert_eq!(store.eval(ServerScript::AdmitOrder, &k, &keys(&["7", "10"])).await.unwrap(), 3);
        assert_eq!(store.eval(ServerScript::AdmitOrder, &k, &keys(&["7", "300"])).await.unwrap(), 4);
        assert_eq!(store.eval(ServerScript::AdmitOrder, &k, &keys(&["7", "100"])).await.unwrap(), 0);
        assert_eq!(store.eval(ServerScript::AdmitOrder, &k, &keys(&["7", "100"])).await.unwrap(), 1);

        store.set("seckill:stock:1", "5", None).await.unwrap();
        assert_eq!(store.eval(ServerScript::AdmitOrder, &k, &keys(&["7", "100"])).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_admit_script_rejects_malformed_window() {
        let store = InMemoryKeyValueStore::new();
        let k = keys(&["seckill:stock:2", "seckill:order:2", "seckill:window:2"]);
        store.set("seckill:stock:2", "3", None).await.unwrap();
        store
            .hset_all("seckill:window:2", &[("beginTime".into(), "soon".into())])
            .await
            .unwrap();

        let result = store.eval(ServerScript::AdmitOrder, &k, &keys(&["7", "100"])).await;
        assert!(matches!(result, Err(Error::Substrate(_))));
        assert_eq!(store.get("seckill:stock:2").await.unwrap().as_deref(), Some("3"));
        assert!(!store.sismember("seckill:order:2", "7").await.unwrap());
    }

    #[tokio::test]
    async fn test_unavailable_store_fails() {
        let store = InMemoryKeyValueStore::new();
        store.set_unavailable(true);
        assert!(matches!(store.get("k").await, Err(Error::Substrate(_))));
        store.set_unavailable(false);
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_commit_order_transaction() {
        let voucher = VoucherId::new(1);
        let store = InMemoryOrderStore::new().with_voucher(voucher, 1);
        let order = PendingOrder::new(1.into(), voucher, UserId::new(9), Utc::now());

        assert_eq!(store.commit_order(&order).await.unwrap(), PersistOutcome::Persisted);
        assert_eq!(store.commit_order(&order).await.unwrap(), PersistOutcome::Duplicate);

        let other = PendingOrder::new(2.into(), voucher, UserId::new(10), Utc::now());
        assert_eq!(store.commit_order(&other).await.unwrap(), PersistOutcome::OutOfStock);
        assert_eq!(store.order_count(), 1);
        assert_eq!(store.stock(voucher), Some(0));
    }

    #[tokio::test]
    async fn test_fine_grained_order_ops() {
        let voucher = VoucherId::new(4);
        let store = InMemoryOrderStore::new().with_voucher(voucher, 1);
        let order = PendingOrder::new(1.into(), voucher, UserId::new(2), Utc::now());

        assert!(!store.has_order(order.user_id, voucher).await.unwrap());
        assert!(store.decrement_stock(voucher).await.unwrap());
        assert!(!store.decrement_stock(voucher).await.unwrap());
        store.insert_order(&order).await.unwrap();
        assert!(store.has_order(order.user_id, voucher).await.unwrap());
    }
}
