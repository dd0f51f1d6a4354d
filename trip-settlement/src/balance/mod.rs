//! Driver balances in a key-value store
//!
//! Balances live under `saldo:<driver name>` as decimal strings. Every
//! read-modify-write goes through an optimistic transaction: watch the keys,
//! read them, queue the writes and commit. A commit that loses a race is
//! retried from the read, with jittered exponential backoff, up to
//! [`RetryPolicy::max_attempts`] times.
//!
//! Crediting a trip also writes a settlement marker `liquidacao:<trip id>` in
//! the same transaction, so a redelivered event never credits twice while the
//! marker lives.

pub mod backend;
pub mod memory;
pub mod redis;

pub use self::backend::{KvBackend, Write};
pub use self::memory::MemoryBackend;
pub use self::redis::RedisBackend;

use crate::amount::parse_decimal;
use crate::error::{StoreError, StoreResult};
use crate::metrics::{BALANCE_CONFLICTS_TOTAL, BALANCE_EXHAUSTED_TOTAL};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default balance key prefix
pub const BALANCE_PREFIX: &str = "saldo:";

/// Default settlement marker prefix
pub const MARKER_PREFIX: &str = "liquidacao:";

/// Retry policy for optimistic transactions
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 50,
            base_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following `attempt`, with up to 50% jitter
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let base = self.base_backoff.as_secs_f64() * 2f64.powi(exponent as i32);
        let capped = base.min(self.max_backoff.as_secs_f64());

        let jitter = 1.0 - rand::random::<f64>() * 0.5;
        Duration::from_secs_f64(capped * jitter)
    }
}

/// Balance store settings
#[derive(Debug, Clone)]
pub struct BalanceStoreConfig {
    pub key_prefix: String,
    pub marker_prefix: String,
    /// Must outlive the broker's redelivery horizon
    pub marker_ttl: Duration,
    pub retry: RetryPolicy,
}

impl Default for BalanceStoreConfig {
    fn default() -> Self {
        Self {
            key_prefix: BALANCE_PREFIX.to_string(),
            marker_prefix: MARKER_PREFIX.to_string(),
            marker_ttl: Duration::from_secs(7 * 24 * 60 * 60),
            retry: RetryPolicy::default(),
        }
    }
}

/// Result of crediting a trip
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Credit {
    /// The fare was added; `balance` is the new value
    Applied { balance: Decimal },
    /// The trip was already credited. `recorded` is the balance written then.
    Duplicate { recorded: Option<Decimal> },
}

enum Step<T> {
    Commit(Vec<Write>, T),
    Done(T),
}

/// Balance store over a [`KvBackend`]
pub struct BalanceStore<B> {
    backend: B,
    config: BalanceStoreConfig,
}

impl<B: KvBackend> BalanceStore<B> {
    pub fn new(backend: B, config: BalanceStoreConfig) -> Self {
        Self { backend, config }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn config(&self) -> &BalanceStoreConfig {
        &self.config
    }

    /// `saldo:<driver name>`, with the name exactly as given
    pub fn balance_key(&self, driver_name: &str) -> String {
        format!("{}{}", self.config.key_prefix, driver_name)
    }

    pub fn marker_key(&self, trip_id: &str) -> String {
        format!("{}{}", self.config.marker_prefix, trip_id)
    }

    /// Strip the balance prefix from a key
    pub fn driver_of<'k>(&self, key: &'k str) -> Option<&'k str> {
        key.strip_prefix(self.config.key_prefix.as_str())
    }

    /// Current balance, zero when the key is absent
    pub async fn get_balance(&self, key: &str) -> StoreResult<Decimal> {
        let raw = self.backend.get(key).await?;
        parse_balance(key, raw.as_deref())
    }

    /// Add `delta` to the balance at `key` and return the new value
    pub async fn atomic_increment(&self, key: &str, delta: Decimal) -> StoreResult<Decimal> {
        let keys = [key.to_string()];

        self.optimistic("increment", key, &keys, |values| {
            let balance = add(key, parse_balance(key, values[0].as_deref())?, delta)?;
            Ok(Step::Commit(vec![Write::set(key, balance.to_string())], balance))
        })
        .await
    }

    /// Credit `delta` for `trip_id` unless that trip was already credited.
    ///
    /// The new balance and the settlement marker are written in one
    /// transaction that watches both keys.
    pub async fn credit_once(&self, key: &str, trip_id: &str, delta: Decimal) -> StoreResult<Credit> {
        let marker = self.marker_key(trip_id);
        let keys = [key.to_string(), marker.clone()];
        let ttl = self.config.marker_ttl;

        self.optimistic("credit", key, &keys, |values| {
            if let Some(recorded) = values[1].as_deref() {
                return Ok(Step::Done(Credit::Duplicate {
                    recorded: parse_decimal(recorded),
                }));
            }

            let balance = add(key, parse_balance(key, values[0].as_deref())?, delta)?;
            let value = balance.to_string();
            Ok(Step::Commit(
                vec![
                    Write::set(key, value.clone()),
                    Write::set_with_ttl(marker.clone(), value, ttl),
                ],
                Credit::Applied { balance },
            ))
        })
        .await
    }

    /// Every key starting with `prefix`. Not a snapshot: keys written during
    /// the scan may or may not appear.
    pub async fn list_keys(&self, prefix: &str) -> StoreResult<BTreeSet<String>> {
        let pattern = format!("{}*", escape_glob(prefix));
        let keys = self.backend.scan(&pattern).await?;
        Ok(keys.into_iter().collect())
    }

    /// All balance keys
    pub async fn balance_keys(&self) -> StoreResult<BTreeSet<String>> {
        self.list_keys(&self.config.key_prefix).await
    }

    /// Unconditional write
    pub async fn set(&self, key: &str, value: Decimal) -> StoreResult<()> {
        self.backend.set(key, &value.to_string()).await
    }

    /// Unconditional delete
    pub async fn delete(&self, key: &str) -> StoreResult<()> {
        self.backend.delete(key).await
    }

    /// Authoritative balance of a driver: the sum over every key whose name
    /// matches `driver_name` ignoring case.
    pub async fn driver_balance(&self, driver_name: &str) -> StoreResult<Decimal> {
        let pattern = format!(
            "{}{}",
            escape_glob(&self.config.key_prefix),
            case_insensitive_glob(driver_name)
        );
        let identity = driver_name.to_lowercase();

        let mut total = Decimal::ZERO;
        for key in self.backend.scan(&pattern).await? {
            let same_driver = self
                .driver_of(&key)
                .map_or(false, |name| name.to_lowercase() == identity);
            if same_driver {
                total = add(&key, total, self.get_balance(&key).await?)?;
            }
        }

        Ok(total)
    }

    /// Move the sum of `members` into `canonical` and delete the other
    /// members, in one transaction. Returns the merged total.
    pub async fn merge(&self, members: &[String], canonical: &str) -> StoreResult<Decimal> {
        let mut keys: Vec<String> = members.to_vec();
        if !keys.iter().any(|key| key == canonical) {
            keys.push(canonical.to_string());
        }

        self.optimistic("merge", canonical, &keys, |values| {
            let mut total = Decimal::ZERO;
            for (key, raw) in keys.iter().zip(values) {
                total = add(canonical, total, parse_balance(key, raw.as_deref())?)?;
            }

            let mut writes = vec![Write::set(canonical, total.to_string())];
            writes.extend(
                keys.iter()
                    .filter(|key| key.as_str() != canonical)
                    .map(|key| Write::delete(key.clone())),
            );
            Ok(Step::Commit(writes, total))
        })
        .await
    }

    /// Write initial balances for drivers that have no balance yet.
    /// Returns how many keys were created.
    pub async fn seed(&self, balances: &BTreeMap<String, Decimal>) -> StoreResult<usize> {
        let mut created = 0;
        for (driver, amount) in balances {
            let key = self.balance_key(driver);
            if self.backend.set_if_absent(&key, &amount.to_string()).await? {
                debug!(key = %key, amount = %amount, "Seeded balance");
                created += 1;
            }
        }

        if created > 0 {
            info!("Seeded {} driver balances", created);
        }
        Ok(created)
    }

    async fn optimistic<T, F>(
        &self,
        operation: &'static str,
        label: &str,
        keys: &[String],
        mut body: F,
    ) -> StoreResult<T>
    where
        F: FnMut(&[Option<String>]) -> StoreResult<Step<T>>,
    {
        let max_attempts = self.config.retry.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            let mut txn = self.backend.watch(keys).await?;

            let mut values = Vec::with_capacity(keys.len());
            for key in keys {
                match self.backend.read(&mut txn, key).await {
                    Ok(value) => values.push(value),
                    Err(e) => {
                        self.backend.release(txn).await;
                        return Err(e);
                    }
                }
            }

            let step = match body(&values) {
                Ok(step) => step,
                Err(e) => {
                    self.backend.release(txn).await;
                    return Err(e);
                }
            };

            match step {
                Step::Done(result) => {
                    self.backend.release(txn).await;
                    return Ok(result);
                }
                Step::Commit(writes, result) => {
                    if self.backend.commit(txn, writes).await? {
                        if attempt > 1 {
                            debug!(key = %label, attempt, "{} committed after retry", operation);
                        }
                        return Ok(result);
                    }
                }
            }

            BALANCE_CONFLICTS_TOTAL.with_label_values(&[operation]).inc();
            if attempt < max_attempts {
                tokio::time::sleep(self.config.retry.backoff(attempt)).await;
            }
        }

        BALANCE_EXHAUSTED_TOTAL.with_label_values(&[operation]).inc();
        warn!(
            key = %label,
            attempts = max_attempts,
            "{} gave up under contention", operation
        );

        Err(StoreError::ConcurrencyExhausted {
            key: label.to_string(),
            attempts: max_attempts,
        })
    }
}

fn parse_balance(key: &str, raw: Option<&str>) -> StoreResult<Decimal> {
    match raw {
        None => Ok(Decimal::ZERO),
        Some(raw) => parse_decimal(raw).ok_or_else(|| StoreError::CorruptBalance {
            key: key.to_string(),
            value: raw.to_string(),
        }),
    }
}

fn add(key: &str, balance: Decimal, delta: Decimal) -> StoreResult<Decimal> {
    balance.checked_add(delta).ok_or_else(|| StoreError::Overflow {
        key: key.to_string(),
    })
}

/// Escape glob metacharacters so `text` matches only itself
pub fn escape_glob(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\' | '^' | '-') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Glob matching `name` in any ASCII letter case. Past the first letter whose
/// case variants are not all ASCII the pattern degrades to `*`; callers
/// filter the results.
pub fn case_insensitive_glob(name: &str) -> String {
    let mut pattern = String::with_capacity(name.len() * 4);
    for c in name.chars() {
        if c.is_ascii_alphabetic() && !folds_from_non_ascii(c) {
            pattern.push('[');
            pattern.push(c.to_ascii_uppercase());
            pattern.push(c.to_ascii_lowercase());
            pattern.push(']');
        } else if c.is_lowercase()
            || c.is_uppercase()
            || c.to_lowercase().ne(std::iter::once(c.to_ascii_lowercase()))
        {
            pattern.push('*');
            return pattern;
        } else {
            pattern.push_str(&escape_glob(&c.to_string()));
        }
    }
    pattern
}

// KELVIN SIGN lowercases to 'k'
fn folds_from_non_ascii(c: char) -> bool {
    c.eq_ignore_ascii_case(&'k')
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn store() -> BalanceStore<MemoryBackend> {
        BalanceStore::new(MemoryBackend::new(), BalanceStoreConfig::default())
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(40),
        };

        assert!(policy.backoff(1) <= Duration::from_millis(10));
        assert!(policy.backoff(1) >= Duration::from_millis(5));
        assert!(policy.backoff(30) <= Duration::from_millis(40));
        assert!(policy.backoff(30) >= Duration::from_millis(20));
    }

    #[test]
    fn test_case_insensitive_glob() {
        assert_eq!(case_insensitive_glob("Jo"), "[Jj][Oo]");
        assert_eq!(case_insensitive_glob("a b"), "[Aa] [Bb]");
        assert_eq!(case_insensitive_glob("Zé"), "[Zz]*");
        assert_eq!(case_insensitive_glob("x*"), "[Xx]\\*");
        assert_eq!(case_insensitive_glob("Joke"), "[Jj][Oo]*");
        assert_eq!(case_insensitive_glob("\u{212A}ai"), "*");
        assert_eq!(case_insensitive_glob("\u{01C5}a"), "*");
    }

    #[tokio::test]
    async fn test_get_balance_absent_is_zero() {
        let store = store();
        assert_eq!(store.get_balance("saldo:Nobody").await.unwrap(), Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_increment_creates_and_accumulates() {
        let store = store();
        let key = store.balance_key("Joao");

        assert_eq!(store.atomic_increment(&key, dec!(15.0)).await.unwrap(), dec!(15.0));
        assert_eq!(store.atomic_increment(&key, dec!(2.50)).await.unwrap(), dec!(17.5));
        assert_eq!(store.get_balance(&key).await.unwrap(), dec!(17.5));
    }

    #[tokio::test]
    async fn test_corrupt_balance() {
        let store = store();
        store.backend().set("saldo:Joao", "quinze").await.unwrap();

        let err = store.atomic_increment("saldo:Joao", dec!(1)).await.unwrap_err();
        assert_eq!(
            err,
            StoreError::CorruptBalance {
                key: "saldo:Joao".to_string(),
                value: "quinze".to_string(),
            }
        );
        assert_eq!(
            store.backend().get("saldo:Joao").await.unwrap(),
            Some("quinze".to_string())
        );
    }

    #[tokio::test]
    async fn test_credit_once_skips_duplicate() {
        let store = store();
        let key = store.balance_key("Joao");

        let first = store.credit_once(&key, "corrida_1", dec!(15.0)).await.unwrap();
        assert_eq!(first, Credit::Applied { balance: dec!(15.0) });

        let again = store.credit_once(&key, "corrida_1", dec!(15.0)).await.unwrap();
        assert_eq!(again, Credit::Duplicate { recorded: Some(dec!(15.0)) });

        assert_eq!(store.get_balance(&key).await.unwrap(), dec!(15.0));
        assert_eq!(
            store.backend().snapshot().get("liquidacao:corrida_1"),
            Some(&"15.0".to_string())
        );
    }

    #[tokio::test]
    async fn test_list_keys_by_prefix() {
        let store = store();
        store.atomic_increment("saldo:Ana", dec!(1)).await.unwrap();
        store.atomic_increment("saldo:ana", dec!(1)).await.unwrap();
        store.credit_once("saldo:Bia", "c9", dec!(1)).await.unwrap();

        let keys = store.balance_keys().await.unwrap();
        let keys: Vec<&str> = keys.iter().map(String::as_str).collect();
        assert_eq!(keys, vec!["saldo:Ana", "saldo:Bia", "saldo:ana"]);
    }

    #[tokio::test]
    async fn test_driver_balance_sums_case_variants() {
        let store = store();
        store.set("saldo:Carla", dec!(50)).await.unwrap();
        store.set("saldo:carla", dec!(30)).await.unwrap();
        store.set("saldo:CARLA", dec!(20)).await.unwrap();
        store.set("saldo:Carlos", dec!(7)).await.unwrap();

        assert_eq!(store.driver_balance("carla").await.unwrap(), dec!(100));
        assert_eq!(store.driver_balance("Carlos").await.unwrap(), dec!(7));
        assert_eq!(store.driver_balance("Nobody").await.unwrap(), Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_driver_balance_non_ascii() {
        let store = store();
        store.set("saldo:José", dec!(10)).await.unwrap();
        store.set("saldo:JOSÉ", dec!(5)).await.unwrap();
        store.set("saldo:Josefa", dec!(99)).await.unwrap();

        assert_eq!(store.driver_balance("josé").await.unwrap(), dec!(15));
    }

    #[tokio::test]
    async fn test_driver_balance_kelvin_sign() {
        let store = store();
        store.set("saldo:\u{212A}ai", dec!(10)).await.unwrap();
        store.set("saldo:Kai", dec!(5)).await.unwrap();
        store.set("saldo:Kaio", dec!(1)).await.unwrap();

        assert_eq!(store.driver_balance("kai").await.unwrap(), dec!(15));
        assert_eq!(store.driver_balance("\u{212A}AI").await.unwrap(), dec!(15));
    }

    #[tokio::test]
    async fn test_increment_overflow_leaves_balance() {
        let store = store();
        store.set("saldo:Joao", Decimal::MAX).await.unwrap();

        let err = store.atomic_increment("saldo:Joao", dec!(1)).await.unwrap_err();
        assert_eq!(
            err,
            StoreError::Overflow {
                key: "saldo:Joao".to_string()
            }
        );

        let err = store.credit_once("saldo:Joao", "c1", dec!(1)).await.unwrap_err();
        assert!(matches!(err, StoreError::Overflow { .. }));
        assert_eq!(store.get_balance("saldo:Joao").await.unwrap(), Decimal::MAX);
        assert!(!store.backend().snapshot().contains_key("liquidacao:c1"));
    }

    #[tokio::test]
    async fn test_merge_moves_sum_to_canonical() {
        let store = store();
        store.set("saldo:carla", dec!(30)).await.unwrap();
        store.set("saldo:CARLA", dec!(20)).await.unwrap();

        let members = vec!["saldo:CARLA".to_string(), "saldo:carla".to_string()];
        let total = store.merge(&members, "saldo:Carla").await.unwrap();

        assert_eq!(total, dec!(50));
        let snapshot = store.backend().snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.get("saldo:Carla"), Some(&"50".to_string()));
    }

    #[tokio::test]
    async fn test_delete_resets_to_zero() {
        let store = store();
        store.set("saldo:Pedro", dec!(12)).await.unwrap();
        store.delete("saldo:Pedro").await.unwrap();

        assert_eq!(store.get_balance("saldo:Pedro").await.unwrap(), Decimal::ZERO);
        assert!(store.balance_keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_seed_only_fills_missing() {
        let store = store();
        store.set("saldo:Joao", dec!(3)).await.unwrap();

        let mut seed = BTreeMap::new();
        seed.insert("Joao".to_string(), dec!(200));
        seed.insert("Maria".to_string(), dec!(150));

        assert_eq!(store.seed(&seed).await.unwrap(), 1);
        assert_eq!(store.get_balance("saldo:Joao").await.unwrap(), dec!(3));
        assert_eq!(store.get_balance("saldo:Maria").await.unwrap(), dec!(150));
    }
}
