//! Balance key reconciliation
//!
//! Producers do not agree on driver-name casing, so one driver can end up
//! with `saldo:Carla`, `saldo:carla` and `saldo:CARLA`. A reconciliation pass
//! folds every such group into a single canonical key holding the sum.
//!
//! Each group is merged in one optimistic transaction over all of its keys,
//! so a credit landing on any member mid-merge either lands before the merge
//! reads it or forces the merge to retry. Groups that fail are skipped and
//! picked up by the next pass.

use crate::balance::{BalanceStore, KvBackend};
use crate::error::{StoreError, StoreResult};
use crate::metrics::RECONCILIATION_GROUPS_TOTAL;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// A group folded into one key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedGroup {
    pub canonical: String,
    pub removed: Vec<String>,
    pub total: Decimal,
}

/// A group left as it was
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedGroup {
    pub identity: String,
    pub keys: Vec<String>,
    pub error: StoreError,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconciliationReport {
    pub keys_scanned: usize,
    pub groups: usize,
    pub merged: Vec<MergedGroup>,
    pub failed: Vec<FailedGroup>,
}

impl ReconciliationReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct Reconciler<B> {
    balances: Arc<BalanceStore<B>>,
}

impl<B: KvBackend> Reconciler<B> {
    pub fn new(balances: Arc<BalanceStore<B>>) -> Self {
        Self { balances }
    }

    /// Run one pass. Only a failure to list keys fails the whole pass.
    pub async fn run(&self) -> StoreResult<ReconciliationReport> {
        let start = Instant::now();
        let keys = self.balances.balance_keys().await?;

        let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for key in &keys {
            if let Some(driver) = self.balances.driver_of(key) {
                groups
                    .entry(driver.to_lowercase())
                    .or_default()
                    .push(key.clone());
            }
        }

        let mut report = ReconciliationReport {
            keys_scanned: keys.len(),
            groups: groups.len(),
            ..Default::default()
        };

        for (identity, members) in groups {
            if members.len() < 2 {
                continue;
            }

            let canonical = self.canonical_key(&members);
            match self.balances.merge(&members, &canonical).await {
                Ok(total) => {
                    let removed: Vec<String> = members
                        .into_iter()
                        .filter(|key| *key != canonical)
                        .collect();
                    info!(
                        canonical = %canonical,
                        total = %total,
                        "Merged {} case-variant balance keys",
                        removed.len()
                    );
                    RECONCILIATION_GROUPS_TOTAL
                        .with_label_values(&["merged"])
                        .inc();
                    report.merged.push(MergedGroup {
                        canonical,
                        removed,
                        total,
                    });
                }
                Err(error) => {
                    warn!(identity = %identity, "Skipping balance group: {}", error);
                    RECONCILIATION_GROUPS_TOTAL
                        .with_label_values(&["failed"])
                        .inc();
                    report.failed.push(FailedGroup {
                        identity,
                        keys: members,
                        error,
                    });
                }
            }
        }

        info!(
            keys = report.keys_scanned,
            merged = report.merged.len(),
            failed = report.failed.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Balance reconciliation finished"
        );

        Ok(report)
    }

    /// The capitalized spelling when one of the members uses it, otherwise
    /// the lexicographically smallest member.
    fn canonical_key(&self, members: &[String]) -> String {
        let capitalized = members.iter().find(|key| {
            self.balances
                .driver_of(key)
                .map_or(false, |driver| capitalize(driver) == driver)
        });

        capitalized
            .or_else(|| members.iter().min())
            .cloned()
            .unwrap_or_default()
    }
}

/// First character upper case, the rest lower case
pub fn capitalize(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first
            .to_uppercase()
            .chain(chars.flat_map(char::to_lowercase))
            .collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balance::{BalanceStoreConfig, MemoryBackend};

    fn reconciler() -> Reconciler<MemoryBackend> {
        Reconciler::new(Arc::new(BalanceStore::new(
            MemoryBackend::new(),
            BalanceStoreConfig::default(),
        )))
    }

    fn keys(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| format!("saldo:{}", name)).collect()
    }

    #[test]
    fn test_capitalize() {
        assert_eq!(capitalize("carla"), "Carla");
        assert_eq!(capitalize("CARLA"), "Carla");
        assert_eq!(capitalize("joão"), "João");
        assert_eq!(capitalize("ANA MARIA"), "Ana maria");
        assert_eq!(capitalize(""), "");
    }

    #[test]
    fn test_prefers_capitalized_spelling() {
        let reconciler = reconciler();
        assert_eq!(
            reconciler.canonical_key(&keys(&["CARLA", "Carla", "carla"])),
            "saldo:Carla"
        );
    }

    #[test]
    fn test_falls_back_to_smallest_spelling() {
        let reconciler = reconciler();
        assert_eq!(
            reconciler.canonical_key(&keys(&["carla", "cARLA", "CARLA"])),
            "saldo:CARLA"
        );
    }
}
