//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! Enforcement tracking for installed policy rules.
//!
//! Every subscriber carries a set of policy rules. A rule bound to a rating
//! group and tracked by the OCS enforces that group's byte cap; a rule bound
//! to a monitoring key is tracked by the PCRF and only counts traffic.
//!
//! Traffic for a rating group is credited to the highest-priority enforcing
//! rule (lowest `priority` value). Caps are rebuilt whenever the granted total
//! of the pool changes, and a rebuild that moves a cap bumps the rule's
//! generation so callers can tell an enforcement change from a plain grant.
//!
//! Counters are updated at datapath checkpoints, so every bound here carries
//! the enforcement-lag tolerance ε.

use crate::config::ChargingConfig;
use crate::error::ChargingError;
use crate::ledger::PoolKey;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

const UNCAPPED: u64 = u64::MAX;

/// Usage accrued on a pool since the previous report.
///
/// Not `Clone`: a report is moved into exactly one CCR.
#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct UsageReport {
    pub pool: PoolKey,
    pub bytes: u64,
    pub reported_at: DateTime<Utc>,
}

impl UsageReport {
    pub fn new(pool: PoolKey, bytes: u64) -> Self {
        Self {
            pool,
            bytes,
            reported_at: Utc::now(),
        }
    }
}

/// Who tracks usage of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrackingType {
    /// Rating group only, credit controlled by the OCS.
    OnlyOcs,
    /// Monitoring key only, usage reported to the PCRF.
    OnlyPcrf,
    /// Both a rating group and a monitoring key.
    OcsAndPcrf,
    /// Neither; the rule only classifies traffic.
    NoTracking,
}

impl TrackingType {
    pub fn tracks_ocs(&self) -> bool {
        matches!(self, TrackingType::OnlyOcs | TrackingType::OcsAndPcrf)
    }
}

/// A policy rule as provisioned on the datapath.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRule {
    pub id: String,
    /// Precedence; a lower value wins.
    pub priority: u32,
    pub rating_group: Option<u32>,
    pub monitoring_key: Option<String>,
}

impl PolicyRule {
    /// A rule with no tracking attached.
    pub fn new(id: impl Into<String>, priority: u32) -> Self {
        Self {
            id: id.into(),
            priority,
            rating_group: None,
            monitoring_key: None,
        }
    }

    pub fn with_rating_group(mut self, rating_group: u32) -> Self {
        self.rating_group = Some(rating_group);
        self
    }

    pub fn with_monitoring_key(mut self, key: impl Into<String>) -> Self {
        self.monitoring_key = Some(key.into());
        self
    }

    pub fn tracking(&self) -> TrackingType {
        match (self.rating_group, &self.monitoring_key) {
            (Some(_), Some(_)) => TrackingType::OcsAndPcrf,
            (Some(_), None) => TrackingType::OnlyOcs,
            (None, Some(_)) => TrackingType::OnlyPcrf,
            (None, None) => TrackingType::NoTracking,
        }
    }

    fn enforces(&self, rating_group: u32) -> bool {
        self.tracking().tracks_ocs() && self.rating_group == Some(rating_group)
    }
}

/// Point-in-time counters of an installed rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleStats {
    pub rule_id: String,
    pub forwarded: u64,
    pub dropped: u64,
    pub cap: Option<u64>,
    pub generation: u64,
    pub installed_at: DateTime<Utc>,
}

#[derive(Debug)]
struct RuleEntry {
    rule: PolicyRule,
    forwarded: AtomicU64,
    dropped: AtomicU64,
    cap: AtomicU64,
    generation: AtomicU64,
    installed_at: DateTime<Utc>,
}

impl RuleEntry {
    fn new(rule: PolicyRule) -> Self {
        Self {
            rule,
            forwarded: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            cap: AtomicU64::new(UNCAPPED),
            generation: AtomicU64::new(0),
            installed_at: Utc::now(),
        }
    }

    fn cap(&self) -> Option<u64> {
        match self.cap.load(Ordering::Acquire) {
            UNCAPPED => None,
            cap => Some(cap),
        }
    }

    fn stats(&self) -> RuleStats {
        RuleStats {
            rule_id: self.rule.id.clone(),
            forwarded: self.forwarded.load(Ordering::Acquire),
            dropped: self.dropped.load(Ordering::Acquire),
            cap: self.cap(),
            generation: self.generation.load(Ordering::Acquire),
            installed_at: self.installed_at,
        }
    }
}

type RuleSet = Arc<RwLock<Vec<Arc<RuleEntry>>>>;

/// Installs and removes policy rules for a subscriber.
pub trait RuleProvisioning: Send + Sync {
    /// Install a rule, replacing any rule with the same id.
    fn install_rule(&self, subscriber: &str, rule: PolicyRule) -> Result<(), ChargingError>;

    /// Remove a rule; returns whether it was installed.
    fn remove_rule(&self, subscriber: &str, rule_id: &str) -> Result<bool, ChargingError>;
}

/// Per-rule counters and caps for every subscriber.
#[derive(Debug)]
pub struct EnforcementTracker {
    rules: DashMap<String, RuleSet>,
    tolerance: u64,
}

impl EnforcementTracker {
    pub fn new(tolerance: u64) -> Self {
        Self {
            rules: DashMap::new(),
            tolerance,
        }
    }

    pub fn from_config(config: &ChargingConfig) -> Self {
        Self::new(config.enforcement_lag_tolerance_bytes)
    }

    /// The enforcement-lag tolerance ε in bytes.
    pub fn tolerance(&self) -> u64 {
        self.tolerance
    }

    fn rule_set(&self, subscriber: &str) -> Option<RuleSet> {
        self.rules.get(subscriber).map(|set| set.value().clone())
    }

    fn entry(&self, subscriber: &str, rule_id: &str) -> Result<Arc<RuleEntry>, ChargingError> {
        let set = self
            .rule_set(subscriber)
            .ok_or_else(|| ChargingError::UnknownSubscriber(subscriber.to_string()))?;
        let entry = set
            .read()
            .iter()
            .find(|entry| entry.rule.id == rule_id)
            .cloned();
        entry.ok_or_else(|| ChargingError::ValidationError(format!("未安装的规则: {}", rule_id)))
    }

    fn enforcing_rule(&self, subscriber: &str, rating_group: u32) -> Option<Arc<RuleEntry>> {
        let set = self.rule_set(subscriber)?;
        let rules = set.read();
        // Sorted by priority on install, so the first match wins.
        rules
            .iter()
            .find(|entry| entry.rule.enforces(rating_group))
            .cloned()
    }

    /// Installed rules of a subscriber in precedence order.
    pub fn rules(&self, subscriber: &str) -> Vec<PolicyRule> {
        self.rule_set(subscriber)
            .map(|set| set.read().iter().map(|entry| entry.rule.clone()).collect())
            .unwrap_or_default()
    }

    /// Rating groups that have at least one OCS-tracked rule.
    pub fn rating_groups(&self, subscriber: &str) -> Vec<u32> {
        let mut groups: Vec<u32> = self
            .rules(subscriber)
            .into_iter()
            .filter(|rule| rule.tracking().tracks_ocs())
            .filter_map(|rule| rule.rating_group)
            .collect();
        groups.sort_unstable();
        groups.dedup();
        groups
    }

    /// Monitoring keys reported to the PCRF for a subscriber.
    pub fn monitoring_keys(&self, subscriber: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .rules(subscriber)
            .into_iter()
            .filter_map(|rule| rule.monitoring_key)
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }

    /// Current cap of the enforcing rule for `rating_group`, if one is installed and capped.
    pub fn cap_for(&self, subscriber: &str, rating_group: u32) -> Option<u64> {
        self.enforcing_rule(subscriber, rating_group)
            .and_then(|entry| entry.cap())
    }

    /// Credit admitted and dropped bytes to the enforcing rule.
    ///
    /// Returns the id of the credited rule, or `None` when no rule enforces
    /// the rating group.
    pub fn record(
        &self,
        subscriber: &str,
        rating_group: u32,
        forwarded: u64,
        dropped: u64,
    ) -> Option<String> {
        let entry = self.enforcing_rule(subscriber, rating_group)?;
        entry.forwarded.fetch_add(forwarded, Ordering::AcqRel);
        if dropped > 0 {
            entry.dropped.fetch_add(dropped, Ordering::AcqRel);
            debug!(
                subscriber = %subscriber,
                rule = %entry.rule.id,
                dropped,
                "超出上限的流量被丢弃"
            );
        }
        Some(entry.rule.id.clone())
    }

    /// Bytes forwarded under a rule since it was installed.
    pub fn usage_since(&self, subscriber: &str, rule_id: &str) -> Result<u64, ChargingError> {
        Ok(self.entry(subscriber, rule_id)?.forwarded.load(Ordering::Acquire))
    }

    pub fn stats(&self, subscriber: &str, rule_id: &str) -> Result<RuleStats, ChargingError> {
        Ok(self.entry(subscriber, rule_id)?.stats())
    }

    /// Rebuild the caps of every rule enforcing `rating_group`.
    ///
    /// Returns `true` when at least one cap changed. The last call wins, so
    /// callers rebuild inside [`QuotaLedger::grant_then`] to keep caps in
    /// grant order.
    ///
    /// [`QuotaLedger::grant_then`]: crate::ledger::QuotaLedger::grant_then
    pub fn rebuild(&self, subscriber: &str, rating_group: u32, new_cap: u64) -> bool {
        let Some(set) = self.rule_set(subscriber) else {
            return false;
        };
        let rules = set.read();
        let mut changed = false;
        for entry in rules.iter().filter(|entry| entry.rule.enforces(rating_group)) {
            let previous = entry.cap.swap(new_cap, Ordering::AcqRel);
            if previous != new_cap {
                let generation = entry.generation.fetch_add(1, Ordering::AcqRel) + 1;
                info!(
                    subscriber = %subscriber,
                    rule = %entry.rule.id,
                    rating_group,
                    previous_cap = previous,
                    new_cap,
                    generation,
                    "执行规则已重建"
                );
                changed = true;
            }
        }
        changed
    }

    /// Whether `usage` lies in `[previous_cap - ε, new_cap + ε]`.
    pub fn within_bounds(&self, usage: u64, previous_cap: u64, new_cap: u64) -> bool {
        usage.saturating_add(self.tolerance) >= previous_cap
            && usage <= new_cap.saturating_add(self.tolerance)
    }

    /// Drop every rule of a subscriber, returning how many were installed.
    pub fn clear_subscriber(&self, subscriber: &str) -> usize {
        self.rules
            .remove(subscriber)
            .map(|(_, set)| set.read().len())
            .unwrap_or(0)
    }
}

impl Default for EnforcementTracker {
    fn default() -> Self {
        Self::from_config(&ChargingConfig::default())
    }
}

impl RuleProvisioning for EnforcementTracker {
    fn install_rule(&self, subscriber: &str, rule: PolicyRule) -> Result<(), ChargingError> {
        if rule.id.is_empty() {
            return Err(ChargingError::ValidationError("规则ID不能为空".to_string()));
        }
        if subscriber.is_empty() {
            return Err(ChargingError::ValidationError("用户ID不能为空".to_string()));
        }

        let set = self
            .rules
            .entry(subscriber.to_string())
            .or_default()
            .value()
            .clone();
        let mut rules = set.write();
        if let Some(position) = rules.iter().position(|entry| entry.rule.id == rule.id) {
            warn!(subscriber = %subscriber, rule = %rule.id, "替换已安装的规则");
            rules.remove(position);
        }
        info!(
            subscriber = %subscriber,
            rule = %rule.id,
            priority = rule.priority,
            tracking = ?rule.tracking(),
            "安装规则"
        );
        rules.push(Arc::new(RuleEntry::new(rule)));
        rules.sort_by_key(|entry| entry.rule.priority);
        Ok(())
    }

    fn remove_rule(&self, subscriber: &str, rule_id: &str) -> Result<bool, ChargingError> {
        let Some(set) = self.rule_set(subscriber) else {
            return Ok(false);
        };
        let mut rules = set.write();
        let before = rules.len();
        rules.retain(|entry| entry.rule.id != rule_id);
        let removed = rules.len() != before;
        if removed {
            info!(subscriber = %subscriber, rule = %rule_id, "移除规则");
        }
        Ok(removed)
    }
}
