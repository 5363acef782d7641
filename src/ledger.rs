//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 配额账本
//!
//! 按 (用户, 费率组) 持有信用池。账本只记录事实，不负责执行：
//! 超额消费不会失败，执行由 [`crate::enforcement`] 负责。
//!
//! # 并发
//!
//! - 用户之间完全分区（`DashMap`），互不争用
//! - 单个信用池上的授予与消费由池内互斥锁串行化
//! - 每次变更递增池的序列号，快照携带序列号，消费总能看到之前授予的结果

use crate::constants::EXHAUSTED_RATIO;
use crate::error::ChargingError;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

/// 信用池标识
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PoolKey {
    /// 用户ID（IMSI）
    pub subscriber: String,
    /// 费率组
    pub rating_group: u32,
    /// 监控键（可选）
    pub monitoring_key: Option<String>,
}

impl PoolKey {
    pub fn new(subscriber: impl Into<String>, rating_group: u32) -> Self {
        Self {
            subscriber: subscriber.into(),
            rating_group,
            monitoring_key: None,
        }
    }

    pub fn with_monitoring_key(mut self, key: impl Into<String>) -> Self {
        self.monitoring_key = Some(key.into());
        self
    }
}

impl std::fmt::Display for PoolKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.monitoring_key {
            Some(mkey) => write!(f, "{}:rg{}:{}", self.subscriber, self.rating_group, mkey),
            None => write!(f, "{}:rg{}", self.subscriber, self.rating_group),
        }
    }
}

/// 授予方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GrantMode {
    /// 初始授予：替换授予总量
    Initial,
    /// 充值：累加授予总量
    TopUp,
}

/// 授予的服务单位
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct GrantedUnits {
    /// 授予字节数
    pub units: u64,
    /// 有效期
    pub validity: Option<Duration>,
    /// 时长上限（秒）
    pub time_limit_secs: Option<u32>,
    /// 池级上报阈值（覆盖全局默认）
    pub threshold: Option<f64>,
}

impl GrantedUnits {
    pub fn bytes(units: u64) -> Self {
        Self {
            units,
            ..Default::default()
        }
    }

    pub fn with_validity(mut self, validity: Duration) -> Self {
        self.validity = Some(validity);
        self
    }

    pub fn with_time_limit(mut self, secs: u32) -> Self {
        self.time_limit_secs = Some(secs);
        self
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = Some(threshold);
        self
    }
}

/// 信用池快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub key: PoolKey,
    /// 已消费字节
    pub consumed: u64,
    /// 授予总量
    pub granted_total: u64,
    /// 初始授予量
    pub initial_grant: u64,
    /// 有效期截止
    pub validity_deadline: Option<DateTime<Utc>>,
    /// 时长上限（秒）
    pub time_limit_secs: Option<u32>,
    /// 池级上报阈值
    pub threshold: Option<f64>,
    /// 逻辑时钟
    pub sequence: u64,
}

impl PoolSnapshot {
    /// 消费比例；授予总量为 0 时视为耗尽
    pub fn ratio(&self) -> f64 {
        if self.granted_total == 0 {
            EXHAUSTED_RATIO
        } else {
            self.consumed as f64 / self.granted_total as f64
        }
    }

    /// 剩余字节（不含容差）
    pub fn remaining(&self) -> u64 {
        self.granted_total.saturating_sub(self.consumed)
    }

    /// 有效期是否已过
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.validity_deadline.is_some_and(|deadline| now >= deadline)
    }
}

#[derive(Debug, Default)]
struct PoolState {
    consumed: u64,
    granted_total: u64,
    initial_grant: u64,
    validity_deadline: Option<DateTime<Utc>>,
    time_limit_secs: Option<u32>,
    threshold: Option<f64>,
    sequence: u64,
}

/// 信用池
#[derive(Debug)]
pub struct CreditPool {
    key: PoolKey,
    state: Mutex<PoolState>,
}

impl CreditPool {
    fn new(key: PoolKey) -> Self {
        Self {
            key,
            state: Mutex::new(PoolState::default()),
        }
    }

    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    fn snapshot_locked(&self, state: &PoolState) -> PoolSnapshot {
        PoolSnapshot {
            key: self.key.clone(),
            consumed: state.consumed,
            granted_total: state.granted_total,
            initial_grant: state.initial_grant,
            validity_deadline: state.validity_deadline,
            time_limit_secs: state.time_limit_secs,
            threshold: state.threshold,
            sequence: state.sequence,
        }
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let state = self.state.lock();
        self.snapshot_locked(&state)
    }

    fn grant<R>(
        &self,
        granted: GrantedUnits,
        mode: GrantMode,
        then: impl FnOnce(&PoolSnapshot) -> R,
    ) -> Result<(PoolSnapshot, R), ChargingError> {
        let mut state = self.state.lock();
        match mode {
            GrantMode::Initial => {
                state.granted_total = granted.units;
                state.initial_grant = granted.units;
            }
            GrantMode::TopUp => {
                let current = state.granted_total;
                state.granted_total = current.checked_add(granted.units).ok_or_else(|| {
                    ChargingError::LedgerCorruption(format!(
                        "授予总量溢出: {} + {} ({})",
                        current, granted.units, self.key
                    ))
                })?;
                if state.initial_grant == 0 {
                    state.initial_grant = granted.units;
                }
            }
        }
        if let Some(validity) = granted.validity {
            state.validity_deadline = chrono::Duration::from_std(validity)
                .ok()
                .map(|validity| Utc::now() + validity);
        }
        if granted.time_limit_secs.is_some() {
            state.time_limit_secs = granted.time_limit_secs;
        }
        if granted.threshold.is_some() {
            state.threshold = granted.threshold;
        }
        state.sequence += 1;
        let snapshot = self.snapshot_locked(&state);
        let applied = then(&snapshot);
        Ok((snapshot, applied))
    }

    fn consume(&self, bytes: u64) -> Result<PoolSnapshot, ChargingError> {
        let mut state = self.state.lock();
        let current = state.consumed;
        state.consumed = current.checked_add(bytes).ok_or_else(|| {
            ChargingError::LedgerCorruption(format!(
                "消费量溢出: {} + {} ({})",
                current, bytes, self.key
            ))
        })?;
        state.sequence += 1;
        Ok(self.snapshot_locked(&state))
    }

    fn consume_capped(
        &self,
        bytes: u64,
        cap: Option<u64>,
        tolerance: u64,
    ) -> Result<(PoolSnapshot, u64), ChargingError> {
        let mut state = self.state.lock();
        let ceiling = cap.unwrap_or(state.granted_total).saturating_add(tolerance);
        let accepted = bytes.min(ceiling.saturating_sub(state.consumed));
        let current = state.consumed;
        state.consumed = current.checked_add(accepted).ok_or_else(|| {
            ChargingError::LedgerCorruption(format!(
                "消费量溢出: {} + {} ({})",
                current, accepted, self.key
            ))
        })?;
        state.sequence += 1;
        Ok((self.snapshot_locked(&state), accepted))
    }
}

/// 单个用户的账本分区
#[derive(Debug, Default)]
struct SubscriberLedger {
    pools: DashMap<u32, Arc<CreditPool>>,
}

/// 配额账本
#[derive(Debug, Default)]
pub struct QuotaLedger {
    subscribers: DashMap<String, Arc<SubscriberLedger>>,
}

impl QuotaLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// 为用户打开账本分区（幂等）
    pub fn open_subscriber(&self, subscriber: &str) {
        self.subscribers
            .entry(subscriber.to_string())
            .or_default();
    }

    /// 关闭用户账本分区，返回关闭前各池的快照
    pub fn close_subscriber(&self, subscriber: &str) -> Vec<PoolSnapshot> {
        match self.subscribers.remove(subscriber) {
            Some((_, partition)) => partition
                .pools
                .iter()
                .map(|pool| pool.value().snapshot())
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn has_subscriber(&self, subscriber: &str) -> bool {
        self.subscribers.contains_key(subscriber)
    }

    fn partition(&self, subscriber: &str) -> Result<Arc<SubscriberLedger>, ChargingError> {
        self.subscribers
            .get(subscriber)
            .map(|p| p.value().clone())
            .ok_or_else(|| ChargingError::UnknownSubscriber(subscriber.to_string()))
    }

    fn pool(&self, subscriber: &str, rating_group: u32) -> Result<Arc<CreditPool>, ChargingError> {
        let partition = self.partition(subscriber)?;
        let pool = partition
            .pools
            .get(&rating_group)
            .map(|p| p.value().clone());
        pool.ok_or_else(|| ChargingError::UnknownRatingGroup {
            subscriber: subscriber.to_string(),
            rating_group,
        })
    }

    /// 创建授予量为 0 的信用池（已存在时不变）
    pub fn open_pool(&self, key: PoolKey) -> Result<PoolSnapshot, ChargingError> {
        let partition = self.partition(&key.subscriber)?;
        let pool = partition
            .pools
            .entry(key.rating_group)
            .or_insert_with(|| Arc::new(CreditPool::new(key)))
            .value()
            .clone();
        Ok(pool.snapshot())
    }

    /// 授予服务单位
    ///
    /// 初始授予替换授予总量，充值累加。池不存在时创建。
    pub fn grant(
        &self,
        subscriber: &str,
        rating_group: u32,
        granted: GrantedUnits,
        mode: GrantMode,
    ) -> Result<PoolSnapshot, ChargingError> {
        self.grant_then(subscriber, rating_group, granted, mode, |_| ())
            .map(|(snapshot, ())| snapshot)
    }

    /// 授予服务单位，并在池锁内对授予后的快照执行 `then`
    ///
    /// 同一个池的授予与 `then` 按相同顺序执行，执行规则的上限因此不会
    /// 被较早的授予覆盖。`then` 不得再访问本账本。
    pub fn grant_then<R>(
        &self,
        subscriber: &str,
        rating_group: u32,
        granted: GrantedUnits,
        mode: GrantMode,
        then: impl FnOnce(&PoolSnapshot) -> R,
    ) -> Result<(PoolSnapshot, R), ChargingError> {
        let partition = self.partition(subscriber)?;
        let pool = partition
            .pools
            .entry(rating_group)
            .or_insert_with(|| Arc::new(CreditPool::new(PoolKey::new(subscriber, rating_group))))
            .value()
            .clone();

        let (snapshot, applied) = pool.grant(granted, mode, then).inspect_err(|e| {
            error!(subscriber = %subscriber, rating_group, error = %e, "账本授予失败");
        })?;
        debug!(
            pool = %snapshot.key,
            units = granted.units,
            mode = ?mode,
            granted_total = snapshot.granted_total,
            sequence = snapshot.sequence,
            "授予服务单位"
        );
        Ok((snapshot, applied))
    }

    /// 记录消费
    ///
    /// 超额不失败；只有溢出（账本损坏）才返回错误。
    pub fn consume(
        &self,
        subscriber: &str,
        rating_group: u32,
        bytes: u64,
    ) -> Result<PoolSnapshot, ChargingError> {
        let pool = self.pool(subscriber, rating_group)?;
        pool.consume(bytes).inspect_err(|e| {
            error!(subscriber = %subscriber, rating_group, error = %e, "账本消费失败");
        })
    }

    /// 在上限内记录消费，返回快照与实际接纳的字节数
    ///
    /// 上限为 `cap`（缺省时取池的授予总量）加上容差；超出部分不计入账本。
    /// 读取与写入在同一把池锁下完成，并发调用不会共同越过上限。
    pub fn consume_capped(
        &self,
        subscriber: &str,
        rating_group: u32,
        bytes: u64,
        cap: Option<u64>,
        tolerance: u64,
    ) -> Result<(PoolSnapshot, u64), ChargingError> {
        let pool = self.pool(subscriber, rating_group)?;
        pool.consume_capped(bytes, cap, tolerance).inspect_err(|e| {
            error!(subscriber = %subscriber, rating_group, error = %e, "账本消费失败");
        })
    }

    /// 消费比例：consumed / granted_total，授予为 0 时为 1.0
    pub fn remaining_ratio(&self, subscriber: &str, rating_group: u32) -> Result<f64, ChargingError> {
        Ok(self.snapshot(subscriber, rating_group)?.ratio())
    }

    pub fn snapshot(&self, subscriber: &str, rating_group: u32) -> Result<PoolSnapshot, ChargingError> {
        Ok(self.pool(subscriber, rating_group)?.snapshot())
    }

    /// 用户的全部信用池快照
    pub fn pools(&self, subscriber: &str) -> Result<Vec<PoolSnapshot>, ChargingError> {
        let partition = self.partition(subscriber)?;
        let mut pools: Vec<PoolSnapshot> =
            partition.pools.iter().map(|p| p.value().snapshot()).collect();
        pools.sort_by_key(|p| p.key.rating_group);
        Ok(pools)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}
