//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 使用量监控
//!
//! 每次消费之后评估信用池快照，决定是否需要发送 CCR-Update。
//!
//! - 消费比例达到阈值（默认 80%）且该池没有未完成的更新时触发
//! - 同一池同一时刻最多一个未完成更新（去抖）
//! - 授予总量为 0 的池比例视为 1.0，首次消费立即请求信用
//! - 有效期到期同样触发更新
//! - 更新被 OCS 拒绝后，直到授予总量发生变化前不再触发

use crate::config::{ChargingConfig, RequestPolicy};
use crate::constants::EXHAUSTED_RATIO;
use crate::ledger::{PoolKey, PoolSnapshot};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

/// 上报原因（Reporting-Reason AVP 取值）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReportingReason {
    /// 达到阈值
    Threshold,
    /// 最终上报（会话终止）
    Final,
    /// 配额耗尽
    QuotaExhausted,
    /// 有效期到期
    ValidityTime,
}

impl ReportingReason {
    /// Reporting-Reason 枚举值
    pub fn to_diameter(&self) -> u32 {
        match self {
            ReportingReason::Threshold => 0,
            ReportingReason::Final => 2,
            ReportingReason::QuotaExhausted => 3,
            ReportingReason::ValidityTime => 4,
        }
    }
}

/// 需要发送更新请求的事件
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateNeeded {
    pub key: PoolKey,
    /// 请求的追加单位数（0 表示由 OCS 决定）
    pub requested_units: u64,
    pub reason: ReportingReason,
    /// 触发时的快照
    pub snapshot: PoolSnapshot,
    pub raised_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct PendingUpdate {
    sequence: u64,
    raised_at: DateTime<Utc>,
}

/// 使用量监控器
#[derive(Debug)]
pub struct UsageMonitor {
    threshold: f64,
    policy: RequestPolicy,
    /// 未完成的更新
    pending: DashMap<PoolKey, PendingUpdate>,
    /// 被拒绝时的授予总量，授予变化前抑制触发
    suppressed: DashMap<PoolKey, u64>,
}

impl UsageMonitor {
    pub fn new(threshold: f64, policy: RequestPolicy) -> Self {
        Self {
            threshold,
            policy,
            pending: DashMap::new(),
            suppressed: DashMap::new(),
        }
    }

    pub fn from_config(config: &ChargingConfig) -> Self {
        Self::new(config.usage_threshold, config.request_policy)
    }

    /// 评估快照，必要时产生更新事件
    ///
    /// 调用方不得持有账本锁。
    pub fn evaluate(&self, snapshot: &PoolSnapshot) -> Option<UpdateNeeded> {
        let now = Utc::now();
        let ratio = snapshot.ratio();
        let threshold = snapshot.threshold.unwrap_or(self.threshold);

        let reason = if snapshot.is_expired(now) {
            ReportingReason::ValidityTime
        } else if ratio >= EXHAUSTED_RATIO {
            ReportingReason::QuotaExhausted
        } else if ratio >= threshold {
            ReportingReason::Threshold
        } else {
            return None;
        };

        if let Some(rejected_at) = self.suppressed.get(&snapshot.key) {
            if *rejected_at == snapshot.granted_total && reason != ReportingReason::ValidityTime {
                trace!(pool = %snapshot.key, "更新已被拒绝，授予未变化，跳过");
                return None;
            }
        }

        match self.pending.entry(snapshot.key.clone()) {
            Entry::Occupied(_) => {
                trace!(pool = %snapshot.key, "已有未完成的更新，跳过");
                None
            }
            Entry::Vacant(slot) => {
                slot.insert(PendingUpdate {
                    sequence: snapshot.sequence,
                    raised_at: now,
                });
                self.suppressed.remove(&snapshot.key);

                let requested_units = self.policy.requested_units(snapshot.initial_grant);
                debug!(
                    pool = %snapshot.key,
                    ratio,
                    threshold,
                    reason = ?reason,
                    requested_units,
                    "需要发送 CCR-Update"
                );
                Some(UpdateNeeded {
                    key: snapshot.key.clone(),
                    requested_units,
                    reason,
                    snapshot: snapshot.clone(),
                    raised_at: now,
                })
            }
        }
    }

    /// 更新已应答（成功、失败或放弃），允许再次触发
    pub fn complete(&self, key: &PoolKey) -> bool {
        self.pending.remove(key).is_some()
    }

    /// 更新被拒绝：清除未完成标记，并在授予变化前抑制触发
    pub fn complete_rejected(&self, key: &PoolKey, granted_total: u64) -> bool {
        self.suppressed.insert(key.clone(), granted_total);
        self.complete(key)
    }

    pub fn is_pending(&self, key: &PoolKey) -> bool {
        self.pending.contains_key(key)
    }

    /// 未完成更新被触发时的序列号
    pub fn pending_since(&self, key: &PoolKey) -> Option<(u64, DateTime<Utc>)> {
        self.pending
            .get(key)
            .map(|p| (p.sequence, p.raised_at))
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// 清除用户的全部监控状态
    pub fn clear_subscriber(&self, subscriber: &str) {
        self.pending.retain(|key, _| key.subscriber != subscriber);
        self.suppressed.retain(|key, _| key.subscriber != subscriber);
    }
}

impl Default for UsageMonitor {
    fn default() -> Self {
        Self::from_config(&ChargingConfig::default())
    }
}
