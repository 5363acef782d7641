//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 进程内 OCS 模拟器
//!
//! 实现 [`CreditControlTransport`]，按 (用户, 费率组) 维护信用账户，
//! 以异步方式把应答送回控制器，并能主动发起 RAR。
//!
//! - CCR-Initial / CCR-Update 授予 `min(余额, 请求量, max_usage_octets)`
//! - 余额为 0 时应答 `DIAMETER_CREDIT_LIMIT_REACHED`
//! - 同一关联ID重发返回缓存的应答，不会重复扣减余额
//! - `drop_next_answers(n)` 丢弃接下来 n 个应答，用于验证超时重发

use crate::config::OcsConfig;
use crate::error::{diameter, ChargingError, ResultCode};
use crate::ledger::GrantedUnits;
use crate::protocol::{
    CorrelationId, CreditControlAnswer, CreditControlRequest, CreditControlTransport,
    ReAuthAnswer, ReAuthRequest, RequestType,
};
use crate::session::SessionController;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// 模拟器收到的一次请求
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestRecord {
    pub correlation_id: CorrelationId,
    pub subscriber: String,
    pub rating_group: u32,
    pub request_type: RequestType,
    pub request_number: u32,
    pub requested_units: Option<u64>,
    /// 请求中上报的使用量
    pub used_bytes: u64,
    /// 应答的结果码
    pub result_code: u32,
    /// 授予的字节数
    pub granted_units: u64,
    /// 是否为重发
    pub retransmission: bool,
}

type AccountKey = (String, u32);

/// OCS 模拟器
pub struct OcsSimulator {
    config: RwLock<OcsConfig>,
    accounts: DashMap<AccountKey, u64>,
    /// 按关联ID缓存的应答及其 Session-Id，会话的 CCR-Terminate 应答后清除
    answers: DashMap<CorrelationId, (String, CreditControlAnswer)>,
    /// 已扣减、尚未确认的 RAR 授予
    outstanding_reauths: DashMap<CorrelationId, (AccountKey, u64)>,
    records: Mutex<Vec<RequestRecord>>,
    controller: OnceLock<Weak<SessionController>>,
    answer_delay: RwLock<Duration>,
    drop_answers: AtomicU32,
}

impl std::fmt::Debug for OcsSimulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OcsSimulator")
            .field("config", &*self.config.read())
            .field("accounts", &self.accounts.len())
            .field("requests", &self.records.lock().len())
            .finish()
    }
}

impl OcsSimulator {
    pub fn new(config: OcsConfig) -> Self {
        Self {
            config: RwLock::new(config),
            accounts: DashMap::new(),
            answers: DashMap::new(),
            outstanding_reauths: DashMap::new(),
            records: Mutex::new(Vec::new()),
            controller: OnceLock::new(),
            answer_delay: RwLock::new(Duration::ZERO),
            drop_answers: AtomicU32::new(0),
        }
    }

    /// 绑定接收应答与 RAR 的控制器（只生效一次）
    pub fn attach(&self, controller: &Arc<SessionController>) {
        if self.controller.set(Arc::downgrade(controller)).is_err() {
            warn!("模拟器已绑定控制器，忽略重复绑定");
        }
    }

    fn controller(&self) -> Result<Arc<SessionController>, ChargingError> {
        self.controller
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| ChargingError::ConfigError("OCS 模拟器未绑定控制器".to_string()))
    }

    pub fn config(&self) -> OcsConfig {
        self.config.read().clone()
    }

    /// 替换模拟器配置
    pub fn set_config(&self, config: OcsConfig) -> Result<(), ChargingError> {
        config.validate().map_err(ChargingError::ConfigError)?;
        info!(
            max_usage_octets = config.max_usage_octets,
            max_usage_time = config.max_usage_time,
            validity_time = config.validity_time,
            "OCS 配置已更新"
        );
        *self.config.write() = config;
        Ok(())
    }

    /// 设置账户余额（替换）
    pub fn set_credit(&self, subscriber: &str, rating_group: u32, bytes: u64) {
        self.accounts
            .insert((subscriber.to_string(), rating_group), bytes);
        info!(subscriber = %subscriber, rating_group, bytes, "OCS 账户余额已设置");
    }

    /// 为账户充值（累加），返回新余额
    pub fn top_up(&self, subscriber: &str, rating_group: u32, bytes: u64) -> u64 {
        let mut balance = self
            .accounts
            .entry((subscriber.to_string(), rating_group))
            .or_insert(0);
        *balance = balance.saturating_add(bytes);
        info!(subscriber = %subscriber, rating_group, bytes, balance = *balance, "OCS 账户已充值");
        *balance
    }

    pub fn balance(&self, subscriber: &str, rating_group: u32) -> u64 {
        self.accounts
            .get(&(subscriber.to_string(), rating_group))
            .map(|b| *b)
            .unwrap_or(0)
    }

    /// 应答延迟
    pub fn set_answer_delay(&self, delay: Duration) {
        *self.answer_delay.write() = delay;
    }

    /// 丢弃接下来的 `count` 个应答
    pub fn drop_next_answers(&self, count: u32) {
        self.drop_answers.store(count, Ordering::Release);
    }

    /// 缓存中的应答数
    pub fn cached_answers(&self) -> usize {
        self.answers.len()
    }

    /// 已收到的请求
    pub fn requests(&self) -> Vec<RequestRecord> {
        self.records.lock().clone()
    }

    /// 以 JSON 导出请求记录
    pub fn export_requests_json(&self) -> Result<String, ChargingError> {
        Ok(serde_json::to_string_pretty(&*self.records.lock())?)
    }

    /// 指定类型的首发请求数（不含重发）
    pub fn request_count(&self, request_type: RequestType) -> usize {
        self.records
            .lock()
            .iter()
            .filter(|r| r.request_type == request_type && !r.retransmission)
            .count()
    }

    /// 从余额中扣减授予量
    fn debit(&self, key: &AccountKey, wanted: u64) -> u64 {
        match self.accounts.get_mut(key) {
            Some(mut balance) => {
                let granted = wanted.min(*balance);
                *balance -= granted;
                granted
            }
            None => 0,
        }
    }

    fn refund(&self, key: AccountKey, bytes: u64) {
        if bytes > 0 {
            let mut balance = self.accounts.entry(key).or_insert(0);
            *balance = balance.saturating_add(bytes);
        }
    }

    fn answer_for(&self, request: &CreditControlRequest) -> CreditControlAnswer {
        let config = self.config();
        let key = (request.subscriber.clone(), request.rating_group);

        let (result_code, granted) = match request.request_type {
            RequestType::Termination => (diameter::SUCCESS, None),
            RequestType::Initial | RequestType::Update => {
                let wanted = request
                    .requested_units
                    .unwrap_or(u64::MAX)
                    .min(config.max_usage_octets);
                match self.debit(&key, wanted) {
                    0 => (diameter::CREDIT_LIMIT_REACHED, None),
                    units => (
                        diameter::SUCCESS,
                        Some(
                            GrantedUnits::bytes(units)
                                .with_validity(Duration::from_secs(u64::from(config.validity_time)))
                                .with_time_limit(config.max_usage_time),
                        ),
                    ),
                }
            }
        };

        CreditControlAnswer {
            correlation_id: request.correlation_id,
            result_code,
            rating_group: request.rating_group,
            granted,
        }
    }

    fn deliver(&self, answer: CreditControlAnswer) -> Result<(), ChargingError> {
        let controller = self.controller()?;
        let delay = *self.answer_delay.read();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            controller.on_answer(answer);
        });
        Ok(())
    }

    /// 以账户剩余余额（受 `max_usage_octets` 限制）构造 RAR 并扣减余额
    pub fn prepare_re_auth(&self, subscriber: &str, rating_group: u32) -> ReAuthRequest {
        let key = (subscriber.to_string(), rating_group);
        let wanted = self.config.read().max_usage_octets;
        let granted_units = self.debit(&key, wanted);
        let correlation_id = CorrelationId::new();
        self.outstanding_reauths
            .insert(correlation_id, (key, granted_units));
        ReAuthRequest {
            correlation_id,
            subscriber: subscriber.to_string(),
            rating_group,
            granted_units,
        }
    }

    /// 向控制器发送（或重发）RAR
    ///
    /// 应答为失败时把授予量退回账户。
    pub async fn deliver_re_auth(&self, request: &ReAuthRequest) -> Result<ReAuthAnswer, ChargingError> {
        let controller = self.controller()?;
        let answer = controller.handle_re_auth(request.clone()).await;
        match answer.result_code {
            ResultCode::Failure => {
                if let Some((_, (key, units))) =
                    self.outstanding_reauths.remove(&request.correlation_id)
                {
                    warn!(correlation_id = %request.correlation_id, units, "RAR 失败，退回授予");
                    self.refund(key, units);
                }
            }
            code if code.is_success() => {
                self.outstanding_reauths.remove(&request.correlation_id);
            }
            _ => {}
        }
        debug!(correlation_id = %request.correlation_id, result = %answer.result_code, "RAA 已收到");
        Ok(answer)
    }

    /// 发起 RAR，授予账户的剩余余额
    pub async fn send_re_auth(
        &self,
        subscriber: &str,
        rating_group: u32,
    ) -> Result<ReAuthAnswer, ChargingError> {
        let request = self.prepare_re_auth(subscriber, rating_group);
        info!(
            subscriber = %subscriber,
            rating_group,
            granted_units = request.granted_units,
            correlation_id = %request.correlation_id,
            "发送 RAR"
        );
        self.deliver_re_auth(&request).await
    }
}

#[async_trait]
impl CreditControlTransport for OcsSimulator {
    async fn send(&self, request: &CreditControlRequest) -> Result<(), ChargingError> {
        let cached = self
            .answers
            .get(&request.correlation_id)
            .map(|a| a.value().1.clone());
        let retransmission = cached.is_some();
        let answer = match cached {
            Some(answer) => answer,
            None => {
                let answer = self.answer_for(request);
                self.answers.insert(
                    request.correlation_id,
                    (request.session_id.clone(), answer.clone()),
                );
                answer
            }
        };

        self.records.lock().push(RequestRecord {
            correlation_id: request.correlation_id,
            subscriber: request.subscriber.clone(),
            rating_group: request.rating_group,
            request_type: request.request_type,
            request_number: request.request_number,
            requested_units: request.requested_units,
            used_bytes: request.used.as_ref().map(|u| u.bytes).unwrap_or(0),
            result_code: answer.result_code,
            granted_units: answer.granted.map(|g| g.units).unwrap_or(0),
            retransmission,
        });

        let dropped = self
            .drop_answers
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if dropped {
            debug!(correlation_id = %request.correlation_id, "模拟应答丢失");
            return Ok(());
        }

        debug!(
            correlation_id = %request.correlation_id,
            request_type = request.request_type.as_str(),
            result_code = answer.result_code,
            retransmission,
            "OCS 应答"
        );
        if request.request_type == RequestType::Termination {
            self.answers
                .retain(|_, (session_id, _)| session_id != &request.session_id);
        }
        self.deliver(answer)
    }
}
