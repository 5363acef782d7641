//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 信用控制协议处理器
//!
//! 负责 CCR-Initial / CCR-Update / CCR-Terminate 交换以及 RAR 处理。
//! 协议仅以语义字段建模，AVP 编解码由外部传输层完成。
//!
//! # 状态机
//!
//! 每个信用池对应一个 [`PoolMachine`]：
//!
//! ```text
//! Idle -> AwaitingInitialAnswer -> Active
//! Active -> AwaitingUpdateAnswer -> Active
//! Active -> AwaitingReAuthAnswer -> Active
//! 任意状态 -> Terminated
//! ```
//!
//! 客户端发起的更新与服务端发起的重授权可以同时进行，二者对账本的修改
//! 由账本池锁串行化；同一池上的重授权之间由重授权闸门串行化。
//!
//! # 应答关联
//!
//! 每个请求携带唯一的 [`CorrelationId`]，应答通过关联 ID 找到等待者。
//! 未知或过期的应答被丢弃并记录告警。重发请求复用同一关联 ID，使重试幂等。

use crate::config::ConflictPolicy;
use crate::enforcement::{EnforcementTracker, UsageReport};
use crate::error::{ChargingError, ResultCode};
use crate::ledger::{GrantMode, GrantedUnits, PoolKey, PoolSnapshot, QuotaLedger};
use crate::monitor::ReportingReason;
use ahash::AHashMap;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// 请求与应答的关联ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// CC-Request-Type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestType {
    Initial,
    Update,
    Termination,
}

impl RequestType {
    pub fn to_diameter(&self) -> u32 {
        match self {
            RequestType::Initial => 1,
            RequestType::Update => 2,
            RequestType::Termination => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestType::Initial => "initial",
            RequestType::Update => "update",
            RequestType::Termination => "termination",
        }
    }
}

/// 信用控制请求（每个请求对应一个费率组）
#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct CreditControlRequest {
    pub correlation_id: CorrelationId,
    pub session_id: String,
    pub subscriber: String,
    pub request_type: RequestType,
    pub request_number: u32,
    pub rating_group: u32,
    pub monitoring_key: Option<String>,
    /// 请求的服务单位；`None` 由 OCS 决定
    pub requested_units: Option<u64>,
    /// 自上次上报以来的使用量
    pub used: Option<UsageReport>,
    pub reason: Option<ReportingReason>,
}

/// 信用控制应答
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditControlAnswer {
    pub correlation_id: CorrelationId,
    /// Diameter 结果码
    pub result_code: u32,
    pub rating_group: u32,
    pub granted: Option<GrantedUnits>,
}

impl CreditControlAnswer {
    pub fn result(&self) -> ResultCode {
        ResultCode::from_diameter(self.result_code)
    }
}

/// 服务端发起的重授权请求
///
/// 携带用户ID，以便在关联ID之外完成会话路由。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReAuthRequest {
    pub correlation_id: CorrelationId,
    pub subscriber: String,
    pub rating_group: u32,
    /// 追加授予的字节数
    pub granted_units: u64,
}

/// 重授权应答
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReAuthAnswer {
    pub correlation_id: CorrelationId,
    pub result_code: ResultCode,
}

/// 信用控制传输层
///
/// 实现只负责发送；应答通过 [`CreditControlHandler::on_answer`] 异步送回。
/// 以相同关联ID重复发送必须是幂等的。
#[async_trait]
pub trait CreditControlTransport: Send + Sync {
    async fn send(&self, request: &CreditControlRequest) -> Result<(), ChargingError>;
}

/// 信用池协议阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PoolPhase {
    Idle,
    AwaitingInitialAnswer,
    Active,
    AwaitingUpdateAnswer,
    AwaitingReAuthAnswer,
    Terminated,
}

#[derive(Debug, Default)]
struct MachineState {
    activated: bool,
    terminated: bool,
    inflight: Option<(CorrelationId, RequestType)>,
    reauth_inflight: Option<CorrelationId>,
}

impl MachineState {
    fn phase(&self) -> PoolPhase {
        if self.terminated {
            return PoolPhase::Terminated;
        }
        if self.reauth_inflight.is_some() {
            return PoolPhase::AwaitingReAuthAnswer;
        }
        match self.inflight {
            Some((_, RequestType::Initial)) => PoolPhase::AwaitingInitialAnswer,
            Some((_, RequestType::Update)) => PoolPhase::AwaitingUpdateAnswer,
            _ if self.activated => PoolPhase::Active,
            _ => PoolPhase::Idle,
        }
    }
}

/// 已应答重授权的有界缓存
#[derive(Debug)]
struct ReplayCache {
    capacity: usize,
    answers: AHashMap<CorrelationId, ResultCode>,
    order: VecDeque<CorrelationId>,
}

impl ReplayCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            answers: AHashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&self, id: &CorrelationId) -> Option<ResultCode> {
        self.answers.get(id).copied()
    }

    fn insert(&mut self, id: CorrelationId, code: ResultCode) {
        if self.answers.insert(id, code).is_none() {
            self.order.push_back(id);
        }
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.answers.remove(&oldest);
            }
        }
    }
}

/// 单个信用池的协议状态机
#[derive(Debug)]
pub struct PoolMachine {
    key: PoolKey,
    state: Mutex<MachineState>,
    reauth_gate: tokio::sync::Mutex<()>,
    replay: Mutex<ReplayCache>,
    request_number: AtomicU32,
    /// 已上报给 OCS 的累计消费
    reported: AtomicU64,
}

impl PoolMachine {
    pub fn new(key: PoolKey, replay_capacity: usize) -> Self {
        Self {
            key,
            state: Mutex::new(MachineState::default()),
            reauth_gate: tokio::sync::Mutex::new(()),
            replay: Mutex::new(ReplayCache::new(replay_capacity)),
            request_number: AtomicU32::new(0),
            reported: AtomicU64::new(0),
        }
    }

    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    pub fn phase(&self) -> PoolPhase {
        self.state.lock().phase()
    }

    pub fn is_terminated(&self) -> bool {
        self.state.lock().terminated
    }

    /// 是否已收到成功的 CCR-Initial 应答
    pub fn is_activated(&self) -> bool {
        self.state.lock().activated
    }

    /// 已上报给 OCS 的累计消费
    pub fn reported(&self) -> u64 {
        self.reported.load(Ordering::Acquire)
    }

    /// 已应答的重授权结果
    pub fn replayed(&self, id: &CorrelationId) -> Option<ResultCode> {
        self.replay.lock().get(id)
    }

    /// 进入终止状态，返回被放弃的未完成请求
    pub fn terminate(&self) -> Option<CorrelationId> {
        let mut state = self.state.lock();
        state.terminated = true;
        state.inflight.take().map(|(id, _)| id)
    }

    fn next_request_number(&self) -> u32 {
        self.request_number.fetch_add(1, Ordering::AcqRel)
    }

    fn clear_inflight(&self, id: CorrelationId) {
        let mut state = self.state.lock();
        if state.inflight.map(|(current, _)| current) == Some(id) {
            state.inflight = None;
        }
    }
}

/// 一次进行中的请求-应答交换
#[derive(Debug)]
pub struct Exchange {
    request: CreditControlRequest,
    answer_rx: oneshot::Receiver<CreditControlAnswer>,
}

impl Exchange {
    pub fn request(&self) -> &CreditControlRequest {
        &self.request
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.request.correlation_id
    }
}

/// 应用应答的结果
#[derive(Debug, Clone, PartialEq)]
pub enum AnswerOutcome {
    /// 授予已写入账本
    Granted {
        snapshot: PoolSnapshot,
        /// 本次授予的字节数
        units: u64,
        /// 执行规则上限是否变化
        rules_rebuilt: bool,
    },
    /// OCS 拒绝，授予保持不变
    Rejected { result_code: u32 },
    /// CCR-Terminate 已确认
    Terminated,
}

#[derive(Debug)]
struct PendingAnswer {
    key: PoolKey,
    tx: oneshot::Sender<CreditControlAnswer>,
}

/// 信用控制协议处理器
pub struct CreditControlHandler {
    ledger: Arc<QuotaLedger>,
    enforcement: Arc<EnforcementTracker>,
    transport: Arc<dyn CreditControlTransport>,
    pending: DashMap<CorrelationId, PendingAnswer>,
}

impl std::fmt::Debug for CreditControlHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CreditControlHandler")
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl CreditControlHandler {
    pub fn new(
        ledger: Arc<QuotaLedger>,
        enforcement: Arc<EnforcementTracker>,
        transport: Arc<dyn CreditControlTransport>,
    ) -> Self {
        Self {
            ledger,
            enforcement,
            transport,
            pending: DashMap::new(),
        }
    }

    /// 未完成的请求数
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// 创建请求并登记等待者
    ///
    /// 同一池上同时最多一个 CCR-Initial/Update；已终止的池只允许 CCR-Terminate。
    pub fn open_exchange(
        &self,
        machine: &PoolMachine,
        session_id: &str,
        request_type: RequestType,
        requested_units: Option<u64>,
        reason: Option<ReportingReason>,
    ) -> Result<Exchange, ChargingError> {
        let key = machine.key();
        let used = match request_type {
            RequestType::Initial => None,
            RequestType::Update | RequestType::Termination => {
                let snapshot = self.ledger.snapshot(&key.subscriber, key.rating_group)?;
                let unreported = snapshot.consumed.saturating_sub(machine.reported());
                Some(UsageReport::new(key.clone(), unreported))
            }
        };

        let correlation_id = CorrelationId::new();
        {
            let mut state = machine.state.lock();
            if request_type != RequestType::Termination {
                if state.terminated {
                    return Err(ChargingError::SessionTerminated(key.to_string()));
                }
                if let Some((inflight, _)) = state.inflight {
                    return Err(ChargingError::Conflict(format!(
                        "{} 已有未完成的请求 {}",
                        key, inflight
                    )));
                }
                state.inflight = Some((correlation_id, request_type));
            }
        }

        let request = CreditControlRequest {
            correlation_id,
            session_id: session_id.to_string(),
            subscriber: key.subscriber.clone(),
            request_type,
            request_number: machine.next_request_number(),
            rating_group: key.rating_group,
            monitoring_key: key.monitoring_key.clone(),
            requested_units,
            used,
            reason,
        };

        let (tx, answer_rx) = oneshot::channel();
        self.pending.insert(
            correlation_id,
            PendingAnswer {
                key: key.clone(),
                tx,
            },
        );
        debug!(
            pool = %key,
            correlation_id = %correlation_id,
            request_type = request.request_type.as_str(),
            request_number = request.request_number,
            "创建信用控制请求"
        );

        Ok(Exchange { request, answer_rx })
    }

    /// 发送（或重发）请求
    pub async fn submit(&self, exchange: &Exchange) -> Result<(), ChargingError> {
        debug!(
            correlation_id = %exchange.correlation_id(),
            request_type = exchange.request.request_type.as_str(),
            "发送信用控制请求"
        );
        self.transport.send(&exchange.request).await
    }

    /// 在期限内等待应答
    ///
    /// 超时后交换仍然有效，可以重发后再次等待。
    pub async fn await_answer(
        &self,
        exchange: &mut Exchange,
        deadline: Duration,
    ) -> Result<CreditControlAnswer, ChargingError> {
        match tokio::time::timeout(deadline, &mut exchange.answer_rx).await {
            Ok(Ok(answer)) => Ok(answer),
            Ok(Err(_)) => Err(ChargingError::SessionTerminated(format!(
                "请求 {} 已被放弃",
                exchange.correlation_id()
            ))),
            Err(_) => Err(ChargingError::Timeout(format!(
                "等待 {} 应答超过 {:?}",
                exchange.correlation_id(),
                deadline
            ))),
        }
    }

    /// 投递来自 OCS 的应答
    ///
    /// 返回是否有等待者接收；未知或过期的应答被丢弃。
    pub fn on_answer(&self, answer: CreditControlAnswer) -> bool {
        let Some((_, pending)) = self.pending.remove(&answer.correlation_id) else {
            warn!(
                correlation_id = %answer.correlation_id,
                result_code = answer.result_code,
                "丢弃未知或过期的应答"
            );
            return false;
        };
        let correlation_id = answer.correlation_id;
        if pending.tx.send(answer).is_err() {
            warn!(pool = %pending.key, correlation_id = %correlation_id, "等待者已退出，丢弃应答");
            return false;
        }
        true
    }

    /// 放弃交换：移除等待者并清除未完成标记
    pub fn abandon(&self, machine: &PoolMachine, exchange: Exchange) {
        let id = exchange.correlation_id();
        self.pending.remove(&id);
        machine.clear_inflight(id);
        debug!(pool = %machine.key(), correlation_id = %id, "放弃信用控制请求");
    }

    /// 丢弃等待者，其 `await_answer` 以会话终止结束
    pub fn discard(&self, id: &CorrelationId) -> bool {
        self.pending.remove(id).is_some()
    }

    /// 将应答应用到账本与执行规则
    pub fn apply_answer(
        &self,
        machine: &PoolMachine,
        exchange: Exchange,
        answer: CreditControlAnswer,
    ) -> Result<AnswerOutcome, ChargingError> {
        let id = exchange.correlation_id();
        let outcome = self.apply_inner(machine, &exchange.request, answer);
        machine.clear_inflight(id);
        if matches!(
            (&outcome, exchange.request.request_type),
            (Ok(AnswerOutcome::Granted { .. }), RequestType::Initial)
        ) {
            machine.state.lock().activated = true;
        }
        outcome
    }

    fn apply_inner(
        &self,
        machine: &PoolMachine,
        request: &CreditControlRequest,
        answer: CreditControlAnswer,
    ) -> Result<AnswerOutcome, ChargingError> {
        let key = machine.key();
        if answer.correlation_id != request.correlation_id {
            return Err(ChargingError::ProtocolFailure(format!(
                "应答关联ID不匹配: {} != {}",
                answer.correlation_id, request.correlation_id
            )));
        }
        if answer.rating_group != request.rating_group {
            return Err(ChargingError::ProtocolFailure(format!(
                "应答费率组不匹配: {} != {}",
                answer.rating_group, request.rating_group
            )));
        }

        if request.request_type == RequestType::Termination {
            info!(pool = %key, result_code = answer.result_code, "CCR-Terminate 已确认");
            return Ok(AnswerOutcome::Terminated);
        }

        {
            let state = machine.state.lock();
            if state.terminated {
                return Err(ChargingError::SessionTerminated(key.to_string()));
            }
            if state.inflight.map(|(current, _)| current) != Some(request.correlation_id) {
                warn!(pool = %key, correlation_id = %request.correlation_id, "应答已过期");
                return Err(ChargingError::ProtocolFailure(format!(
                    "过期应答: {}",
                    request.correlation_id
                )));
            }
        }

        if !answer.result().is_success() {
            return match request.request_type {
                RequestType::Initial => Err(ChargingError::ProtocolFailure(format!(
                    "CCR-Initial 被拒绝: {} ({})",
                    answer.result_code, key
                ))),
                _ => {
                    warn!(pool = %key, result_code = answer.result_code, "CCR-Update 被拒绝，保留原授予");
                    Ok(AnswerOutcome::Rejected {
                        result_code: answer.result_code,
                    })
                }
            };
        }

        if let Some(used) = &request.used {
            machine.reported.fetch_add(used.bytes, Ordering::AcqRel);
        }

        let (mode, granted) = match request.request_type {
            RequestType::Initial => (GrantMode::Initial, answer.granted.unwrap_or_default()),
            _ => match answer.granted {
                Some(granted) => (GrantMode::TopUp, granted),
                None => {
                    let snapshot = self.ledger.snapshot(&key.subscriber, key.rating_group)?;
                    return Ok(AnswerOutcome::Granted {
                        snapshot,
                        units: 0,
                        rules_rebuilt: false,
                    });
                }
            },
        };

        let (snapshot, rules_rebuilt) =
            self.ledger
                .grant_then(&key.subscriber, key.rating_group, granted, mode, |snapshot| {
                    self.enforcement
                        .rebuild(&key.subscriber, key.rating_group, snapshot.granted_total)
                })?;
        info!(
            pool = %key,
            request_type = request.request_type.as_str(),
            units = granted.units,
            granted_total = snapshot.granted_total,
            "信用已授予"
        );
        Ok(AnswerOutcome::Granted {
            snapshot,
            units: granted.units,
            rules_rebuilt,
        })
    }

    /// 处理重授权
    ///
    /// 同一池上的重授权经闸门串行化；已应答的关联ID直接返回缓存结果。
    /// 只有致命错误（账本损坏）以 `Err` 返回，其余失败映射为结果码。
    pub async fn re_auth(
        &self,
        machine: &PoolMachine,
        request: &ReAuthRequest,
        deadline: Duration,
        policy: ConflictPolicy,
    ) -> Result<ResultCode, ChargingError> {
        if let Some(code) = machine.replayed(&request.correlation_id) {
            debug!(correlation_id = %request.correlation_id, result = %code, "重放已应答的重授权");
            return Ok(code);
        }

        let _gate = match machine.reauth_gate.try_lock() {
            Ok(gate) => gate,
            Err(_) => {
                let same_transaction =
                    machine.state.lock().reauth_inflight == Some(request.correlation_id);
                if policy == ConflictPolicy::Reject && !same_transaction {
                    warn!(
                        pool = %machine.key(),
                        correlation_id = %request.correlation_id,
                        "同一信用池上已有重授权在处理"
                    );
                    return Ok(ResultCode::Conflict);
                }
                match tokio::time::timeout(deadline, machine.reauth_gate.lock()).await {
                    Ok(gate) => gate,
                    Err(_) => {
                        warn!(
                            pool = %machine.key(),
                            correlation_id = %request.correlation_id,
                            "等待重授权闸门超时"
                        );
                        return Ok(ResultCode::Timeout);
                    }
                }
            }
        };

        // 排队期间可能已被应答
        if let Some(code) = machine.replayed(&request.correlation_id) {
            return Ok(code);
        }

        {
            let mut state = machine.state.lock();
            if state.terminated {
                return Ok(ResultCode::Failure);
            }
            state.reauth_inflight = Some(request.correlation_id);
        }

        let result = self.apply_re_auth(machine, request);
        machine.state.lock().reauth_inflight = None;

        let code = result?;
        machine.replay.lock().insert(request.correlation_id, code);
        Ok(code)
    }

    fn apply_re_auth(
        &self,
        machine: &PoolMachine,
        request: &ReAuthRequest,
    ) -> Result<ResultCode, ChargingError> {
        let key = machine.key();
        if request.subscriber != key.subscriber || request.rating_group != key.rating_group {
            warn!(pool = %key, correlation_id = %request.correlation_id, "重授权目标与信用池不符");
            return Ok(ResultCode::Failure);
        }
        if let Err(e) = self.ledger.snapshot(&key.subscriber, key.rating_group) {
            warn!(pool = %key, error = %e, "重授权的信用池不存在");
            return Ok(ResultCode::Failure);
        }

        let (snapshot, rules_rebuilt) = match self.ledger.grant_then(
            &key.subscriber,
            key.rating_group,
            GrantedUnits::bytes(request.granted_units),
            GrantMode::TopUp,
            |snapshot| {
                self.enforcement
                    .rebuild(&key.subscriber, key.rating_group, snapshot.granted_total)
            },
        ) {
            Ok(applied) => applied,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!(pool = %key, error = %e, "重授权授予失败");
                return Ok(ResultCode::Failure);
            }
        };

        let code = if rules_rebuilt {
            ResultCode::LimitedSuccess
        } else {
            ResultCode::Success
        };
        info!(
            pool = %key,
            correlation_id = %request.correlation_id,
            units = request.granted_units,
            granted_total = snapshot.granted_total,
            result = %code,
            "重授权已应用"
        );
        Ok(code)
    }
}
