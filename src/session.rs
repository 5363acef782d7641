//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 会话控制器
//!
//! 面向调用方的入口：建立与拆除计费会话、上报数据面使用量、处理 RAR、
//! 查询剩余配额。
//!
//! # 架构
//!
//! - 会话竞技场：`DashMap<用户ID, Arc<ChargingSession>>`，用户之间无锁争用
//! - 每个会话一个工作任务，串行处理使用量监控产生的 CCR-Update
//! - CCR-Update 超时按指数退避重发，重发复用关联ID
//! - RAR 在调用方任务中处理，完成授予与规则重建后一次性发布就绪信号
//! - 会话终止时取消工作任务、放弃未完成的请求、发送 CCR-Terminate
//!
//! # 示例
//!
//! ```rust,ignore
//! use creditron::prelude::*;
//! use std::sync::Arc;
//!
//! let simulator = Arc::new(OcsSimulator::new(OcsConfig::default()));
//! let controller = Arc::new(SessionController::new(ChargingConfig::default(), simulator.clone())?);
//! simulator.attach(&controller);
//!
//! simulator.set_credit("IMSI001", 1, 500_000);
//! let handle = controller
//!     .start_session_with(AuthResult::accepted("IMSI001"), &[1])
//!     .await?;
//! let outcome = controller.report_usage(&handle, 1, 400_000).await?;
//! assert!(outcome.update_requested);
//! controller.end_session(&handle).await?;
//! ```

use crate::config::ChargingConfig;
use crate::constants::{EXHAUSTED_RATIO, MAX_SUBSCRIBER_ID_LENGTH};
use crate::enforcement::{EnforcementTracker, RuleProvisioning};
use crate::error::{ChargingError, ResultCode};
use crate::ledger::{PoolKey, QuotaLedger};
use crate::monitor::{ReportingReason, UpdateNeeded, UsageMonitor};
use crate::protocol::{
    AnswerOutcome, CorrelationId, CreditControlAnswer, CreditControlHandler,
    CreditControlTransport, Exchange, PoolMachine, PoolPhase, ReAuthAnswer, ReAuthRequest,
    RequestType,
};
#[cfg(feature = "monitoring")]
use crate::telemetry::Metrics;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// 在启用 `monitoring` 特性时记录指标
macro_rules! record_metric {
    ($core:expr, |$metrics:ident| $body:expr) => {
        #[cfg(feature = "monitoring")]
        {
            if let Some($metrics) = $core.metrics.as_deref() {
                $body;
            }
        }
    };
}

/// 外部鉴权结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthResult {
    pub subscriber: String,
    pub authenticated: bool,
}

impl AuthResult {
    pub fn accepted(subscriber: impl Into<String>) -> Self {
        Self {
            subscriber: subscriber.into(),
            authenticated: true,
        }
    }

    pub fn rejected(subscriber: impl Into<String>) -> Self {
        Self {
            subscriber: subscriber.into(),
            authenticated: false,
        }
    }
}

/// 会话句柄
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionHandle {
    subscriber: String,
    session_id: String,
}

impl SessionHandle {
    fn new(subscriber: &str) -> Self {
        Self {
            subscriber: subscriber.to_string(),
            session_id: format!("creditron;{};{}", subscriber, Uuid::new_v4().simple()),
        }
    }

    pub fn subscriber(&self) -> &str {
        &self.subscriber
    }

    /// Diameter Session-Id
    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

impl std::fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.session_id)
    }
}

/// 重授权事务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReAuthStatus {
    /// 尚未应答
    Pending,
    /// 已应答（授予与规则重建均已完成）
    Answered(ResultCode),
    /// 在期限内未能处理
    TimedOut,
    /// 会话在应答前终止
    Terminated,
}

impl ReAuthStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ReAuthStatus::Pending)
    }

    fn is_settleable(&self) -> bool {
        matches!(
            self,
            ReAuthStatus::Pending
                | ReAuthStatus::TimedOut
                | ReAuthStatus::Answered(ResultCode::Conflict)
        )
    }
}

/// 重授权事务
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReAuthTransaction {
    pub correlation_id: CorrelationId,
    pub subscriber: String,
    /// RAR 到达前登记的等待者看不到费率组
    pub rating_group: Option<u32>,
    pub granted_units: u64,
    pub status: ReAuthStatus,
}

/// 一次使用量上报的结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageOutcome {
    /// 放行字节数
    pub forwarded: u64,
    /// 超出上限被丢弃的字节数
    pub dropped: u64,
    /// 池的累计消费
    pub consumed: u64,
    /// 池的授予总量
    pub granted_total: u64,
    /// 是否已耗尽授予
    pub exhausted: bool,
    /// 本次上报是否触发了 CCR-Update
    pub update_requested: bool,
    /// 计入的执行规则
    pub rule_id: Option<String>,
}

#[derive(Debug)]
enum WorkerEvent {
    Update(UpdateNeeded),
}

type ReAuthSlot = Arc<watch::Sender<ReAuthTransaction>>;

/// 计费会话
#[derive(Debug)]
pub struct ChargingSession {
    handle: SessionHandle,
    machines: DashMap<u32, Arc<PoolMachine>>,
    monitoring_keys: Vec<String>,
    reauths: DashMap<CorrelationId, ReAuthSlot>,
    events: mpsc::Sender<WorkerEvent>,
    shutdown: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    last_activity: Mutex<Instant>,
    created_at: DateTime<Utc>,
    started: AtomicBool,
    terminated: AtomicBool,
}

impl ChargingSession {
    fn new(
        handle: SessionHandle,
        events: mpsc::Sender<WorkerEvent>,
        monitoring_keys: Vec<String>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            handle,
            machines: DashMap::new(),
            monitoring_keys,
            reauths: DashMap::new(),
            events,
            shutdown,
            worker: Mutex::new(None),
            last_activity: Mutex::new(Instant::now()),
            created_at: Utc::now(),
            started: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
        }
    }

    pub fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    pub fn subscriber(&self) -> &str {
        &self.handle.subscriber
    }

    pub fn session_id(&self) -> &str {
        &self.handle.session_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// PCRF 跟踪的监控键
    pub fn monitoring_keys(&self) -> &[String] {
        &self.monitoring_keys
    }

    pub fn rating_groups(&self) -> Vec<u32> {
        let mut groups: Vec<u32> = self.machines.iter().map(|m| *m.key()).collect();
        groups.sort_unstable();
        groups
    }

    pub fn machine(&self, rating_group: u32) -> Option<Arc<PoolMachine>> {
        self.machines.get(&rating_group).map(|m| m.value().clone())
    }

    fn machines(&self) -> Vec<Arc<PoolMachine>> {
        let mut machines: Vec<Arc<PoolMachine>> =
            self.machines.iter().map(|m| m.value().clone()).collect();
        machines.sort_by_key(|m| m.key().rating_group);
        machines
    }

    pub fn phase(&self, rating_group: u32) -> Option<PoolPhase> {
        self.machine(rating_group).map(|m| m.phase())
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// 距最后一次活动的时长
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    fn reauth_slot(&self, id: CorrelationId, request: Option<&ReAuthRequest>) -> ReAuthSlot {
        let entry = self.reauths.entry(id).or_insert_with(|| {
            let (tx, _) = watch::channel(ReAuthTransaction {
                correlation_id: id,
                subscriber: self.handle.subscriber.clone(),
                rating_group: None,
                granted_units: 0,
                status: ReAuthStatus::Pending,
            });
            Arc::new(tx)
        });
        // 在持有表项时记录请求，与 forget_waiting_slot 互斥；重放不改写首次内容
        if let Some(request) = request {
            entry.send_if_modified(|transaction| {
                if transaction.rating_group.is_some() {
                    return false;
                }
                transaction.rating_group = Some(request.rating_group);
                transaction.granted_units = request.granted_units;
                true
            });
        }
        entry.value().clone()
    }

    /// 移除只有等待者创建、RAR 尚未到达且无人等待的槽位
    fn forget_waiting_slot(&self, id: &CorrelationId) -> bool {
        self.reauths
            .remove_if(id, |_, slot| {
                let transaction = slot.borrow();
                transaction.status == ReAuthStatus::Pending
                    && transaction.rating_group.is_none()
                    && slot.receiver_count() == 0
            })
            .is_some()
    }

    /// 查询重授权事务
    pub fn re_auth_transaction(&self, id: &CorrelationId) -> Option<ReAuthTransaction> {
        self.reauths.get(id).map(|slot| slot.borrow().clone())
    }

    fn prune_reauths(&self, capacity: usize) {
        if self.reauths.len() > capacity {
            self.reauths.retain(|_, slot| {
                !(slot.borrow().status.is_terminal() && slot.receiver_count() == 0)
            });
        }
    }
}

/// 发布事务状态；已应答（冲突除外）或已终止的事务不再改变
fn settle(slot: &ReAuthSlot, status: ReAuthStatus) {
    slot.send_if_modified(|transaction| {
        if transaction.status.is_settleable() {
            transaction.status = status;
            true
        } else {
            false
        }
    });
}

fn validate_subscriber(subscriber: &str) -> Result<(), ChargingError> {
    if subscriber.is_empty() {
        return Err(ChargingError::ValidationError("用户ID不能为空".to_string()));
    }
    if subscriber.len() > MAX_SUBSCRIBER_ID_LENGTH {
        return Err(ChargingError::ValidationError(format!(
            "用户ID长度超过 {} 个字符",
            MAX_SUBSCRIBER_ID_LENGTH
        )));
    }
    if !subscriber
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'))
    {
        return Err(ChargingError::ValidationError(format!(
            "用户ID包含非法字符: {}",
            subscriber
        )));
    }
    Ok(())
}

struct ControllerCore {
    config: ChargingConfig,
    ledger: Arc<QuotaLedger>,
    monitor: Arc<UsageMonitor>,
    enforcement: Arc<EnforcementTracker>,
    handler: CreditControlHandler,
    sessions: DashMap<String, Arc<ChargingSession>>,
    #[cfg(feature = "monitoring")]
    metrics: Option<Arc<Metrics>>,
}

impl ControllerCore {
    fn session(&self, handle: &SessionHandle) -> Result<Arc<ChargingSession>, ChargingError> {
        let session = self
            .sessions
            .get(handle.subscriber())
            .map(|s| s.value().clone())
            .ok_or_else(|| ChargingError::UnknownSubscriber(handle.subscriber().to_string()))?;
        if session.session_id() != handle.session_id() {
            return Err(ChargingError::SessionTerminated(handle.session_id().to_string()));
        }
        Ok(session)
    }

    /// 发送请求并等待应答，超时按指数退避重发
    async fn drive(
        &self,
        exchange: &mut Exchange,
        deadline: Duration,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<CreditControlAnswer, ChargingError> {
        let retry = &self.config.retry;
        let mut last_error = ChargingError::Timeout(exchange.correlation_id().to_string());

        for attempt in 0..retry.max_attempts {
            if attempt > 0 {
                // 上一轮超时后迟到的应答
                match self.handler.await_answer(exchange, Duration::ZERO).await {
                    Ok(answer) => return Ok(answer),
                    Err(ChargingError::Timeout(_)) => {}
                    Err(e) => return Err(e),
                }
            }

            record_metric!(self, |m| m.record_ccr(exchange.request().request_type));
            match self.handler.submit(exchange).await {
                Ok(()) => match self.handler.await_answer(exchange, deadline).await {
                    Ok(answer) => return Ok(answer),
                    Err(ChargingError::Timeout(message)) => {
                        warn!(
                            correlation_id = %exchange.correlation_id(),
                            attempt,
                            "等待信用控制应答超时"
                        );
                        record_metric!(self, |m| m.record_ccr_timeout());
                        last_error = ChargingError::Timeout(message);
                    }
                    Err(e) => return Err(e),
                },
                Err(e) => {
                    warn!(correlation_id = %exchange.correlation_id(), attempt, error = %e, "发送信用控制请求失败");
                    last_error = e;
                }
            }

            if attempt + 1 < retry.max_attempts {
                let backoff = retry.backoff(attempt);
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = shutdown.changed() => {
                        return Err(ChargingError::SessionTerminated(
                            exchange.request().session_id.clone(),
                        ));
                    }
                }
            }
        }

        Err(last_error)
    }

    /// 将更新事件交给会话工作任务
    fn enqueue(&self, session: &ChargingSession, update: UpdateNeeded) -> bool {
        record_metric!(self, |m| m.record_update_needed());
        match session.events.try_send(WorkerEvent::Update(update)) {
            Ok(()) => true,
            Err(e) => {
                let WorkerEvent::Update(update) = e.into_inner();
                warn!(pool = %update.key, "工作通道不可用，丢弃更新事件");
                self.monitor.complete(&update.key);
                false
            }
        }
    }

    async fn process_update(
        self: &Arc<Self>,
        session: &Arc<ChargingSession>,
        update: UpdateNeeded,
        shutdown: &mut watch::Receiver<bool>,
    ) {
        let key = update.key.clone();
        let Some(machine) = session.machine(key.rating_group) else {
            self.monitor.complete(&key);
            return;
        };

        let requested = (update.requested_units > 0).then_some(update.requested_units);
        let mut exchange = match self.handler.open_exchange(
            &machine,
            session.session_id(),
            RequestType::Update,
            requested,
            Some(update.reason),
        ) {
            Ok(exchange) => exchange,
            Err(e) => {
                debug!(pool = %key, error = %e, "无法发送 CCR-Update");
                self.monitor.complete(&key);
                return;
            }
        };

        let answer = self
            .drive(&mut exchange, self.config.ccr_timeout(), shutdown)
            .await;
        let answer = match answer {
            Ok(answer) => answer,
            Err(e) => {
                warn!(pool = %key, error = %e, "放弃 CCR-Update");
                self.handler.abandon(&machine, exchange);
                self.monitor.complete(&key);
                return;
            }
        };

        match self.handler.apply_answer(&machine, exchange, answer) {
            Ok(AnswerOutcome::Granted { snapshot, units, .. }) => {
                if let Some((raised_sequence, raised_at)) = self.monitor.pending_since(&key) {
                    debug!(
                        pool = %key,
                        raised_sequence,
                        sequence = snapshot.sequence,
                        elapsed_ms = (Utc::now() - raised_at).num_milliseconds(),
                        units,
                        "CCR-Update 已完成"
                    );
                }
                self.monitor.complete(&key);
                if units > 0 {
                    if let Some(next) = self.monitor.evaluate(&snapshot) {
                        self.enqueue(session, next);
                    }
                }
            }
            Ok(AnswerOutcome::Rejected { .. }) => {
                match self.ledger.snapshot(&key.subscriber, key.rating_group) {
                    Ok(snapshot) => {
                        self.monitor.complete_rejected(&key, snapshot.granted_total);
                    }
                    Err(_) => {
                        self.monitor.complete(&key);
                    }
                }
            }
            Ok(AnswerOutcome::Terminated) => {
                self.monitor.complete(&key);
            }
            Err(e) if e.is_fatal() => {
                self.monitor.complete(&key);
                self.abort(session.clone(), &e);
            }
            Err(e) => {
                warn!(pool = %key, error = %e, "应用 CCR-Update 应答失败");
                self.monitor.complete(&key);
            }
        }
    }

    /// 致命错误后在独立任务中终止会话
    fn abort(self: &Arc<Self>, session: Arc<ChargingSession>, cause: &ChargingError) {
        error!(subscriber = %session.subscriber(), error = %cause, "致命错误，终止会话");
        let core = self.clone();
        tokio::spawn(async move {
            core.terminate(session).await;
        });
    }

    async fn terminate(&self, session: Arc<ChargingSession>) {
        if session.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        let subscriber = session.subscriber().to_string();
        self.sessions
            .remove_if(&subscriber, |_, current| Arc::ptr_eq(current, &session));

        let machines = session.machines();
        let activated: Vec<bool> = machines.iter().map(|m| m.is_activated()).collect();
        for machine in &machines {
            if let Some(abandoned) = machine.terminate() {
                self.handler.discard(&abandoned);
            }
        }
        session.shutdown.send_replace(true);

        for slot in session.reauths.iter() {
            settle(slot.value(), ReAuthStatus::Terminated);
        }

        let deadline = self.config.terminate_timeout();
        for (machine, activated) in machines.iter().zip(activated) {
            if !activated {
                continue;
            }
            self.send_terminate(&session, machine, deadline).await;
        }

        let worker = session.worker.lock().take();
        if let Some(worker) = worker {
            let abort = worker.abort_handle();
            if tokio::time::timeout(deadline, worker).await.is_err() {
                warn!(subscriber = %subscriber, "工作任务未能按时退出，强制取消");
                abort.abort();
            }
        }

        self.monitor.clear_subscriber(&subscriber);
        self.enforcement.clear_subscriber(&subscriber);
        let pools = self.ledger.close_subscriber(&subscriber);
        record_metric!(self, |m| m.set_active_sessions(self.sessions.len()));

        for pool in &pools {
            info!(
                pool = %pool.key,
                consumed = pool.consumed,
                granted_total = pool.granted_total,
                "信用池已关闭"
            );
        }
        info!(session_id = %session.session_id(), "会话已终止");
    }

    async fn send_terminate(&self, session: &ChargingSession, machine: &PoolMachine, deadline: Duration) {
        let mut exchange = match self.handler.open_exchange(
            machine,
            session.session_id(),
            RequestType::Termination,
            None,
            Some(ReportingReason::Final),
        ) {
            Ok(exchange) => exchange,
            Err(e) => {
                warn!(pool = %machine.key(), error = %e, "无法发送 CCR-Terminate");
                return;
            }
        };

        record_metric!(self, |m| m.record_ccr(RequestType::Termination));
        if let Err(e) = self.handler.submit(&exchange).await {
            warn!(pool = %machine.key(), error = %e, "发送 CCR-Terminate 失败");
            self.handler.abandon(machine, exchange);
            return;
        }
        match self.handler.await_answer(&mut exchange, deadline).await {
            Ok(answer) => {
                if let Err(e) = self.handler.apply_answer(machine, exchange, answer) {
                    warn!(pool = %machine.key(), error = %e, "CCR-Terminate 应答无效");
                }
            }
            Err(e) => {
                warn!(pool = %machine.key(), error = %e, "未收到 CCR-Terminate 应答");
                self.handler.abandon(machine, exchange);
            }
        }
    }

    async fn re_auth(self: &Arc<Self>, request: &ReAuthRequest, deadline: Duration) -> ResultCode {
        let Some(session) = self
            .sessions
            .get(&request.subscriber)
            .map(|s| s.value().clone())
        else {
            warn!("未知用户的重授权");
            return ResultCode::Failure;
        };
        if !session.is_started() || session.is_terminated() {
            return ResultCode::Failure;
        }

        let slot = session.reauth_slot(request.correlation_id, Some(request));
        let status = slot.borrow().status;
        if let ReAuthStatus::Answered(code) = status {
            if code != ResultCode::Conflict {
                debug!(result = %code, "重放已应答的重授权");
                return code;
            }
        }

        let Some(machine) = session.machine(request.rating_group) else {
            warn!("重授权的费率组不属于该会话");
            settle(&slot, ReAuthStatus::Answered(ResultCode::Failure));
            return ResultCode::Failure;
        };

        let code = match self
            .handler
            .re_auth(&machine, request, deadline, self.config.reauth_conflict_policy)
            .await
        {
            Ok(code) => code,
            Err(e) => {
                let code = e.result_code();
                settle(&slot, ReAuthStatus::Answered(code));
                if e.is_fatal() {
                    self.abort(session, &e);
                } else {
                    warn!(error = %e, "重授权处理失败");
                }
                return code;
            }
        };

        let status = match code {
            ResultCode::Timeout => ReAuthStatus::TimedOut,
            code => ReAuthStatus::Answered(code),
        };
        settle(&slot, status);
        session.touch();
        session.prune_reauths(self.config.reauth_replay_capacity);
        code
    }

    /// 有效期已到且无未完成更新的池触发 CCR-Update
    fn sweep_validity(&self, session: &ChargingSession) {
        let Ok(pools) = self.ledger.pools(session.subscriber()) else {
            return;
        };
        let now = Utc::now();
        for pool in pools.iter().filter(|p| p.is_expired(now)) {
            if let Some(update) = self.monitor.evaluate(pool) {
                self.enqueue(session, update);
            }
        }
    }
}

async fn run_worker(
    core: Arc<ControllerCore>,
    session: Arc<ChargingSession>,
    mut events: mpsc::Receiver<WorkerEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(subscriber = %session.subscriber(), "会话工作任务启动");
    loop {
        // drive 可能已消费了关闭通知
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            event = events.recv() => match event {
                Some(WorkerEvent::Update(update)) => {
                    core.process_update(&session, update, &mut shutdown).await;
                }
                None => break,
            },
        }
    }

    while let Ok(WorkerEvent::Update(update)) = events.try_recv() {
        core.monitor.complete(&update.key);
    }
    debug!(subscriber = %session.subscriber(), "会话工作任务退出");
}

/// 会话控制器
pub struct SessionController {
    core: Arc<ControllerCore>,
}

impl std::fmt::Debug for SessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionController")
            .field("sessions", &self.core.sessions.len())
            .field("handler", &self.core.handler)
            .finish()
    }
}

impl SessionController {
    /// 创建控制器
    ///
    /// 启用 `monitoring` 特性时使用已设置的全局指标实例。
    pub fn new(
        config: ChargingConfig,
        transport: Arc<dyn CreditControlTransport>,
    ) -> Result<Self, ChargingError> {
        Self::build(
            config,
            transport,
            #[cfg(feature = "monitoring")]
            crate::telemetry::try_global(),
        )
    }

    /// 创建带指标的控制器
    #[cfg(feature = "monitoring")]
    pub fn with_metrics(
        config: ChargingConfig,
        transport: Arc<dyn CreditControlTransport>,
        metrics: Option<Arc<Metrics>>,
    ) -> Result<Self, ChargingError> {
        Self::build(config, transport, metrics)
    }

    fn build(
        config: ChargingConfig,
        transport: Arc<dyn CreditControlTransport>,
        #[cfg(feature = "monitoring")] metrics: Option<Arc<Metrics>>,
    ) -> Result<Self, ChargingError> {
        config.validate().map_err(ChargingError::ConfigError)?;

        let ledger = Arc::new(QuotaLedger::new());
        let monitor = Arc::new(UsageMonitor::from_config(&config));
        let enforcement = Arc::new(EnforcementTracker::from_config(&config));
        let handler = CreditControlHandler::new(ledger.clone(), enforcement.clone(), transport);

        Ok(Self {
            core: Arc::new(ControllerCore {
                config,
                ledger,
                monitor,
                enforcement,
                handler,
                sessions: DashMap::new(),
                #[cfg(feature = "monitoring")]
                metrics,
            }),
        })
    }

    pub fn config(&self) -> &ChargingConfig {
        &self.core.config
    }

    pub fn ledger(&self) -> &Arc<QuotaLedger> {
        &self.core.ledger
    }

    pub fn monitor(&self) -> &Arc<UsageMonitor> {
        &self.core.monitor
    }

    pub fn enforcement(&self) -> &Arc<EnforcementTracker> {
        &self.core.enforcement
    }

    /// 规则下发接口
    pub fn rule_provisioning(&self) -> Arc<dyn RuleProvisioning> {
        self.core.enforcement.clone()
    }

    /// 按用户查找会话
    pub fn session(&self, subscriber: &str) -> Option<Arc<ChargingSession>> {
        self.core.sessions.get(subscriber).map(|s| s.value().clone())
    }

    pub fn active_sessions(&self) -> usize {
        self.core.sessions.len()
    }

    /// 以已安装的 OCS 跟踪规则的费率组建立会话
    #[instrument(skip(self, auth), fields(subscriber = %auth.subscriber))]
    pub async fn start_session(&self, auth: AuthResult) -> Result<SessionHandle, ChargingError> {
        let rating_groups = self.core.enforcement.rating_groups(&auth.subscriber);
        self.start_session_with(auth, &rating_groups).await
    }

    /// 以指定费率组建立会话
    ///
    /// 每个费率组发送一次 CCR-Initial；任一失败则会话不建立。
    #[instrument(skip(self, auth), fields(subscriber = %auth.subscriber))]
    pub async fn start_session_with(
        &self,
        auth: AuthResult,
        rating_groups: &[u32],
    ) -> Result<SessionHandle, ChargingError> {
        let core = &self.core;
        let subscriber = auth.subscriber.as_str();
        validate_subscriber(subscriber)?;
        if !auth.authenticated {
            return Err(ChargingError::AuthenticationRejected(subscriber.to_string()));
        }
        let mut groups = rating_groups.to_vec();
        groups.sort_unstable();
        groups.dedup();
        if groups.is_empty() {
            return Err(ChargingError::ValidationError(
                "会话至少需要一个费率组".to_string(),
            ));
        }

        let handle = SessionHandle::new(subscriber);
        let (events_tx, events_rx) = mpsc::channel(core.config.worker_channel_capacity);
        let session = Arc::new(ChargingSession::new(
            handle.clone(),
            events_tx,
            core.enforcement.monitoring_keys(subscriber),
        ));

        match core.sessions.entry(subscriber.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(ChargingError::Conflict(format!("用户已有活动会话: {}", subscriber)));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(session.clone());
            }
        }

        core.ledger.open_subscriber(subscriber);
        for rating_group in &groups {
            let key = PoolKey::new(subscriber, *rating_group);
            if let Err(e) = core.ledger.open_pool(key.clone()) {
                self.discard_session(&session);
                return Err(e);
            }
            session.machines.insert(
                *rating_group,
                Arc::new(PoolMachine::new(key, core.config.reauth_replay_capacity)),
            );
        }

        let mut shutdown = session.shutdown.subscribe();
        for machine in session.machines() {
            let result = match core.handler.open_exchange(
                &machine,
                handle.session_id(),
                RequestType::Initial,
                None,
                None,
            ) {
                Ok(mut exchange) => {
                    match core
                        .drive(&mut exchange, core.config.ccr_timeout(), &mut shutdown)
                        .await
                    {
                        Ok(answer) => core.handler.apply_answer(&machine, exchange, answer),
                        Err(e) => {
                            core.handler.abandon(&machine, exchange);
                            Err(e)
                        }
                    }
                }
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                error!(pool = %machine.key(), error = %e, "CCR-Initial 失败，会话未建立");
                self.discard_session(&session);
                return Err(e);
            }
        }

        let worker = tokio::spawn(run_worker(
            core.clone(),
            session.clone(),
            events_rx,
            session.shutdown.subscribe(),
        ));
        *session.worker.lock() = Some(worker);
        session.started.store(true, Ordering::Release);
        record_metric!(core, |m| m.set_active_sessions(core.sessions.len()));

        // 零授予的池立即请求信用
        if let Ok(pools) = core.ledger.pools(subscriber) {
            for pool in pools.iter().filter(|p| p.granted_total == 0) {
                if let Some(update) = core.monitor.evaluate(pool) {
                    core.enqueue(&session, update);
                }
            }
        }

        info!(session_id = %handle.session_id(), rating_groups = ?groups, "会话已建立");
        Ok(handle)
    }

    fn discard_session(&self, session: &Arc<ChargingSession>) {
        let subscriber = session.subscriber();
        session.terminated.store(true, Ordering::Release);
        for machine in session.machines() {
            if let Some(abandoned) = machine.terminate() {
                self.core.handler.discard(&abandoned);
            }
        }
        self.core
            .sessions
            .remove_if(subscriber, |_, current| Arc::ptr_eq(current, session));
        self.core.monitor.clear_subscriber(subscriber);
        self.core.ledger.close_subscriber(subscriber);
    }

    /// 拆除会话
    ///
    /// 取消工作任务、放弃未完成的请求、未决重授权以 `Terminated` 结束，
    /// 然后在 CCR-Terminate 期限内尽力发送 CCR-Terminate。
    #[instrument(skip(self), fields(subscriber = %handle.subscriber()))]
    pub async fn end_session(&self, handle: &SessionHandle) -> Result<(), ChargingError> {
        let session = self.core.session(handle)?;
        self.core.terminate(session).await;
        Ok(())
    }

    /// 上报数据面检查点的使用量
    ///
    /// 放行量受执行规则上限（或授予总量）加容差约束，超出部分被丢弃。
    pub async fn report_usage(
        &self,
        handle: &SessionHandle,
        rating_group: u32,
        bytes: u64,
    ) -> Result<UsageOutcome, ChargingError> {
        let core = &self.core;
        let session = core.session(handle)?;
        if session.is_terminated() {
            return Err(ChargingError::SessionTerminated(handle.session_id().to_string()));
        }
        if session.machine(rating_group).is_none() {
            return Err(ChargingError::UnknownRatingGroup {
                subscriber: handle.subscriber().to_string(),
                rating_group,
            });
        }

        let subscriber = handle.subscriber();
        let cap = core.enforcement.cap_for(subscriber, rating_group);
        let (snapshot, forwarded) = match core.ledger.consume_capped(
            subscriber,
            rating_group,
            bytes,
            cap,
            core.enforcement.tolerance(),
        ) {
            Ok(result) => result,
            Err(e) => {
                if e.is_fatal() {
                    error!(subscriber = %subscriber, error = %e, "致命错误，终止会话");
                    core.terminate(session).await;
                }
                return Err(e);
            }
        };

        let dropped = bytes - forwarded;
        let rule_id = core.enforcement.record(subscriber, rating_group, forwarded, dropped);
        session.touch();
        record_metric!(core, |m| m.record_usage(forwarded, dropped));

        let update_requested = match core.monitor.evaluate(&snapshot) {
            Some(update) => core.enqueue(&session, update),
            None => false,
        };

        Ok(UsageOutcome {
            forwarded,
            dropped,
            consumed: snapshot.consumed,
            granted_total: snapshot.granted_total,
            exhausted: snapshot.ratio() >= EXHAUSTED_RATIO,
            update_requested,
            rule_id,
        })
    }

    /// 处理 RAR（使用配置的 RAR 期限）
    pub async fn handle_re_auth(&self, request: ReAuthRequest) -> ReAuthAnswer {
        let deadline = self.core.config.rar_timeout();
        self.handle_re_auth_with_deadline(request, deadline).await
    }

    /// 在指定期限内处理 RAR
    ///
    /// 返回时授予与执行规则重建均已完成。同一关联ID重放得到相同结果。
    #[instrument(
        skip(self, request),
        fields(
            subscriber = %request.subscriber,
            rating_group = request.rating_group,
            correlation_id = %request.correlation_id
        )
    )]
    pub async fn handle_re_auth_with_deadline(
        &self,
        request: ReAuthRequest,
        deadline: Duration,
    ) -> ReAuthAnswer {
        let started = Instant::now();
        let result_code = self.core.re_auth(&request, deadline).await;
        let elapsed = started.elapsed();
        record_metric!(self.core, |m| m.record_re_auth(result_code, elapsed));
        debug!(result = %result_code, elapsed = ?elapsed, "RAR 已应答");
        ReAuthAnswer {
            correlation_id: request.correlation_id,
            result_code,
        }
    }

    /// 等待重授权就绪
    ///
    /// 可以在 RAR 到达之前调用。返回终态事务；期限内未就绪返回超时。
    pub async fn wait_for_re_auth(
        &self,
        handle: &SessionHandle,
        correlation_id: CorrelationId,
        deadline: Duration,
    ) -> Result<ReAuthTransaction, ChargingError> {
        let session = self.core.session(handle)?;
        let mut ready = session.reauth_slot(correlation_id, None).subscribe();
        let result =
            match tokio::time::timeout(deadline, ready.wait_for(|t| t.status.is_terminal())).await {
                Ok(Ok(transaction)) => Ok((*transaction).clone()),
                Ok(Err(_)) => Err(ChargingError::SessionTerminated(handle.session_id().to_string())),
                Err(_) => Err(ChargingError::Timeout(format!(
                    "等待重授权 {} 超过 {:?}",
                    correlation_id, deadline
                ))),
            };
        if result.is_err() {
            drop(ready);
            if session.forget_waiting_slot(&correlation_id) {
                debug!(correlation_id = %correlation_id, "等待超时，释放未使用的重授权槽位");
            }
        }
        result
    }

    /// 查询重授权事务
    pub fn re_auth_transaction(
        &self,
        handle: &SessionHandle,
        correlation_id: &CorrelationId,
    ) -> Result<Option<ReAuthTransaction>, ChargingError> {
        Ok(self.core.session(handle)?.re_auth_transaction(correlation_id))
    }

    /// 投递来自 OCS 的应答
    pub fn on_answer(&self, answer: CreditControlAnswer) -> bool {
        let delivered = self.core.handler.on_answer(answer);
        if !delivered {
            record_metric!(self.core, |m| m.record_discarded_answer());
        }
        delivered
    }

    /// 查询剩余配额：返回 (已消费, 授予总量)
    pub fn query_remaining_quota(
        &self,
        handle: &SessionHandle,
        rating_group: u32,
    ) -> Result<(u64, u64), ChargingError> {
        self.core.session(handle)?;
        let snapshot = self.core.ledger.snapshot(handle.subscriber(), rating_group)?;
        Ok((snapshot.consumed, snapshot.granted_total))
    }

    /// 信用池的协议阶段
    pub fn pool_phase(
        &self,
        handle: &SessionHandle,
        rating_group: u32,
    ) -> Result<PoolPhase, ChargingError> {
        self.core
            .session(handle)?
            .phase(rating_group)
            .ok_or_else(|| ChargingError::UnknownRatingGroup {
                subscriber: handle.subscriber().to_string(),
                rating_group,
            })
    }

    /// 回收空闲会话，并为有效期已到的信用池触发 CCR-Update
    ///
    /// 返回被回收的会话句柄。
    pub async fn reap_expired(&self) -> Vec<SessionHandle> {
        let idle_timeout = self.core.config.idle_timeout();
        let sessions: Vec<Arc<ChargingSession>> = self
            .core
            .sessions
            .iter()
            .map(|s| s.value().clone())
            .filter(|s| s.is_started())
            .collect();

        let mut reaped = Vec::new();
        for session in sessions {
            if session.idle_for() >= idle_timeout {
                info!(session_id = %session.session_id(), idle = ?session.idle_for(), "回收空闲会话");
                reaped.push(session.handle().clone());
                self.core.terminate(session).await;
            } else {
                self.core.sweep_validity(&session);
            }
        }
        reaped
    }

    /// 启动周期性回收任务
    pub fn start_reaper(&self, interval: Duration) -> JoinHandle<()> {
        let controller = SessionController {
            core: self.core.clone(),
        };
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let reaped = controller.reap_expired().await;
                if !reaped.is_empty() {
                    debug!(count = reaped.len(), "周期回收完成");
                }
            }
        })
    }
}
