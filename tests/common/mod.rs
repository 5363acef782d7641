//! 测试通用工具模块
//!
//! 提供测试中常用的工具函数和辅助结构。

#![allow(dead_code)]

use creditron::{
    config::{ChargingConfig, OcsConfig},
    enforcement::{PolicyRule, RuleProvisioning},
    protocol::RequestType,
    session::{AuthResult, SessionController, SessionHandle},
    simulator::OcsSimulator,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};

pub const SUBSCRIBER: &str = "IMSI001010000000001";
pub const RATING_GROUP: u32 = 1;
pub const RULE_ID: &str = "gy-rg1";

pub const KB: u64 = 1000;
pub const MB: u64 = 1000 * KB;

/// 初始化测试日志（重复调用无副作用）
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// 控制器与模拟器
pub struct Harness {
    pub controller: Arc<SessionController>,
    pub simulator: Arc<OcsSimulator>,
}

/// 以默认 OCS 配置创建测试环境
pub fn harness(config: ChargingConfig) -> Harness {
    harness_with(config, OcsConfig::default())
}

/// 创建测试环境
pub fn harness_with(config: ChargingConfig, ocs: OcsConfig) -> Harness {
    init_tracing();
    let simulator = Arc::new(OcsSimulator::new(ocs));
    let controller = Arc::new(SessionController::new(config, simulator.clone()).unwrap());
    simulator.attach(&controller);
    Harness {
        controller,
        simulator,
    }
}

/// 重试间隔较短的配置
pub fn fast_config() -> ChargingConfig {
    let mut config = ChargingConfig {
        ccr_timeout_ms: 100,
        rar_timeout_ms: 500,
        terminate_timeout_ms: 200,
        ..Default::default()
    };
    config.retry.initial_backoff_ms = 10;
    config.retry.max_backoff_ms = 50;
    config
}

impl Harness {
    /// 安装 OCS 跟踪规则
    pub fn install_ocs_rule(&self, subscriber: &str, rule_id: &str, rating_group: u32) {
        self.controller
            .rule_provisioning()
            .install_rule(subscriber, PolicyRule::new(rule_id, 10).with_rating_group(rating_group))
            .unwrap();
    }

    /// 设置余额、安装规则并建立会话
    pub async fn start(&self, subscriber: &str, credit: u64) -> SessionHandle {
        self.simulator.set_credit(subscriber, RATING_GROUP, credit);
        self.install_ocs_rule(subscriber, RULE_ID, RATING_GROUP);
        self.controller
            .start_session(AuthResult::accepted(subscriber))
            .await
            .unwrap()
    }

    /// 等待至少 `count` 个 CCR-Update 首发且全部应答处理完毕
    pub async fn wait_for_updates(&self, count: usize) {
        let simulator = self.simulator.clone();
        let controller = self.controller.clone();
        let done = wait_until(Duration::from_secs(5), move || {
            simulator.request_count(RequestType::Update) >= count
                && controller.monitor().pending_count() == 0
        })
        .await;
        assert!(done, "等待 {} 个 CCR-Update 应答超时", count);
    }
}

/// 轮询直到条件成立或超时
pub async fn wait_until<F>(deadline: Duration, condition: F) -> bool
where
    F: Fn() -> bool,
{
    let end = Instant::now() + deadline;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= end {
            return false;
        }
        sleep(Duration::from_millis(5)).await;
    }
}
