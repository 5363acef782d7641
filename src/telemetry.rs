//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 日志与监控模块
//!
//! - `telemetry` 特性：基于 tracing-subscriber 的日志初始化
//! - `monitoring` 特性：Prometheus 指标
//!
//! # 示例
//!
//! ```rust,ignore
//! use creditron::config::LoggingConfig;
//! use creditron::telemetry::{init_tracing, Metrics};
//!
//! init_tracing(&LoggingConfig::default()).unwrap();
//! let metrics = Metrics::new().unwrap();
//! metrics.record_usage(1024, 0);
//! println!("{}", metrics.gather_text());
//! ```

#[cfg(feature = "telemetry")]
use crate::config::LoggingConfig;
#[cfg(feature = "telemetry")]
use crate::error::ChargingError;

#[cfg(feature = "monitoring")]
pub use metrics::{set_global_metrics, try_global, Metrics};

/// 初始化全局日志订阅者
///
/// `RUST_LOG` 存在时优先于配置中的过滤指令。重复初始化返回配置错误。
#[cfg(feature = "telemetry")]
pub fn init_tracing(config: &LoggingConfig) -> Result<(), ChargingError> {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.filter))
        .map_err(|e| ChargingError::ConfigError(format!("日志过滤指令无效: {}", e)))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.with_target)
        .with_ansi(config.ansi)
        .try_init()
        .map_err(|e| ChargingError::ConfigError(format!("日志系统初始化失败: {}", e)))?;

    tracing::info!(filter = %config.filter, "日志系统已初始化");
    Ok(())
}

#[cfg(feature = "monitoring")]
mod metrics {
    use crate::error::ResultCode;
    use crate::protocol::RequestType;
    use prometheus::{
        Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
        TextEncoder,
    };
    use std::sync::{Arc, OnceLock};
    use std::time::Duration;
    use tracing::error;

    /// 全局指标实例
    static GLOBAL_METRICS: OnceLock<Arc<Metrics>> = OnceLock::new();

    /// 设置全局指标实例（只生效一次）
    pub fn set_global_metrics(metrics: Arc<Metrics>) {
        let _ = GLOBAL_METRICS.set(metrics);
    }

    /// 获取全局指标实例
    pub fn try_global() -> Option<Arc<Metrics>> {
        GLOBAL_METRICS.get().cloned()
    }

    /// 计费核心指标
    #[derive(Clone)]
    pub struct Metrics {
        /// 按类型统计的已发送 CCR
        pub ccr_sent: IntCounterVec,
        /// CCR 应答超时次数
        pub ccr_timeouts: IntCounter,
        /// 被丢弃的未知或过期应答
        pub answers_discarded: IntCounter,
        /// 按结果统计的 RAR
        pub reauth_total: IntCounterVec,
        /// RAR 处理耗时
        pub reauth_duration: Histogram,
        /// 放行字节数
        pub bytes_forwarded: IntCounter,
        /// 丢弃字节数
        pub bytes_dropped: IntCounter,
        /// 触发的更新事件
        pub updates_needed: IntCounter,
        /// 活动会话数
        pub active_sessions: IntGauge,
        registry: Registry,
    }

    impl Metrics {
        /// 创建并注册全部指标
        pub fn new() -> Result<Self, prometheus::Error> {
            let registry = Registry::new();

            let ccr_sent = IntCounterVec::new(
                Opts::new("creditron_ccr_sent_total", "Credit-control requests sent"),
                &["type"],
            )?;
            let ccr_timeouts = IntCounter::new(
                "creditron_ccr_timeouts_total",
                "Credit-control answers that missed their deadline",
            )?;
            let answers_discarded = IntCounter::new(
                "creditron_answers_discarded_total",
                "Unknown or stale answers dropped",
            )?;
            let reauth_total = IntCounterVec::new(
                Opts::new("creditron_reauth_total", "Re-auth requests by result"),
                &["result"],
            )?;
            let reauth_duration = Histogram::with_opts(
                HistogramOpts::new(
                    "creditron_reauth_duration_seconds",
                    "Time to answer a re-auth request",
                )
                .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
            )?;
            let bytes_forwarded = IntCounter::new(
                "creditron_bytes_forwarded_total",
                "Bytes admitted by enforcement",
            )?;
            let bytes_dropped = IntCounter::new(
                "creditron_bytes_dropped_total",
                "Bytes dropped over the enforcement cap",
            )?;
            let updates_needed = IntCounter::new(
                "creditron_updates_needed_total",
                "Update-needed events raised by the usage monitor",
            )?;
            let active_sessions =
                IntGauge::new("creditron_active_sessions", "Currently active charging sessions")?;

            registry.register(Box::new(ccr_sent.clone()))?;
            registry.register(Box::new(ccr_timeouts.clone()))?;
            registry.register(Box::new(answers_discarded.clone()))?;
            registry.register(Box::new(reauth_total.clone()))?;
            registry.register(Box::new(reauth_duration.clone()))?;
            registry.register(Box::new(bytes_forwarded.clone()))?;
            registry.register(Box::new(bytes_dropped.clone()))?;
            registry.register(Box::new(updates_needed.clone()))?;
            registry.register(Box::new(active_sessions.clone()))?;

            Ok(Self {
                ccr_sent,
                ccr_timeouts,
                answers_discarded,
                reauth_total,
                reauth_duration,
                bytes_forwarded,
                bytes_dropped,
                updates_needed,
                active_sessions,
                registry,
            })
        }

        /// 以 Prometheus 文本格式导出
        pub fn gather_text(&self) -> String {
            let encoder = TextEncoder::new();
            let metric_families = self.registry.gather();
            let mut buffer = Vec::new();
            if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
                error!("Failed to encode metrics: {}", e);
                return String::new();
            }
            String::from_utf8(buffer).unwrap_or_default()
        }

        pub fn record_ccr(&self, request_type: RequestType) {
            self.ccr_sent
                .with_label_values(&[request_type.as_str()])
                .inc();
        }

        pub fn record_ccr_timeout(&self) {
            self.ccr_timeouts.inc();
        }

        pub fn record_discarded_answer(&self) {
            self.answers_discarded.inc();
        }

        pub fn record_re_auth(&self, result: ResultCode, duration: Duration) {
            self.reauth_total.with_label_values(&[result.as_str()]).inc();
            self.reauth_duration.observe(duration.as_secs_f64());
        }

        /// 记录一次数据面检查点
        pub fn record_usage(&self, forwarded: u64, dropped: u64) {
            self.bytes_forwarded.inc_by(forwarded);
            self.bytes_dropped.inc_by(dropped);
        }

        pub fn record_update_needed(&self) {
            self.updates_needed.inc();
        }

        pub fn set_active_sessions(&self, count: usize) {
            self.active_sessions.set(count as i64);
        }
    }

    impl std::fmt::Debug for Metrics {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("Metrics")
                .field("active_sessions", &self.active_sessions.get())
                .finish()
        }
    }

}
