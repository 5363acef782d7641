//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 配置模块
//!
//! 定义计费核心与内置 OCS 模拟器的配置结构，支持 YAML / TOML 加载。

use crate::constants::{
    DEFAULT_BACKOFF_MULTIPLIER, DEFAULT_CCR_TIMEOUT_MS, DEFAULT_IDLE_TIMEOUT_SECS,
    DEFAULT_INITIAL_BACKOFF_MS, DEFAULT_MAX_BACKOFF_MS, DEFAULT_MAX_RETRIES,
    DEFAULT_OCS_MAX_USAGE_OCTETS, DEFAULT_OCS_MAX_USAGE_TIME_SECS, DEFAULT_OCS_VALIDITY_TIME_SECS,
    DEFAULT_RAR_TIMEOUT_MS, DEFAULT_REAUTH_REPLAY_CAPACITY, DEFAULT_TERMINATE_TIMEOUT_MS,
    DEFAULT_USAGE_THRESHOLD, DEFAULT_WORKER_CHANNEL_CAPACITY, ENFORCEMENT_LAG_TOLERANCE_BYTES,
};
use crate::error::ChargingError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// 计费核心配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChargingConfig {
    /// 触发 CCR-Update 的使用比例（0 < t <= 1）
    pub usage_threshold: f64,
    /// CCR-Update 请求的单位数策略
    pub request_policy: RequestPolicy,
    /// 执行滞后容差 ε（字节）
    pub enforcement_lag_tolerance_bytes: u64,
    /// CCR-Initial / CCR-Update 应答期限（毫秒）
    pub ccr_timeout_ms: u64,
    /// RAR 应答期限（毫秒）
    pub rar_timeout_ms: u64,
    /// CCR-Terminate 应答期限（毫秒）
    pub terminate_timeout_ms: u64,
    /// 每个信用池记住的已应答 RAR 数量
    ///
    /// 重放只在这个窗口内幂等：同一信用池之后又应答了这么多个不同的
    /// RAR 后，最早的关联ID被淘汰，再次到达时按新请求处理。OCS 的重发
    /// 窗口必须小于它。
    pub reauth_replay_capacity: usize,
    /// 同一信用池上并发 RAR 的处理方式
    pub reauth_conflict_policy: ConflictPolicy,
    /// 重试配置
    pub retry: RetryConfig,
    /// 空闲超时（秒）
    pub idle_timeout_secs: u64,
    /// 会话工作任务的事件通道容量
    pub worker_channel_capacity: usize,
    /// 日志配置
    pub logging: LoggingConfig,
}

impl Default for ChargingConfig {
    fn default() -> Self {
        Self {
            usage_threshold: DEFAULT_USAGE_THRESHOLD,
            request_policy: RequestPolicy::default(),
            enforcement_lag_tolerance_bytes: ENFORCEMENT_LAG_TOLERANCE_BYTES,
            ccr_timeout_ms: DEFAULT_CCR_TIMEOUT_MS,
            rar_timeout_ms: DEFAULT_RAR_TIMEOUT_MS,
            terminate_timeout_ms: DEFAULT_TERMINATE_TIMEOUT_MS,
            reauth_replay_capacity: DEFAULT_REAUTH_REPLAY_CAPACITY,
            reauth_conflict_policy: ConflictPolicy::default(),
            retry: RetryConfig::default(),
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
            worker_channel_capacity: DEFAULT_WORKER_CHANNEL_CAPACITY,
            logging: LoggingConfig::default(),
        }
    }
}

impl ChargingConfig {
    /// 从 YAML 字符串加载
    pub fn from_yaml_str(s: &str) -> Result<Self, ChargingError> {
        let config: ChargingConfig = serde_yaml::from_str(s)?;
        config.validate().map_err(ChargingError::ConfigError)?;
        Ok(config)
    }

    /// 从 TOML 字符串加载
    pub fn from_toml_str(s: &str) -> Result<Self, ChargingError> {
        let config: ChargingConfig = toml::from_str(s)?;
        config.validate().map_err(ChargingError::ConfigError)?;
        Ok(config)
    }

    /// 从文件加载，按扩展名选择格式
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ChargingError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml_str(&content),
            Some("toml") => Self::from_toml_str(&content),
            other => Err(ChargingError::ConfigError(format!(
                "不支持的配置文件格式: {:?}",
                other
            ))),
        }
    }

    /// 校验配置
    pub fn validate(&self) -> Result<(), String> {
        if !(self.usage_threshold > 0.0 && self.usage_threshold <= 1.0) {
            return Err(format!(
                "使用阈值必须在 (0, 1] 范围内: {}",
                self.usage_threshold
            ));
        }

        if let RequestPolicy::Fixed { units } = self.request_policy {
            if units == 0 {
                return Err("固定请求单位数不能为 0".to_string());
            }
        }

        if self.ccr_timeout_ms == 0 || self.rar_timeout_ms == 0 || self.terminate_timeout_ms == 0 {
            return Err("应答期限不能为 0".to_string());
        }

        if self.worker_channel_capacity == 0 {
            return Err("工作通道容量不能为 0".to_string());
        }

        if self.reauth_replay_capacity == 0 {
            return Err("重授权重放缓存容量不能为 0".to_string());
        }

        self.retry.validate()?;

        Ok(())
    }

    /// CCR 应答期限
    pub fn ccr_timeout(&self) -> Duration {
        Duration::from_millis(self.ccr_timeout_ms)
    }

    /// RAR 应答期限
    pub fn rar_timeout(&self) -> Duration {
        Duration::from_millis(self.rar_timeout_ms)
    }

    /// CCR-Terminate 应答期限
    pub fn terminate_timeout(&self) -> Duration {
        Duration::from_millis(self.terminate_timeout_ms)
    }

    /// 空闲超时
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// CCR-Update 请求单位数策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RequestPolicy {
    /// 重新请求初始授予量
    #[default]
    ReRequestInitial,
    /// 固定请求量
    Fixed { units: u64 },
}

impl RequestPolicy {
    /// 计算请求单位数
    pub fn requested_units(&self, initial_grant: u64) -> u64 {
        match self {
            RequestPolicy::ReRequestInitial => initial_grant,
            RequestPolicy::Fixed { units } => *units,
        }
    }
}

/// 并发重授权处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// 排在进行中的重授权之后（受 RAR 期限约束）
    #[default]
    Serialize,
    /// 立即以 Conflict 拒绝
    Reject,
}

/// 重试配置（指数退避）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// 最大尝试次数（含首次）
    pub max_attempts: u32,
    /// 初始退避（毫秒）
    pub initial_backoff_ms: u64,
    /// 最大退避（毫秒）
    pub max_backoff_ms: u64,
    /// 退避倍数
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_RETRIES,
            initial_backoff_ms: DEFAULT_INITIAL_BACKOFF_MS,
            max_backoff_ms: DEFAULT_MAX_BACKOFF_MS,
            multiplier: DEFAULT_BACKOFF_MULTIPLIER,
        }
    }
}

impl RetryConfig {
    /// 校验重试配置
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("最大尝试次数不能为 0".to_string());
        }
        if self.multiplier < 1.0 {
            return Err(format!("退避倍数不能小于 1: {}", self.multiplier));
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err("初始退避不能大于最大退避".to_string());
        }
        Ok(())
    }

    /// 计算第 `attempt` 次重试前的退避（attempt 从 0 开始）
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.initial_backoff_ms as f64 * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_backoff_ms as f64);
        Duration::from_millis(capped as u64)
    }
}

/// 日志配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// 过滤指令（EnvFilter 语法），`RUST_LOG` 优先
    pub filter: String,
    /// 是否输出事件目标（模块路径）
    pub with_target: bool,
    /// 是否输出 ANSI 颜色
    pub ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "creditron=info".to_string(),
            with_target: true,
            ansi: true,
        }
    }
}

/// 内置 OCS 模拟器配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OcsConfig {
    /// 单次授予的最大字节数
    pub max_usage_octets: u64,
    /// 单次授予的最大时长（秒）
    pub max_usage_time: u32,
    /// 授予有效期（秒）
    pub validity_time: u32,
}

impl Default for OcsConfig {
    fn default() -> Self {
        Self {
            max_usage_octets: DEFAULT_OCS_MAX_USAGE_OCTETS,
            max_usage_time: DEFAULT_OCS_MAX_USAGE_TIME_SECS,
            validity_time: DEFAULT_OCS_VALIDITY_TIME_SECS,
        }
    }
}

impl OcsConfig {
    /// 校验模拟器配置
    pub fn validate(&self) -> Result<(), String> {
        if self.max_usage_octets == 0 {
            return Err("最大授予字节数不能为 0".to_string());
        }
        Ok(())
    }
}
