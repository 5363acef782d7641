//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 错误类型定义
//!
//! 使用thiserror定义所有错误类型，以及在协议上往返的结果码。

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 计费核心错误类型
#[derive(Error, Debug)]
pub enum ChargingError {
    /// 用户没有活动会话
    #[error("未知用户: {0}")]
    UnknownSubscriber(String),

    /// 会话中不存在该费率组
    #[error("未知费率组: {subscriber}/{rating_group}")]
    UnknownRatingGroup { subscriber: String, rating_group: u32 },

    /// 同一配额池上的并发重授权
    #[error("重授权冲突: {0}")]
    Conflict(String),

    /// 等待应答超时
    #[error("超时: {0}")]
    Timeout(String),

    /// 格式错误或不符合预期的应答
    #[error("协议失败: {0}")]
    ProtocolFailure(String),

    /// 会话已终止
    #[error("会话已终止: {0}")]
    SessionTerminated(String),

    /// 账本损坏（致命，必须终止会话）
    #[error("账本损坏: {0}")]
    LedgerCorruption(String),

    /// 鉴权未通过
    #[error("鉴权被拒绝: {0}")]
    AuthenticationRejected(String),

    /// 配置错误
    #[error("配置错误: {0}")]
    ConfigError(String),

    /// 验证错误
    #[error("验证错误: {0}")]
    ValidationError(String),

    /// IO错误
    #[error("IO错误: {0}")]
    IoError(#[from] std::io::Error),

    /// 序列化错误
    #[error("序列化错误: {0}")]
    SerdeError(#[from] serde_json::Error),

    /// YAML解析错误
    #[error("YAML解析错误: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// TOML解析错误
    #[error("TOML解析错误: {0}")]
    TomlError(#[from] toml::de::Error),
}

impl ChargingError {
    /// 是否为必须终止会话的致命错误
    pub fn is_fatal(&self) -> bool {
        matches!(self, ChargingError::LedgerCorruption(_))
    }

    /// 映射为协议结果码
    pub fn result_code(&self) -> ResultCode {
        match self {
            ChargingError::Conflict(_) => ResultCode::Conflict,
            ChargingError::Timeout(_) => ResultCode::Timeout,
            _ => ResultCode::Failure,
        }
    }
}

/// Diameter 结果码（仅语义字段，AVP 编码由外部完成）
pub mod diameter {
    /// DIAMETER_SUCCESS
    pub const SUCCESS: u32 = 2001;
    /// DIAMETER_LIMITED_SUCCESS
    pub const LIMITED_SUCCESS: u32 = 2002;
    /// DIAMETER_UNKNOWN_SESSION_ID
    pub const UNKNOWN_SESSION_ID: u32 = 5002;
    /// DIAMETER_UNABLE_TO_COMPLY
    pub const UNABLE_TO_COMPLY: u32 = 5012;
    /// DIAMETER_CREDIT_LIMIT_REACHED
    pub const CREDIT_LIMIT_REACHED: u32 = 4012;
    /// DIAMETER_ERROR_CONFLICTING_REQUEST (3GPP experimental)
    pub const ERROR_CONFLICTING_REQUEST: u32 = 5147;
    /// DIAMETER_ERROR_TIMED_OUT_REQUEST (3GPP experimental)
    pub const ERROR_TIMED_OUT_REQUEST: u32 = 5454;
}

/// 信用控制交互的结果码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResultCode {
    /// 授予完全生效，无需变更执行规则
    Success,
    /// 授予生效，但执行规则需要按新上限重建
    LimitedSuccess,
    /// 未知配额池或请求格式错误
    Failure,
    /// 应答超时
    Timeout,
    /// 同一配额池上已有重授权在处理
    Conflict,
}

impl ResultCode {
    /// 是否为成功类结果
    pub fn is_success(&self) -> bool {
        matches!(self, ResultCode::Success | ResultCode::LimitedSuccess)
    }

    /// 转换为 Diameter 结果码
    pub fn to_diameter(&self) -> u32 {
        match self {
            ResultCode::Success => diameter::SUCCESS,
            ResultCode::LimitedSuccess => diameter::LIMITED_SUCCESS,
            ResultCode::Failure => diameter::UNABLE_TO_COMPLY,
            ResultCode::Timeout => diameter::ERROR_TIMED_OUT_REQUEST,
            ResultCode::Conflict => diameter::ERROR_CONFLICTING_REQUEST,
        }
    }

    /// 从 Diameter 结果码解析
    ///
    /// 未识别的 2xxx 视为成功，其余未识别码视为失败。
    pub fn from_diameter(code: u32) -> Self {
        match code {
            diameter::SUCCESS => ResultCode::Success,
            diameter::LIMITED_SUCCESS => ResultCode::LimitedSuccess,
            diameter::ERROR_TIMED_OUT_REQUEST => ResultCode::Timeout,
            diameter::ERROR_CONFLICTING_REQUEST => ResultCode::Conflict,
            2000..=2999 => ResultCode::Success,
            _ => ResultCode::Failure,
        }
    }

    /// 转换为字符串
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultCode::Success => "success",
            ResultCode::LimitedSuccess => "limited_success",
            ResultCode::Failure => "failure",
            ResultCode::Timeout => "timeout",
            ResultCode::Conflict => "conflict",
        }
    }
}

impl std::fmt::Display for ResultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
