//! 端到端测试模块

mod gy_reauth;
mod update_retry;
mod zero_grant;
