//! 端到端测试：零授予
//!
//! 测试场景：
//! 1. OCS 对 CCR-Initial 应答成功但不授予任何单位
//! 2. 会话建立后立即发出 CCR-Update 请求信用
//! 3. 追加授予到达前，放行量不超过容差

use crate::common::{init_tracing, wait_until, KB, RATING_GROUP, SUBSCRIBER};
use async_trait::async_trait;
use creditron::config::{ChargingConfig, OcsConfig};
use creditron::error::{diameter, ChargingError};
use creditron::protocol::{
    CreditControlAnswer, CreditControlRequest, CreditControlTransport, RequestType,
};
use creditron::session::{AuthResult, SessionController};
use creditron::simulator::OcsSimulator;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

/// CCR-Initial 应答零授予，其余请求交给模拟器
struct ZeroGrantOcs {
    inner: Arc<OcsSimulator>,
    controller: OnceLock<Weak<SessionController>>,
}

#[async_trait]
impl CreditControlTransport for ZeroGrantOcs {
    async fn send(&self, request: &CreditControlRequest) -> Result<(), ChargingError> {
        if request.request_type != RequestType::Initial {
            return self.inner.send(request).await;
        }
        let controller = self
            .controller
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| ChargingError::ConfigError("控制器未连接".to_string()))?;
        let answer = CreditControlAnswer {
            correlation_id: request.correlation_id,
            result_code: diameter::SUCCESS,
            rating_group: request.rating_group,
            granted: None,
        };
        tokio::spawn(async move {
            controller.on_answer(answer);
        });
        Ok(())
    }
}

/// 端到端测试：零授予立即触发 CCR-Update
#[tokio::test]
async fn test_e2e_zero_grant_requests_credit_immediately() {
    init_tracing();
    let simulator = Arc::new(OcsSimulator::new(OcsConfig::default()));
    let ocs = Arc::new(ZeroGrantOcs {
        inner: simulator.clone(),
        controller: OnceLock::new(),
    });
    let controller =
        Arc::new(SessionController::new(ChargingConfig::default(), ocs.clone()).unwrap());
    simulator.attach(&controller);
    let _ = ocs.controller.set(Arc::downgrade(&controller));
    simulator.set_credit(SUBSCRIBER, RATING_GROUP, 300 * KB);

    // Step 1: 会话以零授予建立
    let handle = controller
        .start_session_with(AuthResult::accepted(SUBSCRIBER), &[RATING_GROUP])
        .await
        .unwrap();

    println!("✓ Step 1: Session started with zero initial grant");

    // Step 2: 无需上报即发出 CCR-Update
    let granted = {
        let controller = controller.clone();
        let handle = handle.clone();
        wait_until(Duration::from_secs(5), move || {
            controller
                .query_remaining_quota(&handle, RATING_GROUP)
                .map(|(_, granted)| granted > 0)
                .unwrap_or(false)
        })
        .await
    };
    assert!(granted, "零授予后应立即请求信用");

    let update = simulator
        .requests()
        .into_iter()
        .find(|r| r.request_type == RequestType::Update)
        .unwrap();
    assert_eq!(update.used_bytes, 0);
    assert_eq!(update.result_code, diameter::SUCCESS);
    assert_eq!(
        controller.query_remaining_quota(&handle, RATING_GROUP).unwrap(),
        (0, update.granted_units)
    );

    println!("✓ Step 2: CCR-Update granted {} bytes", update.granted_units);

    controller.end_session(&handle).await.unwrap();
    println!("✓ E2E test passed: zero grant handled");
}

/// 端到端测试：零授予且 OCS 无余额时，放行量受容差限制
#[tokio::test]
async fn test_e2e_zero_grant_without_credit_limits_to_tolerance() {
    init_tracing();
    let simulator = Arc::new(OcsSimulator::new(OcsConfig::default()));
    let ocs = Arc::new(ZeroGrantOcs {
        inner: simulator.clone(),
        controller: OnceLock::new(),
    });
    let controller =
        Arc::new(SessionController::new(ChargingConfig::default(), ocs.clone()).unwrap());
    simulator.attach(&controller);
    let _ = ocs.controller.set(Arc::downgrade(&controller));

    let handle = controller
        .start_session_with(AuthResult::accepted(SUBSCRIBER), &[RATING_GROUP])
        .await
        .unwrap();

    // 更新被拒绝后仍保持零授予
    let rejected = {
        let simulator = simulator.clone();
        let controller = controller.clone();
        wait_until(Duration::from_secs(5), move || {
            simulator.request_count(RequestType::Update) == 1
                && controller.monitor().pending_count() == 0
        })
        .await
    };
    assert!(rejected);

    let tolerance = controller.enforcement().tolerance();
    let outcome = controller
        .report_usage(&handle, RATING_GROUP, tolerance * 2)
        .await
        .unwrap();
    assert_eq!(outcome.forwarded, tolerance);
    assert_eq!(outcome.dropped, tolerance);
    assert!(outcome.exhausted);
    // 授予未变化，不重复请求
    assert!(!outcome.update_requested);

    controller.end_session(&handle).await.unwrap();
}
