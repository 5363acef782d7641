//! 端到端测试：Gy 重授权
//!
//! 测试场景：
//! 1. OCS 余额 500KB，建立会话，初始授予 500KB
//! 2. 消费 400KB（80%），恰好触发一次 CCR-Update
//! 3. OCS 余额为 0，CCR-Update 被拒绝，原授予保留
//! 4. OCS 充值 2MB 并发起 RAR，规则重建，应答 LIMITED_SUCCESS，授予 2.5MB
//! 5. 再消费 1MB，规则累计 1.4MB，落在 [500KB - ε, 2.5MB + ε] 内

use crate::common::{harness, KB, MB, RATING_GROUP, RULE_ID, SUBSCRIBER};
use creditron::config::ChargingConfig;
use creditron::error::{diameter, ResultCode};
use creditron::protocol::{PoolPhase, RequestType};

/// 端到端测试：Gy 重授权完整流程
#[tokio::test]
async fn test_e2e_gy_reauth_flow() {
    let h = harness(ChargingConfig::default());
    let epsilon = h.controller.enforcement().tolerance();

    // Step 1: 建立会话
    let handle = h.start(SUBSCRIBER, 500 * KB).await;
    let (consumed, granted) = h
        .controller
        .query_remaining_quota(&handle, RATING_GROUP)
        .unwrap();
    assert_eq!((consumed, granted), (0, 500 * KB));
    assert_eq!(
        h.controller.enforcement().cap_for(SUBSCRIBER, RATING_GROUP),
        Some(500 * KB)
    );

    println!("✓ Step 1: Session started with 500KB initial grant");

    // Step 2: 消费 400KB，触发更新
    let outcome = h
        .controller
        .report_usage(&handle, RATING_GROUP, 400 * KB)
        .await
        .unwrap();
    assert_eq!(outcome.forwarded, 400 * KB);
    assert_eq!(outcome.dropped, 0);
    assert!(outcome.update_requested, "80% 应触发 CCR-Update");
    assert!(!outcome.exhausted);
    assert_eq!(outcome.rule_id.as_deref(), Some(RULE_ID));

    println!("✓ Step 2: Consumed 400KB (80%), CCR-Update requested");

    // Step 3: CCR-Update 被拒绝
    h.wait_for_updates(1).await;
    let update = h
        .simulator
        .requests()
        .into_iter()
        .find(|r| r.request_type == RequestType::Update)
        .unwrap();
    assert_eq!(update.result_code, diameter::CREDIT_LIMIT_REACHED);
    assert_eq!(update.used_bytes, 400 * KB);
    assert_eq!(
        h.controller
            .query_remaining_quota(&handle, RATING_GROUP)
            .unwrap(),
        (400 * KB, 500 * KB)
    );
    assert_eq!(
        h.controller.pool_phase(&handle, RATING_GROUP).unwrap(),
        PoolPhase::Active
    );

    // 被拒绝后继续消费不会再次触发
    let outcome = h
        .controller
        .report_usage(&handle, RATING_GROUP, 0)
        .await
        .unwrap();
    assert!(!outcome.update_requested);

    println!("✓ Step 3: CCR-Update rejected, previous grant kept");

    // Step 4: 充值并发起 RAR
    h.simulator.top_up(SUBSCRIBER, RATING_GROUP, 2 * MB);
    let answer = h
        .simulator
        .send_re_auth(SUBSCRIBER, RATING_GROUP)
        .await
        .unwrap();
    assert_eq!(answer.result_code, ResultCode::LimitedSuccess);
    assert_eq!(answer.result_code.to_diameter(), 2002);

    // RAA 返回时授予与规则重建均已完成
    assert_eq!(
        h.controller
            .query_remaining_quota(&handle, RATING_GROUP)
            .unwrap()
            .1,
        2500 * KB
    );
    assert_eq!(
        h.controller.enforcement().cap_for(SUBSCRIBER, RATING_GROUP),
        Some(2500 * KB)
    );
    let transaction = h
        .controller
        .re_auth_transaction(&handle, &answer.correlation_id)
        .unwrap()
        .unwrap();
    assert_eq!(transaction.granted_units, 2 * MB);

    println!("✓ Step 4: RAR answered LIMITED_SUCCESS, grant now 2.5MB");

    // Step 5: 再消费 1MB
    let outcome = h
        .controller
        .report_usage(&handle, RATING_GROUP, MB)
        .await
        .unwrap();
    assert_eq!(outcome.forwarded, MB);
    assert!(!outcome.update_requested);

    let usage = h
        .controller
        .enforcement()
        .usage_since(SUBSCRIBER, RULE_ID)
        .unwrap();
    assert_eq!(usage, 1400 * KB);
    assert!(usage + epsilon >= 500 * KB && usage <= 2500 * KB + epsilon);
    assert!(h
        .controller
        .enforcement()
        .within_bounds(usage, 500 * KB, 2500 * KB));

    println!("✓ Step 5: Rule usage 1.4MB within [500KB - ε, 2.5MB + ε]");

    assert_eq!(h.simulator.request_count(RequestType::Update), 1);
    h.controller.end_session(&handle).await.unwrap();

    println!("✓ E2E test passed: Gy re-auth flow completed");
}

/// 端到端测试：没有执行规则时 RAR 应答 SUCCESS
#[tokio::test]
async fn test_e2e_reauth_without_rules_is_success() {
    let h = harness(ChargingConfig::default());
    h.simulator.set_credit(SUBSCRIBER, RATING_GROUP, 500 * KB);
    let handle = h
        .controller
        .start_session_with(
            creditron::session::AuthResult::accepted(SUBSCRIBER),
            &[RATING_GROUP],
        )
        .await
        .unwrap();

    h.simulator.top_up(SUBSCRIBER, RATING_GROUP, MB);
    let answer = h
        .simulator
        .send_re_auth(SUBSCRIBER, RATING_GROUP)
        .await
        .unwrap();
    assert_eq!(answer.result_code, ResultCode::Success);
    assert_eq!(
        h.controller
            .query_remaining_quota(&handle, RATING_GROUP)
            .unwrap()
            .1,
        1500 * KB
    );

    // 未授予任何单位也不需要重建
    let answer = h
        .simulator
        .send_re_auth(SUBSCRIBER, RATING_GROUP)
        .await
        .unwrap();
    assert_eq!(answer.result_code, ResultCode::Success);

    println!("✓ E2E test passed: RAR without rules answered SUCCESS");
    h.controller.end_session(&handle).await.unwrap();
}

/// 端到端测试：超出上限的流量被丢弃
#[tokio::test]
async fn test_e2e_traffic_dropped_over_cap() {
    let h = harness(ChargingConfig::default());
    let epsilon = h.controller.enforcement().tolerance();
    let handle = h.start(SUBSCRIBER, 500 * KB).await;

    // Step 1: 超出授予与容差的部分被丢弃
    let outcome = h
        .controller
        .report_usage(&handle, RATING_GROUP, MB)
        .await
        .unwrap();
    assert_eq!(outcome.forwarded, 500 * KB + epsilon);
    assert_eq!(outcome.dropped, MB - 500 * KB - epsilon);
    assert!(outcome.exhausted);

    println!("✓ Step 1: Forwarded up to cap + ε, rest dropped");

    // Step 2: RAR 提高上限后恢复放行
    h.wait_for_updates(1).await;
    h.simulator.top_up(SUBSCRIBER, RATING_GROUP, MB);
    let answer = h.simulator.send_re_auth(SUBSCRIBER, RATING_GROUP).await.unwrap();
    assert_eq!(answer.result_code, ResultCode::LimitedSuccess);

    let outcome = h
        .controller
        .report_usage(&handle, RATING_GROUP, 100 * KB)
        .await
        .unwrap();
    assert_eq!(outcome.forwarded, 100 * KB);

    let stats = h
        .controller
        .enforcement()
        .stats(SUBSCRIBER, RULE_ID)
        .unwrap();
    assert_eq!(stats.forwarded, 600 * KB + epsilon);
    assert_eq!(stats.dropped, MB - 500 * KB - epsilon);

    println!("✓ Step 2: Traffic admitted again after the cap was raised");
    h.controller.end_session(&handle).await.unwrap();
}
