//! 端到端测试：CCR-Update 重发
//!
//! 测试场景：
//! 1. CCR-Update 的应答丢失
//! 2. 控制器在超时后以相同关联ID重发
//! 3. OCS 返回缓存的应答，授予只追加一次

use crate::common::{fast_config, harness, KB, RATING_GROUP, SUBSCRIBER};
use creditron::protocol::RequestType;

/// 端到端测试：应答丢失后重发 CCR-Update
#[tokio::test]
async fn test_e2e_update_retried_after_lost_answer() {
    let h = harness(fast_config());
    let handle = h.start(SUBSCRIBER, 100 * KB).await;

    // Step 1: 充值并丢弃下一个应答
    h.simulator.top_up(SUBSCRIBER, RATING_GROUP, 50 * KB);
    h.simulator.drop_next_answers(1);
    let outcome = h
        .controller
        .report_usage(&handle, RATING_GROUP, 90 * KB)
        .await
        .unwrap();
    assert!(outcome.update_requested);

    println!("✓ Step 1: CCR-Update sent, answer dropped");

    // Step 2: 重发后完成
    h.wait_for_updates(1).await;
    let updates: Vec<_> = h
        .simulator
        .requests()
        .into_iter()
        .filter(|r| r.request_type == RequestType::Update)
        .collect();
    assert_eq!(updates.len(), 2);
    assert_eq!(updates[0].correlation_id, updates[1].correlation_id);
    assert_eq!(updates[0].request_number, updates[1].request_number);
    assert!(!updates[0].retransmission);
    assert!(updates[1].retransmission);
    assert_eq!(updates[1].granted_units, 50 * KB);

    println!("✓ Step 2: CCR-Update retransmitted with the same correlation id");

    // Step 3: 授予只追加一次
    assert_eq!(
        h.controller
            .query_remaining_quota(&handle, RATING_GROUP)
            .unwrap(),
        (90 * KB, 150 * KB)
    );
    assert_eq!(h.simulator.balance(SUBSCRIBER, RATING_GROUP), 0);
    assert_eq!(
        h.controller.enforcement().cap_for(SUBSCRIBER, RATING_GROUP),
        Some(150 * KB)
    );

    println!("✓ Step 3: Grant applied exactly once");
    h.controller.end_session(&handle).await.unwrap();
    println!("✓ E2E test passed: CCR-Update retry");
}
