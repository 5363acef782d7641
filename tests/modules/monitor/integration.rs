//! 使用量监控模块集成测试
//!
//! 测试阈值触发、去抖与请求策略

use creditron::config::{ChargingConfig, RequestPolicy};
use creditron::ledger::{GrantMode, GrantedUnits, QuotaLedger};
use creditron::monitor::{ReportingReason, UsageMonitor};

fn ledger(granted: u64) -> QuotaLedger {
    let ledger = QuotaLedger::new();
    ledger.open_subscriber("IMSI001");
    ledger
        .grant("IMSI001", 1, GrantedUnits::bytes(granted), GrantMode::Initial)
        .unwrap();
    ledger
}

/// 500KB 授予、消费 400KB 恰好触发一次
#[test]
fn test_threshold_at_eighty_percent() {
    let ledger = ledger(500_000);
    let monitor = UsageMonitor::from_config(&ChargingConfig::default());

    let s = ledger.consume("IMSI001", 1, 399_999).unwrap();
    assert!(monitor.evaluate(&s).is_none());

    let s = ledger.consume("IMSI001", 1, 1).unwrap();
    let update = monitor.evaluate(&s).unwrap();
    assert_eq!(update.reason, ReportingReason::Threshold);
    assert_eq!(update.requested_units, 500_000);
    assert_eq!(update.snapshot.consumed, 400_000);
    assert!(monitor.is_pending(&s.key));
    assert!(monitor.pending_since(&s.key).is_some());

    for _ in 0..10 {
        let s = ledger.consume("IMSI001", 1, 1000).unwrap();
        assert!(monitor.evaluate(&s).is_none());
    }
}

/// 自定义阈值与固定请求量
#[test]
fn test_custom_threshold_and_fixed_policy() {
    let ledger = ledger(1000);
    let monitor = UsageMonitor::new(0.5, RequestPolicy::Fixed { units: 4096 });

    let s = ledger.consume("IMSI001", 1, 499).unwrap();
    assert!(monitor.evaluate(&s).is_none());
    let s = ledger.consume("IMSI001", 1, 1).unwrap();
    assert_eq!(monitor.evaluate(&s).unwrap().requested_units, 4096);
}

/// 应答后授予增加，低于阈值不再触发
#[test]
fn test_grant_after_update_clears_threshold() {
    let ledger = ledger(1000);
    let monitor = UsageMonitor::default();

    let s = ledger.consume("IMSI001", 1, 800).unwrap();
    assert!(monitor.evaluate(&s).is_some());
    let s = ledger
        .grant("IMSI001", 1, GrantedUnits::bytes(1000), GrantMode::TopUp)
        .unwrap();
    assert!(monitor.complete(&s.key));
    assert!(!monitor.complete(&s.key));

    let s = ledger.consume("IMSI001", 1, 1).unwrap();
    assert!(monitor.evaluate(&s).is_none());
    assert_eq!(monitor.pending_count(), 0);
}

/// 被拒绝后抑制，授予变化后恢复
#[test]
fn test_rejection_suppresses_until_grant_changes() {
    let ledger = ledger(1000);
    let monitor = UsageMonitor::default();

    let s = ledger.consume("IMSI001", 1, 900).unwrap();
    assert!(monitor.evaluate(&s).is_some());
    monitor.complete_rejected(&s.key, s.granted_total);

    let s = ledger.consume("IMSI001", 1, 200).unwrap();
    assert!(monitor.evaluate(&s).is_none());

    ledger
        .grant("IMSI001", 1, GrantedUnits::bytes(10), GrantMode::TopUp)
        .unwrap();
    let s = ledger.consume("IMSI001", 1, 0).unwrap();
    let update = monitor.evaluate(&s).unwrap();
    assert_eq!(update.reason, ReportingReason::QuotaExhausted);
}
