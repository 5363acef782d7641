//! 执行跟踪模块集成测试
//!
//! 测试规则优先级、上限重建与容差边界

use creditron::enforcement::{EnforcementTracker, PolicyRule, RuleProvisioning, TrackingType};
use creditron::error::ChargingError;

/// 优先级最高（数值最小）的 OCS 规则计费
#[test]
fn test_highest_priority_rule_enforces() {
    let tracker = EnforcementTracker::new(0);
    tracker
        .install_rule("IMSI001", PolicyRule::new("low", 50).with_rating_group(1))
        .unwrap();
    tracker
        .install_rule("IMSI001", PolicyRule::new("high", 5).with_rating_group(1))
        .unwrap();
    tracker
        .install_rule("IMSI001", PolicyRule::new("pcrf", 1).with_monitoring_key("mk1"))
        .unwrap();

    let ids: Vec<String> = tracker.rules("IMSI001").into_iter().map(|r| r.id).collect();
    assert_eq!(ids, vec!["pcrf", "high", "low"]);
    assert_eq!(tracker.record("IMSI001", 1, 100, 0).as_deref(), Some("high"));
    assert_eq!(tracker.usage_since("IMSI001", "high").unwrap(), 100);
    assert_eq!(tracker.usage_since("IMSI001", "low").unwrap(), 0);
    assert_eq!(tracker.rating_groups("IMSI001"), vec![1]);
    assert_eq!(tracker.monitoring_keys("IMSI001"), vec!["mk1".to_string()]);
}

/// 没有 OCS 规则的费率组不计数
#[test]
fn test_no_enforcing_rule() {
    let tracker = EnforcementTracker::new(0);
    tracker
        .install_rule("IMSI001", PolicyRule::new("pcrf", 1).with_monitoring_key("mk1"))
        .unwrap();
    assert_eq!(
        tracker.rules("IMSI001")[0].tracking(),
        TrackingType::OnlyPcrf
    );
    assert!(tracker.record("IMSI001", 1, 100, 0).is_none());
    assert!(tracker.cap_for("IMSI001", 1).is_none());
    assert!(!tracker.rebuild("IMSI001", 1, 1000));
}

/// 上限变化时重建并增加代数
#[test]
fn test_rebuild_bumps_generation_only_on_change() {
    let tracker = EnforcementTracker::new(0);
    tracker
        .install_rule("IMSI001", PolicyRule::new("ocs", 10).with_rating_group(1))
        .unwrap();

    assert!(tracker.rebuild("IMSI001", 1, 500_000));
    assert!(!tracker.rebuild("IMSI001", 1, 500_000));
    assert!(tracker.rebuild("IMSI001", 1, 2_500_000));

    let stats = tracker.stats("IMSI001", "ocs").unwrap();
    assert_eq!(stats.cap, Some(2_500_000));
    assert_eq!(stats.generation, 2);
    assert_eq!(tracker.cap_for("IMSI001", 1), Some(2_500_000));
}

/// 替换与移除规则
#[test]
fn test_replace_and_remove() {
    let tracker = EnforcementTracker::new(0);
    tracker
        .install_rule("IMSI001", PolicyRule::new("ocs", 10).with_rating_group(1))
        .unwrap();
    tracker.record("IMSI001", 1, 100, 0);
    tracker
        .install_rule("IMSI001", PolicyRule::new("ocs", 10).with_rating_group(2))
        .unwrap();
    assert_eq!(tracker.rules("IMSI001").len(), 1);
    assert_eq!(tracker.usage_since("IMSI001", "ocs").unwrap(), 0);

    assert!(tracker.remove_rule("IMSI001", "ocs").unwrap());
    assert!(!tracker.remove_rule("IMSI001", "ocs").unwrap());
    assert!(!tracker.remove_rule("IMSI404", "ocs").unwrap());
    assert!(matches!(
        tracker.usage_since("IMSI001", "ocs"),
        Err(ChargingError::ValidationError(_))
    ));
    assert!(tracker
        .install_rule("IMSI001", PolicyRule::new("", 1))
        .is_err());
}

/// 容差窗口 [prev - ε, new + ε]
#[test]
fn test_within_bounds() {
    let tracker = EnforcementTracker::new(100 * 1024);
    let prev = 500_000;
    let new = 2_500_000;
    assert!(tracker.within_bounds(1_400_000, prev, new));
    assert!(tracker.within_bounds(prev - 100 * 1024, prev, new));
    assert!(!tracker.within_bounds(prev - 100 * 1024 - 1, prev, new));
    assert!(tracker.within_bounds(new + 100 * 1024, prev, new));
    assert!(!tracker.within_bounds(new + 100 * 1024 + 1, prev, new));
}

/// 清除用户规则
#[test]
fn test_clear_subscriber() {
    let tracker = EnforcementTracker::default();
    tracker
        .install_rule("IMSI001", PolicyRule::new("a", 1).with_rating_group(1))
        .unwrap();
    tracker
        .install_rule("IMSI001", PolicyRule::new("b", 2))
        .unwrap();
    assert_eq!(tracker.clear_subscriber("IMSI001"), 2);
    assert_eq!(tracker.clear_subscriber("IMSI001"), 0);
    assert!(tracker.rules("IMSI001").is_empty());
}
