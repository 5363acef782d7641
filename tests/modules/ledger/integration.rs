//! 账本模块集成测试
//!
//! 测试授予、消费与上限接纳

use creditron::error::ChargingError;
use creditron::ledger::{GrantMode, GrantedUnits, PoolKey, QuotaLedger};
use std::sync::Arc;

fn ledger() -> QuotaLedger {
    let ledger = QuotaLedger::new();
    ledger.open_subscriber("IMSI001");
    ledger
}

/// 初始授予替换，充值累加
#[test]
fn test_initial_replaces_top_up_accumulates() {
    let ledger = ledger();
    ledger
        .grant("IMSI001", 1, GrantedUnits::bytes(500), GrantMode::Initial)
        .unwrap();
    let s = ledger
        .grant("IMSI001", 1, GrantedUnits::bytes(300), GrantMode::Initial)
        .unwrap();
    assert_eq!(s.granted_total, 300);
    assert_eq!(s.initial_grant, 300);

    let s = ledger
        .grant("IMSI001", 1, GrantedUnits::bytes(200), GrantMode::TopUp)
        .unwrap();
    assert_eq!(s.granted_total, 500);
    assert_eq!(s.initial_grant, 300);
}

/// 超额消费不失败，比例超过 1
#[test]
fn test_overconsume_is_recorded() {
    let ledger = ledger();
    ledger
        .grant("IMSI001", 1, GrantedUnits::bytes(100), GrantMode::Initial)
        .unwrap();
    let s = ledger.consume("IMSI001", 1, 150).unwrap();
    assert_eq!(s.consumed, 150);
    assert_eq!(s.remaining(), 0);
    assert!(s.ratio() > 1.0);
}

/// 消费量单调递增
#[test]
fn test_consumed_is_monotonic() {
    let ledger = ledger();
    ledger.open_pool(PoolKey::new("IMSI001", 1)).unwrap();
    let mut previous = 0;
    let mut sequence = 0;
    for bytes in [0, 10, 1, 1000] {
        let s = ledger.consume("IMSI001", 1, bytes).unwrap();
        assert!(s.consumed >= previous);
        assert!(s.sequence > sequence);
        previous = s.consumed;
        sequence = s.sequence;
    }
}

/// 未知用户与费率组
#[test]
fn test_unknown_subscriber_and_rating_group() {
    let ledger = ledger();
    assert!(matches!(
        ledger.consume("IMSI999", 1, 1),
        Err(ChargingError::UnknownSubscriber(_))
    ));
    assert!(matches!(
        ledger.snapshot("IMSI001", 7),
        Err(ChargingError::UnknownRatingGroup { rating_group: 7, .. })
    ));
    assert!(matches!(
        ledger.open_pool(PoolKey::new("IMSI999", 1)),
        Err(ChargingError::UnknownSubscriber(_))
    ));
}

/// 溢出视为账本损坏
#[test]
fn test_overflow_is_fatal() {
    let ledger = ledger();
    ledger
        .grant("IMSI001", 1, GrantedUnits::bytes(u64::MAX), GrantMode::Initial)
        .unwrap();
    let err = ledger
        .grant("IMSI001", 1, GrantedUnits::bytes(1), GrantMode::TopUp)
        .unwrap_err();
    assert!(err.is_fatal());

    ledger.consume("IMSI001", 1, u64::MAX).unwrap();
    let err = ledger.consume("IMSI001", 1, 1).unwrap_err();
    assert!(matches!(err, ChargingError::LedgerCorruption(_)));
}

/// 上限接纳：最多到 cap + 容差
#[test]
fn test_consume_capped_admits_up_to_tolerance() {
    let ledger = ledger();
    ledger
        .grant("IMSI001", 1, GrantedUnits::bytes(1000), GrantMode::Initial)
        .unwrap();

    let (s, accepted) = ledger.consume_capped("IMSI001", 1, 900, None, 50).unwrap();
    assert_eq!(accepted, 900);
    assert_eq!(s.consumed, 900);

    let (s, accepted) = ledger.consume_capped("IMSI001", 1, 500, None, 50).unwrap();
    assert_eq!(accepted, 150);
    assert_eq!(s.consumed, 1050);

    let (_, accepted) = ledger.consume_capped("IMSI001", 1, 1, None, 50).unwrap();
    assert_eq!(accepted, 0);

    // 显式上限优先于授予总量
    let (s, accepted) = ledger
        .consume_capped("IMSI001", 1, 100, Some(2000), 0)
        .unwrap();
    assert_eq!(accepted, 100);
    assert_eq!(s.consumed, 1150);
}

/// 并发接纳不会共同越过上限
#[test]
fn test_concurrent_capped_consume_respects_cap() {
    let ledger = Arc::new(ledger());
    ledger
        .grant("IMSI001", 1, GrantedUnits::bytes(10_000), GrantMode::Initial)
        .unwrap();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let ledger = ledger.clone();
            std::thread::spawn(move || {
                let mut accepted = 0;
                for _ in 0..1000 {
                    accepted += ledger
                        .consume_capped("IMSI001", 1, 7, None, 100)
                        .unwrap()
                        .1;
                }
                accepted
            })
        })
        .collect();
    let total: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();

    let s = ledger.snapshot("IMSI001", 1).unwrap();
    assert_eq!(s.consumed, total);
    assert!(s.consumed <= 10_000 + 100);
    assert!(s.consumed > 10_000 + 100 - 7);
}

/// 关闭用户返回最终快照
#[test]
fn test_close_subscriber_returns_snapshots() {
    let ledger = ledger();
    ledger
        .grant("IMSI001", 1, GrantedUnits::bytes(10), GrantMode::Initial)
        .unwrap();
    ledger
        .grant("IMSI001", 2, GrantedUnits::bytes(20), GrantMode::Initial)
        .unwrap();
    assert_eq!(ledger.pools("IMSI001").unwrap().len(), 2);

    let mut closed = ledger.close_subscriber("IMSI001");
    closed.sort_by_key(|s| s.key.rating_group);
    assert_eq!(closed.len(), 2);
    assert_eq!(closed[1].granted_total, 20);
    assert!(!ledger.has_subscriber("IMSI001"));
    assert!(ledger.close_subscriber("IMSI001").is_empty());
    assert_eq!(ledger.subscriber_count(), 0);
}
