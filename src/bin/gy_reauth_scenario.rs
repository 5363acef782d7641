//! Gy 重授权场景
//!
//! 按步骤运行完整的信用控制流程，并打印每一步的结果：
//! 1. 初始授予 500KB
//! 2. 消费 400KB，越过 80% 阈值触发 CCR-Update
//! 3. OCS 余额为 0，CCR-Update 被拒绝，原授予保留
//! 4. OCS 充值 2MB 并发起 RAR，执行规则重建，应答 LIMITED_SUCCESS
//! 5. 再消费 1MB，规则计数落在 [旧上限 - ε, 新上限 + ε] 内

use creditron::config::{ChargingConfig, LoggingConfig, OcsConfig};
use creditron::enforcement::{PolicyRule, RuleProvisioning};
use creditron::error::ResultCode;
use creditron::protocol::RequestType;
use creditron::session::{AuthResult, SessionController};
use creditron::simulator::OcsSimulator;
use creditron::telemetry::init_tracing;
use std::sync::Arc;
use std::time::Duration;

const SUBSCRIBER: &str = "IMSI001010000000001";
const RATING_GROUP: u32 = 1;
const RULE_ID: &str = "gy-rg1";
const KB: u64 = 1000;
const MB: u64 = 1000 * KB;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing(&LoggingConfig::default())?;

    println!("=== Gy 重授权场景 ===");

    let simulator = Arc::new(OcsSimulator::new(OcsConfig::default()));
    let controller = Arc::new(SessionController::new(
        ChargingConfig::default(),
        simulator.clone(),
    )?);
    simulator.attach(&controller);

    controller
        .rule_provisioning()
        .install_rule(SUBSCRIBER, PolicyRule::new(RULE_ID, 10).with_rating_group(RATING_GROUP))?;
    simulator.set_credit(SUBSCRIBER, RATING_GROUP, 500 * KB);

    let handle = controller.start_session(AuthResult::accepted(SUBSCRIBER)).await?;
    let (_, granted) = controller.query_remaining_quota(&handle, RATING_GROUP)?;
    println!("✓ Step 1: 会话 {} 已建立，初始授予 {} 字节", handle, granted);

    let outcome = controller.report_usage(&handle, RATING_GROUP, 400 * KB).await?;
    println!(
        "✓ Step 2: 消费 {} 字节，触发更新: {}",
        outcome.forwarded, outcome.update_requested
    );

    wait_for_update_answer(&controller, &simulator).await?;
    let (consumed, granted) = controller.query_remaining_quota(&handle, RATING_GROUP)?;
    println!(
        "✓ Step 3: CCR-Update 被拒绝，已消费 {} / 授予 {}",
        consumed, granted
    );

    simulator.top_up(SUBSCRIBER, RATING_GROUP, 2 * MB);
    let answer = simulator.send_re_auth(SUBSCRIBER, RATING_GROUP).await?;
    let (_, granted) = controller.query_remaining_quota(&handle, RATING_GROUP)?;
    println!(
        "✓ Step 4: RAR 应答 {} ({})，授予总量 {}",
        answer.result_code,
        answer.result_code.to_diameter(),
        granted
    );
    if answer.result_code != ResultCode::LimitedSuccess {
        return Err(format!("期望 LIMITED_SUCCESS，实际 {}", answer.result_code).into());
    }

    let outcome = controller.report_usage(&handle, RATING_GROUP, MB).await?;
    let usage = controller.enforcement().usage_since(SUBSCRIBER, RULE_ID)?;
    let within = controller
        .enforcement()
        .within_bounds(usage, 500 * KB, outcome.granted_total);
    println!(
        "✓ Step 5: 规则 {} 累计 {} 字节，边界检查: {}",
        RULE_ID, usage, within
    );

    controller.end_session(&handle).await?;
    println!("\n=== 请求记录 ===");
    for record in simulator.requests() {
        println!(
            "{:<12} #{:<2} used={:<8} granted={:<8} result={}",
            record.request_type.as_str(),
            record.request_number,
            record.used_bytes,
            record.granted_units,
            record.result_code
        );
    }
    if let Some(path) = std::env::args().nth(1) {
        std::fs::write(&path, simulator.export_requests_json()?)?;
        println!("请求记录已写入 {}", path);
    }

    if !within {
        return Err("规则计数超出容差范围".into());
    }
    println!("\n✓ 场景完成");
    Ok(())
}

async fn wait_for_update_answer(
    controller: &SessionController,
    simulator: &OcsSimulator,
) -> Result<(), Box<dyn std::error::Error>> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let answered = simulator.request_count(RequestType::Update) > 0
            && controller.monitor().pending_count() == 0;
        if answered {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err("等待 CCR-Update 应答超时".into());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
