//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! Creditron - Online Charging Credit-Control Core
//!
//! Client side of the Diameter Gy interface: credit pools per subscriber and
//! rating group, threshold-driven CCR-Update, server-initiated re-auth (RAR)
//! and enforcement of the granted caps on the datapath.
//!
//! # API Layers
//!
//! ## Prelude (Quick Start)
//!
//! Use `use creditron::prelude::*;` to import all commonly used types.
//!
//! ## Core API
//!
//! - [`SessionController`] - Session lifecycle, usage reports and RAR handling
//! - [`QuotaLedger`] - Granted and consumed bytes per credit pool
//! - [`UsageMonitor`] - Threshold detection and update debouncing
//! - [`CreditControlHandler`] - CCR/CCA exchanges and RAR application
//! - [`EnforcementTracker`] - Per-rule counters and caps
//! - [`ChargingError`] - Error types
//!
//! ## Extensions (feature-gated)
//!
//! - Tracing subscriber initialisation (requires `telemetry` feature)
//! - Prometheus metrics (requires `monitoring` feature)
//!
//! # Examples
//!
//! ```rust,no_run
//! use creditron::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), ChargingError> {
//!     let simulator = Arc::new(OcsSimulator::new(OcsConfig::default()));
//!     let controller = Arc::new(SessionController::new(
//!         ChargingConfig::default(),
//!         simulator.clone(),
//!     )?);
//!     simulator.attach(&controller);
//!
//!     simulator.set_credit("IMSI001010000000001", 1, 500_000);
//!     let handle = controller
//!         .start_session_with(AuthResult::accepted("IMSI001010000000001"), &[1])
//!         .await?;
//!     controller.report_usage(&handle, 1, 400_000).await?;
//!     controller.end_session(&handle).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Features
//!
//! - **Per-pool serialization**: ledger mutations under a per-pool lock, no global lock
//! - **Debounced updates**: at most one outstanding CCR-Update per pool
//! - **Idempotent re-auth**: answered RARs are replayed by correlation id
//! - **Bounded enforcement**: caps carry a named enforcement-lag tolerance
//! - **Monitoring**: Prometheus metrics and tracing-subscriber setup behind features

pub mod prelude;

pub mod config;
pub mod constants;
pub mod enforcement;
pub mod error;
pub mod ledger;
pub mod monitor;
pub mod protocol;
pub mod session;
pub mod simulator;
#[cfg(any(feature = "telemetry", feature = "monitoring"))]
pub mod telemetry;

// 重新导出常用类型
pub use config::{
    ChargingConfig, ConflictPolicy, LoggingConfig, OcsConfig, RequestPolicy, RetryConfig,
};
pub use enforcement::{
    EnforcementTracker, PolicyRule, RuleProvisioning, RuleStats, TrackingType, UsageReport,
};
pub use error::{ChargingError, ResultCode};
pub use ledger::{GrantMode, GrantedUnits, PoolKey, PoolSnapshot, QuotaLedger};
pub use monitor::{ReportingReason, UpdateNeeded, UsageMonitor};
pub use protocol::{
    AnswerOutcome, CorrelationId, CreditControlAnswer, CreditControlHandler,
    CreditControlRequest, CreditControlTransport, PoolMachine, PoolPhase, ReAuthAnswer,
    ReAuthRequest, RequestType,
};
pub use session::{
    AuthResult, ChargingSession, ReAuthStatus, ReAuthTransaction, SessionController,
    SessionHandle, UsageOutcome,
};
pub use simulator::{OcsSimulator, RequestRecord};
#[cfg(feature = "telemetry")]
pub use telemetry::init_tracing;
#[cfg(feature = "monitoring")]
pub use telemetry::{set_global_metrics, try_global, Metrics};
