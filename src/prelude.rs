//! Prelude module - Commonly used types for quick imports
//!
//! This module re-exports the most commonly used types from Creditron,
//! allowing users to import them with a single `use creditron::prelude::*;`
//! statement instead of importing each type individually.

// Core types - always available
pub use crate::config::{ChargingConfig, OcsConfig};
pub use crate::error::{ChargingError, ResultCode};
pub use crate::session::{AuthResult, SessionController, SessionHandle, UsageOutcome};

// Protocol messages
pub use crate::protocol::{
    CorrelationId, CreditControlAnswer, CreditControlRequest, CreditControlTransport,
    ReAuthAnswer, ReAuthRequest,
};

// Enforcement
pub use crate::enforcement::{PolicyRule, RuleProvisioning};

// Bundled OCS
pub use crate::simulator::OcsSimulator;

// Feature-gated exports
#[cfg(feature = "monitoring")]
pub use crate::telemetry::Metrics;
