//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! Centralized configuration constants for Creditron.
//!
//! This module provides well-documented constants used throughout the library.
//! All magic numbers are defined here with their purpose and usage context.

// ============================================================================
// Enforcement Constants
// ============================================================================

/// Enforcement-lag tolerance (ε) in bytes.
///
/// The datapath reports per-rule counters at checkpoints, not per packet, so a
/// rule can forward a bounded amount of traffic past its cap before the cap
/// takes effect. Every enforcement bound in the crate is expressed as
/// `cap ± ENFORCEMENT_LAG_TOLERANCE_BYTES`:
///
/// - admission forwards at most `cap + ε - consumed` bytes;
/// - verification accepts usage in `[previous_cap - ε, new_cap + ε]`.
///
/// The default matches the buffer the Gy re-auth scenario adds to its expected
/// byte counts (100 KiB). Override per deployment with
/// [`ChargingConfig::enforcement_lag_tolerance_bytes`].
///
/// [`ChargingConfig::enforcement_lag_tolerance_bytes`]: crate::config::ChargingConfig::enforcement_lag_tolerance_bytes
pub const ENFORCEMENT_LAG_TOLERANCE_BYTES: u64 = 100 * KILOBYTE;

// ============================================================================
// Usage Monitor Constants
// ============================================================================

/// Default reporting threshold (80% of the granted volume).
///
/// Once `consumed / granted_total` reaches this ratio a CCR-Update is requested.
pub const DEFAULT_USAGE_THRESHOLD: f64 = 0.8;

/// Ratio reported for a pool whose granted total is zero.
///
/// A never-provisioned pool is treated as exhausted so that the first consume
/// immediately requests credit.
pub const EXHAUSTED_RATIO: f64 = 1.0;

// ============================================================================
// Protocol Deadlines
// ============================================================================

/// Default deadline for a CCR-Initial/Update answer (5 seconds).
pub const DEFAULT_CCR_TIMEOUT_MS: u64 = 5_000;

/// Default deadline for answering an inbound RAR (3 seconds).
///
/// Includes the time spent waiting behind another re-auth on the same pool.
pub const DEFAULT_RAR_TIMEOUT_MS: u64 = 3_000;

/// Default deadline for a CCR-Terminate answer (1 second).
///
/// Shutdown never blocks longer than this on the OCS.
pub const DEFAULT_TERMINATE_TIMEOUT_MS: u64 = 1_000;

/// Number of answered RAR correlation ids remembered per pool for replay.
///
/// Replays older than this window are applied again.
pub const DEFAULT_REAUTH_REPLAY_CAPACITY: usize = 256;

// ============================================================================
// Retry and Backoff Constants
// ============================================================================

/// Maximum attempts for a CCR-Update that keeps timing out.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Initial delay for exponential backoff (100 milliseconds).
pub const DEFAULT_INITIAL_BACKOFF_MS: u64 = 100;

/// Maximum backoff delay (10 seconds).
pub const DEFAULT_MAX_BACKOFF_MS: u64 = 10_000;

/// Backoff multiplier applied per attempt.
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

// ============================================================================
// Session Constants
// ============================================================================

/// Idle timeout after which a session without traffic is reaped (30 minutes).
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 1_800;

/// Capacity of the per-session worker event channel.
pub const DEFAULT_WORKER_CHANNEL_CAPACITY: usize = 64;

/// Maximum subscriber identifier length (IMSI plus prefix, 64 characters).
pub const MAX_SUBSCRIBER_ID_LENGTH: usize = 64;

// ============================================================================
// OCS Simulator Constants
// ============================================================================

/// Default per-grant volume cap of the bundled OCS simulator (5 MiB).
pub const DEFAULT_OCS_MAX_USAGE_OCTETS: u64 = 5 * MEGABYTE;

/// Default per-grant time cap of the bundled OCS simulator (1000 seconds).
pub const DEFAULT_OCS_MAX_USAGE_TIME_SECS: u32 = 1_000;

/// Default validity time returned by the bundled OCS simulator (1000 seconds).
pub const DEFAULT_OCS_VALIDITY_TIME_SECS: u32 = 1_000;

// ============================================================================
// Unit Constants
// ============================================================================

/// One kilobyte as counted by the datapath.
pub const KILOBYTE: u64 = 1024;

/// One megabyte as counted by the datapath.
pub const MEGABYTE: u64 = 1024 * KILOBYTE;

/// Milliseconds per second.
pub const MS_PER_SECOND: u64 = 1000;
