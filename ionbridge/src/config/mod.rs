//! Core options parsed from the application's flat configuration map.
//!
//! Configuration file parsing lives outside this crate; an external component
//! hands the core a flat `section.key → string` map. This module extracts the
//! feature flags and surface tunables the core understands into typed
//! settings structs. Keys belonging to other components are ignored.

use std::collections::HashMap;
use std::time::Duration;

use thiserror::Error;

/// Default reactor poll timeout.
pub const DEFAULT_POLL_TIMEOUT_MS: u64 = 256;

/// Default retention for write buffers in the shared-buffer ledger.
///
/// Must exceed the worst-case kernel latency for a submitted write to drain.
pub const DEFAULT_BUFFER_TTL_MS: u64 = 512;

/// Default idle threshold before an unretained descriptor is reclaimed.
pub const DEFAULT_DESCRIPTOR_STALE_MS: u64 = 60_000;

/// Default time-to-live for queued responses awaiting webview pickup.
pub const DEFAULT_RESPONSE_TTL_MS: u64 = 32 * 1024;

/// Errors that can occur while reading core configuration values.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A recognized key holds a value that does not parse.
    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },
}

/// Feature flags gating optional subsystems.
#[derive(Debug, Clone)]
pub struct Features {
    /// UDP service and its recv loops.
    pub use_udp: bool,
    /// Network-status polling subsystem (externally registered).
    pub use_network_status: bool,
    /// Conduit server subsystem (externally registered).
    pub use_conduit: bool,
    /// Notification bridge subsystem (externally registered).
    pub use_notifications: bool,
}

impl Default for Features {
    fn default() -> Self {
        Self {
            use_udp: true,
            use_network_status: true,
            use_conduit: true,
            use_notifications: true,
        }
    }
}

/// Reactor loop settings.
#[derive(Debug, Clone)]
pub struct LoopSettings {
    /// When true the reactor owns a dedicated thread. When false the host
    /// drives the loop by calling `Reactor::step` from its own main loop.
    pub dedicated_thread: bool,
    /// Upper bound on a single poll turn's sleep.
    pub poll_timeout: Duration,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            dedicated_thread: true,
            poll_timeout: Duration::from_millis(DEFAULT_POLL_TIMEOUT_MS),
        }
    }
}

/// Tunables for the housekeeping ledgers and the queued-response store.
#[derive(Debug, Clone)]
pub struct LedgerSettings {
    /// Retention granted to write buffers handed to the kernel.
    pub buffer_ttl: Duration,
    /// Idle threshold before an unretained descriptor is closed.
    pub descriptor_stale_after: Duration,
    /// Lifetime of a queued response awaiting pickup.
    pub response_ttl: Duration,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            buffer_ttl: Duration::from_millis(DEFAULT_BUFFER_TTL_MS),
            descriptor_stale_after: Duration::from_millis(DEFAULT_DESCRIPTOR_STALE_MS),
            response_ttl: Duration::from_millis(DEFAULT_RESPONSE_TTL_MS),
        }
    }
}

/// Complete core configuration.
#[derive(Debug, Clone, Default)]
pub struct CoreOptions {
    pub features: Features,
    pub event_loop: LoopSettings,
    pub ledgers: LedgerSettings,
}

impl CoreOptions {
    /// Builds options from the flat `section.key → string` map supplied by
    /// the external configuration component.
    ///
    /// Unrecognized keys are ignored; recognized keys with unparseable
    /// values are errors.
    pub fn from_map(map: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let mut options = Self::default();

        if let Some(v) = map.get("features.useUDP") {
            options.features.use_udp = parse_bool("features.useUDP", v)?;
        }
        if let Some(v) = map.get("features.useNetworkStatus") {
            options.features.use_network_status = parse_bool("features.useNetworkStatus", v)?;
        }
        if let Some(v) = map.get("features.useConduit") {
            options.features.use_conduit = parse_bool("features.useConduit", v)?;
        }
        if let Some(v) = map.get("features.useNotifications") {
            options.features.use_notifications = parse_bool("features.useNotifications", v)?;
        }
        if let Some(v) = map.get("loop.dedicatedThread") {
            options.event_loop.dedicated_thread = parse_bool("loop.dedicatedThread", v)?;
        }
        if let Some(v) = map.get("loop.pollTimeoutMs") {
            options.event_loop.poll_timeout = parse_ms("loop.pollTimeoutMs", v)?;
        }
        if let Some(v) = map.get("buffers.ttlMs") {
            options.ledgers.buffer_ttl = parse_ms("buffers.ttlMs", v)?;
        }
        if let Some(v) = map.get("descriptors.staleTimeoutMs") {
            options.ledgers.descriptor_stale_after = parse_ms("descriptors.staleTimeoutMs", v)?;
        }
        if let Some(v) = map.get("responses.ttlMs") {
            options.ledgers.response_ttl = parse_ms("responses.ttlMs", v)?;
        }

        Ok(options)
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        other => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            reason: format!("expected a boolean, got '{other}'"),
        }),
    }
}

fn parse_ms(key: &str, value: &str) -> Result<Duration, ConfigError> {
    value
        .trim()
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            reason: e.to_string(),
        })
}
