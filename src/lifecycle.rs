//! Battery/lifecycle adapter: derives transport and queue
//! tuning parameters from the host device's power state.
//!
//! A pure data transform, no I/O: a small, single-purpose struct in the
//! same vein as `config.rs`'s sub-configs.

use serde::{Deserialize, Serialize};

/// Battery-level fraction matching `BatteryConfig`'s default
/// `critical_threshold` of 10%.
pub const DEFAULT_CRITICAL_THRESHOLD: f32 = 0.10;

/// Snapshot of device power state fed in by the host application.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PowerState {
    pub battery_level: f32,
    pub charging: bool,
    pub power_save: bool,
    pub low_power: bool,
}

impl PowerState {
    /// `critical_threshold` is a battery-level fraction (0.0-1.0), derived
    /// from the configured `BatteryConfig::critical_threshold` percentage.
    fn is_critical(&self, critical_threshold: f32) -> bool {
        self.battery_level <= critical_threshold
    }
}

/// Derived parameters applied to the Transport and Offline Queue. Changes
/// are applied atomically on the next idle boundary by the caller; this
/// type only computes the target values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleParams {
    pub keep_alive_seconds: u32,
    pub sync_interval_seconds: u32,
    pub max_concurrent_operations: u32,
    pub defer_non_critical_requests: bool,
}

/// Computes transport/queue tuning from a `PowerState` snapshot. Charging
/// resets keep-alive to 60s unless the battery is critical.
/// `critical_threshold` is the configured battery-level fraction (0.0-1.0)
/// at or below which the battery counts as critical; pass
/// `DEFAULT_CRITICAL_THRESHOLD` to match the out-of-the-box configuration.
pub fn derive(power: PowerState, critical_threshold: f32) -> LifecycleParams {
    let critical = power.is_critical(critical_threshold);

    let keep_alive_seconds = if critical {
        300
    } else if power.charging {
        60
    } else if power.low_power && power.power_save {
        180
    } else if power.low_power {
        120
    } else {
        60
    };

    let sync_interval_seconds = if critical {
        300
    } else if power.low_power && power.power_save {
        120
    } else if power.low_power {
        60
    } else {
        30
    };

    let max_concurrent_operations = if critical {
        2
    } else if power.low_power && power.power_save {
        5
    } else if power.low_power {
        7
    } else {
        10
    };

    let defer_non_critical_requests = critical || (power.low_power && power.power_save);

    LifecycleParams {
        keep_alive_seconds,
        sync_interval_seconds,
        max_concurrent_operations,
        defer_non_critical_requests,
    }
}
