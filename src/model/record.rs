//! # Status record: one time-stamped report from a vehicle.
//!
//! A [`StatusRecord`] is immutable once constructed: a new report always
//! produces a new record, never a mutation of a prior one. The store keeps
//! records ordered by `timestamp`; the engine only ever reads the latest
//! record or a time-bounded list.

use std::sync::Arc;
use std::time::SystemTime;

/// Unique identifier of a tracked vehicle (the subscription topic).
///
/// Cheap to clone; records, subscriptions, and gate entries all share it.
pub type VehicleKey = Arc<str>;

/// Reported engine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Running,
    Stopped,
    Warning,
}

/// One time-stamped status report for a vehicle.
///
/// `key` and `timestamp` are always present; every telemetry field is
/// optional because vehicles report partial payloads. Missing values stay
/// missing all the way through projection (never defaulted).
#[derive(Debug, Clone, PartialEq)]
pub struct StatusRecord {
    /// Vehicle this report belongs to.
    pub key: VehicleKey,
    /// When the report was taken.
    pub timestamp: SystemTime,
    /// Odometer reading in kilometers.
    pub odometer: Option<u64>,

    // Telemetry.
    /// Fuel level in percent (0..=100).
    pub fuel_level: Option<u8>,
    /// Engine state at report time.
    pub engine_state: Option<EngineState>,
    /// Coordinates or free-form address.
    pub location: Option<String>,
    /// Speed in km/h.
    pub speed: Option<u32>,
    /// Engine temperature in °C.
    pub temperature: Option<f64>,
    /// Maintenance is due.
    pub maintenance_due: Option<bool>,
    /// Vehicle is currently reporting to the platform.
    pub online: Option<bool>,

    // Operational data, restricted visibility.
    /// Date of the last completed maintenance.
    pub last_maintenance: Option<SystemTime>,
    /// Driver currently assigned to the vehicle.
    pub driver_id: Option<String>,
}

impl StatusRecord {
    /// Creates a record with the given key and timestamp and no telemetry.
    ///
    /// Telemetry is filled in with struct-update syntax:
    /// ```
    /// use std::time::SystemTime;
    /// use fleetstream::StatusRecord;
    ///
    /// let rec = StatusRecord {
    ///     odometer: Some(120_500),
    ///     fuel_level: Some(64),
    ///     ..StatusRecord::new("WDB9634031L123456", SystemTime::now())
    /// };
    /// assert_eq!(rec.fuel_level, Some(64));
    /// ```
    pub fn new(key: impl Into<VehicleKey>, timestamp: SystemTime) -> Self {
        Self {
            key: key.into(),
            timestamp,
            odometer: None,
            fuel_level: None,
            engine_state: None,
            location: None,
            speed: None,
            temperature: None,
            maintenance_due: None,
            online: None,
            last_maintenance: None,
            driver_id: None,
        }
    }
}
