//! # Role-based field projection.
//!
//! [`project`] maps `(StatusRecord, Role)` to the [`ProjectedView`] that role
//! is allowed to see. The policy is a declarative table — one `(field,
//! minimum role)` row per record field — consulted once per projection.
//!
//! ## Rules
//! - Deterministic and total: never fails, no side effects.
//! - Unknown field names have no table row → no access (fail closed).
//! - Missing source values are omitted from the view, never defaulted.
//! - Views are value types compared by structural equality; the change gate
//!   diffs them to decide whether a push is worth sending.

use std::time::SystemTime;

use super::record::{EngineState, StatusRecord, VehicleKey};
use super::role::Role;

/// Projectable fields of a [`StatusRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Key,
    Odometer,
    Timestamp,
    FuelLevel,
    EngineState,
    Location,
    Speed,
    Temperature,
    MaintenanceDue,
    Online,
    LastMaintenance,
    DriverId,
}

/// Visibility policy: the minimum role required to see each field.
///
/// The hierarchy (`Base < Elevated < Full`) makes one threshold per field
/// sufficient; a role sees a field iff it covers the threshold.
const VISIBILITY: &[(Field, Role)] = &[
    (Field::Key, Role::Base),
    (Field::Odometer, Role::Base),
    (Field::Timestamp, Role::Base),
    (Field::FuelLevel, Role::Elevated),
    (Field::EngineState, Role::Elevated),
    (Field::Location, Role::Elevated),
    (Field::Speed, Role::Elevated),
    (Field::Temperature, Role::Elevated),
    (Field::MaintenanceDue, Role::Elevated),
    (Field::Online, Role::Elevated),
    (Field::LastMaintenance, Role::Full),
    (Field::DriverId, Role::Full),
];

impl Field {
    /// Resolves a field by wire name.
    ///
    /// Returns `None` for anything not in the table, which callers must
    /// treat as "no access".
    pub fn parse(name: &str) -> Option<Field> {
        let field = match name {
            "key" => Field::Key,
            "odometer" => Field::Odometer,
            "timestamp" => Field::Timestamp,
            "fuel_level" => Field::FuelLevel,
            "engine_state" => Field::EngineState,
            "location" => Field::Location,
            "speed" => Field::Speed,
            "temperature" => Field::Temperature,
            "maintenance_due" => Field::MaintenanceDue,
            "online" => Field::Online,
            "last_maintenance" => Field::LastMaintenance,
            "driver_id" => Field::DriverId,
            _ => return None,
        };
        Some(field)
    }

    /// True if `role` may see this field.
    pub fn visible_to(self, role: Role) -> bool {
        VISIBILITY
            .iter()
            .find(|(f, _)| *f == self)
            .is_some_and(|(_, min)| role.covers(*min))
    }
}

/// True if `role` may see the field named `name`; unknown names are denied.
pub fn name_visible_to(name: &str, role: Role) -> bool {
    Field::parse(name).is_some_and(|f| f.visible_to(role))
}

/// The subset of a [`StatusRecord`] visible to one role.
///
/// Fields outside the role's visibility are `None`, indistinguishable from
/// values the vehicle never reported — a viewer cannot tell "hidden" from
/// "absent", which is the point.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectedView {
    pub key: VehicleKey,
    pub timestamp: SystemTime,
    pub odometer: Option<u64>,
    pub fuel_level: Option<u8>,
    pub engine_state: Option<EngineState>,
    pub location: Option<String>,
    pub speed: Option<u32>,
    pub temperature: Option<f64>,
    pub maintenance_due: Option<bool>,
    pub online: Option<bool>,
    pub last_maintenance: Option<SystemTime>,
    pub driver_id: Option<String>,
}

impl ProjectedView {
    /// Names of the fields actually present in this view.
    ///
    /// Used to check visibility monotonicity: a narrower role's view must be
    /// a field-subset of a wider role's view of the same record.
    pub fn present_fields(&self) -> Vec<&'static str> {
        let mut out = vec!["key", "timestamp"];
        if self.odometer.is_some() {
            out.push("odometer");
        }
        if self.fuel_level.is_some() {
            out.push("fuel_level");
        }
        if self.engine_state.is_some() {
            out.push("engine_state");
        }
        if self.location.is_some() {
            out.push("location");
        }
        if self.speed.is_some() {
            out.push("speed");
        }
        if self.temperature.is_some() {
            out.push("temperature");
        }
        if self.maintenance_due.is_some() {
            out.push("maintenance_due");
        }
        if self.online.is_some() {
            out.push("online");
        }
        if self.last_maintenance.is_some() {
            out.push("last_maintenance");
        }
        if self.driver_id.is_some() {
            out.push("driver_id");
        }
        out
    }
}

/// Projects a record through the visibility table for the given role.
///
/// Key and timestamp are identity fields every role sees. Each remaining
/// field survives only if (a) the table grants it to `role` and (b) the
/// source value is present.
pub fn project(record: &StatusRecord, role: Role) -> ProjectedView {
    fn keep<T: Clone>(value: &Option<T>, field: Field, role: Role) -> Option<T> {
        if field.visible_to(role) {
            value.clone()
        } else {
            None
        }
    }

    ProjectedView {
        key: record.key.clone(),
        timestamp: record.timestamp,
        odometer: keep(&record.odometer, Field::Odometer, role),
        fuel_level: keep(&record.fuel_level, Field::FuelLevel, role),
        engine_state: keep(&record.engine_state, Field::EngineState, role),
        location: keep(&record.location, Field::Location, role),
        speed: keep(&record.speed, Field::Speed, role),
        temperature: keep(&record.temperature, Field::Temperature, role),
        maintenance_due: keep(&record.maintenance_due, Field::MaintenanceDue, role),
        online: keep(&record.online, Field::Online, role),
        last_maintenance: keep(&record.last_maintenance, Field::LastMaintenance, role),
        driver_id: keep(&record.driver_id, Field::DriverId, role),
    }
}
