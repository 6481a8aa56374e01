//! Domain model: status records, viewer roles, and role-filtered views.

mod record;
mod role;
mod view;

pub use record::{EngineState, StatusRecord, VehicleKey};
pub use role::Role;
pub use view::{name_visible_to, project, Field, ProjectedView};
