// Domain models shared by the hub, store and aggregation components.

mod job;
mod point;
mod retention;
mod sensor;

pub use job::{Family, Job, JobKey, JobSpec, Organization, Period, Schedule, validate_identifier};
pub(crate) use job::flux_string;
pub use point::{Point, QueryRow};
pub use retention::RetentionRule;
pub use sensor::{DeviceIdentity, HubEntity, SensorDescriptor, SensorEvent};
