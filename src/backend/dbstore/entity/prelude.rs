//! 实体 prelude
//! Entity prelude

pub use super::blob_triggers::Entity as BlobTriggers;
pub use super::calendars::Entity as Calendars;
pub use super::cron_triggers::Entity as CronTriggers;
pub use super::fired_triggers::Entity as FiredTriggers;
pub use super::job_details::Entity as JobDetails;
pub use super::locks::Entity as Locks;
pub use super::paused_trigger_grps::Entity as PausedTriggerGrps;
pub use super::scheduler_state::Entity as SchedulerState;
pub use super::simple_triggers::Entity as SimpleTriggers;
pub use super::simprop_triggers::Entity as SimpropTriggers;
pub use super::triggers::Entity as Triggers;
