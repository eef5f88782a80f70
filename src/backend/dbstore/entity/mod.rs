//! 持久化表实体
//! Persistent table entities
//!
//! 每个触发器子类型表通过 `(sched_name, trigger_group, trigger_name)`
//! 外键挂到 `qrtz_triggers`，随主表删除级联。触发时刻一律存为自
//! Unix 纪元以来的带符号 64 位毫秒数。
//! Each trigger-subtype table hangs off `qrtz_triggers` via the
//! `(sched_name, trigger_group, trigger_name)` foreign key and cascades
//! on delete. Fire instants are stored as signed 64-bit milliseconds
//! since the Unix epoch.

pub mod blob_triggers;
pub mod calendars;
pub mod cron_triggers;
pub mod fired_triggers;
pub mod job_details;
pub mod locks;
pub mod paused_trigger_grps;
pub mod prelude;
pub mod scheduler_state;
pub mod simple_triggers;
pub mod simprop_triggers;
pub mod triggers;

pub use prelude::*;
