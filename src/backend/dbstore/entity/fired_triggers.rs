//! 触发记录实体
//! Fired-trigger record entity
//!
//! 获取时插入、完成时删除；实例崩溃后幸存的行驱动接管恢复。
//! Inserted on acquire, removed on completion; rows surviving an
//! instance crash drive takeover recovery.

use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "qrtz_fired_triggers")]
pub struct Model {
  #[sea_orm(primary_key, auto_increment = false)]
  pub sched_name: String,
  #[sea_orm(primary_key, auto_increment = false)]
  pub entry_id: String,
  pub trigger_group: String,
  pub trigger_name: String,
  pub job_group: String,
  pub job_name: String,
  pub instance_name: String,
  pub fired_time: i64,
  pub sched_time: i64,
  pub priority: i32,
  /// `ACQUIRED` 或 `EXECUTING`
  /// `ACQUIRED` or `EXECUTING`
  pub state: String,
  pub is_nonconcurrent: bool,
  pub requests_recovery: bool,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
