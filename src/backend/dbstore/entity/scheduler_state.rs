//! 调度器实例状态实体
//! Scheduler instance state entity
//!
//! 每个存活实例一行；过期的行驱动失效接管。
//! One row per live instance; stale rows drive failover.

use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "qrtz_scheduler_state")]
pub struct Model {
  #[sea_orm(primary_key, auto_increment = false)]
  pub sched_name: String,
  #[sea_orm(primary_key, auto_increment = false)]
  pub instance_name: String,
  pub last_checkin_time: i64,
  pub checkin_interval: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
