//! 命名行锁实体
//! Named row-lock entity
//!
//! 两把锁覆盖全部互斥：`TRIGGER_ACCESS` 守护触发器/作业/触发记录的
//! 变更，`STATE_ACCESS` 守护集群状态与恢复。
//! Two locks cover all mutual exclusion: `TRIGGER_ACCESS` guards
//! trigger/job/fired-trigger mutation, `STATE_ACCESS` guards cluster
//! state and recovery.

use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "qrtz_locks")]
pub struct Model {
  #[sea_orm(primary_key, auto_increment = false)]
  pub sched_name: String,
  #[sea_orm(primary_key, auto_increment = false)]
  pub lock_name: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
