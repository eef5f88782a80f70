//! 简单触发器子类型表实体
//! Simple-trigger subtype table entity

use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "qrtz_simple_triggers")]
pub struct Model {
  #[sea_orm(primary_key, auto_increment = false)]
  pub sched_name: String,
  #[sea_orm(primary_key, auto_increment = false)]
  pub trigger_group: String,
  #[sea_orm(primary_key, auto_increment = false)]
  pub trigger_name: String,
  pub repeat_count: i64,
  pub repeat_interval: i64,
  pub times_triggered: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
