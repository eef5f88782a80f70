//! 暂停分组实体
//! Paused trigger group entity

use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "qrtz_paused_trigger_grps")]
pub struct Model {
  #[sea_orm(primary_key, auto_increment = false)]
  pub sched_name: String,
  #[sea_orm(primary_key, auto_increment = false)]
  pub trigger_group: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
