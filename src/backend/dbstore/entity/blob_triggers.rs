//! 二进制触发器子类型表实体
//! Blob-trigger subtype table entity
//!
//! 无法映射到类型化子表的触发器整体序列化后落在这里。
//! Triggers that cannot map onto a typed subtype table land here,
//! serialized whole.

use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "qrtz_blob_triggers")]
pub struct Model {
  #[sea_orm(primary_key, auto_increment = false)]
  pub sched_name: String,
  #[sea_orm(primary_key, auto_increment = false)]
  pub trigger_group: String,
  #[sea_orm(primary_key, auto_increment = false)]
  pub trigger_name: String,
  #[sea_orm(column_type = "Text", nullable)]
  pub blob_data: Option<String>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
