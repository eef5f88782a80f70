//! 日历实体
//! Calendar entity

use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "qrtz_calendars")]
pub struct Model {
  #[sea_orm(primary_key, auto_increment = false)]
  pub sched_name: String,
  #[sea_orm(primary_key, auto_increment = false)]
  pub calendar_name: String,
  /// 带判别标签的日历 JSON
  /// Tagged calendar JSON
  #[sea_orm(column_type = "Text")]
  pub calendar: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
