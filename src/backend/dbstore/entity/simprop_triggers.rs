//! 通用属性触发器子类型表实体
//! Generic-property trigger subtype table entity
//!
//! 列被日历区间、每日区间与自定义日历变体复用；各变体的
//! 列映射见持久化委托。
//! Columns are reused by the calendar-interval, daily-interval, and
//! custom-calendar variants; see the persistence delegate for each
//! variant's column mapping.

use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "qrtz_simprop_triggers")]
pub struct Model {
  #[sea_orm(primary_key, auto_increment = false)]
  pub sched_name: String,
  #[sea_orm(primary_key, auto_increment = false)]
  pub trigger_group: String,
  #[sea_orm(primary_key, auto_increment = false)]
  pub trigger_name: String,
  pub str_prop_1: Option<String>,
  pub str_prop_2: Option<String>,
  pub str_prop_3: Option<String>,
  pub int_prop_1: Option<i32>,
  pub int_prop_2: Option<i32>,
  pub long_prop_1: Option<i64>,
  pub long_prop_2: Option<i64>,
  #[sea_orm(column_type = "Double", nullable)]
  pub dec_prop_1: Option<f64>,
  #[sea_orm(column_type = "Double", nullable)]
  pub dec_prop_2: Option<f64>,
  pub bool_prop_1: Option<bool>,
  pub bool_prop_2: Option<bool>,
  pub time_zone_id: Option<String>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
