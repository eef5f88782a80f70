//! 触发器主表实体
//! Trigger main-table entity

use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "qrtz_triggers")]
pub struct Model {
  #[sea_orm(primary_key, auto_increment = false)]
  pub sched_name: String,
  #[sea_orm(primary_key, auto_increment = false)]
  pub trigger_group: String,
  #[sea_orm(primary_key, auto_increment = false)]
  pub trigger_name: String,
  pub job_group: String,
  pub job_name: String,
  pub description: Option<String>,
  /// 毫秒 ticks；无下一次触发时为空
  /// Millisecond ticks; null when the schedule is exhausted
  pub next_fire_time: Option<i64>,
  pub prev_fire_time: Option<i64>,
  pub priority: i32,
  /// `WAITING`/`ACQUIRED`/`EXECUTING`/…
  pub trigger_state: String,
  /// `SIMPLE`/`CRON`/`CAL_INT`/`DAILY_I`/`CUSTOM_CAL`/`BLOB`
  pub trigger_type: String,
  pub start_time: i64,
  pub end_time: Option<i64>,
  pub calendar_name: Option<String>,
  /// misfire 策略的序列化形式
  /// Serialized misfire policy
  pub misfire_instr: Option<String>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
