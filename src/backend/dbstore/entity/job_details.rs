//! 作业描述符实体
//! Job detail entity

use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "qrtz_job_details")]
pub struct Model {
  #[sea_orm(primary_key, auto_increment = false)]
  pub sched_name: String,
  #[sea_orm(primary_key, auto_increment = false)]
  pub job_group: String,
  #[sea_orm(primary_key, auto_increment = false)]
  pub job_name: String,
  pub description: Option<String>,
  pub job_type: String,
  pub is_durable: bool,
  pub is_nonconcurrent: bool,
  pub is_update_data: bool,
  pub requests_recovery: bool,
  /// 数据映射的 JSON 文本
  /// JSON text of the data map
  #[sea_orm(column_type = "Text", nullable)]
  pub job_data: Option<String>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
