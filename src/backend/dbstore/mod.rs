//! 持久化作业存储
//! Persistent job store
//!
//! 基于共享关系型数据库实现作业存储与集群协调。所有变更操作都在
//! 命名行锁内的事务中完成：锁持有之后才开启写事务，提交即释放锁。
//! Implements job storage and cluster coordination on a shared
//! relational database. Every mutating operation runs in a transaction
//! under a named row lock: the write transaction opens after the lock is
//! held and the commit releases it.

pub mod entity;

mod delegate;
mod locks;
mod store;

pub use locks::{LOCK_STATE_ACCESS, LOCK_TRIGGER_ACCESS};

use crate::error::Result;
use crate::time::{SharedClock, TimeProvider};
use chrono::{DateTime, Duration, Utc};
use entity::{
  BlobTriggers, Calendars, CronTriggers, FiredTriggers, JobDetails, Locks, PausedTriggerGrps,
  SchedulerState, SimpleTriggers, SimpropTriggers, Triggers,
};
use locks::LockStrategy;
use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseBackend, DatabaseConnection, Schema};
use std::sync::atomic::{AtomicU64, Ordering};

/// 默认 misfire 阈值（毫秒）
/// Default misfire threshold (milliseconds)
pub const DEFAULT_MISFIRE_THRESHOLD_MILLIS: i64 = 60_000;

/// 默认集群检查间隔（毫秒）
/// Default cluster check-in interval (milliseconds)
pub const DEFAULT_CLUSTER_CHECKIN_INTERVAL_MILLIS: i64 = 7_500;

/// 恢复触发器所在的分组
/// Group that recovery triggers are created in
pub const RECOVERING_TRIGGER_GROUP: &str = "RECOVERING_JOBS";

/// 持久化作业存储
/// Persistent job store
pub struct DatabaseJobStore {
  pub(crate) name: String,
  pub(crate) db: DatabaseConnection,
  /// 集群内共享的调度器名
  /// Scheduler name shared across the cluster
  pub(crate) sched_name: String,
  /// 本实例标识
  /// This instance's identity
  pub(crate) instance_id: String,
  pub(crate) clock: SharedClock,
  pub(crate) misfire_threshold: Duration,
  pub(crate) cluster_checkin_interval: Duration,
  pub(crate) is_clustered: bool,
  pub(crate) lock_strategy: LockStrategy,
  fired_counter: AtomicU64,
}

impl DatabaseJobStore {
  /// 连接数据库并初始化 schema
  /// Connect to the database and initialize the schema
  pub async fn connect(
    database_url: &str,
    sched_name: &str,
    instance_id: &str,
    clustered: bool,
  ) -> Result<Self> {
    let options = ConnectOptions::new(database_url).max_connections(10).to_owned();
    let db = Database::connect(options).await?;
    let store = Self::from_connection(db, sched_name, instance_id, clustered);
    store.init_schema().await?;
    Ok(store)
  }

  /// 从现有连接创建
  /// Create from an existing connection
  pub fn from_connection(
    db: DatabaseConnection,
    sched_name: &str,
    instance_id: &str,
    clustered: bool,
  ) -> Self {
    let lock_strategy = match db.get_database_backend() {
      // SQLite 没有 `SELECT … FOR UPDATE`，用单行 UPDATE 取得所有权
      // SQLite has no `SELECT … FOR UPDATE`; a single-row UPDATE takes
      // ownership instead
      DatabaseBackend::Sqlite => LockStrategy::UpdateRow,
      _ => LockStrategy::SelectForUpdate,
    };
    Self {
      name: "DatabaseJobStore".to_string(),
      db,
      sched_name: sched_name.to_string(),
      instance_id: instance_id.to_string(),
      clock: crate::time::system_clock(),
      misfire_threshold: Duration::milliseconds(DEFAULT_MISFIRE_THRESHOLD_MILLIS),
      cluster_checkin_interval: Duration::milliseconds(DEFAULT_CLUSTER_CHECKIN_INTERVAL_MILLIS),
      is_clustered: clustered,
      lock_strategy,
      fired_counter: AtomicU64::new(1),
    }
  }

  /// 注入时钟（测试用）
  /// Inject a clock (for tests)
  pub fn with_clock(mut self, clock: SharedClock) -> Self {
    self.clock = clock;
    self
  }

  /// 设置 misfire 阈值
  /// Set the misfire threshold
  pub fn with_misfire_threshold(mut self, threshold: Duration) -> Self {
    self.misfire_threshold = threshold;
    self
  }

  /// 设置集群检查间隔
  /// Set the cluster check-in interval
  pub fn with_cluster_checkin_interval(mut self, interval: Duration) -> Self {
    self.cluster_checkin_interval = interval;
    self
  }

  pub(crate) fn now(&self) -> DateTime<Utc> {
    self.clock.now()
  }

  /// 生成触发记录标识
  /// Generate a firing record id
  pub(crate) fn next_fire_instance_id(&self) -> String {
    let n = self.fired_counter.fetch_add(1, Ordering::Relaxed);
    format!("{}{}", self.instance_id, n)
  }

  /// 初始化数据库 schema
  /// Initialize the database schema
  pub async fn init_schema(&self) -> Result<()> {
    let backend = self.db.get_database_backend();
    let schema = Schema::new(backend);

    let stmt = schema.create_table_from_entity(JobDetails);
    let _ = self.db.execute(backend.build(&stmt)).await;
    let stmt = schema.create_table_from_entity(Triggers);
    let _ = self.db.execute(backend.build(&stmt)).await;
    let stmt = schema.create_table_from_entity(SimpleTriggers);
    let _ = self.db.execute(backend.build(&stmt)).await;
    let stmt = schema.create_table_from_entity(CronTriggers);
    let _ = self.db.execute(backend.build(&stmt)).await;
    let stmt = schema.create_table_from_entity(SimpropTriggers);
    let _ = self.db.execute(backend.build(&stmt)).await;
    let stmt = schema.create_table_from_entity(BlobTriggers);
    let _ = self.db.execute(backend.build(&stmt)).await;
    let stmt = schema.create_table_from_entity(Calendars);
    let _ = self.db.execute(backend.build(&stmt)).await;
    let stmt = schema.create_table_from_entity(PausedTriggerGrps);
    let _ = self.db.execute(backend.build(&stmt)).await;
    let stmt = schema.create_table_from_entity(FiredTriggers);
    let _ = self.db.execute(backend.build(&stmt)).await;
    let stmt = schema.create_table_from_entity(SchedulerState);
    let _ = self.db.execute(backend.build(&stmt)).await;
    let stmt = schema.create_table_from_entity(Locks);
    let _ = self.db.execute(backend.build(&stmt)).await;

    // 索引与子类型表外键；不支持的方言上静默失败（删除路径也会
    // 显式清理子表）
    // Indexes and subtype-table foreign keys; silently skipped on
    // dialects that do not support them (the delete paths also clean up
    // subtype tables explicitly)
    let ddl = r#"
      CREATE INDEX IF NOT EXISTS idx_qrtz_t_next_fire_time ON qrtz_triggers(sched_name, trigger_state, next_fire_time);
      CREATE INDEX IF NOT EXISTS idx_qrtz_t_job ON qrtz_triggers(sched_name, job_group, job_name);
      CREATE INDEX IF NOT EXISTS idx_qrtz_ft_instance ON qrtz_fired_triggers(sched_name, instance_name);
      CREATE INDEX IF NOT EXISTS idx_qrtz_ft_trigger ON qrtz_fired_triggers(sched_name, trigger_group, trigger_name);
      ALTER TABLE qrtz_simple_triggers ADD CONSTRAINT fk_qrtz_simple_triggers FOREIGN KEY (sched_name, trigger_group, trigger_name) REFERENCES qrtz_triggers(sched_name, trigger_group, trigger_name) ON DELETE CASCADE;
      ALTER TABLE qrtz_cron_triggers ADD CONSTRAINT fk_qrtz_cron_triggers FOREIGN KEY (sched_name, trigger_group, trigger_name) REFERENCES qrtz_triggers(sched_name, trigger_group, trigger_name) ON DELETE CASCADE;
      ALTER TABLE qrtz_simprop_triggers ADD CONSTRAINT fk_qrtz_simprop_triggers FOREIGN KEY (sched_name, trigger_group, trigger_name) REFERENCES qrtz_triggers(sched_name, trigger_group, trigger_name) ON DELETE CASCADE;
      ALTER TABLE qrtz_blob_triggers ADD CONSTRAINT fk_qrtz_blob_triggers FOREIGN KEY (sched_name, trigger_group, trigger_name) REFERENCES qrtz_triggers(sched_name, trigger_group, trigger_name) ON DELETE CASCADE;
    "#;
    for statement in ddl.split(';').map(str::trim).filter(|s| !s.is_empty()) {
      let _ = self
        .db
        .execute(sea_orm::Statement::from_string(backend, statement))
        .await;
    }

    Ok(())
  }
}
