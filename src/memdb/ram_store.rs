//! 内存作业存储实现
//! In-memory job store implementation
//!
//! 使用内存数据结构实现作业与触发器的存储和管理：等待中的触发器
//! 放在按 `(触发时刻, 优先级, 插入序)` 排序的索引里，获取操作按序
//! 弹出。
//! Implements job and trigger storage and management with in-memory
//! data structures: waiting triggers sit in an index ordered by
//! `(fire instant, priority, insertion sequence)` and acquisition pops
//! in order.

use crate::calendar::CalendarVariant;
use crate::job::JobDetail;
use crate::key::{JobKey, TriggerKey};
use crate::store::TriggerStoreState;
use crate::time::{SharedClock, TimeProvider};
use crate::triggers::Trigger;
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::RwLock;

/// 默认 misfire 阈值
/// Default misfire threshold
pub(crate) const DEFAULT_MISFIRE_THRESHOLD_MILLIS: i64 = 60_000;

/// 时间索引键：触发时刻升序、优先级降序、插入序升序
/// Time index key: fire instant ascending, priority descending,
/// insertion sequence ascending
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct TimeIndexKey {
  pub fire_millis: i64,
  /// 取负后排序即优先级降序
  /// Negated so ordering puts higher priority first
  pub negated_priority: i64,
  pub sequence: u64,
}

impl TimeIndexKey {
  pub fn new(fire_time: DateTime<Utc>, priority: i32, sequence: u64) -> Self {
    Self {
      fire_millis: fire_time.timestamp_millis(),
      negated_priority: -(priority as i64),
      sequence,
    }
  }
}

/// 存储中的触发器及其状态
/// A stored trigger with its state
#[derive(Debug, Clone)]
pub(crate) struct StoredTrigger {
  pub trigger: Trigger,
  pub state: TriggerStoreState,
  /// 触发器在时间索引中的位置
  /// Position of the trigger in the time index
  pub index_key: Option<TimeIndexKey>,
}

/// 本实例的触发记录
/// A firing record of this instance
#[derive(Debug, Clone)]
pub(crate) struct FiredRecord {
  pub trigger_key: TriggerKey,
  pub job_key: JobKey,
  pub scheduled_time: DateTime<Utc>,
  pub concurrent_execution_disallowed: bool,
}

/// 内存存储体
/// In-memory storage body
#[derive(Default)]
pub(crate) struct RamStorage {
  pub jobs: HashMap<JobKey, JobDetail>,
  pub triggers: HashMap<TriggerKey, StoredTrigger>,
  /// 等待中的触发器索引
  /// Index of waiting triggers
  pub time_index: BTreeMap<TimeIndexKey, TriggerKey>,
  pub calendars: HashMap<String, CalendarVariant>,
  pub paused_trigger_groups: HashSet<String>,
  pub paused_job_groups: HashSet<String>,
  /// 禁止并发的作业中正在执行的那些
  /// Concurrency-disallowed jobs currently executing
  pub blocked_jobs: HashSet<JobKey>,
  /// fire_instance_id → 触发记录
  /// fire_instance_id → firing record
  pub fired: HashMap<String, FiredRecord>,
  pub sequence: u64,
  pub fired_sequence: u64,
}

impl RamStorage {
  pub fn next_sequence(&mut self) -> u64 {
    self.sequence += 1;
    self.sequence
  }

  pub fn next_fire_instance_id(&mut self) -> String {
    self.fired_sequence += 1;
    format!("MEM{:016}", self.fired_sequence)
  }

  /// 把触发器放入时间索引（仅 `WAITING` 且有下一触发时刻者）
  /// Put a trigger into the time index (only `WAITING` ones with a next
  /// fire instant)
  pub fn index_trigger(&mut self, key: &TriggerKey) {
    let sequence = self.next_sequence();
    if let Some(stored) = self.triggers.get_mut(key) {
      if stored.state == TriggerStoreState::Waiting {
        if let Some(next) = stored.trigger.next_fire_time() {
          let index_key = TimeIndexKey::new(next, stored.trigger.priority(), sequence);
          stored.index_key = Some(index_key);
          self.time_index.insert(index_key, key.clone());
          return;
        }
      }
      stored.index_key = None;
    }
  }

  /// 从时间索引移除
  /// Remove from the time index
  pub fn unindex_trigger(&mut self, key: &TriggerKey) {
    if let Some(stored) = self.triggers.get_mut(key) {
      if let Some(index_key) = stored.index_key.take() {
        self.time_index.remove(&index_key);
      }
    }
  }

  /// 迁移触发器状态并维护索引
  /// Transition a trigger's state and maintain the index
  pub fn set_trigger_state(&mut self, key: &TriggerKey, state: TriggerStoreState) {
    self.unindex_trigger(key);
    if let Some(stored) = self.triggers.get_mut(key) {
      stored.state = state;
    }
    if state == TriggerStoreState::Waiting {
      self.index_trigger(key);
    }
  }

  /// 作业的全部触发器键
  /// All trigger keys of a job
  pub fn trigger_keys_for_job(&self, job_key: &JobKey) -> Vec<TriggerKey> {
    self
      .triggers
      .values()
      .filter(|stored| stored.trigger.job_key() == job_key)
      .map(|stored| stored.trigger.key().clone())
      .collect()
  }

  /// 新存触发器的初始状态
  /// Initial state for a newly stored trigger
  pub fn initial_state(&self, trigger: &Trigger) -> TriggerStoreState {
    let group_paused = self.paused_trigger_groups.contains(&trigger.key().group)
      || self.paused_job_groups.contains(&trigger.job_key().group);
    let blocked = self.blocked_jobs.contains(trigger.job_key());
    match (group_paused, blocked) {
      (true, true) => TriggerStoreState::PausedBlocked,
      (true, false) => TriggerStoreState::Paused,
      (false, true) => TriggerStoreState::Blocked,
      (false, false) => TriggerStoreState::Waiting,
    }
  }
}

/// 内存作业存储
/// In-memory job store
///
/// 单实例语义：所有操作在一把异步读写锁内完成，对外等价于持久化
/// 存储的锁内事务。
/// Single-instance semantics: every operation runs inside one async
/// RwLock, externally equivalent to the persistent store's in-lock
/// transactions.
pub struct RamJobStore {
  pub(crate) name: String,
  pub(crate) storage: RwLock<RamStorage>,
  pub(crate) clock: SharedClock,
  pub(crate) misfire_threshold: Duration,
}

impl RamJobStore {
  /// 以系统时钟创建
  /// Create with the system clock
  pub fn new() -> Self {
    Self::with_clock(crate::time::system_clock())
  }

  /// 以指定时钟创建
  /// Create with the given clock
  pub fn with_clock(clock: SharedClock) -> Self {
    Self {
      name: "RamJobStore".to_string(),
      storage: RwLock::new(RamStorage::default()),
      clock,
      misfire_threshold: Duration::milliseconds(DEFAULT_MISFIRE_THRESHOLD_MILLIS),
    }
  }

  /// 设置 misfire 阈值
  /// Set the misfire threshold
  pub fn with_misfire_threshold(mut self, threshold: Duration) -> Self {
    self.misfire_threshold = threshold;
    self
  }

  pub(crate) fn now(&self) -> DateTime<Utc> {
    self.clock.now()
  }
}

impl Default for RamJobStore {
  fn default() -> Self {
    Self::new()
  }
}
