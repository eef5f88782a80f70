//! 作业存储模块
//! Job store module
//!
//! 定义了与存储后端交互的抽象层。同一接口之下有两个实现：内存存储
//! （`memdb::RamJobStore`）与带集群锁的关系型存储
//! （`backend::dbstore::DatabaseJobStore`）。每个实现都必须能承受
//! 单实例并发访问；持久化实现还要承受多个集群实例的并发访问。
//! Defines the abstraction layer for interacting with storage backends.
//! Two implementations sit behind one interface: the in-memory store
//! (`memdb::RamJobStore`) and the relational store with cluster locks
//! (`backend::dbstore::DatabaseJobStore`). Every implementation must be
//! safe under concurrent access from one scheduler instance; the
//! persistent one also under concurrent access from multiple cluster
//! instances.

use crate::calendar::CalendarVariant;
use crate::error::Result;
use crate::job::JobDetail;
use crate::key::{JobKey, TriggerKey};
use crate::triggers::Trigger;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// 触发器在存储中的状态
/// Store-side trigger state
///
/// `WAITING → ACQUIRED → EXECUTING → {WAITING | COMPLETE}`；
/// `PAUSED`、`BLOCKED`、`ERROR`、`PAUSED_BLOCKED` 为正交状态。
/// 状态迁移只由存储在锁内完成。
/// `WAITING → ACQUIRED → EXECUTING → {WAITING | COMPLETE}`;
/// `PAUSED`, `BLOCKED`, `ERROR`, `PAUSED_BLOCKED` are orthogonal.
/// Transitions are made only by the store under a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerStoreState {
  #[serde(rename = "WAITING")]
  Waiting,
  #[serde(rename = "ACQUIRED")]
  Acquired,
  #[serde(rename = "EXECUTING")]
  Executing,
  #[serde(rename = "COMPLETE")]
  Complete,
  #[serde(rename = "PAUSED")]
  Paused,
  #[serde(rename = "BLOCKED")]
  Blocked,
  #[serde(rename = "PAUSED_BLOCKED")]
  PausedBlocked,
  #[serde(rename = "ERROR")]
  Error,
  /// 触发器不存在
  /// The trigger does not exist
  #[serde(rename = "NONE")]
  None,
}

impl TriggerStoreState {
  /// 持久化字符串
  /// Persistence string
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Waiting => "WAITING",
      Self::Acquired => "ACQUIRED",
      Self::Executing => "EXECUTING",
      Self::Complete => "COMPLETE",
      Self::Paused => "PAUSED",
      Self::Blocked => "BLOCKED",
      Self::PausedBlocked => "PAUSED_BLOCKED",
      Self::Error => "ERROR",
      Self::None => "NONE",
    }
  }

  /// 从持久化字符串解析
  /// Parse from the persistence string
  pub fn parse(s: &str) -> Self {
    match s {
      "WAITING" => Self::Waiting,
      "ACQUIRED" => Self::Acquired,
      "EXECUTING" => Self::Executing,
      "COMPLETE" => Self::Complete,
      "PAUSED" => Self::Paused,
      "BLOCKED" => Self::Blocked,
      "PAUSED_BLOCKED" => Self::PausedBlocked,
      "ERROR" => Self::Error,
      _ => Self::None,
    }
  }
}

/// 执行完成后应用到触发器的指令
/// Instruction applied to the trigger after execution completes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletedExecutionInstruction {
  /// 无指令：正常推进
  /// No instruction: advance normally
  NoInstruction,
  /// 删除触发器
  /// Delete the trigger
  DeleteTrigger,
  /// 将触发器置为完成
  /// Set the trigger complete
  SetTriggerComplete,
  /// 将触发器置为错误
  /// Set the trigger to error
  SetTriggerError,
  /// 将作业的全部触发器置为错误
  /// Set all the job's triggers to error
  SetAllJobTriggersError,
  /// 将作业的全部触发器置为完成
  /// Set all the job's triggers complete
  SetAllJobTriggersComplete,
}

/// 已获取的触发器
/// An acquired trigger
///
/// `fire_instance_id` 标识本次触发对应的 `FiredTrigger` 记录。
/// `fire_instance_id` identifies the `FiredTrigger` record of this firing.
#[derive(Debug, Clone)]
pub struct AcquiredTrigger {
  pub trigger: Trigger,
  pub fire_instance_id: String,
}

/// 一次成功触发交付给执行管线的数据
/// Data a successful firing hands to the execution pipeline
#[derive(Debug, Clone)]
pub struct TriggerFiredBundle {
  pub trigger: Trigger,
  pub job: JobDetail,
  pub calendar: Option<CalendarVariant>,
  pub fire_instance_id: String,
  /// 实际触发时刻
  /// Actual fire instant
  pub fire_time: DateTime<Utc>,
  /// 计划触发时刻
  /// Scheduled fire instant
  pub scheduled_fire_time: DateTime<Utc>,
  pub previous_fire_time: Option<DateTime<Utc>>,
  pub next_fire_time: Option<DateTime<Utc>>,
  /// 是否恢复执行
  /// Whether this is a recovery run
  pub recovering: bool,
}

/// `triggers_fired` 的单项结果
/// Per-trigger result of `triggers_fired`
#[derive(Debug, Clone)]
pub enum TriggerFiredResult {
  /// 成功触发
  /// Fired successfully
  Fired(Box<TriggerFiredBundle>),
  /// 被跳过（例如确认时已不在 `ACQUIRED` 状态）
  /// Skipped (e.g. no longer `ACQUIRED` at confirmation time)
  Skipped {
    trigger_key: TriggerKey,
    reason: String,
  },
}

/// misfire 扫描的结果
/// Outcome of a misfire scan
#[derive(Debug, Clone, Default)]
pub struct MisfireOutcome {
  /// 本批处理的触发器数
  /// Triggers handled in this batch
  pub handled: usize,
  /// 本批处理的触发器键（用于监听器通知）
  /// Keys of the triggers handled in this batch (for listener
  /// notification)
  pub handled_triggers: Vec<TriggerKey>,
  /// 批已满，仍有未处理的 misfire，应立即再跑一轮
  /// Batch was full and more misfires remain; run again immediately
  pub has_more: bool,
  /// 处理后最早的新触发时刻
  /// Earliest new fire instant after handling
  pub earliest_new_time: Option<DateTime<Utc>>,
}

/// 集群检查与接管的结果
/// Outcome of a cluster check-in and takeover pass
#[derive(Debug, Clone, Default)]
pub struct ClusterRecoveryOutcome {
  /// 检测到的失效实例
  /// Failed instances detected
  pub failed_instances: Vec<String>,
  /// 复位回 `WAITING` 的触发器数
  /// Triggers restored to `WAITING`
  pub recovered_triggers: usize,
  /// 新调度的一次性恢复触发器数
  /// One-shot recovery triggers scheduled
  pub recovery_triggers_scheduled: usize,
}

/// 作业存储特性
/// Job store trait
///
/// 返回给调用方的触发器与作业都是克隆；规范副本归存储所有。
/// Triggers and jobs returned to callers are clones; the store owns the
/// canonical copies.
#[async_trait]
pub trait JobStore: Send + Sync {
  /// 存储名（日志用）
  /// Store name (for logging)
  fn name(&self) -> &str;

  /// 是否支持集群
  /// Whether clustering is supported
  fn clustered(&self) -> bool {
    false
  }

  /// 原子存储作业与首个触发器
  /// Atomically store a job with its first trigger
  async fn store_job_and_trigger(&self, job: JobDetail, trigger: Trigger) -> Result<()>;

  /// 存储作业
  /// Store a job
  async fn store_job(&self, job: JobDetail, replace_existing: bool) -> Result<()>;

  /// 存储触发器；引用的作业必须已存在
  /// Store a trigger; the referenced job must exist
  async fn store_trigger(&self, trigger: Trigger, replace_existing: bool) -> Result<()>;

  /// 移除作业及其全部触发器
  /// Remove a job and all of its triggers
  async fn remove_job(&self, key: &JobKey) -> Result<bool>;

  /// 移除触发器；作业非持久且无其他触发器时一并移除
  /// Remove a trigger; a non-durable job with no other triggers is
  /// removed along with it
  async fn remove_trigger(&self, key: &TriggerKey) -> Result<bool>;

  /// 以新触发器替换旧触发器，保持作业链接
  /// Replace a trigger with a new one, keeping the job linkage
  async fn replace_trigger(&self, key: &TriggerKey, new_trigger: Trigger) -> Result<bool>;

  /// 读取作业
  /// Retrieve a job
  async fn retrieve_job(&self, key: &JobKey) -> Result<Option<JobDetail>>;

  /// 读取触发器
  /// Retrieve a trigger
  async fn retrieve_trigger(&self, key: &TriggerKey) -> Result<Option<Trigger>>;

  /// 作业是否存在
  /// Whether the job exists
  async fn check_job_exists(&self, key: &JobKey) -> Result<bool>;

  /// 触发器是否存在
  /// Whether the trigger exists
  async fn check_trigger_exists(&self, key: &TriggerKey) -> Result<bool>;

  /// 清空全部调度数据
  /// Clear all scheduling data
  async fn clear_all_scheduling_data(&self) -> Result<()>;

  /// 存储日历
  /// Store a calendar
  ///
  /// `update_triggers` 置位时重算所有引用触发器的 `next_fire_time`，
  /// 使其满足新谓词。
  /// With `update_triggers` set, `next_fire_time` of every referencing
  /// trigger is recomputed to satisfy the new predicate.
  async fn store_calendar(
    &self,
    name: &str,
    calendar: CalendarVariant,
    replace_existing: bool,
    update_triggers: bool,
  ) -> Result<()>;

  /// 移除日历；仍被触发器引用时报错
  /// Remove a calendar; errors while triggers still reference it
  async fn remove_calendar(&self, name: &str) -> Result<bool>;

  /// 读取日历
  /// Retrieve a calendar
  async fn retrieve_calendar(&self, name: &str) -> Result<Option<CalendarVariant>>;

  /// 日历是否存在
  /// Whether the calendar exists
  async fn calendar_exists(&self, name: &str) -> Result<bool>;

  /// 全部日历名
  /// All calendar names
  async fn get_calendar_names(&self) -> Result<Vec<String>>;

  /// 某分组下的作业键
  /// Job keys in a group
  async fn get_job_keys(&self, group: &str) -> Result<Vec<JobKey>>;

  /// 某分组下的触发器键
  /// Trigger keys in a group
  async fn get_trigger_keys(&self, group: &str) -> Result<Vec<TriggerKey>>;

  /// 全部作业分组名
  /// All job group names
  async fn get_job_group_names(&self) -> Result<Vec<String>>;

  /// 全部触发器分组名
  /// All trigger group names
  async fn get_trigger_group_names(&self) -> Result<Vec<String>>;

  /// 作业的全部触发器
  /// All triggers of a job
  async fn get_triggers_for_job(&self, key: &JobKey) -> Result<Vec<Trigger>>;

  /// 触发器当前状态
  /// Current state of a trigger
  async fn get_trigger_state(&self, key: &TriggerKey) -> Result<TriggerStoreState>;

  /// 暂停触发器
  /// Pause a trigger
  async fn pause_trigger(&self, key: &TriggerKey) -> Result<()>;

  /// 暂停分组内全部触发器，返回受影响的分组
  /// Pause all triggers in a group, returns the affected groups
  async fn pause_trigger_group(&self, group: &str) -> Result<Vec<String>>;

  /// 暂停作业（其全部触发器）
  /// Pause a job (all of its triggers)
  async fn pause_job(&self, key: &JobKey) -> Result<()>;

  /// 暂停分组内全部作业
  /// Pause all jobs in a group
  async fn pause_job_group(&self, group: &str) -> Result<Vec<String>>;

  /// 恢复触发器；错过阈值的按 misfire 策略处理
  /// Resume a trigger; ones past the threshold get misfire treatment
  async fn resume_trigger(&self, key: &TriggerKey) -> Result<()>;

  /// 恢复分组内全部触发器
  /// Resume all triggers in a group
  async fn resume_trigger_group(&self, group: &str) -> Result<Vec<String>>;

  /// 恢复作业
  /// Resume a job
  async fn resume_job(&self, key: &JobKey) -> Result<()>;

  /// 恢复分组内全部作业
  /// Resume all jobs in a group
  async fn resume_job_group(&self, group: &str) -> Result<Vec<String>>;

  /// 暂停一切
  /// Pause everything
  async fn pause_all(&self) -> Result<()>;

  /// 恢复一切
  /// Resume everything
  async fn resume_all(&self) -> Result<()>;

  /// 被暂停的触发器分组
  /// Paused trigger groups
  async fn get_paused_trigger_groups(&self) -> Result<Vec<String>>;

  /// 获取下一批可触发的触发器
  /// Acquire the next batch of fireable triggers
  ///
  /// 原子地把至多 `max_count` 个 `next_fire_time ≤ no_later_than +
  /// time_window` 的触发器从 `WAITING` 迁移到 `ACQUIRED`，跳过暂停与
  /// 阻塞者，按 `(next_fire_time ASC, priority DESC)` 排序，并写入
  /// `FiredTrigger` 记录。
  /// Atomically transitions up to `max_count` triggers whose
  /// `next_fire_time ≤ no_later_than + time_window` from `WAITING` to
  /// `ACQUIRED`, skipping paused/blocked ones, ordered by
  /// `(next_fire_time ASC, priority DESC)`, writing `FiredTrigger`
  /// records.
  async fn acquire_next_triggers(
    &self,
    no_later_than: DateTime<Utc>,
    max_count: usize,
    time_window: Duration,
  ) -> Result<Vec<AcquiredTrigger>>;

  /// 释放已获取但未触发的触发器
  /// Release an acquired but unfired trigger
  async fn release_acquired_trigger(&self, acquired: &AcquiredTrigger) -> Result<()>;

  /// 确认触发
  /// Confirm firing
  ///
  /// 对每个触发器在集群锁内：确认仍为 `ACQUIRED`，推进到
  /// `EXECUTING`（末次触发则 `COMPLETE`），更新前后触发时刻；作业
  /// 禁止并发时把兄弟触发器标记为 `BLOCKED`。
  /// For each trigger, under the cluster lock: confirm it is still
  /// `ACQUIRED`, advance to `EXECUTING` (`COMPLETE` on the last fire),
  /// update previous/next fire instants; when the job disallows
  /// concurrency, mark sibling triggers `BLOCKED`.
  async fn triggers_fired(&self, acquired: &[AcquiredTrigger]) -> Result<Vec<TriggerFiredResult>>;

  /// 执行完成回写
  /// Post-execution write-back
  ///
  /// 应用完成指令，作业禁止并发时解除兄弟触发器的阻塞，
  /// `persist_job_data_after_execution` 置位时原子持久化（可能被修改
  /// 的）数据映射，并删除 `FiredTrigger` 记录。
  /// Applies the completion instruction, unblocks sibling triggers for
  /// concurrency-disallowed jobs, atomically persists the (possibly
  /// mutated) data map when `persist_job_data_after_execution` is set,
  /// and removes the `FiredTrigger` record.
  async fn triggered_job_complete(
    &self,
    bundle: &TriggerFiredBundle,
    job: &JobDetail,
    instruction: CompletedExecutionInstruction,
  ) -> Result<()>;

  /// misfire 扫描
  /// Misfire scan
  ///
  /// 以有界批次装载 misfire 的触发器，逐个调用
  /// `update_after_misfire` 并写回；批满时 `has_more` 置位。
  /// Loads misfired triggers in bounded batches, invokes
  /// `update_after_misfire` on each and writes them back; `has_more` is
  /// set when the batch was full.
  async fn handle_misfires(&self, max_count: usize) -> Result<MisfireOutcome>;

  /// 集群检查与失效实例接管；非集群存储为空操作
  /// Cluster check-in and failed-instance takeover; a no-op for
  /// non-clustered stores
  async fn cluster_checkin(&self) -> Result<ClusterRecoveryOutcome> {
    Ok(ClusterRecoveryOutcome::default())
  }

  /// 本实例正在执行的触发次数（用于优雅关闭）
  /// Number of firings executing on this instance (for graceful shutdown)
  async fn number_of_executing_triggers(&self) -> Result<usize> {
    Ok(0)
  }
}
