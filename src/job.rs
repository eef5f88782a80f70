//! 作业模块
//! Job module
//!
//! 定义了作业相关的数据结构：作业特性、作业描述符、数据映射、
//! 执行上下文以及按类型名实例化作业的注册表。
//! Defines job-related data structures: the job trait, job descriptor,
//! data map, execution context, and the registry that instantiates jobs
//! by type name.

use crate::calendar::CalendarVariant;
use crate::error::{Result, SchedulerError};
use crate::key::{JobKey, DEFAULT_GROUP};
use crate::triggers::Trigger;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// 恢复触发器写入作业数据映射的键：原触发器 "group.name"
/// Key the recovery path writes into the job data map: original trigger "group.name"
pub const RECOVERING_JOB_KEY: &str = "quartz.recovering.job";
/// 恢复触发器写入作业数据映射的键：原触发时刻（毫秒）
/// Key the recovery path writes into the job data map: original fired-time millis
pub const RECOVERING_FIRE_TIME_KEY: &str = "quartz.recovering.fire_time";

/// 作业数据映射
/// Job data map
///
/// 可变负载映射，随 `JobDetail` 持久化。当作业的
/// `persist_job_data_after_execution` 置位时，执行期间的变更在
/// `triggered_job_complete` 中原子写回；否则作业收到的是快照。
/// Mutable payload map persisted with the `JobDetail`. When the job's
/// `persist_job_data_after_execution` flag is set, mutations made during
/// execution are written back atomically in `triggered_job_complete`;
/// otherwise the job receives a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobDataMap {
  entries: HashMap<String, Value>,
}

impl JobDataMap {
  /// 创建空映射
  /// Create an empty map
  pub fn new() -> Self {
    Self::default()
  }

  /// 写入一个值
  /// Put a value
  pub fn put<K: Into<String>, V: Into<Value>>(&mut self, key: K, value: V) {
    self.entries.insert(key.into(), value.into());
  }

  /// 读取原始值
  /// Get the raw value
  pub fn get(&self, key: &str) -> Option<&Value> {
    self.entries.get(key)
  }

  /// 读取字符串值
  /// Get a string value
  pub fn get_str(&self, key: &str) -> Option<&str> {
    self.entries.get(key).and_then(Value::as_str)
  }

  /// 读取整数值
  /// Get an integer value
  pub fn get_i64(&self, key: &str) -> Option<i64> {
    self.entries.get(key).and_then(Value::as_i64)
  }

  /// 读取布尔值
  /// Get a boolean value
  pub fn get_bool(&self, key: &str) -> Option<bool> {
    self.entries.get(key).and_then(Value::as_bool)
  }

  /// 移除一个键
  /// Remove a key
  pub fn remove(&mut self, key: &str) -> Option<Value> {
    self.entries.remove(key)
  }

  /// 合并另一映射，右侧覆盖
  /// Merge another map, right side wins
  pub fn merge(&mut self, other: &JobDataMap) {
    for (k, v) in &other.entries {
      self.entries.insert(k.clone(), v.clone());
    }
  }

  /// 是否为空
  /// Whether the map is empty
  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  /// 条目数
  /// Number of entries
  pub fn len(&self) -> usize {
    self.entries.len()
  }

  /// 迭代条目
  /// Iterate over entries
  pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
    self.entries.iter()
  }
}

/// 作业描述符
/// Job descriptor
///
/// 描述作业类型及其初始数据；由用户创建，只能通过存储 API 变更。
/// Describes a job type and its initial data; created by the user and
/// mutated only via store APIs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDetail {
  /// 作业键
  /// Job key
  pub key: JobKey,
  /// 注册表中解析的作业类型名
  /// Job type name resolved through the registry
  pub job_type: String,
  /// 描述
  /// Description
  pub description: Option<String>,
  /// 即使没有触发器引用也保留
  /// Kept even when no trigger references it
  pub durable: bool,
  /// 禁止同一作业并发执行
  /// Disallow concurrent execution of this job
  pub concurrent_execution_disallowed: bool,
  /// 执行后持久化（可能被修改的）数据映射
  /// Persist the (possibly mutated) data map after execution
  pub persist_job_data_after_execution: bool,
  /// 实例崩溃后请求恢复执行
  /// Request re-execution after an instance crash
  pub request_recovery: bool,
  /// 数据映射
  /// Data map
  pub job_data: JobDataMap,
}

impl JobDetail {
  /// 进入构建器 DSL：`JobDetail::builder().of_type(..).with_identity(..).build()`
  /// Enter the builder DSL: `JobDetail::builder().of_type(..).with_identity(..).build()`
  pub fn builder() -> JobDetailBuilder {
    JobDetailBuilder::default()
  }
}

/// 作业构建器
/// Job builder
#[derive(Debug, Default)]
pub struct JobDetailBuilder {
  key: Option<JobKey>,
  job_type: Option<String>,
  description: Option<String>,
  durable: bool,
  concurrent_execution_disallowed: bool,
  persist_job_data_after_execution: bool,
  request_recovery: bool,
  job_data: JobDataMap,
}

impl JobDetailBuilder {
  /// 设置作业类型名
  /// Set the job type name
  pub fn of_type<S: Into<String>>(mut self, job_type: S) -> Self {
    self.job_type = Some(job_type.into());
    self
  }

  /// 设置标识
  /// Set the identity
  pub fn with_identity<N: Into<String>, G: Into<String>>(mut self, name: N, group: G) -> Self {
    self.key = Some(JobKey::new(name, group));
    self
  }

  /// 设置描述
  /// Set the description
  pub fn with_description<S: Into<String>>(mut self, description: S) -> Self {
    self.description = Some(description.into());
    self
  }

  /// 标记为持久作业
  /// Mark the job as durable
  pub fn store_durably(mut self) -> Self {
    self.durable = true;
    self
  }

  /// 禁止并发执行
  /// Disallow concurrent execution
  pub fn disallow_concurrent_execution(mut self) -> Self {
    self.concurrent_execution_disallowed = true;
    self
  }

  /// 执行后持久化数据映射
  /// Persist the data map after execution
  pub fn persist_job_data_after_execution(mut self) -> Self {
    self.persist_job_data_after_execution = true;
    self
  }

  /// 崩溃后请求恢复
  /// Request recovery after a crash
  pub fn request_recovery(mut self) -> Self {
    self.request_recovery = true;
    self
  }

  /// 写入一条初始数据
  /// Put one initial data entry
  pub fn using_job_data<K: Into<String>, V: Into<Value>>(mut self, key: K, value: V) -> Self {
    self.job_data.put(key, value);
    self
  }

  /// 构建 `JobDetail`
  /// Build the `JobDetail`
  pub fn build(self) -> Result<JobDetail> {
    let job_type = self
      .job_type
      .ok_or_else(|| SchedulerError::config("job type is required"))?;
    let key = self
      .key
      .unwrap_or_else(|| JobKey::unique(DEFAULT_GROUP));
    Ok(JobDetail {
      key,
      job_type,
      description: self.description,
      durable: self.durable,
      concurrent_execution_disallowed: self.concurrent_execution_disallowed,
      persist_job_data_after_execution: self.persist_job_data_after_execution,
      request_recovery: self.request_recovery,
      job_data: self.job_data,
    })
  }
}

/// 用户作业抛出的执行错误
/// Execution error raised by a user job
///
/// 携带重触发与解除调度标志；该错误绝不会使调度器崩溃，而是经由
/// 监听器与存储的完成路径路由。
/// Carries refire and unschedule flags; this error never crashes the
/// scheduler — it is routed through listeners and the store's
/// completion path.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct JobExecutionError {
  /// 错误消息
  /// Error message
  pub message: String,
  /// 立即重新触发同一触发器
  /// Refire the same trigger immediately
  pub refire_immediately: bool,
  /// 解除当前触发器的调度
  /// Unschedule the firing trigger
  pub unschedule_firing_trigger: bool,
  /// 解除该作业所有触发器的调度
  /// Unschedule all triggers of the job
  pub unschedule_all_triggers: bool,
}

impl JobExecutionError {
  /// 创建普通执行错误
  /// Create a plain execution error
  pub fn new<S: Into<String>>(message: S) -> Self {
    Self {
      message: message.into(),
      refire_immediately: false,
      unschedule_firing_trigger: false,
      unschedule_all_triggers: false,
    }
  }

  /// 要求立即重触发
  /// Request an immediate refire
  pub fn with_refire_immediately(mut self) -> Self {
    self.refire_immediately = true;
    self
  }

  /// 要求解除当前触发器
  /// Request unscheduling of the firing trigger
  pub fn with_unschedule_firing_trigger(mut self) -> Self {
    self.unschedule_firing_trigger = true;
    self
  }

  /// 要求解除作业全部触发器
  /// Request unscheduling of all the job's triggers
  pub fn with_unschedule_all_triggers(mut self) -> Self {
    self.unschedule_all_triggers = true;
    self
  }
}

/// 作业执行上下文
/// Job execution context
///
/// 每次触发构建一个，交给作业执行。上下文持有触发器与作业的克隆，
/// 存储层拥有规范副本。
/// Built once per firing and handed to the job. The context holds clones
/// of the trigger and job; the store owns the canonical copies.
pub struct JobExecutionContext {
  /// 本实例的调度器标识
  /// Scheduler identity of this instance
  pub scheduler_instance_id: String,
  /// 本次触发记录的标识
  /// Identity of this firing record
  pub fire_instance_id: String,
  /// 作业描述符克隆
  /// Clone of the job descriptor
  pub job_detail: JobDetail,
  /// 触发器克隆
  /// Clone of the trigger
  pub trigger: Trigger,
  /// 生效的日历
  /// Effective calendar
  pub calendar: Option<CalendarVariant>,
  /// 合并后的数据映射（并发禁止时为活映射，否则为快照）
  /// Merged data map (live map when concurrency disallowed, snapshot otherwise)
  pub merged_job_data: JobDataMap,
  /// 实际触发时刻
  /// Actual fire instant
  pub fire_time: DateTime<Utc>,
  /// 计划触发时刻
  /// Scheduled fire instant
  pub scheduled_fire_time: Option<DateTime<Utc>>,
  /// 上一次触发时刻
  /// Previous fire instant
  pub previous_fire_time: Option<DateTime<Utc>>,
  /// 下一次触发时刻
  /// Next fire instant
  pub next_fire_time: Option<DateTime<Utc>>,
  /// 是否为恢复执行
  /// Whether this execution is a recovery run
  pub recovering: bool,
  /// 同一触发器已重触发次数
  /// Number of refires of the same trigger
  pub refire_count: u32,
  /// 作业可写的结果值
  /// Result value writable by the job
  pub result: Option<Value>,
  /// 中断令牌；实现可中断作业时应监听它
  /// Interruption token; interruptable jobs should observe it
  pub interrupt_token: CancellationToken,
}

impl JobExecutionContext {
  /// 恢复执行时返回原计划触发时刻
  /// For a recovery run, returns the originally scheduled fire instant
  pub fn recovering_fire_time(&self) -> Option<DateTime<Utc>> {
    if !self.recovering {
      return None;
    }
    self
      .merged_job_data
      .get_i64(RECOVERING_FIRE_TIME_KEY)
      .map(crate::time::millis_to_datetime)
  }
}

impl fmt::Debug for JobExecutionContext {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("JobExecutionContext")
      .field("job", &self.job_detail.key)
      .field("trigger", &self.trigger.key())
      .field("fire_instance_id", &self.fire_instance_id)
      .field("fire_time", &self.fire_time)
      .field("recovering", &self.recovering)
      .field("refire_count", &self.refire_count)
      .finish()
  }
}

/// 作业特性
/// Job trait
///
/// 触发器触发时调用的用户代码。
/// User code invoked when a trigger fires.
#[async_trait]
pub trait Job: Send + Sync {
  /// 执行作业
  /// Execute the job
  async fn execute(&self, ctx: &mut JobExecutionContext)
    -> std::result::Result<(), JobExecutionError>;
}

/// 函数式作业适配器
/// Functional job adapter
pub struct JobFunc<F> {
  func: F,
}

impl<F> JobFunc<F>
where
  F: Fn(&mut JobExecutionContext) -> std::result::Result<(), JobExecutionError> + Send + Sync,
{
  /// 从同步闭包创建作业
  /// Create a job from a synchronous closure
  pub fn new(func: F) -> Self {
    Self { func }
  }
}

#[async_trait]
impl<F> Job for JobFunc<F>
where
  F: Fn(&mut JobExecutionContext) -> std::result::Result<(), JobExecutionError> + Send + Sync,
{
  async fn execute(
    &self,
    ctx: &mut JobExecutionContext,
  ) -> std::result::Result<(), JobExecutionError> {
    (self.func)(ctx)
  }
}

/// 作业工厂
/// Job factory
///
/// 每次触发由工厂按 `JobDetail` 实例化作业。
/// The factory instantiates the job from the `JobDetail` for each firing.
pub trait JobFactory: Send + Sync {
  /// 为一次执行创建作业实例
  /// Create a job instance for one execution
  fn new_job(&self, detail: &JobDetail) -> Result<Arc<dyn Job>>;
}

type JobConstructor = Arc<dyn Fn() -> Arc<dyn Job> + Send + Sync>;

/// 作业注册表
/// Job registry
///
/// 将作业类型名路由到构造函数：精确匹配优先，其次是 `prefix:*` /
/// `*:suffix` / `*` 通配模式。
/// Routes job type names to constructors: exact match first, then
/// `prefix:*` / `*:suffix` / `*` wildcard patterns.
#[derive(Default)]
pub struct JobRegistry {
  exact: HashMap<String, JobConstructor>,
  patterns: Vec<(String, JobConstructor)>,
}

/// 检查作业类型是否匹配模式
/// Check whether a job type matches a pattern
fn pattern_matches(pattern: &str, job_type: &str) -> bool {
  if pattern == "*" {
    return true;
  }
  match pattern.split_once('*') {
    None => pattern == job_type,
    Some((prefix, suffix)) => {
      job_type.len() >= prefix.len() + suffix.len()
        && job_type.starts_with(prefix)
        && job_type.ends_with(suffix)
    }
  }
}

impl JobRegistry {
  /// 创建空注册表
  /// Create an empty registry
  pub fn new() -> Self {
    Self::default()
  }

  /// 注册构造函数
  /// Register a constructor
  pub fn register<S, F>(&mut self, pattern: S, constructor: F)
  where
    S: Into<String>,
    F: Fn() -> Arc<dyn Job> + Send + Sync + 'static,
  {
    let pattern = pattern.into();
    let constructor: JobConstructor = Arc::new(constructor);
    if pattern.contains('*') {
      self.patterns.push((pattern, constructor));
    } else {
      self.exact.insert(pattern, constructor);
    }
  }

  /// 注册同步闭包作业
  /// Register a synchronous closure job
  pub fn register_func<S, F>(&mut self, pattern: S, func: F)
  where
    S: Into<String>,
    F: Fn(&mut JobExecutionContext) -> std::result::Result<(), JobExecutionError>
      + Send
      + Sync
      + Clone
      + 'static,
  {
    self.register(pattern, move || {
      Arc::new(JobFunc::new(func.clone())) as Arc<dyn Job>
    });
  }
}

impl JobFactory for JobRegistry {
  fn new_job(&self, detail: &JobDetail) -> Result<Arc<dyn Job>> {
    if let Some(constructor) = self.exact.get(&detail.job_type) {
      return Ok(constructor());
    }
    // 最长模式优先
    // Longest pattern wins
    let mut best: Option<&(String, JobConstructor)> = None;
    for entry in &self.patterns {
      if pattern_matches(&entry.0, &detail.job_type)
        && best.is_none_or(|b| entry.0.len() > b.0.len())
      {
        best = Some(entry);
      }
    }
    match best {
      Some((_, constructor)) => Ok(constructor()),
      None => Err(SchedulerError::UnresolvedJobType(detail.job_type.clone())),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_job_detail_builder() {
    let detail = JobDetail::builder()
      .of_type("email:digest")
      .with_identity("digest", "mail")
      .with_description("nightly digest")
      .store_durably()
      .request_recovery()
      .using_job_data("batch_size", 250)
      .build()
      .unwrap();

    assert_eq!(detail.key, JobKey::new("digest", "mail"));
    assert!(detail.durable);
    assert!(detail.request_recovery);
    assert!(!detail.concurrent_execution_disallowed);
    assert_eq!(detail.job_data.get_i64("batch_size"), Some(250));
  }

  #[test]
  fn test_builder_requires_job_type() {
    assert!(JobDetail::builder().with_identity("a", "b").build().is_err());
  }

  #[test]
  fn test_data_map_merge_right_wins() {
    let mut left = JobDataMap::new();
    left.put("a", 1);
    left.put("b", "old");
    let mut right = JobDataMap::new();
    right.put("b", "new");
    left.merge(&right);
    assert_eq!(left.get_i64("a"), Some(1));
    assert_eq!(left.get_str("b"), Some("new"));
  }

  #[test]
  fn test_registry_exact_beats_pattern() {
    let mut registry = JobRegistry::new();
    registry.register_func("email:digest", |_ctx| Ok(()));
    registry.register_func("email:*", |_ctx| Err(JobExecutionError::new("wrong route")));

    let detail = JobDetail::builder()
      .of_type("email:digest")
      .with_identity("digest", DEFAULT_GROUP)
      .build()
      .unwrap();
    assert!(registry.new_job(&detail).is_ok());
  }

  #[test]
  fn test_registry_unresolved_type() {
    let registry = JobRegistry::new();
    let detail = JobDetail::builder()
      .of_type("nobody:home")
      .with_identity("x", DEFAULT_GROUP)
      .build()
      .unwrap();
    assert!(matches!(
      registry.new_job(&detail),
      Err(SchedulerError::UnresolvedJobType(_))
    ));
  }

  #[test]
  fn test_pattern_matching() {
    assert!(pattern_matches("*", "anything"));
    assert!(pattern_matches("email:*", "email:send"));
    assert!(pattern_matches("*:send", "email:send"));
    assert!(!pattern_matches("email:*", "sms:send"));
    assert!(pattern_matches("email:send", "email:send"));
  }

  #[test]
  fn test_job_execution_error_flags() {
    let err = JobExecutionError::new("transient failure").with_refire_immediately();
    assert!(err.refire_immediately);
    assert!(!err.unschedule_firing_trigger);

    let err = JobExecutionError::new("bad config").with_unschedule_all_triggers();
    assert!(err.unschedule_all_triggers);
  }
}
