//! 配置模块
//! Configuration module
//!
//! 定义调度器的配置选项；`from_map` 接受 `quartz.*` 命名空间下的
//! 字符串键。
//! Defines the scheduler's configuration options; `from_map` accepts the
//! string keys under the `quartz.*` namespace.

use crate::error::{Result, SchedulerError};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

/// 自动生成实例标识的哨兵值
/// Sentinel value for auto-generated instance ids
pub const AUTO_INSTANCE_ID: &str = "AUTO";

/// 调度器配置
/// Scheduler configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
  /// 调度器名（集群内共享）
  /// Scheduler name (shared across the cluster)
  pub instance_name: String,
  /// 实例标识；`AUTO` 生成 `host:pid:uuid`
  /// Instance id; `AUTO` generates `host:pid:uuid`
  pub instance_id: String,
  /// 工作者数量
  /// Number of workers
  pub thread_count: usize,
  /// 是否集群模式
  /// Whether clustering is on
  pub clustered: bool,
  /// 集群检查间隔
  /// Cluster check-in interval
  pub cluster_checkin_interval: Duration,
  /// misfire 阈值
  /// Misfire threshold
  pub misfire_threshold: Duration,
  /// 在集群锁内获取触发器批次
  /// Acquire trigger batches inside the cluster lock
  pub acquire_triggers_within_lock: bool,
  /// 每轮最多处理的 misfire 数
  /// Maximum misfires handled per pass
  pub max_misfires_to_handle_at_a_time: usize,
  /// 每批最多获取的触发器数
  /// Maximum triggers acquired per batch
  pub batch_trigger_acquisition_max_count: usize,
  /// 批可以提前到触发时刻之前多远
  /// How far ahead of the fire instant a batch may reach
  pub batch_trigger_acquisition_fire_ahead_time_window: Duration,
  /// 无事可做时的空转等待
  /// Idle wait when there is nothing to do
  pub idle_wait_time: Duration,
  /// 存储连接不可用时的重试间隔
  /// Retry interval while the store connection is unavailable
  pub db_failure_retry_interval: Duration,
}

impl Default for SchedulerConfig {
  fn default() -> Self {
    Self {
      instance_name: "QuartzScheduler".to_string(),
      instance_id: "NON_CLUSTERED".to_string(),
      thread_count: num_cpus::get(),
      clustered: false,
      cluster_checkin_interval: Duration::from_millis(7_500),
      misfire_threshold: Duration::from_secs(60),
      acquire_triggers_within_lock: true,
      max_misfires_to_handle_at_a_time: 20,
      batch_trigger_acquisition_max_count: 1,
      batch_trigger_acquisition_fire_ahead_time_window: Duration::ZERO,
      idle_wait_time: Duration::from_secs(30),
      db_failure_retry_interval: Duration::from_secs(15),
    }
  }
}

impl SchedulerConfig {
  /// 创建默认配置
  /// Create the default configuration
  pub fn new() -> Self {
    Self::default()
  }

  /// 设置调度器名
  /// Set the scheduler name
  pub fn instance_name<S: Into<String>>(mut self, name: S) -> Self {
    self.instance_name = name.into();
    self
  }

  /// 设置实例标识
  /// Set the instance id
  pub fn instance_id<S: Into<String>>(mut self, id: S) -> Self {
    self.instance_id = id.into();
    self
  }

  /// 设置工作者数量
  /// Set the number of workers
  pub fn thread_count(mut self, count: usize) -> Self {
    self.thread_count = count.max(1);
    self
  }

  /// 开关集群模式
  /// Toggle clustering
  pub fn clustered(mut self, clustered: bool) -> Self {
    self.clustered = clustered;
    self
  }

  /// 设置集群检查间隔
  /// Set the cluster check-in interval
  pub fn cluster_checkin_interval(mut self, interval: Duration) -> Self {
    self.cluster_checkin_interval = interval;
    self
  }

  /// 设置 misfire 阈值
  /// Set the misfire threshold
  pub fn misfire_threshold(mut self, threshold: Duration) -> Self {
    self.misfire_threshold = threshold;
    self
  }

  /// 设置批大小
  /// Set the batch size
  pub fn batch_trigger_acquisition_max_count(mut self, count: usize) -> Self {
    self.batch_trigger_acquisition_max_count = count.max(1);
    self
  }

  /// 设置批的提前窗口
  /// Set the batch fire-ahead window
  pub fn batch_trigger_acquisition_fire_ahead_time_window(mut self, window: Duration) -> Self {
    self.batch_trigger_acquisition_fire_ahead_time_window = window;
    self
  }

  /// 设置空转等待
  /// Set the idle wait
  pub fn idle_wait_time(mut self, idle_wait: Duration) -> Self {
    self.idle_wait_time = idle_wait;
    self
  }

  /// 从 `quartz.*` 字符串键构建
  /// Build from `quartz.*` string keys
  pub fn from_map(properties: &HashMap<String, String>) -> Result<Self> {
    let mut config = Self::default();
    for (key, value) in properties {
      match key.as_str() {
        "quartz.scheduler.instanceName" => config.instance_name = value.clone(),
        "quartz.scheduler.instanceId" => config.instance_id = value.clone(),
        "quartz.threadPool.threadCount" => {
          config.thread_count = parse_number(key, value)? as usize;
        }
        "quartz.jobStore.clustered" => config.clustered = parse_bool(key, value)?,
        "quartz.jobStore.clusterCheckinInterval" => {
          config.cluster_checkin_interval = Duration::from_millis(parse_number(key, value)?);
        }
        "quartz.jobStore.misfireThreshold" => {
          config.misfire_threshold = Duration::from_millis(parse_number(key, value)?);
        }
        "quartz.jobStore.acquireTriggersWithinLock" => {
          config.acquire_triggers_within_lock = parse_bool(key, value)?;
        }
        "quartz.jobStore.maxMisfiresToHandleAtATime" => {
          config.max_misfires_to_handle_at_a_time = parse_number(key, value)? as usize;
        }
        "quartz.scheduler.batchTriggerAcquisitionMaxCount" => {
          config.batch_trigger_acquisition_max_count = parse_number(key, value)? as usize;
        }
        "quartz.scheduler.batchTriggerAcquisitionFireAheadTimeWindow" => {
          config.batch_trigger_acquisition_fire_ahead_time_window =
            Duration::from_millis(parse_number(key, value)?);
        }
        "quartz.scheduler.idleWaitTime" => {
          config.idle_wait_time = Duration::from_millis(parse_number(key, value)?);
        }
        other => {
          return Err(SchedulerError::config(format!(
            "unrecognized configuration key {other:?}"
          )));
        }
      }
    }
    config.validate()?;
    Ok(config)
  }

  /// 校验配置
  /// Validate the configuration
  pub fn validate(&self) -> Result<()> {
    if self.instance_name.trim().is_empty() {
      return Err(SchedulerError::config("instance name cannot be empty"));
    }
    if self.thread_count == 0 {
      return Err(SchedulerError::config("thread count must be at least 1"));
    }
    if self.batch_trigger_acquisition_max_count == 0 {
      return Err(SchedulerError::config(
        "batch trigger acquisition max count must be at least 1",
      ));
    }
    if self.clustered && self.cluster_checkin_interval < Duration::from_millis(100) {
      return Err(SchedulerError::config(
        "cluster check-in interval must be at least 100ms",
      ));
    }
    Ok(())
  }

  /// 解析实例标识；`AUTO` 生成 `host:pid:uuid`
  /// Resolve the instance id; `AUTO` generates `host:pid:uuid`
  pub fn resolved_instance_id(&self) -> String {
    if self.instance_id == AUTO_INSTANCE_ID {
      let host = hostname::get()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string();
      format!("{}:{}:{}", host, std::process::id(), Uuid::new_v4())
    } else {
      self.instance_id.clone()
    }
  }
}

fn parse_number(key: &str, value: &str) -> Result<u64> {
  value
    .parse()
    .map_err(|_| SchedulerError::config(format!("{key}: expected a number, found {value:?}")))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
  value
    .parse()
    .map_err(|_| SchedulerError::config(format!("{key}: expected true/false, found {value:?}")))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults() {
    let config = SchedulerConfig::default();
    assert_eq!(config.idle_wait_time, Duration::from_secs(30));
    assert_eq!(config.cluster_checkin_interval, Duration::from_millis(7_500));
    assert_eq!(config.misfire_threshold, Duration::from_secs(60));
    assert_eq!(config.batch_trigger_acquisition_max_count, 1);
    assert!(config.acquire_triggers_within_lock);
    assert!(config.validate().is_ok());
  }

  #[test]
  fn test_from_map() {
    let mut properties = HashMap::new();
    properties.insert("quartz.scheduler.instanceName".to_string(), "Orders".to_string());
    properties.insert("quartz.scheduler.instanceId".to_string(), "AUTO".to_string());
    properties.insert("quartz.threadPool.threadCount".to_string(), "12".to_string());
    properties.insert("quartz.jobStore.clustered".to_string(), "true".to_string());
    properties.insert(
      "quartz.jobStore.misfireThreshold".to_string(),
      "45000".to_string(),
    );
    properties.insert(
      "quartz.scheduler.batchTriggerAcquisitionMaxCount".to_string(),
      "8".to_string(),
    );

    let config = SchedulerConfig::from_map(&properties).unwrap();
    assert_eq!(config.instance_name, "Orders");
    assert_eq!(config.thread_count, 12);
    assert!(config.clustered);
    assert_eq!(config.misfire_threshold, Duration::from_millis(45_000));
    assert_eq!(config.batch_trigger_acquisition_max_count, 8);
  }

  #[test]
  fn test_from_map_rejects_unknown_keys() {
    let mut properties = HashMap::new();
    properties.insert("quartz.sched.instanceName".to_string(), "typo".to_string());
    assert!(SchedulerConfig::from_map(&properties).is_err());
  }

  #[test]
  fn test_auto_instance_id_is_unique() {
    let config = SchedulerConfig::default().instance_id(AUTO_INSTANCE_ID);
    let a = config.resolved_instance_id();
    let b = config.resolved_instance_id();
    assert_ne!(a, b);
    assert!(a.contains(':'));
  }

  #[test]
  fn test_validation_rejects_zero_threads() {
    let mut config = SchedulerConfig::default();
    config.thread_count = 0;
    assert!(config.validate().is_err());
  }
}
