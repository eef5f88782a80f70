//! 错误处理模块
//! Error handling module
//!
//! 定义了调度引擎使用的各种错误类型
//! Defines the error types used by the scheduling engine

use thiserror::Error;

/// 调度引擎的结果类型
/// Result type for the scheduling engine
pub type Result<T> = std::result::Result<T, SchedulerError>;

/// 调度引擎错误类型
/// Scheduling engine error type
#[derive(Error, Debug)]
pub enum SchedulerError {
  /// 数据库驱动错误（任务持久化失败）
  /// Database driver error (job persistence failure)
  #[error("Job store database error: {0}")]
  Database(#[from] sea_orm::DbErr),

  /// 存储层逻辑错误
  /// Store layer logical error
  #[error("Job persistence error: {0}")]
  JobPersistence(String),

  /// 序列化错误
  /// Serialization error
  #[error("Serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  /// IO 错误
  /// IO error
  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),

  /// 插入时违反唯一性约束且未允许替换
  /// Insert violated uniqueness with replace_existing = false
  #[error("Object already exists: {0}")]
  ObjectAlreadyExists(String),

  /// 作业不存在
  /// Job does not exist
  #[error("Job not found: {0}")]
  JobNotFound(String),

  /// 触发器不存在
  /// Trigger does not exist
  #[error("Trigger not found: {0}")]
  TriggerNotFound(String),

  /// 日历不存在
  /// Calendar does not exist
  #[error("Calendar not found: {0}")]
  CalendarNotFound(String),

  /// 无效的 cron 表达式
  /// Invalid cron expression
  #[error("Invalid cron expression {expression:?}: {message}")]
  InvalidCronExpression { expression: String, message: String },

  /// 触发器参数校验失败
  /// Trigger parameter validation failure
  #[error("Invalid trigger definition: {0}")]
  InvalidTrigger(String),

  /// 启动时配置无效
  /// Invalid configuration at startup
  #[error("Configuration error: {message}")]
  Config { message: String },

  /// 获取命名行锁超时（可重试）
  /// Acquiring a named row lock exceeded the timeout (retryable)
  #[error("Timed out acquiring lock {lock_name:?} after {timeout_millis}ms")]
  LockTimeout {
    lock_name: String,
    timeout_millis: u64,
  },

  /// 用户作业抛出的执行错误
  /// Execution error raised by a user job
  #[error("Job execution error: {0}")]
  JobExecution(#[from] crate::job::JobExecutionError),

  /// 调度器已关闭
  /// Scheduler has been shut down
  #[error("Scheduler has been shut down")]
  SchedulerShutdown,

  /// 调度器已在运行
  /// Scheduler is already running
  #[error("Scheduler is already running")]
  SchedulerRunning,

  /// 作业类型未在注册表中注册
  /// Job type is not registered in the registry
  #[error("No registered job factory for job type: {0}")]
  UnresolvedJobType(String),

  /// 其他调度器层错误
  /// Other scheduler-layer error
  #[error("Scheduler error: {message}")]
  Scheduler { message: String },
}

impl SchedulerError {
  /// 创建配置错误
  /// Create a configuration error
  pub fn config<S: Into<String>>(message: S) -> Self {
    Self::Config {
      message: message.into(),
    }
  }

  /// 创建通用调度器错误
  /// Create a generic scheduler error
  pub fn scheduler<S: Into<String>>(message: S) -> Self {
    Self::Scheduler {
      message: message.into(),
    }
  }

  /// 创建存储层逻辑错误
  /// Create a store-layer logical error
  pub fn persistence<S: Into<String>>(message: S) -> Self {
    Self::JobPersistence(message.into())
  }

  /// 创建触发器校验错误
  /// Create a trigger validation error
  pub fn invalid_trigger<S: Into<String>>(message: S) -> Self {
    Self::InvalidTrigger(message.into())
  }

  /// 检查错误是否可重试
  /// Check whether the error is retryable
  ///
  /// 存储层瞬态错误（死锁、序列化失败、锁超时）在集群/misfire 线程内
  /// 以有界退避重试；其余错误直接上抛。
  /// Store-layer transient errors (deadlock, serialization failure, lock
  /// timeout) are retried with bounded backoff inside the cluster/misfire
  /// threads; everything else surfaces immediately.
  pub fn is_retriable(&self) -> bool {
    match self {
      SchedulerError::Database(err) => {
        let text = err.to_string().to_lowercase();
        text.contains("deadlock")
          || text.contains("serialization")
          || text.contains("could not serialize")
          || text.contains("lock")
          || text.contains("connection")
      }
      SchedulerError::LockTimeout { .. } | SchedulerError::Io(_) => true,
      _ => false,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_error_constructors() {
    let err = SchedulerError::config("bad thread count");
    assert!(matches!(err, SchedulerError::Config { .. }));

    let err = SchedulerError::persistence("row vanished");
    assert!(matches!(err, SchedulerError::JobPersistence(_)));

    let err = SchedulerError::invalid_trigger("repeat interval must be positive");
    assert!(matches!(err, SchedulerError::InvalidTrigger(_)));
  }

  #[test]
  fn test_lock_timeout_is_retriable() {
    let err = SchedulerError::LockTimeout {
      lock_name: "TRIGGER_ACCESS".to_string(),
      timeout_millis: 5000,
    };
    assert!(err.is_retriable());
    assert!(!SchedulerError::SchedulerShutdown.is_retriable());
    assert!(!SchedulerError::ObjectAlreadyExists("DEFAULT.job1".to_string()).is_retriable());
  }
}
