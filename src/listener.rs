//! 监听器模块
//! Listener module
//!
//! 调度器 / 作业 / 触发器生命周期事件的扇出。监听器按注册顺序被
//! 调用；单次触发的回调是全序的：
//! `trigger_fired → (veto?) → job_to_be_executed → execute →
//! job_was_executed → trigger_complete`。
//! Fan-out of scheduler / job / trigger lifecycle events. Listeners are
//! invoked in registration order; the callbacks of a single firing are
//! totally ordered: `trigger_fired → (veto?) → job_to_be_executed →
//! execute → job_was_executed → trigger_complete`.

use crate::job::{JobExecutionContext, JobExecutionError};
use crate::key::{JobKey, TriggerKey};
use crate::store::CompletedExecutionInstruction;
use crate::triggers::Trigger;
use async_trait::async_trait;
use std::sync::{Arc, RwLock};

/// 触发器生命周期监听器
/// Trigger lifecycle listener
#[async_trait]
pub trait TriggerListener: Send + Sync {
  /// 监听器名称
  /// Listener name
  fn name(&self) -> &str;

  /// 触发器已触发，作业即将执行
  /// The trigger fired and the job is about to execute
  async fn trigger_fired(&self, _ctx: &JobExecutionContext) {}

  /// 否决本次执行
  /// Veto this execution
  async fn veto_job_execution(&self, _ctx: &JobExecutionContext) -> bool {
    false
  }

  /// 触发器 misfire
  /// The trigger misfired
  async fn trigger_misfired(&self, _trigger_key: &TriggerKey) {}

  /// 本次触发完成
  /// This firing completed
  async fn trigger_complete(
    &self,
    _ctx: &JobExecutionContext,
    _instruction: CompletedExecutionInstruction,
  ) {
  }
}

/// 作业生命周期监听器
/// Job lifecycle listener
#[async_trait]
pub trait JobListener: Send + Sync {
  /// 监听器名称
  /// Listener name
  fn name(&self) -> &str;

  /// 作业即将执行
  /// The job is about to execute
  async fn job_to_be_executed(&self, _ctx: &JobExecutionContext) {}

  /// 执行被触发器监听器否决
  /// Execution was vetoed by a trigger listener
  async fn job_execution_vetoed(&self, _ctx: &JobExecutionContext) {}

  /// 作业已执行
  /// The job executed
  async fn job_was_executed(
    &self,
    _ctx: &JobExecutionContext,
    _error: Option<&JobExecutionError>,
  ) {
  }
}

/// 调度器生命周期监听器
/// Scheduler lifecycle listener
#[async_trait]
pub trait SchedulerListener: Send + Sync {
  /// 作业被调度
  /// A job was scheduled
  async fn job_scheduled(&self, _trigger: &Trigger) {}

  /// 作业被取消调度
  /// A job was unscheduled
  async fn job_unscheduled(&self, _trigger_key: &TriggerKey) {}

  /// 作业被添加
  /// A job was added
  async fn job_added(&self, _job_key: &JobKey) {}

  /// 作业被删除
  /// A job was deleted
  async fn job_deleted(&self, _job_key: &JobKey) {}

  /// 触发器被暂停
  /// A trigger was paused
  async fn trigger_paused(&self, _trigger_key: &TriggerKey) {}

  /// 触发器被恢复
  /// A trigger was resumed
  async fn trigger_resumed(&self, _trigger_key: &TriggerKey) {}

  /// 触发器日程走完
  /// A trigger's schedule finished
  async fn trigger_finalized(&self, _trigger_key: &TriggerKey) {}

  /// 调度器启动
  /// The scheduler started
  async fn scheduler_started(&self) {}

  /// 调度器进入待机
  /// The scheduler entered standby
  async fn scheduler_in_standby_mode(&self) {}

  /// 调度器关闭
  /// The scheduler shut down
  async fn scheduler_shutdown(&self) {}

  /// 调度数据被清空
  /// Scheduling data was cleared
  async fn scheduling_data_cleared(&self) {}
}

/// 监听器多路复用器
/// Listener multiplexer
///
/// 持有三类监听器并按注册顺序扇出事件。
/// Holds the three listener kinds and fans events out in registration
/// order.
#[derive(Default)]
pub struct ListenerManager {
  trigger_listeners: RwLock<Vec<Arc<dyn TriggerListener>>>,
  job_listeners: RwLock<Vec<Arc<dyn JobListener>>>,
  scheduler_listeners: RwLock<Vec<Arc<dyn SchedulerListener>>>,
}

impl ListenerManager {
  /// 创建空管理器
  /// Create an empty manager
  pub fn new() -> Self {
    Self::default()
  }

  /// 注册触发器监听器
  /// Register a trigger listener
  pub fn add_trigger_listener(&self, listener: Arc<dyn TriggerListener>) {
    self.trigger_listeners.write().unwrap_or_else(|e| e.into_inner()).push(listener);
  }

  /// 注册作业监听器
  /// Register a job listener
  pub fn add_job_listener(&self, listener: Arc<dyn JobListener>) {
    self.job_listeners.write().unwrap_or_else(|e| e.into_inner()).push(listener);
  }

  /// 注册调度器监听器
  /// Register a scheduler listener
  pub fn add_scheduler_listener(&self, listener: Arc<dyn SchedulerListener>) {
    self
      .scheduler_listeners
      .write()
      .unwrap_or_else(|e| e.into_inner())
      .push(listener);
  }

  /// 按名移除触发器监听器
  /// Remove a trigger listener by name
  pub fn remove_trigger_listener(&self, name: &str) -> bool {
    let mut listeners = self.trigger_listeners.write().unwrap_or_else(|e| e.into_inner());
    let before = listeners.len();
    listeners.retain(|l| l.name() != name);
    listeners.len() != before
  }

  /// 按名移除作业监听器
  /// Remove a job listener by name
  pub fn remove_job_listener(&self, name: &str) -> bool {
    let mut listeners = self.job_listeners.write().unwrap_or_else(|e| e.into_inner());
    let before = listeners.len();
    listeners.retain(|l| l.name() != name);
    listeners.len() != before
  }

  fn trigger_snapshot(&self) -> Vec<Arc<dyn TriggerListener>> {
    self
      .trigger_listeners
      .read()
      .unwrap_or_else(|e| e.into_inner())
      .clone()
  }

  fn job_snapshot(&self) -> Vec<Arc<dyn JobListener>> {
    self.job_listeners.read().unwrap_or_else(|e| e.into_inner()).clone()
  }

  fn scheduler_snapshot(&self) -> Vec<Arc<dyn SchedulerListener>> {
    self
      .scheduler_listeners
      .read()
      .unwrap_or_else(|e| e.into_inner())
      .clone()
  }

  /// 通知触发并收集否决
  /// Notify of the firing and collect vetoes
  ///
  /// 任何一个监听器否决即否决。
  /// A veto from any listener vetoes the execution.
  pub async fn notify_trigger_fired(&self, ctx: &JobExecutionContext) -> bool {
    let mut vetoed = false;
    for listener in self.trigger_snapshot() {
      listener.trigger_fired(ctx).await;
      if listener.veto_job_execution(ctx).await {
        vetoed = true;
      }
    }
    vetoed
  }

  /// 通知 misfire
  /// Notify of a misfire
  pub async fn notify_trigger_misfired(&self, trigger_key: &TriggerKey) {
    for listener in self.trigger_snapshot() {
      listener.trigger_misfired(trigger_key).await;
    }
  }

  /// 通知触发完成
  /// Notify of firing completion
  pub async fn notify_trigger_complete(
    &self,
    ctx: &JobExecutionContext,
    instruction: CompletedExecutionInstruction,
  ) {
    for listener in self.trigger_snapshot() {
      listener.trigger_complete(ctx, instruction).await;
    }
  }

  /// 通知作业即将执行
  /// Notify that the job is about to execute
  pub async fn notify_job_to_be_executed(&self, ctx: &JobExecutionContext) {
    for listener in self.job_snapshot() {
      listener.job_to_be_executed(ctx).await;
    }
  }

  /// 通知执行被否决
  /// Notify that execution was vetoed
  pub async fn notify_job_execution_vetoed(&self, ctx: &JobExecutionContext) {
    for listener in self.job_snapshot() {
      listener.job_execution_vetoed(ctx).await;
    }
  }

  /// 通知作业已执行
  /// Notify that the job executed
  pub async fn notify_job_was_executed(
    &self,
    ctx: &JobExecutionContext,
    error: Option<&JobExecutionError>,
  ) {
    for listener in self.job_snapshot() {
      listener.job_was_executed(ctx, error).await;
    }
  }

  /// 广播一个调度器事件
  /// Broadcast one scheduler event
  pub async fn broadcast_scheduler_event<'a, F, Fut>(&'a self, event: F)
  where
    F: Fn(Arc<dyn SchedulerListener>) -> Fut,
    Fut: std::future::Future<Output = ()> + 'a,
  {
    for listener in self.scheduler_snapshot() {
      event(listener).await;
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};

  struct CountingListener {
    name: String,
    order: Arc<std::sync::Mutex<Vec<String>>>,
    veto: bool,
  }

  #[async_trait]
  impl TriggerListener for CountingListener {
    fn name(&self) -> &str {
      &self.name
    }

    async fn trigger_fired(&self, _ctx: &JobExecutionContext) {
      self.order.lock().unwrap().push(self.name.clone());
    }

    async fn veto_job_execution(&self, _ctx: &JobExecutionContext) -> bool {
      self.veto
    }
  }

  struct CountingSchedulerListener {
    started: AtomicUsize,
  }

  #[async_trait]
  impl SchedulerListener for CountingSchedulerListener {
    async fn scheduler_started(&self) {
      self.started.fetch_add(1, Ordering::SeqCst);
    }
  }

  fn dummy_ctx() -> JobExecutionContext {
    use crate::job::{JobDataMap, JobDetail};
    use crate::key::JobKey;
    use crate::triggers::{SimpleScheduleBuilder, Trigger, TriggerCore};
    use chrono::Utc;

    let core = TriggerCore::new(
      crate::key::TriggerKey::new("t", "g"),
      JobKey::new("j", "g"),
      Utc::now(),
    );
    JobExecutionContext {
      scheduler_instance_id: "test".to_string(),
      fire_instance_id: "f1".to_string(),
      job_detail: JobDetail {
        key: JobKey::new("j", "g"),
        job_type: "noop".to_string(),
        description: None,
        durable: false,
        concurrent_execution_disallowed: false,
        persist_job_data_after_execution: false,
        request_recovery: false,
        job_data: JobDataMap::new(),
      },
      trigger: Trigger::Simple(SimpleScheduleBuilder::once().build(core)),
      calendar: None,
      merged_job_data: JobDataMap::new(),
      fire_time: Utc::now(),
      scheduled_fire_time: None,
      previous_fire_time: None,
      next_fire_time: None,
      recovering: false,
      refire_count: 0,
      result: None,
      interrupt_token: tokio_util::sync::CancellationToken::new(),
    }
  }

  #[tokio::test]
  async fn test_listeners_invoked_in_registration_order() {
    let manager = ListenerManager::new();
    let order = Arc::new(std::sync::Mutex::new(Vec::new()));
    for name in ["first", "second", "third"] {
      manager.add_trigger_listener(Arc::new(CountingListener {
        name: name.to_string(),
        order: order.clone(),
        veto: false,
      }));
    }

    let vetoed = manager.notify_trigger_fired(&dummy_ctx()).await;
    assert!(!vetoed);
    assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
  }

  #[tokio::test]
  async fn test_any_veto_wins() {
    let manager = ListenerManager::new();
    let order = Arc::new(std::sync::Mutex::new(Vec::new()));
    manager.add_trigger_listener(Arc::new(CountingListener {
      name: "quiet".to_string(),
      order: order.clone(),
      veto: false,
    }));
    manager.add_trigger_listener(Arc::new(CountingListener {
      name: "vetoer".to_string(),
      order: order.clone(),
      veto: true,
    }));

    assert!(manager.notify_trigger_fired(&dummy_ctx()).await);
  }

  #[tokio::test]
  async fn test_remove_listener_by_name() {
    let manager = ListenerManager::new();
    let order = Arc::new(std::sync::Mutex::new(Vec::new()));
    manager.add_trigger_listener(Arc::new(CountingListener {
      name: "gone".to_string(),
      order: order.clone(),
      veto: true,
    }));
    assert!(manager.remove_trigger_listener("gone"));
    assert!(!manager.remove_trigger_listener("gone"));
    assert!(!manager.notify_trigger_fired(&dummy_ctx()).await);
  }

  #[tokio::test]
  async fn test_scheduler_broadcast() {
    let manager = ListenerManager::new();
    let listener = Arc::new(CountingSchedulerListener {
      started: AtomicUsize::new(0),
    });
    manager.add_scheduler_listener(listener.clone());
    manager
      .broadcast_scheduler_event(|l| async move { l.scheduler_started().await })
      .await;
    assert_eq!(listener.started.load(Ordering::SeqCst), 1);
  }
}
