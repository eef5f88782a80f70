//! 调度器门面模块
//! Scheduler facade module
//!
//! 把存储、工作者池、调度循环与后台组件装配成对外的调度器：公开
//! 调度 API、监听器注册、待机与关闭。任何让更早触发器入场的 API
//! 调用都会通过条件信号戳醒调度循环，使其立即重新规划。
//! Wires the store, worker pool, scheduling loop, and background
//! components into the public scheduler: scheduling API, listener
//! registration, standby, and shutdown. Any API call that admits an
//! earlier trigger pokes the scheduling loop through the condition
//! signal so it re-plans immediately.

use crate::calendar::CalendarVariant;
use crate::components::{
  ClusterManager, ClusterManagerConfig, ComponentLifecycle, MisfireHandler, MisfireHandlerConfig,
  WorkerPool,
};
use crate::config::SchedulerConfig;
use crate::error::{Result, SchedulerError};
use crate::job::{JobDataMap, JobDetail, JobFactory};
use crate::key::{JobKey, TriggerKey};
use crate::listener::{JobListener, ListenerManager, SchedulerListener, TriggerListener};
use crate::scheduler::{CancellationMap, SchedulerLoop, SchedulerLoopParams};
use crate::store::{JobStore, TriggerStoreState};
use crate::time::SharedClock;
use crate::triggers::{OperableTrigger, SimpleScheduleBuilder, Trigger};
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// 调度器生命周期状态
/// Scheduler lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LifecycleState {
  // 新建未启动
  New,
  // 运行中
  Started,
  // 待机，不再获取触发器
  Standby,
  // 已关闭
  Shutdown,
}

/// 调度器
/// Scheduler
///
/// 持久化的作业在共享存储的调度器实例间协作，每个计划时刻至多触发
/// 一次。
/// Persisted jobs cooperate across scheduler instances sharing one
/// store, firing at most once per scheduled instant.
pub struct Scheduler {
  config: SchedulerConfig,
  instance_id: String,
  store: Arc<dyn JobStore>,
  pool: Arc<WorkerPool>,
  listeners: Arc<ListenerManager>,
  job_factory: Arc<dyn JobFactory>,
  clock: SharedClock,
  signal: Arc<Notify>,
  cancellations: CancellationMap,
  state: Mutex<LifecycleState>,
  sched_loop: Mutex<Option<Arc<SchedulerLoop>>>,
  loop_handle: Mutex<Option<JoinHandle<()>>>,
  components: Mutex<Vec<(Arc<dyn ComponentLifecycle + Send + Sync>, JoinHandle<()>)>>,
}

impl Scheduler {
  /// 装配调度器
  /// Assemble the scheduler
  pub fn new(
    config: SchedulerConfig,
    store: Arc<dyn JobStore>,
    job_factory: Arc<dyn JobFactory>,
  ) -> Result<Self> {
    Self::with_clock(config, store, job_factory, crate::time::system_clock())
  }

  /// 以指定时钟装配（测试用）
  /// Assemble with the given clock (for tests)
  pub fn with_clock(
    config: SchedulerConfig,
    store: Arc<dyn JobStore>,
    job_factory: Arc<dyn JobFactory>,
    clock: SharedClock,
  ) -> Result<Self> {
    config.validate()?;
    let instance_id = config.resolved_instance_id();
    let pool = Arc::new(WorkerPool::new(config.thread_count));
    Ok(Self {
      config,
      instance_id,
      store,
      pool,
      listeners: Arc::new(ListenerManager::new()),
      job_factory,
      clock,
      signal: Arc::new(Notify::new()),
      cancellations: CancellationMap::new(),
      state: Mutex::new(LifecycleState::New),
      sched_loop: Mutex::new(None),
      loop_handle: Mutex::new(None),
      components: Mutex::new(Vec::new()),
    })
  }

  fn state(&self) -> LifecycleState {
    *self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn set_state(&self, state: LifecycleState) {
    *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
  }

  /// 调度器名
  /// Scheduler name
  pub fn scheduler_name(&self) -> &str {
    &self.config.instance_name
  }

  /// 实例标识
  /// Instance id
  pub fn instance_id(&self) -> &str {
    &self.instance_id
  }

  /// 监听器管理
  /// Listener management
  pub fn listener_manager(&self) -> &ListenerManager {
    &self.listeners
  }

  /// 注册触发器监听器
  /// Register a trigger listener
  pub fn add_trigger_listener(&self, listener: Arc<dyn TriggerListener>) {
    self.listeners.add_trigger_listener(listener);
  }

  /// 注册作业监听器
  /// Register a job listener
  pub fn add_job_listener(&self, listener: Arc<dyn JobListener>) {
    self.listeners.add_job_listener(listener);
  }

  /// 注册调度器监听器
  /// Register a scheduler listener
  pub fn add_scheduler_listener(&self, listener: Arc<dyn SchedulerListener>) {
    self.listeners.add_scheduler_listener(listener);
  }

  /// 启动（或从待机恢复）
  /// Start (or resume from standby)
  pub async fn start(&self) -> Result<()> {
    match self.state() {
      LifecycleState::Shutdown => return Err(SchedulerError::SchedulerShutdown),
      LifecycleState::Started => return Err(SchedulerError::SchedulerRunning),
      LifecycleState::Standby => {
        if let Some(sched_loop) = self.sched_loop.lock().unwrap_or_else(|e| e.into_inner()).as_ref()
        {
          sched_loop.set_paused(false);
        }
        self.set_state(LifecycleState::Started);
        self
          .listeners
          .broadcast_scheduler_event(|l| async move { l.scheduler_started().await })
          .await;
        return Ok(());
      }
      LifecycleState::New => {}
    }

    let sched_loop = Arc::new(SchedulerLoop::new(SchedulerLoopParams {
      store: self.store.clone(),
      pool: self.pool.clone(),
      listeners: self.listeners.clone(),
      job_factory: self.job_factory.clone(),
      clock: self.clock.clone(),
      signal: self.signal.clone(),
      cancellations: self.cancellations.clone(),
      instance_id: self.instance_id.clone(),
      idle_wait_time: self.config.idle_wait_time,
      batch_max_count: self.config.batch_trigger_acquisition_max_count,
      batch_time_window: self.config.batch_trigger_acquisition_fire_ahead_time_window,
      db_failure_retry_interval: self.config.db_failure_retry_interval,
    }));
    let handle = sched_loop.clone().start();
    *self.sched_loop.lock().unwrap_or_else(|e| e.into_inner()) = Some(sched_loop);
    *self.loop_handle.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);

    // 后台组件：misfire 扫描器，集群模式下再加集群管理器
    // Background components: the misfire scanner, plus the cluster
    // manager in clustered mode
    let mut components = self.components.lock().unwrap_or_else(|e| e.into_inner());
    let misfire: Arc<dyn ComponentLifecycle + Send + Sync> = Arc::new(MisfireHandler::new(
      self.store.clone(),
      MisfireHandlerConfig {
        interval: self.config.misfire_threshold,
        max_misfires_to_handle_at_a_time: self.config.max_misfires_to_handle_at_a_time,
        ..MisfireHandlerConfig::default()
      },
      self.listeners.clone(),
      self.signal.clone(),
    ));
    let misfire_handle = misfire.clone().start();
    components.push((misfire, misfire_handle));

    if self.store.clustered() {
      let cluster: Arc<dyn ComponentLifecycle + Send + Sync> = Arc::new(ClusterManager::new(
        self.store.clone(),
        ClusterManagerConfig {
          checkin_interval: self.config.cluster_checkin_interval,
          ..ClusterManagerConfig::default()
        },
        self.signal.clone(),
      ));
      let cluster_handle = cluster.clone().start();
      components.push((cluster, cluster_handle));
    }
    drop(components);

    self.set_state(LifecycleState::Started);
    tracing::info!(
      scheduler = %self.config.instance_name,
      instance = %self.instance_id,
      workers = self.config.thread_count,
      "scheduler started"
    );
    self
      .listeners
      .broadcast_scheduler_event(|l| async move { l.scheduler_started().await })
      .await;
    Ok(())
  }

  /// 进入待机：停止获取触发器但不关闭
  /// Enter standby: stop acquiring triggers without shutting down
  pub async fn standby(&self) -> Result<()> {
    if self.state() == LifecycleState::Shutdown {
      return Err(SchedulerError::SchedulerShutdown);
    }
    if let Some(sched_loop) = self.sched_loop.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
      sched_loop.set_paused(true);
    }
    self.set_state(LifecycleState::Standby);
    self
      .listeners
      .broadcast_scheduler_event(|l| async move { l.scheduler_in_standby_mode().await })
      .await;
    Ok(())
  }

  /// 是否已启动
  /// Whether the scheduler has started
  pub fn is_started(&self) -> bool {
    self.state() == LifecycleState::Started
  }

  /// 是否处于待机
  /// Whether the scheduler is in standby
  pub fn is_in_standby_mode(&self) -> bool {
    self.state() == LifecycleState::Standby
  }

  /// 是否已关闭
  /// Whether the scheduler has shut down
  pub fn is_shutdown(&self) -> bool {
    self.state() == LifecycleState::Shutdown
  }

  /// 关闭
  /// Shut down
  ///
  /// 设置停机标志并唤醒调度循环（停止获取），随后按
  /// `wait_for_jobs_to_complete` 排空或放任工作者池。
  /// Sets the halt flag and wakes the scheduling loop (which stops
  /// acquiring), then drains or abandons the worker pool per
  /// `wait_for_jobs_to_complete`.
  pub async fn shutdown(&self, wait_for_jobs_to_complete: bool) -> Result<()> {
    if self.state() == LifecycleState::Shutdown {
      return Ok(());
    }
    self.set_state(LifecycleState::Shutdown);

    if let Some(sched_loop) = self.sched_loop.lock().unwrap_or_else(|e| e.into_inner()).take() {
      sched_loop.halt();
    }
    let components: Vec<_> = {
      let mut guard = self.components.lock().unwrap_or_else(|e| e.into_inner());
      guard.drain(..).collect()
    };
    for (component, handle) in components {
      component.shutdown();
      handle.abort();
    }

    self.pool.shutdown(wait_for_jobs_to_complete).await;

    let handle = self.loop_handle.lock().unwrap_or_else(|e| e.into_inner()).take();
    if let Some(handle) = handle {
      let _ = handle.await;
    }

    tracing::info!(scheduler = %self.config.instance_name, "scheduler shut down");
    self
      .listeners
      .broadcast_scheduler_event(|l| async move { l.scheduler_shutdown().await })
      .await;
    Ok(())
  }

  fn ensure_not_shutdown(&self) -> Result<()> {
    if self.state() == LifecycleState::Shutdown {
      return Err(SchedulerError::SchedulerShutdown);
    }
    Ok(())
  }

  /// 计算首次触发时刻并校验
  /// Compute the first fire instant and validate
  async fn prepare_trigger(&self, trigger: &mut Trigger) -> Result<()> {
    trigger.validate()?;
    let calendar = match trigger.calendar_name() {
      Some(name) => {
        let calendar = self.store.retrieve_calendar(name).await?;
        if calendar.is_none() {
          return Err(SchedulerError::CalendarNotFound(name.to_string()));
        }
        calendar
      }
      None => None,
    };
    if trigger.compute_first_fire_time(calendar.as_ref()).is_none() {
      return Err(SchedulerError::invalid_trigger(format!(
        "trigger {} will never fire",
        trigger.key()
      )));
    }
    Ok(())
  }

  /// 存储作业并调度其触发器
  /// Store a job and schedule its trigger
  pub async fn schedule_job(
    &self,
    job: JobDetail,
    mut trigger: Trigger,
  ) -> Result<Option<DateTime<Utc>>> {
    self.ensure_not_shutdown()?;
    if trigger.job_key() != &job.key {
      return Err(SchedulerError::invalid_trigger(format!(
        "trigger {} does not reference job {}",
        trigger.key(),
        job.key
      )));
    }
    self.prepare_trigger(&mut trigger).await?;
    let first_fire = trigger.next_fire_time();
    let notify_trigger = trigger.clone();
    self.store.store_job_and_trigger(job, trigger).await?;
    self.signal.notify_one();
    self
      .listeners
      .broadcast_scheduler_event(|l| {
        let trigger = notify_trigger.clone();
        async move { l.job_scheduled(&trigger).await }
      })
      .await;
    Ok(first_fire)
  }

  /// 为已存在的作业调度触发器
  /// Schedule a trigger for an existing job
  pub async fn schedule_trigger(&self, mut trigger: Trigger) -> Result<Option<DateTime<Utc>>> {
    self.ensure_not_shutdown()?;
    self.prepare_trigger(&mut trigger).await?;
    let first_fire = trigger.next_fire_time();
    let notify_trigger = trigger.clone();
    self.store.store_trigger(trigger, false).await?;
    self.signal.notify_one();
    self
      .listeners
      .broadcast_scheduler_event(|l| {
        let trigger = notify_trigger.clone();
        async move { l.job_scheduled(&trigger).await }
      })
      .await;
    Ok(first_fire)
  }

  /// 存储（或替换）一个作业
  /// Store (or replace) a job
  ///
  /// 没有触发器引用的作业必须是持久作业。
  /// A job with no referencing trigger must be durable.
  pub async fn add_job(&self, job: JobDetail, replace_existing: bool) -> Result<()> {
    self.ensure_not_shutdown()?;
    if !job.durable {
      let referenced = !self.store.get_triggers_for_job(&job.key).await?.is_empty();
      if !referenced {
        return Err(SchedulerError::scheduler(format!(
          "job {} is not durable and has no trigger",
          job.key
        )));
      }
    }
    let job_key = job.key.clone();
    self.store.store_job(job, replace_existing).await?;
    self
      .listeners
      .broadcast_scheduler_event(|l| {
        let key = job_key.clone();
        async move { l.job_added(&key).await }
      })
      .await;
    Ok(())
  }

  /// 删除作业及其触发器
  /// Delete a job and its triggers
  pub async fn delete_job(&self, key: &JobKey) -> Result<bool> {
    self.ensure_not_shutdown()?;
    let removed = self.store.remove_job(key).await?;
    if removed {
      self
        .listeners
        .broadcast_scheduler_event(|l| {
          let key = key.clone();
          async move { l.job_deleted(&key).await }
        })
        .await;
    }
    Ok(removed)
  }

  /// 取消一个触发器的调度
  /// Unschedule one trigger
  pub async fn unschedule_job(&self, key: &TriggerKey) -> Result<bool> {
    self.ensure_not_shutdown()?;
    let removed = self.store.remove_trigger(key).await?;
    if removed {
      self
        .listeners
        .broadcast_scheduler_event(|l| {
          let key = key.clone();
          async move { l.job_unscheduled(&key).await }
        })
        .await;
    }
    Ok(removed)
  }

  /// 以新触发器替换旧触发器，保持作业链接
  /// Replace a trigger with a new one, keeping the job linkage
  pub async fn reschedule_job(
    &self,
    key: &TriggerKey,
    mut new_trigger: Trigger,
  ) -> Result<Option<DateTime<Utc>>> {
    self.ensure_not_shutdown()?;
    self.prepare_trigger(&mut new_trigger).await?;
    let first_fire = new_trigger.next_fire_time();
    if !self.store.replace_trigger(key, new_trigger).await? {
      return Ok(None);
    }
    self.signal.notify_one();
    Ok(first_fire)
  }

  /// 立即触发一个持久作业
  /// Fire a durable job immediately
  pub async fn trigger_job(&self, key: &JobKey, data: Option<JobDataMap>) -> Result<()> {
    self.ensure_not_shutdown()?;
    let mut job = self
      .store
      .retrieve_job(key)
      .await?
      .ok_or_else(|| SchedulerError::JobNotFound(key.to_string()))?;
    if let Some(data) = data {
      job.job_data.merge(&data);
      self.store.store_job(job, true).await?;
    }
    let mut trigger = Trigger::builder()
      .for_job(key.clone())
      .start_at(self.clock.now())
      .with_schedule(SimpleScheduleBuilder::once())
      .build()?;
    trigger.compute_first_fire_time(None);
    self.store.store_trigger(trigger, false).await?;
    self.signal.notify_one();
    Ok(())
  }

  /// 存储日历
  /// Store a calendar
  pub async fn add_calendar(
    &self,
    name: &str,
    calendar: CalendarVariant,
    replace_existing: bool,
    update_triggers: bool,
  ) -> Result<()> {
    self.ensure_not_shutdown()?;
    self
      .store
      .store_calendar(name, calendar, replace_existing, update_triggers)
      .await?;
    self.signal.notify_one();
    Ok(())
  }

  /// 删除日历
  /// Delete a calendar
  pub async fn delete_calendar(&self, name: &str) -> Result<bool> {
    self.ensure_not_shutdown()?;
    self.store.remove_calendar(name).await
  }

  /// 读取日历
  /// Retrieve a calendar
  pub async fn get_calendar(&self, name: &str) -> Result<Option<CalendarVariant>> {
    self.store.retrieve_calendar(name).await
  }

  /// 全部日历名
  /// All calendar names
  pub async fn get_calendar_names(&self) -> Result<Vec<String>> {
    self.store.get_calendar_names().await
  }

  /// 读取作业
  /// Retrieve a job
  pub async fn get_job_detail(&self, key: &JobKey) -> Result<Option<JobDetail>> {
    self.store.retrieve_job(key).await
  }

  /// 读取触发器
  /// Retrieve a trigger
  pub async fn get_trigger(&self, key: &TriggerKey) -> Result<Option<Trigger>> {
    self.store.retrieve_trigger(key).await
  }

  /// 触发器状态
  /// Trigger state
  pub async fn get_trigger_state(&self, key: &TriggerKey) -> Result<TriggerStoreState> {
    self.store.get_trigger_state(key).await
  }

  /// 作业的全部触发器
  /// All triggers of a job
  pub async fn get_triggers_of_job(&self, key: &JobKey) -> Result<Vec<Trigger>> {
    self.store.get_triggers_for_job(key).await
  }

  /// 某分组的作业键
  /// Job keys of a group
  pub async fn get_job_keys(&self, group: &str) -> Result<Vec<JobKey>> {
    self.store.get_job_keys(group).await
  }

  /// 某分组的触发器键
  /// Trigger keys of a group
  pub async fn get_trigger_keys(&self, group: &str) -> Result<Vec<TriggerKey>> {
    self.store.get_trigger_keys(group).await
  }

  /// 全部作业分组名
  /// All job group names
  pub async fn get_job_group_names(&self) -> Result<Vec<String>> {
    self.store.get_job_group_names().await
  }

  /// 全部触发器分组名
  /// All trigger group names
  pub async fn get_trigger_group_names(&self) -> Result<Vec<String>> {
    self.store.get_trigger_group_names().await
  }

  /// 被暂停的触发器分组
  /// Paused trigger groups
  pub async fn get_paused_trigger_groups(&self) -> Result<Vec<String>> {
    self.store.get_paused_trigger_groups().await
  }

  /// 本节点正在执行的作业
  /// Jobs currently executing on this node
  pub fn get_currently_executing_jobs(&self) -> Vec<JobKey> {
    self.cancellations.executing_jobs()
  }

  /// 暂停触发器
  /// Pause a trigger
  pub async fn pause_trigger(&self, key: &TriggerKey) -> Result<()> {
    self.ensure_not_shutdown()?;
    self.store.pause_trigger(key).await?;
    self
      .listeners
      .broadcast_scheduler_event(|l| {
        let key = key.clone();
        async move { l.trigger_paused(&key).await }
      })
      .await;
    Ok(())
  }

  /// 暂停触发器分组
  /// Pause a trigger group
  pub async fn pause_trigger_group(&self, group: &str) -> Result<Vec<String>> {
    self.ensure_not_shutdown()?;
    self.store.pause_trigger_group(group).await
  }

  /// 暂停作业
  /// Pause a job
  pub async fn pause_job(&self, key: &JobKey) -> Result<()> {
    self.ensure_not_shutdown()?;
    self.store.pause_job(key).await
  }

  /// 暂停作业分组
  /// Pause a job group
  pub async fn pause_job_group(&self, group: &str) -> Result<Vec<String>> {
    self.ensure_not_shutdown()?;
    self.store.pause_job_group(group).await
  }

  /// 恢复触发器
  /// Resume a trigger
  pub async fn resume_trigger(&self, key: &TriggerKey) -> Result<()> {
    self.ensure_not_shutdown()?;
    self.store.resume_trigger(key).await?;
    self.signal.notify_one();
    self
      .listeners
      .broadcast_scheduler_event(|l| {
        let key = key.clone();
        async move { l.trigger_resumed(&key).await }
      })
      .await;
    Ok(())
  }

  /// 恢复触发器分组
  /// Resume a trigger group
  pub async fn resume_trigger_group(&self, group: &str) -> Result<Vec<String>> {
    self.ensure_not_shutdown()?;
    let groups = self.store.resume_trigger_group(group).await?;
    self.signal.notify_one();
    Ok(groups)
  }

  /// 恢复作业
  /// Resume a job
  pub async fn resume_job(&self, key: &JobKey) -> Result<()> {
    self.ensure_not_shutdown()?;
    self.store.resume_job(key).await?;
    self.signal.notify_one();
    Ok(())
  }

  /// 恢复作业分组
  /// Resume a job group
  pub async fn resume_job_group(&self, group: &str) -> Result<Vec<String>> {
    self.ensure_not_shutdown()?;
    let groups = self.store.resume_job_group(group).await?;
    self.signal.notify_one();
    Ok(groups)
  }

  /// 暂停一切
  /// Pause everything
  pub async fn pause_all(&self) -> Result<()> {
    self.ensure_not_shutdown()?;
    self.store.pause_all().await
  }

  /// 恢复一切
  /// Resume everything
  pub async fn resume_all(&self) -> Result<()> {
    self.ensure_not_shutdown()?;
    self.store.resume_all().await?;
    self.signal.notify_one();
    Ok(())
  }

  /// 清空全部调度数据
  /// Clear all scheduling data
  pub async fn clear(&self) -> Result<()> {
    self.ensure_not_shutdown()?;
    self.store.clear_all_scheduling_data().await?;
    self
      .listeners
      .broadcast_scheduler_event(|l| async move { l.scheduling_data_cleared().await })
      .await;
    Ok(())
  }

  /// 中断该作业在本节点的执行
  /// Interrupt the job's executions on this node
  ///
  /// 跨节点中断不受支持。
  /// Cross-node interrupt is not supported.
  pub fn interrupt(&self, key: &JobKey) -> usize {
    self.cancellations.cancel_job(key)
  }
}
