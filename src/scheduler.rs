//! 调度循环模块
//! Scheduling loop module
//!
//! 每个实例一条专用调度任务驱动 misfire 之外的全部流水线：等可用
//! 工作者 → 批量获取触发器 → 睡到触发时刻（可被更早触发器的信号
//! 打断）→ 确认触发 → 经工作者池执行 → 完成回写。
//! One dedicated scheduling task per instance drives the whole pipeline
//! apart from misfires: wait for an available worker → acquire a batch
//! of triggers → sleep until the fire instant (preemptible by a signal
//! about an earlier trigger) → confirm the firings → execute through the
//! worker pool → write back completion.

use crate::components::WorkerPool;
use crate::job::{JobExecutionContext, JobFactory};
use crate::key::JobKey;
use crate::listener::ListenerManager;
use crate::store::{
  AcquiredTrigger, CompletedExecutionInstruction, JobStore, TriggerFiredBundle,
  TriggerFiredResult,
};
use crate::time::SharedClock;
use chrono::Duration as ChronoDuration;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// 触发时刻之前允许提前派发的余量
/// Lead allowed when dispatching just before the fire instant
const TRIGGER_FIRE_AHEAD_MILLIS: i64 = 2;

/// 正在执行的触发的取消令牌表
/// Cancellation-token map of executing firings
///
/// `interrupt(job_key)` 向该作业在本节点上的所有执行扇出取消信号。
/// `interrupt(job_key)` fans the cancellation signal out to all of the
/// job's executions on this node.
#[derive(Clone, Default)]
pub struct CancellationMap {
  entries: Arc<Mutex<HashMap<String, (JobKey, CancellationToken)>>>,
}

impl CancellationMap {
  /// 创建空表
  /// Create an empty map
  pub fn new() -> Self {
    Self::default()
  }

  /// 登记一次执行
  /// Register one execution
  pub fn add(&self, fire_instance_id: String, job_key: JobKey, token: CancellationToken) {
    let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
    entries.insert(fire_instance_id, (job_key, token));
  }

  /// 注销一次执行
  /// Deregister one execution
  pub fn remove(&self, fire_instance_id: &str) {
    let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
    entries.remove(fire_instance_id);
  }

  /// 中断该作业在本节点的所有执行，返回命中的数量
  /// Interrupt all of the job's executions on this node, returning the
  /// number hit
  pub fn cancel_job(&self, job_key: &JobKey) -> usize {
    let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
    let mut interrupted = 0;
    for (key, token) in entries.values() {
      if key == job_key {
        token.cancel();
        interrupted += 1;
      }
    }
    interrupted
  }

  /// 正在执行的作业键
  /// Keys of currently executing jobs
  pub fn executing_jobs(&self) -> Vec<JobKey> {
    let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
    entries.values().map(|(key, _)| key.clone()).collect()
  }

  /// 执行中的数量
  /// Number of executions in flight
  pub fn len(&self) -> usize {
    self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
  }

  /// 是否为空
  /// Whether the map is empty
  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

/// 调度循环参数
/// Scheduling loop parameters
pub(crate) struct SchedulerLoopParams {
  pub store: Arc<dyn JobStore>,
  pub pool: Arc<WorkerPool>,
  pub listeners: Arc<ListenerManager>,
  pub job_factory: Arc<dyn JobFactory>,
  pub clock: SharedClock,
  pub signal: Arc<Notify>,
  pub cancellations: CancellationMap,
  pub instance_id: String,
  pub idle_wait_time: Duration,
  pub batch_max_count: usize,
  pub batch_time_window: Duration,
  pub db_failure_retry_interval: Duration,
}

/// 调度循环
/// Scheduling loop
pub(crate) struct SchedulerLoop {
  store: Arc<dyn JobStore>,
  pool: Arc<WorkerPool>,
  listeners: Arc<ListenerManager>,
  job_factory: Arc<dyn JobFactory>,
  clock: SharedClock,
  /// 更早触发器到来或停机时被通知
  /// Notified when an earlier trigger arrives or on shutdown
  signal: Arc<Notify>,
  cancellations: CancellationMap,
  instance_id: String,
  idle_wait_time: Duration,
  batch_max_count: usize,
  batch_time_window: Duration,
  db_failure_retry_interval: Duration,
  paused: AtomicBool,
  halted: AtomicBool,
}

impl SchedulerLoop {
  pub fn new(params: SchedulerLoopParams) -> Self {
    Self {
      store: params.store,
      pool: params.pool,
      listeners: params.listeners,
      job_factory: params.job_factory,
      clock: params.clock,
      signal: params.signal,
      cancellations: params.cancellations,
      instance_id: params.instance_id,
      idle_wait_time: params.idle_wait_time,
      batch_max_count: params.batch_max_count,
      batch_time_window: params.batch_time_window,
      db_failure_retry_interval: params.db_failure_retry_interval,
      paused: AtomicBool::new(false),
      halted: AtomicBool::new(false),
    }
  }

  /// 进入 / 离开待机
  /// Enter / leave standby
  pub fn set_paused(&self, paused: bool) {
    self.paused.store(paused, Ordering::SeqCst);
    self.signal.notify_one();
  }

  /// 停机
  /// Halt
  pub fn halt(&self) {
    self.halted.store(true, Ordering::SeqCst);
    self.signal.notify_one();
  }

  fn is_halted(&self) -> bool {
    self.halted.load(Ordering::SeqCst)
  }

  /// 启动调度循环
  /// Start the scheduling loop
  pub fn start(self: Arc<Self>) -> JoinHandle<()> {
    tokio::spawn(async move {
      tracing::debug!(instance = %self.instance_id, "scheduling loop started");
      loop {
        if self.is_halted() {
          break;
        }
        if self.paused.load(Ordering::SeqCst) {
          // 待机：等待信号再查看状态
          // Standby: wait for a signal, then re-check
          tokio::select! {
            _ = self.signal.notified() => {}
            _ = tokio::time::sleep(Duration::from_millis(500)) => {}
          }
          continue;
        }

        let available = self.pool.block_for_available_threads().await;
        if available == 0 || self.is_halted() {
          break;
        }

        let now = self.clock.now();
        let no_later_than =
          now + ChronoDuration::from_std(self.idle_wait_time).unwrap_or(ChronoDuration::seconds(30));
        let max_count = available.min(self.batch_max_count);
        let window = ChronoDuration::from_std(self.batch_time_window)
          .unwrap_or(ChronoDuration::zero());

        let acquired = match self
          .store
          .acquire_next_triggers(no_later_than, max_count, window)
          .await
        {
          Ok(acquired) => acquired,
          Err(err) => {
            tracing::error!(error = %err, "trigger acquisition failed");
            tokio::select! {
              _ = tokio::time::sleep(self.db_failure_retry_interval) => {}
              _ = self.signal.notified() => {}
            }
            continue;
          }
        };

        if acquired.is_empty() {
          // 无事可做：睡到空转上限或被新触发器唤醒
          // Nothing to do: sleep until the idle cap or a new-trigger
          // wake-up
          tokio::select! {
            _ = tokio::time::sleep(self.idle_wait_time) => {}
            _ = self.signal.notified() => {}
          }
          continue;
        }

        // 睡到最早触发时刻的提前量之内；期间更早触发器到来则释放
        // 本批并重新规划
        // Sleep until within the lead of the earliest fire instant; if
        // an earlier trigger arrives meanwhile, release this batch and
        // re-plan
        if !self.wait_until_fire_time(&acquired).await {
          for entry in &acquired {
            if let Err(err) = self.store.release_acquired_trigger(entry).await {
              tracing::warn!(error = %err, "failed to release acquired trigger");
            }
          }
          continue;
        }
        if self.is_halted() {
          for entry in &acquired {
            let _ = self.store.release_acquired_trigger(entry).await;
          }
          break;
        }

        let results = match self.store.triggers_fired(&acquired).await {
          Ok(results) => results,
          Err(err) => {
            tracing::error!(error = %err, "confirming fired triggers failed");
            for entry in &acquired {
              let _ = self.store.release_acquired_trigger(entry).await;
            }
            continue;
          }
        };

        for (entry, result) in acquired.into_iter().zip(results) {
          match result {
            TriggerFiredResult::Fired(bundle) => {
              self.dispatch(*bundle).await;
            }
            TriggerFiredResult::Skipped { trigger_key, reason } => {
              tracing::debug!(trigger = %trigger_key, reason, "trigger skipped");
              if let Err(err) = self.store.release_acquired_trigger(&entry).await {
                tracing::warn!(error = %err, "failed to release skipped trigger");
              }
            }
          }
        }
      }
      tracing::debug!(instance = %self.instance_id, "scheduling loop stopped");
    })
  }

  /// 睡到最早触发时刻；返回 false 表示需要释放并重新规划
  /// Sleep until the earliest fire instant; false means release and
  /// re-plan
  async fn wait_until_fire_time(&self, acquired: &[AcquiredTrigger]) -> bool {
    let earliest = acquired
      .iter()
      .filter_map(|entry| entry.trigger.next_fire_time())
      .min();
    let fire_at = match earliest {
      Some(fire_at) => fire_at,
      None => return true,
    };
    loop {
      let lead = fire_at - self.clock.now();
      if lead.num_milliseconds() <= TRIGGER_FIRE_AHEAD_MILLIS {
        return true;
      }
      let sleep_for = (lead - ChronoDuration::milliseconds(TRIGGER_FIRE_AHEAD_MILLIS))
        .to_std()
        .unwrap_or(Duration::from_millis(1));
      tokio::select! {
        _ = tokio::time::sleep(sleep_for) => {}
        _ = self.signal.notified() => {
          // 新触发器可能更早；释放本批重新规划
          // A new trigger may be earlier; release this batch and re-plan
          return false;
        }
      }
    }
  }

  /// 把一次触发交给工作者池执行
  /// Hand one firing to the worker pool
  async fn dispatch(&self, bundle: TriggerFiredBundle) {
    let trigger_key = bundle.trigger.key().clone();
    let store = self.store.clone();
    let listeners = self.listeners.clone();
    let job_factory = self.job_factory.clone();
    let cancellations = self.cancellations.clone();
    let instance_id = self.instance_id.clone();
    let signal = self.signal.clone();

    let submitted = self
      .pool
      .run_in_thread(async move {
        run_job(
          store,
          listeners,
          job_factory,
          cancellations,
          instance_id,
          bundle,
        )
        .await;
        // 完成使触发器回到等待态；唤醒调度循环立即重新规划
        // Completion returns the trigger to the waiting state; wake the
        // scheduling loop to re-plan immediately
        signal.notify_one();
      })
      .await;

    if !submitted {
      tracing::warn!(
        trigger = %trigger_key,
        "worker pool refused a firing during shutdown"
      );
    }
  }
}

/// 单次触发的执行管线
/// Execution pipeline of one firing
///
/// 每次触发：监听器 `trigger_fired`（可否决）→ `job_to_be_executed` →
/// 作业执行 → 完成回写（数据映射持久化在监听器看到
/// `job_was_executed` 之前提交）→ `job_was_executed` →
/// `trigger_complete`。
/// Per firing: listeners `trigger_fired` (vetoable) →
/// `job_to_be_executed` → job execution → completion write-back (the
/// data-map persistence commits before listeners see
/// `job_was_executed`) → `job_was_executed` → `trigger_complete`.
async fn run_job(
  store: Arc<dyn JobStore>,
  listeners: Arc<ListenerManager>,
  job_factory: Arc<dyn JobFactory>,
  cancellations: CancellationMap,
  instance_id: String,
  bundle: TriggerFiredBundle,
) {
  let interrupt_token = CancellationToken::new();
  let mut ctx = JobExecutionContext {
    scheduler_instance_id: instance_id,
    fire_instance_id: bundle.fire_instance_id.clone(),
    job_detail: bundle.job.clone(),
    trigger: bundle.trigger.clone(),
    calendar: bundle.calendar.clone(),
    merged_job_data: bundle.job.job_data.clone(),
    fire_time: bundle.fire_time,
    scheduled_fire_time: Some(bundle.scheduled_fire_time),
    previous_fire_time: bundle.previous_fire_time,
    next_fire_time: bundle.next_fire_time,
    recovering: bundle.recovering,
    refire_count: 0,
    result: None,
    interrupt_token: interrupt_token.clone(),
  };

  cancellations.add(
    bundle.fire_instance_id.clone(),
    bundle.job.key.clone(),
    interrupt_token,
  );

  // 否决路径
  // The veto path
  if listeners.notify_trigger_fired(&ctx).await {
    cancellations.remove(&bundle.fire_instance_id);
    listeners.notify_job_execution_vetoed(&ctx).await;
    if let Err(err) = store
      .triggered_job_complete(
        &bundle,
        &bundle.job,
        CompletedExecutionInstruction::SetTriggerComplete,
      )
      .await
    {
      tracing::error!(error = %err, "completion write-back after veto failed");
    }
    listeners
      .notify_trigger_complete(&ctx, CompletedExecutionInstruction::SetTriggerComplete)
      .await;
    return;
  }

  loop {
    listeners.notify_job_to_be_executed(&ctx).await;

    let job = match job_factory.new_job(&bundle.job) {
      Ok(job) => job,
      Err(err) => {
        // 实例化失败会波及该作业的所有触发器
        // An instantiation failure poisons all of the job's triggers
        tracing::error!(job = %bundle.job.key, error = %err, "job instantiation failed");
        cancellations.remove(&bundle.fire_instance_id);
        complete(
          &store,
          &listeners,
          &ctx,
          &bundle,
          CompletedExecutionInstruction::SetAllJobTriggersError,
          None,
        )
        .await;
        return;
      }
    };

    let execution = job.execute(&mut ctx).await;

    match execution {
      Err(err) if err.refire_immediately => {
        tracing::info!(job = %bundle.job.key, "job requested immediate refire");
        listeners.notify_job_was_executed(&ctx, Some(&err)).await;
        ctx.refire_count += 1;
        continue;
      }
      other => {
        let (instruction, error) = match other {
          Ok(()) => (CompletedExecutionInstruction::NoInstruction, None),
          Err(err) => {
            let instruction = if err.unschedule_all_triggers {
              CompletedExecutionInstruction::SetAllJobTriggersComplete
            } else if err.unschedule_firing_trigger {
              CompletedExecutionInstruction::DeleteTrigger
            } else {
              CompletedExecutionInstruction::NoInstruction
            };
            tracing::warn!(job = %bundle.job.key, error = %err, "job execution failed");
            (instruction, Some(err))
          }
        };
        cancellations.remove(&bundle.fire_instance_id);
        complete(&store, &listeners, &ctx, &bundle, instruction, error.as_ref()).await;
        return;
      }
    }
  }
}

/// 完成回写与收尾事件
/// Completion write-back and closing events
async fn complete(
  store: &Arc<dyn JobStore>,
  listeners: &Arc<ListenerManager>,
  ctx: &JobExecutionContext,
  bundle: &TriggerFiredBundle,
  instruction: CompletedExecutionInstruction,
  error: Option<&crate::job::JobExecutionError>,
) {
  // 作业可能改写了数据映射；持久化与否由存储按作业标志决定，并在
  // 监听器看到 job_was_executed 之前提交
  // The job may have mutated the data map; the store persists it per the
  // job's flag, committing before listeners see job_was_executed
  let mut job_for_completion = bundle.job.clone();
  if job_for_completion.persist_job_data_after_execution {
    job_for_completion.job_data = ctx.merged_job_data.clone();
  }
  if let Err(err) = store
    .triggered_job_complete(bundle, &job_for_completion, instruction)
    .await
  {
    tracing::error!(error = %err, "completion write-back failed");
  }

  listeners.notify_job_was_executed(ctx, error).await;
  listeners.notify_trigger_complete(ctx, instruction).await;

  if instruction == CompletedExecutionInstruction::NoInstruction
    && bundle.next_fire_time.is_none()
  {
    let trigger_key = bundle.trigger.key().clone();
    listeners
      .broadcast_scheduler_event(|l| {
        let key = trigger_key.clone();
        async move { l.trigger_finalized(&key).await }
      })
      .await;
  }
}
