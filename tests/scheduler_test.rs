//! 调度器端到端测试（内存存储 + 真实时钟，短间隔）
//! End-to-end scheduler tests (in-memory store + real clock, short
//! intervals)

use async_trait::async_trait;
use chrono::Utc;
use quartz_rs::config::SchedulerConfig;
use quartz_rs::job::{JobDetail, JobExecutionContext, JobRegistry};
use quartz_rs::key::JobKey;
use quartz_rs::listener::TriggerListener;
use quartz_rs::memdb::RamJobStore;
use quartz_rs::server::Scheduler;
use quartz_rs::triggers::{SimpleScheduleBuilder, Trigger};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn test_config() -> SchedulerConfig {
  SchedulerConfig::default()
    .instance_name("TestScheduler")
    .instance_id("AUTO")
    .thread_count(4)
    .batch_trigger_acquisition_max_count(4)
}

fn scheduler_with(registry: JobRegistry) -> Scheduler {
  Scheduler::new(
    test_config(),
    Arc::new(RamJobStore::new()),
    Arc::new(registry),
  )
  .unwrap()
}

#[tokio::test]
async fn repeating_trigger_executes_repeat_count_plus_one_times() {
  let counter = Arc::new(AtomicUsize::new(0));
  let mut registry = JobRegistry::new();
  {
    let counter = counter.clone();
    registry.register_func("count", move |_ctx| {
      counter.fetch_add(1, Ordering::SeqCst);
      Ok(())
    });
  }

  let scheduler = scheduler_with(registry);
  scheduler.start().await.unwrap();

  let job = JobDetail::builder()
    .of_type("count")
    .with_identity("counting", "g")
    .build()
    .unwrap();
  let trigger = Trigger::builder()
    .with_identity("count-5", "g")
    .for_job(job.key.clone())
    .start_at(Utc::now())
    .with_schedule(
      SimpleScheduleBuilder::with_interval(chrono::Duration::milliseconds(100))
        .with_repeat_count(4),
    )
    .build()
    .unwrap();

  scheduler.schedule_job(job, trigger).await.unwrap();
  tokio::time::sleep(Duration::from_millis(1_500)).await;
  scheduler.shutdown(true).await.unwrap();

  assert_eq!(counter.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn concurrency_disallowed_executions_never_overlap() {
  let overlap_seen = Arc::new(AtomicUsize::new(0));
  let in_flight = Arc::new(AtomicUsize::new(0));
  let runs = Arc::new(AtomicUsize::new(0));

  let mut registry = JobRegistry::new();
  {
    let overlap_seen = overlap_seen.clone();
    let in_flight = in_flight.clone();
    let runs = runs.clone();
    registry.register("serial", move || {
      Arc::new(SleepyJob {
        overlap_seen: overlap_seen.clone(),
        in_flight: in_flight.clone(),
        runs: runs.clone(),
      }) as Arc<dyn quartz_rs::job::Job>
    });
  }

  struct SleepyJob {
    overlap_seen: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
    runs: Arc<AtomicUsize>,
  }

  #[async_trait]
  impl quartz_rs::job::Job for SleepyJob {
    async fn execute(
      &self,
      _ctx: &mut JobExecutionContext,
    ) -> Result<(), quartz_rs::job::JobExecutionError> {
      if self.in_flight.fetch_add(1, Ordering::SeqCst) > 0 {
        self.overlap_seen.fetch_add(1, Ordering::SeqCst);
      }
      tokio::time::sleep(Duration::from_millis(120)).await;
      self.in_flight.fetch_sub(1, Ordering::SeqCst);
      self.runs.fetch_add(1, Ordering::SeqCst);
      Ok(())
    }
  }

  let scheduler = scheduler_with(registry);
  scheduler.start().await.unwrap();

  let job = JobDetail::builder()
    .of_type("serial")
    .with_identity("serial", "g")
    .store_durably()
    .disallow_concurrent_execution()
    .build()
    .unwrap();
  scheduler.add_job(job.clone(), false).await.unwrap();

  // 两支触发器同刻指向同一个禁并发作业
  // Two triggers aim at the same concurrency-disallowed job at once
  for name in ["a", "b"] {
    let trigger = Trigger::builder()
      .with_identity(name, "g")
      .for_job(job.key.clone())
      .start_at(Utc::now())
      .with_schedule(SimpleScheduleBuilder::once())
      .build()
      .unwrap();
    scheduler.schedule_trigger(trigger).await.unwrap();
  }

  tokio::time::sleep(Duration::from_millis(900)).await;
  scheduler.shutdown(true).await.unwrap();

  assert_eq!(runs.load(Ordering::SeqCst), 2);
  assert_eq!(overlap_seen.load(Ordering::SeqCst), 0, "executions overlapped");
}

#[tokio::test]
async fn vetoed_execution_never_runs_the_job() {
  struct VetoAll;

  #[async_trait]
  impl TriggerListener for VetoAll {
    fn name(&self) -> &str {
      "veto-all"
    }

    async fn veto_job_execution(&self, _ctx: &JobExecutionContext) -> bool {
      true
    }
  }

  let counter = Arc::new(AtomicUsize::new(0));
  let mut registry = JobRegistry::new();
  {
    let counter = counter.clone();
    registry.register_func("vetoed", move |_ctx| {
      counter.fetch_add(1, Ordering::SeqCst);
      Ok(())
    });
  }

  let scheduler = scheduler_with(registry);
  scheduler.add_trigger_listener(Arc::new(VetoAll));
  scheduler.start().await.unwrap();

  let job = JobDetail::builder()
    .of_type("vetoed")
    .with_identity("vetoed", "g")
    .build()
    .unwrap();
  let trigger = Trigger::builder()
    .for_job(job.key.clone())
    .start_at(Utc::now())
    .with_schedule(SimpleScheduleBuilder::once())
    .build()
    .unwrap();
  scheduler.schedule_job(job, trigger).await.unwrap();

  tokio::time::sleep(Duration::from_millis(400)).await;
  scheduler.shutdown(true).await.unwrap();

  assert_eq!(counter.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn job_data_mutation_persists_when_flag_is_set() {
  let mut registry = JobRegistry::new();
  registry.register_func("accumulate", |ctx| {
    let so_far = ctx.merged_job_data.get_i64("count").unwrap_or(0);
    ctx.merged_job_data.put("count", so_far + 1);
    Ok(())
  });

  let scheduler = scheduler_with(registry);
  scheduler.start().await.unwrap();

  let job = JobDetail::builder()
    .of_type("accumulate")
    .with_identity("acc", "g")
    .store_durably()
    .disallow_concurrent_execution()
    .persist_job_data_after_execution()
    .using_job_data("count", 0)
    .build()
    .unwrap();
  let trigger = Trigger::builder()
    .with_identity("acc", "g")
    .for_job(job.key.clone())
    .start_at(Utc::now())
    .with_schedule(
      SimpleScheduleBuilder::with_interval(chrono::Duration::milliseconds(100))
        .with_repeat_count(2),
    )
    .build()
    .unwrap();
  scheduler.schedule_job(job.clone(), trigger).await.unwrap();

  tokio::time::sleep(Duration::from_millis(900)).await;
  scheduler.shutdown(true).await.unwrap();

  let stored = scheduler.get_job_detail(&job.key).await.unwrap().unwrap();
  assert_eq!(stored.job_data.get_i64("count"), Some(3));
}

#[tokio::test]
async fn interrupt_cancels_running_executions_of_the_job() {
  let interrupted = Arc::new(AtomicUsize::new(0));
  let mut registry = JobRegistry::new();
  {
    let interrupted = interrupted.clone();
    registry.register("stuck", move || {
      Arc::new(StuckJob {
        interrupted: interrupted.clone(),
      }) as Arc<dyn quartz_rs::job::Job>
    });
  }

  struct StuckJob {
    interrupted: Arc<AtomicUsize>,
  }

  #[async_trait]
  impl quartz_rs::job::Job for StuckJob {
    async fn execute(
      &self,
      ctx: &mut JobExecutionContext,
    ) -> Result<(), quartz_rs::job::JobExecutionError> {
      tokio::select! {
        _ = ctx.interrupt_token.cancelled() => {
          self.interrupted.fetch_add(1, Ordering::SeqCst);
          Ok(())
        }
        _ = tokio::time::sleep(Duration::from_secs(30)) => {
          Err(quartz_rs::job::JobExecutionError::new("was never interrupted"))
        }
      }
    }
  }

  let scheduler = scheduler_with(registry);
  scheduler.start().await.unwrap();

  let job = JobDetail::builder()
    .of_type("stuck")
    .with_identity("stuck", "g")
    .build()
    .unwrap();
  let job_key = job.key.clone();
  let trigger = Trigger::builder()
    .for_job(job.key.clone())
    .start_at(Utc::now())
    .with_schedule(SimpleScheduleBuilder::once())
    .build()
    .unwrap();
  scheduler.schedule_job(job, trigger).await.unwrap();

  // 等作业进入执行再中断
  // Wait for the job to start executing, then interrupt
  let mut hit = 0;
  for _ in 0..50 {
    tokio::time::sleep(Duration::from_millis(50)).await;
    hit = scheduler.interrupt(&job_key);
    if hit > 0 {
      break;
    }
  }
  assert_eq!(hit, 1, "the execution was never seen running");

  scheduler.shutdown(true).await.unwrap();
  assert_eq!(interrupted.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn standby_stops_firing_until_restarted() {
  let counter = Arc::new(AtomicUsize::new(0));
  let mut registry = JobRegistry::new();
  {
    let counter = counter.clone();
    registry.register_func("tick", move |_ctx| {
      counter.fetch_add(1, Ordering::SeqCst);
      Ok(())
    });
  }

  let scheduler = scheduler_with(registry);
  scheduler.start().await.unwrap();
  scheduler.standby().await.unwrap();
  assert!(scheduler.is_in_standby_mode());

  let job = JobDetail::builder()
    .of_type("tick")
    .with_identity("tick", "g")
    .build()
    .unwrap();
  let trigger = Trigger::builder()
    .for_job(job.key.clone())
    .start_at(Utc::now())
    .with_schedule(SimpleScheduleBuilder::once())
    .build()
    .unwrap();
  scheduler.schedule_job(job, trigger).await.unwrap();

  tokio::time::sleep(Duration::from_millis(300)).await;
  assert_eq!(counter.load(Ordering::SeqCst), 0, "fired while in standby");

  scheduler.start().await.unwrap();
  tokio::time::sleep(Duration::from_millis(500)).await;
  scheduler.shutdown(true).await.unwrap();
  assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn non_durable_job_without_trigger_is_rejected() {
  let scheduler = scheduler_with(JobRegistry::new());
  let job = JobDetail::builder()
    .of_type("noop")
    .with_identity("floating", "g")
    .build()
    .unwrap();
  assert!(scheduler.add_job(job, false).await.is_err());
}

#[tokio::test]
async fn trigger_job_fires_a_stored_durable_job_once() {
  let counter = Arc::new(AtomicUsize::new(0));
  let mut registry = JobRegistry::new();
  {
    let counter = counter.clone();
    registry.register_func("manual", move |_ctx| {
      counter.fetch_add(1, Ordering::SeqCst);
      Ok(())
    });
  }

  let scheduler = scheduler_with(registry);
  scheduler.start().await.unwrap();

  let job = JobDetail::builder()
    .of_type("manual")
    .with_identity("manual", "g")
    .store_durably()
    .build()
    .unwrap();
  scheduler.add_job(job, false).await.unwrap();
  scheduler
    .trigger_job(&JobKey::new("manual", "g"), None)
    .await
    .unwrap();

  tokio::time::sleep(Duration::from_millis(500)).await;
  scheduler.shutdown(true).await.unwrap();
  assert_eq!(counter.load(Ordering::SeqCst), 1);
}
