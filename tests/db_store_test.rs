//! 持久化存储测试（SQLite 文件库）
//! Persistent store tests (file-backed SQLite)
//!
//! SQLite 走单行 UPDATE 锁策略；语义必须与内存存储一致，另加集群
//! 接管路径。
//! SQLite exercises the single-row UPDATE lock strategy; semantics must
//! match the in-memory store, plus the cluster takeover path.

use chrono::{DateTime, Duration, TimeZone, Utc};
use quartz_rs::backend::dbstore::{DatabaseJobStore, RECOVERING_TRIGGER_GROUP};
use quartz_rs::job::{JobDetail, RECOVERING_FIRE_TIME_KEY, RECOVERING_JOB_KEY};
use quartz_rs::key::{JobKey, TriggerKey};
use quartz_rs::store::{
  CompletedExecutionInstruction, JobStore, TriggerFiredResult, TriggerStoreState,
};
use quartz_rs::time::ManualClock;
use quartz_rs::triggers::{
  CronScheduleBuilder, CustomCalendarScheduleBuilder, IntervalUnit, OperableTrigger,
  SimpleScheduleBuilder, Trigger,
};
use std::sync::Arc;

fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
  Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
}

fn sqlite_url(tag: &str) -> String {
  let path = std::env::temp_dir().join(format!(
    "quartz_rs_test_{}_{}.sqlite",
    tag,
    std::process::id()
  ));
  let _ = std::fs::remove_file(&path);
  format!("sqlite://{}?mode=rwc", path.display())
}

async fn store_at(
  tag: &str,
  instance: &str,
  clustered: bool,
  start: DateTime<Utc>,
) -> (DatabaseJobStore, Arc<ManualClock>) {
  let clock = ManualClock::starting_at(start);
  let store = DatabaseJobStore::connect(&sqlite_url(tag), "TEST_SCHED", instance, clustered)
    .await
    .unwrap()
    .with_clock(clock.clone());
  (store, clock)
}

fn durable_job(name: &str, recovery: bool) -> JobDetail {
  let builder = JobDetail::builder()
    .of_type("noop")
    .with_identity(name, "g")
    .store_durably();
  let builder = if recovery {
    builder.request_recovery()
  } else {
    builder
  };
  builder.build().unwrap()
}

#[tokio::test]
async fn trigger_round_trip_through_subtype_tables() {
  let start = utc(2024, 7, 15, 5, 0, 0);
  let (store, _clock) = store_at("roundtrip", "A", false, start).await;
  let job = durable_job("j", false);
  store.store_job(job.clone(), false).await.unwrap();

  let mut triggers = vec![
    Trigger::builder()
      .with_identity("simple", "g")
      .for_job(job.key.clone())
      .start_at(start)
      .with_schedule(SimpleScheduleBuilder::with_interval_in_seconds(30).with_repeat_count(9))
      .build()
      .unwrap(),
    Trigger::builder()
      .with_identity("cron", "g")
      .for_job(job.key.clone())
      .start_at(start)
      .with_schedule(CronScheduleBuilder::cron_schedule("0 0 6 ? * MON-FRI"))
      .build()
      .unwrap(),
    Trigger::builder()
      .with_identity("custom", "g")
      .for_job(job.key.clone())
      .start_at(start)
      .with_schedule(
        CustomCalendarScheduleBuilder::with_interval(2, IntervalUnit::Month)
          .by_month_day("1,15,31")
          .with_repeat_count(500),
      )
      .build()
      .unwrap(),
  ];

  for trigger in &mut triggers {
    trigger.compute_first_fire_time(None);
    store.store_trigger(trigger.clone(), false).await.unwrap();
  }

  for trigger in &triggers {
    let loaded = store.retrieve_trigger(trigger.key()).await.unwrap().unwrap();
    assert_eq!(&loaded, trigger, "{} changed across the store", trigger.key());
  }
}

#[tokio::test]
async fn acquire_fire_complete_cycle_on_sqlite() {
  let start = utc(2024, 7, 15, 5, 0, 0);
  let (store, _clock) = store_at("cycle", "A", false, start).await;
  let job = durable_job("j", false);
  store.store_job(job.clone(), false).await.unwrap();

  let mut trigger = Trigger::builder()
    .with_identity("t", "g")
    .for_job(job.key.clone())
    .start_at(start)
    .with_schedule(SimpleScheduleBuilder::with_interval_in_seconds(60).repeat_forever())
    .build()
    .unwrap();
  trigger.compute_first_fire_time(None);
  store.store_trigger(trigger, false).await.unwrap();

  let acquired = store
    .acquire_next_triggers(start + Duration::seconds(30), 4, Duration::zero())
    .await
    .unwrap();
  assert_eq!(acquired.len(), 1);
  assert_eq!(
    store
      .get_trigger_state(acquired[0].trigger.key())
      .await
      .unwrap(),
    TriggerStoreState::Acquired
  );

  // 再次获取拿不到同一触发
  // A second acquisition cannot take the same firing
  let again = store
    .acquire_next_triggers(start + Duration::seconds(30), 4, Duration::zero())
    .await
    .unwrap();
  assert!(again.is_empty());

  let results = store.triggers_fired(&acquired).await.unwrap();
  let bundle = match &results[0] {
    TriggerFiredResult::Fired(bundle) => bundle.as_ref().clone(),
    TriggerFiredResult::Skipped { reason, .. } => panic!("skipped: {reason}"),
  };
  assert_eq!(bundle.scheduled_fire_time, start);
  assert_eq!(store.number_of_executing_triggers().await.unwrap(), 1);

  store
    .triggered_job_complete(&bundle, &bundle.job, CompletedExecutionInstruction::NoInstruction)
    .await
    .unwrap();
  assert_eq!(store.number_of_executing_triggers().await.unwrap(), 0);
  assert_eq!(
    store.get_trigger_state(bundle.trigger.key()).await.unwrap(),
    TriggerStoreState::Waiting
  );
}

#[tokio::test]
async fn failed_instance_work_is_taken_over() {
  let start = utc(2024, 7, 15, 5, 0, 0);
  let url = sqlite_url("failover");
  let clock = ManualClock::starting_at(start);

  let store_a = DatabaseJobStore::connect(&url, "TEST_SCHED", "instance-A", true)
    .await
    .unwrap()
    .with_clock(clock.clone())
    .with_cluster_checkin_interval(Duration::milliseconds(7_500));
  let store_b = DatabaseJobStore::from_connection(
    sea_orm::Database::connect(url.as_str()).await.unwrap(),
    "TEST_SCHED",
    "instance-B",
    true,
  )
  .with_clock(clock.clone())
  .with_cluster_checkin_interval(Duration::milliseconds(7_500));

  // A 调度一个请求恢复的作业并获取其触发器
  // A schedules a recovery-requesting job and acquires its trigger
  let job = durable_job("recoverable", true);
  store_a.store_job(job.clone(), false).await.unwrap();
  let mut trigger = Trigger::builder()
    .with_identity("t", "g")
    .for_job(job.key.clone())
    .start_at(start)
    .with_schedule(SimpleScheduleBuilder::with_interval_in_seconds(60).repeat_forever())
    .build()
    .unwrap();
  trigger.compute_first_fire_time(None);
  store_a.store_trigger(trigger, false).await.unwrap();

  store_a.cluster_checkin().await.unwrap();
  let acquired = store_a
    .acquire_next_triggers(start + Duration::seconds(30), 1, Duration::zero())
    .await
    .unwrap();
  assert_eq!(acquired.len(), 1);
  let fired_at = clock.now();

  // A 停止心跳；两个检查间隔之后 B 必须接管
  // A stops heartbeating; after two check-in intervals B must take over
  clock.advance_millis(7_500 * 2 + 1_000);
  let outcome = store_b.cluster_checkin().await.unwrap();
  assert_eq!(outcome.failed_instances, vec!["instance-A".to_string()]);
  assert!(outcome.recovered_triggers >= 1);
  assert_eq!(outcome.recovery_triggers_scheduled, 1);

  // (a) A 的触发记录消失，原触发器回到 WAITING
  // (a) A's firing records are gone and the original trigger is WAITING
  assert_eq!(store_a.number_of_executing_triggers().await.unwrap(), 0);
  assert_eq!(
    store_b
      .get_trigger_state(&TriggerKey::new("t", "g"))
      .await
      .unwrap(),
    TriggerStoreState::Waiting
  );

  // (b) 一次性恢复触发器按 A 原本的触发时刻排期
  // (b) The one-shot recovery trigger is scheduled at A's original
  // fired time
  let recovery_keys = store_b
    .get_trigger_keys(RECOVERING_TRIGGER_GROUP)
    .await
    .unwrap();
  assert_eq!(recovery_keys.len(), 1);
  let recovery = store_b
    .retrieve_trigger(&recovery_keys[0])
    .await
    .unwrap()
    .unwrap();
  assert_eq!(recovery.job_key(), &JobKey::new("recoverable", "g"));
  assert_eq!(recovery.next_fire_time(), Some(fired_at));

  // 原触发时刻写进了作业数据映射
  // The original fire instant was written into the job data map
  let recovered_job = store_b.retrieve_job(&job.key).await.unwrap().unwrap();
  assert_eq!(
    recovered_job.job_data.get_i64(RECOVERING_FIRE_TIME_KEY),
    Some(fired_at.timestamp_millis())
  );
  assert_eq!(
    recovered_job.job_data.get_str(RECOVERING_JOB_KEY),
    Some("g.t")
  );

  // 再跑一次检查：没有新的失效实例
  // Another check-in pass: no further failed instances
  let outcome = store_b.cluster_checkin().await.unwrap();
  assert!(outcome.failed_instances.is_empty());
}

#[tokio::test]
async fn misfired_trigger_is_corrected_during_acquisition() {
  let start = utc(2024, 7, 15, 5, 0, 0);
  let (store, clock) = store_at("misfire", "A", false, start).await;
  let job = durable_job("j", false);
  store.store_job(job.clone(), false).await.unwrap();

  let mut trigger = Trigger::builder()
    .with_identity("t", "g")
    .for_job(job.key.clone())
    .start_at(start)
    .with_schedule(
      CronScheduleBuilder::cron_schedule("0 0 6 * * ?")
        .with_misfire_handling_instruction_do_nothing(),
    )
    .build()
    .unwrap();
  trigger.compute_first_fire_time(None);
  store.store_trigger(trigger, false).await.unwrap();

  // 越过 06:00 两小时再尝试获取
  // Cross 06:00 by two hours, then try to acquire
  clock.set(utc(2024, 7, 15, 8, 0, 0));
  let acquired = store
    .acquire_next_triggers(clock.now() + Duration::seconds(30), 4, Duration::zero())
    .await
    .unwrap();
  assert!(acquired.is_empty());

  let corrected = store
    .retrieve_trigger(&TriggerKey::new("t", "g"))
    .await
    .unwrap()
    .unwrap();
  assert_eq!(corrected.next_fire_time(), Some(utc(2024, 7, 16, 6, 0, 0)));
}
