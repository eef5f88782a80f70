//! 内存存储语义测试
//! In-memory store semantics tests

use chrono::{DateTime, Duration, TimeZone, Utc};
use quartz_rs::calendar::{CalendarVariant, HolidayCalendar};
use quartz_rs::job::JobDetail;
use quartz_rs::key::{JobKey, TriggerKey};
use quartz_rs::memdb::RamJobStore;
use quartz_rs::store::{
  CompletedExecutionInstruction, JobStore, TriggerFiredResult, TriggerStoreState,
};
use quartz_rs::time::ManualClock;
use quartz_rs::triggers::{OperableTrigger, SimpleScheduleBuilder, Trigger};
use std::sync::Arc;

fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
  Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
}

fn job(name: &str) -> JobDetail {
  JobDetail::builder()
    .of_type("noop")
    .with_identity(name, "g")
    .store_durably()
    .build()
    .unwrap()
}

fn repeating_trigger(name: &str, job_key: &JobKey, start: DateTime<Utc>, priority: i32) -> Trigger {
  let mut trigger = Trigger::builder()
    .with_identity(name, "g")
    .for_job(job_key.clone())
    .start_at(start)
    .with_priority(priority)
    .with_schedule(SimpleScheduleBuilder::with_interval_in_seconds(60).repeat_forever())
    .build()
    .unwrap();
  trigger.compute_first_fire_time(None);
  trigger
}

fn store_at(start: DateTime<Utc>) -> (Arc<RamJobStore>, Arc<ManualClock>) {
  let clock = ManualClock::starting_at(start);
  let store = Arc::new(RamJobStore::with_clock(clock.clone()));
  (store, clock)
}

#[tokio::test]
async fn acquisition_orders_by_time_then_priority() {
  let start = utc(2024, 7, 15, 5, 0, 0);
  let (store, _clock) = store_at(start);
  let job = job("j");
  store.store_job(job.clone(), false).await.unwrap();

  // late 先到期，low/high 同刻但优先级不同
  // `late` is due later; `low`/`high` share an instant with different
  // priorities
  store
    .store_trigger(repeating_trigger("low", &job.key, start + Duration::seconds(1), 1), false)
    .await
    .unwrap();
  store
    .store_trigger(repeating_trigger("high", &job.key, start + Duration::seconds(1), 9), false)
    .await
    .unwrap();
  store
    .store_trigger(repeating_trigger("early", &job.key, start, 5), false)
    .await
    .unwrap();

  let acquired = store
    .acquire_next_triggers(start + Duration::seconds(30), 3, Duration::seconds(5))
    .await
    .unwrap();
  let names: Vec<&str> = acquired
    .iter()
    .map(|a| a.trigger.key().name.as_str())
    .collect();
  assert_eq!(names, vec!["early", "high", "low"]);
}

#[tokio::test]
async fn acquisition_is_at_most_once() {
  let start = utc(2024, 7, 15, 5, 0, 0);
  let (store, _clock) = store_at(start);
  let job = job("j");
  store.store_job(job.clone(), false).await.unwrap();
  store
    .store_trigger(repeating_trigger("t", &job.key, start, 5), false)
    .await
    .unwrap();

  let first = store
    .acquire_next_triggers(start + Duration::seconds(30), 5, Duration::zero())
    .await
    .unwrap();
  assert_eq!(first.len(), 1);
  assert_eq!(
    store.get_trigger_state(first[0].trigger.key()).await.unwrap(),
    TriggerStoreState::Acquired
  );

  let second = store
    .acquire_next_triggers(start + Duration::seconds(30), 5, Duration::zero())
    .await
    .unwrap();
  assert!(second.is_empty(), "the same firing was acquired twice");
}

#[tokio::test]
async fn fire_and_complete_cycle_returns_to_waiting() {
  let start = utc(2024, 7, 15, 5, 0, 0);
  let (store, _clock) = store_at(start);
  let job = job("j");
  store.store_job(job.clone(), false).await.unwrap();
  store
    .store_trigger(repeating_trigger("t", &job.key, start, 5), false)
    .await
    .unwrap();

  let acquired = store
    .acquire_next_triggers(start + Duration::seconds(30), 1, Duration::zero())
    .await
    .unwrap();
  let results = store.triggers_fired(&acquired).await.unwrap();
  let bundle = match &results[0] {
    TriggerFiredResult::Fired(bundle) => bundle.as_ref().clone(),
    TriggerFiredResult::Skipped { reason, .. } => panic!("skipped: {reason}"),
  };
  assert_eq!(bundle.scheduled_fire_time, start);
  assert_eq!(bundle.next_fire_time, Some(start + Duration::seconds(60)));
  assert_eq!(
    store.get_trigger_state(bundle.trigger.key()).await.unwrap(),
    TriggerStoreState::Executing
  );

  store
    .triggered_job_complete(&bundle, &bundle.job, CompletedExecutionInstruction::NoInstruction)
    .await
    .unwrap();
  assert_eq!(
    store.get_trigger_state(bundle.trigger.key()).await.unwrap(),
    TriggerStoreState::Waiting
  );
}

#[tokio::test]
async fn concurrency_disallowed_blocks_siblings() {
  let start = utc(2024, 7, 15, 5, 0, 0);
  let (store, _clock) = store_at(start);
  let job = JobDetail::builder()
    .of_type("noop")
    .with_identity("serial", "g")
    .store_durably()
    .disallow_concurrent_execution()
    .build()
    .unwrap();
  store.store_job(job.clone(), false).await.unwrap();
  store
    .store_trigger(repeating_trigger("a", &job.key, start, 5), false)
    .await
    .unwrap();
  store
    .store_trigger(repeating_trigger("b", &job.key, start, 5), false)
    .await
    .unwrap();

  // 同批至多取同作业的一个触发器
  // At most one trigger of the job per batch
  let acquired = store
    .acquire_next_triggers(start + Duration::seconds(30), 5, Duration::seconds(5))
    .await
    .unwrap();
  assert_eq!(acquired.len(), 1);

  let results = store.triggers_fired(&acquired).await.unwrap();
  let bundle = match &results[0] {
    TriggerFiredResult::Fired(bundle) => bundle.as_ref().clone(),
    TriggerFiredResult::Skipped { reason, .. } => panic!("skipped: {reason}"),
  };

  // 兄弟触发器被阻塞，执行期间无法获取
  // The sibling is blocked and cannot be acquired while executing
  let sibling = TriggerKey::new("b", "g");
  assert_eq!(
    store.get_trigger_state(&sibling).await.unwrap(),
    TriggerStoreState::Blocked
  );
  let during = store
    .acquire_next_triggers(start + Duration::seconds(30), 5, Duration::seconds(5))
    .await
    .unwrap();
  assert!(during.is_empty());

  store
    .triggered_job_complete(&bundle, &bundle.job, CompletedExecutionInstruction::NoInstruction)
    .await
    .unwrap();
  assert_eq!(
    store.get_trigger_state(&sibling).await.unwrap(),
    TriggerStoreState::Waiting
  );
}

#[tokio::test]
async fn paused_triggers_are_not_acquired_and_resume_applies_misfire() {
  let start = utc(2024, 7, 15, 5, 0, 0);
  let (store, clock) = store_at(start);
  let job = job("j");
  store.store_job(job.clone(), false).await.unwrap();
  store
    .store_trigger(repeating_trigger("t", &job.key, start, 5), false)
    .await
    .unwrap();

  store.pause_trigger_group("g").await.unwrap();
  assert_eq!(store.get_paused_trigger_groups().await.unwrap(), vec!["g"]);
  let acquired = store
    .acquire_next_triggers(start + Duration::seconds(30), 5, Duration::zero())
    .await
    .unwrap();
  assert!(acquired.is_empty());

  // 暂停两小时后恢复：触发时刻必须被 misfire 策略推进到当前之后
  // Resume after two hours paused: the fire instant must be pushed past
  // now by the misfire policy
  clock.advance_secs(7200);
  store.resume_trigger_group("g").await.unwrap();
  let trigger = store
    .retrieve_trigger(&TriggerKey::new("t", "g"))
    .await
    .unwrap()
    .unwrap();
  assert!(trigger.next_fire_time().unwrap() >= clock.now());
}

#[tokio::test]
async fn misfire_scan_is_batched() {
  let start = utc(2024, 7, 15, 5, 0, 0);
  let (store, clock) = store_at(start);
  let job = job("j");
  store.store_job(job.clone(), false).await.unwrap();
  for i in 0..5 {
    store
      .store_trigger(repeating_trigger(&format!("t{i}"), &job.key, start, 5), false)
      .await
      .unwrap();
  }

  clock.advance_secs(600);
  let outcome = store.handle_misfires(2).await.unwrap();
  assert_eq!(outcome.handled, 2);
  assert!(outcome.has_more);

  let outcome = store.handle_misfires(10).await.unwrap();
  assert_eq!(outcome.handled, 3);
  assert!(!outcome.has_more);
}

#[tokio::test]
async fn calendar_update_recomputes_referencing_triggers() {
  let start = utc(2024, 7, 15, 5, 0, 0);
  let (store, _clock) = store_at(start);
  let job = job("j");
  store.store_job(job.clone(), false).await.unwrap();

  store
    .store_calendar(
      "holidays",
      CalendarVariant::Holiday(HolidayCalendar::default()),
      false,
      false,
    )
    .await
    .unwrap();

  let mut trigger = Trigger::builder()
    .with_identity("t", "g")
    .for_job(job.key.clone())
    .start_at(start)
    .modified_by_calendar("holidays")
    .with_schedule(SimpleScheduleBuilder::with_interval(Duration::hours(24)).repeat_forever())
    .build()
    .unwrap();
  trigger.compute_first_fire_time(None);
  store.store_trigger(trigger, false).await.unwrap();

  // 新日历排除 7 月 15 日，引用它的触发器被推进
  // The new calendar excludes July 15; the referencing trigger advances
  let mut excluded = HolidayCalendar::default();
  excluded
    .excluded_dates
    .insert(chrono::NaiveDate::from_ymd_opt(2024, 7, 15).unwrap());
  store
    .store_calendar("holidays", CalendarVariant::Holiday(excluded), true, true)
    .await
    .unwrap();

  let trigger = store
    .retrieve_trigger(&TriggerKey::new("t", "g"))
    .await
    .unwrap()
    .unwrap();
  assert_eq!(trigger.next_fire_time(), Some(start + Duration::hours(24)));
}

#[tokio::test]
async fn removing_last_trigger_removes_non_durable_job() {
  let start = utc(2024, 7, 15, 5, 0, 0);
  let (store, _clock) = store_at(start);
  let job = JobDetail::builder()
    .of_type("noop")
    .with_identity("ephemeral", "g")
    .build()
    .unwrap();
  let trigger = repeating_trigger("t", &job.key, start, 5);
  store.store_job_and_trigger(job.clone(), trigger).await.unwrap();

  assert!(store.remove_trigger(&TriggerKey::new("t", "g")).await.unwrap());
  assert!(!store.check_job_exists(&job.key).await.unwrap());
}

#[tokio::test]
async fn storing_duplicate_without_replace_fails() {
  let start = utc(2024, 7, 15, 5, 0, 0);
  let (store, _clock) = store_at(start);
  let job = job("j");
  store.store_job(job.clone(), false).await.unwrap();
  let err = store.store_job(job.clone(), false).await.unwrap_err();
  assert!(matches!(
    err,
    quartz_rs::SchedulerError::ObjectAlreadyExists(_)
  ));
  store.store_job(job, true).await.unwrap();
}
