//! 触发时刻序列的端到端校验
//! End-to-end checks of fire-instant sequences
//!
//! 覆盖五种触发器的契约属性（严格单调、日历包含、序列长度、构建器
//! 往返）与若干字面化场景。
//! Covers the contract properties of the five trigger kinds (strict
//! monotonicity, calendar inclusion, sequence length, builder
//! round-trip) plus several literal scenarios.

use chrono::{DateTime, Duration, TimeZone, Utc};
use quartz_rs::calendar::{Calendar, CalendarVariant, WeeklyCalendar};
use quartz_rs::key::JobKey;
use quartz_rs::time::TimeOfDay;
use quartz_rs::triggers::{
  CalendarIntervalScheduleBuilder, CronScheduleBuilder, CustomCalendarScheduleBuilder,
  DailyTimeIntervalScheduleBuilder, IntervalUnit, OperableTrigger, SimpleScheduleBuilder, Trigger,
};

fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
  Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
}

fn fire_times(trigger: &Trigger, from: DateTime<Utc>, n: usize) -> Vec<DateTime<Utc>> {
  let mut out = Vec::new();
  let mut after = from;
  for _ in 0..n {
    match trigger.get_fire_time_after(Some(after)) {
      Some(next) => {
        out.push(next);
        after = next;
      }
      None => break,
    }
  }
  out
}

fn all_variants(start: DateTime<Utc>) -> Vec<Trigger> {
  let job = JobKey::new("job", "g");
  vec![
    Trigger::builder()
      .with_identity("simple", "g")
      .for_job(job.clone())
      .start_at(start)
      .with_schedule(SimpleScheduleBuilder::with_interval_in_seconds(90).with_repeat_count(50))
      .build()
      .unwrap(),
    Trigger::builder()
      .with_identity("cron", "g")
      .for_job(job.clone())
      .start_at(start)
      .with_schedule(CronScheduleBuilder::cron_schedule("0 15 7,19 * * ?"))
      .build()
      .unwrap(),
    Trigger::builder()
      .with_identity("cal-int", "g")
      .for_job(job.clone())
      .start_at(start)
      .with_schedule(CalendarIntervalScheduleBuilder::with_interval(3, IntervalUnit::Day))
      .build()
      .unwrap(),
    Trigger::builder()
      .with_identity("daily", "g")
      .for_job(job.clone())
      .start_at(start)
      .with_schedule(
        DailyTimeIntervalScheduleBuilder::with_interval(2, IntervalUnit::Hour)
          .starting_daily_at(TimeOfDay::new(9, 0, 0).unwrap())
          .ending_daily_at(TimeOfDay::new(17, 0, 0).unwrap()),
      )
      .build()
      .unwrap(),
    Trigger::builder()
      .with_identity("custom", "g")
      .for_job(job)
      .start_at(start)
      .with_schedule(
        CustomCalendarScheduleBuilder::with_interval(1, IntervalUnit::Week).by_day("MO,TH"),
      )
      .build()
      .unwrap(),
  ]
}

#[test]
fn fire_time_sequences_are_strictly_monotonic() {
  let start = utc(2024, 7, 15, 5, 0, 0);
  for trigger in all_variants(start) {
    let fires = fire_times(&trigger, start - Duration::seconds(1), 20);
    assert!(!fires.is_empty(), "{} produced no fires", trigger.key());
    for pair in fires.windows(2) {
      assert!(
        pair[1] > pair[0],
        "{} is not strictly increasing: {:?}",
        trigger.key(),
        pair
      );
    }
  }
}

#[test]
fn calendar_excluded_instants_never_fire() {
  // 排除周末的日历
  // A calendar excluding weekends
  let calendar = CalendarVariant::Weekly(WeeklyCalendar::default());
  let start = utc(2024, 7, 12, 8, 0, 0);
  let job = JobKey::new("job", "g");
  let mut trigger = Trigger::builder()
    .with_identity("daily-noon", "g")
    .for_job(job)
    .start_at(start)
    .with_schedule(CronScheduleBuilder::cron_schedule("0 0 12 * * ?"))
    .build()
    .unwrap();

  trigger.compute_first_fire_time(Some(&calendar));
  for _ in 0..10 {
    let next = trigger.next_fire_time().unwrap();
    assert!(
      calendar.is_time_included(next),
      "calendar-excluded instant fired: {next}"
    );
    trigger.triggered(Some(&calendar));
  }
}

#[test]
fn finite_repeat_count_bounds_sequence_length() {
  let start = utc(2024, 7, 15, 5, 0, 0);
  let job = JobKey::new("job", "g");
  for repeat_count in [0, 1, 5, 12] {
    let mut trigger = Trigger::builder()
      .for_job(job.clone())
      .start_at(start)
      .with_schedule(
        SimpleScheduleBuilder::with_interval_in_seconds(10).with_repeat_count(repeat_count),
      )
      .build()
      .unwrap();
    let mut fired = 0;
    trigger.compute_first_fire_time(None);
    while trigger.next_fire_time().is_some() {
      fired += 1;
      trigger.triggered(None);
    }
    assert_eq!(fired, repeat_count as usize + 1);
  }
}

#[test]
fn end_time_caps_fire_count() {
  let start = utc(2024, 7, 15, 5, 0, 0);
  let mut trigger = Trigger::builder()
    .for_job(JobKey::new("job", "g"))
    .start_at(start)
    .end_at(start + Duration::seconds(45))
    .with_schedule(SimpleScheduleBuilder::with_interval_in_seconds(10).repeat_forever())
    .build()
    .unwrap();
  let mut fired = 0;
  trigger.compute_first_fire_time(None);
  while trigger.next_fire_time().is_some() {
    fired += 1;
    trigger.triggered(None);
  }
  // 0s, 10s, 20s, 30s, 40s
  assert_eq!(fired, 5);
}

#[test]
fn custom_calendar_weekly_literal_sequence() {
  let start = utc(2024, 7, 15, 5, 0, 0);
  let trigger = Trigger::builder()
    .for_job(JobKey::new("job", "g"))
    .start_at(start)
    .with_schedule(
      CustomCalendarScheduleBuilder::with_interval(1, IntervalUnit::Week)
        .by_day("SU,WE,TH,SA")
        .with_repeat_count(2),
    )
    .build()
    .unwrap();

  assert_eq!(
    fire_times(&trigger, start - Duration::milliseconds(1), 5),
    vec![
      utc(2024, 7, 17, 5, 0, 0),
      utc(2024, 7, 18, 5, 0, 0),
      utc(2024, 7, 20, 5, 0, 0),
      utc(2024, 7, 21, 5, 0, 0),
      utc(2024, 7, 24, 5, 0, 0),
    ]
  );
}

#[test]
fn custom_calendar_monthly_day_31_skips_short_months() {
  let start = utc(2024, 7, 15, 10, 0, 0);
  let trigger = Trigger::builder()
    .for_job(JobKey::new("job", "g"))
    .start_at(start)
    .with_schedule(
      CustomCalendarScheduleBuilder::with_interval(1, IntervalUnit::Month).by_month_day("31"),
    )
    .build()
    .unwrap();

  assert_eq!(
    fire_times(&trigger, start - Duration::milliseconds(1), 3),
    vec![
      utc(2024, 7, 31, 10, 0, 0),
      utc(2024, 8, 31, 10, 0, 0),
      utc(2024, 10, 31, 10, 0, 0),
    ]
  );
}

#[test]
fn custom_calendar_yearly_positional_by_day() {
  let start = utc(2024, 4, 15, 5, 0, 0);
  let trigger = Trigger::builder()
    .for_job(JobKey::new("job", "g"))
    .start_at(start)
    .with_schedule(
      CustomCalendarScheduleBuilder::with_interval(1, IntervalUnit::Year)
        .by_month(5)
        .by_day("2WE,3FR,5SU,-1MO"),
    )
    .build()
    .unwrap();

  assert_eq!(
    fire_times(&trigger, start - Duration::milliseconds(1), 3),
    vec![
      utc(2024, 5, 8, 5, 0, 0),
      utc(2024, 5, 17, 5, 0, 0),
      utc(2024, 5, 27, 5, 0, 0),
    ]
  );
}

#[test]
fn one_shot_with_minimum_start_is_already_past() {
  let trigger = Trigger::builder()
    .for_job(JobKey::new("job", "g"))
    .start_at(DateTime::<Utc>::MIN_UTC)
    .with_schedule(SimpleScheduleBuilder::once())
    .build()
    .unwrap();
  assert_eq!(trigger.get_fire_time_after(None), None);
}

#[test]
fn custom_calendar_misfire_do_nothing_lands_after_now() {
  let start = utc(2024, 7, 15, 5, 0, 0);
  let mut trigger = Trigger::builder()
    .for_job(JobKey::new("job", "g"))
    .start_at(start)
    .with_schedule(
      CustomCalendarScheduleBuilder::with_interval(1, IntervalUnit::Day)
        .with_misfire_handling_instruction_do_nothing(),
    )
    .build()
    .unwrap();
  trigger.compute_first_fire_time(None);

  // 触发时刻已落后两小时，阈值 60 秒，日历不排除任何时刻
  // The fire instant is two hours in the past, the threshold is 60
  // seconds, the calendar excludes nothing
  let now = start + Duration::hours(2);
  trigger.update_after_misfire(None, now);
  let next = trigger.next_fire_time().unwrap();
  assert!(next > now, "misfire correction left {next} not after {now}");
}

#[test]
fn schedule_builders_reproduce_schedule_fields() {
  let start = utc(2024, 7, 15, 5, 0, 0);
  for trigger in all_variants(start) {
    // 用每个变体自带的日程构建器重建触发器，日程字段必须不变
    // Rebuild each trigger from its own schedule builder; the schedule
    // fields must not change
    let rebuilt = Trigger::builder()
      .for_job(trigger.job_key().clone())
      .start_at(trigger.start_time());
    let rebuilt = match &trigger {
      Trigger::Simple(t) => rebuilt.with_schedule(t.schedule_builder()),
      Trigger::Cron(t) => rebuilt.with_schedule(t.schedule_builder()),
      Trigger::CalendarInterval(t) => rebuilt.with_schedule(t.schedule_builder()),
      Trigger::DailyTimeInterval(t) => rebuilt.with_schedule(t.schedule_builder()),
      Trigger::CustomCalendar(t) => rebuilt.with_schedule(t.schedule_builder()),
    }
    .build()
    .unwrap();

    match (&trigger, &rebuilt) {
      (Trigger::Simple(a), Trigger::Simple(b)) => {
        assert_eq!(a.repeat_count, b.repeat_count);
        assert_eq!(a.repeat_interval_millis, b.repeat_interval_millis);
        assert_eq!(a.misfire_policy, b.misfire_policy);
      }
      (Trigger::Cron(a), Trigger::Cron(b)) => {
        assert_eq!(a.expression, b.expression);
        assert_eq!(a.time_zone, b.time_zone);
      }
      (Trigger::CalendarInterval(a), Trigger::CalendarInterval(b)) => {
        assert_eq!(a.interval_unit, b.interval_unit);
        assert_eq!(a.repeat_interval, b.repeat_interval);
        assert_eq!(
          a.preserve_hour_of_day_across_daylight_savings,
          b.preserve_hour_of_day_across_daylight_savings
        );
      }
      (Trigger::DailyTimeInterval(a), Trigger::DailyTimeInterval(b)) => {
        assert_eq!(a.start_time_of_day, b.start_time_of_day);
        assert_eq!(a.end_time_of_day, b.end_time_of_day);
        assert_eq!(a.days_of_week, b.days_of_week);
        assert_eq!(a.repeat_count, b.repeat_count);
      }
      (Trigger::CustomCalendar(a), Trigger::CustomCalendar(b)) => {
        assert_eq!(a.by_day, b.by_day);
        assert_eq!(a.by_month, b.by_month);
        assert_eq!(a.by_month_day, b.by_month_day);
        assert_eq!(a.repeat_count, b.repeat_count);
      }
      (original, rebuilt) => panic!(
        "rebuild changed the variant: {} -> {}",
        original.trigger_type(),
        rebuilt.trigger_type()
      ),
    }
  }
}

#[test]
fn json_round_trip_preserves_schedule_fields() {
  let start = utc(2024, 7, 15, 5, 0, 0);
  for mut trigger in all_variants(start) {
    trigger.compute_first_fire_time(None);
    let json = serde_json::to_string(&trigger).unwrap();
    let back: Trigger = serde_json::from_str(&json).unwrap();
    assert_eq!(back, trigger, "round trip changed {}", trigger.key());
    assert_eq!(back.trigger_type(), trigger.trigger_type());
  }
}
