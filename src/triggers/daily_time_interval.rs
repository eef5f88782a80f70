//! 每日时间区间触发器
//! Daily time-interval trigger
//!
//! 在每天的 `[start_time_of_day, end_time_of_day]` 窗口内按区间触发，
//! 窗口耗尽后推进到下一个被包含的星期几。
//! Fires at an interval inside the daily `[start_time_of_day,
//! end_time_of_day]` window, then advances to the next included weekday.

use crate::calendar::CalendarVariant;
use crate::cron::YEAR_TO_GIVE_UP_SCHEDULING_AT;
use crate::error::{Result, SchedulerError};
use crate::time::TimeOfDay;
use crate::triggers::{
  skip_excluded, IntervalUnit, MisfirePolicy, OperableTrigger, TriggerCore, REPEAT_INDEFINITELY,
};
use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

fn default_tz() -> Tz {
  Tz::UTC
}

fn all_days() -> BTreeSet<u32> {
  (1..=7).collect()
}

/// 每日时间区间触发器
/// Daily time-interval trigger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyTimeIntervalTrigger {
  #[serde(flatten)]
  pub core: TriggerCore,
  /// 窗口起点
  /// Window start
  #[serde(rename = "StartTimeOfDay")]
  pub start_time_of_day: TimeOfDay,
  /// 窗口终点
  /// Window end
  #[serde(rename = "EndTimeOfDay")]
  pub end_time_of_day: TimeOfDay,
  /// 包含的星期几（1 = 周日 … 7 = 周六）
  /// Included weekdays (1 = Sunday … 7 = Saturday)
  #[serde(rename = "DaysOfWeek", default = "all_days")]
  pub days_of_week: BTreeSet<u32>,
  /// 区间长度
  /// Interval length
  #[serde(rename = "RepeatInterval")]
  pub repeat_interval: i32,
  /// 区间单位（秒/分/时）
  /// Interval unit (second/minute/hour)
  #[serde(rename = "RepeatIntervalUnit")]
  pub interval_unit: IntervalUnit,
  /// 整个序列的重复次数；-1 表示无限
  /// Repeat count across the whole series; -1 means indefinite
  #[serde(rename = "RepeatCount", default = "indefinitely")]
  pub repeat_count: i32,
  /// 已触发次数
  /// Number of times triggered
  #[serde(rename = "TimesTriggered", default)]
  pub times_triggered: i32,
  /// 求值时区
  /// Evaluation timezone
  #[serde(rename = "TimeZone", default = "default_tz")]
  pub time_zone: Tz,
  /// misfire 策略
  /// Misfire policy
  #[serde(rename = "MisfireInstruction", default)]
  pub misfire_policy: MisfirePolicy,
}

fn indefinitely() -> i32 {
  REPEAT_INDEFINITELY
}

impl DailyTimeIntervalTrigger {
  /// 重建本日程的构建器
  /// A builder that reproduces this schedule
  pub fn schedule_builder(&self) -> DailyTimeIntervalScheduleBuilder {
    DailyTimeIntervalScheduleBuilder {
      start_time_of_day: self.start_time_of_day,
      end_time_of_day: self.end_time_of_day,
      days_of_week: self.days_of_week.clone(),
      repeat_interval: self.repeat_interval,
      interval_unit: self.interval_unit,
      repeat_count: self.repeat_count,
      time_zone: self.time_zone,
      misfire_policy: self.misfire_policy,
    }
  }

  fn interval_seconds(&self) -> i64 {
    let unit = self
      .interval_unit
      .fixed_millis()
      .unwrap_or(1_000)
      / 1_000;
    unit * self.repeat_interval as i64
  }

  /// 在日期 `date` 上解析窗口内第 n 个时刻
  /// Resolve the n-th instant of the window on `date`
  fn slot_on(&self, date: NaiveDate, slot: i64) -> Option<DateTime<Utc>> {
    let offset = self.start_time_of_day.seconds_into_day() as i64 + slot * self.interval_seconds();
    if offset > self.end_time_of_day.seconds_into_day() as i64 {
      return None;
    }
    let naive = date.and_hms_opt(0, 0, 0)? + Duration::seconds(offset);
    match self.time_zone.from_local_datetime(&naive) {
      chrono::LocalResult::Single(dt) => Some(dt.with_timezone(&Utc)),
      chrono::LocalResult::Ambiguous(earliest, _) => Some(earliest.with_timezone(&Utc)),
      // 夏令时空隙内的槽位作废，调用方推进到下一槽
      // A slot inside a DST gap is void; the caller advances to the next
      chrono::LocalResult::None => None,
    }
  }

  fn day_included(&self, date: NaiveDate) -> bool {
    let dow = date.weekday().num_days_from_sunday() + 1;
    self.days_of_week.contains(&dow)
  }

  fn bounded(&self, instant: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match self.core.end_time {
      Some(end) if instant > end => None,
      _ => Some(instant),
    }
  }

  /// 不考虑日历排除的下一个计划时刻
  /// Next planned instant, calendar-blind
  fn next_planned_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if self.repeat_interval < 1 {
      return None;
    }
    let after = after.max(self.core.start_time - Duration::seconds(1));
    let ivl = self.interval_seconds();
    let window_slots =
      (self.end_time_of_day.seconds_into_day() as i64
        - self.start_time_of_day.seconds_into_day() as i64)
        / ivl;

    let local_after = after.with_timezone(&self.time_zone);
    let mut date = local_after.date_naive();

    loop {
      if date.year() > YEAR_TO_GIVE_UP_SCHEDULING_AT {
        return None;
      }
      if self.day_included(date) {
        for slot in 0..=window_slots {
          match self.slot_on(date, slot) {
            Some(t) if t > after => return self.bounded(t),
            _ => {}
          }
        }
      }
      date = date.succ_opt()?;
    }
  }

  pub(crate) fn compute_first_fire_time(
    &mut self,
    calendar: Option<&CalendarVariant>,
  ) -> Option<DateTime<Utc>> {
    let first = self.next_planned_after(self.core.start_time - Duration::seconds(1));
    let first = skip_excluded(first, calendar, |t| self.next_planned_after(t));
    self.core.next_fire_time = first;
    first
  }

  pub(crate) fn triggered(&mut self, calendar: Option<&CalendarVariant>) {
    self.times_triggered += 1;
    self.core.previous_fire_time = self.core.next_fire_time;
    if self.repeat_count != REPEAT_INDEFINITELY && self.times_triggered > self.repeat_count {
      self.core.next_fire_time = None;
      return;
    }
    let next = self
      .core
      .next_fire_time
      .and_then(|prev| self.next_planned_after(prev));
    self.core.next_fire_time = skip_excluded(next, calendar, |t| self.next_planned_after(t));
  }

  pub(crate) fn get_fire_time_after(&self, after: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    if self.repeat_count != REPEAT_INDEFINITELY && self.times_triggered > self.repeat_count {
      return None;
    }
    let after = after.unwrap_or_else(Utc::now);
    self.next_planned_after(after)
  }

  pub(crate) fn update_after_misfire(
    &mut self,
    calendar: Option<&CalendarVariant>,
    now: DateTime<Utc>,
  ) {
    let policy = match self.misfire_policy {
      MisfirePolicy::Smart => MisfirePolicy::FireOnceNow,
      other => other,
    };
    match policy {
      MisfirePolicy::Ignore => {}
      MisfirePolicy::FireOnceNow => {
        self.core.next_fire_time = Some(now);
      }
      MisfirePolicy::DoNothing => {
        let next = self.next_planned_after(now);
        self.core.next_fire_time = skip_excluded(next, calendar, |t| self.next_planned_after(t));
      }
      MisfirePolicy::Smart => unreachable!(),
    }
  }

  pub(crate) fn update_with_new_calendar(
    &mut self,
    calendar: &CalendarVariant,
    misfire_threshold: Duration,
    now: DateTime<Utc>,
  ) {
    let base = self.core.previous_fire_time.unwrap_or(now);
    let next = self.next_planned_after(base);
    let next = skip_excluded(next, Some(calendar), |t| self.next_planned_after(t));
    self.core.next_fire_time = match next {
      Some(t) if now > t && now - t > misfire_threshold => {
        skip_excluded(self.next_planned_after(now), Some(calendar), |t| {
          self.next_planned_after(t)
        })
      }
      other => other,
    };
  }

  pub(crate) fn validate(&self) -> Result<()> {
    if self.repeat_interval < 1 {
      return Err(SchedulerError::invalid_trigger(
        "daily interval trigger requires repeat interval >= 1",
      ));
    }
    if self.interval_unit.fixed_millis().is_none() {
      return Err(SchedulerError::invalid_trigger(
        "daily interval unit must be second, minute, or hour",
      ));
    }
    if self.end_time_of_day < self.start_time_of_day {
      return Err(SchedulerError::invalid_trigger(
        "daily window end cannot precede its start",
      ));
    }
    if self.days_of_week.is_empty() {
      return Err(SchedulerError::invalid_trigger(
        "daily interval trigger requires at least one included weekday",
      ));
    }
    if self.days_of_week.iter().any(|d| !(1..=7).contains(d)) {
      return Err(SchedulerError::invalid_trigger(
        "weekdays must be in [1, 7] (1 = Sunday)",
      ));
    }
    if self.repeat_count < REPEAT_INDEFINITELY {
      return Err(SchedulerError::invalid_trigger(
        "repeat count must be -1 or non-negative",
      ));
    }
    Ok(())
  }
}

impl OperableTrigger for DailyTimeIntervalTrigger {
  fn core(&self) -> &TriggerCore {
    &self.core
  }

  fn core_mut(&mut self) -> &mut TriggerCore {
    &mut self.core
  }

  fn compute_first_fire_time(
    &mut self,
    calendar: Option<&CalendarVariant>,
  ) -> Option<DateTime<Utc>> {
    DailyTimeIntervalTrigger::compute_first_fire_time(self, calendar)
  }

  fn triggered(&mut self, calendar: Option<&CalendarVariant>) {
    DailyTimeIntervalTrigger::triggered(self, calendar)
  }

  fn get_fire_time_after(&self, after: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    DailyTimeIntervalTrigger::get_fire_time_after(self, after)
  }

  fn update_after_misfire(&mut self, calendar: Option<&CalendarVariant>, now: DateTime<Utc>) {
    DailyTimeIntervalTrigger::update_after_misfire(self, calendar, now)
  }

  fn update_with_new_calendar(
    &mut self,
    calendar: &CalendarVariant,
    misfire_threshold: Duration,
    now: DateTime<Utc>,
  ) {
    DailyTimeIntervalTrigger::update_with_new_calendar(self, calendar, misfire_threshold, now)
  }

  fn validate(&self) -> Result<()> {
    DailyTimeIntervalTrigger::validate(self)
  }
}

/// 每日时间区间日程构建器
/// Daily time-interval schedule builder
#[derive(Debug, Clone)]
pub struct DailyTimeIntervalScheduleBuilder {
  start_time_of_day: TimeOfDay,
  end_time_of_day: TimeOfDay,
  days_of_week: BTreeSet<u32>,
  repeat_interval: i32,
  interval_unit: IntervalUnit,
  repeat_count: i32,
  time_zone: Tz,
  misfire_policy: MisfirePolicy,
}

impl Default for DailyTimeIntervalScheduleBuilder {
  fn default() -> Self {
    Self {
      start_time_of_day: TimeOfDay::midnight(),
      end_time_of_day: TimeOfDay::end_of_day(),
      days_of_week: all_days(),
      repeat_interval: 1,
      interval_unit: IntervalUnit::Minute,
      repeat_count: REPEAT_INDEFINITELY,
      time_zone: Tz::UTC,
      misfire_policy: MisfirePolicy::Smart,
    }
  }
}

impl DailyTimeIntervalScheduleBuilder {
  /// 以单位与区间创建
  /// Create with a unit and interval
  pub fn with_interval(repeat_interval: i32, interval_unit: IntervalUnit) -> Self {
    Self {
      repeat_interval,
      interval_unit,
      ..Self::default()
    }
  }

  /// 设置每日窗口
  /// Set the daily window
  pub fn starting_daily_at(mut self, start: TimeOfDay) -> Self {
    self.start_time_of_day = start;
    self
  }

  /// 设置窗口终点
  /// Set the window end
  pub fn ending_daily_at(mut self, end: TimeOfDay) -> Self {
    self.end_time_of_day = end;
    self
  }

  /// 窗口在第 n 次触发后结束
  /// End the window after the n-th fire of each day
  pub fn ending_daily_after_count(mut self, count: i32) -> Self {
    let total_secs = self.start_time_of_day.seconds_into_day() as i64
      + (count.max(1) as i64 - 1)
        * self.repeat_interval as i64
        * (self.interval_unit.fixed_millis().unwrap_or(60_000) / 1_000);
    let capped = total_secs.min(86_399) as u32;
    self.end_time_of_day = TimeOfDay {
      hour: capped / 3600,
      minute: capped % 3600 / 60,
      second: capped % 60,
    };
    self
  }

  /// 设置包含的星期几
  /// Set the included weekdays
  pub fn on_days_of_the_week<I: IntoIterator<Item = u32>>(mut self, days: I) -> Self {
    self.days_of_week = days.into_iter().collect();
    self
  }

  /// 仅周一至周五
  /// Monday through Friday only
  pub fn on_monday_through_friday(mut self) -> Self {
    self.days_of_week = (2..=6).collect();
    self
  }

  /// 仅周末
  /// Weekends only
  pub fn on_saturday_and_sunday(mut self) -> Self {
    self.days_of_week = [1, 7].into_iter().collect();
    self
  }

  /// 设置序列总重复次数
  /// Set the total repeat count of the series
  pub fn with_repeat_count(mut self, repeat_count: i32) -> Self {
    self.repeat_count = repeat_count;
    self
  }

  /// 设置时区
  /// Set the timezone
  pub fn in_time_zone(mut self, time_zone: Tz) -> Self {
    self.time_zone = time_zone;
    self
  }

  /// misfire 时立即补触发一次
  /// Fire once now on misfire
  pub fn with_misfire_handling_instruction_fire_and_proceed(mut self) -> Self {
    self.misfire_policy = MisfirePolicy::FireOnceNow;
    self
  }

  /// misfire 时跳到下一次
  /// Do nothing on misfire
  pub fn with_misfire_handling_instruction_do_nothing(mut self) -> Self {
    self.misfire_policy = MisfirePolicy::DoNothing;
    self
  }

  /// misfire 时忽略
  /// Ignore misfires
  pub fn with_misfire_handling_instruction_ignore_misfires(mut self) -> Self {
    self.misfire_policy = MisfirePolicy::Ignore;
    self
  }

  pub(crate) fn build(self, core: TriggerCore) -> DailyTimeIntervalTrigger {
    DailyTimeIntervalTrigger {
      core,
      start_time_of_day: self.start_time_of_day,
      end_time_of_day: self.end_time_of_day,
      days_of_week: self.days_of_week,
      repeat_interval: self.repeat_interval,
      interval_unit: self.interval_unit,
      repeat_count: self.repeat_count,
      times_triggered: 0,
      time_zone: self.time_zone,
      misfire_policy: self.misfire_policy,
    }
  }
}
