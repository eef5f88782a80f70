//! 日历区间触发器
//! Calendar-interval trigger
//!
//! 以日历规则推进的固定区间触发器：月/年运算使用日历规则（月末
//! 截断），夏令时行为由两个标志显式控制。
//! Fixed-interval trigger advanced by calendar rules: month/year
//! arithmetic uses calendar rules (end-of-month clamping), DST behavior
//! is explicit via two flags.

use crate::calendar::CalendarVariant;
use crate::cron::{last_day_of_month, YEAR_TO_GIVE_UP_SCHEDULING_AT};
use crate::error::{Result, SchedulerError};
use crate::triggers::{skip_excluded, IntervalUnit, MisfirePolicy, OperableTrigger, TriggerCore};
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

fn default_tz() -> Tz {
  Tz::UTC
}

/// 日历区间触发器
/// Calendar-interval trigger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalendarIntervalTrigger {
  #[serde(flatten)]
  pub core: TriggerCore,
  /// 区间单位
  /// Interval unit
  #[serde(rename = "RepeatIntervalUnit")]
  pub interval_unit: IntervalUnit,
  /// 区间长度
  /// Interval length
  #[serde(rename = "RepeatInterval")]
  pub repeat_interval: i32,
  /// 求值时区
  /// Evaluation timezone
  #[serde(rename = "TimeZone", default = "default_tz")]
  pub time_zone: Tz,
  /// 跨夏令时保持本地触发小时不变
  /// Keep the local fire hour constant across daylight savings
  #[serde(rename = "PreserveHourOfDayAcrossDaylightSavings", default)]
  pub preserve_hour_of_day_across_daylight_savings: bool,
  /// 目标小时在当天不存在时跳过该天
  /// Skip the day when the target hour does not exist on it
  #[serde(rename = "SkipDayIfHourDoesNotExist", default)]
  pub skip_day_if_hour_does_not_exist: bool,
  /// 已触发次数
  /// Number of times triggered
  #[serde(rename = "TimesTriggered", default)]
  pub times_triggered: i32,
  /// misfire 策略
  /// Misfire policy
  #[serde(rename = "MisfireInstruction", default)]
  pub misfire_policy: MisfirePolicy,
}

/// 在日期上加减整月，日截断到目标月末
/// Add whole months to a date, clamping the day to the target month end
pub(crate) fn add_months(date: NaiveDate, months: i64) -> Option<NaiveDate> {
  let total = date.year() as i64 * 12 + date.month0() as i64 + months;
  let year = total.div_euclid(12) as i32;
  let month = total.rem_euclid(12) as u32 + 1;
  let day = date.day().min(last_day_of_month(year, month));
  NaiveDate::from_ymd_opt(year, month, day)
}

impl CalendarIntervalTrigger {
  /// 重建本日程的构建器
  /// A builder that reproduces this schedule
  pub fn schedule_builder(&self) -> CalendarIntervalScheduleBuilder {
    CalendarIntervalScheduleBuilder {
      interval_unit: self.interval_unit,
      repeat_interval: self.repeat_interval,
      time_zone: self.time_zone,
      preserve_hour_of_day_across_daylight_savings:
        self.preserve_hour_of_day_across_daylight_savings,
      skip_day_if_hour_does_not_exist: self.skip_day_if_hour_does_not_exist,
      misfire_policy: self.misfire_policy,
    }
  }

  /// 区间是否按固定毫秒数推进
  /// Whether the interval advances by fixed milliseconds
  fn fixed_interval_millis(&self) -> Option<i64> {
    let unit_millis = match self.interval_unit {
      IntervalUnit::Second | IntervalUnit::Minute | IntervalUnit::Hour => {
        self.interval_unit.fixed_millis()?
      }
      IntervalUnit::Day if !self.preserve_hour_of_day_across_daylight_savings => 86_400_000,
      IntervalUnit::Week if !self.preserve_hour_of_day_across_daylight_savings => 604_800_000,
      _ => return None,
    };
    Some(unit_millis * self.repeat_interval as i64)
  }

  /// 第 k 个区间对应的本地时刻
  /// Zone-local instant of the k-th interval
  fn local_candidate(&self, start_local: NaiveDateTime, k: i64) -> Option<NaiveDateTime> {
    let ivl = self.repeat_interval as i64;
    match self.interval_unit {
      IntervalUnit::Day => Some(start_local.checked_add_signed(Duration::days(k * ivl))?),
      IntervalUnit::Week => Some(start_local.checked_add_signed(Duration::days(k * ivl * 7))?),
      IntervalUnit::Month => {
        let date = add_months(start_local.date(), k * ivl)?;
        Some(date.and_time(start_local.time()))
      }
      IntervalUnit::Year => {
        let date = add_months(start_local.date(), k * ivl * 12)?;
        Some(date.and_time(start_local.time()))
      }
      _ => None,
    }
  }

  /// 将本地时刻解析到 UTC，按两个夏令时标志处理空隙与歧义
  /// Resolve a local instant to UTC, handling gaps and ambiguity per
  /// the two DST flags
  fn resolve_local(&self, local: NaiveDateTime) -> ResolvedLocal {
    match self.time_zone.from_local_datetime(&local) {
      chrono::LocalResult::Single(dt) => ResolvedLocal::At(dt.with_timezone(&Utc)),
      chrono::LocalResult::Ambiguous(earliest, _) => {
        ResolvedLocal::At(earliest.with_timezone(&Utc))
      }
      chrono::LocalResult::None => {
        if self.skip_day_if_hour_does_not_exist {
          ResolvedLocal::SkipDay
        } else {
          // 跳变后顺延一小时
          // Shift one hour past the gap
          match self
            .time_zone
            .from_local_datetime(&(local + Duration::hours(1)))
          {
            chrono::LocalResult::Single(dt) => ResolvedLocal::At(dt.with_timezone(&Utc)),
            chrono::LocalResult::Ambiguous(earliest, _) => {
              ResolvedLocal::At(earliest.with_timezone(&Utc))
            }
            chrono::LocalResult::None => ResolvedLocal::SkipDay,
          }
        }
      }
    }
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
    if after < self.core.start_time {
      return self.bounded(self.core.start_time);
    }

    if let Some(ivl_millis) = self.fixed_interval_millis() {
      let elapsed = (after - self.core.start_time).num_milliseconds();
      let n = elapsed / ivl_millis + 1;
      return self.bounded(self.core.start_time + Duration::milliseconds(n * ivl_millis));
    }

    // 日历制推进：从估算的区间序号向上扫描
    // Calendar-based advance: scan upward from an estimated interval index
    let start_local = self.core.start_time.with_timezone(&self.time_zone).naive_local();
    let ivl = self.repeat_interval as i64;
    let mut k = match self.interval_unit {
      IntervalUnit::Day => (after - self.core.start_time).num_days() / ivl,
      IntervalUnit::Week => (after - self.core.start_time).num_days() / (7 * ivl),
      IntervalUnit::Month => (after - self.core.start_time).num_days() / (31 * ivl).max(1),
      IntervalUnit::Year => (after - self.core.start_time).num_days() / (366 * ivl).max(1),
      _ => 0,
    }
    .max(0);

    loop {
      let local = self.local_candidate(start_local, k)?;
      if local.year() > YEAR_TO_GIVE_UP_SCHEDULING_AT {
        return None;
      }
      match self.resolve_local(local) {
        ResolvedLocal::At(t) if t > after => return self.bounded(t),
        ResolvedLocal::At(_) | ResolvedLocal::SkipDay => {
          k += 1;
        }
      }
    }
  }

  pub(crate) fn compute_first_fire_time(
    &mut self,
    calendar: Option<&CalendarVariant>,
  ) -> Option<DateTime<Utc>> {
    let first = skip_excluded(self.bounded(self.core.start_time), calendar, |t| {
      self.next_planned_after(t)
    });
    self.core.next_fire_time = first;
    first
  }

  pub(crate) fn triggered(&mut self, calendar: Option<&CalendarVariant>) {
    self.times_triggered += 1;
    self.core.previous_fire_time = self.core.next_fire_time;
    let next = self
      .core
      .next_fire_time
      .and_then(|prev| self.next_planned_after(prev));
    self.core.next_fire_time = skip_excluded(next, calendar, |t| self.next_planned_after(t));
  }

  pub(crate) fn get_fire_time_after(&self, after: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
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
        "calendar interval trigger requires repeat interval >= 1",
      ));
    }
    Ok(())
  }
}

enum ResolvedLocal {
  At(DateTime<Utc>),
  SkipDay,
}

impl OperableTrigger for CalendarIntervalTrigger {
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
    CalendarIntervalTrigger::compute_first_fire_time(self, calendar)
  }

  fn triggered(&mut self, calendar: Option<&CalendarVariant>) {
    CalendarIntervalTrigger::triggered(self, calendar)
  }

  fn get_fire_time_after(&self, after: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    CalendarIntervalTrigger::get_fire_time_after(self, after)
  }

  fn update_after_misfire(&mut self, calendar: Option<&CalendarVariant>, now: DateTime<Utc>) {
    CalendarIntervalTrigger::update_after_misfire(self, calendar, now)
  }

  fn update_with_new_calendar(
    &mut self,
    calendar: &CalendarVariant,
    misfire_threshold: Duration,
    now: DateTime<Utc>,
  ) {
    CalendarIntervalTrigger::update_with_new_calendar(self, calendar, misfire_threshold, now)
  }

  fn validate(&self) -> Result<()> {
    CalendarIntervalTrigger::validate(self)
  }
}

/// 日历区间日程构建器
/// Calendar-interval schedule builder
#[derive(Debug, Clone)]
pub struct CalendarIntervalScheduleBuilder {
  interval_unit: IntervalUnit,
  repeat_interval: i32,
  time_zone: Tz,
  preserve_hour_of_day_across_daylight_savings: bool,
  skip_day_if_hour_does_not_exist: bool,
  misfire_policy: MisfirePolicy,
}

impl Default for CalendarIntervalScheduleBuilder {
  fn default() -> Self {
    Self {
      interval_unit: IntervalUnit::Day,
      repeat_interval: 1,
      time_zone: Tz::UTC,
      preserve_hour_of_day_across_daylight_savings: false,
      skip_day_if_hour_does_not_exist: false,
      misfire_policy: MisfirePolicy::Smart,
    }
  }
}

impl CalendarIntervalScheduleBuilder {
  /// 以单位与区间创建
  /// Create with a unit and interval
  pub fn with_interval(repeat_interval: i32, interval_unit: IntervalUnit) -> Self {
    Self {
      interval_unit,
      repeat_interval,
      ..Self::default()
    }
  }

  /// 每 n 天
  /// Every n days
  pub fn with_interval_in_days(days: i32) -> Self {
    Self::with_interval(days, IntervalUnit::Day)
  }

  /// 每 n 月
  /// Every n months
  pub fn with_interval_in_months(months: i32) -> Self {
    Self::with_interval(months, IntervalUnit::Month)
  }

  /// 设置时区
  /// Set the timezone
  pub fn in_time_zone(mut self, time_zone: Tz) -> Self {
    self.time_zone = time_zone;
    self
  }

  /// 跨夏令时保持触发小时
  /// Preserve the fire hour across daylight savings
  pub fn preserve_hour_of_day_across_daylight_savings(mut self, preserve: bool) -> Self {
    self.preserve_hour_of_day_across_daylight_savings = preserve;
    self
  }

  /// 目标小时不存在时跳过该天
  /// Skip the day when the target hour does not exist
  pub fn skip_day_if_hour_does_not_exist(mut self, skip: bool) -> Self {
    self.skip_day_if_hour_does_not_exist = skip;
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

  pub(crate) fn build(self, core: TriggerCore) -> CalendarIntervalTrigger {
    CalendarIntervalTrigger {
      core,
      interval_unit: self.interval_unit,
      repeat_interval: self.repeat_interval,
      time_zone: self.time_zone,
      preserve_hour_of_day_across_daylight_savings:
        self.preserve_hour_of_day_across_daylight_savings,
      skip_day_if_hour_does_not_exist: self.skip_day_if_hour_does_not_exist,
      times_triggered: 0,
      misfire_policy: self.misfire_policy,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::key::{JobKey, TriggerKey};
  use chrono::TimeZone;

  fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
  }

  fn trigger(
    start: DateTime<Utc>,
    interval: i32,
    unit: IntervalUnit,
  ) -> CalendarIntervalTrigger {
    CalendarIntervalScheduleBuilder::with_interval(interval, unit).build(TriggerCore::new(
      TriggerKey::new("t", "g"),
      JobKey::new("j", "g"),
      start,
    ))
  }

  #[test]
  fn test_end_of_month_clamping() {
    // 从 1 月 31 日按月推进：2 月截断到 29 日（2024 闰年），3 月回到 31 日
    // Monthly from Jan 31: February clamps to the 29th (2024 leap year),
    // March returns to the 31st
    let start = utc(2024, 1, 31, 10, 0, 0);
    let t = trigger(start, 1, IntervalUnit::Month);
    let feb = t.get_fire_time_after(Some(start)).unwrap();
    assert_eq!(feb, utc(2024, 2, 29, 10, 0, 0));
    let mar = t.get_fire_time_after(Some(feb)).unwrap();
    assert_eq!(mar, utc(2024, 3, 31, 10, 0, 0));
  }

  #[test]
  fn test_yearly_interval_leap_day() {
    let start = utc(2024, 2, 29, 8, 0, 0);
    let t = trigger(start, 1, IntervalUnit::Year);
    let next = t.get_fire_time_after(Some(start)).unwrap();
    // 2025 年没有 2 月 29 日，截断到 28 日
    // 2025 has no Feb 29, clamps to the 28th
    assert_eq!(next, utc(2025, 2, 28, 8, 0, 0));
  }

  #[test]
  fn test_hourly_interval_is_fixed_millis() {
    let start = utc(2024, 7, 15, 5, 0, 0);
    let t = trigger(start, 6, IntervalUnit::Hour);
    let next = t
      .get_fire_time_after(Some(start + Duration::hours(7)))
      .unwrap();
    assert_eq!(next, start + Duration::hours(12));
  }

  #[test]
  fn test_preserve_hour_across_dst() {
    // 纽约 2024-03-10 发生春季跳变；保持小时标志使本地时间恒为 08:00
    // New York springs forward on 2024-03-10; the preserve flag keeps
    // the local time pinned at 08:00
    let tz: Tz = "America/New_York".parse().unwrap();
    // 2024-03-09 08:00 EST = 13:00 UTC
    let start = utc(2024, 3, 9, 13, 0, 0);
    let mut t = trigger(start, 1, IntervalUnit::Day);
    t.time_zone = tz;
    t.preserve_hour_of_day_across_daylight_savings = true;
    let next = t.get_fire_time_after(Some(start)).unwrap();
    // 2024-03-10 08:00 EDT = 12:00 UTC
    assert_eq!(next, utc(2024, 3, 10, 12, 0, 0));
  }

  #[test]
  fn test_without_preserve_flag_day_is_fixed_24h() {
    let tz: Tz = "America/New_York".parse().unwrap();
    let start = utc(2024, 3, 9, 13, 0, 0);
    let mut t = trigger(start, 1, IntervalUnit::Day);
    t.time_zone = tz;
    let next = t.get_fire_time_after(Some(start)).unwrap();
    // 固定 24 小时：本地时间漂移到 09:00
    // Fixed 24 hours: the local time drifts to 09:00
    assert_eq!(next, utc(2024, 3, 10, 13, 0, 0));
  }

  #[test]
  fn test_skip_day_if_hour_does_not_exist() {
    let tz: Tz = "America/New_York".parse().unwrap();
    // 2024-03-09 02:30 EST = 07:30 UTC；次日 02:30 不存在
    // 2024-03-09 02:30 EST = 07:30 UTC; 02:30 does not exist the next day
    let start = utc(2024, 3, 9, 7, 30, 0);
    let mut t = trigger(start, 1, IntervalUnit::Day);
    t.time_zone = tz;
    t.preserve_hour_of_day_across_daylight_savings = true;
    t.skip_day_if_hour_does_not_exist = true;
    let next = t.get_fire_time_after(Some(start)).unwrap();
    // 3 月 10 日被跳过，3 月 11 日 02:30 EDT = 06:30 UTC
    // March 10 is skipped; March 11 02:30 EDT = 06:30 UTC
    assert_eq!(next, utc(2024, 3, 11, 6, 30, 0));
  }

  #[test]
  fn test_validation_rejects_zero_interval() {
    let t = trigger(utc(2024, 7, 15, 5, 0, 0), 0, IntervalUnit::Day);
    assert!(t.validate().is_err());
  }

  #[test]
  fn test_schedule_builder_round_trip() {
    let start = utc(2024, 7, 15, 5, 0, 0);
    let mut t = trigger(start, 3, IntervalUnit::Week);
    t.preserve_hour_of_day_across_daylight_savings = true;
    let rebuilt = t.schedule_builder().build(t.core.clone());
    assert_eq!(rebuilt.interval_unit, t.interval_unit);
    assert_eq!(rebuilt.repeat_interval, t.repeat_interval);
    assert!(rebuilt.preserve_hour_of_day_across_daylight_savings);
  }
}
