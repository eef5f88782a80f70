//! 自定义日历触发器
//! Custom-calendar trigger
//!
//! 基于 RFC-5545 `RRULE` 语义的周期触发器：由字段构造 RRULE 模式串，
//! 把生效起点按整区间向前推进到尽量贴近查询时刻，再在触发器时区内
//! 求值并返回第一个严格大于查询时刻的发生点。
//! Recurrence trigger built on RFC-5545 `RRULE` semantics: a pattern
//! string is constructed from the fields, the effective start is advanced
//! forward by whole intervals to sit as close to the query instant as
//! possible, then the pattern is evaluated in the trigger's timezone and
//! the first occurrence strictly greater than the query instant wins.

use crate::calendar::CalendarVariant;
use crate::error::{Result, SchedulerError};
use crate::triggers::calendar_interval::add_months;
use crate::triggers::{
  skip_excluded, IntervalUnit, MisfirePolicy, OperableTrigger, TriggerCore, REPEAT_INDEFINITELY,
};
use chrono::{DateTime, Datelike, Duration, NaiveDateTime, Utc};
use chrono_tz::Tz;
use rrule::RRuleSet;
use serde::{Deserialize, Serialize};

/// RRULE 求值器的发生点硬上限
/// Hard cap on occurrences for the RRULE evaluator
///
/// 安全边界：配合整区间起点推进，保证单次求值的工作量有界。
/// Safety bound: together with the whole-interval start advance it keeps
/// the work of a single evaluation bounded.
pub const RRULE_EVALUATION_CAP: u16 = 500;

fn default_tz() -> Tz {
  Tz::UTC
}

/// 自定义日历触发器
/// Custom-calendar trigger
///
/// 时区在构造时一次性设定，求值过程中不再变更。
/// The timezone is set once at construction and never mutated during
/// evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomCalendarTrigger {
  #[serde(flatten)]
  pub core: TriggerCore,
  /// 序列总重复次数；-1 表示无限
  /// Total repeat count of the series; -1 means indefinite
  #[serde(rename = "RepeatCount", default = "indefinitely")]
  pub repeat_count: i32,
  /// 区间长度
  /// Interval length
  #[serde(rename = "RepeatInterval")]
  pub repeat_interval: i32,
  /// 区间单位（日/周/月/年）
  /// Interval unit (day/week/month/year)
  #[serde(rename = "RepeatIntervalUnit")]
  pub interval_unit: IntervalUnit,
  /// BYMONTH（1–12）
  /// BYMONTH (1–12)
  #[serde(rename = "ByMonth", default, skip_serializing_if = "Option::is_none")]
  pub by_month: Option<u32>,
  /// BYMONTHDAY 逗号表；始终按字符串持久化
  /// BYMONTHDAY comma list; persisted as a string throughout
  #[serde(rename = "ByMonthDay", default, skip_serializing_if = "Option::is_none")]
  pub by_month_day: Option<String>,
  /// BYDAY 逗号表（如 `MO, 1MO, -1FR, SU`）
  /// BYDAY comma list (e.g. `MO, 1MO, -1FR, SU`)
  #[serde(rename = "ByDay", default, skip_serializing_if = "Option::is_none")]
  pub by_day: Option<String>,
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

/// 去除逗号表中的空白
/// Strip whitespace from a comma list
fn normalize_list(list: &str) -> String {
  list.split(',').map(str::trim).collect::<Vec<_>>().join(",")
}

impl CustomCalendarTrigger {
  /// 重建本日程的构建器
  /// A builder that reproduces this schedule
  pub fn schedule_builder(&self) -> CustomCalendarScheduleBuilder {
    CustomCalendarScheduleBuilder {
      repeat_count: self.repeat_count,
      repeat_interval: self.repeat_interval,
      interval_unit: self.interval_unit,
      by_month: self.by_month,
      by_month_day: self.by_month_day.clone(),
      by_day: self.by_day.clone(),
      time_zone: self.time_zone,
      misfire_policy: self.misfire_policy,
    }
  }

  /// 由字段构造 RRULE 模式串
  /// Construct the RRULE pattern string from the fields
  fn rrule_pattern(&self, dtstart: NaiveDateTime) -> Option<String> {
    let freq = self.interval_unit.rrule_freq()?;
    let dtstart_line = if self.time_zone == Tz::UTC {
      format!("DTSTART:{}Z", dtstart.format("%Y%m%dT%H%M%S"))
    } else {
      format!(
        "DTSTART;TZID={}:{}",
        self.time_zone.name(),
        dtstart.format("%Y%m%dT%H%M%S")
      )
    };
    let mut rule = format!("RRULE:FREQ={freq};INTERVAL={}", self.repeat_interval);
    if let Some(month) = self.by_month {
      rule.push_str(&format!(";BYMONTH={month}"));
    }
    if let Some(month_days) = self.by_month_day.as_deref().filter(|s| !s.is_empty()) {
      rule.push_str(&format!(";BYMONTHDAY={}", normalize_list(month_days)));
    }
    if let Some(days) = self.by_day.as_deref().filter(|s| !s.is_empty()) {
      rule.push_str(&format!(";BYDAY={}", normalize_list(days)));
    }
    rule.push_str(&format!(";COUNT={RRULE_EVALUATION_CAP}"));
    Some(format!("{dtstart_line}\n{rule}"))
  }

  /// 把生效起点按整区间向前推进，贴近 `after` 而不超过它
  /// Advance the effective start by whole intervals, as close to `after`
  /// as possible without exceeding it
  fn advanced_start(&self, after: DateTime<Utc>) -> NaiveDateTime {
    let start_local = self.core.start_time.with_timezone(&self.time_zone).naive_local();
    if after <= self.core.start_time {
      return start_local;
    }
    let ivl = self.repeat_interval.max(1) as i64;
    let elapsed_days = (after - self.core.start_time).num_days();
    match self.interval_unit {
      IntervalUnit::Day => start_local + Duration::days(elapsed_days / ivl * ivl),
      IntervalUnit::Week => start_local + Duration::days(elapsed_days / (7 * ivl) * 7 * ivl),
      IntervalUnit::Month | IntervalUnit::Year => {
        let months_per_interval = if self.interval_unit == IntervalUnit::Month {
          ivl
        } else {
          12 * ivl
        };
        let after_local = after.with_timezone(&self.time_zone).naive_local();
        let month_index =
          |d: chrono::NaiveDate| d.year() as i64 * 12 + d.month0() as i64;
        let month_span = month_index(after_local.date()) - month_index(start_local.date());
        let mut periods = (month_span / months_per_interval).max(0);
        loop {
          let candidate = add_months(start_local.date(), periods * months_per_interval)
            .map(|d| d.and_time(start_local.time()));
          match candidate {
            Some(c) if c > after_local && periods > 0 => periods -= 1,
            Some(c) => return c,
            None => return start_local,
          }
        }
      }
      _ => start_local,
    }
  }

  fn within_end(&self, instant: DateTime<Utc>) -> bool {
    match self.core.end_time {
      Some(end) => instant <= end,
      None => true,
    }
  }

  /// 不考虑日历排除的下一个计划时刻
  /// Next planned instant, calendar-blind
  fn next_planned_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if self.repeat_interval < 1 {
      return None;
    }
    if let Some(end) = self.core.end_time {
      if after >= end {
        return None;
      }
    }
    let after = after.max(self.core.start_time - Duration::milliseconds(1));

    let dtstart = self.advanced_start(after);
    let pattern = self.rrule_pattern(dtstart)?;
    let rule_set: RRuleSet = pattern.parse().ok()?;

    let lower = after.with_timezone(&rrule::Tz::UTC);
    let result = rule_set.after(lower).all(RRULE_EVALUATION_CAP);
    result
      .dates
      .into_iter()
      .map(|occurrence| occurrence.with_timezone(&Utc))
      .find(|t| *t > after && self.within_end(*t))
  }

  pub(crate) fn compute_first_fire_time(
    &mut self,
    calendar: Option<&CalendarVariant>,
  ) -> Option<DateTime<Utc>> {
    let first = self.next_planned_after(self.core.start_time - Duration::milliseconds(1));
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
        "custom calendar trigger requires interval >= 1",
      ));
    }
    if self.repeat_count < REPEAT_INDEFINITELY {
      return Err(SchedulerError::invalid_trigger(
        "repeat count must be -1 or non-negative",
      ));
    }
    let has_by_day = self.by_day.as_deref().is_some_and(|s| !s.is_empty());
    let has_by_month_day = self.by_month_day.as_deref().is_some_and(|s| !s.is_empty());
    match self.interval_unit {
      IntervalUnit::Year => {
        if self.by_month.is_none() || (!has_by_day && !has_by_month_day) {
          return Err(SchedulerError::invalid_trigger(
            "yearly schedule requires by_month and one of by_day/by_month_day",
          ));
        }
      }
      IntervalUnit::Month => {
        if !has_by_day && !has_by_month_day {
          return Err(SchedulerError::invalid_trigger(
            "monthly schedule requires one of by_day/by_month_day",
          ));
        }
      }
      IntervalUnit::Week => {
        if !has_by_day {
          return Err(SchedulerError::invalid_trigger(
            "weekly schedule requires by_day",
          ));
        }
      }
      IntervalUnit::Day => {}
      _ => {
        return Err(SchedulerError::invalid_trigger(
          "custom calendar unit must be day, week, month, or year",
        ));
      }
    }
    if let Some(month) = self.by_month {
      if !(1..=12).contains(&month) {
        return Err(SchedulerError::invalid_trigger("by_month must be in [1, 12]"));
      }
    }
    Ok(())
  }
}

impl OperableTrigger for CustomCalendarTrigger {
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
    CustomCalendarTrigger::compute_first_fire_time(self, calendar)
  }

  fn triggered(&mut self, calendar: Option<&CalendarVariant>) {
    CustomCalendarTrigger::triggered(self, calendar)
  }

  fn get_fire_time_after(&self, after: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    CustomCalendarTrigger::get_fire_time_after(self, after)
  }

  fn update_after_misfire(&mut self, calendar: Option<&CalendarVariant>, now: DateTime<Utc>) {
    CustomCalendarTrigger::update_after_misfire(self, calendar, now)
  }

  fn update_with_new_calendar(
    &mut self,
    calendar: &CalendarVariant,
    misfire_threshold: Duration,
    now: DateTime<Utc>,
  ) {
    CustomCalendarTrigger::update_with_new_calendar(self, calendar, misfire_threshold, now)
  }

  fn validate(&self) -> Result<()> {
    CustomCalendarTrigger::validate(self)
  }
}

/// 自定义日历日程构建器
/// Custom-calendar schedule builder
#[derive(Debug, Clone)]
pub struct CustomCalendarScheduleBuilder {
  repeat_count: i32,
  repeat_interval: i32,
  interval_unit: IntervalUnit,
  by_month: Option<u32>,
  by_month_day: Option<String>,
  by_day: Option<String>,
  time_zone: Tz,
  misfire_policy: MisfirePolicy,
}

impl CustomCalendarScheduleBuilder {
  /// 以单位与区间创建
  /// Create with a unit and interval
  pub fn with_interval(repeat_interval: i32, interval_unit: IntervalUnit) -> Self {
    Self {
      repeat_count: REPEAT_INDEFINITELY,
      repeat_interval,
      interval_unit,
      by_month: None,
      by_month_day: None,
      by_day: None,
      time_zone: Tz::UTC,
      misfire_policy: MisfirePolicy::Smart,
    }
  }

  /// 设置 BYMONTH
  /// Set BYMONTH
  pub fn by_month(mut self, month: u32) -> Self {
    self.by_month = Some(month);
    self
  }

  /// 设置 BYMONTHDAY 逗号表
  /// Set the BYMONTHDAY comma list
  pub fn by_month_day<S: Into<String>>(mut self, days: S) -> Self {
    self.by_month_day = Some(days.into());
    self
  }

  /// 设置 BYDAY 逗号表
  /// Set the BYDAY comma list
  pub fn by_day<S: Into<String>>(mut self, days: S) -> Self {
    self.by_day = Some(days.into());
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

  pub(crate) fn build(self, core: TriggerCore) -> CustomCalendarTrigger {
    CustomCalendarTrigger {
      core,
      repeat_count: self.repeat_count,
      repeat_interval: self.repeat_interval,
      interval_unit: self.interval_unit,
      by_month: self.by_month,
      by_month_day: self.by_month_day,
      by_day: self.by_day,
      times_triggered: 0,
      time_zone: self.time_zone,
      misfire_policy: self.misfire_policy,
    }
  }
}
