//! 简单触发器
//! Simple trigger
//!
//! 在 `start_time + k·interval`（k = 0..repeat_count）触发。
//! Fires at `start_time + k·interval` for `k = 0..repeat_count`.

use crate::calendar::CalendarVariant;
use crate::error::{Result, SchedulerError};
use crate::triggers::{
  skip_excluded, OperableTrigger, SimpleMisfirePolicy, TriggerCore, REPEAT_INDEFINITELY,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// 简单触发器
/// Simple trigger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimpleTrigger {
  #[serde(flatten)]
  pub core: TriggerCore,
  /// 重复次数；-1 表示无限
  /// Repeat count; -1 means indefinite
  #[serde(rename = "RepeatCount")]
  pub repeat_count: i32,
  /// 重复间隔（毫秒）
  /// Repeat interval (milliseconds)
  #[serde(rename = "RepeatInterval")]
  pub repeat_interval_millis: i64,
  /// 已触发次数
  /// Number of times triggered
  #[serde(rename = "TimesTriggered", default)]
  pub times_triggered: i32,
  /// misfire 策略
  /// Misfire policy
  #[serde(rename = "MisfireInstruction", default)]
  pub misfire_policy: SimpleMisfirePolicy,
}

impl SimpleTrigger {
  /// 重复间隔
  /// Repeat interval
  pub fn repeat_interval(&self) -> Duration {
    Duration::milliseconds(self.repeat_interval_millis)
  }

  /// 重建本日程的构建器
  /// A builder that reproduces this schedule
  pub fn schedule_builder(&self) -> SimpleScheduleBuilder {
    SimpleScheduleBuilder {
      repeat_count: self.repeat_count,
      repeat_interval_millis: self.repeat_interval_millis,
      misfire_policy: self.misfire_policy,
    }
  }

  /// 在给定时刻之后的下一个计划时刻，不考虑日历
  /// The next planned instant after the given one, calendar-blind
  fn next_planned_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if after < self.core.start_time {
      return self.bounded(self.core.start_time);
    }
    if self.repeat_interval_millis <= 0 {
      // 单次触发且起点已过
      // One-shot whose start has passed
      return None;
    }
    let elapsed = (after - self.core.start_time).num_milliseconds();
    let times_after = elapsed / self.repeat_interval_millis + 1;
    if self.repeat_count != REPEAT_INDEFINITELY && times_after > self.repeat_count as i64 {
      return None;
    }
    self.bounded(
      self.core.start_time + Duration::milliseconds(times_after * self.repeat_interval_millis),
    )
  }

  fn bounded(&self, instant: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match self.core.end_time {
      Some(end) if instant > end => None,
      _ => Some(instant),
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
      SimpleMisfirePolicy::Smart => {
        if self.repeat_count == 0 {
          SimpleMisfirePolicy::FireNow
        } else {
          SimpleMisfirePolicy::RescheduleNowWithRemainingRepeatCount
        }
      }
      other => other,
    };

    match policy {
      SimpleMisfirePolicy::Ignore => {}
      SimpleMisfirePolicy::FireNow => {
        self.core.next_fire_time = Some(now);
      }
      SimpleMisfirePolicy::RescheduleNowWithExistingRepeatCount => {
        self.reschedule_now(now, None);
      }
      SimpleMisfirePolicy::RescheduleNowWithRemainingRepeatCount => {
        let missed = self
          .core
          .next_fire_time
          .map(|next| {
            if now <= next || self.repeat_interval_millis <= 0 {
              0
            } else {
              (now - next).num_milliseconds() / self.repeat_interval_millis + 1
            }
          })
          .unwrap_or(0);
        self.reschedule_now(now, Some(missed));
      }
      SimpleMisfirePolicy::RescheduleNextWithRemainingCount
      | SimpleMisfirePolicy::RescheduleNextWithExistingCount => {
        let next = self.next_planned_after(now);
        self.core.next_fire_time =
          skip_excluded(next, calendar, |t| self.next_planned_after(t));
      }
      SimpleMisfirePolicy::Smart => unreachable!(),
    }
  }

  /// 将日程锚点移到当前时刻；`missed` 为需要扣除的错过次数
  /// Move the schedule anchor to now; `missed` is the number of missed
  /// fires to deduct
  fn reschedule_now(&mut self, now: DateTime<Utc>, missed: Option<i64>) {
    if self.repeat_count != REPEAT_INDEFINITELY && self.repeat_count != 0 {
      let consumed = self.times_triggered as i64 + missed.unwrap_or(0);
      let remaining = (self.repeat_count as i64 - consumed).max(0);
      self.repeat_count = remaining as i32;
      self.times_triggered = 0;
    }
    match self.core.end_time {
      Some(end) if end < now => {
        self.core.next_fire_time = None;
      }
      _ => {
        self.core.start_time = now;
        self.core.next_fire_time = Some(now);
      }
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
        // 重算结果已深陷过去，推进到当前时刻之后
        // The recomputed instant is deep in the past, advance past now
        skip_excluded(self.next_planned_after(now), Some(calendar), |t| {
          self.next_planned_after(t)
        })
      }
      other => other,
    };
  }

  pub(crate) fn validate(&self) -> Result<()> {
    if self.repeat_count < REPEAT_INDEFINITELY {
      return Err(SchedulerError::invalid_trigger(
        "repeat count must be -1 or non-negative",
      ));
    }
    if self.repeat_count != 0 && self.repeat_interval_millis <= 0 {
      return Err(SchedulerError::invalid_trigger(
        "repeating simple trigger requires a positive repeat interval",
      ));
    }
    Ok(())
  }
}

impl OperableTrigger for SimpleTrigger {
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
    SimpleTrigger::compute_first_fire_time(self, calendar)
  }

  fn triggered(&mut self, calendar: Option<&CalendarVariant>) {
    SimpleTrigger::triggered(self, calendar)
  }

  fn get_fire_time_after(&self, after: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    SimpleTrigger::get_fire_time_after(self, after)
  }

  fn update_after_misfire(&mut self, calendar: Option<&CalendarVariant>, now: DateTime<Utc>) {
    SimpleTrigger::update_after_misfire(self, calendar, now)
  }

  fn update_with_new_calendar(
    &mut self,
    calendar: &CalendarVariant,
    misfire_threshold: Duration,
    now: DateTime<Utc>,
  ) {
    SimpleTrigger::update_with_new_calendar(self, calendar, misfire_threshold, now)
  }

  fn validate(&self) -> Result<()> {
    SimpleTrigger::validate(self)
  }
}

/// 简单日程构建器
/// Simple schedule builder
#[derive(Debug, Clone)]
pub struct SimpleScheduleBuilder {
  repeat_count: i32,
  repeat_interval_millis: i64,
  misfire_policy: SimpleMisfirePolicy,
}

impl SimpleScheduleBuilder {
  /// 单次触发
  /// One-shot schedule
  pub fn once() -> Self {
    Self {
      repeat_count: 0,
      repeat_interval_millis: 0,
      misfire_policy: SimpleMisfirePolicy::Smart,
    }
  }

  /// 按固定间隔重复
  /// Repeat at a fixed interval
  pub fn with_interval(interval: Duration) -> Self {
    Self {
      repeat_count: REPEAT_INDEFINITELY,
      repeat_interval_millis: interval.num_milliseconds(),
      misfire_policy: SimpleMisfirePolicy::Smart,
    }
  }

  /// 每 n 秒重复
  /// Repeat every n seconds
  pub fn with_interval_in_seconds(seconds: i64) -> Self {
    Self::with_interval(Duration::seconds(seconds))
  }

  /// 设置重复次数（额外触发次数，首个触发不计）
  /// Set the repeat count (additional fires beyond the first)
  pub fn with_repeat_count(mut self, repeat_count: i32) -> Self {
    self.repeat_count = repeat_count;
    self
  }

  /// 无限重复
  /// Repeat forever
  pub fn repeat_forever(mut self) -> Self {
    self.repeat_count = REPEAT_INDEFINITELY;
    self
  }

  /// misfire 时立即触发
  /// Fire now on misfire
  pub fn with_misfire_handling_instruction_fire_now(mut self) -> Self {
    self.misfire_policy = SimpleMisfirePolicy::FireNow;
    self
  }

  /// misfire 时排到下一次并扣除计数
  /// Reschedule to next with remaining count on misfire
  pub fn with_misfire_handling_instruction_next_with_remaining_count(mut self) -> Self {
    self.misfire_policy = SimpleMisfirePolicy::RescheduleNextWithRemainingCount;
    self
  }

  /// misfire 时忽略
  /// Ignore misfires
  pub fn with_misfire_handling_instruction_ignore_misfires(mut self) -> Self {
    self.misfire_policy = SimpleMisfirePolicy::Ignore;
    self
  }

  pub(crate) fn build(self, core: TriggerCore) -> SimpleTrigger {
    SimpleTrigger {
      core,
      repeat_count: self.repeat_count,
      repeat_interval_millis: self.repeat_interval_millis,
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

  fn trigger(start: DateTime<Utc>, repeat_count: i32, interval_secs: i64) -> SimpleTrigger {
    SimpleScheduleBuilder::with_interval_in_seconds(interval_secs)
      .with_repeat_count(repeat_count)
      .build(TriggerCore::new(
        TriggerKey::new("t", "g"),
        JobKey::new("j", "g"),
        start,
      ))
  }

  #[test]
  fn test_fire_sequence_length_is_repeat_count_plus_one() {
    let start = utc(2024, 7, 15, 5, 0, 0);
    let mut t = trigger(start, 2, 30);
    let mut fires = Vec::new();
    let mut first = t.compute_first_fire_time(None);
    while let Some(f) = first {
      fires.push(f);
      t.triggered(None);
      first = t.core.next_fire_time;
    }
    assert_eq!(
      fires,
      vec![
        start,
        start + Duration::seconds(30),
        start + Duration::seconds(60),
      ]
    );
  }

  #[test]
  fn test_one_shot_in_the_past_yields_nothing() {
    // repeatCount = 0 且起始为最小时刻：已成过去，没有下一次
    // repeatCount = 0 with minimum start: already past, no next fire
    let t = trigger(DateTime::<Utc>::MIN_UTC, 0, 0);
    assert_eq!(t.get_fire_time_after(None), None);
  }

  #[test]
  fn test_get_fire_time_after_is_strictly_greater() {
    let start = utc(2024, 7, 15, 5, 0, 0);
    let t = trigger(start, REPEAT_INDEFINITELY, 10);
    let at_fire = t.get_fire_time_after(Some(start)).unwrap();
    assert_eq!(at_fire, start + Duration::seconds(10));
    let before = t.get_fire_time_after(Some(start - Duration::seconds(1))).unwrap();
    assert_eq!(before, start);
  }

  #[test]
  fn test_end_time_caps_sequence() {
    let start = utc(2024, 7, 15, 5, 0, 0);
    let mut t = trigger(start, REPEAT_INDEFINITELY, 60);
    t.core.end_time = Some(start + Duration::seconds(90));
    let mut fires = Vec::new();
    let mut next = t.compute_first_fire_time(None);
    while let Some(f) = next {
      fires.push(f);
      t.triggered(None);
      next = t.core.next_fire_time;
    }
    assert_eq!(fires, vec![start, start + Duration::seconds(60)]);
  }

  #[test]
  fn test_misfire_smart_with_remaining_count() {
    let start = utc(2024, 7, 15, 5, 0, 0);
    let mut t = trigger(start, 10, 60);
    t.compute_first_fire_time(None);
    // 错过了 5 次触发
    // Five fires were missed
    let now = start + Duration::seconds(299);
    t.update_after_misfire(None, now);
    assert_eq!(t.core.next_fire_time, Some(now));
    assert_eq!(t.core.start_time, now);
    assert_eq!(t.repeat_count, 5);
    assert_eq!(t.times_triggered, 0);
  }

  #[test]
  fn test_misfire_ignore_keeps_next_fire_time() {
    let start = utc(2024, 7, 15, 5, 0, 0);
    let mut t = trigger(start, 10, 60);
    t.misfire_policy = SimpleMisfirePolicy::Ignore;
    t.compute_first_fire_time(None);
    t.update_after_misfire(None, start + Duration::hours(1));
    assert_eq!(t.core.next_fire_time, Some(start));
  }

  #[test]
  fn test_validation() {
    let start = utc(2024, 7, 15, 5, 0, 0);
    assert!(trigger(start, -2, 10).validate().is_err());
    let t = SimpleScheduleBuilder::once().build(TriggerCore::new(
      TriggerKey::new("t", "g"),
      JobKey::new("j", "g"),
      start,
    ));
    assert!(t.validate().is_ok());
    assert!(trigger(start, 3, 0).validate().is_err());
  }

  #[test]
  fn test_schedule_builder_round_trip() {
    let start = utc(2024, 7, 15, 5, 0, 0);
    let original = trigger(start, 7, 45);
    let rebuilt = original.schedule_builder().build(original.core.clone());
    assert_eq!(rebuilt.repeat_count, original.repeat_count);
    assert_eq!(rebuilt.repeat_interval_millis, original.repeat_interval_millis);
    assert_eq!(rebuilt.misfire_policy, original.misfire_policy);
  }
}
