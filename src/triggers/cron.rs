//! Cron 触发器
//! Cron trigger
//!
//! 由七字段 cron 表达式在指定时区驱动的触发器。
//! Trigger driven by a seven-field cron expression in a given timezone.

use crate::calendar::CalendarVariant;
use crate::cron::CronExpression;
use crate::error::Result;
use crate::triggers::{skip_excluded, MisfirePolicy, OperableTrigger, TriggerCore};
use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

fn default_tz() -> Tz {
  Tz::UTC
}

/// Cron 触发器
/// Cron trigger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CronTrigger {
  #[serde(flatten)]
  pub core: TriggerCore,
  /// cron 表达式
  /// Cron expression
  #[serde(rename = "CronExpression")]
  pub expression: CronExpression,
  /// 求值时区
  /// Evaluation timezone
  #[serde(rename = "TimeZone", default = "default_tz")]
  pub time_zone: Tz,
  /// misfire 策略
  /// Misfire policy
  #[serde(rename = "MisfireInstruction", default)]
  pub misfire_policy: MisfirePolicy,
}

impl CronTrigger {
  /// 重建本日程的构建器
  /// A builder that reproduces this schedule
  pub fn schedule_builder(&self) -> CronScheduleBuilder {
    CronScheduleBuilder {
      expression: self.expression.source().to_string(),
      time_zone: self.time_zone,
      misfire_policy: self.misfire_policy,
    }
  }

  /// 表达式求值并裁剪到 `[start, end]`
  /// Evaluate the expression clipped to `[start, end]`
  fn next_planned_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    // 起点之前的查询从起点前一刻开始
    // Queries before the start begin just before the start instant
    let after = after.max(self.core.start_time - Duration::milliseconds(1));
    let next = self.expression.next_fire_after(after, self.time_zone)?;
    match self.core.end_time {
      Some(end) if next > end => None,
      _ => Some(next),
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
    // 表达式在解析时已经校验
    // The expression was validated at parse time
    Ok(())
  }
}

impl OperableTrigger for CronTrigger {
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
    CronTrigger::compute_first_fire_time(self, calendar)
  }

  fn triggered(&mut self, calendar: Option<&CalendarVariant>) {
    CronTrigger::triggered(self, calendar)
  }

  fn get_fire_time_after(&self, after: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    CronTrigger::get_fire_time_after(self, after)
  }

  fn update_after_misfire(&mut self, calendar: Option<&CalendarVariant>, now: DateTime<Utc>) {
    CronTrigger::update_after_misfire(self, calendar, now)
  }

  fn update_with_new_calendar(
    &mut self,
    calendar: &CalendarVariant,
    misfire_threshold: Duration,
    now: DateTime<Utc>,
  ) {
    CronTrigger::update_with_new_calendar(self, calendar, misfire_threshold, now)
  }

  fn validate(&self) -> Result<()> {
    CronTrigger::validate(self)
  }
}

/// Cron 日程构建器
/// Cron schedule builder
#[derive(Debug, Clone)]
pub struct CronScheduleBuilder {
  expression: String,
  time_zone: Tz,
  misfire_policy: MisfirePolicy,
}

impl CronScheduleBuilder {
  /// 从表达式字符串创建
  /// Create from an expression string
  pub fn cron_schedule<S: Into<String>>(expression: S) -> Self {
    Self {
      expression: expression.into(),
      time_zone: Tz::UTC,
      misfire_policy: MisfirePolicy::Smart,
    }
  }

  /// 每天 `hour:minute` 触发
  /// Fire daily at `hour:minute`
  pub fn daily_at_hour_and_minute(hour: u32, minute: u32) -> Self {
    Self::cron_schedule(format!("0 {minute} {hour} ? * *"))
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

  pub(crate) fn build(self, core: TriggerCore) -> Result<CronTrigger> {
    Ok(CronTrigger {
      core,
      expression: CronExpression::parse(&self.expression)?,
      time_zone: self.time_zone,
      misfire_policy: self.misfire_policy,
    })
  }
}
