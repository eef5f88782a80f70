//! 触发器模块
//! Trigger module
//!
//! 五种触发器状态机共享同一契约：计算首次触发时刻、触发推进、
//! 纯函数式的 `get_fire_time_after`、misfire 处理与日历变更重算。
//! 以带判别标签的变体实现，不使用继承链。
//! The five trigger state machines share one contract: first-fire
//! computation, fire advancement, the pure `get_fire_time_after`,
//! misfire handling, and recomputation on calendar change. Implemented
//! as tagged variants; no inheritance chain.

pub mod calendar_interval;
pub mod cron;
pub mod custom_calendar;
pub mod daily_time_interval;
pub mod simple;

pub use calendar_interval::{CalendarIntervalScheduleBuilder, CalendarIntervalTrigger};
pub use cron::{CronScheduleBuilder, CronTrigger};
pub use custom_calendar::{CustomCalendarScheduleBuilder, CustomCalendarTrigger};
pub use daily_time_interval::{DailyTimeIntervalScheduleBuilder, DailyTimeIntervalTrigger};
pub use simple::{SimpleScheduleBuilder, SimpleTrigger};

use crate::calendar::{Calendar, CalendarVariant};
use crate::cron::YEAR_TO_GIVE_UP_SCHEDULING_AT;
use crate::error::{Result, SchedulerError};
use crate::key::{JobKey, TriggerKey, DEFAULT_GROUP};
use chrono::{DateTime, Datelike, Duration, Utc};
use serde::{Deserialize, Serialize};

/// 默认优先级
/// Default priority
pub const DEFAULT_PRIORITY: i32 = 5;

/// 无限重复的哨兵值
/// Sentinel for indefinite repetition
pub const REPEAT_INDEFINITELY: i32 = -1;

/// 触发器的共享状态
/// Shared state of a trigger
///
/// 键、作业链接、时间边界与触发进度；各变体在其上叠加
/// 自己的日程字段。
/// Keys, job linkage, time bounds, and firing progress; each variant
/// layers its own schedule fields on top.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerCore {
  /// 触发器键
  /// Trigger key
  pub key: TriggerKey,
  /// 所触发作业的键（仅按身份引用）
  /// Key of the triggered job (referenced by identity only)
  pub job_key: JobKey,
  /// 描述
  /// Description
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub description: Option<String>,
  /// 引用的日历名
  /// Referenced calendar name
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub calendar_name: Option<String>,
  /// 优先级，高者先触发
  /// Priority, higher fires first
  pub priority: i32,
  /// 日程开始时刻
  /// Schedule start instant
  pub start_time: DateTime<Utc>,
  /// 日程结束时刻
  /// Schedule end instant
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub end_time: Option<DateTime<Utc>>,
  /// 下一次触发时刻；为 None 即日程耗尽
  /// Next fire instant; None means the schedule is exhausted
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub next_fire_time: Option<DateTime<Utc>>,
  /// 上一次触发时刻
  /// Previous fire instant
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub previous_fire_time: Option<DateTime<Utc>>,
}

impl TriggerCore {
  /// 以键与作业链接创建共享状态
  /// Create the shared state from a key and job linkage
  pub fn new(key: TriggerKey, job_key: JobKey, start_time: DateTime<Utc>) -> Self {
    Self {
      key,
      job_key,
      description: None,
      calendar_name: None,
      priority: DEFAULT_PRIORITY,
      start_time,
      end_time: None,
      next_fire_time: None,
      previous_fire_time: None,
    }
  }
}

/// 单次触发型变体的 misfire 策略
/// Misfire policy for fire-once style variants
///
/// cron、日历区间、每日区间与自定义日历触发器共用。
/// Shared by the cron, calendar-interval, daily-interval, and
/// custom-calendar triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MisfirePolicy {
  /// 智能策略：解析为 `FireOnceNow`
  /// Smart policy: resolves to `FireOnceNow`
  #[default]
  Smart,
  /// 忽略 misfire，按原计划补触发
  /// Ignore misfires, fire all missed instants
  Ignore,
  /// 立即补触发一次，然后回到日程
  /// Fire once immediately, then return to the schedule
  FireOnceNow,
  /// 跳过错过的触发，直接排到下一次
  /// Skip the missed fires and move to the next instant
  DoNothing,
}

/// 简单触发器的 misfire 策略
/// Misfire policy for the simple trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SimpleMisfirePolicy {
  /// 智能策略：`repeat_count == 0` 时为 `FireNow`，
  /// 否则为 `RescheduleNowWithRemainingRepeatCount`
  /// Smart policy: `FireNow` when `repeat_count == 0`, otherwise
  /// `RescheduleNowWithRemainingRepeatCount`
  #[default]
  Smart,
  /// 忽略 misfire
  /// Ignore misfires
  Ignore,
  /// 立即触发
  /// Fire now
  FireNow,
  /// 以现有剩余次数立即重排
  /// Reschedule now with the existing repeat count
  RescheduleNowWithExistingRepeatCount,
  /// 扣除错过次数后立即重排
  /// Reschedule now with the remaining repeat count
  RescheduleNowWithRemainingRepeatCount,
  /// 排到下一次，扣除错过次数
  /// Reschedule to the next instant with the remaining count
  RescheduleNextWithRemainingCount,
  /// 排到下一次，保留计数
  /// Reschedule to the next instant with the existing count
  RescheduleNextWithExistingCount,
}

/// 区间单位
/// Interval unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntervalUnit {
  #[serde(rename = "SECOND")]
  Second,
  #[serde(rename = "MINUTE")]
  Minute,
  #[serde(rename = "HOUR")]
  Hour,
  #[serde(rename = "DAY")]
  Day,
  #[serde(rename = "WEEK")]
  Week,
  #[serde(rename = "MONTH")]
  Month,
  #[serde(rename = "YEAR")]
  Year,
}

impl IntervalUnit {
  /// 持久化字符串
  /// Persistence string
  pub fn as_str(&self) -> &'static str {
    match self {
      IntervalUnit::Second => "SECOND",
      IntervalUnit::Minute => "MINUTE",
      IntervalUnit::Hour => "HOUR",
      IntervalUnit::Day => "DAY",
      IntervalUnit::Week => "WEEK",
      IntervalUnit::Month => "MONTH",
      IntervalUnit::Year => "YEAR",
    }
  }

  /// 从持久化字符串解析
  /// Parse from the persistence string
  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "SECOND" => Some(IntervalUnit::Second),
      "MINUTE" => Some(IntervalUnit::Minute),
      "HOUR" => Some(IntervalUnit::Hour),
      "DAY" => Some(IntervalUnit::Day),
      "WEEK" => Some(IntervalUnit::Week),
      "MONTH" => Some(IntervalUnit::Month),
      "YEAR" => Some(IntervalUnit::Year),
      _ => None,
    }
  }

  /// 时间制单位的毫秒数；日历制单位返回 None
  /// Milliseconds for time-based units; None for calendar-based units
  pub fn fixed_millis(&self) -> Option<i64> {
    match self {
      IntervalUnit::Second => Some(1_000),
      IntervalUnit::Minute => Some(60_000),
      IntervalUnit::Hour => Some(3_600_000),
      _ => None,
    }
  }

  /// RFC-5545 FREQ 名称；仅日/周/月/年有定义
  /// RFC-5545 FREQ name; defined only for day/week/month/year
  pub fn rrule_freq(&self) -> Option<&'static str> {
    match self {
      IntervalUnit::Day => Some("DAILY"),
      IntervalUnit::Week => Some("WEEKLY"),
      IntervalUnit::Month => Some("MONTHLY"),
      IntervalUnit::Year => Some("YEARLY"),
      _ => None,
    }
  }
}

/// 触发器共享契约
/// Shared trigger contract
///
/// `compute_first_fire_time` 必须在首次使用前恰好调用一次。
/// `compute_first_fire_time` must be called exactly once before first use.
pub trait OperableTrigger {
  /// 共享状态
  /// Shared state
  fn core(&self) -> &TriggerCore;

  /// 可变共享状态
  /// Mutable shared state
  fn core_mut(&mut self) -> &mut TriggerCore;

  /// 计算并设置首次触发时刻
  /// Compute and set the first fire instant
  fn compute_first_fire_time(
    &mut self,
    calendar: Option<&CalendarVariant>,
  ) -> Option<DateTime<Utc>>;

  /// 触发推进：`previous ← next`，计数自增，计算新的 `next`
  /// Advance on fire: `previous ← next`, bump counters, compute the new `next`
  fn triggered(&mut self, calendar: Option<&CalendarVariant>);

  /// 严格大于 `after` 的下一个有效时刻；`None` 入参表示当前时刻
  /// The next valid instant strictly greater than `after`; a `None`
  /// argument means the current instant
  fn get_fire_time_after(&self, after: Option<DateTime<Utc>>) -> Option<DateTime<Utc>>;

  /// 按 misfire 策略修正 `next_fire_time`
  /// Adjust `next_fire_time` per the misfire policy
  fn update_after_misfire(&mut self, calendar: Option<&CalendarVariant>, now: DateTime<Utc>);

  /// 日历变更后从 `previous_fire_time` 重算 `next_fire_time`
  /// Recompute `next_fire_time` from `previous_fire_time` after a
  /// calendar change
  fn update_with_new_calendar(
    &mut self,
    calendar: &CalendarVariant,
    misfire_threshold: Duration,
    now: DateTime<Utc>,
  );

  /// 拒绝无意义的参数组合
  /// Reject nonsensical parameterisations
  fn validate(&self) -> Result<()>;

  /// 是否还可能再次触发
  /// Whether the trigger may fire again
  fn may_fire_again(&self) -> bool {
    self.core().next_fire_time.is_some()
  }
}

/// 在日历排除的时刻上循环推进候选触发时刻
/// Advance a candidate fire instant over calendar-excluded instants
///
/// `advance` 给出严格大于入参的下一候选；候选年份越过远期守卫时
/// 退出循环返回 None。
/// `advance` yields the next candidate strictly greater than its
/// argument; the loop bails out with None once the candidate year
/// crosses the far-future guard.
pub(crate) fn skip_excluded<F>(
  mut candidate: Option<DateTime<Utc>>,
  calendar: Option<&CalendarVariant>,
  advance: F,
) -> Option<DateTime<Utc>>
where
  F: Fn(DateTime<Utc>) -> Option<DateTime<Utc>>,
{
  let calendar = match calendar {
    Some(c) => c,
    None => return candidate,
  };
  loop {
    let t = candidate?;
    if t.year() > YEAR_TO_GIVE_UP_SCHEDULING_AT {
      return None;
    }
    if calendar.is_time_included(t) {
      return Some(t);
    }
    candidate = advance(t);
  }
}

/// 各变体日程构建器的统一包装
/// Unified wrapper over the per-variant schedule builders
#[derive(Debug, Clone)]
pub enum ScheduleBuilder {
  Simple(SimpleScheduleBuilder),
  Cron(CronScheduleBuilder),
  CalendarInterval(CalendarIntervalScheduleBuilder),
  DailyTimeInterval(DailyTimeIntervalScheduleBuilder),
  CustomCalendar(CustomCalendarScheduleBuilder),
}

impl ScheduleBuilder {
  fn build_trigger(self, core: TriggerCore) -> Result<Trigger> {
    match self {
      ScheduleBuilder::Simple(b) => Ok(Trigger::Simple(b.build(core))),
      ScheduleBuilder::Cron(b) => Ok(Trigger::Cron(b.build(core)?)),
      ScheduleBuilder::CalendarInterval(b) => Ok(Trigger::CalendarInterval(b.build(core))),
      ScheduleBuilder::DailyTimeInterval(b) => Ok(Trigger::DailyTimeInterval(b.build(core))),
      ScheduleBuilder::CustomCalendar(b) => Ok(Trigger::CustomCalendar(b.build(core))),
    }
  }
}

/// 带判别标签的触发器变体
/// Tagged trigger variant
///
/// 序列化判别值与持久化存储的 `trigger_type` 一致。
/// The serialized discriminator matches the persisted `trigger_type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "TriggerType")]
pub enum Trigger {
  #[serde(rename = "SIMPLE")]
  Simple(SimpleTrigger),
  #[serde(rename = "CRON")]
  Cron(CronTrigger),
  #[serde(rename = "CAL_INT")]
  CalendarInterval(CalendarIntervalTrigger),
  #[serde(rename = "DAILY_I")]
  DailyTimeInterval(DailyTimeIntervalTrigger),
  #[serde(rename = "CUSTOM_CAL")]
  CustomCalendar(CustomCalendarTrigger),
}

macro_rules! dispatch {
  ($self:ident, $t:ident => $body:expr) => {
    match $self {
      Trigger::Simple($t) => $body,
      Trigger::Cron($t) => $body,
      Trigger::CalendarInterval($t) => $body,
      Trigger::DailyTimeInterval($t) => $body,
      Trigger::CustomCalendar($t) => $body,
    }
  };
}

impl Trigger {
  /// 进入触发器构建器 DSL
  /// Enter the trigger builder DSL
  pub fn builder() -> TriggerBuilder {
    TriggerBuilder::default()
  }

  /// 持久化判别值
  /// Persistence discriminator
  pub fn trigger_type(&self) -> &'static str {
    match self {
      Trigger::Simple(_) => "SIMPLE",
      Trigger::Cron(_) => "CRON",
      Trigger::CalendarInterval(_) => "CAL_INT",
      Trigger::DailyTimeInterval(_) => "DAILY_I",
      Trigger::CustomCalendar(_) => "CUSTOM_CAL",
    }
  }

  /// 触发器键
  /// Trigger key
  pub fn key(&self) -> &TriggerKey {
    dispatch!(self, t => &t.core.key)
  }

  /// 作业键
  /// Job key
  pub fn job_key(&self) -> &JobKey {
    dispatch!(self, t => &t.core.job_key)
  }

  /// 优先级
  /// Priority
  pub fn priority(&self) -> i32 {
    dispatch!(self, t => t.core.priority)
  }

  /// 引用的日历名
  /// Referenced calendar name
  pub fn calendar_name(&self) -> Option<&str> {
    dispatch!(self, t => t.core.calendar_name.as_deref())
  }

  /// misfire 策略是否为忽略
  /// Whether the misfire policy is ignore
  ///
  /// 忽略策略的触发器不进入 misfire 扫描：它们按原计划补触发。
  /// Ignore-policy triggers stay out of misfire scans: they fire all
  /// missed instants as planned.
  pub fn misfire_policy_ignored(&self) -> bool {
    match self {
      Trigger::Simple(t) => t.misfire_policy == SimpleMisfirePolicy::Ignore,
      Trigger::Cron(t) => t.misfire_policy == MisfirePolicy::Ignore,
      Trigger::CalendarInterval(t) => t.misfire_policy == MisfirePolicy::Ignore,
      Trigger::DailyTimeInterval(t) => t.misfire_policy == MisfirePolicy::Ignore,
      Trigger::CustomCalendar(t) => t.misfire_policy == MisfirePolicy::Ignore,
    }
  }

  /// 下一次触发时刻
  /// Next fire instant
  pub fn next_fire_time(&self) -> Option<DateTime<Utc>> {
    dispatch!(self, t => t.core.next_fire_time)
  }

  /// 上一次触发时刻
  /// Previous fire instant
  pub fn previous_fire_time(&self) -> Option<DateTime<Utc>> {
    dispatch!(self, t => t.core.previous_fire_time)
  }

  /// 开始时刻
  /// Start instant
  pub fn start_time(&self) -> DateTime<Utc> {
    dispatch!(self, t => t.core.start_time)
  }

  /// 结束时刻
  /// End instant
  pub fn end_time(&self) -> Option<DateTime<Utc>> {
    dispatch!(self, t => t.core.end_time)
  }
}

impl OperableTrigger for Trigger {
  fn core(&self) -> &TriggerCore {
    dispatch!(self, t => &t.core)
  }

  fn core_mut(&mut self) -> &mut TriggerCore {
    dispatch!(self, t => &mut t.core)
  }

  fn compute_first_fire_time(
    &mut self,
    calendar: Option<&CalendarVariant>,
  ) -> Option<DateTime<Utc>> {
    dispatch!(self, t => t.compute_first_fire_time(calendar))
  }

  fn triggered(&mut self, calendar: Option<&CalendarVariant>) {
    dispatch!(self, t => t.triggered(calendar))
  }

  fn get_fire_time_after(&self, after: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    dispatch!(self, t => t.get_fire_time_after(after))
  }

  fn update_after_misfire(&mut self, calendar: Option<&CalendarVariant>, now: DateTime<Utc>) {
    dispatch!(self, t => t.update_after_misfire(calendar, now))
  }

  fn update_with_new_calendar(
    &mut self,
    calendar: &CalendarVariant,
    misfire_threshold: Duration,
    now: DateTime<Utc>,
  ) {
    dispatch!(self, t => t.update_with_new_calendar(calendar, misfire_threshold, now))
  }

  fn validate(&self) -> Result<()> {
    dispatch!(self, t => t.validate())
  }
}

/// 触发器构建器
/// Trigger builder
///
/// `Trigger::builder().with_identity(..).for_job(..).start_at(..)
///   .with_schedule(..).build()`
#[derive(Debug, Default)]
pub struct TriggerBuilder {
  key: Option<TriggerKey>,
  job_key: Option<JobKey>,
  description: Option<String>,
  calendar_name: Option<String>,
  priority: i32,
  start_time: Option<DateTime<Utc>>,
  end_time: Option<DateTime<Utc>>,
  schedule: Option<ScheduleBuilder>,
}

impl TriggerBuilder {
  /// 设置标识
  /// Set the identity
  pub fn with_identity<N: Into<String>, G: Into<String>>(mut self, name: N, group: G) -> Self {
    self.key = Some(TriggerKey::new(name, group));
    self
  }

  /// 关联作业
  /// Link the job
  pub fn for_job(mut self, job_key: JobKey) -> Self {
    self.job_key = Some(job_key);
    self
  }

  /// 设置描述
  /// Set the description
  pub fn with_description<S: Into<String>>(mut self, description: S) -> Self {
    self.description = Some(description.into());
    self
  }

  /// 按名引用日历
  /// Reference a calendar by name
  pub fn modified_by_calendar<S: Into<String>>(mut self, name: S) -> Self {
    self.calendar_name = Some(name.into());
    self
  }

  /// 设置优先级
  /// Set the priority
  pub fn with_priority(mut self, priority: i32) -> Self {
    self.priority = priority;
    self
  }

  /// 设置开始时刻
  /// Set the start instant
  pub fn start_at(mut self, start_time: DateTime<Utc>) -> Self {
    self.start_time = Some(start_time);
    self
  }

  /// 设置结束时刻
  /// Set the end instant
  pub fn end_at(mut self, end_time: DateTime<Utc>) -> Self {
    self.end_time = Some(end_time);
    self
  }

  /// 设置日程
  /// Set the schedule
  pub fn with_schedule<S: Into<ScheduleBuilder>>(mut self, schedule: S) -> Self {
    self.schedule = Some(schedule.into());
    self
  }

  /// 构建触发器
  /// Build the trigger
  ///
  /// 未设置日程时构建单次简单触发器；未设置开始时刻时取当前时刻。
  /// Builds a one-shot simple trigger when no schedule is set; the start
  /// instant defaults to now.
  pub fn build(self) -> Result<Trigger> {
    let job_key = self
      .job_key
      .ok_or_else(|| SchedulerError::invalid_trigger("trigger requires a job key"))?;
    let key = self.key.unwrap_or_else(|| TriggerKey::unique(DEFAULT_GROUP));
    let start_time = self.start_time.unwrap_or_else(Utc::now);

    let mut core = TriggerCore::new(key, job_key, start_time);
    core.description = self.description;
    core.calendar_name = self.calendar_name;
    core.priority = if self.priority == 0 {
      DEFAULT_PRIORITY
    } else {
      self.priority
    };
    core.end_time = self.end_time;

    if let Some(end) = core.end_time {
      if end < core.start_time {
        return Err(SchedulerError::invalid_trigger(
          "end time cannot precede start time",
        ));
      }
    }

    let schedule = self
      .schedule
      .unwrap_or(ScheduleBuilder::Simple(SimpleScheduleBuilder::once()));
    let trigger = schedule.build_trigger(core)?;
    trigger.validate()?;
    Ok(trigger)
  }
}

impl From<SimpleScheduleBuilder> for ScheduleBuilder {
  fn from(b: SimpleScheduleBuilder) -> Self {
    ScheduleBuilder::Simple(b)
  }
}

impl From<CronScheduleBuilder> for ScheduleBuilder {
  fn from(b: CronScheduleBuilder) -> Self {
    ScheduleBuilder::Cron(b)
  }
}

impl From<CalendarIntervalScheduleBuilder> for ScheduleBuilder {
  fn from(b: CalendarIntervalScheduleBuilder) -> Self {
    ScheduleBuilder::CalendarInterval(b)
  }
}

impl From<DailyTimeIntervalScheduleBuilder> for ScheduleBuilder {
  fn from(b: DailyTimeIntervalScheduleBuilder) -> Self {
    ScheduleBuilder::DailyTimeInterval(b)
  }
}

impl From<CustomCalendarScheduleBuilder> for ScheduleBuilder {
  fn from(b: CustomCalendarScheduleBuilder) -> Self {
    ScheduleBuilder::CustomCalendar(b)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::TimeZone;

  #[test]
  fn test_builder_defaults() {
    let trigger = Trigger::builder()
      .for_job(JobKey::new("job", "g"))
      .start_at(Utc.with_ymd_and_hms(2024, 7, 15, 5, 0, 0).unwrap())
      .build()
      .unwrap();

    assert_eq!(trigger.trigger_type(), "SIMPLE");
    assert_eq!(trigger.priority(), DEFAULT_PRIORITY);
    assert_eq!(trigger.key().group, DEFAULT_GROUP);
  }

  #[test]
  fn test_builder_rejects_end_before_start() {
    let start = Utc.with_ymd_and_hms(2024, 7, 15, 5, 0, 0).unwrap();
    let result = Trigger::builder()
      .for_job(JobKey::new("job", "g"))
      .start_at(start)
      .end_at(start - Duration::hours(1))
      .build();
    assert!(result.is_err());
  }

  #[test]
  fn test_builder_requires_job() {
    assert!(Trigger::builder().build().is_err());
  }

  #[test]
  fn test_trigger_type_discriminator_in_json() {
    let trigger = Trigger::builder()
      .with_identity("t", "g")
      .for_job(JobKey::new("job", "g"))
      .start_at(Utc.with_ymd_and_hms(2024, 7, 15, 5, 0, 0).unwrap())
      .build()
      .unwrap();
    let json = serde_json::to_string(&trigger).unwrap();
    assert!(json.contains("\"TriggerType\":\"SIMPLE\""));
  }
}
