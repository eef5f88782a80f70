//! 日历模块
//! Calendar module
//!
//! 日历是可链式组合的时间谓词：`is_time_included(instant)` 为 false 的
//! 候选触发时刻会被跳过。每个日历可以包装一个基础日历，生效谓词为
//! 两者的合取。
//! Calendars are chainable time predicates: candidate fire instants for
//! which `is_time_included(instant)` is false are skipped. Each calendar
//! may wrap a base calendar; the effective predicate is the conjunction.

use crate::cron::{CronExpression, YEAR_TO_GIVE_UP_SCHEDULING_AT};
use crate::time::TimeOfDay;
use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// 日历谓词
/// Calendar predicate
pub trait Calendar: Send + Sync {
  /// 时刻是否包含（未被排除）
  /// Whether the instant is included (not excluded)
  fn is_time_included(&self, instant: DateTime<Utc>) -> bool;

  /// 不早于给定时刻的下一个被包含时刻
  /// The next included instant not before the given one
  fn next_included_time(&self, instant: DateTime<Utc>) -> Option<DateTime<Utc>>;
}

fn default_tz() -> Tz {
  Tz::UTC
}

/// 年度日历：每年排除固定的（月, 日）集合
/// Annual calendar: excludes a fixed set of (month, day) pairs every year
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnualCalendar {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub base: Option<Box<CalendarVariant>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub description: Option<String>,
  #[serde(default = "default_tz")]
  pub time_zone: Tz,
  /// 排除的（月, 日）对
  /// Excluded (month, day) pairs
  pub excluded_days: BTreeSet<(u32, u32)>,
}

impl Default for AnnualCalendar {
  fn default() -> Self {
    Self {
      base: None,
      description: None,
      time_zone: Tz::UTC,
      excluded_days: BTreeSet::new(),
    }
  }
}

impl AnnualCalendar {
  fn excludes(&self, instant: DateTime<Utc>) -> bool {
    let local = instant.with_timezone(&self.time_zone);
    self.excluded_days.contains(&(local.month(), local.day()))
  }
}

/// 月度日历：排除每月固定的日集合
/// Monthly calendar: excludes a fixed set of days in every month
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthlyCalendar {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub base: Option<Box<CalendarVariant>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub description: Option<String>,
  #[serde(default = "default_tz")]
  pub time_zone: Tz,
  /// 排除的日（1-31）
  /// Excluded days of month (1-31)
  pub excluded_days: BTreeSet<u32>,
}

impl Default for MonthlyCalendar {
  fn default() -> Self {
    Self {
      base: None,
      description: None,
      time_zone: Tz::UTC,
      excluded_days: BTreeSet::new(),
    }
  }
}

impl MonthlyCalendar {
  fn excludes(&self, instant: DateTime<Utc>) -> bool {
    let local = instant.with_timezone(&self.time_zone);
    self.excluded_days.contains(&local.day())
  }
}

/// 每周日历：排除固定的周几集合（1 = 周日 … 7 = 周六）
/// Weekly calendar: excludes a fixed set of weekdays (1 = Sunday … 7 = Saturday)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeeklyCalendar {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub base: Option<Box<CalendarVariant>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub description: Option<String>,
  #[serde(default = "default_tz")]
  pub time_zone: Tz,
  /// 排除的周几
  /// Excluded weekdays
  pub excluded_days: BTreeSet<u32>,
}

impl Default for WeeklyCalendar {
  fn default() -> Self {
    // 默认排除周末
    // Weekends are excluded by default
    let mut excluded_days = BTreeSet::new();
    excluded_days.insert(1);
    excluded_days.insert(7);
    Self {
      base: None,
      description: None,
      time_zone: Tz::UTC,
      excluded_days,
    }
  }
}

impl WeeklyCalendar {
  fn excludes(&self, instant: DateTime<Utc>) -> bool {
    let local = instant.with_timezone(&self.time_zone);
    let dow = local.weekday().num_days_from_sunday() + 1;
    self.excluded_days.contains(&dow)
  }
}

/// 每日时间窗口日历：每天排除 `[range_start, range_end]` 窗口
/// Daily time-window calendar: excludes the `[range_start, range_end]`
/// window every day
///
/// `invert_time_range` 置位时窗口之外的时间才被排除。
/// With `invert_time_range` set, times outside the window are excluded
/// instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyCalendar {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub base: Option<Box<CalendarVariant>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub description: Option<String>,
  #[serde(default = "default_tz")]
  pub time_zone: Tz,
  pub range_start: TimeOfDay,
  pub range_end: TimeOfDay,
  #[serde(default)]
  pub invert_time_range: bool,
}

impl DailyCalendar {
  fn excludes(&self, instant: DateTime<Utc>) -> bool {
    let local = instant.with_timezone(&self.time_zone);
    let tod = TimeOfDay {
      hour: local.hour(),
      minute: local.minute(),
      second: local.second(),
    };
    let in_range = tod >= self.range_start && tod <= self.range_end;
    in_range != self.invert_time_range
  }
}

/// Cron 日历：排除满足 cron 表达式的时刻
/// Cron calendar: excludes instants that satisfy the cron expression
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CronCalendar {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub base: Option<Box<CalendarVariant>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub description: Option<String>,
  #[serde(default = "default_tz")]
  pub time_zone: Tz,
  pub expression: CronExpression,
}

impl CronCalendar {
  fn excludes(&self, instant: DateTime<Utc>) -> bool {
    self.expression.is_satisfied_by(instant, self.time_zone)
  }
}

/// 节假日日历：排除显式列出的日期
/// Holiday calendar: excludes an explicit set of dates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HolidayCalendar {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub base: Option<Box<CalendarVariant>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub description: Option<String>,
  #[serde(default = "default_tz")]
  pub time_zone: Tz,
  /// 排除的日期（时区本地日）
  /// Excluded dates (zone-local days)
  pub excluded_dates: BTreeSet<NaiveDate>,
}

impl Default for HolidayCalendar {
  fn default() -> Self {
    Self {
      base: None,
      description: None,
      time_zone: Tz::UTC,
      excluded_dates: BTreeSet::new(),
    }
  }
}

impl HolidayCalendar {
  fn excludes(&self, instant: DateTime<Utc>) -> bool {
    let local = instant.with_timezone(&self.time_zone);
    self.excluded_dates.contains(&local.date_naive())
  }
}

impl Default for DailyCalendar {
  fn default() -> Self {
    Self {
      base: None,
      description: None,
      time_zone: Tz::UTC,
      range_start: TimeOfDay::midnight(),
      range_end: TimeOfDay::midnight(),
      invert_time_range: false,
    }
  }
}

/// 带判别标签的日历变体
/// Tagged calendar variant
///
/// 以名称存储并被触发器按名引用；序列化时 `Type` 为判别字段。
/// Stored by name and referenced by triggers; `Type` is the serialized
/// discriminator field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "Type")]
pub enum CalendarVariant {
  #[serde(rename = "ANNUAL")]
  Annual(AnnualCalendar),
  #[serde(rename = "MONTHLY")]
  Monthly(MonthlyCalendar),
  #[serde(rename = "WEEKLY")]
  Weekly(WeeklyCalendar),
  #[serde(rename = "DAILY")]
  Daily(DailyCalendar),
  #[serde(rename = "CRON")]
  Cron(CronCalendar),
  #[serde(rename = "HOLIDAY")]
  Holiday(HolidayCalendar),
}

impl CalendarVariant {
  fn excludes_own(&self, instant: DateTime<Utc>) -> bool {
    match self {
      CalendarVariant::Annual(c) => c.excludes(instant),
      CalendarVariant::Monthly(c) => c.excludes(instant),
      CalendarVariant::Weekly(c) => c.excludes(instant),
      CalendarVariant::Daily(c) => c.excludes(instant),
      CalendarVariant::Cron(c) => c.excludes(instant),
      CalendarVariant::Holiday(c) => c.excludes(instant),
    }
  }

  fn base(&self) -> Option<&CalendarVariant> {
    match self {
      CalendarVariant::Annual(c) => c.base.as_deref(),
      CalendarVariant::Monthly(c) => c.base.as_deref(),
      CalendarVariant::Weekly(c) => c.base.as_deref(),
      CalendarVariant::Daily(c) => c.base.as_deref(),
      CalendarVariant::Cron(c) => c.base.as_deref(),
      CalendarVariant::Holiday(c) => c.base.as_deref(),
    }
  }

  /// 所属时区
  /// Owning timezone
  fn time_zone(&self) -> Tz {
    match self {
      CalendarVariant::Annual(c) => c.time_zone,
      CalendarVariant::Monthly(c) => c.time_zone,
      CalendarVariant::Weekly(c) => c.time_zone,
      CalendarVariant::Daily(c) => c.time_zone,
      CalendarVariant::Cron(c) => c.time_zone,
      CalendarVariant::Holiday(c) => c.time_zone,
    }
  }

  /// 是否按整日粒度排除
  /// Whether exclusion is day-granular
  fn day_granular(&self) -> bool {
    matches!(
      self,
      CalendarVariant::Annual(_)
        | CalendarVariant::Monthly(_)
        | CalendarVariant::Weekly(_)
        | CalendarVariant::Holiday(_)
    )
  }
}

impl Calendar for CalendarVariant {
  fn is_time_included(&self, instant: DateTime<Utc>) -> bool {
    if let Some(base) = self.base() {
      if !base.is_time_included(instant) {
        return false;
      }
    }
    !self.excludes_own(instant)
  }

  fn next_included_time(&self, instant: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let mut candidate = instant;
    loop {
      if candidate.year() > YEAR_TO_GIVE_UP_SCHEDULING_AT {
        return None;
      }
      if self.is_time_included(candidate) {
        return Some(candidate);
      }
      candidate = if self.day_granular() {
        // 对齐到本日历时区的下一个零点
        // Align to the next midnight in this calendar's timezone
        let tz = self.time_zone();
        let next_day = candidate.with_timezone(&tz).date_naive().succ_opt()?;
        match tz.from_local_datetime(&next_day.and_hms_opt(0, 0, 0)?) {
          chrono::LocalResult::Single(dt) => dt.with_timezone(&Utc),
          chrono::LocalResult::Ambiguous(earliest, _) => earliest.with_timezone(&Utc),
          chrono::LocalResult::None => candidate + Duration::days(1),
        }
      } else {
        candidate + Duration::seconds(1)
      };
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::TimeZone;

  fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
  }

  #[test]
  fn test_holiday_calendar_excludes_dates() {
    let mut cal = HolidayCalendar::default();
    cal
      .excluded_dates
      .insert(NaiveDate::from_ymd_opt(2024, 12, 25).unwrap());
    let cal = CalendarVariant::Holiday(cal);

    assert!(!cal.is_time_included(utc(2024, 12, 25, 9, 0, 0)));
    assert!(cal.is_time_included(utc(2024, 12, 26, 9, 0, 0)));

    let next = cal.next_included_time(utc(2024, 12, 25, 9, 0, 0)).unwrap();
    assert_eq!(next, utc(2024, 12, 26, 0, 0, 0));
  }

  #[test]
  fn test_weekly_calendar_default_excludes_weekend() {
    let cal = CalendarVariant::Weekly(WeeklyCalendar::default());
    // 2024-07-13 是周六，2024-07-15 是周一
    // 2024-07-13 is a Saturday, 2024-07-15 a Monday
    assert!(!cal.is_time_included(utc(2024, 7, 13, 12, 0, 0)));
    assert!(!cal.is_time_included(utc(2024, 7, 14, 12, 0, 0)));
    assert!(cal.is_time_included(utc(2024, 7, 15, 12, 0, 0)));
  }

  #[test]
  fn test_daily_calendar_window() {
    let cal = CalendarVariant::Daily(DailyCalendar {
      range_start: TimeOfDay::new(1, 0, 0).unwrap(),
      range_end: TimeOfDay::new(3, 0, 0).unwrap(),
      ..DailyCalendar::default()
    });
    assert!(!cal.is_time_included(utc(2024, 7, 15, 2, 0, 0)));
    assert!(cal.is_time_included(utc(2024, 7, 15, 4, 0, 0)));
  }

  #[test]
  fn test_base_calendar_conjunction() {
    let mut holidays = HolidayCalendar::default();
    holidays
      .excluded_dates
      .insert(NaiveDate::from_ymd_opt(2024, 7, 16).unwrap());
    let weekly = CalendarVariant::Weekly(WeeklyCalendar {
      base: Some(Box::new(CalendarVariant::Holiday(holidays))),
      ..WeeklyCalendar::default()
    });

    // 周二本身不被 weekly 排除，但被基础节假日日历排除
    // Tuesday is not excluded by the weekly calendar but is by the base
    assert!(!weekly.is_time_included(utc(2024, 7, 16, 9, 0, 0)));
    assert!(weekly.is_time_included(utc(2024, 7, 17, 9, 0, 0)));
  }

  #[test]
  fn test_annual_calendar() {
    let mut cal = AnnualCalendar::default();
    cal.excluded_days.insert((1, 1));
    let cal = CalendarVariant::Annual(cal);
    assert!(!cal.is_time_included(utc(2025, 1, 1, 0, 30, 0)));
    assert!(cal.is_time_included(utc(2025, 1, 2, 0, 30, 0)));
  }

  #[test]
  fn test_cron_calendar_excludes_matches() {
    let cal = CalendarVariant::Cron(CronCalendar {
      base: None,
      description: None,
      time_zone: Tz::UTC,
      expression: CronExpression::parse("* * 8-17 ? * MON-FRI").unwrap(),
    });
    // 2024-07-15 周一 12:00 落在排除窗口内
    // Monday 2024-07-15 12:00 falls inside the excluded window
    assert!(!cal.is_time_included(utc(2024, 7, 15, 12, 0, 0)));
    assert!(cal.is_time_included(utc(2024, 7, 15, 19, 0, 0)));
  }

  #[test]
  fn test_serde_round_trip_with_base() {
    let mut holidays = HolidayCalendar::default();
    holidays
      .excluded_dates
      .insert(NaiveDate::from_ymd_opt(2024, 12, 25).unwrap());
    let cal = CalendarVariant::Monthly(MonthlyCalendar {
      base: Some(Box::new(CalendarVariant::Holiday(holidays))),
      excluded_days: [1, 15].into_iter().collect(),
      ..MonthlyCalendar::default()
    });
    let json = serde_json::to_string(&cal).unwrap();
    let back: CalendarVariant = serde_json::from_str(&json).unwrap();
    assert_eq!(cal, back);
    assert!(json.contains("\"Type\":\"MONTHLY\""));
  }
}
