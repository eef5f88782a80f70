//! Cron 表达式模块
//! Cron expression module
//!
//! 七字段（秒 分 时 日 月 周 [年]）cron 表达式求值器，支持
//! `L`、`W`、`#`、`?`、区间、步进与名称别名。求值在表达式时区的
//! 本地时间内进行，边界返回 UTC 时刻。
//! Seven-field (seconds minutes hours day-of-month month day-of-week
//! [year]) cron expression evaluator supporting `L`, `W`, `#`, `?`,
//! ranges, step values, and name aliases. Evaluation happens in the
//! expression's local timezone; UTC instants are returned at the boundary.

use crate::error::{Result, SchedulerError};
use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// 放弃调度的年份上限
/// Year bound at which scheduling gives up
///
/// 候选扫描跨过该年即视为日程耗尽，防止 `L`/`W`/闰日等组合造成
/// 无界搜索。
/// A candidate scan crossing this year is treated as schedule exhaustion,
/// preventing unbounded searches from `L`/`W`/leap-day combinations.
pub const YEAR_TO_GIVE_UP_SCHEDULING_AT: i32 = 2299;

const MONTH_NAMES: [&str; 12] = [
  "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const DAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// 日字段的特殊形式
/// Special forms of the day-of-month field
#[derive(Debug, Clone, PartialEq, Eq)]
enum DayOfMonthSpec {
  /// 未指定（`?`，由周字段约束）
  /// Unspecified (`?`, constrained by day-of-week)
  NoSpec,
  /// 日集合
  /// Set of days
  Days(BTreeSet<u32>),
  /// 月末，偏移 n 天（`L`、`L-3`）
  /// Last day of month, offset by n days (`L`, `L-3`)
  LastDay { offset: u32 },
  /// 月内最后一个工作日（`LW`）
  /// Last weekday of the month (`LW`)
  LastWeekday,
  /// 距指定日最近的工作日（`15W`）
  /// Nearest weekday to the given day (`15W`)
  NearestWeekday { day: u32 },
}

/// 周字段的特殊形式
/// Special forms of the day-of-week field
#[derive(Debug, Clone, PartialEq, Eq)]
enum DayOfWeekSpec {
  /// 未指定（`?`，由日字段约束）
  /// Unspecified (`?`, constrained by day-of-month)
  NoSpec,
  /// 周几集合（1 = 周日 … 7 = 周六）
  /// Set of weekdays (1 = Sunday … 7 = Saturday)
  Days(BTreeSet<u32>),
  /// 月内最后一个指定周几（`6L`）
  /// Last given weekday of the month (`6L`)
  Last { day: u32 },
  /// 月内第 n 个指定周几（`6#3`）
  /// The n-th given weekday of the month (`6#3`)
  Nth { day: u32, nth: u32 },
}

/// 已解析的 cron 表达式
/// Parsed cron expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpression {
  source: String,
  seconds: BTreeSet<u32>,
  minutes: BTreeSet<u32>,
  hours: BTreeSet<u32>,
  day_of_month: DayOfMonthSpec,
  months: BTreeSet<u32>,
  day_of_week: DayOfWeekSpec,
  years: Option<BTreeSet<i32>>,
}

fn parse_error<S: Into<String>>(expression: &str, message: S) -> SchedulerError {
  SchedulerError::InvalidCronExpression {
    expression: expression.to_string(),
    message: message.into(),
  }
}

/// 解析数字或名称别名
/// Parse a number or a name alias
fn parse_value(token: &str, names: Option<&[&str]>, name_base: u32) -> Option<u32> {
  if let Ok(n) = token.parse::<u32>() {
    return Some(n);
  }
  let upper = token.to_ascii_uppercase();
  names?
    .iter()
    .position(|name| *name == upper)
    .map(|idx| idx as u32 + name_base)
}

/// 解析一个普通字段为集合，支持 `*`、区间、步进、逗号表与回绕区间
/// Parse a plain field into a set, supporting `*`, ranges, steps, comma
/// lists, and wrap-around ranges
fn parse_set(
  expression: &str,
  field: &str,
  min: u32,
  max: u32,
  names: Option<&[&str]>,
  name_base: u32,
) -> Result<BTreeSet<u32>> {
  let mut set = BTreeSet::new();
  for part in field.split(',') {
    let (range_part, step) = match part.split_once('/') {
      Some((r, s)) => {
        let step: u32 = s
          .parse()
          .map_err(|_| parse_error(expression, format!("invalid step value {s:?}")))?;
        if step == 0 {
          return Err(parse_error(expression, "step value must be positive"));
        }
        (r, step)
      }
      None => (part, 1),
    };

    let (start, end) = if range_part == "*" {
      (min, max)
    } else if let Some((lo, hi)) = range_part.split_once('-') {
      let lo = parse_value(lo, names, name_base)
        .ok_or_else(|| parse_error(expression, format!("unrecognized value {lo:?}")))?;
      let hi = parse_value(hi, names, name_base)
        .ok_or_else(|| parse_error(expression, format!("unrecognized value {hi:?}")))?;
      (lo, hi)
    } else {
      let v = parse_value(range_part, names, name_base)
        .ok_or_else(|| parse_error(expression, format!("unrecognized value {range_part:?}")))?;
      // 单值加步进时延伸到字段上限
      // A single value with a step extends to the field maximum
      if step > 1 {
        (v, max)
      } else {
        (v, v)
      }
    };

    if start < min || start > max || end < min || end > max {
      return Err(parse_error(
        expression,
        format!("value out of range [{min}, {max}] in {part:?}"),
      ));
    }

    if start <= end {
      let mut v = start;
      while v <= end {
        set.insert(v);
        v += step;
      }
    } else {
      // 回绕区间，例如小时字段的 22-2
      // Wrap-around range, e.g. 22-2 in the hours field
      let mut v = start;
      while v <= max {
        set.insert(v);
        v += step;
      }
      // 保持步进相位跨过回绕点
      // Keep the step phase across the wrap point
      let mut v = min + (v - max - 1);
      while v <= end {
        set.insert(v);
        v += step;
      }
    }
  }
  Ok(set)
}

fn parse_day_of_month(expression: &str, field: &str) -> Result<DayOfMonthSpec> {
  if field == "?" {
    return Ok(DayOfMonthSpec::NoSpec);
  }
  if field.eq_ignore_ascii_case("LW") {
    return Ok(DayOfMonthSpec::LastWeekday);
  }
  if field.eq_ignore_ascii_case("L") {
    return Ok(DayOfMonthSpec::LastDay { offset: 0 });
  }
  if let Some(rest) = field
    .strip_prefix('L')
    .or_else(|| field.strip_prefix('l'))
    .and_then(|r| r.strip_prefix('-'))
  {
    let offset: u32 = rest
      .parse()
      .map_err(|_| parse_error(expression, format!("invalid L offset {rest:?}")))?;
    if offset > 30 {
      return Err(parse_error(expression, "L offset must be at most 30"));
    }
    return Ok(DayOfMonthSpec::LastDay { offset });
  }
  if let Some(day_part) = field.strip_suffix('W').or_else(|| field.strip_suffix('w')) {
    let day: u32 = day_part
      .parse()
      .map_err(|_| parse_error(expression, format!("invalid W day {day_part:?}")))?;
    if !(1..=31).contains(&day) {
      return Err(parse_error(expression, "W day must be in [1, 31]"));
    }
    return Ok(DayOfMonthSpec::NearestWeekday { day });
  }
  Ok(DayOfMonthSpec::Days(parse_set(
    expression, field, 1, 31, None, 0,
  )?))
}

fn parse_day_of_week(expression: &str, field: &str) -> Result<DayOfWeekSpec> {
  if field == "?" {
    return Ok(DayOfWeekSpec::NoSpec);
  }
  if let Some((day_part, nth_part)) = field.split_once('#') {
    let day = parse_value(day_part, Some(&DAY_NAMES), 1)
      .ok_or_else(|| parse_error(expression, format!("unrecognized weekday {day_part:?}")))?;
    let nth: u32 = nth_part
      .parse()
      .map_err(|_| parse_error(expression, format!("invalid # ordinal {nth_part:?}")))?;
    if !(1..=7).contains(&day) || !(1..=5).contains(&nth) {
      return Err(parse_error(expression, "# requires weekday 1-7 and ordinal 1-5"));
    }
    return Ok(DayOfWeekSpec::Nth { day, nth });
  }
  if let Some(day_part) = field.strip_suffix('L').or_else(|| field.strip_suffix('l')) {
    if !day_part.is_empty() {
      let day = parse_value(day_part, Some(&DAY_NAMES), 1)
        .ok_or_else(|| parse_error(expression, format!("unrecognized weekday {day_part:?}")))?;
      if !(1..=7).contains(&day) {
        return Err(parse_error(expression, "weekday must be in [1, 7]"));
      }
      return Ok(DayOfWeekSpec::Last { day });
    }
  }
  Ok(DayOfWeekSpec::Days(parse_set(
    expression,
    field,
    1,
    7,
    Some(&DAY_NAMES),
    1,
  )?))
}

/// chrono 周几 → Quartz 周几（1 = 周日 … 7 = 周六）
/// chrono weekday → Quartz weekday (1 = Sunday … 7 = Saturday)
fn quartz_dow(date: NaiveDate) -> u32 {
  date.weekday().num_days_from_sunday() + 1
}

pub(crate) fn last_day_of_month(year: i32, month: u32) -> u32 {
  let next = if month == 12 {
    NaiveDate::from_ymd_opt(year + 1, 1, 1)
  } else {
    NaiveDate::from_ymd_opt(year, month + 1, 1)
  };
  match next {
    Some(d) => d.pred_opt().map(|p| p.day()).unwrap_or(28),
    None => 28,
  }
}

/// 距目标日最近的工作日，不跨月
/// Nearest weekday to the target day, without leaving the month
fn nearest_weekday(year: i32, month: u32, target: u32) -> Option<u32> {
  let last = last_day_of_month(year, month);
  let day = target.min(last);
  let date = NaiveDate::from_ymd_opt(year, month, day)?;
  match date.weekday() {
    chrono::Weekday::Sat => {
      if day > 1 {
        Some(day - 1)
      } else {
        // 月初的周六向前跳到下周一
        // A Saturday on the 1st jumps forward to Monday
        Some(day + 2)
      }
    }
    chrono::Weekday::Sun => {
      if day < last {
        Some(day + 1)
      } else {
        // 月末的周日退回上周五
        // A Sunday on the last day falls back to Friday
        Some(day - 2)
      }
    }
    _ => Some(day),
  }
}

impl CronExpression {
  /// 解析 cron 表达式
  /// Parse a cron expression
  ///
  /// 接受 6 或 7 个空白分隔的字段；第 7 个字段为可选的年份。
  /// Accepts 6 or 7 whitespace-separated fields; the 7th field is the
  /// optional year.
  pub fn parse(expression: &str) -> Result<Self> {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    if fields.len() != 6 && fields.len() != 7 {
      return Err(parse_error(
        expression,
        format!("expected 6 or 7 fields, found {}", fields.len()),
      ));
    }

    let seconds = parse_set(expression, fields[0], 0, 59, None, 0)?;
    let minutes = parse_set(expression, fields[1], 0, 59, None, 0)?;
    let hours = parse_set(expression, fields[2], 0, 23, None, 0)?;
    let mut day_of_month = parse_day_of_month(expression, fields[3])?;
    let months = parse_set(expression, fields[4], 1, 12, Some(&MONTH_NAMES), 1)?;
    let mut day_of_week = parse_day_of_week(expression, fields[5])?;
    let years = if fields.len() == 7 && fields[6] != "*" {
      let set = parse_set(
        expression,
        fields[6],
        1970,
        YEAR_TO_GIVE_UP_SCHEDULING_AT as u32,
        None,
        0,
      )?;
      Some(set.into_iter().map(|y| y as i32).collect())
    } else {
      None
    };

    // 日与周不可同时约束；`*` 在另一侧已具体时降级为未指定
    // Day-of-month and day-of-week may not both constrain; a `*` demotes
    // to unspecified when the other side is concrete
    let dom_is_star = fields[3] == "*";
    let dow_is_star = fields[5] == "*";
    match (&day_of_month, &day_of_week) {
      (DayOfMonthSpec::NoSpec, DayOfWeekSpec::NoSpec) => {
        return Err(parse_error(
          expression,
          "'?' cannot be used in both day-of-month and day-of-week",
        ));
      }
      (DayOfMonthSpec::NoSpec, _) | (_, DayOfWeekSpec::NoSpec) => {}
      _ => {
        if dow_is_star {
          day_of_week = DayOfWeekSpec::NoSpec;
        } else if dom_is_star {
          day_of_month = DayOfMonthSpec::NoSpec;
        } else {
          return Err(parse_error(
            expression,
            "specifying both day-of-month and day-of-week is not supported; use '?'",
          ));
        }
      }
    }

    Ok(Self {
      source: expression.to_string(),
      seconds,
      minutes,
      hours,
      day_of_month,
      months,
      day_of_week,
      years,
    })
  }

  /// 原始表达式字符串
  /// The original expression string
  pub fn source(&self) -> &str {
    &self.source
  }

  /// 日期是否满足日/月/周/年约束
  /// Whether the date satisfies the day/month/weekday/year constraints
  fn date_matches(&self, date: NaiveDate) -> bool {
    if let Some(years) = &self.years {
      if !years.contains(&date.year()) {
        return false;
      }
    }
    if !self.months.contains(&date.month()) {
      return false;
    }

    let dom_ok = match &self.day_of_month {
      DayOfMonthSpec::NoSpec => true,
      DayOfMonthSpec::Days(days) => days.contains(&date.day()),
      DayOfMonthSpec::LastDay { offset } => {
        let last = last_day_of_month(date.year(), date.month());
        last >= *offset && date.day() == last - offset
      }
      DayOfMonthSpec::LastWeekday => {
        let last = last_day_of_month(date.year(), date.month());
        nearest_weekday(date.year(), date.month(), last) == Some(date.day())
      }
      DayOfMonthSpec::NearestWeekday { day } => {
        nearest_weekday(date.year(), date.month(), *day) == Some(date.day())
      }
    };
    if !dom_ok {
      return false;
    }

    match &self.day_of_week {
      DayOfWeekSpec::NoSpec => true,
      DayOfWeekSpec::Days(days) => days.contains(&quartz_dow(date)),
      DayOfWeekSpec::Last { day } => {
        quartz_dow(date) == *day && date.day() + 7 > last_day_of_month(date.year(), date.month())
      }
      DayOfWeekSpec::Nth { day, nth } => {
        quartz_dow(date) == *day && (date.day() - 1) / 7 + 1 == *nth
      }
    }
  }

  /// 在给定日期上查找不早于 `(h, m, s)` 的时刻
  /// Find the earliest time-of-day on the given date not before `(h, m, s)`
  fn time_on_or_after(&self, from: Option<(u32, u32, u32)>) -> Option<(u32, u32, u32)> {
    let (h0, m0, s0) = from.unwrap_or((0, 0, 0));
    for &h in self.hours.range(h0..) {
      let m_start = if h == h0 { m0 } else { 0 };
      for &m in self.minutes.range(m_start..) {
        let s_start = if h == h0 && m == m0 { s0 } else { 0 };
        if let Some(&s) = self.seconds.range(s_start..).next() {
          return Some((h, m, s));
        }
      }
    }
    None
  }

  /// 返回严格大于 `after` 的下一个满足时刻
  /// Returns the next satisfying instant strictly greater than `after`
  ///
  /// 在时区本地时间内逐日扫描；夏令时跳变中不存在的本地时间被跳过，
  /// 歧义时间取较早的偏移。
  /// Scans day by day in zone-local time; local times that do not exist
  /// across a DST gap are skipped, ambiguous times take the earlier offset.
  pub fn next_fire_after(&self, after: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
    let local = after.with_timezone(&tz).naive_local();
    // 截断到秒并前进一秒
    // Truncate to the second and advance one second
    let start = local.with_nanosecond(0)? + Duration::seconds(1);
    let mut date = start.date();
    let mut time_floor = Some((start.hour(), start.minute(), start.second()));

    loop {
      if date.year() > YEAR_TO_GIVE_UP_SCHEDULING_AT {
        return None;
      }
      if let Some(years) = &self.years {
        // 年份越过集合上限即耗尽
        // Exhausted once the year passes the top of the set
        if years.iter().all(|y| *y < date.year()) {
          return None;
        }
      }

      if !self.months.contains(&date.month())
        || self
          .years
          .as_ref()
          .is_some_and(|years| !years.contains(&date.year()))
      {
        // 跳到下个月首日，避免逐日扫过整个排除区间
        // Jump to the first of the next month instead of day-stepping
        // through the excluded span
        let (y, m) = if date.month() == 12 {
          (date.year() + 1, 1)
        } else {
          (date.year(), date.month() + 1)
        };
        date = NaiveDate::from_ymd_opt(y, m, 1)?;
        time_floor = None;
        continue;
      }

      if self.date_matches(date) {
        let mut floor = time_floor;
        while let Some((h, m, s)) = self.time_on_or_after(floor) {
          let naive = date.and_hms_opt(h, m, s)?;
          match tz.from_local_datetime(&naive) {
            chrono::LocalResult::Single(dt) => return Some(dt.with_timezone(&Utc)),
            chrono::LocalResult::Ambiguous(earliest, _) => {
              return Some(earliest.with_timezone(&Utc))
            }
            chrono::LocalResult::None => {
              // 夏令时空隙：尝试当日下一个候选时刻
              // DST gap: try the next candidate time on the same date
              floor = Some(next_second_tuple(h, m, s));
              continue;
            }
          }
        }
      }

      date = date.succ_opt()?;
      time_floor = None;
    }
  }

  /// 给定时刻是否恰好满足表达式（毫秒被忽略）
  /// Whether the given instant satisfies the expression exactly
  /// (milliseconds are ignored)
  pub fn is_satisfied_by(&self, instant: DateTime<Utc>, tz: Tz) -> bool {
    let truncated = match instant.with_nanosecond(0) {
      Some(t) => t,
      None => return false,
    };
    self.next_fire_after(truncated - Duration::seconds(1), tz) == Some(truncated)
  }
}

/// `(h, m, s)` 之后一秒的时刻元组
/// The time tuple one second after `(h, m, s)`
fn next_second_tuple(h: u32, m: u32, s: u32) -> (u32, u32, u32) {
  if s < 59 {
    (h, m, s + 1)
  } else if m < 59 {
    (h, m + 1, 0)
  } else {
    (h + 1, 0, 0)
  }
}

impl fmt::Display for CronExpression {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.source)
  }
}

impl FromStr for CronExpression {
  type Err = SchedulerError;

  fn from_str(s: &str) -> Result<Self> {
    Self::parse(s)
  }
}

impl Serialize for CronExpression {
  fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&self.source)
  }
}

impl<'de> Deserialize<'de> for CronExpression {
  fn deserialize<D: serde::Deserializer<'de>>(
    deserializer: D,
  ) -> std::result::Result<Self, D::Error> {
    let source = String::deserialize(deserializer)?;
    CronExpression::parse(&source).map_err(serde::de::Error::custom)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono_tz::Tz;

  fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
  }

  #[test]
  fn test_every_second() {
    let expr = CronExpression::parse("* * * * * ?").unwrap();
    let next = expr
      .next_fire_after(utc(2024, 7, 15, 5, 0, 0), Tz::UTC)
      .unwrap();
    assert_eq!(next, utc(2024, 7, 15, 5, 0, 1));
  }

  #[test]
  fn test_fixed_time_daily() {
    let expr = CronExpression::parse("0 30 9 * * ?").unwrap();
    let next = expr
      .next_fire_after(utc(2024, 7, 15, 10, 0, 0), Tz::UTC)
      .unwrap();
    assert_eq!(next, utc(2024, 7, 16, 9, 30, 0));
  }

  #[test]
  fn test_step_values_and_ranges() {
    let expr = CronExpression::parse("0 0/15 8-10 * * ?").unwrap();
    let mut t = utc(2024, 7, 15, 8, 16, 0);
    let mut fires = Vec::new();
    for _ in 0..4 {
      t = expr.next_fire_after(t, Tz::UTC).unwrap();
      fires.push(t);
    }
    assert_eq!(
      fires,
      vec![
        utc(2024, 7, 15, 8, 30, 0),
        utc(2024, 7, 15, 8, 45, 0),
        utc(2024, 7, 15, 9, 0, 0),
        utc(2024, 7, 15, 9, 15, 0),
      ]
    );
  }

  #[test]
  fn test_last_day_of_month() {
    let expr = CronExpression::parse("0 0 12 L * ?").unwrap();
    let next = expr
      .next_fire_after(utc(2024, 2, 1, 0, 0, 0), Tz::UTC)
      .unwrap();
    // 2024 年是闰年
    // 2024 is a leap year
    assert_eq!(next, utc(2024, 2, 29, 12, 0, 0));

    let expr = CronExpression::parse("0 0 12 L-2 * ?").unwrap();
    let next = expr
      .next_fire_after(utc(2024, 4, 1, 0, 0, 0), Tz::UTC)
      .unwrap();
    assert_eq!(next, utc(2024, 4, 28, 12, 0, 0));
  }

  #[test]
  fn test_nearest_weekday() {
    // 2024-06-15 是周六，最近工作日是 6 月 14 日周五
    // 2024-06-15 is a Saturday; the nearest weekday is Friday the 14th
    let expr = CronExpression::parse("0 0 9 15W * ?").unwrap();
    let next = expr
      .next_fire_after(utc(2024, 6, 1, 0, 0, 0), Tz::UTC)
      .unwrap();
    assert_eq!(next, utc(2024, 6, 14, 9, 0, 0));
  }

  #[test]
  fn test_nth_and_last_weekday_of_month() {
    // 6#3：2024 年 5 月第三个周五是 17 日
    // 6#3: the third Friday of May 2024 is the 17th
    let expr = CronExpression::parse("0 0 8 ? 5 6#3 2024").unwrap();
    let next = expr
      .next_fire_after(utc(2024, 1, 1, 0, 0, 0), Tz::UTC)
      .unwrap();
    assert_eq!(next, utc(2024, 5, 17, 8, 0, 0));

    // 2L：2024 年 5 月最后一个周一是 27 日
    // 2L: the last Monday of May 2024 is the 27th
    let expr = CronExpression::parse("0 0 8 ? 5 2L 2024").unwrap();
    let next = expr
      .next_fire_after(utc(2024, 5, 1, 0, 0, 0), Tz::UTC)
      .unwrap();
    assert_eq!(next, utc(2024, 5, 27, 8, 0, 0));
  }

  #[test]
  fn test_name_aliases() {
    let expr = CronExpression::parse("0 0 6 ? JAN,JUL MON-FRI").unwrap();
    let next = expr
      .next_fire_after(utc(2024, 6, 28, 12, 0, 0), Tz::UTC)
      .unwrap();
    // 2024-07-01 是周一
    // 2024-07-01 is a Monday
    assert_eq!(next, utc(2024, 7, 1, 6, 0, 0));
  }

  #[test]
  fn test_year_field_exhaustion() {
    let expr = CronExpression::parse("0 0 0 1 1 ? 2024").unwrap();
    assert_eq!(expr.next_fire_after(utc(2024, 6, 1, 0, 0, 0), Tz::UTC), None);
    let next = expr
      .next_fire_after(utc(2023, 6, 1, 0, 0, 0), Tz::UTC)
      .unwrap();
    assert_eq!(next, utc(2024, 1, 1, 0, 0, 0));
  }

  #[test]
  fn test_is_satisfied_by() {
    let expr = CronExpression::parse("0 15 10 * * ?").unwrap();
    assert!(expr.is_satisfied_by(utc(2024, 7, 15, 10, 15, 0), Tz::UTC));
    assert!(!expr.is_satisfied_by(utc(2024, 7, 15, 10, 15, 1), Tz::UTC));
  }

  #[test]
  fn test_dst_gap_is_skipped() {
    // 美国东部 2024-03-10 02:30 不存在（春季跳变）
    // 02:30 on 2024-03-10 does not exist in US Eastern (spring forward)
    let tz: Tz = "America/New_York".parse().unwrap();
    let expr = CronExpression::parse("0 30 2 * * ?").unwrap();
    let after = utc(2024, 3, 9, 12, 0, 0);
    let next = expr.next_fire_after(after, tz).unwrap();
    // 下一次有效的 02:30 是 3 月 11 日（东部时间 EDT，UTC-4）
    // The next valid 02:30 is March 11 (EDT, UTC-4)
    assert_eq!(next, utc(2024, 3, 11, 6, 30, 0));
  }

  #[test]
  fn test_invalid_expressions_rejected() {
    assert!(CronExpression::parse("").is_err());
    assert!(CronExpression::parse("* * * *").is_err());
    assert!(CronExpression::parse("60 * * * * ?").is_err());
    assert!(CronExpression::parse("* * * ? * ?").is_err());
    assert!(CronExpression::parse("* * * 10 * MON").is_err());
    assert!(CronExpression::parse("0 0 0 32 * ?").is_err());
  }

  #[test]
  fn test_monotonic_sequence() {
    let expr = CronExpression::parse("0 0 0 L * ?").unwrap();
    let mut t = utc(2024, 1, 1, 0, 0, 0);
    let mut prev = None;
    for _ in 0..24 {
      let next = expr.next_fire_after(t, Tz::UTC).unwrap();
      if let Some(p) = prev {
        assert!(next > p);
      }
      prev = Some(next);
      t = next;
    }
  }

  #[test]
  fn test_serde_round_trip() {
    let expr = CronExpression::parse("0 0/5 14,18 ? * 6L").unwrap();
    let json = serde_json::to_string(&expr).unwrap();
    let back: CronExpression = serde_json::from_str(&json).unwrap();
    assert_eq!(expr, back);
  }
}
