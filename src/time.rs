//! 时间提供者模块
//! Time provider module
//!
//! 所有触发时间运算在边界处使用 UTC 时刻；时间通过 `TimeProvider`
//! 能力读取，测试可以注入虚拟时钟。
//! All fire-time arithmetic uses UTC instants at the boundary; time is read
//! through the `TimeProvider` capability so tests can inject virtual clocks.

use chrono::{DateTime, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// 时钟能力
/// Clock capability
///
/// 每个需要读取当前时间的组件都通过构造函数接受一个 `TimeProvider`，
/// 进程级默认实现为 [`SystemClock`]。
/// Every component that needs the current time accepts a `TimeProvider`
/// through its constructor; the process-wide default is [`SystemClock`].
pub trait TimeProvider: Send + Sync {
  /// 当前 UTC 时刻
  /// Current UTC instant
  fn now(&self) -> DateTime<Utc>;
}

/// 共享时钟句柄
/// Shared clock handle
pub type SharedClock = Arc<dyn TimeProvider>;

/// 系统时钟
/// System clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl TimeProvider for SystemClock {
  fn now(&self) -> DateTime<Utc> {
    Utc::now()
  }
}

/// 返回进程默认时钟
/// Returns the process default clock
pub fn system_clock() -> SharedClock {
  Arc::new(SystemClock)
}

/// 手动推进的虚拟时钟，毫秒精度
/// Manually advanced virtual clock with millisecond precision
///
/// 用于确定性的 misfire / 集群接管测试。
/// Used for deterministic misfire / cluster-takeover tests.
#[derive(Debug)]
pub struct ManualClock {
  millis: AtomicI64,
}

impl ManualClock {
  /// 从给定时刻创建虚拟时钟
  /// Create a virtual clock at the given instant
  pub fn starting_at(instant: DateTime<Utc>) -> Arc<Self> {
    Arc::new(Self {
      millis: AtomicI64::new(instant.timestamp_millis()),
    })
  }

  /// 前进指定毫秒数
  /// Advance by the given number of milliseconds
  pub fn advance_millis(&self, millis: i64) {
    self.millis.fetch_add(millis, Ordering::SeqCst);
  }

  /// 前进指定秒数
  /// Advance by the given number of seconds
  pub fn advance_secs(&self, secs: i64) {
    self.advance_millis(secs * 1000);
  }

  /// 直接设置当前时刻
  /// Set the current instant directly
  pub fn set(&self, instant: DateTime<Utc>) {
    self.millis.store(instant.timestamp_millis(), Ordering::SeqCst);
  }
}

impl TimeProvider for ManualClock {
  fn now(&self) -> DateTime<Utc> {
    millis_to_datetime(self.millis.load(Ordering::SeqCst))
  }
}

/// 一天内的某个时刻，秒精度
/// A point within a day, second precision
///
/// 由每日时间窗口日历与每日区间触发器共用；比较按一天内的顺序。
/// Shared by the daily time-window calendar and the daily-interval
/// trigger; ordered by position within the day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimeOfDay {
  /// 小时（0-23）
  /// Hour (0-23)
  pub hour: u32,
  /// 分钟（0-59）
  /// Minute (0-59)
  pub minute: u32,
  /// 秒（0-59）
  /// Second (0-59)
  pub second: u32,
}

impl TimeOfDay {
  /// 按时分秒创建，越界时返回 None
  /// Create from hour/minute/second, None when out of range
  pub fn new(hour: u32, minute: u32, second: u32) -> Option<Self> {
    if hour > 23 || minute > 59 || second > 59 {
      return None;
    }
    Some(Self {
      hour,
      minute,
      second,
    })
  }

  /// 一天的开始
  /// Start of the day
  pub fn midnight() -> Self {
    Self {
      hour: 0,
      minute: 0,
      second: 0,
    }
  }

  /// 一天的最后一秒
  /// Last second of the day
  pub fn end_of_day() -> Self {
    Self {
      hour: 23,
      minute: 59,
      second: 59,
    }
  }

  /// 距当天零点的秒数
  /// Seconds since the start of the day
  pub fn seconds_into_day(&self) -> u32 {
    self.hour * 3600 + self.minute * 60 + self.second
  }

  /// 转换为 `NaiveTime`
  /// Convert to a `NaiveTime`
  pub fn to_naive_time(self) -> NaiveTime {
    NaiveTime::from_hms_opt(self.hour, self.minute, self.second)
      .unwrap_or(NaiveTime::MIN)
  }

  /// 从 `HH:MM:SS` 解析
  /// Parse from `HH:MM:SS`
  pub fn parse(s: &str) -> Option<Self> {
    let mut parts = s.splitn(3, ':');
    let hour = parts.next()?.parse().ok()?;
    let minute = parts.next()?.parse().ok()?;
    let second = parts.next()?.parse().ok()?;
    Self::new(hour, minute, second)
  }
}

impl fmt::Display for TimeOfDay {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{:02}:{:02}:{:02}", self.hour, self.minute, self.second)
  }
}

/// 将毫秒 ticks 转换为 UTC 时刻
/// Convert millisecond ticks to a UTC instant
///
/// 数据库以自 Unix 纪元以来的带符号 64 位毫秒数存储触发时间。
/// The database stores fire times as signed 64-bit milliseconds since the
/// Unix epoch.
pub fn millis_to_datetime(millis: i64) -> DateTime<Utc> {
  match Utc.timestamp_millis_opt(millis) {
    chrono::LocalResult::Single(dt) => dt,
    _ => DateTime::<Utc>::UNIX_EPOCH,
  }
}

/// 将可选 UTC 时刻转换为毫秒 ticks，None 记为 -1
/// Convert an optional UTC instant to millisecond ticks, None stored as -1
pub fn datetime_to_millis(instant: Option<DateTime<Utc>>) -> i64 {
  instant.map(|dt| dt.timestamp_millis()).unwrap_or(-1)
}

/// 从毫秒 ticks 还原可选 UTC 时刻，非正值视为 None
/// Restore an optional UTC instant from millisecond ticks, non-positive is None
pub fn millis_to_optional_datetime(millis: i64) -> Option<DateTime<Utc>> {
  if millis > 0 {
    Some(millis_to_datetime(millis))
  } else {
    None
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::TimeZone;

  #[test]
  fn test_manual_clock_advances() {
    let start = Utc.with_ymd_and_hms(2024, 7, 15, 5, 0, 0).unwrap();
    let clock = ManualClock::starting_at(start);
    assert_eq!(clock.now(), start);

    clock.advance_secs(90);
    assert_eq!(clock.now(), start + chrono::Duration::seconds(90));

    clock.advance_millis(500);
    assert_eq!(
      clock.now(),
      start + chrono::Duration::milliseconds(90_500)
    );
  }

  #[test]
  fn test_millis_round_trip() {
    let instant = Utc.with_ymd_and_hms(2024, 1, 31, 23, 59, 59).unwrap();
    let millis = datetime_to_millis(Some(instant));
    assert_eq!(millis_to_optional_datetime(millis), Some(instant));
    assert_eq!(datetime_to_millis(None), -1);
    assert_eq!(millis_to_optional_datetime(-1), None);
  }
}
