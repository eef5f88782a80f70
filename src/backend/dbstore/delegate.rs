//! 触发器持久化委托
//! Trigger persistence delegates
//!
//! 每个触发器变体拥有自己的行映射：简单与 cron 变体有类型化子表，
//! 日历区间、每日区间与自定义日历变体复用 `qrtz_simprop_triggers`
//! 的通用列。无法映射的触发器整体序列化进 `qrtz_blob_triggers`。
//! Each trigger variant owns its row mapping: the simple and cron
//! variants have typed subtype tables; the calendar-interval,
//! daily-interval, and custom-calendar variants reuse the generic
//! columns of `qrtz_simprop_triggers`. Unmappable triggers serialize
//! whole into `qrtz_blob_triggers`.

use crate::backend::dbstore::entity::{cron_triggers, simple_triggers, simprop_triggers, triggers};
use crate::cron::CronExpression;
use crate::error::{Result, SchedulerError};
use crate::key::{JobKey, TriggerKey};
use crate::time::{datetime_to_millis, millis_to_optional_datetime, TimeOfDay};
use crate::triggers::{
  CalendarIntervalTrigger, CronTrigger, CustomCalendarTrigger, DailyTimeIntervalTrigger,
  IntervalUnit, MisfirePolicy, SimpleMisfirePolicy, SimpleTrigger, Trigger, TriggerCore,
};
use chrono_tz::Tz;
use sea_orm::Set;
use std::collections::BTreeSet;

/// 子类型行
/// Subtype row
pub(crate) enum SubtypeRow {
  Simple(simple_triggers::ActiveModel),
  Cron(cron_triggers::ActiveModel),
  Simprop(simprop_triggers::ActiveModel),
}

fn parse_tz(id: &str) -> Result<Tz> {
  id.parse::<Tz>()
    .map_err(|_| SchedulerError::persistence(format!("unknown time zone id {id:?}")))
}

fn serialize_misfire<P: serde::Serialize>(policy: &P) -> Result<String> {
  Ok(serde_json::to_string(policy)?)
}

fn parse_misfire_policy(raw: Option<&str>) -> MisfirePolicy {
  raw
    .and_then(|s| serde_json::from_str(s).ok())
    .unwrap_or(MisfirePolicy::Smart)
}

fn parse_simple_misfire_policy(raw: Option<&str>) -> SimpleMisfirePolicy {
  raw
    .and_then(|s| serde_json::from_str(s).ok())
    .unwrap_or(SimpleMisfirePolicy::Smart)
}

/// 主表行
/// Main-table row
pub(crate) fn main_row(sched_name: &str, trigger: &Trigger, state: &str) -> triggers::ActiveModel {
  let core = crate::triggers::OperableTrigger::core(trigger);
  let misfire = match trigger {
    Trigger::Simple(t) => serialize_misfire(&t.misfire_policy).ok(),
    Trigger::Cron(t) => serialize_misfire(&t.misfire_policy).ok(),
    Trigger::CalendarInterval(t) => serialize_misfire(&t.misfire_policy).ok(),
    Trigger::DailyTimeInterval(t) => serialize_misfire(&t.misfire_policy).ok(),
    Trigger::CustomCalendar(t) => serialize_misfire(&t.misfire_policy).ok(),
  };
  triggers::ActiveModel {
    sched_name: Set(sched_name.to_string()),
    trigger_group: Set(core.key.group.clone()),
    trigger_name: Set(core.key.name.clone()),
    job_group: Set(core.job_key.group.clone()),
    job_name: Set(core.job_key.name.clone()),
    description: Set(core.description.clone()),
    next_fire_time: Set(core.next_fire_time.map(|t| t.timestamp_millis())),
    prev_fire_time: Set(core.previous_fire_time.map(|t| t.timestamp_millis())),
    priority: Set(core.priority),
    trigger_state: Set(state.to_string()),
    trigger_type: Set(trigger.trigger_type().to_string()),
    start_time: Set(datetime_to_millis(Some(core.start_time))),
    end_time: Set(core.end_time.map(|t| t.timestamp_millis())),
    calendar_name: Set(core.calendar_name.clone()),
    misfire_instr: Set(misfire),
  }
}

/// 子类型行
/// Subtype row
pub(crate) fn subtype_row(sched_name: &str, trigger: &Trigger) -> SubtypeRow {
  let key = trigger.key().clone();
  let keyed_simprop = |key: &TriggerKey| simprop_triggers::ActiveModel {
    sched_name: Set(sched_name.to_string()),
    trigger_group: Set(key.group.clone()),
    trigger_name: Set(key.name.clone()),
    str_prop_1: Set(None),
    str_prop_2: Set(None),
    str_prop_3: Set(None),
    int_prop_1: Set(None),
    int_prop_2: Set(None),
    long_prop_1: Set(None),
    long_prop_2: Set(None),
    dec_prop_1: Set(None),
    dec_prop_2: Set(None),
    bool_prop_1: Set(None),
    bool_prop_2: Set(None),
    time_zone_id: Set(None),
  };

  match trigger {
    Trigger::Simple(t) => SubtypeRow::Simple(simple_triggers::ActiveModel {
      sched_name: Set(sched_name.to_string()),
      trigger_group: Set(key.group),
      trigger_name: Set(key.name),
      repeat_count: Set(t.repeat_count as i64),
      repeat_interval: Set(t.repeat_interval_millis),
      times_triggered: Set(t.times_triggered as i64),
    }),
    Trigger::Cron(t) => SubtypeRow::Cron(cron_triggers::ActiveModel {
      sched_name: Set(sched_name.to_string()),
      trigger_group: Set(key.group),
      trigger_name: Set(key.name),
      cron_expression: Set(t.expression.source().to_string()),
      time_zone_id: Set(t.time_zone.name().to_string()),
    }),
    Trigger::CalendarInterval(t) => {
      let mut row = keyed_simprop(&key);
      row.str_prop_1 = Set(Some(t.interval_unit.as_str().to_string()));
      row.int_prop_1 = Set(Some(t.repeat_interval));
      row.int_prop_2 = Set(Some(t.times_triggered));
      row.bool_prop_1 = Set(Some(t.preserve_hour_of_day_across_daylight_savings));
      row.bool_prop_2 = Set(Some(t.skip_day_if_hour_does_not_exist));
      row.time_zone_id = Set(Some(t.time_zone.name().to_string()));
      SubtypeRow::Simprop(row)
    }
    Trigger::DailyTimeInterval(t) => {
      let mut row = keyed_simprop(&key);
      row.str_prop_1 = Set(Some(t.interval_unit.as_str().to_string()));
      row.str_prop_2 = Set(Some(
        t.days_of_week
          .iter()
          .map(u32::to_string)
          .collect::<Vec<_>>()
          .join(","),
      ));
      row.str_prop_3 = Set(Some(format!(
        "{}-{}",
        t.start_time_of_day, t.end_time_of_day
      )));
      row.int_prop_1 = Set(Some(t.repeat_interval));
      row.int_prop_2 = Set(Some(t.times_triggered));
      row.long_prop_1 = Set(Some(t.repeat_count as i64));
      row.time_zone_id = Set(Some(t.time_zone.name().to_string()));
      SubtypeRow::Simprop(row)
    }
    Trigger::CustomCalendar(t) => {
      let mut row = keyed_simprop(&key);
      // int1 = repeatInterval, int2 = timesTriggered, long1 = repeatCount,
      // long2 = byMonth, str1 = intervalUnit, str2 = byMonthDay,
      // str3 = byDay, time_zone_id = tz
      row.int_prop_1 = Set(Some(t.repeat_interval));
      row.int_prop_2 = Set(Some(t.times_triggered));
      row.long_prop_1 = Set(Some(t.repeat_count as i64));
      row.long_prop_2 = Set(t.by_month.map(|m| m as i64));
      row.str_prop_1 = Set(Some(t.interval_unit.as_str().to_string()));
      row.str_prop_2 = Set(t.by_month_day.clone());
      row.str_prop_3 = Set(t.by_day.clone());
      row.time_zone_id = Set(Some(t.time_zone.name().to_string()));
      SubtypeRow::Simprop(row)
    }
  }
}

/// 从主表行还原共享状态
/// Restore the shared state from a main-table row
fn core_from_row(row: &triggers::Model) -> TriggerCore {
  TriggerCore {
    key: TriggerKey::new(row.trigger_name.clone(), row.trigger_group.clone()),
    job_key: JobKey::new(row.job_name.clone(), row.job_group.clone()),
    description: row.description.clone(),
    calendar_name: row.calendar_name.clone(),
    priority: row.priority,
    start_time: crate::time::millis_to_datetime(row.start_time),
    end_time: row.end_time.and_then(millis_to_optional_datetime),
    next_fire_time: row.next_fire_time.and_then(millis_to_optional_datetime),
    previous_fire_time: row.prev_fire_time.and_then(millis_to_optional_datetime),
  }
}

/// 从行组装触发器
/// Assemble a trigger from its rows
pub(crate) fn assemble_trigger(
  main: &triggers::Model,
  simple: Option<&simple_triggers::Model>,
  cron: Option<&cron_triggers::Model>,
  simprop: Option<&simprop_triggers::Model>,
  blob: Option<&str>,
) -> Result<Trigger> {
  let core = core_from_row(main);
  let missing = |table: &str| {
    SchedulerError::persistence(format!(
      "trigger {} of type {} is missing its {table} row",
      core.key, main.trigger_type
    ))
  };

  match main.trigger_type.as_str() {
    "SIMPLE" => {
      let row = simple.ok_or_else(|| missing("qrtz_simple_triggers"))?;
      Ok(Trigger::Simple(SimpleTrigger {
        core,
        repeat_count: row.repeat_count as i32,
        repeat_interval_millis: row.repeat_interval,
        times_triggered: row.times_triggered as i32,
        misfire_policy: parse_simple_misfire_policy(main.misfire_instr.as_deref()),
      }))
    }
    "CRON" => {
      let row = cron.ok_or_else(|| missing("qrtz_cron_triggers"))?;
      Ok(Trigger::Cron(CronTrigger {
        core,
        expression: CronExpression::parse(&row.cron_expression)?,
        time_zone: parse_tz(&row.time_zone_id)?,
        misfire_policy: parse_misfire_policy(main.misfire_instr.as_deref()),
      }))
    }
    "CAL_INT" => {
      let row = simprop.ok_or_else(|| missing("qrtz_simprop_triggers"))?;
      let unit = row
        .str_prop_1
        .as_deref()
        .and_then(IntervalUnit::parse)
        .ok_or_else(|| SchedulerError::persistence("bad interval unit in simprop row"))?;
      Ok(Trigger::CalendarInterval(CalendarIntervalTrigger {
        core,
        interval_unit: unit,
        repeat_interval: row.int_prop_1.unwrap_or(1),
        time_zone: parse_tz(row.time_zone_id.as_deref().unwrap_or("UTC"))?,
        preserve_hour_of_day_across_daylight_savings: row.bool_prop_1.unwrap_or(false),
        skip_day_if_hour_does_not_exist: row.bool_prop_2.unwrap_or(false),
        times_triggered: row.int_prop_2.unwrap_or(0),
        misfire_policy: parse_misfire_policy(main.misfire_instr.as_deref()),
      }))
    }
    "DAILY_I" => {
      let row = simprop.ok_or_else(|| missing("qrtz_simprop_triggers"))?;
      let unit = row
        .str_prop_1
        .as_deref()
        .and_then(IntervalUnit::parse)
        .ok_or_else(|| SchedulerError::persistence("bad interval unit in simprop row"))?;
      let days: BTreeSet<u32> = row
        .str_prop_2
        .as_deref()
        .unwrap_or("")
        .split(',')
        .filter_map(|part| part.trim().parse().ok())
        .collect();
      let (window_start, window_end) = row
        .str_prop_3
        .as_deref()
        .and_then(|window| {
          let (start, end) = window.split_once('-')?;
          Some((TimeOfDay::parse(start)?, TimeOfDay::parse(end)?))
        })
        .ok_or_else(|| SchedulerError::persistence("bad daily window in simprop row"))?;
      Ok(Trigger::DailyTimeInterval(DailyTimeIntervalTrigger {
        core,
        start_time_of_day: window_start,
        end_time_of_day: window_end,
        days_of_week: days,
        repeat_interval: row.int_prop_1.unwrap_or(1),
        interval_unit: unit,
        repeat_count: row.long_prop_1.unwrap_or(-1) as i32,
        times_triggered: row.int_prop_2.unwrap_or(0),
        time_zone: parse_tz(row.time_zone_id.as_deref().unwrap_or("UTC"))?,
        misfire_policy: parse_misfire_policy(main.misfire_instr.as_deref()),
      }))
    }
    "CUSTOM_CAL" => {
      let row = simprop.ok_or_else(|| missing("qrtz_simprop_triggers"))?;
      let unit = row
        .str_prop_1
        .as_deref()
        .and_then(IntervalUnit::parse)
        .ok_or_else(|| SchedulerError::persistence("bad interval unit in simprop row"))?;
      Ok(Trigger::CustomCalendar(CustomCalendarTrigger {
        core,
        repeat_count: row.long_prop_1.unwrap_or(-1) as i32,
        repeat_interval: row.int_prop_1.unwrap_or(1),
        interval_unit: unit,
        by_month: row.long_prop_2.map(|m| m as u32),
        // ByMonthDay 是字符串，原样存取
        // ByMonthDay is a string, stored and read back unchanged
        by_month_day: row.str_prop_2.clone(),
        by_day: row.str_prop_3.clone(),
        times_triggered: row.int_prop_2.unwrap_or(0),
        time_zone: parse_tz(row.time_zone_id.as_deref().unwrap_or("UTC"))?,
        misfire_policy: parse_misfire_policy(main.misfire_instr.as_deref()),
      }))
    }
    "BLOB" => {
      let data = blob.ok_or_else(|| missing("qrtz_blob_triggers"))?;
      Ok(serde_json::from_str(data)?)
    }
    other => Err(SchedulerError::persistence(format!(
      "unknown trigger type {other:?}"
    ))),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::triggers::{CustomCalendarScheduleBuilder, OperableTrigger, TriggerBuilder};
  use chrono::{TimeZone, Utc};

  fn build_custom() -> Trigger {
    Trigger::builder()
      .with_identity("cc", "g")
      .for_job(JobKey::new("j", "g"))
      .start_at(Utc.with_ymd_and_hms(2024, 7, 15, 5, 0, 0).unwrap())
      .with_schedule(
        CustomCalendarScheduleBuilder::with_interval(2, IntervalUnit::Month)
          .by_month(5)
          .by_month_day("1,15,31")
          .by_day("WE,FR")
          .with_repeat_count(500),
      )
      .build()
      .unwrap()
  }

  #[test]
  fn test_custom_calendar_simprop_round_trip() {
    let mut trigger = build_custom();
    trigger.compute_first_fire_time(None);
    let main_model = to_model(main_row("SCHED", &trigger, "WAITING"));
    let simprop_model = match subtype_row("SCHED", &trigger) {
      SubtypeRow::Simprop(row) => simprop_to_model(row),
      _ => panic!("custom calendar must map to simprop"),
    };

    // ByMonthDay 以逗号表字符串原样往返
    // ByMonthDay round-trips as the comma-list string, unchanged
    assert_eq!(simprop_model.str_prop_2.as_deref(), Some("1,15,31"));
    assert_eq!(simprop_model.int_prop_1, Some(2));
    assert_eq!(simprop_model.long_prop_1, Some(500));
    assert_eq!(simprop_model.long_prop_2, Some(5));
    assert_eq!(simprop_model.str_prop_1.as_deref(), Some("MONTH"));
    assert_eq!(simprop_model.str_prop_3.as_deref(), Some("WE,FR"));

    let back = assemble_trigger(&main_model, None, None, Some(&simprop_model), None).unwrap();
    assert_eq!(back, trigger);
  }

  #[test]
  fn test_simple_trigger_round_trip() {
    let mut trigger = TriggerBuilder::default()
      .with_identity("s", "g")
      .for_job(JobKey::new("j", "g"))
      .start_at(Utc.with_ymd_and_hms(2024, 7, 15, 5, 0, 0).unwrap())
      .with_schedule(
        crate::triggers::SimpleScheduleBuilder::with_interval_in_seconds(30).with_repeat_count(4),
      )
      .build()
      .unwrap();
    trigger.compute_first_fire_time(None);

    let main_model = to_model(main_row("SCHED", &trigger, "WAITING"));
    let simple_model = match subtype_row("SCHED", &trigger) {
      SubtypeRow::Simple(row) => simple_to_model(row),
      _ => panic!("simple trigger must map to the simple subtype table"),
    };
    let back = assemble_trigger(&main_model, Some(&simple_model), None, None, None).unwrap();
    assert_eq!(back, trigger);
  }

  fn to_model(am: triggers::ActiveModel) -> triggers::Model {
    triggers::Model {
      sched_name: am.sched_name.unwrap(),
      trigger_group: am.trigger_group.unwrap(),
      trigger_name: am.trigger_name.unwrap(),
      job_group: am.job_group.unwrap(),
      job_name: am.job_name.unwrap(),
      description: am.description.unwrap(),
      next_fire_time: am.next_fire_time.unwrap(),
      prev_fire_time: am.prev_fire_time.unwrap(),
      priority: am.priority.unwrap(),
      trigger_state: am.trigger_state.unwrap(),
      trigger_type: am.trigger_type.unwrap(),
      start_time: am.start_time.unwrap(),
      end_time: am.end_time.unwrap(),
      calendar_name: am.calendar_name.unwrap(),
      misfire_instr: am.misfire_instr.unwrap(),
    }
  }

  fn simple_to_model(am: simple_triggers::ActiveModel) -> simple_triggers::Model {
    simple_triggers::Model {
      sched_name: am.sched_name.unwrap(),
      trigger_group: am.trigger_group.unwrap(),
      trigger_name: am.trigger_name.unwrap(),
      repeat_count: am.repeat_count.unwrap(),
      repeat_interval: am.repeat_interval.unwrap(),
      times_triggered: am.times_triggered.unwrap(),
    }
  }

  fn simprop_to_model(am: simprop_triggers::ActiveModel) -> simprop_triggers::Model {
    simprop_triggers::Model {
      sched_name: am.sched_name.unwrap(),
      trigger_group: am.trigger_group.unwrap(),
      trigger_name: am.trigger_name.unwrap(),
      str_prop_1: am.str_prop_1.unwrap(),
      str_prop_2: am.str_prop_2.unwrap(),
      str_prop_3: am.str_prop_3.unwrap(),
      int_prop_1: am.int_prop_1.unwrap(),
      int_prop_2: am.int_prop_2.unwrap(),
      long_prop_1: am.long_prop_1.unwrap(),
      long_prop_2: am.long_prop_2.unwrap(),
      dec_prop_1: am.dec_prop_1.unwrap(),
      dec_prop_2: am.dec_prop_2.unwrap(),
      bool_prop_1: am.bool_prop_1.unwrap(),
      bool_prop_2: am.bool_prop_2.unwrap(),
      time_zone_id: am.time_zone_id.unwrap(),
    }
  }
}
