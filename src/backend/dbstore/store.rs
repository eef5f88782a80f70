//! 持久化存储的 JobStore 实现
//! JobStore trait implementation for the persistent store
//!
//! 每个变更操作都是 `TRIGGER_ACCESS` 锁内的一个事务；集群检查与
//! 接管走 `STATE_ACCESS`，恢复本身再回到 `TRIGGER_ACCESS`。
//! Every mutating operation is one transaction under the
//! `TRIGGER_ACCESS` lock; cluster check-in and claims go through
//! `STATE_ACCESS`, and recovery itself returns to `TRIGGER_ACCESS`.

use crate::backend::dbstore::delegate::{assemble_trigger, main_row, subtype_row, SubtypeRow};
use crate::backend::dbstore::entity::{
  calendars, fired_triggers, job_details, paused_trigger_grps, scheduler_state, triggers,
  BlobTriggers, Calendars, CronTriggers, FiredTriggers, JobDetails, PausedTriggerGrps,
  SchedulerState, SimpleTriggers, SimpropTriggers, Triggers,
};
use crate::backend::dbstore::{
  DatabaseJobStore, LOCK_STATE_ACCESS, LOCK_TRIGGER_ACCESS, RECOVERING_TRIGGER_GROUP,
};
use crate::calendar::CalendarVariant;
use crate::error::{Result, SchedulerError};
use crate::job::{JobDataMap, JobDetail, RECOVERING_FIRE_TIME_KEY, RECOVERING_JOB_KEY};
use crate::key::{JobKey, TriggerKey};
use crate::store::{
  AcquiredTrigger, ClusterRecoveryOutcome, CompletedExecutionInstruction, JobStore, MisfireOutcome,
  TriggerFiredBundle, TriggerFiredResult, TriggerStoreState,
};
use crate::time::millis_to_datetime;
use crate::triggers::{
  OperableTrigger, SimpleMisfirePolicy, SimpleScheduleBuilder, Trigger, TriggerCore,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
  ActiveModelTrait, ColumnTrait, Condition, DatabaseTransaction, EntityTrait, QueryFilter,
  QueryOrder, QuerySelect, Set,
};
use std::collections::HashSet;

impl DatabaseJobStore {
  fn job_data_to_column(data: &JobDataMap) -> Result<Option<String>> {
    if data.is_empty() {
      Ok(None)
    } else {
      Ok(Some(serde_json::to_string(data)?))
    }
  }

  fn job_from_row(row: job_details::Model) -> Result<JobDetail> {
    let job_data = match row.job_data.as_deref() {
      Some(text) => serde_json::from_str(text)?,
      None => JobDataMap::new(),
    };
    Ok(JobDetail {
      key: JobKey::new(row.job_name, row.job_group),
      job_type: row.job_type,
      description: row.description,
      durable: row.is_durable,
      concurrent_execution_disallowed: row.is_nonconcurrent,
      persist_job_data_after_execution: row.is_update_data,
      request_recovery: row.requests_recovery,
      job_data,
    })
  }

  fn job_row(&self, job: &JobDetail) -> Result<job_details::ActiveModel> {
    Ok(job_details::ActiveModel {
      sched_name: Set(self.sched_name.clone()),
      job_group: Set(job.key.group.clone()),
      job_name: Set(job.key.name.clone()),
      description: Set(job.description.clone()),
      job_type: Set(job.job_type.clone()),
      is_durable: Set(job.durable),
      is_nonconcurrent: Set(job.concurrent_execution_disallowed),
      is_update_data: Set(job.persist_job_data_after_execution),
      requests_recovery: Set(job.request_recovery),
      job_data: Set(Self::job_data_to_column(&job.job_data)?),
    })
  }

  async fn load_job(&self, txn: &DatabaseTransaction, key: &JobKey) -> Result<Option<JobDetail>> {
    let row = JobDetails::find_by_id((
      self.sched_name.clone(),
      key.group.clone(),
      key.name.clone(),
    ))
    .one(txn)
    .await?;
    row.map(Self::job_from_row).transpose()
  }

  async fn load_trigger_row(
    &self,
    txn: &DatabaseTransaction,
    key: &TriggerKey,
  ) -> Result<Option<triggers::Model>> {
    Ok(
      Triggers::find_by_id((
        self.sched_name.clone(),
        key.group.clone(),
        key.name.clone(),
      ))
      .one(txn)
      .await?,
    )
  }

  /// 装载完整触发器（主表 + 子类型表）
  /// Load a full trigger (main table + subtype table)
  async fn load_trigger_from_row(
    &self,
    txn: &DatabaseTransaction,
    row: &triggers::Model,
  ) -> Result<Trigger> {
    let id = (
      row.sched_name.clone(),
      row.trigger_group.clone(),
      row.trigger_name.clone(),
    );
    let simple = SimpleTriggers::find_by_id(id.clone()).one(txn).await?;
    let cron = CronTriggers::find_by_id(id.clone()).one(txn).await?;
    let simprop = SimpropTriggers::find_by_id(id.clone()).one(txn).await?;
    let blob = BlobTriggers::find_by_id(id).one(txn).await?;
    assemble_trigger(
      row,
      simple.as_ref(),
      cron.as_ref(),
      simprop.as_ref(),
      blob.as_ref().and_then(|b| b.blob_data.as_deref()),
    )
  }

  async fn load_trigger(
    &self,
    txn: &DatabaseTransaction,
    key: &TriggerKey,
  ) -> Result<Option<Trigger>> {
    match self.load_trigger_row(txn, key).await? {
      Some(row) => Ok(Some(self.load_trigger_from_row(txn, &row).await?)),
      None => Ok(None),
    }
  }

  async fn delete_trigger_rows(&self, txn: &DatabaseTransaction, key: &TriggerKey) -> Result<u64> {
    let id = (
      self.sched_name.clone(),
      key.group.clone(),
      key.name.clone(),
    );
    // 方言不支持级联外键时子表也要显式清理
    // Subtype tables are cleaned explicitly for dialects without
    // cascading foreign keys
    let _ = SimpleTriggers::delete_by_id(id.clone()).exec(txn).await?;
    let _ = CronTriggers::delete_by_id(id.clone()).exec(txn).await?;
    let _ = SimpropTriggers::delete_by_id(id.clone()).exec(txn).await?;
    let _ = BlobTriggers::delete_by_id(id.clone()).exec(txn).await?;
    let res = Triggers::delete_by_id(id).exec(txn).await?;
    Ok(res.rows_affected)
  }

  /// 写入触发器（插入或整行替换）
  /// Write a trigger (insert or whole-row replace)
  async fn save_trigger(
    &self,
    txn: &DatabaseTransaction,
    trigger: &Trigger,
    state: TriggerStoreState,
    replace: bool,
  ) -> Result<()> {
    if replace {
      self.delete_trigger_rows(txn, trigger.key()).await?;
    }
    main_row(&self.sched_name, trigger, state.as_str())
      .insert(txn)
      .await?;
    match subtype_row(&self.sched_name, trigger) {
      SubtypeRow::Simple(row) => {
        row.insert(txn).await?;
      }
      SubtypeRow::Cron(row) => {
        row.insert(txn).await?;
      }
      SubtypeRow::Simprop(row) => {
        row.insert(txn).await?;
      }
    }
    Ok(())
  }

  /// 更新触发器的行（状态与触发进度）
  /// Update a trigger's rows (state and firing progress)
  async fn update_trigger(
    &self,
    txn: &DatabaseTransaction,
    trigger: &Trigger,
    state: TriggerStoreState,
  ) -> Result<()> {
    self.delete_trigger_rows(txn, trigger.key()).await?;
    self.save_trigger(txn, trigger, state, false).await
  }

  async fn set_trigger_state_where(
    &self,
    txn: &DatabaseTransaction,
    key: &TriggerKey,
    from: &[TriggerStoreState],
    to: TriggerStoreState,
  ) -> Result<u64> {
    let from: Vec<&str> = from.iter().map(TriggerStoreState::as_str).collect();
    let res = Triggers::update_many()
      .col_expr(triggers::Column::TriggerState, Expr::value(to.as_str()))
      .filter(triggers::Column::SchedName.eq(self.sched_name.clone()))
      .filter(triggers::Column::TriggerGroup.eq(key.group.clone()))
      .filter(triggers::Column::TriggerName.eq(key.name.clone()))
      .filter(triggers::Column::TriggerState.is_in(from))
      .exec(txn)
      .await?;
    Ok(res.rows_affected)
  }

  async fn set_job_trigger_states_where(
    &self,
    txn: &DatabaseTransaction,
    job_key: &JobKey,
    from: &[TriggerStoreState],
    to: TriggerStoreState,
  ) -> Result<u64> {
    let from: Vec<&str> = from.iter().map(TriggerStoreState::as_str).collect();
    let res = Triggers::update_many()
      .col_expr(triggers::Column::TriggerState, Expr::value(to.as_str()))
      .filter(triggers::Column::SchedName.eq(self.sched_name.clone()))
      .filter(triggers::Column::JobGroup.eq(job_key.group.clone()))
      .filter(triggers::Column::JobName.eq(job_key.name.clone()))
      .filter(triggers::Column::TriggerState.is_in(from))
      .exec(txn)
      .await?;
    Ok(res.rows_affected)
  }

  async fn load_calendar(
    &self,
    txn: &DatabaseTransaction,
    name: &str,
  ) -> Result<Option<CalendarVariant>> {
    let row = Calendars::find_by_id((self.sched_name.clone(), name.to_string()))
      .one(txn)
      .await?;
    row
      .map(|r| serde_json::from_str(&r.calendar).map_err(SchedulerError::from))
      .transpose()
  }

  async fn group_is_paused(&self, txn: &DatabaseTransaction, group: &str) -> Result<bool> {
    Ok(
      PausedTriggerGrps::find_by_id((self.sched_name.clone(), group.to_string()))
        .one(txn)
        .await?
        .is_some(),
    )
  }

  /// 作业是否有处于执行中的禁并发触发记录
  /// Whether the job has an executing concurrency-disallowed firing record
  async fn job_is_blocked(&self, txn: &DatabaseTransaction, job_key: &JobKey) -> Result<bool> {
    Ok(
      FiredTriggers::find()
        .filter(fired_triggers::Column::SchedName.eq(self.sched_name.clone()))
        .filter(fired_triggers::Column::JobGroup.eq(job_key.group.clone()))
        .filter(fired_triggers::Column::JobName.eq(job_key.name.clone()))
        .filter(fired_triggers::Column::IsNonconcurrent.eq(true))
        .filter(fired_triggers::Column::State.eq("EXECUTING"))
        .one(txn)
        .await?
        .is_some(),
    )
  }

  fn is_misfired(&self, next_fire: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    now > next_fire && now - next_fire > self.misfire_threshold
  }

  /// 对单个触发器应用 misfire 策略并写回
  /// Apply the misfire policy to one trigger and write it back
  async fn apply_misfire(
    &self,
    txn: &DatabaseTransaction,
    row: &triggers::Model,
    now: DateTime<Utc>,
  ) -> Result<Option<Trigger>> {
    let mut trigger = self.load_trigger_from_row(txn, row).await?;
    let calendar = match trigger.calendar_name() {
      Some(name) => self.load_calendar(txn, name).await?,
      None => None,
    };
    trigger.update_after_misfire(calendar.as_ref(), now);
    let state = if trigger.next_fire_time().is_none() {
      TriggerStoreState::Complete
    } else {
      TriggerStoreState::parse(&row.trigger_state)
    };
    self.update_trigger(txn, &trigger, state).await?;
    Ok(if trigger.next_fire_time().is_some() {
      Some(trigger)
    } else {
      None
    })
  }
}

#[async_trait]
impl JobStore for DatabaseJobStore {
  fn name(&self) -> &str {
    &self.name
  }

  fn clustered(&self) -> bool {
    self.is_clustered
  }

  async fn store_job_and_trigger(&self, job: JobDetail, trigger: Trigger) -> Result<()> {
    self
      .execute_in_lock(LOCK_TRIGGER_ACCESS, |store, txn| {
        Box::pin(async move {
          if store.load_job(txn, &job.key).await?.is_some() {
            return Err(SchedulerError::ObjectAlreadyExists(job.key.to_string()));
          }
          store.job_row(&job)?.insert(txn).await?;
          if store.load_trigger_row(txn, trigger.key()).await?.is_some() {
            return Err(SchedulerError::ObjectAlreadyExists(trigger.key().to_string()));
          }
          let state = if store.group_is_paused(txn, &trigger.key().group).await? {
            TriggerStoreState::Paused
          } else {
            TriggerStoreState::Waiting
          };
          store.save_trigger(txn, &trigger, state, false).await
        })
      })
      .await
  }

  async fn store_job(&self, job: JobDetail, replace_existing: bool) -> Result<()> {
    self
      .execute_in_lock(LOCK_TRIGGER_ACCESS, |store, txn| {
        Box::pin(async move {
          let exists = store.load_job(txn, &job.key).await?.is_some();
          if exists && !replace_existing {
            return Err(SchedulerError::ObjectAlreadyExists(job.key.to_string()));
          }
          if exists {
            JobDetails::delete_by_id((
              store.sched_name.clone(),
              job.key.group.clone(),
              job.key.name.clone(),
            ))
            .exec(txn)
            .await?;
          }
          store.job_row(&job)?.insert(txn).await?;
          Ok(())
        })
      })
      .await
  }

  async fn store_trigger(&self, trigger: Trigger, replace_existing: bool) -> Result<()> {
    self
      .execute_in_lock(LOCK_TRIGGER_ACCESS, |store, txn| {
        Box::pin(async move {
          let exists = store.load_trigger_row(txn, trigger.key()).await?.is_some();
          if exists && !replace_existing {
            return Err(SchedulerError::ObjectAlreadyExists(trigger.key().to_string()));
          }
          if store.load_job(txn, trigger.job_key()).await?.is_none() {
            return Err(SchedulerError::JobNotFound(trigger.job_key().to_string()));
          }
          if let Some(name) = trigger.calendar_name() {
            if store.load_calendar(txn, name).await?.is_none() {
              return Err(SchedulerError::CalendarNotFound(name.to_string()));
            }
          }
          let paused = store.group_is_paused(txn, &trigger.key().group).await?;
          let blocked = store.job_is_blocked(txn, trigger.job_key()).await?;
          let state = match (paused, blocked) {
            (true, true) => TriggerStoreState::PausedBlocked,
            (true, false) => TriggerStoreState::Paused,
            (false, true) => TriggerStoreState::Blocked,
            (false, false) => TriggerStoreState::Waiting,
          };
          store.save_trigger(txn, &trigger, state, exists).await
        })
      })
      .await
  }

  async fn remove_job(&self, key: &JobKey) -> Result<bool> {
    self
      .execute_in_lock(LOCK_TRIGGER_ACCESS, |store, txn| {
        Box::pin(async move {
          let trigger_rows = Triggers::find()
            .filter(triggers::Column::SchedName.eq(store.sched_name.clone()))
            .filter(triggers::Column::JobGroup.eq(key.group.clone()))
            .filter(triggers::Column::JobName.eq(key.name.clone()))
            .all(txn)
            .await?;
          for row in trigger_rows {
            let trigger_key = TriggerKey::new(row.trigger_name.clone(), row.trigger_group.clone());
            store.delete_trigger_rows(txn, &trigger_key).await?;
          }
          let res = JobDetails::delete_by_id((
            store.sched_name.clone(),
            key.group.clone(),
            key.name.clone(),
          ))
          .exec(txn)
          .await?;
          Ok(res.rows_affected > 0)
        })
      })
      .await
  }

  async fn remove_trigger(&self, key: &TriggerKey) -> Result<bool> {
    self
      .execute_in_lock(LOCK_TRIGGER_ACCESS, |store, txn| {
        Box::pin(async move {
          let row = match store.load_trigger_row(txn, key).await? {
            Some(row) => row,
            None => return Ok(false),
          };
          let job_key = JobKey::new(row.job_name.clone(), row.job_group.clone());
          store.delete_trigger_rows(txn, key).await?;

          // 无触发器引用的非持久作业随之删除
          // A non-durable job with no remaining triggers goes with it
          let remaining = Triggers::find()
            .filter(triggers::Column::SchedName.eq(store.sched_name.clone()))
            .filter(triggers::Column::JobGroup.eq(job_key.group.clone()))
            .filter(triggers::Column::JobName.eq(job_key.name.clone()))
            .limit(1)
            .all(txn)
            .await?;
          if remaining.is_empty() {
            if let Some(job) = store.load_job(txn, &job_key).await? {
              if !job.durable {
                JobDetails::delete_by_id((
                  store.sched_name.clone(),
                  job_key.group.clone(),
                  job_key.name.clone(),
                ))
                .exec(txn)
                .await?;
              }
            }
          }
          Ok(true)
        })
      })
      .await
  }

  async fn replace_trigger(&self, key: &TriggerKey, new_trigger: Trigger) -> Result<bool> {
    let key = key.clone();
    self
      .execute_in_lock(LOCK_TRIGGER_ACCESS, |store, txn| {
        Box::pin(async move {
          let row = match store.load_trigger_row(txn, &key).await? {
            Some(row) => row,
            None => return Ok(false),
          };
          let old_job = JobKey::new(row.job_name.clone(), row.job_group.clone());
          if &old_job != new_trigger.job_key() {
            return Err(SchedulerError::persistence(
              "replacement trigger must reference the same job",
            ));
          }
          store.delete_trigger_rows(txn, &key).await?;
          let state = if store
            .group_is_paused(txn, &new_trigger.key().group)
            .await?
          {
            TriggerStoreState::Paused
          } else {
            TriggerStoreState::Waiting
          };
          store.save_trigger(txn, &new_trigger, state, false).await?;
          Ok(true)
        })
      })
      .await
  }

  async fn retrieve_job(&self, key: &JobKey) -> Result<Option<JobDetail>> {
    let row = JobDetails::find_by_id((
      self.sched_name.clone(),
      key.group.clone(),
      key.name.clone(),
    ))
    .one(&self.db)
    .await?;
    row.map(Self::job_from_row).transpose()
  }

  async fn retrieve_trigger(&self, key: &TriggerKey) -> Result<Option<Trigger>> {
    let key = key.clone();
    self
      .execute_in_lock(LOCK_TRIGGER_ACCESS, |store, txn| {
        Box::pin(async move { store.load_trigger(txn, &key).await })
      })
      .await
  }

  async fn check_job_exists(&self, key: &JobKey) -> Result<bool> {
    Ok(
      JobDetails::find_by_id((
        self.sched_name.clone(),
        key.group.clone(),
        key.name.clone(),
      ))
      .one(&self.db)
      .await?
      .is_some(),
    )
  }

  async fn check_trigger_exists(&self, key: &TriggerKey) -> Result<bool> {
    Ok(
      Triggers::find_by_id((
        self.sched_name.clone(),
        key.group.clone(),
        key.name.clone(),
      ))
      .one(&self.db)
      .await?
      .is_some(),
    )
  }

  async fn clear_all_scheduling_data(&self) -> Result<()> {
    self
      .execute_in_lock(LOCK_TRIGGER_ACCESS, |store, txn| {
        Box::pin(async move {
          let sched = store.sched_name.clone();
          SimpleTriggers::delete_many()
            .filter(<SimpleTriggers as EntityTrait>::Column::SchedName.eq(sched.clone()))
            .exec(txn)
            .await?;
          CronTriggers::delete_many()
            .filter(<CronTriggers as EntityTrait>::Column::SchedName.eq(sched.clone()))
            .exec(txn)
            .await?;
          SimpropTriggers::delete_many()
            .filter(<SimpropTriggers as EntityTrait>::Column::SchedName.eq(sched.clone()))
            .exec(txn)
            .await?;
          BlobTriggers::delete_many()
            .filter(<BlobTriggers as EntityTrait>::Column::SchedName.eq(sched.clone()))
            .exec(txn)
            .await?;
          Triggers::delete_many()
            .filter(triggers::Column::SchedName.eq(sched.clone()))
            .exec(txn)
            .await?;
          JobDetails::delete_many()
            .filter(job_details::Column::SchedName.eq(sched.clone()))
            .exec(txn)
            .await?;
          Calendars::delete_many()
            .filter(calendars::Column::SchedName.eq(sched.clone()))
            .exec(txn)
            .await?;
          PausedTriggerGrps::delete_many()
            .filter(paused_trigger_grps::Column::SchedName.eq(sched.clone()))
            .exec(txn)
            .await?;
          FiredTriggers::delete_many()
            .filter(fired_triggers::Column::SchedName.eq(sched))
            .exec(txn)
            .await?;
          Ok(())
        })
      })
      .await
  }

  async fn store_calendar(
    &self,
    name: &str,
    calendar: CalendarVariant,
    replace_existing: bool,
    update_triggers: bool,
  ) -> Result<()> {
    let name = name.to_string();
    self
      .execute_in_lock(LOCK_TRIGGER_ACCESS, |store, txn| {
        Box::pin(async move {
          let exists = store.load_calendar(txn, &name).await?.is_some();
          if exists && !replace_existing {
            return Err(SchedulerError::ObjectAlreadyExists(name.to_string()));
          }
          if exists {
            Calendars::delete_by_id((store.sched_name.clone(), name.to_string()))
              .exec(txn)
              .await?;
          }
          calendars::ActiveModel {
            sched_name: Set(store.sched_name.clone()),
            calendar_name: Set(name.to_string()),
            calendar: Set(serde_json::to_string(&calendar)?),
          }
          .insert(txn)
          .await?;

          if update_triggers {
            let now = store.now();
            let rows = Triggers::find()
              .filter(triggers::Column::SchedName.eq(store.sched_name.clone()))
              .filter(triggers::Column::CalendarName.eq(name.as_str()))
              .all(txn)
              .await?;
            for row in rows {
              let state = TriggerStoreState::parse(&row.trigger_state);
              let mut trigger = store.load_trigger_from_row(txn, &row).await?;
              trigger.update_with_new_calendar(&calendar, store.misfire_threshold, now);
              store.update_trigger(txn, &trigger, state).await?;
            }
          }
          Ok(())
        })
      })
      .await
  }

  async fn remove_calendar(&self, name: &str) -> Result<bool> {
    let name = name.to_string();
    self
      .execute_in_lock(LOCK_TRIGGER_ACCESS, |store, txn| {
        Box::pin(async move {
          let referenced = Triggers::find()
            .filter(triggers::Column::SchedName.eq(store.sched_name.clone()))
            .filter(triggers::Column::CalendarName.eq(name.as_str()))
            .limit(1)
            .all(txn)
            .await?;
          if !referenced.is_empty() {
            return Err(SchedulerError::persistence(format!(
              "calendar {name:?} is still referenced by triggers"
            )));
          }
          let res = Calendars::delete_by_id((store.sched_name.clone(), name.to_string()))
            .exec(txn)
            .await?;
          Ok(res.rows_affected > 0)
        })
      })
      .await
  }

  async fn retrieve_calendar(&self, name: &str) -> Result<Option<CalendarVariant>> {
    let row = Calendars::find_by_id((self.sched_name.clone(), name.to_string()))
      .one(&self.db)
      .await?;
    row
      .map(|r| serde_json::from_str(&r.calendar).map_err(SchedulerError::from))
      .transpose()
  }

  async fn calendar_exists(&self, name: &str) -> Result<bool> {
    Ok(
      Calendars::find_by_id((self.sched_name.clone(), name.to_string()))
        .one(&self.db)
        .await?
        .is_some(),
    )
  }

  async fn get_calendar_names(&self) -> Result<Vec<String>> {
    let rows = Calendars::find()
      .filter(calendars::Column::SchedName.eq(self.sched_name.clone()))
      .order_by_asc(calendars::Column::CalendarName)
      .all(&self.db)
      .await?;
    Ok(rows.into_iter().map(|r| r.calendar_name).collect())
  }

  async fn get_job_keys(&self, group: &str) -> Result<Vec<JobKey>> {
    let rows = JobDetails::find()
      .filter(job_details::Column::SchedName.eq(self.sched_name.clone()))
      .filter(job_details::Column::JobGroup.eq(group))
      .order_by_asc(job_details::Column::JobName)
      .all(&self.db)
      .await?;
    Ok(
      rows
        .into_iter()
        .map(|r| JobKey::new(r.job_name, r.job_group))
        .collect(),
    )
  }

  async fn get_trigger_keys(&self, group: &str) -> Result<Vec<TriggerKey>> {
    let rows = Triggers::find()
      .filter(triggers::Column::SchedName.eq(self.sched_name.clone()))
      .filter(triggers::Column::TriggerGroup.eq(group))
      .order_by_asc(triggers::Column::TriggerName)
      .all(&self.db)
      .await?;
    Ok(
      rows
        .into_iter()
        .map(|r| TriggerKey::new(r.trigger_name, r.trigger_group))
        .collect(),
    )
  }

  async fn get_job_group_names(&self) -> Result<Vec<String>> {
    let rows = JobDetails::find()
      .filter(job_details::Column::SchedName.eq(self.sched_name.clone()))
      .all(&self.db)
      .await?;
    let groups: HashSet<String> = rows.into_iter().map(|r| r.job_group).collect();
    let mut groups: Vec<String> = groups.into_iter().collect();
    groups.sort();
    Ok(groups)
  }

  async fn get_trigger_group_names(&self) -> Result<Vec<String>> {
    let rows = Triggers::find()
      .filter(triggers::Column::SchedName.eq(self.sched_name.clone()))
      .all(&self.db)
      .await?;
    let groups: HashSet<String> = rows.into_iter().map(|r| r.trigger_group).collect();
    let mut groups: Vec<String> = groups.into_iter().collect();
    groups.sort();
    Ok(groups)
  }

  async fn get_triggers_for_job(&self, key: &JobKey) -> Result<Vec<Trigger>> {
    let key = key.clone();
    self
      .execute_in_lock(LOCK_TRIGGER_ACCESS, |store, txn| {
        Box::pin(async move {
          let rows = Triggers::find()
            .filter(triggers::Column::SchedName.eq(store.sched_name.clone()))
            .filter(triggers::Column::JobGroup.eq(key.group.clone()))
            .filter(triggers::Column::JobName.eq(key.name.clone()))
            .all(txn)
            .await?;
          let mut out = Vec::with_capacity(rows.len());
          for row in &rows {
            out.push(store.load_trigger_from_row(txn, row).await?);
          }
          Ok(out)
        })
      })
      .await
  }

  async fn get_trigger_state(&self, key: &TriggerKey) -> Result<TriggerStoreState> {
    let row = Triggers::find_by_id((
      self.sched_name.clone(),
      key.group.clone(),
      key.name.clone(),
    ))
    .one(&self.db)
    .await?;
    Ok(
      row
        .map(|r| TriggerStoreState::parse(&r.trigger_state))
        .unwrap_or(TriggerStoreState::None),
    )
  }

  async fn pause_trigger(&self, key: &TriggerKey) -> Result<()> {
    let key = key.clone();
    self
      .execute_in_lock(LOCK_TRIGGER_ACCESS, |store, txn| {
        Box::pin(async move {
          store
            .set_trigger_state_where(
              txn,
              &key,
              &[
                TriggerStoreState::Waiting,
                TriggerStoreState::Acquired,
              ],
              TriggerStoreState::Paused,
            )
            .await?;
          store
            .set_trigger_state_where(
              txn,
              &key,
              &[TriggerStoreState::Blocked],
              TriggerStoreState::PausedBlocked,
            )
            .await?;
          Ok(())
        })
      })
      .await
  }

  async fn pause_trigger_group(&self, group: &str) -> Result<Vec<String>> {
    let group = group.to_string();
    self
      .execute_in_lock(LOCK_TRIGGER_ACCESS, |store, txn| {
        Box::pin(async move {
          if !store.group_is_paused(txn, &group).await? {
            paused_trigger_grps::ActiveModel {
              sched_name: Set(store.sched_name.clone()),
              trigger_group: Set(group.to_string()),
            }
            .insert(txn)
            .await?;
          }
          Triggers::update_many()
            .col_expr(
              triggers::Column::TriggerState,
              Expr::value(TriggerStoreState::Paused.as_str()),
            )
            .filter(triggers::Column::SchedName.eq(store.sched_name.clone()))
            .filter(triggers::Column::TriggerGroup.eq(group.as_str()))
            .filter(
              triggers::Column::TriggerState
                .is_in(["WAITING", "ACQUIRED"]),
            )
            .exec(txn)
            .await?;
          Triggers::update_many()
            .col_expr(
              triggers::Column::TriggerState,
              Expr::value(TriggerStoreState::PausedBlocked.as_str()),
            )
            .filter(triggers::Column::SchedName.eq(store.sched_name.clone()))
            .filter(triggers::Column::TriggerGroup.eq(group.as_str()))
            .filter(triggers::Column::TriggerState.eq("BLOCKED"))
            .exec(txn)
            .await?;
          Ok(vec![group.to_string()])
        })
      })
      .await
  }

  async fn pause_job(&self, key: &JobKey) -> Result<()> {
    let key = key.clone();
    self
      .execute_in_lock(LOCK_TRIGGER_ACCESS, |store, txn| {
        Box::pin(async move {
          store
            .set_job_trigger_states_where(
              txn,
              &key,
              &[
                TriggerStoreState::Waiting,
                TriggerStoreState::Acquired,
              ],
              TriggerStoreState::Paused,
            )
            .await?;
          store
            .set_job_trigger_states_where(
              txn,
              &key,
              &[TriggerStoreState::Blocked],
              TriggerStoreState::PausedBlocked,
            )
            .await?;
          Ok(())
        })
      })
      .await
  }

  async fn pause_job_group(&self, group: &str) -> Result<Vec<String>> {
    let keys = self.get_job_keys(group).await?;
    for key in &keys {
      self.pause_job(key).await?;
    }
    Ok(vec![group.to_string()])
  }

  async fn resume_trigger(&self, key: &TriggerKey) -> Result<()> {
    let key = key.clone();
    self
      .execute_in_lock(LOCK_TRIGGER_ACCESS, |store, txn| {
        Box::pin(async move {
          let row = match store.load_trigger_row(txn, &key).await? {
            Some(row) => row,
            None => return Ok(()),
          };
          let state = TriggerStoreState::parse(&row.trigger_state);
          if state != TriggerStoreState::Paused && state != TriggerStoreState::PausedBlocked {
            return Ok(());
          }
          let now = store.now();
          let misfired = row
            .next_fire_time
            .map(|millis| store.is_misfired(millis_to_datetime(millis), now))
            .unwrap_or(false);
          let job_key = JobKey::new(row.job_name.clone(), row.job_group.clone());
          let blocked = store.job_is_blocked(txn, &job_key).await?;
          let target = if blocked {
            TriggerStoreState::Blocked
          } else {
            TriggerStoreState::Waiting
          };
          if misfired {
            let mut trigger = store.load_trigger_from_row(txn, &row).await?;
            let calendar = match trigger.calendar_name() {
              Some(name) => store.load_calendar(txn, name).await?,
              None => None,
            };
            trigger.update_after_misfire(calendar.as_ref(), now);
            let target = if trigger.next_fire_time().is_none() {
              TriggerStoreState::Complete
            } else {
              target
            };
            store.update_trigger(txn, &trigger, target).await?;
          } else {
            store
              .set_trigger_state_where(
                txn,
                &key,
                &[TriggerStoreState::Paused, TriggerStoreState::PausedBlocked],
                target,
              )
              .await?;
          }
          Ok(())
        })
      })
      .await
  }

  async fn resume_trigger_group(&self, group: &str) -> Result<Vec<String>> {
    let group = group.to_string();
    self
      .execute_in_lock(LOCK_TRIGGER_ACCESS, |store, txn| {
        Box::pin(async move {
          PausedTriggerGrps::delete_by_id((store.sched_name.clone(), group.clone()))
            .exec(txn)
            .await?;
          Ok(())
        })
      })
      .await?;
    for key in self.get_trigger_keys(&group).await? {
      self.resume_trigger(&key).await?;
    }
    Ok(vec![group])
  }

  async fn resume_job(&self, key: &JobKey) -> Result<()> {
    let triggers_of_job = self.get_triggers_for_job(key).await?;
    for trigger in triggers_of_job {
      self.resume_trigger(trigger.key()).await?;
    }
    Ok(())
  }

  async fn resume_job_group(&self, group: &str) -> Result<Vec<String>> {
    let keys = self.get_job_keys(group).await?;
    for key in &keys {
      self.resume_job(key).await?;
    }
    Ok(vec![group.to_string()])
  }

  async fn pause_all(&self) -> Result<()> {
    for group in self.get_trigger_group_names().await? {
      self.pause_trigger_group(&group).await?;
    }
    Ok(())
  }

  async fn resume_all(&self) -> Result<()> {
    for group in self.get_trigger_group_names().await? {
      self.resume_trigger_group(&group).await?;
    }
    Ok(())
  }

  async fn get_paused_trigger_groups(&self) -> Result<Vec<String>> {
    let rows = PausedTriggerGrps::find()
      .filter(paused_trigger_grps::Column::SchedName.eq(self.sched_name.clone()))
      .order_by_asc(paused_trigger_grps::Column::TriggerGroup)
      .all(&self.db)
      .await?;
    Ok(rows.into_iter().map(|r| r.trigger_group).collect())
  }

  async fn acquire_next_triggers(
    &self,
    no_later_than: DateTime<Utc>,
    max_count: usize,
    time_window: Duration,
  ) -> Result<Vec<AcquiredTrigger>> {
    self
      .execute_in_lock(LOCK_TRIGGER_ACCESS, |store, txn| {
        Box::pin(async move {
          let now = store.now();
          let mut acquired: Vec<AcquiredTrigger> = Vec::new();
          let mut jobs_in_batch: HashSet<JobKey> = HashSet::new();
          let upper = (no_later_than + time_window).timestamp_millis();
          let mut batch_end: Option<DateTime<Utc>> = None;

          let candidates = Triggers::find()
            .filter(triggers::Column::SchedName.eq(store.sched_name.clone()))
            .filter(triggers::Column::TriggerState.eq("WAITING"))
            .filter(triggers::Column::NextFireTime.is_not_null())
            .filter(triggers::Column::NextFireTime.lte(upper))
            .order_by_asc(triggers::Column::NextFireTime)
            .order_by_desc(triggers::Column::Priority)
            .limit((max_count * 2 + 8) as u64)
            .all(txn)
            .await?;

          for row in candidates {
            if acquired.len() >= max_count {
              break;
            }
            let next_fire = match row.next_fire_time {
              Some(millis) => millis_to_datetime(millis),
              None => continue,
            };

            // misfire 的触发器先按策略修正；忽略策略的照常补触发
            // Misfired triggers are corrected by policy first;
            // ignore-policy ones fire their backlog as planned
            if row.misfire_instr.as_deref() != Some("\"Ignore\"")
              && store.is_misfired(next_fire, now)
            {
              let corrected = store.apply_misfire(txn, &row, now).await?;
              let trigger = match corrected {
                Some(trigger) => trigger,
                None => continue,
              };
              let new_next = match trigger.next_fire_time() {
                Some(t) => t,
                None => continue,
              };
              if new_next.timestamp_millis() > upper {
                continue;
              }
              // 修正后的时刻重新参与本批选择
              // The corrected instant re-enters this batch's selection
              if batch_end.is_some_and(|end| new_next > end) {
                continue;
              }
            }

            if let Some(end) = batch_end {
              if next_fire > end {
                break;
              }
            }

            let job_key = JobKey::new(row.job_name.clone(), row.job_group.clone());
            let job = match store.load_job(txn, &job_key).await? {
              Some(job) => job,
              None => continue,
            };
            if job.concurrent_execution_disallowed
              && (jobs_in_batch.contains(&job_key)
                || store.job_is_blocked(txn, &job_key).await?)
            {
              continue;
            }

            let trigger_key = TriggerKey::new(row.trigger_name.clone(), row.trigger_group.clone());
            let updated = store
              .set_trigger_state_where(
                txn,
                &trigger_key,
                &[TriggerStoreState::Waiting],
                TriggerStoreState::Acquired,
              )
              .await?;
            if updated == 0 {
              continue;
            }

            let trigger = match store.load_trigger(txn, &trigger_key).await? {
              Some(trigger) => trigger,
              None => continue,
            };
            let actual_next = trigger.next_fire_time().unwrap_or(next_fire);

            let fire_instance_id = store.next_fire_instance_id();
            fired_triggers::ActiveModel {
              sched_name: Set(store.sched_name.clone()),
              entry_id: Set(fire_instance_id.clone()),
              trigger_group: Set(trigger_key.group.clone()),
              trigger_name: Set(trigger_key.name.clone()),
              job_group: Set(job_key.group.clone()),
              job_name: Set(job_key.name.clone()),
              instance_name: Set(store.instance_id.clone()),
              fired_time: Set(now.timestamp_millis()),
              sched_time: Set(actual_next.timestamp_millis()),
              priority: Set(trigger.priority()),
              state: Set("ACQUIRED".to_string()),
              is_nonconcurrent: Set(job.concurrent_execution_disallowed),
              requests_recovery: Set(job.request_recovery),
            }
            .insert(txn)
            .await?;

            if job.concurrent_execution_disallowed {
              jobs_in_batch.insert(job_key);
            }
            if batch_end.is_none() {
              batch_end = Some(actual_next.max(no_later_than) + time_window);
            }
            acquired.push(AcquiredTrigger {
              trigger,
              fire_instance_id,
            });
          }

          Ok(acquired)
        })
      })
      .await
  }

  async fn release_acquired_trigger(&self, acquired: &AcquiredTrigger) -> Result<()> {
    self
      .execute_in_lock(LOCK_TRIGGER_ACCESS, |store, txn| {
        Box::pin(async move {
          store
            .set_trigger_state_where(
              txn,
              acquired.trigger.key(),
              &[TriggerStoreState::Acquired],
              TriggerStoreState::Waiting,
            )
            .await?;
          FiredTriggers::delete_by_id((
            store.sched_name.clone(),
            acquired.fire_instance_id.clone(),
          ))
          .exec(txn)
          .await?;
          Ok(())
        })
      })
      .await
  }

  async fn triggers_fired(&self, acquired: &[AcquiredTrigger]) -> Result<Vec<TriggerFiredResult>> {
    self
      .execute_in_lock(LOCK_TRIGGER_ACCESS, |store, txn| {
        Box::pin(async move {
          let now = store.now();
          let mut results = Vec::with_capacity(acquired.len());

          for entry in acquired {
            let trigger_key = entry.trigger.key().clone();
            let row = store.load_trigger_row(txn, &trigger_key).await?;
            let row = match row {
              Some(row) if row.trigger_state == "ACQUIRED" => row,
              _ => {
                results.push(TriggerFiredResult::Skipped {
                  trigger_key,
                  reason: "trigger no longer acquired".to_string(),
                });
                continue;
              }
            };
            let fired_row = FiredTriggers::find_by_id((
              store.sched_name.clone(),
              entry.fire_instance_id.clone(),
            ))
            .one(txn)
            .await?;
            let fired_row = match fired_row {
              Some(fired_row) => fired_row,
              None => {
                results.push(TriggerFiredResult::Skipped {
                  trigger_key,
                  reason: "firing record vanished".to_string(),
                });
                continue;
              }
            };

            let job_key = JobKey::new(row.job_name.clone(), row.job_group.clone());
            let job = match store.load_job(txn, &job_key).await? {
              Some(job) => job,
              None => {
                results.push(TriggerFiredResult::Skipped {
                  trigger_key,
                  reason: "referenced job vanished".to_string(),
                });
                continue;
              }
            };

            let mut trigger = store.load_trigger_from_row(txn, &row).await?;
            let calendar = match trigger.calendar_name() {
              Some(name) => store.load_calendar(txn, name).await?,
              None => None,
            };

            trigger.triggered(calendar.as_ref());
            let state = if trigger.next_fire_time().is_none() {
              TriggerStoreState::Complete
            } else {
              TriggerStoreState::Executing
            };
            store.update_trigger(txn, &trigger, state).await?;

            let mut fired_update: fired_triggers::ActiveModel = fired_row.into();
            fired_update.state = Set("EXECUTING".to_string());
            fired_update.update(txn).await?;

            if job.concurrent_execution_disallowed {
              store
                .set_job_trigger_states_where(
                  txn,
                  &job_key,
                  &[TriggerStoreState::Waiting],
                  TriggerStoreState::Blocked,
                )
                .await?;
              store
                .set_job_trigger_states_where(
                  txn,
                  &job_key,
                  &[TriggerStoreState::Paused],
                  TriggerStoreState::PausedBlocked,
                )
                .await?;
            }

            let scheduled = millis_to_datetime(
              entry
                .trigger
                .next_fire_time()
                .map(|t| t.timestamp_millis())
                .unwrap_or_else(|| now.timestamp_millis()),
            );
            results.push(TriggerFiredResult::Fired(Box::new(TriggerFiredBundle {
              previous_fire_time: trigger.previous_fire_time(),
              next_fire_time: trigger.next_fire_time(),
              trigger,
              job,
              calendar,
              fire_instance_id: entry.fire_instance_id.clone(),
              fire_time: now,
              scheduled_fire_time: scheduled,
              recovering: trigger_key.group == RECOVERING_TRIGGER_GROUP,
            })));
          }

          Ok(results)
        })
      })
      .await
  }

  async fn triggered_job_complete(
    &self,
    bundle: &TriggerFiredBundle,
    job: &JobDetail,
    instruction: CompletedExecutionInstruction,
  ) -> Result<()> {
    self
      .execute_in_lock(LOCK_TRIGGER_ACCESS, |store, txn| {
        Box::pin(async move {
          let trigger_key = bundle.trigger.key().clone();

          // 数据映射写回先于监听器可见的完成事件
          // The data-map write-back precedes the completion events
          // listeners observe
          if job.persist_job_data_after_execution {
            let rows = JobDetails::update_many()
              .col_expr(
                job_details::Column::JobData,
                Expr::value(Self::job_data_to_column(&job.job_data)?),
              )
              .filter(job_details::Column::SchedName.eq(store.sched_name.clone()))
              .filter(job_details::Column::JobGroup.eq(job.key.group.clone()))
              .filter(job_details::Column::JobName.eq(job.key.name.clone()))
              .exec(txn)
              .await?;
            if rows.rows_affected == 0 {
              tracing::warn!(job = %job.key, "job vanished before data-map write-back");
            }
          }

          if job.concurrent_execution_disallowed {
            store
              .set_job_trigger_states_where(
                txn,
                &job.key,
                &[TriggerStoreState::Blocked],
                TriggerStoreState::Waiting,
              )
              .await?;
            store
              .set_job_trigger_states_where(
                txn,
                &job.key,
                &[TriggerStoreState::PausedBlocked],
                TriggerStoreState::Paused,
              )
              .await?;
          }

          match instruction {
            CompletedExecutionInstruction::NoInstruction => {
              let next = store
                .load_trigger_row(txn, &trigger_key)
                .await?
                .and_then(|row| row.next_fire_time);
              let target = if next.is_none() {
                TriggerStoreState::Complete
              } else {
                TriggerStoreState::Waiting
              };
              store
                .set_trigger_state_where(
                  txn,
                  &trigger_key,
                  &[TriggerStoreState::Executing],
                  target,
                )
                .await?;
            }
            CompletedExecutionInstruction::DeleteTrigger => {
              store.delete_trigger_rows(txn, &trigger_key).await?;
            }
            CompletedExecutionInstruction::SetTriggerComplete => {
              store
                .set_trigger_state_where(
                  txn,
                  &trigger_key,
                  &[
                    TriggerStoreState::Executing,
                    TriggerStoreState::Waiting,
                    TriggerStoreState::Acquired,
                  ],
                  TriggerStoreState::Complete,
                )
                .await?;
            }
            CompletedExecutionInstruction::SetTriggerError => {
              store
                .set_trigger_state_where(
                  txn,
                  &trigger_key,
                  &[
                    TriggerStoreState::Executing,
                    TriggerStoreState::Waiting,
                    TriggerStoreState::Acquired,
                  ],
                  TriggerStoreState::Error,
                )
                .await?;
            }
            CompletedExecutionInstruction::SetAllJobTriggersError => {
              Triggers::update_many()
                .col_expr(
                  triggers::Column::TriggerState,
                  Expr::value(TriggerStoreState::Error.as_str()),
                )
                .filter(triggers::Column::SchedName.eq(store.sched_name.clone()))
                .filter(triggers::Column::JobGroup.eq(job.key.group.clone()))
                .filter(triggers::Column::JobName.eq(job.key.name.clone()))
                .exec(txn)
                .await?;
            }
            CompletedExecutionInstruction::SetAllJobTriggersComplete => {
              Triggers::update_many()
                .col_expr(
                  triggers::Column::TriggerState,
                  Expr::value(TriggerStoreState::Complete.as_str()),
                )
                .filter(triggers::Column::SchedName.eq(store.sched_name.clone()))
                .filter(triggers::Column::JobGroup.eq(job.key.group.clone()))
                .filter(triggers::Column::JobName.eq(job.key.name.clone()))
                .exec(txn)
                .await?;
            }
          }

          FiredTriggers::delete_by_id((
            store.sched_name.clone(),
            bundle.fire_instance_id.clone(),
          ))
          .exec(txn)
          .await?;
          Ok(())
        })
      })
      .await
  }

  async fn handle_misfires(&self, max_count: usize) -> Result<MisfireOutcome> {
    self
      .execute_in_lock(LOCK_TRIGGER_ACCESS, |store, txn| {
        Box::pin(async move {
          let now = store.now();
          let cutoff = (now - store.misfire_threshold).timestamp_millis();
          let rows = Triggers::find()
            .filter(triggers::Column::SchedName.eq(store.sched_name.clone()))
            .filter(triggers::Column::TriggerState.eq("WAITING"))
            .filter(triggers::Column::NextFireTime.is_not_null())
            .filter(triggers::Column::NextFireTime.lt(cutoff))
            // 忽略策略的触发器不参与扫描，按原计划补触发
            // Ignore-policy triggers stay out of the scan and fire their
            // backlog as planned
            .filter(
              Condition::any()
                .add(triggers::Column::MisfireInstr.is_null())
                .add(triggers::Column::MisfireInstr.ne("\"Ignore\"")),
            )
            .order_by_asc(triggers::Column::NextFireTime)
            .order_by_desc(triggers::Column::Priority)
            .limit((max_count + 1) as u64)
            .all(txn)
            .await?;

          let mut outcome = MisfireOutcome {
            has_more: rows.len() > max_count,
            ..Default::default()
          };
          for row in rows.into_iter().take(max_count) {
            let key = TriggerKey::new(row.trigger_name.clone(), row.trigger_group.clone());
            if let Some(trigger) = store.apply_misfire(txn, &row, now).await? {
              if let Some(next) = trigger.next_fire_time() {
                outcome.earliest_new_time = Some(match outcome.earliest_new_time {
                  Some(earliest) => earliest.min(next),
                  None => next,
                });
              }
            }
            outcome.handled += 1;
            outcome.handled_triggers.push(key);
          }
          Ok(outcome)
        })
      })
      .await
  }

  async fn cluster_checkin(&self) -> Result<ClusterRecoveryOutcome> {
    // 第一阶段：STATE_ACCESS 下写入心跳并认领失效实例
    // Phase one: write the heartbeat and claim failed instances under
    // STATE_ACCESS
    let failed: Vec<scheduler_state::Model> = self
      .execute_in_lock(LOCK_STATE_ACCESS, |store, txn| {
        Box::pin(async move {
          let now = store.now();
          let updated = SchedulerState::update_many()
            .col_expr(
              scheduler_state::Column::LastCheckinTime,
              Expr::value(now.timestamp_millis()),
            )
            .filter(scheduler_state::Column::SchedName.eq(store.sched_name.clone()))
            .filter(scheduler_state::Column::InstanceName.eq(store.instance_id.clone()))
            .exec(txn)
            .await?;
          if updated.rows_affected == 0 {
            scheduler_state::ActiveModel {
              sched_name: Set(store.sched_name.clone()),
              instance_name: Set(store.instance_id.clone()),
              last_checkin_time: Set(now.timestamp_millis()),
              checkin_interval: Set(store.cluster_checkin_interval.num_milliseconds()),
            }
            .insert(txn)
            .await?;
          }

          if !store.is_clustered {
            return Ok(Vec::new());
          }

          let rows = SchedulerState::find()
            .filter(scheduler_state::Column::SchedName.eq(store.sched_name.clone()))
            .all(txn)
            .await?;
          let mut failed = Vec::new();
          for row in rows {
            if row.instance_name == store.instance_id {
              continue;
            }
            let interval = row
              .checkin_interval
              .max(store.cluster_checkin_interval.num_milliseconds());
            // 双倍间隔未见心跳即视为失效（含时钟偏移余量）
            // No heartbeat for two intervals means failed (clock-skew
            // allowance included)
            if row.last_checkin_time + interval * 2 < now.timestamp_millis() {
              // 删除状态行即认领；并发的竞争者中只有一个删除成功
              // Deleting the state row claims the instance; only one
              // concurrent contender's delete succeeds
              let res = SchedulerState::delete_by_id((
                store.sched_name.clone(),
                row.instance_name.clone(),
              ))
              .exec(txn)
              .await?;
              if res.rows_affected > 0 {
                failed.push(row);
              }
            }
          }
          Ok(failed)
        })
      })
      .await?;

    if failed.is_empty() {
      return Ok(ClusterRecoveryOutcome::default());
    }

    // 第二阶段：TRIGGER_ACCESS 下恢复被认领实例的在途触发
    // Phase two: recover the claimed instances' in-flight firings under
    // TRIGGER_ACCESS
    self
      .execute_in_lock(LOCK_TRIGGER_ACCESS, |store, txn| {
        Box::pin(async move {
          let mut outcome = ClusterRecoveryOutcome::default();

          for instance in &failed {
            let fired_rows = FiredTriggers::find()
              .filter(fired_triggers::Column::SchedName.eq(store.sched_name.clone()))
              .filter(fired_triggers::Column::InstanceName.eq(instance.instance_name.clone()))
              .all(txn)
              .await?;

            for fired in &fired_rows {
              let trigger_key =
                TriggerKey::new(fired.trigger_name.clone(), fired.trigger_group.clone());
              let job_key = JobKey::new(fired.job_name.clone(), fired.job_group.clone());

              // 把失效实例占有的触发器复位回 WAITING
              // Restore triggers held by the failed instance to WAITING
              let restored = store
                .set_trigger_state_where(
                  txn,
                  &trigger_key,
                  &[
                    TriggerStoreState::Acquired,
                    TriggerStoreState::Executing,
                    TriggerStoreState::Blocked,
                  ],
                  TriggerStoreState::Waiting,
                )
                .await?;
              store
                .set_trigger_state_where(
                  txn,
                  &trigger_key,
                  &[TriggerStoreState::PausedBlocked],
                  TriggerStoreState::Paused,
                )
                .await?;
              if fired.is_nonconcurrent {
                store
                  .set_job_trigger_states_where(
                    txn,
                    &job_key,
                    &[TriggerStoreState::Blocked],
                    TriggerStoreState::Waiting,
                  )
                  .await?;
                store
                  .set_job_trigger_states_where(
                    txn,
                    &job_key,
                    &[TriggerStoreState::PausedBlocked],
                    TriggerStoreState::Paused,
                  )
                  .await?;
              }
              outcome.recovered_triggers += restored as usize;

              // 请求恢复的作业得到一支一次性恢复触发器，计划时刻为
              // 原 firedTime，原触发信息写进作业数据映射
              // A recovery-requesting job gets a one-shot recovery
              // trigger scheduled at the original firedTime, with the
              // original firing info in the job's data map
              if fired.requests_recovery {
                if let Some(mut job) = store.load_job(txn, &job_key).await? {
                  // 恢复触发器的计划时刻取原 firedTime
                  // The recovery trigger is scheduled at the original
                  // firedTime
                  let scheduled_at = millis_to_datetime(fired.fired_time);
                  job.job_data.put(RECOVERING_JOB_KEY, trigger_key.to_string());
                  job
                    .job_data
                    .put(RECOVERING_FIRE_TIME_KEY, fired.fired_time);
                  JobDetails::update_many()
                    .col_expr(
                      job_details::Column::JobData,
                      Expr::value(Self::job_data_to_column(&job.job_data)?),
                    )
                    .filter(job_details::Column::SchedName.eq(store.sched_name.clone()))
                    .filter(job_details::Column::JobGroup.eq(job_key.group.clone()))
                    .filter(job_details::Column::JobName.eq(job_key.name.clone()))
                    .exec(txn)
                    .await?;

                  let mut core = TriggerCore::new(
                    TriggerKey::new(
                      format!("recover_{}_{}", instance.instance_name, fired.entry_id),
                      RECOVERING_TRIGGER_GROUP,
                    ),
                    job_key.clone(),
                    scheduled_at,
                  );
                  core.priority = fired.priority;
                  core.next_fire_time = Some(scheduled_at);
                  let mut recovery = SimpleScheduleBuilder::once().build(core);
                  recovery.misfire_policy = SimpleMisfirePolicy::FireNow;
                  store
                    .save_trigger(
                      txn,
                      &Trigger::Simple(recovery),
                      TriggerStoreState::Waiting,
                      false,
                    )
                    .await?;
                  outcome.recovery_triggers_scheduled += 1;
                }
              }
            }

            // 失效实例的触发记录随接管一并删除
            // The failed instance's firing records go with the takeover
            FiredTriggers::delete_many()
              .filter(fired_triggers::Column::SchedName.eq(store.sched_name.clone()))
              .filter(fired_triggers::Column::InstanceName.eq(instance.instance_name.clone()))
              .exec(txn)
              .await?;
            outcome.failed_instances.push(instance.instance_name.clone());

            tracing::info!(
              instance = %instance.instance_name,
              recovered = outcome.recovered_triggers,
              recovery_triggers = outcome.recovery_triggers_scheduled,
              "recovered work from failed cluster instance"
            );
          }

          Ok(outcome)
        })
      })
      .await
  }

  async fn number_of_executing_triggers(&self) -> Result<usize> {
    let rows = FiredTriggers::find()
      .filter(fired_triggers::Column::SchedName.eq(self.sched_name.clone()))
      .filter(fired_triggers::Column::InstanceName.eq(self.instance_id.clone()))
      .filter(fired_triggers::Column::State.eq("EXECUTING"))
      .all(&self.db)
      .await?;
    Ok(rows.len())
  }
}
