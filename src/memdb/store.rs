//! 内存存储的 JobStore 实现
//! JobStore trait implementation for the in-memory store
//!
//! 所有状态迁移都在写锁内完成，对应持久化存储的 `TRIGGER_ACCESS`
//! 锁内事务。
//! All state transitions run inside the write lock, matching the
//! persistent store's transactions under the `TRIGGER_ACCESS` lock.

use crate::calendar::CalendarVariant;
use crate::error::{Result, SchedulerError};
use crate::job::JobDetail;
use crate::key::{JobKey, TriggerKey};
use crate::memdb::ram_store::{FiredRecord, RamJobStore, StoredTrigger};
use crate::store::{
  AcquiredTrigger, CompletedExecutionInstruction, JobStore, MisfireOutcome, TriggerFiredBundle,
  TriggerFiredResult, TriggerStoreState,
};
use crate::triggers::{OperableTrigger, Trigger};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;

impl RamJobStore {
  /// misfire 判定
  /// Misfire test
  fn is_misfired(&self, next_fire: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    now > next_fire && now - next_fire > self.misfire_threshold
  }
}

#[async_trait]
impl JobStore for RamJobStore {
  fn name(&self) -> &str {
    &self.name
  }

  async fn store_job_and_trigger(&self, job: JobDetail, trigger: Trigger) -> Result<()> {
    self.store_job(job, false).await?;
    self.store_trigger(trigger, false).await
  }

  async fn store_job(&self, job: JobDetail, replace_existing: bool) -> Result<()> {
    let mut storage = self.storage.write().await;
    if storage.jobs.contains_key(&job.key) && !replace_existing {
      return Err(SchedulerError::ObjectAlreadyExists(job.key.to_string()));
    }
    storage.jobs.insert(job.key.clone(), job);
    Ok(())
  }

  async fn store_trigger(&self, trigger: Trigger, replace_existing: bool) -> Result<()> {
    let mut storage = self.storage.write().await;
    let key = trigger.key().clone();
    if storage.triggers.contains_key(&key) && !replace_existing {
      return Err(SchedulerError::ObjectAlreadyExists(key.to_string()));
    }
    // 外键：引用的作业必须存在
    // Foreign key: the referenced job must exist
    if !storage.jobs.contains_key(trigger.job_key()) {
      return Err(SchedulerError::JobNotFound(trigger.job_key().to_string()));
    }
    if let Some(calendar_name) = trigger.calendar_name() {
      if !storage.calendars.contains_key(calendar_name) {
        return Err(SchedulerError::CalendarNotFound(calendar_name.to_string()));
      }
    }
    if replace_existing {
      storage.unindex_trigger(&key);
    }
    let state = storage.initial_state(&trigger);
    storage.triggers.insert(
      key.clone(),
      StoredTrigger {
        trigger,
        state,
        index_key: None,
      },
    );
    if state == TriggerStoreState::Waiting {
      storage.index_trigger(&key);
    }
    Ok(())
  }

  async fn remove_job(&self, key: &JobKey) -> Result<bool> {
    let mut storage = self.storage.write().await;
    for trigger_key in storage.trigger_keys_for_job(key) {
      storage.unindex_trigger(&trigger_key);
      storage.triggers.remove(&trigger_key);
    }
    Ok(storage.jobs.remove(key).is_some())
  }

  async fn remove_trigger(&self, key: &TriggerKey) -> Result<bool> {
    let mut storage = self.storage.write().await;
    storage.unindex_trigger(key);
    let removed = match storage.triggers.remove(key) {
      Some(stored) => stored,
      None => return Ok(false),
    };
    // 无触发器引用的非持久作业随之删除
    // A non-durable job with no remaining triggers goes with it
    let job_key = removed.trigger.job_key().clone();
    let still_referenced = !storage.trigger_keys_for_job(&job_key).is_empty();
    if !still_referenced {
      if let Some(job) = storage.jobs.get(&job_key) {
        if !job.durable {
          storage.jobs.remove(&job_key);
        }
      }
    }
    Ok(true)
  }

  async fn replace_trigger(&self, key: &TriggerKey, new_trigger: Trigger) -> Result<bool> {
    let mut storage = self.storage.write().await;
    let existing = match storage.triggers.get(key) {
      Some(stored) => stored,
      None => return Ok(false),
    };
    if existing.trigger.job_key() != new_trigger.job_key() {
      return Err(SchedulerError::persistence(
        "replacement trigger must reference the same job",
      ));
    }
    storage.unindex_trigger(key);
    storage.triggers.remove(key);
    let new_key = new_trigger.key().clone();
    let state = storage.initial_state(&new_trigger);
    storage.triggers.insert(
      new_key.clone(),
      StoredTrigger {
        trigger: new_trigger,
        state,
        index_key: None,
      },
    );
    if state == TriggerStoreState::Waiting {
      storage.index_trigger(&new_key);
    }
    Ok(true)
  }

  async fn retrieve_job(&self, key: &JobKey) -> Result<Option<JobDetail>> {
    let storage = self.storage.read().await;
    Ok(storage.jobs.get(key).cloned())
  }

  async fn retrieve_trigger(&self, key: &TriggerKey) -> Result<Option<Trigger>> {
    let storage = self.storage.read().await;
    Ok(storage.triggers.get(key).map(|stored| stored.trigger.clone()))
  }

  async fn check_job_exists(&self, key: &JobKey) -> Result<bool> {
    let storage = self.storage.read().await;
    Ok(storage.jobs.contains_key(key))
  }

  async fn check_trigger_exists(&self, key: &TriggerKey) -> Result<bool> {
    let storage = self.storage.read().await;
    Ok(storage.triggers.contains_key(key))
  }

  async fn clear_all_scheduling_data(&self) -> Result<()> {
    let mut storage = self.storage.write().await;
    *storage = Default::default();
    Ok(())
  }

  async fn store_calendar(
    &self,
    name: &str,
    calendar: CalendarVariant,
    replace_existing: bool,
    update_triggers: bool,
  ) -> Result<()> {
    let mut storage = self.storage.write().await;
    if storage.calendars.contains_key(name) && !replace_existing {
      return Err(SchedulerError::ObjectAlreadyExists(name.to_string()));
    }
    storage.calendars.insert(name.to_string(), calendar.clone());

    if update_triggers {
      let now = self.now();
      let affected: Vec<TriggerKey> = storage
        .triggers
        .values()
        .filter(|stored| stored.trigger.calendar_name() == Some(name))
        .map(|stored| stored.trigger.key().clone())
        .collect();
      for key in affected {
        storage.unindex_trigger(&key);
        if let Some(stored) = storage.triggers.get_mut(&key) {
          stored
            .trigger
            .update_with_new_calendar(&calendar, self.misfire_threshold, now);
        }
        storage.index_trigger(&key);
      }
    }
    Ok(())
  }

  async fn remove_calendar(&self, name: &str) -> Result<bool> {
    let mut storage = self.storage.write().await;
    let referenced = storage
      .triggers
      .values()
      .any(|stored| stored.trigger.calendar_name() == Some(name));
    if referenced {
      return Err(SchedulerError::persistence(format!(
        "calendar {name:?} is still referenced by triggers"
      )));
    }
    Ok(storage.calendars.remove(name).is_some())
  }

  async fn retrieve_calendar(&self, name: &str) -> Result<Option<CalendarVariant>> {
    let storage = self.storage.read().await;
    Ok(storage.calendars.get(name).cloned())
  }

  async fn calendar_exists(&self, name: &str) -> Result<bool> {
    let storage = self.storage.read().await;
    Ok(storage.calendars.contains_key(name))
  }

  async fn get_calendar_names(&self) -> Result<Vec<String>> {
    let storage = self.storage.read().await;
    let mut names: Vec<String> = storage.calendars.keys().cloned().collect();
    names.sort();
    Ok(names)
  }

  async fn get_job_keys(&self, group: &str) -> Result<Vec<JobKey>> {
    let storage = self.storage.read().await;
    let mut keys: Vec<JobKey> = storage
      .jobs
      .keys()
      .filter(|key| key.group == group)
      .cloned()
      .collect();
    keys.sort();
    Ok(keys)
  }

  async fn get_trigger_keys(&self, group: &str) -> Result<Vec<TriggerKey>> {
    let storage = self.storage.read().await;
    let mut keys: Vec<TriggerKey> = storage
      .triggers
      .keys()
      .filter(|key| key.group == group)
      .cloned()
      .collect();
    keys.sort();
    Ok(keys)
  }

  async fn get_job_group_names(&self) -> Result<Vec<String>> {
    let storage = self.storage.read().await;
    let groups: HashSet<String> = storage.jobs.keys().map(|key| key.group.clone()).collect();
    let mut groups: Vec<String> = groups.into_iter().collect();
    groups.sort();
    Ok(groups)
  }

  async fn get_trigger_group_names(&self) -> Result<Vec<String>> {
    let storage = self.storage.read().await;
    let groups: HashSet<String> = storage
      .triggers
      .keys()
      .map(|key| key.group.clone())
      .collect();
    let mut groups: Vec<String> = groups.into_iter().collect();
    groups.sort();
    Ok(groups)
  }

  async fn get_triggers_for_job(&self, key: &JobKey) -> Result<Vec<Trigger>> {
    let storage = self.storage.read().await;
    Ok(
      storage
        .triggers
        .values()
        .filter(|stored| stored.trigger.job_key() == key)
        .map(|stored| stored.trigger.clone())
        .collect(),
    )
  }

  async fn get_trigger_state(&self, key: &TriggerKey) -> Result<TriggerStoreState> {
    let storage = self.storage.read().await;
    Ok(
      storage
        .triggers
        .get(key)
        .map(|stored| stored.state)
        .unwrap_or(TriggerStoreState::None),
    )
  }

  async fn pause_trigger(&self, key: &TriggerKey) -> Result<()> {
    let mut storage = self.storage.write().await;
    let state = match storage.triggers.get(key) {
      Some(stored) => stored.state,
      None => return Ok(()),
    };
    let new_state = match state {
      TriggerStoreState::Blocked => TriggerStoreState::PausedBlocked,
      TriggerStoreState::Complete | TriggerStoreState::Error => return Ok(()),
      _ => TriggerStoreState::Paused,
    };
    storage.set_trigger_state(key, new_state);
    Ok(())
  }

  async fn pause_trigger_group(&self, group: &str) -> Result<Vec<String>> {
    let keys = self.get_trigger_keys(group).await?;
    {
      let mut storage = self.storage.write().await;
      storage.paused_trigger_groups.insert(group.to_string());
    }
    for key in keys {
      self.pause_trigger(&key).await?;
    }
    Ok(vec![group.to_string()])
  }

  async fn pause_job(&self, key: &JobKey) -> Result<()> {
    let trigger_keys = {
      let storage = self.storage.read().await;
      storage.trigger_keys_for_job(key)
    };
    for trigger_key in trigger_keys {
      self.pause_trigger(&trigger_key).await?;
    }
    Ok(())
  }

  async fn pause_job_group(&self, group: &str) -> Result<Vec<String>> {
    let job_keys = {
      let mut storage = self.storage.write().await;
      storage.paused_job_groups.insert(group.to_string());
      storage
        .jobs
        .keys()
        .filter(|key| key.group == group)
        .cloned()
        .collect::<Vec<_>>()
    };
    for key in job_keys {
      self.pause_job(&key).await?;
    }
    Ok(vec![group.to_string()])
  }

  async fn resume_trigger(&self, key: &TriggerKey) -> Result<()> {
    let now = self.now();
    let mut storage = self.storage.write().await;
    let (state, job_key, next_fire, calendar_name) = match storage.triggers.get(key) {
      Some(stored) => (
        stored.state,
        stored.trigger.job_key().clone(),
        stored.trigger.next_fire_time(),
        stored.trigger.calendar_name().map(str::to_string),
      ),
      None => return Ok(()),
    };
    if state != TriggerStoreState::Paused && state != TriggerStoreState::PausedBlocked {
      return Ok(());
    }

    // 暂停期间越过阈值的按 misfire 策略处理
    // Ones that crossed the threshold while paused get misfire treatment
    if let Some(next) = next_fire {
      if self.is_misfired(next, now) {
        let calendar = calendar_name.and_then(|name| storage.calendars.get(&name).cloned());
        if let Some(stored) = storage.triggers.get_mut(key) {
          stored.trigger.update_after_misfire(calendar.as_ref(), now);
        }
      }
    }

    let new_state = if storage.blocked_jobs.contains(&job_key) {
      TriggerStoreState::Blocked
    } else {
      TriggerStoreState::Waiting
    };
    storage.set_trigger_state(key, new_state);
    Ok(())
  }

  async fn resume_trigger_group(&self, group: &str) -> Result<Vec<String>> {
    {
      let mut storage = self.storage.write().await;
      storage.paused_trigger_groups.remove(group);
    }
    for key in self.get_trigger_keys(group).await? {
      self.resume_trigger(&key).await?;
    }
    Ok(vec![group.to_string()])
  }

  async fn resume_job(&self, key: &JobKey) -> Result<()> {
    let trigger_keys = {
      let storage = self.storage.read().await;
      storage.trigger_keys_for_job(key)
    };
    for trigger_key in trigger_keys {
      self.resume_trigger(&trigger_key).await?;
    }
    Ok(())
  }

  async fn resume_job_group(&self, group: &str) -> Result<Vec<String>> {
    let job_keys = {
      let mut storage = self.storage.write().await;
      storage.paused_job_groups.remove(group);
      storage
        .jobs
        .keys()
        .filter(|key| key.group == group)
        .cloned()
        .collect::<Vec<_>>()
    };
    for key in job_keys {
      self.resume_job(&key).await?;
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
    let storage = self.storage.read().await;
    let mut groups: Vec<String> = storage.paused_trigger_groups.iter().cloned().collect();
    groups.sort();
    Ok(groups)
  }

  async fn acquire_next_triggers(
    &self,
    no_later_than: DateTime<Utc>,
    max_count: usize,
    time_window: Duration,
  ) -> Result<Vec<AcquiredTrigger>> {
    let now = self.now();
    let mut storage = self.storage.write().await;
    let mut acquired = Vec::new();
    // 禁止并发的作业每批只取一个触发器
    // Concurrency-disallowed jobs yield at most one trigger per batch
    let mut jobs_in_batch: HashSet<JobKey> = HashSet::new();
    // 被越过的触发器在扫描期间移出索引，批结束后恢复
    // Skipped triggers leave the index during the scan and return afterwards
    let mut excluded: Vec<TriggerKey> = Vec::new();
    let mut batch_end = no_later_than;

    loop {
      if acquired.len() >= max_count {
        break;
      }
      let candidate = storage
        .time_index
        .iter()
        .next()
        .map(|(index_key, trigger_key)| (*index_key, trigger_key.clone()));
      let (index_key, trigger_key) = match candidate {
        Some(entry) => entry,
        None => break,
      };

      let next_fire = crate::time::millis_to_datetime(index_key.fire_millis);
      let policy_ignored = storage
        .triggers
        .get(&trigger_key)
        .map(|stored| stored.trigger.misfire_policy_ignored())
        .unwrap_or(false);
      // misfire 的触发器先按策略修正再重新参与选择；忽略策略的照常
      // 补触发
      // Misfired triggers are corrected by policy, then re-enter
      // selection; ignore-policy ones fire their backlog as planned
      if !policy_ignored && self.is_misfired(next_fire, now) {
        storage.unindex_trigger(&trigger_key);
        let calendar = storage
          .triggers
          .get(&trigger_key)
          .and_then(|stored| stored.trigger.calendar_name())
          .map(str::to_string)
          .and_then(|name| storage.calendars.get(&name).cloned());
        if let Some(stored) = storage.triggers.get_mut(&trigger_key) {
          stored.trigger.update_after_misfire(calendar.as_ref(), now);
          if stored.trigger.next_fire_time().is_none() {
            stored.state = TriggerStoreState::Complete;
            continue;
          }
        }
        storage.index_trigger(&trigger_key);
        continue;
      }

      if next_fire > batch_end {
        break;
      }

      let (job_key, concurrent_disallowed) = {
        let stored = match storage.triggers.get(&trigger_key) {
          Some(stored) => stored,
          None => {
            storage.time_index.remove(&index_key);
            continue;
          }
        };
        let job_key = stored.trigger.job_key().clone();
        let disallowed = storage
          .jobs
          .get(&job_key)
          .map(|job| job.concurrent_execution_disallowed)
          .unwrap_or(false);
        (job_key, disallowed)
      };

      if concurrent_disallowed
        && (jobs_in_batch.contains(&job_key) || storage.blocked_jobs.contains(&job_key))
      {
        storage.unindex_trigger(&trigger_key);
        excluded.push(trigger_key);
        continue;
      }
      if concurrent_disallowed {
        jobs_in_batch.insert(job_key.clone());
      }

      // 首个入批的触发器扩展批窗口
      // The first trigger of the batch extends the batch window
      if acquired.is_empty() {
        batch_end = next_fire.max(no_later_than) + time_window;
      }

      storage.set_trigger_state(&trigger_key, TriggerStoreState::Acquired);
      let fire_instance_id = storage.next_fire_instance_id();
      storage.fired.insert(
        fire_instance_id.clone(),
        FiredRecord {
          trigger_key: trigger_key.clone(),
          job_key,
          scheduled_time: next_fire,
          concurrent_execution_disallowed: concurrent_disallowed,
        },
      );
      let trigger = storage
        .triggers
        .get(&trigger_key)
        .map(|stored| stored.trigger.clone())
        .ok_or_else(|| SchedulerError::TriggerNotFound(trigger_key.to_string()))?;
      acquired.push(AcquiredTrigger {
        trigger,
        fire_instance_id,
      });
    }

    for key in excluded {
      storage.index_trigger(&key);
    }

    Ok(acquired)
  }

  async fn release_acquired_trigger(&self, acquired: &AcquiredTrigger) -> Result<()> {
    let mut storage = self.storage.write().await;
    storage.fired.remove(&acquired.fire_instance_id);
    if let Some(stored) = storage.triggers.get(acquired.trigger.key()) {
      if stored.state == TriggerStoreState::Acquired {
        storage.set_trigger_state(acquired.trigger.key(), TriggerStoreState::Waiting);
      }
    }
    Ok(())
  }

  async fn triggers_fired(&self, acquired: &[AcquiredTrigger]) -> Result<Vec<TriggerFiredResult>> {
    let now = self.now();
    let mut storage = self.storage.write().await;
    let mut results = Vec::with_capacity(acquired.len());

    for entry in acquired {
      let trigger_key = entry.trigger.key().clone();

      // 确认仍处于 ACQUIRED 且触发记录仍在
      // Confirm still ACQUIRED with the firing record present
      let still_acquired = storage
        .triggers
        .get(&trigger_key)
        .map(|stored| stored.state == TriggerStoreState::Acquired)
        .unwrap_or(false);
      let record = match storage.fired.get(&entry.fire_instance_id).cloned() {
        Some(record) if still_acquired => record,
        _ => {
          results.push(TriggerFiredResult::Skipped {
            trigger_key,
            reason: "trigger no longer acquired".to_string(),
          });
          continue;
        }
      };

      let job = match storage.jobs.get(&record.job_key).cloned() {
        Some(job) => job,
        None => {
          results.push(TriggerFiredResult::Skipped {
            trigger_key,
            reason: "referenced job vanished".to_string(),
          });
          continue;
        }
      };

      let calendar = storage
        .triggers
        .get(&trigger_key)
        .and_then(|stored| stored.trigger.calendar_name())
        .map(str::to_string)
        .and_then(|name| storage.calendars.get(&name).cloned());

      // 推进触发器
      // Advance the trigger
      let (previous_fire_time, next_fire_time, trigger_snapshot) = {
        let stored = storage
          .triggers
          .get_mut(&trigger_key)
          .ok_or_else(|| SchedulerError::TriggerNotFound(trigger_key.to_string()))?;
        stored.trigger.triggered(calendar.as_ref());
        (
          stored.trigger.previous_fire_time(),
          stored.trigger.next_fire_time(),
          stored.trigger.clone(),
        )
      };

      let final_state = if next_fire_time.is_none() {
        TriggerStoreState::Complete
      } else {
        TriggerStoreState::Executing
      };
      storage.set_trigger_state(&trigger_key, final_state);

      // 禁止并发的作业阻塞其兄弟触发器
      // A concurrency-disallowed job blocks its sibling triggers
      if job.concurrent_execution_disallowed {
        storage.blocked_jobs.insert(job.key.clone());
        for sibling in storage.trigger_keys_for_job(&job.key) {
          if sibling == trigger_key {
            continue;
          }
          let sibling_state = storage.triggers.get(&sibling).map(|stored| stored.state);
          match sibling_state {
            Some(TriggerStoreState::Waiting) => {
              storage.set_trigger_state(&sibling, TriggerStoreState::Blocked);
            }
            Some(TriggerStoreState::Paused) => {
              storage.set_trigger_state(&sibling, TriggerStoreState::PausedBlocked);
            }
            _ => {}
          }
        }
      }

      results.push(TriggerFiredResult::Fired(Box::new(TriggerFiredBundle {
        trigger: trigger_snapshot,
        job,
        calendar,
        fire_instance_id: entry.fire_instance_id.clone(),
        fire_time: now,
        scheduled_fire_time: record.scheduled_time,
        previous_fire_time,
        next_fire_time,
        recovering: false,
      })));
    }

    Ok(results)
  }

  async fn triggered_job_complete(
    &self,
    bundle: &TriggerFiredBundle,
    job: &JobDetail,
    instruction: CompletedExecutionInstruction,
  ) -> Result<()> {
    let mut storage = self.storage.write().await;
    storage.fired.remove(&bundle.fire_instance_id);

    // 数据映射写回在监听器看到 jobWasExecuted 之前提交
    // The data-map write-back commits before listeners see jobWasExecuted
    if job.persist_job_data_after_execution {
      if let Some(stored_job) = storage.jobs.get_mut(&job.key) {
        stored_job.job_data = job.job_data.clone();
      }
    }

    // 解除兄弟触发器的阻塞
    // Unblock sibling triggers
    if job.concurrent_execution_disallowed {
      storage.blocked_jobs.remove(&job.key);
      for sibling in storage.trigger_keys_for_job(&job.key) {
        let state = storage.triggers.get(&sibling).map(|stored| stored.state);
        match state {
          Some(TriggerStoreState::Blocked) => {
            storage.set_trigger_state(&sibling, TriggerStoreState::Waiting);
          }
          Some(TriggerStoreState::PausedBlocked) => {
            storage.set_trigger_state(&sibling, TriggerStoreState::Paused);
          }
          _ => {}
        }
      }
    }

    let trigger_key = bundle.trigger.key().clone();
    match instruction {
      CompletedExecutionInstruction::NoInstruction => {
        let state = storage.triggers.get(&trigger_key).map(|stored| stored.state);
        if state == Some(TriggerStoreState::Executing) {
          let next = storage
            .triggers
            .get(&trigger_key)
            .and_then(|stored| stored.trigger.next_fire_time());
          let new_state = if next.is_none() {
            TriggerStoreState::Complete
          } else {
            TriggerStoreState::Waiting
          };
          storage.set_trigger_state(&trigger_key, new_state);
        }
      }
      CompletedExecutionInstruction::DeleteTrigger => {
        storage.unindex_trigger(&trigger_key);
        storage.triggers.remove(&trigger_key);
      }
      CompletedExecutionInstruction::SetTriggerComplete => {
        storage.set_trigger_state(&trigger_key, TriggerStoreState::Complete);
      }
      CompletedExecutionInstruction::SetTriggerError => {
        storage.set_trigger_state(&trigger_key, TriggerStoreState::Error);
      }
      CompletedExecutionInstruction::SetAllJobTriggersError => {
        for sibling in storage.trigger_keys_for_job(&job.key) {
          storage.set_trigger_state(&sibling, TriggerStoreState::Error);
        }
      }
      CompletedExecutionInstruction::SetAllJobTriggersComplete => {
        for sibling in storage.trigger_keys_for_job(&job.key) {
          storage.set_trigger_state(&sibling, TriggerStoreState::Complete);
        }
      }
    }
    Ok(())
  }

  async fn handle_misfires(&self, max_count: usize) -> Result<MisfireOutcome> {
    let now = self.now();
    let mut storage = self.storage.write().await;
    let mut outcome = MisfireOutcome::default();

    let misfired: Vec<TriggerKey> = storage
      .time_index
      .iter()
      .take_while(|(index_key, _)| {
        self.is_misfired(crate::time::millis_to_datetime(index_key.fire_millis), now)
      })
      // 忽略策略的触发器不参与扫描
      // Ignore-policy triggers stay out of the scan
      .filter(|(_, key)| {
        storage
          .triggers
          .get(*key)
          .map(|stored| !stored.trigger.misfire_policy_ignored())
          .unwrap_or(false)
      })
      .map(|(_, key)| key.clone())
      .take(max_count + 1)
      .collect();

    outcome.has_more = misfired.len() > max_count;

    for key in misfired.into_iter().take(max_count) {
      storage.unindex_trigger(&key);
      let calendar = storage
        .triggers
        .get(&key)
        .and_then(|stored| stored.trigger.calendar_name())
        .map(str::to_string)
        .and_then(|name| storage.calendars.get(&name).cloned());
      if let Some(stored) = storage.triggers.get_mut(&key) {
        stored.trigger.update_after_misfire(calendar.as_ref(), now);
        if let Some(next) = stored.trigger.next_fire_time() {
          outcome.earliest_new_time = Some(match outcome.earliest_new_time {
            Some(earliest) => earliest.min(next),
            None => next,
          });
        } else {
          stored.state = TriggerStoreState::Complete;
        }
      }
      storage.index_trigger(&key);
      outcome.handled += 1;
      outcome.handled_triggers.push(key);
    }
    Ok(outcome)
  }

  async fn number_of_executing_triggers(&self) -> Result<usize> {
    let storage = self.storage.read().await;
    Ok(
      storage
        .triggers
        .values()
        .filter(|stored| stored.state == TriggerStoreState::Executing)
        .count(),
    )
  }
}
