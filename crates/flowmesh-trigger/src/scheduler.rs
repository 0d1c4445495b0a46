// Copyright (c) 2025 FlowMesh Team
// SPDX-License-Identifier: Apache-2.0

//! Cron scheduler.
//!
//! A single queue keyed by next fire time in UTC, translated from each
//! schedule's timezone. The ticker wakes at the earliest due time,
//! evaluates the overlap policy, launches the run, and recomputes
//! `next_run`. Failed runs retry per the schedule's `max_retries` and
//! `retry_delay_ms`.

use crate::launcher::RunLauncher;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use dashmap::DashMap;
use flowmesh_core::model::{Schedule, ScheduleStatus, TriggerSource};
use flowmesh_core::{FlowError, Result};
use flowmesh_state::ScheduleStore;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// Longest the ticker sleeps with nothing due.
const IDLE_WAKE: Duration = Duration::from_secs(30);

/// Computes the next fire time in UTC for a schedule.
///
/// The cron expression is evaluated in the schedule's timezone, so
/// `0 0 9 * * *` in `Europe/Sofia` fires at 09:00 Sofia time year-round.
pub fn next_fire(schedule: &Schedule, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
    let cron = cron::Schedule::from_str(&schedule.cron_expr).map_err(|e| {
        FlowError::InvalidDefinition(format!("cron '{}': {e}", schedule.cron_expr))
    })?;
    let tz: Tz = schedule.timezone.parse().unwrap_or(chrono_tz::UTC);
    Ok(cron
        .after(&after.with_timezone(&tz))
        .next()
        .map(|t| t.with_timezone(&Utc)))
}

/// The scheduler service.
#[derive(Clone)]
pub struct CronScheduler {
    schedules: Arc<dyn ScheduleStore>,
    launcher: Arc<dyn RunLauncher>,
    token: CancellationToken,
    /// Last launched execution per schedule, for the overlap policy.
    last_execution: Arc<DashMap<Uuid, Uuid>>,
}

impl CronScheduler {
    pub fn new(schedules: Arc<dyn ScheduleStore>, launcher: Arc<dyn RunLauncher>) -> Self {
        Self {
            schedules,
            launcher,
            token: CancellationToken::new(),
            last_execution: Arc::new(DashMap::new()),
        }
    }

    /// `schedule.create`: validates the cron expression, seeds `next_run`,
    /// and stores the schedule.
    pub async fn create(&self, mut schedule: Schedule) -> Result<Schedule> {
        schedule.next_run = next_fire(&schedule, Utc::now())?;
        self.schedules.put(schedule.clone()).await?;
        info!(schedule_id = %schedule.id, cron = %schedule.cron_expr, "schedule created");
        Ok(schedule)
    }

    /// `schedule.update`: re-validates and recomputes `next_run`.
    pub async fn update(&self, mut schedule: Schedule) -> Result<Schedule> {
        schedule.next_run = next_fire(&schedule, Utc::now())?;
        self.schedules.put(schedule.clone()).await?;
        Ok(schedule)
    }

    /// `schedule.delete`.
    pub async fn delete(&self, id: Uuid) -> Result<()> {
        self.schedules.delete(id).await
    }

    /// `schedule.pause`.
    pub async fn pause(&self, id: Uuid) -> Result<()> {
        self.set_status(id, ScheduleStatus::Paused).await
    }

    /// `schedule.resume`.
    pub async fn resume(&self, id: Uuid) -> Result<()> {
        self.set_status(id, ScheduleStatus::Active).await
    }

    /// `schedule.list`.
    pub async fn list(&self) -> Result<Vec<Schedule>> {
        self.schedules.list().await
    }

    async fn set_status(&self, id: Uuid, status: ScheduleStatus) -> Result<()> {
        let mut schedule = self
            .schedules
            .get(id)
            .await?
            .ok_or_else(|| FlowError::NotFound(format!("schedule {id}")))?;
        schedule.status = status;
        if status == ScheduleStatus::Active {
            schedule.next_run = next_fire(&schedule, Utc::now())?;
        }
        self.schedules.put(schedule).await
    }

    /// `schedule.trigger`: fires immediately, bypassing cron and overlap.
    pub async fn trigger_now(&self, id: Uuid) -> Result<Uuid> {
        let schedule = self
            .schedules
            .get(id)
            .await?
            .ok_or_else(|| FlowError::NotFound(format!("schedule {id}")))?;
        self.fire(&schedule).await
    }

    /// Runs the ticker until `stop` is called.
    pub async fn run(&self) {
        info!("cron scheduler started");
        loop {
            let sleep_for = match self.tick_once(Utc::now()).await {
                Ok(next_due) => next_due
                    .map(|t| (t - Utc::now()).to_std().unwrap_or(Duration::ZERO))
                    .unwrap_or(IDLE_WAKE)
                    .min(IDLE_WAKE),
                Err(e) => {
                    warn!(error = %e, "scheduler tick failed");
                    IDLE_WAKE
                }
            };
            tokio::select! {
                _ = self.token.cancelled() => break,
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }
        info!("cron scheduler stopped");
    }

    /// Stops the ticker.
    pub fn stop(&self) {
        self.token.cancel();
    }

    /// Evaluates due schedules once; returns the earliest upcoming fire
    /// time across active schedules.
    pub async fn tick_once(&self, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        let mut earliest: Option<DateTime<Utc>> = None;
        for schedule in self.schedules.list().await? {
            if schedule.status != ScheduleStatus::Active {
                continue;
            }
            let due = match schedule.next_run {
                Some(t) => t,
                None => match next_fire(&schedule, now)? {
                    Some(t) => {
                        let mut updated = schedule.clone();
                        updated.next_run = Some(t);
                        self.schedules.put(updated).await?;
                        t
                    }
                    None => continue,
                },
            };

            if due <= now {
                self.handle_due(&schedule, now).await?;
                if let Some(next) = next_fire(&schedule, now)? {
                    earliest = Some(earliest.map_or(next, |e| e.min(next)));
                }
            } else {
                earliest = Some(earliest.map_or(due, |e| e.min(due)));
            }
        }
        Ok(earliest)
    }

    async fn handle_due(&self, schedule: &Schedule, now: DateTime<Utc>) -> Result<()> {
        // Overlap policy: skip the tick while a prior run is active.
        if !schedule.allow_overlap {
            if let Some(prior) = self.last_execution.get(&schedule.id).map(|e| *e.value()) {
                if self.launcher.is_active(prior).await? {
                    info!(schedule_id = %schedule.id, "tick skipped, prior run still active");
                    let mut updated = schedule.clone();
                    updated.next_run = next_fire(schedule, now)?;
                    return self.schedules.put(updated).await;
                }
            }
        }

        let execution_id = self.fire(schedule).await?;
        let mut updated = schedule.clone();
        updated.last_run = Some(now);
        updated.next_run = next_fire(schedule, now)?;
        self.schedules.put(updated).await?;

        // Retry chain on failure.
        if schedule.max_retries > 0 {
            let launcher = self.launcher.clone();
            let schedule = schedule.clone();
            tokio::spawn(async move {
                watch_and_retry(launcher, schedule, execution_id).await;
            });
        }
        Ok(())
    }

    async fn fire(&self, schedule: &Schedule) -> Result<Uuid> {
        let execution_id = self
            .launcher
            .launch(
                schedule.workspace_id,
                schedule.flow_id,
                schedule.environment_overrides.clone(),
                TriggerSource::Schedule(schedule.id),
            )
            .await?;
        self.last_execution.insert(schedule.id, execution_id);
        info!(schedule_id = %schedule.id, execution_id = %execution_id, "schedule fired");
        Ok(execution_id)
    }
}

/// Polls a triggered run and relaunches on failure, up to `max_retries`.
async fn watch_and_retry(
    launcher: Arc<dyn RunLauncher>,
    schedule: Schedule,
    mut execution_id: Uuid,
) {
    use flowmesh_core::model::ExecutionStatus;

    for attempt in 1..=schedule.max_retries {
        // Wait for the run to settle.
        let outcome = loop {
            tokio::time::sleep(Duration::from_millis(500)).await;
            match launcher.status(execution_id).await {
                Ok(Some(status)) if !status.is_terminal() => continue,
                Ok(settled) => break settled,
                Err(_) => break None,
            }
        };
        if outcome != Some(ExecutionStatus::Failed) {
            break;
        }

        tokio::time::sleep(Duration::from_millis(schedule.retry_delay_ms)).await;
        match launcher
            .launch(
                schedule.workspace_id,
                schedule.flow_id,
                schedule.environment_overrides.clone(),
                TriggerSource::Schedule(schedule.id),
            )
            .await
        {
            Ok(id) => {
                warn!(schedule_id = %schedule.id, attempt = attempt, "schedule run retried");
                execution_id = id;
            }
            Err(e) => {
                warn!(schedule_id = %schedule.id, error = %e, "schedule retry failed to launch");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use flowmesh_core::model::ExecutionStatus;
    use flowmesh_state::InMemoryScheduleStore;
    use parking_lot::Mutex;
    use serde_json::{Map, Value};

    #[derive(Default)]
    struct FakeLauncher {
        launched: Mutex<Vec<Uuid>>,
        active: Mutex<Vec<Uuid>>,
    }

    #[async_trait]
    impl RunLauncher for FakeLauncher {
        async fn launch(
            &self,
            _workspace_id: Uuid,
            flow_id: Uuid,
            _variables: Map<String, Value>,
            _trigger: TriggerSource,
        ) -> Result<Uuid> {
            let _ = flow_id;
            let id = Uuid::new_v4();
            self.launched.lock().push(id);
            Ok(id)
        }

        async fn status(&self, execution_id: Uuid) -> Result<Option<ExecutionStatus>> {
            if self.active.lock().contains(&execution_id) {
                Ok(Some(ExecutionStatus::Running))
            } else {
                Ok(Some(ExecutionStatus::Completed))
            }
        }
    }

    fn schedule_every_second() -> Schedule {
        Schedule::new(Uuid::new_v4(), Uuid::new_v4(), "* * * * * *")
    }

    #[test]
    fn next_fire_respects_timezone() {
        let mut schedule = Schedule::new(Uuid::new_v4(), Uuid::new_v4(), "0 0 9 * * *")
            .with_timezone("Europe/Sofia");
        schedule.next_run = None;
        let after = Utc::now();
        let fire = next_fire(&schedule, after).unwrap().unwrap();
        let sofia = fire.with_timezone(&chrono_tz::Europe::Sofia);
        use chrono::Timelike;
        assert_eq!(sofia.hour(), 9);
        assert_eq!(sofia.minute(), 0);
    }

    #[test]
    fn invalid_cron_is_rejected() {
        let schedule = Schedule::new(Uuid::new_v4(), Uuid::new_v4(), "not cron");
        assert!(next_fire(&schedule, Utc::now()).is_err());
    }

    #[tokio::test]
    async fn due_schedule_fires_and_advances_next_run() {
        let store = Arc::new(InMemoryScheduleStore::new());
        let launcher = Arc::new(FakeLauncher::default());
        let scheduler = CronScheduler::new(store.clone(), launcher.clone());

        let mut schedule = schedule_every_second();
        schedule.next_run = Some(Utc::now() - chrono::Duration::seconds(1));
        scheduler.create(schedule.clone()).await.unwrap();
        // create() recomputes next_run into the future; force it due again.
        let mut due = store.get(schedule.id).await.unwrap().unwrap();
        due.next_run = Some(Utc::now() - chrono::Duration::seconds(1));
        store.put(due).await.unwrap();

        scheduler.tick_once(Utc::now()).await.unwrap();
        assert_eq!(launcher.launched.lock().len(), 1);

        let stored = store.get(schedule.id).await.unwrap().unwrap();
        assert!(stored.last_run.is_some());
        assert!(stored.next_run.unwrap() > Utc::now() - chrono::Duration::seconds(1));
    }

    #[tokio::test]
    async fn overlap_disallowed_skips_tick() {
        let store = Arc::new(InMemoryScheduleStore::new());
        let launcher = Arc::new(FakeLauncher::default());
        let scheduler = CronScheduler::new(store.clone(), launcher.clone());

        let schedule = schedule_every_second();
        scheduler.create(schedule.clone()).await.unwrap();
        let mut due = store.get(schedule.id).await.unwrap().unwrap();
        due.next_run = Some(Utc::now() - chrono::Duration::seconds(1));
        store.put(due).await.unwrap();

        // First tick launches; mark it still active.
        scheduler.tick_once(Utc::now()).await.unwrap();
        let first = launcher.launched.lock()[0];
        launcher.active.lock().push(first);

        // Force due again; the tick must skip.
        let mut again = store.get(schedule.id).await.unwrap().unwrap();
        again.next_run = Some(Utc::now() - chrono::Duration::seconds(1));
        store.put(again).await.unwrap();
        scheduler.tick_once(Utc::now()).await.unwrap();
        assert_eq!(launcher.launched.lock().len(), 1);

        // Once the prior run settles, the next due tick fires.
        launcher.active.lock().clear();
        let mut third = store.get(schedule.id).await.unwrap().unwrap();
        third.next_run = Some(Utc::now() - chrono::Duration::seconds(1));
        store.put(third).await.unwrap();
        scheduler.tick_once(Utc::now()).await.unwrap();
        assert_eq!(launcher.launched.lock().len(), 2);
    }

    #[tokio::test]
    async fn paused_schedules_do_not_fire() {
        let store = Arc::new(InMemoryScheduleStore::new());
        let launcher = Arc::new(FakeLauncher::default());
        let scheduler = CronScheduler::new(store.clone(), launcher.clone());

        let schedule = schedule_every_second();
        scheduler.create(schedule.clone()).await.unwrap();
        scheduler.pause(schedule.id).await.unwrap();

        let mut due = store.get(schedule.id).await.unwrap().unwrap();
        due.next_run = Some(Utc::now() - chrono::Duration::seconds(1));
        store.put(due).await.unwrap();

        scheduler.tick_once(Utc::now()).await.unwrap();
        assert!(launcher.launched.lock().is_empty());
    }

    #[tokio::test]
    async fn manual_trigger_bypasses_cron() {
        let store = Arc::new(InMemoryScheduleStore::new());
        let launcher = Arc::new(FakeLauncher::default());
        let scheduler = CronScheduler::new(store, launcher.clone());

        let schedule = schedule_every_second();
        scheduler.create(schedule.clone()).await.unwrap();
        scheduler.trigger_now(schedule.id).await.unwrap();
        assert_eq!(launcher.launched.lock().len(), 1);
    }
}
