/// Timed workflow launches
///
/// Persists schedules and arms them on a tokio-cron-scheduler runtime. Each
/// firing starts a new workflow instance through the `Worker`, tagged with
/// the schedule id. Schedules that can no longer be armed after a restart are
/// kept aside as `FailedToScheduleEntry` so an operator can see and delete
/// them.

use crate::{
    error::{CoordinatorError, Result},
    runtime::worker::Worker,
    store::{queries, ScheduleLastRun, ScheduleRow, Store},
    workflow::types::{check_params, unmarshal_params, Params},
};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};
use tokio::sync::{Mutex, RwLock};
use tokio_cron_scheduler::{Job, JobScheduler};
use uuid::Uuid;

/// When a schedule launches its workflow
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Schedule {
    /// A single launch at the given instant
    Once(DateTime<Utc>),
    /// A standard 5-field cron spec (or an `@daily`-style descriptor)
    Cron(String),
    /// Launch right away; never persisted as a schedule
    Immediate,
}

impl Schedule {
    pub fn from_row(row: &ScheduleRow) -> Self {
        match (&row.once, &row.spec) {
            (Some(once), _) => Schedule::Once(*once),
            (None, Some(spec)) if !spec.trim().is_empty() => Schedule::Cron(spec.clone()),
            _ => Schedule::Immediate,
        }
    }

    /// Validate and build the trigger that computes launch times
    pub fn trigger(&self) -> Result<Trigger> {
        match self {
            Schedule::Once(at) => Ok(Trigger::Once(RunOnce { at: *at })),
            Schedule::Cron(spec) => {
                croner::Cron::new(spec)
                    .parse()
                    .map_err(|e| CoordinatorError::InvalidSchedule(format!("{:?}: {}", spec, e)))?;
                Ok(Trigger::Cron(spec.clone()))
            }
            Schedule::Immediate => Err(CoordinatorError::InvalidSchedule(
                "unschedulable schedule type Immediate".to_string(),
            )),
        }
    }

    fn once(&self) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Once(at) => Some(*at),
            _ => None,
        }
    }

    fn spec(&self) -> Option<&str> {
        match self {
            Schedule::Cron(spec) => Some(spec),
            _ => None,
        }
    }
}

/// Launch at one instant, then never again
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOnce {
    pub at: DateTime<Utc>,
}

impl RunOnce {
    pub fn next_after(&self, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if t > self.at {
            None
        } else {
            Some(self.at)
        }
    }
}

/// A validated schedule that can compute its next launch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    Once(RunOnce),
    Cron(String),
}

impl Trigger {
    pub fn next_after(&self, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Trigger::Once(once) => once.next_after(t),
            Trigger::Cron(spec) => croner::Cron::new(spec)
                .parse()
                .and_then(|cron| cron.find_next_occurrence(&t, false))
                .ok(),
        }
    }
}

/// A schedule row with its decoded parameters
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowSchedule {
    pub schedule: ScheduleRow,
    /// `None` when the stored params no longer match the definition
    pub params: Option<Params>,
}

impl WorkflowSchedule {
    pub fn id(&self) -> i64 {
        self.schedule.id
    }

    pub fn schedule_desc(&self) -> String {
        match Schedule::from_row(&self.schedule) {
            Schedule::Once(_) => "Run once on the future date.".to_string(),
            Schedule::Cron(spec) => format!("Using the cron schedule {:?}.", spec),
            Schedule::Immediate => String::new(),
        }
    }

    pub fn param_desc(&self) -> String {
        match &self.params {
            Some(params) => serde_json::to_string_pretty(params)
                .unwrap_or_else(|e| format!("failed to marshal workflow parameters: {}", e)),
            // Best effort: the definition changed, so show what was stored.
            None => serde_json::from_str::<Value>(&self.schedule.workflow_params)
                .and_then(|raw| serde_json::to_string_pretty(&raw))
                .unwrap_or_else(|e| format!("failed to indent workflow parameters: {}", e)),
        }
    }
}

/// An armed schedule
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleEntry {
    pub schedule: WorkflowSchedule,
    /// Next launch, `None` once a one-shot schedule has fired
    pub next: Option<DateTime<Utc>>,
    pub last_run: Option<ScheduleLastRun>,
}

/// A persisted schedule that could not be re-armed
#[derive(Debug, Clone, PartialEq)]
pub struct FailedToScheduleEntry {
    pub schedule: WorkflowSchedule,
    pub trigger: Trigger,
    pub error: String,
    pub last_run: Option<ScheduleLastRun>,
}

impl FailedToScheduleEntry {
    /// When the schedule would next have fired
    pub fn next(&self) -> Option<DateTime<Utc>> {
        self.trigger.next_after(Utc::now())
    }
}

struct LiveEntry {
    /// Pending launch on the cron runtime, `None` once nothing is left to fire
    job: Option<Uuid>,
    schedule: WorkflowSchedule,
    trigger: Trigger,
}

/// Persistent schedule registry on top of tokio-cron-scheduler
///
/// Every launch is armed as a one-shot job at the time the trigger computes,
/// and a cron schedule arms its next launch each time it fires. The launch
/// times reported by `entries` are therefore the ones jobs actually fire at.
pub struct Scheduler {
    store: Store,
    worker: Arc<Worker>,
    timers: Timers,
    failed: Mutex<Vec<FailedToScheduleEntry>>,
}

/// Live entries and the cron runtime their launches are armed on
#[derive(Clone)]
struct Timers {
    cron: Arc<RwLock<JobScheduler>>,
    live: Arc<Mutex<BTreeMap<i64, LiveEntry>>>,
    worker: Arc<Worker>,
}

impl Scheduler {
    /// Create the scheduler and start its cron runtime
    pub async fn new(store: Store, worker: Arc<Worker>) -> Result<Self> {
        let cron = JobScheduler::new().await?;
        cron.start().await?;
        tracing::info!("⏰ Cron runtime started");
        Ok(Self {
            store,
            timers: Timers {
                cron: Arc::new(RwLock::new(cron)),
                live: Arc::new(Mutex::new(BTreeMap::new())),
                worker: Arc::clone(&worker),
            },
            worker,
            failed: Mutex::new(Vec::new()),
        })
    }

    /// Persist a schedule for `workflow_name` and arm it
    ///
    /// Nothing is persisted when the workflow, params or schedule are invalid.
    /// A `Once` instant in the past is accepted and fires right away.
    pub async fn create(&self, schedule: Schedule, workflow_name: &str, params: &Params) -> Result<ScheduleRow> {
        let definition = self
            .worker
            .definitions()
            .definition(workflow_name)
            .ok_or_else(|| CoordinatorError::UnknownWorkflow(workflow_name.to_string()))?;
        let checked = check_params(params, &definition).map_err(|e| CoordinatorError::InvalidParams(e.to_string()))?;
        let trigger = schedule.trigger()?;
        let marshalled = serde_json::to_string(params)?;

        let mut tx = self.store.begin().await?;
        let id = queries::create_schedule(&mut *tx, workflow_name, &marshalled, schedule.once(), schedule.spec()).await?;
        let row = queries::schedule(&mut *tx, id)
            .await?
            .ok_or(CoordinatorError::ScheduleNotFound)?;
        let entry = WorkflowSchedule {
            schedule: row.clone(),
            params: Some(checked),
        };
        self.timers.arm(entry, trigger).await?;
        if let Err(e) = tx.commit().await {
            self.timers.disarm(id).await;
            return Err(e.into());
        }

        tracing::info!("📅 Created schedule {} for workflow {} ({:?})", id, workflow_name, schedule);
        Ok(row)
    }

    /// Re-arm every persisted schedule after a restart
    ///
    /// A row that cannot be armed is logged or kept as a failed entry; it
    /// never stops the rows after it.
    pub async fn resume(&self) -> Result<()> {
        let rows = queries::schedules(self.store.pool()).await?;
        let now = Utc::now();
        let mut armed = 0;

        for row in rows {
            if self.timers.live.lock().await.contains_key(&row.id) {
                continue;
            }
            let Some(definition) = self.worker.definitions().definition(&row.workflow_name) else {
                tracing::warn!("⚠️ Unable to schedule {:?} (schedule {}): no definition found", row.workflow_name, row.id);
                continue;
            };
            let schedule = Schedule::from_row(&row);
            if let Schedule::Once(at) = &schedule {
                if *at < now {
                    tracing::info!("⏭️ Skipping one-shot schedule {}: {} is in the past", row.id, at);
                    continue;
                }
            }
            let trigger = match schedule.trigger() {
                Ok(trigger) => trigger,
                Err(e) => {
                    tracing::warn!("⚠️ Unable to schedule {:?} (schedule {}): {}", row.workflow_name, row.id, e);
                    continue;
                }
            };
            let params = match unmarshal_params(&row.workflow_params, &definition) {
                Ok(params) => params,
                Err(e) => {
                    tracing::warn!("⚠️ Schedule {} params no longer match {:?}: {}", row.id, row.workflow_name, e);
                    self.failed.lock().await.push(FailedToScheduleEntry {
                        schedule: WorkflowSchedule { schedule: row, params: None },
                        trigger,
                        error: e.to_string(),
                        last_run: None,
                    });
                    continue;
                }
            };
            let entry = WorkflowSchedule {
                schedule: row,
                params: Some(params),
            };
            if let Err(e) = self.timers.arm(entry.clone(), trigger.clone()).await {
                tracing::error!("❌ Failed to arm schedule {}: {}", entry.id(), e);
                self.failed.lock().await.push(FailedToScheduleEntry {
                    schedule: entry,
                    trigger,
                    error: e.to_string(),
                    last_run: None,
                });
                continue;
            }
            armed += 1;
        }

        let failed = self.failed.lock().await.len();
        tracing::info!("📊 Re-armed {} schedule(s), {} failed", armed, failed);
        Ok(())
    }

    /// Live and failed entries for every workflow
    pub async fn entries(&self) -> (Vec<ScheduleEntry>, Vec<FailedToScheduleEntry>) {
        self.entries_for(&[]).await
    }

    /// Live and failed entries for the named workflows; empty means all
    pub async fn entries_for(&self, workflow_names: &[&str]) -> (Vec<ScheduleEntry>, Vec<FailedToScheduleEntry>) {
        let last_runs = match queries::schedules_last_run(self.store.pool()).await {
            Ok(last_runs) => last_runs,
            Err(e) => {
                tracing::error!("❌ schedules_last_run failed: {}", e);
                HashMap::new()
            }
        };
        let wanted = |name: &str| workflow_names.is_empty() || workflow_names.contains(&name);
        let now = Utc::now();

        let entries = self
            .timers
            .live
            .lock()
            .await
            .values()
            .filter(|e| wanted(e.schedule.schedule.workflow_name.as_str()))
            .map(|e| ScheduleEntry {
                schedule: e.schedule.clone(),
                next: e.trigger.next_after(now),
                last_run: last_runs.get(&e.schedule.id()).cloned(),
            })
            .collect();
        let failed = self
            .failed
            .lock()
            .await
            .iter()
            .filter(|e| wanted(e.schedule.schedule.workflow_name.as_str()))
            .map(|e| FailedToScheduleEntry {
                last_run: last_runs.get(&e.schedule.id()).cloned(),
                ..e.clone()
            })
            .collect();
        (entries, failed)
    }

    /// Remove a schedule from memory and the database
    ///
    /// A launch already in progress is not interrupted. Workflows it started
    /// are kept but no longer reference the schedule.
    pub async fn delete(&self, id: i64) -> Result<()> {
        if !self.timers.disarm(id).await {
            let mut failed = self.failed.lock().await;
            let index = failed
                .iter()
                .position(|e| e.schedule.id() == id)
                .ok_or(CoordinatorError::ScheduleNotFound)?;
            failed.remove(index);
        }

        let mut tx = self.store.begin().await?;
        queries::clear_workflow_schedule(&mut *tx, id).await?;
        queries::delete_schedule(&mut *tx, id).await?;
        tx.commit().await?;
        tracing::info!("🗑️ Deleted schedule {}", id);
        Ok(())
    }

    /// Stop the cron runtime; armed jobs no longer fire
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("⏹️ Stopping cron runtime");
        self.timers.cron.write().await.shutdown().await?;
        self.timers.live.lock().await.clear();
        Ok(())
    }
}

impl Timers {
    /// Track `entry` as live and arm its first launch
    async fn arm(&self, entry: WorkflowSchedule, trigger: Trigger) -> Result<()> {
        let id = entry.id();
        let first = match &trigger {
            Trigger::Once(once) => Some(once.at),
            Trigger::Cron(_) => trigger.next_after(Utc::now()),
        };
        // Held until the entry is in place, so an immediate launch sees it.
        let mut live = self.live.lock().await;
        let job = match first {
            Some(at) => Some(self.cron.read().await.add(self.launch_job(id, at)?).await?),
            None => None,
        };
        live.insert(id, LiveEntry { job, schedule: entry, trigger });
        tracing::debug!("📝 Armed schedule {} ({:?})", id, first);
        Ok(())
    }

    /// Forget a live schedule and drop its pending launch; false if not live
    async fn disarm(&self, id: i64) -> bool {
        let Some(entry) = self.live.lock().await.remove(&id) else {
            return false;
        };
        if let Some(job) = entry.job {
            if let Err(e) = self.cron.read().await.remove(&job).await {
                tracing::warn!("⚠️ Failed to remove job for schedule {}: {}", id, e);
            }
        }
        true
    }

    fn launch_job(&self, id: i64, at: DateTime<Utc>) -> Result<Job> {
        let delay = (at - Utc::now()).to_std().unwrap_or_default();
        let timers = self.clone();
        let job = Job::new_one_shot_async(delay, move |job, _l| {
            let timers = timers.clone();
            Box::pin(async move { timers.launch(id, job, at).await })
        })?;
        Ok(job)
    }

    /// Run by the one-shot job armed for `at`
    async fn launch(&self, id: i64, job: Uuid, at: DateTime<Utc>) {
        let (name, params) = {
            let mut live = self.live.lock().await;
            let Some(entry) = live.get_mut(&id) else {
                return;
            };
            // Deleted and re-created, or superseded by a newer launch.
            if entry.job != Some(job) {
                return;
            }
            entry.job = None;
            if let Some(next) = next_launch(&entry.trigger, at, Utc::now()) {
                match self.launch_job(id, next) {
                    Ok(next_job) => match self.cron.read().await.add(next_job).await {
                        Ok(uuid) => entry.job = Some(uuid),
                        Err(e) => tracing::error!("❌ Failed to re-arm schedule {}: {}", id, e),
                    },
                    Err(e) => tracing::error!("❌ Failed to re-arm schedule {}: {}", id, e),
                }
            }
            (
                entry.schedule.schedule.workflow_name.clone(),
                entry.schedule.params.clone().unwrap_or_default(),
            )
        };
        fire(&self.worker, id, &name, &params).await;
    }
}

/// The launch that follows one armed for `fired`
///
/// Launches missed while the process was busy or asleep are skipped.
fn next_launch(trigger: &Trigger, fired: DateTime<Utc>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match trigger {
        Trigger::Once(_) => None,
        Trigger::Cron(_) => trigger.next_after(fired.max(now)),
    }
}

async fn fire(worker: &Worker, schedule_id: i64, name: &str, params: &Params) {
    tracing::debug!("🔔 Schedule {} fired for workflow {}", schedule_id, name);
    match worker.start_workflow(name, params, Some(schedule_id)).await {
        Ok(id) => tracing::info!("🚀 Schedule {} started workflow {} ({})", schedule_id, name, id),
        Err(e) => tracing::error!("❌ Schedule {} failed to start workflow {}: {}", schedule_id, name, e),
    }
}
