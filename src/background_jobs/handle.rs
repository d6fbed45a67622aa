use super::job::{BackgroundJob, JobError, JobSchedule};
use crate::server_store::{JobAuditEntry, JobRun, ServerStore};
use anyhow::Result;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, RwLock};

/// Snapshot of a registered job, as printed by the CLI.
#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    pub id: String,
    pub name: String,
    pub description: String,
    pub schedule: JobScheduleInfo,
    pub is_running: bool,
    pub last_run: Option<JobRunInfo>,
    pub next_run_at: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobScheduleInfo {
    #[serde(rename = "type")]
    pub schedule_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hooks: Option<Vec<String>>,
}

impl From<JobSchedule> for JobScheduleInfo {
    fn from(schedule: JobSchedule) -> Self {
        match schedule {
            JobSchedule::Interval(duration) => JobScheduleInfo {
                schedule_type: "interval".to_string(),
                interval_secs: Some(duration.as_secs()),
                hooks: None,
            },
            JobSchedule::Hook(event) => JobScheduleInfo {
                schedule_type: "hook".to_string(),
                interval_secs: None,
                hooks: Some(vec![event.to_string()]),
            },
            JobSchedule::Combined { interval, hooks } => JobScheduleInfo {
                schedule_type: "combined".to_string(),
                interval_secs: interval.map(|d| d.as_secs()),
                hooks: Some(hooks.iter().map(|h| h.to_string()).collect()),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobRunInfo {
    pub started_at: String,
    pub finished_at: Option<String>,
    pub status: String,
    pub error_message: Option<String>,
    pub triggered_by: String,
}

impl From<JobRun> for JobRunInfo {
    fn from(run: JobRun) -> Self {
        JobRunInfo {
            started_at: run.started_at.to_rfc3339(),
            finished_at: run.finished_at.map(|dt| dt.to_rfc3339()),
            status: run.status.as_str().to_string(),
            error_message: run.error_message,
            triggered_by: run.triggered_by,
        }
    }
}

pub enum SchedulerCommand {
    TriggerJob {
        job_id: String,
        response: oneshot::Sender<Result<(), JobError>>,
    },
}

/// State shared between the scheduler loop and its handles.
pub struct SharedJobState {
    pub jobs: HashMap<String, Arc<dyn BackgroundJob>>,
    pub running_jobs: HashSet<String>,
}

/// Cloneable handle for inspecting and triggering jobs while the scheduler
/// loop owns the execution side.
#[derive(Clone)]
pub struct SchedulerHandle {
    command_tx: mpsc::Sender<SchedulerCommand>,
    shared_state: Arc<RwLock<SharedJobState>>,
    server_store: Arc<dyn ServerStore>,
}

impl SchedulerHandle {
    pub fn new(
        command_tx: mpsc::Sender<SchedulerCommand>,
        shared_state: Arc<RwLock<SharedJobState>>,
        server_store: Arc<dyn ServerStore>,
    ) -> Self {
        Self {
            command_tx,
            shared_state,
            server_store,
        }
    }

    fn job_info(
        &self,
        job_id: &str,
        job: &Arc<dyn BackgroundJob>,
        is_running: bool,
    ) -> Result<JobInfo> {
        let last_run = self
            .server_store
            .get_last_run(job_id)?
            .map(JobRunInfo::from);
        let next_run_at = self
            .server_store
            .get_schedule_state(job_id)?
            .map(|s| s.next_run_at.to_rfc3339());

        Ok(JobInfo {
            id: job_id.to_string(),
            name: job.name().to_string(),
            description: job.description().to_string(),
            schedule: job.schedule().into(),
            is_running,
            last_run,
            next_run_at,
        })
    }

    /// All registered jobs, sorted by id.
    pub async fn list_jobs(&self) -> Result<Vec<JobInfo>> {
        let state = self.shared_state.read().await;
        let mut jobs = state
            .jobs
            .iter()
            .map(|(job_id, job)| self.job_info(job_id, job, state.running_jobs.contains(job_id)))
            .collect::<Result<Vec<_>>>()?;

        jobs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(jobs)
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Option<JobInfo>> {
        let state = self.shared_state.read().await;
        match state.jobs.get(job_id) {
            Some(job) => Ok(Some(self.job_info(
                job_id,
                job,
                state.running_jobs.contains(job_id),
            )?)),
            None => Ok(None),
        }
    }

    /// Ask the scheduler loop to start a job now.
    pub async fn trigger_job(&self, job_id: &str) -> Result<(), JobError> {
        let (response_tx, response_rx) = oneshot::channel();

        self.command_tx
            .send(SchedulerCommand::TriggerJob {
                job_id: job_id.to_string(),
                response: response_tx,
            })
            .await
            .map_err(|_| JobError::ExecutionFailed("Scheduler not available".to_string()))?;

        response_rx
            .await
            .map_err(|_| JobError::ExecutionFailed("Scheduler did not respond".to_string()))?
    }

    pub fn get_job_history(&self, job_id: &str, limit: usize) -> Result<Vec<JobRunInfo>> {
        let history = self.server_store.get_job_history(job_id, limit)?;
        Ok(history.into_iter().map(JobRunInfo::from).collect())
    }

    pub async fn is_job_running(&self, job_id: &str) -> bool {
        self.shared_state.read().await.running_jobs.contains(job_id)
    }

    pub async fn job_exists(&self, job_id: &str) -> bool {
        self.shared_state.read().await.jobs.contains_key(job_id)
    }

    pub fn get_job_audit_log_by_job(
        &self,
        job_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<JobAuditEntry>> {
        self.server_store
            .get_job_audit_log_by_job(job_id, limit, offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::background_jobs::job::HookEvent;
    use crate::server_store::JobRunStatus;
    use chrono::{TimeZone, Utc};
    use std::time::Duration;

    #[test]
    fn test_schedule_info_from_interval() {
        let info: JobScheduleInfo = JobSchedule::Interval(Duration::from_secs(3600)).into();
        assert_eq!(info.schedule_type, "interval");
        assert_eq!(info.interval_secs, Some(3600));
        assert!(info.hooks.is_none());
    }

    #[test]
    fn test_schedule_info_from_combined() {
        let info: JobScheduleInfo = JobSchedule::Combined {
            interval: Some(Duration::from_secs(86400)),
            hooks: vec![HookEvent::OnStartup, HookEvent::OnPostsExpired],
        }
        .into();
        assert_eq!(info.schedule_type, "combined");
        assert_eq!(info.interval_secs, Some(86400));
        assert_eq!(
            info.hooks,
            Some(vec!["OnStartup".to_string(), "OnPostsExpired".to_string()])
        );

        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["type"], "combined");
    }

    #[test]
    fn test_schedule_info_hook_only_omits_interval() {
        let info: JobScheduleInfo = JobSchedule::Hook(HookEvent::OnPostsExpired).into();
        let json = serde_json::to_value(&info).unwrap();
        assert!(json.get("interval_secs").is_none());
        assert_eq!(json["hooks"][0], "OnPostsExpired");
    }

    #[test]
    fn test_job_run_info_from_failed_run() {
        let started = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let info = JobRunInfo::from(JobRun {
            id: 1,
            job_id: "index_reconcile".to_string(),
            started_at: started,
            finished_at: Some(started + chrono::Duration::seconds(5)),
            status: JobRunStatus::Failed,
            error_message: Some("Cancelled".to_string()),
            triggered_by: "hook:OnPostsExpired".to_string(),
        });
        assert_eq!(info.status, "failed");
        assert_eq!(info.started_at, "2024-03-01T12:00:00+00:00");
        assert_eq!(info.finished_at.as_deref(), Some("2024-03-01T12:00:05+00:00"));
        assert_eq!(info.error_message.as_deref(), Some("Cancelled"));
    }
}
