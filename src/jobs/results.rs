use super::{GroupId, Job, JobId, JobOutput};
use crate::error::AppError;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", content = "detail", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Pending,
    Retry(u32),
    Success(JobOutput),
    Failure(String),
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Success(_) | JobState::Failure(_))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChildStatus {
    pub job_id: JobId,
    pub state: JobState,
}

/// Snapshot of a job group as restored from the backend.
#[derive(Debug, Clone, Serialize)]
pub struct GroupResult {
    pub id: GroupId,
    pub expected_count: usize,
    pub children: Vec<ChildStatus>,
}

impl GroupResult {
    pub fn is_complete(&self) -> bool {
        self.children.iter().all(|c| c.state.is_terminal())
    }

    pub fn has_failures(&self) -> bool {
        self.children
            .iter()
            .any(|c| matches!(c.state, JobState::Failure(_) | JobState::Retry(_)))
    }
}

/// Durable copy of job outcomes, read back when a handle is no longer held in memory.
#[async_trait]
pub trait ResultArchive: Send + Sync {
    async fn create_group(&self, group_id: GroupId, children: &[JobId]) -> Result<(), AppError>;
    /// Upserts the state of a job, standalone or member of `group_id`.
    async fn save_state(
        &self,
        group_id: Option<GroupId>,
        job_id: JobId,
        state: &JobState,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), AppError>;
    /// Starts the retention window of a finished group.
    async fn complete_group(&self, group_id: GroupId, expires_at: DateTime<Utc>) -> Result<(), AppError>;
    async fn load_group(
        &self,
        group_id: GroupId,
    ) -> Result<Option<(GroupResult, Option<DateTime<Utc>>)>, AppError>;
    async fn load_job(&self, job_id: JobId) -> Result<Option<(JobState, Option<DateTime<Utc>>)>, AppError>;
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, AppError>;
    /// Fails every job left unfinished by a previous process and closes its group.
    async fn abandon_unfinished(&self, expires_at: DateTime<Utc>) -> Result<usize, AppError>;
}

struct GroupRecord {
    expected_count: usize,
    children: Vec<JobId>,
    states: HashMap<JobId, JobState>,
    callback: Option<Job>,
    sealed: bool,
    expires_at: Option<DateTime<Utc>>,
}

/// What a state change released: the group callback and, when the group
/// just finished, the start of its retention window.
#[derive(Default)]
struct Released {
    callback: Option<Job>,
    completed: Option<DateTime<Utc>>,
}

impl GroupRecord {
    fn is_complete(&self) -> bool {
        self.states.values().all(JobState::is_terminal)
    }

    /// Hands out the callback once the barrier is sealed and every child is terminal.
    fn release(&mut self, retention: Duration) -> Released {
        if !self.sealed || !self.is_complete() {
            return Released::default();
        }
        let mut released = Released::default();
        if self.expires_at.is_none() {
            let expires_at = Utc::now() + retention;
            self.expires_at = Some(expires_at);
            released.completed = Some(expires_at);
        }
        released.callback = self.callback.take();
        released
    }

    fn snapshot(&self, id: GroupId) -> GroupResult {
        GroupResult {
            id,
            expected_count: self.expected_count,
            children: self
                .children
                .iter()
                .map(|job_id| ChildStatus {
                    job_id: *job_id,
                    state: self.states.get(job_id).cloned().unwrap_or(JobState::Pending),
                })
                .collect(),
        }
    }
}

struct JobRecord {
    state: JobState,
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Records {
    groups: HashMap<GroupId, GroupRecord>,
    jobs: HashMap<JobId, JobRecord>,
}

fn is_expired(expires_at: Option<DateTime<Utc>>) -> bool {
    expires_at.map_or(false, |at| at <= Utc::now())
}

/// Keeps per-child outcomes of job groups for a limited time after they finish.
///
/// Join barriers live in memory; outcomes are written through to the archive
/// when one is configured, so handles still resolve after a restart.
pub struct ResultBackend {
    records: Mutex<Records>,
    retention: Duration,
    archive: Option<Arc<dyn ResultArchive>>,
}

impl ResultBackend {
    pub fn new(retention: Duration, archive: Option<Arc<dyn ResultArchive>>) -> Self {
        Self {
            records: Mutex::new(Records::default()),
            retention,
            archive,
        }
    }

    pub async fn register_group(
        &self,
        group_id: GroupId,
        children: Vec<JobId>,
        callback: Option<Job>,
    ) -> Result<Option<Job>, AppError> {
        if let Some(archive) = &self.archive {
            archive.create_group(group_id, &children).await?;
        }
        let released = {
            let mut records = self.records.lock()?;
            let sealed = callback.is_none();
            let mut record = GroupRecord {
                expected_count: children.len(),
                states: children.iter().map(|id| (*id, JobState::Pending)).collect(),
                children,
                callback,
                sealed,
                expires_at: None,
            };
            let released = record.release(self.retention);
            records.groups.insert(group_id, record);
            released
        };
        self.archive_completion(group_id, &released).await?;
        Ok(released.callback)
    }

    pub async fn register_job(&self, job_id: JobId) -> Result<(), AppError> {
        {
            let mut records = self.records.lock()?;
            records.jobs.insert(
                job_id,
                JobRecord {
                    state: JobState::Pending,
                    expires_at: None,
                },
            );
        }
        if let Some(archive) = &self.archive {
            archive.save_state(None, job_id, &JobState::Pending, None).await?;
        }
        Ok(())
    }

    /// Opens the join barrier of a group. Returns its callback if every child already finished.
    pub async fn seal(&self, group_id: GroupId) -> Result<Option<Job>, AppError> {
        let released = {
            let mut records = self.records.lock()?;
            match records.groups.get_mut(&group_id) {
                Some(record) => {
                    record.sealed = true;
                    record.release(self.retention)
                }
                None => return Err(AppError::NotFound(format!("job group {}", group_id))),
            }
        };
        self.archive_completion(group_id, &released).await?;
        Ok(released.callback)
    }

    /// Records the state of a job. For group members, returns the group callback
    /// when this update completed the group.
    pub async fn record(
        &self,
        group_id: Option<GroupId>,
        job_id: JobId,
        state: JobState,
    ) -> Result<Option<Job>, AppError> {
        let retention = self.retention;
        let job_expiry = state.is_terminal().then(|| Utc::now() + retention);
        let released = {
            let mut records = self.records.lock()?;
            match group_id {
                Some(group_id) => match records.groups.get_mut(&group_id) {
                    Some(group) => {
                        group.states.insert(job_id, state.clone());
                        group.release(retention)
                    }
                    None => {
                        log::warn!("Result for job {} of unknown group {}", job_id, group_id);
                        Released::default()
                    }
                },
                None => {
                    records.jobs.insert(
                        job_id,
                        JobRecord {
                            state: state.clone(),
                            expires_at: job_expiry,
                        },
                    );
                    Released::default()
                }
            }
        };

        if let Some(archive) = &self.archive {
            let expires_at = if group_id.is_some() { None } else { job_expiry };
            archive.save_state(group_id, job_id, &state, expires_at).await?;
        }
        if let Some(group_id) = group_id {
            self.archive_completion(group_id, &released).await?;
        }
        Ok(released.callback)
    }

    async fn archive_completion(&self, group_id: GroupId, released: &Released) -> Result<(), AppError> {
        match (&self.archive, released.completed) {
            (Some(archive), Some(expires_at)) => archive.complete_group(group_id, expires_at).await,
            _ => Ok(()),
        }
    }

    /// Restores a group by handle. `None` when the handle is unknown or its
    /// retention window has passed.
    pub async fn restore_group(&self, group_id: GroupId) -> Result<Option<GroupResult>, AppError> {
        {
            let mut records = self.records.lock()?;
            if let Some(group) = records.groups.get(&group_id) {
                if !is_expired(group.expires_at) {
                    return Ok(Some(group.snapshot(group_id)));
                }
                records.groups.remove(&group_id);
                return Ok(None);
            }
        }
        match &self.archive {
            Some(archive) => Ok(archive
                .load_group(group_id)
                .await?
                .filter(|(_, expires_at)| !is_expired(*expires_at))
                .map(|(group, _)| group)),
            None => Ok(None),
        }
    }

    pub async fn job_state(&self, job_id: JobId) -> Result<Option<JobState>, AppError> {
        {
            let mut records = self.records.lock()?;
            if let Some(job) = records.jobs.get(&job_id) {
                if !is_expired(job.expires_at) {
                    return Ok(Some(job.state.clone()));
                }
                records.jobs.remove(&job_id);
                return Ok(None);
            }
        }
        match &self.archive {
            Some(archive) => Ok(archive
                .load_job(job_id)
                .await?
                .filter(|(_, expires_at)| !is_expired(*expires_at))
                .map(|(state, _)| state)),
            None => Ok(None),
        }
    }

    /// Drops every finished record whose retention window has passed.
    pub async fn purge_expired(&self) -> Result<usize, AppError> {
        let now = Utc::now();
        let purged = {
            let mut records = self.records.lock()?;
            let before = records.groups.len() + records.jobs.len();
            records
                .groups
                .retain(|_, g| g.expires_at.map_or(true, |at| at > now));
            records
                .jobs
                .retain(|_, j| j.expires_at.map_or(true, |at| at > now));
            before - records.groups.len() - records.jobs.len()
        };
        match &self.archive {
            Some(archive) => Ok(purged.max(archive.purge_expired(now).await?)),
            None => Ok(purged),
        }
    }

    /// Closes out jobs a previous process left unfinished. Their queue did not survive it.
    pub async fn recover(&self) -> Result<usize, AppError> {
        match &self.archive {
            Some(archive) => archive.abandon_unfinished(Utc::now() + self.retention).await,
            None => Ok(0),
        }
    }
}
