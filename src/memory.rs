//! In-process [PersistenceGateway]. Nothing survives a restart.

use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicBool, Ordering},
};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Local};
use tokio::sync::Mutex;

use crate::{
    fabricator::FabricatorRecord,
    job::{JobRecord, NewJob, SCRUBBED_SUFFIX},
    FabricatorId, Issue, IssueId, JobId, JobStatus, PersistenceGateway,
};

#[derive(Debug, Default)]
struct State {
    fabricators: BTreeMap<FabricatorId, FabricatorRecord>,
    jobs: BTreeMap<JobId, JobRecord>,
    issues: BTreeMap<IssueId, Issue>,
}

/// Gateway keeping every record in memory.
#[derive(Debug, Default)]
pub struct MemoryGateway {
    state: Mutex<State>,
    failing: AtomicBool,
}

impl MemoryGateway {
    /// Create an empty gateway.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write fail (or succeed again), as an unreachable database
    /// would.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("gateway unavailable");
        }
        Ok(())
    }

    /// Every stored issue, oldest first.
    pub async fn issues(&self) -> Vec<Issue> {
        self.state.lock().await.issues.values().cloned().collect()
    }

    /// Every registered fabricator.
    pub async fn fabricators(&self) -> Vec<(FabricatorId, FabricatorRecord)> {
        let state = self.state.lock().await;
        state
            .fabricators
            .iter()
            .map(|(id, record)| (*id, record.clone()))
            .collect()
    }
}

#[async_trait]
impl PersistenceGateway for MemoryGateway {
    async fn register_fabricator(&self, fabricator: &FabricatorRecord) -> Result<FabricatorId> {
        self.check()?;
        let mut state = self.state.lock().await;
        if let Some((id, _)) = state
            .fabricators
            .iter()
            .find(|(_, known)| known.hardware_id == fabricator.hardware_id)
        {
            return Ok(*id);
        }
        let id = FabricatorId(state.fabricators.keys().last().map(|id| id.0 + 1).unwrap_or(1));
        state.fabricators.insert(id, fabricator.clone());
        Ok(id)
    }

    async fn insert_job(&self, job: NewJob) -> Result<JobId> {
        self.check()?;
        let mut state = self.state.lock().await;
        let id = JobId(state.jobs.keys().last().map(|id| id.0 + 1).unwrap_or(1));
        state.jobs.insert(
            id,
            JobRecord {
                id,
                fabricator_id: job.fabricator_id,
                name: job.name,
                file_name_original: job.file_name_original,
                payload: Some(job.payload),
                status: job.status,
                progress: 0.0,
                favorite: job.favorite,
                issue_id: None,
                submitted_at: Local::now(),
            },
        );
        Ok(id)
    }

    async fn update_job_status(&self, job_id: JobId, status: JobStatus) -> Result<()> {
        self.check()?;
        let mut state = self.state.lock().await;
        let Some(job) = state.jobs.get_mut(&job_id) else {
            anyhow::bail!("no job {}", job_id);
        };
        job.status = status;
        Ok(())
    }

    async fn update_job_progress(&self, job_id: JobId, progress: f64) -> Result<()> {
        self.check()?;
        let mut state = self.state.lock().await;
        let Some(job) = state.jobs.get_mut(&job_id) else {
            anyhow::bail!("no job {}", job_id);
        };
        job.progress = progress;
        Ok(())
    }

    async fn queue_snapshot(&self, fabricator_id: FabricatorId) -> Result<Vec<JobRecord>> {
        self.check()?;
        let state = self.state.lock().await;
        Ok(state
            .jobs
            .values()
            .filter(|job| job.fabricator_id == Some(fabricator_id))
            .cloned()
            .collect())
    }

    async fn record_issue(&self, issue: &Issue) -> Result<IssueId> {
        self.check()?;
        let mut state = self.state.lock().await;
        let id = IssueId(state.issues.keys().last().map(|id| id.0 + 1).unwrap_or(1));
        state.issues.insert(
            id,
            Issue {
                id: Some(id),
                ..issue.clone()
            },
        );
        if let Some(job) = issue.job_id.and_then(|job_id| state.jobs.get_mut(&job_id)) {
            job.issue_id = Some(id);
        }
        Ok(id)
    }

    async fn find_job(&self, job_id: JobId) -> Result<Option<JobRecord>> {
        self.check()?;
        Ok(self.state.lock().await.jobs.get(&job_id).cloned())
    }

    async fn delete_job(&self, job_id: JobId) -> Result<()> {
        self.check()?;
        if self.state.lock().await.jobs.remove(&job_id).is_none() {
            anyhow::bail!("no job {}", job_id);
        }
        Ok(())
    }

    async fn set_favorite(&self, job_id: JobId, favorite: bool) -> Result<()> {
        self.check()?;
        let mut state = self.state.lock().await;
        let Some(job) = state.jobs.get_mut(&job_id) else {
            anyhow::bail!("no job {}", job_id);
        };
        job.favorite = favorite;
        Ok(())
    }

    async fn clear_space(&self, cutoff: DateTime<Local>) -> Result<usize> {
        self.check()?;
        let mut state = self.state.lock().await;
        let mut scrubbed = 0;
        for job in state.jobs.values_mut() {
            if job.favorite || !job.status.is_terminal() || job.submitted_at >= cutoff || job.payload.is_none() {
                continue;
            }
            job.payload = None;
            if !job.file_name_original.contains(SCRUBBED_SUFFIX) {
                job.file_name_original.push_str(SCRUBBED_SUFFIX);
            }
            scrubbed += 1;
        }
        Ok(scrubbed)
    }
}
