//! Executing one job end to end.

use std::sync::{atomic::Ordering, Arc};

use chrono::Local;

use super::{CurrentJob, Fabricator, FabricatorStatus};
use crate::{
    error::ProtocolError,
    job::estimate,
    protocol::{send_command, strip_comment},
    Connection, Event, FabricatorError, Issue, JobId, JobStatus, SharedJob,
};

// How a job that didn't fail ended.
enum Outcome {
    Complete,
    Cancelled,
}

impl Fabricator {
    /// Pop the head of the queue and print it.
    ///
    /// Returns `Ok(None)` when nothing is queued, and the job id when it
    /// completed or was cancelled. A failed job is marked `error` with an
    /// Issue, is not requeued, and its failure is returned. The link is
    /// closed before this returns, whatever the outcome.
    pub async fn print_next_in_queue(&self) -> Result<Option<JobId>, FabricatorError> {
        let status = self.status();
        if status != FabricatorStatus::Ready {
            return Err(FabricatorError::InvalidState {
                status,
                action: "start a job",
            });
        }
        let Some(job) = self.queue.lock().await.pop() else {
            return Ok(None);
        };
        self.print_job(job).await.map(Some)
    }

    async fn print_job(&self, job: SharedJob) -> Result<JobId, FabricatorError> {
        let job_id = job.lock().await.id();
        tracing::info!(fabricator = self.id.0, job_id = job_id.0, "starting job");

        self.cancel_requested.store(false, Ordering::SeqCst);
        *self.current.lock().await = Some(CurrentJob {
            id: job_id,
            job: Arc::downgrade(&job),
        });

        let mut slot = self.connection.lock().await;
        let conn = match slot.take() {
            Some(conn) => Ok(conn),
            None => self
                .ctx
                .ports
                .open(self.device_path(), self.baud())
                .await
                .map_err(|e| FabricatorError::connection(self.device_path(), e)),
        };
        let result = match conn {
            Ok(mut conn) => {
                let result = self.run_job(&mut conn, &job).await;
                if let Err(e) = conn.close().await {
                    tracing::debug!(error = format!("{:?}", e), "closing link failed");
                }
                result
            }
            Err(e) => Err(e),
        };
        drop(slot);

        self.finish_job(&job, result).await
    }

    async fn run_job(&self, conn: &mut Connection, job: &SharedJob) -> Result<Outcome, FabricatorError> {
        let gcode = job.lock().await.gcode()?;

        self.set_job_status(&mut *job.lock().await, JobStatus::Printing).await;
        self.set_status(FabricatorStatus::Printing);

        self.reset_on(conn, false).await?;

        let table = self.profile.table();
        let estimate = estimate::time_from_gcode(&gcode).unwrap_or_default();
        if table.begin_timing.is_none() {
            self.start_clock(job, estimate).await;
        }

        let lines: Vec<&str> = gcode.lines().filter_map(strip_comment).collect();
        let total = lines.len().max(1) as f64;
        let mut last_percent = 0;

        for (sent, line) in lines.iter().enumerate() {
            if self.hold_if_paused(job).await {
                self.abort_on(conn).await;
                return Ok(Outcome::Cancelled);
            }

            let line = table.limit_feed_rate(line);
            send_command(conn, table, &self.ctx.timeouts, &line).await?;

            if table.is_begin_timing(&line) && !job.lock().await.time_started() {
                self.start_clock(job, estimate).await;
            }
            self.advance(job, (sent + 1) as f64 / total, &mut last_percent).await;
        }

        for line in &table.shutdown {
            self.send(conn, line).await?;
        }
        Ok(Outcome::Complete)
    }

    // Returns true when the job should be cancelled instead.
    async fn hold_if_paused(&self, job: &SharedJob) -> bool {
        loop {
            if self.cancel_requested.load(Ordering::SeqCst) {
                return true;
            }
            if !job.lock().await.paused() {
                return false;
            }
            tracing::debug!(fabricator = self.id.0, "holding at line boundary");
            self.resumed.notified().await;
        }
    }

    async fn abort_on(&self, conn: &mut Connection) {
        let table = self.profile.table();
        for line in std::iter::once(&table.cancel).chain(table.shutdown.iter()) {
            if let Err(e) = self.send(conn, line).await {
                tracing::warn!(
                    fabricator = self.id.0,
                    command = line,
                    error = format!("{:?}", e),
                    "cancel sequence command failed"
                );
            }
        }
    }

    async fn start_clock(&self, job: &SharedJob, estimate: u64) {
        let mut job = job.lock().await;
        job.start_clock(Local::now(), estimate);
        self.ctx.events.emit_times(job.id(), job.time());
    }

    async fn advance(&self, job: &SharedJob, progress: f64, last_percent: &mut u32) {
        let mut job = job.lock().await;
        if !job.set_progress(progress) {
            return;
        }
        self.ctx.events.emit(Event::ProgressUpdate {
            job_id: job.id(),
            progress: job.progress(),
        });

        let percent = (job.progress() * 100.0).floor() as u32;
        if percent == *last_percent {
            return;
        }
        *last_percent = percent;
        if let Err(e) = self.ctx.gateway.update_job_progress(job.id(), job.progress()).await {
            tracing::warn!(job_id = job.id().0, error = format!("{:?}", e), "failed to persist progress");
        }
    }

    async fn finish_job(&self, job: &SharedJob, result: Result<Outcome, FabricatorError>) -> Result<JobId, FabricatorError> {
        let mut guard = job.lock().await;
        let job_id = guard.id();
        guard.set_paused(false);

        match result {
            Ok(Outcome::Complete) => {
                self.set_status(FabricatorStatus::Complete);
                self.set_job_status(&mut guard, JobStatus::Complete).await;
                drop(guard);
                *self.current.lock().await = None;

                tracing::info!(fabricator = self.id.0, job_id = job_id.0, "job complete");
                self.set_status(FabricatorStatus::Ready);
                Ok(job_id)
            }
            Ok(Outcome::Cancelled) => {
                self.set_job_status(&mut guard, JobStatus::Error).await;
                let issue = self.record_issue(Issue::new("cancelled by operator", Some(job_id))).await;
                guard.set_issue(issue);
                drop(guard);
                *self.current.lock().await = None;

                tracing::info!(fabricator = self.id.0, job_id = job_id.0, "job cancelled");
                self.set_status(FabricatorStatus::Ready);
                Ok(job_id)
            }
            Err(e) => {
                tracing::warn!(
                    fabricator = self.id.0,
                    job_id = job_id.0,
                    error = format!("{:?}", e),
                    "job failed"
                );
                let next = if link_lost(&e) {
                    FabricatorStatus::Offline
                } else {
                    FabricatorStatus::Error
                };
                self.set_status(next);
                self.set_job_status(&mut guard, JobStatus::Error).await;
                let issue = self.record_issue(Issue::new(e.to_string(), Some(job_id))).await;
                guard.set_issue(issue);
                Err(e)
            }
        }
    }
}

fn link_lost(e: &FabricatorError) -> bool {
    matches!(
        e,
        FabricatorError::Connection { .. } | FabricatorError::Protocol(ProtocolError::Closed { .. })
    )
}
