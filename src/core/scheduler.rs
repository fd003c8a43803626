//! TransferScheduler: single-flight outbound queue and the session's job
//! bookkeeping.
//!
//! This is a pure state machine: it never touches the channel or spawns
//! anything. Each call returns declarative [`SchedulerAction`]s that the
//! session loop executes (start a pump, publish a job update).
//!
//! Invariants:
//! - at most one job is `sending`;
//! - the active slot stays occupied until its pump reports back, even after
//!   the job was cancelled or re-queued, so two pumps never share the channel;
//! - a terminal status is never changed again, with one exception: an
//!   inbound job failed by a lost channel may be reopened by the sender's
//!   retry of the same id.

use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::core::config::AckTimeoutPolicy;
use crate::core::pipeline::stream::{StreamError, StreamReport};
use crate::core::protocol::frame::FileMeta;
use crate::core::transfer::{Direction, JobTable, TransferJob, TransferStatus};
use crate::utils::sos::SignalOfStop;

// ── Actions ──────────────────────────────────────────────────────────────────

/// Everything the pump needs to send one job.
#[derive(Debug, Clone)]
pub struct SendTicket {
    pub job_id: String,
    /// Distinguishes successive runs of the same job after a re-queue.
    pub generation: u64,
    pub meta: FileMeta,
    pub path: PathBuf,
    pub cancel: SignalOfStop,
}

#[derive(Debug, Clone)]
pub enum SchedulerAction {
    /// Spawn a ChunkStream for this ticket.
    StartSend(SendTicket),
    /// The job changed; publish its new state.
    Updated(String),
}

/// Why a `META` frame was not allowed to open a receive job.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MetaRefused {
    #[error("job {0} is one of our outbound transfers")]
    Outbound(String),
    #[error("job {id} already finished as {status:?}")]
    Finished { id: String, status: TransferStatus },
    #[error("job {0} is complete and being stored")]
    Storing(String),
}

#[derive(Debug)]
struct ActiveSend {
    job_id: String,
    generation: u64,
    cancel: SignalOfStop,
}

// ── Scheduler ────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct TransferScheduler {
    jobs: JobTable,
    queue: VecDeque<String>,
    active: Option<ActiveSend>,
    channel_open: bool,
    generation: u64,
    ack_policy: AckTimeoutPolicy,
    /// Inbound jobs failed by channel loss; the sender may retry these.
    interrupted: HashSet<String>,
    /// Inbound jobs whose payload is complete while the file is written.
    storing: HashSet<String>,
}

impl TransferScheduler {
    pub fn new(ack_policy: AckTimeoutPolicy) -> Self {
        Self {
            jobs: JobTable::default(),
            queue: VecDeque::new(),
            active: None,
            channel_open: false,
            generation: 0,
            ack_policy,
            interrupted: HashSet::new(),
            storing: HashSet::new(),
        }
    }

    pub fn jobs(&self) -> impl Iterator<Item = &TransferJob> {
        self.jobs.iter()
    }

    pub fn job(&self, id: &str) -> Option<&TransferJob> {
        self.jobs.get(id)
    }

    /// Ids waiting to be sent, head first.
    #[cfg(test)]
    pub fn pending(&self) -> impl Iterator<Item = &str> {
        self.queue.iter().map(String::as_str)
    }

    // ── Outbound ─────────────────────────────────────────────────────────

    /// Append an outbound job and start it if the channel is idle.
    pub fn enqueue(&mut self, mut job: TransferJob) -> Vec<SchedulerAction> {
        job.status = TransferStatus::Queued;
        job.sent_bytes = 0;
        let id = job.id.clone();
        info!(event = "job_queued", id = %id, name = %job.name, size = job.size, "File queued");
        self.jobs.upsert(job);
        self.queue.push_back(id.clone());

        let mut actions = vec![SchedulerAction::Updated(id)];
        self.process_next(&mut actions);
        actions
    }

    /// Cancel a queued or active outbound job. Terminal or unknown jobs
    /// are left untouched.
    pub fn cancel(&mut self, id: &str) -> Vec<SchedulerAction> {
        let mut actions = Vec::new();

        if let Some(active) = &self.active
            && active.job_id == id
            && let Some(job) = self.jobs.get_mut(id)
            && job.status == TransferStatus::Sending
        {
            active.cancel.cancel();
            job.status = TransferStatus::Cancelled;
            info!(event = "job_cancelled", id, "Active transfer cancelled");
            actions.push(SchedulerAction::Updated(id.to_string()));
            return actions;
        }

        if let Some(pos) = self.queue.iter().position(|q| q == id) {
            self.queue.remove(pos);
            if let Some(job) = self.jobs.get_mut(id) {
                job.status = TransferStatus::Cancelled;
            }
            info!(event = "job_cancelled", id, "Queued transfer cancelled");
            actions.push(SchedulerAction::Updated(id.to_string()));
            return actions;
        }

        debug!(id, "Cancel ignored, job is neither queued nor sending");
        actions
    }

    /// The data channel opened: start the queue head.
    pub fn channel_opened(&mut self) -> Vec<SchedulerAction> {
        self.channel_open = true;
        let mut actions = Vec::new();
        self.process_next(&mut actions);
        actions
    }

    /// The data channel or the peer connection went away.
    ///
    /// The active outbound job goes back to the head of the queue (it will
    /// restart from byte 0); inbound transfers are lost.
    pub fn channel_lost(&mut self) -> Vec<SchedulerAction> {
        self.channel_open = false;
        let mut actions = Vec::new();

        if let Some(active) = &self.active
            && let Some(job) = self.jobs.get_mut(&active.job_id)
            && job.status == TransferStatus::Sending
        {
            active.cancel.cancel();
            job.status = TransferStatus::Queued;
            job.sent_bytes = 0;
            self.queue.push_front(job.id.clone());
            warn!(event = "job_requeued", id = %job.id, "Channel lost mid-transfer, re-queued at head");
            actions.push(SchedulerAction::Updated(job.id.clone()));
        }

        self.fail_receiving(&mut actions);
        actions
    }

    /// The link is gone for good: every unfinished job fails, except received
    /// files already being written.
    pub fn connection_failed(&mut self) -> Vec<SchedulerAction> {
        self.channel_open = false;
        self.queue.clear();
        if let Some(active) = &self.active {
            active.cancel.cancel();
        }

        let mut actions = Vec::new();
        for job in self.jobs.iter_mut() {
            if !job.status.is_terminal() && !self.storing.contains(&job.id) {
                job.status = TransferStatus::Error;
                actions.push(SchedulerAction::Updated(job.id.clone()));
            }
        }
        warn!(event = "jobs_failed", count = actions.len(), "Connection failed, unfinished jobs marked as error");
        actions
    }

    /// Stop the running pump without changing any job (session shutdown).
    pub fn shutdown(&mut self) {
        if let Some(active) = &self.active {
            active.cancel.cancel();
        }
    }

    pub fn send_progress(&mut self, generation: u64, sent: u64) -> Vec<SchedulerAction> {
        let Some(active) = self.active.as_ref().filter(|a| a.generation == generation) else {
            return Vec::new();
        };
        match self.jobs.get_mut(&active.job_id) {
            Some(job) if job.status == TransferStatus::Sending => {
                job.sent_bytes = sent.min(job.size);
                vec![SchedulerAction::Updated(job.id.clone())]
            }
            _ => Vec::new(),
        }
    }

    /// The pump of `generation` returned. Frees the active slot and starts
    /// the next job.
    pub fn send_finished(
        &mut self,
        generation: u64,
        result: Result<StreamReport, StreamError>,
    ) -> Vec<SchedulerAction> {
        let Some(active) = self.active.take_if(|a| a.generation == generation) else {
            debug!(generation, "Ignoring report from a stale pump");
            return Vec::new();
        };

        let mut actions = Vec::new();
        if let Some(job) = self.jobs.get_mut(&active.job_id)
            && job.status == TransferStatus::Sending
        {
            match result {
                Ok(report) if report.acknowledged || self.ack_policy == AckTimeoutPolicy::AssumeDelivered => {
                    job.status = TransferStatus::Completed;
                    job.sent_bytes = job.size;
                    info!(
                        event = "job_completed",
                        id = %job.id,
                        acknowledged = report.acknowledged,
                        "Transfer completed"
                    );
                }
                Ok(_) => {
                    job.status = TransferStatus::Error;
                    warn!(event = "job_unacknowledged", id = %job.id, "Receiver never acknowledged");
                }
                Err(StreamError::Cancelled) => {
                    job.status = TransferStatus::Cancelled;
                }
                Err(StreamError::ChannelClosed) => {
                    job.status = TransferStatus::Queued;
                    job.sent_bytes = 0;
                    self.queue.push_front(job.id.clone());
                    self.channel_open = false;
                    warn!(event = "job_requeued", id = %job.id, "Channel closed under the pump, re-queued at head");
                }
                Err(e) => {
                    job.status = TransferStatus::Error;
                    warn!(event = "job_failed", id = %job.id, error = %e, "Transfer failed");
                }
            }
            actions.push(SchedulerAction::Updated(job.id.clone()));
        }

        self.process_next(&mut actions);
        actions
    }

    fn process_next(&mut self, actions: &mut Vec<SchedulerAction>) {
        if !self.channel_open || self.active.is_some() {
            return;
        }

        while let Some(id) = self.queue.pop_front() {
            let Some(job) = self.jobs.get_mut(&id) else {
                continue;
            };
            if job.status != TransferStatus::Queued {
                continue;
            }
            let Direction::Outbound { path } = &job.direction else {
                continue;
            };

            job.status = TransferStatus::Sending;
            job.sent_bytes = 0;
            self.generation += 1;
            let ticket = SendTicket {
                job_id: id.clone(),
                generation: self.generation,
                meta: job.meta(),
                path: path.clone(),
                cancel: SignalOfStop::new(),
            };
            self.active = Some(ActiveSend {
                job_id: id.clone(),
                generation: ticket.generation,
                cancel: ticket.cancel.clone(),
            });
            debug!(id = %id, generation = ticket.generation, "Starting next transfer");
            actions.push(SchedulerAction::Updated(id));
            actions.push(SchedulerAction::StartSend(ticket));
            return;
        }
    }

    // ── Inbound ──────────────────────────────────────────────────────────

    /// A `META` frame opened a receive assembly.
    ///
    /// A fresh id opens a new job and a restart of the job being received
    /// resets it. An id that names one of our outbound jobs, or an inbound
    /// job that already finished, is refused. The only finished job that
    /// may be reopened is an inbound one that failed because the channel
    /// went away mid-transfer.
    pub fn inbound_opened(&mut self, meta: &FileMeta) -> Result<Vec<SchedulerAction>, MetaRefused> {
        if self.storing.contains(&meta.id) {
            return Err(MetaRefused::Storing(meta.id.clone()));
        }
        if let Some(job) = self.jobs.get(&meta.id) {
            if job.is_outbound() {
                return Err(MetaRefused::Outbound(meta.id.clone()));
            }
            let retry = job.status == TransferStatus::Error && self.interrupted.remove(&meta.id);
            if job.status.is_terminal() && !retry {
                return Err(MetaRefused::Finished {
                    id: meta.id.clone(),
                    status: job.status,
                });
            }
            if retry {
                info!(event = "inbound_retry", id = %meta.id, "Sender retried an interrupted transfer");
            }
        }
        self.jobs.upsert(TransferJob::inbound(meta));
        Ok(vec![SchedulerAction::Updated(meta.id.clone())])
    }

    pub fn inbound_progress(&mut self, id: &str, received: u64) -> Vec<SchedulerAction> {
        match self.jobs.get_mut(id) {
            Some(job) if job.status == TransferStatus::Receiving => {
                job.recv_bytes = received.min(job.size);
                vec![SchedulerAction::Updated(id.to_string())]
            }
            _ => Vec::new(),
        }
    }

    /// The payload is complete and the file is being written. Channel loss
    /// no longer fails the job; [`Self::inbound_finished`] settles it.
    pub fn inbound_assembled(&mut self, id: &str) {
        if let Some(job) = self.jobs.get_mut(id)
            && job.status == TransferStatus::Receiving
        {
            job.recv_bytes = job.size;
            self.storing.insert(id.to_string());
        }
    }

    /// The receive assembly closed with `status`.
    pub fn inbound_finished(&mut self, id: &str, status: TransferStatus) -> Vec<SchedulerAction> {
        self.storing.remove(id);
        let mut actions = Vec::new();
        self.finish_inbound(id, status, &mut actions);
        actions
    }

    fn finish_inbound(&mut self, id: &str, status: TransferStatus, actions: &mut Vec<SchedulerAction>) {
        if let Some(job) = self.jobs.get_mut(id)
            && job.status == TransferStatus::Receiving
        {
            job.status = status;
            if status == TransferStatus::Completed {
                job.recv_bytes = job.size;
            }
            actions.push(SchedulerAction::Updated(id.to_string()));
        }
    }

    fn fail_receiving(&mut self, actions: &mut Vec<SchedulerAction>) {
        for job in self.jobs.iter_mut() {
            if job.status == TransferStatus::Receiving && !self.storing.contains(&job.id) {
                job.status = TransferStatus::Error;
                self.interrupted.insert(job.id.clone());
                actions.push(SchedulerAction::Updated(job.id.clone()));
            }
        }
    }
}
