//! Transfer jobs and the session's job table.

use std::collections::HashMap;
use std::path::PathBuf;
use uuid::Uuid;

use crate::core::protocol::frame::FileMeta;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Queued,
    Sending,
    Receiving,
    Completed,
    Cancelled,
    Error,
}

impl TransferStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Error)
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Sending => "sending",
            Self::Receiving => "receiving",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Direction {
    /// We send the file at `path`.
    Outbound { path: PathBuf },
    /// The remote sends; bytes land in a receive assembly.
    Inbound,
}

#[derive(Debug, Clone)]
pub struct TransferJob {
    pub id: String,
    pub direction: Direction,
    pub name: String,
    pub size: u64,
    pub mime: String,
    pub status: TransferStatus,
    pub sent_bytes: u64,
    pub recv_bytes: u64,
}

impl TransferJob {
    /// A new outbound job with a fresh id.
    pub fn outbound(path: PathBuf, name: String, size: u64, mime: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            direction: Direction::Outbound { path },
            name,
            size,
            mime,
            status: TransferStatus::Queued,
            sent_bytes: 0,
            recv_bytes: 0,
        }
    }

    /// An inbound job announced by a `META` frame.
    pub fn inbound(meta: &FileMeta) -> Self {
        Self {
            id: meta.id.clone(),
            direction: Direction::Inbound,
            name: meta.name.clone(),
            size: meta.size,
            mime: meta.mime.clone(),
            status: TransferStatus::Receiving,
            sent_bytes: 0,
            recv_bytes: 0,
        }
    }

    pub fn is_outbound(&self) -> bool {
        matches!(self.direction, Direction::Outbound { .. })
    }

    /// The wire announcement for this job.
    pub fn meta(&self) -> FileMeta {
        FileMeta {
            id: self.id.clone(),
            name: self.name.clone(),
            size: self.size,
            mime: self.mime.clone(),
        }
    }
}

/// Every job of the session, in creation order.
#[derive(Debug, Default)]
pub struct JobTable {
    jobs: Vec<TransferJob>,
    index: HashMap<String, usize>,
}

impl JobTable {
    /// Insert, replacing a job with the same id in place.
    pub fn upsert(&mut self, job: TransferJob) {
        match self.index.get(&job.id) {
            Some(&i) => self.jobs[i] = job,
            None => {
                self.index.insert(job.id.clone(), self.jobs.len());
                self.jobs.push(job);
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<&TransferJob> {
        self.index.get(id).map(|&i| &self.jobs[i])
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut TransferJob> {
        self.index.get(id).map(|&i| &mut self.jobs[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &TransferJob> {
        self.jobs.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut TransferJob> {
        self.jobs.iter_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(TransferStatus::Completed.is_terminal());
        assert!(TransferStatus::Cancelled.is_terminal());
        assert!(TransferStatus::Error.is_terminal());
        assert!(!TransferStatus::Queued.is_terminal());
        assert!(!TransferStatus::Sending.is_terminal());
        assert!(!TransferStatus::Receiving.is_terminal());
    }

    #[test]
    fn test_table_keeps_order_and_replaces_in_place() {
        let mut table = JobTable::default();
        let a = TransferJob::outbound("a".into(), "a".into(), 1, String::new());
        let b = TransferJob::outbound("b".into(), "b".into(), 2, String::new());
        let a_id = a.id.clone();
        table.upsert(a.clone());
        table.upsert(b);

        let mut replaced = a;
        replaced.status = TransferStatus::Completed;
        table.upsert(replaced);

        let names: Vec<_> = table.iter().map(|j| j.name.as_str()).collect();
        assert_eq!(names, ["a", "b"]);
        assert_eq!(table.get(&a_id).unwrap().status, TransferStatus::Completed);
    }

    #[test]
    fn test_meta_mirrors_job() {
        let job = TransferJob::outbound("/tmp/x.txt".into(), "x.txt".into(), 9, "text/plain".into());
        let meta = job.meta();
        assert_eq!(meta.id, job.id);
        assert_eq!(meta.size, 9);
        assert_eq!(TransferJob::inbound(&meta).status, TransferStatus::Receiving);
    }
}
