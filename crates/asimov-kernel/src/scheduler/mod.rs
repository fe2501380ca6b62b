//! Batch scheduler adapters
//!
//! The supervisor talks to the batch system only through [`Scheduler`]. The
//! HTCondor implementation shells out to the condor command-line tools;
//! [`CachedScheduler`] puts a short-lived on-disk cache in front of any
//! implementation so that a burst of CLI invocations shares one queue query.

mod cache;
mod condor;

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SchedulerError;

pub use cache::CachedScheduler;
pub use condor::{parse_cluster_id, parse_job_table, submit_file_text, CondorScheduler};

/// Identifier of a submitted scheduler job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClusterId(pub u64);

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ClusterId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Scheduler-side job state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// State code 0
    Unexplained,
    /// Queued
    Idle,
    /// Executing
    Running,
    /// Removed from the queue
    Removed,
    /// Exited
    Completed,
    /// Held; see the hold reason
    Held,
    /// Rejected at submission
    SubmissionError,
}

impl JobStatus {
    /// Map an HTCondor `JobStatus` code
    #[must_use]
    pub const fn from_code(code: i64) -> Self {
        match code {
            1 => Self::Idle,
            2 => Self::Running,
            3 => Self::Removed,
            4 => Self::Completed,
            5 => Self::Held,
            6 => Self::SubmissionError,
            _ => Self::Unexplained,
        }
    }
}

/// One entry of the live job table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInfo {
    /// Cluster id
    pub id: ClusterId,
    /// Executable
    #[serde(default)]
    pub command: String,
    /// Execute hosts
    #[serde(default)]
    pub hosts: Vec<String>,
    /// Scheduler state
    pub status: JobStatus,
    /// Human-readable batch name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_name: Option<String>,
    /// Why the job is held
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hold_reason: Option<String>,
    /// Owning DAGMan job, for DAG nodes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dag_parent: Option<ClusterId>,
    /// DAG nodes owned by this job
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subjobs: Vec<JobInfo>,
}

impl JobInfo {
    /// Minimal entry
    #[must_use]
    pub fn new(id: ClusterId, status: JobStatus) -> Self {
        Self {
            id,
            command: String::new(),
            hosts: Vec::new(),
            status,
            batch_name: None,
            hold_reason: None,
            dag_parent: None,
            subjobs: Vec::new(),
        }
    }

    /// Set the hold reason
    #[inline]
    #[must_use]
    pub fn with_hold_reason(mut self, reason: impl Into<String>) -> Self {
        self.hold_reason = Some(reason.into());
        self
    }

    /// Set the owning DAGMan job
    #[inline]
    #[must_use]
    pub fn with_dag_parent(mut self, parent: ClusterId) -> Self {
        self.dag_parent = Some(parent);
        self
    }
}

/// Snapshot of the scheduler queue keyed by cluster id.
///
/// DAG node jobs are attached to their DAGMan parent when the parent is in
/// the snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobTable {
    jobs: BTreeMap<ClusterId, JobInfo>,
}

impl JobTable {
    /// Empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a table, folding DAG nodes under their parents
    #[must_use]
    pub fn from_jobs(jobs: Vec<JobInfo>) -> Self {
        let (children, top): (Vec<_>, Vec<_>) =
            jobs.into_iter().partition(|j| j.dag_parent.is_some());
        let mut table = Self::new();
        for job in top {
            table.insert(job);
        }
        for child in children {
            match child.dag_parent.and_then(|p| table.jobs.get_mut(&p)) {
                Some(parent) => parent.subjobs.push(child),
                None => table.insert(child),
            }
        }
        table
    }

    /// Add or replace a job
    pub fn insert(&mut self, job: JobInfo) {
        self.jobs.insert(job.id, job);
    }

    /// Drop a job
    pub fn remove(&mut self, id: ClusterId) -> Option<JobInfo> {
        self.jobs.remove(&id)
    }

    /// Look up a job
    #[must_use]
    pub fn get(&self, id: ClusterId) -> Option<&JobInfo> {
        self.jobs.get(&id)
    }

    /// Mutable lookup
    pub fn get_mut(&mut self, id: ClusterId) -> Option<&mut JobInfo> {
        self.jobs.get_mut(&id)
    }

    /// Whether the job is in the queue
    #[must_use]
    pub fn contains(&self, id: ClusterId) -> bool {
        self.jobs.contains_key(&id)
    }

    /// Number of top-level jobs
    #[must_use]
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// True when the queue is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Jobs in cluster-id order
    pub fn iter(&self) -> impl Iterator<Item = &JobInfo> {
        self.jobs.values()
    }
}

/// Scheduler-agnostic job description.
///
/// Adapters translate this into their own submit language.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobDescription {
    /// Program to run
    pub executable: String,
    /// Program arguments
    pub arguments: Vec<String>,
    /// Execution universe; `vanilla` when empty
    pub universe: String,
    /// Directory the job starts in
    pub working_directory: Option<PathBuf>,
    /// Scheduler event log
    pub log: Option<PathBuf>,
    /// Standard output
    pub output: Option<PathBuf>,
    /// Standard error
    pub error: Option<PathBuf>,
    /// CPUs requested
    pub request_cpus: Option<u32>,
    /// Memory requested, with unit (`4 GB`)
    pub request_memory: Option<String>,
    /// Disk requested, with unit
    pub request_disk: Option<String>,
    /// Accounting group tag
    pub accounting_group: Option<String>,
    /// Accounting user
    pub accounting_user: Option<String>,
    /// Human-readable batch name
    pub batch_name: Option<String>,
    /// Run periodically at these minutes
    pub cron_minute: Option<String>,
    /// Copy the submitting environment
    pub getenv: bool,
    /// Where to write the submit file
    pub submit_file: Option<PathBuf>,
    /// Further adapter-specific commands
    pub extra: BTreeMap<String, String>,
}

impl JobDescription {
    /// Description running `executable`
    #[must_use]
    pub fn new(executable: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
            ..Self::default()
        }
    }

    /// Set arguments
    #[inline]
    #[must_use]
    pub fn arguments<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.arguments = args.into_iter().map(Into::into).collect();
        self
    }

    /// Set the working directory
    #[inline]
    #[must_use]
    pub fn working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    /// Set log, output and error files
    #[inline]
    #[must_use]
    pub fn logs(
        mut self,
        log: impl Into<PathBuf>,
        output: impl Into<PathBuf>,
        error: impl Into<PathBuf>,
    ) -> Self {
        self.log = Some(log.into());
        self.output = Some(output.into());
        self.error = Some(error.into());
        self
    }

    /// Set the batch name
    #[inline]
    #[must_use]
    pub fn batch_name(mut self, name: impl Into<String>) -> Self {
        self.batch_name = Some(name.into());
        self
    }

    /// Set the universe
    #[inline]
    #[must_use]
    pub fn universe(mut self, universe: impl Into<String>) -> Self {
        self.universe = universe.into();
        self
    }

    /// Set accounting group and user; empty strings are ignored
    #[inline]
    #[must_use]
    pub fn accounting(mut self, group: &str, user: &str) -> Self {
        if !group.is_empty() {
            self.accounting_group = Some(group.to_string());
        }
        if !user.is_empty() {
            self.accounting_user = Some(user.to_string());
        }
        self
    }

    /// Add an adapter-specific command
    #[inline]
    #[must_use]
    pub fn extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Set where the submit file is written
    #[inline]
    #[must_use]
    pub fn submit_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.submit_file = Some(path.into());
        self
    }
}

/// Accounting record returned after a job leaves the queue
pub type Accounting = BTreeMap<String, serde_json::Value>;

/// Batch scheduler adapter
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Submit a job and return its cluster id
    async fn submit(&self, description: &JobDescription) -> Result<ClusterId, SchedulerError>;

    /// Current job table, possibly cached
    async fn list_jobs(&self) -> Result<JobTable, SchedulerError>;

    /// Current job table, bypassing any cache
    async fn refresh_jobs(&self) -> Result<JobTable, SchedulerError> {
        self.list_jobs().await
    }

    /// Remove a job; removing an unknown job is not an error
    async fn remove(&self, id: ClusterId) -> Result<(), SchedulerError>;

    /// Accounting record for a finished job; empty when unsupported
    async fn accounting(&self, _id: ClusterId) -> Result<Accounting, SchedulerError> {
        Ok(Accounting::new())
    }
}
