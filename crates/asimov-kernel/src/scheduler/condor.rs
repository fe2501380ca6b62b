//! HTCondor adapter
//!
//! Talks to the pool through `condor_submit`, `condor_q`, `condor_rm` and
//! `condor_history`, each bounded by the configured timeout.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use tokio::process::Command;

use super::{Accounting, ClusterId, JobDescription, JobInfo, JobStatus, JobTable, Scheduler};
use crate::error::SchedulerError;
use crate::executor::run_checked;

const QUEUE_ATTRIBUTES: &str =
    "ClusterId,Cmd,RemoteHost,JobStatus,JobBatchName,HoldReason,DAGManJobId";

/// Scheduler backed by the HTCondor command-line tools
#[derive(Debug, Clone)]
pub struct CondorScheduler {
    schedd: Option<String>,
    timeout: Duration,
    spool: PathBuf,
}

impl CondorScheduler {
    /// Adapter writing submit files under `spool` when a description names none
    #[must_use]
    pub fn new(spool: impl Into<PathBuf>) -> Self {
        Self {
            schedd: None,
            timeout: Duration::from_secs(60),
            spool: spool.into(),
        }
    }

    /// Target a specific schedd; empty means the local default
    #[inline]
    #[must_use]
    pub fn with_schedd(mut self, schedd: &str) -> Self {
        self.schedd = (!schedd.is_empty()).then(|| schedd.to_string());
        self
    }

    /// Bound every command by `timeout`
    #[inline]
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn command(&self, program: &str) -> Command {
        let mut cmd = Command::new(program);
        if let Some(schedd) = &self.schedd {
            cmd.arg("-name").arg(schedd);
        }
        cmd
    }

    fn submit_path(&self, description: &JobDescription) -> PathBuf {
        if let Some(path) = &description.submit_file {
            return path.clone();
        }
        let stem = description
            .batch_name
            .as_deref()
            .unwrap_or("job")
            .replace(['/', ' '], "_");
        self.spool.join(format!("{stem}.sub"))
    }
}

#[async_trait]
impl Scheduler for CondorScheduler {
    async fn submit(&self, description: &JobDescription) -> Result<ClusterId, SchedulerError> {
        let path = self.submit_path(description);
        write_submit_file(&path, &submit_file_text(description)).await?;

        let mut cmd = self.command("condor_submit");
        cmd.arg(&path);
        if let Some(dir) = &description.working_directory {
            cmd.current_dir(dir);
        }
        let stdout = run_checked(cmd, self.timeout).await?;
        let id = parse_cluster_id(&stdout)
            .ok_or_else(|| SchedulerError::Parse(format!("no cluster id in: {}", stdout.trim())))?;
        tracing::info!("Submitted {} as cluster {}", path.display(), id);
        Ok(id)
    }

    async fn list_jobs(&self) -> Result<JobTable, SchedulerError> {
        let mut cmd = self.command("condor_q");
        cmd.args(["-json", "-attributes", QUEUE_ATTRIBUTES]);
        let stdout = run_checked(cmd, self.timeout).await?;
        parse_job_table(&stdout)
    }

    async fn remove(&self, id: ClusterId) -> Result<(), SchedulerError> {
        let mut cmd = self.command("condor_rm");
        cmd.arg(id.to_string());
        match run_checked(cmd, self.timeout).await {
            Ok(_) => {
                tracing::info!("Removed cluster {}", id);
                Ok(())
            }
            Err(crate::error::ExecError::Failed { stderr, .. }) => {
                tracing::warn!("condor_rm {} failed, treating as gone: {}", id, stderr);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn accounting(&self, id: ClusterId) -> Result<Accounting, SchedulerError> {
        let mut cmd = self.command("condor_history");
        cmd.arg(id.to_string()).args(["-json", "-limit", "1"]);
        let stdout = run_checked(cmd, self.timeout).await?;
        parse_accounting(&stdout)
    }
}

async fn write_submit_file(path: &Path, text: &str) -> Result<(), SchedulerError> {
    let io_err = |source| SchedulerError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
    }
    tokio::fs::write(path, text).await.map_err(io_err)
}

fn quote_argument(arg: &str) -> String {
    let escaped = arg.replace('"', "\"\"").replace('\'', "''");
    if escaped.is_empty() || escaped.contains(char::is_whitespace) || escaped != arg {
        format!("'{escaped}'")
    } else {
        escaped
    }
}

/// Render a description in HTCondor submit language
#[must_use]
pub fn submit_file_text(description: &JobDescription) -> String {
    let mut lines: Vec<(String, String)> = Vec::new();
    let mut push = |key: &str, value: String| lines.push((key.to_string(), value));

    let universe = if description.universe.is_empty() {
        "vanilla"
    } else {
        description.universe.as_str()
    };
    push("universe", universe.to_string());
    push("executable", description.executable.clone());
    if !description.arguments.is_empty() {
        let args: Vec<String> = description.arguments.iter().map(|a| quote_argument(a)).collect();
        push("arguments", format!("\"{}\"", args.join(" ")));
    }
    if let Some(dir) = &description.working_directory {
        push("initialdir", dir.display().to_string());
    }
    for (key, path) in [
        ("log", &description.log),
        ("output", &description.output),
        ("error", &description.error),
    ] {
        if let Some(path) = path {
            push(key, path.display().to_string());
        }
    }
    if let Some(cpus) = description.request_cpus {
        push("request_cpus", cpus.to_string());
    }
    if let Some(memory) = &description.request_memory {
        push("request_memory", memory.clone());
    }
    if let Some(disk) = &description.request_disk {
        push("request_disk", disk.clone());
    }
    if let Some(group) = &description.accounting_group {
        push("accounting_group", group.clone());
    }
    if let Some(user) = &description.accounting_user {
        push("accounting_group_user", user.clone());
    }
    if let Some(name) = &description.batch_name {
        push("batch_name", name.clone());
    }
    if let Some(minute) = &description.cron_minute {
        push("cron_minute", minute.clone());
        push("on_exit_remove", "false".to_string());
    }
    if description.getenv {
        push("getenv", "true".to_string());
    }
    for (key, value) in &description.extra {
        push(key, value.clone());
    }

    let mut text: String = lines
        .into_iter()
        .map(|(k, v)| format!("{k} = {v}\n"))
        .collect();
    text.push_str("queue\n");
    text
}

fn cluster_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+)\s+job\(s\)\s+submitted\s+to\s+cluster\s+(\d+)").ok())
        .as_ref()
}

/// Extract the cluster id from `condor_submit` output
#[must_use]
pub fn parse_cluster_id(stdout: &str) -> Option<ClusterId> {
    cluster_regex()?
        .captures(stdout)
        .and_then(|caps| caps.get(2))
        .and_then(|m| m.as_str().parse().ok())
        .map(ClusterId)
}

fn as_u64(value: Option<&Value>) -> Option<u64> {
    match value? {
        Value::Number(n) => n.as_u64().or_else(|| n.as_f64().map(|f| f as u64)),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn as_string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

/// Parse `condor_q -json` output
///
/// # Errors
/// [`SchedulerError::Parse`] when the output is not a JSON array of ads
pub fn parse_job_table(stdout: &str) -> Result<JobTable, SchedulerError> {
    if stdout.trim().is_empty() {
        return Ok(JobTable::new());
    }
    let ads: Vec<Value> =
        serde_json::from_str(stdout).map_err(|e| SchedulerError::Parse(e.to_string()))?;
    let mut jobs = Vec::with_capacity(ads.len());
    for ad in &ads {
        let Some(id) = as_u64(ad.get("ClusterId")) else {
            tracing::warn!("Skipping job ad without ClusterId");
            continue;
        };
        let code = as_u64(ad.get("JobStatus")).map_or(0, |c| i64::try_from(c).unwrap_or(0));
        let mut job = JobInfo::new(ClusterId(id), JobStatus::from_code(code));
        job.command = as_string(ad.get("Cmd")).unwrap_or_default();
        job.hosts = as_string(ad.get("RemoteHost")).into_iter().collect();
        job.batch_name = as_string(ad.get("JobBatchName"));
        job.hold_reason = as_string(ad.get("HoldReason"));
        job.dag_parent = as_u64(ad.get("DAGManJobId")).map(ClusterId);
        jobs.push(job);
    }
    Ok(JobTable::from_jobs(jobs))
}

fn parse_accounting(stdout: &str) -> Result<Accounting, SchedulerError> {
    if stdout.trim().is_empty() {
        return Ok(Accounting::new());
    }
    let ads: Vec<Value> =
        serde_json::from_str(stdout).map_err(|e| SchedulerError::Parse(e.to_string()))?;
    match ads.into_iter().next() {
        Some(Value::Object(map)) => Ok(map.into_iter().collect()),
        _ => Ok(Accounting::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_cluster_id() {
        let out = "Submitting job(s).\n1 job(s) submitted to cluster 4242.\n";
        assert_eq!(parse_cluster_id(out), Some(ClusterId(4242)));
        assert_eq!(parse_cluster_id("ERROR: nope"), None);
    }

    #[test]
    fn test_parse_job_table() {
        let out = r#"[
            {"ClusterId": 10, "Cmd": "/usr/bin/condor_dagman", "JobStatus": 2,
             "JobBatchName": "S0/A0"},
            {"ClusterId": 11, "Cmd": "/bin/pe", "JobStatus": 2, "RemoteHost": "slot1@node7",
             "DAGManJobId": 10},
            {"ClusterId": 12, "Cmd": "/bin/pe", "JobStatus": 5, "HoldReason": "memory exceeded"}
        ]"#;
        let table = parse_job_table(out).unwrap();
        assert_eq!(table.len(), 2);

        let dag = table.get(ClusterId(10)).unwrap();
        assert_eq!(dag.batch_name.as_deref(), Some("S0/A0"));
        assert_eq!(dag.subjobs[0].hosts, vec!["slot1@node7".to_string()]);

        let held = table.get(ClusterId(12)).unwrap();
        assert_eq!(held.status, JobStatus::Held);
        assert_eq!(held.hold_reason.as_deref(), Some("memory exceeded"));
    }

    #[test]
    fn test_empty_queue() {
        assert!(parse_job_table("\n").unwrap().is_empty());
        assert!(matches!(
            parse_job_table("not json"),
            Err(SchedulerError::Parse(_))
        ));
    }

    #[test]
    fn test_submit_file_text() {
        let description = JobDescription::new("/bin/pe")
            .arguments(["--config", "run config.ini"])
            .working_directory("/work/S0/A0")
            .batch_name("S0/A0")
            .accounting("ligo.dev.o4.cbc.pe.lalinference", "albert");
        let text = submit_file_text(&description);
        assert!(text.starts_with("universe = vanilla\nexecutable = /bin/pe\n"));
        assert!(text.contains("arguments = \"--config 'run config.ini'\"\n"));
        assert!(text.contains("initialdir = /work/S0/A0\n"));
        assert!(text.contains("accounting_group_user = albert\n"));
        assert!(text.ends_with("queue\n"));
    }

    #[test]
    fn test_cron_jobs_stay_queued() {
        let mut description = JobDescription::new("asimov").universe("local");
        description.cron_minute = Some("*/15".to_string());
        let text = submit_file_text(&description);
        assert!(text.contains("cron_minute = */15\n"));
        assert!(text.contains("on_exit_remove = false\n"));
    }

    #[test]
    fn test_parse_accounting() {
        let out = r#"[{"ClusterId": 42, "RemoteWallClockTime": 3600.0, "CpusProvisioned": 4}]"#;
        let acc = parse_accounting(out).unwrap();
        assert_eq!(acc.get("CpusProvisioned"), Some(&serde_json::json!(4)));
    }
}
