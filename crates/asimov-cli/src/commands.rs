//! Command handlers
//!
//! Each handler opens the project, performs one supervisor operation and
//! prints a short human-readable summary on stdout.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use asimov_core::{
    Analysis, AsimovError, PassReport, ProductionId, ReviewStatus, Selector, Supervisor, Workspace,
};
use asimov_kernel::scheduler::{CachedScheduler, CondorScheduler, Scheduler};
use asimov_kernel::state_machine::AnalysisStatus;
use asimov_pipelines::builtin_registry;

use crate::{Commands, ManageAction, ProductionAction, ReportKind, UsageError};

/// Run one command against the project rooted at `root`
pub(crate) async fn run(command: Commands, root: &Path) -> anyhow::Result<()> {
    match command {
        Commands::Init { name } => {
            let workspace = Workspace::init(root, &name)?;
            println!("Initialised project {} in {}", name, workspace.root().display());
        }
        Commands::Clone { source } => {
            let workspace = Workspace::clone_from(&source, root)?;
            println!(
                "Cloned project {} from {}",
                workspace.project_name(),
                source.display()
            );
        }
        Commands::Apply { file, subject } => {
            let supervisor = open(root)?;
            let text = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            for outcome in supervisor.apply_text(&text, subject.as_deref())? {
                println!("{outcome}");
            }
        }
        Commands::Manage { action } => {
            let supervisor = open(root)?;
            let report = match action {
                ManageAction::Build { subject, dryrun } => {
                    supervisor.build(subject.as_deref(), dryrun).await?
                }
                ManageAction::Submit { subject, dryrun } => {
                    supervisor.submit(subject.as_deref(), dryrun).await?
                }
            };
            print_report(&report);
        }
        Commands::Monitor { chain, dryrun } => {
            let supervisor = open(root)?;
            let report = if chain {
                supervisor.chain(dryrun).await?
            } else {
                supervisor.monitor(dryrun).await?
            };
            print_report(&report);
        }
        Commands::Start => {
            let supervisor = open(root)?;
            let program = std::env::current_exe().context("locating the asimov executable")?;
            let id = supervisor.start(&program).await?;
            println!("Monitor job submitted as cluster {id}");
        }
        Commands::Stop => {
            let supervisor = open(root)?;
            match supervisor.stop().await? {
                Some(id) => println!("Monitor job {id} removed"),
                None => println!("No monitor job was running"),
            }
        }
        Commands::Report { kind } => report(root, kind)?,
        Commands::Production { action } => production(root, action)?,
    }
    Ok(())
}

/// Open the project with the HTCondor scheduler behind the job-table cache
fn open(root: &Path) -> Result<Supervisor, AsimovError> {
    let workspace = Workspace::open(root)?;
    let condor = &workspace.config().condor;
    let scheduler = CondorScheduler::new(workspace.state_dir())
        .with_schedd(&condor.scheduler)
        .with_timeout(Duration::from_secs(condor.timeout));
    let cached = CachedScheduler::new(
        scheduler,
        workspace.job_cache_path(),
        Duration::from_secs(condor.cache_ttl),
    );
    Ok(Supervisor::new(
        workspace,
        Arc::new(cached) as Arc<dyn Scheduler>,
        builtin_registry(),
    ))
}

fn print_report(report: &PassReport) {
    if report.is_empty() {
        println!("Nothing to do");
    } else {
        println!("{report}");
    }
}

fn report(root: &Path, kind: ReportKind) -> anyhow::Result<()> {
    match kind {
        ReportKind::Html => {
            Err(UsageError("HTML reports are not supported; use `report status`".into()).into())
        }
        ReportKind::Status => {
            let supervisor = open(root)?;
            for line in supervisor.status_report()? {
                println!("{line}");
            }
            Ok(())
        }
        ReportKind::Ledger => {
            let supervisor = open(root)?;
            let path = supervisor.workspace().ledger_path();
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            print!("{text}");
            Ok(())
        }
    }
}

/// `project` addresses project analyses; anything else is a subject
fn production_id(subject: &str, name: &str) -> ProductionId {
    if subject == "project" {
        ProductionId::Project { name: name.to_string() }
    } else {
        ProductionId::analysis(subject, name)
    }
}

fn parse_status(text: &str) -> Result<AnalysisStatus, UsageError> {
    text.parse()
        .map_err(|_| UsageError(format!("unknown status '{text}'")))
}

fn production(root: &Path, action: ProductionAction) -> anyhow::Result<()> {
    let supervisor = open(root)?;
    match action {
        ProductionAction::Create {
            subject,
            name,
            pipeline,
            needs,
            status,
            comment,
        } => {
            let needs = needs
                .iter()
                .map(|s| s.parse::<Selector>())
                .collect::<Result<Vec<_>, _>>()
                .map_err(AsimovError::from)?;
            let mut analysis = Analysis::new(name, pipeline).with_needs(needs);
            if let Some(comment) = comment {
                analysis = analysis.with_comment(comment);
            }
            let explicit = status.is_some();
            if let Some(status) = status {
                analysis = analysis.with_status(parse_status(&status)?);
            }
            let outcome = supervisor.create_production(&subject, analysis, explicit)?;
            println!("{outcome}");
        }
        ProductionAction::Results { subject, name } => {
            let id = production_id(&subject, &name);
            let resources = supervisor.results(&id)?;
            if resources.is_empty() {
                println!("No results stored for {id}");
            }
            for (resource, record) in resources {
                println!("{resource:<32} {} {}", record.hash, record.uuid);
            }
        }
        ProductionAction::SetStatus { subject, name, status } => {
            let id = production_id(&subject, &name);
            let to = parse_status(&status)?;
            let from = supervisor.set_status(&id, to)?;
            println!("{id}: {from} -> {to}");
        }
        ProductionAction::Review {
            subject,
            name,
            status,
            message,
        } => {
            let id = production_id(&subject, &name);
            let status = status
                .map(|s| s.parse::<ReviewStatus>())
                .transpose()
                .map_err(AsimovError::from)?;
            supervisor.add_review(&id, status, &message)?;
            println!("Review recorded for {id}");
        }
    }
    Ok(())
}
