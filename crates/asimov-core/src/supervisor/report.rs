//! What a pass did, for the CLI and for tests

use std::fmt;

use asimov_kernel::scheduler::ClusterId;
use asimov_kernel::state_machine::AnalysisStatus;

use crate::model::ProductionId;

/// One committed status change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub production: ProductionId,
    pub from: AnalysisStatus,
    pub to: AnalysisStatus,
    pub note: Option<String>,
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} -> {}", self.production, self.from, self.to)?;
        if let Some(note) = &self.note {
            write!(f, " ({note})")?;
        }
        Ok(())
    }
}

/// A per-production error captured by a pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub production: ProductionId,
    pub message: String,
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.production, self.message)
    }
}

/// An action a dry run would have taken
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedAction {
    pub production: ProductionId,
    pub action: String,
    pub detail: Option<String>,
}

impl fmt::Display for PlannedAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: would {}", self.production, self.action)?;
        if let Some(detail) = &self.detail {
            write!(f, " ({detail})")?;
        }
        Ok(())
    }
}

/// Outcome of a build, submit or monitor pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub transitions: Vec<Transition>,
    pub failures: Vec<Failure>,
    pub planned: Vec<PlannedAction>,
}

/// Outcome of a monitor pass
pub type MonitorReport = PassReport;

impl PassReport {
    /// True when the pass did nothing
    pub fn is_empty(&self) -> bool {
        self.transitions.is_empty() && self.failures.is_empty() && self.planned.is_empty()
    }

    /// Final status of a production within this pass, if it changed
    pub fn status_of(&self, production: &ProductionId) -> Option<AnalysisStatus> {
        self.transitions
            .iter()
            .rev()
            .find(|t| &t.production == production)
            .map(|t| t.to)
    }

    /// Append another pass's entries
    pub fn extend(&mut self, other: PassReport) {
        self.transitions.extend(other.transitions);
        self.failures.extend(other.failures);
        self.planned.extend(other.planned);
    }

    pub(crate) fn plan(&mut self, production: &ProductionId, action: &str, detail: Option<String>) {
        match &detail {
            Some(d) => tracing::info!("Would {} {} ({})", action, production, d),
            None => tracing::info!("Would {} {}", action, production),
        }
        self.planned.push(PlannedAction {
            production: production.clone(),
            action: action.to_string(),
            detail,
        });
    }
}

impl fmt::Display for PassReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in &self.planned {
            writeln!(f, "{line}")?;
        }
        for line in &self.transitions {
            writeln!(f, "{line}")?;
        }
        for line in &self.failures {
            writeln!(f, "failed {line}")?;
        }
        Ok(())
    }
}

/// One line of `report status`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    pub production: ProductionId,
    pub pipeline: String,
    pub status: AnalysisStatus,
    pub job_id: Option<ClusterId>,
}

impl fmt::Display for StatusLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let job = self.job_id.map_or_else(|| "-".to_string(), |id| id.to_string());
        write!(
            f,
            "{:<40} {:<16} {:<12} {}",
            self.production.to_string(),
            self.pipeline,
            self.status.as_str(),
            job
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_of_takes_last_transition() {
        let id = ProductionId::analysis("S0", "A0");
        let mut report = PassReport::default();
        for (from, to) in [
            (AnalysisStatus::Running, AnalysisStatus::Finished),
            (AnalysisStatus::Finished, AnalysisStatus::Processing),
        ] {
            report.transitions.push(Transition {
                production: id.clone(),
                from,
                to,
                note: None,
            });
        }
        assert_eq!(report.status_of(&id), Some(AnalysisStatus::Processing));
        assert_eq!(report.status_of(&ProductionId::analysis("S0", "A1")), None);
        assert_eq!(
            report.transitions[0].to_string(),
            "S0/A0: running -> finished"
        );
    }
}
