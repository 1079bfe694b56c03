use crate::{
    error::RunError,
    location::{Mode, ObjectRef, RunTimestamp},
    orchestrator::Phase,
    pipeline::ItemRecord,
    stats::Stats,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    Succeeded {
        #[serde(default)]
        warning: Option<String>,
    },
    Failed {
        phase: Phase,
        reason: String,
    },
}

/// Final snapshot of one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_timestamp: RunTimestamp,
    pub mode: Option<Mode>,
    #[serde(flatten)]
    pub verdict: Verdict,
    pub stats: Stats,
    pub success_rate: Option<f64>,
    pub items: Vec<ItemRecord>,
    #[serde(skip)]
    pub error: Option<RunError>,
}

impl RunReport {
    pub fn succeeded(
        run_timestamp: RunTimestamp,
        mode: Mode,
        stats: Stats,
        items: Vec<ItemRecord>,
        warning: Option<String>,
    ) -> Self {
        Self {
            run_timestamp,
            mode: Some(mode),
            verdict: Verdict::Succeeded { warning },
            success_rate: stats.success_rate(),
            stats,
            items,
            error: None,
        }
    }

    pub fn failed(
        run_timestamp: RunTimestamp,
        mode: Option<Mode>,
        phase: Phase,
        error: RunError,
        stats: Stats,
        items: Vec<ItemRecord>,
    ) -> Self {
        Self {
            run_timestamp,
            mode,
            verdict: Verdict::Failed {
                phase,
                reason: error.to_string(),
            },
            success_rate: stats.success_rate(),
            stats,
            items,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.verdict, Verdict::Succeeded { .. })
    }

    pub fn warning(&self) -> Option<&str> {
        match &self.verdict {
            Verdict::Succeeded { warning } => warning.as_deref(),
            Verdict::Failed { .. } => None,
        }
    }

    pub fn exit_code(&self) -> u8 {
        match &self.error {
            Some(err) => err.exit_code(),
            None if self.is_success() => 0,
            None => 1,
        }
    }
}

/// One line of a dry-run plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanEntry {
    pub input: ObjectRef,
    pub output: ObjectRef,
}
