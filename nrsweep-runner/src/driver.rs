//! Random and exhaustive sweeps over a parameter space.
//!
//! Every trial is execute → parse → append. A trial that fails to execute or
//! to produce a parsable result vector is logged, recorded in the report and
//! skipped; nothing is written for it. A store failure aborts the sweep.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use chrono::NaiveDateTime;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use nrsweep_core::layout::ResultLayout;
use nrsweep_core::param::{ParamError, ParamValue, ParameterAssignment, ParameterSpace};
use nrsweep_core::protocol::parse_results;
use nrsweep_core::store::{format_record, ResultStore, StoreError};

use crate::config::{ConfigError, SweepConfig};
use crate::executor::RunExecutor;

#[derive(Debug, Error)]
pub enum SweepError {
    #[error("result store error: {0}")]
    Store(#[from] StoreError),

    #[error("parameter error: {0}")]
    Params(#[from] ParamError),

    #[error("repeat count must be at least 1")]
    ZeroRepeats,
}

// ─── Progress & report types ─────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepMode {
    Random,
    Exhaustive,
}

/// Progress update sent after every trial.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepProgress {
    /// 1-based index of the trial just finished.
    pub trial: usize,
    /// Planned trial count, when known up front.
    pub total: Option<usize>,
    pub assignment: String,
    pub succeeded: usize,
    pub failed: usize,
    pub elapsed_secs: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Execution,
    Parse,
}

/// A skipped trial, kept for the report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedTrial {
    pub trial: usize,
    pub assignment: String,
    pub kind: FailureKind,
    pub error: String,
    pub exit_code: Option<i32>,
}

/// Summary of a finished (or cancelled) sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepReport {
    pub mode: SweepMode,
    pub store: PathBuf,
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: Vec<FailedTrial>,
    pub cancelled: bool,
    pub elapsed_secs: f64,
}

impl SweepReport {
    fn new(mode: SweepMode, store: PathBuf) -> Self {
        Self {
            mode,
            store,
            attempted: 0,
            succeeded: 0,
            failed: Vec::new(),
            cancelled: false,
            elapsed_secs: 0.0,
        }
    }

    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }
}

// ─── Driver ──────────────────────────────────────────────────────────

/// Optional callback for per-trial progress.
pub type ProgressFn<'a> = &'a dyn Fn(&SweepProgress);

pub struct SweepDriver<E> {
    space: ParameterSpace,
    layout: ResultLayout,
    store: ResultStore,
    executor: E,
    clock: fn() -> NaiveDateTime,
}

fn local_now() -> NaiveDateTime {
    chrono::Local::now().naive_local()
}

impl<E: RunExecutor> SweepDriver<E> {
    pub fn new(space: ParameterSpace, layout: ResultLayout, store: ResultStore, executor: E) -> Self {
        Self {
            space,
            layout,
            store,
            executor,
            clock: local_now,
        }
    }

    /// Driver over the config's space, layout and raw store path.
    pub fn from_config(config: &SweepConfig, executor: E) -> Result<Self, ConfigError> {
        let space = config.space()?;
        let layout = config.layout();
        let store = ResultStore::for_layout(&config.output.results, &space, &layout);
        Ok(Self::new(space, layout, store, executor))
    }

    /// Replace the timestamp source.
    pub fn with_clock(mut self, clock: fn() -> NaiveDateTime) -> Self {
        self.clock = clock;
        self
    }

    pub fn space(&self) -> &ParameterSpace {
        &self.space
    }

    pub fn store(&self) -> &ResultStore {
        &self.store
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    pub fn into_executor(self) -> E {
        self.executor
    }

    /// Run `trials` independently sampled assignments. Filters do not apply.
    pub fn run_random<R: Rng>(
        &mut self,
        trials: usize,
        rng: &mut R,
        progress: Option<ProgressFn<'_>>,
        cancel: Option<&AtomicBool>,
    ) -> Result<SweepReport, SweepError> {
        self.store.ensure_initialized()?;
        let started = Instant::now();
        let mut report = SweepReport::new(SweepMode::Random, self.store.path().to_path_buf());
        tracing::info!(trials, store = %self.store.path().display(), "starting random sweep");

        for _ in 0..trials {
            if is_cancelled(cancel) {
                report.cancelled = true;
                break;
            }
            let assignment = self.space.sample_random(rng);
            self.run_trial(&assignment, &mut report)?;
            notify(progress, &report, Some(trials), &assignment, started);
        }

        Ok(finish(report, started))
    }

    /// Enumerate the filtered grid with `fixed` held constant and run each
    /// assignment `repeats` times in a row.
    pub fn run_grid(
        &mut self,
        fixed: &BTreeMap<String, ParamValue>,
        repeats: usize,
        progress: Option<ProgressFn<'_>>,
        cancel: Option<&AtomicBool>,
    ) -> Result<SweepReport, SweepError> {
        let space = self.space.clone();
        let total = space.enumerate_all(fixed)?.count().saturating_mul(repeats);
        let assignments = space.enumerate_all(fixed)?;
        self.exhaustive(assignments, repeats, Some(total), progress, cancel)
    }

    /// Run each assignment of `assignments` `repeats` times in a row.
    ///
    /// Every assignment is validated against the space before its first run.
    pub fn run_exhaustive<I>(
        &mut self,
        assignments: I,
        repeats: usize,
        progress: Option<ProgressFn<'_>>,
        cancel: Option<&AtomicBool>,
    ) -> Result<SweepReport, SweepError>
    where
        I: IntoIterator<Item = ParameterAssignment>,
    {
        self.exhaustive(assignments, repeats, None, progress, cancel)
    }

    fn exhaustive<I>(
        &mut self,
        assignments: I,
        repeats: usize,
        total: Option<usize>,
        progress: Option<ProgressFn<'_>>,
        cancel: Option<&AtomicBool>,
    ) -> Result<SweepReport, SweepError>
    where
        I: IntoIterator<Item = ParameterAssignment>,
    {
        if repeats == 0 {
            return Err(SweepError::ZeroRepeats);
        }
        self.store.ensure_initialized()?;
        let started = Instant::now();
        let mut report = SweepReport::new(SweepMode::Exhaustive, self.store.path().to_path_buf());
        tracing::info!(repeats, total = ?total, store = %self.store.path().display(), "starting exhaustive sweep");

        'outer: for assignment in assignments {
            self.space.validate(&assignment)?;
            for _ in 0..repeats {
                if is_cancelled(cancel) {
                    report.cancelled = true;
                    break 'outer;
                }
                self.run_trial(&assignment, &mut report)?;
                notify(progress, &report, total, &assignment, started);
            }
        }

        Ok(finish(report, started))
    }

    fn run_trial(
        &mut self,
        assignment: &ParameterAssignment,
        report: &mut SweepReport,
    ) -> Result<(), SweepError> {
        report.attempted += 1;
        let trial = report.attempted;
        tracing::info!(trial, %assignment, "running trial");

        let output = match self.executor.execute(assignment) {
            Ok(output) => output,
            Err(e) => {
                tracing::warn!(trial, %assignment, error = %e, "trial failed to execute");
                report.failed.push(FailedTrial {
                    trial,
                    assignment: assignment.to_string(),
                    kind: FailureKind::Execution,
                    error: e.to_string(),
                    exit_code: None,
                });
                return Ok(());
            }
        };
        if !output.success() {
            tracing::debug!(trial, exit_code = ?output.exit_code, "simulator exited with non-zero status");
        }

        let values = match parse_results(&output.stdout, self.layout.arity()) {
            Ok(values) => values,
            Err(e) => {
                tracing::warn!(
                    trial,
                    %assignment,
                    exit_code = ?output.exit_code,
                    error = %e,
                    "trial produced no usable results"
                );
                if !output.stderr.is_empty() {
                    tracing::debug!(trial, stderr = %output.stderr.trim_end(), "simulator stderr");
                }
                report.failed.push(FailedTrial {
                    trial,
                    assignment: assignment.to_string(),
                    kind: FailureKind::Parse,
                    error: e.to_string(),
                    exit_code: output.exit_code,
                });
                return Ok(());
            }
        };

        let fields = format_record(assignment, &values, &self.layout);
        self.store.append(&fields, (self.clock)())?;
        report.succeeded += 1;
        Ok(())
    }
}

fn is_cancelled(cancel: Option<&AtomicBool>) -> bool {
    cancel.is_some_and(|f| f.load(Ordering::Relaxed))
}

fn notify(
    progress: Option<ProgressFn<'_>>,
    report: &SweepReport,
    total: Option<usize>,
    assignment: &ParameterAssignment,
    started: Instant,
) {
    if let Some(cb) = progress {
        cb(&SweepProgress {
            trial: report.attempted,
            total,
            assignment: assignment.to_string(),
            succeeded: report.succeeded,
            failed: report.failed.len(),
            elapsed_secs: started.elapsed().as_secs_f64(),
        });
    }
}

fn finish(mut report: SweepReport, started: Instant) -> SweepReport {
    report.elapsed_secs = started.elapsed().as_secs_f64();
    tracing::info!(
        attempted = report.attempted,
        succeeded = report.succeeded,
        failed = report.failed.len(),
        cancelled = report.cancelled,
        elapsed_secs = report.elapsed_secs,
        "sweep finished"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{ExecutionError, RunOutput};
    use nrsweep_core::param::ParamSpec;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    /// Replies with canned stdout keyed by the `a` parameter.
    struct EchoExecutor;

    impl RunExecutor for EchoExecutor {
        fn execute(&mut self, assignment: &ParameterAssignment) -> Result<RunOutput, ExecutionError> {
            let a = assignment.get("a").map(|v| v.as_f64()).unwrap_or(0.0);
            Ok(RunOutput {
                stdout: format!("###RESULTS###{a},1,2,3###END###\n"),
                exit_code: Some(0),
                ..RunOutput::default()
            })
        }
    }

    fn driver(dir: &std::path::Path) -> SweepDriver<EchoExecutor> {
        let space = ParameterSpace::new(vec![ParamSpec::int("a", &[1, 2, 3])]).unwrap();
        let layout = ResultLayout::basic();
        let store = ResultStore::for_layout(dir.join("raw.csv"), &space, &layout);
        SweepDriver::new(space, layout, store, EchoExecutor)
    }

    #[test]
    fn zero_repeats_is_rejected_before_touching_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let mut d = driver(dir.path());
        let err = d.run_grid(&BTreeMap::new(), 0, None, None).unwrap_err();
        assert!(matches!(err, SweepError::ZeroRepeats));
        assert!(!d.store().path().exists());
    }

    #[test]
    fn grid_reports_total_in_progress() {
        let dir = tempfile::tempdir().unwrap();
        let mut d = driver(dir.path());
        let totals = std::cell::RefCell::new(Vec::new());
        let cb = |p: &SweepProgress| totals.borrow_mut().push((p.trial, p.total));
        let report = d.run_grid(&BTreeMap::new(), 2, Some(&cb), None).unwrap();

        assert_eq!(report.attempted, 6);
        assert_eq!(report.succeeded, 6);
        assert_eq!(totals.borrow().last(), Some(&(6, Some(6))));
        assert_eq!(d.store().row_count().unwrap(), 6);
    }

    #[test]
    fn zero_trials_only_initializes_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let mut d = driver(dir.path());
        let mut rng = StdRng::seed_from_u64(1);
        let report = d.run_random(0, &mut rng, None, None).unwrap();
        assert_eq!(report.attempted, 0);
        assert_eq!(d.store().row_count().unwrap(), 0);
    }

    #[test]
    fn invalid_assignment_aborts_exhaustive_sweep() {
        let dir = tempfile::tempdir().unwrap();
        let mut d = driver(dir.path());
        let bad = ParameterAssignment::from_pairs([("b", ParamValue::Int(1))]);
        let err = d.run_exhaustive(vec![bad], 1, None, None).unwrap_err();
        assert!(matches!(err, SweepError::Params(ParamError::Unknown(_))));
        assert_eq!(d.store().row_count().unwrap(), 0);
    }

    #[test]
    fn report_serializes_to_json() {
        let mut report = SweepReport::new(SweepMode::Random, PathBuf::from("raw.csv"));
        report.failed.push(FailedTrial {
            trial: 1,
            assignment: "a=1".into(),
            kind: FailureKind::Parse,
            error: "no results marker found".into(),
            exit_code: Some(1),
        });
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["mode"], "random");
        assert_eq!(json["failed"][0]["kind"], "parse");
    }
}
