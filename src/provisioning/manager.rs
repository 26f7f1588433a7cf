use std::sync::{
    atomic::{AtomicBool, Ordering},
    mpsc::Sender,
};

use anyhow::Result;
use time::OffsetDateTime;
use tracing as log;

use super::{Environment, FitError, ProgressProbe, Step, StepFactory, StepKind, StepResult};
use crate::utils::time::{now, seconds_between};

pub const REBOOT_ADVICE: &str = "You are advised to reboot before trying again.";

/// Runs the fixed step sequence over one [`Environment`].
///
/// Steps are built on first access and kept, so a finished step can still
/// be inspected (imager stats, mountpoints left to clean).
pub struct ProvisionManager {
    env: Environment,
    factory: Box<dyn StepFactory>,
    steps: Vec<Option<Box<dyn Step>>>,
    step_index: isize,
    started_on: Option<OffsetDateTime>,
    ended_on: Option<OffsetDateTime>,
}

impl ProvisionManager {
    pub fn new(env: Environment, factory: Box<dyn StepFactory>) -> Self {
        Self {
            env,
            factory,
            steps: StepKind::ALL.iter().map(|_| None).collect(),
            step_index: -1,
            started_on: None,
            ended_on: None,
        }
    }

    pub fn env(&self) -> &Environment {
        &self.env
    }

    pub fn total_steps(&self) -> usize {
        StepKind::ALL.len()
    }

    /// Position of the current step, `-1` before the first `advance`.
    pub fn step_index(&self) -> isize {
        self.step_index
    }

    /// Refuses images that do not fit; later calls keep the first timestamp.
    pub fn start(&mut self) -> Result<(), FitError> {
        self.env.ensure_fits()?;
        if self.started_on.is_none() {
            self.started_on = Some(now());
            log::info!(
                "[manager] provisioning {} onto {}",
                self.env.image.path.display(),
                self.env.target_disk.path.display()
            );
        }
        Ok(())
    }

    pub fn end(&mut self) {
        if self.ended_on.is_none() {
            self.ended_on = Some(now());
        }
    }

    pub fn started_on(&self) -> Option<OffsetDateTime> {
        self.started_on
    }

    pub fn ended_on(&self) -> Option<OffsetDateTime> {
        self.ended_on
    }

    pub fn duration(&self) -> f64 {
        match (self.started_on, self.ended_on) {
            (Some(start), Some(end)) => seconds_between(start, end),
            _ => -1.0,
        }
    }

    /// Next step in declaration order, `None` once past the last one.
    pub fn advance(&mut self) -> Option<StepKind> {
        let next = self.step_index + 1;
        let kind = usize::try_from(next)
            .ok()
            .and_then(|i| StepKind::ALL.get(i).copied())?;
        self.step_index = next;
        Some(kind)
    }

    pub fn rewind(&mut self) {
        self.step_index = -1;
    }

    /// The cached instance for `kind`, built on first request.
    pub fn get_step(&mut self, kind: StepKind) -> &mut dyn Step {
        let slot = &mut self.steps[kind.index()];
        slot.get_or_insert_with(|| self.factory.build(kind)).as_mut()
    }

    /// Only steps that were already built.
    pub fn step(&self, kind: StepKind) -> Option<&dyn Step> {
        self.steps[kind.index()].as_deref()
    }

    pub fn run_step(&mut self, kind: StepKind, verbose: bool) -> Result<StepResult> {
        let slot = &mut self.steps[kind.index()];
        let step = slot.get_or_insert_with(|| self.factory.build(kind));
        step.run(&self.env, verbose)
    }

    /// Cleans every built step in reverse order. Returns how many failed.
    pub fn cleanup(&mut self) -> usize {
        let mut failures = 0;
        for kind in StepKind::ALL.iter().rev() {
            let Some(step) = self.steps[kind.index()].as_mut() else {
                continue;
            };
            if let Err(e) = step.cleanup() {
                failures += 1;
                log::error!("[manager] cleanup of {} failed: {e:#}", kind.ident());
            }
        }
        failures
    }
}

/// What the pipeline tells its observer, in order.
#[derive(Debug, Clone)]
pub enum Event {
    StepStarted {
        kind: StepKind,
        index: usize,
        total: usize,
        probe: Option<ProgressProbe>,
    },
    StepFinished {
        kind: StepKind,
        result: StepResult,
    },
    StepAborted {
        kind: StepKind,
        error: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Completed,
    /// A step reported failure.
    Failed(StepKind),
    /// A step returned an error instead of a result.
    Aborted { kind: StepKind, error: String },
    /// Stop requested; `kind` never started.
    Stopped(StepKind),
    /// Nothing ran.
    Rejected(String),
}

#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub outcome: Outcome,
    pub results: Vec<(StepKind, StepResult)>,
    pub duration: f64,
    pub cleanup_failures: usize,
}

impl PipelineReport {
    pub fn succeeded(&self) -> bool {
        self.outcome == Outcome::Completed
    }

    pub fn failed_step(&self) -> Option<StepKind> {
        match &self.outcome {
            Outcome::Failed(kind) => Some(*kind),
            Outcome::Aborted { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Disk state past the resize may be inconsistent.
    pub fn reboot_advised(&self) -> bool {
        self.failed_step()
            .is_some_and(|kind| kind >= StepKind::ResizePartition)
    }

    pub fn result(&self, kind: StepKind) -> Option<&StepResult> {
        self.results.iter().find(|(k, _)| *k == kind).map(|(_, r)| r)
    }
}

/// Drives every step in order until one fails or `stop` is raised, then
/// cleans up. `stop` is only checked between steps.
pub fn run_pipeline(
    manager: &mut ProvisionManager,
    verbose: bool,
    stop: &AtomicBool,
    events: &Sender<Event>,
) -> PipelineReport {
    let mut results = Vec::new();

    if let Err(e) = manager.start() {
        log::error!("[manager] refusing to start: {e}");
        return PipelineReport {
            outcome: Outcome::Rejected(e.to_string()),
            results,
            duration: -1.0,
            cleanup_failures: 0,
        };
    }

    let total = manager.total_steps();
    manager.rewind();
    let mut outcome = Outcome::Completed;
    while let Some(kind) = manager.advance() {
        if stop.load(Ordering::SeqCst) {
            log::warn!("[manager] stop requested before {}", kind.ident());
            outcome = Outcome::Stopped(kind);
            break;
        }

        let probe = manager.get_step(kind).probe();
        let _ = events.send(Event::StepStarted {
            kind,
            index: kind.index(),
            total,
            probe,
        });
        log::info!("[manager] step {}/{total}: {}", kind.index() + 1, kind.name());

        match manager.run_step(kind, verbose) {
            Ok(result) => {
                let failed = !result.succeeded;
                if failed {
                    log::error!("[manager] {} failed: {}", kind.ident(), result.error_text);
                    if !result.debug_text.is_empty() {
                        log::debug!("[manager] {}: {}", kind.ident(), result.debug_text);
                    }
                } else {
                    log::info!("[manager] {}: {}", kind.ident(), result.success_text);
                }
                let _ = events.send(Event::StepFinished {
                    kind,
                    result: result.clone(),
                });
                results.push((kind, result));
                if failed {
                    outcome = Outcome::Failed(kind);
                    break;
                }
            }
            Err(e) => {
                log::error!("[manager] {} aborted: {e:#}", kind.ident());
                let error = format!("{e:#}");
                let _ = events.send(Event::StepAborted {
                    kind,
                    error: error.clone(),
                });
                outcome = Outcome::Aborted { kind, error };
                break;
            }
        }
    }

    let cleanup_failures = manager.cleanup();
    manager.end();
    PipelineReport {
        outcome,
        results,
        duration: manager.duration(),
        cleanup_failures,
    }
}
