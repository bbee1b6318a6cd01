//! Phase ordering for a deploy run

use std::fmt;

use serde::{Deserialize, Serialize};

/// One step of a deploy; variants are declared in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    AssumeRole,
    Migrate,
    Provision,
    WaitHealthy,
    StopOldApp,
    DestroyOld,
    DestroyNew,
    PostDeploy,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::AssumeRole => "assume_role",
            Phase::Migrate => "migrate",
            Phase::Provision => "provision",
            Phase::WaitHealthy => "wait_healthy",
            Phase::StopOldApp => "stop_old_app",
            Phase::DestroyOld => "destroy_old",
            Phase::DestroyNew => "destroy_new",
            Phase::PostDeploy => "post_deploy",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named phase sequences exposed on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Job {
    Migrate,
    CreateGroup,
    Wait,
    StopApp,
    DestroyOld,
    DestroyNew,
    PostDeploy,
    /// Migrate then provision
    Prep,
    /// Wait, stop the old app, destroy old groups, post deploy
    Release,
    All,
    /// Like `All` with migrate and provision running concurrently
    AllAsync,
}

impl Job {
    /// Steps to run; phases sharing a step run concurrently
    pub fn plan(&self) -> Vec<Vec<Phase>> {
        let release = [
            Phase::WaitHealthy,
            Phase::StopOldApp,
            Phase::DestroyOld,
            Phase::PostDeploy,
        ];

        let mut steps = vec![vec![Phase::AssumeRole]];
        match self {
            Job::Migrate => steps.push(vec![Phase::Migrate]),
            Job::CreateGroup => steps.push(vec![Phase::Provision]),
            Job::Wait => steps.push(vec![Phase::WaitHealthy]),
            Job::StopApp => steps.push(vec![Phase::StopOldApp]),
            Job::DestroyOld => steps.push(vec![Phase::DestroyOld]),
            Job::DestroyNew => steps.push(vec![Phase::DestroyNew]),
            Job::PostDeploy => steps.push(vec![Phase::PostDeploy]),
            Job::Prep => {
                steps.push(vec![Phase::Migrate]);
                steps.push(vec![Phase::Provision]);
            }
            Job::Release => steps.extend(release.iter().map(|p| vec![*p])),
            Job::All => {
                steps.push(vec![Phase::Migrate]);
                steps.push(vec![Phase::Provision]);
                steps.extend(release.iter().map(|p| vec![*p]));
            }
            Job::AllAsync => {
                steps.push(vec![Phase::Migrate, Phase::Provision]);
                steps.extend(release.iter().map(|p| vec![*p]));
            }
        }
        steps
    }
}

/// Overall state of a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// Run event
#[derive(Debug, Clone)]
pub enum PhaseEvent {
    Enter(Phase),
    Complete(Phase),
    Fail(Phase, String),
    /// Every planned phase completed
    Finish,
}

/// Tracks a run and rejects out-of-order phases
#[derive(Debug, Clone)]
pub struct WorkflowFsm {
    state: RunState,
    active: Vec<Phase>,
    completed: Vec<Phase>,
    failed: Option<Phase>,
    error: Option<String>,
}

impl Default for WorkflowFsm {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkflowFsm {
    pub fn new() -> Self {
        Self {
            state: RunState::Pending,
            active: Vec::new(),
            completed: Vec::new(),
            failed: None,
            error: None,
        }
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    /// Phases currently running
    pub fn active(&self) -> &[Phase] {
        &self.active
    }

    /// Phases completed so far, in completion order
    pub fn completed(&self) -> &[Phase] {
        &self.completed
    }

    pub fn failed_phase(&self) -> Option<Phase> {
        self.failed
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Process an event and transition state
    pub fn process(&mut self, event: PhaseEvent) -> Result<(), String> {
        match (&self.state, event) {
            (RunState::Pending | RunState::Running, PhaseEvent::Enter(phase)) => {
                if let Some(last) = self.completed.iter().max() {
                    if phase <= *last {
                        return Err(format!("phase {} cannot run after {}", phase, last));
                    }
                }
                if self.active.contains(&phase) {
                    return Err(format!("phase {} is already running", phase));
                }
                self.active.push(phase);
                self.state = RunState::Running;
            }

            (RunState::Running, PhaseEvent::Complete(phase)) => {
                let index = self
                    .active
                    .iter()
                    .position(|p| *p == phase)
                    .ok_or_else(|| format!("phase {} is not running", phase))?;
                self.active.remove(index);
                self.completed.push(phase);
            }

            (RunState::Running, PhaseEvent::Fail(phase, error)) => {
                self.active.clear();
                self.failed = Some(phase);
                self.error = Some(error);
                self.state = RunState::Failed;
            }

            (RunState::Pending | RunState::Running, PhaseEvent::Finish) if self.active.is_empty() => {
                self.state = RunState::Succeeded;
            }

            (state, event) => {
                return Err(format!(
                    "Invalid transition from {:?} with event {:?}",
                    state, event
                ));
            }
        }
        Ok(())
    }
}
