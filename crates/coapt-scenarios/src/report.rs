//! Scenario step timing and the final report.

use std::fmt;
use std::time::{Duration, Instant};

use coapt_harness::HarnessError;
use tracing::{debug, warn};

/// One completed (or failed) scenario step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepRecord {
    pub name: String,
    pub elapsed: Duration,
    pub passed: bool,
}

/// Summary of a finished scenario.
#[derive(Debug, Clone)]
pub struct ScenarioReport {
    /// Scenario name.
    pub scenario: String,
    /// The state machine's terminal state (e.g. `RECOVERED`, `EXHAUSTED`).
    pub terminal_state: String,
    pub steps: Vec<StepRecord>,
    /// Observations worth keeping, such as a content signature per block size.
    pub notes: Vec<(String, String)>,
    pub elapsed: Duration,
}

impl ScenarioReport {
    /// The first step with the given name.
    pub fn step(&self, name: &str) -> Option<&StepRecord> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Number of steps recorded under `name`.
    pub fn count(&self, name: &str) -> usize {
        self.steps.iter().filter(|s| s.name == name).count()
    }

    pub fn note(&self, key: &str) -> Option<&str> {
        self.notes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

impl fmt::Display for ScenarioReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {} in {:.1}s",
            self.scenario,
            self.terminal_state,
            self.elapsed.as_secs_f64()
        )?;
        for step in &self.steps {
            let mark = if step.passed { "ok" } else { "FAILED" };
            write!(f, "\n  {:<12} {:>7}ms {mark}", step.name, step.elapsed.as_millis())?;
        }
        Ok(())
    }
}

/// Records steps while a scenario executes.
#[derive(Debug)]
pub struct Steps {
    scenario: String,
    started: Instant,
    records: Vec<StepRecord>,
    notes: Vec<(String, String)>,
}

impl Steps {
    pub fn new(scenario: impl Into<String>) -> Self {
        Self {
            scenario: scenario.into(),
            started: Instant::now(),
            records: Vec::new(),
            notes: Vec::new(),
        }
    }

    /// Run one named step, timing it.
    ///
    /// Assertion failures are prefixed with the step name; timeouts keep
    /// their type so callers can still tell them apart.
    pub fn run<T, F>(&mut self, name: &str, f: F) -> Result<T, HarnessError>
    where
        F: FnOnce() -> Result<T, HarnessError>,
    {
        let started = Instant::now();
        let result = f();
        let elapsed = started.elapsed();
        self.records.push(StepRecord {
            name: name.to_string(),
            elapsed,
            passed: result.is_ok(),
        });

        match result {
            Ok(value) => {
                debug!(
                    scenario = %self.scenario,
                    step = name,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "step passed"
                );
                Ok(value)
            }
            Err(err) => {
                warn!(scenario = %self.scenario, step = name, error = %err, "step failed");
                Err(match err {
                    HarnessError::AssertionFailed { message, buffered } => {
                        HarnessError::AssertionFailed {
                            message: format!("[{name}] {message}"),
                            buffered,
                        }
                    }
                    other => other,
                })
            }
        }
    }

    pub fn note(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.notes.push((key.into(), value.into()));
    }

    pub fn scenario(&self) -> &str {
        &self.scenario
    }

    pub fn finish(self, terminal_state: impl Into<String>) -> ScenarioReport {
        ScenarioReport {
            scenario: self.scenario,
            terminal_state: terminal_state.into(),
            steps: self.records,
            notes: self.notes,
            elapsed: self.started.elapsed(),
        }
    }
}
