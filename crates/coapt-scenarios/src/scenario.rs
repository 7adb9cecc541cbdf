//! The scenario contract and scoped teardown.

use coapt_harness::{HarnessError, Session};
use tracing::{info, warn};

use crate::report::{ScenarioReport, Steps};

/// A scripted interaction over sessions the scenario owns.
pub trait Scenario {
    /// Name used in logs and the report.
    fn name(&self) -> String;

    /// Run the state machine, returning the terminal state reached.
    fn execute(&mut self, steps: &mut Steps) -> Result<String, HarnessError>;

    /// Every session the scenario owns, connected or not.
    fn sessions(&mut self) -> Vec<&mut Session>;
}

/// Execute a scenario and tear down all of its sessions, whatever the
/// outcome.
pub fn run_scenario<S: Scenario>(scenario: &mut S) -> Result<ScenarioReport, HarnessError> {
    let mut steps = Steps::new(scenario.name());
    let outcome = scenario.execute(&mut steps);

    for session in scenario.sessions() {
        session.disconnect();
    }

    match outcome {
        Ok(state) => {
            let report = steps.finish(state);
            info!(
                scenario = %report.scenario,
                state = %report.terminal_state,
                elapsed_ms = report.elapsed.as_millis() as u64,
                "scenario passed"
            );
            Ok(report)
        }
        Err(err) => {
            warn!(scenario = %steps.scenario(), error = %err, "scenario failed");
            Err(err)
        }
    }
}
