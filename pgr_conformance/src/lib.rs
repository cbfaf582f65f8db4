// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Conformance tests for SCSI-3 persistent group reservations.
//!
//! Three initiators, each an I_T nexus to the same logical unit, are driven
//! through the scenarios in [`scenarios`]. Every status and observation is
//! checked against the protocol oracle in [`pgr_model::oracle`]. The
//! scenarios run as libtest-mimic trials through [`test_main`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod engine;
pub mod factory;
pub mod logging;
pub mod scenarios;

pub use engine::ScenarioContext;
pub use engine::ScenarioError;
pub use engine::ScenarioReport;
pub use engine::SettlePolicy;
pub use engine::Violation;
pub use engine::Who;
pub use factory::InitiatorFactory;

use pgr_model::ReservationType;
use scenarios::Scenario;
use std::sync::Arc;

/// What to run, and against which device.
#[derive(Clone)]
pub struct SuiteConfig {
    /// Builds the initiators for each scenario.
    pub factory: Arc<dyn InitiatorFactory>,
    /// Probe settling parameters.
    pub settle: SettlePolicy,
    /// The reservation types to exercise.
    pub types: Vec<ReservationType>,
}

/// Runs `scenario` from baseline setup to teardown.
pub fn run_scenario(
    factory: &dyn InitiatorFactory,
    settle: SettlePolicy,
    scenario: &Scenario,
) -> ScenarioReport {
    let name = scenario.name();
    let span = tracing::info_span!("scenario", %name);
    let _enter = span.enter();

    let mut cx = ScenarioContext::new(factory.initiators(), settle);
    let result = cx.setup().and_then(|()| scenario.run(&mut cx));
    cx.teardown();
    let report = ScenarioReport {
        name,
        violations: cx.into_violations(),
        error: result.err(),
    };
    if report.passed() {
        tracing::info!("scenario passed");
    } else {
        tracing::error!(
            violations = report.violations.len(),
            aborted = report.error.is_some(),
            "scenario failed"
        );
    }
    report
}

/// Returns one trial per scenario in `config`.
pub fn trials(config: &SuiteConfig) -> Vec<libtest_mimic::Trial> {
    scenarios::catalogue(&config.types)
        .into_iter()
        .map(|scenario| {
            let factory = config.factory.clone();
            let settle = config.settle;
            libtest_mimic::Trial::test(scenario.name(), move || {
                run_scenario(factory.as_ref(), settle, &scenario)
                    .into_result()
                    .map_err(|err| format!("{err:#}").into())
            })
        })
        .collect()
}

/// Runs the suite with the given libtest-mimic arguments and exits.
pub fn test_main(config: SuiteConfig, mut args: libtest_mimic::Arguments) -> ! {
    // Scenarios share one device, so they can never run concurrently.
    if !matches!(args.test_threads, None | Some(1)) {
        eprintln!("warning: ignoring value passed to --test-threads, using 1");
    }
    args.test_threads = Some(1);

    tracing::info!(device = %config.factory.describe(), "running conformance suite");
    libtest_mimic::run(&args, trials(&config)).exit()
}
