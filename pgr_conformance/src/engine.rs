// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The scenario engine.
//!
//! A [`ScenarioContext`] owns the three initiators taking part in one
//! scenario together with the oracle's prediction of the device state. Every
//! verb goes through [`ScenarioContext::act`], which checks the target's
//! status against the oracle before advancing the prediction; the `assert_*`
//! methods then compare what each initiator observes against that
//! prediction.

use pgr_initiator::Initiator;
use pgr_initiator::InitiatorError;
use pgr_model::oracle;
use pgr_model::oracle::Verb;
use pgr_model::AccessKind;
use pgr_model::DeviceState;
use pgr_model::Reservation;
use pgr_model::ReservationKey;
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;
use std::time::Instant;
use thiserror::Error;

/// How long to wait for access control to reflect a state change.
///
/// Before the first probe following a change the engine waits until `delay`
/// has passed since the change. A probe that disagrees with the oracle is
/// repeated every `poll_interval` until `timeout` elapses.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SettlePolicy {
    /// Minimum time between a state change and the first probe.
    pub delay: Duration,
    /// How long probes may keep disagreeing with the oracle.
    pub timeout: Duration,
    /// Time between repeated probes.
    pub poll_interval: Duration,
}

impl SettlePolicy {
    /// Probe once, immediately after each change.
    pub const IMMEDIATE: Self = Self {
        delay: Duration::ZERO,
        timeout: Duration::ZERO,
        poll_interval: Duration::ZERO,
    };

    /// The time left before probing after a change at `changed`.
    pub fn remaining_delay(&self, changed: Instant) -> Duration {
        self.delay.saturating_sub(changed.elapsed())
    }
}

impl Default for SettlePolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(2000),
            timeout: Duration::from_millis(10000),
            poll_interval: Duration::from_millis(250),
        }
    }
}

/// One of the three initiators taking part in a scenario.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Who {
    /// Registered by the baseline. Usually the reservation holder.
    A,
    /// Registered by the baseline.
    B,
    /// Never registered by the baseline.
    C,
}

impl Who {
    /// All initiators, in viewpoint order.
    pub const ALL: [Who; 3] = [Who::A, Who::B, Who::C];

    fn index(self) -> usize {
        self as usize
    }
}

/// The kind of observation an assertion violation was found in.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[expect(missing_docs)] // Self-describing names.
pub enum Check {
    Status,
    Reservation,
    Registrants,
    Serial,
}

impl fmt::Display for Check {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            Check::Status => "status",
            Check::Reservation => "reservation",
            Check::Registrants => "registrants",
            Check::Serial => "serial number",
        })
    }
}

/// The result of an access probe.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[expect(missing_docs)] // Self-describing names.
pub enum Outcome {
    Allowed,
    Denied,
}

impl From<bool> for Outcome {
    fn from(allowed: bool) -> Self {
        if allowed {
            Outcome::Allowed
        } else {
            Outcome::Denied
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            Outcome::Allowed => "allowed",
            Outcome::Denied => "denied",
        })
    }
}

/// A conformance finding recorded while running a scenario.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[expect(missing_docs)] // Self-describing fields.
pub enum Violation {
    /// An observation disagreed with the oracle.
    #[error("assertion violation ({check}) seen by {initiator}: {detail}")]
    Assertion {
        check: Check,
        initiator: String,
        detail: String,
    },
    /// An access probe never agreed with the oracle.
    #[error("timing violation: {access} by {initiator} still {observed} after {waited:?}, expected {expected}")]
    Timing {
        initiator: String,
        access: AccessKind,
        observed: Outcome,
        expected: Outcome,
        waited: Duration,
    },
}

/// A failure that ends a scenario early.
#[derive(Debug, Error)]
pub enum ScenarioError {
    /// A response could not be parsed, or a command could not be issued.
    #[error("infrastructure fault")]
    Infrastructure(#[source] InitiatorError),
    /// A command issued outside of an oracle check was rejected.
    #[error("unexpected rejection")]
    Rejected(#[source] InitiatorError),
    /// The device state can no longer be predicted.
    #[error("device state is indeterminate after {0}")]
    Indeterminate(String),
}

impl ScenarioError {
    /// Returns true for faults outside the device's protocol behavior.
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, ScenarioError::Infrastructure(_))
    }
}

impl From<InitiatorError> for ScenarioError {
    fn from(err: InitiatorError) -> Self {
        if err.is_infrastructure() {
            ScenarioError::Infrastructure(err)
        } else {
            ScenarioError::Rejected(err)
        }
    }
}

/// The outcome of one scenario.
#[derive(Debug)]
pub struct ScenarioReport {
    /// The scenario's full name.
    pub name: String,
    /// Findings, in the order they were recorded.
    pub violations: Vec<Violation>,
    /// The error that ended the scenario early, if any.
    pub error: Option<ScenarioError>,
}

impl ScenarioReport {
    /// Returns true if nothing was recorded and the scenario ran to the end.
    pub fn passed(&self) -> bool {
        self.violations.is_empty() && self.error.is_none()
    }

    /// Converts the report into a test result.
    pub fn into_result(self) -> anyhow::Result<()> {
        if self.passed() {
            return Ok(());
        }
        let findings: String = self
            .violations
            .iter()
            .map(|violation| format!("\n  {violation}"))
            .collect();
        match self.error {
            Some(err) if err.is_infrastructure() => Err(anyhow::Error::new(err)
                .context(format!("{} aborted{findings}", self.name))),
            Some(err) => Err(anyhow::Error::new(err)
                .context(format!("conformance failure in {}{findings}", self.name))),
            None => Err(anyhow::anyhow!(
                "conformance failure in {}{findings}",
                self.name
            )),
        }
    }
}

fn describe_reservation(reservation: Option<Reservation>) -> String {
    reservation.map_or_else(|| "no reservation".to_owned(), |r| r.to_string())
}

fn describe_keys(keys: &BTreeSet<ReservationKey>) -> String {
    let keys: Vec<_> = keys.iter().map(ToString::to_string).collect();
    format!("[{}]", keys.join(", "))
}

/// The state of one running scenario.
pub struct ScenarioContext {
    initiators: [Initiator; 3],
    state: DeviceState,
    settle: SettlePolicy,
    last_change: Option<Instant>,
    violations: Vec<Violation>,
}

impl ScenarioContext {
    /// Returns a context for initiators A, B and C, in that order.
    pub fn new(initiators: [Initiator; 3], settle: SettlePolicy) -> Self {
        Self {
            initiators,
            state: DeviceState::default(),
            settle,
            last_change: None,
            violations: Vec::new(),
        }
    }

    /// The initiator `who`.
    pub fn initiator(&self, who: Who) -> &Initiator {
        &self.initiators[who.index()]
    }

    /// The current key of initiator `who`.
    pub fn key(&self, who: Who) -> ReservationKey {
        self.initiator(who).key()
    }

    /// Consumes the context, returning the recorded violations.
    pub fn into_violations(self) -> Vec<Violation> {
        self.violations
    }

    fn record(&mut self, violation: Violation) {
        tracing::error!(%violation, "conformance violation");
        self.violations.push(violation);
    }

    /// Drives the device to the baseline: A and B registered, no
    /// reservation, confirmed from every viewpoint.
    pub fn setup(&mut self) -> Result<(), ScenarioError> {
        tracing::info!("establishing baseline");
        // A power-on or reset unit attention would otherwise fail the first
        // command below.
        self.clear_unit_attention();
        let a = &mut self.initiators[Who::A.index()];
        let key = a.key();
        a.register_and_ignore(key)?;
        a.clear()?;
        self.state = DeviceState::default();
        self.clear_unit_attention();

        self.act(Who::A, Verb::Register)?;
        self.act(Who::B, Verb::Register)?;
        let recorded = self.violations.len();
        self.assert_registrants()?;
        self.assert_reservation()?;
        if self.violations.len() != recorded {
            return Err(ScenarioError::Indeterminate("baseline setup".into()));
        }
        tracing::info!(state = %self.state, "baseline established");
        Ok(())
    }

    /// Clears the device, logging failures.
    pub fn teardown(&mut self) {
        tracing::info!("teardown");
        self.clear_unit_attention();
        let a = &mut self.initiators[Who::A.index()];
        let key = a.key();
        let result = a.register_and_ignore(key).and_then(|()| a.clear());
        if let Err(err) = result {
            tracing::warn!(
                error = &err as &dyn std::error::Error,
                "failed to clear the device after the scenario"
            );
        }
        self.clear_unit_attention();
    }

    /// Issues `verb` from `who` and checks the status against the oracle.
    ///
    /// A status the oracle did not predict is recorded, and the scenario
    /// cannot continue since the device state is unknown.
    pub fn act(&mut self, who: Who, verb: Verb) -> Result<(), ScenarioError> {
        let initiator = &mut self.initiators[who.index()];
        let expected = oracle::expect(&self.state, initiator.key(), &verb);
        tracing::info!(
            initiator = initiator.name(),
            ?verb,
            accepted = expected.accepted,
            "act"
        );
        let status = match initiator.perform(&verb) {
            Ok(()) => None,
            Err(InitiatorError::Rejected(rejected)) => Some(rejected.status),
            Err(err) => return Err(ScenarioError::Infrastructure(err)),
        };
        if status.is_none() != expected.accepted {
            let name = initiator.name().to_owned();
            let detail = match status {
                None => format!("{verb:?} was accepted, expected a rejection"),
                Some(status) => {
                    format!("{verb:?} was rejected with status {status}, expected success")
                }
            };
            self.record(Violation::Assertion {
                check: Check::Status,
                initiator: name.clone(),
                detail,
            });
            return Err(ScenarioError::Indeterminate(format!("{verb:?} from {name}")));
        }
        if expected.accepted {
            if !expected.next.is_consistent() {
                tracing::error!(state = %expected.next, "oracle predicted an inconsistent state");
                return Err(ScenarioError::Indeterminate(format!(
                    "{verb:?} from {}",
                    initiator.name()
                )));
            }
            self.state = expected.next;
            self.last_change = Some(Instant::now());
            self.clear_unit_attention();
        }
        Ok(())
    }

    /// Consumes pending unit attentions so that later statuses reflect
    /// reservation state.
    fn clear_unit_attention(&self) {
        for initiator in &self.initiators {
            if let Err(err) = initiator.run_tur() {
                tracing::debug!(
                    initiator = initiator.name(),
                    error = &err as &dyn std::error::Error,
                    "test unit ready failed"
                );
            }
        }
    }

    /// Checks the reservation from every viewpoint.
    pub fn assert_reservation(&mut self) -> Result<(), ScenarioError> {
        for who in Who::ALL {
            let initiator = &self.initiators[who.index()];
            let name = initiator.name().to_owned();
            let observed = match initiator.get_reservation() {
                Ok(query) => query.reservation(),
                Err(InitiatorError::Rejected(rejected)) => {
                    self.record(Violation::Assertion {
                        check: Check::Reservation,
                        initiator: name,
                        detail: format!("read reservation rejected with status {}", rejected.status),
                    });
                    continue;
                }
                Err(err) => return Err(ScenarioError::Infrastructure(err)),
            };
            let matches = match (&self.state.reservation, &observed) {
                (None, None) => true,
                (Some(expected), Some(observed)) => {
                    expected.matches_observed(observed, &self.state.registrants)
                }
                _ => false,
            };
            if !matches {
                let detail = format!(
                    "observed {}, expected {}",
                    describe_reservation(observed),
                    describe_reservation(self.state.reservation)
                );
                self.record(Violation::Assertion {
                    check: Check::Reservation,
                    initiator: name,
                    detail,
                });
            }
        }
        Ok(())
    }

    /// Checks the registered keys from every viewpoint.
    pub fn assert_registrants(&mut self) -> Result<(), ScenarioError> {
        for who in Who::ALL {
            let initiator = &self.initiators[who.index()];
            let name = initiator.name().to_owned();
            let observed = match initiator.get_registrants() {
                Ok(keys) => keys,
                Err(InitiatorError::Rejected(rejected)) => {
                    self.record(Violation::Assertion {
                        check: Check::Registrants,
                        initiator: name,
                        detail: format!("read keys rejected with status {}", rejected.status),
                    });
                    continue;
                }
                Err(err) => return Err(ScenarioError::Infrastructure(err)),
            };
            if observed != self.state.registrants {
                let detail = format!(
                    "observed {}, expected {}",
                    describe_keys(&observed),
                    describe_keys(&self.state.registrants)
                );
                self.record(Violation::Assertion {
                    check: Check::Registrants,
                    initiator: name,
                    detail,
                });
            }
        }
        Ok(())
    }

    /// Probes read and write access from every viewpoint.
    pub fn assert_access(&mut self) -> Result<(), ScenarioError> {
        for who in Who::ALL {
            for access in [AccessKind::Read, AccessKind::Write] {
                self.probe(who, access)?;
            }
        }
        Ok(())
    }

    fn probe(&mut self, who: Who, access: AccessKind) -> Result<(), ScenarioError> {
        let expected = oracle::access_allowed(&self.state, self.key(who), access);
        if let Some(changed) = self.last_change {
            let remaining = self.settle.remaining_delay(changed);
            if !remaining.is_zero() {
                std::thread::sleep(remaining);
            }
        }
        let start = Instant::now();
        loop {
            let initiator = &self.initiators[who.index()];
            let result = match access {
                AccessKind::Read => initiator.read_from_target(),
                AccessKind::Write => initiator.write_to_target(),
            };
            let allowed = match result {
                Ok(()) => true,
                Err(InitiatorError::Rejected(_)) => false,
                Err(err) => return Err(ScenarioError::Infrastructure(err)),
            };
            tracing::debug!(initiator = initiator.name(), %access, allowed, expected, "probe");
            if allowed == expected {
                return Ok(());
            }
            let waited = start.elapsed();
            if waited >= self.settle.timeout {
                let name = initiator.name().to_owned();
                self.record(Violation::Timing {
                    initiator: name,
                    access,
                    observed: allowed.into(),
                    expected: expected.into(),
                    waited,
                });
                return Ok(());
            }
            std::thread::sleep(self.settle.poll_interval);
        }
    }

    /// Checks that every initiator sees the same unit serial number.
    pub fn assert_serial_consistent(&mut self) -> Result<(), ScenarioError> {
        let mut serials = Vec::new();
        for initiator in &self.initiators {
            serials.push((initiator.name().to_owned(), initiator.inquiry_serial()?));
        }
        let (reference_name, reference) = serials[0].clone();
        if reference.is_none() {
            self.record(Violation::Assertion {
                check: Check::Serial,
                initiator: reference_name.clone(),
                detail: "no unit serial number reported".into(),
            });
        }
        for (name, serial) in serials.into_iter().skip(1) {
            if serial != reference {
                self.record(Violation::Assertion {
                    check: Check::Serial,
                    initiator: name,
                    detail: format!(
                        "observed {serial:?}, {reference_name} observed {reference:?}"
                    ),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_prefixes() {
        let report = ScenarioReport {
            name: "exclusive_access::can_reserve".into(),
            violations: vec![Violation::Timing {
                initiator: "B".into(),
                access: AccessKind::Read,
                observed: Outcome::Allowed,
                expected: Outcome::Denied,
                waited: Duration::ZERO,
            }],
            error: None,
        };
        assert!(!report.passed());
        let message = format!("{:#}", report.into_result().unwrap_err());
        assert!(message.starts_with("conformance failure in exclusive_access::can_reserve"));
        assert!(message.contains("timing violation: read by B still allowed"));

        let report = ScenarioReport {
            name: "registration::unregister_removes_key".into(),
            violations: Vec::new(),
            error: Some(ScenarioError::Indeterminate("baseline setup".into())),
        };
        let message = format!("{:#}", report.into_result().unwrap_err());
        assert!(message.ends_with("device state is indeterminate after baseline setup"));
    }

    #[test]
    fn passing_report() {
        let report = ScenarioReport {
            name: "registration::registrants_visible_to_all".into(),
            violations: Vec::new(),
            error: None,
        };
        assert!(report.passed());
        report.into_result().unwrap();
    }

    #[test]
    fn default_settle_policy() {
        let policy = SettlePolicy::default();
        assert_eq!(policy.delay, Duration::from_secs(2));
        assert_eq!(policy.timeout, Duration::from_secs(10));
        assert_eq!(policy.poll_interval, Duration::from_millis(250));
    }

    #[test]
    fn remaining_delay_saturates() {
        let changed = Instant::now();
        assert_eq!(SettlePolicy::IMMEDIATE.remaining_delay(changed), Duration::ZERO);
        let forever = SettlePolicy {
            delay: Duration::MAX,
            ..SettlePolicy::IMMEDIATE
        };
        assert!(forever.remaining_delay(changed) > Duration::from_secs(3600));
    }
}
