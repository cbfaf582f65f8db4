// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! An initiator-side view of a device supporting persistent reservations.
//!
//! An [`Initiator`] represents one I_T nexus. It owns the nexus's reservation
//! key and a [`CommandExecutor`] bound to the device, and exposes the
//! persistent reservation verbs plus the probes needed to check access
//! control. It never retries: whatever status the target returns is surfaced
//! to the caller unchanged.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod executor;
pub mod response;
pub mod sg_utils;

use executor::CommandExecutor;
use executor::CommandOutput;
use executor::ExecutorError;
use executor::PgrCommand;
use pgr_model::oracle::Verb;
use pgr_model::ReservationKey;
use pgr_model::ReservationType;
use response::ParseError;
use response::ReservationQuery;
use std::collections::BTreeSet;
use thiserror::Error;

/// The target rejected a command with a nonzero status.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{command} from {initiator} rejected with status {status}")]
pub struct CommandRejected {
    /// The initiator that issued the command.
    pub initiator: String,
    /// The command name.
    pub command: &'static str,
    /// The raw status returned by the executor.
    pub status: i32,
}

/// An error issuing a command through an [`Initiator`].
#[derive(Debug, Error)]
pub enum InitiatorError {
    /// The target rejected the command.
    #[error(transparent)]
    Rejected(CommandRejected),
    /// The response could not be parsed.
    #[error("malformed {command} response from {initiator}")]
    Malformed {
        /// The initiator that issued the command.
        initiator: String,
        /// The command name.
        command: &'static str,
        /// The parse failure.
        #[source]
        err: ParseError,
    },
    /// The command could not be executed at all.
    #[error("failed to issue {command} from {initiator}")]
    Executor {
        /// The initiator that issued the command.
        initiator: String,
        /// The command name.
        command: &'static str,
        /// The transport failure.
        #[source]
        err: ExecutorError,
    },
}

impl InitiatorError {
    /// Returns the target's status if the command was rejected.
    pub fn rejected_status(&self) -> Option<i32> {
        match self {
            InitiatorError::Rejected(rejected) => Some(rejected.status),
            _ => None,
        }
    }

    /// Returns true if this is an infrastructure failure rather than a
    /// protocol-level rejection.
    pub fn is_infrastructure(&self) -> bool {
        !matches!(self, InitiatorError::Rejected(_))
    }
}

/// The block read by [`Initiator::read_from_target`].
pub const READ_PROBE_LBA: u64 = 0;
/// The block overwritten with zeros by [`Initiator::write_to_target`].
pub const WRITE_PROBE_LBA: u64 = 1;

/// One I_T nexus to the device under test.
pub struct Initiator {
    name: String,
    key: ReservationKey,
    executor: Box<dyn CommandExecutor>,
}

impl Initiator {
    /// Returns a new initiator called `name`, using reservation key `key`
    /// and issuing commands through `executor`.
    pub fn new(
        name: impl Into<String>,
        key: ReservationKey,
        executor: Box<dyn CommandExecutor>,
    ) -> Self {
        Self {
            name: name.into(),
            key,
            executor,
        }
    }

    /// The initiator's name, used in diagnostics.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The initiator's current reservation key.
    pub fn key(&self) -> ReservationKey {
        self.key
    }

    fn run(&self, command: PgrCommand) -> Result<CommandOutput, InitiatorError> {
        let output = self
            .executor
            .execute(&command)
            .map_err(|err| InitiatorError::Executor {
                initiator: self.name.clone(),
                command: command.name(),
                err,
            })?;
        tracing::debug!(
            initiator = %self.name,
            key = %self.key,
            %command,
            status = output.status,
            lines = output.lines.len(),
            "command complete"
        );
        if output.status != 0 {
            return Err(InitiatorError::Rejected(CommandRejected {
                initiator: self.name.clone(),
                command: command.name(),
                status: output.status,
            }));
        }
        Ok(output)
    }

    fn parse<T>(
        &self,
        command: PgrCommand,
        parse: impl FnOnce(&[String]) -> Result<T, ParseError>,
    ) -> Result<T, InitiatorError> {
        let name = command.name();
        let output = self.run(command)?;
        parse(&output.lines).map_err(|err| InitiatorError::Malformed {
            initiator: self.name.clone(),
            command: name,
            err,
        })
    }

    /// Registers this nexus with its key.
    pub fn register(&self) -> Result<(), InitiatorError> {
        self.run(PgrCommand::Register {
            key: ReservationKey::NONE,
            service_action_key: self.key,
        })
        .map(drop)
    }

    /// Removes this nexus's registration.
    pub fn unregister(&self) -> Result<(), InitiatorError> {
        self.run(PgrCommand::Register {
            key: self.key,
            service_action_key: ReservationKey::NONE,
        })
        .map(drop)
    }

    /// Replaces this nexus's registration with `new_key`, regardless of the
    /// currently registered key. On success the initiator uses `new_key` from
    /// then on.
    pub fn register_and_ignore(&mut self, new_key: ReservationKey) -> Result<(), InitiatorError> {
        self.run(PgrCommand::RegisterIgnore {
            service_action_key: new_key,
        })?;
        tracing::debug!(initiator = %self.name, old = %self.key, new = %new_key, "key replaced");
        self.key = new_key;
        Ok(())
    }

    /// Reserves the device with type `rtype`.
    pub fn reserve(&self, rtype: ReservationType) -> Result<(), InitiatorError> {
        self.run(PgrCommand::Reserve {
            key: self.key,
            rtype,
        })
        .map(drop)
    }

    /// Releases a reservation of type `rtype`.
    pub fn release(&self, rtype: ReservationType) -> Result<(), InitiatorError> {
        self.run(PgrCommand::Release {
            key: self.key,
            rtype,
        })
        .map(drop)
    }

    /// Clears all registrations and the reservation.
    pub fn clear(&self) -> Result<(), InitiatorError> {
        self.run(PgrCommand::Clear { key: self.key }).map(drop)
    }

    /// Preempts the registration of `victim`, taking over its reservation
    /// with type `rtype` if it held one.
    pub fn preempt(
        &self,
        victim: ReservationKey,
        rtype: ReservationType,
    ) -> Result<(), InitiatorError> {
        self.run(PgrCommand::Preempt {
            key: self.key,
            victim,
            rtype,
        })
        .map(drop)
    }

    /// Issues the command for `verb`.
    pub fn perform(&mut self, verb: &Verb) -> Result<(), InitiatorError> {
        match *verb {
            Verb::Register => self.register(),
            Verb::Unregister => self.unregister(),
            Verb::RegisterAndIgnore { new_key } => self.register_and_ignore(new_key),
            Verb::Reserve(rtype) => self.reserve(rtype),
            Verb::Release(rtype) => self.release(rtype),
            Verb::Clear => self.clear(),
            Verb::Preempt { victim, rtype } => self.preempt(victim, rtype),
        }
    }

    /// Reads the current reservation.
    pub fn get_reservation(&self) -> Result<ReservationQuery, InitiatorError> {
        let query = self.parse(PgrCommand::ReadReservation, response::parse_reservation)?;
        tracing::debug!(initiator = %self.name, ?query, "read reservation");
        Ok(query)
    }

    /// Reads the registered keys.
    pub fn get_registrants(&self) -> Result<BTreeSet<ReservationKey>, InitiatorError> {
        self.parse(PgrCommand::ReadKeys, response::parse_registrants)
    }

    /// Reads one block through this nexus. Succeeds only if access control
    /// permits the read.
    pub fn read_from_target(&self) -> Result<(), InitiatorError> {
        self.run(PgrCommand::ReadBlocks {
            lba: READ_PROBE_LBA,
            count: 1,
        })
        .map(drop)
    }

    /// Writes one zeroed block through this nexus. Succeeds only if access
    /// control permits the write.
    pub fn write_to_target(&self) -> Result<(), InitiatorError> {
        self.run(PgrCommand::WriteZeros {
            lba: WRITE_PROBE_LBA,
            count: 1,
        })
        .map(drop)
    }

    /// Issues TEST UNIT READY, consuming any pending unit attention so that
    /// later statuses reflect reservation conflicts.
    pub fn run_tur(&self) -> Result<(), InitiatorError> {
        self.run(PgrCommand::TestUnitReady).map(drop)
    }

    /// Returns the device's unit serial number, if it reports one.
    pub fn inquiry_serial(&self) -> Result<Option<String>, InitiatorError> {
        let output = self.run(PgrCommand::Inquiry)?;
        Ok(response::parse_inquiry_serial(&output.lines))
    }
}

impl std::fmt::Debug for Initiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Initiator")
            .field("name", &self.name)
            .field("key", &self.key)
            .field("device", &self.executor.describe())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::Arc;

    /// Records commands and replays canned outputs.
    struct Scripted {
        issued: Arc<Mutex<Vec<PgrCommand>>>,
        replies: Mutex<VecDeque<CommandOutput>>,
    }

    impl CommandExecutor for Scripted {
        fn describe(&self) -> String {
            "scripted".into()
        }

        fn execute(&self, command: &PgrCommand) -> Result<CommandOutput, ExecutorError> {
            self.issued.lock().push(command.clone());
            self.replies
                .lock()
                .pop_front()
                .ok_or(ExecutorError::Unsupported("unscripted command"))
        }
    }

    fn scripted(
        key: u64,
        replies: impl IntoIterator<Item = CommandOutput>,
    ) -> (Initiator, Arc<Mutex<Vec<PgrCommand>>>) {
        let issued = Arc::new(Mutex::new(Vec::new()));
        let executor = Scripted {
            issued: issued.clone(),
            replies: Mutex::new(replies.into_iter().collect()),
        };
        (
            Initiator::new("A", ReservationKey(key), Box::new(executor)),
            issued,
        )
    }

    fn lines(lines: &[&str]) -> CommandOutput {
        CommandOutput::ok(lines.iter().map(|s| (*s).to_owned()).collect())
    }

    #[test]
    fn verbs_map_to_commands() {
        let (mut init, issued) = scripted(0x1, std::iter::repeat(CommandOutput::default()).take(5));
        init.register().unwrap();
        init.reserve(ReservationType::ExclusiveAccess).unwrap();
        init.release(ReservationType::ExclusiveAccess).unwrap();
        init.register_and_ignore(ReservationKey(0x11)).unwrap();
        init.unregister().unwrap();
        assert_eq!(init.key(), ReservationKey(0x11));
        assert_eq!(
            *issued.lock(),
            [
                PgrCommand::Register {
                    key: ReservationKey::NONE,
                    service_action_key: ReservationKey(0x1)
                },
                PgrCommand::Reserve {
                    key: ReservationKey(0x1),
                    rtype: ReservationType::ExclusiveAccess
                },
                PgrCommand::Release {
                    key: ReservationKey(0x1),
                    rtype: ReservationType::ExclusiveAccess
                },
                PgrCommand::RegisterIgnore {
                    service_action_key: ReservationKey(0x11)
                },
                PgrCommand::Register {
                    key: ReservationKey(0x11),
                    service_action_key: ReservationKey::NONE
                },
            ]
        );
    }

    #[test]
    fn rejection_surfaces_raw_status() {
        let (init, issued) = scripted(0x2, [CommandOutput::failed(24)]);
        let err = init.reserve(ReservationType::WriteExclusive).unwrap_err();
        assert_eq!(err.rejected_status(), Some(24));
        assert!(!err.is_infrastructure());
        // No retry.
        assert_eq!(issued.lock().len(), 1);
    }

    #[test]
    fn failed_key_rotation_keeps_key() {
        let (mut init, _) = scripted(0x2, [CommandOutput::failed(1)]);
        init.register_and_ignore(ReservationKey(0x22)).unwrap_err();
        assert_eq!(init.key(), ReservationKey(0x2));
    }

    #[test]
    fn parsed_queries() {
        let (init, _) = scripted(
            0x1,
            [
                lines(&[
                    "  PR generation=0x3, Reservation follows:",
                    "    Key=0x1",
                    "    scope: LU_SCOPE,  type: Exclusive Access",
                ]),
                lines(&[
                    "  PR generation=0x3, 2 registered reservation keys follow:",
                    "    0x1",
                    "    0x2",
                ]),
                lines(&["garbage"]),
            ],
        );
        assert_eq!(
            init.get_reservation().unwrap(),
            ReservationQuery::Present {
                key: ReservationKey(1),
                rtype: ReservationType::ExclusiveAccess
            }
        );
        assert_eq!(
            init.get_registrants().unwrap(),
            BTreeSet::from([ReservationKey(1), ReservationKey(2)])
        );
        let err = init.get_reservation().unwrap_err();
        assert!(matches!(err, InitiatorError::Malformed { .. }));
        assert!(err.is_infrastructure());
    }

    #[test]
    fn transport_failure_is_infrastructure() {
        let (init, _) = scripted(0x1, []);
        let err = init.run_tur().unwrap_err();
        assert!(matches!(err, InitiatorError::Executor { .. }));
        assert_eq!(err.rejected_status(), None);
    }
}
