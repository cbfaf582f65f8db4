// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The command executor contract.
//!
//! An executor issues one command against the device it is bound to and
//! reports the exit status and text output. Everything above this layer is
//! transport-agnostic.

use pgr_model::ReservationKey;
use pgr_model::ReservationType;
use std::fmt;
use thiserror::Error;

/// A command issued to a device through one I_T nexus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PgrCommand {
    /// PERSISTENT RESERVE IN, READ KEYS.
    ReadKeys,
    /// PERSISTENT RESERVE IN, READ RESERVATION.
    ReadReservation,
    /// PERSISTENT RESERVE OUT, REGISTER.
    Register {
        /// The currently registered key, or zero.
        key: ReservationKey,
        /// The new key, or zero to unregister.
        service_action_key: ReservationKey,
    },
    /// PERSISTENT RESERVE OUT, REGISTER AND IGNORE EXISTING KEY.
    RegisterIgnore {
        /// The new key, or zero to unregister.
        service_action_key: ReservationKey,
    },
    /// PERSISTENT RESERVE OUT, RESERVE.
    Reserve {
        /// The caller's registered key.
        key: ReservationKey,
        /// The reservation type.
        rtype: ReservationType,
    },
    /// PERSISTENT RESERVE OUT, RELEASE.
    Release {
        /// The caller's registered key.
        key: ReservationKey,
        /// The reservation type.
        rtype: ReservationType,
    },
    /// PERSISTENT RESERVE OUT, CLEAR.
    Clear {
        /// The caller's registered key.
        key: ReservationKey,
    },
    /// PERSISTENT RESERVE OUT, PREEMPT.
    Preempt {
        /// The caller's registered key.
        key: ReservationKey,
        /// The key whose registration is preempted.
        victim: ReservationKey,
        /// The type of the resulting reservation.
        rtype: ReservationType,
    },
    /// TEST UNIT READY.
    TestUnitReady,
    /// INQUIRY, including the unit serial number VPD page.
    Inquiry,
    /// Read `count` blocks starting at `lba`.
    ReadBlocks {
        /// The first logical block.
        lba: u64,
        /// The number of blocks.
        count: u32,
    },
    /// Write `count` zeroed blocks starting at `lba`.
    WriteZeros {
        /// The first logical block.
        lba: u64,
        /// The number of blocks.
        count: u32,
    },
}

impl PgrCommand {
    /// Returns a short name for the command, for logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            PgrCommand::ReadKeys => "read keys",
            PgrCommand::ReadReservation => "read reservation",
            PgrCommand::Register { .. } => "register",
            PgrCommand::RegisterIgnore { .. } => "register and ignore existing key",
            PgrCommand::Reserve { .. } => "reserve",
            PgrCommand::Release { .. } => "release",
            PgrCommand::Clear { .. } => "clear",
            PgrCommand::Preempt { .. } => "preempt",
            PgrCommand::TestUnitReady => "test unit ready",
            PgrCommand::Inquiry => "inquiry",
            PgrCommand::ReadBlocks { .. } => "read",
            PgrCommand::WriteZeros { .. } => "write",
        }
    }
}

impl fmt::Display for PgrCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.name())
    }
}

/// The result of executing a [`PgrCommand`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// The exit status. Zero means the target accepted the command.
    pub status: i32,
    /// The text output, one entry per line.
    pub lines: Vec<String>,
}

impl CommandOutput {
    /// Returns a successful output with the given lines.
    pub fn ok(lines: Vec<String>) -> Self {
        Self { status: 0, lines }
    }

    /// Returns a failed output with no lines.
    pub fn failed(status: i32) -> Self {
        Self {
            status,
            lines: Vec::new(),
        }
    }
}

/// An executor could not run a command at all.
///
/// This is an infrastructure failure, distinct from the target rejecting the
/// command.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// The transport program could not be started.
    #[error("failed to launch {program}")]
    Spawn {
        /// The program that failed to start.
        program: String,
        /// The underlying error.
        #[source]
        err: std::io::Error,
    },
    /// The program was terminated without an exit status.
    #[error("{program} terminated by a signal")]
    Terminated {
        /// The program that was terminated.
        program: String,
    },
    /// The transport does not support the command.
    #[error("{0} is not supported by this transport")]
    Unsupported(&'static str),
}

/// Trait implemented by transports that can issue commands to a device
/// through one I_T nexus.
pub trait CommandExecutor: Send {
    /// Returns a description of the device and nexus, for diagnostics.
    fn describe(&self) -> String;

    /// Executes `command` and returns its status and output.
    ///
    /// A nonzero status is a protocol-level rejection and must be reported
    /// through [`CommandOutput::status`], never as an error.
    fn execute(&self, command: &PgrCommand) -> Result<CommandOutput, ExecutorError>;
}

impl<T: CommandExecutor + ?Sized> CommandExecutor for Box<T> {
    fn describe(&self) -> String {
        (**self).describe()
    }

    fn execute(&self, command: &PgrCommand) -> Result<CommandOutput, ExecutorError> {
        (**self).execute(command)
    }
}
