// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A [`CommandExecutor`] that shells out to sg3_utils and `dd`.
//!
//! Each nexus is a block device path, optionally on a remote host reached
//! through `ssh`, so that initiators on different machines can be driven from
//! one process.

use crate::executor::CommandExecutor;
use crate::executor::CommandOutput;
use crate::executor::ExecutorError;
use crate::executor::PgrCommand;
use std::process::Command;

/// Paths to the external programs used by [`SgUtilsExecutor`].
#[derive(Debug, Clone)]
pub struct SgUtilsTools {
    /// `sg_persist`.
    pub sg_persist: String,
    /// `sg_turs`.
    pub sg_turs: String,
    /// `sg_inq`.
    pub sg_inq: String,
    /// `dd`.
    pub dd: String,
}

impl Default for SgUtilsTools {
    fn default() -> Self {
        Self {
            sg_persist: "sg_persist".into(),
            sg_turs: "sg_turs".into(),
            sg_inq: "sg_inq".into(),
            dd: "dd".into(),
        }
    }
}

/// Issues commands to a device with sg3_utils.
#[derive(Debug, Clone)]
pub struct SgUtilsExecutor {
    device: String,
    host: Option<String>,
    tools: SgUtilsTools,
}

/// The logical block size used for I/O probes.
const PROBE_BLOCK_SIZE: u32 = 512;

impl SgUtilsExecutor {
    /// Returns an executor for the local device at `device`.
    pub fn new(device: impl Into<String>, tools: SgUtilsTools) -> Self {
        Self {
            device: device.into(),
            host: None,
            tools,
        }
    }

    /// Runs the commands on `host` through `ssh` instead of locally.
    pub fn with_host(mut self, host: Option<String>) -> Self {
        self.host = host;
        self
    }

    /// Returns the argument vector for `command`, program first.
    pub fn command_line(&self, command: &PgrCommand) -> Vec<String> {
        let dev = &self.device;
        let persist = |args: Vec<String>| {
            let mut v = vec![self.tools.sg_persist.clone(), "-n".to_owned()];
            v.extend(args);
            v.push(dev.clone());
            v
        };
        let out = |action: &str, params: Vec<String>| {
            let mut args = vec!["--out".to_owned(), action.to_owned()];
            args.extend(params);
            persist(args)
        };
        match command {
            PgrCommand::ReadKeys => persist(vec!["-k".into()]),
            PgrCommand::ReadReservation => persist(vec!["-r".into()]),
            PgrCommand::Register {
                key,
                service_action_key,
            } => {
                let mut params = Vec::new();
                if !key.is_none() {
                    params.push(format!("--param-rk={key}"));
                }
                if !service_action_key.is_none() {
                    params.push(format!("--param-sark={service_action_key}"));
                }
                out("--register", params)
            }
            PgrCommand::RegisterIgnore { service_action_key } => out(
                "--register-ignore",
                vec![format!("--param-sark={service_action_key}")],
            ),
            PgrCommand::Reserve { key, rtype } => out(
                "--reserve",
                vec![
                    format!("--param-rk={key}"),
                    format!("--prout-type={}", rtype.code()),
                ],
            ),
            PgrCommand::Release { key, rtype } => out(
                "--release",
                vec![
                    format!("--param-rk={key}"),
                    format!("--prout-type={}", rtype.code()),
                ],
            ),
            PgrCommand::Clear { key } => out("--clear", vec![format!("--param-rk={key}")]),
            PgrCommand::Preempt { key, victim, rtype } => out(
                "--preempt",
                vec![
                    format!("--param-rk={key}"),
                    format!("--param-sark={victim}"),
                    format!("--prout-type={}", rtype.code()),
                ],
            ),
            PgrCommand::TestUnitReady => vec![self.tools.sg_turs.clone(), dev.clone()],
            PgrCommand::Inquiry => vec![self.tools.sg_inq.clone(), dev.clone()],
            PgrCommand::ReadBlocks { lba, count } => vec![
                self.tools.dd.clone(),
                format!("if={dev}"),
                "of=/dev/null".into(),
                format!("bs={PROBE_BLOCK_SIZE}"),
                format!("skip={lba}"),
                format!("count={count}"),
                "iflag=direct".into(),
            ],
            PgrCommand::WriteZeros { lba, count } => vec![
                self.tools.dd.clone(),
                "if=/dev/zero".into(),
                format!("of={dev}"),
                format!("bs={PROBE_BLOCK_SIZE}"),
                format!("seek={lba}"),
                format!("count={count}"),
                "oflag=direct".into(),
            ],
        }
    }

    fn process(&self, argv: Vec<String>) -> Command {
        match &self.host {
            None => {
                let mut cmd = Command::new(&argv[0]);
                cmd.args(&argv[1..]);
                cmd
            }
            Some(host) => {
                let mut cmd = Command::new("ssh");
                cmd.args(["-o", "BatchMode=yes", host.as_str(), "--"])
                    .arg(shell_words::join(&argv));
                cmd
            }
        }
    }
}

impl CommandExecutor for SgUtilsExecutor {
    fn describe(&self) -> String {
        match &self.host {
            Some(host) => format!("{host}:{}", self.device),
            None => self.device.clone(),
        }
    }

    fn execute(&self, command: &PgrCommand) -> Result<CommandOutput, ExecutorError> {
        let argv = self.command_line(command);
        let program = match self.host {
            Some(_) => "ssh".to_owned(),
            None => argv[0].clone(),
        };
        tracing::debug!(device = %self.describe(), argv = ?argv, "running command");
        let output = self
            .process(argv)
            .output()
            .map_err(|err| ExecutorError::Spawn {
                program: program.clone(),
                err,
            })?;

        let status = output
            .status
            .code()
            .ok_or(ExecutorError::Terminated { program })?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            tracing::debug!(device = %self.describe(), status, stderr = %stderr.trim(), "command stderr");
        }
        Ok(CommandOutput {
            status,
            lines: String::from_utf8_lossy(&output.stdout)
                .lines()
                .map(str::to_owned)
                .collect(),
        })
    }
}
