// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Tracing subscriber setup for the runner and for tests.

use anyhow::Context as _;
use std::fs::File;
use std::io::Stderr;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::fmt::writer::EitherWriter;
use tracing_subscriber::fmt::writer::Tee;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::fmt::TestWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// The environment variable holding the log filter, in
/// [`Targets`] directive syntax.
pub const LOG_ENV: &str = "PGR_LOG";

fn targets() -> anyhow::Result<Targets> {
    match std::env::var(LOG_ENV) {
        Ok(var) => var
            .parse()
            .with_context(|| format!("invalid {LOG_ENV} filter '{var}'")),
        Err(_) => Ok(Targets::new().with_default(LevelFilter::DEBUG)),
    }
}

fn try_init<W>(writer: W) -> anyhow::Result<()>
where
    W: for<'a> MakeWriter<'a> + Send + Sync + 'static,
{
    let targets = targets()?;
    tracing_subscriber::fmt()
        .compact()
        .with_ansi(false) // avoid polluting logs with escape sequences
        .log_internal_errors(true)
        .with_writer(writer)
        .with_max_level(LevelFilter::TRACE)
        .finish()
        .with(targets)
        .try_init()
        .context("failed to install the tracing subscriber")
}

/// Installs the runner's subscriber, logging to stderr and, if given, to
/// `log_file`.
pub fn try_init_tracing(log_file: Option<File>) -> anyhow::Result<()> {
    try_init(RunnerWriter { log_file })
}

/// Installs a subscriber writing through the test harness's capture, if no
/// subscriber is installed yet.
pub fn init_test_tracing() {
    // Another test in the same binary may have installed it already.
    let _ = try_init(TestWriter::new);
}

struct RunnerWriter {
    log_file: Option<File>,
}

impl<'a> MakeWriter<'a> for RunnerWriter {
    type Writer = EitherWriter<Stderr, Tee<Stderr, &'a File>>;

    fn make_writer(&'a self) -> Self::Writer {
        match &self.log_file {
            Some(log_file) => EitherWriter::B(Tee::new(std::io::stderr(), log_file)),
            None => EitherWriter::A(std::io::stderr()),
        }
    }
}
