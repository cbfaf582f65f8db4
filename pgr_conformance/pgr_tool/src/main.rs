// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Runs the persistent reservation conformance suite against a device.
//!
//! Each scenario is a libtest trial, so the usual filtering and listing
//! arguments apply:
//!
//! ```text
//! pgr_tool --initiator /dev/sdb=0x1 --initiator node2:/dev/sdb=0x2 \
//!     --initiator node3:/dev/sdb=0x3 exclusive_access::
//! ```

#![forbid(unsafe_code)]

use anyhow::Context as _;
use clap::Parser;
use pgr_conformance::factory::DeviceFactory;
use pgr_conformance::factory::EmulatedFactory;
use pgr_conformance::factory::NexusSpec;
use pgr_conformance::InitiatorFactory;
use pgr_conformance::SettlePolicy;
use pgr_conformance::SuiteConfig;
use pgr_emulated_target::EmulatedTarget;
use pgr_initiator::sg_utils::SgUtilsTools;
use pgr_model::ReservationType;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// SCSI-3 persistent group reservation conformance suite.
///
/// Log filtering is controlled with the PGR_LOG environment variable.
#[derive(Parser)]
#[clap(name = "pgr_tool")]
struct Options {
    /// An I_T nexus to the device under test. Give three: the reservation
    /// holder, a second registrant, and a non-registrant, in that order.
    #[clap(
        long = "initiator",
        value_name = "[HOST:]DEVICE=KEY",
        required_unless_present = "emulate",
        conflicts_with = "emulate"
    )]
    initiators: Vec<NexusSpec>,

    /// Run against an in-memory emulated target instead of a device.
    #[clap(long)]
    emulate: bool,

    /// Milliseconds to wait after a state change before probing access.
    #[clap(long, value_name = "MS", default_value_t = 2000)]
    settle_delay: u64,

    /// Milliseconds a probe may keep disagreeing before it is reported.
    #[clap(long, value_name = "MS", default_value_t = 10000)]
    settle_timeout: u64,

    /// Milliseconds between repeated probes.
    #[clap(long, value_name = "MS", default_value_t = 250)]
    poll_interval: u64,

    /// The sg_persist binary.
    #[clap(long, value_name = "PATH", default_value = "sg_persist")]
    sg_persist: String,

    /// The sg_turs binary.
    #[clap(long, value_name = "PATH", default_value = "sg_turs")]
    sg_turs: String,

    /// The sg_inq binary.
    #[clap(long, value_name = "PATH", default_value = "sg_inq")]
    sg_inq: String,

    /// The dd binary.
    #[clap(long, value_name = "PATH", default_value = "dd")]
    dd: String,

    /// Also write the log to this file.
    #[clap(long, value_name = "PATH")]
    log_file: Option<PathBuf>,

    /// Only exercise this reservation type. May be repeated.
    #[clap(long = "type", value_name = "TYPE", value_parser = parse_type)]
    types: Vec<ReservationType>,

    #[clap(flatten)]
    inner: libtest_mimic::Arguments,
}

/// Parses a reservation type from its name, identifier or type code.
fn parse_type(s: &str) -> Result<ReservationType, String> {
    let by_code = s.parse().ok().and_then(ReservationType::from_code);
    by_code
        .or_else(|| ReservationType::from_name(s))
        .ok_or_else(|| {
            let known: Vec<_> = ReservationType::ALL
                .iter()
                .map(|rtype| rtype.rules().ident)
                .collect();
            format!("unknown reservation type, expected one of {}", known.join(", "))
        })
}

fn factory(opts: &mut Options) -> anyhow::Result<Arc<dyn InitiatorFactory>> {
    if opts.emulate {
        return Ok(Arc::new(EmulatedFactory::new(EmulatedTarget::new())));
    }
    let count = opts.initiators.len();
    let nexuses: [NexusSpec; 3] = std::mem::take(&mut opts.initiators)
        .try_into()
        .map_err(|_| anyhow::anyhow!("expected three --initiator arguments, got {count}"))?;
    let keys: BTreeSet<_> = nexuses.iter().map(|nexus| nexus.key).collect();
    if keys.len() != nexuses.len() {
        anyhow::bail!("each --initiator must use a distinct reservation key");
    }
    let tools = SgUtilsTools {
        sg_persist: opts.sg_persist.clone(),
        sg_turs: opts.sg_turs.clone(),
        sg_inq: opts.sg_inq.clone(),
        dd: opts.dd.clone(),
    };
    Ok(Arc::new(DeviceFactory::new(nexuses, tools)))
}

fn try_main() -> anyhow::Result<()> {
    let mut opts = Options::parse();

    let log_file: Option<std::fs::File> = match &opts.log_file {
        Some(path) => Some(
            fs_err::File::create(path)
                .context("failed to create log file")?
                .into(),
        ),
        None => None,
    };
    pgr_conformance::logging::try_init_tracing(log_file)
        .context("failed to initialize tracing")?;

    let factory = factory(&mut opts)?;
    let types = if opts.types.is_empty() {
        ReservationType::ALL.to_vec()
    } else {
        opts.types
    };
    let config = SuiteConfig {
        factory,
        settle: SettlePolicy {
            delay: Duration::from_millis(opts.settle_delay),
            timeout: Duration::from_millis(opts.settle_timeout),
            poll_interval: Duration::from_millis(opts.poll_interval),
        },
        types,
    };
    pgr_conformance::test_main(config, opts.inner)
}

fn main() {
    if let Err(err) = try_main() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pgr_model::ReservationKey;

    #[test]
    fn type_names() {
        assert_eq!(
            parse_type("exclusive_access").unwrap(),
            ReservationType::ExclusiveAccess
        );
        assert_eq!(
            parse_type("Write Exclusive, all registrants").unwrap(),
            ReservationType::WriteExclusiveAllRegistrants
        );
        assert_eq!(
            parse_type("6").unwrap(),
            ReservationType::ExclusiveAccessRegistrantsOnly
        );
        assert!(parse_type("2").is_err());
        assert!(parse_type("shared").is_err());
    }

    #[test]
    fn parse_device_options() {
        let mut opts = Options::try_parse_from([
            "pgr_tool",
            "--initiator",
            "/dev/sdb=0x1",
            "--initiator",
            "node2:/dev/sdb=0x2",
            "--initiator",
            "node3:/dev/sdb=0x3",
            "--type",
            "exclusive_access",
            "--settle-delay",
            "0",
            "--list",
        ])
        .unwrap();
        assert_eq!(opts.types, [ReservationType::ExclusiveAccess]);
        assert_eq!(opts.settle_delay, 0);
        assert_eq!(opts.poll_interval, 250);
        assert!(opts.inner.list);
        assert_eq!(opts.initiators[1].key, ReservationKey(2));
        let factory = factory(&mut opts).unwrap();
        assert_eq!(
            factory.describe(),
            "/dev/sdb, node2:/dev/sdb, node3:/dev/sdb"
        );
    }

    #[test]
    fn initiator_count_and_keys() {
        let mut opts =
            Options::try_parse_from(["pgr_tool", "--initiator", "/dev/sdb=0x1"]).unwrap();
        assert!(factory(&mut opts).is_err());

        let mut opts = Options::try_parse_from([
            "pgr_tool",
            "--initiator",
            "/dev/sdb=0x1",
            "--initiator",
            "/dev/sdc=0x1",
            "--initiator",
            "/dev/sdd=0x3",
        ])
        .unwrap();
        assert!(factory(&mut opts).is_err());
    }

    #[test]
    fn emulate_or_initiators() {
        assert!(Options::try_parse_from(["pgr_tool"]).is_err());
        let mut opts = Options::try_parse_from(["pgr_tool", "--emulate"]).unwrap();
        assert_eq!(factory(&mut opts).unwrap().describe(), "emulated target");
        assert!(Options::try_parse_from([
            "pgr_tool",
            "--emulate",
            "--initiator",
            "/dev/sdb=0x1"
        ])
        .is_err());
    }
}
