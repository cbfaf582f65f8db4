// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Construction of the initiators taking part in each scenario.

use pgr_emulated_target::EmulatedTarget;
use pgr_initiator::sg_utils::SgUtilsExecutor;
use pgr_initiator::sg_utils::SgUtilsTools;
use pgr_initiator::Initiator;
use pgr_model::ReservationKey;
use std::str::FromStr;
use thiserror::Error;

/// The names of the three initiators, in [`crate::Who`] order.
pub const INITIATOR_NAMES: [&str; 3] = ["A", "B", "C"];

/// Builds a fresh set of initiators for every scenario, so that no state
/// carries over between scenarios other than what the device itself keeps.
pub trait InitiatorFactory: Send + Sync {
    /// Describes the device under test.
    fn describe(&self) -> String;

    /// Returns initiators A, B and C.
    fn initiators(&self) -> [Initiator; 3];
}

/// One nexus to a real device, `[HOST:]DEVICE=KEY`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NexusSpec {
    /// The host to reach through `ssh`, or `None` for the local machine.
    pub host: Option<String>,
    /// The block device path on that host.
    pub device: String,
    /// The nexus's reservation key.
    pub key: ReservationKey,
}

/// An invalid `[HOST:]DEVICE=KEY` argument.
#[derive(Debug, Error)]
#[expect(missing_docs)] // Self-describing names.
pub enum NexusSpecError {
    #[error("expected [HOST:]DEVICE=KEY")]
    MissingKey,
    #[error("missing device path")]
    MissingDevice,
    #[error("reservation key must be nonzero")]
    ZeroKey,
    #[error("invalid reservation key")]
    InvalidKey(#[source] pgr_model::InvalidKey),
}

impl FromStr for NexusSpec {
    type Err = NexusSpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (target, key) = s.rsplit_once('=').ok_or(NexusSpecError::MissingKey)?;
        let key: ReservationKey = key.parse().map_err(NexusSpecError::InvalidKey)?;
        if key.is_none() {
            return Err(NexusSpecError::ZeroKey);
        }
        // Device paths may contain colons (by-path names), host names may
        // not contain slashes.
        let (host, device) = match target.split_once(':') {
            Some((host, device)) if !host.is_empty() && !host.contains('/') => {
                (Some(host.to_owned()), device)
            }
            _ => (None, target),
        };
        if device.is_empty() {
            return Err(NexusSpecError::MissingDevice);
        }
        Ok(Self {
            host,
            device: device.to_owned(),
            key,
        })
    }
}

/// Initiators that drive real devices with sg3_utils.
#[derive(Debug)]
pub struct DeviceFactory {
    nexuses: [NexusSpec; 3],
    tools: SgUtilsTools,
}

impl DeviceFactory {
    /// Returns a factory for nexuses A, B and C.
    pub fn new(nexuses: [NexusSpec; 3], tools: SgUtilsTools) -> Self {
        Self { nexuses, tools }
    }
}

impl InitiatorFactory for DeviceFactory {
    fn describe(&self) -> String {
        let nexuses: Vec<_> = self
            .nexuses
            .iter()
            .map(|nexus| match &nexus.host {
                Some(host) => format!("{host}:{}", nexus.device),
                None => nexus.device.clone(),
            })
            .collect();
        nexuses.join(", ")
    }

    fn initiators(&self) -> [Initiator; 3] {
        std::array::from_fn(|i| {
            let nexus = &self.nexuses[i];
            let executor = SgUtilsExecutor::new(nexus.device.clone(), self.tools.clone())
                .with_host(nexus.host.clone());
            Initiator::new(INITIATOR_NAMES[i], nexus.key, Box::new(executor))
        })
    }
}

/// Initiators connected to an in-memory [`EmulatedTarget`].
#[derive(Clone)]
pub struct EmulatedFactory {
    target: EmulatedTarget,
}

impl EmulatedFactory {
    /// The keys used by A, B and C.
    pub const KEYS: [ReservationKey; 3] =
        [ReservationKey(0x1), ReservationKey(0x2), ReservationKey(0x3)];

    /// Returns a factory connecting new nexuses to `target`.
    pub fn new(target: EmulatedTarget) -> Self {
        Self { target }
    }

    /// The target the initiators connect to.
    pub fn target(&self) -> &EmulatedTarget {
        &self.target
    }
}

impl InitiatorFactory for EmulatedFactory {
    fn describe(&self) -> String {
        "emulated target".into()
    }

    fn initiators(&self) -> [Initiator; 3] {
        std::array::from_fn(|i| {
            Initiator::new(INITIATOR_NAMES[i], Self::KEYS[i], Box::new(self.target.nexus()))
        })
    }
}
