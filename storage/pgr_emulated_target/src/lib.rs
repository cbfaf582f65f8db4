// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! An in-memory logical unit with SCSI persistent reservations, reachable
//! through any number of emulated I_T nexuses.
//!
//! Since the state lives in this process, this is not useful for sharing a
//! disk. It exists to exercise the conformance engine without hardware, and
//! can be told to misbehave (see [`Quirks`]) so that the engine's detection of
//! nonconformance can itself be tested.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use parking_lot::Mutex;
use pgr_initiator::executor::CommandExecutor;
use pgr_initiator::executor::CommandOutput;
use pgr_initiator::executor::ExecutorError;
use pgr_initiator::executor::PgrCommand;
use pgr_initiator::response;
use pgr_initiator::response::ReservationQuery;
use pgr_model::AccessKind;
use pgr_model::DeviceState;
use pgr_model::Grant;
use pgr_model::Holdership;
use pgr_model::Reservation;
use pgr_model::ReservationKey;
use pgr_model::ReservationType;
use std::num::NonZeroU64;
use std::num::Wrapping;
use std::sync::Arc;

/// sg3_utils exit status for ILLEGAL REQUEST.
pub const STATUS_ILLEGAL_REQUEST: i32 = 5;
/// sg3_utils exit status for a pending UNIT ATTENTION.
pub const STATUS_UNIT_ATTENTION: i32 = 6;
/// sg3_utils exit status for RESERVATION CONFLICT.
pub const STATUS_RESERVATION_CONFLICT: i32 = 24;
/// `dd` exit status when the I/O is refused.
pub const STATUS_IO_FAILED: i32 = 1;
/// Status of an I/O probe that hit a pending UNIT ATTENTION.
pub const STATUS_PROBE_UNIT_ATTENTION: i32 = 2;

const BLOCK_SIZE: usize = 512;
const BLOCK_COUNT: u64 = 16;

/// Deliberate protocol violations.
#[derive(Debug, Clone, Default)]
pub struct Quirks {
    /// RELEASE from a registered non-holder fails with a conflict.
    pub release_by_non_holder_fails: bool,
    /// Unregistering the holder leaves the reservation in place.
    pub unregister_keeps_reservation: bool,
    /// Non-registrants may read under every reservation type.
    pub non_registrant_can_read: bool,
    /// READ RESERVATION returns unparseable output.
    pub malformed_reservation_output: bool,
    /// After a state change, this many probes still see the previous access
    /// control state.
    pub stale_access_probes: u32,
    /// Every new nexus starts with a pending power-on unit attention.
    pub unit_attention_on_connect: bool,
    /// READ KEYS through this nexus lists only the nexus's own key.
    pub registrants_hidden_from: Option<usize>,
    /// Each nexus reports a different unit serial number.
    pub serial_per_nexus: bool,
}

/// The emulated logical unit. Cloning returns another handle to the same
/// unit.
#[derive(Clone)]
pub struct EmulatedTarget {
    state: Arc<Mutex<TargetState>>,
}

/// One I_T nexus to an [`EmulatedTarget`].
pub struct EmulatedNexus {
    id: usize,
    state: Arc<Mutex<TargetState>>,
}

#[derive(Debug, Clone, Default)]
struct AccessView {
    registrations: Vec<Option<NonZeroU64>>,
    reservation: Option<HeldReservation>,
}

#[derive(Debug, Copy, Clone)]
struct HeldReservation {
    nexus: usize,
    rtype: ReservationType,
}

struct TargetState {
    generation: Wrapping<u32>,
    view: AccessView,
    unit_attention: Vec<bool>,
    stale: Option<(AccessView, u32)>,
    medium: Vec<u8>,
    serial: String,
    quirks: Quirks,
}

impl Default for EmulatedTarget {
    fn default() -> Self {
        Self::new()
    }
}

impl EmulatedTarget {
    /// Returns a conformant target.
    pub fn new() -> Self {
        Self::with_quirks(Quirks::default())
    }

    /// Returns a target with the given protocol violations.
    pub fn with_quirks(quirks: Quirks) -> Self {
        Self {
            state: Arc::new(Mutex::new(TargetState {
                generation: Wrapping(0),
                view: AccessView::default(),
                unit_attention: Vec::new(),
                stale: None,
                medium: vec![0xa5; BLOCK_SIZE * BLOCK_COUNT as usize],
                serial: "pgremu0001".into(),
                quirks,
            })),
        }
    }

    /// Connects a new I_T nexus.
    pub fn nexus(&self) -> EmulatedNexus {
        let mut state = self.state.lock();
        state.view.registrations.push(None);
        let pending = state.quirks.unit_attention_on_connect;
        state.unit_attention.push(pending);
        EmulatedNexus {
            id: state.view.registrations.len() - 1,
            state: self.state.clone(),
        }
    }

    /// Returns the current registrations and reservation.
    pub fn device_state(&self) -> DeviceState {
        let state = self.state.lock();
        let view = &state.view;
        DeviceState {
            registrants: view.keys().collect(),
            reservation: view.reservation.and_then(|r| {
                Some(Reservation {
                    holder: ReservationKey(view.registrations.get(r.nexus).copied().flatten()?.get()),
                    rtype: r.rtype,
                })
            }),
        }
    }

    /// Returns the PR generation counter.
    pub fn generation(&self) -> u32 {
        self.state.lock().generation.0
    }
}

impl AccessView {
    fn keys(&self) -> impl Iterator<Item = ReservationKey> + '_ {
        self.registrations
            .iter()
            .flatten()
            .map(|key| ReservationKey(key.get()))
    }

    fn is_registered(&self, nexus: usize) -> bool {
        self.registrations[nexus].is_some()
    }

    fn is_holder(&self, nexus: usize) -> bool {
        match self.reservation {
            None => false,
            Some(r) => match r.rtype.rules().holdership {
                Holdership::Single => r.nexus == nexus,
                Holdership::AllRegistrants => self.is_registered(nexus),
            },
        }
    }

    fn allows(&self, nexus: usize, access: AccessKind, quirks: &Quirks) -> bool {
        let Some(r) = self.reservation else {
            return true;
        };
        if !self.is_registered(nexus) {
            return access == AccessKind::Read && quirks.non_registrant_can_read;
        }
        let rules = r.rtype.rules();
        let grant = match access {
            AccessKind::Read => rules.read,
            AccessKind::Write => rules.write,
        };
        match grant {
            Grant::Holder => self.is_holder(nexus),
            Grant::Registrants => true,
        }
    }

    /// The key reported for the reservation holder. All-registrants
    /// reservations report zero.
    fn reported_holder(&self) -> ReservationQuery {
        match self.reservation {
            None => ReservationQuery::NoReservation,
            Some(r) => {
                let key = match r.rtype.rules().holdership {
                    Holdership::AllRegistrants => ReservationKey::NONE,
                    Holdership::Single => self.registrations[r.nexus]
                        .map_or(ReservationKey::NONE, |k| ReservationKey(k.get())),
                };
                ReservationQuery::Present {
                    key,
                    rtype: r.rtype,
                }
            }
        }
    }
}

fn nonzero(key: ReservationKey) -> Option<NonZeroU64> {
    NonZeroU64::new(key.0)
}

impl TargetState {
    /// Saves the access view before a state change, for stale probes.
    fn before_change(&mut self) {
        let probes = self.quirks.stale_access_probes;
        if probes == 0 {
            return;
        }
        let view = match self.stale.take() {
            Some((view, _)) => view,
            None => self.view.clone(),
        };
        self.stale = Some((view, probes));
    }

    fn check_key(&self, nexus: usize, key: ReservationKey) -> Result<(), i32> {
        match self.view.registrations[nexus] {
            Some(registered) if Some(registered) == nonzero(key) => Ok(()),
            _ => Err(STATUS_RESERVATION_CONFLICT),
        }
    }

    fn raise_unit_attention(&mut self, nexuses: impl IntoIterator<Item = usize>) {
        for nexus in nexuses {
            self.unit_attention[nexus] = true;
        }
    }

    fn other_registrants(&self, nexus: usize) -> Vec<usize> {
        (0..self.view.registrations.len())
            .filter(|&n| n != nexus && self.view.is_registered(n))
            .collect()
    }

    fn unregister(&mut self, nexus: usize) {
        let was_holder = self.view.is_holder(nexus);
        self.view.registrations[nexus] = None;
        let Some(r) = self.view.reservation else {
            return;
        };
        match r.rtype.rules().holdership {
            Holdership::Single => {
                if was_holder && !self.quirks.unregister_keeps_reservation {
                    self.view.reservation = None;
                    if r.rtype != ReservationType::WriteExclusive
                        && r.rtype != ReservationType::ExclusiveAccess
                    {
                        let others = self.other_registrants(nexus);
                        self.raise_unit_attention(others);
                    }
                }
            }
            Holdership::AllRegistrants => self.reassign_all_registrants(),
        }
    }

    /// Keeps an all-registrants reservation pointing at a live registration,
    /// dropping it once nobody is registered.
    fn reassign_all_registrants(&mut self) {
        let Some(r) = self.view.reservation else {
            return;
        };
        if r.rtype.rules().holdership != Holdership::AllRegistrants || self.view.is_registered(r.nexus) {
            return;
        }
        self.view.reservation = (0..self.view.registrations.len())
            .find(|&n| self.view.is_registered(n))
            .map(|nexus| HeldReservation { nexus, ..r });
    }

    fn register(
        &mut self,
        nexus: usize,
        key: Option<ReservationKey>,
        service_action_key: ReservationKey,
    ) -> Result<(), i32> {
        match (self.view.registrations[nexus], key) {
            (None, Some(key)) if !key.is_none() => return Err(STATUS_RESERVATION_CONFLICT),
            (None, _) if service_action_key.is_none() => return Ok(()),
            (Some(_), Some(key)) => self.check_key(nexus, key)?,
            _ => {}
        }
        self.before_change();
        match nonzero(service_action_key) {
            None => self.unregister(nexus),
            Some(new_key) => self.view.registrations[nexus] = Some(new_key),
        }
        self.generation += 1;
        Ok(())
    }

    fn reserve(&mut self, nexus: usize, key: ReservationKey, rtype: ReservationType) -> Result<(), i32> {
        self.check_key(nexus, key)?;
        match self.view.reservation {
            None => {
                self.before_change();
                self.view.reservation = Some(HeldReservation { nexus, rtype });
                Ok(())
            }
            Some(r) if r.rtype == rtype && self.view.is_holder(nexus) => Ok(()),
            Some(_) => Err(STATUS_RESERVATION_CONFLICT),
        }
    }

    fn release(&mut self, nexus: usize, key: ReservationKey, rtype: ReservationType) -> Result<(), i32> {
        self.check_key(nexus, key)?;
        let Some(r) = self.view.reservation else {
            return Ok(());
        };
        if !self.view.is_holder(nexus) {
            if self.quirks.release_by_non_holder_fails {
                return Err(STATUS_RESERVATION_CONFLICT);
            }
            return Ok(());
        }
        if r.rtype != rtype {
            return Err(STATUS_ILLEGAL_REQUEST);
        }
        self.before_change();
        self.view.reservation = None;
        if r.rtype != ReservationType::WriteExclusive && r.rtype != ReservationType::ExclusiveAccess {
            let others = self.other_registrants(nexus);
            self.raise_unit_attention(others);
        }
        Ok(())
    }

    fn clear(&mut self, nexus: usize, key: ReservationKey) -> Result<(), i32> {
        self.check_key(nexus, key)?;
        self.before_change();
        let others = self.other_registrants(nexus);
        self.raise_unit_attention(others);
        self.view.registrations.iter_mut().for_each(|r| *r = None);
        self.view.reservation = None;
        self.generation += 1;
        Ok(())
    }

    fn preempt(
        &mut self,
        nexus: usize,
        key: ReservationKey,
        victim: ReservationKey,
        rtype: ReservationType,
    ) -> Result<(), i32> {
        self.check_key(nexus, key)?;
        let victims: Vec<usize> = (0..self.view.registrations.len())
            .filter(|&n| n != nexus && self.view.registrations[n] == nonzero(victim))
            .collect();
        let self_preempt = nonzero(victim) == self.view.registrations[nexus];
        if victims.is_empty() && !self_preempt {
            return Err(STATUS_RESERVATION_CONFLICT);
        }
        self.before_change();
        let takes_over = self.view.reservation.is_some_and(|r| {
            r.rtype.rules().holdership == Holdership::Single
                && (victims.contains(&r.nexus) || (self_preempt && r.nexus == nexus))
        });
        for &n in &victims {
            self.view.registrations[n] = None;
        }
        if takes_over {
            self.view.reservation = Some(HeldReservation { nexus, rtype });
        }
        self.reassign_all_registrants();
        self.raise_unit_attention(victims);
        self.generation += 1;
        Ok(())
    }

    fn probe(&mut self, nexus: usize, access: AccessKind, lba: u64, count: u32) -> Result<(), i32> {
        let allowed = match &mut self.stale {
            Some((view, remaining)) => {
                let allowed = view.allows(nexus, access, &self.quirks);
                *remaining -= 1;
                if *remaining == 0 {
                    self.stale = None;
                }
                allowed
            }
            None => self.view.allows(nexus, access, &self.quirks),
        };
        if !allowed {
            return Err(STATUS_IO_FAILED);
        }
        let block = usize::try_from(lba)
            .ok()
            .and_then(|lba| {
                let start = lba.checked_mul(BLOCK_SIZE)?;
                let end = start.checked_add((count as usize).checked_mul(BLOCK_SIZE)?)?;
                self.medium.get_mut(start..end)
            })
            .ok_or(STATUS_ILLEGAL_REQUEST)?;
        if access == AccessKind::Write {
            block.fill(0);
        }
        Ok(())
    }

    fn inquiry(&self, nexus: usize) -> Vec<String> {
        let serial = if self.quirks.serial_per_nexus {
            format!("{}-{nexus}", self.serial)
        } else {
            self.serial.clone()
        };
        vec![
            "standard INQUIRY:".into(),
            "  PQual=0  PDT=0  RMB=0  LU_CONG=0  hot_pluggable=0  version=0x06  [SPC-4]".into(),
            " Vendor identification: PGREMU  ".into(),
            " Product identification: EMULATED DISK   ".into(),
            " Product revision level: 0001".into(),
            format!(" Unit serial number: {serial}"),
        ]
    }

    fn execute(&mut self, nexus: usize, command: &PgrCommand) -> Result<Vec<String>, i32> {
        match command {
            PgrCommand::TestUnitReady => self.unit_attention[nexus] = false,
            PgrCommand::Inquiry => {}
            PgrCommand::ReadBlocks { .. } | PgrCommand::WriteZeros { .. } => {
                if std::mem::take(&mut self.unit_attention[nexus]) {
                    return Err(STATUS_PROBE_UNIT_ATTENTION);
                }
            }
            _ => {
                if std::mem::take(&mut self.unit_attention[nexus]) {
                    return Err(STATUS_UNIT_ATTENTION);
                }
            }
        }
        let generation = self.generation.0;
        match *command {
            PgrCommand::ReadKeys => {
                let keys: Vec<_> = if self.quirks.registrants_hidden_from == Some(nexus) {
                    self.view.registrations[nexus]
                        .map(|key| ReservationKey(key.get()))
                        .into_iter()
                        .collect()
                } else {
                    self.view.keys().collect()
                };
                Ok(response::render_registrants(&keys, generation))
            }
            PgrCommand::ReadReservation => {
                if self.quirks.malformed_reservation_output {
                    return Ok(vec!["PR in (Read reservation): bad field in cdb".into()]);
                }
                Ok(response::render_reservation(
                    self.view.reported_holder(),
                    generation,
                ))
            }
            PgrCommand::Register {
                key,
                service_action_key,
            } => self
                .register(nexus, Some(key), service_action_key)
                .map(|()| Vec::new()),
            PgrCommand::RegisterIgnore { service_action_key } => self
                .register(nexus, None, service_action_key)
                .map(|()| Vec::new()),
            PgrCommand::Reserve { key, rtype } => self.reserve(nexus, key, rtype).map(|()| Vec::new()),
            PgrCommand::Release { key, rtype } => self.release(nexus, key, rtype).map(|()| Vec::new()),
            PgrCommand::Clear { key } => self.clear(nexus, key).map(|()| Vec::new()),
            PgrCommand::Preempt { key, victim, rtype } => {
                self.preempt(nexus, key, victim, rtype).map(|()| Vec::new())
            }
            PgrCommand::Inquiry => Ok(self.inquiry(nexus)),
            PgrCommand::ReadBlocks { lba, count } => self
                .probe(nexus, AccessKind::Read, lba, count)
                .map(|()| Vec::new()),
            PgrCommand::WriteZeros { lba, count } => self
                .probe(nexus, AccessKind::Write, lba, count)
                .map(|()| Vec::new()),
            PgrCommand::TestUnitReady => Ok(Vec::new()),
        }
    }
}

impl CommandExecutor for EmulatedNexus {
    fn describe(&self) -> String {
        format!("emulated:nexus{}", self.id)
    }

    fn execute(&self, command: &PgrCommand) -> Result<CommandOutput, ExecutorError> {
        let mut state = self.state.lock();
        let output = match state.execute(self.id, command) {
            Ok(lines) => CommandOutput::ok(lines),
            Err(status) => CommandOutput::failed(status),
        };
        tracing::trace!(nexus = self.id, %command, status = output.status, "emulated command");
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pgr_initiator::Initiator;
    use std::collections::BTreeSet;

    const EA: ReservationType = ReservationType::ExclusiveAccess;

    fn initiators(target: &EmulatedTarget) -> [Initiator; 3] {
        ["A", "B", "C"].map(|name| {
            let key = ReservationKey(match name {
                "A" => 1,
                "B" => 2,
                _ => 3,
            });
            Initiator::new(name, key, Box::new(target.nexus()))
        })
    }

    #[test]
    fn exclusive_access_end_to_end() {
        let target = EmulatedTarget::new();
        let [a, b, _c] = initiators(&target);
        a.register().unwrap();
        b.register().unwrap();
        a.reserve(EA).unwrap();
        assert_eq!(
            a.get_reservation().unwrap(),
            ReservationQuery::Present {
                key: ReservationKey(1),
                rtype: EA
            }
        );
        a.read_from_target().unwrap();
        a.write_to_target().unwrap();
        assert_eq!(b.read_from_target().unwrap_err().rejected_status(), Some(1));
        assert_eq!(b.write_to_target().unwrap_err().rejected_status(), Some(1));
        a.release(EA).unwrap();
        assert_eq!(a.get_reservation().unwrap(), ReservationQuery::NoReservation);
    }

    #[test]
    fn unregistered_nexus_cannot_reserve() {
        let target = EmulatedTarget::new();
        let [_a, _b, c] = initiators(&target);
        assert_eq!(
            c.reserve(EA).unwrap_err().rejected_status(),
            Some(STATUS_RESERVATION_CONFLICT)
        );
    }

    #[test]
    fn register_twice_conflicts() {
        let target = EmulatedTarget::new();
        let [a, ..] = initiators(&target);
        a.register().unwrap();
        assert_eq!(
            a.register().unwrap_err().rejected_status(),
            Some(STATUS_RESERVATION_CONFLICT)
        );
        assert_eq!(target.generation(), 1);
    }

    #[test]
    fn clear_raises_unit_attention() {
        let target = EmulatedTarget::new();
        let [a, b, _c] = initiators(&target);
        a.register().unwrap();
        b.register().unwrap();
        a.clear().unwrap();
        assert_eq!(
            b.get_registrants().unwrap_err().rejected_status(),
            Some(STATUS_UNIT_ATTENTION)
        );
        // Reported once.
        assert!(b.get_registrants().unwrap().is_empty());

        a.register().unwrap();
        a.clear().unwrap();
        b.run_tur().unwrap();
        b.read_from_target().unwrap();
    }

    #[test]
    fn preempt_takes_over_reservation() {
        let target = EmulatedTarget::new();
        let [a, b, _c] = initiators(&target);
        a.register().unwrap();
        b.register().unwrap();
        a.reserve(EA).unwrap();
        b.preempt(ReservationKey(1), ReservationType::WriteExclusive)
            .unwrap();
        let state = target.device_state();
        assert_eq!(
            state.reservation,
            Some(Reservation {
                holder: ReservationKey(2),
                rtype: ReservationType::WriteExclusive
            })
        );
        assert!(!state.is_registered(ReservationKey(1)));
        // The preempted nexus sees a unit attention first.
        assert_eq!(
            a.read_from_target().unwrap_err().rejected_status(),
            Some(STATUS_PROBE_UNIT_ATTENTION)
        );
        assert_eq!(a.read_from_target().unwrap_err().rejected_status(), Some(1));
    }

    #[test]
    fn all_registrants_reports_zero_key() {
        let target = EmulatedTarget::new();
        let [a, b, _c] = initiators(&target);
        a.register().unwrap();
        b.register().unwrap();
        a.reserve(ReservationType::ExclusiveAccessAllRegistrants)
            .unwrap();
        a.unregister().unwrap();
        assert_eq!(
            b.get_reservation().unwrap(),
            ReservationQuery::Present {
                key: ReservationKey::NONE,
                rtype: ReservationType::ExclusiveAccessAllRegistrants
            }
        );
        b.write_to_target().unwrap();
    }

    #[test]
    fn stale_probes() {
        let target = EmulatedTarget::with_quirks(Quirks {
            stale_access_probes: 2,
            ..Default::default()
        });
        let [a, b, _c] = initiators(&target);
        a.register().unwrap();
        b.register().unwrap();
        a.reserve(EA).unwrap();
        b.read_from_target().unwrap();
        b.read_from_target().unwrap();
        b.read_from_target().unwrap_err();
    }

    #[test]
    fn inquiry_serial() {
        let target = EmulatedTarget::new();
        let [a, ..] = initiators(&target);
        assert_eq!(a.inquiry_serial().unwrap().as_deref(), Some("pgremu0001"));

        let target = EmulatedTarget::with_quirks(Quirks {
            serial_per_nexus: true,
            ..Default::default()
        });
        let [a, b, _c] = initiators(&target);
        assert_eq!(a.inquiry_serial().unwrap().as_deref(), Some("pgremu0001-0"));
        assert_eq!(b.inquiry_serial().unwrap().as_deref(), Some("pgremu0001-1"));
    }

    #[test]
    fn power_on_unit_attention() {
        let target = EmulatedTarget::with_quirks(Quirks {
            unit_attention_on_connect: true,
            ..Default::default()
        });
        let [a, b, _c] = initiators(&target);
        assert_eq!(
            a.register().unwrap_err().rejected_status(),
            Some(STATUS_UNIT_ATTENTION)
        );
        a.register().unwrap();
        b.run_tur().unwrap();
        b.register().unwrap();
    }

    #[test]
    fn hidden_registrants() {
        let target = EmulatedTarget::with_quirks(Quirks {
            registrants_hidden_from: Some(2),
            ..Default::default()
        });
        let [a, b, c] = initiators(&target);
        a.register().unwrap();
        b.register().unwrap();
        assert_eq!(
            a.get_registrants().unwrap(),
            BTreeSet::from([ReservationKey(1), ReservationKey(2)])
        );
        assert!(c.get_registrants().unwrap().is_empty());
    }
}
