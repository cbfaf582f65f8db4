// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Transport-independent model of SCSI-3 persistent group reservations.
//!
//! This crate describes what registration and reservation state is legal on a
//! conformant target after each PERSISTENT RESERVE OUT service action. It
//! performs no I/O; the conformance engine uses it as the oracle against which
//! the state observed through real initiators is compared.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod oracle;
mod rtype;

pub use rtype::Grant;
pub use rtype::Holdership;
pub use rtype::ReservationType;
pub use rtype::TypeRules;
pub use rtype::TYPE_TABLE;

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A persistent reservation key.
///
/// Keys are opaque 8-byte values scoped to one I_T nexus. Zero is not a valid
/// registration; the protocol uses it to mean "no key".
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReservationKey(pub u64);

impl ReservationKey {
    /// The zero key.
    pub const NONE: Self = Self(0);

    /// Returns true if this is the zero key.
    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ReservationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Error returned when parsing a [`ReservationKey`].
#[derive(Debug, Error)]
#[error("invalid reservation key '{0}'")]
pub struct InvalidKey(String);

impl FromStr for ReservationKey {
    type Err = InvalidKey;

    /// Parses a hex key, with or without a `0x` prefix.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let digits = s
            .strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"))
            .unwrap_or(s);
        u64::from_str_radix(digits, 16)
            .map(ReservationKey)
            .map_err(|_| InvalidKey(s.to_owned()))
    }
}

/// The kind of data access being checked against a reservation.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AccessKind {
    /// A read of the medium.
    Read,
    /// A write to the medium.
    Write,
}

impl fmt::Display for AccessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            AccessKind::Read => "read",
            AccessKind::Write => "write",
        })
    }
}

/// An active persistent reservation.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Reservation {
    /// The key of the registrant that created the reservation.
    ///
    /// For all-registrants types every registrant is a holder, and targets
    /// may report this as zero.
    pub holder: ReservationKey,
    /// The reservation type.
    pub rtype: ReservationType,
}

impl Reservation {
    /// Returns true if `observed`, as reported by a target, is consistent with
    /// this expected reservation given the current `registrants`.
    pub fn matches_observed(
        &self,
        observed: &Reservation,
        registrants: &BTreeSet<ReservationKey>,
    ) -> bool {
        if self.rtype != observed.rtype {
            return false;
        }
        match self.rtype.rules().holdership {
            Holdership::Single => self.holder == observed.holder,
            Holdership::AllRegistrants => {
                observed.holder.is_none() || registrants.contains(&observed.holder)
            }
        }
    }
}

impl fmt::Display for Reservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} held by {}", self.rtype, self.holder)
    }
}

/// The registration and reservation state of one logical unit.
///
/// The target owns the real state; values of this type are predictions or
/// observations of it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceState {
    /// The registered keys.
    pub registrants: BTreeSet<ReservationKey>,
    /// The reservation, if any.
    pub reservation: Option<Reservation>,
}

impl DeviceState {
    /// Returns a state with `keys` registered and no reservation.
    pub fn with_registrants(keys: impl IntoIterator<Item = ReservationKey>) -> Self {
        Self {
            registrants: keys.into_iter().collect(),
            reservation: None,
        }
    }

    /// Returns true if `key` is registered.
    pub fn is_registered(&self, key: ReservationKey) -> bool {
        !key.is_none() && self.registrants.contains(&key)
    }

    /// Returns true if `key` holds the current reservation.
    ///
    /// Under all-registrants types every registrant is a holder.
    pub fn is_holder(&self, key: ReservationKey) -> bool {
        let Some(reservation) = &self.reservation else {
            return false;
        };
        match reservation.rtype.rules().holdership {
            Holdership::Single => self.is_registered(key) && reservation.holder == key,
            Holdership::AllRegistrants => self.is_registered(key),
        }
    }

    /// Returns true if the state satisfies the structural invariants of the
    /// protocol: a single-holder reservation is held by a registrant, and an
    /// all-registrants reservation has at least one registrant.
    pub fn is_consistent(&self) -> bool {
        match &self.reservation {
            None => true,
            Some(reservation) => match reservation.rtype.rules().holdership {
                Holdership::Single => self.is_registered(reservation.holder),
                Holdership::AllRegistrants => !self.registrants.is_empty(),
            },
        }
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "registrants [")?;
        for (i, key) in self.registrants.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{key}")?;
        }
        write!(f, "], ")?;
        match &self.reservation {
            Some(reservation) => write!(f, "{reservation}"),
            None => write!(f, "no reservation"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_parse_and_display() {
        assert_eq!("0x1".parse::<ReservationKey>().unwrap(), ReservationKey(1));
        assert_eq!(" abcd ".parse::<ReservationKey>().unwrap(), ReservationKey(0xabcd));
        assert_eq!("0XFF".parse::<ReservationKey>().unwrap(), ReservationKey(0xff));
        assert!("0xzz".parse::<ReservationKey>().is_err());
        assert!("".parse::<ReservationKey>().is_err());
        assert_eq!(ReservationKey(0x123abc).to_string(), "0x123abc");
    }

    #[test]
    fn holder_under_all_registrants() {
        let mut state = DeviceState::with_registrants([ReservationKey(1), ReservationKey(2)]);
        state.reservation = Some(Reservation {
            holder: ReservationKey(1),
            rtype: ReservationType::WriteExclusiveAllRegistrants,
        });
        assert!(state.is_holder(ReservationKey(1)));
        assert!(state.is_holder(ReservationKey(2)));
        assert!(!state.is_holder(ReservationKey(3)));

        let reported = Reservation {
            holder: ReservationKey::NONE,
            rtype: ReservationType::WriteExclusiveAllRegistrants,
        };
        assert!(state
            .reservation
            .unwrap()
            .matches_observed(&reported, &state.registrants));
    }

    #[test]
    fn single_holder_must_match() {
        let expected = Reservation {
            holder: ReservationKey(1),
            rtype: ReservationType::ExclusiveAccess,
        };
        let registrants = [ReservationKey(1), ReservationKey(2)].into();
        let other = Reservation {
            holder: ReservationKey(2),
            ..expected
        };
        assert!(expected.matches_observed(&expected, &registrants));
        assert!(!expected.matches_observed(&other, &registrants));
        let wrong_type = Reservation {
            rtype: ReservationType::WriteExclusive,
            ..expected
        };
        assert!(!expected.matches_observed(&wrong_type, &registrants));
    }

    #[test]
    fn consistency() {
        let mut state = DeviceState::with_registrants([ReservationKey(2)]);
        state.reservation = Some(Reservation {
            holder: ReservationKey(1),
            rtype: ReservationType::ExclusiveAccess,
        });
        assert!(!state.is_consistent());
        state.registrants.insert(ReservationKey(1));
        assert!(state.is_consistent());
        assert_eq!(
            state.to_string(),
            "registrants [0x1, 0x2], Exclusive Access held by 0x1"
        );
    }
}
