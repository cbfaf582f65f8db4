// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Reservation types and their access rules.

use crate::AccessKind;
use crate::DeviceState;
use crate::ReservationKey;
use std::fmt;

/// The reservation type.
///
/// These are defined in the SCSI spec.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[expect(missing_docs)] // Self-describing names.
pub enum ReservationType {
    WriteExclusive,
    ExclusiveAccess,
    WriteExclusiveRegistrantsOnly,
    ExclusiveAccessRegistrantsOnly,
    WriteExclusiveAllRegistrants,
    ExclusiveAccessAllRegistrants,
}

/// Who holds a reservation of a given type.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Holdership {
    /// The registrant that created the reservation.
    Single,
    /// Every registrant.
    AllRegistrants,
}

/// Which registrants an access kind is granted to while a reservation of a
/// given type is active. Non-registrants are never granted access.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Grant {
    /// Only reservation holders.
    Holder,
    /// Any registrant.
    Registrants,
}

/// One row of [`TYPE_TABLE`].
#[derive(Debug)]
pub struct TypeRules {
    /// The type this row describes.
    pub rtype: ReservationType,
    /// The TYPE field value in PERSISTENT RESERVE OUT.
    pub code: u8,
    /// The name sg3_utils prints for the type.
    pub name: &'static str,
    /// A lowercase identifier, used to name scenarios.
    pub ident: &'static str,
    /// Who holds the reservation.
    pub holdership: Holdership,
    /// Who may read.
    pub read: Grant,
    /// Who may write.
    pub write: Grant,
}

/// The capability table, indexed by `ReservationType as usize`.
pub const TYPE_TABLE: [TypeRules; 6] = [
    TypeRules {
        rtype: ReservationType::WriteExclusive,
        code: 1,
        name: "Write Exclusive",
        ident: "write_exclusive",
        holdership: Holdership::Single,
        read: Grant::Registrants,
        write: Grant::Holder,
    },
    TypeRules {
        rtype: ReservationType::ExclusiveAccess,
        code: 3,
        name: "Exclusive Access",
        ident: "exclusive_access",
        holdership: Holdership::Single,
        read: Grant::Holder,
        write: Grant::Holder,
    },
    TypeRules {
        rtype: ReservationType::WriteExclusiveRegistrantsOnly,
        code: 5,
        name: "Write Exclusive, registrants only",
        ident: "write_exclusive_registrants_only",
        holdership: Holdership::Single,
        read: Grant::Registrants,
        write: Grant::Registrants,
    },
    TypeRules {
        rtype: ReservationType::ExclusiveAccessRegistrantsOnly,
        code: 6,
        name: "Exclusive Access, registrants only",
        ident: "exclusive_access_registrants_only",
        holdership: Holdership::Single,
        read: Grant::Registrants,
        write: Grant::Registrants,
    },
    TypeRules {
        rtype: ReservationType::WriteExclusiveAllRegistrants,
        code: 7,
        name: "Write Exclusive, all registrants",
        ident: "write_exclusive_all_registrants",
        holdership: Holdership::AllRegistrants,
        read: Grant::Registrants,
        write: Grant::Registrants,
    },
    TypeRules {
        rtype: ReservationType::ExclusiveAccessAllRegistrants,
        code: 8,
        name: "Exclusive Access, all registrants",
        ident: "exclusive_access_all_registrants",
        holdership: Holdership::AllRegistrants,
        read: Grant::Registrants,
        write: Grant::Registrants,
    },
];

impl ReservationType {
    /// All reservation types, in table order.
    pub const ALL: [Self; 6] = [
        Self::WriteExclusive,
        Self::ExclusiveAccess,
        Self::WriteExclusiveRegistrantsOnly,
        Self::ExclusiveAccessRegistrantsOnly,
        Self::WriteExclusiveAllRegistrants,
        Self::ExclusiveAccessAllRegistrants,
    ];

    /// Returns the table row for this type.
    pub fn rules(self) -> &'static TypeRules {
        &TYPE_TABLE[self as usize]
    }

    /// Returns the PERSISTENT RESERVE OUT type code.
    pub fn code(self) -> u8 {
        self.rules().code
    }

    /// Looks up a type by its PERSISTENT RESERVE OUT type code.
    pub fn from_code(code: u8) -> Option<Self> {
        TYPE_TABLE.iter().find(|r| r.code == code).map(|r| r.rtype)
    }

    /// Looks up a type by name.
    ///
    /// Accepts the sg3_utils display name, the variant name, or the
    /// identifier, ignoring case, whitespace, commas, hyphens and underscores.
    pub fn from_name(name: &str) -> Option<Self> {
        let wanted = normalize(name);
        TYPE_TABLE
            .iter()
            .find(|r| normalize(r.name) == wanted || normalize(r.ident) == wanted)
            .map(|r| r.rtype)
    }

    /// Returns true if `requestor` may read the medium while a reservation of
    /// this type is active in `state`.
    pub fn read_allowed(self, requestor: ReservationKey, state: &DeviceState) -> bool {
        self.granted(self.rules().read, requestor, state)
    }

    /// Returns true if `requestor` may write the medium while a reservation of
    /// this type is active in `state`.
    pub fn write_allowed(self, requestor: ReservationKey, state: &DeviceState) -> bool {
        self.granted(self.rules().write, requestor, state)
    }

    /// Dispatches to [`Self::read_allowed`] or [`Self::write_allowed`].
    pub fn allows(self, access: AccessKind, requestor: ReservationKey, state: &DeviceState) -> bool {
        match access {
            AccessKind::Read => self.read_allowed(requestor, state),
            AccessKind::Write => self.write_allowed(requestor, state),
        }
    }

    fn granted(self, grant: Grant, requestor: ReservationKey, state: &DeviceState) -> bool {
        if !state.is_registered(requestor) {
            return false;
        }
        match grant {
            Grant::Holder => state.is_holder(requestor),
            Grant::Registrants => true,
        }
    }
}

impl fmt::Display for ReservationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.rules().name)
    }
}

fn normalize(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Reservation;

    #[test]
    fn table_is_indexed_by_variant() {
        for (i, rtype) in ReservationType::ALL.into_iter().enumerate() {
            assert_eq!(TYPE_TABLE[i].rtype, rtype);
            assert_eq!(ReservationType::from_code(rtype.code()), Some(rtype));
        }
        assert_eq!(ReservationType::from_code(0), None);
        assert_eq!(ReservationType::from_code(2), None);
    }

    #[test]
    fn names() {
        assert_eq!(
            ReservationType::from_name("Exclusive Access"),
            Some(ReservationType::ExclusiveAccess)
        );
        assert_eq!(
            ReservationType::from_name("Write Exclusive, registrants only"),
            Some(ReservationType::WriteExclusiveRegistrantsOnly)
        );
        assert_eq!(
            ReservationType::from_name("ExclusiveAccessAllRegistrants"),
            Some(ReservationType::ExclusiveAccessAllRegistrants)
        );
        assert_eq!(
            ReservationType::from_name("write_exclusive"),
            Some(ReservationType::WriteExclusive)
        );
        assert_eq!(ReservationType::from_name("obsolete [2]"), None);
    }

    #[test]
    fn exclusive_access_grants_holder_only() {
        let a = ReservationKey(1);
        let b = ReservationKey(2);
        let c = ReservationKey(3);
        let mut state = DeviceState::with_registrants([a, b]);
        state.reservation = Some(Reservation {
            holder: a,
            rtype: ReservationType::ExclusiveAccess,
        });
        let rtype = ReservationType::ExclusiveAccess;
        assert!(rtype.read_allowed(a, &state));
        assert!(rtype.write_allowed(a, &state));
        assert!(!rtype.read_allowed(b, &state));
        assert!(!rtype.write_allowed(b, &state));
        assert!(!rtype.read_allowed(c, &state));
        assert!(!rtype.write_allowed(c, &state));
    }

    #[test]
    fn write_exclusive_lets_registrants_read() {
        let a = ReservationKey(1);
        let b = ReservationKey(2);
        let mut state = DeviceState::with_registrants([a, b]);
        state.reservation = Some(Reservation {
            holder: a,
            rtype: ReservationType::WriteExclusive,
        });
        let rtype = ReservationType::WriteExclusive;
        assert!(rtype.read_allowed(b, &state));
        assert!(!rtype.write_allowed(b, &state));
        assert!(!rtype.read_allowed(ReservationKey(3), &state));
    }

    #[test]
    fn shared_types_grant_registrants() {
        let a = ReservationKey(1);
        let b = ReservationKey(2);
        for rtype in &ReservationType::ALL[2..] {
            let mut state = DeviceState::with_registrants([a, b]);
            state.reservation = Some(Reservation { holder: a, rtype: *rtype });
            for access in [AccessKind::Read, AccessKind::Write] {
                assert!(rtype.allows(access, b, &state), "{rtype} {access}");
                assert!(!rtype.allows(access, ReservationKey(3), &state), "{rtype} {access}");
            }
        }
    }
}
