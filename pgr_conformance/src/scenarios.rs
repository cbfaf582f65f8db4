// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The scenario catalogue.
//!
//! Every scenario starts from the baseline established by
//! [`ScenarioContext::setup`]: A and B registered, C not, and no reservation.
//! Reservation scenarios are instantiated once per reservation type and named
//! after the type; the rest live in the `registration` group.

use crate::engine::ScenarioContext;
use crate::engine::ScenarioError;
use crate::engine::Who;
use pgr_model::oracle::Verb;
use pgr_model::Holdership;
use pgr_model::ReservationKey;
use pgr_model::ReservationType;

type TypedBody = fn(&mut ScenarioContext, ReservationType) -> Result<(), ScenarioError>;
type UntypedBody = fn(&mut ScenarioContext) -> Result<(), ScenarioError>;

#[derive(Copy, Clone)]
enum Body {
    Typed(ReservationType, TypedBody),
    Untyped(UntypedBody),
}

/// A named conformance scenario.
#[derive(Clone)]
pub struct Scenario {
    group: &'static str,
    leaf_name: &'static str,
    body: Body,
}

impl Scenario {
    /// The scenario name, `<group>::<leaf>`.
    pub fn name(&self) -> String {
        format!("{}::{}", self.group, self.leaf_name)
    }

    /// The reservation type exercised, if the scenario is type specific.
    pub fn reservation_type(&self) -> Option<ReservationType> {
        match self.body {
            Body::Typed(rtype, _) => Some(rtype),
            Body::Untyped(_) => None,
        }
    }

    /// Runs the scenario's steps. The baseline must already be established.
    pub fn run(&self, cx: &mut ScenarioContext) -> Result<(), ScenarioError> {
        match self.body {
            Body::Typed(rtype, f) => f(cx, rtype),
            Body::Untyped(f) => f(cx),
        }
    }
}

impl std::fmt::Debug for Scenario {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name())
    }
}

/// A per-type scenario. Under all-registrants types every registrant is a
/// holder, so some scenarios check something else there and carry a second
/// name.
struct Typed {
    name: &'static str,
    all_registrants_name: &'static str,
    body: TypedBody,
}

const fn typed(name: &'static str, body: TypedBody) -> Typed {
    Typed {
        name,
        all_registrants_name: name,
        body,
    }
}

const TYPED: &[Typed] = &[
    typed("can_reserve", can_reserve),
    typed("reservation_visible_to_all", reservation_visible_to_all),
    typed("holder_can_release", holder_can_release),
    Typed {
        name: "non_holder_release_is_noop",
        all_registrants_name: "registrant_release_releases",
        body: non_holder_release_is_noop,
    },
    Typed {
        name: "holder_unregister_releases",
        all_registrants_name: "reserving_registrant_unregister_keeps_reservation",
        body: holder_unregister_releases,
    },
    Typed {
        name: "non_holder_unregister_keeps_reservation",
        all_registrants_name: "other_registrant_unregister_keeps_reservation",
        body: non_holder_unregister_keeps_reservation,
    },
    typed("access_control", access_control),
    typed("other_registrant_reserve", other_registrant_reserve),
    typed("key_rotation_keeps_reservation", key_rotation_keeps_reservation),
    Typed {
        name: "preempt_transfers_reservation",
        all_registrants_name: "preempt_removes_registrant",
        body: preempt_transfers_reservation,
    },
    typed("clear_removes_everything", clear_removes_everything),
];

const REGISTRATION: &[(&str, UntypedBody)] = &[
    ("registrants_visible_to_all", registrants_visible_to_all),
    ("unregister_removes_key", unregister_removes_key),
    ("double_register_rejected", double_register_rejected),
    ("inquiry_serial_consistent", inquiry_serial_consistent),
];

/// Returns the scenarios for `types`, followed by the registration
/// scenarios.
pub fn catalogue(types: &[ReservationType]) -> Vec<Scenario> {
    let typed = types.iter().flat_map(|&rtype| {
        TYPED.iter().map(move |typed| Scenario {
            group: rtype.rules().ident,
            leaf_name: match rtype.rules().holdership {
                Holdership::Single => typed.name,
                Holdership::AllRegistrants => typed.all_registrants_name,
            },
            body: Body::Typed(rtype, typed.body),
        })
    });
    let untyped = REGISTRATION.iter().map(|&(leaf_name, f)| Scenario {
        group: "registration",
        leaf_name,
        body: Body::Untyped(f),
    });
    typed.chain(untyped).collect()
}

/// Returns a type that conflicts with `rtype`.
fn other_type(rtype: ReservationType) -> ReservationType {
    ReservationType::ALL[(rtype as usize + 1) % ReservationType::ALL.len()]
}

fn can_reserve(cx: &mut ScenarioContext, rtype: ReservationType) -> Result<(), ScenarioError> {
    cx.act(Who::A, Verb::Reserve(rtype))?;
    cx.assert_reservation()?;
    // Repeating the same reservation is a no-op.
    cx.act(Who::A, Verb::Reserve(rtype))?;
    cx.act(Who::A, Verb::Reserve(other_type(rtype)))?;
    cx.act(Who::C, Verb::Reserve(rtype))?;
    cx.assert_reservation()
}

fn reservation_visible_to_all(
    cx: &mut ScenarioContext,
    rtype: ReservationType,
) -> Result<(), ScenarioError> {
    cx.act(Who::A, Verb::Reserve(rtype))?;
    cx.assert_reservation()?;
    cx.assert_registrants()
}

fn holder_can_release(cx: &mut ScenarioContext, rtype: ReservationType) -> Result<(), ScenarioError> {
    cx.act(Who::A, Verb::Reserve(rtype))?;
    cx.act(Who::A, Verb::Release(rtype))?;
    cx.assert_reservation()?;
    cx.assert_access()
}

fn non_holder_release_is_noop(
    cx: &mut ScenarioContext,
    rtype: ReservationType,
) -> Result<(), ScenarioError> {
    cx.act(Who::A, Verb::Reserve(rtype))?;
    cx.act(Who::B, Verb::Release(rtype))?;
    cx.assert_reservation()?;
    cx.assert_access()
}

fn holder_unregister_releases(
    cx: &mut ScenarioContext,
    rtype: ReservationType,
) -> Result<(), ScenarioError> {
    cx.act(Who::A, Verb::Reserve(rtype))?;
    cx.act(Who::A, Verb::Unregister)?;
    cx.assert_reservation()?;
    cx.assert_registrants()?;
    cx.assert_access()
}

fn non_holder_unregister_keeps_reservation(
    cx: &mut ScenarioContext,
    rtype: ReservationType,
) -> Result<(), ScenarioError> {
    cx.act(Who::A, Verb::Reserve(rtype))?;
    cx.act(Who::B, Verb::Unregister)?;
    cx.assert_reservation()?;
    cx.assert_registrants()?;
    cx.assert_access()
}

fn access_control(cx: &mut ScenarioContext, rtype: ReservationType) -> Result<(), ScenarioError> {
    cx.assert_access()?;
    cx.act(Who::A, Verb::Reserve(rtype))?;
    cx.assert_access()
}

fn other_registrant_reserve(
    cx: &mut ScenarioContext,
    rtype: ReservationType,
) -> Result<(), ScenarioError> {
    cx.act(Who::A, Verb::Reserve(rtype))?;
    for other in ReservationType::ALL {
        cx.act(Who::B, Verb::Reserve(other))?;
    }
    cx.assert_reservation()
}

/// Picks a replacement key for `who` that no initiator is using.
fn fresh_key(cx: &ScenarioContext, who: Who) -> ReservationKey {
    let used = Who::ALL.map(|w| cx.key(w));
    let base = cx.key(who).0;
    (1..)
        .map(|i: u64| ReservationKey(base.wrapping_add(i << 8)))
        .find(|key| !key.is_none() && !used.contains(key))
        .unwrap_or(ReservationKey(base ^ 0x100))
}

fn key_rotation_keeps_reservation(
    cx: &mut ScenarioContext,
    rtype: ReservationType,
) -> Result<(), ScenarioError> {
    cx.act(Who::A, Verb::Reserve(rtype))?;
    let new_key = fresh_key(cx, Who::A);
    cx.act(Who::A, Verb::RegisterAndIgnore { new_key })?;
    cx.assert_reservation()?;
    cx.assert_registrants()?;
    cx.assert_access()
}

fn preempt_transfers_reservation(
    cx: &mut ScenarioContext,
    rtype: ReservationType,
) -> Result<(), ScenarioError> {
    cx.act(Who::A, Verb::Reserve(rtype))?;
    let victim = cx.key(Who::A);
    cx.act(Who::B, Verb::Preempt { victim, rtype })?;
    cx.assert_reservation()?;
    cx.assert_registrants()?;
    cx.assert_access()
}

fn clear_removes_everything(
    cx: &mut ScenarioContext,
    rtype: ReservationType,
) -> Result<(), ScenarioError> {
    cx.act(Who::A, Verb::Reserve(rtype))?;
    cx.act(Who::B, Verb::Clear)?;
    cx.assert_reservation()?;
    cx.assert_registrants()?;
    cx.assert_access()
}

fn registrants_visible_to_all(cx: &mut ScenarioContext) -> Result<(), ScenarioError> {
    cx.assert_registrants()?;
    cx.assert_reservation()
}

fn unregister_removes_key(cx: &mut ScenarioContext) -> Result<(), ScenarioError> {
    cx.act(Who::B, Verb::Unregister)?;
    cx.assert_registrants()?;
    // C was never registered.
    cx.act(Who::C, Verb::Unregister)?;
    cx.assert_registrants()
}

fn double_register_rejected(cx: &mut ScenarioContext) -> Result<(), ScenarioError> {
    cx.act(Who::A, Verb::Register)?;
    cx.act(Who::B, Verb::Register)?;
    cx.assert_registrants()
}

fn inquiry_serial_consistent(cx: &mut ScenarioContext) -> Result<(), ScenarioError> {
    cx.assert_serial_consistent()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn names_are_unique() {
        let scenarios = catalogue(&ReservationType::ALL);
        assert_eq!(scenarios.len(), TYPED.len() * 6 + REGISTRATION.len());
        let names: BTreeSet<_> = scenarios.iter().map(Scenario::name).collect();
        assert_eq!(names.len(), scenarios.len());
        assert!(names.contains("exclusive_access::can_reserve"));
        assert!(names.contains("registration::double_register_rejected"));
    }

    #[test]
    fn restricted_types() {
        let scenarios = catalogue(&[ReservationType::WriteExclusiveRegistrantsOnly]);
        assert_eq!(scenarios.len(), TYPED.len() + REGISTRATION.len());
        assert!(scenarios[..TYPED.len()].iter().all(|s| s.reservation_type()
            == Some(ReservationType::WriteExclusiveRegistrantsOnly)));
        assert!(scenarios[TYPED.len()..]
            .iter()
            .all(|s| s.reservation_type().is_none()));
    }

    #[test]
    fn all_registrants_names() {
        let names: BTreeSet<_> = catalogue(&[
            ReservationType::WriteExclusive,
            ReservationType::WriteExclusiveAllRegistrants,
        ])
        .iter()
        .map(Scenario::name)
        .collect();
        assert!(names.contains("write_exclusive::non_holder_release_is_noop"));
        assert!(names.contains("write_exclusive_all_registrants::registrant_release_releases"));
        assert!(names.contains(
            "write_exclusive_all_registrants::reserving_registrant_unregister_keeps_reservation"
        ));
        assert!(!names.contains("write_exclusive_all_registrants::non_holder_release_is_noop"));
        assert!(!names.contains("write_exclusive_all_registrants::holder_unregister_releases"));
    }

    #[test]
    fn other_type_differs() {
        for rtype in ReservationType::ALL {
            assert_ne!(other_type(rtype), rtype);
        }
    }
}
