// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The protocol oracle: state transitions a conformant target must make for
//! each PERSISTENT RESERVE OUT service action, and the access it must grant.
//!
//! Every function here is pure. Keys identify I_T nexuses, since each nexus
//! under test registers a distinct key.

use crate::AccessKind;
use crate::DeviceState;
use crate::Holdership;
use crate::Reservation;
use crate::ReservationKey;
use crate::ReservationType;
use thiserror::Error;

/// The target must fail the command with RESERVATION CONFLICT (or another
/// error status) and leave its state unchanged.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Error)]
#[error("reservation conflict")]
pub struct Conflict;

/// A PERSISTENT RESERVE OUT service action issued by one nexus.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Verb {
    /// REGISTER with a zero reservation key and the nexus key as the service
    /// action key.
    Register,
    /// REGISTER with the nexus key and a zero service action key.
    Unregister,
    /// REGISTER AND IGNORE EXISTING KEY, replacing the nexus key with
    /// `new_key`.
    RegisterAndIgnore {
        /// The replacement key.
        new_key: ReservationKey,
    },
    /// RESERVE.
    Reserve(ReservationType),
    /// RELEASE.
    Release(ReservationType),
    /// CLEAR.
    Clear,
    /// PREEMPT the registration of `victim`.
    Preempt {
        /// The key being preempted.
        victim: ReservationKey,
        /// The type of the reservation to establish.
        rtype: ReservationType,
    },
}

/// The predicted outcome of a [`Verb`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expectation {
    /// Whether the target must accept the command.
    pub accepted: bool,
    /// The state after the command.
    pub next: DeviceState,
}

/// Returns true if `requestor` may create (or repeat) a reservation of type
/// `rtype`.
///
/// The requestor must be registered. Re-reservation by the holder with the
/// same type is a successful no-op.
pub fn can_reserve(state: &DeviceState, requestor: ReservationKey, rtype: ReservationType) -> bool {
    if !state.is_registered(requestor) {
        return false;
    }
    match &state.reservation {
        None => true,
        Some(reservation) => state.is_holder(requestor) && reservation.rtype == rtype,
    }
}

/// Returns the state after `requestor` releases a reservation of type
/// `rtype`.
///
/// A holder's release clears the reservation. Release by anyone else leaves
/// the state unchanged and still reports success.
pub fn can_release(
    state: &DeviceState,
    requestor: ReservationKey,
    rtype: ReservationType,
) -> DeviceState {
    let mut next = state.clone();
    if let Some(reservation) = &state.reservation {
        if reservation.rtype == rtype && state.is_holder(requestor) {
            next.reservation = None;
        }
    }
    next
}

/// Returns true if `requestor` may perform `access` in `state`.
///
/// With no reservation every nexus has access. Otherwise access follows the
/// reservation type's row in [`crate::TYPE_TABLE`].
pub fn access_allowed(state: &DeviceState, requestor: ReservationKey, access: AccessKind) -> bool {
    match &state.reservation {
        None => true,
        Some(reservation) => reservation.rtype.allows(access, requestor, state),
    }
}

/// Returns the state after `key` is unregistered.
///
/// Losing the registration revokes a single-holder reservation held by
/// `key`. An all-registrants reservation survives as long as any registrant
/// remains.
pub fn on_unregister(state: &DeviceState, key: ReservationKey) -> DeviceState {
    let mut next = state.clone();
    let was_holder = state.is_holder(key);
    next.registrants.remove(&key);
    if let Some(reservation) = &state.reservation {
        let revoked = match reservation.rtype.rules().holdership {
            Holdership::Single => was_holder,
            Holdership::AllRegistrants => next.registrants.is_empty(),
        };
        if revoked {
            next.reservation = None;
        } else if was_holder {
            // Keep reporting a live registrant as the creator.
            if let Some(&other) = next.registrants.iter().next() {
                next.reservation = Some(Reservation {
                    holder: other,
                    rtype: reservation.rtype,
                });
            }
        }
    }
    next
}

/// Returns the state after `key` registers through a nexus that has no
/// registration.
pub fn on_register(state: &DeviceState, key: ReservationKey) -> Result<DeviceState, Conflict> {
    if state.is_registered(key) {
        return Err(Conflict);
    }
    let mut next = state.clone();
    if !key.is_none() {
        next.registrants.insert(key);
    }
    Ok(next)
}

/// Returns the state after the nexus registered as `old_key` (if registered
/// at all) replaces its key with `new_key`, ignoring the existing key.
///
/// Holdership follows the nexus to its new key. A zero `new_key` behaves like
/// [`on_unregister`].
pub fn on_register_and_ignore(
    state: &DeviceState,
    old_key: ReservationKey,
    new_key: ReservationKey,
) -> DeviceState {
    if new_key.is_none() {
        return on_unregister(state, old_key);
    }
    let mut next = state.clone();
    next.registrants.remove(&old_key);
    next.registrants.insert(new_key);
    if let Some(reservation) = &mut next.reservation {
        if reservation.holder == old_key {
            reservation.holder = new_key;
        }
    }
    next
}

/// Returns the state after `key` reserves with type `rtype`.
pub fn on_reserve(
    state: &DeviceState,
    key: ReservationKey,
    rtype: ReservationType,
) -> Result<DeviceState, Conflict> {
    if !can_reserve(state, key, rtype) {
        return Err(Conflict);
    }
    let mut next = state.clone();
    if next.reservation.is_none() {
        next.reservation = Some(Reservation { holder: key, rtype });
    }
    Ok(next)
}

/// Returns the state after `key` clears all registrations and the
/// reservation. Only a registrant may clear.
pub fn on_clear(state: &DeviceState, key: ReservationKey) -> Result<DeviceState, Conflict> {
    if !state.is_registered(key) {
        return Err(Conflict);
    }
    Ok(DeviceState::default())
}

/// Returns the state after `key` preempts `victim`.
///
/// The victim's registration is removed. If the victim held a single-holder
/// reservation, the preemptor takes it over with type `rtype`. Preempting its
/// own key lets the holder change the reservation type in place. Preempting an
/// all-registrants reservation by key only removes that registration, as if
/// the victim had unregistered.
pub fn on_preempt(
    state: &DeviceState,
    key: ReservationKey,
    victim: ReservationKey,
    rtype: ReservationType,
) -> Result<DeviceState, Conflict> {
    if !state.is_registered(key) || !state.is_registered(victim) {
        return Err(Conflict);
    }
    match state.reservation {
        Some(reservation)
            if reservation.rtype.rules().holdership == Holdership::Single
                && reservation.holder == victim =>
        {
            let mut next = state.clone();
            if victim != key {
                next.registrants.remove(&victim);
            }
            next.reservation = Some(Reservation { holder: key, rtype });
            Ok(next)
        }
        _ if victim == key => Ok(state.clone()),
        _ => Ok(on_unregister(state, victim)),
    }
}

/// Predicts the outcome of `actor` issuing `verb` in `state`.
pub fn expect(state: &DeviceState, actor: ReservationKey, verb: &Verb) -> Expectation {
    let result = match *verb {
        Verb::Register => on_register(state, actor),
        Verb::Unregister => {
            if state.is_registered(actor) {
                Ok(on_unregister(state, actor))
            } else {
                Err(Conflict)
            }
        }
        Verb::RegisterAndIgnore { new_key } => Ok(on_register_and_ignore(state, actor, new_key)),
        Verb::Reserve(rtype) => on_reserve(state, actor, rtype),
        Verb::Release(rtype) => {
            if !state.is_registered(actor) {
                Err(Conflict)
            } else if state.is_holder(actor)
                && state.reservation.is_some_and(|r| r.rtype != rtype)
            {
                // A holder releasing with the wrong type is an illegal
                // request.
                Err(Conflict)
            } else {
                Ok(can_release(state, actor, rtype))
            }
        }
        Verb::Clear => on_clear(state, actor),
        Verb::Preempt { victim, rtype } => on_preempt(state, actor, victim, rtype),
    };
    match result {
        Ok(next) => Expectation {
            accepted: true,
            next,
        },
        Err(Conflict) => Expectation {
            accepted: false,
            next: state.clone(),
        },
    }
}
