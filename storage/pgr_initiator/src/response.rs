// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Parsing and rendering of PERSISTENT RESERVE IN text responses.
//!
//! The text shapes are the ones printed by `sg_persist -n`. Any transport
//! that claims compatibility must reproduce them, which is why the renderers
//! live next to the parsers.

use pgr_model::Reservation;
use pgr_model::ReservationKey;
use pgr_model::ReservationType;
use std::collections::BTreeSet;
use thiserror::Error;

/// The result of a READ RESERVATION query.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ReservationQuery {
    /// No reservation is held.
    NoReservation,
    /// A reservation is held.
    Present {
        /// The reservation key reported for the holder.
        key: ReservationKey,
        /// The reservation type.
        rtype: ReservationType,
    },
}

impl ReservationQuery {
    /// Converts to the model's optional reservation.
    pub fn reservation(self) -> Option<Reservation> {
        match self {
            ReservationQuery::NoReservation => None,
            ReservationQuery::Present { key, rtype } => Some(Reservation { holder: key, rtype }),
        }
    }
}

/// A response did not match any known shape.
#[derive(Debug, Error)]
#[expect(missing_docs)] // Self-describing names.
pub enum ParseError {
    #[error("empty response")]
    Empty,
    #[error("unrecognized header line '{0}'")]
    UnknownHeader(String),
    #[error("missing {0} line")]
    MissingLine(&'static str),
    #[error("invalid key line '{0}'")]
    BadKey(String),
    #[error("invalid reservation type line '{0}'")]
    BadType(String),
}

const NO_RESERVATION_MARKERS: &[&str] = &[
    "no reservation held",
    "no registered reservation keys",
    "no reservation",
];
const RESERVATION_FOLLOWS: &str = "reservation follows";
const NO_KEYS: &str = "no registered reservation keys";
const KEYS_FOLLOW: &str = "registered reservation key";

fn content_lines<S: AsRef<str>>(lines: &[S]) -> impl Iterator<Item = &str> {
    lines
        .iter()
        .map(|line| line.as_ref().trim())
        .filter(|line| !line.is_empty())
}

/// Parses the response to a READ RESERVATION query.
pub fn parse_reservation<S: AsRef<str>>(lines: &[S]) -> Result<ReservationQuery, ParseError> {
    let mut lines = content_lines(lines);
    let header = lines.next().ok_or(ParseError::Empty)?;
    let lower = header.to_ascii_lowercase();
    if lower.contains(RESERVATION_FOLLOWS) {
        let key = parse_key_line(lines.next().ok_or(ParseError::MissingLine("key"))?)?;
        let rtype = parse_type_line(lines.next().ok_or(ParseError::MissingLine("type"))?)?;
        Ok(ReservationQuery::Present { key, rtype })
    } else if NO_RESERVATION_MARKERS.iter().any(|m| lower.contains(m)) {
        Ok(ReservationQuery::NoReservation)
    } else {
        Err(ParseError::UnknownHeader(header.to_owned()))
    }
}

fn parse_key_line(line: &str) -> Result<ReservationKey, ParseError> {
    let bad = || ParseError::BadKey(line.to_owned());
    let (name, value) = line.split_once('=').ok_or_else(bad)?;
    if !name.trim().eq_ignore_ascii_case("key") {
        return Err(bad());
    }
    value.parse().map_err(|_| bad())
}

fn parse_type_line(line: &str) -> Result<ReservationType, ParseError> {
    // The name may itself contain commas, so take everything after the
    // `type:` marker rather than splitting into fields.
    let lower = line.to_ascii_lowercase();
    let value = lower
        .match_indices("type")
        .find_map(|(i, m)| {
            let rest = line[i + m.len()..].trim_start();
            rest.strip_prefix(':')
        })
        .ok_or_else(|| ParseError::BadType(line.to_owned()))?;
    ReservationType::from_name(value.trim()).ok_or_else(|| ParseError::BadType(line.to_owned()))
}

/// Parses the response to a READ KEYS query.
pub fn parse_registrants<S: AsRef<str>>(
    lines: &[S],
) -> Result<BTreeSet<ReservationKey>, ParseError> {
    let mut lines = content_lines(lines);
    let header = lines.next().ok_or(ParseError::Empty)?;
    let lower = header.to_ascii_lowercase();
    if lower.contains(NO_KEYS) {
        return Ok(BTreeSet::new());
    }
    if !lower.contains(KEYS_FOLLOW) {
        return Err(ParseError::UnknownHeader(header.to_owned()));
    }
    lines
        .map(|line| {
            line.parse()
                .map_err(|_| ParseError::BadKey(line.to_owned()))
        })
        .collect()
}

/// Extracts the unit serial number from INQUIRY output, if reported.
pub fn parse_inquiry_serial<S: AsRef<str>>(lines: &[S]) -> Option<String> {
    let last = content_lines(lines).last()?;
    if !last.contains("Unit serial number") {
        return None;
    }
    last.split_whitespace().last().map(str::to_owned)
}

/// Renders `query` in the READ RESERVATION shape.
pub fn render_reservation(query: ReservationQuery, generation: u32) -> Vec<String> {
    match query {
        ReservationQuery::NoReservation => vec![format!(
            "  PR generation={generation:#x}, there is NO reservation held"
        )],
        ReservationQuery::Present { key, rtype } => vec![
            format!("  PR generation={generation:#x}, Reservation follows:"),
            format!("    Key={key}"),
            format!("    scope: LU_SCOPE,  type: {rtype}"),
        ],
    }
}

/// Renders `keys` in the READ KEYS shape.
pub fn render_registrants<'a>(
    keys: impl IntoIterator<Item = &'a ReservationKey>,
    generation: u32,
) -> Vec<String> {
    let keys: Vec<_> = keys.into_iter().map(|key| format!("    {key}")).collect();
    let header = match keys.len() {
        0 => format!("  PR generation={generation:#x}, there are NO registered reservation keys"),
        1 => format!("  PR generation={generation:#x}, 1 registered reservation key follows:"),
        n => format!("  PR generation={generation:#x}, {n} registered reservation keys follow:"),
    };
    std::iter::once(header).chain(keys).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_no_reservation() {
        let lines = ["  PR generation=0x4, there is NO reservation held"];
        assert_eq!(
            parse_reservation(&lines).unwrap(),
            ReservationQuery::NoReservation
        );
        let lines = ["  PR generation=0x0, there are NO REGISTERED RESERVATION KEYS"];
        assert_eq!(
            parse_reservation(&lines).unwrap(),
            ReservationQuery::NoReservation
        );
    }

    #[test]
    fn parse_sg_persist_reservation() {
        let lines = [
            "  PR generation=0x2, Reservation follows:",
            "    Key=0x1",
            "    scope: LU_SCOPE,  type: Exclusive Access",
        ];
        assert_eq!(
            parse_reservation(&lines).unwrap(),
            ReservationQuery::Present {
                key: ReservationKey(1),
                rtype: ReservationType::ExclusiveAccess
            }
        );
    }

    #[test]
    fn parse_type_name_with_commas() {
        let lines = [
            "PR generation=0x9, reservation follows:",
            "key = 0xabc",
            "scope: LU_SCOPE,  type: Write Exclusive, registrants only",
        ];
        assert_eq!(
            parse_reservation(&lines).unwrap(),
            ReservationQuery::Present {
                key: ReservationKey(0xabc),
                rtype: ReservationType::WriteExclusiveRegistrantsOnly
            }
        );
    }

    #[test]
    fn parse_scope_type_field() {
        let lines = [
            "Reservation follows",
            "key=0x2",
            "generation=1, scope_type: ExclusiveAccessAllRegistrants",
        ];
        assert_eq!(
            parse_reservation(&lines).unwrap(),
            ReservationQuery::Present {
                key: ReservationKey(2),
                rtype: ReservationType::ExclusiveAccessAllRegistrants
            }
        );
    }

    #[test]
    fn malformed_reservation() {
        let empty: [&str; 0] = [];
        assert!(matches!(parse_reservation(&empty), Err(ParseError::Empty)));
        assert!(matches!(
            parse_reservation(&["sg_persist: command not found"]),
            Err(ParseError::UnknownHeader(_))
        ));
        assert!(matches!(
            parse_reservation(&["Reservation follows:"]),
            Err(ParseError::MissingLine("key"))
        ));
        assert!(matches!(
            parse_reservation(&["Reservation follows:", "Key=zz", "type: Exclusive Access"]),
            Err(ParseError::BadKey(_))
        ));
        assert!(matches!(
            parse_reservation(&["Reservation follows:", "Key=0x1", "scope: LU_SCOPE, type: obsolete [2]"]),
            Err(ParseError::BadType(_))
        ));
    }

    #[test]
    fn registrants() {
        let lines = [
            "  PR generation=0x2, 2 registered reservation keys follow:",
            "    0x1",
            "    0x2",
        ];
        assert_eq!(
            parse_registrants(&lines).unwrap(),
            BTreeSet::from([ReservationKey(1), ReservationKey(2)])
        );
        let lines = ["  PR generation=0x0, there are NO registered reservation keys"];
        assert!(parse_registrants(&lines).unwrap().is_empty());
        assert!(matches!(
            parse_registrants(&["1 registered reservation key follows:", "bogus!"]),
            Err(ParseError::BadKey(_))
        ));
        assert!(matches!(
            parse_registrants(&["reservation conflict"]),
            Err(ParseError::UnknownHeader(_))
        ));
    }

    #[test]
    fn render_then_parse() {
        let keys = [ReservationKey(0x1), ReservationKey(0xfeed)];
        let rendered = render_registrants(&keys, 7);
        assert_eq!(rendered.len(), 3);
        assert_eq!(parse_registrants(&rendered).unwrap(), BTreeSet::from(keys));
        assert!(parse_registrants(&render_registrants(&[], 0))
            .unwrap()
            .is_empty());

        for rtype in ReservationType::ALL {
            let query = ReservationQuery::Present {
                key: ReservationKey(0x1234_5678_9abc_def0),
                rtype,
            };
            assert_eq!(parse_reservation(&render_reservation(query, 3)).unwrap(), query);
        }
        let none = ReservationQuery::NoReservation;
        assert_eq!(parse_reservation(&render_reservation(none, 0)).unwrap(), none);
    }

    #[test]
    fn inquiry_serial() {
        let lines = [
            "standard INQUIRY:",
            "  Vendor identification: LIO-ORG",
            " Unit serial number: 6001405a9c0d8f0",
        ];
        assert_eq!(parse_inquiry_serial(&lines).as_deref(), Some("6001405a9c0d8f0"));
        assert_eq!(parse_inquiry_serial(&lines[..2]), None);
    }
}
