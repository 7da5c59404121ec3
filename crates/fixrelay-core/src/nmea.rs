//! NMEA 0183 sentence parsing.
//!
//! Sentences look like `$GPGGA,123519,4807.038,N,...,*47`: a start delimiter,
//! a talker + sentence id address field, comma separated data fields and an
//! optional `*HH` checksum. Only the sentence kinds needed to build a fix are
//! decoded into typed structs:
//!
//! - `GGA` - position and fix quality
//! - `RMC` - recommended minimum (status, speed, course, date)
//! - `VTG` - track made good and ground speed
//!
//! Any other well-formed sentence is returned as [`Sentence::Other`].

use chrono::{NaiveDate, NaiveTime};
use std::str::FromStr;
use thiserror::Error;

/// Errors that can occur while parsing a sentence.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum NmeaError {
    /// The transmitted checksum does not match the sentence content.
    #[error("Checksum mismatch: expected {expected:02X}, computed {computed:02X}")]
    Checksum { expected: u8, computed: u8 },

    /// The sentence structure is not NMEA 0183.
    #[error("Malformed sentence: {0}")]
    Malformed(&'static str),

    /// A data field could not be decoded.
    #[error("Invalid {field} field: {value:?}")]
    InvalidField { field: &'static str, value: String },
}

impl NmeaError {
    /// Whether this error is a checksum mismatch (as opposed to a structural failure).
    pub fn is_checksum(&self) -> bool {
        matches!(self, NmeaError::Checksum { .. })
    }
}

/// A latitude or longitude as transmitted, with its hemisphere.
#[derive(Debug, Clone, PartialEq)]
pub struct Coordinate {
    /// Degrees and minutes as sent (e.g. "4807.038").
    pub value: String,
    /// Hemisphere letter (N, S, E or W).
    pub hemisphere: char,
}

impl Coordinate {
    /// Value and hemisphere joined, e.g. "4807.038N".
    pub fn to_field(&self) -> String {
        format!("{}{}", self.value, self.hemisphere)
    }
}

/// GGA: global positioning system fix data.
#[derive(Debug, Clone, PartialEq)]
pub struct Gga {
    pub time: Option<NaiveTime>,
    pub latitude: Option<Coordinate>,
    pub longitude: Option<Coordinate>,
    pub fix_quality: Option<u8>,
    pub satellites: Option<u8>,
    pub hdop: Option<f64>,
    pub altitude: Option<f64>,
    pub altitude_units: Option<String>,
}

/// RMC: recommended minimum specific GNSS data.
#[derive(Debug, Clone, PartialEq)]
pub struct Rmc {
    pub time: Option<NaiveTime>,
    /// 'A' = active, 'V' = void.
    pub status: Option<char>,
    pub latitude: Option<Coordinate>,
    pub longitude: Option<Coordinate>,
    /// Speed over ground in knots.
    pub speed_knots: Option<f64>,
    /// Course over ground, degrees true.
    pub course: Option<f64>,
    pub date: Option<NaiveDate>,
}

impl Rmc {
    /// Whether the receiver flagged this sentence as active.
    pub fn is_active(&self) -> bool {
        self.status == Some('A')
    }
}

/// VTG: track made good and ground speed.
#[derive(Debug, Clone, PartialEq)]
pub struct Vtg {
    pub true_track: Option<f64>,
    pub magnetic_track: Option<f64>,
    pub speed_knots: Option<f64>,
    pub speed_kmh: Option<f64>,
}

/// A parsed sentence.
#[derive(Debug, Clone, PartialEq)]
pub enum Sentence {
    Gga(Gga),
    Rmc(Rmc),
    Vtg(Vtg),
    /// Well-formed sentence of a kind this crate does not decode.
    Other { talker: String, kind: String },
}

impl Sentence {
    /// Three letter sentence kind (e.g. "GGA").
    pub fn kind(&self) -> &str {
        match self {
            Sentence::Gga(_) => "GGA",
            Sentence::Rmc(_) => "RMC",
            Sentence::Vtg(_) => "VTG",
            Sentence::Other { kind, .. } => kind,
        }
    }
}

/// XOR checksum over the characters between the start delimiter and `*`.
pub fn checksum(data: &str) -> u8 {
    data.bytes().fold(0u8, |acc, b| acc ^ b)
}

/// Parse one complete line into a sentence.
pub fn parse_sentence(line: &str) -> Result<Sentence, NmeaError> {
    let line = line.trim();
    let start = line
        .find(|c| c == '$' || c == '!')
        .ok_or(NmeaError::Malformed("missing start delimiter"))?;
    let body = &line[start + 1..];

    let data = match body.rfind('*') {
        Some(star) => {
            let data = &body[..star];
            let expected = parse_checksum(&body[star + 1..])?;
            let computed = checksum(data);
            if expected != computed {
                return Err(NmeaError::Checksum { expected, computed });
            }
            data
        }
        None => body,
    };

    let fields = Fields::new(data);
    let address = fields.address();
    if address.len() < 3 || !address.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(NmeaError::Malformed("invalid address field"));
    }

    // Proprietary sentences ("$PMTK...") carry a single 'P' instead of a talker id
    let (talker, kind) = if address.starts_with('P') {
        address.split_at(1)
    } else {
        address.split_at(2)
    };

    match kind {
        "GGA" => parse_gga(&fields).map(Sentence::Gga),
        "RMC" => parse_rmc(&fields).map(Sentence::Rmc),
        "VTG" => parse_vtg(&fields).map(Sentence::Vtg),
        _ => Ok(Sentence::Other {
            talker: talker.to_string(),
            kind: kind.to_string(),
        }),
    }
}

fn parse_checksum(text: &str) -> Result<u8, NmeaError> {
    let text = text.trim();
    if text.len() != 2 {
        return Err(NmeaError::Malformed("checksum must be two hex digits"));
    }
    u8::from_str_radix(text, 16).map_err(|_| NmeaError::Malformed("checksum is not hexadecimal"))
}

fn parse_gga(fields: &Fields<'_>) -> Result<Gga, NmeaError> {
    Ok(Gga {
        time: fields.time(1)?,
        latitude: fields.coordinate(2, 3, "latitude", ['N', 'S'])?,
        longitude: fields.coordinate(4, 5, "longitude", ['E', 'W'])?,
        fix_quality: fields.number(6, "fix quality")?,
        satellites: fields.number(7, "satellite count")?,
        hdop: fields.number(8, "horizontal dilution")?,
        altitude: fields.number(9, "altitude")?,
        altitude_units: fields.get(10).map(str::to_string),
    })
}

fn parse_rmc(fields: &Fields<'_>) -> Result<Rmc, NmeaError> {
    Ok(Rmc {
        time: fields.time(1)?,
        status: fields.flag(2, "status", ['A', 'V'])?,
        latitude: fields.coordinate(3, 4, "latitude", ['N', 'S'])?,
        longitude: fields.coordinate(5, 6, "longitude", ['E', 'W'])?,
        speed_knots: fields.number(7, "speed")?,
        course: fields.number(8, "course")?,
        date: fields.date(9)?,
    })
}

fn parse_vtg(fields: &Fields<'_>) -> Result<Vtg, NmeaError> {
    Ok(Vtg {
        true_track: fields.number(1, "true track")?,
        magnetic_track: fields.number(3, "magnetic track")?,
        speed_knots: fields.number(5, "speed")?,
        speed_kmh: fields.number(7, "speed")?,
    })
}

/// Comma separated fields of a sentence body.
///
/// Missing trailing fields and empty fields both read as absent.
struct Fields<'a> {
    parts: Vec<&'a str>,
}

impl<'a> Fields<'a> {
    fn new(data: &'a str) -> Self {
        Self {
            parts: data.split(',').collect(),
        }
    }

    fn address(&self) -> &'a str {
        self.parts.first().copied().unwrap_or_default()
    }

    fn get(&self, index: usize) -> Option<&'a str> {
        self.parts
            .get(index)
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
    }

    fn number<T: FromStr>(&self, index: usize, field: &'static str) -> Result<Option<T>, NmeaError> {
        self.get(index)
            .map(|value| {
                value.parse().map_err(|_| NmeaError::InvalidField {
                    field,
                    value: value.to_string(),
                })
            })
            .transpose()
    }

    fn flag<const N: usize>(
        &self,
        index: usize,
        field: &'static str,
        allowed: [char; N],
    ) -> Result<Option<char>, NmeaError> {
        let Some(value) = self.get(index) else {
            return Ok(None);
        };
        let mut chars = value.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) if allowed.contains(&c) => Ok(Some(c)),
            _ => Err(NmeaError::InvalidField {
                field,
                value: value.to_string(),
            }),
        }
    }

    fn coordinate(
        &self,
        value_index: usize,
        hemisphere_index: usize,
        field: &'static str,
        hemispheres: [char; 2],
    ) -> Result<Option<Coordinate>, NmeaError> {
        let value = self.get(value_index);
        let hemisphere = self.flag(hemisphere_index, field, hemispheres)?;
        match (value, hemisphere) {
            (Some(value), Some(hemisphere)) => {
                if value.parse::<f64>().is_err() {
                    return Err(NmeaError::InvalidField {
                        field,
                        value: value.to_string(),
                    });
                }
                Ok(Some(Coordinate {
                    value: value.to_string(),
                    hemisphere,
                }))
            }
            _ => Ok(None),
        }
    }

    fn time(&self, index: usize) -> Result<Option<NaiveTime>, NmeaError> {
        self.get(index)
            .map(|value| {
                parse_time(value).ok_or_else(|| NmeaError::InvalidField {
                    field: "time",
                    value: value.to_string(),
                })
            })
            .transpose()
    }

    fn date(&self, index: usize) -> Result<Option<NaiveDate>, NmeaError> {
        self.get(index)
            .map(|value| {
                parse_date(value).ok_or_else(|| NmeaError::InvalidField {
                    field: "date",
                    value: value.to_string(),
                })
            })
            .transpose()
    }
}

/// Parse `HHMMSS` with an optional fractional second (`HHMMSS.ss`).
fn parse_time(value: &str) -> Option<NaiveTime> {
    let (whole, fraction) = match value.split_once('.') {
        Some((whole, fraction)) => (whole, fraction),
        None => (value, ""),
    };
    if whole.len() != 6 || !whole.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if !fraction.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    let hour = whole[0..2].parse().ok()?;
    let minute = whole[2..4].parse().ok()?;
    let second = whole[4..6].parse().ok()?;

    // Right-pad or truncate the fraction to six digits
    let micros = fraction
        .chars()
        .chain(std::iter::repeat('0'))
        .take(6)
        .collect::<String>()
        .parse()
        .ok()?;

    NaiveTime::from_hms_micro_opt(hour, minute, second, micros)
}

/// Parse `DDMMYY`; years 69-99 are 19xx, 00-68 are 20xx.
fn parse_date(value: &str) -> Option<NaiveDate> {
    if value.len() != 6 || !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let day = value[0..2].parse().ok()?;
    let month = value[2..4].parse().ok()?;
    let year: i32 = value[4..6].parse().ok()?;
    let year = if year >= 69 { 1900 + year } else { 2000 + year };
    NaiveDate::from_ymd_opt(year, month, day)
}
