//! Fix aggregation from NMEA sentences.
//!
//! A fix is assembled from two sentence kinds against one in-progress
//! accumulator per device:
//! - `GGA` supplies time, position, altitude, fix quality and satellite count
//! - `RMC` supplies date, speed, course and status, and triggers emission
//!
//! On every `RMC` the accumulator is evaluated and then replaced with an
//! empty one, whether or not a fix was emitted.

use chrono::{NaiveDate, NaiveTime};
use tracing::{debug, info, trace, warn};

use crate::model::{FixRecord, KNOTS_TO_KMH};
use crate::nmea::{parse_sentence, Gga, Rmc, Sentence};

/// Fix quality codes at or above this value are not relayed by default.
pub const DEFAULT_FIX_QUALITY_THRESHOLD: u8 = 5;

/// In-progress fix; every field is optional until both sentences arrived.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartialFix {
    pub datestamp: Option<NaiveDate>,
    pub timestamp: Option<NaiveTime>,
    pub latitude: Option<String>,
    pub longitude: Option<String>,
    pub altitude: Option<String>,
    pub fix_quality: Option<u8>,
    pub satellites: Option<u8>,
    pub speed_kmh: Option<f64>,
    pub course: Option<f64>,
    /// RMC status letter ('A' = active).
    pub status: Option<char>,
}

impl PartialFix {
    /// Whether no field has been set.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// The fix, if every field is present.
    pub fn complete(&self) -> Option<FixRecord> {
        Some(FixRecord {
            datestamp: self.datestamp?,
            timestamp: self.timestamp?,
            latitude: self.latitude.clone()?,
            longitude: self.longitude.clone()?,
            altitude: self.altitude.clone()?,
            fix_quality: self.fix_quality?,
            satellites: self.satellites?,
            speed_kmh: self.speed_kmh?,
            course: self.course?,
        })
    }

    fn apply_gga(&mut self, gga: Gga) {
        self.timestamp = gga.time;
        self.latitude = gga.latitude.map(|c| c.to_field());
        self.longitude = gga.longitude.map(|c| c.to_field());
        self.altitude = match (gga.altitude, gga.altitude_units) {
            (Some(altitude), Some(units)) => Some(format!("{altitude:.6}{units}")),
            _ => None,
        };
        self.fix_quality = gga.fix_quality;
        self.satellites = gga.satellites;
    }

    fn apply_rmc(&mut self, rmc: &Rmc) {
        self.datestamp = rmc.date;
        self.speed_kmh = rmc.speed_knots.map(|knots| knots * KNOTS_TO_KMH);
        self.course = rmc.course;
        self.status = rmc.status;
    }
}

/// Turns a device's stream of lines into validated fixes.
#[derive(Debug, Clone)]
pub struct NmeaFixAggregator {
    accumulator: PartialFix,
    fix_quality_threshold: u8,
}

impl Default for NmeaFixAggregator {
    fn default() -> Self {
        Self::new(DEFAULT_FIX_QUALITY_THRESHOLD)
    }
}

impl NmeaFixAggregator {
    /// Create an aggregator accepting fixes with quality below `fix_quality_threshold`.
    pub fn new(fix_quality_threshold: u8) -> Self {
        Self {
            accumulator: PartialFix::default(),
            fix_quality_threshold,
        }
    }

    /// The in-progress accumulator.
    pub fn accumulator(&self) -> &PartialFix {
        &self.accumulator
    }

    /// Parse one complete line and apply it.
    ///
    /// Lines that fail to parse are logged and skipped; the accumulator is
    /// left untouched.
    pub fn ingest_line(&mut self, line: &str) -> Option<FixRecord> {
        match parse_sentence(line) {
            Ok(sentence) => {
                debug!("{}", line);
                self.apply(sentence)
            }
            Err(e) if e.is_checksum() => {
                info!("NMEA: {}: Skipping sentence", e);
                debug!("\t{}", line);
                None
            }
            Err(e) => {
                warn!("NMEA: {}: Skipping sentence", e);
                debug!("\t{}", line);
                None
            }
        }
    }

    /// Apply a parsed sentence, returning a fix when one is emitted.
    pub fn apply(&mut self, sentence: Sentence) -> Option<FixRecord> {
        match sentence {
            Sentence::Gga(gga) => {
                self.accumulator.apply_gga(gga);
                None
            }
            Sentence::Rmc(rmc) => {
                self.accumulator.apply_rmc(&rmc);
                let accumulator = std::mem::take(&mut self.accumulator);
                self.accept(&accumulator)
            }
            Sentence::Vtg(vtg) => {
                trace!("Track made good: {:?}", vtg);
                None
            }
            Sentence::Other { talker, kind } => {
                trace!("Ignoring {}{} sentence", talker, kind);
                None
            }
        }
    }

    /// Emission check for a finished accumulator.
    fn accept(&self, accumulator: &PartialFix) -> Option<FixRecord> {
        let fix = accumulator.complete()?;
        if accumulator.status != Some('A') {
            debug!("Discarding fix with inactive status {:?}", accumulator.status);
            return None;
        }
        if fix.fix_quality >= self.fix_quality_threshold {
            debug!(
                "Discarding fix with quality {} (threshold {})",
                fix.fix_quality, self.fix_quality_threshold
            );
            return None;
        }
        debug!("{:?}", fix);
        Some(fix)
    }
}
