//! Cursor-on-Target (CoT) telemetry messages.
//!
//! [`TelemetryMessage`] is the value object encoded for every
//! transmission to the HUD. [`CotData`] is the matching parser, and
//! [`Affiliation`] classifies CoT type strings.
//!
//! ## Wire format
//!
//! ```text
//! <?xml version='1.0'?>
//! <event version='2.0' uid='…' type='a-u-G' time='…' start='…' stale='…' how='h-g-i-g-o' access='Undefined'>
//! <point lat='39.2' lon='-77.0' hae='121.0' ce='9999999.0' le='9999999.0' />
//! <detail>
//! <contact callsign='…'/>
//! <track course='270.0' speed='0.0'/>
//! <status readiness='true'/>
//! </detail>
//! </event>
//! ```

mod affiliation;
mod parse;

pub use affiliation::Affiliation;
pub use parse::{CotData, format_for_hud};

use bytes::Bytes;
use chrono::{DateTime, SubsecRound, TimeDelta, Utc};
use quick_xml::escape::escape;
use uuid::Uuid;

// ── Constants ────────────────────────────────────────────────────

/// Circular / linear error value meaning "unknown accuracy".
pub const UNKNOWN_ERROR: f64 = 9_999_999.0;

/// How long a position report stays valid after issue.
pub const STALE_AFTER: TimeDelta = TimeDelta::hours(1);

/// Callsign used when the caller supplies an empty one.
pub const DEFAULT_CALLSIGN: &str = "HUDLink";

/// CoT type emitted for self-position reports to the HUD.
pub const EVENT_TYPE: &str = "a-u-G";

/// CoT `how` value: human-entered, GPS-derived.
pub const EVENT_HOW: &str = "h-g-i-g-o";

/// Timestamp layout: ISO-8601, millisecond precision, `Z` suffix.
pub(crate) const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

// ── PositionFix ──────────────────────────────────────────────────

/// The current position as reported by the host's position accessor.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionFix {
    /// Latitude in degrees.
    pub lat: f64,
    /// Longitude in degrees.
    pub lon: f64,
    /// Height above ellipsoid in meters.
    pub hae: f64,
    /// Heading in degrees.
    pub heading: f64,
    pub callsign: String,
}

impl PositionFix {
    pub fn new(lat: f64, lon: f64, hae: f64, heading: f64, callsign: impl Into<String>) -> Self {
        Self {
            lat,
            lon,
            hae,
            heading,
            callsign: callsign.into(),
        }
    }

    /// Fixed fix sent by the operator's "test connection" action.
    pub fn test_pattern(callsign: impl Into<String>) -> Self {
        Self::new(39.2, -77.0, 121.0, 270.0, callsign)
    }

    /// Whether latitude and longitude are usable.
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lon)
    }

    /// Multi-line operator preview of what is being streamed.
    pub fn preview(&self) -> String {
        format!(
            "STREAMING TO HUD:\nCallsign: {}\nLat: {:.6}°\nLon: {:.6}°\nAlt: {:.1} m\nHdg: {:.1}°",
            self.callsign, self.lat, self.lon, self.hae, self.heading,
        )
    }
}

// ── TelemetryMessage ─────────────────────────────────────────────

/// A position/telemetry report, constructed fresh per transmission.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryMessage {
    uid: String,
    time: DateTime<Utc>,
    stale: DateTime<Utc>,
    lat: f64,
    lon: f64,
    hae: f64,
    heading: f64,
    callsign: String,
}

impl TelemetryMessage {
    /// Build a report for `fix`, issued now with a random uid.
    pub fn position(fix: &PositionFix) -> Self {
        Self::position_at(fix, Utc::now(), Uuid::new_v4())
    }

    /// Build a report with an explicit issue time and uid.
    pub fn position_at(fix: &PositionFix, now: DateTime<Utc>, uid: Uuid) -> Self {
        let time = now.trunc_subsecs(3);
        let callsign = if fix.callsign.trim().is_empty() {
            DEFAULT_CALLSIGN.to_string()
        } else {
            fix.callsign.clone()
        };
        Self {
            uid: uid.to_string(),
            time,
            stale: time + STALE_AFTER,
            lat: fix.lat,
            lon: fix.lon,
            // A non-finite height is reported as unknown.
            hae: if fix.hae.is_finite() { fix.hae } else { UNKNOWN_ERROR },
            heading: if fix.heading.is_finite() { fix.heading } else { 0.0 },
            callsign,
        }
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn time(&self) -> DateTime<Utc> {
        self.time
    }

    pub fn stale(&self) -> DateTime<Utc> {
        self.stale
    }

    pub fn callsign(&self) -> &str {
        &self.callsign
    }

    /// Render the canonical XML event.
    pub fn encode(&self) -> String {
        let time = self.time.format(TIME_FORMAT).to_string();
        let stale = self.stale.format(TIME_FORMAT).to_string();
        let ce = decimal(UNKNOWN_ERROR);
        let le = decimal(UNKNOWN_ERROR);

        let mut xml = String::with_capacity(512);
        xml.push_str("<?xml version='1.0'?>\n");
        xml.push_str(&format!(
            "<event version='2.0' uid='{}' type='{EVENT_TYPE}' time='{time}' start='{time}' \
             stale='{stale}' how='{EVENT_HOW}' access='Undefined'>\n",
            self.uid,
        ));
        xml.push_str(&format!(
            "<point lat='{}' lon='{}' hae='{}' ce='{ce}' le='{le}' />\n",
            decimal(self.lat),
            decimal(self.lon),
            decimal(self.hae),
        ));
        xml.push_str("<detail>\n");
        xml.push_str(&format!("<contact callsign='{}'/>\n", escape(self.callsign.as_str())));
        xml.push_str(&format!(
            "<track course='{}' speed='0.0'/>\n",
            decimal(self.heading)
        ));
        xml.push_str("<status readiness='true'/>\n");
        xml.push_str("</detail>\n");
        xml.push_str("</event>");
        xml
    }

    /// The encoded event as UTF-8 bytes, ready for transfer.
    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.encode())
    }
}

/// Fixed-point decimal with the shortest digits that round-trip,
/// always keeping at least one fractional digit (`121` → `121.0`).
fn decimal(value: f64) -> String {
    let text = value.to_string();
    if text.contains('.') || !value.is_finite() {
        text
    } else {
        format!("{text}.0")
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 45).unwrap() + TimeDelta::microseconds(123_456)
    }

    #[test]
    fn decimal_formatting() {
        assert_eq!(decimal(121.0), "121.0");
        assert_eq!(decimal(-77.0), "-77.0");
        assert_eq!(decimal(39.2), "39.2");
        assert_eq!(decimal(9_999_999.0), "9999999.0");
        assert_eq!(decimal(0.0000001), "0.0000001");
        assert_eq!(decimal(38.123456789), "38.123456789");
    }

    #[test]
    fn encodes_timestamps_with_millisecond_precision() {
        let fix = PositionFix::test_pattern("TEST");
        let msg = TelemetryMessage::position_at(&fix, fixed_time(), Uuid::nil());
        let xml = msg.encode();
        assert!(xml.contains("time='2024-03-01T12:30:45.123Z'"));
        assert!(xml.contains("start='2024-03-01T12:30:45.123Z'"));
        assert!(xml.contains("stale='2024-03-01T13:30:45.123Z'"));
    }

    #[test]
    fn encodes_point_with_sentinels() {
        let fix = PositionFix::test_pattern("TEST");
        let xml = TelemetryMessage::position_at(&fix, fixed_time(), Uuid::nil()).encode();
        assert!(xml.contains(
            "<point lat='39.2' lon='-77.0' hae='121.0' ce='9999999.0' le='9999999.0' />"
        ));
        assert!(xml.contains("type='a-u-G'"));
        assert!(xml.contains("how='h-g-i-g-o'"));
        assert!(xml.contains("<contact callsign='TEST'/>"));
        assert!(xml.contains("<track course='270.0'"));
    }

    #[test]
    fn empty_callsign_uses_placeholder() {
        let fix = PositionFix::new(1.0, 2.0, 3.0, 0.0, "  ");
        let msg = TelemetryMessage::position(&fix);
        assert_eq!(msg.callsign(), DEFAULT_CALLSIGN);
        assert!(msg.encode().contains("callsign='HUDLink'"));
    }

    #[test]
    fn callsign_is_escaped() {
        let fix = PositionFix::new(1.0, 2.0, 3.0, 0.0, "A'B<C>");
        let xml = TelemetryMessage::position(&fix).encode();
        assert!(!xml.contains("A'B<C>"));
        assert_eq!(CotData::parse(&xml).unwrap().callsign, "A'B<C>");
    }

    #[test]
    fn each_message_gets_a_fresh_uid() {
        let fix = PositionFix::test_pattern("TEST");
        let a = TelemetryMessage::position(&fix);
        let b = TelemetryMessage::position(&fix);
        assert_ne!(a.uid(), b.uid());
        assert_eq!(a.stale() - a.time(), STALE_AFTER);
    }

    #[test]
    fn non_finite_height_is_reported_unknown() {
        let fix = PositionFix::new(1.0, 2.0, f64::NAN, 0.0, "X");
        let xml = TelemetryMessage::position(&fix).encode();
        assert!(xml.contains("hae='9999999.0'"));
    }

    #[test]
    fn fix_validity() {
        assert!(PositionFix::test_pattern("T").is_valid());
        assert!(!PositionFix::new(f64::NAN, 0.0, 0.0, 0.0, "T").is_valid());
        assert!(!PositionFix::new(91.0, 0.0, 0.0, 0.0, "T").is_valid());
        assert!(!PositionFix::new(0.0, f64::INFINITY, 0.0, 0.0, "T").is_valid());
    }

    #[test]
    fn preview_formatting() {
        let text = PositionFix::test_pattern("ALPHA").preview();
        assert!(text.contains("Callsign: ALPHA"));
        assert!(text.contains("Lat: 39.200000°"));
        assert!(text.contains("Alt: 121.0 m"));
    }
}
