//! Conforming parser for the CoT events produced by this crate and by
//! other TAK-family peers.

use std::fmt;

use chrono::{DateTime, Utc};
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};

use super::{Affiliation, UNKNOWN_ERROR};
use crate::error::CotError;

/// Fields extracted from a CoT event.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CotData {
    pub uid: String,
    pub event_type: String,
    pub how: String,
    pub callsign: String,
    pub time: Option<DateTime<Utc>>,
    pub stale: Option<DateTime<Utc>>,
    pub lat: f64,
    pub lon: f64,
    /// Height above ellipsoid.
    pub hae: f64,
    /// Circular error.
    pub ce: f64,
    /// Linear error.
    pub le: f64,
    /// Heading from `<track course=..>`, when present.
    pub course: Option<f64>,
}

impl CotData {
    /// Parse a CoT XML event.
    ///
    /// Missing point attributes default to `0.0` (`ce`/`le` to the
    /// unknown-accuracy sentinel). A missing callsign falls back to the
    /// event uid.
    pub fn parse(xml: &str) -> Result<Self, CotError> {
        if xml.trim().is_empty() {
            return Err(CotError::Empty);
        }

        let mut reader = Reader::from_str(xml);
        let mut data = CotData {
            ce: UNKNOWN_ERROR,
            le: UNKNOWN_ERROR,
            ..Default::default()
        };
        let mut seen_root = false;
        let mut in_detail = false;

        loop {
            let event = reader.read_event().map_err(malformed)?;
            match event {
                Event::Start(ref e) | Event::Empty(ref e) => {
                    let opens_detail = matches!(event, Event::Start(_));
                    if !seen_root {
                        if e.name().as_ref() != b"event" {
                            return Err(CotError::NotAnEvent(
                                String::from_utf8_lossy(e.name().as_ref()).into_owned(),
                            ));
                        }
                        seen_root = true;
                        data.read_event_attributes(e)?;
                        continue;
                    }
                    match e.name().as_ref() {
                        b"point" => data.read_point_attributes(e)?,
                        b"detail" => in_detail = opens_detail,
                        b"contact" if in_detail && data.callsign.is_empty() => {
                            if let Some(callsign) = attribute(e, b"callsign")? {
                                data.callsign = callsign;
                            }
                        }
                        b"track" if in_detail => {
                            data.course = attribute(e, b"course")?.and_then(|v| v.trim().parse().ok());
                        }
                        _ => {}
                    }
                }
                Event::End(ref e) if e.name().as_ref() == b"detail" => in_detail = false,
                Event::Eof => break,
                _ => {}
            }
        }

        if !seen_root {
            return Err(CotError::Malformed("no root element".into()));
        }
        if data.callsign.is_empty() {
            data.callsign = data.uid.clone();
        }
        Ok(data)
    }

    /// A usable event carries both a uid and a callsign.
    pub fn is_valid(&self) -> bool {
        !self.uid.is_empty() && !self.callsign.is_empty()
    }

    pub fn affiliation(&self) -> Affiliation {
        Affiliation::from_cot_type(&self.event_type)
    }

    fn read_event_attributes(&mut self, e: &BytesStart<'_>) -> Result<(), CotError> {
        for attr in e.attributes() {
            let attr = attr.map_err(malformed)?;
            let value = attr.unescape_value().map_err(malformed)?;
            match attr.key.as_ref() {
                b"uid" => self.uid = value.into_owned(),
                b"type" => self.event_type = value.into_owned(),
                b"how" => self.how = value.into_owned(),
                b"time" => self.time = Some(timestamp("time", &value)?),
                b"stale" => self.stale = Some(timestamp("stale", &value)?),
                _ => {}
            }
        }
        Ok(())
    }

    fn read_point_attributes(&mut self, e: &BytesStart<'_>) -> Result<(), CotError> {
        for attr in e.attributes() {
            let attr = attr.map_err(malformed)?;
            let value = attr.unescape_value().map_err(malformed)?;
            match attr.key.as_ref() {
                b"lat" => self.lat = number(&value, 0.0),
                b"lon" => self.lon = number(&value, 0.0),
                b"hae" => self.hae = number(&value, 0.0),
                b"ce" => self.ce = number(&value, UNKNOWN_ERROR),
                b"le" => self.le = number(&value, UNKNOWN_ERROR),
                _ => {}
            }
        }
        Ok(())
    }
}

impl fmt::Display for CotData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CotData{{callsign='{}', lat={}, lon={}, hae={}, type='{}'}}",
            self.callsign, self.lat, self.lon, self.hae, self.event_type
        )
    }
}

/// Compact HUD text for a parsed event.
pub fn format_for_hud(data: &CotData) -> String {
    if !data.is_valid() {
        return "NO DATA".to_string();
    }
    format!(
        "CALLSIGN: {}\nPOS: {:.6}, {:.6}\nALT: {:.1}m\nAFFIL: {}",
        data.callsign,
        data.lat,
        data.lon,
        data.hae,
        data.affiliation()
    )
}

// ── Helpers ──────────────────────────────────────────────────────

fn malformed(e: impl fmt::Display) -> CotError {
    CotError::Malformed(e.to_string())
}

fn attribute(e: &BytesStart<'_>, key: &[u8]) -> Result<Option<String>, CotError> {
    for attr in e.attributes() {
        let attr = attr.map_err(malformed)?;
        if attr.key.as_ref() == key {
            let value = attr.unescape_value().map_err(malformed)?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

fn number(value: &str, default: f64) -> f64 {
    value.trim().parse().unwrap_or(default)
}

fn timestamp(attribute: &'static str, value: &str) -> Result<DateTime<Utc>, CotError> {
    DateTime::parse_from_rfc3339(value.trim())
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| CotError::InvalidTimestamp {
            attribute,
            value: value.to_string(),
        })
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cot::{PositionFix, STALE_AFTER, TelemetryMessage};

    #[test]
    fn round_trip_test_pattern() {
        let fix = PositionFix::new(39.2, -77.0, 121.0, 270.0, "TEST");
        let msg = TelemetryMessage::position(&fix);
        let data = CotData::parse(&msg.encode()).unwrap();

        assert_eq!(data.lat, 39.2);
        assert_eq!(data.lon, -77.0);
        assert_eq!(data.hae, 121.0);
        assert_eq!(data.ce, 9_999_999.0);
        assert_eq!(data.le, 9_999_999.0);
        assert_eq!(data.callsign, "TEST");
        assert_eq!(data.uid, msg.uid());
        assert_eq!(data.event_type, "a-u-G");
        assert_eq!(data.how, "h-g-i-g-o");
        assert_eq!(data.course, Some(270.0));
        assert_eq!(data.time, Some(msg.time()));
        assert_eq!(data.stale.unwrap() - data.time.unwrap(), STALE_AFTER);
        assert!(data.is_valid());
    }

    #[test]
    fn round_trip_preserves_precision() {
        let fix = PositionFix::new(38.889_483_123, -77.035_278_456, 17.25, 0.0, "P");
        let data = CotData::parse(&TelemetryMessage::position(&fix).encode()).unwrap();
        assert_eq!(data.lat, 38.889_483_123);
        assert_eq!(data.lon, -77.035_278_456);
        assert_eq!(data.hae, 17.25);
    }

    #[test]
    fn missing_callsign_falls_back_to_uid() {
        let xml = "<event uid='abc' type='a-f-G'><point lat='1' lon='2'/></event>";
        let data = CotData::parse(xml).unwrap();
        assert_eq!(data.callsign, "abc");
        assert_eq!(data.ce, UNKNOWN_ERROR);
        assert_eq!(data.hae, 0.0);
        assert_eq!(data.affiliation(), Affiliation::Friendly);
    }

    #[test]
    fn invalid_numbers_use_defaults() {
        let xml = "<event uid='u'><point lat='north' lon='2.5' ce='x'/></event>";
        let data = CotData::parse(xml).unwrap();
        assert_eq!(data.lat, 0.0);
        assert_eq!(data.lon, 2.5);
        assert_eq!(data.ce, UNKNOWN_ERROR);
    }

    #[test]
    fn rejects_non_event_root() {
        let err = CotData::parse("<message uid='x'/>").unwrap_err();
        assert_eq!(err, CotError::NotAnEvent("message".into()));
    }

    #[test]
    fn rejects_empty_and_malformed() {
        assert_eq!(CotData::parse("  ").unwrap_err(), CotError::Empty);
        assert!(matches!(
            CotData::parse("<event uid='x'><point lat='1'></event>"),
            Err(CotError::Malformed(_))
        ));
    }

    #[test]
    fn rejects_bad_timestamp() {
        let err = CotData::parse("<event uid='x' time='yesterday'/>").unwrap_err();
        assert!(matches!(err, CotError::InvalidTimestamp { attribute: "time", .. }));
    }

    #[test]
    fn hud_text() {
        let fix = PositionFix::new(39.2, -77.0, 121.0, 270.0, "TEST");
        let data = CotData::parse(&TelemetryMessage::position(&fix).encode()).unwrap();
        assert_eq!(
            format_for_hud(&data),
            "CALLSIGN: TEST\nPOS: 39.200000, -77.000000\nALT: 121.0m\nAFFIL: UNKNOWN"
        );
        assert_eq!(format_for_hud(&CotData::default()), "NO DATA");
    }
}
