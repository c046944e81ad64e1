use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::utils::error::TelemetryError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WellheadSnapshot {
    pub wellhead_id: String,
    #[serde(with = "timestamp_format")]
    pub timestamp: DateTime<Utc>,
    pub parameters: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TelemetryFrame {
    pub snapshots: Vec<WellheadSnapshot>,
}

impl TelemetryFrame {
    pub fn new(snapshots: Vec<WellheadSnapshot>) -> Self {
        Self { snapshots }
    }

    pub fn parse_line(line: &str) -> Result<Self, TelemetryError> {
        serde_json::from_str(line.trim())
            .map_err(|e| TelemetryError::MalformedFrame(format!("{} (line: {:.80})", e, line.trim())))
    }

    pub fn to_line(&self) -> Result<String, TelemetryError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn value_count(&self) -> usize {
        self.snapshots.iter().map(|s| s.parameters.len()).sum()
    }
}

// Naive timestamps are taken as UTC.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, TelemetryError> {
    let raw = raw.trim();
    if let Ok(timestamp) = DateTime::parse_from_rfc3339(raw) {
        return Ok(timestamp.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .map(|naive| naive.and_utc())
        .ok_or_else(|| TelemetryError::MalformedFrame(format!("Unparseable timestamp: {}", raw)))
}

mod timestamp_format {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(timestamp: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&timestamp.to_rfc3339_opts(SecondsFormat::Micros, true))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        super::parse_timestamp(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_frame_line() {
        let line = r#"[{"wellhead_id":"WH-001","timestamp":"2024-05-01T12:00:00Z","parameters":{"THP":1234.5,"SDV_ST":1}},
                      {"wellhead_id":"WH-002","timestamp":"2024-05-01T12:00:00Z","parameters":{}}]"#
            .replace('\n', "");
        let frame = TelemetryFrame::parse_line(&line).unwrap();

        assert_eq!(frame.snapshots.len(), 2);
        assert_eq!(frame.value_count(), 2);
        let first = &frame.snapshots[0];
        assert_eq!(first.wellhead_id, "WH-001");
        assert_eq!(first.parameters["THP"], 1234.5);
        assert_eq!(first.parameters["SDV_ST"], 1.0);
        assert_eq!(first.timestamp, Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap());
    }

    #[test]
    fn test_naive_timestamp_is_utc() {
        let expected = Utc.with_ymd_and_hms(2024, 5, 1, 8, 30, 0).unwrap();
        assert_eq!(parse_timestamp("2024-05-01T08:30:00").unwrap(), expected);
        assert_eq!(parse_timestamp("2024-05-01 08:30:00.000").unwrap(), expected);
        assert_eq!(parse_timestamp("2024-05-01T10:30:00+02:00").unwrap(), expected);
        assert!(parse_timestamp("yesterday").is_err());
    }

    #[test]
    fn test_malformed_lines() {
        for line in ["", "{", "{\"wellhead_id\":\"WH-001\"}", "[{\"wellhead_id\":\"WH-001\",\"timestamp\":\"soon\",\"parameters\":{}}]"] {
            assert!(
                matches!(TelemetryFrame::parse_line(line), Err(TelemetryError::MalformedFrame(_))),
                "line {:?}",
                line
            );
        }
    }

    #[test]
    fn test_line_is_single_json_array() {
        let frame = TelemetryFrame::new(vec![WellheadSnapshot {
            wellhead_id: "WH-003".to_string(),
            timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            parameters: BTreeMap::from([("FLT".to_string(), -12.5)]),
        }]);
        let line = frame.to_line().unwrap();
        assert!(line.starts_with('['));
        assert!(!line.contains('\n'));
        assert_eq!(TelemetryFrame::parse_line(&line).unwrap(), frame);
    }
}
