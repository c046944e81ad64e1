use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::catalog::{Parameter, ParameterCategory};
use crate::registers::MapEntry;
use crate::utils::error::TelemetryError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct MappingRow {
    pub mapping_id: i64,
    pub wellhead_id: String,
    pub parameter_id: String,
    pub parameter_code: String,
    pub register_address: i64,
    pub data_type: String,
    pub active: bool,
}

#[derive(Debug, Clone, FromRow)]
pub struct ParameterRow {
    pub parameter_type_id: String,
    pub code: String,
    pub display_name: String,
    pub canonical_unit: String,
    pub data_type: String,
    pub precision: i64,
    pub normal_min: Option<f64>,
    pub normal_max: Option<f64>,
    pub description: String,
    pub category: String,
}

impl TryFrom<ParameterRow> for Parameter {
    type Error = TelemetryError;

    fn try_from(row: ParameterRow) -> Result<Self, Self::Error> {
        let category: ParameterCategory = row.category.parse()?;
        Ok(Parameter {
            parameter_id: row.parameter_type_id,
            code: row.code,
            display_name: row.display_name,
            canonical_unit: row.canonical_unit,
            kind: row.data_type.parse()?,
            precision: row.precision.clamp(0, u8::MAX as i64) as u8,
            normal_min: row.normal_min,
            normal_max: row.normal_max,
            description: row.description,
            category,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct WellheadParameterRow {
    pub wellhead_id: String,
    #[sqlx(flatten)]
    pub parameter: ParameterRow,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Reading {
    #[sqlx(rename = "time")]
    pub timestamp: DateTime<Utc>,
    pub wellhead_id: String,
    pub parameter_id: String,
    pub mapping_id: i64,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReadingBatch {
    captured_at: DateTime<Utc>,
    readings: Vec<Reading>,
}

impl ReadingBatch {
    #[cfg(test)]
    pub(crate) fn new(captured_at: DateTime<Utc>) -> Self {
        Self::with_capacity(captured_at, 0)
    }

    pub fn with_capacity(captured_at: DateTime<Utc>, capacity: usize) -> Self {
        Self {
            captured_at,
            readings: Vec::with_capacity(capacity),
        }
    }

    pub fn record(&mut self, entry: &MapEntry, value: f64) {
        self.readings.push(Reading {
            timestamp: self.captured_at,
            wellhead_id: entry.wellhead_id.clone(),
            parameter_id: entry.parameter_id.clone(),
            mapping_id: entry.mapping_id,
            value,
        });
    }

    #[cfg(test)]
    pub(crate) fn push(&mut self, reading: Reading) {
        self.readings.push(reading);
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    pub fn readings(&self) -> &[Reading] {
        &self.readings
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    /// Precondition for commit: every record carries the cycle timestamp.
    pub fn validate(&self) -> Result<(), TelemetryError> {
        if let Some(stray) = self
            .readings
            .iter()
            .find(|reading| reading.timestamp != self.captured_at)
        {
            return Err(TelemetryError::TimestampInvariantViolation(format!(
                "reading for {}/{} stamped {} in cycle captured at {}",
                stray.wellhead_id,
                stray.parameter_id,
                stray.timestamp.to_rfc3339(),
                self.captured_at.to_rfc3339()
            )));
        }
        Ok(())
    }
}
