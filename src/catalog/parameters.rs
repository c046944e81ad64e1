use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::registers::EncodingKind;
use crate::utils::error::TelemetryError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterCategory {
    Pressure,
    Temperature,
    Status,
    Vibration,
    Composition,
    Control,
}

impl ParameterCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParameterCategory::Pressure => "pressure",
            ParameterCategory::Temperature => "temperature",
            ParameterCategory::Status => "status",
            ParameterCategory::Vibration => "vibration",
            ParameterCategory::Composition => "composition",
            ParameterCategory::Control => "control",
        }
    }
}

impl fmt::Display for ParameterCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ParameterCategory {
    type Err = TelemetryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pressure" => Ok(ParameterCategory::Pressure),
            "temperature" => Ok(ParameterCategory::Temperature),
            "status" => Ok(ParameterCategory::Status),
            "vibration" => Ok(ParameterCategory::Vibration),
            "composition" => Ok(ParameterCategory::Composition),
            "control" => Ok(ParameterCategory::Control),
            other => Err(TelemetryError::InvalidData(format!(
                "Unknown parameter category: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub parameter_id: String,
    pub code: String,
    pub display_name: String,
    pub canonical_unit: String,
    pub kind: EncodingKind,
    pub precision: u8,
    pub normal_min: Option<f64>,
    pub normal_max: Option<f64>,
    pub description: String,
    pub category: ParameterCategory,
}

impl Parameter {
    pub fn normal_range(&self) -> Option<(f64, f64)> {
        match (self.normal_min, self.normal_max) {
            (Some(min), Some(max)) => Some((min, max)),
            _ => None,
        }
    }

    pub fn validate(&self) -> Result<(), TelemetryError> {
        if self.code.is_empty() {
            return Err(TelemetryError::InvalidData(format!(
                "Parameter {} has an empty code",
                self.parameter_id
            )));
        }
        match (self.normal_min, self.normal_max) {
            (Some(min), Some(max)) if !(min.is_finite() && max.is_finite() && min <= max) => {
                Err(TelemetryError::InvalidData(format!(
                    "Parameter {} has an invalid normal range [{}, {}]",
                    self.code, min, max
                )))
            }
            (Some(_), None) | (None, Some(_)) => Err(TelemetryError::InvalidData(format!(
                "Parameter {} has a half-open normal range",
                self.code
            ))),
            (None, None) if self.kind != EncodingKind::Bool32 => {
                Err(TelemetryError::InvalidData(format!(
                    "Numeric parameter {} needs a normal range",
                    self.code
                )))
            }
            _ => Ok(()),
        }
    }
}

type CatalogRow = (
    &'static str,
    &'static str,
    &'static str,
    &'static str,
    EncodingKind,
    u8,
    Option<(f64, f64)>,
    &'static str,
    ParameterCategory,
);

const STANDARD_SIGNALS: &[CatalogRow] = {
    use EncodingKind::{Bool32, Float32};
    use ParameterCategory::*;
    &[
        // Measured parameters
        ("P01", "THP", "Tubing Head Pressure", "psi", Float32, 1, Some((0.0, 5000.0)), "Pressure at tubing head", Pressure),
        ("P02", "FLP", "Flowline Pressure", "psi", Float32, 1, Some((0.0, 5000.0)), "Pressure in flowline", Pressure),
        ("P03", "CSP", "Casing Pressure", "psi", Float32, 1, Some((0.0, 5000.0)), "Casing annulus pressure", Pressure),
        ("P04", "FLT", "Flowline Temperature", "°C", Float32, 1, Some((-40.0, 200.0)), "Temperature in flowline", Temperature),
        ("P05", "THT", "Tubing Head Temperature", "°C", Float32, 1, Some((-40.0, 200.0)), "Temperature at tubing head", Temperature),
        ("P06", "ANB", "Annulus B", "psi", Float32, 1, Some((0.0, 5000.0)), "Annulus B pressure", Pressure),
        ("P07", "DHP", "Downhole Pressure", "psi", Float32, 1, Some((0.0, 10000.0)), "Reservoir downhole pressure", Pressure),
        ("P08", "DHT", "Downhole Temperature", "°C", Float32, 1, Some((0.0, 250.0)), "Reservoir downhole temperature", Temperature),
        ("P09", "SDV_ST", "SDV Status", "boolean", Bool32, 0, None, "Shutdown valve status", Status),
        ("P10", "SSV_ST", "SSV Status", "boolean", Bool32, 0, None, "Surface safety valve status", Status),
        ("P11", "VIB", "Vibration Monitoring", "g", Float32, 2, Some((0.0, 50.0)), "Wellhead vibration monitoring", Vibration),
        ("P12", "AMB_T", "Ambient Temperature", "°C", Float32, 1, Some((-50.0, 80.0)), "External environment temperature", Temperature),
        ("P13", "WCUT", "Water Cut", "%", Float32, 1, Some((0.0, 100.0)), "Percentage of water in produced fluids", Composition),
        // Control signals
        ("P14", "SSV_CTRL", "SSV Control", "boolean", Bool32, 0, None, "Command to operate SSV", Control),
        ("P15", "SDV_CTRL", "SDV Control", "boolean", Bool32, 0, None, "Command to operate SDV", Control),
        ("P16", "WING_CTRL", "Wing Valve Control", "boolean", Bool32, 0, None, "Command to operate wing valve", Control),
        ("P17", "CHOKE_CTRL", "Choke Valve Control", "boolean", Bool32, 0, None, "Command to operate choke valve", Control),
    ]
};

pub fn standard_catalog() -> Vec<Parameter> {
    STANDARD_SIGNALS
        .iter()
        .map(
            |&(id, code, name, unit, kind, precision, range, description, category)| Parameter {
                parameter_id: id.to_string(),
                code: code.to_string(),
                display_name: name.to_string(),
                canonical_unit: unit.to_string(),
                kind,
                precision,
                normal_min: range.map(|(min, _)| min),
                normal_max: range.map(|(_, max)| max),
                description: description.to_string(),
                category,
            },
        )
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_standard_catalog_is_valid() {
        let catalog = standard_catalog();
        assert_eq!(catalog.len(), 17);
        for parameter in &catalog {
            parameter.validate().unwrap();
        }

        let codes: HashSet<_> = catalog.iter().map(|p| p.code.as_str()).collect();
        assert_eq!(codes.len(), catalog.len());
    }

    #[test]
    fn test_boolean_parameters_have_no_range() {
        for parameter in standard_catalog() {
            if parameter.kind == EncodingKind::Bool32 {
                assert!(parameter.normal_range().is_none(), "{}", parameter.code);
                assert_eq!(parameter.precision, 0);
            } else {
                assert!(parameter.normal_range().is_some(), "{}", parameter.code);
            }
        }
    }

    #[test]
    fn test_invalid_range_rejected() {
        let mut parameter = standard_catalog().remove(0);
        parameter.normal_min = Some(10.0);
        parameter.normal_max = Some(1.0);
        assert!(parameter.validate().is_err());

        parameter.normal_max = None;
        assert!(parameter.validate().is_err());
    }

    #[test]
    fn test_category_round_trip_names() {
        for category in [ParameterCategory::Pressure, ParameterCategory::Control] {
            assert_eq!(category.as_str().parse::<ParameterCategory>().unwrap(), category);
        }
    }
}
