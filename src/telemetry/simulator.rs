use async_trait::async_trait;
use chrono::Utc;
use log::{debug, info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::{interval, Interval, MissedTickBehavior};

use super::frame::{TelemetryFrame, WellheadSnapshot};
use super::source::TelemetrySource;
use crate::catalog::Parameter;
use crate::config::settings::SimulationConfig;
use crate::registers::EncodingKind;
use crate::utils::error::TelemetryError;

const EXCURSION_MARGIN: f64 = 0.2;

#[derive(Debug, Clone, PartialEq)]
pub struct SimulationProfile {
    pub wellhead_id: String,
    pub parameters: Vec<Parameter>,
}

impl SimulationProfile {
    pub fn group(rows: Vec<(String, Parameter)>) -> Vec<Self> {
        let mut grouped: BTreeMap<String, Vec<Parameter>> = BTreeMap::new();
        for (wellhead_id, parameter) in rows {
            grouped.entry(wellhead_id).or_default().push(parameter);
        }
        grouped
            .into_iter()
            .map(|(wellhead_id, parameters)| SimulationProfile {
                wellhead_id,
                parameters,
            })
            .collect()
    }
}

/// `None` for a numeric parameter with no normal range.
pub fn generate_value<R>(rng: &mut R, parameter: &Parameter, excursion_probability: f64) -> Option<f64>
where
    R: Rng + ?Sized,
{
    if parameter.kind == EncodingKind::Bool32 {
        return Some(if rng.gen_bool(0.5) { 1.0 } else { 0.0 });
    }

    let (min, max) = parameter.normal_range()?;
    if parameter.kind == EncodingKind::Int32 {
        // Integers never take excursions.
        let (low, high) = (min.ceil() as i64, max.floor() as i64);
        let sample = if high > low { rng.gen_range(low..=high) } else { low };
        return Some(sample as f64);
    }

    let (low, high) = if rng.gen_bool(excursion_probability.clamp(0.0, 1.0)) {
        let margin = (max - min) * EXCURSION_MARGIN;
        (min - margin, max + margin)
    } else {
        (min, max)
    };
    let sample = if high > low { rng.gen_range(low..=high) } else { low };

    Some(round_to(sample, parameter.precision))
}

fn round_to(value: f64, precision: u8) -> f64 {
    let scale = 10f64.powi(precision as i32);
    (value * scale).round() / scale
}

pub struct SimulatedSource {
    profiles: Vec<SimulationProfile>,
    rng: StdRng,
    ticker: Interval,
    excursion_probability: f64,
}

impl SimulatedSource {
    pub fn new(profiles: Vec<SimulationProfile>, config: &SimulationConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let mut ticker = interval(config.interval().max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "🎲 Simulating {} wellheads, {} signals every {:?}",
            profiles.len(),
            profiles.iter().map(|p| p.parameters.len()).sum::<usize>(),
            config.interval()
        );

        Self {
            profiles,
            rng,
            ticker,
            excursion_probability: config.excursion_probability,
        }
    }

    pub fn generate_frame(&mut self) -> TelemetryFrame {
        let timestamp = Utc::now();
        let mut snapshots = Vec::with_capacity(self.profiles.len());

        for profile in &self.profiles {
            let mut parameters = BTreeMap::new();
            for parameter in &profile.parameters {
                match generate_value(&mut self.rng, parameter, self.excursion_probability) {
                    Some(value) => {
                        parameters.insert(parameter.code.clone(), value);
                    }
                    None => debug!(
                        "Skipping {}/{}: no normal range",
                        profile.wellhead_id, parameter.code
                    ),
                }
            }
            snapshots.push(WellheadSnapshot {
                wellhead_id: profile.wellhead_id.clone(),
                timestamp,
                parameters,
            });
        }

        TelemetryFrame::new(snapshots)
    }
}

#[async_trait]
impl TelemetrySource for SimulatedSource {
    async fn next_frame(&mut self) -> Option<Result<TelemetryFrame, TelemetryError>> {
        self.ticker.tick().await;
        Some(Ok(self.generate_frame()))
    }

    fn describe(&self) -> String {
        format!("simulation of {} wellheads", self.profiles.len())
    }
}
