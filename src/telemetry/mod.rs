pub mod frame;
pub mod simulator;
pub mod source;

pub use frame::{TelemetryFrame, WellheadSnapshot};
pub use simulator::{generate_value, SimulatedSource, SimulationProfile};
pub use source::{LineSource, ProcessSource, TelemetrySource};
