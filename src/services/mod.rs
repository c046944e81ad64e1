pub mod gateway;
pub mod ingestion;

pub use gateway::{run_gateway, GatewayRelay, RelayStats};
pub use ingestion::{
    run_ingestion, CycleReport, FaultAction, IngestionPipeline, PipelineState, PollingSession,
    ReconnectPolicy,
};
