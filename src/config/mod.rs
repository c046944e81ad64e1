pub mod settings;

pub use settings::{
    Config,
    GatewayConfig,
    IngestionConfig,
    ProvisioningConfig,
    SimulationConfig,
    SourceConfig,
    SqliteConfig,
    DEFAULT_CONFIG_PATH,
};
