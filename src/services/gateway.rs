use log::{debug, error, info, trace, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::settings::{Config, SourceConfig};
use crate::modbus::{ModbusTcpServer, RegisterStore};
use crate::registers::{encode, RegisterMap, SharedRegisterMap};
use crate::storage::SqliteManager;
use crate::telemetry::{
    ProcessSource, SimulatedSource, SimulationProfile, TelemetryFrame, TelemetrySource,
};
use crate::utils::error::TelemetryError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub frames: u64,
    pub values_written: u64,
    pub unknown_skipped: u64,
    pub write_failures: u64,
    pub malformed_frames: u64,
}

impl RelayStats {
    fn absorb(&mut self, other: RelayStats) {
        self.frames += other.frames;
        self.values_written += other.values_written;
        self.unknown_skipped += other.unknown_skipped;
        self.write_failures += other.write_failures;
        self.malformed_frames += other.malformed_frames;
    }
}

#[derive(Clone)]
pub struct GatewayRelay {
    map: SharedRegisterMap,
    store: Arc<RegisterStore>,
}

impl GatewayRelay {
    pub fn new(map: SharedRegisterMap, store: Arc<RegisterStore>) -> Self {
        Self { map, store }
    }

    pub fn apply_frame(&self, frame: &TelemetryFrame) -> RelayStats {
        let map = self.map.snapshot();
        let mut stats = RelayStats {
            frames: 1,
            ..RelayStats::default()
        };

        for snapshot in &frame.snapshots {
            for (code, &value) in &snapshot.parameters {
                let Some(entry) = map.lookup(&snapshot.wellhead_id, code) else {
                    trace!("No mapping for {}/{}", snapshot.wellhead_id, code);
                    stats.unknown_skipped += 1;
                    continue;
                };

                let written = encode(value, entry.kind).and_then(|words| {
                    self.store
                        .write(entry.address, &words)
                        .map_err(TelemetryError::Exception)
                });
                match written {
                    Ok(()) => stats.values_written += 1,
                    Err(e) => {
                        warn!(
                            "Dropping {}/{} = {} at register {}: {}",
                            snapshot.wellhead_id, code, value, entry.address, e
                        );
                        stats.write_failures += 1;
                    }
                }
            }
        }

        stats
    }

    pub async fn run<S>(&self, source: &mut S, token: &CancellationToken) -> Result<RelayStats, TelemetryError>
    where
        S: TelemetrySource + ?Sized,
    {
        info!("📡 Relaying frames from {}", source.describe());
        let mut totals = RelayStats::default();

        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    debug!("Relay cancelled");
                    break;
                }
                next = source.next_frame() => next,
            };

            match next {
                Some(Ok(frame)) => {
                    let stats = self.apply_frame(&frame);
                    debug!(
                        "Frame applied: {} written, {} unmapped, {} failed",
                        stats.values_written, stats.unknown_skipped, stats.write_failures
                    );
                    totals.absorb(stats);
                }
                Some(Err(TelemetryError::MalformedFrame(reason))) => {
                    warn!("⚠️  Discarding malformed frame: {}", reason);
                    totals.malformed_frames += 1;
                }
                Some(Err(e)) => {
                    error!("❌ Telemetry source failed: {}", e);
                    return Err(e);
                }
                None => {
                    info!("Telemetry source {} exhausted", source.describe());
                    break;
                }
            }
        }

        Ok(totals)
    }
}

// On failure the current map stays in place.
pub async fn refresh_map(
    manager: &SqliteManager,
    shared: &SharedRegisterMap,
    register_count: usize,
) -> Result<(), TelemetryError> {
    let map = load_register_map(manager, register_count).await?;
    let previous = shared.replace(map);
    debug!("Register map refreshed (previously {} mappings)", previous.len());
    Ok(())
}

async fn load_register_map(
    manager: &SqliteManager,
    register_count: usize,
) -> Result<RegisterMap, TelemetryError> {
    let map = RegisterMap::build(manager.load_active_mappings().await?)?;
    if map.required_registers() > register_count {
        return Err(TelemetryError::ConfigError(format!(
            "Register map needs {} registers, gateway exposes {}",
            map.required_registers(),
            register_count
        )));
    }
    Ok(map)
}

async fn open_source(
    config: &Config,
    manager: &SqliteManager,
) -> Result<Box<dyn TelemetrySource>, TelemetryError> {
    match &config.gateway.source {
        SourceConfig::Simulated => {
            let profiles = SimulationProfile::group(manager.load_wellhead_parameters().await?);
            Ok(Box::new(SimulatedSource::new(profiles, &config.simulation)))
        }
        SourceConfig::Process { program, args } => Ok(Box::new(ProcessSource::spawn(program, args)?)),
    }
}

pub async fn run_gateway(config: &Config, token: CancellationToken) -> Result<RelayStats, TelemetryError> {
    let manager = SqliteManager::new(&config.database).await?;
    let register_count = config.gateway.register_count;

    let map = match load_register_map(&manager, register_count).await {
        Ok(map) => map,
        Err(e) => {
            manager.close().await;
            return Err(e);
        }
    };
    info!(
        "🗺️  Gateway map: {} mappings, {} wellheads",
        map.len(),
        map.wellhead_count()
    );

    let store = Arc::new(RegisterStore::new(register_count));
    let shared = SharedRegisterMap::new(map);
    let gateway_token = token.child_token();

    let listener = ModbusTcpServer::bind(&config.gateway.listen_address()).await?;
    let server = ModbusTcpServer::new(Arc::clone(&store));
    let server_task = tokio::spawn(server.serve(listener, gateway_token.clone()));

    let refresh_task = config.gateway.map_refresh().map(|period| {
        tokio::spawn(refresh_loop(
            manager.clone(),
            shared.clone(),
            register_count,
            period,
            gateway_token.clone(),
        ))
    });

    let relay = GatewayRelay::new(shared, store);
    let result = match open_source(config, &manager).await {
        Ok(mut source) => relay.run(source.as_mut(), &gateway_token).await,
        Err(e) => Err(e),
    };

    gateway_token.cancel();
    if let Err(e) = server_task.await {
        warn!("Modbus server task ended abnormally: {}", e);
    }
    if let Some(task) = refresh_task {
        if let Err(e) = task.await {
            warn!("Map refresh task ended abnormally: {}", e);
        }
    }
    manager.close().await;

    if let Ok(stats) = &result {
        info!(
            "🛑 Gateway stopped: {} frames, {} values written, {} malformed",
            stats.frames, stats.values_written, stats.malformed_frames
        );
    }
    result
}

async fn refresh_loop(
    manager: SqliteManager,
    shared: SharedRegisterMap,
    register_count: usize,
    period: Duration,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = refresh_map(&manager, &shared, register_count).await {
                    warn!("⚠️  Keeping current register map, refresh failed: {}", e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::standard_catalog;
    use crate::config::settings::{ProvisioningConfig, SqliteConfig};
    use crate::registers::{decode, EncodingKind};
    use crate::storage::models::MappingRow;
    use crate::storage::sqlite_manager::IN_MEMORY_PATH;
    use crate::telemetry::{LineSource, WellheadSnapshot};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn row(id: i64, wellhead: &str, code: &str, address: i64, data_type: &str) -> MappingRow {
        MappingRow {
            mapping_id: id,
            wellhead_id: wellhead.to_string(),
            parameter_id: format!("P{:02}", id),
            parameter_code: code.to_string(),
            register_address: address,
            data_type: data_type.to_string(),
            active: true,
        }
    }

    fn relay() -> GatewayRelay {
        let map = RegisterMap::build(vec![
            row(1, "WH-001", "THP", 0, "float"),
            row(2, "WH-001", "SDV_ST", 2, "bool"),
            row(3, "WH-002", "THP", 50, "float"),
        ])
        .unwrap();
        GatewayRelay::new(SharedRegisterMap::new(map), Arc::new(RegisterStore::new(100)))
    }

    fn frame(values: &[(&str, &str, f64)]) -> TelemetryFrame {
        let mut by_wellhead: BTreeMap<String, BTreeMap<String, f64>> = BTreeMap::new();
        for (wellhead, code, value) in values {
            by_wellhead
                .entry(wellhead.to_string())
                .or_default()
                .insert(code.to_string(), *value);
        }
        let timestamp = Utc::now();
        TelemetryFrame::new(
            by_wellhead
                .into_iter()
                .map(|(wellhead_id, parameters)| WellheadSnapshot {
                    wellhead_id,
                    timestamp,
                    parameters,
                })
                .collect(),
        )
    }

    #[test]
    fn test_apply_frame_writes_mapped_values() {
        let relay = relay();
        let stats = relay.apply_frame(&frame(&[
            ("WH-001", "THP", 1234.56),
            ("WH-001", "SDV_ST", 1.0),
            ("WH-002", "THP", 99.5),
            ("WH-001", "CSP", 10.0),
            ("WH-009", "THP", 10.0),
        ]));

        assert_eq!(stats.values_written, 3);
        assert_eq!(stats.unknown_skipped, 2);
        assert_eq!(relay.store.read(0, 2).unwrap(), vec![0x51EC, 0x449A]);
        assert_eq!(relay.store.read(2, 2).unwrap(), vec![1, 0]);
        let words = relay.store.read(50, 2).unwrap();
        assert_eq!(decode([words[0], words[1]], EncodingKind::Float32), 99.5);
    }

    #[test]
    fn test_apply_frame_survives_unwritable_values() {
        let map = RegisterMap::build(vec![
            row(1, "WH-001", "THP", 0, "float"),
            row(2, "WH-001", "COUNT", 2, "int"),
            row(3, "WH-001", "FAR", 500, "float"),
        ])
        .unwrap();
        let relay = GatewayRelay::new(SharedRegisterMap::new(map), Arc::new(RegisterStore::new(100)));

        let stats = relay.apply_frame(&frame(&[
            ("WH-001", "THP", 1.0),
            ("WH-001", "COUNT", 1e12),
            ("WH-001", "FAR", 2.0),
        ]));
        assert_eq!(stats.values_written, 1);
        assert_eq!(stats.write_failures, 2);
    }

    #[tokio::test]
    async fn test_run_skips_malformed_lines() {
        let relay = relay();
        let input = concat!(
            "[{\"wellhead_id\":\"WH-001\",\"timestamp\":\"2024-05-01T12:00:00\",\"parameters\":{\"THP\":5.0}}]\n",
            "{garbage\n",
            "[{\"wellhead_id\":\"WH-002\",\"timestamp\":\"2024-05-01T12:00:05\",\"parameters\":{\"THP\":7.0}}]\n",
        );
        let mut source = LineSource::new(input.as_bytes(), "test");

        let stats = relay.run(&mut source, &CancellationToken::new()).await.unwrap();
        assert_eq!(stats.frames, 2);
        assert_eq!(stats.malformed_frames, 1);
        assert_eq!(stats.values_written, 2);

        let words = relay.store.read(50, 2).unwrap();
        assert_eq!(decode([words[0], words[1]], EncodingKind::Float32), 7.0);
    }

    struct StalledSource;

    #[async_trait]
    impl TelemetrySource for StalledSource {
        async fn next_frame(&mut self) -> Option<Result<TelemetryFrame, TelemetryError>> {
            std::future::pending().await
        }

        fn describe(&self) -> String {
            "stalled".to_string()
        }
    }

    #[tokio::test]
    async fn test_run_honours_cancellation() {
        let relay = relay();
        let token = CancellationToken::new();
        token.cancel();

        let stats = relay.run(&mut StalledSource, &token).await.unwrap();
        assert_eq!(stats, RelayStats::default());
    }

    struct BrokenSource;

    #[async_trait]
    impl TelemetrySource for BrokenSource {
        async fn next_frame(&mut self) -> Option<Result<TelemetryFrame, TelemetryError>> {
            Some(Err(TelemetryError::Transport("pipe closed".to_string())))
        }

        fn describe(&self) -> String {
            "broken".to_string()
        }
    }

    #[tokio::test]
    async fn test_run_stops_on_source_failure() {
        let relay = relay();
        let result = relay.run(&mut BrokenSource, &CancellationToken::new()).await;
        assert!(matches!(result, Err(TelemetryError::Transport(_))));
    }

    async fn provisioned_manager(wellheads: u32) -> SqliteManager {
        let manager = SqliteManager::new(&SqliteConfig {
            database_path: IN_MEMORY_PATH.to_string(),
            ..SqliteConfig::default()
        })
        .await
        .unwrap();
        manager
            .provision(
                &standard_catalog(),
                &ProvisioningConfig {
                    wellhead_count: wellheads,
                    registers_per_wellhead: 50,
                },
            )
            .await
            .unwrap();
        manager
    }

    #[tokio::test]
    async fn test_refresh_swaps_map() {
        let manager = provisioned_manager(2).await;
        let shared = SharedRegisterMap::new(load_register_map(&manager, 65_536).await.unwrap());
        assert_eq!(shared.snapshot().len(), 34);

        manager.set_wellhead_status("WH-002", false).await.unwrap();
        refresh_map(&manager, &shared, 65_536).await.unwrap();
        assert_eq!(shared.snapshot().len(), 17);
        assert!(shared.snapshot().lookup("WH-002", "THP").is_none());
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_current_map() {
        let manager = provisioned_manager(2).await;
        let shared = SharedRegisterMap::new(load_register_map(&manager, 65_536).await.unwrap());

        // Second wellhead's registers end at 84; a 60-register gateway cannot hold them.
        assert!(matches!(
            refresh_map(&manager, &shared, 60).await,
            Err(TelemetryError::ConfigError(_))
        ));
        assert_eq!(shared.snapshot().len(), 34);
    }

    #[tokio::test]
    async fn test_gateway_without_mappings_fails_at_startup() {
        let mut config = Config::default();
        config.database.database_path = IN_MEMORY_PATH.to_string();
        config.gateway.bind_address = "127.0.0.1".to_string();
        config.gateway.port = 0;

        let result = run_gateway(&config, CancellationToken::new()).await;
        assert!(matches!(result, Err(TelemetryError::EmptyMap)));
    }
}
