use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::settings::{Config, IngestionConfig};
use crate::modbus::{ModbusClientTrait, TcpConnector, TransportConnector};
use crate::registers::{decode_slice, RegisterMap, REGISTERS_PER_VALUE};
use crate::storage::{ReadingBatch, ReadingStore, SqliteConnector, StorageConnector};
use crate::utils::error::TelemetryError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultAction {
    SkipReading,
    Reconnect,
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub poll_interval: Duration,
    pub backoff: Duration,
}

impl ReconnectPolicy {
    pub fn new(poll_interval: Duration, backoff: Duration) -> Self {
        Self {
            poll_interval,
            backoff,
        }
    }

    pub fn from_config(config: &IngestionConfig) -> Self {
        Self::new(config.poll_interval(), config.reconnect_backoff())
    }

    pub fn classify(&self, error: &TelemetryError) -> FaultAction {
        match error {
            TelemetryError::Exception(_)
            | TelemetryError::Transport(_)
            | TelemetryError::InvalidData(_) => FaultAction::SkipReading,
            TelemetryError::TimestampInvariantViolation(_)
            | TelemetryError::UnsupportedKind(_)
            | TelemetryError::EmptyMap
            | TelemetryError::RegisterOverlap { .. } => FaultAction::Fatal,
            _ => FaultAction::Reconnect,
        }
    }

    pub fn remaining_interval(&self, elapsed: Duration) -> Duration {
        self.poll_interval.saturating_sub(elapsed)
    }
}

pub struct PollingSession<C, S> {
    client: C,
    store: S,
    map: Arc<RegisterMap>,
    cycle_started: Instant,
}

impl<C, S> PollingSession<C, S>
where
    C: ModbusClientTrait,
    S: ReadingStore,
{
    pub fn map(&self) -> &RegisterMap {
        &self.map
    }

    pub async fn close(self) {
        self.client.close().await;
        self.store.close().await;
    }
}

pub enum PipelineState<C, S> {
    Disconnected { backoff: bool },
    Connecting,
    Polling(PollingSession<C, S>),
}

impl<C, S> PipelineState<C, S> {
    pub fn name(&self) -> &'static str {
        match self {
            PipelineState::Disconnected { .. } => "disconnected",
            PipelineState::Connecting => "connecting",
            PipelineState::Polling(_) => "polling",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub captured_at: DateTime<Utc>,
    pub committed: usize,
    pub skipped: usize,
}

pub struct IngestionPipeline<T, S>
where
    T: TransportConnector,
    S: StorageConnector,
{
    transport: T,
    storage: S,
    policy: ReconnectPolicy,
    map: Arc<RegisterMap>,
    reload_map_on_reconnect: bool,
}

impl<T, S> IngestionPipeline<T, S>
where
    T: TransportConnector,
    S: StorageConnector,
{
    /// Loads the register map once. Any failure here, including an empty
    /// map, is fatal and nothing is polled.
    pub async fn new(transport: T, storage: S, policy: ReconnectPolicy) -> Result<Self, TelemetryError> {
        let store = storage.connect().await?;
        let rows = store.load_active_mappings().await;
        store.close().await;
        let map = RegisterMap::build(rows?)?;

        info!(
            "🗺️  Ingestion map: {} mappings across {} wellheads",
            map.len(),
            map.wellhead_count()
        );
        Ok(Self {
            transport,
            storage,
            policy,
            map: Arc::new(map),
            reload_map_on_reconnect: false,
        })
    }

    pub fn with_map_reload(mut self, enabled: bool) -> Self {
        self.reload_map_on_reconnect = enabled;
        self
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    pub fn map(&self) -> &RegisterMap {
        &self.map
    }

    pub async fn connect(&mut self) -> Result<PollingSession<T::Client, S::Store>, TelemetryError> {
        let started = Instant::now();
        let client = self.transport.connect().await?;
        let store = match self.storage.connect().await {
            Ok(store) => store,
            Err(e) => {
                client.close().await;
                return Err(e);
            }
        };

        if self.reload_map_on_reconnect {
            match store.load_active_mappings().await.and_then(RegisterMap::build) {
                Ok(map) => {
                    debug!("Register map reloaded: {} mappings", map.len());
                    self.map = Arc::new(map);
                }
                Err(e) => warn!("⚠️  Keeping current register map, reload failed: {}", e),
            }
        }

        info!("🔗 Connected: transport and storage sessions open");
        Ok(PollingSession {
            client,
            store,
            map: Arc::clone(&self.map),
            cycle_started: started,
        })
    }

    /// Reads every map entry under one capture timestamp. Per-entry faults
    /// are skipped; anything else aborts the cycle.
    pub async fn read_cycle<C>(
        &self,
        client: &C,
        map: &RegisterMap,
        captured_at: DateTime<Utc>,
    ) -> Result<(ReadingBatch, usize), TelemetryError>
    where
        C: ModbusClientTrait + ?Sized,
    {
        let mut batch = ReadingBatch::with_capacity(captured_at, map.len());
        let mut skipped = 0;

        for entry in map.entries() {
            let value = match client
                .read_holding_registers(entry.address, REGISTERS_PER_VALUE)
                .await
            {
                Ok(words) => decode_slice(&words, entry.kind),
                Err(e) => Err(e),
            };

            match value {
                Ok(value) => batch.record(entry, value),
                Err(e) => match self.policy.classify(&e) {
                    FaultAction::SkipReading => {
                        warn!(
                            "Skipping {}/{} at register {} this cycle: {}",
                            entry.wellhead_id, entry.parameter_code, entry.address, e
                        );
                        skipped += 1;
                    }
                    _ => return Err(e),
                },
            }
        }

        Ok((batch, skipped))
    }

    pub async fn poll_cycle(
        &self,
        session: &PollingSession<T::Client, S::Store>,
    ) -> Result<CycleReport, TelemetryError> {
        let captured_at = Utc::now();
        let (batch, skipped) = self
            .read_cycle(&session.client, &session.map, captured_at)
            .await?;

        let committed = if batch.is_empty() {
            0
        } else {
            batch.validate()?;
            session.store.commit_batch(&batch).await?
        };

        Ok(CycleReport {
            captured_at,
            committed,
            skipped,
        })
    }

    pub async fn step(
        &mut self,
        state: PipelineState<T::Client, S::Store>,
        token: &CancellationToken,
    ) -> Result<PipelineState<T::Client, S::Store>, TelemetryError> {
        match state {
            PipelineState::Disconnected { backoff } => {
                if backoff {
                    info!("⏳ Reconnecting in {:?}", self.policy.backoff);
                    if !pause(self.policy.backoff, token).await {
                        return Ok(PipelineState::Disconnected { backoff: false });
                    }
                }
                Ok(PipelineState::Connecting)
            }

            PipelineState::Connecting => {
                let connected = tokio::select! {
                    biased;
                    _ = token.cancelled() => return Ok(PipelineState::Disconnected { backoff: false }),
                    connected = self.connect() => connected,
                };
                match connected {
                    Ok(session) => Ok(PipelineState::Polling(session)),
                    Err(e) => {
                        error!("❌ Connection attempt failed: {}", e);
                        Ok(PipelineState::Disconnected { backoff: true })
                    }
                }
            }

            PipelineState::Polling(mut session) => {
                let outcome = tokio::select! {
                    biased;
                    _ = token.cancelled() => None,
                    outcome = self.poll_cycle(&session) => Some(outcome),
                };

                match outcome {
                    None => {
                        session.close().await;
                        Ok(PipelineState::Disconnected { backoff: false })
                    }
                    Some(Ok(report)) => {
                        info!(
                            "💾 Cycle {}: {} readings committed, {} skipped",
                            report.captured_at.to_rfc3339(),
                            report.committed,
                            report.skipped
                        );
                        let wait = self.policy.remaining_interval(session.cycle_started.elapsed());
                        if !pause(wait, token).await {
                            session.close().await;
                            return Ok(PipelineState::Disconnected { backoff: false });
                        }
                        session.cycle_started = Instant::now();
                        Ok(PipelineState::Polling(session))
                    }
                    Some(Err(e)) => {
                        session.close().await;
                        if self.policy.classify(&e) == FaultAction::Fatal {
                            error!("🛑 Unrecoverable ingestion fault: {}", e);
                            return Err(e);
                        }
                        warn!("⚠️  Polling interrupted, dropping connections: {}", e);
                        Ok(PipelineState::Disconnected { backoff: true })
                    }
                }
            }
        }
    }

    pub async fn run(&mut self, token: CancellationToken) -> Result<(), TelemetryError> {
        info!(
            "🚀 Ingestion started: every {:?}, backoff {:?}",
            self.policy.poll_interval, self.policy.backoff
        );
        let mut state = PipelineState::Connecting;

        loop {
            if token.is_cancelled() {
                if let PipelineState::Polling(session) = state {
                    session.close().await;
                }
                info!("🛑 Ingestion stopped");
                return Ok(());
            }
            let previous = state.name();
            state = self.step(state, &token).await?;
            if previous != state.name() {
                debug!("Pipeline {} -> {}", previous, state.name());
            }
        }
    }
}

async fn pause(duration: Duration, token: &CancellationToken) -> bool {
    if duration.is_zero() {
        return !token.is_cancelled();
    }
    tokio::select! {
        _ = token.cancelled() => false,
        _ = sleep(duration) => true,
    }
}

pub async fn run_ingestion(config: &Config, token: CancellationToken) -> Result<(), TelemetryError> {
    let transport = TcpConnector {
        address: config.ingestion.server_address(),
        unit_id: config.ingestion.unit_id,
        request_timeout: config.ingestion.request_timeout(),
    };
    let storage = SqliteConnector::new(config.database.clone());
    let policy = ReconnectPolicy::from_config(&config.ingestion);

    let mut pipeline = IngestionPipeline::new(transport, storage, policy)
        .await?
        .with_map_reload(config.ingestion.reload_map_on_reconnect);
    pipeline.run(token).await
}
