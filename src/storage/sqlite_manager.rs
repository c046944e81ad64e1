use chrono::Utc;
use log::{debug, info, warn};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::catalog::Parameter;
use crate::config::settings::{ProvisioningConfig, SqliteConfig};
use crate::registers::REGISTERS_PER_VALUE;
use crate::storage::models::{MappingRow, Reading, ReadingBatch, WellheadParameterRow};
use crate::utils::error::TelemetryError;

pub const IN_MEMORY_PATH: &str = ":memory:";

const ACTIVE_MAPPINGS_SQL: &str = r#"
    SELECT dpm.mapping_id,
           wh.wellhead_id,
           pt.parameter_type_id AS parameter_id,
           pt.code AS parameter_code,
           dpm.modbus_register AS register_address,
           pt.data_type,
           dpm.active
    FROM device_parameter_mapping dpm
    JOIN parameter_type pt ON dpm.parameter_type_id = pt.parameter_type_id
    JOIN device d ON dpm.device_id = d.device_id
    JOIN wellhead wh ON d.device_id = wh.device_id
    WHERE dpm.active = 1 AND pt.active = 1 AND wh.status = 'active'
    ORDER BY dpm.modbus_register, dpm.mapping_id
"#;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProvisionSummary {
    pub parameters: usize,
    pub wellheads: usize,
    pub mappings_created: usize,
}

#[derive(Clone)]
pub struct SqliteManager {
    pool: SqlitePool,
}

impl SqliteManager {
    pub async fn new(config: &SqliteConfig) -> Result<Self, TelemetryError> {
        let in_memory = config.database_path == IN_MEMORY_PATH;

        let base_options = if in_memory {
            SqliteConnectOptions::from_str("sqlite::memory:")?
        } else {
            // Create database directory if it doesn't exist
            if let Some(parent) = Path::new(&config.database_path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        TelemetryError::StorageError(format!(
                            "Failed to create database directory: {}",
                            e
                        ))
                    })?;
                }
            }

            SqliteConnectOptions::new()
                .filename(&config.database_path)
                .create_if_missing(true)
                .journal_mode(if config.enable_wal {
                    SqliteJournalMode::Wal
                } else {
                    SqliteJournalMode::Delete
                })
                .synchronous(match config.sync_mode.as_str() {
                    "OFF" => SqliteSynchronous::Off,
                    "FULL" => SqliteSynchronous::Full,
                    _ => SqliteSynchronous::Normal,
                })
        };
        let options = base_options
            .busy_timeout(Duration::from_millis(config.busy_timeout_ms))
            .foreign_keys(true);

        info!("🗄️  Opening SQLite database: {}", config.database_path);

        // An in-memory database lives and dies with its single connection.
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(config.max_connections.max(1))
        };

        let pool = pool_options
            .acquire_timeout(Duration::from_secs(config.connection_timeout_seconds))
            .connect_with(options)
            .await
            .map_err(|e| TelemetryError::StorageError(format!("Failed to connect to SQLite: {}", e)))?;

        let manager = Self { pool };
        manager.initialize_schema().await?;

        Ok(manager)
    }

    async fn initialize_schema(&self) -> Result<(), TelemetryError> {
        debug!("Ensuring wellhead telemetry schema");

        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS parameter_type (
                parameter_type_id TEXT PRIMARY KEY,
                code TEXT NOT NULL UNIQUE,
                display_name TEXT NOT NULL,
                canonical_unit TEXT NOT NULL,
                data_type TEXT NOT NULL,
                precision INTEGER NOT NULL DEFAULT 0,
                normal_min REAL,
                normal_max REAL,
                description TEXT NOT NULL DEFAULT '',
                category TEXT NOT NULL,
                active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS device (
                device_id TEXT PRIMARY KEY,
                description TEXT NOT NULL DEFAULT ''
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS wellhead (
                wellhead_id TEXT PRIMARY KEY,
                device_id TEXT NOT NULL UNIQUE REFERENCES device(device_id),
                status TEXT NOT NULL DEFAULT 'active'
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS device_parameter_mapping (
                mapping_id INTEGER PRIMARY KEY AUTOINCREMENT,
                device_id TEXT NOT NULL REFERENCES device(device_id),
                parameter_type_id TEXT NOT NULL REFERENCES parameter_type(parameter_type_id),
                modbus_register INTEGER NOT NULL CHECK (modbus_register >= 0),
                active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                UNIQUE (device_id, parameter_type_id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS wellhead_readings (
                time TEXT NOT NULL,
                wellhead_id TEXT NOT NULL REFERENCES wellhead(wellhead_id),
                parameter_id TEXT NOT NULL REFERENCES parameter_type(parameter_type_id),
                mapping_id INTEGER NOT NULL REFERENCES device_parameter_mapping(mapping_id),
                value REAL NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_readings_time ON wellhead_readings(time)",
            "CREATE INDEX IF NOT EXISTS idx_readings_wellhead_time ON wellhead_readings(wellhead_id, time)",
        ];

        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub async fn load_active_mappings(&self) -> Result<Vec<MappingRow>, TelemetryError> {
        sqlx::query_as::<_, MappingRow>(ACTIVE_MAPPINGS_SQL)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| TelemetryError::MetadataUnavailable(format!("Failed to load mappings: {}", e)))
    }

    pub async fn load_wellhead_parameters(&self) -> Result<Vec<(String, Parameter)>, TelemetryError> {
        let rows = sqlx::query_as::<_, WellheadParameterRow>(
            r#"
            SELECT wh.wellhead_id, pt.parameter_type_id, pt.code, pt.display_name,
                   pt.canonical_unit, pt.data_type, pt.precision, pt.normal_min,
                   pt.normal_max, pt.description, pt.category
            FROM wellhead wh
            JOIN device d ON wh.device_id = d.device_id
            JOIN device_parameter_mapping dpm ON d.device_id = dpm.device_id
            JOIN parameter_type pt ON dpm.parameter_type_id = pt.parameter_type_id
            WHERE wh.status = 'active' AND dpm.active = 1 AND pt.active = 1
            ORDER BY wh.wellhead_id, dpm.modbus_register
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            TelemetryError::MetadataUnavailable(format!("Failed to load simulation metadata: {}", e))
        })?;

        rows.into_iter()
            .map(|row| Ok((row.wellhead_id, Parameter::try_from(row.parameter)?)))
            .collect()
    }

    pub async fn upsert_parameter(&self, parameter: &Parameter) -> Result<(), TelemetryError> {
        parameter.validate()?;
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO parameter_type (
                parameter_type_id, code, display_name, canonical_unit, data_type,
                precision, normal_min, normal_max, description, category,
                active, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?)
            ON CONFLICT(parameter_type_id) DO UPDATE SET
                code = excluded.code,
                display_name = excluded.display_name,
                canonical_unit = excluded.canonical_unit,
                data_type = excluded.data_type,
                precision = excluded.precision,
                normal_min = excluded.normal_min,
                normal_max = excluded.normal_max,
                description = excluded.description,
                category = excluded.category,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&parameter.parameter_id)
        .bind(&parameter.code)
        .bind(&parameter.display_name)
        .bind(&parameter.canonical_unit)
        .bind(parameter.kind.as_str())
        .bind(parameter.precision as i64)
        .bind(parameter.normal_min)
        .bind(parameter.normal_max)
        .bind(&parameter.description)
        .bind(parameter.category.as_str())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Wellhead `i` owns registers starting at `i * registers_per_wellhead`,
    /// parameter `j` at offset `2 * j`. Existing rows are left untouched.
    pub async fn provision(
        &self,
        catalog: &[Parameter],
        provisioning: &ProvisioningConfig,
    ) -> Result<ProvisionSummary, TelemetryError> {
        let needed = catalog.len() * REGISTERS_PER_VALUE as usize;
        if needed > provisioning.registers_per_wellhead as usize {
            return Err(TelemetryError::ConfigError(format!(
                "{} parameters need {} registers per wellhead, only {} configured",
                catalog.len(),
                needed,
                provisioning.registers_per_wellhead
            )));
        }
        let last_register =
            provisioning.wellhead_count as u64 * provisioning.registers_per_wellhead as u64;
        if last_register > u16::MAX as u64 + 1 {
            return Err(TelemetryError::ConfigError(format!(
                "{} wellheads do not fit the 16-bit register space",
                provisioning.wellhead_count
            )));
        }

        for parameter in catalog {
            self.upsert_parameter(parameter).await?;
        }

        let now = Utc::now();
        let mut summary = ProvisionSummary {
            parameters: catalog.len(),
            ..ProvisionSummary::default()
        };
        let mut tx = self.pool.begin().await?;

        for index in 0..provisioning.wellhead_count {
            let wellhead_id = format!("WH-{:03}", index + 1);
            let device_id = format!("DEV-{:03}", index + 1);
            let base = index as i64 * provisioning.registers_per_wellhead as i64;

            sqlx::query("INSERT OR IGNORE INTO device (device_id, description) VALUES (?, ?)")
                .bind(&device_id)
                .bind(format!("Field device for {}", wellhead_id))
                .execute(&mut *tx)
                .await?;
            sqlx::query(
                "INSERT OR IGNORE INTO wellhead (wellhead_id, device_id, status) VALUES (?, ?, 'active')",
            )
            .bind(&wellhead_id)
            .bind(&device_id)
            .execute(&mut *tx)
            .await?;

            for (offset, parameter) in catalog.iter().enumerate() {
                let register = base + offset as i64 * REGISTERS_PER_VALUE as i64;
                let result = sqlx::query(
                    r#"
                    INSERT OR IGNORE INTO device_parameter_mapping
                        (device_id, parameter_type_id, modbus_register, active, created_at)
                    VALUES (?, ?, ?, 1, ?)
                    "#,
                )
                .bind(&device_id)
                .bind(&parameter.parameter_id)
                .bind(register)
                .bind(now)
                .execute(&mut *tx)
                .await?;
                summary.mappings_created += result.rows_affected() as usize;
            }
            summary.wellheads += 1;
        }

        tx.commit().await?;
        info!(
            "🛠️  Provisioned {} parameters, {} wellheads, {} new mappings",
            summary.parameters, summary.wellheads, summary.mappings_created
        );
        Ok(summary)
    }

    pub async fn deactivate_mapping(&self, mapping_id: i64) -> Result<bool, TelemetryError> {
        let result = sqlx::query("UPDATE device_parameter_mapping SET active = 0 WHERE mapping_id = ?")
            .bind(mapping_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn deactivate_parameter(&self, code: &str) -> Result<bool, TelemetryError> {
        let result = sqlx::query("UPDATE parameter_type SET active = 0, updated_at = ? WHERE code = ?")
            .bind(Utc::now())
            .bind(code)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_wellhead_status(&self, wellhead_id: &str, active: bool) -> Result<bool, TelemetryError> {
        let result = sqlx::query("UPDATE wellhead SET status = ? WHERE wellhead_id = ?")
            .bind(if active { "active" } else { "inactive" })
            .bind(wellhead_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn insert_batch(&self, batch: &ReadingBatch) -> Result<usize, TelemetryError> {
        if batch.is_empty() {
            return Ok(0);
        }
        batch.validate()?;

        let mut tx = self.pool.begin().await?;
        for reading in batch.readings() {
            sqlx::query(
                r#"
                INSERT INTO wellhead_readings (time, wellhead_id, parameter_id, mapping_id, value)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(reading.timestamp)
            .bind(&reading.wellhead_id)
            .bind(&reading.parameter_id)
            .bind(reading.mapping_id)
            .bind(reading.value)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                warn!(
                    "Rolling back batch of {} readings: {}/{} rejected: {}",
                    batch.len(),
                    reading.wellhead_id,
                    reading.parameter_id,
                    e
                );
                TelemetryError::from(e)
            })?;
        }
        tx.commit().await?;

        Ok(batch.len())
    }

    pub async fn recent_readings(&self, limit: i64) -> Result<Vec<Reading>, TelemetryError> {
        let readings = sqlx::query_as::<_, Reading>(
            r#"
            SELECT time, wellhead_id, parameter_id, mapping_id, value
            FROM wellhead_readings
            ORDER BY time DESC, rowid DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(readings)
    }

    pub async fn count_readings(&self) -> Result<i64, TelemetryError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM wellhead_readings")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn close(&self) {
        debug!("Closing SQLite database connections");
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::standard_catalog;
    use crate::registers::RegisterMap;
    use chrono::Duration as ChronoDuration;

    async fn memory_manager() -> SqliteManager {
        let config = SqliteConfig {
            database_path: IN_MEMORY_PATH.to_string(),
            ..SqliteConfig::default()
        };
        SqliteManager::new(&config).await.unwrap()
    }

    fn provisioning(wellheads: u32) -> ProvisioningConfig {
        ProvisioningConfig {
            wellhead_count: wellheads,
            registers_per_wellhead: 50,
        }
    }

    #[tokio::test]
    async fn test_empty_database_has_no_mappings() {
        let manager = memory_manager().await;
        let rows = manager.load_active_mappings().await.unwrap();
        assert!(rows.is_empty());
        assert!(matches!(RegisterMap::build(rows), Err(TelemetryError::EmptyMap)));
    }

    #[tokio::test]
    async fn test_provision_lays_out_registers() {
        let manager = memory_manager().await;
        let summary = manager.provision(&standard_catalog(), &provisioning(5)).await.unwrap();
        assert_eq!(summary.wellheads, 5);
        assert_eq!(summary.mappings_created, 5 * 17);

        let rows = manager.load_active_mappings().await.unwrap();
        assert_eq!(rows.len(), 85);
        let addresses: Vec<i64> = rows.iter().map(|r| r.register_address).collect();
        let mut sorted = addresses.clone();
        sorted.sort();
        assert_eq!(addresses, sorted);

        let map = RegisterMap::build(rows).unwrap();
        assert_eq!(map.lookup("WH-001", "THP").unwrap().address, 0);
        assert_eq!(map.lookup("WH-001", "FLP").unwrap().address, 2);
        assert_eq!(map.lookup("WH-002", "THP").unwrap().address, 50);
        assert_eq!(map.lookup("WH-005", "CHOKE_CTRL").unwrap().address, 200 + 32);

        // Idempotent
        let again = manager.provision(&standard_catalog(), &provisioning(5)).await.unwrap();
        assert_eq!(again.mappings_created, 0);
    }

    #[tokio::test]
    async fn test_provision_rejects_cramped_layout() {
        let manager = memory_manager().await;
        let cramped = ProvisioningConfig {
            wellhead_count: 2,
            registers_per_wellhead: 20,
        };
        assert!(matches!(
            manager.provision(&standard_catalog(), &cramped).await,
            Err(TelemetryError::ConfigError(_))
        ));
    }

    #[tokio::test]
    async fn test_deactivation_hides_rows() {
        let manager = memory_manager().await;
        manager.provision(&standard_catalog(), &provisioning(2)).await.unwrap();
        let rows = manager.load_active_mappings().await.unwrap();
        let first = rows[0].mapping_id;

        assert!(manager.deactivate_mapping(first).await.unwrap());
        assert_eq!(manager.load_active_mappings().await.unwrap().len(), 33);

        assert!(manager.deactivate_parameter("VIB").await.unwrap());
        assert_eq!(manager.load_active_mappings().await.unwrap().len(), 31);

        assert!(manager.set_wellhead_status("WH-002", false).await.unwrap());
        let remaining = manager.load_active_mappings().await.unwrap();
        assert_eq!(remaining.len(), 15);
        assert!(remaining.iter().all(|r| r.wellhead_id == "WH-001"));
    }

    #[tokio::test]
    async fn test_wellhead_parameters_for_simulation() {
        let manager = memory_manager().await;
        manager.provision(&standard_catalog(), &provisioning(2)).await.unwrap();

        let rows = manager.load_wellhead_parameters().await.unwrap();
        assert_eq!(rows.len(), 34);
        let (wellhead, thp) = &rows[0];
        assert_eq!(wellhead, "WH-001");
        assert_eq!(thp.code, "THP");
        assert_eq!(thp.normal_range(), Some((0.0, 5000.0)));
    }

    #[tokio::test]
    async fn test_insert_batch_commits_all_rows() {
        let manager = memory_manager().await;
        manager.provision(&standard_catalog(), &provisioning(1)).await.unwrap();
        let map = RegisterMap::build(manager.load_active_mappings().await.unwrap()).unwrap();

        let captured_at = Utc::now();
        let mut batch = ReadingBatch::new(captured_at);
        for entry in map.entries() {
            batch.record(entry, 1.5);
        }

        assert_eq!(manager.insert_batch(&batch).await.unwrap(), 17);
        assert_eq!(manager.count_readings().await.unwrap(), 17);

        let recent = manager.recent_readings(100).await.unwrap();
        assert_eq!(recent.len(), 17);
        assert!(recent.iter().all(|r| r.timestamp == captured_at));
    }

    #[tokio::test]
    async fn test_timestamp_violation_persists_nothing() {
        let manager = memory_manager().await;
        manager.provision(&standard_catalog(), &provisioning(1)).await.unwrap();
        let map = RegisterMap::build(manager.load_active_mappings().await.unwrap()).unwrap();

        let captured_at = Utc::now();
        let mut batch = ReadingBatch::new(captured_at);
        for entry in map.entries() {
            batch.record(entry, 2.0);
        }
        let mut stray = batch.readings()[0].clone();
        stray.timestamp = captured_at - ChronoDuration::seconds(5);
        batch.push(stray);

        assert!(matches!(
            manager.insert_batch(&batch).await,
            Err(TelemetryError::TimestampInvariantViolation(_))
        ));
        assert_eq!(manager.count_readings().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failed_row_rolls_back_whole_batch() {
        let manager = memory_manager().await;
        manager.provision(&standard_catalog(), &provisioning(1)).await.unwrap();
        let map = RegisterMap::build(manager.load_active_mappings().await.unwrap()).unwrap();

        let mut batch = ReadingBatch::new(Utc::now());
        for entry in map.entries() {
            batch.record(entry, 3.0);
        }
        // Unknown mapping id violates the foreign key on the last row.
        let mut orphan = map.entries()[0].clone();
        orphan.mapping_id = 9_999;
        batch.record(&orphan, 4.0);

        assert!(matches!(
            manager.insert_batch(&batch).await,
            Err(TelemetryError::StorageError(_))
        ));
        assert_eq!(manager.count_readings().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_empty_batch_is_noop() {
        let manager = memory_manager().await;
        assert_eq!(manager.insert_batch(&ReadingBatch::new(Utc::now())).await.unwrap(), 0);
    }
}
