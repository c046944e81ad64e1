use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use log::{info, warn};
use std::io::{self, Write};
use std::path::Path;
use tokio_util::sync::CancellationToken;

use crate::catalog::standard_catalog;
use crate::config::{Config, DEFAULT_CONFIG_PATH};
use crate::services::{run_gateway, run_ingestion};
use crate::storage::SqliteManager;
use crate::telemetry::{SimulatedSource, SimulationProfile, TelemetrySource};
use crate::utils::error::TelemetryError;

pub fn build_cli() -> Command {
    Command::new("wellhead-telemetry")
        .version(crate::VERSION)
        .about("Wellhead telemetry gateway, simulator and ingestion pipeline")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file")
                .default_value(DEFAULT_CONFIG_PATH)
                .global(true),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .value_name("LEVEL")
                .help("Log filter, overrides RUST_LOG")
                .global(true),
        )
        .arg(
            Arg::new("database")
                .long("database")
                .value_name("PATH")
                .help("SQLite database path")
                .global(true),
        )
        .arg(
            Arg::new("host")
                .long("host")
                .value_name("HOST")
                .help("Modbus TCP server to poll")
                .global(true),
        )
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .value_name("PORT")
                .help("Modbus TCP port (served and polled)")
                .value_parser(value_parser!(u16))
                .global(true),
        )
        .arg(
            Arg::new("interval")
                .short('i')
                .long("interval")
                .value_name("SECONDS")
                .help("Poll and simulation interval")
                .value_parser(value_parser!(u64).range(1..))
                .global(true),
        )
        .arg(
            Arg::new("seed")
                .long("seed")
                .value_name("SEED")
                .help("Seed for the simulator")
                .value_parser(value_parser!(u64))
                .global(true),
        )
        .subcommand(Command::new("gateway").about("Serve registers over Modbus TCP and relay telemetry into them"))
        .subcommand(Command::new("ingest").about("Poll the gateway and store readings"))
        .subcommand(
            Command::new("simulate")
                .about("Print simulated frames to stdout, one JSON array per line")
                .arg(
                    Arg::new("count")
                        .short('n')
                        .long("count")
                        .value_name("FRAMES")
                        .help("Stop after this many frames")
                        .value_parser(value_parser!(u64)),
                ),
        )
        .subcommand(
            Command::new("provision")
                .about("Seed the parameter catalog, wellheads and register mappings")
                .arg(
                    Arg::new("wellheads")
                        .short('w')
                        .long("wellheads")
                        .value_name("COUNT")
                        .value_parser(value_parser!(u32)),
                )
                .arg(
                    Arg::new("registers-per-wellhead")
                        .long("registers-per-wellhead")
                        .value_name("COUNT")
                        .value_parser(value_parser!(u16)),
                ),
        )
        .subcommand(
            Command::new("deactivate")
                .about("Retire a mapping, parameter or wellhead without deleting it")
                .arg(
                    Arg::new("mapping")
                        .long("mapping")
                        .value_name("ID")
                        .value_parser(value_parser!(i64)),
                )
                .arg(Arg::new("parameter").long("parameter").value_name("CODE"))
                .arg(Arg::new("wellhead").long("wellhead").value_name("ID"))
                .group(
                    clap::ArgGroup::new("target")
                        .args(["mapping", "parameter", "wellhead"])
                        .required(true),
                ),
        )
        .subcommand(
            Command::new("tail")
                .about("Show the most recent stored readings")
                .arg(
                    Arg::new("limit")
                        .short('l')
                        .long("limit")
                        .value_name("ROWS")
                        .default_value("20")
                        .value_parser(value_parser!(i64)),
                ),
        )
        .subcommand(
            Command::new("init-config")
                .about("Write the default configuration file")
                .arg(
                    Arg::new("force")
                        .long("force")
                        .help("Overwrite an existing file")
                        .action(ArgAction::SetTrue),
                ),
        )
}

fn load_config(matches: &ArgMatches) -> Result<Config, TelemetryError> {
    let path = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or(DEFAULT_CONFIG_PATH);
    let mut config = Config::load(path)?;
    config.apply_matches(matches);
    config.validate()?;
    Ok(config)
}

/// Runs the selected subcommand. Returns false when none was given.
pub async fn handle_subcommands(matches: &ArgMatches, token: CancellationToken) -> Result<bool, TelemetryError> {
    let Some((name, sub_matches)) = matches.subcommand() else {
        return Ok(false);
    };

    if name == "init-config" {
        let path = sub_matches
            .get_one::<String>("config")
            .map(String::as_str)
            .unwrap_or(DEFAULT_CONFIG_PATH);
        return init_config(path, sub_matches.get_flag("force")).map(|_| true);
    }

    let mut config = load_config(sub_matches)?;

    match name {
        "gateway" => {
            info!("🏭 Starting gateway on {}", config.gateway.listen_address());
            run_gateway(&config, token).await?;
        }
        "ingest" => {
            info!("📥 Starting ingestion from {}", config.ingestion.server_address());
            run_ingestion(&config, token).await?;
        }
        "simulate" => {
            let limit = sub_matches.get_one::<u64>("count").copied();
            simulate(&config, limit, token).await?;
        }
        "provision" => {
            if let Some(&count) = sub_matches.get_one::<u32>("wellheads") {
                config.provisioning.wellhead_count = count;
            }
            if let Some(&registers) = sub_matches.get_one::<u16>("registers-per-wellhead") {
                config.provisioning.registers_per_wellhead = registers;
            }
            provision(&config).await?;
        }
        "deactivate" => deactivate(&config, sub_matches).await?,
        "tail" => {
            let limit = sub_matches.get_one::<i64>("limit").copied().unwrap_or(20);
            tail(&config, limit).await?;
        }
        _ => return Ok(false),
    }

    Ok(true)
}

fn init_config(path: &str, force: bool) -> Result<(), TelemetryError> {
    if Path::new(path).exists() && !force {
        return Err(TelemetryError::ConfigError(format!(
            "{} already exists, pass --force to overwrite",
            path
        )));
    }
    Config::default().save_to_file(path)?;
    println!("✅ Wrote default configuration to {}", path);
    Ok(())
}

async fn simulate(config: &Config, limit: Option<u64>, token: CancellationToken) -> Result<(), TelemetryError> {
    let manager = SqliteManager::new(&config.database).await?;
    let rows = manager.load_wellhead_parameters().await;
    manager.close().await;

    let profiles = SimulationProfile::group(rows?);
    if profiles.is_empty() {
        return Err(TelemetryError::EmptyMap);
    }
    let mut source = SimulatedSource::new(profiles, &config.simulation);
    let mut emitted = 0u64;

    while limit.map_or(true, |limit| emitted < limit) {
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            next = source.next_frame() => next,
        };
        let Some(frame) = next else { break };
        let line = frame?.to_line()?;

        let mut stdout = io::stdout().lock();
        if let Err(e) = writeln!(stdout, "{}", line).and_then(|_| stdout.flush()) {
            if e.kind() == io::ErrorKind::BrokenPipe {
                info!("Frame consumer went away, stopping simulation");
                break;
            }
            return Err(e.into());
        }
        emitted += 1;
    }

    Ok(())
}

async fn provision(config: &Config) -> Result<(), TelemetryError> {
    let manager = SqliteManager::new(&config.database).await?;
    let result = manager.provision(&standard_catalog(), &config.provisioning).await;
    manager.close().await;

    let summary = result?;
    println!(
        "✅ {} parameters, {} wellheads, {} new mappings in {}",
        summary.parameters, summary.wellheads, summary.mappings_created, config.database.database_path
    );
    Ok(())
}

async fn deactivate(config: &Config, matches: &ArgMatches) -> Result<(), TelemetryError> {
    let manager = SqliteManager::new(&config.database).await?;

    let (what, result) = if let Some(&mapping_id) = matches.get_one::<i64>("mapping") {
        (format!("mapping {}", mapping_id), manager.deactivate_mapping(mapping_id).await)
    } else if let Some(code) = matches.get_one::<String>("parameter") {
        (format!("parameter {}", code), manager.deactivate_parameter(code).await)
    } else if let Some(wellhead_id) = matches.get_one::<String>("wellhead") {
        (
            format!("wellhead {}", wellhead_id),
            manager.set_wellhead_status(wellhead_id, false).await,
        )
    } else {
        manager.close().await;
        return Err(TelemetryError::ConfigError("Nothing to deactivate".to_string()));
    };
    manager.close().await;

    if result? {
        println!("✅ Deactivated {}", what);
    } else {
        warn!("No {} found", what);
    }
    Ok(())
}

async fn tail(config: &Config, limit: i64) -> Result<(), TelemetryError> {
    let manager = SqliteManager::new(&config.database).await?;
    let readings = manager.recent_readings(limit).await;
    let total = manager.count_readings().await;
    manager.close().await;

    let readings = readings?;
    println!("📊 {} most recent of {} readings", readings.len(), total?);
    for reading in readings {
        println!(
            "{}  {:<8} {:<4} #{:<6} {}",
            reading.timestamp.to_rfc3339(),
            reading.wellhead_id,
            reading.parameter_id,
            reading.mapping_id,
            reading.value
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_is_well_formed() {
        build_cli().debug_assert();
    }

    #[test]
    fn test_global_flags_reach_subcommands() {
        let matches = build_cli()
            .try_get_matches_from([
                "wellhead-telemetry",
                "ingest",
                "--host",
                "10.1.1.1",
                "--port",
                "1502",
                "--interval",
                "30",
                "--database",
                ":memory:",
            ])
            .unwrap();
        let (name, sub_matches) = matches.subcommand().unwrap();
        assert_eq!(name, "ingest");

        let mut config = Config::default();
        config.apply_matches(sub_matches);
        assert_eq!(config.ingestion.server_address(), "10.1.1.1:1502");
        assert_eq!(config.ingestion.poll_interval_seconds, 30);
        assert_eq!(config.database.database_path, ":memory:");
    }

    #[test]
    fn test_deactivate_requires_a_target() {
        assert!(build_cli()
            .try_get_matches_from(["wellhead-telemetry", "deactivate"])
            .is_err());
        assert!(build_cli()
            .try_get_matches_from(["wellhead-telemetry", "deactivate", "--mapping", "4"])
            .is_ok());
    }

    #[test]
    fn test_zero_interval_rejected() {
        assert!(build_cli()
            .try_get_matches_from(["wellhead-telemetry", "ingest", "--interval", "0"])
            .is_err());
    }

    #[tokio::test]
    async fn test_no_subcommand_is_not_handled() {
        let matches = build_cli().try_get_matches_from(["wellhead-telemetry"]).unwrap();
        assert!(!handle_subcommands(&matches, CancellationToken::new()).await.unwrap());
    }
}
