use anyhow::Result;
use clap::ArgMatches;
use log::info;
use tokio_util::sync::CancellationToken;

use wellhead_telemetry::cli::{build_cli, handle_subcommands};

fn init_logging(matches: &ArgMatches) {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if let Some(level) = matches.get_one::<String>("log-level") {
        builder.parse_filters(level);
    }
    // stdout is reserved for `simulate` frames.
    builder.target(env_logger::Target::Stderr).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = build_cli().get_matches();
    let global_matches = matches
        .subcommand()
        .map(|(_, sub_matches)| sub_matches)
        .unwrap_or(&matches);
    init_logging(global_matches);

    let token = CancellationToken::new();
    tokio::spawn({
        let token = token.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("🛑 Ctrl-C received, shutting down");
                token.cancel();
            }
        }
    });

    match handle_subcommands(&matches, token).await {
        Ok(true) => Ok(()),
        Ok(false) => {
            build_cli().print_help()?;
            println!();
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
