use std::path::{Path, PathBuf};

use clap::Parser;
use tracing::{error, info};

use webhook_bridge::{init_tracing, Bridge, Config, Shutdown};

const EXIT_SUCCESS: i32 = 0;
const EXIT_FAILURE: i32 = 1;
/// Tells an outer supervisor to relaunch the process.
const EXIT_RESTART: i32 = 2;

#[derive(Debug, Parser)]
#[command(
    name = "webhook-bridge",
    version,
    about = "Durable webhook store-and-forward bridge"
)]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(long, value_name = "PATH")]
    config: PathBuf,
}

fn main() {
    let args = Args::parse();
    init_tracing();

    let code = match std::panic::catch_unwind(|| run(&args.config)) {
        Ok(code) => code,
        Err(_) => {
            error!("panic reached the supervisor, exiting for restart");
            EXIT_RESTART
        }
    };

    std::process::exit(code);
}

fn run(config_path: &Path) -> i32 {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path.display(),
        "starting webhook-bridge"
    );

    let config = match Config::load(config_path) {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "failed to load configuration");
            return EXIT_FAILURE;
        }
    };
    info!("configuration loaded");

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(error = %err, "failed to start runtime");
            return EXIT_FAILURE;
        }
    };

    runtime.block_on(async {
        let bridge = match Bridge::initialize(config).await {
            Ok(bridge) => bridge,
            Err(err) => {
                error!(error = %err, "failed to initialize, exiting for restart");
                return EXIT_RESTART;
            }
        };

        match bridge.run().await {
            Ok(Shutdown::Graceful) => EXIT_SUCCESS,
            Ok(Shutdown::Restart) => EXIT_RESTART,
            Err(err) => {
                error!(error = %err, "bridge failed, exiting for restart");
                EXIT_RESTART
            }
        }
    })
}
