use anyhow::Context;
use clap::Parser;
use state_relay::{config, relay::Relay, storage, util::get_log_level};
use tracing::{info, trace};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Parser)]
#[command(about = "Relays health state transitions to an orchestrator")]
struct Args {
    /// Config file
    #[arg(short)]
    file: String,
}

fn init() {
    dotenv::dotenv().ok();

    // the library and this binary share the `state_relay` target prefix
    let filter = filter::Targets::new().with_target("state_relay", get_log_level());
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init();
    let args = Args::parse();
    trace!("started with args: {args:?}");

    let config = config::load(&args.file)
        .with_context(|| format!("failed to load config from {}", args.file))?;

    let backend = storage::open(&config.storage)
        .await
        .context("failed to open queue storage")?;

    let api_settings = config.api.clone();
    let relay = Relay::start(config, backend).await?;

    #[cfg(feature = "api")]
    {
        use state_relay::api::{ApiState, spawn_api_server};

        if let Some(settings) = api_settings {
            let addr = spawn_api_server(settings.into(), ApiState::new(relay.status())).await?;
            info!("status API available at http://{addr}/api/v1");
        }
    }
    #[cfg(not(feature = "api"))]
    {
        if api_settings.is_some() {
            tracing::warn!("config has an api section but the api feature is disabled");
        }
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("received ctrl-c");

    relay.shutdown().await
}
