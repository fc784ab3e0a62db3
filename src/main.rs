use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use mqttdash::api::ApiClient;
use mqttdash::config::AppConfig;
use mqttdash::console::{render_snapshot, render_update, ConsoleCommand, HELP};
use mqttdash::mqtt::{PublishOutcome, RumqttConnector};
use mqttdash::persistence::TokenStore;
use mqttdash::session::{SessionEvent, SessionHandle, SyncSession};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// Terminal dashboard for MQTT sensor devices.
#[derive(Parser, Debug)]
#[command(name = "mqttdash", version, about)]
struct Cli {
    /// API token; stored for later runs
    #[arg(long)]
    token: Option<String>,

    /// Config file (default ~/.config/mqttdash/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the REST base URL
    #[arg(long)]
    api_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;
    let cli = Cli::parse();

    let mut config = AppConfig::load_or_default(cli.config.as_deref()).await?;
    if let Some(api_url) = cli.api_url {
        config.api.base_url = api_url;
    }

    let token = resolve_token(cli.token).await?;
    let api = ApiClient::new(&config.api, token)
        .map_err(|e| eyre!("Failed to create REST client: {}", e))?;

    info!("Starting sync session");
    let (session, session_task) =
        SyncSession::spawn(&config.broker, Arc::new(api), Arc::new(RumqttConnector));
    let reporter = tokio::spawn(report_events(session.events()));

    run_console(&session).await?;

    session
        .shutdown()
        .await
        .map_err(|e| eyre!("Failed to stop sync session: {}", e))?;
    if let Err(e) = session_task.await {
        error!("Sync session task failed: {}", e);
    }
    reporter.abort();
    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}

async fn resolve_token(cli_token: Option<String>) -> Result<String> {
    let store = TokenStore::new();
    if let Some(token) = cli_token {
        return store.save(&token).await;
    }
    store.load().await?.ok_or_else(|| {
        eyre!(
            "No API token stored at {}, pass one with --token",
            store.path().display()
        )
    })
}

async fn report_events(mut events: broadcast::Receiver<SessionEvent>) {
    loop {
        match events.recv().await {
            Ok(SessionEvent::ValueChanged(update)) => println!("{}", render_update(&update)),
            Ok(SessionEvent::ConnectionChanged(state)) => println!("broker: {:?}", state),
            Ok(SessionEvent::DeviceLoaded { device_id, topics }) => {
                info!("Device {} ready, {} topics", device_id, topics.len())
            }
            Ok(SessionEvent::DeviceFailed { device_id, reason }) => {
                warn!("Device {} unavailable: {}", device_id, reason)
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Display fell behind, {} events skipped", skipped)
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn run_console(session: &SessionHandle) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("{}", HELP);

    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received");
                return Ok(());
            }
            line = lines.next_line() => line.map_err(|e| eyre!("Failed to read stdin: {}", e))?,
        };

        let Some(line) = line else {
            info!("stdin closed, running until Ctrl-C");
            tokio::signal::ctrl_c()
                .await
                .map_err(|e| eyre!("Failed to wait for Ctrl-C: {}", e))?;
            return Ok(());
        };

        match ConsoleCommand::parse(&line) {
            Ok(None) => {}
            Ok(Some(ConsoleCommand::Quit)) => return Ok(()),
            Ok(Some(command)) => execute(session, command).await,
            Err(e) => println!("{}", e),
        }
    }
}

async fn execute(session: &SessionHandle, command: ConsoleCommand) {
    match command {
        ConsoleCommand::Publish {
            device_id,
            topic,
            message,
            retain,
        } => match session
            .publish_command(device_id, topic, message, retain)
            .await
        {
            Ok(PublishOutcome::Sent) => println!("sent"),
            Ok(PublishOutcome::Dropped) => println!("broker not connected, command dropped"),
            Err(e) => println!("rejected: {}", e),
        },
        ConsoleCommand::SetInput { device_id, text } => {
            if let Err(e) = session.set_input(device_id, text).await {
                println!("rejected: {}", e);
            }
        }
        ConsoleCommand::Show => {
            match session.connection_state().await {
                Ok(state) => println!("broker: {:?}", state),
                Err(e) => error!("{}", e),
            }
            match session.snapshot().await {
                Ok(devices) => println!("{}", render_snapshot(&devices)),
                Err(e) => error!("{}", e),
            }
        }
        ConsoleCommand::Help => println!("{}", HELP),
        ConsoleCommand::Quit => {}
    }
}
