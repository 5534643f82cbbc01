//! tabsync - 送信キューと KDS ストリームの操作用 CLI
//!
//! Usage:
//!   tabsync [--config <toml>] drain
//!   tabsync pending
//!   tabsync close <bill> [--total <yen>]
//!   tabsync kds tickets <kitchen|drinker>
//!   tabsync kds ready

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tabsync_core::app::{App, AppBuilder, LongPollClient};
use tabsync_core::config::Settings;
use tabsync_core::domain::{BillId, BillTask, Station};
use tabsync_core::observability::init_tracing;
use tracing::info;

#[derive(Parser)]
#[command(name = "tabsync")]
#[command(about = "Offline send queue and kitchen display client for the POS backend")]
struct Cli {
    /// TOML settings file; defaults apply when omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the send queue until it is empty
    Drain,
    /// Print the queued tasks as JSON
    Pending,
    /// Queue a close (plus reconcile) for a bill and drain
    Close {
        bill: u64,
        #[arg(long)]
        total: Option<i64>,
    },
    /// Follow a kitchen display stream until Ctrl-C
    Kds {
        #[command(subcommand)]
        stream: KdsStream,
    },
}

#[derive(Subcommand)]
enum KdsStream {
    /// NEW/ACK tickets for one station
    Tickets { station: Station },
    /// READY tickets
    Ready,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref()).context("loading settings")?;
    init_tracing(settings.log.format);

    let app = AppBuilder::from_settings(&settings)?.build()?;

    match cli.command {
        Commands::Drain => drain(&app).await,
        Commands::Pending => {
            let tasks = app.queue.snapshot().await;
            println!("{}", serde_json::to_string_pretty(&tasks)?);
            Ok(())
        }
        Commands::Close { bill, total } => {
            app.queue
                .enqueue_reconciled(BillTask::CloseBill {
                    id: BillId::Real(bill),
                    settled_total: total,
                })
                .await?;
            drain(&app).await
        }
        Commands::Kds { stream } => {
            let client = match stream {
                KdsStream::Tickets { station } => app.ticket_stream(station),
                KdsStream::Ready => app.ready_stream(),
            }
            .context("no KDS API configured")?;
            follow(client).await
        }
    }
}

async fn drain(app: &App) -> anyhow::Result<()> {
    app.queue.start();
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!(stats = ?app.queue.stats().await, "interrupted; remaining tasks stay queued");
                return Ok(());
            }
            _ = ticker.tick() => {
                let stats = app.queue.stats().await;
                if stats.total == 0 {
                    info!("send queue drained");
                    return Ok(());
                }
                info!(total = stats.total, due = stats.due, max_tries = stats.max_tries, "draining");
            }
        }
    }
}

async fn follow(client: LongPollClient) -> anyhow::Result<()> {
    client.start();
    tokio::signal::ctrl_c().await?;
    client.stop();
    for ticket in client.items() {
        println!("{}", serde_json::to_string(&ticket)?);
    }
    info!(cursor = client.cursor(), "stream stopped");
    Ok(())
}
