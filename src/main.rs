use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use serde::Serialize;
use tokio::{signal, sync::watch};
use tracing::{info, warn};

use storefront_orders::{
    config::{self, AppConfig},
    db::{self, DbPool},
    events::{self, EventSender},
    gateway::{CheckoutGateway, IyzicoGateway},
    notifications::TracingNotifier,
    services::reconciliation::{DriftReport, SweepReport},
    ServiceContainer, ServiceFactory,
};

/// Operator entry point for the order engine's background work.
#[derive(Parser)]
#[command(name = "storefront-worker", version, about)]
struct Cli {
    #[arg(
        long,
        global = true,
        action = ArgAction::SetTrue,
        help = "Render command output as pretty JSON"
    )]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending schema migrations
    Migrate,
    /// Run the pending sweep and drift reconciliation until interrupted
    Sweep,
    /// Run one pending sweep and one drift pass, then exit
    SweepOnce,
    /// Finalize a single checkout token
    Finalize {
        #[arg(long)]
        token: String,
    },
}

struct WorkerContext {
    services: ServiceContainer,
    event_sender: EventSender,
}

impl WorkerContext {
    async fn initialize(config: AppConfig, db_pool: Arc<DbPool>) -> Result<Self> {
        let gateway: Arc<dyn CheckoutGateway> = Arc::new(
            IyzicoGateway::new(&config.gateway).context("failed to build gateway client")?,
        );

        let (event_sender, event_rx) = EventSender::channel(config.event_channel_capacity);
        let notifier = Arc::new(TracingNotifier);
        tokio::spawn(events::process_events(event_rx, notifier.clone(), notifier));

        let factory = ServiceFactory::new(db_pool, Some(event_sender.clone()), gateway, config);
        Ok(Self {
            services: ServiceContainer::new(&factory),
            event_sender,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = config::load_config().context("failed to load application config")?;
    config::init_tracing(config.log_level(), config.log_json);

    let db_pool = db::establish_connection_from_app_config(&config)
        .await
        .context("failed to connect to database")?;

    if matches!(cli.command, Commands::Migrate) {
        db::run_migrations(&db_pool).await.context("migration failed")?;
        info!("Migrations applied");
        return Ok(());
    }
    if config.auto_migrate {
        db::run_migrations(&db_pool).await.context("migration failed")?;
    }

    let context = WorkerContext::initialize(config, Arc::new(db_pool)).await?;
    let reconciliation = context.services.reconciliation.clone();

    match cli.command {
        Commands::Migrate => {}
        Commands::Sweep => {
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let worker = tokio::spawn(async move { reconciliation.run(shutdown_rx).await });
            shutdown_signal().await;
            info!("Shutdown requested; stopping reconciliation loops");
            if shutdown_tx.send(true).is_err() {
                warn!("Reconciliation loops already stopped");
            }
            worker.await.context("reconciliation task panicked")?;
        }
        Commands::SweepOnce => {
            let pending = reconciliation.sweep_pending_once().await?;
            let drift = reconciliation.reconcile_drift_once().await?;
            #[derive(Debug, Serialize)]
            struct Summary {
                pending: SweepReport,
                drift: DriftReport,
            }
            render(cli.json, &Summary { pending, drift })?;
        }
        Commands::Finalize { token } => {
            let outcome = context.services.finalization.finalize(&token).await?;
            render(cli.json, &outcome)?;
        }
    }

    drop(context.event_sender);
    Ok(())
}

fn render<T: Serialize + std::fmt::Debug>(json: bool, value: &T) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        println!("{:#?}", value);
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
