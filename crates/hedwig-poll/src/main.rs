use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use hedwig_core::attachment::AttachmentFilter;
use hedwig_core::OwnerRef;
use hedwig_db::open_database;
use hedwig_poll::config::{Cli, Command, PollArgs, StorageArgs};
use hedwig_poll::health::{run_health_server, SharedTracker};
use hedwig_poll::pidfile::PidLock;
use hedwig_poll::poll::{PollOptions, Poller};
use hedwig_poll::{admin, default_processors};
use hedwig_store::{LocalStore, ObjectStore};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let db = open_database(&cli.storage.db_config())
        .await
        .context("cannot open database")?;
    let store: Arc<dyn ObjectStore> = Arc::new(LocalStore::new(cli.storage.store_dir()));

    match cli.command {
        Command::Poll(args) => poll(&cli.storage, args, db, store).await,
        Command::Enqueue(args) => {
            let owner = match (args.proposal, args.review) {
                (Some(id), _) => OwnerRef::Proposal(id),
                (None, Some(id)) => OwnerRef::Review(id),
                (None, None) => anyhow::bail!("--proposal or --review is required"),
            };
            let a =
                admin::enqueue(db.as_ref(), store.as_ref(), args.task, owner, &args.file).await?;
            println!("{}", admin::format_attachment(&a));
            Ok(())
        }
        Command::Reset { id } => {
            let a = admin::reset(db.as_ref(), id).await?;
            println!("{}", admin::format_attachment(&a));
            Ok(())
        }
        Command::ResetStuck { older_than_minutes } => {
            let older_than = admin::stuck_age(older_than_minutes)?;
            let reset = admin::reset_stuck(db.as_ref(), older_than).await?;
            for a in &reset {
                println!("{}", admin::format_attachment(a));
            }
            println!("{} attachment(s) reset", reset.len());
            Ok(())
        }
        Command::Status => {
            let counts = db.count_attachments_by_state().await?;
            print!("{}", admin::format_status(&counts));
            Ok(())
        }
        Command::List { state, task, limit } => {
            let filter = AttachmentFilter {
                kind: task,
                state,
                owner: None,
                limit: Some(limit),
            };
            for a in db.list_attachments(&filter).await? {
                println!("{}", admin::format_attachment(&a));
            }
            Ok(())
        }
    }
}

async fn poll(
    storage: &StorageArgs,
    args: PollArgs,
    db: Arc<dyn hedwig_db::Database>,
    store: Arc<dyn ObjectStore>,
) -> Result<()> {
    let pidfile = args.pidfile(storage);
    let _lock = PidLock::acquire(&pidfile)?;
    info!("hedwig-poll starting (pid file {})", pidfile.display());

    let options = PollOptions {
        kinds: args.kinds(),
        pause: args.pause(),
        dry_run: args.dry_run,
    };
    let tracker = SharedTracker::default();
    let mut poller = Poller::new(db, store).with_tracker(tracker.clone());
    for processor in default_processors(&args.tools) {
        poller = poller.with_processor(processor);
    }
    poller.preflight(&options.kinds).await?;

    if let Some(port) = args.health_port {
        tokio::spawn(async move {
            if let Err(e) = run_health_server(port, tracker).await {
                error!("health server failed: {e}");
            }
        });
        info!("health endpoint: http://127.0.0.1:{port}/health");
    }

    let kinds: Vec<&str> = options.kinds.iter().map(|k| k.as_str()).collect();
    match options.pause {
        Some(pause) => info!(
            "entering poll loop (tasks: {}, pause: {}s)",
            kinds.join(", "),
            pause.as_secs()
        ),
        None => info!("running one cycle (tasks: {})", kinds.join(", ")),
    }

    // The lock guard must drop on signals too, so race the loop against them.
    tokio::select! {
        result = poller.run(&options) => result,
        _ = shutdown_signal() => {
            info!("shutdown signal received");
            Ok(())
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    let mut term = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!("cannot install SIGTERM handler: {e}");
            let _ = ctrl_c.await;
            return;
        }
    };
    tokio::select! {
        _ = ctrl_c => {}
        _ = term.recv() => {}
    }
}
