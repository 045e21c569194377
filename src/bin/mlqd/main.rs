mod args;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio::sync::mpsc;
use tokio::{select, time};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};

use crate::args::Args;
use mlq_rs::config::Config;
use mlq_rs::queue::Mlq;
use mlq_rs::reaper::Reaper;
use mlq_rs::store::RedisStore;

/// Runs the control-surface daemon: a reaper loop and the HTTP job
/// submission/progress/result API over one namespace.
///
/// This binary does not link any handler functions of its own -- a
/// production deployment embeds `mlq_rs::Mlq` directly and calls
/// `register_available`/`create_listener` with its own handlers. `mlqd` is
/// the infrastructure half: producers and operators talk to it over HTTP,
/// while worker processes link the crate as a library.
#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if args.debug {
        tracing_subscriber::fmt().with_max_level(Level::TRACE).init();
    } else {
        tracing_subscriber::fmt().json().init();
    }

    let mut config = match &args.config {
        Some(path) => match Config::from_yaml_file(path) {
            Ok(cfg) => cfg,
            Err(error) => {
                error!(%error, path = %path.display(), "failed to load config file");
                return ExitCode::from(2);
            },
        },
        None => Config::default(),
    };

    if let Some(namespace) = &args.namespace {
        config.namespace = namespace.clone();
    }
    if let Some(redis_url) = &args.redis_url {
        config.redis_url = redis_url.clone();
    }
    if let Some(http_addr) = args.http_addr {
        config.http_addr = http_addr;
    }

    match run(config, args.no_reaper).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!(%error, "encountered runtime error");
            ExitCode::FAILURE
        },
    }
}

async fn run(config: Config, no_reaper: bool) -> Result<()> {
    let store = RedisStore::connect(&config.redis_url).await.context("connecting to redis")?;
    let mlq = Mlq::new(config.namespace.clone(), Arc::new(store));

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(error) = signal::ctrl_c().await {
                warn!(%error, "something strange with ctrl-c handling!");
            }
            cancel.cancel();
        });
    }

    let (shutdown_hold, mut shutdown_wait) = mpsc::channel::<()>(1);

    if !no_reaper {
        let reaper = Reaper::new(
            config.namespace.clone(),
            mlq_store_handle(&mlq),
            config.reaper_period(),
            config.job_timeout(),
            config.max_retries,
        );
        let cancel = cancel.clone();
        let hold = shutdown_hold.clone();
        tokio::spawn(async move {
            select! {
                _ = reaper.run() => {},
                _ = cancel.cancelled() => {},
            }
            drop(hold);
        });
    }

    let app = mlq_rs::http::router(mlq);
    let listener = tokio::net::TcpListener::bind(config.http_addr).await.context("binding http listener")?;
    info!(addr = %config.http_addr, namespace = %config.namespace, "listening");

    {
        let cancel = cancel.clone();
        let hold = shutdown_hold.clone();
        tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(cancel.cancelled_owned());
            if let Err(error) = serve.await {
                error!(%error, "http server exited with error");
            }
            drop(hold);
        });
    }

    drop(shutdown_hold);
    shutdown_wait.recv().await;
    time::sleep(std::time::Duration::from_millis(50)).await;
    Ok(())
}

fn mlq_store_handle(mlq: &Mlq) -> Arc<dyn mlq_rs::store::Store> {
    mlq.store_handle()
}
