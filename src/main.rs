use anyhow::Error;
use clap::Parser;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, instrument, Instrument};

use adboard::api::{self, AppState};
use adboard::config::ConfigContext;
use adboard::db::DbHandle;
use adboard::notifier::{Notifier, SmtpMailer};
use adboard::queue::TaskQueue;
use adboard::{server, telemetry};

#[instrument(skip_all)]
async fn setup(config: ConfigContext, cancel_token: CancellationToken) -> Result<(), Error> {
    let db = Arc::new(DbHandle::new(&config.connect_url, config.max_connections).await?);

    let mailer = SmtpMailer::new(&config.smtp)?;
    let notifier = Arc::new(Notifier::new(Arc::new(mailer), config.smtp.body.clone()));

    let (tasks, recv_from_client) = TaskQueue::new(db.clone(), config.poll_interval());

    let server_spawn = {
        let cancel_token = cancel_token.clone();
        let workers = config.num;
        let tasks = tasks.clone();
        tokio::spawn(
            async move {
                if let Err(err) =
                    server::serve(cancel_token.clone(), tasks, notifier, workers, recv_from_client)
                        .await
                {
                    error!("Error running dispatch server: {}", err);
                    cancel_token.cancel();
                }
            }
            .instrument(info_span!("server")),
        )
    };

    let app = api::router(AppState {
        records: db,
        tasks,
        max_wait: config.max_wait(),
    });

    let listener = tokio::net::TcpListener::bind(config.listen).await?;
    info!(message = "Listening", address = %config.listen);
    axum::serve(listener, app)
        .with_graceful_shutdown(cancel_token.clone().cancelled_owned())
        .await?;

    // The HTTP server may also stop on its own; take the queue down with it.
    cancel_token.cancel();
    info!("Waiting for dispatch server to shutdown...");
    server_spawn.await?;

    Ok(())
}

async fn wait_for_signal(token: CancellationToken) -> Result<(), Error> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
        _ = token.cancelled() => {},
    }
    token.cancel();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    // A missing .env is fine; the environment and flags still apply.
    dotenvy::dotenv().ok();
    let config = ConfigContext::parse();

    telemetry::init(config.jaeger_endpoint.as_deref())?;

    let token = CancellationToken::new();

    let signals = tokio::spawn(wait_for_signal(token.clone()));
    let app = tokio::spawn(setup(config, token.clone()));

    let result = app.await?;
    token.cancel();
    if let Err(err) = signals.await? {
        error!("Signal handling failed: {}", err);
    }

    info!("Shutting down.");
    telemetry::shutdown();

    result
}
