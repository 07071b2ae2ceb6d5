use actix_web::{web, App, HttpServer};
use anyhow::Context;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_actix_web::TracingLogger;

use live_session_service::clients::{
    FfmpegTranscoder, HttpPaymentGateway, HttpSubscriberNotifier, HttpSubscriptionDirectory,
    LocalArchiveStorage,
};
use live_session_service::config::Config;
use live_session_service::db::{self, PgSessionStore};
use live_session_service::services::{Collaborators, LiveSessionCoordinator};
use live_session_service::state::AppState;
use live_session_service::{handlers, logging};

async fn build_collaborators(config: &Config) -> anyhow::Result<Collaborators> {
    let mut collaborators = Collaborators::in_memory();
    let external = &config.external;

    match &external.subscription_service_url {
        Some(url) => {
            collaborators.directory = Arc::new(
                HttpSubscriptionDirectory::new(url.as_str(), external.timeout)
                    .context("subscription client")?,
            );
        }
        None => warn!("SUBSCRIPTION_SERVICE_URL not set; using in-process subscription directory"),
    }
    match &external.payment_service_url {
        Some(url) => {
            collaborators.payments = Arc::new(
                HttpPaymentGateway::new(url.as_str(), external.timeout).context("payment client")?,
            );
        }
        None => warn!("PAYMENT_SERVICE_URL not set; using in-process payment gateway"),
    }
    match &external.notification_service_url {
        Some(url) => {
            collaborators.notifier = Arc::new(
                HttpSubscriberNotifier::new(url.as_str(), external.timeout)
                    .context("notification client")?,
            );
        }
        None => warn!("NOTIFICATION_SERVICE_URL not set; live notifications stay in-process"),
    }

    if config.app.env == "development" || config.app.env == "test" {
        warn!(env = %config.app.env, "using in-process transcoder and archive");
    } else {
        let output_dir = PathBuf::from(&config.transcode.output_dir);
        collaborators.transcoder = Arc::new(FfmpegTranscoder::new(config.transcode.ffmpeg_bin.clone()));
        collaborators.archive = Arc::new(LocalArchiveStorage::new(output_dir.join("archive")));
    }

    if let Some(url) = &config.database.url {
        let pool = db::init_pool(url, config.database.max_connections)
            .await
            .context("database")?;
        collaborators.store = Arc::new(PgSessionStore::new(pool));
        info!("persisting sessions to PostgreSQL");
    } else {
        warn!("DATABASE_URL not set; sessions are kept in memory only");
    }

    Ok(collaborators)
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("failed to load configuration")?;
    logging::init_tracing(config.app.log_format);

    let collaborators = build_collaborators(&config).await?;
    let coordinator = LiveSessionCoordinator::new(config.clone(), collaborators);
    let reaper = coordinator.spawn_heartbeat_reaper();
    let state = AppState::new(coordinator);

    let bind_addr = format!("{}:{}", config.app.host, config.app.port);
    info!(%bind_addr, env = %config.app.env, "starting live-session-service");

    HttpServer::new(move || {
        App::new()
            .wrap(TracingLogger::default())
            .app_data(web::Data::new(state.clone()))
            .configure(handlers::configure)
    })
    .bind(&bind_addr)
    .with_context(|| format!("failed to bind {bind_addr}"))?
    .run()
    .await
    .context("http server")?;

    reaper.abort();
    info!("live-session-service stopped");
    Ok(())
}
