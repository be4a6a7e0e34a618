use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use tokio::{signal, sync::mpsc};
use tracing::{error, info, warn};

use storefront_api as api;
use storefront_api::notifications::{LogEmailSender, TextInvoiceRenderer};
use storefront_api::services::payment_gateway::HttpPaymentGateway;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = api::config::load_config().context("failed to load configuration")?;
    api::config::init_tracing(&cfg.log_level, cfg.log_json);
    api::handlers::health::init_start_time();

    // Init DB
    let db_pool = api::db::establish_connection_from_app_config(&cfg)
        .await
        .context("failed to connect to the database")?;
    if cfg.auto_migrate {
        api::db::run_migrations(&db_pool).await.map_err(|e| {
            error!("Failed running migrations: {}", e);
            e
        })?;
    }

    // Init events
    let (event_tx, event_rx) = mpsc::channel(cfg.event_channel_capacity);
    let event_sender = Arc::new(api::events::EventSender::new(event_tx));
    tokio::spawn(api::events::process_events(event_rx));

    if cfg.payment_webhook_secret.is_none() {
        warn!("APP__PAYMENT_WEBHOOK_SECRET is not set; payment webhooks will be rejected");
    }
    if cfg.payment_gateway_api_key.is_none() {
        warn!("APP__PAYMENT_GATEWAY_API_KEY is not set; payment intents will fail");
    }

    let gateway = HttpPaymentGateway::new(
        cfg.payment_gateway_base_url.clone(),
        cfg.payment_gateway_api_key.clone(),
        cfg.external_call_timeout(),
    )?;
    let collaborators = api::handlers::Collaborators {
        gateway: Arc::new(gateway),
        invoice_renderer: Arc::new(TextInvoiceRenderer),
        mailer: Arc::new(LogEmailSender),
    };

    let cfg = Arc::new(cfg);
    let app_state = api::AppState::new(
        Arc::new(db_pool),
        cfg.clone(),
        event_sender,
        collaborators,
    );
    let app = api::build_router(app_state);

    // Bind and serve
    let ip = cfg
        .host
        .parse::<std::net::IpAddr>()
        .with_context(|| format!("invalid host address: {}", cfg.host))?;
    let addr = SocketAddr::new(ip, cfg.port);
    info!("storefront-api listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("storefront-api stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {}", e);
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
                error!("failed to install SIGTERM handler: {}", e);
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
