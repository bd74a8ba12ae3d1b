//! Arrakis Pub/Sub relay
//!
//! Small service around the client library that:
//! - provisions a topic and a subscription from `RELAY_*` configuration
//! - optionally announces itself with a startup message
//! - receives from the subscription, logging and acknowledging each message
//! - exposes health/ready endpoints and Prometheus metrics

use anyhow::Result;
use arrakis_pubsub::health::{self, AppState};
use arrakis_pubsub::metrics::PubSubMetrics;
use arrakis_pubsub::{Message, PubSub, ReceivedMessage, RelayConfig};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first to get log level
    let relay = RelayConfig::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("arrakis_pubsub={}", relay.log_level).parse()?)
                .add_directive("async_nats=warn".parse()?),
        )
        .json()
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        project_id = %relay.pubsub.project_id,
        topic = %relay.topic,
        subscription = %relay.subscription,
        local = relay.pubsub.is_local,
        "Starting Arrakis Pub/Sub relay"
    );

    let metrics = PubSubMetrics::install()?;
    info!("Prometheus metrics initialized");

    let pubsub = PubSub::connect(&relay.pubsub).await?;

    pubsub.create_topic(&relay.topic_spec()).await?;
    pubsub
        .create_subscription(
            &relay.topic,
            &relay.subscription,
            &relay.subscription_filter,
            &relay.subscription_settings(),
        )
        .await?;

    if relay.announce {
        let announcement = Message::new(
            &relay.topic,
            serde_json::json!({ "started": true, "version": env!("CARGO_PKG_VERSION") }),
        )
        .with_attribute("Source", "arrakis-pubsub-relay");
        let ack = pubsub.publish(announcement).await?;
        info!(message_id = %ack.message_id, "Startup announcement published");
    }

    // Start health server
    let receiving = Arc::new(AtomicBool::new(false));
    let app_state = AppState {
        pubsub: pubsub.clone(),
        project_id: relay.pubsub.project_id.clone(),
        subscription: relay.subscription.clone(),
        receiving: Arc::clone(&receiving),
        metrics: Some(metrics),
    };

    let health_router = health::router(app_state);
    let addr: SocketAddr = ([0, 0, 0, 0], relay.http_port).into();

    info!(port = relay.http_port, "Starting HTTP server");

    let http_server = axum::serve(tokio::net::TcpListener::bind(addr).await?, health_router);

    let fan_out = relay.pubsub.options.receive.resolve().concurrency;
    let (sink, deliveries) = mpsc::channel(fan_out);
    let consumer = tokio::spawn(consume(deliveries));

    receiving.store(true, Ordering::SeqCst);

    // Run everything concurrently
    tokio::select! {
        result = pubsub.receive(&relay.subscription, sink) => {
            match result {
                Ok(()) => info!("Delivery stream ended"),
                Err(e) => error!(error = %e, "Receive failed"),
            }
        }
        result = http_server => {
            if let Err(e) = result {
                error!(error = %e, "HTTP server error");
            }
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
        }
    }

    // Graceful shutdown
    info!("Shutting down relay...");
    receiving.store(false, Ordering::SeqCst);

    // The sink is gone with the receive future, so the consumer drains and exits
    consumer.await?;

    if let Err(e) = pubsub.close().await {
        warn!(error = %e, "Failed to close pub/sub client");
    }

    info!(
        published = pubsub.messages_published(),
        "Relay shutdown complete"
    );
    Ok(())
}

/// Log and acknowledge every forwarded message
async fn consume(mut deliveries: mpsc::Receiver<ReceivedMessage>) {
    while let Some(message) = deliveries.recv().await {
        info!(
            message_id = %message.id,
            bytes = message.data.len(),
            attempt = ?message.delivery_attempt,
            originated_at = ?message.originated_at(),
            "Message received"
        );

        if let Err(e) = message.ack().await {
            warn!(error = %e, "Failed to acknowledge message");
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
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
