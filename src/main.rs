//! motis-operator - A Kubernetes operator for MOTIS routing-engine instances.
//!
//! This is the main entry point that:
//! - Initializes structured logging
//! - Creates the Kubernetes client
//! - Runs leader election (required for HA deployments)
//! - Starts the controller, instance API, health server, and optionally webhook server

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::Parser;
use kube::Client;
use kube_leader_election::{LeaseLock, LeaseLockParams};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use motis_operator::api::{ApiState, run_api_server};
use motis_operator::client::Clients;
use motis_operator::config::OperatorConfig;
use motis_operator::controller::context::Context;
use motis_operator::controller::queue::WorkQueue;
use motis_operator::health::{HealthState, run_health_server};
use motis_operator::run_controller;
use motis_operator::run_webhook_server;
use motis_operator::scheduler::Clock;

/// Lease configuration
const LEASE_NAME: &str = "motis-operator-leader";
const LEASE_TTL_SECS: u64 = 15;
const LEASE_RENEW_INTERVAL_SECS: u64 = 5;

/// Grace period for in-flight reconciliations to complete during shutdown
const SHUTDOWN_GRACE_PERIOD_SECS: u64 = 5;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("motis_operator=info".parse()?)
                .add_directive("kube=info".parse()?)
                .add_directive("kube_leader_election=info".parse()?),
        )
        .json()
        .init();

    let config = OperatorConfig::parse();
    info!(config = ?config, "Starting motis-operator");

    // Create Kubernetes client
    let client = Client::try_default().await?;
    info!("Connected to Kubernetes cluster");

    // Get pod identity for leader election
    let pod_name = std::env::var("POD_NAME").unwrap_or_else(|_| {
        warn!("POD_NAME not set, using hostname");
        hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string())
    });
    let lease_namespace = std::env::var("POD_NAMESPACE").unwrap_or_else(|_| {
        warn!("POD_NAMESPACE not set, using 'default'");
        "default".to_string()
    });
    let namespace = config.resolve_namespace();

    // Create shared health state
    let health_state = Arc::new(HealthState::new());

    let ctx = Arc::new(
        Context::new(
            Clients::kube(client.clone(), &namespace),
            Clock::System,
            config.reconcile_settings(),
        )
        .with_event_client(client.clone())
        .with_health_state(health_state.clone()),
    );
    let queue = Arc::new(WorkQueue::new(config.backoff()));
    let shutdown = CancellationToken::new();

    // Start health server immediately (probes should work even as non-leader)
    let health_handle = {
        let health_state = health_state.clone();
        let port = config.health_port;
        tokio::spawn(async move {
            if let Err(e) = run_health_server(health_state, port).await {
                error!("Health server error: {}", e);
            }
        })
    };

    // The instance API only reads and writes Motis objects, so every replica serves it
    let api_handle = {
        let state = ApiState::new(ctx.clone(), namespace.clone());
        let port = config.api_port;
        tokio::spawn(async move {
            if let Err(e) = run_api_server(state, port).await {
                error!("API server error: {}", e);
            }
        })
    };

    // Track leadership status
    let is_leader = Arc::new(AtomicBool::new(false));

    let lease_renewal_handle = if config.leader_election {
        info!(
            holder_id = %pod_name,
            namespace = %lease_namespace,
            lease_name = LEASE_NAME,
            "Initializing leader election"
        );
        let lease_lock = LeaseLock::new(
            client.clone(),
            &lease_namespace,
            LeaseLockParams {
                holder_id: pod_name,
                lease_name: LEASE_NAME.to_string(),
                lease_ttl: Duration::from_secs(LEASE_TTL_SECS),
            },
        );

        // Acquire leadership before starting controller
        info!("Waiting to acquire leadership...");
        loop {
            match lease_lock.try_acquire_or_renew().await {
                Ok(result) if result.acquired_lease => {
                    info!("Acquired leadership");
                    is_leader.store(true, Ordering::SeqCst);
                    break;
                }
                Ok(_) => info!("Another instance is leader, waiting..."),
                Err(e) => warn!("Failed to acquire lease: {}, retrying...", e),
            }
            tokio::time::sleep(Duration::from_secs(LEASE_RENEW_INTERVAL_SECS)).await;
        }

        // Start lease renewal background task
        let is_leader = is_leader.clone();
        #[allow(clippy::exit)]
        Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(LEASE_RENEW_INTERVAL_SECS)).await;

                match lease_lock.try_acquire_or_renew().await {
                    Ok(result) if result.acquired_lease => {}
                    Ok(_) => {
                        error!("Lost leadership! Shutting down...");
                        is_leader.store(false, Ordering::SeqCst);
                        // Exit so Kubernetes restarts us and we re-enter election
                        std::process::exit(1);
                    }
                    Err(e) => {
                        error!("Failed to renew lease: {}. Shutting down...", e);
                        is_leader.store(false, Ordering::SeqCst);
                        std::process::exit(1);
                    }
                }
            }
        }))
    } else {
        info!("Leader election disabled");
        is_leader.store(true, Ordering::SeqCst);
        None
    };

    // Start controller (only runs as leader)
    let mut controller_handle = {
        let ctx = ctx.clone();
        let queue = queue.clone();
        let workers = config.workers;
        let token = shutdown.clone();
        tokio::spawn(async move {
            run_controller(ctx, queue, workers, token).await;
        })
    };

    // Optionally start webhook server if certificates are available
    let webhook_handle = if Path::new(&config.webhook_cert).exists()
        && Path::new(&config.webhook_key).exists()
    {
        info!("TLS certificates found, starting webhook server");
        let (port, cert, key) = (
            config.webhook_port,
            config.webhook_cert.clone(),
            config.webhook_key.clone(),
        );
        Some(tokio::spawn(async move {
            if let Err(e) = run_webhook_server(port, &cert, &key).await {
                error!("Webhook server error: {}", e);
            }
        }))
    } else {
        info!("Webhook certificates not found, webhook server disabled");
        None
    };

    // Wait for any task to complete (or fail), or shutdown signal
    tokio::select! {
        result = &mut controller_handle => {
            if let Err(e) = result {
                error!("Controller task panicked: {}", e);
            }
        }
        result = health_handle => {
            if let Err(e) = result {
                error!("Health server task panicked: {}", e);
            }
        }
        result = api_handle => {
            if let Err(e) = result {
                error!("API server task panicked: {}", e);
            }
        }
        result = async {
            match webhook_handle {
                Some(handle) => handle.await,
                None => std::future::pending().await,
            }
        } => {
            if let Err(e) = result {
                error!("Webhook server task panicked: {}", e);
            }
        }
        // Lease renewal task only exits via process::exit() or panic
        // so this branch is only reached on panic
        result = async {
            match lease_renewal_handle {
                Some(handle) => handle.await,
                None => std::future::pending().await,
            }
        } => {
            if let Err(e) = result {
                error!("Lease renewal task panicked: {}", e);
            }
        }
        // Handle graceful shutdown on SIGTERM or SIGINT
        _ = shutdown_signal() => {
            info!("Received shutdown signal, initiating graceful shutdown...");

            // Mark as not ready to stop receiving new work
            health_state.set_ready(false).await;
            info!("Marked operator as not ready");

            // Stop handing out work and give in-flight reconciliations time to complete
            shutdown.cancel();
            info!(
                "Waiting up to {}s for in-flight reconciliations to complete...",
                SHUTDOWN_GRACE_PERIOD_SECS
            );
            if tokio::time::timeout(
                Duration::from_secs(SHUTDOWN_GRACE_PERIOD_SECS),
                &mut controller_handle,
            )
            .await
            .is_err()
            {
                warn!("Grace period elapsed with reconciliations in flight");
            }

            info!("Grace period complete, shutting down");
        }
    }

    info!("Operator stopped");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
///
/// Note: Signal handler setup failures are fatal - the operator cannot shut down
/// gracefully without them. Using expect() here is intentional.
#[allow(clippy::expect_used)]
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
