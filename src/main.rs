use std::process::ExitCode;
use std::sync::Arc;

use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use kubediag::config::Mode;
use kubediag::controller::stages::{DiagnosisStage, InformationStage, RecoveryStage, StageContext, StageWorker};
use kubediag::controller::{run_controller, ReconcilerContext};
use kubediag::evaluator::Evaluator;
use kubediag::http::{run_http_server, run_metrics_server};
use kubediag::metrics::Metrics;
use kubediag::queue::StageQueues;
use kubediag::reaper::Reaper;
use kubediag::{dispatcher, AppConfig};

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "kubediag exited with an error");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> kubediag::Result<()> {
    let config = Arc::new(AppConfig::load()?);
    init_tracing(config.log_json);

    info!(mode = ?config.mode, "starting kubediag");

    let client = Client::try_default().await?;
    let metrics = Arc::new(Metrics::new());
    let token = CancellationToken::new();

    let mut handles: Vec<tokio::task::JoinHandle<()>> = Vec::new();

    let http_address = config.address;
    let http_token = token.clone();
    handles.push(tokio::spawn(async move {
        if let Err(err) = run_http_server(http_address, http_token).await {
            error!(error = %err, "http server exited");
        }
    }));

    let metrics_address = config.metrics_address;
    let metrics_metrics = metrics.clone();
    let metrics_token = token.clone();
    handles.push(tokio::spawn(async move {
        if let Err(err) = run_metrics_server(metrics_address, metrics_metrics, metrics_token).await {
            error!(error = %err, "metrics server exited");
        }
    }));

    match config.mode {
        Mode::Agent => {
            let queues = StageQueues::new();
            let senders = queues.senders();
            let reporter = kube::runtime::events::Reporter {
                controller: "kubediag".to_string(),
                instance: Some(config.node_name.clone()),
            };

            let stage_ctx = Arc::new(StageContext {
                client: client.clone(),
                http: dispatcher::build_client(config.insecure_skip_tls_verify)?,
                metrics: metrics.clone(),
                senders: senders.clone(),
                node_name: config.node_name.clone(),
                node_bind_address: config.address.ip().to_string(),
                node_bind_port: config.address.port(),
                reporter: reporter.clone(),
                data_root: config.data_root.clone(),
            });

            let reconciler_ctx = Arc::new(ReconcilerContext::new(
                client.clone(),
                config.clone(),
                senders,
                metrics.clone(),
                reporter,
            ));

            let StageQueues {
                information_receiver,
                diagnosis_receiver,
                recovery_receiver,
                ..
            } = queues;

            let information_stage = Arc::new(InformationStage);
            let diagnosis_stage = Arc::new(DiagnosisStage);
            let recovery_stage = Arc::new(RecoveryStage);

            let reconciler_token = token.clone();
            handles.push(tokio::spawn(run_controller(reconciler_ctx, reconciler_token)));

            let info_ctx = stage_ctx.clone();
            let info_token = token.clone();
            handles.push(tokio::spawn(async move {
                information_stage.run(information_receiver, info_ctx, info_token).await
            }));

            let diag_ctx = stage_ctx.clone();
            let diag_token = token.clone();
            handles.push(tokio::spawn(async move {
                diagnosis_stage.run(diagnosis_receiver, diag_ctx, diag_token).await
            }));

            let rec_ctx = stage_ctx.clone();
            let rec_token = token.clone();
            handles.push(tokio::spawn(async move {
                recovery_stage.run(recovery_receiver, rec_ctx, rec_token).await
            }));

            if config.feature_gates.enabled("Reaper") {
                let reaper = Reaper::new(client.clone(), config.clone(), metrics.clone());
                let reaper_token = token.clone();
                handles.push(tokio::spawn(async move { reaper.run(reaper_token).await }));
            } else {
                info!("reaper disabled by feature gate");
            }
        }
        Mode::Master => {
            if config.feature_gates.enabled("ClusterHealthEvaluator") {
                let evaluator = Evaluator::new(client.clone(), config.clone());
                let evaluator_token = token.clone();
                handles.push(tokio::spawn(async move { evaluator.run(evaluator_token).await }));
            } else {
                info!("cluster-health evaluator disabled by feature gate");
            }
        }
    }

    wait_for_shutdown_signal(token).await;

    for handle in handles {
        let _ = handle.await;
    }

    info!("kubediag shutdown complete");
    Ok(())
}

/// Waits for the first stop signal and begins a graceful shutdown; a second
/// signal forces an immediate process exit rather than waiting on workers
/// that may be stuck mid-dispatch.
async fn wait_for_shutdown_signal(token: CancellationToken) {
    let first = tokio::signal::ctrl_c();
    tokio::select! {
        _ = first => {
            info!("stop signal received, shutting down gracefully");
            token.cancel();
        }
    }

    let second = tokio::signal::ctrl_c();
    tokio::select! {
        _ = second => {
            info!("second stop signal received, forcing immediate exit");
            std::process::exit(1);
        }
        _ = tokio::time::sleep(std::time::Duration::from_secs(30)) => {
            info!("graceful shutdown window elapsed");
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,kubediag=debug,kube=info"));

    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_target(true))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .with(filter)
            .init();
    }
}
