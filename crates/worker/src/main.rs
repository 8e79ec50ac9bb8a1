//! `comfyrun-worker` -- runs one workflow against a managed ComfyUI server.
//!
//! Prepares the service (checkout, custom nodes, models), submits the
//! workflow, waits for it and prints the harvested outputs as JSON on
//! stdout. Ctrl-C interrupts the running generation and lets cleanup run.
//!
//! # Environment variables
//!
//! | Variable        | Required | Default | Description                                   |
//! |-----------------|----------|---------|-----------------------------------------------|
//! | `WORKFLOW`      | yes*     | --      | API-format workflow: a file path or inline JSON |
//! | `RUN_OPTIONS`   | no       | `{}`    | JSON run options (files, extra models, ...)   |
//!
//! \* The first command-line argument takes precedence over `WORKFLOW`.
//!
//! Service settings (`COMFY_*`) are documented on `RunnerConfig::from_env`.

use anyhow::Context;
use comfyrun_pipeline::{ExecutionPipeline, RunOptions, RunnerConfig};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "comfyrun_worker=info,comfyrun_pipeline=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let workflow = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("WORKFLOW").ok())
        .context("WORKFLOW environment variable or argument is required")?;

    let options: RunOptions = match std::env::var("RUN_OPTIONS") {
        Ok(raw) => serde_json::from_str(&raw).context("RUN_OPTIONS is not valid JSON")?,
        Err(_) => RunOptions::default(),
    };

    let config = RunnerConfig::from_env()?;
    tracing::info!(
        base_path = %config.base_path.display(),
        port = config.port,
        "Starting comfyrun-worker",
    );

    let pipeline = ExecutionPipeline::from_config(config).await?;

    let mut events = pipeline.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => tracing::info!(event = ?event, "Runner event"),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event log fell behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let run = pipeline.run(&workflow, &options);
    tokio::pin!(run);

    let result = tokio::select! {
        result = &mut run => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("Interrupt received, cancelling generation");
            pipeline.cancel(options.client_id.as_deref()).await;
            pipeline.shutdown_token().cancel();
            run.await
        }
    };

    tracing::debug!(state = ?pipeline.service_state(), "Run finished");

    match result {
        Some(result) => {
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        None => {
            tracing::error!("Run aborted before execution");
            std::process::exit(1);
        }
    }
}
