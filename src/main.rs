//! Package Restore Tool
//!
//! Brings trashed packages back: the `request` operation marks packages for
//! restore and queues them, the `worker` operation consumes the queue.

// package-restore/src/main.rs
mod config;
mod errors;
mod models;
mod request;
mod restore;
mod store;

use anyhow::{Context, Result};
use config::{
    AppConfig, OperationConfig, load_request_config_from_json, load_worker_config_from_json,
    process_env,
};
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    init_tracing();

    match run_app().await {
        Ok(_) => {
            tracing::info!("operation completed successfully");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = ?e, "operation failed");
            eprintln!("Error: {:?}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() {
    let level = process_env("LOG_LEVEL").unwrap_or_else(|| "info".to_string());
    let (filter, invalid) = match EnvFilter::try_new(&level) {
        Ok(filter) => (filter, false),
        Err(_) => (EnvFilter::new("info"), true),
    };
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .with_current_span(true)
        .init();
    if invalid {
        tracing::warn!(level = %level, "invalid LOG_LEVEL, using info");
    }
}

async fn run_app() -> Result<()> {
    // config.json is optional; the environment can configure everything
    let config_path = PathBuf::from("config.json");
    let mut app_config = AppConfig::load_from_json(&config_path, &process_env).context(format!(
        "Failed to load application configuration from {}",
        config_path.display()
    ))?;

    let args: Vec<String> = env::args().collect();
    let choice = if args.len() > 1 {
        args[1].trim().to_string()
    } else {
        prompt_choice()?
    };

    match choice.as_str() {
        "1" | "worker" => {
            tracing::info!("starting restore worker");
            let worker_config =
                load_worker_config_from_json(&app_config.raw_json_config, &process_env)
                    .context("Failed to load worker configuration")?;
            app_config.operation = Some(OperationConfig::Worker(worker_config));
            restore::run_worker_flow(&app_config)
                .await
                .context("Restore worker failed")?;
        }
        "2" | "request" => {
            let request_config =
                load_request_config_from_json(&app_config.raw_json_config, &process_env)
                    .context("Failed to load request configuration")?;
            app_config.operation = Some(OperationConfig::Request(request_config));
            let request_args = args.get(2..).unwrap_or_default();
            request::run_request_flow(&app_config, request_args)
                .await
                .context("Restore request failed")?;
        }
        _ => {
            eprintln!("Invalid choice. Please enter '1' (worker) or '2' (request).");
            anyhow::bail!("Invalid operation choice");
        }
    }
    Ok(())
}

/// Prompts the user to select an operation.
fn prompt_choice() -> Result<String> {
    use std::io::{Write, stdin, stdout};

    println!("Select an operation:");
    println!("1. Run the restore worker (or type 'worker')");
    println!("2. Request a restore (or type 'request')");
    print!("Enter your choice: ");
    stdout().flush().context("Failed to flush stdout")?;

    let mut input = String::new();
    stdin()
        .read_line(&mut input)
        .context("Failed to read user input")?;
    Ok(input.trim().to_string())
}
