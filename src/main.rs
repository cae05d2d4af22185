use clap::{Parser, Subcommand};
use nfdispatch::config;
use nfdispatch::dict::Dictionary;
use nfdispatch::dispatch::{DispatchEngine, DispatchSettings};
use nfdispatch::kernel::PlaybackDriver;
use nfdispatch::telemetry::{init_logging, MetricsRegistry};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "nfdispatch")]
#[command(about = "Per-packet plugin dispatch engine for netfilter queue traffic")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Run the dispatch daemon
    Run {
        /// Path to config.lock file
        #[arg(short, long, default_value = "config.lock")]
        config: PathBuf,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Generate config.lock from config.toml
    Generate {
        /// Path to config.toml
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,

        /// Output path for config.lock
        #[arg(short, long, default_value = "config.lock")]
        output: PathBuf,
    },
    /// Validate config.toml without generating lock file
    Validate {
        /// Path to config.toml
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Config { action }) => {
            init_logging(None);
            match action {
                ConfigAction::Generate {
                    config: config_path,
                    output,
                } => {
                    if let Err(e) = cmd_config_generate(&config_path, &output) {
                        eprintln!("[ERROR] {}", e);
                        std::process::exit(1);
                    }
                }
                ConfigAction::Validate {
                    config: config_path,
                } => {
                    if let Err(e) = cmd_config_validate(&config_path) {
                        eprintln!("[ERROR] {}", e);
                        std::process::exit(1);
                    }
                }
            }
        }
        Some(Commands::Run { config: lock_path }) => {
            if let Err(e) = cmd_run(&lock_path) {
                eprintln!("[ERROR] {}", e);
                std::process::exit(1);
            }
        }
        None => {
            // Default: run with config.lock
            if let Err(e) = cmd_run(&PathBuf::from("config.lock")) {
                eprintln!("[ERROR] {}", e);
                std::process::exit(1);
            }
        }
    }
}

fn cmd_config_generate(config_path: &PathBuf, output: &PathBuf) -> Result<(), String> {
    let source_content = std::fs::read_to_string(config_path)
        .map_err(|e| format!("Failed to read {}: {}", config_path.display(), e))?;
    let parsed = config::load(config_path).map_err(|e| e.to_string())?;

    let result = config::validate(&parsed);
    result.print_diagnostics();
    if result.has_errors() {
        return Err("configuration has errors, lock file not generated".to_string());
    }

    let lock = config::generate_lock(&parsed, &source_content);
    let serialized = toml::to_string(&lock).map_err(|e| e.to_string())?;
    let content = format!(
        "# Generated by nfdispatch - DO NOT EDIT\n# Source: {} (sha256: {})\n\n{}",
        config_path.display(),
        lock.source_hash,
        serialized
    );
    std::fs::write(output, content)
        .map_err(|e| format!("Failed to write {}: {}", output.display(), e))?;

    println!("Generated {}", output.display());
    Ok(())
}

fn cmd_config_validate(config_path: &PathBuf) -> Result<(), String> {
    let parsed = config::load(config_path).map_err(|e| e.to_string())?;

    let result = config::validate(&parsed);
    result.print_diagnostics();
    if result.has_errors() {
        return Err("configuration has errors".to_string());
    }

    println!("{} is valid", config_path.display());
    Ok(())
}

fn cmd_run(lock_path: &PathBuf) -> Result<(), String> {
    use tokio::runtime::Runtime;

    let lock = config::load_lock(lock_path)
        .map_err(|e| format!("Failed to load {}: {}", lock_path.display(), e))?;
    init_logging(Some(&lock.logging));

    let rt = Runtime::new().map_err(|e| format!("Failed to create runtime: {}", e))?;

    rt.block_on(async move {
        let dict = Arc::new(Dictionary::new());
        let metrics = Arc::new(MetricsRegistry::new());
        let engine = Arc::new(DispatchEngine::new(
            DispatchSettings::from(&lock.dispatch),
            dict,
            metrics.clone(),
        ));

        engine.startup();
        info!("dispatch engine started");

        if let Some(ref playback) = lock.playback {
            let driver = PlaybackDriver::new(engine.clone());
            match engine
                .handle_warehouse_playback(&driver, &playback.file)
                .await
            {
                Ok(()) => {
                    info!(
                        "playback applied {} verdicts, {} sessions live",
                        driver.verdicts().len(),
                        engine.session_count()
                    );
                    if playback.cleanup {
                        engine.handle_warehouse_cleanup();
                    }
                }
                Err(e) => {
                    error!("playback of {} failed: {}", playback.file.display(), e);
                }
            }
        } else {
            warn!("no playback configured and no kernel driver attached; idling");
        }

        info!("running until SIGINT");
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to wait for shutdown signal: {}", e);
        }

        info!(
            "shutting down: {} packets dispatched, {} sessions created",
            metrics.packets_dispatched.get(),
            metrics.sessions_created.get()
        );
        if let Err(e) = engine.shutdown().await {
            error!("shutdown error: {}", e);
        }

        Ok(())
    })
}
