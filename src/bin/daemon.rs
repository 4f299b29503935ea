// Binary entry point for the standalone alarm daemon.

// File: ./src/bin/daemon.rs
use anyhow::Result;
use reveil::clock::{SystemClock, TokioTimer};
use reveil::config::Config;
use reveil::context::{AppContext, StandardContext};
use reveil::coordinator::{Coordinator, PLATFORM_SETUP_TIMEOUT_S};
use reveil::runner::LogRunner;
use simplelog::{ColorChoice, LevelFilter, TermLogger, TerminalMode};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    let mut args: Vec<String> = std::env::args().collect();
    let binary_name = args.first().cloned().unwrap_or_else(|| "reveild".to_string());

    // Parse for --root argument before creating the context
    let mut override_root: Option<PathBuf> = None;
    if let Some(pos) = args.iter().position(|arg| arg == "--root" || arg == "-r")
        && pos + 1 < args.len()
    {
        override_root = Some(PathBuf::from(args[pos + 1].clone()));
        args.remove(pos); // remove flag
        args.remove(pos); // remove value (which is now at the same index)
    }

    if args.len() > 1 && (args[1] == "--help" || args[1] == "-h" || args[1] == "help") {
        reveil::cli::print_help(&binary_name);
        return Ok(());
    }

    let ctx: Arc<dyn AppContext> = Arc::new(StandardContext::new(override_root));

    // Load the host config; write out a default one on first run.
    let config = match Config::load(ctx.as_ref()) {
        Ok(config) => config,
        Err(err) if Config::is_missing_config_error(&err) => {
            let config = Config::default();
            if let Err(save_err) = config.save(ctx.as_ref()) {
                eprintln!("Warning: could not write default config: {save_err}");
            }
            config
        }
        Err(err) => {
            eprintln!("Error loading config: {err}");
            std::process::exit(1);
        }
    };

    let level = config
        .log_level
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::Info);
    let _ = TermLogger::init(
        level,
        simplelog::Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    );

    let clock = Arc::new(SystemClock);
    let timer = Arc::new(TokioTimer::new(clock.clone()));
    let coordinator = Coordinator::new(
        Arc::clone(&ctx),
        clock,
        timer,
        Arc::new(LogRunner),
        config.defaults.clone(),
    );

    if args.len() > 1 && args[1] == "diagnostics" {
        let diagnostics = coordinator.diagnostics().await;
        println!("{}", serde_json::to_string_pretty(&diagnostics)?);
        return Ok(());
    }

    // The host contract gives setup a fixed budget.
    let startup = tokio::time::timeout(
        Duration::from_secs(PLATFORM_SETUP_TIMEOUT_S),
        coordinator.start(),
    )
    .await;
    match startup {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            log::error!("Coordinator failed to start: {err}");
            std::process::exit(1);
        }
        Err(_) => {
            log::error!("Coordinator start exceeded {PLATFORM_SETUP_TIMEOUT_S}s, stopping");
            coordinator.stop().await;
            std::process::exit(1);
        }
    }

    // Mirror lifecycle events into the log until shutdown.
    let mut events = coordinator.subscribe_events();
    let event_task = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match serde_json::to_string(&event) {
                Ok(json) => log::info!("event: {json}"),
                Err(err) => log::warn!("unserializable event: {err}"),
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    log::info!("Shutting down");
    coordinator.stop().await;
    event_task.abort();
    Ok(())
}
