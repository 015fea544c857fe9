mod cli;

use std::io::{self, Write};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use parking_lot::Mutex;
use tokio::sync::{broadcast::error::RecvError, mpsc};
use tracing::info;
use tracing_subscriber::EnvFilter;

use bundle_cart::api::{ApiClient, ApiConfig};
use bundle_cart::application::{
    BundlePlanner, Cart, CartStatusRegistry, DirectorySink, HttpTransport, Orchestrator,
    OrchestratorSettings, QueueEvent,
};
use bundle_cart::config::AppConfig;
use bundle_cart::domain::{CartCommand, DownloadCommand, FileData, TaskStatus, WorkflowState};
use bundle_cart::storage::{FileStorage, SharedStorage};

use cli::{Args, Command};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,hyper=warn,reqwest=warn"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let config = AppConfig::load(&args.config)?;
    let storage = SharedStorage::new(
        FileStorage::new(&config.storage_dir).context("Failed to open cart storage")?,
    );
    let cart_name = args
        .cart
        .clone()
        .unwrap_or_else(|| config.global_cart_id.clone());

    match args.command {
        Command::Add {
            res_id,
            file_path,
            url,
            size,
            select,
        } => {
            let mut cart = Cart::open(&cart_name, storage)?;
            let mut data = FileData::new(file_path, url);
            if let Some(size) = size {
                data = data.with_size(size);
            }
            let key = cart.add_file(&res_id, data, select, true)?;
            println!("Added {} to {}", key, cart_name);
        }
        Command::List => {
            let cart = Cart::open(&cart_name, storage)?;
            if cart.is_empty() {
                println!("Cart {} is empty", cart_name);
            }
            for item in cart.items() {
                println!(
                    "[{}] {:<40} {:<12} {}",
                    if item.is_selected { "x" } else { " " },
                    item.key(),
                    format!("{:?}", item.download_status).to_lowercase(),
                    item.download_url
                );
            }
        }
        Command::Select { res_id, file_path } => {
            let mut cart = Cart::open(&cart_name, storage)?;
            let selected = cart.select_matching(&res_id, file_path.as_deref().unwrap_or(""));
            cart.save()?;
            println!("Selected {} file(s)", selected);
        }
        Command::RemoveSelected => {
            let mut cart = Cart::open(&cart_name, storage)?;
            let removed = cart.apply(CartCommand::RemoveSelected)?;
            println!("Removed {} file(s)", removed);
        }
        Command::RemoveDownloaded => {
            let mut cart = Cart::open(&cart_name, storage)?;
            let removed = cart.apply(CartCommand::RemoveDownloaded)?;
            println!("Removed {} file(s)", removed);
        }
        Command::Status => {
            let registry = CartStatusRegistry::open(
                &config.cart_status_name,
                &config.global_cart_id,
                storage,
            )?;
            for entry in registry.entries() {
                println!(
                    "{:<20} {:<30} in use: {:<5} {:>5.1}%",
                    entry.item_id, entry.display_name, entry.is_in_use, entry.download_percentage
                );
            }
        }
        Command::Cleanup => {
            let mut registry = CartStatusRegistry::open(
                &config.cart_status_name,
                &config.global_cart_id,
                storage,
            )?;
            let removed = registry.cleanup()?;
            println!("Removed {} cart(s)", removed.len());
            for cart_id in removed {
                println!("  {}", cart_id);
            }
        }
        Command::Download { yes } => download(&config, storage, &cart_name, yes).await?,
    }

    Ok(())
}

async fn download(
    config: &AppConfig,
    storage: SharedStorage,
    cart_name: &str,
    yes: bool,
) -> Result<()> {
    let cart = Arc::new(Mutex::new(Cart::open(cart_name, storage.clone())?));
    let registry = Arc::new(Mutex::new(CartStatusRegistry::open(
        &config.cart_status_name,
        &config.global_cart_id,
        storage,
    )?));

    let client = ApiClient::new(ApiConfig {
        planner_url: config.planner_url.clone(),
        ..ApiConfig::default()
    });
    let mut orchestrator = Orchestrator::new(
        cart,
        registry,
        BundlePlanner::new(Arc::new(client.clone())),
        Arc::new(HttpTransport::new(
            client,
            Arc::new(DirectorySink::new(&config.download_dir)),
        )),
        OrchestratorSettings::from(config),
    )?;

    let confirmation = match orchestrator.request_plan().await {
        Ok(confirmation) => confirmation,
        Err(e) => {
            if let Some(diagnostics) = e.diagnostics() {
                eprintln!("{}", diagnostics);
            }
            orchestrator.close()?;
            return Err(e.into());
        }
    };

    println!(
        "{} bundle(s), {} file(s), {} bytes",
        confirmation.bundles, confirmation.files_count, confirmation.total_size
    );
    if let Some(warning) = &confirmation.warning {
        println!("Warning: {}", warning);
    }

    if !yes && !ask("Download now? [y/N] ")? {
        orchestrator.reject()?;
        orchestrator.close()?;
        println!("Download canceled");
        return Ok(());
    }

    let mut events = orchestrator.subscribe();
    orchestrator.confirm()?;

    let pb = ProgressBar::new(100);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{msg} {bar:40} {pos:>3}%")?
            .progress_chars("=>-"),
    );
    pb.set_message(confirmation.bundle_base_name.clone());

    let bar = pb.clone();
    let progress = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(QueueEvent::Progress { percent }) => bar.set_position(u64::from(percent)),
                Ok(QueueEvent::TaskFinished {
                    index,
                    status: TaskStatus::Error,
                    error,
                }) => bar.println(format!(
                    "bundle {} failed: {}",
                    index,
                    error.unwrap_or_default()
                )),
                Ok(_) => {}
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });

    let (tx, mut rx) = mpsc::unbounded_channel();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = tx.send(DownloadCommand::CancelAll);
        }
    });

    let state = orchestrator.run(&mut rx).await;
    ctrl_c.abort();
    progress.abort();

    match state {
        WorkflowState::Completed => {
            let all_downloaded = orchestrator
                .completion()
                .map(|c| c.all_downloaded)
                .unwrap_or(false);
            if all_downloaded {
                pb.finish_with_message("done");
            } else {
                pb.abandon_with_message("finished with errors");
                for failure in orchestrator.failures() {
                    println!("  {}", failure);
                }
                for name in orchestrator.leftover_bundles() {
                    println!("  not downloaded: {}", name);
                }
            }
        }
        _ => pb.abandon_with_message("canceled"),
    }
    info!("download workflow ended in {:?}", state);

    orchestrator.close()?;
    Ok(())
}

fn ask(prompt: &str) -> Result<bool> {
    print!("{}", prompt);
    io::stdout().flush()?;
    let mut answer = String::new();
    io::stdin().read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}
