mod cli;

use anyhow::{bail, Context, Result};
use clap::Parser;
use cli::{Cli, Commands};
use phantom::app::{AppOptions, Application};
use phantom::config::{ListenerSpec, PhantomStore};
use phantom::helper;
use phantom::logging;
use phantom::paths::{BuildMode, Paths};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mode = if cli.dev {
        BuildMode::Dev
    } else {
        BuildMode::current()
    };
    let paths = match &cli.config_dir {
        Some(dir) => Paths::from_arg(dir)?,
        None => Paths::for_mode(mode)?,
    };

    match cli.command {
        Commands::Run => run(paths, mode, cli.verbose).await,
        Commands::List => list(&paths),
        Commands::Add {
            listen,
            hostname,
            label,
            insecure,
            tcp,
        } => add(
            &paths,
            ListenerSpec {
                label,
                listen,
                hostname,
                insecure,
                use_tcp: tcp,
            },
        ),
        Commands::Remove { index } => remove(&paths, index),
        Commands::Relabel { index, label } => relabel(&paths, index, label),
        Commands::Paths => {
            println!("{}", serde_json::to_string_pretty(&helper::file_paths(&paths))?);
            Ok(())
        }
        Commands::CheckTarget { target } => {
            let parsed = helper::parse_target(&target);
            helper::validate_target(&target).map_err(anyhow::Error::msg)?;
            println!("{} -> {}", parsed.protocol, parsed.destination);
            Ok(())
        }
    }
}

async fn run(paths: Paths, mode: BuildMode, verbose: u8) -> Result<()> {
    paths.ensure_config_dir()?;
    paths.ensure_log_dir()?;
    logging::init(&paths, mode, verbose)?;

    info!("Phantom v{}", env!("CARGO_PKG_VERSION"));

    let app = Application::startup(paths, AppOptions::default())?;
    let mut events = app.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            info!(event = %event, "event");
        }
    });

    app.on_ready().await;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Received Ctrl-C, shutting down");

    app.on_shutdown().await;
    printer.abort();
    Ok(())
}

fn open_store(paths: &Paths) -> Result<PhantomStore> {
    paths.ensure_config_dir()?;
    PhantomStore::open(&paths.phantom_config)
}

fn list(paths: &Paths) -> Result<()> {
    let store = open_store(paths)?;
    let config = store.config();
    if config.listeners.is_empty() {
        println!("No listeners configured");
    }
    for (index, spec) in config.listeners.iter().enumerate() {
        println!(
            "[{}] {:<20} {} -> {} ({}{})",
            index,
            spec.label,
            spec.listen,
            spec.hostname,
            if spec.use_tcp { "tls" } else { "quic" },
            if spec.insecure { ", insecure" } else { "" },
        );
    }
    Ok(())
}

fn add(paths: &Paths, spec: ListenerSpec) -> Result<()> {
    let mut store = open_store(paths)?;
    if store.config().position(&spec.listen).is_some() {
        bail!("Listener with address {} already exists", spec.listen);
    }
    store.config_mut().listeners.push(spec);
    store.persist()?;
    println!("Listener added");
    Ok(())
}

fn remove(paths: &Paths, index: usize) -> Result<()> {
    let mut store = open_store(paths)?;
    let len = store.config().listeners.len();
    if index >= len {
        bail!("Index {} out of bound (length {})", index, len);
    }
    let removed = store.config_mut().listeners.remove(index);
    store.persist()?;
    println!("Removed {}", removed.listen);
    Ok(())
}

fn relabel(paths: &Paths, index: usize, label: String) -> Result<()> {
    let mut store = open_store(paths)?;
    let len = store.config().listeners.len();
    let spec = store
        .config_mut()
        .listeners
        .get_mut(index)
        .with_context(|| format!("Index {} out of bound (length {})", index, len))?;
    spec.label = label;
    store.persist()?;
    println!("Listener relabeled");
    Ok(())
}
