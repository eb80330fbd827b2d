use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tokio::sync::broadcast::error::RecvError;

use zapret_supervisor::backends::process::create_process_table_with;
use zapret_supervisor::catalog::{Catalog, EntryKind};
use zapret_supervisor::config::{FileSettings, SettingsStore, SupervisorTimings};
use zapret_supervisor::drift::DriftDetector;
use zapret_supervisor::filters::{FilterFiles, IpsetMode};
use zapret_supervisor::launch::{ResourceLayout, materialize};
use zapret_supervisor::monitor::ProcessMonitor;
use zapret_supervisor::plan::LaunchPlanBuilder;
use zapret_supervisor::script::render_script;
use zapret_supervisor::{Supervisor, SupervisorEvent};

/// zapret-supervisor - strategy launcher and watchdog for winws
#[derive(Parser, Debug)]
#[command(name = "zapret-supervisor")]
#[command(version)]
#[command(about = "Launch, watch and restart winws strategies", long_about = None)]
struct Args {
    /// winws folder holding the strategies, bin/ and lists/
    #[arg(long, global = true, value_name = "DIR")]
    root: Option<PathBuf>,

    /// Settings file (default: <config dir>/zapret-supervisor/settings.json)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Process backend to use (procfs, sysinfo)
    #[arg(long, global = true, value_name = "BACKEND")]
    process_backend: Option<String>,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// List available strategies
    List,
    /// Print a strategy definition and its launch command
    Show { id: String },
    /// Print the batch launcher for a strategy
    Render {
        id: String,
        /// Write <id>.bat into the strategy folder instead of printing
        #[arg(long)]
        write: bool,
    },
    /// Delete a strategy's files
    Delete { id: String },
    /// Show whether winws is running and which strategy it looks like
    Status,
    /// Terminate every running winws instance
    Stop,
    /// Supervise winws until Ctrl+C, optionally starting a strategy first
    Run { id: Option<String> },
    /// Turn the game filter on or off
    GameFilter {
        #[arg(value_enum)]
        state: Toggle,
    },
    /// Switch the ipset list mode
    Ipset {
        #[arg(value_enum)]
        mode: IpsetMode,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Toggle {
    On,
    Off,
}

fn open_settings(args: &Args) -> Result<FileSettings> {
    match &args.config {
        Some(path) => FileSettings::open(path.clone()),
        None => FileSettings::open_default(),
    }
}

fn print_strategies(catalog: &Catalog) -> Result<()> {
    let entries = catalog.list()?;
    if entries.is_empty() {
        println!("No strategies in {:?}", catalog.root());
        return Ok(());
    }
    for entry in entries {
        let kind = match entry.kind {
            EntryKind::Json => "json",
            EntryKind::Script => "script",
        };
        println!("  {:40} [{}]", entry.id, kind);
    }
    Ok(())
}

fn show_strategy(
    catalog: &Catalog,
    layout: &ResourceLayout,
    builder: &LaunchPlanBuilder,
    game_filter: bool,
    id: &str,
) -> Result<()> {
    let def = catalog.resolve(id)?;
    let plan = builder.build(&def.rules, def.use_game_filter && game_filter);
    let spec = materialize(&def, &plan, layout);

    println!("{}", serde_json::to_string_pretty(&def)?);
    println!();
    println!("Executable: {:?}", spec.executable_path);
    println!("Working dir: {:?}", spec.working_dir);
    println!("Arguments:");
    for arg in &spec.argv {
        println!("  {}", arg);
    }
    Ok(())
}

fn print_status(
    monitor: &ProcessMonitor,
    detector: &DriftDetector,
    layout: &ResourceLayout,
) -> Result<()> {
    let Some(entry) = monitor.find_first(&layout.executable_name) else {
        println!("{} is not running", layout.executable_name);
        return Ok(());
    };

    println!("{} is running (PID {})", entry.name, entry.pid);
    if let Some(exe) = &entry.exe {
        println!("  Executable:  {:?}", exe);
    }
    if let Some(cwd) = &entry.cwd {
        println!("  Working dir: {:?}", cwd);
    }
    match detector.detect(&entry.argv) {
        Some(found) => println!(
            "  Strategy:    {} ({:.0}% match)",
            found.id,
            found.confidence * 100.0
        ),
        None => println!("  Strategy:    external (no catalog match)"),
    }
    Ok(())
}

fn report_event(event: &SupervisorEvent) {
    match event {
        SupervisorEvent::StatusChanged(status) => println!("Status: {}", status),
        SupervisorEvent::StartRejected { id, error } => {
            println!("Could not start '{}': {}", id, error)
        }
        SupervisorEvent::LaunchFailed { error, .. } => println!("Launch failed: {}", error),
        SupervisorEvent::TerminationFailed(error) => println!("Stop incomplete: {}", error),
    }
}

/// Run the supervisor until Ctrl+C
async fn run_supervisor(
    args: &Args,
    store: FileSettings,
    layout: ResourceLayout,
    id: Option<String>,
) -> Result<()> {
    use tokio::signal;

    let settings = store.current().clone();
    let autostart = match id {
        Some(_) => None,
        None if settings.auto_start_last_strategy => Some(settings.last_strategy_id.clone()),
        None => None,
    };

    let table = create_process_table_with(args.process_backend.as_deref());
    let supervisor = Supervisor::new(table, layout, Box::new(store))
        .with_timings(SupervisorTimings::default())
        .with_autostart(autostart);
    let mut events = supervisor.subscribe();
    let (handle, task) = supervisor.spawn();

    println!("Supervising winws. Press Ctrl+C to exit...");

    if let Some(id) = id {
        if let Err(e) = handle.start(&id).await {
            handle.shutdown().await?;
            task.await?;
            return Err(e).context(format!("Failed to start strategy '{}'", id));
        }
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => report_event(&event),
                Err(RecvError::Lagged(skipped)) => {
                    log::warn!("Missed {} supervisor notifications", skipped);
                }
                Err(RecvError::Closed) => break,
            },
            _ = signal::ctrl_c() => {
                println!("\nReceived Ctrl+C, shutting down...");
                handle.shutdown().await?;
                break;
            }
        }
    }

    task.await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if std::env::var("RUST_LOG").is_ok() {
        pretty_env_logger::formatted_builder()
            .parse_default_env()
            .init();
    }

    let mut store = open_settings(&args)?;
    let layout = store.current().layout(args.root.as_deref());
    let catalog = Catalog::new(&layout);
    let builder = LaunchPlanBuilder::new();
    let game_filter = store.current().game_filter_enabled;
    log::debug!("winws root: {:?}", layout.root);

    match &args.command {
        Cmd::List => print_strategies(&catalog)?,
        Cmd::Show { id } => show_strategy(&catalog, &layout, &builder, game_filter, id)?,
        Cmd::Render { id, write } => {
            let def = catalog.resolve(id)?;
            let plan = builder.build(&def.rules, def.use_game_filter);
            if *write {
                let path = catalog.write_script(&def, &plan)?;
                println!("Wrote {:?}", path);
            } else {
                print!("{}", render_script(&def, &plan, &layout.executable_name));
            }
        }
        Cmd::Delete { id } => {
            if !catalog.delete(id)? {
                bail!("No strategy named '{}'", id);
            }
            println!("Deleted '{}'", id);
        }
        Cmd::Status => {
            let monitor = ProcessMonitor::new(create_process_table_with(
                args.process_backend.as_deref(),
            ));
            let detector =
                DriftDetector::new(catalog.clone(), layout.clone(), builder.clone(), game_filter);
            print_status(&monitor, &detector, &layout)?;
        }
        Cmd::Stop => {
            let monitor = ProcessMonitor::new(create_process_table_with(
                args.process_backend.as_deref(),
            ));
            let grace = SupervisorTimings::default().termination_grace;
            if !monitor.is_running(&layout.executable_name) {
                println!("{} is not running", layout.executable_name);
            } else {
                monitor.terminate_all(&layout.executable_name, grace)?;
                println!("Stopped {}", layout.executable_name);
            }
        }
        Cmd::Run { id } => {
            run_supervisor(&args, store, layout, id.clone()).await?;
        }
        Cmd::GameFilter { state } => {
            let enabled = matches!(state, Toggle::On);
            FilterFiles::new(&layout).set_game_filter(enabled)?;
            store.settings_mut().game_filter_enabled = enabled;
            store.save()?;
            println!("Game filter {}", if enabled { "enabled" } else { "disabled" });
            println!("Restart the running strategy for the change to take effect");
        }
        Cmd::Ipset { mode } => {
            FilterFiles::new(&layout).set_ipset_mode(*mode)?;
            store.settings_mut().ipset_mode = *mode;
            store.save()?;
            println!("IPSet mode set to {}", mode);
        }
    }

    Ok(())
}
