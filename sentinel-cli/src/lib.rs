mod adapters;
mod cli;
mod event_printer;

use std::io::IsTerminal;
use std::sync::Arc;
use std::time::Duration;

pub use cli::Cli;
use cli::MasterModeArg;
use sentinel_core::CycleEngine;
use sentinel_core::CycleEngineConfig;
use sentinel_core::EventMsg;
use sentinel_core::approval::ApprovalGate;
use sentinel_core::approval::GateConfig;
use sentinel_core::config::Config;
use sentinel_core::reflection::NullReflectionSink;
use sentinel_core::reflection::ReflectionSink;
use sentinel_core::vfs::InMemoryVfs;
use tokio::io::AsyncBufReadExt;
use tokio::io::BufReader;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

use adapters::ShellVerifier;
use adapters::StaticCurator;
use adapters::StaticGenerator;
use adapters::read_patch_source;
use adapters::seed_vfs_from_dir;
use event_printer::EventPrinter;

pub async fn run_main(cli: Cli) -> anyhow::Result<i32> {
    let with_ansi = match cli.color {
        cli::Color::Always => true,
        cli::Color::Never => false,
        cli::Color::Auto => std::io::stdout().is_terminal(),
    };

    let default_level = "info";
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(default_level))?,
        )
        .with_ansi(with_ansi)
        .with_writer(std::io::stderr)
        .try_init();

    let mut config = match &cli.config {
        Some(path) => Config::load_file(path)?,
        None => Config::defaults(),
    };
    config = config.apply_env_overrides()?;
    config.gate.master_mode = cli.master_mode.into();

    let events = sentinel_core::EventBus::default();
    let gate_config = GateConfig {
        master_mode: config.gate.master_mode,
        module_overrides: config.gate.module_overrides.clone(),
        ..Default::default()
    };
    let gate = Arc::new(ApprovalGate::new(gate_config, events.clone()));

    let vfs = Arc::new(InMemoryVfs::new());
    let discovered = seed_vfs_from_dir(&vfs, &cli.root)?;
    let curated_paths = if cli.curated_paths.is_empty() {
        discovered
    } else {
        cli.curated_paths.clone()
    };
    if curated_paths.is_empty() {
        anyhow::bail!("no files discovered under {} to curate", cli.root.display());
    }

    let patch_bundle = read_patch_source(&cli.patch)?;

    let reflection: Arc<dyn ReflectionSink> = match &cli.reflection_log {
        Some(path) => Arc::new(adapters::JsonlReflectionSink::new(path.clone())),
        None => Arc::new(NullReflectionSink),
    };

    let verifier = Arc::new(ShellVerifier {
        command: cli.verify_cmd.clone(),
        timeout: Duration::from_millis(config.verifier.timeout_ms),
    });

    let engine = Arc::new(CycleEngine::new(CycleEngineConfig {
        vfs: vfs.clone(),
        verifier,
        reflection,
        curator: Arc::new(StaticCurator(curated_paths)),
        generator: Arc::new(StaticGenerator(patch_bundle)),
        gate,
        events: events.clone(),
        config,
        author: std::env::var("USER").unwrap_or_else(|_| "sentinel-cli".to_string()),
    }));

    {
        let engine = engine.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            eprintln!("\ninterrupted, cancelling cycle...");
            engine.cancel_cycle();
        });
    }

    let interactive = matches!(cli.master_mode, MasterModeArg::Hitl);
    let rx = engine.events().subscribe();
    let exit_handle = drive_events(engine.clone(), rx, with_ansi, interactive);

    engine.start_cycle(cli.goal.clone())?;

    Ok(exit_handle.await?)
}

fn drive_events(
    engine: Arc<CycleEngine>,
    mut rx: broadcast::Receiver<sentinel_core::Event>,
    with_ansi: bool,
    interactive: bool,
) -> tokio::task::JoinHandle<i32> {
    tokio::spawn(async move {
        let printer = EventPrinter::new(with_ansi);
        let mut stdin = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match rx.recv().await {
                Ok(event) => {
                    printer.print(&event);
                    match &event.msg {
                        EventMsg::ApprovalPending { .. } if interactive => {
                            prompt_for_decision(&engine, &mut stdin).await;
                        }
                        EventMsg::ApprovalPending { approval_id, .. } => {
                            // Non-interactive HITL run (e.g. scripted master
                            // mode with a per-module override): approve
                            // automatically rather than hang forever.
                            let _ = engine.approve_current(None);
                            tracing::debug!(%approval_id, "auto-approved in non-interactive mode");
                        }
                        EventMsg::CycleDone { .. } => return 0,
                        EventMsg::CycleFailed { .. } => return 1,
                        EventMsg::CycleCancelled { .. } => return 130,
                        _ => {}
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("event stream lagged, dropped {n} events");
                }
                Err(broadcast::error::RecvError::Closed) => return 1,
            }
        }
    })
}

async fn prompt_for_decision(
    engine: &Arc<CycleEngine>,
    stdin: &mut tokio::io::Lines<BufReader<tokio::io::Stdin>>,
) {
    loop {
        eprint!("> ");
        let line = match stdin.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) | Err(_) => {
                engine.cancel_cycle();
                return;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "approve" || line == "a" {
            let _ = engine.approve_current(None);
            return;
        }
        if line == "cancel" || line == "c" {
            engine.cancel_cycle();
            return;
        }
        if let Some(reason) = line.strip_prefix("reject ").or_else(|| line.strip_prefix("r ")) {
            let _ = engine.revise_current(reason.to_string());
            return;
        }
        eprintln!("unrecognised input; type `approve`, `reject <reason>`, or `cancel`");
    }
}
