mod cli;

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use cli::{Cli, Command};
use workpoll::config::WorkpollConfig;
use workpoll::definition::{self, WorkflowDef};
use workpoll::instance::{self, StartRequest};
use workpoll::model::{Action, InstanceState, Transition, Workflow, WorkflowState};
use workpoll::store::{InstanceStore, MemoryStore, WorkflowStore};
use workpoll::ui::{self, CycleProgress};
use workpoll::{JobKind, JobManager, workflow};

fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = WorkpollConfig::load().context("failed to load workpoll.toml")?;
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(path) = cli.state_file {
        config.state_file = path;
    }
    config.debug |= cli.debug;
    init_tracing(if cli.verbose { "debug" } else { &config.log_level });

    match cli.command {
        Command::Load { file } => {
            let def = WorkflowDef::from_path(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let mut store = MemoryStore::load(&config.state_file)?;
            let manager = JobManager::default();
            let wf = definition::import(&mut store, def, manager.registry())?;
            store.save(&config.state_file)?;
            println!("Loaded workflow `{}` ({}) in state {}", wf.name, wf.id, wf.state);
        }
        Command::Publish { workflow } => {
            set_state(&config.state_file, &workflow, WorkflowState::Published)?
        }
        Command::Deprecate { workflow } => {
            set_state(&config.state_file, &workflow, WorkflowState::Deprecated)?
        }
        Command::Draft { workflow } => {
            set_state(&config.state_file, &workflow, WorkflowState::Draft)?
        }
        Command::Start {
            workflow,
            payload,
            runner_host,
        } => {
            let mut store = MemoryStore::load(&config.state_file)?;
            let wf = workflow::find_workflow(&store, &workflow)?;
            let request = StartRequest {
                payload,
                debug: config.debug,
                runner_host,
            };
            let (inst, item) = instance::run_workflow(&mut store, wf.id, request, Utc::now())?;
            store.save(&config.state_file)?;
            println!("Started {}", inst.display_name(&wf.name));
            println!("  first workitem {} is {}", item.id, item.state);
        }
        Command::Manage { once, interval } => {
            let every = interval.unwrap_or(config.poll_interval_secs).max(1);
            manage(&config, once, Duration::from_secs(every)).await?;
        }
        Command::Status => {
            let store = MemoryStore::load(&config.state_file)?;
            ui::print_status(&store)?;
        }
        Command::Demo => demo(&config)?,
    }

    Ok(())
}

fn set_state(state_file: &Path, key: &str, state: WorkflowState) -> Result<()> {
    let mut store = MemoryStore::load(state_file)?;
    let wf = workflow::find_workflow(&store, key)?;
    let wf = workflow::set_state(&mut store, wf.id, state)?;
    let open = workflow::open_counts(&store, wf.id)?;
    store.save(state_file)?;
    println!("Workflow `{}` is now {}", wf.name, wf.state);
    if state != WorkflowState::Published && open.instances > 0 {
        println!(
            "  {} running instance(s) and {} open workitem(s) keep running",
            open.instances, open.workitems
        );
    }
    Ok(())
}

/// Runs manage cycles on a fixed interval until Ctrl-C, or once.
///
/// The store is reloaded before every cycle so other commands can change
/// the state file in between, and saved only when the cycle succeeds.
async fn manage(config: &WorkpollConfig, once: bool, every: Duration) -> Result<()> {
    let manager = JobManager::default();
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    info!(host = %config.host, every_secs = every.as_secs(), "manage loop started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, stopping manage loop");
                return Ok(());
            }
        }

        let mut store = MemoryStore::load(&config.state_file)?;
        let progress = CycleProgress::start(&config.host);
        match manager.manage_jobs(&mut store, &config.host, config.debug) {
            Ok(report) => {
                store.save(&config.state_file)?;
                progress.finish(&report);
            }
            Err(e) if once => {
                progress.fail(&e);
                return Err(e.into());
            }
            Err(e) => {
                progress.fail(&e);
                error!(error = %e, "cycle aborted, state left unchanged");
            }
        }

        if once {
            return Ok(());
        }
    }
}

/// Two routers joined by one automatic transition, driven to completion.
fn demo(config: &WorkpollConfig) -> Result<()> {
    let mut store = MemoryStore::new();
    let mut wf = Workflow::new("demo");
    wf.state = WorkflowState::Published;
    store.insert_workflow(wf.clone())?;

    let mut first = Action::new(wf.id, "A", JobKind::Router);
    first.start = true;
    let second = Action::new(wf.id, "B", JobKind::Router);
    workflow::add_action(&mut store, first.clone())?;
    workflow::add_action(&mut store, second.clone())?;
    workflow::add_transition(&mut store, Transition::new(first.id, second.id))?;

    let request = StartRequest {
        payload: Some(r#"{"greeting": "hello"}"#.to_string()),
        debug: config.debug,
        runner_host: None,
    };
    let (inst, _) = instance::run_workflow(&mut store, wf.id, request, Utc::now())?;
    println!("Started {}", inst.display_name(&wf.name));

    let manager = JobManager::default();
    for cycle in 1..=10 {
        println!("Cycle {cycle}");
        let progress = CycleProgress::start(&config.host);
        let report = manager.manage_jobs(&mut store, &config.host, config.debug)?;
        progress.finish(&report);
        if store.instance(inst.id)?.state == InstanceState::Done {
            break;
        }
    }
    println!();
    ui::print_status(&store)?;
    Ok(())
}
