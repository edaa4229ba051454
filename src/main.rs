mod cli;
mod input;

use anyhow::{Context, Result, bail};
use clap::Parser;
use cli::{CliArgs, Command, CreateArgs, ExecArgs, LogsArgs};
use crossterm::event::{Event, EventStream, KeyEventKind};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use dockhand::commands::CommandExecutor;
use dockhand::config::{Overrides, RuntimeConfig};
use dockhand::create::ContainerConfig;
use dockhand::decoder::LogFraming;
use dockhand::engine::{EngineGateway, LogOptions};
use dockhand::error::ErrorKind;
use dockhand::model::{ResourceClass, format_bytes, human_age};
use dockhand::stats::StatsTracker;
use dockhand::store::{Collection, ResourceStore, StoreState};
use dockhand::stream::{ErrorCallback, StreamHandle};
use dockhand::terminal::{EventCallback, SessionState, TerminalEvent, TerminalMode, TerminalSessionManager};
use dockhand::transport::HttpTransport;
use dockhand::usage::UsageSampler;
use futures::StreamExt;
use input::{Action, map_key};
use std::io::Write;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();
    init_tracing(&args.log_filter)?;

    let overrides = Overrides {
        endpoint: args.endpoint.clone(),
        timeout_ms: args.timeout_ms,
        refresh_ms: args.refresh_ms,
    };
    let config = RuntimeConfig::load(&overrides)?;
    match &config.source {
        Some(source) => debug!("config loaded from {source}"),
        None => debug!("no config file found, using defaults"),
    }
    info!("engine endpoint {}", config.endpoint);

    let transport = Arc::new(HttpTransport::new(config.endpoint.clone(), config.timeout));
    let store = ResourceStore::new(EngineGateway::new(transport));

    let result = run(args.command, &config, &store).await;
    if let Err(error) = &result
        && let Some(hint) = error
            .chain()
            .find_map(|cause| cause.downcast_ref::<ErrorKind>())
            .and_then(ErrorKind::hint)
    {
        eprintln!("{hint}");
    }
    result
}

fn init_tracing(level_filter: &str) -> Result<()> {
    let filter = EnvFilter::try_new(level_filter)
        .or_else(|_| EnvFilter::try_new("info"))
        .context("failed to initialize tracing filter")?;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .with_writer(std::io::stderr)
        .try_init();

    Ok(())
}

async fn run(command: Command, config: &RuntimeConfig, store: &Arc<ResourceStore>) -> Result<()> {
    let executor = CommandExecutor::new(Arc::clone(store));
    let stop_secs = config.stop_timeout_secs;

    match command {
        Command::Ps { all, filter } => {
            let state = load_class(store, ResourceClass::Containers).await?;
            print_collection(
                state.filter(ResourceClass::Containers, filter.as_deref().unwrap_or_default()),
                all,
            );
        }
        Command::Images { filter } => list(store, ResourceClass::Images, filter).await?,
        Command::Volumes { filter } => list(store, ResourceClass::Volumes, filter).await?,
        Command::Networks { filter } => list(store, ResourceClass::Networks, filter).await?,
        Command::Info => print_info(store).await?,
        Command::Logs(args) => logs(store.gateway(), args).await?,
        Command::Stats { id } => stats(store.gateway(), &id).await?,
        Command::Start { id } => {
            executor.start(&id).await?;
            println!("{id}");
        }
        Command::Stop { id, time } => {
            executor.stop(&id, time.unwrap_or(stop_secs)).await?;
            println!("{id}");
        }
        Command::Restart { id, time } => {
            executor.restart(&id, time.unwrap_or(stop_secs)).await?;
            println!("{id}");
        }
        Command::Pause { id } => {
            executor.pause(&id).await?;
            println!("{id}");
        }
        Command::Unpause { id } => {
            executor.unpause(&id).await?;
            println!("{id}");
        }
        Command::Rm { id, force, volumes } => {
            executor.remove(&id, force, volumes).await?;
            println!("{id}");
        }
        Command::Rename { id, name } => {
            executor.rename(&id, &name).await?;
            println!("{id} -> {name}");
        }
        Command::Commit { id, repo, tag } => {
            let created = executor
                .commit(&id, repo.as_deref(), tag.as_deref())
                .await?;
            println!("{}", created.id);
        }
        Command::Rmi { id, force } => {
            executor.remove_image(&id, force).await?;
            println!("{id}");
        }
        Command::Create(args) => {
            let created = match create_config(&args)? {
                Some(config) => executor.create_with_config(&config).await?,
                None => executor.create(&required_image(&args)?, args.name.as_deref()).await?,
            };
            print_created(&created.id, &created.warnings);
        }
        Command::Run(args) => {
            let created = match create_config(&args)? {
                Some(config) => executor.run_with_config(&config).await?,
                None => {
                    executor
                        .run_image(&required_image(&args)?, args.name.as_deref())
                        .await?
                }
            };
            print_created(&created.id, &created.warnings);
        }
        Command::Copy { id, name } => {
            let created = executor.copy(&id, name.as_deref()).await?;
            print_created(&created.id, &created.warnings);
        }
        Command::Exec(args) => exec(store.gateway(), config, args).await?,
        Command::Watch => watch(store, config).await?,
    }
    Ok(())
}

async fn load_class(store: &ResourceStore, class: ResourceClass) -> Result<StoreState> {
    store.refresh(class).await;
    let state = store.snapshot();
    if let Some(error) = &state.class_state(class).last_error {
        return Err(error.clone())
            .with_context(|| format!("failed to list {}", class.title().to_lowercase()));
    }
    Ok(state)
}

async fn list(store: &ResourceStore, class: ResourceClass, filter: Option<String>) -> Result<()> {
    let state = load_class(store, class).await?;
    print_collection(state.filter(class, filter.as_deref().unwrap_or_default()), true);
    Ok(())
}

fn print_collection(collection: Collection, all: bool) {
    match collection {
        Collection::Containers(containers) => {
            println!(
                "{:<14}{:<28}{:<30}{:<24}{:<12}PORTS",
                "ID", "NAME", "IMAGE", "STATUS", "CREATED"
            );
            for container in containers.iter().filter(|container| all || container.is_running()) {
                println!(
                    "{:<14}{:<28}{:<30}{:<24}{:<12}{}",
                    container.short_id(),
                    container.name(),
                    container.image,
                    container.status,
                    human_age(container.created_at()),
                    container.ports_summary()
                );
            }
        }
        Collection::Images(images) => {
            println!("{:<14}{:<48}{:<12}CREATED", "ID", "TAG", "SIZE");
            for image in images {
                println!(
                    "{:<14}{:<48}{:<12}{}",
                    image.short_id(),
                    image.primary_tag(),
                    format_bytes(image.size.max(0) as u64),
                    human_age(image.created_at())
                );
            }
        }
        Collection::Volumes(volumes) => {
            println!("{:<40}{:<12}MOUNTPOINT", "NAME", "DRIVER");
            for volume in volumes {
                println!("{:<40}{:<12}{}", volume.name, volume.driver, volume.mountpoint);
            }
        }
        Collection::Networks(networks) => {
            println!("{:<14}{:<28}{:<12}{:<10}SUBNETS", "ID", "NAME", "DRIVER", "SCOPE");
            for network in networks {
                println!(
                    "{:<14}{:<28}{:<12}{:<10}{}",
                    network.short_id(),
                    network.name,
                    network.driver,
                    network.scope,
                    network.subnets().join(",")
                );
            }
        }
    }
}

async fn print_info(store: &ResourceStore) -> Result<()> {
    let info = store
        .refresh_system_info()
        .await
        .context("failed to load engine info")?;
    println!("Name:        {}", info.name);
    println!("Server:      {}", info.server_version);
    if let Some(version) = store.snapshot().version {
        println!("API:         {}", version.api_version);
    }
    println!("OS:          {} ({})", info.operating_system, info.architecture);
    println!("Kernel:      {}", info.kernel_version);
    println!("Driver:      {}", info.driver);
    println!("CPUs:        {}", info.ncpu);
    println!("Memory:      {}", format_bytes(info.mem_total.max(0) as u64));
    println!(
        "Containers:  {} ({} running, {} paused, {} stopped)",
        info.containers, info.containers_running, info.containers_paused, info.containers_stopped
    );
    println!("Images:      {}", info.images);
    Ok(())
}

fn error_channel() -> (ErrorCallback, mpsc::UnboundedReceiver<ErrorKind>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    let callback: ErrorCallback = Box::new(move |error| {
        let _ = sender.send(error);
    });
    (callback, receiver)
}

/// Runs a stream until Ctrl-C or until the engine ends it.
async fn follow(handle: StreamHandle, mut errors: mpsc::UnboundedReceiver<ErrorKind>) -> Result<()> {
    let outcome = tokio::select! {
        _ = tokio::signal::ctrl_c() => Ok(()),
        error = errors.recv() => match error {
            None | Some(ErrorKind::StreamClosed) => Ok(()),
            Some(error) => Err(error),
        },
    };
    handle.cancel();
    handle.finished().await;
    outcome.context("stream failed")
}

async fn logs(gateway: &EngineGateway, args: LogsArgs) -> Result<()> {
    let options = LogOptions {
        follow: args.follow,
        since: args.since,
        timestamps: args.timestamps,
        tail: args.tail,
        framing: if args.multiplexed {
            LogFraming::Multiplexed
        } else {
            LogFraming::Raw
        },
        ..LogOptions::default()
    };

    if !args.follow {
        let text = gateway
            .container_logs(&args.id, &options)
            .await
            .with_context(|| format!("failed to read logs of {}", args.id))?;
        print!("{text}");
        return Ok(());
    }

    let (on_error, errors) = error_channel();
    let handle = gateway.stream_logs(
        &args.id,
        &options,
        |chunk| {
            let mut stdout = std::io::stdout().lock();
            let _ = stdout.write_all(chunk.as_bytes());
            let _ = stdout.flush();
        },
        Some(on_error),
    );
    follow(handle, errors).await
}

async fn stats(gateway: &EngineGateway, id: &str) -> Result<()> {
    let (on_error, errors) = error_channel();
    let mut tracker = StatsTracker::new();
    println!(
        "{:<24}{:>8}{:>24}{:>8}{:>22}{:>22}{:>6}",
        "NAME", "CPU %", "MEM USAGE / LIMIT", "MEM %", "NET I/O", "BLOCK I/O", "PIDS"
    );
    let handle = gateway.stream_stats(
        id,
        move |sample| {
            let reading = tracker.observe(&sample);
            println!(
                "{:<24}{:>7.2}%{:>24}{:>7.2}%{:>22}{:>22}{:>6}",
                sample.name.trim_start_matches('/'),
                reading.cpu_percent,
                format!(
                    "{} / {}",
                    format_bytes(reading.memory_usage),
                    format_bytes(reading.memory_limit)
                ),
                reading.memory_percent,
                format!(
                    "{} / {}",
                    format_bytes(reading.network_rx),
                    format_bytes(reading.network_tx)
                ),
                format!(
                    "{} / {}",
                    format_bytes(reading.block_read),
                    format_bytes(reading.block_write)
                ),
                reading.processes
            );
        },
        Some(on_error),
    );
    follow(handle, errors).await
}

fn required_image(args: &CreateArgs) -> Result<String> {
    match args.image.as_deref().map(str::trim) {
        Some(image) if !image.is_empty() => Ok(image.to_string()),
        _ => bail!("an image is required (positional or via --config)"),
    }
}

fn create_config(args: &CreateArgs) -> Result<Option<ContainerConfig>> {
    let Some(path) = &args.config else {
        return Ok(None);
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read container config {}", path.display()))?;
    let mut config: ContainerConfig = serde_yaml::from_str(&raw)
        .with_context(|| format!("failed to parse container config {}", path.display()))?;

    if let Some(image) = args.image.as_deref().filter(|image| !image.trim().is_empty()) {
        config.image = image.to_string();
    }
    if args.name.is_some() {
        config.name = args.name.clone();
    }
    if config.image.trim().is_empty() {
        bail!("container config {} names no image", path.display());
    }
    Ok(Some(config.with_defaults()))
}

fn print_created(id: &str, warnings: &[String]) {
    for warning in warnings {
        warn!("{warning}");
    }
    println!("{id}");
}

async fn exec(gateway: &EngineGateway, config: &RuntimeConfig, args: ExecArgs) -> Result<()> {
    let mode = match args.mode.as_deref() {
        Some(raw) => raw.parse::<TerminalMode>()?,
        None => config.terminal_mode,
    };
    let shell = args.shell.unwrap_or_else(|| config.shell.clone());
    let manager = TerminalSessionManager::new(gateway.clone(), mode);

    let (event_tx, mut events) = mpsc::unbounded_channel();
    let on_event: EventCallback = Arc::new(move |event| {
        let _ = event_tx.send(event);
    });
    let id = manager
        .open(&args.id, Some(&shell), on_event)
        .await
        .with_context(|| format!("failed to open a shell in {}", args.id))?;

    enable_raw_mode().context("failed to enable raw mode")?;
    let session = run_session(&manager, id, &mut events).await;
    manager.close_all();
    let restore = disable_raw_mode().context("failed to disable raw mode");

    match (session, restore) {
        (Err(session_error), Err(restore_error)) => Err(anyhow::anyhow!(
            "{session_error:#}\nterminal restore error: {restore_error:#}"
        )),
        (Err(error), _) => Err(error),
        (_, Err(error)) => Err(error),
        (Ok(()), Ok(())) => Ok(()),
    }
}

async fn run_session(
    manager: &TerminalSessionManager,
    id: dockhand::terminal::SessionId,
    events: &mut mpsc::UnboundedReceiver<TerminalEvent>,
) -> Result<()> {
    if let Ok((cols, rows)) = crossterm::terminal::size()
        && let Err(error) = manager.resize(id, rows, cols).await
    {
        debug!("initial resize failed: {error}");
    }

    let mut reader = EventStream::new();
    let mut failure = None;
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(TerminalEvent::Output(bytes)) => {
                    let mut stdout = std::io::stdout().lock();
                    stdout.write_all(&bytes).context("failed to write terminal output")?;
                    stdout.flush().context("failed to flush terminal output")?;
                }
                Some(TerminalEvent::Error(error)) => failure = Some(error),
                Some(TerminalEvent::State(SessionState::Closed | SessionState::Error)) | None => break,
                Some(TerminalEvent::State(_)) => {}
            },
            input = reader.next() => match input {
                Some(Ok(Event::Key(key))) if key.kind == KeyEventKind::Press => match map_key(key) {
                    Some(Action::Detach) => break,
                    Some(Action::Send(bytes)) => manager.send_input(id, &bytes)?,
                    None => {}
                },
                Some(Ok(Event::Paste(text))) => manager.send_input(id, text.as_bytes())?,
                Some(Ok(Event::Resize(cols, rows))) => {
                    if let Err(error) = manager.resize(id, rows, cols).await {
                        debug!("resize failed: {error}");
                    }
                }
                Some(Ok(_)) => {}
                Some(Err(error)) => return Err(error).context("failed to read terminal input"),
                None => break,
            },
        }
    }

    match failure {
        Some(error) if manager.state(id) == Some(SessionState::Error) => {
            Err(error).context("terminal session failed")
        }
        _ => Ok(()),
    }
}

async fn watch(store: &Arc<ResourceStore>, config: &RuntimeConfig) -> Result<()> {
    if let Err(error) = store.refresh_system_info().await {
        warn!("engine info unavailable: {}", error.user_message());
    }

    let mut changes = store.subscribe();
    let poller = store.spawn_poller(config.refresh);
    let sampler = UsageSampler::new(config.usage_source).spawn(Arc::clone(store), config.usage_interval);
    let mut last_line = String::new();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
                let line = status_line(&changes.borrow_and_update());
                if line != last_line {
                    println!("{line}");
                    last_line = line;
                }
            }
        }
    }

    poller.stopped().await;
    sampler.stopped().await;
    Ok(())
}

fn status_line(state: &StoreState) -> String {
    let mut line = format!(
        "{} containers ({} running), {} images, {} volumes, {} networks",
        state.count(ResourceClass::Containers),
        state.running_containers(),
        state.count(ResourceClass::Images),
        state.count(ResourceClass::Volumes),
        state.count(ResourceClass::Networks),
    );
    if let Some(usage) = &state.system_usage {
        line.push_str(&format!(
            " | cpu {:.1}% mem {} / {} ({:.1}%)",
            usage.cpu_percent,
            format_bytes(usage.memory_used),
            format_bytes(usage.memory_total),
            usage.memory_percent
        ));
    }
    match state.last_error() {
        Some(error) => line.push_str(&format!(" | {}", error.user_message())),
        None if state.connected => line.push_str(" | connected"),
        None => line.push_str(" | disconnected"),
    }
    line
}
