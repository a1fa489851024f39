use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use notify::{recommended_watcher, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tokio::time::{Instant, MissedTickBehavior};

use mirrorsync_core::{config, PairId, ProjectId};
use mirrorsync_engine::{
    BatchResult, FileStateStore, HttpRemoteClient, RegistryConfigSource, Scheduler,
};

use crate::error::{io_err, DaemonError};
use crate::log_rotation::{rotate_logs, RotationPolicy};
use crate::paths::{logs_dir, pid_path, run_dir, socket_path, watched_dirs, DEBOUNCE_WINDOW};
use crate::protocol::{DaemonRequest, DaemonResponse};

/// Set to `json` for one JSON object per log line.
pub const LOG_FORMAT_ENV: &str = "MIRRORSYNC_LOG_FORMAT";

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const ROTATION_INTERVAL: Duration = Duration::from_secs(5);

/// Outcome of the most recent tick, for `status`.
#[derive(Debug, Clone, Serialize)]
pub struct TickSummary {
    /// What asked for the tick: `interval`, `watcher` or `socket`.
    pub source: String,
    pub finished_at: DateTime<Utc>,
    #[serde(flatten)]
    pub result: BatchResult,
}

struct TickRequest {
    source: &'static str,
    respond_to: Option<oneshot::Sender<Result<TickSummary, String>>>,
}

struct DaemonState {
    home: PathBuf,
    scheduler: Scheduler,
    started_at: DateTime<Utc>,
    last_tick: RwLock<Option<TickSummary>>,
}

impl DaemonState {
    fn new(home: PathBuf, scheduler: Scheduler) -> Self {
        Self {
            home,
            scheduler,
            started_at: Utc::now(),
            last_tick: RwLock::new(None),
        }
    }
}

/// Start the daemon runtime and block the current thread until it exits.
pub fn start_blocking(home: &Path) -> Result<(), DaemonError> {
    init_tracing();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(home.to_path_buf()))
}

/// Run the daemon against the registry and state under `home`.
pub async fn run(home: PathBuf) -> Result<(), DaemonError> {
    ensure_runtime_dirs(&home)?;
    let scheduler = build_scheduler(&home)?;

    let recovered = scheduler.recover()?;
    if recovered > 0 {
        tracing::warn!(recovered, "finalized jobs left running by a previous process");
    }

    let pid_file = pid_path(&home);
    fs::write(&pid_file, std::process::id().to_string()).map_err(|e| io_err(&pid_file, e))?;
    tracing::info!(
        pid = std::process::id(),
        tick_interval_secs = scheduler.config().tick_interval_secs,
        "daemon started",
    );

    let state = Arc::new(DaemonState::new(home.clone(), scheduler));
    let result = serve(state).await;

    if let Err(err) = fs::remove_file(&pid_file) {
        if err.kind() != ErrorKind::NotFound {
            tracing::warn!(path = %pid_file.display(), error = %err, "failed to remove pid file");
        }
    }
    tracing::info!("daemon stopped");
    result
}

/// Install the global subscriber: `RUST_LOG` filter (default `info`), plain
/// text unless `MIRRORSYNC_LOG_FORMAT=json`.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var(LOG_FORMAT_ENV)
        .map(|value| value.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    let _ = if json {
        fmt().json().with_env_filter(filter).try_init()
    } else {
        fmt().with_env_filter(filter).with_target(false).try_init()
    };
}

fn build_scheduler(home: &Path) -> Result<Scheduler, DaemonError> {
    let config = config::load_at(home)?;
    let store = FileStateStore::at(home, config.job_history);
    Ok(Scheduler::new(
        config,
        Arc::new(RegistryConfigSource::at(home)),
        Arc::new(store),
        Arc::new(HttpRemoteClient::new(HTTP_TIMEOUT)),
    ))
}

async fn serve(state: Arc<DaemonState>) -> Result<(), DaemonError> {
    let (tick_tx, tick_rx) = mpsc::channel::<TickRequest>(64);
    let (shutdown_tx, _) = broadcast::channel::<()>(16);

    let watcher_handle = {
        let shutdown = shutdown_tx.clone();
        let home = state.home.clone();
        let tick_tx = tick_tx.clone();
        tokio::spawn(async move {
            let result = watcher_task(home, tick_tx, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let ticker_handle = {
        let shutdown = shutdown_tx.clone();
        let state = state.clone();
        tokio::spawn(async move {
            let result = tick_driver_task(state, tick_rx, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let socket_handle = {
        let shutdown = shutdown_tx.clone();
        let state = state.clone();
        let tick_tx = tick_tx.clone();
        tokio::spawn(async move {
            let result =
                socket_server_task(state, tick_tx, shutdown.clone(), shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let rotation_handle = {
        let shutdown = shutdown_tx.clone();
        let home = state.home.clone();
        tokio::spawn(async move {
            let result = log_rotation_task(home, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let signal_handle = {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            let mut shutdown_rx = shutdown.subscribe();
            tokio::select! {
                _ = shutdown_rx.recv() => Ok(()),
                signal = tokio::signal::ctrl_c() => {
                    match signal {
                        Ok(()) => {
                            tracing::info!("received ctrl-c, shutting down daemon");
                            let _ = shutdown.send(());
                            Ok(())
                        }
                        Err(err) => Err(DaemonError::Protocol(format!("ctrl-c handler failed: {err}"))),
                    }
                }
            }
        })
    };
    drop(tick_tx);

    let (watcher_result, ticker_result, socket_result, rotation_result, signal_result) = tokio::join!(
        watcher_handle,
        ticker_handle,
        socket_handle,
        rotation_handle,
        signal_handle
    );

    handle_join("watcher", watcher_result)?;
    handle_join("tick_driver", ticker_result)?;
    handle_join("socket_server", socket_result)?;
    handle_join("log_rotation", rotation_result)?;
    handle_join("signal_handler", signal_result)?;
    Ok(())
}

/// Tick on the configured interval and on request. Ticks never overlap: a
/// request arriving mid-tick waits for the next loop turn.
async fn tick_driver_task(
    state: Arc<DaemonState>,
    mut tick_rx: mpsc::Receiver<TickRequest>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let mut interval = tokio::time::interval(state.scheduler.config().tick_interval());
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let (source, respond_to) = tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = interval.tick() => ("interval", None),
            request = tick_rx.recv() => match request {
                Some(request) => (request.source, request.respond_to),
                None => break,
            },
        };
        let outcome = run_tick(&state, source).await;
        if let Some(respond_to) = respond_to {
            let _ = respond_to.send(outcome);
        }
    }
    Ok(())
}

async fn run_tick(state: &DaemonState, source: &'static str) -> Result<TickSummary, String> {
    match state.scheduler.tick().await {
        Ok(result) => {
            let summary = TickSummary {
                source: source.to_string(),
                finished_at: Utc::now(),
                result,
            };
            *state.last_tick.write().await = Some(summary.clone());
            Ok(summary)
        }
        Err(err) => {
            tracing::error!(source, error = %err, "tick failed");
            Err(err.to_string())
        }
    }
}

async fn enqueue_tick(
    tick_tx: &mpsc::Sender<TickRequest>,
    source: &'static str,
) -> Result<TickSummary, DaemonError> {
    let (tx, rx) = oneshot::channel();
    tick_tx
        .send(TickRequest {
            source,
            respond_to: Some(tx),
        })
        .await
        .map_err(|_| DaemonError::ChannelClosed("tick queue"))?;
    let outcome = rx
        .await
        .map_err(|_| DaemonError::ChannelClosed("tick response"))?;
    outcome.map_err(DaemonError::Protocol)
}

/// Watch the target and pair directories; a YAML change schedules a tick so
/// new or edited mirrors are picked up without waiting for the interval.
async fn watcher_task(
    home: PathBuf,
    tick_tx: mpsc::Sender<TickRequest>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let mut dirs = Vec::new();
    for dir in watched_dirs(&home) {
        if !dir.exists() {
            fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        }
        // FSEvents reports real paths (/private/var/... on macOS).
        dirs.push(fs::canonicalize(&dir).unwrap_or(dir));
    }

    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
    let mut watcher: RecommendedWatcher = recommended_watcher(move |event| {
        let _ = event_tx.send(event);
    })?;
    for dir in &dirs {
        watcher.watch(dir, RecursiveMode::NonRecursive)?;
        tracing::debug!(path = %dir.display(), "watching config directory");
    }

    let mut debounce = HashMap::<PathBuf, Instant>::new();

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            event = event_rx.recv() => {
                let Some(event) = event else { break };
                let event = match event {
                    Ok(event) => event,
                    Err(err) => {
                        tracing::warn!(error = %err, "watcher event error");
                        continue;
                    }
                };
                if !is_relevant_event_kind(&event.kind) {
                    continue;
                }

                let mut changed = false;
                for path in &event.paths {
                    if is_config_yaml(path, &dirs)
                        && should_process_event(&mut debounce, path, Instant::now())
                    {
                        tracing::info!(path = %path.display(), "config changed");
                        changed = true;
                    }
                }
                if changed {
                    tick_tx
                        .send(TickRequest { source: "watcher", respond_to: None })
                        .await
                        .map_err(|_| DaemonError::ChannelClosed("tick queue"))?;
                }
            }
        }
    }

    Ok(())
}

async fn socket_server_task(
    state: Arc<DaemonState>,
    tick_tx: mpsc::Sender<TickRequest>,
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let socket = socket_path(&state.home);
    prepare_socket_for_bind(&socket)?;

    let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
    set_socket_permissions(&socket)?;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let state = state.clone();
                let tick_tx = tick_tx.clone();
                let shutdown_tx = shutdown_tx.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_socket_client(stream, state, tick_tx, shutdown_tx).await {
                        tracing::error!(error = %err, "socket client error");
                    }
                });
            }
        }
    }

    if socket.exists() {
        let _ = fs::remove_file(&socket);
    }
    Ok(())
}

async fn handle_socket_client(
    stream: UnixStream,
    state: Arc<DaemonState>,
    tick_tx: mpsc::Sender<TickRequest>,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<(), DaemonError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| io_err("daemon socket read", e))?
    {
        if line.trim().is_empty() {
            continue;
        }

        let request: DaemonRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(err) => {
                write_response(
                    &mut writer,
                    &DaemonResponse::error(format!("invalid request JSON: {err}")),
                )
                .await?;
                continue;
            }
        };

        let stop = request.cmd == "stop";
        let response = handle_request(&state, request, &tick_tx, &shutdown_tx).await;
        write_response(&mut writer, &response).await?;
        if stop {
            break;
        }
    }

    Ok(())
}

async fn handle_request(
    state: &DaemonState,
    request: DaemonRequest,
    tick_tx: &mpsc::Sender<TickRequest>,
    shutdown_tx: &broadcast::Sender<()>,
) -> DaemonResponse {
    tracing::debug!(cmd = %request.cmd, "socket request");
    match dispatch(state, request, tick_tx, shutdown_tx).await {
        Ok(data) => DaemonResponse::ok(data),
        Err(err) => DaemonResponse::error(err.to_string()),
    }
}

async fn dispatch(
    state: &DaemonState,
    request: DaemonRequest,
    tick_tx: &mpsc::Sender<TickRequest>,
    shutdown_tx: &broadcast::Sender<()>,
) -> Result<Value, DaemonError> {
    let scheduler = &state.scheduler;
    match request.cmd.as_str() {
        "status" => build_status_payload(state).await,
        "sync" => {
            let (Some(pair), Some(project)) = (request.pair, request.project) else {
                return Err(DaemonError::Protocol(
                    "sync requires 'pair' and 'project'".to_string(),
                ));
            };
            let scope = scheduler.scope_for(&PairId::from(pair), ProjectId(project))?;
            let report = scheduler.trigger_sync(&scope)?.wait().await?;
            Ok(json!(report))
        }
        "batch" => {
            let pair = request
                .pair
                .ok_or_else(|| DaemonError::Protocol("batch requires 'pair'".to_string()))?;
            let result = scheduler.trigger_batch(&PairId::from(pair)).await?;
            Ok(json!(result))
        }
        "tick" => Ok(json!(enqueue_tick(tick_tx, "socket").await?)),
        "conflicts" => Ok(json!(scheduler.recent_conflicts())),
        "stop" => {
            let _ = shutdown_tx.send(());
            Ok(json!({ "stopping": true }))
        }
        other => Err(DaemonError::Protocol(format!("unknown command '{other}'"))),
    }
}

async fn build_status_payload(state: &DaemonState) -> Result<Value, DaemonError> {
    let scheduler = &state.scheduler;
    let scopes = scheduler.status()?;
    let last_tick = state.last_tick.read().await.clone();

    Ok(json!({
        "running": true,
        "pid": std::process::id(),
        "started_at": state.started_at,
        "tick_interval_secs": scheduler.config().tick_interval_secs,
        "socket": socket_path(&state.home).display().to_string(),
        "last_tick": last_tick,
        "running_scopes": scheduler.running(),
        "scopes": scopes,
        "breakers": scheduler.breakers(),
    }))
}

async fn log_rotation_task(
    home: PathBuf,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let mut interval = tokio::time::interval(ROTATION_INTERVAL);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // Nothing to rotate at startup.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = interval.tick() => {
                let home = home.clone();
                tokio::task::spawn_blocking(move || {
                    rotate_logs(&home, &RotationPolicy::default());
                })
                .await
                .ok();
            }
        }
    }
    Ok(())
}

fn is_relevant_event_kind(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

fn is_config_yaml(path: &Path, dirs: &[PathBuf]) -> bool {
    dirs.iter().any(|dir| path.parent() == Some(dir.as_path()))
        && path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("yaml"))
            .unwrap_or(false)
}

fn prepare_socket_for_bind(socket: &Path) -> Result<(), DaemonError> {
    if !socket.exists() {
        return Ok(());
    }

    match StdUnixStream::connect(socket) {
        Ok(_) => {
            return Err(DaemonError::Protocol(format!(
                "daemon socket already in use: {}",
                socket.display()
            )));
        }
        Err(err) => {
            tracing::warn!(
                socket = %socket.display(),
                error = %err,
                "removing stale daemon socket before bind",
            );
        }
    }

    match fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

fn should_process_event(
    debounce: &mut HashMap<PathBuf, Instant>,
    path: &Path,
    now: Instant,
) -> bool {
    should_process_event_with_threshold(debounce, path, now, DEBOUNCE_WINDOW)
}

fn should_process_event_with_threshold(
    debounce: &mut HashMap<PathBuf, Instant>,
    path: &Path,
    now: Instant,
    threshold: Duration,
) -> bool {
    debounce.retain(|_, seen_at| now.duration_since(*seen_at) <= Duration::from_secs(30));
    match debounce.get(path) {
        Some(last_seen) if now.duration_since(*last_seen) < threshold => false,
        _ => {
            debounce.insert(path.to_path_buf(), now);
            true
        }
    }
}

fn ensure_runtime_dirs(home: &Path) -> Result<(), DaemonError> {
    for dir in [run_dir(home), logs_dir(home)] {
        if !dir.exists() {
            fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        }
    }
    Ok(())
}

async fn write_response(
    writer: &mut OwnedWriteHalf,
    response: &DaemonResponse,
) -> Result<(), DaemonError> {
    let payload = serde_json::to_string(response)?;
    writer
        .write_all(payload.as_bytes())
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_err("daemon socket flush", e))?;
    Ok(())
}

fn handle_join(
    task: &str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Protocol(format!(
            "{task} task join failure: {err}"
        ))),
    }
}

#[cfg(unix)]
fn set_socket_permissions(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_socket_permissions(_path: &Path) -> Result<(), DaemonError> {
    Ok(())
}
