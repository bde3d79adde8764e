use ctrlc::Error as CtrlcError;
use notify::{RecursiveMode, Watcher};
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net;
use std::path::Path;
use std::process;
use std::thread;
use std::time::{Duration, Instant};

use tethermgr::orchestrator::TetherOrchestrator;
use tethermgr::orchestrator::event_bus::{Event, EventBus};
use tethermgr::orchestrator::routing_coordinator::RoutingCoordinator;
use tethermgr_lib::command::{Command, Response};
use tethermgr_lib::config;
use tethermgr_lib::event::TetherEvent;
use tethermgr_lib::logging;
use tethermgr_lib::logging::LogReloadHandle;

mod cli;

// Avoid musl's default allocator due to degraded performance
// https://nickb.dev/blog/default-musl-allocator-considered-harmful-to-performance
#[cfg(target_os = "linux")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// A registered listener's event sink (§4.8): boxed so every connection can
/// close over its own per-connection channel while `TetherOrchestrator`
/// stays generic over one concrete type.
type Sink = Box<dyn Fn(TetherEvent) + Send>;
type Orchestrator = TetherOrchestrator<Sink>;

fn ctrlc_channel() -> Result<crossbeam_channel::Receiver<()>, exitcode::ExitCode> {
    let (sender, receiver) = crossbeam_channel::bounded(2);
    match ctrlc::set_handler(move || match sender.send(()) {
        Ok(_) => (),
        Err(e) => {
            tracing::error!(error = ?e, "sending shutdown signal");
        }
    }) {
        Ok(_) => Ok(receiver),
        Err(CtrlcError::NoSuchSignal(signal_type)) => {
            tracing::error!(?signal_type, "no such signal");
            Err(exitcode::OSERR)
        }
        Err(CtrlcError::MultipleHandlers) => {
            tracing::error!("multiple handlers");
            Err(exitcode::UNAVAILABLE)
        }
        Err(CtrlcError::System(e)) => {
            tracing::error!(error = ?e, "system error");
            Err(exitcode::IOERR)
        }
    }
}

/// `ctrlc`'s `termination` feature folds SIGHUP into the same shutdown
/// handler as SIGINT/SIGTERM, so log rotation needs its own small tokio
/// runtime watching SIGHUP in isolation rather than sharing that channel.
fn sighup_channel() -> crossbeam_channel::Receiver<()> {
    let (sender, receiver) = crossbeam_channel::bounded(2);
    thread::spawn(move || {
        let rt = match tokio::runtime::Builder::new_current_thread().enable_io().build() {
            Ok(rt) => rt,
            Err(e) => {
                tracing::error!(error = ?e, "failed to start SIGHUP watcher");
                return;
            }
        };
        rt.block_on(async move {
            let mut sighup = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
                Ok(s) => s,
                Err(e) => {
                    tracing::error!(error = ?e, "error setting up SIGHUP handler");
                    return;
                }
            };
            loop {
                sighup.recv().await;
                if sender.send(()).is_err() {
                    break;
                }
            }
        });
    });
    receiver
}

fn config_channel(
    param_config_path: &Path,
) -> Result<
    (notify::RecommendedWatcher, crossbeam_channel::Receiver<notify::Result<notify::Event>>),
    exitcode::ExitCode,
> {
    match param_config_path.try_exists() {
        Ok(true) => {}
        Ok(false) => {
            tracing::error!(config_file=%param_config_path.display(), "cannot find configuration file");
            return Err(exitcode::NOINPUT);
        }
        Err(e) => {
            tracing::error!(error = ?e, "error checking configuration file path");
            return Err(exitcode::IOERR);
        }
    };

    let config_path = match fs::canonicalize(param_config_path) {
        Ok(path) => path,
        Err(e) => {
            tracing::error!(error = ?e, "error canonicalizing config path");
            return Err(exitcode::IOERR);
        }
    };

    let parent = match config_path.parent() {
        Some(dir) => dir,
        None => {
            tracing::error!("config path has no parent");
            return Err(exitcode::UNAVAILABLE);
        }
    };

    let (sender, receiver) = crossbeam_channel::unbounded::<notify::Result<notify::Event>>();

    let mut watcher = match notify::recommended_watcher(sender) {
        Ok(watcher) => watcher,
        Err(e) => {
            tracing::error!(error = ?e, "error creating config watcher");
            return Err(exitcode::IOERR);
        }
    };

    match watcher.watch(parent, RecursiveMode::NonRecursive) {
        Ok(_) => (),
        Err(e) => {
            tracing::error!(error = ?e, "error watching config directory");
            return Err(exitcode::IOERR);
        }
    };

    Ok((watcher, receiver))
}

/// Control socket (§6.1, §6.5), world-writable so any caller on the device
/// can reach it; permission is enforced per-command via `CallerContext`, not
/// by the socket's file mode. Probe-then-bind so a stale socket left behind
/// by a crashed instance doesn't silently shadow this one.
fn socket_channel(socket_path: &Path) -> Result<crossbeam_channel::Receiver<net::UnixStream>, exitcode::ExitCode> {
    match socket_path.try_exists() {
        Ok(true) => {
            tracing::info!("probing for a running tethermgr instance");
            match tethermgr_lib::socket::process_cmd(socket_path, &Command::Status) {
                Ok(_) => {
                    tracing::error!("tethermgr is already running on this socket");
                    return Err(exitcode::TEMPFAIL);
                }
                Err(e) => tracing::debug!(warn = ?e, "done probing for running instance"),
            }
            fs::remove_file(socket_path).map_err(|e| {
                tracing::error!(error = ?e, "error removing stale socket file");
                exitcode::IOERR
            })?;
        }
        Ok(false) => (),
        Err(e) => {
            tracing::error!(error = ?e, "error checking socket path");
            return Err(exitcode::IOERR);
        }
    };

    if let Some(parent) = socket_path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            tracing::error!(error = ?e, "error creating socket directory");
            exitcode::IOERR
        })?;
    }

    let listener = net::UnixListener::bind(socket_path).map_err(|e| {
        tracing::error!(error = ?e, "error binding socket");
        exitcode::OSFILE
    })?;

    fs::set_permissions(socket_path, fs::Permissions::from_mode(0o666)).map_err(|e| {
        tracing::error!(error = ?e, "error setting socket permissions");
        exitcode::NOPERM
    })?;

    let (sender, receiver) = crossbeam_channel::unbounded::<net::UnixStream>();
    thread::spawn(move || {
        for strm in listener.incoming() {
            match strm {
                Ok(s) => match sender.send(s) {
                    Ok(_) => (),
                    Err(e) => {
                        tracing::error!(error = ?e, "sending incoming connection");
                    }
                },
                Err(e) => {
                    tracing::error!(error = ?e, "waiting for incoming connection");
                }
            };
        }
    });

    Ok(receiver)
}

fn write_response(stream: &net::UnixStream, resp: &Response) -> bool {
    let json = match serde_json::to_string(resp) {
        Ok(json) => json,
        Err(e) => {
            tracing::error!(error = ?e, "error serializing response");
            return false;
        }
    };

    let mut writer = stream;
    let write_result = writer
        .write_all(json.as_bytes())
        .and_then(|_| writer.write_all(b"\n"))
        .and_then(|_| writer.flush());
    if let Err(e) = write_result {
        tracing::error!(error = %e, "error writing response");
        return false;
    }
    true
}

/// Hands a freshly `Registered` connection off to a dedicated writer thread
/// that drains its `TetherEvent`s (§4.8); the tethering thread itself never
/// blocks on a slow or wedged listener.
fn spawn_listener_writer(
    orch: &mut Orchestrator,
    stream: net::UnixStream,
    event_sender: crossbeam_channel::Sender<Event>,
    uid: u32,
    has_system_privilege: bool,
) {
    let (tx, rx) = crossbeam_channel::unbounded::<TetherEvent>();
    let listener_id = orch.register_listener(uid, has_system_privilege, move |_id| {
        Box::new(move |event: TetherEvent| {
            let _ = tx.send(event);
        }) as Sink
    });

    thread::spawn(move || {
        let mut stream = stream;
        for event in rx.iter() {
            let json = match serde_json::to_string(&event) {
                Ok(json) => json,
                Err(e) => {
                    tracing::error!(error = ?e, "error serializing event");
                    continue;
                }
            };
            let write_result =
                stream.write_all(json.as_bytes()).and_then(|_| stream.write_all(b"\n")).and_then(|_| stream.flush());
            if let Err(e) = write_result {
                tracing::debug!(error = ?e, "listener connection closed");
                break;
            }
        }
        if event_sender.send(Event::ListenerDisconnected(listener_id)).is_err() {
            tracing::warn!("event bus closed while reporting listener disconnect");
        }
    });
}

fn incoming_stream(
    orch: &mut Orchestrator,
    event_sender: &crossbeam_channel::Sender<Event>,
    res_stream: Result<net::UnixStream, crossbeam_channel::RecvError>,
) {
    let stream: net::UnixStream = match res_stream {
        Ok(strm) => strm,
        Err(e) => {
            tracing::error!(error = ?e, "error receiving stream");
            return;
        }
    };

    let mut line = String::new();
    {
        let mut reader = BufReader::new(&stream);
        if let Err(e) = reader.read_line(&mut line) {
            tracing::error!(error = ?e, "error reading command");
            return;
        }
    }
    if line.trim().is_empty() {
        tracing::debug!("peer disconnected before sending a command");
        return;
    }

    let cmd = match line.parse::<Command>() {
        Ok(cmd) => cmd,
        Err(e) => {
            tracing::error!(error = ?e, line = %line.trim_end(), "error parsing command");
            return;
        }
    };

    tracing::debug!(command = %cmd, "incoming command");

    let registration = match &cmd {
        Command::RegisterTetheringEventCallback { caller } => {
            Some((caller.uid, caller.check_system_permission().is_ok()))
        }
        _ => None,
    };

    let resp = orch.handle_command(cmd);
    if !write_response(&stream, &resp) {
        return;
    }

    if let (Some((uid, has_system_privilege)), Response::Registered) = (registration, &resp) {
        spawn_listener_writer(orch, stream, event_sender.clone(), uid, has_system_privilege);
    }
}

fn incoming_event(orch: &mut Orchestrator, res_event: Result<Event, crossbeam_channel::RecvError>) {
    match res_event {
        Ok(event) => {
            tracing::debug!(?event, "incoming event");
            orch.handle_event(event);
        }
        Err(e) => {
            tracing::error!(error = ?e, "error receiving event");
        }
    }
}

/// §4.6 upstream-selection step 3: arms (or disarms) the one-shot timer that
/// redelivers `Event::RetryUpstream` after `orch` asks for one.
fn retry_upstream_receiver(orch: &mut Orchestrator) -> crossbeam_channel::Receiver<Instant> {
    match orch.take_pending_retry() {
        Some(delay) => crossbeam_channel::after(delay),
        None => crossbeam_channel::never(),
    }
}

// handling fs config events with a grace period to avoid duplicate reads without delay
const CONFIG_GRACE_PERIOD: Duration = Duration::from_millis(333);

fn incoming_config_fs_event(
    res_event: Result<notify::Result<notify::Event>, crossbeam_channel::RecvError>,
    config_path: &Path,
) -> Option<crossbeam_channel::Receiver<Instant>> {
    let event: notify::Result<notify::Event> = match res_event {
        Ok(evt) => evt,
        Err(e) => {
            tracing::error!(error = ?e, "error receiving config event");
            return None;
        }
    };

    match event {
        Ok(notify::Event { kind, paths, attrs: _ })
            if (kind == notify::event::EventKind::Create(notify::event::CreateKind::File)
                || kind
                    == notify::event::EventKind::Modify(notify::event::ModifyKind::Data(
                        notify::event::DataChange::Any,
                    ))
                || kind == notify::event::EventKind::Remove(notify::event::RemoveKind::File))
                && paths == vec![config_path] =>
        {
            tracing::debug!(?kind, "config file change detected");
            Some(crossbeam_channel::after(CONFIG_GRACE_PERIOD))
        }
        Ok(_) => None,
        Err(e) => {
            tracing::error!(error = ?e, "error watching config folder");
            None
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn loop_daemon(
    ctrlc_receiver: &crossbeam_channel::Receiver<()>,
    sighup_receiver: &crossbeam_channel::Receiver<()>,
    config_receiver: &crossbeam_channel::Receiver<notify::Result<notify::Event>>,
    socket_receiver: &crossbeam_channel::Receiver<net::UnixStream>,
    config_path: &Path,
    orch: &mut Orchestrator,
    bus: &EventBus,
    reload_handle: &LogReloadHandle,
    log_path: &str,
) -> exitcode::ExitCode {
    let event_sender = bus.sender();
    let event_receiver = bus.receiver();
    let mut read_config_receiver: crossbeam_channel::Receiver<Instant> = crossbeam_channel::never();
    let mut retry_upstream_receiver_ch: crossbeam_channel::Receiver<Instant> = crossbeam_channel::never();

    tracing::info!("enter listening mode");
    loop {
        crossbeam_channel::select! {
            recv(ctrlc_receiver) -> _ => {
                tracing::info!("shutting down");
                return exitcode::OK;
            }
            recv(sighup_receiver) -> _ => {
                match logging::rotate(reload_handle, log_path) {
                    Ok(()) => tracing::info!("rotated log file"),
                    Err(e) => tracing::error!(error = ?e, "failed to rotate log file"),
                }
            }
            recv(socket_receiver) -> stream => {
                incoming_stream(orch, &event_sender, stream);
                retry_upstream_receiver_ch = retry_upstream_receiver(orch);
            }
            recv(event_receiver) -> event => {
                incoming_event(orch, event);
                retry_upstream_receiver_ch = retry_upstream_receiver(orch);
            }
            recv(config_receiver) -> event => {
                let resp = incoming_config_fs_event(event, config_path);
                if let Some(r) = resp {
                    read_config_receiver = r
                }
            },
            recv(read_config_receiver) -> _ => {
                match config::read(config_path) {
                    Ok(cfg) => {
                        tracing::info!("configuration reloaded");
                        if event_sender.send(Event::ConfigReloaded(cfg)).is_err() {
                            tracing::error!("event bus closed while posting configuration reload");
                        }
                    }
                    Err(e) => {
                        tracing::error!(error = ?e, "failed to reload configuration - staying on current configuration");
                    }
                }
            }
            recv(retry_upstream_receiver_ch) -> _ => {
                orch.handle_event(Event::RetryUpstream);
                retry_upstream_receiver_ch = retry_upstream_receiver(orch);
            }
        }
    }
}

fn daemon(args: &cli::Cli, reload_handle: &LogReloadHandle, log_path: &str) -> exitcode::ExitCode {
    let ctrlc_receiver = match ctrlc_channel() {
        Ok(receiver) => receiver,
        Err(exit) => return exit,
    };

    let sighup_receiver = sighup_channel();

    // keep config watcher in scope so it does not get dropped
    let (_config_watcher, config_receiver) = match config_channel(&args.config_path) {
        Ok(receiver) => receiver,
        Err(exit) => return exit,
    };

    let socket_receiver = match socket_channel(&args.socket_path) {
        Ok(receiver) => receiver,
        Err(exit) => return exit,
    };

    let cfg = match config::read(&args.config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!(error = ?e, "failed to load configuration");
            return exitcode::CONFIG;
        }
    };

    let routing = match RoutingCoordinator::new(args.routingd_socket_path.clone()) {
        Ok(routing) => routing,
        Err(e) => {
            tracing::error!(error = ?e, "failed to start routing coordinator");
            return exitcode::OSERR;
        }
    };

    let bus = EventBus::new();
    let mut orch: Orchestrator = TetherOrchestrator::new(cfg, Box::new(routing));
    // drop bookkeeping for any upstream network gone since the last run (§9);
    // this process owns no platform connectivity snapshot at startup, so the
    // bookkeeping each run starts with is empty.
    orch.prune_stale_upstreams(&[]);

    tracing::info!(socket = %args.socket_path.display(), "tethermgr ready");

    let exit_code = loop_daemon(
        &ctrlc_receiver,
        &sighup_receiver,
        &config_receiver,
        &socket_receiver,
        &args.config_path,
        &mut orch,
        &bus,
        reload_handle,
        log_path,
    );

    match fs::remove_file(&args.socket_path) {
        Ok(_) => (),
        Err(e) => {
            tracing::warn!(error = %e, "failed removing socket");
        }
    }

    exit_code
}

fn main() {
    let args = cli::parse();

    if let Some(pid_file) = &args.pid_file {
        if let Err(e) = fs::write(pid_file, process::id().to_string()) {
            eprintln!("error writing pid file: {e}");
        }
    }

    let (reload_handle, log_path) = logging::init();
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "starting {}",
        env!("CARGO_PKG_NAME")
    );

    let exit = daemon(&args, &reload_handle, &log_path);

    if exit != exitcode::OK {
        tracing::warn!("abnormal exit");
    }

    process::exit(exit)
}
