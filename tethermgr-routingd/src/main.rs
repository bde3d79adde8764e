use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{UnixListener, UnixStream};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;

use tethermgr_lib::logging;
use tethermgr_lib::routing_protocol::{RoutingRequest, RoutingResponse};
use tethermgr_lib::socket::routingd;

mod cli;
mod error;
mod netlink_ops;
mod nftables_ops;

use error::Error;
use netlink_ops::NetlinkOps;
use nftables_ops::NfTablesOps;

#[cfg(target_os = "linux")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

enum SignalMessage {
    Shutdown,
    RotateLogs,
}

async fn signal_channel() -> Result<mpsc::Receiver<SignalMessage>, exitcode::ExitCode> {
    let (sender, receiver) = mpsc::channel(32);
    let mut sigint = signal(SignalKind::interrupt()).map_err(|error| {
        tracing::error!(?error, "error setting up SIGINT handler");
        exitcode::IOERR
    })?;
    let mut sigterm = signal(SignalKind::terminate()).map_err(|error| {
        tracing::error!(?error, "error setting up SIGTERM handler");
        exitcode::IOERR
    })?;
    let mut sighup = signal(SignalKind::hangup()).map_err(|error| {
        tracing::error!(?error, "error setting up SIGHUP handler");
        exitcode::IOERR
    })?;

    tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(_) = sigint.recv() => {
                    if sender.send(SignalMessage::Shutdown).await.is_err() {
                        break;
                    }
                },
                Some(_) = sigterm.recv() => {
                    if sender.send(SignalMessage::Shutdown).await.is_err() {
                        break;
                    }
                },
                Some(_) = sighup.recv() => {
                    if sender.send(SignalMessage::RotateLogs).await.is_err() {
                        break;
                    }
                }
                else => break,
            }
        }
    });

    Ok(receiver)
}

/// Root-only socket (0o600): only the orchestrator, run as the tethering
/// service's own privileged peer, may connect. Probe-then-bind avoids a
/// stale socket file from a crashed process silently shadowing a new
/// instance (§6.5).
async fn socket_listener(socket_path: &Path) -> Result<UnixListener, exitcode::ExitCode> {
    match socket_path.try_exists() {
        Ok(true) => {
            tracing::info!("probing for a running routing helper instance");
            match routingd::process_request(socket_path, &RoutingRequest::Ping).await {
                Ok(_) => {
                    tracing::error!("tethermgr-routingd is already running on this socket");
                    return Err(exitcode::TEMPFAIL);
                }
                Err(e) => tracing::debug!(warn = ?e, "done probing for running instance"),
            }
            fs::remove_file(socket_path).await.map_err(|e| {
                tracing::error!(error = ?e, "error removing stale socket file");
                exitcode::IOERR
            })?;
        }
        Ok(false) => (),
        Err(e) => {
            tracing::error!(error = ?e, "error checking socket path");
            return Err(exitcode::IOERR);
        }
    }

    let socket_dir = socket_path.parent().ok_or_else(|| {
        tracing::error!("socket path has no parent");
        exitcode::UNAVAILABLE
    })?;
    fs::create_dir_all(socket_dir).await.map_err(|e| {
        tracing::error!(error = %e, "error creating socket directory");
        exitcode::IOERR
    })?;

    let listener = UnixListener::bind(socket_path).map_err(|e| {
        tracing::error!(error = ?e, "error binding routing socket");
        exitcode::OSFILE
    })?;

    fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600))
        .await
        .map_err(|e| {
            tracing::error!(error = ?e, "error setting socket permissions");
            exitcode::NOPERM
        })?;

    Ok(listener)
}

struct Ops {
    netlink: Box<dyn NetlinkOps>,
    nftables: Box<dyn NfTablesOps>,
}

async fn handle_request(ops: &Ops, request: RoutingRequest) -> RoutingResponse {
    let result = dispatch(ops, request).await;
    match result {
        Ok(()) => RoutingResponse::Ok,
        Err(e) => RoutingResponse::Error { message: e.to_string() },
    }
}

async fn dispatch(ops: &Ops, request: RoutingRequest) -> Result<(), Error> {
    match request {
        RoutingRequest::Ping => Ok(()),
        RoutingRequest::SetInterfaceUp { interface_name } => ops.netlink.link_set_up(&interface_name).await,
        RoutingRequest::SetInterfaceDown { interface_name } => ops.netlink.link_set_down(&interface_name).await,
        RoutingRequest::ConfigureAddress { interface_name, address } => {
            ops.netlink.addr_add(&interface_name, address).await
        }
        RoutingRequest::AddInterfaceToLocalNetwork { interface_name, prefix } => {
            ops.netlink.addr_add(&interface_name, prefix).await?;
            ops.netlink.link_set_up(&interface_name).await
        }
        RoutingRequest::RemoveInterfaceFromLocalNetwork { interface_name } => {
            ops.netlink.link_set_down(&interface_name).await
        }
        RoutingRequest::AddInterfaceToNetwork { interface_name, network_id } => {
            tracing::debug!(%interface_name, network_id, "binding interface to network");
            ops.netlink.link_set_up(&interface_name).await
        }
        RoutingRequest::RemoveInterfaceFromNetwork { interface_name, network_id } => {
            tracing::debug!(%interface_name, network_id, "unbinding interface from network");
            Ok(())
        }
        RoutingRequest::AddRoute { interface_name, destination, gateway } => {
            ops.netlink.route_add(&interface_name, destination, gateway).await
        }
        RoutingRequest::RemoveRoute { interface_name, destination } => {
            ops.netlink.route_del(&interface_name, destination).await
        }
        RoutingRequest::StartOffload { downstream, upstream } => ops.nftables.start_offload(&downstream, &upstream),
        RoutingRequest::StopOffload { downstream } => ops.nftables.stop_offload(&downstream),
        RoutingRequest::SetIpForwarding { enabled } => ops.netlink.set_ip_forwarding(enabled).await,
        RoutingRequest::SetDnsForwarders { network_id, servers } => {
            // The DNS forwarder daemon is an external collaborator (§1); this
            // helper only has the authority to log what it would configure.
            tracing::info!(network_id, ?servers, "dns forwarders updated");
            Ok(())
        }
        RoutingRequest::TeardownStaleRules => ops.nftables.teardown_stale(),
    }
}

async fn handle_connection(stream: UnixStream, ops: Arc<Ops>) {
    let (read_half, write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    let mut writer = BufWriter::new(write_half);

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => return,
            Err(error) => {
                tracing::warn!(?error, "error reading from routing socket");
                return;
            }
        };

        let request: RoutingRequest = match line.parse() {
            Ok(request) => request,
            Err(error) => {
                tracing::warn!(%error, "failed parsing routing request");
                continue;
            }
        };

        let response = handle_request(&ops, request).await;
        if let Err(error) = write_response(&mut writer, &response).await {
            tracing::warn!(?error, "error writing routing response");
            return;
        }
    }
}

async fn write_response(
    writer: &mut BufWriter<tokio::net::unix::OwnedWriteHalf>,
    response: &RoutingResponse,
) -> std::io::Result<()> {
    let json = serde_json::to_string(response).expect("RoutingResponse always serializes");
    writer.write_all(json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

fn build_ops() -> Ops {
    #[cfg(target_os = "linux")]
    {
        Ops {
            netlink: Box::new(netlink_ops::RealNetlinkOps::new().unwrap_or_else(|e| {
                tracing::error!(error = ?e, "failed to open netlink connection");
                process::exit(exitcode::OSERR);
            })),
            nftables: Box::new(nftables_ops::RealNfTablesOps::new()),
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        tracing::error!("tethermgr-routingd requires Linux (rtnetlink/nftables)");
        process::exit(exitcode::UNAVAILABLE);
    }
}

async fn daemon(args: cli::Cli, reload_handle: &logging::LogReloadHandle, log_path: &str) -> Result<(), exitcode::ExitCode> {
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting {}", env!("CARGO_PKG_NAME"));

    if let Some(pid_file) = &args.pid_file {
        fs::write(pid_file, process::id().to_string()).await.map_err(|e| {
            tracing::error!(error = ?e, "error writing pid file");
            exitcode::IOERR
        })?;
    }

    let mut signal_receiver = signal_channel().await?;
    let listener = socket_listener(&args.socket_path).await?;
    let ops = Arc::new(build_ops());

    // Drop any firewall rules left behind by a previous crashed instance.
    if let Err(e) = ops.nftables.teardown_stale() {
        tracing::warn!(error = ?e, "failed to clear stale offload rules on startup");
    }

    tracing::info!(socket = %args.socket_path.display(), "routing helper ready");

    loop {
        tokio::select! {
            Some(signal) = signal_receiver.recv() => match signal {
                SignalMessage::Shutdown => {
                    tracing::info!("shutting down");
                    let _ = ops.nftables.teardown_stale();
                    let _ = fs::remove_file(&args.socket_path).await;
                    return Ok(());
                }
                SignalMessage::RotateLogs => match logging::rotate(reload_handle, log_path) {
                    Ok(()) => tracing::info!("rotated log file"),
                    Err(e) => tracing::error!(error = ?e, "failed to rotate log file"),
                },
            },
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => {
                    let ops = ops.clone();
                    tokio::spawn(async move { handle_connection(stream, ops).await });
                }
                Err(error) => {
                    tracing::warn!(?error, "error accepting routing connection");
                }
            },
        }
    }
}

#[tokio::main(flavor = "multi_thread", worker_threads = 2)]
async fn main() {
    let args = cli::parse();

    if let Some(log_file) = &args.log_file {
        unsafe { std::env::set_var("TETHERMGR_LOG_FILE", log_file) };
    }
    let (reload_handle, log_path) = logging::init();

    match daemon(args, &reload_handle, &log_path).await {
        Ok(()) => (),
        Err(exitcode::OK) => (),
        Err(code) => {
            tracing::warn!("abnormal exit");
            process::exit(code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cidr::Ipv4Cidr;
    use netlink_ops::mocks::MockNetlinkOps;
    use nftables_ops::mocks::MockNfTablesOps;
    use std::net::Ipv4Addr;

    fn mock_ops() -> Ops {
        Ops { netlink: Box::new(MockNetlinkOps::default()), nftables: Box::new(MockNfTablesOps::default()) }
    }

    #[tokio::test]
    async fn ping_succeeds_without_touching_kernel_state() {
        let ops = mock_ops();
        let response = handle_request(&ops, RoutingRequest::Ping).await;
        assert!(matches!(response, RoutingResponse::Ok));
    }

    #[tokio::test]
    async fn configure_address_invokes_netlink() {
        let ops = mock_ops();
        let address = Ipv4Cidr::new(Ipv4Addr::new(192, 168, 43, 1), 24).unwrap();
        let response = handle_request(
            &ops,
            RoutingRequest::ConfigureAddress { interface_name: "wlan0".to_string(), address },
        )
        .await;
        assert!(matches!(response, RoutingResponse::Ok));
    }

    #[tokio::test]
    async fn start_then_stop_offload_round_trips_through_nftables_ops() {
        let ops = mock_ops();
        let start = handle_request(
            &ops,
            RoutingRequest::StartOffload { downstream: "wlan0".to_string(), upstream: "rmnet0".to_string() },
        )
        .await;
        assert!(matches!(start, RoutingResponse::Ok));

        let stop = handle_request(&ops, RoutingRequest::StopOffload { downstream: "wlan0".to_string() }).await;
        assert!(matches!(stop, RoutingResponse::Ok));
    }

    #[tokio::test]
    async fn unparseable_line_does_not_crash_the_connection_handler() {
        let request: Result<RoutingRequest, _> = "not json".parse();
        assert!(request.is_err());
    }
}
