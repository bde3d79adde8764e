use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::process;

use exitcode::ExitCode;

use tethermgr_lib::command::{Command, Response};
use tethermgr_lib::error::ErrorCode;
use tethermgr_lib::event::TetherEvent;
use tethermgr_lib::socket;

mod cli;

// Avoid musl's default allocator due to degraded performance
// https://nickb.dev/blog/default-musl-allocator-considered-harmful-to-performance
#[cfg(target_os = "linux")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn main() {
    let args = cli::parse();
    let json = args.json;
    let socket_path = args.socket_path.clone();
    let is_watch = matches!(args.command, cli::Command::Watch {});
    let cmd: Command = args.into();

    if is_watch {
        watch(&socket_path, &cmd, json);
    }

    let resp = match socket::process_cmd(&socket_path, &cmd) {
        Ok(resp) => resp,
        Err(e) => {
            eprintln!("Error processing {cmd}: {e}");
            process::exit(exitcode::UNAVAILABLE);
        }
    };

    if json {
        json_print(&resp);
    } else {
        pretty_print(&resp);
    }

    process::exit(determine_exitcode(&resp));
}

/// `Watch` keeps the connection open past the first response, so it can't
/// use [`socket::process_cmd`], which reads to EOF for a single reply.
fn watch(socket_path: &std::path::Path, cmd: &Command, json: bool) -> ! {
    let mut stream = match UnixStream::connect(socket_path) {
        Ok(stream) => stream,
        Err(e) => {
            eprintln!("Error connecting to {}: {e}", socket_path.display());
            process::exit(exitcode::UNAVAILABLE);
        }
    };

    let encoded = cmd.to_string();
    let write_result = stream.write_all(encoded.as_bytes()).and_then(|_| stream.write_all(b"\n"));
    if let Err(e) = write_result {
        eprintln!("Error writing registration request: {e}");
        process::exit(exitcode::IOERR);
    }

    let mut lines = BufReader::new(stream).lines();

    match lines.next() {
        Some(Ok(line)) => match line.parse::<Response>() {
            Ok(Response::Registered) => println!("registered for tether events"),
            Ok(other) => {
                eprintln!("unexpected response to registration: {other}");
                process::exit(exitcode::PROTOCOL);
            }
            Err(e) => {
                eprintln!("error decoding registration response: {e}");
                process::exit(exitcode::PROTOCOL);
            }
        },
        Some(Err(e)) => {
            eprintln!("error reading registration response: {e}");
            process::exit(exitcode::IOERR);
        }
        None => {
            eprintln!("connection closed before registration completed");
            process::exit(exitcode::UNAVAILABLE);
        }
    }

    for line in lines {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                eprintln!("error reading event: {e}");
                process::exit(exitcode::IOERR);
            }
        };
        match serde_json::from_str::<TetherEvent>(&line) {
            Ok(event) => print_event(&event, json),
            Err(e) => eprintln!("error decoding event: {e}"),
        }
    }

    process::exit(exitcode::OK);
}

fn print_event(event: &TetherEvent, json: bool) {
    if json {
        match serde_json::to_string(event) {
            Ok(s) => println!("{s}"),
            Err(e) => eprintln!("error serializing event: {e}"),
        }
        return;
    }

    match event {
        TetherEvent::SupportedTypesChanged(types) => {
            let types = types.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ");
            println!("supported types changed: {types}");
        }
        TetherEvent::UpstreamChanged(Some(summary)) => {
            println!("upstream changed: {} ({})", summary.interface_name, summary.kind);
        }
        TetherEvent::UpstreamChanged(None) => println!("upstream lost"),
        TetherEvent::ConfigurationChanged => println!("configuration changed"),
        TetherEvent::OrchestratorStateChanged(state) => println!("orchestrator state: {state:?}"),
        TetherEvent::TetherStatesChanged(servers) => {
            println!("tether states changed ({} server(s)):", servers.len());
            for server in servers {
                println!("  {} [{:?}] last_error={}", server.interface_name, server.phase, server.last_error);
            }
        }
        TetherEvent::ClientsChanged(clients) => {
            println!("clients changed ({}):", clients.len());
            for client in clients {
                println!("  {} on {}", client.mac_address, client.interface_name);
            }
        }
        TetherEvent::OffloadStatusChanged(status) => println!("offload status: {status:?}"),
    }
}

fn json_print(resp: &Response) {
    match serde_json::to_string_pretty(resp) {
        Ok(s) => println!("{s}"),
        Err(e) => eprintln!("Error serializing response to JSON: {e}"),
    }
}

fn pretty_print(resp: &Response) {
    match resp {
        Response::Result { code } => {
            if code.is_success() {
                println!("ok");
            } else {
                eprintln!("error: {code}");
            }
        }
        Response::EntitlementResult { code, entitled } => match entitled {
            Some(true) => println!("entitled"),
            Some(false) => println!("not entitled"),
            None => eprintln!("error checking entitlement: {code}"),
        },
        Response::TetheringSupported { supported, types } => {
            if *supported {
                let types = types.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ");
                println!("tethering supported: {types}");
            } else {
                println!("tethering not supported");
            }
        }
        Response::Status { orchestrator_state, servers } => {
            println!("orchestrator state: {orchestrator_state:?}");
            if servers.is_empty() {
                println!("no active downstreams");
            }
            for server in servers {
                println!(
                    "{} [{:?}] mode={:?} last_error={}",
                    server.interface_name, server.phase, server.serving_mode, server.last_error
                );
            }
        }
        Response::Registered => println!("registered"),
    }
}

fn determine_exitcode(resp: &Response) -> ExitCode {
    match resp {
        Response::Result { code } if code.is_success() => exitcode::OK,
        Response::Result { .. } => exitcode::UNAVAILABLE,
        Response::EntitlementResult { code, .. } if code.is_success() => exitcode::OK,
        Response::EntitlementResult { .. } => exitcode::UNAVAILABLE,
        Response::TetheringSupported { .. } => exitcode::OK,
        Response::Status { .. } => exitcode::OK,
        Response::Registered => exitcode::OK,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn successful_result_exits_ok() {
        let resp = Response::Result { code: ErrorCode::NoError };
        assert_eq!(determine_exitcode(&resp), exitcode::OK);
    }

    #[test]
    fn failed_result_exits_unavailable() {
        let resp = Response::Result { code: ErrorCode::UnknownIface };
        assert_eq!(determine_exitcode(&resp), exitcode::UNAVAILABLE);
    }
}
