//! Control-socket client, used by `tethermgr-ctl` and anything else acting
//! as an unprivileged caller against the `tethermgr` daemon.

pub mod routingd;

use std::io;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::command::{Command, Response};

pub const DEFAULT_PATH: &str = "/run/tethermgr/tethermgr.sock";
pub const ENV_VAR: &str = "TETHERMGR_SOCKET_PATH";

#[derive(Debug, Error)]
pub enum Error {
    #[error("service not running")]
    ServiceNotRunning,
    #[error("error accessing socket at `{socket_path}`: {error}")]
    SocketPathIO { socket_path: PathBuf, error: io::Error },
    #[error("error connecting socket at `{socket_path}`: {error}")]
    ConnectSocketIO { socket_path: PathBuf, error: io::Error },
    #[error("failed serializing command: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("error writing to socket: {0}")]
    WriteSocketIO(io::Error),
    #[error("error reading from socket: {0}")]
    ReadSocketIO(io::Error),
}

pub fn process_cmd(socket_path: &Path, cmd: &Command) -> Result<Response, Error> {
    check_path(socket_path)?;

    let mut stream = UnixStream::connect(socket_path)
        .map_err(|error| Error::ConnectSocketIO { socket_path: socket_path.to_path_buf(), error })?;

    let json_cmd = serde_json::to_string(cmd)?;
    push_command(&mut stream, &json_cmd)?;
    let response = pull_response(&mut stream)?;
    serde_json::from_str(&response).map_err(Error::Serialization)
}

fn check_path(socket_path: &Path) -> Result<(), Error> {
    match socket_path.try_exists() {
        Ok(true) => Ok(()),
        Ok(false) => Err(Error::ServiceNotRunning),
        Err(error) => Err(Error::SocketPathIO { socket_path: socket_path.to_path_buf(), error }),
    }
}

fn push_command(socket: &mut UnixStream, json_cmd: &str) -> Result<(), Error> {
    // Newline-terminated (§6.5) so the server can read exactly one command
    // line regardless of whether the connection is later shut down (one-shot
    // commands) or kept open for event streaming (`Command::Watch`).
    socket
        .write_all(json_cmd.as_bytes())
        .and_then(|_| socket.write_all(b"\n"))
        .map(|_| socket.flush())
        .and_then(|_| socket.shutdown(std::net::Shutdown::Write))
        .map_err(Error::WriteSocketIO)
}

fn pull_response(socket: &mut UnixStream) -> Result<String, Error> {
    let mut response = String::new();
    socket.read_to_string(&mut response).map(|_| response).map_err(Error::ReadSocketIO)
}
