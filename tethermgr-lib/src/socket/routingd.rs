//! Async client `tethermgr`'s `RoutingCoordinator` facade uses to reach the
//! privileged `tethermgr-routingd` helper over its root-only socket.

use std::io;
use std::path::Path;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use crate::routing_protocol::{RoutingRequest, RoutingResponse};

pub const DEFAULT_PATH: &str = "/run/tethermgr/routingd.sock";
pub const ENV_VAR: &str = "TETHERMGR_ROUTINGD_SOCKET_PATH";

#[derive(Debug, Error)]
pub enum Error {
    #[error("routingd not running")]
    ServiceNotRunning,
    #[error("failed serializing routing request: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    IO(#[from] io::Error),
}

pub async fn process_request(socket_path: &Path, request: &RoutingRequest) -> Result<RoutingResponse, Error> {
    check_path(socket_path)?;

    let mut stream = UnixStream::connect(socket_path).await?;

    let json = serde_json::to_string(request)?;
    push_request(&mut stream, &json).await?;
    let response = pull_response(&mut stream).await?;
    serde_json::from_str(&response).map_err(Error::Serialization)
}

fn check_path(socket_path: &Path) -> Result<(), Error> {
    match socket_path.try_exists() {
        Ok(true) => Ok(()),
        Ok(false) => Err(Error::ServiceNotRunning),
        Err(error) => Err(error.into()),
    }
}

async fn push_request(socket: &mut UnixStream, json: &str) -> Result<(), Error> {
    socket.write_all(json.as_bytes()).await?;
    socket.flush().await?;
    socket.shutdown().await.map_err(Error::from)
}

async fn pull_response(socket: &mut UnixStream) -> Result<String, Error> {
    let mut response = String::new();
    socket.read_to_string(&mut response).await.map(|_| response).map_err(Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tokio::net::UnixListener;

    #[tokio::test]
    async fn check_path_reports_service_not_running_when_socket_missing() {
        let tmp = tempdir().unwrap();
        let missing = tmp.path().join("missing.sock");
        assert!(matches!(check_path(&missing), Err(Error::ServiceNotRunning)));
    }

    #[tokio::test]
    async fn process_request_round_trips_through_a_listener() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("routingd.sock");
        let listener_path = path.clone();

        let server = tokio::spawn(async move {
            let listener = UnixListener::bind(&listener_path).unwrap();
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = String::new();
            stream.read_to_string(&mut buf).await.unwrap();
            let req: RoutingRequest = serde_json::from_str(&buf).unwrap();
            assert!(matches!(req, RoutingRequest::Ping));
            let json = serde_json::to_string(&RoutingResponse::Pong).unwrap();
            stream.write_all(json.as_bytes()).await.unwrap();
            stream.flush().await.unwrap();
        });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let resp = process_request(&path, &RoutingRequest::Ping).await.unwrap();
        assert!(matches!(resp, RoutingResponse::Pong));
        server.await.unwrap();
    }
}
