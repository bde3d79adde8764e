use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("interface not found: {0}")]
    NoSuchInterface(String),
    #[error("invalid interface name: {0}")]
    InvalidInterfaceName(String),
    #[error("netlink error: {0}")]
    Netlink(String),
    #[error("nftables error: {0}")]
    NfTables(String),
    #[cfg(target_os = "linux")]
    #[error("rtnetlink error: {0}")]
    Rtnetlink(#[from] rtnetlink::Error),
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
    #[error("this operation is not available on this platform")]
    NotAvailable,
}
