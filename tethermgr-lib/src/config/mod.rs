use std::path::Path;
use thiserror::Error;

mod v1;

pub use v1::Config;

pub const DEFAULT_PATH: &str = "/etc/tethermgr/config.toml";
pub const ENV_VAR: &str = "TETHERMGR_CONFIG_PATH";

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration file not found")]
    NoFile,
    #[error("unable to determine configuration version")]
    VersionNotFound,
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
    #[error("deserialization error: {0}")]
    TomlDeserialization(#[from] toml::de::Error),
    #[error("unsupported config version: {0}")]
    VersionMismatch(i64),
}

pub fn read(path: &Path) -> Result<Config, Error> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::NoFile
        } else {
            Error::IO(e)
        }
    })?;

    let table = content.parse::<toml::Table>()?;
    let version = table.get("version").and_then(|v| v.as_integer()).ok_or(Error::VersionNotFound)?;

    match version {
        1 => {
            let config = toml::from_str::<v1::Config>(&content)?;
            for key in v1::wrong_keys(&table) {
                tracing::warn!(%key, "ignoring unsupported key in configuration file");
            }
            Ok(config)
        }
        other => Err(Error::VersionMismatch(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_is_reported_as_no_file() {
        let err = read(Path::new("/nonexistent/tethermgr/config.toml")).unwrap_err();
        assert!(matches!(err, Error::NoFile));
    }

    #[test]
    fn missing_version_field_is_reported() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "tethering_supported = true").unwrap();
        let err = read(file.path()).unwrap_err();
        assert!(matches!(err, Error::VersionNotFound));
    }

    #[test]
    fn unknown_version_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "version = 2").unwrap();
        let err = read(file.path()).unwrap_err();
        assert!(matches!(err, Error::VersionMismatch(2)));
    }

    #[test]
    fn valid_v1_file_parses() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            version = 1
            tethering_supported = true
            allow_vpn_upstreams = false
            dedicated_ip_policy = true
            "#
        )
        .unwrap();
        let config = read(file.path()).unwrap();
        assert!(config.tethering_supported);
        assert!(!config.allow_vpn_upstreams);
        assert!(config.dedicated_ip_policy);
    }
}
