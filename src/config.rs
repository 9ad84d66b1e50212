//! Configuration intake (spec §4.4, §6): the XML-shaped configuration
//! document, its resolution rules, and the plain [`PoolConfig`] it is
//! converted into before reaching [`crate::pool::Pool::configure_with_driver`].

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::endpoint::{ServerEndpoint, DEFAULT_PORT};
use crate::error::PoolError;

/// "Three strikes" (the source's constant), exposed here as a configuration
/// parameter per Design Notes §9.
pub const DEFAULT_FAILURE_BUDGET: u32 = 3;

fn default_command() -> String {
    if let Ok(over) = std::env::var("RSERVE_COMMAND") {
        return over;
    }
    if cfg!(windows) {
        "Rserve.exe".to_string()
    } else {
        "Rserve".to_string()
    }
}

/// One `<RServer>` row of the configuration document.
#[derive(Debug, Clone, Deserialize)]
pub struct RServerEntry {
    #[serde(rename = "@host")]
    pub host: String,
    #[serde(rename = "@port", default)]
    pub port: Option<u16>,
    #[serde(rename = "@username", default)]
    pub username: Option<String>,
    #[serde(rename = "@password", default)]
    pub password: Option<String>,
    #[serde(rename = "@embedded", default)]
    pub embedded: bool,
    #[serde(rename = "@command", default)]
    pub command: Option<String>,
}

/// The `<RConfiguration>` wrapper.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RConfiguration {
    #[serde(rename = "RServer", default)]
    pub server: Vec<RServerEntry>,
}

/// The document root, `<RConnectionPool>`.
#[derive(Debug, Clone, Deserialize)]
pub struct RConnectionPoolDocument {
    #[serde(rename = "RConfiguration")]
    pub configuration: RConfiguration,
}

/// One enrolled endpoint plus the bookkeeping the pool needs at configure
/// time (the Rust analogue of `PoolConfig`'s source-document row, already
/// defaulted and validated).
#[derive(Debug, Clone)]
pub struct PoolEntry {
    pub endpoint: ServerEndpoint,
    pub embedded: bool,
    pub command: String,
}

/// A fully resolved, defaulted pool configuration: what `Pool::configure*`
/// actually consumes. Kept around on the live pool so `reopen` (spec §4.3)
/// can rebuild from it.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub entries: Vec<PoolEntry>,
    pub failure_budget: u32,
}

impl PoolConfig {
    /// A configuration with no servers; configuring a pool with this
    /// immediately yields a closed pool (spec §4.4).
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
            failure_budget: DEFAULT_FAILURE_BUDGET,
        }
    }

    /// Overrides the three-strikes retry budget.
    pub fn failure_budget(mut self, budget: u32) -> Self {
        self.failure_budget = budget;
        self
    }

    /// Adds one endpoint.
    pub fn with_entry(mut self, entry: PoolEntry) -> Self {
        self.entries.push(entry);
        self
    }
}

impl TryFrom<RConnectionPoolDocument> for PoolConfig {
    type Error = PoolError;

    fn try_from(doc: RConnectionPoolDocument) -> Result<Self, Self::Error> {
        let mut entries = Vec::with_capacity(doc.configuration.server.len());
        for row in doc.configuration.server {
            if row.host.trim().is_empty() {
                return Err(PoolError::ConfigInvalid(
                    "RServer entry is missing a host".to_string(),
                ));
            }
            let mut endpoint = ServerEndpoint::new(row.host, row.port.unwrap_or(DEFAULT_PORT));
            if let (Some(u), Some(p)) = (row.username, row.password) {
                endpoint = endpoint.with_credentials(u, p);
            }
            entries.push(PoolEntry {
                endpoint,
                embedded: row.embedded,
                command: row.command.unwrap_or_else(default_command),
            });
        }
        Ok(PoolConfig {
            entries,
            failure_budget: DEFAULT_FAILURE_BUDGET,
        })
    }
}

/// Parses an XML document already read into memory.
pub fn parse_document(xml: &str) -> Result<PoolConfig, PoolError> {
    let doc: RConnectionPoolDocument = quick_xml::de::from_str(xml)
        .map_err(|e| PoolError::ConfigInvalid(e.to_string()))?;
    PoolConfig::try_from(doc)
}

/// Reads and parses the configuration document at `path`.
pub fn load_from_path(path: &Path) -> Result<PoolConfig, PoolError> {
    let xml = std::fs::read_to_string(path)
        .map_err(|e| PoolError::ConfigInvalid(format!("{}: {e}", path.display())))?;
    parse_document(&xml)
}

/// Implements the resolution order of spec §6: `RCONNECTIONPOOL_CONFIGURATION`
/// (the Rust analogue of the source's `RConnectionPool.configuration` system
/// property) is tried first as a URL, then as a path; absent that, the
/// default name `RConnectionPool.xml` is searched next to the current
/// directory and next to the running executable.
pub fn load_default() -> Result<PoolConfig, PoolError> {
    if let Ok(configured) = std::env::var("RCONNECTIONPOOL_CONFIGURATION") {
        return load_from_configured(&configured);
    }

    let candidates = default_search_paths();
    for candidate in &candidates {
        if candidate.is_file() {
            return load_from_path(candidate);
        }
    }
    Err(PoolError::ConfigInvalid(format!(
        "RConnectionPool.xml not found in any of: {}",
        candidates
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    )))
}

/// Resolves a `RCONNECTIONPOOL_CONFIGURATION` value, tried first as a URL
/// then as a path, per spec §6. `http://`/`https://` is fetched over the
/// network; `file://` and bare paths are read from disk.
fn load_from_configured(configured: &str) -> Result<PoolConfig, PoolError> {
    if configured.starts_with("http://") || configured.starts_with("https://") {
        let xml = fetch_url(configured)?;
        return parse_document(&xml);
    }
    let path = configured
        .strip_prefix("file://")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(configured));
    load_from_path(&path)
}

fn fetch_url(url: &str) -> Result<String, PoolError> {
    reqwest::blocking::get(url)
        .and_then(|resp| resp.error_for_status())
        .and_then(|resp| resp.text())
        .map_err(|e| PoolError::ConfigInvalid(format!("{url}: {e}")))
}

fn default_search_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("RConnectionPool.xml")];
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            paths.push(dir.join("RConnectionPool.xml"));
        }
    }
    paths
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_document() {
        let xml = r#"
            <RConnectionPool>
              <RConfiguration>
                <RServer host="localhost" port="6311"/>
              </RConfiguration>
            </RConnectionPool>
        "#;
        let config = parse_document(xml).unwrap();
        assert_eq!(config.entries.len(), 1);
        assert_eq!(config.entries[0].endpoint.host(), "localhost");
        assert_eq!(config.entries[0].endpoint.port(), 6311);
        assert!(!config.entries[0].embedded);
    }

    #[test]
    fn defaults_port_and_command() {
        let xml = r#"
            <RConnectionPool>
              <RConfiguration>
                <RServer host="h"/>
              </RConfiguration>
            </RConnectionPool>
        "#;
        let config = parse_document(xml).unwrap();
        assert_eq!(config.entries[0].endpoint.port(), DEFAULT_PORT);
    }

    #[test]
    fn empty_configuration_yields_zero_entries() {
        let xml = r#"
            <RConnectionPool>
              <RConfiguration>
              </RConfiguration>
            </RConnectionPool>
        "#;
        let config = parse_document(xml).unwrap();
        assert!(config.entries.is_empty());
    }

    #[test]
    fn blank_host_is_config_invalid() {
        let xml = r#"
            <RConnectionPool>
              <RConfiguration>
                <RServer host=""/>
              </RConfiguration>
            </RConnectionPool>
        "#;
        assert!(parse_document(xml).is_err());
    }

    #[test]
    fn configured_value_with_file_prefix_strips_it() {
        let dir = std::env::temp_dir().join("rstat_pool_config_test_file_prefix");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("RConnectionPool.xml");
        std::fs::write(
            &path,
            r#"<RConnectionPool><RConfiguration><RServer host="h"/></RConfiguration></RConnectionPool>"#,
        )
        .unwrap();

        let configured = format!("file://{}", path.display());
        let config = load_from_configured(&configured).unwrap();
        assert_eq!(config.entries[0].endpoint.host(), "h");
    }

    #[test]
    fn configured_value_without_scheme_is_a_bare_path() {
        let dir = std::env::temp_dir().join("rstat_pool_config_test_bare_path");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("RConnectionPool.xml");
        std::fs::write(
            &path,
            r#"<RConnectionPool><RConfiguration><RServer host="h2"/></RConfiguration></RConnectionPool>"#,
        )
        .unwrap();

        let config = load_from_configured(&path.display().to_string()).unwrap();
        assert_eq!(config.entries[0].endpoint.host(), "h2");
    }

    #[test]
    fn configured_value_with_http_scheme_is_routed_through_fetch() {
        // No live network in the test environment: an unresolvable host
        // surfaces as a ConfigInvalid from `fetch_url` rather than being
        // misread as a (bogus) local file path.
        let result = load_from_configured("http://rstat-pool.invalid/RConnectionPool.xml");
        assert!(matches!(result, Err(PoolError::ConfigInvalid(_))));
    }
}
