//! Daemon configuration parsing from rsktd.conf
//!
//! Shell-style `KEY=value` lines (comments, `export` and quotes accepted):
//! - RSKTD_CT (component tag of this node)
//! - RSKTD_APP_SOCKET (path of the application socket)
//! - RSKTD_PEER_ADDR (host:port the peer listener binds)
//! - RSKTD_MPORT, RSKTD_CM_SKT
//! - RSKTD_MS_COUNT, RSKTD_MS_SIZE (memory space pool)
//! - RSKTD_MAX_BACKLOG, RSKTD_MAX_APPS, RSKTD_MAX_PEERS
//! - RSKTD_DYN_SN_START (first dynamically assigned socket number)
//! - RSKTD_DIRECTORY_POLL_MS, RSKTD_PEER_TIMEOUT_MS
//! - RSKTD_LOG (default log filter)
//! - RSKTD_PEER_<ct>="host:port" (static directory entry)
//!
//! Numbers may be written in hex with a `0x` prefix.

use crate::daemon::directory::PeerInfo;
use crate::daemon::registry::DEFAULT_DYNAMIC_START;
use crate::daemon::serializer::{BrokerLimits, LocalNode};
use std::fs;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding the config file location
pub const CONFIG_ENV: &str = "RSKTD_CONFIG";

/// Complete daemon configuration
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Component tag of this node
    pub ct: u32,
    pub app_socket: PathBuf,
    /// Address the speer listener binds
    pub peer_addr: SocketAddr,
    pub mport: u8,
    /// Control channel number announced in HELLO
    pub cm_skt: u16,
    pub ms_count: usize,
    pub ms_size: u32,
    pub max_backlog: u32,
    pub max_apps: usize,
    pub max_peers: usize,
    pub dynamic_start: u16,
    pub directory_poll: Duration,
    /// Connect and handshake timeout for wpeers
    pub peer_timeout: Duration,
    pub log_level: String,
    /// Static directory entries
    pub peers: Vec<PeerInfo>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            ct: 1,
            app_socket: Self::default_socket_path(),
            peer_addr: SocketAddr::from(([0, 0, 0, 0], 7090)),
            mport: 0,
            cm_skt: 1,
            ms_count: 16,
            ms_size: 0x10_0000,
            max_backlog: 64,
            max_apps: 64,
            max_peers: 64,
            dynamic_start: DEFAULT_DYNAMIC_START,
            directory_poll: Duration::from_millis(1000),
            peer_timeout: Duration::from_millis(3000),
            log_level: "info".to_string(),
            peers: Vec::new(),
        }
    }
}

impl DaemonConfig {
    /// Load from `$RSKTD_CONFIG` or the default file; defaults if absent
    pub fn load() -> Self {
        Self::from_file(&Self::config_path()).unwrap_or_default()
    }

    /// Directory holding the default socket, PID file and config
    pub fn rsktd_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".rsktd")
    }

    /// Get the path to the config file
    pub fn config_path() -> PathBuf {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => PathBuf::from(path),
            None => Self::rsktd_dir().join("rsktd.conf"),
        }
    }

    pub fn default_socket_path() -> PathBuf {
        Self::rsktd_dir().join("rsktd.sock")
    }

    /// PID file, next to the application socket
    pub fn pid_path(&self) -> PathBuf {
        self.app_socket
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join("rsktd.pid")
    }

    /// Parse configuration from a specific file
    pub fn from_file(path: &Path) -> Option<Self> {
        let content = fs::read_to_string(path).ok()?;
        Some(Self::parse(&content))
    }

    /// Parse configuration from content string
    pub fn parse(content: &str) -> Self {
        let mut config = DaemonConfig::default();

        for line in content.lines() {
            let line = line.trim();

            // Skip comments and empty lines
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let line = line.strip_prefix("export ").unwrap_or(line);

            let Some((key, value)) = parse_assignment(line) else {
                continue;
            };
            let value = unquote(&value);

            match key.as_str() {
                "RSKTD_CT" => set(&mut config.ct, &value),
                "RSKTD_APP_SOCKET" if !value.is_empty() => config.app_socket = PathBuf::from(value),
                "RSKTD_PEER_ADDR" => {
                    if let Some(addr) = resolve(&value) {
                        config.peer_addr = addr;
                    }
                }
                "RSKTD_MPORT" => set(&mut config.mport, &value),
                "RSKTD_CM_SKT" => set(&mut config.cm_skt, &value),
                "RSKTD_MS_COUNT" => set(&mut config.ms_count, &value),
                "RSKTD_MS_SIZE" => set(&mut config.ms_size, &value),
                "RSKTD_MAX_BACKLOG" => set(&mut config.max_backlog, &value),
                "RSKTD_MAX_APPS" => set(&mut config.max_apps, &value),
                "RSKTD_MAX_PEERS" => set(&mut config.max_peers, &value),
                "RSKTD_DYN_SN_START" => {
                    if let Some(sn) = parse_number::<u16>(&value).filter(|sn| *sn > 0) {
                        config.dynamic_start = sn;
                    }
                }
                "RSKTD_DIRECTORY_POLL_MS" => {
                    if let Some(ms) = parse_number::<u64>(&value).filter(|ms| *ms > 0) {
                        config.directory_poll = Duration::from_millis(ms);
                    }
                }
                "RSKTD_PEER_TIMEOUT_MS" => {
                    if let Some(ms) = parse_number::<u64>(&value).filter(|ms| *ms > 0) {
                        config.peer_timeout = Duration::from_millis(ms);
                    }
                }
                "RSKTD_LOG" if !value.is_empty() => config.log_level = value,
                _ if key.starts_with("RSKTD_PEER_") => {
                    let suffix = &key["RSKTD_PEER_".len()..];
                    // RSKTD_PEER_<ct>="host:port"
                    if let (Some(ct), Some(addr)) = (parse_number::<u32>(suffix), resolve(&value)) {
                        config.peers.retain(|p| p.ct != ct);
                        config.peers.push(PeerInfo { ct, addr, advertises_rskt: true });
                    }
                }
                _ => {}
            }
        }

        // Deterministic ordering
        config.peers.sort_by_key(|p| p.ct);

        config
    }

    /// Identity announced to peers
    pub fn local_node(&self) -> LocalNode {
        LocalNode {
            ct: self.ct,
            cm_skt: self.cm_skt,
            mport: self.mport,
            pid: std::process::id(),
        }
    }

    pub fn limits(&self) -> BrokerLimits {
        BrokerLimits {
            max_apps: self.max_apps,
            max_peers: self.max_peers,
            max_backlog: self.max_backlog,
            dynamic_start: self.dynamic_start,
        }
    }
}

/// Overwrite `slot` when `value` parses; malformed values keep the default
fn set<T: TryFrom<u64>>(slot: &mut T, value: &str) {
    if let Some(parsed) = parse_number(value) {
        *slot = parsed;
    }
}

/// Decimal or `0x` hex number that fits `T`
fn parse_number<T: TryFrom<u64>>(value: &str) -> Option<T> {
    let value = value.trim();
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok()?,
        None => value.parse::<u64>().ok()?,
    };
    T::try_from(parsed).ok()
}

fn resolve(value: &str) -> Option<SocketAddr> {
    value.to_socket_addrs().ok()?.next()
}

/// Parse a shell variable assignment (KEY=value or KEY="value")
fn parse_assignment(line: &str) -> Option<(String, String)> {
    let eq_pos = line.find('=')?;
    let key = line[..eq_pos].trim().to_string();
    let value = line[eq_pos + 1..].trim().to_string();

    // Validate key is a valid identifier
    if key.is_empty() || !key.chars().all(|c| c.is_alphanumeric() || c == '_') {
        return None;
    }

    Some((key, value))
}

/// Remove surrounding quotes from a value
fn unquote(s: &str) -> String {
    let s = s.trim();

    if s.len() >= 2 && ((s.starts_with('"') && s.ends_with('"')) || (s.starts_with('\'') && s.ends_with('\''))) {
        return s[1..s.len() - 1].to_string();
    }

    s.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_identity_and_limits() {
        let content = r#"
# node identity
export RSKTD_CT=0x20
RSKTD_MPORT=1
RSKTD_CM_SKT="4"
RSKTD_MAX_BACKLOG=8
RSKTD_DYN_SN_START=0x8000
RSKTD_APP_SOCKET='/tmp/rsktd-test.sock'
"#;
        let config = DaemonConfig::parse(content);
        assert_eq!(config.ct, 0x20);
        assert_eq!(config.mport, 1);
        assert_eq!(config.cm_skt, 4);
        assert_eq!(config.limits().max_backlog, 8);
        assert_eq!(config.dynamic_start, 0x8000);
        assert_eq!(config.app_socket, PathBuf::from("/tmp/rsktd-test.sock"));
        assert_eq!(config.pid_path(), PathBuf::from("/tmp/rsktd.pid"));
    }

    #[test]
    fn test_parse_static_peers() {
        let content = r#"
RSKTD_PEER_0x30="127.0.0.1:7001"
RSKTD_PEER_16=127.0.0.1:7000
RSKTD_PEER_bogus=127.0.0.1:7002
RSKTD_PEER_17=not-an-address
"#;
        let config = DaemonConfig::parse(content);
        let cts: Vec<u32> = config.peers.iter().map(|p| p.ct).collect();
        assert_eq!(cts, vec![16, 0x30]);
        assert_eq!(config.peers[1].addr, SocketAddr::from(([127, 0, 0, 1], 7001)));
        assert!(config.peers.iter().all(|p| p.advertises_rskt));
    }

    #[test]
    fn test_malformed_values_keep_defaults() {
        let defaults = DaemonConfig::default();
        let content = "RSKTD_MPORT=300\nRSKTD_MS_COUNT=lots\nRSKTD_DYN_SN_START=0\nRSKTD_DIRECTORY_POLL_MS=0\nnot a line\n";
        let config = DaemonConfig::parse(content);
        assert_eq!(config.mport, defaults.mport);
        assert_eq!(config.ms_count, defaults.ms_count);
        assert_eq!(config.dynamic_start, defaults.dynamic_start);
        assert_eq!(config.directory_poll, defaults.directory_poll);
    }

    #[test]
    fn test_parse_assignment_and_unquote() {
        assert_eq!(
            parse_assignment("RSKTD_LOG = debug"),
            Some(("RSKTD_LOG".to_string(), "debug".to_string()))
        );
        assert_eq!(parse_assignment("BAD KEY=1"), None);
        assert_eq!(unquote("\"a b\""), "a b");
        assert_eq!(unquote("'x'"), "x");
        assert_eq!(unquote("\""), "\"");
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rsktd.conf");
        fs::write(&path, "RSKTD_CT=7\nRSKTD_PEER_TIMEOUT_MS=250\n").unwrap();
        let config = DaemonConfig::from_file(&path).unwrap();
        assert_eq!(config.ct, 7);
        assert_eq!(config.peer_timeout, Duration::from_millis(250));
        assert!(DaemonConfig::from_file(&dir.path().join("missing.conf")).is_none());
    }
}
