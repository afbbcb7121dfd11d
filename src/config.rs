//! Daemon and feeds configuration
//!
//! Two INI files, as the frontends expect them: `srnd.ini` with the daemon
//! settings and `feeds.ini` describing outbound peers. Missing files are
//! generated with documented defaults so a first run comes up listening.

use crate::error::{NntpdError, Result};
use crate::validation::parse_addr;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::info;

/// Parsed INI text: section name to key/value map
pub type IniSections = BTreeMap<String, BTreeMap<String, String>>;

/// Minimal INI reader: `[section]`, `key = value`, `;`/`#` comments
pub fn parse_ini(text: &str) -> IniSections {
    let mut sections: IniSections = BTreeMap::new();
    let mut current = String::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
            continue;
        }
        if line.starts_with('[') && line.ends_with(']') {
            current = line[1..line.len() - 1].trim().to_string();
            sections.entry(current.clone()).or_default();
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            sections
                .entry(current.clone())
                .or_default()
                .insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    sections
}

/// Main daemon configuration (`srnd.ini`)
#[derive(Debug, Clone)]
pub struct Config {
    /// Log level name fed to the tracing filter
    pub log_level: String,
    /// Index database URL, `sqlite:///<path>` or `sqlite:///:memory:`
    pub database_url: String,
    /// Article blob directory
    pub base_dir: PathBuf,
    /// Name this instance prepends to the Path header
    pub instance_name: String,
    /// Listener bind host (IPv6 supported, unbracketed)
    pub bind_host: String,
    /// Listener bind port
    pub bind_port: u16,
    /// Re-offer every stored article to the feeds on startup
    pub sync_on_start: bool,
    /// Optional unix socket path for the frontend IPC bridge
    pub frontend_socket: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        let user = std::env::var("USER").unwrap_or_else(|_| "anon".to_string());
        Self {
            log_level: "info".to_string(),
            database_url: "sqlite:///srnd.db".to_string(),
            base_dir: PathBuf::from("./articles/"),
            instance_name: format!("{}.srndv2.tld", user),
            bind_host: "::1".to_string(),
            bind_port: 1199,
            sync_on_start: true,
            frontend_socket: None,
        }
    }
}

impl Config {
    /// Load the main config, generating a default file if absent
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            let defaults = Self::default();
            std::fs::write(path, defaults.render())?;
            info!("generated default config at {}", path.display());
            return Ok(defaults);
        }
        let text = std::fs::read_to_string(path)?;
        Self::from_sections(&parse_ini(&text))
    }

    fn from_sections(sections: &IniSections) -> Result<Self> {
        let defaults = Self::default();
        let get = |section: &str, key: &str| -> Option<String> {
            sections.get(section).and_then(|s| s.get(key)).cloned()
        };
        let bind_port = match get("srnd", "bind_port") {
            Some(p) => p
                .parse()
                .map_err(|_| NntpdError::Config(format!("bad srnd.bind_port: {}", p)))?,
            None => defaults.bind_port,
        };
        Ok(Self {
            log_level: get("log", "level").unwrap_or(defaults.log_level),
            database_url: get("database", "url").unwrap_or(defaults.database_url),
            base_dir: get("store", "base_dir")
                .map(PathBuf::from)
                .unwrap_or(defaults.base_dir),
            instance_name: get("srnd", "instance_name").unwrap_or(defaults.instance_name),
            bind_host: get("srnd", "bind_host").unwrap_or(defaults.bind_host),
            bind_port,
            sync_on_start: get("srnd", "sync_on_start")
                .map(|v| v == "1")
                .unwrap_or(defaults.sync_on_start),
            frontend_socket: get("frontend", "socket").map(PathBuf::from),
        })
    }

    fn render(&self) -> String {
        format!(
            "[log]\nlevel = {}\n\n\
             [database]\nurl = {}\n\n\
             [store]\nbase_dir = {}\n\n\
             [srnd]\ninstance_name = {}\nbind_host = {}\nbind_port = {}\nsync_on_start = {}\n",
            self.log_level,
            self.database_url,
            self.base_dir.display(),
            self.instance_name,
            self.bind_host,
            self.bind_port,
            if self.sync_on_start { "1" } else { "0" },
        )
    }
}

/// Proxy settings for one outbound feed; only SOCKS4a is spoken
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
}

/// One outbound peer from `feeds.ini`
///
/// A peer is described by a `feed-<host:port>` section carrying the optional
/// proxy keys, and a sibling `<host:port>` section whose `"1"`-valued keys are
/// the subscription rules.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// `host:port` as written in the section name
    pub name: String,
    pub host: String,
    pub port: u16,
    pub proxy: Option<ProxyConfig>,
    /// Raw rule strings; compiled into a FeedPolicy when the feed spawns
    pub rules: Vec<String>,
}

const DEFAULT_FEEDS: &str = "\
; outbound peers\n\
; [feed-some.onion:119]\n\
; proxy-type = socks4a\n\
; proxy-host = 127.0.0.1\n\
; proxy-port = 9050\n\
; [some.onion:119]\n\
; overchan.* = 1\n\
; ctl = 1\n";

/// Load all feeds from `feeds.ini`, generating a commented template if absent
pub fn load_feeds(path: impl AsRef<Path>) -> Result<Vec<FeedConfig>> {
    let path = path.as_ref();
    if !path.exists() {
        std::fs::write(path, DEFAULT_FEEDS)?;
        info!("generated feeds template at {}", path.display());
        return Ok(Vec::new());
    }
    let text = std::fs::read_to_string(path)?;
    feeds_from_sections(&parse_ini(&text))
}

fn feeds_from_sections(sections: &IniSections) -> Result<Vec<FeedConfig>> {
    let mut feeds = Vec::new();
    for (section, keys) in sections {
        let Some(name) = section.strip_prefix("feed-") else {
            continue;
        };
        let (host, port) = parse_addr(name)?;
        let proxy = match keys.get("proxy-type").map(String::as_str) {
            None => None,
            Some("socks4a") => {
                let host = keys
                    .get("proxy-host")
                    .ok_or_else(|| {
                        NntpdError::Config(format!("{}: proxy-host missing", section))
                    })?
                    .clone();
                let port = keys
                    .get("proxy-port")
                    .and_then(|p| p.parse().ok())
                    .ok_or_else(|| {
                        NntpdError::Config(format!("{}: bad proxy-port", section))
                    })?;
                Some(ProxyConfig { host, port })
            }
            Some(other) => {
                return Err(NntpdError::Config(format!(
                    "{}: unknown proxy-type {}",
                    section, other
                )));
            }
        };
        let rules = sections
            .get(name)
            .map(|policy| {
                policy
                    .iter()
                    .filter(|(_, v)| v.as_str() == "1")
                    .map(|(k, _)| k.clone())
                    .collect()
            })
            .unwrap_or_default();
        feeds.push(FeedConfig {
            name: name.to_string(),
            host,
            port,
            proxy,
            rules,
        });
    }
    Ok(feeds)
}
