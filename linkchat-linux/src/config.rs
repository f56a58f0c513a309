//! Load config from file and environment.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use linkchat_core::{AcceptMode, MacAddr};
use serde::Deserialize;

use crate::engine::Settings;

/// Node configuration. File: $LINKCHAT_CONFIG, ~/.config/linkchat/config.toml or
/// /etc/linkchat/config.toml. Env overrides: LINKCHAT_INTERFACE, LINKCHAT_ACCEPT_MODE,
/// LINKCHAT_DOWNLOAD_DIR, RUN_MODE.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Interface to bind; first non-loopback interface when unset.
    #[serde(default)]
    pub interface: Option<String>,
    #[serde(default)]
    pub accept_mode: AcceptMode,
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    #[serde(default = "default_discovery_interval_ms")]
    pub discovery_interval_ms: u64,
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    #[serde(default = "default_ack_poll_ms")]
    pub ack_poll_ms: u64,
    #[serde(default = "default_unattended_delay_ms")]
    pub unattended_delay_ms: u64,
    #[serde(default = "default_chunk_pace_ms")]
    pub chunk_pace_ms: u64,
    /// Hand received items to the invoking sudo user.
    #[serde(default = "default_true")]
    pub fix_ownership: bool,
    /// Display names for known hardware addresses.
    #[serde(default)]
    pub aliases: HashMap<MacAddr, String>,
}

fn default_download_dir() -> PathBuf {
    PathBuf::from(".")
}
fn default_discovery_interval_ms() -> u64 {
    10_000
}
fn default_ack_timeout_ms() -> u64 {
    30_000
}
fn default_ack_poll_ms() -> u64 {
    1_000
}
fn default_unattended_delay_ms() -> u64 {
    200
}
fn default_chunk_pace_ms() -> u64 {
    2
}
fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interface: None,
            accept_mode: AcceptMode::default(),
            download_dir: default_download_dir(),
            discovery_interval_ms: default_discovery_interval_ms(),
            ack_timeout_ms: default_ack_timeout_ms(),
            ack_poll_ms: default_ack_poll_ms(),
            unattended_delay_ms: default_unattended_delay_ms(),
            chunk_pace_ms: default_chunk_pace_ms(),
            fix_ownership: default_true(),
            aliases: HashMap::new(),
        }
    }
}

impl Config {
    pub fn settings(&self) -> Settings {
        Settings {
            accept_mode: self.accept_mode,
            download_dir: self.download_dir.clone(),
            discovery_interval: Duration::from_millis(self.discovery_interval_ms),
            ack_timeout: Duration::from_millis(self.ack_timeout_ms),
            ack_poll: Duration::from_millis(self.ack_poll_ms.max(1)),
            unattended_delay: Duration::from_millis(self.unattended_delay_ms),
            chunk_pace: Duration::from_millis(self.chunk_pace_ms),
        }
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(s) = var("LINKCHAT_INTERFACE") {
            if !s.is_empty() {
                self.interface = Some(s);
            }
        }
        if let Some(s) = var("RUN_MODE") {
            if s.eq_ignore_ascii_case("cli") {
                self.accept_mode = AcceptMode::Unattended;
            }
        }
        if let Some(s) = var("LINKCHAT_ACCEPT_MODE") {
            match s.to_ascii_lowercase().as_str() {
                "interactive" => self.accept_mode = AcceptMode::Interactive,
                "unattended" => self.accept_mode = AcceptMode::Unattended,
                _ => tracing::warn!("ignoring LINKCHAT_ACCEPT_MODE={s}"),
            }
        }
        if let Some(s) = var("LINKCHAT_DOWNLOAD_DIR") {
            if !s.is_empty() {
                self.download_dir = PathBuf::from(s);
            }
        }
    }
}

/// Command-line overrides.
#[derive(Debug, Default)]
pub struct Flags {
    pub interface: Option<String>,
    pub unattended: bool,
}

impl Config {
    pub fn apply_flags(&mut self, flags: Flags) {
        if flags.interface.is_some() {
            self.interface = flags.interface;
        }
        if flags.unattended {
            self.accept_mode = AcceptMode::Unattended;
        }
    }
}

const SYSTEM_CONFIG: &str = "/etc/linkchat/config.toml";

/// Effective configuration, later layers winning: built-in defaults, one config file,
/// the environment, then `flags`. The file is `$LINKCHAT_CONFIG` when set (and must
/// exist), otherwise the first of the per-user and system files that exists.
pub fn load(flags: Flags) -> anyhow::Result<Config> {
    let var = |k: &str| std::env::var(k).ok();
    let file = match var("LINKCHAT_CONFIG") {
        Some(p) => Some(PathBuf::from(p)),
        None => {
            let home = std::env::var_os("HOME").map(PathBuf::from);
            candidates(home.as_deref()).into_iter().find(|p| p.exists())
        }
    };
    let mut c = match file {
        Some(p) => read_file(&p)?,
        None => Config::default(),
    };
    c.apply_env(var);
    c.apply_flags(flags);
    Ok(c)
}

/// Per-user file first, then the system one.
fn candidates(home: Option<&Path>) -> Vec<PathBuf> {
    home.map(|h| h.join(".config/linkchat/config.toml"))
        .into_iter()
        .chain(std::iter::once(PathBuf::from(SYSTEM_CONFIG)))
        .collect()
}

fn read_file(path: &Path) -> anyhow::Result<Config> {
    use anyhow::Context;

    let s = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    toml::from_str(&s).with_context(|| format!("parsing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_timings() {
        let s = Config::default().settings();
        assert_eq!(s.discovery_interval, Duration::from_secs(10));
        assert_eq!(s.ack_timeout, Duration::from_secs(30));
        assert_eq!(s.ack_poll, Duration::from_secs(1));
        assert_eq!(s.accept_mode, AcceptMode::Interactive);
    }

    #[test]
    fn parses_file_with_aliases() {
        let c: Config = toml::from_str(
            r#"
            interface = "eth0"
            accept_mode = "unattended"
            ack_timeout_ms = 500

            [aliases]
            "02:00:00:00:00:01" = "alice"
            "#,
        )
        .unwrap();
        assert_eq!(c.interface.as_deref(), Some("eth0"));
        assert_eq!(c.accept_mode, AcceptMode::Unattended);
        assert_eq!(c.ack_timeout_ms, 500);
        let alice: MacAddr = "02:00:00:00:00:01".parse().unwrap();
        assert_eq!(c.aliases.get(&alice).map(String::as_str), Some("alice"));
        assert_eq!(c.discovery_interval_ms, 10_000);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(toml::from_str::<Config>("proxy_port = 3128").is_err());
    }

    #[test]
    fn env_overrides_file() {
        let mut c = Config::default();
        c.apply_env(|k| match k {
            "LINKCHAT_INTERFACE" => Some("wlan0".into()),
            "LINKCHAT_DOWNLOAD_DIR" => Some("/tmp/in".into()),
            "RUN_MODE" => Some("CLI".into()),
            _ => None,
        });
        assert_eq!(c.interface.as_deref(), Some("wlan0"));
        assert_eq!(c.download_dir, PathBuf::from("/tmp/in"));
        assert_eq!(c.accept_mode, AcceptMode::Unattended);
    }

    #[test]
    fn user_file_is_searched_before_system_file() {
        assert_eq!(
            candidates(Some(Path::new("/home/ana"))),
            vec![
                PathBuf::from("/home/ana/.config/linkchat/config.toml"),
                PathBuf::from(SYSTEM_CONFIG),
            ]
        );
        assert_eq!(candidates(None), vec![PathBuf::from(SYSTEM_CONFIG)]);
    }

    #[test]
    fn flags_override_file_and_env() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "interface = \"eth0\"\naccept_mode = \"interactive\"\n").unwrap();
        let mut c = read_file(&path).unwrap();
        c.apply_env(|k| (k == "LINKCHAT_INTERFACE").then(|| "wlan0".to_string()));
        assert_eq!(c.interface.as_deref(), Some("wlan0"));

        c.apply_flags(Flags {
            interface: Some("enp3s0".into()),
            unattended: true,
        });
        assert_eq!(c.interface.as_deref(), Some("enp3s0"));
        assert_eq!(c.accept_mode, AcceptMode::Unattended);

        c.apply_flags(Flags::default());
        assert_eq!(c.interface.as_deref(), Some("enp3s0"));
    }

    #[test]
    fn unreadable_file_names_its_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.toml");
        let err = read_file(&path).unwrap_err();
        assert!(err.to_string().contains("missing.toml"));
    }

    #[test]
    fn explicit_accept_mode_wins_over_run_mode() {
        let mut c = Config::default();
        c.apply_env(|k| match k {
            "RUN_MODE" => Some("CLI".into()),
            "LINKCHAT_ACCEPT_MODE" => Some("interactive".into()),
            _ => None,
        });
        assert_eq!(c.accept_mode, AcceptMode::Interactive);
    }
}
