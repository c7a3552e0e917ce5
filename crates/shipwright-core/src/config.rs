use std::{collections::HashMap, path::PathBuf, time::Duration};

use anyhow::{bail, Result};

/// A repository whose pushes trigger builds, and where to report them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoConfig {
    /// `owner/name`, as in the push payload's `repository.full_name`.
    pub name: String,
    /// Empty = report to `default_channel`.
    pub channel: String,
}

/// Full application configuration, read from `.env` overlaid by the process environment.
#[derive(Debug, Clone)]
pub struct Config {
    // HTTP
    pub web_bind: String,
    pub web_port: u16,

    // Checkouts
    pub workspace_dir: PathBuf,
    pub git_bin: String,
    pub git_default_host: String,

    // Container toolchain
    pub docker_bin: String,
    pub build_no_cache: bool,
    pub run_timeout_s: u64,
    pub run_grace_s: u64,
    pub run_after_push: bool,

    // Notifications
    pub slack_webhook_url: String,
    pub slack_username: String,
    pub slack_icon_url: String,
    pub notify_timeout_s: u64,
    pub default_channel: String,

    // Command source
    pub chat_token: String,
    pub bot_username: String,
    pub command_prefix: String,
    pub watched_repos: Vec<RepoConfig>,
}

fn parse_dotenv(path: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    let Ok(contents) = std::fs::read_to_string(path) else {
        return map;
    };
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((k, v)) = line.split_once('=') {
            let v = v.trim();
            let v = v
                .strip_prefix('"')
                .and_then(|s| s.strip_suffix('"'))
                .unwrap_or(v);
            map.insert(k.trim().to_string(), v.to_string());
        }
    }
    map
}

fn get_str(key: &str, vars: &HashMap<String, String>, default: &str) -> String {
    vars.get(key).cloned().unwrap_or_else(|| default.to_string())
}

fn get_bool(key: &str, vars: &HashMap<String, String>, default: bool) -> bool {
    match vars.get(key).map(|v| v.to_ascii_lowercase()).as_deref() {
        Some("true") | Some("1") | Some("yes") => true,
        Some("false") | Some("0") | Some("no") => false,
        Some(_) => default,
        None => default,
    }
}

fn get_u64(key: &str, vars: &HashMap<String, String>, default: u64) -> u64 {
    vars.get(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn get_u16(key: &str, vars: &HashMap<String, String>, default: u16) -> u16 {
    vars.get(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn resolve_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return format!("{home}/{rest}");
        }
    }
    path.to_string()
}

/// `owner/name[:#channel]` entries separated by `|`.
fn parse_watched_repos(raw: &str) -> Vec<RepoConfig> {
    raw.split('|')
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .map(|entry| {
            let (name, channel) = entry.split_once(':').unwrap_or((entry, ""));
            RepoConfig {
                name: name.trim().to_string(),
                channel: channel.trim().to_string(),
            }
        })
        .filter(|r| !r.name.is_empty())
        .collect()
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let mut vars = parse_dotenv(".env");
        // Process environment wins over .env.
        vars.extend(std::env::vars());
        Self::from_vars(&vars)
    }

    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self> {
        let workspace_dir = match vars.get("WORKSPACE_DIR").filter(|v| !v.is_empty()) {
            Some(dir) => PathBuf::from(resolve_tilde(dir)),
            None => std::env::temp_dir().join("shipwright"),
        };

        let config = Config {
            web_bind: get_str("WEB_BIND", vars, "127.0.0.1"),
            web_port: get_u16("WEB_PORT", vars, 3131),
            workspace_dir,
            git_bin: get_str("GIT_BIN", vars, "git"),
            git_default_host: get_str("GIT_DEFAULT_HOST", vars, "github.com"),
            docker_bin: get_str("DOCKER_BIN", vars, "docker"),
            build_no_cache: get_bool("BUILD_NO_CACHE", vars, false),
            run_timeout_s: get_u64("RUN_TIMEOUT_S", vars, 1800),
            run_grace_s: get_u64("RUN_GRACE_S", vars, 30),
            run_after_push: get_bool("RUN_AFTER_PUSH", vars, true),
            slack_webhook_url: get_str("SLACK_WEBHOOK_URL", vars, ""),
            slack_username: get_str("SLACK_USERNAME", vars, "shipwright"),
            slack_icon_url: get_str("SLACK_ICON_URL", vars, ""),
            notify_timeout_s: get_u64("NOTIFY_TIMEOUT_S", vars, 5),
            default_channel: get_str("DEFAULT_CHANNEL", vars, "#builder"),
            chat_token: get_str("CHAT_TOKEN", vars, ""),
            bot_username: get_str("BOT_USERNAME", vars, "slackbot"),
            command_prefix: get_str("COMMAND_PREFIX", vars, "!docker"),
            watched_repos: parse_watched_repos(&get_str("WATCHED_REPOS", vars, "")),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.run_timeout_s == 0 {
            bail!("RUN_TIMEOUT_S must be greater than zero");
        }
        if self.command_prefix.trim().is_empty() {
            bail!("COMMAND_PREFIX must not be empty");
        }
        if self.git_default_host.trim().is_empty() {
            bail!("GIT_DEFAULT_HOST must not be empty");
        }
        Ok(())
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_s)
    }

    pub fn run_grace(&self) -> Duration {
        Duration::from_secs(self.run_grace_s)
    }

    pub fn notify_timeout(&self) -> Duration {
        Duration::from_secs(self.notify_timeout_s)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.web_bind, self.web_port)
    }

    /// Pushes are accepted for every repository when no watch list is configured.
    pub fn is_watched(&self, full_name: &str) -> bool {
        self.watched_repos.is_empty() || self.watched_repos.iter().any(|r| r.name == full_name)
    }

    pub fn channel_for(&self, full_name: &str) -> &str {
        self.watched_repos
            .iter()
            .find(|r| r.name == full_name && !r.channel.is_empty())
            .map(|r| r.channel.as_str())
            .unwrap_or(&self.default_channel)
    }
}
