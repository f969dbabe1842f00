use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;

use crate::engine::DEFAULT_TICKET_TIMEOUT;
use crate::error::BastionError;

const MAX_SETTINGS_FILE_SIZE: u64 = 64 * 1024; // 64 KiB

/// Env var naming the settings file. Overrides the path given on the command line.
pub const CONFIG_PATH_ENV: &str = "BASTION_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "bastion.toml";
const DEFAULT_LOG_FILTER: &str = "info";
const DEFAULT_SSH_TIMEOUT_SECS: u64 = 30;

// --- TOML deserialization structs (private, map 1:1 to TOML schema) ---

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct SettingsFile {
    policy_path: PathBuf,
    #[serde(default)]
    log_filter: Option<String>,
    #[serde(default)]
    tickets: Option<TicketsConfig>,
    #[serde(default)]
    ssh: Option<SshConfig>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct TicketsConfig {
    #[serde(default)]
    endpoint: Option<String>,
    #[serde(default)]
    timeout_ms: Option<u64>,
    /// Name of the env var holding the bearer token; the token itself never
    /// lives in the file.
    #[serde(default)]
    token_env: Option<String>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct SshConfig {
    #[serde(default)]
    options: Vec<String>,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    timeout_secs: Option<u64>,
}

// --- Resolved settings ---

#[derive(Debug)]
pub struct TicketSettings {
    pub endpoint: Option<String>,
    pub timeout: Duration,
    pub token: Option<SecretString>,
}

#[derive(Debug, Clone)]
pub struct SshSettings {
    pub options: Vec<String>,
    pub user: Option<String>,
    pub timeout: Duration,
}

/// Process settings for the `bastion` binary.
#[derive(Debug)]
pub struct Settings {
    /// Resolved against the settings file's directory when relative.
    pub policy_path: PathBuf,
    pub log_filter: String,
    pub tickets: TicketSettings,
    pub ssh: SshSettings,
}

impl FromStr for Settings {
    type Err = BastionError;

    /// Parse settings from a TOML string. Relative paths stay relative.
    fn from_str(content: &str) -> Result<Self, BastionError> {
        let file: SettingsFile =
            toml::from_str(content).map_err(|e| BastionError::Config(e.to_string()))?;
        Self::compile(file)
    }
}

impl Settings {
    /// The settings path: `BASTION_CONFIG` if set, else `fallback`.
    pub fn resolve_path(fallback: Option<&Path>) -> PathBuf {
        match std::env::var_os(CONFIG_PATH_ENV) {
            Some(path) if !path.is_empty() => PathBuf::from(path),
            _ => fallback.map_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH), Path::to_path_buf),
        }
    }

    /// Load settings from a TOML file. Checks file size before reading.
    pub fn load(path: &Path) -> Result<Self, BastionError> {
        let metadata = std::fs::metadata(path)
            .map_err(|e| BastionError::Config(format!("cannot read {}: {e}", path.display())))?;

        if metadata.len() > MAX_SETTINGS_FILE_SIZE {
            return Err(BastionError::Config(format!(
                "settings file exceeds {MAX_SETTINGS_FILE_SIZE} byte limit"
            )));
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| BastionError::Config(format!("cannot read {}: {e}", path.display())))?;

        let mut settings: Self = content.parse()?;
        if settings.policy_path.is_relative()
            && let Some(dir) = path.parent()
        {
            settings.policy_path = dir.join(&settings.policy_path);
        }
        Ok(settings)
    }

    fn compile(file: SettingsFile) -> Result<Self, BastionError> {
        if file.policy_path.as_os_str().is_empty() {
            return Err(BastionError::Config("policy_path must not be empty".into()));
        }

        let tickets = match file.tickets {
            Some(t) => {
                let timeout = match t.timeout_ms {
                    Some(0) => {
                        return Err(BastionError::Config(
                            "tickets.timeout_ms must be greater than zero".into(),
                        ));
                    }
                    Some(ms) => Duration::from_millis(ms),
                    None => DEFAULT_TICKET_TIMEOUT,
                };
                let token = match t.token_env.as_deref() {
                    Some(var) => match std::env::var(var) {
                        Ok(value) if !value.is_empty() => Some(SecretString::from(value)),
                        _ => {
                            tracing::warn!(env = var, "ticket token env var is unset");
                            None
                        }
                    },
                    None => None,
                };
                TicketSettings {
                    endpoint: t.endpoint.filter(|e| !e.trim().is_empty()),
                    timeout,
                    token,
                }
            }
            None => TicketSettings {
                endpoint: None,
                timeout: DEFAULT_TICKET_TIMEOUT,
                token: None,
            },
        };

        let ssh = match file.ssh {
            Some(s) => SshSettings {
                options: s.options,
                user: s.user.filter(|u| !u.trim().is_empty()),
                timeout: Duration::from_secs(s.timeout_secs.unwrap_or(DEFAULT_SSH_TIMEOUT_SECS)),
            },
            None => SshSettings {
                options: Vec::new(),
                user: None,
                timeout: Duration::from_secs(DEFAULT_SSH_TIMEOUT_SECS),
            },
        };

        Ok(Self {
            policy_path: file.policy_path,
            log_filter: file
                .log_filter
                .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_owned()),
            tickets,
            ssh,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use std::io::Write;

    #[test]
    fn minimal_settings_take_defaults() {
        let settings: Settings = r#"policy_path = "policy.toml""#.parse().unwrap();
        assert_eq!(settings.policy_path, PathBuf::from("policy.toml"));
        assert_eq!(settings.log_filter, "info");
        assert!(settings.tickets.endpoint.is_none());
        assert_eq!(settings.tickets.timeout, DEFAULT_TICKET_TIMEOUT);
        assert_eq!(settings.ssh.timeout, Duration::from_secs(30));
        assert!(settings.ssh.options.is_empty());
    }

    #[test]
    fn full_settings_parse() {
        let settings: Settings = r#"
            policy_path = "/etc/bastion/policy.toml"
            log_filter = "bastion=debug"

            [tickets]
            endpoint = "https://tickets.example.com/api"
            timeout_ms = 1500

            [ssh]
            options = ["-p", "2222"]
            user = "ops"
            timeout_secs = 5
        "#
        .parse()
        .unwrap();
        assert_eq!(settings.log_filter, "bastion=debug");
        assert_eq!(
            settings.tickets.endpoint.as_deref(),
            Some("https://tickets.example.com/api")
        );
        assert_eq!(settings.tickets.timeout, Duration::from_millis(1500));
        assert_eq!(settings.ssh.options, vec!["-p", "2222"]);
        assert_eq!(settings.ssh.user.as_deref(), Some("ops"));
        assert_eq!(settings.ssh.timeout, Duration::from_secs(5));
    }

    #[test]
    fn token_is_read_from_named_env_var() {
        // Unique name so parallel tests never race on it.
        let var = "BASTION_TEST_TICKET_TOKEN_7f3a";
        unsafe { std::env::set_var(var, "s3cret") };
        let settings: Settings = format!(
            "policy_path = \"p.toml\"\n[tickets]\nendpoint = \"http://t\"\ntoken_env = \"{var}\"\n"
        )
        .parse()
        .unwrap();
        let token = settings.tickets.token.unwrap();
        assert_eq!(token.expose_secret(), "s3cret");
        unsafe { std::env::remove_var(var) };
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = "policy_path = \"p\"\nsurprise = true\n"
            .parse::<Settings>()
            .unwrap_err();
        assert!(matches!(err, BastionError::Config(_)));
    }

    #[test]
    fn zero_ticket_timeout_is_rejected() {
        let err = "policy_path = \"p\"\n[tickets]\ntimeout_ms = 0\n"
            .parse::<Settings>()
            .unwrap_err();
        assert!(matches!(err, BastionError::Config(_)));
    }

    #[test]
    fn load_resolves_policy_path_next_to_settings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bastion.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "policy_path = \"policy.toml\"").unwrap();

        let settings = Settings::load(&path).unwrap();
        assert_eq!(settings.policy_path, dir.path().join("policy.toml"));
    }

    #[test]
    fn load_rejects_oversized_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.toml");
        let padding = "#".repeat(MAX_SETTINGS_FILE_SIZE as usize + 1);
        std::fs::write(&path, padding).unwrap();
        assert!(matches!(Settings::load(&path), Err(BastionError::Config(_))));
    }

    #[test]
    fn load_reports_missing_file() {
        let err = Settings::load(Path::new("/nonexistent/bastion.toml")).unwrap_err();
        assert!(err.to_string().contains("cannot read"));
    }
}
