use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const DEFAULT_CONFIG_FILE: &str = "server_gateway.conf";

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default)]
#[clap(about = "Multi-tenant target gateway with event broker", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "GATEWAY_PORT", help = "Port to listen on for subscriber connections.")]
    pub port: Option<u16>,

    #[clap(long, env = "GATEWAY_CONFIG_PATH", help = "Path to the JSON server configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "GATEWAY_CORE_CONFIG_PATH", help = "Path to the JSON gateway core configuration (health, router cache, allocator, broker).")]
    pub core_config_path: Option<PathBuf>,

    #[clap(long, env = "GATEWAY_STATE_PATH", help = "Path to the JSON state file seeding targets, peers and the deployed version.")]
    pub state_path: Option<PathBuf>,

    #[clap(long, env = "GATEWAY_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "GATEWAY_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,
}

impl Config {
    // 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            port: other.port.or(self.port),
            config_path: other.config_path.or(self.config_path),
            core_config_path: other.core_config_path.or(self.core_config_path),
            state_path: other.state_path.or(self.state_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
        }
    }

    fn defaults() -> Config {
        Config {
            port: Some(9010),
            state_path: Some(PathBuf::from("gateway_state.json")),
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            ..Default::default()
        }
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(9010)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(|| PathBuf::from("./logs"))
    }

    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or("info")
    }
}

/// Reads a server config file. Missing or unparseable files yield `None`;
/// logging is not up yet, so problems go to stderr.
fn read_file_config(path: &Path) -> Option<Config> {
    if !path.exists() {
        return None;
    }
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) => {
            eprintln!("Failed to read config file {}: {}", path.display(), e);
            return None;
        }
    };
    match serde_json::from_str::<Config>(&text) {
        Ok(config) => Some(config),
        Err(e) => {
            eprintln!("Failed to parse config file {}: {}", path.display(), e);
            None
        }
    }
}

/// Resolves the configuration: defaults, then the config file, then
/// environment variables and CLI arguments.
pub fn load_config() -> Config {
    resolve(Config::parse())
}

fn resolve(cli: Config) -> Config {
    let config_file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let mut current = Config::defaults();
    if let Some(file_config) = read_file_config(&config_file_path) {
        current = current.merge(file_config);
    }
    current.merge(cli)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server_gateway.conf");
        fs::write(&path, r#"{ "port": 7000, "logLevel": "debug" }"#).unwrap();

        let cli = Config {
            config_path: Some(path),
            log_level: Some("warn".to_string()),
            ..Default::default()
        };
        let config = resolve(cli);

        assert_eq!(config.port(), 7000);
        assert_eq!(config.log_level(), "warn");
        assert_eq!(config.log_dir(), PathBuf::from("./logs"));
    }

    #[test]
    fn test_broken_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.conf");
        fs::write(&path, "{ port: ").unwrap();

        let config = resolve(Config {
            config_path: Some(path),
            ..Default::default()
        });

        assert_eq!(config.port(), 9010);
        assert_eq!(config.state_path, Some(PathBuf::from("gateway_state.json")));
    }
}
