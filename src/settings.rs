use crate::errors::AppError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    pub server: Server,
    pub policy: Policy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    /// A single `.kdl` file or a directory of them. Default: policies
    pub path: PathBuf,
}

impl Default for Server {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8181,
        }
    }
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            path: PathBuf::from("policies"),
        }
    }
}

impl Settings {
    pub fn load(path: &str) -> Result<Self, AppError> {
        let mut builder = config::Config::builder()
            .set_default("server.host", Server::default().host)?
            .set_default("server.port", Server::default().port)?
            .set_default(
                "policy.path",
                Policy::default().path.to_string_lossy().to_string(),
            )?;

        // Optional file
        if Path::new(path).exists() {
            builder = builder.add_source(config::File::with_name(path));
        }

        // Environment overrides: DOCGUARD__SERVER__PORT=9090, etc.
        builder = builder.add_source(config::Environment::with_prefix("DOCGUARD").separator("__"));

        let cfg = builder.build()?;
        let mut s: Settings = cfg.try_deserialize()?;

        if s.policy.path.is_relative() {
            s.policy.path = std::env::current_dir()?.join(&s.policy.path);
        }

        Ok(s)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::TempDir;

    // Settings::load reads process env, which the override test mutates
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_settings_load_defaults() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config_path = temp_dir.path().join("nonexistent.toml");

        let settings = Settings::load(config_path.to_str().unwrap())
            .expect("Failed to load settings");

        assert_eq!(settings.server.host, "0.0.0.0");
        assert_eq!(settings.server.port, 8181);
        assert!(settings.policy.path.ends_with("policies"));
    }

    #[test]
    fn test_settings_load_from_file() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config_path = temp_dir.path().join("test_config.toml");

        let config_content = r#"
[server]
host = "127.0.0.1"
port = 9090

[policy]
path = "/etc/docguard/rules.kdl"
"#;
        fs::write(&config_path, config_content).expect("Failed to write config");

        let settings = Settings::load(config_path.to_str().unwrap())
            .expect("Failed to load settings");

        assert_eq!(settings.server.host, "127.0.0.1");
        assert_eq!(settings.server.port, 9090);
        assert_eq!(settings.policy.path, PathBuf::from("/etc/docguard/rules.kdl"));
        assert_eq!(settings.listen_addr(), "127.0.0.1:9090");
    }

    #[test]
    fn test_settings_env_override() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config_path = temp_dir.path().join("test_config.toml");

        let config_content = r#"
[server]
host = "127.0.0.1"
port = 8080
"#;
        fs::write(&config_path, config_content).expect("Failed to write config");

        env::set_var("DOCGUARD__SERVER__PORT", "9999");
        env::set_var("DOCGUARD__SERVER__HOST", "192.168.1.1");

        // env should override file
        let settings = Settings::load(config_path.to_str().unwrap())
            .expect("Failed to load settings");

        assert_eq!(settings.server.host, "192.168.1.1");
        assert_eq!(settings.server.port, 9999);

        env::remove_var("DOCGUARD__SERVER__PORT");
        env::remove_var("DOCGUARD__SERVER__HOST");
    }

    #[test]
    fn test_settings_policy_path_normalization() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config_path = temp_dir.path().join("test_config.toml");

        let config_content = r#"
[policy]
path = "relative/rules"
"#;
        fs::write(&config_path, config_content).expect("Failed to write config");

        let settings = Settings::load(config_path.to_str().unwrap())
            .expect("Failed to load settings");

        assert!(settings.policy.path.is_absolute());
        assert!(settings.policy.path.ends_with("relative/rules"));
    }
}
