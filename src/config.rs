use crate::filter::NamespaceFilter;
use crate::mirror::MirrorConfig;
use crate::registry::Credentials;
use crate::secret_string::SecretString;
use anyhow::{Context, Result, bail, ensure};
use regex::Regex;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use std::{env, fs, path::Path};
use tracing::{info, warn};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub registry: Registry,
    /// Comma separated; `kube-system` is always ignored.
    #[serde(default)]
    pub ignore_namespaces: String,
    #[serde(default)]
    pub controller: ControllerSettings,
    #[serde(default)]
    pub webserver: Webserver,
    #[serde(default)]
    pub tls: Tls,
}

/// The backup registry images are mirrored into.
#[derive(Debug, Deserialize)]
pub struct Registry {
    pub host: String,
    pub username: String,
    pub password: SecretString,
    #[serde(default)]
    pub insecure: bool,
}

#[derive(Debug, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ControllerSettings {
    pub concurrency: u16,
    pub operation_timeout_seconds: u64,
    pub shutdown_grace_period_seconds: u64,
    pub resync_schedule: Option<String>,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            concurrency: 4,
            operation_timeout_seconds: 300,
            shutdown_grace_period_seconds: 30,
            resync_schedule: None,
        }
    }
}

impl ControllerSettings {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_seconds)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_seconds)
    }
}

#[derive(Debug, Deserialize)]
pub struct Webserver {
    pub port: u16,
}

impl Default for Webserver {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tls {
    #[serde(default)]
    pub ca_certificate_paths: Vec<PathBuf>,
}

impl Config {
    pub fn mirror_config(&self) -> MirrorConfig {
        MirrorConfig {
            target_registry: self.registry.host.clone(),
            credentials: Credentials {
                username: self.registry.username.clone(),
                password: self.registry.password.clone(),
            },
            namespaces: NamespaceFilter::from_comma_separated(&self.ignore_namespaces),
        }
    }

    fn validate(&self) -> Result<()> {
        let host = &self.registry.host;
        ensure!(!host.is_empty(), "registry.host must not be empty");
        ensure!(
            !host.contains("://"),
            "registry.host must not contain a scheme: {}",
            host
        );
        ensure!(
            !host.ends_with('/'),
            "registry.host must not end with a slash: {}",
            host
        );
        ensure!(
            !host.chars().any(char::is_whitespace),
            "registry.host must not contain whitespace: {:?}",
            host
        );
        ensure!(
            self.controller.concurrency > 0,
            "controller.concurrency must be greater than 0"
        );
        ensure!(
            self.controller.operation_timeout_seconds > 0,
            "controller.operationTimeoutSeconds must be greater than 0"
        );
        Ok(())
    }
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    info!("Loading config from file {}", path.as_ref().display());
    let yaml_str = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

    let expanded = expand_env_vars(&yaml_str)?;

    let config: Config = serde_yaml_ng::from_str(&expanded)
        .context("Failed to parse YAML config after environment variable expansion")?;
    config.validate().context("Invalid configuration")?;
    if config.registry.password.is_empty() {
        warn!(
            "No password configured for backup registry {}, pushes will likely be rejected",
            config.registry.host
        );
    }

    info!(
        "Mirroring images into {} as {}, ignoring namespaces {:?}",
        config.registry.host,
        config.registry.username,
        config.mirror_config().namespaces.ignored().collect::<Vec<_>>()
    );
    Ok(config)
}

/// Replaces `${VAR}` placeholders with environment variables values.
/// Returns an error naming every variable that is not set.
fn expand_env_vars(input: &str) -> Result<String> {
    let re =
        Regex::new(r"\$\{([^}]+)}").context("Invalid regex pattern for env var substitution")?;

    let mut missing = Vec::new();
    let result = re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        env::var(var_name).unwrap_or_else(|_| {
            missing.push(var_name.to_string());
            String::new()
        })
    });

    if !missing.is_empty() {
        bail!("Missing environment variable: {}", missing.join(", "));
    }
    Ok(result.into_owned())
}
