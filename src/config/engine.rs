use crate::config::helpers::{Lookup, optional_env};
use crate::container::{ContainerConfig, Engine};
use crate::error::ConfigError;

/// Per-engine settings, before a host port is reserved.
///
/// Every field can be overridden with `PMR_<ENGINE>_<FIELD>`, e.g.
/// `PMR_POSTGRES_PORT=5433` or `PMR_REDIS_IMAGE=redis:7`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    pub engine: Engine,
    /// Replaces the engine name in the derived container name.
    pub name: Option<String>,
    pub image: String,
    pub host: String,
    /// Host port. `None` picks a free port when the container config is built.
    pub port: Option<u16>,
    pub username: String,
    pub password: String,
    pub root_database: String,
}

impl EngineSettings {
    /// Built-in defaults.
    pub fn new(engine: Engine) -> Self {
        let defaults = engine.defaults();
        Self {
            engine,
            name: None,
            image: defaults.image.to_string(),
            host: "localhost".to_string(),
            port: Some(defaults.host_port),
            username: defaults.username.to_string(),
            password: defaults.password.to_string(),
            root_database: defaults.root_database.to_string(),
        }
    }

    /// Defaults overlaid with `PMR_<ENGINE>_*` variables.
    ///
    /// On CI (`CI` set to anything but a false-y value) the default host port is the
    /// engine's standard port, matching how CI services are usually exposed.
    pub fn resolve(engine: Engine, lookup: Lookup<'_>) -> Result<Self, ConfigError> {
        let mut settings = Self::new(engine);
        let key = |field: &str| format!("PMR_{}_{}", engine.as_str().to_uppercase(), field);

        let on_ci = optional_env(lookup, "CI")
            .is_some_and(|v| !matches!(v.trim().to_lowercase().as_str(), "false" | "0" | "no"));
        if on_ci {
            settings.port = Some(engine.defaults().container_port);
        }

        if let Some(name) = optional_env(lookup, &key("NAME")) {
            settings.name = Some(name);
        }
        if let Some(image) = optional_env(lookup, &key("IMAGE")) {
            settings.image = image;
        }
        if let Some(host) = optional_env(lookup, &key("HOST")) {
            settings.host = host;
        }
        if let Some(port) = optional_env(lookup, &key("PORT")) {
            settings.port = parse_port(&key("PORT"), &port)?;
        }
        if let Some(username) = optional_env(lookup, &key("USERNAME")) {
            settings.username = username;
        }
        // An explicitly empty password is meaningful for MySQL.
        if let Some(password) = lookup(&key("PASSWORD")) {
            settings.password = password;
        }
        if let Some(db) = optional_env(lookup, &key("ROOT_DATABASE")) {
            settings.root_database = db;
        }

        Ok(settings)
    }

    /// Resolve and build the container config.
    pub fn to_container_config(&self) -> Result<ContainerConfig, ConfigError> {
        ContainerConfig::from_settings(self)
    }
}

/// A port number, or `dynamic` for a free port chosen at build time.
fn parse_port(key: &str, raw: &str) -> Result<Option<u16>, ConfigError> {
    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("dynamic") {
        return Ok(None);
    }
    match raw.parse::<u16>() {
        Ok(0) | Err(_) => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("'{raw}' is not a port number or 'dynamic'"),
        }),
        Ok(port) => Ok(Some(port)),
    }
}
