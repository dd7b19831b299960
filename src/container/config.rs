//! Engine catalog and per-container descriptors.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::config::EngineSettings;
use crate::error::ConfigError;
use crate::probe::{MongoProbe, MysqlProbe, PostgresProbe, ReadinessProbe, RedisProbe};

/// Prefix shared by every container this crate creates.
pub const CONTAINER_PREFIX: &str = "pmr";

/// `pmr_<name>`.
pub fn container_name(name: &str) -> String {
    format!("{CONTAINER_PREFIX}_{name}")
}

/// Supported database engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Engine {
    Postgres,
    Mysql,
    Mongo,
    Redis,
    /// Redshift stand-in, served by a Postgres container.
    Redshift,
}

/// Built-in defaults for an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineDefaults {
    pub image: &'static str,
    /// Port the service listens on inside the container.
    pub container_port: u16,
    /// Host port used outside CI. Offset from the standard port so a
    /// developer's own database is left alone.
    pub host_port: u16,
    pub username: &'static str,
    pub password: &'static str,
    pub root_database: &'static str,
}

impl Engine {
    pub const ALL: [Engine; 5] = [
        Engine::Mongo,
        Engine::Mysql,
        Engine::Postgres,
        Engine::Redis,
        Engine::Redshift,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::Mysql => "mysql",
            Self::Mongo => "mongo",
            Self::Redis => "redis",
            Self::Redshift => "redshift",
        }
    }

    /// Comma-separated list of engine names, for help text.
    pub fn options() -> String {
        Self::ALL.iter().map(Engine::as_str).collect::<Vec<_>>().join(", ")
    }

    pub fn defaults(&self) -> EngineDefaults {
        match self {
            Self::Postgres | Self::Redshift => EngineDefaults {
                image: "postgres:9.6.10-alpine",
                container_port: 5432,
                host_port: 5532,
                username: "user",
                password: "password",
                root_database: "dev_db",
            },
            Self::Mysql => EngineDefaults {
                image: "mysql:5.6",
                container_port: 3306,
                host_port: 3406,
                username: "root",
                password: "",
                root_database: "dev",
            },
            Self::Mongo => EngineDefaults {
                image: "mongo:3.6",
                container_port: 27017,
                host_port: 28017,
                username: "",
                password: "",
                root_database: "dev-mongo",
            },
            Self::Redis => EngineDefaults {
                image: "redis:5.0.7",
                container_port: 6379,
                host_port: 6380,
                username: "",
                password: "",
                root_database: "",
            },
        }
    }

    /// Name the container is derived from. Redshift shares the Postgres
    /// container so the two never fight over the same host port.
    pub fn container_base_name(&self) -> &'static str {
        match self {
            Self::Redshift => Self::Postgres.as_str(),
            other => other.as_str(),
        }
    }

    /// Environment the image needs to initialise itself.
    pub fn environment(&self, settings: &EngineSettings) -> Vec<(String, String)> {
        let pair = |k: &str, v: &str| (k.to_string(), v.to_string());
        match self {
            Self::Postgres | Self::Redshift => vec![
                pair("POSTGRES_DB", &settings.root_database),
                pair("POSTGRES_USER", &settings.username),
                pair("POSTGRES_PASSWORD", &settings.password),
            ],
            Self::Mysql => {
                let mut env = vec![pair("MYSQL_DATABASE", &settings.root_database)];
                if settings.password.is_empty() {
                    env.push(pair("MYSQL_ALLOW_EMPTY_PASSWORD", "yes"));
                } else {
                    env.push(pair("MYSQL_ROOT_PASSWORD", &settings.password));
                }
                env
            }
            Self::Mongo | Self::Redis => Vec::new(),
        }
    }

    pub fn probe(&self) -> Arc<dyn ReadinessProbe> {
        match self {
            Self::Postgres | Self::Redshift => Arc::new(PostgresProbe),
            Self::Mysql => Arc::new(MysqlProbe),
            Self::Mongo => Arc::new(MongoProbe),
            Self::Redis => Arc::new(RedisProbe),
        }
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Engine {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" => Ok(Self::Postgres),
            "mysql" => Ok(Self::Mysql),
            "mongo" | "mongodb" => Ok(Self::Mongo),
            "redis" => Ok(Self::Redis),
            "redshift" => Ok(Self::Redshift),
            _ => Err(format!(
                "invalid engine '{}', expected one of: {}",
                s,
                Engine::options()
            )),
        }
    }
}

/// Immutable description of one container: what to run, where it listens and
/// how to tell it is ready.
#[derive(Clone)]
pub struct ContainerConfig {
    engine: Option<Engine>,
    name: String,
    container_name: String,
    image: String,
    host: String,
    host_port: u16,
    container_port: u16,
    env: Vec<(String, String)>,
    username: String,
    password: String,
    root_database: String,
    probe: Arc<dyn ReadinessProbe>,
}

impl fmt::Debug for ContainerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContainerConfig")
            .field("engine", &self.engine)
            .field("container_name", &self.container_name)
            .field("image", &self.image)
            .field("host", &self.host)
            .field("host_port", &self.host_port)
            .field("container_port", &self.container_port)
            .finish_non_exhaustive()
    }
}

impl ContainerConfig {
    /// Build the config for an engine from resolved settings.
    ///
    /// A settings port of `None` reserves a free host port now. The derived
    /// name embeds the host port whenever it differs from the engine default,
    /// so differently-ported instances of one engine can coexist.
    pub fn from_settings(settings: &EngineSettings) -> Result<Self, ConfigError> {
        let engine = settings.engine;
        let defaults = engine.defaults();
        let host_port = match settings.port {
            Some(port) => port,
            None => free_port()?,
        };

        let name = settings
            .name
            .clone()
            .unwrap_or_else(|| engine.container_base_name().to_string());
        let container_name = if host_port == defaults.host_port {
            container_name(&name)
        } else {
            container_name(&format!("{name}_{host_port}"))
        };

        Ok(Self {
            engine: Some(engine),
            name,
            container_name,
            image: settings.image.clone(),
            host: settings.host.clone(),
            host_port,
            container_port: defaults.container_port,
            env: engine.environment(settings),
            username: settings.username.clone(),
            password: settings.password.clone(),
            root_database: settings.root_database.clone(),
            probe: engine.probe(),
        })
    }

    /// Config for an arbitrary image, reachable on `127.0.0.1:<host_port>`.
    pub fn custom(
        name: &str,
        image: &str,
        host_port: u16,
        container_port: u16,
        probe: impl ReadinessProbe + 'static,
    ) -> Self {
        Self {
            engine: None,
            name: name.to_string(),
            container_name: container_name(name),
            image: image.to_string(),
            host: "127.0.0.1".to_string(),
            host_port,
            container_port,
            env: Vec::new(),
            username: String::new(),
            password: String::new(),
            root_database: String::new(),
            probe: Arc::new(probe),
        }
    }

    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.push((key.to_string(), value.to_string()));
        self
    }

    pub fn with_host(mut self, host: &str) -> Self {
        self.host = host.to_string();
        self
    }

    pub fn with_credentials(mut self, username: &str, password: &str, root_database: &str) -> Self {
        self.username = username.to_string();
        self.password = password.to_string();
        self.root_database = root_database.to_string();
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn ReadinessProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn engine(&self) -> Option<Engine> {
        self.engine
    }

    /// Engine or custom name, without prefix.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn container_name(&self) -> &str {
        &self.container_name
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn host_port(&self) -> u16 {
        self.host_port
    }

    pub fn container_port(&self) -> u16 {
        self.container_port
    }

    pub fn env(&self) -> &[(String, String)] {
        &self.env
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn root_database(&self) -> &str {
        &self.root_database
    }

    pub fn probe(&self) -> &Arc<dyn ReadinessProbe> {
        &self.probe
    }
}

/// Ask the OS for a free port by binding to port 0.
fn free_port() -> Result<u16, ConfigError> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").map_err(ConfigError::PortReservation)?;
    let port = listener
        .local_addr()
        .map_err(ConfigError::PortReservation)?
        .port();
    Ok(port)
}
