use crate::diagnostics::IgnoreList;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration for the gateway
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Front server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// How backend interpreter processes are launched
    #[serde(default)]
    pub interpreter: InterpreterConfig,

    /// Per-request behaviour of a handler
    #[serde(default)]
    pub handler: HandlerConfig,

    /// Handler pool sizing
    #[serde(default)]
    pub pool: PoolConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Port to listen on (default: 3000)
    #[serde(default = "default_listen_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
        }
    }
}

/// Configuration of the interpreter's built-in web server
///
/// # Security Warning
///
/// `program`, `wrapper_args` and `args` are executed directly. Configuration
/// files must only be writable by the service user.
#[derive(Debug, Deserialize, Clone)]
pub struct InterpreterConfig {
    /// Interpreter binary (default: php)
    #[serde(default = "default_program")]
    pub program: String,

    /// Arguments placed between the program and the fixed server flags
    #[serde(default)]
    pub wrapper_args: Vec<String>,

    /// Directory the backend serves (default: current directory)
    #[serde(default = "default_document_root")]
    pub document_root: PathBuf,

    /// Optional front-controller script passed after all flags
    pub router: Option<PathBuf>,

    /// Extra interpreter arguments appended after the fixed flags
    #[serde(default)]
    pub args: Vec<String>,

    /// First loopback port tried (default: 8001)
    #[serde(default = "default_base_port")]
    pub base_port: u16,

    /// Last loopback port tried (default: 65535)
    #[serde(default = "default_max_port")]
    pub max_port: u16,

    /// How long a fresh process must stay alive to count as started (default: 500ms)
    #[serde(default = "default_startup_grace_ms")]
    pub startup_grace_ms: u64,
}

impl InterpreterConfig {
    /// Config for `program` serving `document_root`, everything else default
    pub fn new(program: &str, document_root: impl Into<PathBuf>) -> Self {
        Self {
            program: program.to_string(),
            document_root: document_root.into(),
            ..Self::default()
        }
    }

    /// Restrict the candidate port range (builder pattern)
    pub fn with_ports(mut self, base_port: u16, max_port: u16) -> Self {
        self.base_port = base_port;
        self.max_port = max_port;
        self
    }

    /// Set the wrapper arguments (builder pattern)
    pub fn with_wrapper_args(mut self, args: Vec<String>) -> Self {
        self.wrapper_args = args;
        self
    }

    /// Set extra interpreter arguments (builder pattern)
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_ms)
    }
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            wrapper_args: Vec::new(),
            document_root: default_document_root(),
            router: None,
            args: Vec::new(),
            base_port: default_base_port(),
            max_port: default_max_port(),
            startup_grace_ms: default_startup_grace_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct HandlerConfig {
    /// Maximum time to wait for a backend response in milliseconds (default: 5000)
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Substrings of non-fatal diagnostics that should not fail a request
    #[serde(default)]
    pub ignore: Vec<String>,
}

impl HandlerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn ignore_list(&self) -> IgnoreList {
        IgnoreList::new(self.ignore.clone())
    }
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            ignore: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PoolConfig {
    /// Number of pre-started handlers kept ready (default: 5)
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// Delay before retrying after a failed launch in milliseconds (default: 1000)
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl PoolConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    3000
}

fn default_program() -> String {
    "php".to_string()
}

fn default_document_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_base_port() -> u16 {
    8001
}

fn default_max_port() -> u16 {
    u16::MAX
}

fn default_startup_grace_ms() -> u64 {
    500
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_capacity() -> usize {
    5
}

fn default_retry_backoff_ms() -> u64 {
    1000
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.interpreter.program.trim().is_empty() {
            errors.push("interpreter: 'program' must not be empty".to_string());
        }
        if self.interpreter.base_port == 0 {
            errors.push("interpreter: 'base_port' must be greater than 0".to_string());
        }
        if self.interpreter.base_port > self.interpreter.max_port {
            errors.push(format!(
                "interpreter: 'base_port' ({}) is above 'max_port' ({})",
                self.interpreter.base_port, self.interpreter.max_port
            ));
        }
        if self.handler.timeout_ms == 0 {
            errors.push("handler: 'timeout_ms' must be greater than 0".to_string());
        }
        if self.pool.capacity == 0 {
            errors.push("pool: 'capacity' must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
