//! Server configuration.
//!
//! [`Config`] is what operators write (YAML file and CLI flags);
//! [`ServerConfig`] is the runtime configuration built from it once at start-up
//! and shared read-only by every request.

use crate::hooks::{
    AllowCreate, DenyCreate, OnlyBranch, PostReceive, PreCreate, PreReceive, PreReceiveChain,
};
use crate::repo::{GitCli, DEFAULT_COMMAND_TIMEOUT};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Default limit on request bodies (pushes included).
pub const DEFAULT_MAX_BODY_BYTES: usize = 512 * 1024 * 1024;

/// Operator-facing configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Address the HTTP server listens on.
    pub listen: SocketAddr,
    /// Directory where pushed repositories are stored.
    pub path: PathBuf,
    /// Enables debug logging.
    pub debug: bool,
    /// Creates repositories on first push.
    pub auto_create: bool,
    /// Only accepts pushes to master.
    pub master_only: bool,
    /// Git executable.
    pub git_binary: PathBuf,
    /// Deadline for a single git process, in seconds.
    pub command_timeout_secs: u64,
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
    /// Log format (pretty or json).
    pub log_format: String,
    /// Largest accepted request body.
    pub max_body_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 80)),
            path: PathBuf::from("./repositories"),
            debug: false,
            auto_create: false,
            master_only: false,
            git_binary: PathBuf::from("git"),
            command_timeout_secs: DEFAULT_COMMAND_TIMEOUT.as_secs(),
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

impl Config {
    /// Loads a YAML configuration file. Missing keys take their defaults.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        serde_yaml::from_str(&text)
            .with_context(|| format!("parsing config file {}", path.display()))
    }

    /// Effective log level; the debug flag raises it to `debug`.
    pub fn effective_log_level(&self) -> &str {
        if self.debug && self.log_level == "info" {
            "debug"
        } else {
            &self.log_level
        }
    }

    /// Deadline for a single git process.
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    /// The git backend described by this configuration.
    pub fn git_backend(&self) -> GitCli {
        GitCli::new(&self.git_binary, self.command_timeout())
    }

    /// Builds the runtime configuration, creating the storage directory.
    pub fn server_config(&self) -> anyhow::Result<ServerConfig> {
        let mut config = ServerConfig::new(&self.path)?.with_debug(self.debug);

        if self.auto_create {
            config = config.with_pre_create(AllowCreate);
        }
        if self.master_only {
            config = config.with_pre_receive(OnlyBranch::master());
        }

        Ok(config)
    }
}

/// Hook policies of a server.
#[derive(Clone)]
pub struct Hooks {
    /// Run before a push is applied.
    pub pre_receive: PreReceiveChain,
    /// Run after a push was applied.
    pub post_receive: Vec<Arc<dyn PostReceive>>,
    /// Decides whether a push may create a missing repository.
    pub pre_create: Arc<dyn PreCreate>,
}

impl Default for Hooks {
    fn default() -> Self {
        Self {
            pre_receive: PreReceiveChain::new(),
            post_receive: Vec::new(),
            pre_create: Arc::new(DenyCreate),
        }
    }
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("pre_receive", &self.pre_receive)
            .field("post_receive", &self.post_receive.len())
            .finish_non_exhaustive()
    }
}

/// Runtime configuration, read-only once the server runs.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Absolute directory holding the repositories.
    pub storage_root: PathBuf,
    /// Logs every request at info level.
    pub debug: bool,
    /// Hook policies.
    pub hooks: Hooks,
}

impl ServerConfig {
    /// Creates a configuration storing repositories under `storage_root`,
    /// which is made absolute and created if missing.
    pub fn new(storage_root: impl AsRef<Path>) -> anyhow::Result<Self> {
        let root = storage_root.as_ref();
        let root = if root.is_absolute() {
            root.to_path_buf()
        } else {
            std::env::current_dir()
                .context("resolving the current directory")?
                .join(root)
        };

        std::fs::create_dir_all(&root)
            .with_context(|| format!("could not create repository path {}", root.display()))?;

        Ok(Self {
            storage_root: root,
            debug: false,
            hooks: Hooks::default(),
        })
    }

    /// Enables or disables debug request logging.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Appends a pre-receive policy.
    pub fn with_pre_receive(mut self, policy: impl PreReceive + 'static) -> Self {
        self.hooks.pre_receive.push(Arc::new(policy));
        self
    }

    /// Appends a post-receive policy.
    pub fn with_post_receive(mut self, policy: impl PostReceive + 'static) -> Self {
        self.hooks.post_receive.push(Arc::new(policy));
        self
    }

    /// Replaces the pre-create policy.
    pub fn with_pre_create(mut self, policy: impl PreCreate + 'static) -> Self {
        self.hooks.pre_create = Arc::new(policy);
        self
    }
}
