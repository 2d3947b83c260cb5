//! Error types shared across the crate.

use std::fmt;

/// A convenience alias for results produced by this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors raised while orchestrating a pipeline.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The pipeline configuration was missing a key, ill-typed, or referenced
    /// an unknown adapter or backend tag.
    #[error("configuration error: {0}")]
    Config(String),

    /// A filesystem operation failed on a transport.
    #[error("transport error: {op} `{path}`: {source}")]
    Transport {
        /// The operation that failed.
        op: &'static str,
        /// The path the operation was applied to.
        path: String,
        /// The underlying cause.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// An invoked command exited with a non-zero status and the caller chose
    /// to escalate.
    #[error("command `{command}` exited with status {status}\n{}", String::from_utf8_lossy(.stderr).trim())]
    Command {
        /// The command that was invoked.
        command: String,
        /// The exit status of the command.
        status: i32,
        /// The captured standard output of the command.
        stdout: Vec<u8>,
        /// The captured standard error of the command.
        stderr: Vec<u8>,
    },

    /// The execution substrate misbehaved in a way that is not a plain
    /// command failure, such as `sbatch` printing no job identifier.
    #[error("backend error: {0}")]
    Backend(String),

    /// The transient cluster failed to start.
    #[error("cluster startup failed: {0}")]
    ClusterStartup(String),

    /// An input could not be materialized for a task.
    #[error("localization error: {0}")]
    Localization(String),

    /// An SSH session could not be established or operated.
    #[error("ssh error: {0}")]
    Ssh(#[from] ssh2::Error),

    /// An I/O operation failed outside of a transport.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The pipeline configuration could not be parsed as YAML.
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml_ng::Error),
}

impl Error {
    /// Creates a configuration error from any displayable message.
    pub fn config(message: impl fmt::Display) -> Self {
        Self::Config(message.to_string())
    }

    /// Creates a transport error wrapping the given cause.
    pub fn transport(
        op: &'static str,
        path: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Transport {
            op,
            path: path.into(),
            source: Box::new(source),
        }
    }

    /// Creates a localization error from any displayable message.
    pub fn localization(message: impl fmt::Display) -> Self {
        Self::Localization(message.to_string())
    }
}
