//! Error types for tunnel configuration and lifecycle.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::hook::HookStage;

/// Result type alias for tunnel operations.
pub type Result<T, E = TunnelError> = std::result::Result<T, E>;

/// A malformed tunnel file or field. Always fatal to that parse.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field}: {reason}{}", line_suffix(.line))]
pub struct ParseError {
    /// 1-based source line, or 0 when the failure is not tied to one line.
    pub line: usize,
    /// Field path, e.g. `Interface.MTU` or `Peer[1].Endpoint`.
    pub field: String,
    /// What was wrong with the value.
    pub reason: String,
}

fn line_suffix(line: &usize) -> String {
    if *line == 0 {
        String::new()
    } else {
        format!(" (line {line})")
    }
}

impl ParseError {
    /// Creates a parse error for a specific line.
    #[must_use]
    pub fn new(line: usize, field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            line,
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Creates a parse error for a required field that never appeared.
    #[must_use]
    pub fn missing(field: impl Into<String>) -> Self {
        Self::new(0, field, "required field is missing")
    }
}

/// One accumulated, non-fatal config violation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    /// Field path, e.g. `Peer[2].PublicKey`.
    pub field: String,
    /// Human-readable description.
    pub message: String,
}

impl ValidationError {
    /// Creates a validation error.
    #[must_use]
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Key material that failed to decode.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidKeyError {
    /// Not valid base64.
    #[error("invalid base64 key: {0}")]
    InvalidBase64(String),

    /// Not valid hex (control socket form).
    #[error("invalid hex key: {0}")]
    InvalidHex(String),

    /// Decoded to the wrong number of bytes.
    #[error("invalid key length: expected 32, got {0}")]
    InvalidLength(usize),
}

/// Failures while applying or reverting OS network state.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// Automatic configuration is not available on this platform.
    #[error(
        "automatic network configuration is not supported on {platform}; configure the interface manually"
    )]
    UnsupportedPlatform {
        /// Target OS name.
        platform: String,
    },

    /// Link lookup, MTU or up/down failed.
    #[error("link {interface}: {reason}")]
    Link {
        /// Interface name.
        interface: String,
        /// Underlying failure.
        reason: String,
    },

    /// Address assignment failed.
    #[error("address {address}: {reason}")]
    Address {
        /// CIDR being added.
        address: String,
        /// Underlying failure.
        reason: String,
    },

    /// Route add or delete failed.
    #[error("route {destination}: {reason}")]
    Route {
        /// Destination CIDR.
        destination: String,
        /// Underlying failure.
        reason: String,
    },

    /// The routing-table selector could not be resolved.
    #[error("routing table {table}: {reason}")]
    Table {
        /// Selector as written in the config.
        table: String,
        /// Underlying failure.
        reason: String,
    },

    /// Resolver daemon or resolver file failure.
    #[error("dns: {0}")]
    Dns(String),

    /// Filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Several cleanup steps failed.
    #[error("{}", join_errors(.0))]
    Cleanup(Vec<NetworkError>),
}

impl NetworkError {
    /// Creates a link error.
    #[must_use]
    pub fn link(interface: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Link {
            interface: interface.into(),
            reason: reason.into(),
        }
    }

    /// Creates an address error.
    #[must_use]
    pub fn address(address: impl fmt::Display, reason: impl Into<String>) -> Self {
        Self::Address {
            address: address.to_string(),
            reason: reason.into(),
        }
    }

    /// Creates a route error.
    #[must_use]
    pub fn route(destination: impl fmt::Display, reason: impl Into<String>) -> Self {
        Self::Route {
            destination: destination.to_string(),
            reason: reason.into(),
        }
    }

    /// Creates a table resolution error.
    #[must_use]
    pub fn table(table: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Table {
            table: table.into(),
            reason: reason.into(),
        }
    }

    /// Creates the unsupported-platform error for the current target.
    #[must_use]
    pub fn unsupported() -> Self {
        Self::UnsupportedPlatform {
            platform: std::env::consts::OS.to_string(),
        }
    }

    /// Returns true if this is an unsupported-platform error.
    #[must_use]
    pub const fn is_unsupported_platform(&self) -> bool {
        matches!(self, Self::UnsupportedPlatform { .. })
    }
}

/// Errors collected while tearing a tunnel down.
#[derive(Debug, Default)]
pub struct CleanupErrors(pub Vec<TunnelError>);

impl CleanupErrors {
    /// Returns true if no cleanup step failed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of failed cleanup steps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Records a failed step.
    pub fn push(&mut self, err: TunnelError) {
        self.0.push(err);
    }

    /// Iterates the collected errors in the order they happened.
    pub fn iter(&self) -> impl Iterator<Item = &TunnelError> {
        self.0.iter()
    }
}

impl fmt::Display for CleanupErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&join_errors(&self.0))
    }
}

fn join_errors<E: fmt::Display>(errors: &[E]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors that can occur while managing tunnels.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// The tunnel file could not be parsed.
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    /// The config failed validation.
    #[error("invalid configuration: {}", join_errors(.0))]
    InvalidConfig(Vec<ValidationError>),

    /// An Up-side hook exited unsuccessfully.
    #[error("{stage} hook failed: {reason}")]
    Hook {
        /// Lifecycle point the hook belongs to.
        stage: HookStage,
        /// Exit status or spawn failure.
        reason: String,
    },

    /// Device creation or teardown failed.
    #[error("device {interface}: {reason}")]
    Device {
        /// Requested or actual interface name.
        interface: String,
        /// Underlying failure.
        reason: String,
    },

    /// The control socket could not be opened or used.
    #[error("control socket {}: {reason}", .path.display())]
    ControlSocket {
        /// Socket path.
        path: PathBuf,
        /// Underlying failure.
        reason: String,
    },

    /// The engine rejected its configuration.
    #[error("engine configuration rejected: {reason}")]
    EngineConfig {
        /// Underlying failure.
        reason: String,
    },

    /// Applying or removing OS network state failed.
    #[error("network configuration failed: {0}")]
    NetworkConfig(#[from] NetworkError),

    /// A tunnel with this name is already starting or running.
    #[error("tunnel {name} is already running")]
    AlreadyRunning {
        /// Tunnel name.
        name: String,
    },

    /// No running tunnel with this name.
    #[error("tunnel {name} is not running")]
    NotRunning {
        /// Tunnel name.
        name: String,
    },

    /// The operation is not available on this platform or build.
    #[error("unsupported platform: {platform}")]
    UnsupportedPlatform {
        /// What is missing.
        platform: String,
    },

    /// Start was cancelled by the caller.
    #[error("start cancelled")]
    Cancelled,

    /// One or more teardown steps failed.
    #[error("cleanup failed: {0}")]
    Cleanup(CleanupErrors),

    /// Start failed and the rollback itself reported errors.
    #[error("{cause} (rollback: {cleanup})")]
    RolledBack {
        /// The failure that triggered rollback.
        cause: Box<TunnelError>,
        /// Errors reported while rolling back.
        cleanup: CleanupErrors,
    },

    /// No tunnel file with this name.
    #[error("tunnel {name} not found")]
    NotFound {
        /// Tunnel name.
        name: String,
    },

    /// The tunnel name is not usable as an interface or file name.
    #[error("invalid tunnel name {name:?}: {reason}")]
    InvalidName {
        /// Offending name.
        name: String,
        /// Which rule it broke.
        reason: String,
    },

    /// Key material failed to decode.
    #[error(transparent)]
    Key(#[from] InvalidKeyError),

    /// Tool settings could not be loaded.
    #[error("settings {}: {reason}", .path.display())]
    Settings {
        /// Settings file path.
        path: PathBuf,
        /// Underlying failure.
        reason: String,
    },

    /// Filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TunnelError {
    /// Creates a hook error.
    #[must_use]
    pub fn hook(stage: HookStage, reason: impl Into<String>) -> Self {
        Self::Hook {
            stage,
            reason: reason.into(),
        }
    }

    /// Creates a device error.
    #[must_use]
    pub fn device(interface: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Device {
            interface: interface.into(),
            reason: reason.into(),
        }
    }

    /// Creates a control socket error.
    #[must_use]
    pub fn control_socket(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::ControlSocket {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Creates an engine configuration error.
    #[must_use]
    pub fn engine_config(reason: impl Into<String>) -> Self {
        Self::EngineConfig {
            reason: reason.into(),
        }
    }

    /// Creates an already-running error.
    #[must_use]
    pub fn already_running(name: impl Into<String>) -> Self {
        Self::AlreadyRunning { name: name.into() }
    }

    /// Creates a not-running error.
    #[must_use]
    pub fn not_running(name: impl Into<String>) -> Self {
        Self::NotRunning { name: name.into() }
    }

    /// Creates a not-found error.
    #[must_use]
    pub fn not_found(name: impl Into<String>) -> Self {
        Self::NotFound { name: name.into() }
    }

    /// Creates an invalid-name error.
    #[must_use]
    pub fn invalid_name(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidName {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Creates a settings error.
    #[must_use]
    pub fn settings(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Settings {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// The error that started a failure chain, unwrapping rollback context.
    #[must_use]
    pub fn root_cause(&self) -> &Self {
        match self {
            Self::RolledBack { cause, .. } => cause.root_cause(),
            other => other,
        }
    }

    /// Returns true if this is (or was caused by) `AlreadyRunning`.
    #[must_use]
    pub fn is_already_running(&self) -> bool {
        matches!(self.root_cause(), Self::AlreadyRunning { .. })
    }

    /// Returns true if this is (or was caused by) `NotRunning`.
    #[must_use]
    pub fn is_not_running(&self) -> bool {
        matches!(self.root_cause(), Self::NotRunning { .. })
    }

    /// Returns true if the platform cannot do what was asked.
    #[must_use]
    pub fn is_unsupported_platform(&self) -> bool {
        match self.root_cause() {
            Self::UnsupportedPlatform { .. } => true,
            Self::NetworkConfig(e) => e.is_unsupported_platform(),
            _ => false,
        }
    }
}
