//! Application error types.

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;

/// Application error that can be serialized for API consumers.
#[derive(Debug)]
pub struct AppError {
    payload: HashMap<String, String>,
    kind: ErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Instance not found
    InstanceNotFound,
    /// Instance with the same id already exists
    InstanceExists,
    /// Instance is currently running
    InstanceRunning,
    /// Instance id does not match `[A-Za-z0-9_-]+`
    InvalidId,
    /// Configuration error
    Config,
    /// File system error
    Io,
    /// Network error
    Network,
    /// Process error
    Process,
    /// Port is occupied
    PortOccupied,
    /// Workspace provisioning failed
    Provision,
    /// First-run bootstrap against the child failed
    Bootstrap,
    /// General error
    Other,
}

impl ErrorKind {
    pub fn code(&self) -> u32 {
        match self {
            Self::InstanceNotFound => 1001,
            Self::InstanceRunning => 1002,
            Self::InstanceExists => 1004,
            Self::InvalidId => 1005,
            Self::Config => 2001,
            Self::Io => 2002,
            Self::Network => 2003,
            Self::Process => 3003,
            Self::PortOccupied => 3004,
            Self::Provision => 4001,
            Self::Bootstrap => 4002,
            Self::Other => 9999,
        }
    }
}

impl AppError {
    pub fn new(kind: ErrorKind, payload: HashMap<String, String>) -> Self {
        Self { payload, kind }
    }

    /// Create an error with a single "detail" key from a non-empty string,
    /// or an empty payload if the string is empty.
    fn with_detail(kind: ErrorKind, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        let payload = if detail.is_empty() {
            HashMap::new()
        } else {
            HashMap::from([("detail".to_string(), detail)])
        };
        Self::new(kind, payload)
    }

    pub fn instance_not_found(id: &str) -> Self {
        Self::new(
            ErrorKind::InstanceNotFound,
            HashMap::from([("id".to_string(), id.to_string())]),
        )
    }

    pub fn instance_exists(id: &str) -> Self {
        Self::new(
            ErrorKind::InstanceExists,
            HashMap::from([("id".to_string(), id.to_string())]),
        )
    }

    pub fn instance_running() -> Self {
        Self::new(ErrorKind::InstanceRunning, HashMap::new())
    }

    pub fn invalid_id(id: &str) -> Self {
        Self::new(
            ErrorKind::InvalidId,
            HashMap::from([("id".to_string(), id.to_string())]),
        )
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Config, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Io, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Network, message)
    }

    pub fn network_with_url(url: &str, detail: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::Network,
            HashMap::from([
                ("url".to_string(), url.to_string()),
                ("detail".to_string(), detail.into()),
            ]),
        )
    }

    pub fn process(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Process, message)
    }

    pub fn port_occupied(port: u16) -> Self {
        Self::new(
            ErrorKind::PortOccupied,
            HashMap::from([("port".to_string(), port.to_string())]),
        )
    }

    pub fn provision(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Provision, message)
    }

    /// Bootstrap failure tagged with the step that failed.
    pub fn bootstrap(step: &str, detail: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::Bootstrap,
            HashMap::from([
                ("step".to_string(), step.to_string()),
                ("detail".to_string(), detail.into()),
            ]),
        )
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Other, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn payload(&self) -> &HashMap<String, String> {
        &self.payload
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.payload.is_empty() {
            write!(f, "{:?}", self.kind)
        } else {
            let mut pairs: Vec<String> = self
                .payload
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            pairs.sort();
            write!(f, "{:?}: {}", self.kind, pairs.join(", "))
        }
    }
}

impl std::error::Error for AppError {}

impl Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct as _;
        let mut s = serializer.serialize_struct("AppError", 2)?;
        s.serialize_field("code", &self.kind.code())?;
        s.serialize_field("payload", &self.payload)?;
        s.end()
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::config(err.to_string())
    }
}

impl From<toml::ser::Error> for AppError {
    fn from(err: toml::ser::Error) -> Self {
        Self::config(err.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        Self::network(err.to_string())
    }
}

impl From<zip::result::ZipError> for AppError {
    fn from(err: zip::result::ZipError) -> Self {
        Self::io(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::other(err.to_string())
    }
}

/// Convenient Result type alias.
pub type Result<T> = std::result::Result<T, AppError>;
