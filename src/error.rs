//! Error types for wiresocks

use std::net::AddrParseError;

use thiserror::Error;

/// Main error type for wiresocks
#[derive(Error, Debug)]
pub enum WireSocksError {
    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Tunnel device errors
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    /// Proxy listener errors
    #[error("Proxy error: {0}")]
    Proxy(#[from] ProxyError),

    /// System I/O errors
    #[error("System error: {0}")]
    System(#[from] std::io::Error),
}

/// Field-level decoding errors for keys, addresses and endpoints
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("invalid base64 string")]
    InvalidEncoding,

    #[error("key should be 32 bytes, got {got}")]
    WrongLength { got: usize },

    #[error("invalid IP address: {value}")]
    InvalidAddress { value: String },

    #[error("invalid address prefix: {value}")]
    InvalidPrefix { value: String },

    #[error("expected host:port, got: {value}")]
    MalformedEndpoint { value: String },

    #[error("lookup of {host} failed: {source}")]
    HostLookup {
        host: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no address found for {host}")]
    NoAddress { host: String },

    #[error("invalid number: {value}")]
    InvalidNumber { value: String },

    #[error("MTU {mtu} is below the minimum of {min}")]
    MtuTooSmall { mtu: u16, min: u16 },
}

/// Configuration loading errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("File not found: {path}")]
    FileNotFound { path: String },

    #[error("Invalid config format at line {line}: {message}")]
    Syntax { line: usize, message: String },

    #[error("Configuration file must include {0}")]
    Structure(&'static str),

    #[error("Missing required field {field} in [{section}]")]
    MissingField {
        section: &'static str,
        field: &'static str,
    },

    #[error("Error parsing {field}: {source}")]
    InvalidField {
        field: &'static str,
        #[source]
        source: CodecError,
    },

    #[error("Error resolving Endpoint {endpoint}: {source}")]
    EndpointResolution {
        endpoint: String,
        #[source]
        source: CodecError,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Tunnel device configuration and bring-up errors
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Invalid control-plane request at line {line}: {message}")]
    InvalidRequest { line: usize, message: String },

    #[error("Control-plane request is missing {key}")]
    MissingSetting { key: &'static str },

    #[error("Device has not been configured")]
    NotConfigured,

    #[error("Device socket error: {reason}")]
    Socket { reason: String },

    #[error("Network stack error: {reason}")]
    Stack { reason: String },
}

/// Proxy listener errors
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Failed to listen on {addr}: {source}")]
    Listen {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Hostname resolution errors raised while serving a proxy connection
#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("no address found for: {name}")]
    NoAddressFound { name: String },

    #[error("lookup of {name} failed: {source}")]
    LookupFailed {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid address {value}: {source}")]
    InvalidAddress {
        value: String,
        #[source]
        source: AddrParseError,
    },
}

impl WireSocksError {
    /// Get a user-friendly error message with suggested action
    pub fn user_message(&self) -> String {
        match self {
            Self::Config(ConfigError::FileNotFound { path }) => {
                format!(
                    "Config file not found: {}\n  Check the path and try again.",
                    path
                )
            }

            Self::Config(ConfigError::InvalidField {
                field,
                source: CodecError::InvalidEncoding | CodecError::WrongLength { .. },
            }) => {
                format!(
                    "Invalid {} in config. Expected 32-byte base64-encoded key.",
                    field
                )
            }

            Self::Config(ConfigError::EndpointResolution { endpoint, .. }) => {
                format!(
                    "Could not resolve peer Endpoint {}.\n  \
                    Check the hostname and your network connection.",
                    endpoint
                )
            }

            Self::Proxy(ProxyError::Listen { addr, source }) => {
                format!(
                    "Cannot listen on {}: {}\n  \
                    Pick another address with -l addr:port.",
                    addr, source
                )
            }

            _ => format!("{}", self),
        }
    }

    /// Get the exit code for this error
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Config(_) => 1,
            Self::Device(_) => 2,
            Self::Proxy(_) => 3,
            Self::System(_) => 4,
        }
    }
}

/// Result type alias for wiresocks operations
pub type Result<T> = std::result::Result<T, WireSocksError>;
