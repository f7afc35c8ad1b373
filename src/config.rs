use crate::{control_connection::ControlAddress, error::TorError};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Settings for an [`OnionListener`](crate::listener::OnionListener).
///
/// Loadable from JSON; optional fields may be omitted:
/// ```json
/// {
///     "key_file": "echo_onion_key",
///     "virt_port": 80,
///     "local_addr": "127.0.0.1:8080",
///     "control_network": "tcp",
///     "control_addr": "127.0.0.1:9051"
/// }
/// ```
#[derive(Clone, Deserialize)]
pub struct OnionListenerOptions {
    /// Where the onion service key is persisted, so the service keeps its address across restarts
    #[serde(default)]
    pub key_file: Option<PathBuf>,

    /// Port advertised by the onion service
    pub virt_port: u16,

    /// Local TCP address the service forwards to, and which we listen on
    pub local_addr: String,

    /// `tcp`, `tcp4`, `tcp6` or `unix`
    pub control_network: String,
    pub control_addr: String,

    /// Empty or absent means NULL or cookie authentication
    #[serde(default)]
    pub control_password: Option<String>,

    /// Fail instead of generating a new key when `key_file` holds no usable key
    #[serde(default)]
    pub require_existing_key: bool,

    /// Keep the service registered after the control connection closes
    #[serde(default)]
    pub detach: bool,

    /// Log control protocol traffic
    #[serde(default)]
    pub debug: bool,
}

impl OnionListenerOptions {
    pub fn new(virt_port: u16, local_addr: &str, control_network: &str, control_addr: &str) -> Self {
        Self {
            key_file: None,
            virt_port,
            local_addr: local_addr.to_string(),
            control_network: control_network.to_string(),
            control_addr: control_addr.to_string(),
            control_password: None,
            require_existing_key: false,
            detach: false,
            debug: false,
        }
    }

    pub fn with_key_file<P: Into<PathBuf>>(mut self, key_file: P) -> Self {
        self.key_file = Some(key_file.into());
        self
    }

    pub fn with_control_password(mut self, password: &str) -> Self {
        self.control_password = Some(password.to_string());
        self
    }

    pub fn from_json_str(json: &str) -> Result<Self, TorError> {
        let options: Self = serde_json::from_str(json)
            .map_err(|error| TorError::config_error(&format!("Invalid options: {}", error)))?;
        options.validate()?;
        Ok(options)
    }

    pub fn from_json_file(path: &Path) -> Result<Self, TorError> {
        let json = std::fs::read_to_string(path).map_err(|error| {
            TorError::config_error(&format!("Error reading {}: {}", path.display(), error))
        })?;
        Self::from_json_str(&json)
    }

    pub fn control_address(&self) -> Result<ControlAddress, TorError> {
        ControlAddress::parse(&self.control_network, &self.control_addr)
    }

    pub fn validate(&self) -> Result<(), TorError> {
        self.control_address()?;
        if self.virt_port == 0 {
            return Err(TorError::config_error("Virtual port must be non-zero"));
        }
        if self.local_addr.is_empty() {
            return Err(TorError::config_error("Local address not specified"));
        }
        if self.require_existing_key && self.key_file.is_none() {
            return Err(TorError::config_error(
                "An existing key is required but no key file is configured",
            ));
        }
        Ok(())
    }
}

impl std::fmt::Debug for OnionListenerOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("OnionListenerOptions")
            .field("key_file", &self.key_file)
            .field("virt_port", &self.virt_port)
            .field("local_addr", &self.local_addr)
            .field("control_network", &self.control_network)
            .field("control_addr", &self.control_addr)
            .field(
                "control_password",
                &self.control_password.as_ref().map(|_| "<redacted>"),
            )
            .field("require_existing_key", &self.require_existing_key)
            .field("detach", &self.detach)
            .field("debug", &self.debug)
            .finish()
    }
}
