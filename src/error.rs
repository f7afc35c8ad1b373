use std::path::PathBuf;
use tokio_socks::Error as Socks5Error;
use tokio_util::codec::LinesCodecError;

/// The step of [`OnionListener`](crate::listener::OnionListener) initialization that failed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InitStep {
    LoadKey,
    Authenticate,
    RegisterService,
    PersistKey,
    BindListener,
}

impl std::fmt::Display for InitStep {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let step = match self {
            Self::LoadKey => "loading onion key",
            Self::Authenticate => "authenticating to the control port",
            Self::RegisterService => "registering the onion service",
            Self::PersistKey => "persisting the onion key",
            Self::BindListener => "binding the local listener",
        };
        f.write_str(step)
    }
}

#[derive(Debug)]
pub enum TorError {
    TransportError(std::io::Error),
    AuthenticationError(String),
    ProtocolError(String),
    ParseError(String),
    PersistenceError { path: PathBuf, reason: String },
    ListenerBindError(std::io::Error),
    LifecycleStateError(String),
    ConfigError(String),
    InitializationError { step: InitStep, source: Box<TorError> },
    Socks5Error(Socks5Error),
}

impl std::fmt::Display for TorError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::TransportError(error) => write!(f, "Transport Error: {}", error),
            Self::AuthenticationError(error) => write!(f, "Authentication Error: {}", error),
            Self::ProtocolError(error) => write!(f, "Protocol Error: {}", error),
            Self::ParseError(error) => write!(f, "Parse Error: {}", error),
            Self::PersistenceError { path, reason } => {
                write!(f, "Persistence Error: {}: {}", path.display(), reason)
            }
            Self::ListenerBindError(error) => write!(f, "Listener Bind Error: {}", error),
            Self::LifecycleStateError(error) => write!(f, "Lifecycle State Error: {}", error),
            Self::ConfigError(error) => write!(f, "Config Error: {}", error),
            Self::InitializationError { step, source } => {
                write!(f, "Initialization failed while {}: {}", step, source)
            }
            Self::Socks5Error(error) => write!(f, "Socks5Error: {}", error),
        }
    }
}

impl std::error::Error for TorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::TransportError(error) | Self::ListenerBindError(error) => Some(error),
            Self::InitializationError { source, .. } => Some(source.as_ref()),
            Self::Socks5Error(error) => Some(error),
            _ => None,
        }
    }
}

impl TorError {
    pub fn authentication_error(msg: &str) -> TorError {
        TorError::AuthenticationError(msg.to_string())
    }

    pub fn protocol_error(msg: &str) -> TorError {
        TorError::ProtocolError(msg.to_string())
    }

    pub fn parse_error(msg: &str) -> TorError {
        TorError::ParseError(msg.to_string())
    }

    pub fn state_error(msg: &str) -> TorError {
        TorError::LifecycleStateError(msg.to_string())
    }

    pub fn config_error(msg: &str) -> TorError {
        TorError::ConfigError(msg.to_string())
    }

    pub(crate) fn persistence_error<P: Into<PathBuf>>(path: P, reason: &str) -> TorError {
        TorError::PersistenceError {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn during(self, step: InitStep) -> TorError {
        TorError::InitializationError {
            step,
            source: Box::new(self),
        }
    }

    /// For an [`InitializationError`](TorError::InitializationError), the step that failed
    pub fn failed_step(&self) -> Option<InitStep> {
        match self {
            Self::InitializationError { step, .. } => Some(*step),
            _ => None,
        }
    }
}

impl From<Socks5Error> for TorError {
    fn from(error: Socks5Error) -> TorError {
        TorError::Socks5Error(error)
    }
}

impl From<std::io::Error> for TorError {
    fn from(error: std::io::Error) -> TorError {
        TorError::TransportError(error)
    }
}

impl From<LinesCodecError> for TorError {
    fn from(error: LinesCodecError) -> TorError {
        match error {
            LinesCodecError::MaxLineLengthExceeded => TorError::ProtocolError(error.to_string()),
            LinesCodecError::Io(error) => error.into(),
        }
    }
}
