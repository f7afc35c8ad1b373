//! An onion service bridged to a local TCP listener.
//!
//! [`OnionListener`] walks through a fixed sequence of phases:
//!
//! ```text
//! Uninitialized -> KeyLoaded -> SessionAuthenticated -> ServiceRegistered -> Listening
//! ```
//!
//! Any phase can move to `Closed`, which is terminal. Connections can only be accepted while
//! `Listening`.

use crate::{
    auth::TorAuthentication,
    config::OnionListenerOptions,
    control_connection::{SessionConfig, TorControlConnection},
    error::{InitStep, TorError},
    key::{read_key_file, write_key_file, OnionKey, ServiceId},
    onion::{KeyRequest, OnionInfo},
};
use futures::Stream;
use log::{debug, info, warn};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};

const INIT_STEPS: [InitStep; 5] = [
    InitStep::LoadKey,
    InitStep::Authenticate,
    InitStep::RegisterService,
    InitStep::PersistKey,
    InitStep::BindListener,
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListenerPhase {
    Uninitialized,
    KeyLoaded,
    SessionAuthenticated,
    ServiceRegistered,
    Listening,
    Closed,
}

impl ListenerPhase {
    fn can_advance_to(self, next: ListenerPhase) -> bool {
        use ListenerPhase::*;
        matches!(
            (self, next),
            (Uninitialized, KeyLoaded)
                | (KeyLoaded, SessionAuthenticated)
                | (SessionAuthenticated, ServiceRegistered)
                | (ServiceRegistered, ServiceRegistered)
                | (ServiceRegistered, Listening)
                | (Uninitialized, Closed)
                | (KeyLoaded, Closed)
                | (SessionAuthenticated, Closed)
                | (ServiceRegistered, Closed)
                | (Listening, Closed)
        )
    }
}

/// The externally reachable address of an onion service
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OnionAddr {
    address: String,
}

impl OnionAddr {
    pub fn new(service_id: &ServiceId, virt_port: u16) -> Self {
        Self {
            address: format!("{}:{}", service_id.onion_hostname(), virt_port),
        }
    }

    pub fn network(&self) -> &'static str {
        "onion-service"
    }

    pub fn as_str(&self) -> &str {
        &self.address
    }
}

impl std::fmt::Display for OnionAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(&self.address)
    }
}

enum ListenerState {
    Uninitialized,
    KeyLoaded {
        key: Option<OnionKey>,
    },
    SessionAuthenticated {
        key: Option<OnionKey>,
        connection: TorControlConnection,
    },
    ServiceRegistered {
        key: OnionKey,
        connection: TorControlConnection,
        onion_info: OnionInfo,
    },
    Listening {
        connection: TorControlConnection,
        onion_info: OnionInfo,
        listener: TcpListener,
    },
    /// Resources are kept here after a `close()` and released when the listener is dropped
    Closed {
        connection: Option<TorControlConnection>,
        listener: Option<TcpListener>,
    },
}

impl ListenerState {
    fn closed() -> Self {
        ListenerState::Closed {
            connection: None,
            listener: None,
        }
    }

    fn phase(&self) -> ListenerPhase {
        match self {
            ListenerState::Uninitialized => ListenerPhase::Uninitialized,
            ListenerState::KeyLoaded { .. } => ListenerPhase::KeyLoaded,
            ListenerState::SessionAuthenticated { .. } => ListenerPhase::SessionAuthenticated,
            ListenerState::ServiceRegistered { .. } => ListenerPhase::ServiceRegistered,
            ListenerState::Listening { .. } => ListenerPhase::Listening,
            ListenerState::Closed { .. } => ListenerPhase::Closed,
        }
    }

    async fn run_step(
        self,
        step: InitStep,
        options: &OnionListenerOptions,
    ) -> Result<ListenerState, StepFailure> {
        match (step, self) {
            (InitStep::LoadKey, ListenerState::Uninitialized) => Ok(ListenerState::KeyLoaded {
                key: load_key(options).await?,
            }),
            (InitStep::Authenticate, ListenerState::KeyLoaded { key }) => {
                Ok(ListenerState::SessionAuthenticated {
                    key,
                    connection: open_session(options).await?,
                })
            }
            (InitStep::RegisterService, ListenerState::SessionAuthenticated { key, connection }) => {
                register_service(options, key, connection).await
            }
            (
                InitStep::PersistKey,
                ListenerState::ServiceRegistered {
                    key,
                    connection,
                    onion_info,
                },
            ) => {
                if let Some(key_file) = &options.key_file {
                    if let Err(error) = write_key_file(key_file, &key).await {
                        return Err(StepFailure::registered(error, connection, onion_info));
                    }
                    debug!("Saved {} onion key to {}", key.key_type(), key_file.display());
                }
                Ok(ListenerState::ServiceRegistered {
                    key,
                    connection,
                    onion_info,
                })
            }
            (
                InitStep::BindListener,
                ListenerState::ServiceRegistered {
                    connection,
                    onion_info,
                    ..
                },
            ) => match TcpListener::bind(options.local_addr.as_str()).await {
                Ok(listener) => Ok(ListenerState::Listening {
                    connection,
                    onion_info,
                    listener,
                }),
                Err(error) => Err(StepFailure::registered(
                    TorError::ListenerBindError(error),
                    connection,
                    onion_info,
                )),
            },
            (step, state) => Err(TorError::state_error(&format!(
                "Cannot run '{}' while {:?}",
                step,
                state.phase()
            ))
            .into()),
        }
    }
}

// A failed initialization step, plus the onion service to roll back if one was registered
struct StepFailure {
    error: TorError,
    registration: Option<(TorControlConnection, ServiceId)>,
}

impl StepFailure {
    fn registered(error: TorError, connection: TorControlConnection, onion_info: OnionInfo) -> Self {
        Self {
            error,
            registration: Some((connection, onion_info.service_id().clone())),
        }
    }
}

impl From<TorError> for StepFailure {
    fn from(error: TorError) -> Self {
        Self {
            error,
            registration: None,
        }
    }
}

async fn load_key(options: &OnionListenerOptions) -> Result<Option<OnionKey>, TorError> {
    let key_file = match &options.key_file {
        Some(key_file) => key_file,
        None => return Ok(None),
    };
    match read_key_file(key_file).await {
        Ok(Some(key)) => {
            match key.service_id() {
                Ok(Some(service_id)) => info!(
                    "Reusing onion key from {} for {}",
                    key_file.display(),
                    service_id.onion_hostname()
                ),
                Ok(None) => info!("Reusing {} onion key from {}", key.key_type(), key_file.display()),
                Err(error) => warn!("Onion key in {} looks damaged: {}", key_file.display(), error),
            }
            Ok(Some(key))
        }
        Ok(None) if options.require_existing_key => Err(TorError::persistence_error(
            key_file,
            "No key file, and an existing key is required",
        )),
        Ok(None) => {
            info!(
                "No onion key at {}, a new one will be generated",
                key_file.display()
            );
            Ok(None)
        }
        Err(error) if options.require_existing_key => Err(error),
        Err(error) => {
            warn!("Ignoring unusable onion key, a new one will be generated: {}", error);
            Ok(None)
        }
    }
}

async fn open_session(options: &OnionListenerOptions) -> Result<TorControlConnection, TorError> {
    let address = options.control_address()?;
    let mut connection = TorControlConnection::connect_to(
        &address,
        SessionConfig {
            debug: options.debug,
        },
    )
    .await?;
    let password = options.control_password.as_deref().unwrap_or("");
    connection
        .authenticate(&TorAuthentication::from_password(password))
        .await?;
    debug!("Authenticated to Tor control port {:?}", address);
    Ok(connection)
}

async fn register_service(
    options: &OnionListenerOptions,
    key: Option<OnionKey>,
    mut connection: TorControlConnection,
) -> Result<ListenerState, StepFailure> {
    let key_request = match &key {
        Some(key) => KeyRequest::PrivateKey(key.clone()),
        None => KeyRequest::Best,
    };
    let onion_info = connection
        .add_onion(
            options.virt_port,
            &options.local_addr,
            &key_request,
            options.detach,
        )
        .await?;

    // The key in use is the one Tor just generated, or else the one we supplied
    let key = match (onion_info.private_key().cloned(), key) {
        (Some(generated), _) => generated,
        (None, Some(supplied)) => {
            if let Ok(Some(expected)) = supplied.service_id() {
                if &expected != onion_info.service_id() {
                    warn!(
                        "Tor registered {} but the supplied key belongs to {}",
                        onion_info.service_id(),
                        expected
                    );
                }
            }
            supplied
        }
        (None, None) => {
            return Err(StepFailure::registered(
                TorError::parse_error("ADD_ONION reply carried no key"),
                connection,
                onion_info,
            ))
        }
    };

    Ok(ListenerState::ServiceRegistered {
        key,
        connection,
        onion_info,
    })
}

async fn roll_back(registration: Option<(TorControlConnection, ServiceId)>) {
    if let Some((mut connection, service_id)) = registration {
        match connection.delete_onion(&service_id).await {
            Ok(()) => info!("Rolled back onion service {}", service_id.onion_hostname()),
            Err(error) => warn!(
                "Failed to roll back onion service {}: {}",
                service_id.onion_hostname(),
                error
            ),
        }
    }
}

/// An onion service whose incoming connections are accepted from a local TCP listener.
///
/// ```no_run
/// # use onion_listener::{OnionListener, OnionListenerOptions, TorError};
/// # #[tokio::main]
/// # async fn main() -> Result<(), TorError> {
/// let options = OnionListenerOptions::new(80, "127.0.0.1:8080", "tcp", "127.0.0.1:9051")
///     .with_key_file("echo_onion_key");
/// let mut listener = OnionListener::bind(options).await?;
/// println!("listening on {}", listener.address()?);
///
/// let (stream, _) = listener.accept().await?;
/// tokio::spawn(async move {
///     let (mut reader, mut writer) = stream.into_split();
///     let _ = tokio::io::copy(&mut reader, &mut writer).await;
/// });
///
/// listener.close().await?;
/// # Ok(())
/// # }
/// ```
pub struct OnionListener {
    options: OnionListenerOptions,
    state: ListenerState,
}

impl OnionListener {
    pub fn new(options: OnionListenerOptions) -> Result<Self, TorError> {
        options.validate()?;
        Ok(Self {
            options,
            state: ListenerState::Uninitialized,
        })
    }

    /// Create the listener and bring it all the way up to `Listening`
    pub async fn bind(options: OnionListenerOptions) -> Result<Self, TorError> {
        let mut listener = Self::new(options)?;
        listener.initialize().await?;
        Ok(listener)
    }

    pub fn options(&self) -> &OnionListenerOptions {
        &self.options
    }

    pub fn phase(&self) -> ListenerPhase {
        self.state.phase()
    }

    fn advance(&mut self, from: ListenerPhase, next: ListenerState) {
        let to = next.phase();
        debug_assert!(from.can_advance_to(to), "{:?} -> {:?}", from, to);
        if from != to {
            debug!("Onion listener {:?} -> {:?}", from, to);
        }
        self.state = next;
    }

    /// Load the key, authenticate, register the service, persist its key and bind the local
    /// listener. On failure the listener ends up `Closed`, with any registered service deleted.
    pub async fn initialize(&mut self) -> Result<(), TorError> {
        if self.phase() != ListenerPhase::Uninitialized {
            return Err(TorError::state_error(&format!(
                "Cannot initialize a listener that is {:?}",
                self.phase()
            )));
        }

        for step in INIT_STEPS {
            let state = std::mem::replace(&mut self.state, ListenerState::closed());
            let from = state.phase();
            match state.run_step(step, &self.options).await {
                Ok(next) => self.advance(from, next),
                Err(failure) => {
                    warn!("Onion listener failed while {}: {}", step, failure.error);
                    roll_back(failure.registration).await;
                    self.advance(from, ListenerState::closed());
                    return Err(failure.error.during(step));
                }
            }
        }

        info!("Onion service listening on {}", self.address()?);
        Ok(())
    }

    fn not_ready(&self) -> TorError {
        TorError::state_error(&format!(
            "Onion service not ready: listener is {:?}",
            self.phase()
        ))
    }

    /// Wait for the next connection to the onion service
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr), TorError> {
        match &self.state {
            ListenerState::Listening { listener, .. } => {
                listener.accept().await.map_err(TorError::TransportError)
            }
            _ => Err(self.not_ready()),
        }
    }

    /// Accepted connections as a stream. Ends when the listener is not `Listening`.
    pub fn incoming(&self) -> impl Stream<Item = Result<TcpStream, TorError>> + '_ {
        futures::stream::unfold(self, |listener| async move {
            match listener.accept().await {
                Err(TorError::LifecycleStateError(_)) => None,
                result => Some((result.map(|(stream, _)| stream), listener)),
            }
        })
    }

    /// Delete the onion service. The local listener and control connection stay open until the
    /// `OnionListener` is dropped.
    pub async fn close(&mut self) -> Result<(), TorError> {
        match std::mem::replace(&mut self.state, ListenerState::closed()) {
            ListenerState::Listening {
                mut connection,
                onion_info,
                listener,
            } => {
                let result = connection.delete_onion(onion_info.service_id()).await;
                self.advance(
                    ListenerPhase::Listening,
                    ListenerState::Closed {
                        connection: Some(connection),
                        listener: Some(listener),
                    },
                );
                result
            }
            state => {
                self.state = state;
                Err(TorError::state_error(&format!(
                    "Cannot close a listener that is {:?}",
                    self.phase()
                )))
            }
        }
    }

    pub fn address(&self) -> Result<OnionAddr, TorError> {
        match &self.state {
            ListenerState::Listening { onion_info, .. } => {
                Ok(OnionAddr::new(onion_info.service_id(), self.options.virt_port))
            }
            _ => Err(self.not_ready()),
        }
    }

    /// Address of the local listener the onion service forwards to. Still available after
    /// `close()`, since the listener itself stays bound.
    pub fn local_addr(&self) -> Result<SocketAddr, TorError> {
        match &self.state {
            ListenerState::Listening { listener, .. }
            | ListenerState::Closed {
                listener: Some(listener),
                ..
            } => listener.local_addr().map_err(TorError::TransportError),
            _ => Err(self.not_ready()),
        }
    }

    /// The control session, for issuing further commands alongside the onion service
    pub fn control_connection(&mut self) -> Option<&mut TorControlConnection> {
        match &mut self.state {
            ListenerState::Listening { connection, .. }
            | ListenerState::Closed {
                connection: Some(connection),
                ..
            } => Some(connection),
            _ => None,
        }
    }

    pub fn onion_info(&self) -> Option<&OnionInfo> {
        match &self.state {
            ListenerState::ServiceRegistered { onion_info, .. }
            | ListenerState::Listening { onion_info, .. } => Some(onion_info),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn options() -> OnionListenerOptions {
        OnionListenerOptions::new(80, "127.0.0.1:0", "tcp", "127.0.0.1:9051")
    }

    #[test]
    fn test_transition_table() {
        use ListenerPhase::*;
        assert!(Uninitialized.can_advance_to(KeyLoaded));
        assert!(ServiceRegistered.can_advance_to(Listening));
        assert!(Listening.can_advance_to(Closed));
        assert!(!Uninitialized.can_advance_to(Listening));
        assert!(!KeyLoaded.can_advance_to(ServiceRegistered));
        assert!(!Closed.can_advance_to(Uninitialized));
        assert!(!Closed.can_advance_to(Closed));
    }

    #[test]
    fn test_onion_addr() -> Result<(), TorError> {
        let address = OnionAddr::new(&ServiceId::new("exampleid")?, 80);
        assert_eq!("exampleid.onion:80", address.to_string());
        assert_eq!("onion-service", address.network());
        Ok(())
    }

    #[test]
    fn test_new_validates_options() {
        let result = OnionListener::new(OnionListenerOptions::new(80, "127.0.0.1:0", "tcp", ""));
        assert!(matches!(result, Err(TorError::ConfigError(_))));
    }

    #[tokio::test]
    async fn test_not_ready_before_initialize() -> Result<(), TorError> {
        let mut listener = OnionListener::new(options())?;
        assert_eq!(ListenerPhase::Uninitialized, listener.phase());
        assert!(matches!(
            listener.accept().await,
            Err(TorError::LifecycleStateError(_))
        ));
        assert!(matches!(
            listener.address(),
            Err(TorError::LifecycleStateError(_))
        ));
        assert!(matches!(
            listener.local_addr(),
            Err(TorError::LifecycleStateError(_))
        ));
        assert!(listener.onion_info().is_none());
        assert!(Box::pin(listener.incoming()).next().await.is_none());
        assert!(matches!(
            listener.close().await,
            Err(TorError::LifecycleStateError(_))
        ));
        assert_eq!(ListenerPhase::Uninitialized, listener.phase());
        Ok(())
    }

    #[tokio::test]
    async fn test_unreachable_control_port_closes_listener() -> Result<(), TorError> {
        // Grab a free port, then release it so nothing is listening there
        let port = std::net::TcpListener::bind("127.0.0.1:0")?.local_addr()?.port();
        let mut listener = OnionListener::new(OnionListenerOptions::new(
            80,
            "127.0.0.1:0",
            "tcp",
            &format!("127.0.0.1:{}", port),
        ))?;
        let error = listener.initialize().await.unwrap_err();
        assert_eq!(Some(InitStep::Authenticate), error.failed_step());
        assert_eq!(ListenerPhase::Closed, listener.phase());

        // Closed is terminal
        assert!(matches!(
            listener.initialize().await,
            Err(TorError::LifecycleStateError(_))
        ));
        Ok(())
    }
}
