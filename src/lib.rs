//! # Onion Listener
//! Ephemeral [Tor](https://www.torproject.org/) onion services behind an ordinary TCP accept
//! loop, driven over Tor's [control protocol](https://spec.torproject.org/control-spec/).
//!
//! An [`OnionListener`] connects to the control port, authenticates, registers an onion service
//! with `ADD_ONION`, saves the service key so the `.onion` address survives restarts, and binds
//! the local listener the service forwards to. `close()` deletes the service with `DEL_ONION`.
//!
//! ## Commands Supported
//! - PROTOCOLINFO
//! - AUTHENTICATE
//! - AUTHCHALLENGE
//! - GETINFO
//! - ADD_ONION
//! - DEL_ONION
//!
//! ## Example Code
//! ```no_run
//! use onion_listener::{OnionListener, OnionListenerOptions, TorError};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), TorError> {
//! let options = OnionListenerOptions::new(80, "127.0.0.1:8080", "tcp", "127.0.0.1:9051")
//!     .with_key_file("echo_onion_key");
//! let mut listener = OnionListener::bind(options).await?;
//! println!("Serving on {}", listener.address()?);
//!
//! loop {
//!     let (stream, _) = listener.accept().await?;
//!     tokio::spawn(async move {
//!         let (mut reader, mut writer) = stream.into_split();
//!         let _ = tokio::io::copy(&mut reader, &mut writer).await;
//!     });
//! }
//! # }
//! ```
//!
//! Outbound connections through Tor's SOCKS port go through [`TorDialer`]:
//! ```no_run
//! # use onion_listener::{TorDialer, TorError};
//! # #[tokio::main]
//! # async fn main() -> Result<(), TorError> {
//! let dialer = TorDialer::new("127.0.0.1:9050", None);
//! let stream = dialer.dial("tcp", "example.onion:80").await?;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod config;
pub mod control_connection;
pub mod dialer;
pub mod error;
pub mod key;
pub mod listener;
pub mod onion;

pub use crate::auth::TorAuthentication;
pub use crate::config::OnionListenerOptions;
pub use crate::control_connection::{ControlResponse, TorControlConnection};
pub use crate::dialer::TorDialer;
pub use crate::error::{InitStep, TorError};
pub use crate::key::{KeyType, OnionKey, ServiceId};
pub use crate::listener::{ListenerPhase, OnionAddr, OnionListener};
pub use crate::onion::{KeyRequest, OnionInfo};
