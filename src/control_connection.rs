use crate::{
    auth::TorAuthentication,
    error::TorError,
    key::ServiceId,
    onion::{
        build_add_onion, build_delete_onion, parse_add_onion_reply, registered_service_id,
        KeyRequest, OnionInfo,
    },
};
use futures::{SinkExt, StreamExt};
use lazy_static::lazy_static;
use log::{debug, info, warn};
use regex::Regex;
use std::borrow::Cow;
use std::path::PathBuf;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf},
    net::{TcpStream, ToSocketAddrs},
};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use zeroize::Zeroizing;

const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Any byte stream a control session can run over
pub trait ControlStream: AsyncRead + AsyncWrite + Unpin + Send + Sync {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + Sync> ControlStream for T {}

type BoxedStream = Box<dyn ControlStream>;

/// Where the Tor control port lives
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlAddress {
    Tcp(String),
    Unix(PathBuf),
}

impl ControlAddress {
    /// Build an address from a network name (`tcp`, `tcp4`, `tcp6` or `unix`) and an address
    pub fn parse(network: &str, address: &str) -> Result<Self, TorError> {
        if address.is_empty() {
            return Err(TorError::config_error("Control address not specified"));
        }
        match network {
            "tcp" | "tcp4" | "tcp6" => Ok(ControlAddress::Tcp(address.to_string())),
            "unix" => Ok(ControlAddress::Unix(PathBuf::from(address))),
            "" => Err(TorError::config_error("Control network not specified")),
            _ => Err(TorError::config_error(&format!(
                "Unsupported control network '{}'",
                network
            ))),
        }
    }
}

/// Per-session settings, fixed when the session is created
#[derive(Clone, Copy, Debug, Default)]
pub struct SessionConfig {
    /// Log every control line sent and received, with key material and credentials redacted
    pub debug: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    Authenticated,
    /// The transport failed; nothing more can be sent
    Closed,
}

/// Broad meaning of a reply status code
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusClass {
    Success,
    Continuation,
    Error,
    AsyncEvent,
}

#[derive(Clone, Debug)]
pub struct ControlResponse {
    status_code: u16,
    reply: String,
}

impl ControlResponse {
    pub fn new<S: Into<String>>(status_code: u16, reply: S) -> Self {
        Self {
            status_code,
            reply: reply.into(),
        }
    }

    pub fn status_code(&self) -> u16 {
        self.status_code
    }

    pub fn reply(&self) -> &str {
        &self.reply
    }

    pub fn class(&self) -> StatusClass {
        match self.status_code {
            200..=299 => StatusClass::Success,
            300..=399 => StatusClass::Continuation,
            600..=699 => StatusClass::AsyncEvent,
            _ => StatusClass::Error,
        }
    }

    pub fn is_success(&self) -> bool {
        self.class() == StatusClass::Success
    }

    /// Reply lines of the form `Key=Value`, in order
    pub fn key_values(&self) -> Vec<(&str, &str)> {
        self.reply
            .lines()
            .filter_map(|line| line.split_once('='))
            .filter(|(key, _)| !key.is_empty() && !key.contains(' '))
            .collect()
    }
}

fn parse_status_code(code: &str) -> Result<u16, TorError> {
    code.parse::<u16>()
        .map_err(|_| TorError::ProtocolError(format!("Bad status code: {}", code)))
}

async fn read_control_response<S: StreamExt<Item = Result<String, LinesCodecError>> + Unpin>(
    reader: &mut S,
) -> Result<ControlResponse, TorError> {
    lazy_static! {
        // Mid reply
        static ref MID_REGEX: Regex = Regex::new(r"^(?P<code>\d{3})-(?P<reply_line>.*)$").unwrap();

        // Data reply
        static ref DATA_REGEX: Regex =
            Regex::new(r"^(?P<code>\d{3})\+(?P<reply_line>.*)$").unwrap();

        // End of reply message
        static ref END_REGEX: Regex = Regex::new(r"^(?P<code>\d{3}) (?P<reply_line>.*)$").unwrap();
    }

    let mut control_response = ControlResponse::new(0, String::new());
    loop {
        let line = read_line(reader).await?;
        if let Some(captures) = MID_REGEX.captures(&line) {
            // Read Mid replies line-by-line, and append their reply lines to the reply
            control_response.status_code = parse_status_code(&captures["code"])?;
            control_response.reply.push_str(&captures["reply_line"]);
            control_response.reply.push('\n');
        } else if let Some(captures) = DATA_REGEX.captures(&line) {
            // Everything up to the lone "." belongs to the reply; the reply itself continues
            // until the end line
            control_response.status_code = parse_status_code(&captures["code"])?;
            control_response.reply.push_str(&captures["reply_line"]);
            control_response.reply.push('\n');
            loop {
                let data_line = read_line(reader).await?;
                if data_line == "." {
                    break;
                }
                let data_line = data_line.strip_prefix('.').unwrap_or(&data_line);
                control_response.reply.push_str(data_line);
                control_response.reply.push('\n');
            }
        } else if let Some(captures) = END_REGEX.captures(&line) {
            control_response.status_code = parse_status_code(&captures["code"])?;
            // If we haven't gotten any other replies, use this one as the message
            if control_response.reply.is_empty() {
                control_response.reply.push_str(&captures["reply_line"]);
            }
            return Ok(control_response);
        } else {
            return Err(TorError::ProtocolError(format!(
                "Unknown response: {}",
                line
            )));
        }
    }
}

pub(crate) async fn read_line<S: StreamExt<Item = Result<String, LinesCodecError>> + Unpin>(
    reader: &mut S,
) -> Result<String, TorError> {
    match reader.next().await {
        Some(Ok(line)) => Ok(line),
        Some(Err(error)) => Err(error.into()),
        None => Err(TorError::TransportError(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "Unexpected EOF on control connection",
        ))),
    }
}

// Keep key material and credentials out of the logs
fn redact(line: &str) -> Cow<'_, str> {
    if line.starts_with("AUTHENTICATE ") {
        return Cow::Borrowed("AUTHENTICATE <redacted>");
    }
    if line.starts_with("ADD_ONION ") && !line.starts_with("ADD_ONION NEW:") {
        return Cow::Borrowed("ADD_ONION <redacted>");
    }
    match line.find("PrivateKey=") {
        Some(index) => Cow::Owned(format!("{}PrivateKey=<redacted>", &line[..index])),
        None => Cow::Borrowed(line),
    }
}

#[derive(Clone, Debug)]
pub struct ProtocolInfo {
    pub auth_methods: Vec<String>,
    pub cookie_file: Option<String>,
    pub tor_version: Option<String>,
}

fn parse_protocol_info(reply: &str) -> Result<ProtocolInfo, TorError> {
    lazy_static! {
        static ref AUTH_RE: Regex = Regex::new(
            r#"(?m)^AUTH METHODS=(?P<auth_methods>[^ \n]*)(?: COOKIEFILE="(?P<cookie_file>(?:[^"\\]|\\.)*)")?"#
        )
        .unwrap();
        static ref VERSION_RE: Regex =
            Regex::new(r#"(?m)^VERSION Tor="(?P<tor_version>[^"]*)""#).unwrap();
    }

    let captures = AUTH_RE
        .captures(reply)
        .ok_or_else(|| TorError::parse_error("PROTOCOLINFO reply has no AUTH line"))?;
    Ok(ProtocolInfo {
        auth_methods: captures["auth_methods"]
            .split(',')
            .filter(|method| !method.is_empty())
            .map(|method| method.to_string())
            .collect(),
        cookie_file: captures
            .name("cookie_file")
            .map(|c| c.as_str().replace("\\\"", "\"").replace("\\\\", "\\")),
        tor_version: VERSION_RE
            .captures(reply)
            .map(|captures| captures["tor_version"].to_string()),
    })
}

/// A session on the Tor control port.
///
/// The control protocol allows one request in flight per connection; every exchange takes
/// `&mut self`, so callers sharing a session must serialize access themselves (e.g. with a
/// `tokio::sync::Mutex`).
pub struct TorControlConnection {
    reader: FramedRead<ReadHalf<BoxedStream>, LinesCodec>,
    writer: FramedWrite<WriteHalf<BoxedStream>, LinesCodec>,
    protocol_info: Option<ProtocolInfo>,
    state: SessionState,
    config: SessionConfig,
}

impl TorControlConnection {
    pub async fn connect<A: ToSocketAddrs>(addrs: A) -> Result<Self, TorError> {
        let stream = TcpStream::connect(addrs).await?;
        Ok(Self::with_stream(stream, SessionConfig::default()))
    }

    pub async fn connect_to(
        address: &ControlAddress,
        config: SessionConfig,
    ) -> Result<Self, TorError> {
        match address {
            ControlAddress::Tcp(address) => {
                let stream = TcpStream::connect(address.as_str()).await?;
                Ok(Self::with_stream(stream, config))
            }
            #[cfg(unix)]
            ControlAddress::Unix(path) => {
                let stream = tokio::net::UnixStream::connect(path).await?;
                Ok(Self::with_stream(stream, config))
            }
            #[cfg(not(unix))]
            ControlAddress::Unix(_) => Err(TorError::protocol_error(
                "Unix control sockets are not supported on this platform",
            )),
        }
    }

    pub fn with_stream<S: ControlStream + 'static>(stream: S, config: SessionConfig) -> Self {
        let stream: BoxedStream = Box::new(stream);
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_LENGTH)),
            writer: FramedWrite::new(writer, LinesCodec::new()),
            protocol_info: None,
            state: SessionState::Unauthenticated,
            config,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    async fn write(&mut self, data: &str) -> Result<(), TorError> {
        // LinesCodec appends the LF
        let line = Zeroizing::new(format!("{}\r", data));
        self.writer.send(line.as_str()).await?;
        Ok(())
    }

    async fn exchange(&mut self, command_line: &str) -> Result<ControlResponse, TorError> {
        self.write(command_line).await?;
        read_control_response(&mut self.reader).await
    }

    /// Send one command line and wait for its complete reply.
    ///
    /// Any failure here other than a rejected command line leaves the session `Closed`.
    pub async fn request(&mut self, command_line: &str) -> Result<ControlResponse, TorError> {
        if self.state == SessionState::Closed {
            return Err(TorError::TransportError(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "Control session is closed",
            )));
        }
        if command_line.contains(&['\r', '\n'][..]) {
            return Err(TorError::protocol_error(
                "Command must not contain line terminators",
            ));
        }

        if self.config.debug {
            debug!("-> {}", redact(command_line));
        }
        match self.exchange(command_line).await {
            Ok(control_response) => {
                if self.config.debug {
                    for line in control_response.reply.lines() {
                        debug!("<- {} {}", control_response.status_code, redact(line));
                    }
                }
                Ok(control_response)
            }
            Err(error) => {
                warn!("Control session failed, closing it: {}", error);
                self.state = SessionState::Closed;
                Err(error)
            }
        }
    }

    pub async fn send_command(
        &mut self,
        command: &str,
        arguments: Option<&str>,
    ) -> Result<ControlResponse, TorError> {
        let control_response = match arguments {
            None => self.request(command).await?,
            Some(arguments) => {
                let line = Zeroizing::new(format!("{} {}", command, arguments));
                self.request(&line).await?
            }
        };
        match control_response.class() {
            StatusClass::Success => Ok(control_response),
            _ => Err(TorError::ProtocolError(format!(
                "{} {}",
                control_response.status_code,
                control_response.reply.trim_end()
            ))),
        }
    }

    pub async fn get_protocol_info(&mut self) -> Result<ProtocolInfo, TorError> {
        if let Some(protocol_info) = &self.protocol_info {
            return Ok(protocol_info.clone());
        }
        let control_response = self.send_command("PROTOCOLINFO", Some("1")).await?;
        let protocol_info = parse_protocol_info(&control_response.reply)?;
        self.protocol_info = Some(protocol_info.clone());
        Ok(protocol_info)
    }

    /// Authenticate the session. Allowed exactly once, before anything but `PROTOCOLINFO`.
    pub async fn authenticate(&mut self, method: &TorAuthentication) -> Result<(), TorError> {
        match self.state {
            SessionState::Unauthenticated => {}
            SessionState::Authenticated => {
                return Err(TorError::state_error("Session is already authenticated"))
            }
            SessionState::Closed => {
                return Err(TorError::TransportError(std::io::Error::new(
                    std::io::ErrorKind::NotConnected,
                    "Control session is closed",
                )))
            }
        }

        match method.authenticate(self).await {
            Ok(()) => {
                self.state = SessionState::Authenticated;
                Ok(())
            }
            Err(error) => {
                // Tor hangs up on controllers that fail to authenticate
                self.state = SessionState::Closed;
                Err(error)
            }
        }
    }

    pub async fn get_info(&mut self, key: &str) -> Result<String, TorError> {
        let control_response = self.send_command("GETINFO", Some(key)).await?;
        let prefix = format!("{}=", key);
        let value = control_response
            .reply
            .strip_prefix(&prefix)
            .ok_or_else(|| {
                TorError::parse_error(&format!("GETINFO reply has no value for '{}'", key))
            })?;
        let value = value.strip_prefix('\n').unwrap_or(value);
        Ok(value.strip_suffix('\n').unwrap_or(value).to_string())
    }

    pub async fn add_onion(
        &mut self,
        virt_port: u16,
        target: &str,
        key_request: &KeyRequest,
        detach: bool,
    ) -> Result<OnionInfo, TorError> {
        let command = build_add_onion(virt_port, target, key_request, detach);
        let control_response = self.request(&command).await?;
        debug!(
            "Sent ADD_ONION command, got status {}",
            control_response.status_code
        );
        let registered = registered_service_id(&control_response);
        let onion_info = match parse_add_onion_reply(control_response, key_request.is_new()) {
            Ok(onion_info) => onion_info,
            Err(error) => {
                // Tor created the service even though we can't use its reply
                if let Some(service_id) = registered {
                    warn!(
                        "Removing onion service {} after unusable ADD_ONION reply: {}",
                        service_id.onion_hostname(),
                        error
                    );
                    if let Err(delete_error) = self.delete_onion(&service_id).await {
                        warn!(
                            "Failed to remove onion service {}: {}",
                            service_id.onion_hostname(),
                            delete_error
                        );
                    }
                }
                return Err(error);
            }
        };
        info!(
            "Registered onion service {} (port {} -> {})",
            onion_info.service_id().onion_hostname(),
            virt_port,
            target
        );
        Ok(onion_info)
    }

    pub async fn delete_onion(&mut self, service_id: &ServiceId) -> Result<(), TorError> {
        let control_response = self.request(&build_delete_onion(service_id)).await?;
        if !control_response.is_success() {
            return Err(TorError::ProtocolError(format!(
                "DEL_ONION {} failed: {} {}",
                service_id, control_response.status_code, control_response.reply
            )));
        }
        info!("Deleted onion service {}", service_id.onion_hostname());
        Ok(())
    }
}
