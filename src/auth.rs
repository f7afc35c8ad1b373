use crate::control_connection::{ProtocolInfo, TorControlConnection};
use crate::error::TorError;
use hex;
use hmac::{Hmac, Mac};
use lazy_static::lazy_static;
use log::debug;
use rand;
use regex::Regex;
use sha2::Sha256;
use zeroize::Zeroizing;

// Create alias for HMAC-SHA256
type HmacSha256 = Hmac<Sha256>;

const COOKIE_LENGTH: usize = 32;

fn parse_authchallenge_response(response: &str) -> Result<(Vec<u8>, Vec<u8>), TorError> {
    // Parse the controller response
    lazy_static! {
        static ref RE: Regex =
            Regex::new(r"^AUTHCHALLENGE SERVERHASH=(?P<server_hash>[0-9A-Fa-f]*) SERVERNONCE=(?P<server_nonce>[0-9A-Fa-f]*)")
                .unwrap();
    }
    let captures = RE.captures(response).ok_or_else(|| {
        TorError::protocol_error(&format!(
            "Unexpected response from AUTHCHALLENGE: {}",
            response
        ))
    })?;
    let server_hash = hex::decode(&captures["server_hash"]).map_err(|error| {
        TorError::protocol_error(&format!(
            "Error decoding hex server hash from server: {}",
            error
        ))
    })?;
    let server_nonce = hex::decode(&captures["server_nonce"]).map_err(|error| {
        TorError::protocol_error(&format!(
            "Error decoding hex server nonce from server: {}",
            error
        ))
    })?;
    Ok((server_hash, server_nonce))
}

fn generate_hmac(key: &[u8], message: &[u8]) -> Result<Vec<u8>, TorError> {
    let mut hmac = HmacSha256::new_from_slice(key)
        .map_err(|error| TorError::authentication_error(&error.to_string()))?;
    hmac.update(message);
    Ok(hmac.finalize().into_bytes().to_vec())
}

fn validate_server_hash(
    safe_cookie_value: &[u8],
    client_nonce: &[u8],
    server_nonce: &[u8],
    server_hash: &[u8],
) -> Result<Zeroizing<Vec<u8>>, TorError> {
    let mut message = Zeroizing::new(safe_cookie_value.to_vec());
    message.extend_from_slice(client_nonce);
    message.extend_from_slice(server_nonce);
    let hash = generate_hmac(
        b"Tor safe cookie authentication server-to-controller hash",
        &message,
    )?;

    if hash.as_slice() == server_hash {
        Ok(message)
    } else {
        Err(TorError::authentication_error(
            "Server hash didn't validate",
        ))
    }
}

async fn safe_cookie_authentication(
    cookie: &[u8],
    connection: &mut TorControlConnection,
) -> Result<(), TorError> {
    if cookie.len() != COOKIE_LENGTH {
        return Err(TorError::authentication_error(&format!(
            "Expected a {}-byte cookie, got {} bytes",
            COOKIE_LENGTH,
            cookie.len()
        )));
    }

    let client_nonce: [u8; 32] = rand::random();
    let response = connection
        .send_command(
            "AUTHCHALLENGE",
            Some(&format!("SAFECOOKIE {}", hex::encode(client_nonce))),
        )
        .await?;
    let (server_hash, server_nonce) = parse_authchallenge_response(response.reply())?;

    // Note: we reuse the message from the HMAC
    let message = validate_server_hash(cookie, &client_nonce, &server_nonce, &server_hash)?;

    let auth_string = Zeroizing::new(hex::encode(generate_hmac(
        b"Tor safe cookie authentication controller-to-server hash",
        &message,
    )?));
    send_authenticate(connection, Some(auth_string.as_str())).await
}

async fn send_authenticate(
    connection: &mut TorControlConnection,
    argument: Option<&str>,
) -> Result<(), TorError> {
    match connection.send_command("AUTHENTICATE", argument).await {
        Ok(_) => Ok(()),
        Err(TorError::ProtocolError(error)) => Err(TorError::AuthenticationError(error)),
        Err(error) => Err(error),
    }
}

// Control protocol QuotedString
fn quote(value: &str) -> Zeroizing<String> {
    let mut quoted = Zeroizing::new(String::with_capacity(value.len() + 2));
    quoted.push('"');
    for c in value.chars() {
        if c == '"' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

/// Methods for Tor authentication:
/// - Null - No authentication
/// - SafeCookie - `SAFECOOKIE` authentication
/// - HashedPassword - pass the hashed password to authenticate
/// - Auto - whichever of `NULL` or `SAFECOOKIE` the server offers, in that order
///
/// With `SafeCookie` auth, you can either pass in the cookie value as a binary vector, or, if you
/// pass in "None", it will call the PROTOCOLINFO command to get the location of the cookie file,
/// and attempt to read that and pass the value to authenticate.
///
/// Note that we don't support plain `COOKIE` authentication, since that's been determmined to be
/// unsafe.
pub enum TorAuthentication {
    Null,
    SafeCookie(Option<Vec<u8>>), // Cookie String
    HashedPassword(String),      // Password
    Auto,
}

lazy_static! {
    static ref NULL_AUTH_NAME: String = "NULL".to_string();
    static ref HASHED_PASSWORD_NAME: String = "HASHEDPASSWORD".to_string();
    static ref SAFE_COOKIE_NAME: String = "SAFECOOKIE".to_string();
}

impl TorAuthentication {
    /// A password authenticates with `HASHEDPASSWORD`; an empty one falls back to `Auto`
    pub fn from_password(password: &str) -> Self {
        if password.is_empty() {
            TorAuthentication::Auto
        } else {
            TorAuthentication::HashedPassword(password.to_string())
        }
    }

    /// Authenticate using this method to the server.
    ///
    /// Use [`TorControlConnection::authenticate`] rather than calling this directly, so the
    /// session tracks its authentication state.
    pub async fn authenticate(
        &self,
        connection: &mut TorControlConnection,
    ) -> Result<(), TorError> {
        let protocol_info = connection.get_protocol_info().await?;
        match self {
            TorAuthentication::Null => {
                require_method(&protocol_info, &NULL_AUTH_NAME)?;
                send_authenticate(connection, None).await
            }
            TorAuthentication::HashedPassword(password) => {
                require_method(&protocol_info, &HASHED_PASSWORD_NAME)?;
                send_authenticate(connection, Some(quote(password).as_str())).await
            }
            TorAuthentication::SafeCookie(cookie) => {
                require_method(&protocol_info, &SAFE_COOKIE_NAME)?;
                match cookie {
                    // Authenticate using the passed-in cookie
                    Some(cookie) => safe_cookie_authentication(cookie, connection).await,

                    // None means to read the cookie from the cookie file as defined in the
                    // server's protocol_info
                    None => {
                        let cookie = read_cookie_file(&protocol_info)?;
                        safe_cookie_authentication(&cookie, connection).await
                    }
                }
            }
            TorAuthentication::Auto => {
                if protocol_info.auth_methods.contains(&*NULL_AUTH_NAME) {
                    debug!("Authenticating with NULL auth");
                    send_authenticate(connection, None).await
                } else if protocol_info.auth_methods.contains(&*SAFE_COOKIE_NAME) {
                    debug!("Authenticating with SAFECOOKIE auth");
                    let cookie = read_cookie_file(&protocol_info)?;
                    safe_cookie_authentication(&cookie, connection).await
                } else {
                    Err(TorError::AuthenticationError(format!(
                        "No password given and server only allows {}",
                        protocol_info.auth_methods.join(",")
                    )))
                }
            }
        }
    }
}

fn require_method(protocol_info: &ProtocolInfo, method: &str) -> Result<(), TorError> {
    if protocol_info.auth_methods.iter().any(|m| m == method) {
        Ok(())
    } else {
        Err(TorError::AuthenticationError(format!(
            "{} auth not allowed by this server",
            method
        )))
    }
}

fn read_cookie_file(protocol_info: &ProtocolInfo) -> Result<Zeroizing<Vec<u8>>, TorError> {
    match &protocol_info.cookie_file {
        Some(cookie_file) => std::fs::read(cookie_file)
            .map(Zeroizing::new)
            .map_err(|error| {
                TorError::authentication_error(&format!(
                    "Error reading cookie file {}: {}",
                    cookie_file, error
                ))
            }),
        None => Err(TorError::authentication_error(
            "No cookie file provided in tor protocol info",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_connection::{SessionConfig, SessionState};
    use futures::{SinkExt, StreamExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio_util::codec::{Framed, LinesCodec};

    async fn create_session_mock() -> Result<
        (TorControlConnection, Framed<TcpStream, LinesCodec>),
        Box<dyn std::error::Error>,
    > {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let join_handle = tokio::spawn(async move { listener.accept().await.unwrap() });
        let client = TcpStream::connect(addr).await?;
        let (server, _) = join_handle.await?;
        Ok((
            TorControlConnection::with_stream(client, SessionConfig::default()),
            Framed::new(server, LinesCodec::new()),
        ))
    }

    fn hmac_hex(key: &[u8], message: &[u8]) -> String {
        hex::encode(generate_hmac(key, message).unwrap())
    }

    #[test]
    fn test_parse_authchallenge_response() {
        let (hash, nonce) =
            parse_authchallenge_response("AUTHCHALLENGE SERVERHASH=0A0b SERVERNONCE=FF").unwrap();
        assert_eq!(vec![0x0a, 0x0b], hash);
        assert_eq!(vec![0xff], nonce);

        assert!(matches!(
            parse_authchallenge_response("AUTHCHALLENGE SERVERHASH=0 SERVERNONCE=FF"),
            Err(TorError::ProtocolError(_))
        ));
        assert!(matches!(
            parse_authchallenge_response("OK"),
            Err(TorError::ProtocolError(_))
        ));
    }

    #[test]
    fn test_quote() {
        assert_eq!("\"pass\"", quote("pass").as_str());
        assert_eq!("\"a\\\"b\\\\c\"", quote("a\"b\\c").as_str());
    }

    #[test]
    fn test_from_password() {
        assert!(matches!(
            TorAuthentication::from_password(""),
            TorAuthentication::Auto
        ));
        assert!(matches!(
            TorAuthentication::from_password("secret"),
            TorAuthentication::HashedPassword(ref password) if password == "secret"
        ));
    }

    #[tokio::test]
    async fn test_hashed_password() -> Result<(), Box<dyn std::error::Error>> {
        let (mut tor, mut server) = create_session_mock().await?;
        server.send("250-PROTOCOLINFO 1").await?;
        server.send("250-AUTH METHODS=HASHEDPASSWORD").await?;
        server.send("250 OK").await?;
        server.send("250 OK").await?;
        tor.authenticate(&TorAuthentication::HashedPassword("s3cr\"t".into()))
            .await?;
        server.next().await;
        assert_eq!(
            Some("AUTHENTICATE \"s3cr\\\"t\"".to_string()),
            server.next().await.transpose()?
        );
        assert_eq!(SessionState::Authenticated, tor.state());
        Ok(())
    }

    #[tokio::test]
    async fn test_method_not_offered() -> Result<(), Box<dyn std::error::Error>> {
        let (mut tor, mut server) = create_session_mock().await?;
        server.send("250-PROTOCOLINFO 1").await?;
        server.send("250-AUTH METHODS=HASHEDPASSWORD").await?;
        server.send("250 OK").await?;
        let result = tor.authenticate(&TorAuthentication::Auto).await;
        assert!(matches!(result, Err(TorError::AuthenticationError(_))));

        let (mut tor, mut server) = create_session_mock().await?;
        server.send("250-PROTOCOLINFO 1").await?;
        server.send("250-AUTH METHODS=NULL").await?;
        server.send("250 OK").await?;
        let result = tor
            .authenticate(&TorAuthentication::HashedPassword("pw".into()))
            .await;
        assert!(matches!(result, Err(TorError::AuthenticationError(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_safe_cookie() -> Result<(), Box<dyn std::error::Error>> {
        let cookie = [7u8; 32];
        let server_nonce = [9u8; 32];
        let (mut tor, server) = create_session_mock().await?;

        let server_task = tokio::spawn(async move {
            let mut server = server;
            server.next().await;
            server.send("250-PROTOCOLINFO 1").await.unwrap();
            server
                .send("250-AUTH METHODS=COOKIE,SAFECOOKIE")
                .await
                .unwrap();
            server.send("250 OK").await.unwrap();

            let challenge = server.next().await.unwrap().unwrap();
            let client_nonce = hex::decode(
                challenge
                    .strip_prefix("AUTHCHALLENGE SAFECOOKIE ")
                    .unwrap(),
            )
            .unwrap();
            let message = [&cookie[..], &client_nonce, &server_nonce].concat();
            let server_hash = hmac_hex(
                b"Tor safe cookie authentication server-to-controller hash",
                &message,
            );
            server
                .send(
                    format!(
                        "250 AUTHCHALLENGE SERVERHASH={} SERVERNONCE={}",
                        server_hash.to_uppercase(),
                        hex::encode_upper(server_nonce)
                    )
                    .as_str(),
                )
                .await
                .unwrap();

            let authenticate = server.next().await.unwrap().unwrap();
            let expected = hmac_hex(
                b"Tor safe cookie authentication controller-to-server hash",
                &message,
            );
            assert_eq!(format!("AUTHENTICATE {}", expected), authenticate);
            server.send("250 OK").await.unwrap();
        });

        tor.authenticate(&TorAuthentication::SafeCookie(Some(cookie.to_vec())))
            .await?;
        server_task.await?;
        assert_eq!(SessionState::Authenticated, tor.state());
        Ok(())
    }

    #[tokio::test]
    async fn test_safe_cookie_bad_server_hash() -> Result<(), Box<dyn std::error::Error>> {
        let (mut tor, mut server) = create_session_mock().await?;
        server.send("250-PROTOCOLINFO 1").await?;
        server.send("250-AUTH METHODS=SAFECOOKIE").await?;
        server.send("250 OK").await?;
        server
            .send("250 AUTHCHALLENGE SERVERHASH=00 SERVERNONCE=00")
            .await?;
        let result = tor
            .authenticate(&TorAuthentication::SafeCookie(Some(vec![1u8; 32])))
            .await;
        assert!(matches!(result, Err(TorError::AuthenticationError(_))));
        assert_eq!(SessionState::Closed, tor.state());
        Ok(())
    }
}
