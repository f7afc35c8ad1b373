//! Formatting of `ADD_ONION` / `DEL_ONION` commands and parsing of their replies.
//!
//! Reply fields are located with a small tokenizer rather than by splitting: a field is the
//! first case-sensitive occurrence of its marker (e.g. `ServiceID=`) that is not glued to a
//! preceding word, and its value runs to the next terminator. Anything missing is reported as
//! a [`TorError::ParseError`].

use crate::{
    control_connection::ControlResponse,
    error::TorError,
    key::{KeyType, OnionKey, ServiceId},
};
use std::str::FromStr;
use zeroize::Zeroizing;

const SERVICE_ID_FIELD: &str = "ServiceID=";
const PRIVATE_KEY_FIELD: &str = "PrivateKey=";

/// How the onion service key should be obtained
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KeyRequest {
    /// Let Tor generate a key of the best available type (`NEW:BEST`)
    Best,
    Ed25519V3,
    Rsa1024,
    /// Reuse an existing key
    PrivateKey(OnionKey),
}

impl KeyRequest {
    pub fn is_new(&self) -> bool {
        !matches!(self, KeyRequest::PrivateKey(_))
    }

    fn key_spec(&self) -> Zeroizing<String> {
        match self {
            KeyRequest::Best => Zeroizing::new("NEW:BEST".to_string()),
            KeyRequest::Ed25519V3 => Zeroizing::new(format!("NEW:{}", KeyType::Ed25519V3)),
            KeyRequest::Rsa1024 => Zeroizing::new(format!("NEW:{}", KeyType::Rsa1024)),
            KeyRequest::PrivateKey(key) => key.to_key_spec(),
        }
    }
}

/// A registered onion service, as reported by `ADD_ONION`
#[derive(Clone, Debug)]
pub struct OnionInfo {
    service_id: ServiceId,
    private_key: Option<OnionKey>,
    response: ControlResponse,
}

impl OnionInfo {
    pub fn service_id(&self) -> &ServiceId {
        &self.service_id
    }

    /// The key Tor generated for this service. `None` when an existing key was supplied.
    pub fn private_key(&self) -> Option<&OnionKey> {
        self.private_key.as_ref()
    }

    pub fn key_type(&self) -> Option<KeyType> {
        self.private_key.as_ref().map(OnionKey::key_type)
    }

    pub fn key_material(&self) -> Option<&str> {
        self.private_key.as_ref().map(OnionKey::material)
    }

    /// The raw reply this was parsed from
    pub fn response(&self) -> &ControlResponse {
        &self.response
    }
}

/// `ADD_ONION <keyspec>[ Flags=Detach] Port=<virt_port>,<target>`
pub fn build_add_onion(
    virt_port: u16,
    target: &str,
    key_request: &KeyRequest,
    detach: bool,
) -> Zeroizing<String> {
    let flags = if detach { " Flags=Detach" } else { "" };
    Zeroizing::new(format!(
        "ADD_ONION {}{} Port={},{}",
        key_request.key_spec().as_str(),
        flags,
        virt_port,
        target
    ))
}

/// `DEL_ONION <service_id>`
pub fn build_delete_onion(service_id: &ServiceId) -> String {
    format!("DEL_ONION {}", service_id)
}

pub fn parse_add_onion_reply(
    response: ControlResponse,
    requested_new_key: bool,
) -> Result<OnionInfo, TorError> {
    if !response.is_success() {
        return Err(TorError::protocol_error(&format!(
            "Expected status code 250, got {}",
            response.status_code()
        )));
    }

    let service_id = service_id_field(response.reply())
        .ok_or_else(|| TorError::parse_error("ADD_ONION reply has no ServiceID field"))?;
    let service_id = ServiceId::new(service_id)?;

    let private_key = if requested_new_key {
        let rest = field_value(response.reply(), PRIVATE_KEY_FIELD)
            .ok_or_else(|| TorError::parse_error("ADD_ONION reply has no PrivateKey field"))?;
        let line = take_token(rest, &['\r', '\n']);
        let (key_type, material) = line
            .split_once(':')
            .ok_or_else(|| TorError::parse_error("PrivateKey field has no key type"))?;
        let key_type = KeyType::from_str(key_type).map_err(|_| {
            TorError::parse_error(&format!("Unknown key type '{}' in reply", key_type))
        })?;
        if material.is_empty() {
            return Err(TorError::parse_error("PrivateKey field has no key material"));
        }
        Some(OnionKey::new(key_type, material))
    } else {
        None
    };

    Ok(OnionInfo {
        service_id,
        private_key,
        response,
    })
}

/// The service Tor registered, if a successful reply names one. Lets a caller clean up a
/// service whose reply was otherwise unusable.
pub fn registered_service_id(response: &ControlResponse) -> Option<ServiceId> {
    if !response.is_success() {
        return None;
    }
    service_id_field(response.reply()).and_then(|service_id| ServiceId::new(service_id).ok())
}

fn service_id_field(body: &str) -> Option<&str> {
    field_value(body, SERVICE_ID_FIELD).map(|rest| take_token(rest, &[' ', '\r', '\n']))
}

// Everything after the first occurrence of `marker` that starts a field. A marker glued to the
// end of a longer name (`XServiceID=`, `_ServiceID=`, `Old-ServiceID=`) is some other field.
fn field_value<'a>(body: &'a str, marker: &str) -> Option<&'a str> {
    body.match_indices(marker)
        .find(|(index, _)| {
            body[..*index]
                .chars()
                .next_back()
                .map_or(true, |c| !(c.is_ascii_alphanumeric() || c == '_' || c == '-'))
        })
        .map(|(index, _)| &body[index + marker.len()..])
}

fn take_token<'a>(rest: &'a str, terminators: &[char]) -> &'a str {
    match rest.find(terminators) {
        Some(end) => &rest[..end],
        None => rest,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(body: &str) -> ControlResponse {
        ControlResponse::new(250, body)
    }

    #[test]
    fn test_build_add_onion_new_key() {
        for (port, target) in [(80, "127.0.0.1:8080"), (6667, "localhost:1234"), (1, "[::1]:9")] {
            let command = build_add_onion(port, target, &KeyRequest::Best, false);
            assert!(command.contains("NEW:BEST"));
            assert!(command.contains(&format!("Port={},{}", port, target)));
        }
        assert_eq!(
            "ADD_ONION NEW:BEST Port=80,127.0.0.1:8080",
            build_add_onion(80, "127.0.0.1:8080", &KeyRequest::Best, false).as_str()
        );
        assert_eq!(
            "ADD_ONION NEW:ED25519-V3 Flags=Detach Port=80,127.0.0.1:8080",
            build_add_onion(80, "127.0.0.1:8080", &KeyRequest::Ed25519V3, true).as_str()
        );
    }

    #[test]
    fn test_build_add_onion_existing_key() {
        let key = OnionKey::new(KeyType::Ed25519V3, "c2VjcmV0");
        let command = build_add_onion(443, "127.0.0.1:8443", &KeyRequest::PrivateKey(key), false);
        assert_eq!(
            "ADD_ONION ED25519-V3:c2VjcmV0 Port=443,127.0.0.1:8443",
            command.as_str()
        );
    }

    #[test]
    fn test_build_delete_onion() -> Result<(), TorError> {
        assert_eq!(
            "DEL_ONION exampleid",
            build_delete_onion(&ServiceId::new("exampleid")?)
        );
        Ok(())
    }

    #[test]
    fn test_parse_new_key_reply() -> Result<(), TorError> {
        let info = parse_add_onion_reply(
            reply("ServiceID=abc123 ...PrivateKey=ED25519-V3:base64stuff\n"),
            true,
        )?;
        assert_eq!("abc123", info.service_id().as_str());
        assert_eq!(Some(KeyType::Ed25519V3), info.key_type());
        assert_eq!(Some("base64stuff"), info.key_material());

        let info = parse_add_onion_reply(
            reply("ServiceID=647qjf6w3evdbdpy7oidf5vda6rsjzsl5a6ofsaou2v77hj7dmn2spqd\nPrivateKey=RSA1024:MIICXAIBAAKBgQC\n"),
            true,
        )?;
        assert_eq!(
            "647qjf6w3evdbdpy7oidf5vda6rsjzsl5a6ofsaou2v77hj7dmn2spqd",
            info.service_id().as_str()
        );
        assert_eq!(Some(KeyType::Rsa1024), info.key_type());
        assert_eq!(Some("MIICXAIBAAKBgQC"), info.key_material());
        Ok(())
    }

    #[test]
    fn test_parse_existing_key_reply() -> Result<(), TorError> {
        let info = parse_add_onion_reply(reply("ServiceID=foobar\n"), false)?;
        assert_eq!("foobar", info.service_id().as_str());
        assert_eq!(None, info.private_key());
        Ok(())
    }

    #[test]
    fn test_parse_missing_fields() {
        for body in ["", "OK", "PrivateKey=ED25519-V3:abc\n", "ServiceID=\n", "ServiceID= x"] {
            assert!(
                matches!(
                    parse_add_onion_reply(reply(body), false),
                    Err(TorError::ParseError(_))
                ),
                "{:?}",
                body
            );
        }

        for body in [
            "ServiceID=abc\n",
            "ServiceID=abc\nPrivateKey=ED25519-V3\n",
            "ServiceID=abc\nPrivateKey=ED25519-V3:\n",
            "ServiceID=abc\nPrivateKey=X448:abc\n",
        ] {
            assert!(
                matches!(
                    parse_add_onion_reply(reply(body), true),
                    Err(TorError::ParseError(_))
                ),
                "{:?}",
                body
            );
        }
    }

    #[test]
    fn test_parse_marker_is_anchored_and_first_wins() -> Result<(), TorError> {
        let info = parse_add_onion_reply(
            reply("XServiceID=wrong\nServiceID=first\nServiceID=second\n"),
            false,
        )?;
        assert_eq!("first", info.service_id().as_str());

        assert!(matches!(
            parse_add_onion_reply(reply("serviceid=lower\n"), false),
            Err(TorError::ParseError(_))
        ));

        for body in ["_ServiceID=wrong\n", "-ServiceID=wrong\n", "Old-ServiceID=wrong\n"] {
            assert!(
                matches!(
                    parse_add_onion_reply(reply(body), false),
                    Err(TorError::ParseError(_))
                ),
                "{:?}",
                body
            );
        }
        let info = parse_add_onion_reply(
            reply("Old_ServiceID=wrong ServiceID=right\n_PrivateKey=RSA1024:wrong\nPrivateKey=ED25519-V3:right\n"),
            true,
        )?;
        assert_eq!("right", info.service_id().as_str());
        assert_eq!(Some("right"), info.key_material());
        Ok(())
    }

    #[test]
    fn test_registered_service_id() {
        assert_eq!(
            Some("abc".to_string()),
            registered_service_id(&reply("ServiceID=abc\nPrivateKey=X448:abc\n"))
                .map(|service_id| service_id.as_str().to_string())
        );
        assert_eq!(None, registered_service_id(&reply("OK")));
        assert_eq!(
            None,
            registered_service_id(&ControlResponse::new(512, "ServiceID=abc"))
        );
    }

    #[test]
    fn test_parse_rejects_error_status() {
        let response = ControlResponse::new(512, "Bad arguments to ADD_ONION");
        assert!(matches!(
            parse_add_onion_reply(response, true),
            Err(TorError::ProtocolError(_))
        ));
    }
}
