use crate::error::TorError;
use base32::{self, Alphabet};
use base64::Engine;
use ed25519_dalek::{hazmat::ExpandedSecretKey, VerifyingKey};
use sha3::{Digest, Sha3_256};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use strum::{Display, EnumString};
use tokio::io::AsyncWriteExt;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Onion service key algorithms, named the way the control protocol names them
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, EnumString)]
pub enum KeyType {
    #[strum(serialize = "ED25519-V3")]
    Ed25519V3,
    #[strum(serialize = "RSA1024")]
    Rsa1024,
}

/// Base64 key blob as exchanged with Tor. Wiped on drop, never printed.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial(String);

impl KeyMaterial {
    pub fn new<S: Into<String>>(material: S) -> Self {
        Self(material.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str("KeyMaterial(<redacted>)")
    }
}

/// The identity of an onion service: its address without the `.onion` suffix
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ServiceId(String);

impl ServiceId {
    pub fn new(id: &str) -> Result<Self, TorError> {
        if id.is_empty() || id.chars().any(char::is_whitespace) {
            return Err(TorError::parse_error(&format!(
                "Invalid service ID '{}'",
                id
            )));
        }
        Ok(Self(id.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn onion_hostname(&self) -> String {
        format!("{}.onion", self.0)
    }
}

impl std::fmt::Display for ServiceId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A private key for an onion service, in the `<keyType>:<keyMaterial>` form Tor uses
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OnionKey {
    key_type: KeyType,
    material: KeyMaterial,
}

impl OnionKey {
    pub fn new(key_type: KeyType, material: &str) -> Self {
        Self {
            key_type,
            material: KeyMaterial::new(material),
        }
    }

    pub fn key_type(&self) -> KeyType {
        self.key_type
    }

    pub fn material(&self) -> &str {
        self.material.as_str()
    }

    /// `<keyType>:<keyMaterial>`, as used in both ADD_ONION and the key file
    pub fn to_key_spec(&self) -> Zeroizing<String> {
        Zeroizing::new(format!("{}:{}", self.key_type, self.material.as_str()))
    }

    /// The service ID this key will be published under. Only ED25519-V3 keys can be derived
    /// locally; RSA1024 yields `None`.
    pub fn service_id(&self) -> Result<Option<ServiceId>, TorError> {
        match self.key_type {
            KeyType::Ed25519V3 => {
                let verifying_key = ed25519_verifying_key(self.material.as_str())?;
                Ok(Some(ServiceId(tor_service_id(&verifying_key))))
            }
            KeyType::Rsa1024 => Ok(None),
        }
    }
}

impl FromStr for OnionKey {
    type Err = TorError;

    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let spec = spec.trim();
        let (key_type, material) = spec
            .split_once(':')
            .ok_or_else(|| TorError::parse_error("Key is missing the ':' separator"))?;
        let key_type = KeyType::from_str(key_type).map_err(|_| {
            TorError::parse_error(&format!("Unknown key type '{}'", key_type))
        })?;
        if material.is_empty() {
            return Err(TorError::parse_error("Key material is empty"));
        }
        Ok(Self::new(key_type, material))
    }
}

fn ed25519_verifying_key(blob: &str) -> Result<VerifyingKey, TorError> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(blob)
        .map(Zeroizing::new)
        .map_err(|error| {
            TorError::parse_error(&format!("Error decoding ED25519-V3 key blob: {}", error))
        })?;
    let bytes: &[u8; 64] = bytes.as_slice().try_into().map_err(|_| {
        TorError::parse_error(&format!(
            "Expected a 64-byte ED25519-V3 key blob, got {} bytes",
            bytes.len()
        ))
    })?;
    let expanded_secret_key = ExpandedSecretKey::from_bytes(bytes);
    Ok(VerifyingKey::from(&expanded_secret_key))
}

fn tor_service_id(verifying_key: &VerifyingKey) -> String {
    let version = &[3u8];
    let verifying_key_bytes = verifying_key.as_bytes().to_vec();
    let mut checksum_bytes = ".onion checksum".as_bytes().to_vec();
    checksum_bytes.extend_from_slice(&verifying_key_bytes);
    checksum_bytes.extend_from_slice(version);
    let mut hasher = Sha3_256::new();
    hasher.update(&checksum_bytes);
    let checksum: Vec<u8> = hasher.finalize()[..2].to_vec();
    let mut onion_bytes = verifying_key_bytes;
    onion_bytes.extend_from_slice(&checksum);
    onion_bytes.extend_from_slice(version);
    base32::encode(Alphabet::RFC4648 { padding: false }, &onion_bytes).to_lowercase()
}

/// Read a persisted key. A missing file is `Ok(None)`; any other failure, including a
/// malformed line, is a `PersistenceError`.
pub async fn read_key_file(path: &Path) -> Result<Option<OnionKey>, TorError> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(contents) => Zeroizing::new(contents),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(error) => return Err(TorError::persistence_error(path, &error.to_string())),
    };
    match contents.parse::<OnionKey>() {
        Ok(key) => Ok(Some(key)),
        Err(error) => Err(TorError::persistence_error(path, &error.to_string())),
    }
}

/// Write `key` as a single `<keyType>:<keyMaterial>` line, replacing any previous contents.
///
/// The line goes to a sibling `.tmp` file first and is renamed over `path`, so the old key
/// survives a failed write. On unix the result is always mode 0600, even if `path` existed.
pub async fn write_key_file(path: &Path, key: &OnionKey) -> Result<(), TorError> {
    let mut temp_name = path.as_os_str().to_owned();
    temp_name.push(".tmp");
    let temp_path = PathBuf::from(temp_name);

    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut line = key.to_key_spec();
    line.push('\n');
    let result = async {
        let mut file = options.open(&temp_path).await?;
        file.write_all(line.as_bytes()).await?;
        file.sync_all().await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&temp_path, std::fs::Permissions::from_mode(0o600))
                .await?;
        }
        tokio::fs::rename(&temp_path, path).await
    }
    .await;

    result.map_err(|error| {
        let _ = std::fs::remove_file(&temp_path);
        TorError::persistence_error(path, &error.to_string())
    })
}
