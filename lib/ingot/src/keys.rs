use crate::crypto;
use std::fmt;
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

const KEY_FILE_MODE: u32 = 0o600;

#[derive(Debug)]
pub enum KeyError {
    Io(io::Error),
    /// The key file exists but does not contain a base64 encoded 32-byte scalar.
    Malformed,
}

impl fmt::Display for KeyError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            KeyError::Io(err) => write!(f, "binding key file error: {}", err),
            KeyError::Malformed => write!(f, "binding key file is malformed"),
        }
    }
}

impl std::error::Error for KeyError {}

impl From<io::Error> for KeyError {
    #[inline]
    fn from(err: io::Error) -> Self {
        KeyError::Io(err)
    }
}

/// The host's static X25519 key. The secondary is bound to the public half;
/// both sides salt their session key derivation with it.
pub struct BindingKey {
    secret: [u8; crypto::SCALAR_SIZE],
}

impl BindingKey {
    /// Generates a fresh binding key.
    #[inline]
    pub fn generate() -> BindingKey {
        let (secret, _) = crypto::x25519_keypair();
        BindingKey { secret }
    }

    #[inline]
    pub fn from_secret(secret: [u8; crypto::SCALAR_SIZE]) -> BindingKey {
        BindingKey { secret }
    }

    #[inline]
    pub fn secret(&self) -> &[u8; crypto::SCALAR_SIZE] {
        &self.secret
    }

    #[inline]
    pub fn public(&self) -> [u8; crypto::POINT_SIZE] {
        crypto::x25519_public(&self.secret)
    }

    /// Short identifier of the public half, exchanged during the handshake.
    #[inline]
    pub fn id(&self) -> [u8; 8] {
        crypto::key_id(&self.public())
    }

    /// Reads the key from a base64 encoded file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<BindingKey, KeyError> {
        let text = fs::read_to_string(path)?;
        let raw = base64::decode(text.trim()).map_err(|_| KeyError::Malformed)?;

        if raw.len() != crypto::SCALAR_SIZE {
            return Err(KeyError::Malformed);
        }

        let mut secret = [0u8; crypto::SCALAR_SIZE];
        secret.copy_from_slice(&raw);
        Ok(BindingKey { secret })
    }

    /// Writes the key as base64 with owner-only permissions.
    pub fn store<P: AsRef<Path>>(&self, path: P) -> Result<(), KeyError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, base64::encode(&self.secret))?;
        fs::set_permissions(path, fs::Permissions::from_mode(KEY_FILE_MODE))?;
        Ok(())
    }
}
