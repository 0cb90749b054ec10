use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::AuthError;

pub const TOKEN_KEY_BYTES: usize = 32;
const NONCE_BYTES: usize = 12;
const TOKEN_FILE_VERSION: u8 = 1;

/// Refresh tokens keyed by account identity.
pub trait TokenStore: Send + Sync {
    fn refresh_token(&self, account: &str) -> Result<Option<String>, AuthError>;

    fn set_refresh_token(&self, account: &str, token: &str) -> Result<(), AuthError>;
}

#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    tokens: Mutex<HashMap<String, String>>,
}

impl TokenStore for MemoryTokenStore {
    fn refresh_token(&self, account: &str) -> Result<Option<String>, AuthError> {
        let tokens = self.tokens.lock().map_err(|_| AuthError::Poisoned)?;
        Ok(tokens.get(account).cloned())
    }

    fn set_refresh_token(&self, account: &str, token: &str) -> Result<(), AuthError> {
        let mut tokens = self.tokens.lock().map_err(|_| AuthError::Poisoned)?;
        tokens.insert(account.to_string(), token.to_string());
        Ok(())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TokenFile {
    version: u8,
    accounts: BTreeMap<String, TokenEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "lowercase")]
enum TokenEntry {
    Plain { refresh_token: String },
    Sealed { nonce_hex: String, ciphertext_hex: String },
}

/// Refresh tokens in a JSON file next to the config, sealed with
/// AES-256-GCM when a key is supplied.
pub struct EncryptedFileTokenStore {
    path: PathBuf,
    key: Option<[u8; TOKEN_KEY_BYTES]>,
    lock: Mutex<()>,
}

impl EncryptedFileTokenStore {
    pub fn new(path: impl Into<PathBuf>, key: Option<[u8; TOKEN_KEY_BYTES]>) -> Self {
        Self {
            path: path.into(),
            key,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<TokenFile, AuthError> {
        if !self.path.exists() {
            return Ok(TokenFile {
                version: TOKEN_FILE_VERSION,
                accounts: BTreeMap::new(),
            });
        }
        let raw = std::fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    fn save(&self, file: &TokenFile) -> Result<(), AuthError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_string_pretty(file)?;
        std::fs::write(&self.path, raw)?;
        Ok(())
    }
}

impl TokenStore for EncryptedFileTokenStore {
    fn refresh_token(&self, account: &str) -> Result<Option<String>, AuthError> {
        let _guard = self.lock.lock().map_err(|_| AuthError::Poisoned)?;
        let file = self.load()?;

        match file.accounts.get(account) {
            None => Ok(None),
            Some(TokenEntry::Plain { refresh_token }) => Ok(Some(refresh_token.clone())),
            Some(TokenEntry::Sealed {
                nonce_hex,
                ciphertext_hex,
            }) => {
                let key = self.key.as_ref().ok_or_else(|| {
                    AuthError::Crypto(format!(
                        "token for {account} is encrypted but no key is configured"
                    ))
                })?;
                open_token(nonce_hex, ciphertext_hex, key).map(Some)
            }
        }
    }

    fn set_refresh_token(&self, account: &str, token: &str) -> Result<(), AuthError> {
        let _guard = self.lock.lock().map_err(|_| AuthError::Poisoned)?;
        let mut file = self.load()?;

        let entry = match self.key.as_ref() {
            Some(key) => seal_token(token, key)?,
            None => {
                warn!(
                    "storing refresh token for {account} unencrypted in {}",
                    self.path.display()
                );
                TokenEntry::Plain {
                    refresh_token: token.to_string(),
                }
            }
        };

        file.version = TOKEN_FILE_VERSION;
        file.accounts.insert(account.to_string(), entry);
        self.save(&file)
    }
}

fn seal_token(token: &str, key: &[u8; TOKEN_KEY_BYTES]) -> Result<TokenEntry, AuthError> {
    let mut in_out = token.as_bytes().to_vec();
    let key = LessSafeKey::new(
        UnboundKey::new(&AES_256_GCM, key)
            .map_err(|_| AuthError::Crypto("construct AES-256-GCM key".to_string()))?,
    );

    let mut nonce_bytes = [0u8; NONCE_BYTES];
    SystemRandom::new()
        .fill(&mut nonce_bytes)
        .map_err(|_| AuthError::Crypto("generate random nonce".to_string()))?;

    key.seal_in_place_append_tag(
        Nonce::assume_unique_for_key(nonce_bytes),
        Aad::empty(),
        &mut in_out,
    )
    .map_err(|_| AuthError::Crypto("encrypt refresh token".to_string()))?;

    Ok(TokenEntry::Sealed {
        nonce_hex: hex_encode(&nonce_bytes),
        ciphertext_hex: hex_encode(&in_out),
    })
}

fn open_token(
    nonce_hex: &str,
    ciphertext_hex: &str,
    key: &[u8; TOKEN_KEY_BYTES],
) -> Result<String, AuthError> {
    let nonce_bytes: [u8; NONCE_BYTES] = hex_decode(nonce_hex)?
        .try_into()
        .map_err(|_| AuthError::Crypto("invalid nonce length".to_string()))?;
    let mut ciphertext = hex_decode(ciphertext_hex)?;

    let key = LessSafeKey::new(
        UnboundKey::new(&AES_256_GCM, key)
            .map_err(|_| AuthError::Crypto("construct AES-256-GCM key".to_string()))?,
    );
    let plaintext = key
        .open_in_place(
            Nonce::assume_unique_for_key(nonce_bytes),
            Aad::empty(),
            &mut ciphertext,
        )
        .map_err(|_| AuthError::Crypto("decrypt refresh token (wrong key?)".to_string()))?;

    String::from_utf8(plaintext.to_vec())
        .map_err(|_| AuthError::Crypto("decrypted token is not UTF-8".to_string()))
}

/// Parses a 64 hex character AES-256 key.
pub fn parse_key_hex(raw: &str) -> Result<[u8; TOKEN_KEY_BYTES], AuthError> {
    hex_decode(raw)?
        .try_into()
        .map_err(|_| AuthError::Crypto("token key must be 32 bytes (64 hex characters)".to_string()))
}

fn hex_encode(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(HEX[(byte >> 4) as usize] as char);
        out.push(HEX[(byte & 0x0f) as usize] as char);
    }
    out
}

fn hex_decode(raw: &str) -> Result<Vec<u8>, AuthError> {
    let bytes = raw.trim().as_bytes();
    if bytes.len() % 2 != 0 {
        return Err(AuthError::Crypto("hex string length must be even".to_string()));
    }

    bytes
        .chunks(2)
        .map(|pair| match (hex_nibble(pair[0]), hex_nibble(pair[1])) {
            (Some(hi), Some(lo)) => Ok((hi << 4) | lo),
            _ => Err(AuthError::Crypto("invalid hex digit".to_string())),
        })
        .collect()
}

fn hex_nibble(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}
