//! Per-instance sync token persisted next to the server root
//!
//! The token lives in its own file rather than in the plugin configuration,
//! so wiping or regenerating configs does not change the instance identity.

use log::info;
use rand::RngCore;
use shared::PLACEHOLDER_TOKEN;
use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

pub const TOKEN_FILENAME: &str = "report_sync_token.dat";

/// Token byte length before hex encoding (32 bytes = 64 hex chars)
const TOKEN_BYTES: usize = 32;

/// Opaque secret identifying one instance
#[derive(Clone, PartialEq, Eq)]
pub struct SyncToken(String);

impl SyncToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn generate() -> Self {
        let mut bytes = [0u8; TOKEN_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// False for blank tokens and the shipped placeholder
    pub fn is_usable(&self) -> bool {
        let token = self.0.trim();
        !token.is_empty() && token != PLACEHOLDER_TOKEN
    }
}

// Never print the secret itself
impl fmt::Debug for SyncToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SyncToken({} chars)", self.0.len())
    }
}

/// Reads the token file in `dir`, creating it when missing or blank
pub fn load_or_create(dir: &Path) -> io::Result<SyncToken> {
    let path = dir.join(TOKEN_FILENAME);

    if path.exists() {
        let contents = fs::read_to_string(&path)?;
        let token = contents.trim();
        if !token.is_empty() {
            return Ok(SyncToken::new(token));
        }
    }

    let token = SyncToken::generate();
    fs::write(&path, token.as_str())?;
    info!("Generated new instance token at {}", path.display());
    Ok(token)
}
