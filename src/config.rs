//! Tunables and the small persisted record (`sync/config.json`).

use crate::error::{Result, SyncError};
use crate::sync::identity::Role;
use crate::sync::model::SyncStats;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

// ── tunables ──

/// Connection lifecycle timings. All values are milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionConfig {
    pub connect_timeout_ms: u64,
    pub signaling_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub max_reconnect_attempts: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 30_000,
            signaling_timeout_ms: 10_000,
            heartbeat_interval_ms: 5_000,
            heartbeat_timeout_ms: 15_000,
            reconnect_base_delay_ms: 1_000,
            reconnect_max_delay_ms: 30_000,
            max_reconnect_attempts: 5,
        }
    }
}

impl SessionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn signaling_timeout(&self) -> Duration {
        Duration::from_millis(self.signaling_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Delay before reconnect attempt `attempt` (1-based): `base * 2^attempt`, capped.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.min(32);
        let ms = self.reconnect_base_delay_ms.saturating_mul(factor);
        Duration::from_millis(ms.min(self.reconnect_max_delay_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncConfig {
    pub session: SessionConfig,
    /// upper bound on history entries per snapshot
    pub max_history_items: u32,
    /// only history newer than this many days; `None` means all of it
    pub history_window_days: Option<u32>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            max_history_items: 5_000,
            history_window_days: None,
        }
    }
}

// ── persisted record ──

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PersistedConfig {
    pub shared_secret: Option<String>,
    pub role: Option<Role>,
    pub last_sync_time: Option<i64>,
    pub stats: SyncStats,
}

pub trait ConfigStore: Send + Sync {
    fn load(&self) -> Result<PersistedConfig>;
    fn save(&self, config: &PersistedConfig) -> Result<()>;
}

/// JSON file under `<app_data>/sync/config.json`. The secret is wrapped with
/// DPAPI on Windows before it touches disk.
pub struct FileConfigStore {
    path: PathBuf,
}

impl FileConfigStore {
    pub fn new(app_data: &Path) -> Self {
        Self {
            path: app_data.join("sync").join("config.json"),
        }
    }

    /// `<platform data dir>/bushido`, when the platform has one.
    pub fn default_location() -> Option<Self> {
        dirs::data_dir().map(|d| Self::new(&d.join("bushido")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigStore for FileConfigStore {
    fn load(&self) -> Result<PersistedConfig> {
        if !self.path.exists() {
            return Ok(PersistedConfig::default());
        }
        let raw = fs::read_to_string(&self.path).map_err(|e| SyncError::Config(format!("read: {}", e)))?;
        let mut config: PersistedConfig =
            serde_json::from_str(&raw).map_err(|e| SyncError::Config(format!("parse: {}", e)))?;
        if let Some(wrapped) = config.shared_secret.take() {
            config.shared_secret = Some(unwrap_secret(&wrapped)?);
        }
        Ok(config)
    }

    fn save(&self, config: &PersistedConfig) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).map_err(|e| SyncError::Config(format!("mkdir: {}", e)))?;
        }
        let mut on_disk = config.clone();
        if let Some(secret) = &config.shared_secret {
            on_disk.shared_secret = Some(wrap_secret(secret)?);
        }
        let json = serde_json::to_vec_pretty(&on_disk).map_err(|e| SyncError::Config(format!("serialize: {}", e)))?;

        // tmp + rename so a crash mid-write never leaves a torn file
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, &json).map_err(|e| SyncError::Config(format!("write: {}", e)))?;
        fs::rename(&tmp, &self.path).map_err(|e| SyncError::Config(format!("rename: {}", e)))?;
        Ok(())
    }
}

/// Keeps the record in memory; used by tests and embedders without a data dir.
#[derive(Default)]
pub struct MemoryConfigStore {
    inner: Mutex<PersistedConfig>,
    saves: Mutex<u64>,
}

impl MemoryConfigStore {
    pub fn new(config: PersistedConfig) -> Self {
        Self {
            inner: Mutex::new(config),
            saves: Mutex::new(0),
        }
    }

    pub fn snapshot(&self) -> PersistedConfig {
        self.inner.lock().clone()
    }

    pub fn save_count(&self) -> u64 {
        *self.saves.lock()
    }
}

impl ConfigStore for MemoryConfigStore {
    fn load(&self) -> Result<PersistedConfig> {
        Ok(self.inner.lock().clone())
    }

    fn save(&self, config: &PersistedConfig) -> Result<()> {
        *self.inner.lock() = config.clone();
        *self.saves.lock() += 1;
        Ok(())
    }
}

// ── secret at rest ──

fn wrap_secret(secret: &str) -> Result<String> {
    let sealed = dpapi_protect(secret.as_bytes())?;
    Ok(BASE64.encode(sealed))
}

fn unwrap_secret(wrapped: &str) -> Result<String> {
    let sealed = BASE64
        .decode(wrapped)
        .map_err(|e| SyncError::Config(format!("secret encoding: {}", e)))?;
    let plain = dpapi_unprotect(&sealed)?;
    String::from_utf8(plain).map_err(|_| SyncError::Config("secret is not utf-8".into()))
}

#[cfg(windows)]
mod dpapi {
    use windows_sys::Win32::Security::Cryptography::{CryptProtectData, CryptUnprotectData, CRYPT_INTEGER_BLOB};

    extern "system" {
        fn LocalFree(hmem: *mut u8) -> *mut u8;
    }

    fn blob(bytes: &[u8]) -> CRYPT_INTEGER_BLOB {
        CRYPT_INTEGER_BLOB {
            cbData: bytes.len() as u32,
            pbData: bytes.as_ptr() as *mut u8,
        }
    }

    fn empty() -> CRYPT_INTEGER_BLOB {
        CRYPT_INTEGER_BLOB {
            cbData: 0,
            pbData: std::ptr::null_mut(),
        }
    }

    // copies the LocalAlloc'd output and frees it
    unsafe fn take(output: CRYPT_INTEGER_BLOB) -> Vec<u8> {
        let bytes = std::slice::from_raw_parts(output.pbData, output.cbData as usize).to_vec();
        LocalFree(output.pbData);
        bytes
    }

    pub fn protect(plaintext: &[u8]) -> Result<Vec<u8>, String> {
        let input = blob(plaintext);
        let mut output = empty();
        let ok = unsafe {
            CryptProtectData(
                &input,
                std::ptr::null(),
                std::ptr::null(),
                std::ptr::null(),
                std::ptr::null(),
                0,
                &mut output,
            )
        };
        if ok == 0 {
            return Err("CryptProtectData failed".into());
        }
        Ok(unsafe { take(output) })
    }

    pub fn unprotect(sealed: &[u8]) -> Result<Vec<u8>, String> {
        let input = blob(sealed);
        let mut output = empty();
        let ok = unsafe {
            CryptUnprotectData(
                &input,
                std::ptr::null_mut(),
                std::ptr::null(),
                std::ptr::null(),
                std::ptr::null(),
                0,
                &mut output,
            )
        };
        if ok == 0 {
            return Err("CryptUnprotectData failed".into());
        }
        Ok(unsafe { take(output) })
    }
}

#[cfg(windows)]
fn dpapi_protect(plaintext: &[u8]) -> Result<Vec<u8>> {
    dpapi::protect(plaintext).map_err(SyncError::Config)
}

#[cfg(windows)]
fn dpapi_unprotect(sealed: &[u8]) -> Result<Vec<u8>> {
    dpapi::unprotect(sealed).map_err(SyncError::Config)
}

// no os keystore elsewhere; base64 only keeps the file shape identical
#[cfg(not(windows))]
fn dpapi_protect(plaintext: &[u8]) -> Result<Vec<u8>> {
    Ok(plaintext.to_vec())
}

#[cfg(not(windows))]
fn dpapi_unprotect(sealed: &[u8]) -> Result<Vec<u8>> {
    Ok(sealed.to_vec())
}
