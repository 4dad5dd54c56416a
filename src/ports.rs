// Injected collaborators.
//
// The controller core never talks to the outside world directly: artifact
// transport, persistence, migrations, traffic routing, identity, audit
// forwarding, crypto, time and randomness all arrive as trait objects at
// construction time. In-memory/system defaults ship alongside each trait so
// the engine is usable out of the box and fully scriptable in tests.

use async_trait::async_trait;
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use semver::Version;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;

use crate::access_control::Principal;
use crate::audit::AuditEntry;
use crate::module_metadata::{MigrationSpec, ModuleId, ScopeKey};

/// Errors surfaced by port implementations.
#[derive(Debug, Clone, Error)]
pub enum PortError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("verification failed: {0}")]
    Verification(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("io error: {0}")]
    Io(String),
}

impl PortError {
    /// Transient failures are retried with bounded backoff by callers that
    /// support it (audit forwarding).
    pub fn is_transient(&self) -> bool {
        matches!(self, PortError::Transient(_))
    }
}

// ============================================================================
// Module loader
// ============================================================================

/// A fetched module artifact. The digest is always verified against the
/// payload before the artifact is handed to the activation pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleArtifact {
    pub id: ModuleId,
    pub version: Version,
    pub bytes: Vec<u8>,
    /// Hex-encoded SHA-256 of `bytes`
    pub digest: String,
}

impl ModuleArtifact {
    pub fn new(id: impl Into<ModuleId>, version: Version, bytes: Vec<u8>) -> Self {
        let digest = hex::encode(Sha256::digest(&bytes));
        Self {
            id: id.into(),
            version,
            bytes,
            digest,
        }
    }

    pub fn verify(&self) -> Result<(), PortError> {
        let actual = hex::encode(Sha256::digest(&self.bytes));
        if actual != self.digest {
            return Err(PortError::Verification(format!(
                "artifact digest mismatch for {}@{}",
                self.id, self.version
            )));
        }
        Ok(())
    }
}

/// Fetches module artifacts. Must be deterministic and content-verified.
#[async_trait]
pub trait ModuleLoader: Send + Sync {
    async fn fetch(&self, id: &ModuleId, version: &Version) -> Result<ModuleArtifact, PortError>;
}

/// In-memory loader backed by a static artifact map.
#[derive(Default)]
pub struct StaticLoader {
    artifacts: Mutex<HashMap<(ModuleId, Version), ModuleArtifact>>,
}

impl StaticLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, artifact: ModuleArtifact) {
        self.artifacts
            .lock()
            .insert((artifact.id.clone(), artifact.version.clone()), artifact);
    }
}

#[async_trait]
impl ModuleLoader for StaticLoader {
    async fn fetch(&self, id: &ModuleId, version: &Version) -> Result<ModuleArtifact, PortError> {
        let artifact = self
            .artifacts
            .lock()
            .get(&(id.clone(), version.clone()))
            .cloned()
            .ok_or_else(|| PortError::NotFound(format!("artifact {}@{}", id, version)))?;
        artifact.verify()?;
        Ok(artifact)
    }
}

// ============================================================================
// Storage adapter
// ============================================================================

/// Persists registry entries, namespace definitions and config blobs.
/// Compare-and-swap on keys is required so concurrent writers cannot
/// clobber each other.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), PortError>;
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, PortError>;
    /// Writes `value` only if the current value equals `expected`
    /// (`None` = key absent). Returns whether the swap happened.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: Vec<u8>,
    ) -> Result<bool, PortError>;
    async fn delete(&self, key: &str) -> Result<(), PortError>;
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, PortError>;
}

/// In-memory storage adapter.
#[derive(Default)]
pub struct MemoryStorage {
    data: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.lock().is_empty()
    }
}

#[async_trait]
impl StorageAdapter for MemoryStorage {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), PortError> {
        self.data.lock().insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, PortError> {
        Ok(self.data.lock().get(key).cloned())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: Vec<u8>,
    ) -> Result<bool, PortError> {
        let mut data = self.data.lock();
        let current = data.get(key).map(|v| v.as_slice());
        if current == expected {
            data.insert(key.to_string(), value);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn delete(&self, key: &str) -> Result<(), PortError> {
        self.data.lock().remove(key);
        Ok(())
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, PortError> {
        let mut keys: Vec<String> = self
            .data
            .lock()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}

/// File-backed storage adapter: one file per slash-delimited key under a
/// root directory. Compare-and-swap is atomic within the process.
pub struct FileStorage {
    root: std::path::PathBuf,
    cas_lock: Mutex<()>,
}

impl FileStorage {
    pub fn new(root: impl Into<std::path::PathBuf>) -> Self {
        Self {
            root: root.into(),
            cas_lock: Mutex::new(()),
        }
    }

    fn path_for(&self, key: &str) -> Result<std::path::PathBuf, PortError> {
        if key.split('/').any(|segment| segment == "..") {
            return Err(PortError::Io(format!("invalid storage key '{}'", key)));
        }
        Ok(self.root.join(key))
    }

    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, PortError> {
        match std::fs::read(self.path_for(key)?) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PortError::Io(e.to_string())),
        }
    }

    fn write(&self, key: &str, value: &[u8]) -> Result<(), PortError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| PortError::Io(e.to_string()))?;
        }
        std::fs::write(path, value).map_err(|e| PortError::Io(e.to_string()))
    }
}

#[async_trait]
impl StorageAdapter for FileStorage {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), PortError> {
        self.write(key, &value)
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, PortError> {
        self.read(key)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: Vec<u8>,
    ) -> Result<bool, PortError> {
        let _guard = self.cas_lock.lock();
        let current = self.read(key)?;
        if current.as_deref() == expected {
            self.write(key, &value)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn delete(&self, key: &str) -> Result<(), PortError> {
        match std::fs::remove_file(self.path_for(key)?) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PortError::Io(e.to_string())),
        }
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, PortError> {
        let mut keys = Vec::new();
        let mut stack = vec![self.root.clone()];
        while let Some(dir) = stack.pop() {
            let entries = match std::fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(PortError::Io(e.to_string())),
            };
            for entry in entries {
                let entry = entry.map_err(|e| PortError::Io(e.to_string()))?;
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else if let Ok(relative) = path.strip_prefix(&self.root) {
                    let key = relative.to_string_lossy().replace('\\', "/");
                    if key.starts_with(prefix) {
                        keys.push(key);
                    }
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

// ============================================================================
// Migration runner
// ============================================================================

/// Applies and rolls back schema/data migrations. Migrations reaching this
/// port are additive-only; non-additive ones are rejected during validation.
#[async_trait]
pub trait MigrationRunner: Send + Sync {
    async fn apply(&self, scope: &ScopeKey, migration: &MigrationSpec) -> Result<(), PortError>;
    async fn rollback(&self, scope: &ScopeKey, migration: &MigrationSpec) -> Result<(), PortError>;
}

/// Records applied/rolled-back migrations; failures scriptable per version.
#[derive(Default)]
pub struct RecordingMigrationRunner {
    applied: Mutex<Vec<(ScopeKey, String)>>,
    rolled_back: Mutex<Vec<(ScopeKey, String)>>,
    fail_versions: Mutex<HashSet<String>>,
}

impl RecordingMigrationRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_on(&self, version: impl Into<String>) {
        self.fail_versions.lock().insert(version.into());
    }

    pub fn applied(&self) -> Vec<(ScopeKey, String)> {
        self.applied.lock().clone()
    }

    pub fn rolled_back(&self) -> Vec<(ScopeKey, String)> {
        self.rolled_back.lock().clone()
    }
}

#[async_trait]
impl MigrationRunner for RecordingMigrationRunner {
    async fn apply(&self, scope: &ScopeKey, migration: &MigrationSpec) -> Result<(), PortError> {
        if self.fail_versions.lock().contains(&migration.version) {
            return Err(PortError::Io(format!("migration {} failed", migration.version)));
        }
        self.applied.lock().push((scope.clone(), migration.version.clone()));
        Ok(())
    }

    async fn rollback(&self, scope: &ScopeKey, migration: &MigrationSpec) -> Result<(), PortError> {
        self.rolled_back
            .lock()
            .push((scope.clone(), migration.version.clone()));
        Ok(())
    }
}

// ============================================================================
// Traffic router
// ============================================================================

/// Shifts serving traffic between module versions. Weight updates are
/// atomic per `(module, tenant)`.
#[async_trait]
pub trait TrafficRouter: Send + Sync {
    async fn set_weight(
        &self,
        scope: &ScopeKey,
        version: &Version,
        percent: f64,
    ) -> Result<(), PortError>;
}

/// Records every weight change and keeps the current weight per version.
#[derive(Default)]
pub struct RecordingRouter {
    weights: Mutex<HashMap<(ScopeKey, Version), f64>>,
    history: Mutex<Vec<(ScopeKey, Version, f64)>>,
}

impl RecordingRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn weight(&self, scope: &ScopeKey, version: &Version) -> f64 {
        self.weights
            .lock()
            .get(&(scope.clone(), version.clone()))
            .copied()
            .unwrap_or(0.0)
    }

    /// All weight values ever set for one version, in order.
    pub fn trace(&self, scope: &ScopeKey, version: &Version) -> Vec<f64> {
        self.history
            .lock()
            .iter()
            .filter(|(s, v, _)| s == scope && v == version)
            .map(|(_, _, p)| *p)
            .collect()
    }
}

#[async_trait]
impl TrafficRouter for RecordingRouter {
    async fn set_weight(
        &self,
        scope: &ScopeKey,
        version: &Version,
        percent: f64,
    ) -> Result<(), PortError> {
        self.weights
            .lock()
            .insert((scope.clone(), version.clone()), percent);
        self.history
            .lock()
            .push((scope.clone(), version.clone(), percent));
        Ok(())
    }
}

// ============================================================================
// Identity provider
// ============================================================================

/// Resolves a caller credential into a principal for access checks.
pub trait IdentityProvider: Send + Sync {
    fn resolve_principal(&self, credential: &str) -> Result<Principal, PortError>;
}

/// Static credential -> principal map.
#[derive(Default)]
pub struct StaticIdentityProvider {
    principals: Mutex<HashMap<String, Principal>>,
}

impl StaticIdentityProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, credential: impl Into<String>, principal: Principal) {
        self.principals.lock().insert(credential.into(), principal);
    }
}

impl IdentityProvider for StaticIdentityProvider {
    fn resolve_principal(&self, credential: &str) -> Result<Principal, PortError> {
        self.principals
            .lock()
            .get(credential)
            .cloned()
            .ok_or_else(|| PortError::NotFound(format!("unknown credential '{}'", credential)))
    }
}

// ============================================================================
// Audit sink
// ============================================================================

/// Receives forwarded audit entries. The trail retries transient failures
/// with bounded backoff.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn publish(&self, entry: &AuditEntry) -> Result<(), PortError>;
}

/// Collects entries in memory; the next N publishes can be scripted to fail
/// transiently.
#[derive(Default)]
pub struct MemoryAuditSink {
    entries: Mutex<Vec<AuditEntry>>,
    fail_next: AtomicUsize,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().clone()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn publish(&self, entry: &AuditEntry) -> Result<(), PortError> {
        let remaining = self.fail_next.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next.store(remaining - 1, Ordering::SeqCst);
            return Err(PortError::Transient("sink unavailable".to_string()));
        }
        self.entries.lock().push(entry.clone());
        Ok(())
    }
}

// ============================================================================
// Crypto provider
// ============================================================================

/// Symmetric encryption for paranoid isolation and HMAC for export
/// checksums.
pub trait CryptoProvider: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, PortError>;
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, PortError>;
    fn hmac(&self, data: &[u8]) -> Vec<u8>;
}

/// XChaCha20-Poly1305 encryption with an HMAC-SHA256 keyed over the same
/// root key. Ciphertext layout: 24-byte nonce followed by the sealed box.
pub struct DefaultCryptoProvider {
    cipher: XChaCha20Poly1305,
    mac_key: [u8; 32],
}

impl DefaultCryptoProvider {
    pub fn new(key: &[u8; 32]) -> Self {
        let cipher = XChaCha20Poly1305::new(key.into());
        // Domain-separate the MAC key from the encryption key.
        let mut hasher = Sha256::new();
        hasher.update(b"module-engine-mac");
        hasher.update(key);
        let mac_key: [u8; 32] = hasher.finalize().into();
        Self { cipher, mac_key }
    }

    pub fn from_passphrase(passphrase: &str) -> Self {
        let key: [u8; 32] = Sha256::digest(passphrase.as_bytes()).into();
        Self::new(&key)
    }
}

impl CryptoProvider for DefaultCryptoProvider {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, PortError> {
        let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
        let sealed = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| PortError::Io("encryption failed".to_string()))?;
        let mut out = nonce.to_vec();
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, PortError> {
        if ciphertext.len() < 24 {
            return Err(PortError::Verification("ciphertext too short".to_string()));
        }
        let (nonce, sealed) = ciphertext.split_at(24);
        self.cipher
            .decrypt(XNonce::from_slice(nonce), sealed)
            .map_err(|_| PortError::Verification("decryption failed".to_string()))
    }

    fn hmac(&self, data: &[u8]) -> Vec<u8> {
        let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(&self.mac_key)
            .expect("HMAC accepts any key length");
        mac.update(data);
        mac.finalize().into_bytes().to_vec()
    }
}

// ============================================================================
// Clock and randomness
// ============================================================================

/// Wall-clock source. Injected so tests control record timestamps.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// System wall clock.
#[derive(Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for tests.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn starting_at(now: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(now) }
    }

    pub fn advance(&self, duration: chrono::Duration) {
        let mut now = self.now.lock();
        *now += duration;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Randomness source for routing hashes and jitter.
pub trait RandomSource: Send + Sync {
    fn next_u64(&self) -> u64;

    fn next_f64(&self) -> f64 {
        // 53 bits of mantissa, uniform in [0, 1)
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }
}

/// Thread-local RNG.
#[derive(Default, Clone, Copy)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn next_u64(&self) -> u64 {
        rand::thread_rng().gen()
    }
}

/// Deterministic seeded RNG for tests.
pub struct SeededRandom {
    rng: Mutex<StdRng>,
}

impl SeededRandom {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl RandomSource for SeededRandom {
    fn next_u64(&self) -> u64 {
        self.rng.lock().next_u64()
    }
}
