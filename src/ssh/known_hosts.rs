//! Host key verification for tunnel sessions
//!
//! Verification is pluggable through [`HostKeyVerifier`]. The default policy
//! checks `~/.ssh/known_hosts`: unknown hosts are recorded on first use (or
//! rejected in strict mode) and a changed key is always rejected. Skipping
//! verification entirely is available only as the explicit
//! [`HostKeyPolicy::InsecureAcceptAny`] opt-in.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use parking_lot::RwLock;
use russh::keys::{PublicKey, PublicKeyBase64};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::error::SshError;

/// Result of looking a key up in known_hosts
#[derive(Debug, Clone, PartialEq)]
pub enum HostKeyVerification {
    Verified,
    Unknown { fingerprint: String },
    Changed {
        expected_fingerprint: String,
        actual_fingerprint: String,
    },
}

/// Decides whether the server key presented during the handshake is trusted
pub trait HostKeyVerifier: Send + Sync {
    fn verify(&self, host: &str, port: u16, key: &PublicKey) -> Result<(), SshError>;
}

/// How tunnel sessions check server host keys
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyPolicy {
    /// Check against known_hosts. `strict` rejects unknown hosts instead of
    /// recording them on first use.
    KnownHosts { strict: bool },
    /// Accept any host key. Only for throwaway environments.
    InsecureAcceptAny,
}

impl Default for HostKeyPolicy {
    fn default() -> Self {
        HostKeyPolicy::KnownHosts { strict: false }
    }
}

impl HostKeyPolicy {
    pub fn verifier(&self) -> Arc<dyn HostKeyVerifier> {
        match self {
            HostKeyPolicy::KnownHosts { strict } => Arc::new(KnownHostsVerifier::new(
                Arc::new(KnownHostsStore::new()),
                *strict,
            )),
            HostKeyPolicy::InsecureAcceptAny => Arc::new(AcceptAnyHostKey),
        }
    }
}

/// Skips host key verification
pub struct AcceptAnyHostKey;

impl HostKeyVerifier for AcceptAnyHostKey {
    fn verify(&self, host: &str, port: u16, key: &PublicKey) -> Result<(), SshError> {
        warn!(
            "Host key verification disabled, accepting {}:{} (fingerprint: {})",
            host,
            port,
            KnownHostsStore::fingerprint(key)
        );
        Ok(())
    }
}

/// known_hosts-backed verifier
pub struct KnownHostsVerifier {
    store: Arc<KnownHostsStore>,
    strict: bool,
}

impl KnownHostsVerifier {
    pub fn new(store: Arc<KnownHostsStore>, strict: bool) -> Self {
        Self { store, strict }
    }
}

impl HostKeyVerifier for KnownHostsVerifier {
    fn verify(&self, host: &str, port: u16, key: &PublicKey) -> Result<(), SshError> {
        match self.store.verify(host, port, key) {
            HostKeyVerification::Verified => Ok(()),
            HostKeyVerification::Unknown { fingerprint } => {
                if self.strict {
                    warn!(
                        "Unknown host key for {}:{} (fingerprint: {}), strict mode rejects it",
                        host, port, fingerprint
                    );
                    return Err(SshError::HostKeyRejected(format!(
                        "unknown host {}:{} (fingerprint {}); add it to known_hosts first",
                        host, port, fingerprint
                    )));
                }
                info!(
                    "New host {}:{}, recording key (fingerprint: {})",
                    host, port, fingerprint
                );
                if let Err(e) = self.store.add_host(host, port, key) {
                    warn!("Failed to save host key: {}", e);
                }
                Ok(())
            }
            HostKeyVerification::Changed {
                expected_fingerprint,
                actual_fingerprint,
            } => {
                warn!(
                    "HOST KEY CHANGED for {}:{}! Expected {}, got {}",
                    host, port, expected_fingerprint, actual_fingerprint
                );
                Err(SshError::HostKeyRejected(format!(
                    "key for {}:{} changed (expected {}, got {}); remove the stale entry \
                     from known_hosts if the change is legitimate",
                    host, port, expected_fingerprint, actual_fingerprint
                )))
            }
        }
    }
}

#[derive(Clone, Debug)]
struct HostKeyEntry {
    key_type: String,
    key_data: String,
}

/// In-memory view of a known_hosts file
pub struct KnownHostsStore {
    hosts: RwLock<HashMap<String, Vec<HostKeyEntry>>>,
    path: PathBuf,
}

impl Default for KnownHostsStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KnownHostsStore {
    /// Load from ~/.ssh/known_hosts
    pub fn new() -> Self {
        let path = dirs::home_dir()
            .map(|h| h.join(".ssh").join("known_hosts"))
            .unwrap_or_else(|| PathBuf::from("~/.ssh/known_hosts"));
        Self::with_path(path)
    }

    pub fn with_path(path: PathBuf) -> Self {
        let store = Self {
            hosts: RwLock::new(HashMap::new()),
            path,
        };

        if let Err(e) = store.load() {
            warn!("Failed to load known_hosts {:?}: {}", store.path, e);
        }

        store
    }

    fn load(&self) -> Result<(), SshError> {
        if !self.path.exists() {
            debug!("No known_hosts at {:?}", self.path);
            return Ok(());
        }

        let file = fs::File::open(&self.path)?;
        let reader = BufReader::new(file);
        let mut hosts = self.hosts.write();
        let mut entry_count = 0;

        for line in reader.lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            // hostname[,alias] keytype base64key [comment]
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 3 {
                continue;
            }

            let entry = HostKeyEntry {
                key_type: parts[1].to_string(),
                key_data: parts[2].to_string(),
            };

            for hostname in parts[0].split(',') {
                // Hashed hostnames cannot be matched by name
                if hostname.starts_with('|') {
                    continue;
                }
                hosts
                    .entry(Self::normalize_hostname(hostname))
                    .or_default()
                    .push(entry.clone());
                entry_count += 1;
            }
        }

        debug!(
            "Loaded {} known host entries ({} unique hosts)",
            entry_count,
            hosts.len()
        );
        Ok(())
    }

    /// `[host]:port` and `host` both normalize to lower-case `host`, except
    /// that non-default ports keep their bracketed form.
    fn normalize_hostname(host: &str) -> String {
        let lowered = host.to_lowercase();
        match lowered.strip_prefix('[').and_then(|h| h.split_once("]:")) {
            Some((name, "22")) => name.to_string(),
            Some((name, port)) => format!("[{}]:{}", name, port),
            None => lowered,
        }
    }

    fn make_key(host: &str, port: u16) -> String {
        let host = host.to_lowercase();
        if port == 22 {
            host
        } else {
            format!("[{}]:{}", host, port)
        }
    }

    /// SHA256 fingerprint in OpenSSH notation
    pub fn fingerprint(key: &PublicKey) -> String {
        Self::fingerprint_bytes(&key.public_key_bytes())
    }

    fn fingerprint_bytes(bytes: &[u8]) -> String {
        let hash = Sha256::digest(bytes);
        format!("SHA256:{}", BASE64.encode(hash).trim_end_matches('='))
    }

    pub fn verify(&self, host: &str, port: u16, key: &PublicKey) -> HostKeyVerification {
        let lookup_key = Self::make_key(host, port);
        let actual_b64 = BASE64.encode(key.public_key_bytes());
        let actual_type = key.algorithm().as_str().to_string();
        let fingerprint = Self::fingerprint(key);

        let hosts = self.hosts.read();
        let Some(entries) = hosts.get(&lookup_key) else {
            debug!("Unknown host: {}", lookup_key);
            return HostKeyVerification::Unknown { fingerprint };
        };

        match entries.iter().find(|e| e.key_type == actual_type) {
            Some(entry) if entry.key_data == actual_b64 => HostKeyVerification::Verified,
            Some(entry) => HostKeyVerification::Changed {
                expected_fingerprint: BASE64
                    .decode(&entry.key_data)
                    .map(|bytes| Self::fingerprint_bytes(&bytes))
                    .unwrap_or_else(|_| "unknown".to_string()),
                actual_fingerprint: fingerprint,
            },
            // Known host, new key type
            None => HostKeyVerification::Unknown { fingerprint },
        }
    }

    /// Record a host key in memory and append it to the file
    pub fn add_host(&self, host: &str, port: u16, key: &PublicKey) -> Result<(), SshError> {
        let lookup_key = Self::make_key(host, port);
        let key_b64 = BASE64.encode(key.public_key_bytes());
        let key_type = key.algorithm().as_str().to_string();

        self.hosts
            .write()
            .entry(lookup_key.clone())
            .or_default()
            .push(HostKeyEntry {
                key_type: key_type.clone(),
                key_data: key_b64.clone(),
            });

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{} {} {}", lookup_key, key_type, key_b64)?;

        info!("Added host key for {} (type: {}) to known_hosts", lookup_key, key_type);
        Ok(())
    }
}
