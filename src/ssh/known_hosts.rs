//! Known hosts ledger for SSH host key verification
//!
//! Reads and appends to an OpenSSH-compatible `known_hosts` file:
//! `pattern[,pattern] keytype base64key [comment]`, with non-default ports
//! written as `[host]:port`. Patterns may be plain names, `*`/`?` wildcards,
//! `!`-negations or hashed `|1|salt|hash` names. Entries are only ever
//! appended; a key that conflicts with a stored one is reported, never
//! rewritten.

use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use russh::keys::{PublicKey, PublicKeyBase64};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::error::SshError;

/// Result of host key verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyVerification {
    /// Key matches known_hosts entry
    Verified,
    /// No entry for this host and key type (first contact)
    Unknown { key_type: String, fingerprint: String },
    /// Key changed from known_hosts entry (potential MITM)
    Changed {
        key_type: String,
        expected_fingerprint: String,
        actual_fingerprint: String,
    },
    /// Key appears under a `@revoked` marker
    Revoked { fingerprint: String },
}

/// Entry in known_hosts: (key_type, base64_key)
#[derive(Clone, Debug, PartialEq, Eq)]
struct HostKeyEntry {
    key_type: String,
    key_data: String,
}

/// One host pattern of a ledger line
#[derive(Debug)]
enum HostPattern {
    /// Lowercased `host` or `[host]:port`
    Exact(String),
    Wildcard { host: glob::Pattern, port: u16 },
    /// `|1|salt|hash`: HMAC-SHA1 of the lookup key under `salt`
    Hashed { salt: Vec<u8>, hash: Vec<u8> },
}

impl HostPattern {
    fn parse(raw: &str) -> Option<Self> {
        if let Some(rest) = raw.strip_prefix("|1|") {
            let (salt, hash) = rest.split_once('|')?;
            return Some(Self::Hashed {
                salt: BASE64.decode(salt).ok()?,
                hash: BASE64.decode(hash).ok()?,
            });
        }

        let raw = raw.to_lowercase();
        if !raw.contains(['*', '?']) {
            return Some(Self::Exact(raw));
        }

        let (host, port) = match raw.strip_prefix('[').and_then(|r| r.split_once("]:")) {
            Some((host, port)) => (host.to_string(), port.parse().ok()?),
            None => (raw, 22),
        };
        let host = glob::Pattern::new(&host).ok()?;
        Some(Self::Wildcard { host, port })
    }

    fn matches(&self, host: &str, port: u16, lookup_key: &str) -> bool {
        match self {
            Self::Exact(name) => name == lookup_key,
            Self::Wildcard { host: pattern, port: p } => *p == port && pattern.matches(host),
            Self::Hashed { salt, hash } => {
                let Ok(mut mac) = Hmac::<Sha1>::new_from_slice(salt) else {
                    return false;
                };
                mac.update(lookup_key.as_bytes());
                mac.verify_slice(hash).is_ok()
            }
        }
    }
}

/// A host key line with the patterns it applies to
#[derive(Debug)]
struct LedgerLine {
    patterns: Vec<HostPattern>,
    negated: Vec<HostPattern>,
    key: HostKeyEntry,
}

impl LedgerLine {
    /// Any positive pattern matches and no negated one does
    fn matches(&self, host: &str, port: u16, lookup_key: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(host, port, lookup_key))
            && !self.negated.iter().any(|p| p.matches(host, port, lookup_key))
    }
}

pub struct KnownHostsStore {
    /// Host key lines in file order, appended keys last
    lines: RwLock<Vec<LedgerLine>>,
    /// base64 blobs listed under `@revoked`
    revoked: RwLock<HashSet<String>>,
    path: PathBuf,
}

impl KnownHostsStore {
    /// `~/.ssh/known_hosts`
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .map(|h| h.join(".ssh").join("known_hosts"))
            .unwrap_or_else(|| PathBuf::from(".ssh/known_hosts"))
    }

    /// Open the ledger at `path`. A missing file is an empty ledger.
    pub fn open(path: PathBuf) -> Result<Self, SshError> {
        let store = Self {
            lines: RwLock::new(Vec::new()),
            revoked: RwLock::new(HashSet::new()),
            path,
        };
        store.load()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<(), SshError> {
        if !self.path.exists() {
            debug!("Known hosts file {:?} not found, starting empty", self.path);
            return Ok(());
        }

        let file = fs::File::open(&self.path)?;
        let reader = BufReader::new(file);
        let mut lines = self.lines.write();
        let mut revoked = self.revoked.write();

        for line in reader.lines() {
            let line = line?;
            let line = line.trim();

            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let mut parts: Vec<&str> = line.split_whitespace().collect();

            if parts[0].starts_with('@') {
                let marker = parts.remove(0);
                match marker {
                    "@revoked" if parts.len() >= 3 => {
                        revoked.insert(parts[2].to_string());
                    }
                    // @cert-authority lines describe CAs, not host keys
                    _ => debug!("Skipping known_hosts marker line {}", marker),
                }
                continue;
            }

            if parts.len() < 3 {
                continue;
            }

            let mut patterns = Vec::new();
            let mut negated = Vec::new();
            for raw in parts[0].split(',') {
                let (target, raw) = match raw.strip_prefix('!') {
                    Some(raw) => (&mut negated, raw),
                    None => (&mut patterns, raw),
                };
                match HostPattern::parse(raw) {
                    Some(pattern) => target.push(pattern),
                    None => debug!("Skipping unreadable known_hosts pattern {:?}", raw),
                }
            }
            if patterns.is_empty() {
                continue;
            }

            lines.push(LedgerLine {
                patterns,
                negated,
                key: HostKeyEntry {
                    key_type: parts[1].to_string(),
                    key_data: parts[2].to_string(),
                },
            });
        }

        info!(
            "Loaded {} known host entries ({} revoked keys) from {:?}",
            lines.len(),
            revoked.len(),
            self.path
        );
        Ok(())
    }

    /// Stored keys of `key_type` whose line matches host:port, in file order
    fn stored_keys(lines: &[LedgerLine], host: &str, port: u16, key_type: &str) -> Vec<HostKeyEntry> {
        let lookup_key = Self::make_key(host, port);
        let host = host.trim_start_matches('[').trim_end_matches(']').to_lowercase();
        lines
            .iter()
            .filter(|line| line.key.key_type == key_type)
            .filter(|line| line.matches(&host, port, &lookup_key))
            .map(|line| line.key.clone())
            .collect()
    }

    /// Create lookup key for host:port
    pub fn make_key(host: &str, port: u16) -> String {
        let host = host.trim_start_matches('[').trim_end_matches(']').to_lowercase();
        if port == 22 {
            host
        } else {
            format!("[{}]:{}", host, port)
        }
    }

    /// Compute SHA256 fingerprint of public key
    pub fn fingerprint(key: &PublicKey) -> String {
        Self::fingerprint_bytes(&key.public_key_bytes())
    }

    fn fingerprint_bytes(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        let hash = hasher.finalize();
        format!("SHA256:{}", BASE64.encode(hash).trim_end_matches('='))
    }

    fn compute_fingerprint_from_b64(stored_b64: &str) -> String {
        match BASE64.decode(stored_b64) {
            Ok(bytes) => Self::fingerprint_bytes(&bytes),
            Err(_) => "unknown".to_string(),
        }
    }

    /// Key type name as written in known_hosts
    pub fn key_type_name(key: &PublicKey) -> String {
        key.algorithm().as_str().to_string()
    }

    /// Verify a host's public key against the ledger
    pub fn verify(&self, host: &str, port: u16, key: &PublicKey) -> HostKeyVerification {
        let lookup_key = Self::make_key(host, port);
        let actual_key_b64 = BASE64.encode(key.public_key_bytes());
        let actual_key_type = Self::key_type_name(key);
        let fingerprint = Self::fingerprint(key);

        if self.revoked.read().contains(&actual_key_b64) {
            warn!("Host key {} for {} is revoked", fingerprint, lookup_key);
            return HostKeyVerification::Revoked { fingerprint };
        }

        let stored = Self::stored_keys(&self.lines.read(), host, port, &actual_key_type);

        if stored.iter().any(|entry| entry.key_data == actual_key_b64) {
            debug!(
                "Host key verified for {} (type: {})",
                lookup_key, actual_key_type
            );
            return HostKeyVerification::Verified;
        }

        match stored.first() {
            Some(entry) => {
                let expected_fingerprint = Self::compute_fingerprint_from_b64(&entry.key_data);
                warn!(
                    "HOST KEY CHANGED for {} (type: {})! Expected {}, got {}",
                    lookup_key, actual_key_type, expected_fingerprint, fingerprint
                );
                HostKeyVerification::Changed {
                    key_type: actual_key_type,
                    expected_fingerprint,
                    actual_fingerprint: fingerprint,
                }
            }
            None => {
                debug!("No {} key stored for {}", actual_key_type, lookup_key);
                HostKeyVerification::Unknown {
                    key_type: actual_key_type,
                    fingerprint,
                }
            }
        }
    }

    /// Append a newly trusted host key. Refuses to add a second key of the
    /// same type for a host.
    pub fn add_host(&self, host: &str, port: u16, key: &PublicKey) -> Result<(), SshError> {
        let lookup_key = Self::make_key(host, port);
        let key_b64 = BASE64.encode(key.public_key_bytes());
        let key_type = Self::key_type_name(key);

        {
            let mut lines = self.lines.write();
            let stored = Self::stored_keys(&lines, host, port, &key_type);
            if stored.iter().any(|entry| entry.key_data == key_b64) {
                return Ok(());
            }
            if !stored.is_empty() {
                return Err(SshError::KeyError(format!(
                    "refusing to add a second {} key for {}",
                    key_type, lookup_key
                )));
            }
            self.append_to_file(&lookup_key, &key_type, &key_b64)?;
            lines.push(LedgerLine {
                patterns: vec![HostPattern::Exact(lookup_key.clone())],
                negated: Vec::new(),
                key: HostKeyEntry {
                    key_type: key_type.clone(),
                    key_data: key_b64,
                },
            });
        }

        info!(
            "Added host key for {} (type: {}) to {:?}",
            lookup_key, key_type, self.path
        );
        Ok(())
    }

    fn append_to_file(&self, host: &str, key_type: &str, key_b64: &str) -> Result<(), SshError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let needs_newline = match fs::read(&self.path) {
            Ok(bytes) => !bytes.is_empty() && !bytes.ends_with(b"\n"),
            Err(_) => false,
        };

        let mut options = OpenOptions::new();
        options.create(true).append(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&self.path)?;

        if needs_newline {
            writeln!(file)?;
        }
        writeln!(file, "{} {} {}", host, key_type, key_b64)?;

        Ok(())
    }
}
