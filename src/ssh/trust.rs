//! Host identity trust policy
//!
//! Trust-on-first-use on top of [`KnownHostsStore`]: unknown keys are shown
//! to the operator and accepted only after an explicit `yes`; keys that
//! differ from a stored key of the same type are always rejected without a
//! prompt.

use std::fmt;
use std::io::{self, BufRead, Write};
use std::sync::Arc;

use parking_lot::Mutex;
use russh::keys::PublicKey;
use tracing::{error, info, warn};

use super::error::TrustError;
use super::known_hosts::{HostKeyVerification, KnownHostsStore};

/// Whether host keys are checked at all
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyPolicy {
    /// Verify against the known hosts ledger (default)
    Checked,
    /// Accept any key. Insecure, only on explicit request.
    Insecure,
}

impl HostKeyPolicy {
    pub fn from_flag(host_key_check: bool) -> Self {
        if host_key_check {
            Self::Checked
        } else {
            Self::Insecure
        }
    }
}

/// Why a host key was not trusted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// Operator answered "no" at the first-contact prompt
    UnknownKeyDeclined,
    KeyChanged {
        key_type: String,
        expected_fingerprint: String,
        actual_fingerprint: String,
    },
    Revoked { fingerprint: String },
    /// The prompt itself or the ledger write failed
    Unconfirmed(String),
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownKeyDeclined => write!(f, "unknown host key not accepted"),
            Self::KeyChanged {
                expected_fingerprint,
                actual_fingerprint,
                ..
            } => write!(
                f,
                "host key changed (expected {}, got {})",
                expected_fingerprint, actual_fingerprint
            ),
            Self::Revoked { fingerprint } => write!(f, "host key {} is revoked", fingerprint),
            Self::Unconfirmed(detail) => write!(f, "host key could not be confirmed: {}", detail),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustDecision {
    Accept,
    /// Accept and append the key to the ledger
    AcceptAndRemember,
    Reject(RejectReason),
}

impl TrustDecision {
    /// Convert a rejection into the error surfaced by the handshake
    pub fn into_result(self, host: &str) -> Result<(), TrustError> {
        match self {
            Self::Accept | Self::AcceptAndRemember => Ok(()),
            Self::Reject(RejectReason::KeyChanged {
                key_type,
                expected_fingerprint,
                actual_fingerprint,
            }) => Err(TrustError::ConflictingHostKey {
                host: host.to_string(),
                key_type,
                expected_fingerprint,
                actual_fingerprint,
            }),
            Self::Reject(RejectReason::Revoked { fingerprint }) => {
                Err(TrustError::RevokedHostKey {
                    host: host.to_string(),
                    fingerprint,
                })
            }
            Self::Reject(reason) => Err(TrustError::UntrustedHost {
                host: host.to_string(),
                reason: reason.to_string(),
            }),
        }
    }
}

/// Asks the operator whether an unknown host key should be trusted
pub trait HostKeyPrompter: Send + Sync {
    fn confirm_new_host(&self, host: &str, key_type: &str, fingerprint: &str) -> io::Result<bool>;
}

/// Prompts on stderr and reads the answer from stdin
pub struct ConsolePrompter;

impl HostKeyPrompter for ConsolePrompter {
    fn confirm_new_host(&self, host: &str, key_type: &str, fingerprint: &str) -> io::Result<bool> {
        let stdin = io::stdin();
        let mut input = stdin.lock();
        let mut output = io::stderr();
        ask_yes_no(&mut input, &mut output, host, key_type, fingerprint)
    }
}

/// First-contact dialogue. Only `yes` and `no` are accepted (any case);
/// anything else repeats the question. End of input counts as `no`.
pub fn ask_yes_no<R: BufRead, W: Write>(
    input: &mut R,
    output: &mut W,
    host: &str,
    key_type: &str,
    fingerprint: &str,
) -> io::Result<bool> {
    writeln!(output, "The authenticity of host '{}' can't be established.", host)?;
    writeln!(output, "{} key fingerprint is {}.", key_type, fingerprint)?;

    let mut line = String::new();
    loop {
        write!(
            output,
            "Do you want to add the fingerprint to known_hosts and continue connecting (yes/no)? "
        )?;
        output.flush()?;

        line.clear();
        if input.read_line(&mut line)? == 0 {
            writeln!(output)?;
            return Ok(false);
        }

        match line.trim().to_lowercase().as_str() {
            "yes" => return Ok(true),
            "no" => return Ok(false),
            _ => writeln!(output, "Please type 'yes' or 'no'.")?,
        }
    }
}

/// Host key verification policy used during the handshake
pub struct TrustStore {
    policy: HostKeyPolicy,
    known_hosts: KnownHostsStore,
    prompter: Arc<dyn HostKeyPrompter>,
    // Serialises first-contact prompts and ledger appends
    confirm_lock: Mutex<()>,
}

impl TrustStore {
    pub fn new(
        policy: HostKeyPolicy,
        known_hosts: KnownHostsStore,
        prompter: Arc<dyn HostKeyPrompter>,
    ) -> Self {
        if policy == HostKeyPolicy::Insecure {
            warn!("Host key checking is DISABLED, any server key will be accepted");
        }
        Self {
            policy,
            known_hosts,
            prompter,
            confirm_lock: Mutex::new(()),
        }
    }

    /// Decide what to do with `key`, prompting the operator on first contact.
    /// Nothing is written to the ledger here.
    pub fn evaluate(&self, host: &str, port: u16, key: &PublicKey) -> TrustDecision {
        if self.policy == HostKeyPolicy::Insecure {
            warn!(
                "INSECURE: accepting host key {} for {}:{} without verification",
                KnownHostsStore::fingerprint(key),
                host,
                port
            );
            return TrustDecision::Accept;
        }

        match self.known_hosts.verify(host, port, key) {
            HostKeyVerification::Verified => TrustDecision::Accept,
            HostKeyVerification::Changed {
                key_type,
                expected_fingerprint,
                actual_fingerprint,
            } => {
                error!(
                    "HOST KEY CHANGED for {}:{}! Expected {}, got {}. POSSIBLE MITM ATTACK!",
                    host, port, expected_fingerprint, actual_fingerprint
                );
                TrustDecision::Reject(RejectReason::KeyChanged {
                    key_type,
                    expected_fingerprint,
                    actual_fingerprint,
                })
            }
            HostKeyVerification::Revoked { fingerprint } => {
                error!("Revoked host key {} presented by {}:{}", fingerprint, host, port);
                TrustDecision::Reject(RejectReason::Revoked { fingerprint })
            }
            HostKeyVerification::Unknown {
                key_type,
                fingerprint,
            } => {
                let display_host = KnownHostsStore::make_key(host, port);
                match self
                    .prompter
                    .confirm_new_host(&display_host, &key_type, &fingerprint)
                {
                    Ok(true) => TrustDecision::AcceptAndRemember,
                    Ok(false) => {
                        info!("Operator declined host key {} for {}", fingerprint, display_host);
                        TrustDecision::Reject(RejectReason::UnknownKeyDeclined)
                    }
                    Err(e) => {
                        warn!("Host key prompt failed: {}", e);
                        TrustDecision::Reject(RejectReason::Unconfirmed(e.to_string()))
                    }
                }
            }
        }
    }

    /// Evaluate `key` and persist it when the operator confirmed a first
    /// contact. Returns either `Accept` or `Reject`.
    pub fn verify(&self, host: &str, port: u16, key: &PublicKey) -> TrustDecision {
        let _guard = self.confirm_lock.lock();

        match self.evaluate(host, port, key) {
            TrustDecision::AcceptAndRemember => {
                match self.known_hosts.add_host(host, port, key) {
                    Ok(()) => TrustDecision::Accept,
                    Err(e) => {
                        warn!("Failed to add host {} to known_hosts: {}", host, e);
                        TrustDecision::Reject(RejectReason::Unconfirmed(e.to_string()))
                    }
                }
            }
            decision => decision,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::known_hosts::tests::{ed25519, HASHED_H1, KEY_A, KEY_B};
    use std::collections::VecDeque;
    use std::fs;
    use std::io::Cursor;
    use tempfile::tempdir;

    /// Replays canned answers and counts how often it was asked
    struct ScriptedPrompter {
        answers: Mutex<VecDeque<bool>>,
        asked: Mutex<usize>,
    }

    impl ScriptedPrompter {
        fn new(answers: &[bool]) -> Arc<Self> {
            Arc::new(Self {
                answers: Mutex::new(answers.iter().copied().collect()),
                asked: Mutex::new(0),
            })
        }

        fn times_asked(&self) -> usize {
            *self.asked.lock()
        }
    }

    impl HostKeyPrompter for ScriptedPrompter {
        fn confirm_new_host(&self, _: &str, _: &str, _: &str) -> io::Result<bool> {
            *self.asked.lock() += 1;
            self.answers
                .lock()
                .pop_front()
                .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "no answer"))
        }
    }

    fn store_with(
        dir: &std::path::Path,
        contents: Option<&str>,
        prompter: Arc<ScriptedPrompter>,
    ) -> TrustStore {
        let path = dir.join("known_hosts");
        if let Some(contents) = contents {
            fs::write(&path, contents).unwrap();
        }
        TrustStore::new(
            HostKeyPolicy::Checked,
            KnownHostsStore::open(path).unwrap(),
            prompter,
        )
    }

    #[test]
    fn test_first_contact_yes_then_silent_accept() {
        let temp = tempdir().unwrap();
        let prompter = ScriptedPrompter::new(&[true]);
        let store = store_with(temp.path(), None, prompter.clone());
        let key = ed25519(KEY_A);

        assert_eq!(store.verify("h1", 22, &key), TrustDecision::Accept);
        assert_eq!(store.verify("h1", 22, &key), TrustDecision::Accept);
        assert_eq!(prompter.times_asked(), 1);

        let ledger = fs::read_to_string(temp.path().join("known_hosts")).unwrap();
        assert_eq!(ledger, format!("h1 ssh-ed25519 {}\n", KEY_A));
    }

    #[test]
    fn test_first_contact_no_leaves_ledger_untouched() {
        let temp = tempdir().unwrap();
        let original = format!("other ssh-ed25519 {}\n", KEY_B);
        let prompter = ScriptedPrompter::new(&[false]);
        let store = store_with(temp.path(), Some(&original), prompter.clone());

        assert_eq!(
            store.verify("h1", 22, &ed25519(KEY_A)),
            TrustDecision::Reject(RejectReason::UnknownKeyDeclined)
        );
        assert_eq!(prompter.times_asked(), 1);
        assert_eq!(
            fs::read(temp.path().join("known_hosts")).unwrap(),
            original.as_bytes()
        );
    }

    #[test]
    fn test_changed_key_rejected_without_prompt() {
        let temp = tempdir().unwrap();
        let original = format!("h1 ssh-ed25519 {}\n", KEY_A);
        // Would say yes if asked
        let prompter = ScriptedPrompter::new(&[true]);
        let store = store_with(temp.path(), Some(&original), prompter.clone());

        let decision = store.verify("h1", 22, &ed25519(KEY_B));
        assert!(matches!(
            decision,
            TrustDecision::Reject(RejectReason::KeyChanged { .. })
        ));
        assert_eq!(prompter.times_asked(), 0);
        assert_eq!(
            fs::read(temp.path().join("known_hosts")).unwrap(),
            original.as_bytes()
        );

        let err = decision.into_result("h1").unwrap_err();
        assert!(matches!(err, TrustError::ConflictingHostKey { ref host, .. } if host == "h1"));
        assert!(err.to_string().contains("REMOTE HOST IDENTIFICATION HAS CHANGED for h1"));
    }

    #[test]
    fn test_changed_key_for_hashed_entry_rejected_without_prompt() {
        let temp = tempdir().unwrap();
        let original = format!("{} ssh-ed25519 {}\n", HASHED_H1, KEY_A);
        let prompter = ScriptedPrompter::new(&[true]);
        let store = store_with(temp.path(), Some(&original), prompter.clone());

        assert_eq!(store.verify("h1", 22, &ed25519(KEY_A)), TrustDecision::Accept);
        assert!(matches!(
            store.verify("h1", 22, &ed25519(KEY_B)),
            TrustDecision::Reject(RejectReason::KeyChanged { .. })
        ));
        assert_eq!(prompter.times_asked(), 0);
        assert_eq!(
            fs::read(temp.path().join("known_hosts")).unwrap(),
            original.as_bytes()
        );
    }

    #[test]
    fn test_insecure_policy_accepts_anything() {
        let temp = tempdir().unwrap();
        let prompter = ScriptedPrompter::new(&[]);
        let path = temp.path().join("known_hosts");
        fs::write(&path, format!("h1 ssh-ed25519 {}\n", KEY_A)).unwrap();
        let store = TrustStore::new(
            HostKeyPolicy::Insecure,
            KnownHostsStore::open(path).unwrap(),
            prompter.clone(),
        );

        assert_eq!(store.verify("h1", 22, &ed25519(KEY_B)), TrustDecision::Accept);
        assert_eq!(store.verify("h2", 22, &ed25519(KEY_B)), TrustDecision::Accept);
        assert_eq!(prompter.times_asked(), 0);
    }

    #[test]
    fn test_prompt_failure_rejects() {
        let temp = tempdir().unwrap();
        let store = store_with(temp.path(), None, ScriptedPrompter::new(&[]));

        let decision = store.verify("h1", 22, &ed25519(KEY_A));
        assert!(matches!(
            decision,
            TrustDecision::Reject(RejectReason::Unconfirmed(_))
        ));
        assert!(!temp.path().join("known_hosts").exists());
    }

    #[test]
    fn test_declined_maps_to_untrusted_host() {
        let err = TrustDecision::Reject(RejectReason::UnknownKeyDeclined)
            .into_result("h1")
            .unwrap_err();
        assert_eq!(
            err,
            TrustError::UntrustedHost {
                host: "h1".to_string(),
                reason: "unknown host key not accepted".to_string(),
            }
        );
    }

    #[test]
    fn test_ask_yes_no_reprompts_on_invalid_input() {
        let mut input = Cursor::new("maybe\ny\n  YES \n");
        let mut output = Vec::new();

        assert!(ask_yes_no(&mut input, &mut output, "h1", "ssh-ed25519", "SHA256:abc").unwrap());

        let text = String::from_utf8(output).unwrap();
        assert!(text.contains("The authenticity of host 'h1' can't be established."));
        assert!(text.contains("ssh-ed25519 key fingerprint is SHA256:abc."));
        assert_eq!(text.matches("Please type 'yes' or 'no'.").count(), 2);
    }

    #[test]
    fn test_ask_yes_no_answers() {
        let mut output = Vec::new();
        assert!(!ask_yes_no(&mut Cursor::new("No\n"), &mut output, "h", "t", "f").unwrap());
        assert!(!ask_yes_no(&mut Cursor::new(""), &mut output, "h", "t", "f").unwrap());
        assert!(!ask_yes_no(&mut Cursor::new("yess\n"), &mut output, "h", "t", "f").unwrap());
    }
}
