//! At-write-time encryption of selected payload kinds.
//!
//! Kinds in the encryption set (by default `Secret`) never reach a checkout
//! in clear. The committed artifact is a small YAML envelope naming its age
//! recipients plus the armored ciphertext; recipients are declared per
//! destination in a `.sops.yaml` (age creation rules) at the base folder
//! root.
//!
//! age output is randomized, so a ciphertext cache keyed by
//! `(scope, H(cleartext))` keeps re-encryption byte-stable within one
//! process lifetime. The scope hash covers provider identity, work dir,
//! recipients and identities; rotating any of those changes the key, which
//! is what prevents ciphertext addressed to retired recipients from being
//! reused.

use crate::error::{Error, Result};

use std::collections::{BTreeSet, HashMap, HashSet};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use age::armor::{ArmoredWriter, Format};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Recipient declaration file expected at `<baseFolder>/.sops.yaml`.
pub const ENCRYPTION_CONFIG_FILE: &str = ".sops.yaml";

/// Kinds encrypted when no explicit set is configured.
pub const DEFAULT_ENCRYPTED_KINDS: &[&str] = &["Secret"];

// Ciphertext entries are small but unbounded in count; reset wholesale
// rather than tracking recency.
const CACHE_MAX_ENTRIES: usize = 4096;

#[derive(Debug, Default, Deserialize)]
struct CreationRules {
    #[serde(default)]
    creation_rules: Vec<CreationRule>,
}

#[derive(Debug, Default, Deserialize)]
struct CreationRule {
    /// Comma-separated age recipients
    #[serde(default)]
    age: Option<String>,
}

/// Validated, de-duplicated recipients for one destination.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecipientSet {
    recipients: Vec<String>,
}

impl RecipientSet {
    pub fn recipients(&self) -> &[String] {
        &self.recipients
    }
}

/// Parse a `.sops.yaml`; `folder` only feeds the error message.
pub fn parse_recipient_config(folder: &str, bytes: &[u8]) -> Result<RecipientSet> {
    let parsed: CreationRules = serde_yaml::from_slice(bytes).map_err(Error::YamlError)?;
    let mut recipients = BTreeSet::new();
    for rule in &parsed.creation_rules {
        let Some(age) = &rule.age else { continue };
        for recipient in age.split(',').map(str::trim).filter(|r| !r.is_empty()) {
            recipient.parse::<age::x25519::Recipient>().map_err(|e| {
                Error::EncryptError(format!("invalid age recipient {recipient:?}: {e}"))
            })?;
            recipients.insert(recipient.to_string());
        }
    }
    if recipients.is_empty() {
        return Err(Error::MissingEncryptionConfig(folder.to_string()));
    }
    Ok(RecipientSet {
        recipients: recipients.into_iter().collect(),
    })
}

/// The on-disk representation of an encrypted resource.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub recipients: Vec<String>,
    pub data: String,
}

impl Envelope {
    pub fn parse(bytes: &[u8]) -> Option<Envelope> {
        serde_yaml::from_slice(bytes).ok()
    }
}

/// Everything the ciphertext cache is partitioned by. Reusing an entry
/// across any of these dimensions would resurrect ciphertext from a previous
/// remote or recipient setup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncryptionScope {
    pub provider_identity: String,
    pub work_dir: PathBuf,
    pub recipients: Vec<String>,
    pub identities: Vec<String>,
}

impl EncryptionScope {
    fn fingerprint(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.provider_identity.as_bytes());
        hasher.update([0]);
        hasher.update(self.work_dir.to_string_lossy().as_bytes());
        for recipient in &self.recipients {
            hasher.update([0]);
            hasher.update(recipient.as_bytes());
        }
        hasher.update([1]);
        for identity in &self.identities {
            hasher.update([0]);
            hasher.update(identity.as_bytes());
        }
        hasher.finalize().into()
    }
}

/// Shared encryptor with the scoped ciphertext cache.
pub struct EncryptionWriter {
    kinds: HashSet<String>,
    cache: Mutex<HashMap<([u8; 32], [u8; 32]), Arc<Vec<u8>>>>,
}

impl EncryptionWriter {
    pub fn new(kinds: impl IntoIterator<Item = String>) -> Self {
        EncryptionWriter {
            kinds: kinds.into_iter().collect(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn should_encrypt(&self, kind: &str) -> bool {
        self.kinds.contains(kind)
    }

    /// Envelope bytes for `cleartext`, stable per `(scope, cleartext)` for
    /// the lifetime of the process.
    pub fn encrypt(&self, scope: &EncryptionScope, cleartext: &[u8]) -> Result<Vec<u8>> {
        let key = (scope.fingerprint(), Sha256::digest(cleartext).into());
        {
            let cache = self.cache.lock().expect("encryption cache lock poisoned");
            if let Some(bytes) = cache.get(&key) {
                return Ok(bytes.as_ref().clone());
            }
        }

        let envelope = Envelope {
            recipients: scope.recipients.clone(),
            data: age_encrypt(&scope.recipients, cleartext)?,
        };
        let bytes = serde_yaml::to_string(&envelope)
            .map_err(Error::YamlError)?
            .into_bytes();

        let mut cache = self.cache.lock().expect("encryption cache lock poisoned");
        if cache.len() >= CACHE_MAX_ENTRIES {
            cache.clear();
        }
        cache.insert(key, Arc::new(bytes.clone()));
        Ok(bytes)
    }
}

impl Default for EncryptionWriter {
    fn default() -> Self {
        EncryptionWriter::new(DEFAULT_ENCRYPTED_KINDS.iter().map(|s| s.to_string()))
    }
}

fn age_encrypt(recipients: &[String], cleartext: &[u8]) -> Result<String> {
    let parsed = recipients
        .iter()
        .map(|r| {
            r.parse::<age::x25519::Recipient>()
                .map(|key| Box::new(key) as Box<dyn age::Recipient + Send>)
                .map_err(|e| Error::EncryptError(format!("invalid age recipient {r:?}: {e}")))
        })
        .collect::<Result<Vec<_>>>()?;
    let encryptor = age::Encryptor::with_recipients(parsed)
        .ok_or_else(|| Error::EncryptError("no age recipients configured".to_string()))?;

    let mut armored = Vec::new();
    let writer = ArmoredWriter::wrap_output(&mut armored, Format::AsciiArmor)
        .map_err(|e| Error::EncryptError(e.to_string()))?;
    let mut stream = encryptor
        .wrap_output(writer)
        .map_err(|e| Error::EncryptError(e.to_string()))?;
    stream
        .write_all(cleartext)
        .map_err(|e| Error::EncryptError(e.to_string()))?;
    stream
        .finish()
        .and_then(|armor| armor.finish())
        .map_err(|e| Error::EncryptError(e.to_string()))?;

    String::from_utf8(armored).map_err(|e| Error::EncryptError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Read;
    use std::iter;

    fn age_decrypt(identity: &age::x25519::Identity, armored: &str) -> Vec<u8> {
        let reader = age::armor::ArmoredReader::new(armored.as_bytes());
        let decryptor = match age::Decryptor::new(reader).unwrap() {
            age::Decryptor::Recipients(d) => d,
            age::Decryptor::Passphrase(_) => panic!("expected recipient-encrypted data"),
        };
        let mut out = Vec::new();
        decryptor
            .decrypt(iter::once(identity as &dyn age::Identity))
            .unwrap()
            .read_to_end(&mut out)
            .unwrap();
        out
    }

    fn scope_for(recipient: &str) -> EncryptionScope {
        EncryptionScope {
            provider_identity: "https://git.example.com/audit.git".to_string(),
            work_dir: PathBuf::from("/var/lib/configbutler"),
            recipients: vec![recipient.to_string()],
            identities: vec![],
        }
    }

    #[test]
    fn round_trips_through_the_envelope() {
        let identity = age::x25519::Identity::generate();
        let recipient = identity.to_public().to_string();
        let writer = EncryptionWriter::default();

        let cleartext = b"apiVersion: v1\nkind: Secret\ndata:\n  k: dg==\n";
        let bytes = writer.encrypt(&scope_for(&recipient), cleartext).unwrap();
        let envelope = Envelope::parse(&bytes).unwrap();
        assert_eq!(envelope.recipients, vec![recipient]);
        assert_eq!(age_decrypt(&identity, &envelope.data), cleartext);
    }

    #[test]
    fn cache_makes_reencryption_byte_stable() {
        let identity = age::x25519::Identity::generate();
        let scope = scope_for(&identity.to_public().to_string());
        let writer = EncryptionWriter::default();
        let a = writer.encrypt(&scope, b"payload").unwrap();
        let b = writer.encrypt(&scope, b"payload").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, writer.encrypt(&scope, b"other payload").unwrap());
    }

    #[test]
    fn rotated_recipients_never_reuse_ciphertext() {
        let r1 = age::x25519::Identity::generate();
        let r2 = age::x25519::Identity::generate();
        let writer = EncryptionWriter::default();

        let before = writer
            .encrypt(&scope_for(&r1.to_public().to_string()), b"payload")
            .unwrap();
        let after = writer
            .encrypt(&scope_for(&r2.to_public().to_string()), b"payload")
            .unwrap();
        assert_ne!(before, after);

        let envelope = Envelope::parse(&after).unwrap();
        assert_eq!(envelope.recipients, vec![r2.to_public().to_string()]);
        assert_eq!(age_decrypt(&r2, &envelope.data), b"payload");
    }

    #[test]
    fn changed_work_dir_changes_the_scope() {
        let identity = age::x25519::Identity::generate();
        let mut scope = scope_for(&identity.to_public().to_string());
        let writer = EncryptionWriter::default();
        let a = writer.encrypt(&scope, b"payload").unwrap();
        scope.work_dir = PathBuf::from("/tmp/elsewhere");
        let b = writer.encrypt(&scope, b"payload").unwrap();
        // both decrypt fine, but the cache never crossed scopes
        assert_ne!(a, b);
    }

    #[test]
    fn recipient_config_parsing() {
        let identity = age::x25519::Identity::generate();
        let recipient = identity.to_public().to_string();
        let yaml = format!("creation_rules:\n  - age: \"{recipient}\"\n");
        let set = parse_recipient_config("audit", yaml.as_bytes()).unwrap();
        assert_eq!(set.recipients(), &[recipient]);

        let err = parse_recipient_config("audit", b"creation_rules: []").unwrap_err();
        assert!(err.to_string().contains("audit/.sops.yaml"));

        assert!(parse_recipient_config("audit", b"creation_rules:\n  - age: \"bogus\"\n").is_err());
    }

    #[test]
    fn only_configured_kinds_are_encrypted() {
        let writer = EncryptionWriter::default();
        assert!(writer.should_encrypt("Secret"));
        assert!(!writer.should_encrypt("ConfigMap"));
    }
}
