use std::path::PathBuf;
use std::time::Duration;

/// Process-wide knobs, fed from the environment by the binary.
#[derive(Clone, Debug)]
pub struct Settings {
    pub work_dir: PathBuf,
    /// Identity trailers stamped on every commit
    pub cluster_uid: String,
    pub controller_namespace: String,
    pub controller_name: String,
    pub instance_id: String,
    pub correlation_ttl: Duration,
    pub correlation_max_entries: usize,
    /// Flush triggers for branch workers; any one of the three fires a flush
    pub batch_max_files: usize,
    pub batch_max_bytes: usize,
    pub batch_max_wait: Duration,
    pub discovery_refresh_interval: Duration,
    pub remote_sync_interval: Duration,
    /// Kinds whose payloads are envelope-encrypted at write time
    pub encrypted_kinds: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            work_dir: PathBuf::from("/var/lib/configbutler"),
            cluster_uid: String::new(),
            controller_namespace: "configbutler-system".to_string(),
            controller_name: "configbutler".to_string(),
            instance_id: String::new(),
            correlation_ttl: crate::correlation::DEFAULT_TTL,
            correlation_max_entries: crate::correlation::DEFAULT_MAX_ENTRIES,
            batch_max_files: 200,
            batch_max_bytes: 1024 * 1024,
            batch_max_wait: Duration::from_secs(20),
            discovery_refresh_interval: Duration::from_secs(300),
            remote_sync_interval: Duration::from_secs(30),
            encrypted_kinds: crate::encrypt::DEFAULT_ENCRYPTED_KINDS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}
