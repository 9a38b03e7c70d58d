//! Known hosts store for SSH host key trust
//!
//! One record per line: `host keyType base64(keyMaterial)`. The file is
//! append-only from this crate's point of view; removing a record is a
//! manual operation on the file.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use parking_lot::{Mutex, RwLock};
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};

use super::error::TrustError;
use super::fingerprint::fingerprint;

/// A trusted `(host, key_type, key_material)` triple
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustRecord {
    pub host: String,
    pub key_type: String,
    pub key_material: Vec<u8>,
}

/// Outcome of matching a presented key against the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyMatch {
    /// Identical key material on record
    Trusted,
    /// No record for this (host, key_type)
    Unknown,
    /// A different key is on record for this (host, key_type)
    Conflicting { expected_fingerprint: String },
}

/// Outcome of a successful append
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Added,
    /// Identical record already present, nothing written
    AlreadyPresent,
}

/// Known hosts store
///
/// Reads are served from an in-memory cache and never touch the file.
/// Appends are serialized through `writer` and hit the file before the cache.
pub struct KnownHostsStore {
    /// host -> records (one authoritative record per key type)
    hosts: RwLock<HashMap<String, Vec<TrustRecord>>>,
    /// Single-writer lock for appends
    writer: Mutex<()>,
    path: PathBuf,
}

impl KnownHostsStore {
    /// Open the store at `path`; a missing file is an empty store
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, TrustError> {
        let path = path.into();
        let hosts = Self::load(&path)?;

        Ok(Self {
            hosts: RwLock::new(hosts),
            writer: Mutex::new(()),
            path,
        })
    }

    /// Open `~/.ssh/known_hosts`
    pub fn open_default() -> Result<Self, TrustError> {
        Self::open(default_known_hosts_path())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of loaded records
    pub fn len(&self) -> usize {
        self.hosts.read().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn load(path: &Path) -> Result<HashMap<String, Vec<TrustRecord>>, TrustError> {
        let unavailable = |source: std::io::Error| TrustError::StoreUnavailable {
            context: "loading".to_string(),
            path: path.to_path_buf(),
            source,
        };

        let file = match fs::File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("Known hosts file {:?} not found, starting empty", path);
                return Ok(HashMap::new());
            }
            Err(e) => return Err(unavailable(e)),
        };

        let mut hosts: HashMap<String, Vec<TrustRecord>> = HashMap::new();
        let mut entry_count = 0;

        for (line_no, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(unavailable)?;
            let line = line.trim();

            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            // @cert-authority / @revoked are policy lines, not records
            if line.starts_with('@') {
                debug!("Skipping marker line {} in {:?}", line_no + 1, path);
                continue;
            }

            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 3 {
                continue;
            }

            let key_material = match BASE64.decode(parts[2]) {
                Ok(bytes) if !bytes.is_empty() => bytes,
                _ => {
                    warn!(
                        "Skipping malformed key on line {} of {:?}",
                        line_no + 1,
                        path
                    );
                    continue;
                }
            };

            for host in parts[0].split(',') {
                // Hashed hostnames can't be matched by name
                if host.is_empty() || host.starts_with('|') {
                    continue;
                }

                let host = host.to_lowercase();
                let entries = hosts.entry(host.clone()).or_default();
                // First record for a key type stays authoritative
                if entries.iter().any(|r| r.key_type == parts[1]) {
                    debug!(
                        "Duplicate {} record for {} on line {}, ignoring",
                        parts[1],
                        host,
                        line_no + 1
                    );
                    continue;
                }
                entries.push(TrustRecord {
                    host,
                    key_type: parts[1].to_string(),
                    key_material: key_material.clone(),
                });
                entry_count += 1;
            }
        }

        info!(
            "Loaded {} known host entries ({} unique hosts)",
            entry_count,
            hosts.len()
        );
        Ok(hosts)
    }

    /// Lookup pattern for host:port, `[host]:port` unless port is 22
    pub fn host_pattern(host: &str, port: u16) -> String {
        let host = host.to_lowercase();
        if port == 22 {
            host
        } else {
            format!("[{}]:{}", host, port)
        }
    }

    /// Find the authoritative record for (host, key_type)
    pub fn lookup(&self, host: &str, key_type: &str) -> Option<TrustRecord> {
        let host = host.to_lowercase();
        self.hosts
            .read()
            .get(&host)
            .and_then(|entries| entries.iter().find(|r| r.key_type == key_type))
            .cloned()
    }

    /// Match presented key material against the store
    pub fn matches(&self, host: &str, key_type: &str, key_material: &[u8]) -> HostKeyMatch {
        match self.lookup(host, key_type) {
            None => HostKeyMatch::Unknown,
            Some(record) if same_key(&record.key_material, key_material) => HostKeyMatch::Trusted,
            Some(record) => HostKeyMatch::Conflicting {
                expected_fingerprint: fingerprint(&record.key_material)
                    .unwrap_or_else(|_| "unknown".to_string()),
            },
        }
    }

    /// Append a record, refusing to shadow a different trusted key
    pub fn append(
        &self,
        host: &str,
        key_type: &str,
        key_material: &[u8],
    ) -> Result<AppendOutcome, TrustError> {
        if key_material.is_empty() {
            return Err(TrustError::InvalidKey("empty key material".to_string()));
        }
        if !is_storable_host(host) {
            return Err(TrustError::InvalidKey(format!("invalid host {:?}", host)));
        }
        if key_type.is_empty() || key_type.contains(char::is_whitespace) {
            return Err(TrustError::InvalidKey(format!(
                "invalid key type {:?}",
                key_type
            )));
        }

        let host = host.to_lowercase();
        let _guard = self.writer.lock();

        // Re-check under the writer lock: another attempt may have appended meanwhile
        match self.matches(&host, key_type, key_material) {
            HostKeyMatch::Trusted => {
                debug!("Host key for {} ({}) already trusted", host, key_type);
                return Ok(AppendOutcome::AlreadyPresent);
            }
            HostKeyMatch::Conflicting { .. } => {
                warn!(
                    "Refusing to append {} key for {}: conflicting record exists",
                    key_type, host
                );
                return Err(TrustError::Conflict {
                    host,
                    key_type: key_type.to_string(),
                });
            }
            HostKeyMatch::Unknown => {}
        }

        self.append_to_file(&host, key_type, &BASE64.encode(key_material))
            .map_err(|source| TrustError::StoreUnavailable {
                context: format!("saving {} key for {}", key_type, host),
                path: self.path.clone(),
                source,
            })?;

        self.hosts
            .write()
            .entry(host.clone())
            .or_default()
            .push(TrustRecord {
                host: host.clone(),
                key_type: key_type.to_string(),
                key_material: key_material.to_vec(),
            });

        info!("Added host key for {} (type: {}) to known_hosts", host, key_type);
        Ok(AppendOutcome::Added)
    }

    fn append_to_file(&self, host: &str, key_type: &str, key_b64: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)?;

        let mut record = format!("{} {} {}\n", host, key_type, key_b64);
        // A hand-edited file may lack its final newline
        if file.metadata()?.len() > 0 {
            let mut last = [0u8; 1];
            file.seek(SeekFrom::End(-1))?;
            file.read_exact(&mut last)?;
            if last[0] != b'\n' {
                record.insert(0, '\n');
            }
        }

        file.write_all(record.as_bytes())?;
        file.sync_data()
    }
}

/// Default known hosts location
pub fn default_known_hosts_path() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".ssh").join("known_hosts"))
        .unwrap_or_else(|| PathBuf::from("known_hosts"))
}

/// Whether `load` would read `host` back as exactly this one host
fn is_storable_host(host: &str) -> bool {
    !host.is_empty()
        && !host.contains(|c: char| c.is_whitespace() || c == ',')
        && !host.starts_with(['#', '@', '|'])
}

fn same_key(stored: &[u8], presented: &[u8]) -> bool {
    stored.ct_eq(presented).into()
}
