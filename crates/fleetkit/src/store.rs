//! Backup artifact store.
//!
//! Artifacts live under `<root>/<environment>/` as
//! `{environment}_{YYYY-MM-DDTHH:MM:SSZ}.archive[.gz]`, each with a JSON
//! sidecar (`<artifact>.json`) carrying its checksum and contents. Files are
//! transferred under a `.partial-` prefix and renamed into place only once
//! complete, so a listed artifact is always a finished one.

use crate::error::{Error, Result};
use blake3::Hasher;
use chrono::{DateTime, NaiveDateTime, Utc};
use flate2::read::GzDecoder;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, Mutex, PoisonError};
use walkdir::WalkDir;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";
const PARTIAL_PREFIX: &str = ".partial-";

static ARTIFACT_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<env>[A-Za-z0-9][A-Za-z0-9_-]*)_(?P<ts>\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}Z)\.archive(?P<gz>\.gz)?$",
    )
    .expect("valid regex")
});

/// An immutable backup output file plus its metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupArtifact {
    /// Environment the dump was taken from
    pub environment: String,
    /// Dump start time
    pub timestamp: DateTime<Utc>,
    /// Nodes the dump covers
    pub nodes: Vec<String>,
    /// File name within the store
    pub file_name: String,
    /// Location in the store
    pub path: PathBuf,
    /// Size in bytes
    pub size: u64,
    /// Whether the archive is gzip-compressed
    pub compressed: bool,
    /// BLAKE3 checksum; `None` when the sidecar is missing
    pub checksum: Option<String>,
    /// Databases captured
    pub databases: Vec<String>,
}

impl BackupArtifact {
    /// Whether the artifact covers `node`.
    pub fn covers(&self, node: &str) -> bool {
        self.nodes.iter().any(|n| n == node)
    }

    /// Age relative to `now`.
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.timestamp
    }
}

/// Metadata recorded next to each artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Sidecar {
    environment: String,
    timestamp: DateTime<Utc>,
    nodes: Vec<String>,
    size: u64,
    compressed: bool,
    checksum: String,
    databases: Vec<String>,
}

/// What the backup engine knows about a freshly transferred archive.
#[derive(Debug, Clone)]
pub struct NewArtifact {
    pub environment: String,
    pub timestamp: DateTime<Utc>,
    pub nodes: Vec<String>,
    pub compressed: bool,
    pub databases: Vec<String>,
}

impl NewArtifact {
    pub fn file_name(&self) -> String {
        artifact_name(&self.environment, self.timestamp, self.compressed)
    }
}

/// Artifact file name for a dump of `environment` started at `timestamp`.
pub fn artifact_name(environment: &str, timestamp: DateTime<Utc>, compressed: bool) -> String {
    format!(
        "{environment}_{}.archive{}",
        timestamp.format(TIMESTAMP_FORMAT),
        if compressed { ".gz" } else { "" }
    )
}

/// Parse an artifact file name into (environment, timestamp, compressed).
pub fn parse_artifact_name(name: &str) -> Option<(String, DateTime<Utc>, bool)> {
    let caps = ARTIFACT_NAME.captures(name)?;
    let timestamp = NaiveDateTime::parse_from_str(&caps["ts"], TIMESTAMP_FORMAT)
        .ok()?
        .and_utc();
    Some((caps["env"].to_string(), timestamp, caps.name("gz").is_some()))
}

/// Storage for backup artifacts.
pub trait ArtifactStore: Send + Sync {
    /// Complete artifacts of `environment`, oldest first.
    fn list(&self, environment: &str) -> Result<Vec<BackupArtifact>>;

    /// Where an in-progress transfer of `file_name` should be written.
    fn partial_path(&self, environment: &str, file_name: &str) -> Result<PathBuf>;

    /// Checksum `partial`, record its metadata, and move it into place.
    fn commit(&self, partial: &Path, artifact: &NewArtifact) -> Result<BackupArtifact>;

    /// Remove an unfinished transfer. Never fails.
    fn discard(&self, partial: &Path);

    /// Delete an artifact and its metadata.
    fn delete(&self, artifact: &BackupArtifact) -> Result<()>;

    /// Resolve a reference: `latest`, an artifact file name, or a path whose
    /// last component is an artifact file name.
    fn resolve(&self, environment: &str, reference: &str) -> Result<BackupArtifact> {
        if reference == "latest" {
            return self.list(environment)?.pop().ok_or_else(|| {
                Error::not_found(format!("backups for environment '{environment}'"))
            });
        }

        let file_name = reference_file_name(reference);
        let (artifact_env, _, _) = parse_artifact_name(file_name)
            .ok_or_else(|| Error::not_found(format!("backup artifact '{reference}'")))?;

        self.list(&artifact_env)?
            .into_iter()
            .find(|a| a.file_name == file_name)
            .ok_or_else(|| Error::not_found(format!("backup artifact '{reference}'")))
    }
}

fn reference_file_name(reference: &str) -> &str {
    Path::new(reference)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(reference)
}

/// Environment whose store directory a reference reads from: the one named
/// by the artifact, or `environment` itself for `latest` and unparsable
/// references.
pub fn reference_environment(environment: &str, reference: &str) -> String {
    if reference == "latest" {
        return environment.to_string();
    }
    parse_artifact_name(reference_file_name(reference))
        .map(|(env, _, _)| env)
        .unwrap_or_else(|| environment.to_string())
}

/// Artifact store on the local filesystem.
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn env_dir(&self, environment: &str) -> PathBuf {
        self.root.join(environment)
    }

    fn load(
        &self,
        path: &Path,
        environment: String,
        timestamp: DateTime<Utc>,
        compressed: bool,
    ) -> Result<BackupArtifact> {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let size = fs::metadata(path)?.len();

        let mut artifact = BackupArtifact {
            environment,
            timestamp,
            nodes: Vec::new(),
            file_name,
            path: path.to_path_buf(),
            size,
            compressed,
            checksum: None,
            databases: Vec::new(),
        };

        match fs::read(sidecar_path(path)) {
            Ok(bytes) => match serde_json::from_slice::<Sidecar>(&bytes) {
                Ok(sidecar) => {
                    artifact.nodes = sidecar.nodes;
                    artifact.size = sidecar.size;
                    artifact.checksum = Some(sidecar.checksum);
                    artifact.databases = sidecar.databases;
                }
                // Listed without metadata; verification refuses it
                Err(e) => log::warn!("{} has an unreadable sidecar: {}", path.display(), e),
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                log::warn!("{} has no metadata sidecar", path.display());
            }
            Err(e) => return Err(e.into()),
        }
        Ok(artifact)
    }
}

impl ArtifactStore for LocalStore {
    fn list(&self, environment: &str) -> Result<Vec<BackupArtifact>> {
        let dir = self.env_dir(environment);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut artifacts = Vec::new();
        for entry in WalkDir::new(&dir).min_depth(1).max_depth(1) {
            let entry = entry.map_err(|e| Error::Other(format!("reading {}: {e}", dir.display())))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            let Some((env, timestamp, compressed)) = parse_artifact_name(&name) else {
                continue;
            };
            if env != environment {
                continue;
            }
            artifacts.push(self.load(entry.path(), env, timestamp, compressed)?);
        }

        artifacts.sort_by_key(|a| a.timestamp);
        Ok(artifacts)
    }

    fn partial_path(&self, environment: &str, file_name: &str) -> Result<PathBuf> {
        let dir = self.env_dir(environment);
        fs::create_dir_all(&dir)?;
        Ok(dir.join(format!("{PARTIAL_PREFIX}{file_name}")))
    }

    fn commit(&self, partial: &Path, artifact: &NewArtifact) -> Result<BackupArtifact> {
        let file_name = artifact.file_name();
        let final_path = self.env_dir(&artifact.environment).join(&file_name);
        if final_path.exists() {
            return Err(Error::precondition(format!("artifact {file_name} already exists")));
        }

        let checksum = checksum_file(partial)?;
        let size = fs::metadata(partial)?.len();
        let sidecar = Sidecar {
            environment: artifact.environment.clone(),
            timestamp: artifact.timestamp,
            nodes: artifact.nodes.clone(),
            size,
            compressed: artifact.compressed,
            checksum: checksum.clone(),
            databases: artifact.databases.clone(),
        };

        // Sidecar first; the archive rename is what makes the artifact visible
        let sidecar_tmp = partial.with_file_name(format!("{PARTIAL_PREFIX}{file_name}.json"));
        fs::write(&sidecar_tmp, serde_json::to_vec_pretty(&sidecar)?)?;
        fs::rename(&sidecar_tmp, sidecar_path(&final_path))?;
        fs::rename(partial, &final_path)?;

        log::info!("Stored {} ({} bytes)", final_path.display(), size);
        Ok(BackupArtifact {
            environment: artifact.environment.clone(),
            timestamp: artifact.timestamp,
            nodes: artifact.nodes.clone(),
            file_name,
            path: final_path,
            size,
            compressed: artifact.compressed,
            checksum: Some(checksum),
            databases: artifact.databases.clone(),
        })
    }

    fn discard(&self, partial: &Path) {
        if let Err(e) = fs::remove_file(partial)
            && e.kind() != io::ErrorKind::NotFound
        {
            log::warn!("Failed to remove partial artifact {}: {}", partial.display(), e);
        }
    }

    fn delete(&self, artifact: &BackupArtifact) -> Result<()> {
        fs::remove_file(&artifact.path)?;
        match fs::remove_file(sidecar_path(&artifact.path)) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

fn sidecar_path(artifact: &Path) -> PathBuf {
    let mut name = artifact.as_os_str().to_owned();
    name.push(".json");
    PathBuf::from(name)
}

/// BLAKE3 checksum of a file, hex encoded.
pub fn checksum_file(path: &Path) -> io::Result<String> {
    let file = File::open(path)?;
    let mut reader = BufReader::with_capacity(1024 * 1024, file);
    let mut hasher = Hasher::new();

    let mut buffer = [0u8; 65536];
    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hasher.finalize().to_hex().to_string())
}

/// Check that an artifact is complete and intact.
///
/// The file must exist, match its recorded size and checksum, and, when
/// compressed, decode as a complete gzip stream.
pub fn verify_artifact(artifact: &BackupArtifact) -> Result<()> {
    let invalid = |reason: String| Error::ArtifactInvalid {
        artifact: artifact.file_name.clone(),
        reason,
    };

    let Some(expected) = &artifact.checksum else {
        return Err(invalid("no recorded checksum".into()));
    };

    let actual_size = fs::metadata(&artifact.path)
        .map_err(|e| invalid(format!("cannot read {}: {e}", artifact.path.display())))?
        .len();
    if actual_size != artifact.size {
        return Err(invalid(format!(
            "size is {actual_size} bytes, expected {}",
            artifact.size
        )));
    }

    let actual = checksum_file(&artifact.path).map_err(|e| invalid(e.to_string()))?;
    if &actual != expected {
        return Err(invalid("checksum mismatch".into()));
    }

    if artifact.compressed {
        let file = File::open(&artifact.path).map_err(|e| invalid(e.to_string()))?;
        let mut decoder = GzDecoder::new(BufReader::new(file));
        io::copy(&mut decoder, &mut io::sink())
            .map_err(|e| invalid(format!("not a valid gzip stream: {e}")))?;
    }

    Ok(())
}

/// Per-environment mutual exclusion for store access.
///
/// Backup, retention, and restore of one environment never interleave;
/// different environments proceed independently.
#[derive(Debug, Default)]
pub struct EnvLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl EnvLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` while holding the lock for `environment`.
    pub fn with_lock<T>(&self, environment: &str, f: impl FnOnce() -> T) -> T {
        self.with_locks(&[environment], f)
    }

    /// Run `f` while holding the locks of every listed environment. Locks
    /// are taken in name order, so overlapping callers cannot deadlock.
    pub fn with_locks<T>(&self, environments: &[&str], f: impl FnOnce() -> T) -> T {
        let mut names = environments.to_vec();
        names.sort_unstable();
        names.dedup();

        let held: Vec<Arc<Mutex<()>>> = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            names
                .iter()
                .map(|name| Arc::clone(locks.entry((*name).to_string()).or_default()))
                .collect()
        };
        let _guards: Vec<_> = held
            .iter()
            .map(|lock| lock.lock().unwrap_or_else(PoisonError::into_inner))
            .collect();
        f()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;
    use tempfile::TempDir;

    fn ts(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, 2, 0, 0).unwrap()
    }

    fn store_artifact(
        store: &LocalStore,
        env: &str,
        timestamp: DateTime<Utc>,
        bytes: &[u8],
        compressed: bool,
    ) -> BackupArtifact {
        let new = NewArtifact {
            environment: env.into(),
            timestamp,
            nodes: vec!["db1".into()],
            compressed,
            databases: vec!["appdb".into()],
        };
        let partial = store.partial_path(env, &new.file_name()).unwrap();
        fs::write(&partial, bytes).unwrap();
        store.commit(&partial, &new).unwrap()
    }

    fn gz(bytes: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(bytes).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn test_artifact_name_format() {
        assert_eq!(
            artifact_name("staging", ts(1), true),
            "staging_2024-01-01T02:00:00Z.archive.gz"
        );
        assert_eq!(
            artifact_name("staging", ts(1), false),
            "staging_2024-01-01T02:00:00Z.archive"
        );
    }

    #[test]
    fn test_parse_artifact_name() {
        let (env, timestamp, compressed) =
            parse_artifact_name("eu_west-1_2024-01-03T02:00:00Z.archive.gz").unwrap();
        assert_eq!(env, "eu_west-1");
        assert_eq!(timestamp, ts(3));
        assert!(compressed);

        assert!(parse_artifact_name("staging.archive").is_none());
        assert!(parse_artifact_name(".partial-staging_2024-01-01T02:00:00Z.archive").is_none());
        assert!(parse_artifact_name("staging_2024-01-01T02:00:00Z.archive.json").is_none());
    }

    #[test]
    fn test_commit_then_list_oldest_first() {
        let tmp = TempDir::new().unwrap();
        let store = LocalStore::new(tmp.path());
        store_artifact(&store, "staging", ts(3), b"c", false);
        store_artifact(&store, "staging", ts(1), b"a", false);
        store_artifact(&store, "prod", ts(2), b"b", false);

        let listed = store.list("staging").unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].timestamp, ts(1));
        assert_eq!(listed[1].timestamp, ts(3));
        assert_eq!(listed[0].databases, vec!["appdb".to_string()]);
        assert!(listed[0].checksum.is_some());
    }

    #[test]
    fn test_partial_files_are_not_listed() {
        let tmp = TempDir::new().unwrap();
        let store = LocalStore::new(tmp.path());
        let partial = store
            .partial_path("staging", &artifact_name("staging", ts(1), false))
            .unwrap();
        fs::write(&partial, b"half").unwrap();

        assert!(store.list("staging").unwrap().is_empty());
        store.discard(&partial);
        assert!(!partial.exists());
    }

    #[test]
    fn test_verify_detects_corruption() {
        let tmp = TempDir::new().unwrap();
        let store = LocalStore::new(tmp.path());
        let artifact = store_artifact(&store, "staging", ts(1), b"dump", false);
        assert!(verify_artifact(&artifact).is_ok());

        fs::write(&artifact.path, b"dumq").unwrap();
        assert!(matches!(
            verify_artifact(&artifact),
            Err(Error::ArtifactInvalid { reason, .. }) if reason == "checksum mismatch"
        ));
    }

    #[test]
    fn test_verify_requires_valid_gzip() {
        let tmp = TempDir::new().unwrap();
        let store = LocalStore::new(tmp.path());

        let good = store_artifact(&store, "staging", ts(1), &gz(b"dump"), true);
        assert!(verify_artifact(&good).is_ok());

        let bad = store_artifact(&store, "staging", ts(2), b"not gzip", true);
        assert!(matches!(verify_artifact(&bad), Err(Error::ArtifactInvalid { .. })));
    }

    #[test]
    fn test_missing_sidecar_fails_verification() {
        let tmp = TempDir::new().unwrap();
        let store = LocalStore::new(tmp.path());
        let artifact = store_artifact(&store, "staging", ts(1), b"dump", false);
        fs::remove_file(sidecar_path(&artifact.path)).unwrap();

        let listed = store.list("staging").unwrap();
        assert!(listed[0].checksum.is_none());
        assert!(matches!(verify_artifact(&listed[0]), Err(Error::ArtifactInvalid { .. })));
    }

    #[test]
    fn test_unreadable_sidecar_is_listed_without_metadata() {
        let tmp = TempDir::new().unwrap();
        let store = LocalStore::new(tmp.path());
        store_artifact(&store, "staging", ts(1), b"old", false);
        let broken = store_artifact(&store, "staging", ts(2), b"dump", false);
        fs::write(sidecar_path(&broken.path), b"{ truncated").unwrap();

        let listed = store.list("staging").unwrap();

        assert_eq!(listed.len(), 2);
        assert!(listed[0].checksum.is_some());
        assert!(listed[1].checksum.is_none());
        let err = verify_artifact(&listed[1]).unwrap_err();
        assert!(err.to_string().contains("no recorded checksum"), "{err}");
    }

    #[test]
    fn test_reference_environment() {
        assert_eq!(reference_environment("staging", "latest"), "staging");
        assert_eq!(
            reference_environment("staging", "/b/prod_2024-01-01T02:00:00Z.archive.gz"),
            "prod"
        );
        assert_eq!(reference_environment("staging", "nonsense"), "staging");
    }

    #[test]
    fn test_resolve_references() {
        let tmp = TempDir::new().unwrap();
        let store = LocalStore::new(tmp.path());
        store_artifact(&store, "staging", ts(1), b"a", true);
        let newest = store_artifact(&store, "staging", ts(2), b"b", true);

        assert_eq!(store.resolve("staging", "latest").unwrap(), newest);
        assert_eq!(
            store
                .resolve("staging", "staging_2024-01-01T02:00:00Z.archive.gz")
                .unwrap()
                .timestamp,
            ts(1)
        );
        assert_eq!(
            store
                .resolve("staging", "/somewhere/else/staging_2024-01-02T02:00:00Z.archive.gz")
                .unwrap(),
            newest
        );
        assert!(matches!(
            store.resolve("staging", "staging_2030-01-01T00:00:00Z.archive"),
            Err(Error::NotFound { .. })
        ));
        assert!(matches!(store.resolve("prod", "latest"), Err(Error::NotFound { .. })));
    }

    #[test]
    fn test_delete_removes_sidecar() {
        let tmp = TempDir::new().unwrap();
        let store = LocalStore::new(tmp.path());
        let artifact = store_artifact(&store, "staging", ts(1), b"a", false);

        store.delete(&artifact).unwrap();
        assert!(!artifact.path.exists());
        assert!(!sidecar_path(&artifact.path).exists());
    }

    #[test]
    fn test_env_locks_serialize_same_environment() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::time::Duration;

        let locks = Arc::new(EnvLocks::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let (locks, inside, peak) = (locks.clone(), inside.clone(), peak.clone());
                std::thread::spawn(move || {
                    locks.with_lock("staging", || {
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(5));
                        inside.fetch_sub(1, Ordering::SeqCst);
                    });
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_with_locks_holds_every_environment() {
        use std::sync::mpsc;
        use std::time::{Duration, Instant};

        let locks = Arc::new(EnvLocks::new());
        let (entered, wait) = mpsc::channel();
        let holder = {
            let locks = locks.clone();
            std::thread::spawn(move || {
                locks.with_locks(&["staging", "prod", "staging"], || {
                    entered.send(()).unwrap();
                    std::thread::sleep(Duration::from_millis(100));
                });
            })
        };
        wait.recv().unwrap();

        let started = Instant::now();
        locks.with_lock("prod", || {});
        assert!(started.elapsed() >= Duration::from_millis(50));
        holder.join().unwrap();
    }
}
