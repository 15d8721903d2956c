use std::{
    fs,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::RetentionConfig;
use crate::error::{Error, Result};

pub const ORIGINAL_IMAGE: &str = "original_image.png";
pub const PREDICTED_MASK: &str = "predicted_mask.png";
pub const CUTOUT_IMAGE: &str = "output_mask.png";
pub const OVERLAY_IMAGE: &str = "output_image.png";
pub const MODEL_DIR: &str = "model";

/// One request's output folder: `<root>/<id>/`.
#[derive(Debug, Clone)]
pub struct ArtifactDir {
    id: String,
    path: PathBuf,
}

impl ArtifactDir {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn original(&self) -> PathBuf {
        self.path.join(ORIGINAL_IMAGE)
    }

    pub fn predicted_mask(&self) -> PathBuf {
        self.path.join(PREDICTED_MASK)
    }

    pub fn cutout(&self) -> PathBuf {
        self.path.join(CUTOUT_IMAGE)
    }

    pub fn overlay(&self) -> PathBuf {
        self.path.join(OVERLAY_IMAGE)
    }

    pub fn model_dir(&self) -> PathBuf {
        self.path.join(MODEL_DIR)
    }

    pub fn require(&self, path: PathBuf) -> Result<PathBuf> {
        if path.is_file() {
            Ok(path)
        } else {
            Err(Error::ArtifactNotFound(path))
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub max_age: Option<Duration>,
    pub max_dirs: Option<usize>,
    pub max_bytes: Option<u64>,
}

impl From<&RetentionConfig> for RetentionPolicy {
    fn from(c: &RetentionConfig) -> Self {
        RetentionPolicy {
            max_age: c.max_age_secs.map(Duration::from_secs),
            max_dirs: c.max_dirs,
            max_bytes: c.max_bytes,
        }
    }
}

impl RetentionPolicy {
    pub fn is_unbounded(&self) -> bool {
        self.max_age.is_none() && self.max_dirs.is_none() && self.max_bytes.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
    retention: RetentionPolicy,
}

struct Entry {
    path: PathBuf,
    modified: SystemTime,
    bytes: u64,
}

impl ArtifactStore {
    /// The root is kept absolute: artifact paths are handed to child processes
    /// that may run in another working directory.
    pub fn new(root: impl Into<PathBuf>, retention: RetentionPolicy) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        let root = fs::canonicalize(&root)?;
        Ok(ArtifactStore { root, retention })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Creates (or reuses) the folder for `id`.
    pub fn create(&self, id: &str) -> Result<ArtifactDir> {
        let id = sanitize_id(id)?;
        let path = self.root.join(&id);
        fs::create_dir_all(&path)?;
        Ok(ArtifactDir { id, path })
    }

    pub fn create_unique(&self) -> Result<ArtifactDir> {
        self.create(&uuid::Uuid::new_v4().to_string())
    }

    /// A folder id derived from an image name, e.g. `my photo.jpg` -> `my_photo`.
    pub fn id_for_name(name: &str) -> String {
        let id: String = name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        if id.is_empty() {
            "image".to_string()
        } else {
            id
        }
    }

    pub fn remove(&self, id: &str) -> Result<()> {
        let id = sanitize_id(id)?;
        let path = self.root.join(id);
        if !path.is_dir() {
            return Err(Error::ArtifactNotFound(path));
        }
        fs::remove_dir_all(&path)?;
        info!("removed artifact directory {}", path.display());
        Ok(())
    }

    /// Applies the retention policy, returning the directories it deleted.
    pub fn sweep(&self, now: SystemTime) -> Result<Vec<PathBuf>> {
        if self.retention.is_unbounded() {
            return Ok(Vec::new());
        }

        let mut entries = self.entries()?;
        // oldest first
        entries.sort_by_key(|e| e.modified);

        let mut doomed = Vec::new();
        if let Some(max_age) = self.retention.max_age {
            entries.retain(|e| {
                let expired = now
                    .duration_since(e.modified)
                    .map_or(false, |age| age > max_age);
                if expired {
                    doomed.push(e.path.clone());
                }
                !expired
            });
        }

        let mut total: u64 = entries.iter().map(|e| e.bytes).sum();
        let mut remaining = entries.len();
        for e in &entries {
            let too_many = self.retention.max_dirs.map_or(false, |max| remaining > max);
            let too_big = self.retention.max_bytes.map_or(false, |max| total > max);
            if !too_many && !too_big {
                break;
            }
            doomed.push(e.path.clone());
            total -= e.bytes;
            remaining -= 1;
        }

        let mut removed = Vec::with_capacity(doomed.len());
        for path in doomed {
            match fs::remove_dir_all(&path) {
                Ok(()) => removed.push(path),
                Err(e) => warn!("failed to remove {}: {e}", path.display()),
            }
        }
        if !removed.is_empty() {
            info!("retention sweep removed {} artifact directories", removed.len());
        }

        Ok(removed)
    }

    fn entries(&self) -> Result<Vec<Entry>> {
        let mut entries = Vec::new();
        for dir in fs::read_dir(&self.root)? {
            let dir = dir?;
            if !dir.file_type()?.is_dir() {
                continue;
            }
            let modified = dir.metadata()?.modified()?;
            let bytes = WalkDir::new(dir.path())
                .into_iter()
                .filter_map(|e| e.ok())
                .filter_map(|e| e.metadata().ok())
                .filter(|m| m.is_file())
                .map(|m| m.len())
                .sum();

            debug!("artifact {} holds {bytes} bytes", dir.path().display());
            entries.push(Entry {
                path: dir.path(),
                modified,
                bytes,
            });
        }
        Ok(entries)
    }
}

fn sanitize_id(id: &str) -> Result<String> {
    let valid = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(id.to_string())
    } else {
        Err(Error::Validation(format!("invalid artifact id {id:?}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(policy: RetentionPolicy) -> (tempfile::TempDir, ArtifactStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path(), policy).unwrap();
        (dir, store)
    }

    fn fill(store: &ArtifactStore, id: &str, bytes: usize) -> ArtifactDir {
        let dir = store.create(id).unwrap();
        fs::write(dir.original(), vec![0u8; bytes]).unwrap();
        dir
    }

    #[test]
    fn layout_matches_documented_names() {
        let (_tmp, store) = store(RetentionPolicy::default());
        let dir = store.create("cat").unwrap();

        assert_eq!(dir.cutout(), store.root().join("cat/output_mask.png"));
        assert_eq!(dir.overlay(), store.root().join("cat/output_image.png"));
        assert_eq!(dir.model_dir(), store.root().join("cat/model"));
        assert!(dir.path().is_dir());
    }

    #[test]
    fn relative_root_is_made_absolute() {
        let rel = PathBuf::from("target").join(format!("store-{}", uuid::Uuid::new_v4()));
        let store = ArtifactStore::new(&rel, RetentionPolicy::default()).unwrap();

        assert!(store.root().is_absolute());
        assert!(store.create("cat").unwrap().cutout().is_absolute());
        fs::remove_dir_all(&rel).unwrap();
    }

    #[test]
    fn path_traversal_ids_are_rejected() {
        let (_tmp, store) = store(RetentionPolicy::default());
        assert!(matches!(store.create("../etc"), Err(Error::Validation(_))));
        assert!(matches!(store.remove(""), Err(Error::Validation(_))));
    }

    #[test]
    fn id_for_name_replaces_odd_characters() {
        assert_eq!(ArtifactStore::id_for_name("my photo.v2"), "my_photo_v2");
        assert_eq!(ArtifactStore::id_for_name(""), "image");
    }

    #[test]
    fn missing_artifact_is_reported() {
        let (_tmp, store) = store(RetentionPolicy::default());
        let dir = store.create("x").unwrap();

        assert!(matches!(dir.require(dir.cutout()), Err(Error::ArtifactNotFound(_))));
        assert!(matches!(store.remove("nope"), Err(Error::ArtifactNotFound(_))));
    }

    #[test]
    fn unbounded_policy_never_deletes() {
        let (_tmp, store) = store(RetentionPolicy::default());
        fill(&store, "a", 10);

        let far_future = SystemTime::now() + Duration::from_secs(10 * 365 * 86400);
        assert!(store.sweep(far_future).unwrap().is_empty());
    }

    #[test]
    fn expired_directories_are_removed() {
        let (_tmp, store) = store(RetentionPolicy {
            max_age: Some(Duration::from_secs(60)),
            ..Default::default()
        });
        let a = fill(&store, "a", 10);

        assert!(store.sweep(SystemTime::now()).unwrap().is_empty());
        let removed = store.sweep(SystemTime::now() + Duration::from_secs(3600)).unwrap();
        assert_eq!(removed, vec![a.path().to_path_buf()]);
        assert!(!a.path().exists());
    }

    #[test]
    fn oldest_directories_go_first_when_over_count() {
        let (_tmp, store) = store(RetentionPolicy {
            max_dirs: Some(2),
            ..Default::default()
        });
        let a = fill(&store, "a", 1);
        std::thread::sleep(Duration::from_millis(20));
        let b = fill(&store, "b", 1);
        std::thread::sleep(Duration::from_millis(20));
        let c = fill(&store, "c", 1);

        let removed = store.sweep(SystemTime::now()).unwrap();
        assert_eq!(removed, vec![a.path().to_path_buf()]);
        assert!(b.path().exists() && c.path().exists());
    }

    #[test]
    fn size_budget_is_enforced() {
        let (_tmp, store) = store(RetentionPolicy {
            max_bytes: Some(150),
            ..Default::default()
        });
        fill(&store, "a", 100);
        std::thread::sleep(Duration::from_millis(20));
        let b = fill(&store, "b", 100);

        let removed = store.sweep(SystemTime::now()).unwrap();
        assert_eq!(removed.len(), 1);
        assert!(b.path().exists());
    }
}
