use parking_lot::Mutex;
use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// An accepted upload waiting for detection.
///
/// The stored file belongs to the job that processes this request and is
/// removed during its cleanup phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectionRequest {
    /// Absolute path of the stored upload
    pub source_path: PathBuf,
    /// Generated file stem
    pub request_id: String,
}

impl DetectionRequest {
    /// Source path as handed to the detector, with forward slashes only
    pub fn detector_arg(&self) -> String {
        self.source_path.to_string_lossy().replace('\\', "/")
    }
}

/// Uploads whose jobs have not finished yet.
///
/// A path is registered before its bytes hit the disk and released once the
/// owning job removed the file, so result scans never mistake another
/// request's upload for a detector output.
#[derive(Debug, Clone, Default)]
pub struct PendingUploads {
    paths: Arc<Mutex<HashSet<PathBuf>>>,
}

impl PendingUploads {
    pub fn register(&self, path: &Path) {
        self.paths.lock().insert(path.to_path_buf());
    }

    pub fn release(&self, path: &Path) {
        self.paths.lock().remove(path);
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.paths.lock().contains(path)
    }

    pub fn is_empty(&self) -> bool {
        self.paths.lock().is_empty()
    }
}

/// Writes inbound images under collision-resistant generated names.
pub struct UploadStore {
    dir: PathBuf,
    pending: PendingUploads,
}

impl UploadStore {
    /// Create the store, creating `dir` when it does not exist yet
    pub fn new(dir: &Path) -> io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let dir = std::fs::canonicalize(dir)?;

        info!(dir = %dir.display(), "Upload store initialized");

        Ok(Self {
            dir,
            pending: PendingUploads::default(),
        })
    }

    /// Absolute upload directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Registry of uploads still owned by a running job
    pub fn pending(&self) -> &PendingUploads {
        &self.pending
    }

    /// Create and remove a marker file to prove the directory accepts writes
    pub async fn check_writable(&self) -> io::Result<()> {
        let marker = self
            .dir
            .join(format!(".ready-{}", Uuid::new_v4().simple()));
        tokio::fs::write(&marker, b"").await?;
        tokio::fs::remove_file(&marker).await
    }

    /// Persist `bytes`, keeping the extension of `original_name`
    pub async fn store(
        &self,
        original_name: Option<&str>,
        bytes: &[u8],
    ) -> io::Result<DetectionRequest> {
        let request_id = Uuid::new_v4().simple().to_string();
        let file_name = match original_name.and_then(sanitized_extension) {
            Some(ext) => format!("{request_id}.{ext}"),
            None => request_id.clone(),
        };
        let source_path = self.dir.join(file_name);

        self.pending.register(&source_path);
        if let Err(e) = tokio::fs::write(&source_path, bytes).await {
            if let Err(remove_err) = tokio::fs::remove_file(&source_path).await {
                if remove_err.kind() != io::ErrorKind::NotFound {
                    warn!(
                        path = %source_path.display(),
                        error = %remove_err,
                        "Failed to remove partial upload"
                    );
                    // Left registered so no scan treats the fragment as a result.
                    return Err(e);
                }
            }
            self.pending.release(&source_path);
            return Err(e);
        }

        debug!(
            request_id = %request_id,
            path = %source_path.display(),
            size_bytes = bytes.len(),
            "Upload stored"
        );

        Ok(DetectionRequest {
            source_path,
            request_id,
        })
    }
}

/// Extension of `name`, restricted to ASCII alphanumerics
fn sanitized_extension(name: &str) -> Option<String> {
    let ext = Path::new(name).extension()?.to_str()?;
    let ext: String = ext.chars().filter(|c| c.is_ascii_alphanumeric()).collect();
    (!ext.is_empty()).then_some(ext)
}
