//! Finds the image the detector wrote, without being told where it wrote it.
//!
//! The detector's output location depends on its working directory, on how
//! many times it ran before and on its environment, so the locator searches:
//!
//! 1. every search root, in priority order, for the most recently modified
//!    run directory, taking the first image file inside it;
//! 2. failing that, every fallback directory for the most recently modified
//!    loose image that is neither the upload itself nor any other upload
//!    still owned by a running job.
//!
//! Relative roots are tried under the detector's working directory first,
//! then under the service's own directories.
//!
//! Run directories are picked by modification time. This is only safe when
//! detector runs do not overlap; the orchestrator serializes them.

use crate::config::LocatorConfig;
use crate::upload_store::PendingUploads;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Locator failures
#[derive(Debug, Error)]
pub enum LocateError {
    /// Every strategy was exhausted. `searched` holds one entry per scanned
    /// path with the reason it produced nothing.
    #[error("result image not found (searched: {})", .searched.join("; "))]
    NotFound { searched: Vec<String> },
}

/// Ordering among run directories with identical modification times
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    /// First one in directory-listing order
    #[default]
    ListingOrder,
    /// Lexicographically greatest name (`predict1700000100` over `predict1700000000`)
    NameDescending,
}

/// A located detector result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedArtifact {
    /// Absolute path of the result image
    pub file_path: PathBuf,
    /// Run directory holding the image; `None` for loose files
    pub containing_dir: Option<PathBuf>,
}

/// Searches detector output locations for the latest result image.
#[derive(Debug, Clone)]
pub struct ArtifactLocator {
    search_roots: Vec<PathBuf>,
    fallback_dirs: Vec<PathBuf>,
    grace_period: Duration,
    tie_break: TieBreak,
    extensions: Vec<String>,
}

impl ArtifactLocator {
    /// Build a locator from configuration. Relative paths resolve against each
    /// of `bases` in order; `upload_dir` is always scanned last for loose results.
    pub fn new(config: &LocatorConfig, bases: &[PathBuf], upload_dir: &Path) -> Self {
        let search_roots = config.resolved_search_roots(bases);
        let fallback_dirs = config.resolved_fallback_dirs(bases, upload_dir);

        info!(
            search_roots = ?search_roots,
            fallback_dirs = ?fallback_dirs,
            grace_period_ms = config.grace_period_ms,
            tie_break = ?config.tie_break,
            "Artifact locator initialized"
        );

        Self {
            search_roots,
            fallback_dirs,
            grace_period: config.grace_period(),
            tie_break: config.tie_break,
            extensions: config
                .image_extensions
                .iter()
                .map(|ext| ext.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
        }
    }

    /// Wait out the grace period, then locate the result image.
    ///
    /// `exclude` is the stored upload and `in_flight` the uploads of other
    /// running jobs; neither is ever returned as a result.
    #[instrument(skip(self, in_flight), fields(exclude = %exclude.display()))]
    pub async fn locate(
        &self,
        exclude: &Path,
        in_flight: &PendingUploads,
    ) -> Result<ResolvedArtifact, LocateError> {
        if !self.grace_period.is_zero() {
            tokio::time::sleep(self.grace_period).await;
        }

        let mut searched = Vec::new();

        let candidate = match self.find_in_run_dirs(&mut searched).await {
            Some(found) => Some(found),
            None => self.find_loose(exclude, in_flight, &mut searched).await,
        };

        let Some(artifact) = candidate else {
            warn!(searched = ?searched, "No result image found");
            return Err(LocateError::NotFound { searched });
        };

        confirm(artifact, searched).await
    }

    /// First strategy: newest run directory under each root.
    async fn find_in_run_dirs(&self, searched: &mut Vec<String>) -> Option<ResolvedArtifact> {
        for root in &self.search_roots {
            let Some(entries) = list_dir(root).await else {
                searched.push(format!("{} (missing)", root.display()));
                continue;
            };

            let mut newest: Option<(PathBuf, SystemTime)> = None;
            for path in entries {
                let Ok(meta) = tokio::fs::metadata(&path).await else {
                    continue;
                };
                if !meta.is_dir() {
                    continue;
                }
                let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                if self.is_newer(&path, modified, newest.as_ref()) {
                    newest = Some((path, modified));
                }
            }

            let Some((run_dir, _)) = newest else {
                searched.push(format!("{} (no run directories)", root.display()));
                continue;
            };

            let files = list_dir(&run_dir).await.unwrap_or_default();
            let mut found = None;
            for path in files {
                if self.is_image(&path) && is_file(&path).await {
                    found = Some(path);
                    break;
                }
            }

            match found {
                Some(file_path) => {
                    return Some(ResolvedArtifact {
                        file_path,
                        containing_dir: Some(run_dir),
                    });
                }
                None => searched.push(format!("{} (no image files)", run_dir.display())),
            }
        }

        None
    }

    /// Second strategy: newest loose image in the fallback directories.
    async fn find_loose(
        &self,
        exclude: &Path,
        in_flight: &PendingUploads,
        searched: &mut Vec<String>,
    ) -> Option<ResolvedArtifact> {
        let excluded_name = exclude.file_name();
        let mut newest: Option<(PathBuf, SystemTime)> = None;

        for dir in &self.fallback_dirs {
            let Some(entries) = list_dir(dir).await else {
                searched.push(format!("{} (missing)", dir.display()));
                continue;
            };

            let mut matched = false;
            for path in entries {
                if path.file_name() == excluded_name || !self.is_image(&path) {
                    continue;
                }
                if in_flight.contains(&path) {
                    debug!(path = %path.display(), "Skipping upload of a running job");
                    continue;
                }
                let Ok(meta) = tokio::fs::metadata(&path).await else {
                    continue;
                };
                if !meta.is_file() {
                    continue;
                }
                matched = true;
                let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                if newest.as_ref().map_or(true, |(_, best)| modified > *best) {
                    newest = Some((path, modified));
                }
            }

            if !matched {
                searched.push(format!("{} (no image files)", dir.display()));
            }
        }

        newest.map(|(file_path, _)| ResolvedArtifact {
            file_path,
            containing_dir: None,
        })
    }

    fn is_newer(
        &self,
        path: &Path,
        modified: SystemTime,
        current: Option<&(PathBuf, SystemTime)>,
    ) -> bool {
        let Some((best_path, best_time)) = current else {
            return true;
        };
        if modified != *best_time {
            return modified > *best_time;
        }
        match self.tie_break {
            TieBreak::ListingOrder => false,
            TieBreak::NameDescending => path.file_name() > best_path.file_name(),
        }
    }

    fn is_image(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| {
                self.extensions
                    .iter()
                    .any(|allowed| allowed.eq_ignore_ascii_case(ext))
            })
            .unwrap_or(false)
    }
}

/// Entries of `dir` in listing order, `None` when it cannot be read
async fn list_dir(dir: &Path) -> Option<Vec<PathBuf>> {
    let mut read_dir = tokio::fs::read_dir(dir).await.ok()?;
    let mut entries = Vec::new();
    loop {
        match read_dir.next_entry().await {
            Ok(Some(entry)) => entries.push(entry.path()),
            Ok(None) => break,
            Err(e) => {
                debug!(dir = %dir.display(), error = %e, "Directory listing interrupted");
                break;
            }
        }
    }
    Some(entries)
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|meta| meta.is_file())
        .unwrap_or(false)
}

/// Discovery and use are not atomic; make sure the file is still there.
async fn confirm(
    artifact: ResolvedArtifact,
    mut searched: Vec<String>,
) -> Result<ResolvedArtifact, LocateError> {
    if !is_file(&artifact.file_path).await {
        warn!(path = %artifact.file_path.display(), "Result image vanished before use");
        searched.push(format!("{} (vanished)", artifact.file_path.display()));
        return Err(LocateError::NotFound { searched });
    }

    debug!(
        path = %artifact.file_path.display(),
        containing_dir = ?artifact.containing_dir,
        "Result image located"
    );

    Ok(artifact)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, File};

    fn locator(roots: Vec<PathBuf>, fallback: Vec<PathBuf>, upload_dir: &Path) -> ArtifactLocator {
        let config = LocatorConfig {
            search_roots: roots,
            fallback_dirs: fallback,
            grace_period_ms: 0,
            ..LocatorConfig::default()
        };
        ArtifactLocator::new(&config, &[PathBuf::from("/")], upload_dir)
    }

    fn set_mtime(path: &Path, secs_ago: u64) {
        let time = SystemTime::now() - Duration::from_secs(secs_ago);
        File::open(path).unwrap().set_modified(time).unwrap();
    }

    fn touch(path: &Path) {
        fs::write(path, b"img").unwrap();
    }

    #[tokio::test]
    async fn test_picks_newest_run_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("runs/detect");
        let older = root.join("exp2");
        let newer = root.join("exp3");
        fs::create_dir_all(&older).unwrap();
        fs::create_dir_all(&newer).unwrap();
        touch(&older.join("old.jpg"));
        touch(&newer.join("cat.jpg"));
        set_mtime(&older, 120);
        set_mtime(&newer, 10);

        let uploads = tmp.path().join("uploads");
        let artifact = locator(vec![root, tmp.path().join("other")], vec![], &uploads)
            .locate(&uploads.join("ab12.jpg"), &PendingUploads::default())
            .await
            .unwrap();

        assert_eq!(artifact.file_path, newer.join("cat.jpg"));
        assert_eq!(artifact.containing_dir, Some(newer));
    }

    #[tokio::test]
    async fn test_run_directory_ignores_non_images() {
        let tmp = tempfile::tempdir().unwrap();
        let run = tmp.path().join("detect/predict1");
        fs::create_dir_all(&run).unwrap();
        touch(&run.join("labels.txt"));
        touch(&run.join("RESULT.PNG"));

        let artifact = locator(vec![tmp.path().join("detect")], vec![], tmp.path())
            .locate(Path::new("/nowhere/upload.jpg"), &PendingUploads::default())
            .await
            .unwrap();

        assert_eq!(artifact.file_path, run.join("RESULT.PNG"));
    }

    #[tokio::test]
    async fn test_falls_through_to_next_root() {
        let tmp = tempfile::tempdir().unwrap();
        let empty_run = tmp.path().join("a/exp1");
        let good_run = tmp.path().join("b/exp1");
        fs::create_dir_all(&empty_run).unwrap();
        fs::create_dir_all(&good_run).unwrap();
        touch(&good_run.join("out.webp"));

        let artifact = locator(
            vec![tmp.path().join("a"), tmp.path().join("b")],
            vec![],
            tmp.path(),
        )
        .locate(Path::new("/nowhere/upload.jpg"), &PendingUploads::default())
        .await
        .unwrap();

        assert_eq!(artifact.file_path, good_run.join("out.webp"));
    }

    #[tokio::test]
    async fn test_loose_fallback_skips_upload() {
        let tmp = tempfile::tempdir().unwrap();
        let uploads = tmp.path().join("uploads");
        fs::create_dir_all(&uploads).unwrap();
        let upload = uploads.join("ab12ef.jpg");
        touch(&upload);
        touch(&uploads.join("result.png"));
        set_mtime(&uploads.join("result.png"), 60);

        let artifact = locator(vec![tmp.path().join("runs/detect")], vec![], &uploads)
            .locate(&upload, &PendingUploads::default())
            .await
            .unwrap();

        assert_eq!(artifact.file_path, uploads.join("result.png"));
        assert_eq!(artifact.containing_dir, None);
    }

    #[tokio::test]
    async fn test_loose_fallback_prefers_newest() {
        let tmp = tempfile::tempdir().unwrap();
        let runs = tmp.path().join("runs");
        fs::create_dir_all(&runs).unwrap();
        touch(&runs.join("old.jpg"));
        touch(&runs.join("new.jpg"));
        set_mtime(&runs.join("old.jpg"), 300);
        set_mtime(&runs.join("new.jpg"), 5);

        let artifact = locator(vec![], vec![runs.clone()], &tmp.path().join("uploads"))
            .locate(Path::new("/nowhere/upload.jpg"), &PendingUploads::default())
            .await
            .unwrap();

        assert_eq!(artifact.file_path, runs.join("new.jpg"));
    }

    #[tokio::test]
    async fn test_not_found_lists_searched_paths() {
        let tmp = tempfile::tempdir().unwrap();
        let uploads = tmp.path().join("uploads");
        fs::create_dir_all(&uploads).unwrap();
        let upload = uploads.join("ab12ef.jpg");
        touch(&upload);
        let root = tmp.path().join("runs/detect");

        let err = locator(vec![root.clone()], vec![], &uploads)
            .locate(&upload, &PendingUploads::default())
            .await
            .unwrap_err();

        let LocateError::NotFound { searched } = err;
        assert_eq!(searched.len(), 2);
        assert!(searched[0].contains(&root.display().to_string()));
        assert!(searched[0].ends_with("(missing)"));
        assert!(searched[1].contains(&uploads.display().to_string()));
        assert!(searched[1].ends_with("(no image files)"));
    }

    #[tokio::test]
    async fn test_name_descending_tie_break() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("detect");
        for name in ["predict100", "predict300", "predict200"] {
            let dir = root.join(name);
            fs::create_dir_all(&dir).unwrap();
            touch(&dir.join(format!("{name}.jpg")));
        }
        let time = SystemTime::now() - Duration::from_secs(30);
        for name in ["predict100", "predict300", "predict200"] {
            File::open(root.join(name)).unwrap().set_modified(time).unwrap();
        }

        let config = LocatorConfig {
            search_roots: vec![root.clone()],
            fallback_dirs: vec![],
            grace_period_ms: 0,
            tie_break: TieBreak::NameDescending,
            ..LocatorConfig::default()
        };
        let artifact = ArtifactLocator::new(&config, &[PathBuf::from("/")], tmp.path())
            .locate(Path::new("/nowhere/upload.jpg"), &PendingUploads::default())
            .await
            .unwrap();

        assert_eq!(artifact.containing_dir, Some(root.join("predict300")));
    }

    #[tokio::test]
    async fn test_loose_fallback_skips_in_flight_uploads() {
        let tmp = tempfile::tempdir().unwrap();
        let uploads = tmp.path().join("uploads");
        fs::create_dir_all(&uploads).unwrap();
        let own = uploads.join("aaaa.jpg");
        let other = uploads.join("bbbb.jpg");
        touch(&own);
        touch(&other);
        set_mtime(&own, 30);

        let in_flight = PendingUploads::default();
        in_flight.register(&own);
        in_flight.register(&other);

        let err = locator(vec![tmp.path().join("runs/detect")], vec![], &uploads)
            .locate(&own, &in_flight)
            .await
            .unwrap_err();

        let LocateError::NotFound { searched } = err;
        assert!(searched
            .iter()
            .any(|entry| entry == &format!("{} (no image files)", uploads.display())));
    }

    #[tokio::test]
    async fn test_scan_waits_for_grace_period() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("detect");
        let run = root.join("predict1");

        let config = LocatorConfig {
            search_roots: vec![root],
            fallback_dirs: vec![],
            grace_period_ms: 300,
            ..LocatorConfig::default()
        };
        let locator = ArtifactLocator::new(&config, &[PathBuf::from("/")], tmp.path());

        // Output lands after the detector exited but within the grace period.
        let late_run = run.clone();
        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            fs::create_dir_all(&late_run).unwrap();
            touch(&late_run.join("out.jpg"));
        });

        let started = std::time::Instant::now();
        let artifact = locator
            .locate(Path::new("/nowhere/upload.jpg"), &PendingUploads::default())
            .await
            .unwrap();
        writer.await.unwrap();

        assert!(started.elapsed() >= Duration::from_millis(300));
        assert_eq!(artifact.file_path, run.join("out.jpg"));
    }

    #[tokio::test]
    async fn test_vanished_result_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let run = tmp.path().join("detect/predict1");
        fs::create_dir_all(&run).unwrap();
        let file_path = run.join("out.jpg");
        touch(&file_path);

        let artifact = ResolvedArtifact {
            file_path: file_path.clone(),
            containing_dir: Some(run),
        };
        assert_eq!(confirm(artifact.clone(), vec![]).await.unwrap(), artifact);

        fs::remove_file(&file_path).unwrap();
        let err = confirm(artifact, vec!["/srv/runs (missing)".to_string()])
            .await
            .unwrap_err();

        let LocateError::NotFound { searched } = err;
        assert_eq!(
            searched,
            vec![
                "/srv/runs (missing)".to_string(),
                format!("{} (vanished)", file_path.display()),
            ]
        );
    }

    #[test]
    fn test_extension_matching_is_case_insensitive() {
        let locator = locator(vec![], vec![], Path::new("/tmp"));
        assert!(locator.is_image(Path::new("a.JPG")));
        assert!(locator.is_image(Path::new("a.jpeg")));
        assert!(locator.is_image(Path::new("a.WebP")));
        assert!(!locator.is_image(Path::new("a.gif")));
        assert!(!locator.is_image(Path::new("jpg")));
    }
}
