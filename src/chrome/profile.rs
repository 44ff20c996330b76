use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::ChromeError;

/// Profile subtrees that are never mirrored: pure caches that Chromium
/// rebuilds on demand and that dominate profile size.
const EXCLUDED_SUBTREES: &[&str] = &[
    "Cache",
    "Code Cache",
    "GPUCache",
    "DawnGraphiteCache",
    "DawnWebGPUCache",
    "ShaderCache",
    "GrShaderCache",
    "Safe Browsing",
    "Service Worker/CacheStorage",
    "Service Worker/ScriptCache",
    "VideoDecodeStats",
    "OptimizationGuideHintCacheStore",
    "OptimizationGuidePredictionModels",
    "Crashpad",
];

/// Singleton lock filenames whose stale presence makes Chromium exit
/// silently on startup.
const SINGLETON_FILES: &[&str] = &["SingletonLock", "SingletonSocket", "SingletonCookie"];

/// A prepared shadow clone of a user profile.
#[derive(Debug, Clone)]
pub struct ShadowProfile {
    /// The cloned user-data directory passed to `--user-data-dir`.
    pub data_dir: PathBuf,
    /// The profile directory name inside it (e.g. `Default`).
    pub profile_name: String,
}

/// Mirror `<source_data_dir>/<profile_name>` into a stable shadow directory
/// under the OS temp area, so the user's live browser never has to close.
///
/// The mirror is resumable: re-runs copy only new or changed files
/// (size + mtime) and delete destination files that vanished from the
/// source. Excluded cache subtrees are skipped on copy and purged from the
/// destination. Locked or unreadable source files are skipped with a
/// warning. The top-level `Local State` file is copied verbatim because it
/// carries the key material needed to decrypt cookies and passwords.
///
/// # Errors
///
/// Returns `ChromeError::ProfileError` if the source profile does not
/// exist, or `ChromeError::Io` on destination I/O failure.
pub fn build_shadow_profile(
    source_data_dir: &Path,
    profile_name: &str,
) -> Result<ShadowProfile, ChromeError> {
    let source_profile = source_data_dir.join(profile_name);
    if !source_profile.is_dir() {
        return Err(ChromeError::ProfileError(format!(
            "source profile does not exist: {}",
            source_profile.display()
        )));
    }

    let dest_root = std::env::temp_dir().join("chromepilot-shadow");
    let dest_profile = dest_root.join(profile_name);
    fs::create_dir_all(&dest_profile)?;

    mirror_tree(&source_profile, &dest_profile, Path::new(""))?;
    prune_tree(&source_profile, &dest_profile, Path::new(""))?;

    // Local State lives beside the profile directory, not inside it.
    let local_state_src = source_data_dir.join("Local State");
    if local_state_src.is_file() {
        if let Err(e) = fs::copy(&local_state_src, dest_root.join("Local State")) {
            warn!("could not copy Local State: {e}");
        }
    }

    remove_singleton_locks(&dest_root);
    remove_singleton_locks(&dest_profile);

    debug!(dest = %dest_root.display(), "shadow profile ready");

    Ok(ShadowProfile {
        data_dir: dest_root,
        profile_name: profile_name.to_string(),
    })
}

/// Remove stale singleton lock files from `dir`. On Linux these are often
/// dangling symlinks, so existence is checked with `symlink_metadata`.
pub fn remove_singleton_locks(dir: &Path) {
    for name in SINGLETON_FILES {
        let path = dir.join(name);
        if fs::symlink_metadata(&path).is_ok() {
            if let Err(e) = fs::remove_file(&path) {
                warn!("could not remove {}: {e}", path.display());
            }
        }
    }
}

/// Is `relative` inside one of the excluded cache subtrees?
fn is_excluded(relative: &Path) -> bool {
    let rel = relative.to_string_lossy().replace('\\', "/");
    EXCLUDED_SUBTREES
        .iter()
        .any(|ex| rel == *ex || rel.starts_with(&format!("{ex}/")))
}

/// Copy pass: walk the source, copying files that are new or changed.
fn mirror_tree(source_root: &Path, dest_root: &Path, relative: &Path) -> Result<(), ChromeError> {
    let source_dir = source_root.join(relative);
    let entries = match fs::read_dir(&source_dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("skipping unreadable directory {}: {e}", source_dir.display());
            return Ok(());
        }
    };

    for entry in entries {
        let Ok(entry) = entry else { continue };
        let name = entry.file_name();
        let rel = relative.join(&name);
        if is_excluded(&rel) {
            continue;
        }

        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        let dest_path = dest_root.join(&rel);

        if file_type.is_dir() {
            fs::create_dir_all(&dest_path)?;
            mirror_tree(source_root, dest_root, &rel)?;
        } else if file_type.is_file() {
            if needs_copy(&entry.path(), &dest_path) {
                if let Err(e) = fs::copy(entry.path(), &dest_path) {
                    // The live browser holds some files open exclusively;
                    // a partial mirror still boots.
                    warn!("skipping locked file {}: {e}", entry.path().display());
                }
            }
        }
        // Symlinks (singleton locks) are intentionally not mirrored.
    }
    Ok(())
}

/// Delete pass: remove destination entries whose source counterpart is gone
/// or has become excluded.
fn prune_tree(source_root: &Path, dest_root: &Path, relative: &Path) -> Result<(), ChromeError> {
    let dest_dir = dest_root.join(relative);
    let entries = match fs::read_dir(&dest_dir) {
        Ok(entries) => entries,
        Err(_) => return Ok(()),
    };

    for entry in entries {
        let Ok(entry) = entry else { continue };
        let name = entry.file_name();
        let rel = relative.join(&name);
        let source_path = source_root.join(&rel);
        let Ok(file_type) = entry.file_type() else {
            continue;
        };

        if is_excluded(&rel) || !source_exists(&source_path) {
            let result = if file_type.is_dir() {
                fs::remove_dir_all(entry.path())
            } else {
                fs::remove_file(entry.path())
            };
            if let Err(e) = result {
                warn!("could not prune {}: {e}", entry.path().display());
            }
        } else if file_type.is_dir() {
            prune_tree(source_root, dest_root, &rel)?;
        }
    }
    Ok(())
}

fn source_exists(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}

/// Does `dest` need refreshing from `source`? Compares size and mtime.
fn needs_copy(source: &Path, dest: &Path) -> bool {
    let Ok(src_meta) = fs::metadata(source) else {
        return false;
    };
    let Ok(dst_meta) = fs::metadata(dest) else {
        return true;
    };
    if src_meta.len() != dst_meta.len() {
        return true;
    }
    match (src_meta.modified(), dst_meta.modified()) {
        (Ok(src_time), Ok(dst_time)) => src_time > dst_time,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(path: &Path, contents: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    /// Run the two mirror passes against an explicit destination, bypassing
    /// the OS temp root so tests stay hermetic.
    fn mirror_into(source_profile: &Path, dest_profile: &Path) {
        fs::create_dir_all(dest_profile).unwrap();
        mirror_tree(source_profile, dest_profile, Path::new("")).unwrap();
        prune_tree(source_profile, dest_profile, Path::new("")).unwrap();
    }

    fn tree_listing(root: &Path) -> Vec<String> {
        fn walk(root: &Path, prefix: &Path, out: &mut Vec<String>) {
            let Ok(entries) = fs::read_dir(root.join(prefix)) else {
                return;
            };
            for entry in entries.flatten() {
                let rel = prefix.join(entry.file_name());
                out.push(rel.to_string_lossy().into_owned());
                if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                    walk(root, &rel, out);
                }
            }
        }
        let mut out = Vec::new();
        walk(root, Path::new(""), &mut out);
        out.sort();
        out
    }

    #[test]
    fn mirrors_regular_files_and_skips_caches() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        let dst = tmp.path().join("dst");
        write(&src.join("Preferences"), "{}");
        write(&src.join("Cookies"), "sqlite");
        write(&src.join("Cache/Cache_Data/f_0001"), "cached");
        write(&src.join("Code Cache/js/index"), "cached");
        write(&src.join("Service Worker/CacheStorage/x/data"), "cached");
        write(&src.join("Service Worker/Database/db"), "keep me");

        mirror_into(&src, &dst);

        assert!(dst.join("Preferences").is_file());
        assert!(dst.join("Cookies").is_file());
        assert!(!dst.join("Cache").exists());
        assert!(!dst.join("Code Cache").exists());
        assert!(!dst.join("Service Worker/CacheStorage").exists());
        assert!(dst.join("Service Worker/Database/db").is_file());
    }

    #[test]
    fn rerun_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        let dst = tmp.path().join("dst");
        write(&src.join("Preferences"), "{\"a\":1}");
        write(&src.join("History"), "h");

        mirror_into(&src, &dst);
        let first = tree_listing(&dst);
        mirror_into(&src, &dst);
        let second = tree_listing(&dst);

        assert_eq!(first, second);
        assert_eq!(fs::read_to_string(dst.join("Preferences")).unwrap(), "{\"a\":1}");
    }

    #[test]
    fn rerun_picks_up_changes_and_deletions() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        let dst = tmp.path().join("dst");
        write(&src.join("Preferences"), "old");
        write(&src.join("Doomed"), "bye");

        mirror_into(&src, &dst);
        assert_eq!(fs::read_to_string(dst.join("Preferences")).unwrap(), "old");

        // Mutate the source: grow one file, delete another.
        write(&src.join("Preferences"), "newer-content");
        fs::remove_file(src.join("Doomed")).unwrap();

        mirror_into(&src, &dst);
        assert_eq!(
            fs::read_to_string(dst.join("Preferences")).unwrap(),
            "newer-content"
        );
        assert!(!dst.join("Doomed").exists());
    }

    #[test]
    fn excluded_subtree_is_purged_from_stale_destination() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        let dst = tmp.path().join("dst");
        write(&src.join("Preferences"), "{}");
        // Simulate an older mirror that copied a cache before it was excluded.
        write(&dst.join("GPUCache/data_0"), "stale");

        mirror_into(&src, &dst);
        assert!(!dst.join("GPUCache").exists());
    }

    #[test]
    fn singleton_locks_are_removed() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path();
        for name in SINGLETON_FILES {
            fs::write(dir.join(name), "").unwrap();
        }
        remove_singleton_locks(dir);
        for name in SINGLETON_FILES {
            assert!(!dir.join(name).exists(), "{name} should be gone");
        }
    }

    #[test]
    fn exclusion_matches_subpaths_only() {
        assert!(is_excluded(Path::new("Cache")));
        assert!(is_excluded(Path::new("Cache/Cache_Data")));
        assert!(is_excluded(Path::new("Service Worker/ScriptCache/x")));
        assert!(!is_excluded(Path::new("CacheStorageExtra")));
        assert!(!is_excluded(Path::new("Service Worker/Database")));
    }

    #[test]
    fn build_requires_existing_source() {
        let tmp = tempfile::tempdir().unwrap();
        let result = build_shadow_profile(tmp.path(), "NoSuchProfile");
        assert!(matches!(result, Err(ChromeError::ProfileError(_))));
    }
}
