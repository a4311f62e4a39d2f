//! Path utilities: environment expansion, import staging names, and
//! hard-link aware tree copies.

use std::fs;
use std::io;
use std::path::Path;

use regex::Regex;
use sha1::{Digest, Sha1};
use walkdir::WalkDir;

/// Expand `$NAME` references against the process environment. Unknown
/// names are left in place and logged as warnings.
pub fn resolve_env_vars(path: &str) -> String {
    let pattern = Regex::new(r"\$(\w+)").expect("static regex");
    let resolved = pattern.replace_all(path, |caps: &regex::Captures| {
        let name = &caps[1];
        match std::env::var(name) {
            Ok(v) => v,
            Err(_) => caps[0].to_string(),
        }
    });
    for caps in pattern.captures_iter(&resolved) {
        log::warn!("variable {} in {} not defined in environment", &caps[1], path);
    }
    resolved.into_owned()
}

/// Map a collected file to an unambiguous staged name based on its full
/// path: `path/to/file.tar.gz` becomes `file_<sha1(path)>.tar.gz`. Equal
/// basenames from different directories stage to different names.
pub fn imported_filename(pathstr: &str) -> String {
    let name = Path::new(pathstr)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| pathstr.to_string());

    // leading dot is part of the stem, not an extension
    let split = name[1..].find('.').map(|i| i + 1).unwrap_or(name.len());
    let (stem, ext) = name.split_at(split);

    let mut hasher = Sha1::new();
    hasher.update(pathstr.as_bytes());
    let digest = hex::encode(hasher.finalize());

    format!("{}_{}{}", stem, digest, ext)
}

/// Copy a directory tree, preferring hard links for files. Entries whose
/// file name appears in `ignore` are skipped. Existing destination files
/// are replaced.
pub fn copytree(src: &Path, dst: &Path, ignore: &[String], link: bool) -> io::Result<()> {
    for entry in WalkDir::new(src) {
        let entry = entry.map_err(io::Error::other)?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(io::Error::other)?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if ignore.iter().any(|i| i.as_str() == name) {
            continue;
        }
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        if target.exists() {
            fs::remove_file(&target)?;
        }
        if !link || fs::hard_link(entry.path(), &target).is_err() {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_imported_filename_keeps_extension() {
        let name = imported_filename("rtl/top.v");
        assert!(name.starts_with("top_"));
        assert!(name.ends_with(".v"));
    }

    #[test]
    fn test_imported_filename_multi_suffix() {
        let name = imported_filename("ip/core.tar.gz");
        assert!(name.starts_with("core_"));
        assert!(name.ends_with(".tar.gz"));
    }

    #[test]
    fn test_imported_filename_distinct_paths() {
        // same basename, different directories: staged names must differ
        let a = imported_filename("libs/a/cells.lef");
        let b = imported_filename("libs/b/cells.lef");
        assert_ne!(a, b);
        assert!(a.ends_with(".lef") && b.ends_with(".lef"));
    }

    #[test]
    fn test_resolve_env_vars_known() {
        std::env::set_var("FAB_TEST_ROOT", "/opt/pdk");
        assert_eq!(resolve_env_vars("$FAB_TEST_ROOT/tech.lef"), "/opt/pdk/tech.lef");
    }

    #[test]
    fn test_resolve_env_vars_unknown_left_in_place() {
        assert_eq!(
            resolve_env_vars("$FAB_NO_SUCH_VAR/tech.lef"),
            "$FAB_NO_SUCH_VAR/tech.lef"
        );
    }

    #[test]
    fn test_copytree_links_and_ignores() {
        let src = tempdir().unwrap();
        let dst = tempdir().unwrap();
        fs::create_dir(src.path().join("sub")).unwrap();
        fs::write(src.path().join("keep.txt"), "keep").unwrap();
        fs::write(src.path().join("sub/deep.txt"), "deep").unwrap();
        fs::write(src.path().join("drop.json"), "drop").unwrap();

        copytree(src.path(), dst.path(), &["drop.json".to_string()], true).unwrap();

        assert!(dst.path().join("keep.txt").exists());
        assert!(dst.path().join("sub/deep.txt").exists());
        assert!(!dst.path().join("drop.json").exists());
    }
}
