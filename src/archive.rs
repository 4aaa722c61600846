//! Archive Extractor: safely unpacks a zip archive into a destination
//! directory, rejecting path traversal ("zip-slip"), symlinks, and device
//! nodes. Leaves no partial state behind on failure -- the caller (the
//! deployment pipeline) is responsible for removing `destination` itself.

use std::fs;
use std::io::{Cursor, Read};
use std::path::{Component, Path, PathBuf};

use crate::error::{Result, SupervisorError};

/// Unix permission bits that mark a symlink in a zip entry's external
/// attributes (the high 16 bits are a `st_mode` value when the archive
/// was produced on a Unix host).
const S_IFLNK: u32 = 0o120000;
const S_IFMT: u32 = 0o170000;
const S_IFREG: u32 = 0o100000;
const S_IFDIR: u32 = 0o040000;

pub fn extract(archive_bytes: &[u8], destination: &Path) -> Result<()> {
    let reader = Cursor::new(archive_bytes);
    let mut zip = zip::ZipArchive::new(reader)
        .map_err(|e| SupervisorError::ExtractionFailed(e.to_string()))?;

    for i in 0..zip.len() {
        let mut entry = zip
            .by_index(i)
            .map_err(|e| SupervisorError::ExtractionFailed(e.to_string()))?;

        let Some(relative) = entry.enclosed_name().map(Path::to_path_buf) else {
            return Err(SupervisorError::UnsafeArchivePath(entry.name().to_string()));
        };

        let resolved = resolve_within(destination, &relative)?;

        if is_unsafe_entry_kind(&entry) {
            return Err(SupervisorError::UnsafeArchivePath(entry.name().to_string()));
        }

        if entry.is_dir() {
            fs::create_dir_all(&resolved)
                .map_err(|e| SupervisorError::ExtractionFailed(e.to_string()))?;
            continue;
        }

        if let Some(parent) = resolved.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| SupervisorError::ExtractionFailed(e.to_string()))?;
        }

        let mut buf = Vec::with_capacity(entry.size() as usize);
        entry
            .read_to_end(&mut buf)
            .map_err(|e| SupervisorError::ExtractionFailed(e.to_string()))?;
        fs::write(&resolved, buf).map_err(|e| SupervisorError::ExtractionFailed(e.to_string()))?;
    }

    purge_node_modules(destination);

    Ok(())
}

/// Resolves `relative` against `destination` and verifies the result is
/// equal to `destination` or nested under it, per the invariant in §4.2.
/// `enclosed_name()` has already rejected absolute paths and leading `..`
/// components; this is a second, explicit check on the joined path so the
/// invariant holds even if that assumption ever changes upstream.
fn resolve_within(destination: &Path, relative: &Path) -> Result<PathBuf> {
    if relative
        .components()
        .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_) | Component::RootDir))
    {
        return Err(SupervisorError::UnsafeArchivePath(
            relative.display().to_string(),
        ));
    }

    let joined = destination.join(relative);

    if joined != destination && !joined.starts_with(destination) {
        return Err(SupervisorError::UnsafeArchivePath(
            relative.display().to_string(),
        ));
    }

    Ok(joined)
}

fn is_unsafe_entry_kind<R>(entry: &zip::read::ZipFile<R>) -> bool {
    let Some(mode) = entry.unix_mode() else {
        return false;
    };

    match mode & S_IFMT {
        S_IFLNK => true,
        S_IFREG | S_IFDIR | 0 => false,
        _ => true, // device nodes, fifos, sockets
    }
}

/// Deletes any `node_modules` directory left over from the archive so that
/// dependency install (§4.9 step 4) starts clean.
fn purge_node_modules(root: &Path) {
    for entry in walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_dir() && e.file_name() == "node_modules")
    {
        let _ = fs::remove_dir_all(entry.path());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::FileOptions;

    fn build_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let mut writer = zip::ZipWriter::new(Cursor::new(&mut buf));
            for (name, contents) in entries {
                writer
                    .start_file(*name, FileOptions::default())
                    .expect("start_file");
                writer.write_all(contents).expect("write contents");
            }
            writer.finish().expect("finish zip");
        }
        buf
    }

    #[test]
    fn extracts_regular_files_and_directories() {
        let dir = tempfile::tempdir().expect("tempdir");
        let zip_bytes = build_zip(&[
            ("index.html", b"<html></html>"),
            ("assets/app.js", b"console.log(1)"),
        ]);

        extract(&zip_bytes, dir.path()).expect("extraction should succeed");

        assert_eq!(
            fs::read_to_string(dir.path().join("index.html")).unwrap(),
            "<html></html>"
        );
        assert_eq!(
            fs::read_to_string(dir.path().join("assets/app.js")).unwrap(),
            "console.log(1)"
        );
    }

    #[test]
    fn rejects_path_traversal_entries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let zip_bytes = build_zip(&[("../../../../etc/evil", b"pwned")]);

        let result = extract(&zip_bytes, dir.path());
        assert!(matches!(result, Err(SupervisorError::UnsafeArchivePath(_))));
    }

    #[test]
    fn purges_node_modules_after_extraction() {
        let dir = tempfile::tempdir().expect("tempdir");
        let zip_bytes = build_zip(&[
            ("package.json", b"{}"),
            ("node_modules/left-pad/index.js", b"module.exports = {}"),
        ]);

        extract(&zip_bytes, dir.path()).expect("extraction should succeed");

        assert!(!dir.path().join("node_modules").exists());
        assert!(dir.path().join("package.json").exists());
    }
}
