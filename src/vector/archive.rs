//! Release archive extraction (zip, tar.gz).
//!
//! Every entry path is validated lexically before anything is written, so
//! an archive carrying a `../` entry fails without leaving partial output.
//! While writing, each output's parent is resolved through the symlinks
//! already on disk and must stay under the canonical destination; a chain
//! of links that climbs out is rejected at the first link that escapes.
//! These functions block; async callers wrap them in `spawn_blocking`.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use crate::error::{LifecycleError, LifecycleResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Zip,
    TarGz,
}

impl ArchiveKind {
    pub fn detect(path: &Path) -> LifecycleResult<Self> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        if name.ends_with(".zip") {
            Ok(ArchiveKind::Zip)
        } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Ok(ArchiveKind::TarGz)
        } else {
            Err(LifecycleError::UnsupportedArchive(name))
        }
    }
}

/// Join `entry` onto `dest`, rejecting absolute paths and any `..` that
/// climbs above `dest`.
pub fn safe_join(dest: &Path, entry: &Path) -> LifecycleResult<PathBuf> {
    let mut parts: Vec<&std::ffi::OsStr> = Vec::new();
    for component in entry.components() {
        match component {
            Component::Normal(part) => parts.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if parts.pop().is_none() {
                    return Err(LifecycleError::PathTraversal(entry.display().to_string()));
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(LifecycleError::PathTraversal(entry.display().to_string()));
            }
        }
    }
    let mut out = dest.to_path_buf();
    out.extend(parts);
    Ok(out)
}

fn traversal(entry: &Path) -> LifecycleError {
    LifecycleError::PathTraversal(entry.display().to_string())
}

/// Validate a symlink target relative to the link's own directory.
fn check_link_target(dest: &Path, link_entry: &Path, target: &Path) -> LifecycleResult<()> {
    let parent = link_entry.parent().unwrap_or(Path::new(""));
    safe_join(dest, &parent.join(target)).map(|_| ())
}

/// Create the parent directory of `out` and return it resolved.
///
/// The nearest ancestor already on disk is canonicalized first, so a
/// symlink written by an earlier entry cannot redirect the new directories
/// outside `root`. `root` must itself be canonical.
fn prepare_parent(root: &Path, out: &Path, entry: &Path) -> LifecycleResult<PathBuf> {
    let parent = out.parent().ok_or_else(|| traversal(entry))?;
    let existing = parent
        .ancestors()
        .find(|a| fs::symlink_metadata(a).is_ok())
        .ok_or_else(|| traversal(entry))?;
    if !existing.canonicalize()?.starts_with(root) {
        return Err(traversal(entry));
    }
    fs::create_dir_all(parent)?;
    let resolved = parent.canonicalize()?;
    if !resolved.starts_with(root) {
        return Err(traversal(entry));
    }
    Ok(resolved)
}

/// Regular files are never written through a link left by an earlier entry.
fn refuse_existing_link(out: &Path, entry: &Path) -> LifecycleResult<()> {
    match fs::symlink_metadata(out) {
        Ok(meta) if meta.file_type().is_symlink() => Err(traversal(entry)),
        _ => Ok(()),
    }
}

/// Resolve a link target against the link's real directory; it must stay under `root`.
fn check_resolved_link(
    root: &Path,
    real_parent: &Path,
    target: &Path,
    entry: &Path,
) -> LifecycleResult<()> {
    let relative = real_parent.strip_prefix(root).map_err(|_| traversal(entry))?;
    safe_join(root, &relative.join(target))
        .map(|_| ())
        .map_err(|_| traversal(entry))
}

pub fn extract(archive: &Path, dest: &Path) -> LifecycleResult<()> {
    fs::create_dir_all(dest)?;
    let root = dest.canonicalize()?;
    match ArchiveKind::detect(archive)? {
        ArchiveKind::Zip => extract_zip(archive, &root),
        ArchiveKind::TarGz => extract_tar_gz(archive, &root),
    }
}

// ============ zip ============

const S_IFMT: u32 = 0o170000;
const S_IFLNK: u32 = 0o120000;

fn extract_zip(archive_path: &Path, dest: &Path) -> LifecycleResult<()> {
    let mut archive = zip::ZipArchive::new(fs::File::open(archive_path)?)?;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let name = PathBuf::from(entry.name());
        safe_join(dest, &name)?;
        let is_link = entry.unix_mode().is_some_and(|m| m & S_IFMT == S_IFLNK);
        if is_link {
            let mut target = String::new();
            io::Read::read_to_string(&mut entry, &mut target)?;
            check_link_target(dest, &name, Path::new(&target))?;
        }
    }

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let name = PathBuf::from(entry.name());
        let out = safe_join(dest, &name)?;
        let mode = entry.unix_mode();

        if entry.is_dir() {
            prepare_parent(dest, &out, &name)?;
            fs::create_dir_all(&out)?;
            continue;
        }
        let real_parent = prepare_parent(dest, &out, &name)?;
        refuse_existing_link(&out, &name)?;

        if mode.is_some_and(|m| m & S_IFMT == S_IFLNK) {
            let mut target = String::new();
            io::Read::read_to_string(&mut entry, &mut target)?;
            check_resolved_link(dest, &real_parent, Path::new(&target), &name)?;
            make_symlink(Path::new(&target), &out);
            continue;
        }

        let mut file = fs::File::create(&out)?;
        io::copy(&mut entry, &mut file)?;
        if let Some(mode) = mode {
            set_mode(&out, mode)?;
        }
    }
    Ok(())
}

// ============ tar.gz ============

fn open_tar(path: &Path) -> LifecycleResult<tar::Archive<flate2::read::GzDecoder<fs::File>>> {
    Ok(tar::Archive::new(flate2::read::GzDecoder::new(
        fs::File::open(path)?,
    )))
}

fn extract_tar_gz(archive_path: &Path, dest: &Path) -> LifecycleResult<()> {
    let mut archive = open_tar(archive_path)?;
    for entry in archive.entries()? {
        let entry = entry?;
        let name = entry.path()?.into_owned();
        safe_join(dest, &name)?;
        if entry.header().entry_type().is_symlink() {
            if let Some(target) = entry.link_name()? {
                check_link_target(dest, &name, &target)?;
            }
        }
    }

    let mut archive = open_tar(archive_path)?;
    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = entry.path()?.into_owned();
        let out = safe_join(dest, &name)?;
        let kind = entry.header().entry_type();

        if kind.is_dir() {
            prepare_parent(dest, &out, &name)?;
            fs::create_dir_all(&out)?;
            continue;
        }
        let real_parent = prepare_parent(dest, &out, &name)?;
        refuse_existing_link(&out, &name)?;

        if kind.is_symlink() {
            if let Some(target) = entry.link_name()? {
                check_resolved_link(dest, &real_parent, &target, &name)?;
                make_symlink(&target, &out);
            }
        } else if kind.is_file() {
            let mode = entry.header().mode().ok();
            let mut file = fs::File::create(&out)?;
            io::copy(&mut entry, &mut file)?;
            if let Some(mode) = mode {
                set_mode(&out, mode)?;
            }
        } else {
            tracing::debug!(entry = %name.display(), "skipping unsupported tar entry");
        }
    }
    Ok(())
}

// ============ helpers ============

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let perms = mode & 0o7777;
    if perms == 0 {
        return Ok(());
    }
    fs::set_permissions(path, fs::Permissions::from_mode(perms))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

fn make_symlink(target: &Path, link: &Path) {
    #[cfg(unix)]
    let result = std::os::unix::fs::symlink(target, link);
    #[cfg(not(unix))]
    let result: io::Result<()> = Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "symlinks not supported",
    ));

    if let Err(e) = result {
        tracing::warn!(link = %link.display(), error = %e, "failed to create symlink");
    }
}

/// First regular file named `name` anywhere under `root`.
pub fn find_file(root: &Path, name: &str) -> Option<PathBuf> {
    walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .find(|e| e.file_type().is_file() && e.file_name() == name)
        .map(|e| e.into_path())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let file = fs::File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default().unix_permissions(0o755);
        for (name, body) in entries {
            zip.start_file(*name, options).unwrap();
            zip.write_all(body).unwrap();
        }
        zip.finish().unwrap();
    }

    fn write_tar_gz(path: &Path, entries: &[(&str, &[u8])]) {
        let file = fs::File::create(path).unwrap();
        let gz = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(gz);
        for (name, body) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(body.len() as u64);
            header.set_mode(0o755);
            header.set_entry_type(tar::EntryType::Regular);
            // set_path rejects `..`, so write the raw name bytes.
            let raw = &mut header.as_old_mut().name;
            raw[..name.len()].copy_from_slice(name.as_bytes());
            header.set_cksum();
            builder.append(&header, *body).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    fn write_tar_gz_with_links(path: &Path, links: &[(&str, &str)], files: &[(&str, &[u8])]) {
        let file = fs::File::create(path).unwrap();
        let gz = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(gz);
        for (name, target) in links {
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Symlink);
            header.set_size(0);
            header.set_mode(0o777);
            header.set_path(name).unwrap();
            header.set_link_name(target).unwrap();
            header.set_cksum();
            builder.append(&header, io::empty()).unwrap();
        }
        for (name, body) in files {
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(body.len() as u64);
            header.set_mode(0o644);
            header.set_path(name).unwrap();
            header.set_cksum();
            builder.append(&header, *body).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    #[test]
    fn safe_join_rejects_escapes() {
        let dest = Path::new("/out");
        assert_eq!(
            safe_join(dest, Path::new("a/./b")).unwrap(),
            PathBuf::from("/out/a/b")
        );
        assert_eq!(
            safe_join(dest, Path::new("a/../b")).unwrap(),
            PathBuf::from("/out/b")
        );
        assert!(safe_join(dest, Path::new("../../etc/evil")).is_err());
        assert!(safe_join(dest, Path::new("/etc/passwd")).is_err());
    }

    #[test]
    fn detects_kind_by_extension() {
        assert_eq!(
            ArchiveKind::detect(Path::new("q.tar.gz")).unwrap(),
            ArchiveKind::TarGz
        );
        assert_eq!(
            ArchiveKind::detect(Path::new("q.tgz")).unwrap(),
            ArchiveKind::TarGz
        );
        assert_eq!(
            ArchiveKind::detect(Path::new("Q.ZIP")).unwrap(),
            ArchiveKind::Zip
        );
        assert!(matches!(
            ArchiveKind::detect(Path::new("q.rar")),
            Err(LifecycleError::UnsupportedArchive(_))
        ));
    }

    #[test]
    fn extracts_zip_and_finds_binary() {
        let tmp = TempDir::new().unwrap();
        let archive = tmp.path().join("q.zip");
        write_zip(&archive, &[("dist/qdrant", b"bin"), ("README", b"hi")]);
        let dest = tmp.path().join("out");
        extract(&archive, &dest).unwrap();
        let found = find_file(&dest, "qdrant").unwrap();
        assert_eq!(fs::read(&found).unwrap(), b"bin");
    }

    #[test]
    fn zip_traversal_writes_nothing() {
        let tmp = TempDir::new().unwrap();
        let archive = tmp.path().join("evil.zip");
        write_zip(&archive, &[("ok.txt", b"fine"), ("../../etc/evil", b"x")]);
        let dest = tmp.path().join("out");
        let err = extract(&archive, &dest).unwrap_err();
        assert!(matches!(err, LifecycleError::PathTraversal(_)));
        assert!(!dest.join("ok.txt").exists());
    }

    #[test]
    fn extracts_tar_gz_with_permissions() {
        let tmp = TempDir::new().unwrap();
        let archive = tmp.path().join("q.tar.gz");
        write_tar_gz(&archive, &[("qdrant", b"#!/bin/sh\n")]);
        let dest = tmp.path().join("out");
        extract(&archive, &dest).unwrap();
        assert!(dest.join("qdrant").is_file());
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(dest.join("qdrant")).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o755);
        }
    }

    #[test]
    fn tar_traversal_writes_nothing() {
        let tmp = TempDir::new().unwrap();
        let archive = tmp.path().join("evil.tar.gz");
        write_tar_gz(&archive, &[("first.txt", b"a"), ("../../etc/evil", b"x")]);
        let dest = tmp.path().join("out");
        let err = extract(&archive, &dest).unwrap_err();
        assert!(matches!(err, LifecycleError::PathTraversal(_)));
        assert!(!dest.join("first.txt").exists());
        assert!(!tmp.path().join("etc").exists());
    }

    #[cfg(unix)]
    #[test]
    fn tar_symlink_chain_cannot_escape() {
        let tmp = TempDir::new().unwrap();
        let archive = tmp.path().join("chain.tar.gz");
        write_tar_gz_with_links(
            &archive,
            &[("x/l", ".."), ("x/l/l2", "..")],
            &[("x/l/l2/evil", b"x")],
        );
        let dest = tmp.path().join("out");
        let err = extract(&archive, &dest).unwrap_err();
        assert!(matches!(err, LifecycleError::PathTraversal(_)));
        assert!(!tmp.path().join("evil").exists());
    }

    #[cfg(unix)]
    #[test]
    fn zip_symlink_chain_cannot_escape() {
        let tmp = TempDir::new().unwrap();
        let archive = tmp.path().join("chain.zip");
        {
            let file = fs::File::create(&archive).unwrap();
            let mut zip = zip::ZipWriter::new(file);
            let options = zip::write::SimpleFileOptions::default();
            zip.add_symlink("x/l", "..", options).unwrap();
            zip.add_symlink("x/l/l2", "..", options).unwrap();
            zip.start_file("x/l/l2/evil", options).unwrap();
            zip.write_all(b"x").unwrap();
            zip.finish().unwrap();
        }
        let dest = tmp.path().join("out");
        let err = extract(&archive, &dest).unwrap_err();
        assert!(matches!(err, LifecycleError::PathTraversal(_)));
        assert!(!tmp.path().join("evil").exists());
    }

    #[cfg(unix)]
    #[test]
    fn in_tree_symlink_is_kept() {
        let tmp = TempDir::new().unwrap();
        let archive = tmp.path().join("q.tar.gz");
        write_tar_gz_with_links(
            &archive,
            &[("qdrant", "bin/qdrant")],
            &[("bin/qdrant", b"bin")],
        );
        let dest = tmp.path().join("out");
        extract(&archive, &dest).unwrap();
        assert!(fs::symlink_metadata(dest.join("qdrant"))
            .unwrap()
            .file_type()
            .is_symlink());
        assert_eq!(fs::read(dest.join("qdrant")).unwrap(), b"bin");
    }
}
