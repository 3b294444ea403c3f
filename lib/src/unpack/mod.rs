//! Materialise bytes from an image source onto a destination
//! directory. Polymorphic over the source variant ([`ImageSource`]);
//! a factory picks the concrete unpacker from the source's tag.

mod dir;
mod oci;
mod raw;
mod tar;

use std::io::Read;

use anyhow::{bail, Result};
use camino::Utf8Path;
use tokio_util::sync::CancellationToken;

use crate::deployment::ImageSource;
use crate::platform::System;

/// The common contract every concrete unpacker implements.
pub(crate) trait Unpacker {
    /// Materialise the source into `destination`, returning its
    /// content digest. `excludes` are glob-style patterns skipped
    /// during extraction/sync.
    fn unpack(
        &self,
        system: &System,
        destination: &Utf8Path,
        excludes: &[String],
        cancel: &CancellationToken,
    ) -> Result<String>;

    /// Like [`Unpacker::unpack`], but guarantees the destination tree
    /// is byte-identical to the source modulo `excludes`, deleting
    /// anything else found there except paths matching
    /// `delete_excludes`.
    fn synched_unpack(
        &self,
        system: &System,
        destination: &Utf8Path,
        excludes: &[String],
        delete_excludes: &[String],
        cancel: &CancellationToken,
    ) -> Result<String>;
}

/// Select the concrete unpacker for `source`'s tag, bound to its URI.
pub(crate) fn pick_unpacker(source: &ImageSource) -> Result<Box<dyn Unpacker>> {
    Ok(match source {
        ImageSource::Oci { uri, .. } => Box::new(oci::OciUnpacker { uri: uri.clone() }),
        ImageSource::Dir { uri, .. } => Box::new(dir::DirUnpacker { uri: uri.clone() }),
        ImageSource::Raw { uri, .. } => Box::new(raw::RawUnpacker { uri: uri.clone() }),
        ImageSource::Tar { uri, .. } => Box::new(tar::TarUnpacker { uri: uri.clone() }),
        ImageSource::Empty => bail!("cannot unpack an empty image source"),
    })
}

/// Reject a tar entry (or any other relative path drawn from
/// untrusted archive/registry content) whose cleaned form would
/// escape `destination` once joined to it. Returns the joined,
/// sanitised path on success.
pub(crate) fn sanitize_entry_path(
    destination: &Utf8Path,
    entry: &Utf8Path,
) -> Result<camino::Utf8PathBuf> {
    use camino::Utf8Component;

    let mut cleaned = camino::Utf8PathBuf::new();
    for component in entry.components() {
        match component {
            Utf8Component::Normal(part) => cleaned.push(part),
            Utf8Component::CurDir => {}
            Utf8Component::ParentDir => {
                if !cleaned.pop() {
                    bail!("archive entry {entry} escapes destination root via ..");
                }
            }
            Utf8Component::RootDir | Utf8Component::Prefix(_) => {
                bail!("archive entry {entry} has an absolute/rooted path");
            }
        }
    }
    Ok(destination.join(cleaned))
}

/// A minimal glob matcher supporting `*` (any run of characters,
/// including none) against a whole string; every other character is
/// matched literally. Used for extraction excludes and for matching
/// release-manifest filename candidates.
pub(crate) fn glob_match(pattern: &str, candidate: &str) -> bool {
    let parts: Vec<String> = pattern.split('*').map(regex::escape).collect();
    let re = format!("^{}$", parts.join(".*"));
    regex::Regex::new(&re).map(|re| re.is_match(candidate)).unwrap_or(false)
}

/// Whether any component of `path` glob-matches one of `excludes`,
/// mirroring `rsync --exclude`'s directory-exclude behaviour: a
/// pattern matching a directory component also skips everything
/// beneath it.
fn entry_excluded(path: &Utf8Path, excludes: &[String]) -> bool {
    excludes
        .iter()
        .any(|pattern| path.components().any(|c| glob_match(pattern, c.as_str())))
}

/// Stream-extract a tar archive into `destination`, sanitising every
/// entry path, skipping entries matching `excludes`, and deferring
/// symlinks/hardlinks to a second pass after all regular files and
/// directories exist. Every filesystem mutation goes through
/// `system.fs` so this is exercisable against the in-memory test
/// filesystem like every other unpack path.
pub(crate) fn extract_tar(
    system: &System,
    reader: impl Read,
    destination: &Utf8Path,
    excludes: &[String],
) -> Result<()> {
    system.fs.mkdir_all(destination)?;
    let mut archive = tar::Archive::new(reader);
    let mut deferred_links = Vec::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        let raw_path = entry.path()?.into_owned();
        let entry_path = camino::Utf8Path::from_path(&raw_path)
            .ok_or_else(|| anyhow::anyhow!("non-utf8 tar entry path"))?;
        if entry_excluded(entry_path, excludes) {
            continue;
        }
        let target = match sanitize_entry_path(destination, entry_path) {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!("skipping unsafe tar entry {entry_path}: {e:#}");
                continue;
            }
        };
        match entry.header().entry_type() {
            tar::EntryType::Directory => {
                system.fs.mkdir_all(&target)?;
            }
            tar::EntryType::Symlink | tar::EntryType::Link => {
                deferred_links.push((target, entry.link_name()?.map(|p| p.into_owned())));
            }
            _ => {
                if let Some(parent) = target.parent() {
                    system.fs.mkdir_all(parent)?;
                }
                let mut out = system.fs.create(&target)?;
                std::io::copy(&mut entry, &mut out)?;
                drop(out);
                system.fs.chmod(&target, entry.header().mode()?).ok();
            }
        }
    }
    for (target, link) in deferred_links {
        let Some(link) = link else { continue };
        let Ok(link) = camino::Utf8PathBuf::try_from(link) else { continue };
        if system.fs.lstat(&target).is_ok() {
            continue;
        }
        system.fs.symlink(&link, &target).ok();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::System;

    #[test]
    fn test_glob_match_supports_wildcard() {
        assert!(glob_match("release_manifest*.yaml", "release_manifest-v2.yaml"));
        assert!(!glob_match("release_manifest*.yaml", "release_manifest.yml"));
        assert!(glob_match("etc", "etc"));
        assert!(!glob_match("etc", "etcetera"));
    }

    #[test]
    fn test_extract_tar_skips_excluded_entries() {
        let system = System::test();
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(5);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, "etc/fstab", &b"hello"[..]).unwrap();
        let mut header2 = tar::Header::new_gnu();
        header2.set_size(4);
        header2.set_mode(0o644);
        header2.set_cksum();
        builder.append_data(&mut header2, "usr/bin/tool", &b"tool"[..]).unwrap();
        let bytes = builder.into_inner().unwrap();

        extract_tar(&system, std::io::Cursor::new(bytes), Utf8Path::new("/dest"), &["etc".to_string()]).unwrap();

        assert!(system.fs.stat(Utf8Path::new("/dest/usr/bin/tool")).is_ok());
        assert!(system.fs.stat(Utf8Path::new("/dest/etc/fstab")).is_err());
    }

    #[test]
    fn test_sanitize_rejects_parent_escape() {
        let dest = Utf8Path::new("/var/lib/slate/dest");
        assert!(sanitize_entry_path(dest, Utf8Path::new("../../etc/passwd")).is_err());
    }

    #[test]
    fn test_sanitize_rejects_absolute_entry() {
        let dest = Utf8Path::new("/var/lib/slate/dest");
        assert!(sanitize_entry_path(dest, Utf8Path::new("/etc/passwd")).is_err());
    }

    #[test]
    fn test_sanitize_accepts_normal_nested_path() {
        let dest = Utf8Path::new("/var/lib/slate/dest");
        let joined = sanitize_entry_path(dest, Utf8Path::new("usr/bin/ls")).unwrap();
        assert_eq!(joined, Utf8Path::new("/var/lib/slate/dest/usr/bin/ls"));
    }

    #[test]
    fn test_sanitize_allows_harmless_dotdot_that_stays_inside() {
        let dest = Utf8Path::new("/var/lib/slate/dest");
        let joined = sanitize_entry_path(dest, Utf8Path::new("a/../b")).unwrap();
        assert_eq!(joined, Utf8Path::new("/var/lib/slate/dest/b"));
    }
}
