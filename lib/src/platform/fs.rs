//! The `Fs` capability: every file operation in the engine goes through
//! here so it can be replayed against an in-memory overlay in tests.

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use std::fmt::Debug;
use std::io::{Read, Write};

/// A trimmed-down `stat(2)` result; enough for the engine's own
/// decisions (is it a directory, a symlink, how big, what mode).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Metadata {
    pub(crate) is_dir: bool,
    pub(crate) is_symlink: bool,
    pub(crate) len: u64,
    pub(crate) mode: u32,
}

/// A minimal filesystem capability. `raw_path` returns the
/// host-absolute path backing a virtual path: identity for the
/// production implementation, a test-root prefix for the in-memory one
/// — so code that needs to hand a path to an external command (which
/// can't see the virtual filesystem) must go through it rather than
/// concatenating strings itself.
pub(crate) trait Fs: Debug {
    fn create(&self, path: &Utf8Path) -> Result<Box<dyn Write>>;
    fn open(&self, path: &Utf8Path) -> Result<Box<dyn Read>>;
    fn mkdir(&self, path: &Utf8Path) -> Result<()>;
    fn mkdir_all(&self, path: &Utf8Path) -> Result<()>;
    fn stat(&self, path: &Utf8Path) -> Result<Metadata>;
    fn lstat(&self, path: &Utf8Path) -> Result<Metadata>;
    fn read_link(&self, path: &Utf8Path) -> Result<Utf8PathBuf>;
    fn symlink(&self, original: &Utf8Path, link: &Utf8Path) -> Result<()>;
    fn link(&self, original: &Utf8Path, link: &Utf8Path) -> Result<()>;
    fn remove(&self, path: &Utf8Path) -> Result<()>;
    fn remove_all(&self, path: &Utf8Path) -> Result<()>;
    fn rename(&self, from: &Utf8Path, to: &Utf8Path) -> Result<()>;
    fn read_dir(&self, path: &Utf8Path) -> Result<Vec<Utf8PathBuf>>;
    fn chmod(&self, path: &Utf8Path, mode: u32) -> Result<()>;
    fn raw_path(&self, path: &Utf8Path) -> Utf8PathBuf;

    /// Convenience: write `data` to `path`, creating it if necessary.
    fn write_bytes(&self, path: &Utf8Path, data: &[u8]) -> Result<()> {
        let mut f = self.create(path)?;
        f.write_all(data)?;
        Ok(())
    }

    /// Convenience: read all of `path` into memory.
    fn read_to_vec(&self, path: &Utf8Path) -> Result<Vec<u8>> {
        let mut f = self.open(path)?;
        let mut buf = Vec::new();
        f.read_to_end(&mut buf)?;
        Ok(buf)
    }
}

/// The production implementation: thin wrappers over `std::fs`.
#[derive(Debug, Default)]
pub(crate) struct ProdFs;

impl Fs for ProdFs {
    fn create(&self, path: &Utf8Path) -> Result<Box<dyn Write>> {
        Ok(Box::new(
            std::fs::File::create(path).with_context(|| format!("creating {path}"))?,
        ))
    }

    fn open(&self, path: &Utf8Path) -> Result<Box<dyn Read>> {
        Ok(Box::new(
            std::fs::File::open(path).with_context(|| format!("opening {path}"))?,
        ))
    }

    fn mkdir(&self, path: &Utf8Path) -> Result<()> {
        std::fs::create_dir(path).with_context(|| format!("creating directory {path}"))
    }

    fn mkdir_all(&self, path: &Utf8Path) -> Result<()> {
        std::fs::create_dir_all(path).with_context(|| format!("creating directory {path}"))
    }

    fn stat(&self, path: &Utf8Path) -> Result<Metadata> {
        let m = std::fs::metadata(path).with_context(|| format!("stat {path}"))?;
        Ok(to_metadata(&m))
    }

    fn lstat(&self, path: &Utf8Path) -> Result<Metadata> {
        let m = std::fs::symlink_metadata(path).with_context(|| format!("lstat {path}"))?;
        Ok(to_metadata(&m))
    }

    fn read_link(&self, path: &Utf8Path) -> Result<Utf8PathBuf> {
        let target = std::fs::read_link(path).with_context(|| format!("reading link {path}"))?;
        Utf8PathBuf::try_from(target).context("non-utf8 symlink target")
    }

    fn symlink(&self, original: &Utf8Path, link: &Utf8Path) -> Result<()> {
        std::os::unix::fs::symlink(original, link)
            .with_context(|| format!("symlinking {link} -> {original}"))
    }

    fn link(&self, original: &Utf8Path, link: &Utf8Path) -> Result<()> {
        std::fs::hard_link(original, link).with_context(|| format!("hardlinking {link} -> {original}"))
    }

    fn remove(&self, path: &Utf8Path) -> Result<()> {
        std::fs::remove_file(path).with_context(|| format!("removing {path}"))
    }

    fn remove_all(&self, path: &Utf8Path) -> Result<()> {
        std::fs::remove_dir_all(path).with_context(|| format!("removing {path}"))
    }

    fn rename(&self, from: &Utf8Path, to: &Utf8Path) -> Result<()> {
        std::fs::rename(from, to).with_context(|| format!("renaming {from} to {to}"))
    }

    fn read_dir(&self, path: &Utf8Path) -> Result<Vec<Utf8PathBuf>> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(path).with_context(|| format!("reading directory {path}"))? {
            let entry = entry?;
            out.push(Utf8PathBuf::try_from(entry.path()).context("non-utf8 directory entry")?);
        }
        Ok(out)
    }

    fn chmod(&self, path: &Utf8Path, mode: u32) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
            .with_context(|| format!("chmod {path}"))
    }

    fn raw_path(&self, path: &Utf8Path) -> Utf8PathBuf {
        path.to_owned()
    }
}

fn to_metadata(m: &std::fs::Metadata) -> Metadata {
    use std::os::unix::fs::PermissionsExt;
    Metadata {
        is_dir: m.is_dir(),
        is_symlink: m.is_symlink(),
        len: m.len(),
        mode: m.permissions().mode(),
    }
}

#[cfg(test)]
mod test_fs {
    use super::*;
    use std::cell::RefCell;
    use std::collections::BTreeMap;

    #[derive(Debug, Clone)]
    enum Entry {
        File(Vec<u8>),
        Dir,
        Symlink(Utf8PathBuf),
    }

    /// An in-memory filesystem fake rooted under a synthetic prefix, so
    /// `raw_path` demonstrably differs from the virtual path and code
    /// that blindly concatenates host-absolute strings breaks loudly in
    /// tests instead of silently working by accident.
    #[derive(Debug)]
    pub(crate) struct TestFs {
        entries: std::rc::Rc<RefCell<BTreeMap<Utf8PathBuf, Entry>>>,
    }

    impl Default for TestFs {
        fn default() -> Self {
            let mut entries = BTreeMap::new();
            entries.insert(Utf8PathBuf::from("/"), Entry::Dir);
            Self {
                entries: std::rc::Rc::new(RefCell::new(entries)),
            }
        }
    }

    const TEST_ROOT: &str = "/test-root";

    impl Fs for TestFs {
        fn create(&self, path: &Utf8Path) -> Result<Box<dyn Write>> {
            self.entries
                .borrow_mut()
                .insert(path.to_owned(), Entry::File(Vec::new()));
            Ok(Box::new(TestFileWriter {
                entries: self.entries.clone(),
                path: path.to_owned(),
            }))
        }

        fn open(&self, path: &Utf8Path) -> Result<Box<dyn Read>> {
            let entries = self.entries.borrow();
            match entries.get(path) {
                Some(Entry::File(data)) => Ok(Box::new(std::io::Cursor::new(data.clone()))),
                _ => anyhow::bail!("no such file {path}"),
            }
        }

        fn mkdir(&self, path: &Utf8Path) -> Result<()> {
            self.entries.borrow_mut().insert(path.to_owned(), Entry::Dir);
            Ok(())
        }

        fn mkdir_all(&self, path: &Utf8Path) -> Result<()> {
            let mut cur = Utf8PathBuf::new();
            for component in path.components() {
                cur.push(component);
                self.entries
                    .borrow_mut()
                    .entry(cur.clone())
                    .or_insert(Entry::Dir);
            }
            Ok(())
        }

        fn stat(&self, path: &Utf8Path) -> Result<Metadata> {
            self.lstat(path)
        }

        fn lstat(&self, path: &Utf8Path) -> Result<Metadata> {
            let entries = self.entries.borrow();
            match entries.get(path) {
                Some(Entry::File(data)) => Ok(Metadata {
                    is_dir: false,
                    is_symlink: false,
                    len: data.len() as u64,
                    mode: 0o644,
                }),
                Some(Entry::Dir) => Ok(Metadata {
                    is_dir: true,
                    is_symlink: false,
                    len: 0,
                    mode: 0o755,
                }),
                Some(Entry::Symlink(_)) => Ok(Metadata {
                    is_dir: false,
                    is_symlink: true,
                    len: 0,
                    mode: 0o777,
                }),
                None => anyhow::bail!("no such path {path}"),
            }
        }

        fn read_link(&self, path: &Utf8Path) -> Result<Utf8PathBuf> {
            match self.entries.borrow().get(path) {
                Some(Entry::Symlink(target)) => Ok(target.clone()),
                _ => anyhow::bail!("not a symlink: {path}"),
            }
        }

        fn symlink(&self, original: &Utf8Path, link: &Utf8Path) -> Result<()> {
            self.entries
                .borrow_mut()
                .insert(link.to_owned(), Entry::Symlink(original.to_owned()));
            Ok(())
        }

        fn link(&self, original: &Utf8Path, link: &Utf8Path) -> Result<()> {
            let data = match self.entries.borrow().get(original) {
                Some(Entry::File(data)) => data.clone(),
                _ => anyhow::bail!("not a file: {original}"),
            };
            self.entries.borrow_mut().insert(link.to_owned(), Entry::File(data));
            Ok(())
        }

        fn remove(&self, path: &Utf8Path) -> Result<()> {
            self.entries
                .borrow_mut()
                .remove(path)
                .map(|_| ())
                .ok_or_else(|| anyhow::anyhow!("no such path {path}"))
        }

        fn remove_all(&self, path: &Utf8Path) -> Result<()> {
            self.entries.borrow_mut().retain(|k, _| !k.starts_with(path));
            Ok(())
        }

        fn rename(&self, from: &Utf8Path, to: &Utf8Path) -> Result<()> {
            let mut entries = self.entries.borrow_mut();
            let entry = entries
                .remove(from)
                .ok_or_else(|| anyhow::anyhow!("no such path {from}"))?;
            entries.insert(to.to_owned(), entry);
            Ok(())
        }

        fn read_dir(&self, path: &Utf8Path) -> Result<Vec<Utf8PathBuf>> {
            let entries = self.entries.borrow();
            Ok(entries
                .keys()
                .filter(|k| k.parent() == Some(path))
                .cloned()
                .collect())
        }

        fn chmod(&self, _path: &Utf8Path, _mode: u32) -> Result<()> {
            Ok(())
        }

        fn raw_path(&self, path: &Utf8Path) -> Utf8PathBuf {
            Utf8PathBuf::from(TEST_ROOT).join(path.as_str().trim_start_matches('/'))
        }
    }

    struct TestFileWriter {
        entries: std::rc::Rc<RefCell<BTreeMap<Utf8PathBuf, Entry>>>,
        path: Utf8PathBuf,
    }

    impl Write for TestFileWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            let mut entries = self.entries.borrow_mut();
            if let Some(Entry::File(data)) = entries.get_mut(&self.path) {
                data.extend_from_slice(buf);
            }
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_write_then_read() {
        let fs = TestFs::default();
        fs.write_bytes(Utf8Path::new("/a/b"), b"hello").unwrap();
        assert_eq!(fs.read_to_vec(Utf8Path::new("/a/b")).unwrap(), b"hello");
    }

    #[test]
    fn test_raw_path_differs_from_virtual_path() {
        let fs = TestFs::default();
        let raw = fs.raw_path(Utf8Path::new("/etc/foo"));
        assert_ne!(raw.as_str(), "/etc/foo");
        assert!(raw.as_str().starts_with(TEST_ROOT));
    }
}

#[cfg(test)]
pub(crate) use test_fs::TestFs;
