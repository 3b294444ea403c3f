//! The `Mounter` capability, with the semantics of Linux `mount(8)`:
//! mount/unmount plus the read-only queries the deployment engine
//! needs to decide whether a path is already a mountpoint before it
//! binds something else over it.

use std::fmt::Debug;

use anyhow::{anyhow, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;

use super::Runner;

/// One `findmnt` record.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct MountInfo {
    pub(crate) source: String,
    pub(crate) target: String,
    pub(crate) fstype: String,
    pub(crate) options: String,
}

#[derive(Debug, Deserialize)]
struct Findmnt {
    filesystems: Vec<MountInfo>,
}

pub(crate) trait Mounter: Debug {
    fn mount(&self, runner: &dyn Runner, device: &str, target: &Utf8Path) -> Result<()>;
    fn unmount(&self, runner: &dyn Runner, target: &Utf8Path) -> Result<()>;
    fn is_mount_point(&self, runner: &dyn Runner, path: &Utf8Path) -> Result<bool>;
    /// Every process' reference to `target` (bind mounts of it elsewhere).
    fn get_mount_refs(&self, runner: &dyn Runner, target: &Utf8Path) -> Result<Vec<Utf8PathBuf>>;
    fn get_mount_points(&self, runner: &dyn Runner) -> Result<Vec<MountInfo>>;
    /// A single mountpoint's record, if mounted.
    fn list(&self, runner: &dyn Runner, path: &Utf8Path) -> Result<Option<MountInfo>>;
}

fn findmnt(runner: &dyn Runner, args: &[&str]) -> Result<Vec<MountInfo>> {
    let mut full_args = vec!["-J", "--output=SOURCE,TARGET,FSTYPE,OPTIONS"];
    full_args.extend_from_slice(args);
    let out = runner.run("Inspecting mounts", "findmnt", &full_args);
    let out = match out {
        Ok(out) => out,
        // findmnt exits nonzero when nothing matches; that's not an error here.
        Err(_) => return Ok(Vec::new()),
    };
    let parsed: Findmnt = serde_json::from_slice(&out).context("parsing findmnt output")?;
    Ok(parsed.filesystems)
}

#[derive(Debug, Default)]
pub(crate) struct ProdMounter;

impl Mounter for ProdMounter {
    fn mount(&self, runner: &dyn Runner, device: &str, target: &Utf8Path) -> Result<()> {
        runner.run_quiet(
            &format!("Mounting {device} at {target}"),
            "mount",
            &[device, target.as_str()],
        )
    }

    fn unmount(&self, runner: &dyn Runner, target: &Utf8Path) -> Result<()> {
        runner.run_quiet(&format!("Unmounting {target}"), "umount", &[target.as_str()])
    }

    fn is_mount_point(&self, runner: &dyn Runner, path: &Utf8Path) -> Result<bool> {
        Ok(!findmnt(runner, &[path.as_str()])?.is_empty())
    }

    fn get_mount_refs(&self, runner: &dyn Runner, target: &Utf8Path) -> Result<Vec<Utf8PathBuf>> {
        let entries = findmnt(runner, &["--source", target.as_str()])?;
        Ok(entries.into_iter().map(|e| Utf8PathBuf::from(e.target)).collect())
    }

    fn get_mount_points(&self, runner: &dyn Runner) -> Result<Vec<MountInfo>> {
        findmnt(runner, &[])
    }

    fn list(&self, runner: &dyn Runner, path: &Utf8Path) -> Result<Option<MountInfo>> {
        Ok(findmnt(runner, &[path.as_str()])?.into_iter().next())
    }
}

impl slate_blockdev::Mounter for ProdMounter {
    fn mount(&self, runner: &dyn slate_blockdev::Runner, device: &Utf8Path, target: &Utf8Path) -> Result<()> {
        let wrapped = RunnerBridge(runner);
        Mounter::mount(self, &wrapped, device.as_str(), target)
    }

    fn unmount(&self, runner: &dyn slate_blockdev::Runner, target: &Utf8Path) -> Result<()> {
        let wrapped = RunnerBridge(runner);
        Mounter::unmount(self, &wrapped, target)
    }
}

/// `slate-blockdev` only knows its own narrow `Runner`; this adapts it
/// back to the engine-level trait so [`ProdMounter`]'s single
/// implementation can serve both callers.
struct RunnerBridge<'a>(&'a dyn slate_blockdev::Runner);

impl Debug for RunnerBridge<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("RunnerBridge").finish()
    }
}

impl Runner for RunnerBridge<'_> {
    fn run(&self, description: &str, cmd: &str, args: &[&str]) -> Result<Vec<u8>> {
        self.0.run_capture(description, cmd, args)
    }

    fn run_with_env(
        &self,
        description: &str,
        cmd: &str,
        args: &[&str],
        _env: &[(&str, &str)],
    ) -> Result<Vec<u8>> {
        self.0.run_capture(description, cmd, args)
    }
}

#[cfg(test)]
pub(crate) mod test_mounter {
    use super::*;
    use std::cell::RefCell;
    use std::collections::BTreeSet;

    #[derive(Debug, Default)]
    pub(crate) struct TestMounter {
        mounted: RefCell<BTreeSet<Utf8PathBuf>>,
    }

    impl Mounter for TestMounter {
        fn mount(&self, _runner: &dyn Runner, _device: &str, target: &Utf8Path) -> Result<()> {
            self.mounted.borrow_mut().insert(target.to_owned());
            Ok(())
        }

        fn unmount(&self, _runner: &dyn Runner, target: &Utf8Path) -> Result<()> {
            if !self.mounted.borrow_mut().remove(target) {
                return Err(anyhow!("{target} is not mounted"));
            }
            Ok(())
        }

        fn is_mount_point(&self, _runner: &dyn Runner, path: &Utf8Path) -> Result<bool> {
            Ok(self.mounted.borrow().contains(path))
        }

        fn get_mount_refs(&self, _runner: &dyn Runner, _target: &Utf8Path) -> Result<Vec<Utf8PathBuf>> {
            Ok(Vec::new())
        }

        fn get_mount_points(&self, _runner: &dyn Runner) -> Result<Vec<MountInfo>> {
            Ok(Vec::new())
        }

        fn list(&self, _runner: &dyn Runner, _path: &Utf8Path) -> Result<Option<MountInfo>> {
            Ok(None)
        }
    }

    #[test]
    fn test_mount_then_unmount() {
        let m = TestMounter::default();
        let target = Utf8PathBuf::from("/mnt/x");
        let runner = super::super::TestRunner::default();
        m.mount(&runner, "/dev/fake", &target).unwrap();
        assert!(m.is_mount_point(&runner, &target).unwrap());
        m.unmount(&runner, &target).unwrap();
        assert!(!m.is_mount_point(&runner, &target).unwrap());
    }

    #[test]
    fn test_unmount_without_mount_fails() {
        let m = TestMounter::default();
        let runner = super::super::TestRunner::default();
        assert!(m.unmount(&runner, Utf8Path::new("/mnt/never")).is_err());
    }
}

#[cfg(test)]
pub(crate) use test_mounter::TestMounter;
