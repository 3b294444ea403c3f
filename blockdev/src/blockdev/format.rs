//! `mkfs.*` invocation and filesystem growth after a partition resize.

use super::{uuid as uuidmod, FsKind, Runner};
use anyhow::Result;
use camino::Utf8Path;
use fn_error_context::context;

/// Format `device` as `fs`, labeling it `label` and stamping `uuid`
/// (validated/canonicalised first so later mount-by-UUID matches).
#[context("Creating {fs} filesystem on {device}")]
pub fn mkfs(runner: &dyn Runner, device: &Utf8Path, fs: FsKind, label: &str, uuid: &str) -> Result<String> {
    let uuid = uuidmod::validate_uuid(fs, uuid)?;
    let program = format!("mkfs.{}", fs.mkfs_suffix());
    let mut args: Vec<String> = Vec::new();
    match fs {
        FsKind::Vfat => {
            args.push("-n".into());
            args.push(label.into());
            if !uuid.is_empty() {
                args.push("-i".into());
                args.push(uuid.replace('-', ""));
            }
        }
        FsKind::Ext2 | FsKind::Ext4 => {
            args.push("-L".into());
            args.push(label.into());
            if !uuid.is_empty() {
                args.push("-U".into());
                args.push(uuid.clone());
            }
        }
        FsKind::Xfs => {
            args.push("-L".into());
            args.push(label.into());
            if !uuid.is_empty() {
                args.push("-m".into());
                args.push(format!("uuid={uuid}"));
            }
        }
        FsKind::Btrfs => {
            args.push("-L".into());
            args.push(label.into());
            if !uuid.is_empty() {
                args.push("-U".into());
                args.push(uuid.clone());
            }
        }
    }
    args.push(device.as_str().to_string());
    let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
    runner.run(
        &format!("Creating {fs} filesystem on {device}"),
        &program,
        &arg_refs,
    )?;
    Ok(uuid)
}

/// Grow the filesystem on `device` to fill its (already-resized)
/// partition. ext2/ext4 are grown offline; XFS and btrfs must be
/// mounted, so the caller supplies a scratch mountpoint under
/// `mount_helper`.
pub fn expand_filesystem(
    runner: &dyn Runner,
    mounter: &dyn Mounter,
    device: &Utf8Path,
    fs: FsKind,
    scratch_mountpoint: &Utf8Path,
) -> Result<()> {
    match fs {
        FsKind::Ext2 | FsKind::Ext4 => {
            runner.run(
                &format!("Checking {device} before resize"),
                "e2fsck",
                &["-fy", device.as_str()],
            )?;
            runner.run(
                &format!("Growing {fs} filesystem on {device}"),
                "resize2fs",
                &[device.as_str()],
            )
        }
        FsKind::Xfs => {
            mounter.mount(runner, device, scratch_mountpoint)?;
            let result = runner.run(
                &format!("Growing xfs filesystem on {device}"),
                "xfs_growfs",
                &[scratch_mountpoint.as_str()],
            );
            mounter.unmount(runner, scratch_mountpoint)?;
            result
        }
        FsKind::Btrfs => {
            mounter.mount(runner, device, scratch_mountpoint)?;
            let result = runner.run(
                &format!("Growing btrfs filesystem on {device}"),
                "btrfs",
                &["filesystem", "resize", "max", scratch_mountpoint.as_str()],
            );
            mounter.unmount(runner, scratch_mountpoint)?;
            result
        }
        FsKind::Vfat => anyhow::bail!("VFAT filesystems cannot be grown in place"),
    }
}

/// The narrow mount/unmount slice `expand_filesystem` needs; a thin
/// adapter over the engine's `Mounter` capability.
pub trait Mounter: std::fmt::Debug {
    fn mount(&self, runner: &dyn Runner, device: &Utf8Path, target: &Utf8Path) -> Result<()>;
    fn unmount(&self, runner: &dyn Runner, target: &Utf8Path) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default)]
    struct RecordingRunner {
        calls: std::cell::RefCell<Vec<(String, Vec<String>)>>,
    }
    impl Runner for RecordingRunner {
        fn run_capture(&self, _d: &str, cmd: &str, args: &[&str]) -> Result<Vec<u8>> {
            self.calls
                .borrow_mut()
                .push((cmd.to_string(), args.iter().map(|s| s.to_string()).collect()));
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_mkfs_vfat_strips_dash_from_uuid() {
        let runner = RecordingRunner::default();
        let uuid = mkfs(&runner, Utf8Path::new("/dev/fake1"), FsKind::Vfat, "efi", "ABCD-1234").unwrap();
        assert_eq!(uuid, "ABCD-1234");
        let calls = runner.calls.borrow();
        let (program, args) = &calls[0];
        assert_eq!(program, "mkfs.vfat");
        assert!(args.contains(&"ABCD1234".to_string()));
    }

    #[test]
    fn test_mkfs_ext4_passes_uuid_through() {
        let runner = RecordingRunner::default();
        let input = "4f3f6a1e-2b7a-4e3d-9c9c-9a9a9a9a9a9a";
        let uuid = mkfs(&runner, Utf8Path::new("/dev/fake2"), FsKind::Ext4, "system", input).unwrap();
        assert_eq!(uuid, input);
    }
}
