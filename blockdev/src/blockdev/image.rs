//! Loop-backed raw disk image creation, used by the `build` path in
//! place of a physical target device.

use super::{FsKind, Runner};
use anyhow::Result;
use camino::Utf8Path;
use fn_error_context::context;

/// Create a file at `path` of `size_mib` mebibytes. Sparse unless
/// `dense`, in which case every block is actually allocated.
#[context("Creating image file {path}")]
pub fn create_empty_file(runner: &dyn Runner, path: &Utf8Path, size_mib: u64, dense: bool) -> Result<()> {
    let size_arg = format!("{size_mib}M");
    if dense {
        runner.run(
            &format!("Allocating {size_mib} MiB image {path}"),
            "qemu-img",
            &["create", "-f", "raw", path.as_str(), &size_arg],
        )
    } else {
        let file = std::fs::File::create(path)?;
        file.set_len(size_mib * 1024 * 1024)?;
        Ok(())
    }
}

/// Create a disk image at `destination` containing a filesystem of
/// kind `fs`, pre-populated from `source` and labeled `label`.
#[context("Creating preloaded {fs} image {destination}")]
pub fn create_preloaded_filesystem_image(
    runner: &dyn Runner,
    source: &Utf8Path,
    destination: &Utf8Path,
    label: &str,
    size_mib: u64,
    fs: FsKind,
) -> Result<()> {
    create_empty_file(runner, destination, size_mib, false)?;
    match fs {
        FsKind::Btrfs => runner.run(
            &format!("Populating btrfs image {destination}"),
            "mkfs.btrfs",
            &["-L", label, "--root-dir", source.as_str(), destination.as_str()],
        ),
        FsKind::Ext2 | FsKind::Ext4 => {
            let program = format!("mkfs.{}", fs.mkfs_suffix());
            runner.run(
                &format!("Populating {fs} image {destination}"),
                &program,
                &["-L", label, "-d", source.as_str(), destination.as_str()],
            )
        }
        FsKind::Vfat => {
            runner.run(
                &format!("Formatting vfat image {destination}"),
                "mkfs.vfat",
                &["-n", label, destination.as_str()],
            )?;
            runner.run(
                &format!("Populating vfat image {destination}"),
                "mcopy",
                &["-s", "-i", destination.as_str(), &format!("{source}/.", source = source), "::"],
            )
        }
        FsKind::Xfs => anyhow::bail!("xfs does not support direct preload; mount and copy instead"),
    }
}

/// Build a squashfs image at `destination` from `source` with the
/// given extra `mksquashfs` options (e.g. compression selection).
#[context("Creating squashfs image {destination}")]
pub fn create_squashfs(
    runner: &dyn Runner,
    source: &Utf8Path,
    destination: &Utf8Path,
    options: &[String],
) -> Result<()> {
    let mut args = vec![source.as_str().to_string(), destination.as_str().to_string()];
    args.extend(options.iter().cloned());
    let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
    runner.run(
        &format!("Creating squashfs image {destination}"),
        "mksquashfs",
        &arg_refs,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default)]
    struct RecordingRunner {
        calls: std::cell::RefCell<Vec<String>>,
    }
    impl Runner for RecordingRunner {
        fn run_capture(&self, _d: &str, cmd: &str, _args: &[&str]) -> Result<Vec<u8>> {
            self.calls.borrow_mut().push(cmd.to_string());
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_create_squashfs_passes_options() {
        let runner = RecordingRunner::default();
        create_squashfs(
            &runner,
            Utf8Path::new("/src"),
            Utf8Path::new("/out.squashfs"),
            &["-comp".to_string(), "zstd".to_string()],
        )
        .unwrap();
        assert_eq!(runner.calls.borrow().as_slice(), ["mksquashfs"]);
    }
}
