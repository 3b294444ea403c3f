//! Unpacking from a raw disk image: loop-mount it read-only, then
//! delegate to the directory unpacker.

use anyhow::{Context, Result};
use camino::Utf8Path;
use fn_error_context::context;
use tokio_util::sync::CancellationToken;

use super::dir::{rsync_copy, rsync_sync};
use super::Unpacker;
use crate::platform::System;

pub(crate) struct RawUnpacker {
    pub(crate) uri: String,
}

impl Unpacker for RawUnpacker {
    fn unpack(
        &self,
        system: &System,
        destination: &Utf8Path,
        excludes: &[String],
        _cancel: &CancellationToken,
    ) -> Result<String> {
        with_loop_mount(system, &self.uri, |scratch| {
            rsync_copy(system, scratch, destination, excludes)
        })
    }

    fn synched_unpack(
        &self,
        system: &System,
        destination: &Utf8Path,
        excludes: &[String],
        delete_excludes: &[String],
        _cancel: &CancellationToken,
    ) -> Result<String> {
        with_loop_mount(system, &self.uri, |scratch| {
            rsync_sync(system, scratch, destination, excludes, delete_excludes)
        })
    }
}

/// Attach `image` to a loop device, mount it read-only at a fresh
/// scratch directory, run `body`, then unmount and detach on every
/// exit path. An unmount failure is surfaced only if `body` otherwise
/// succeeded, matching the mount-failure-vs-umount-failure asymmetry
/// in the unpack contract.
#[context("unpacking raw image {image}")]
fn with_loop_mount(
    system: &System,
    image: &str,
    body: impl FnOnce(&Utf8Path) -> Result<()>,
) -> Result<String> {
    let scratch_dir = tempfile::tempdir().context("creating scratch mount point")?;
    let scratch = camino::Utf8Path::from_path(scratch_dir.path())
        .ok_or_else(|| anyhow::anyhow!("scratch mount point path is not UTF-8"))?
        .to_owned();
    system.fs.mkdir_all(&scratch)?;

    let loop_dev = system
        .runner
        .run("Attaching loop device", "losetup", &["--show", "-f", "-r", image])
        .context("attaching loop device")?;
    let loop_dev = String::from_utf8(loop_dev).context("non-utf8 losetup output")?;
    let loop_dev = loop_dev.trim().to_string();

    system
        .mounter
        .mount(system.runner.as_ref(), &loop_dev, &scratch)
        .context("mounting loop device")?;

    let body_result = body(&scratch).and_then(|()| super::dir::digest_from_deployment_file(system, &scratch));

    let unmount_result = system.mounter.unmount(system.runner.as_ref(), &scratch);
    system.runner.run_quiet("Detaching loop device", "losetup", &["-d", &loop_dev]).ok();

    let digest = body_result?;
    unmount_result.context("unmounting raw image after successful unpack")?;
    Ok(digest)
}
