//! Disk partitioning, filesystem creation, and loop-backed image-file
//! helpers for the deployment engine.
//!
//! Every external tool invocation here goes through the [`Runner`]
//! capability rather than `std::process::Command` directly, so the
//! partitioner can be exercised in tests against a scripted fake.

mod backend;
mod format;
mod image;
mod uuid;

pub use backend::{
    partition_device_path, Backend, Disk, GptBackend, Partition, PartitionFlag, PartitionSpec,
    PartitionTableLabel, SgdiskBackend,
};
pub use format::{expand_filesystem, mkfs, Mounter};
pub use image::{create_empty_file, create_preloaded_filesystem_image, create_squashfs};
pub use uuid::{canonicalize_uuid, validate_or_generate_uuid, validate_uuid};

use anyhow::{anyhow, Context, Result};
use camino::Utf8Path;
use serde::Deserialize;
use std::fmt::Debug;
use std::fs::File;
use std::os::unix::io::AsRawFd;

/// Filesystem kinds the engine knows how to create and grow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FsKind {
    Vfat,
    Ext2,
    Ext4,
    Xfs,
    Btrfs,
}

impl FsKind {
    /// The `mkfs.<fs>` suffix for this kind.
    pub fn mkfs_suffix(self) -> &'static str {
        match self {
            FsKind::Vfat => "vfat",
            FsKind::Ext2 => "ext2",
            FsKind::Ext4 => "ext4",
            FsKind::Xfs => "xfs",
            FsKind::Btrfs => "btrfs",
        }
    }

    /// Whether this kind uses the 8-hex-digit VFAT volume ID scheme
    /// instead of an RFC-4122 UUID.
    pub fn is_vfat(self) -> bool {
        matches!(self, FsKind::Vfat)
    }
}

impl std::fmt::Display for FsKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.mkfs_suffix())
    }
}

/// The minimal external-process capability the partitioner needs.
/// Production callers hand in an adapter over the engine's `Runner`
/// (see `slate-lib::platform`); tests hand in an in-memory recorder.
pub trait Runner: Debug {
    /// Run `cmd` with `args`, returning its captured stdout on success.
    /// Errors include the command's combined stdout/stderr tail.
    fn run_capture(&self, description: &str, cmd: &str, args: &[&str]) -> Result<Vec<u8>>;

    /// Run `cmd` with `args`, discarding stdout but still surfacing
    /// failures with the combined output tail.
    fn run(&self, description: &str, cmd: &str, args: &[&str]) -> Result<()> {
        self.run_capture(description, cmd, args).map(|_| ())
    }
}

#[derive(Debug, Deserialize)]
struct DevicesOutput {
    blockdevices: Vec<Device>,
}

/// A block device as reported by `lsblk`.
#[derive(Debug, Clone, Deserialize)]
pub struct Device {
    pub name: String,
    pub serial: Option<String>,
    pub model: Option<String>,
    pub label: Option<String>,
    pub fstype: Option<String>,
    pub children: Option<Vec<Device>>,
}

impl Device {
    /// RHEL8's lsblk doesn't have PATH in its JSON output, so we build it.
    pub fn path(&self) -> String {
        format!("/dev/{}", &self.name)
    }

    /// Whether this device has partitions (or other children); used to
    /// reject installing onto a device that's already in use.
    pub fn has_children(&self) -> bool {
        self.children.as_ref().is_some_and(|v| !v.is_empty())
    }
}

fn list_impl(runner: &dyn Runner, dev: Option<&Utf8Path>) -> Result<Vec<Device>> {
    let mut args = vec!["-J", "-o", "NAME,SERIAL,MODEL,LABEL,FSTYPE"];
    if let Some(dev) = dev {
        args.push(dev.as_str());
    }
    let out = runner.run_capture("Listing block devices", "lsblk", &args)?;
    let devs: DevicesOutput = serde_json::from_slice(&out)?;
    Ok(devs.blockdevices)
}

/// List a single device's lsblk record, including its children.
pub fn list_dev(runner: &dyn Runner, dev: &Utf8Path) -> Result<Device> {
    let devices = list_impl(runner, Some(dev))?;
    devices
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("no device output from lsblk for {dev}"))
}

/// List every block device on the system.
pub fn list(runner: &dyn Runner) -> Result<Vec<Device>> {
    list_impl(runner, None)
}

/// Wipe any existing filesystem/partition-table signatures from `dev`.
pub fn wipefs(runner: &dyn Runner, dev: &Utf8Path) -> Result<()> {
    runner.run(&format!("Wiping device {dev}"), "wipefs", &["-a", dev.as_str()])
}

/// Run `udevadm settle`, with a short pre-sleep to cover the window
/// right after a partition-table reread where udev hasn't yet been
/// notified by the kernel and would otherwise return immediately.
pub fn udev_settle(runner: &dyn Runner) -> Result<()> {
    std::thread::sleep(std::time::Duration::from_millis(200));
    runner.run("Waiting for udev to settle", "udevadm", &["settle"])
}

/// Poll for up to ten seconds for `path` to appear, calling
/// `udevadm settle` between each attempt. Used after partition-table
/// changes so callers observe the freshly created partition node.
pub fn wait_for_device(runner: &dyn Runner, path: &Utf8Path) -> Result<()> {
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
    loop {
        if path.exists() {
            return Ok(());
        }
        udev_settle(runner)?;
        if path.exists() {
            return Ok(());
        }
        if std::time::Instant::now() >= deadline {
            anyhow::bail!("timed out waiting for device node {path} to appear");
        }
        std::thread::sleep(std::time::Duration::from_millis(250));
    }
}

#[allow(unsafe_code)]
/// Ask the kernel to reread `file`'s partition table (`BLKRRPART`).
/// Retries several times since this sometimes fails transiently right
/// after a write.
pub fn reread_partition_table(file: &mut File, retry: bool) -> Result<()> {
    use nix::errno::Errno;

    let fd = file.as_raw_fd();
    let max_tries = if retry { 20 } else { 1 };
    for retries in (0..max_tries).rev() {
        let result = unsafe { ioctl::blkrrpart(fd) };
        match result {
            Ok(_) => break,
            Err(err) if retries == 0 && err == Errno::EINVAL => {
                return Err(err)
                    .context("couldn't reread partition table: device may not support partitions")
            }
            Err(err) if retries == 0 && err == Errno::EBUSY => {
                return Err(err).context("couldn't reread partition table: device is in use")
            }
            Err(err) if retries == 0 => return Err(err).context("couldn't reread partition table"),
            Err(_) => std::thread::sleep(std::time::Duration::from_millis(100)),
        }
    }
    Ok(())
}

#[allow(clippy::missing_safety_doc)]
mod ioctl {
    use libc::c_int;
    use nix::{ioctl_none, ioctl_read, ioctl_read_bad, libc, request_code_none};
    ioctl_none!(blkrrpart, 0x12, 95);
    ioctl_read_bad!(blksszget, request_code_none!(0x12, 104), c_int);
    ioctl_read!(blkgetsize64, 0x12, 114, libc::size_t);
}

/// Parse a human size string (`10M`, `1GiB`, `2T`, a bare integer) into
/// mebibytes.
pub fn parse_size_mib(mut s: &str) -> Result<u64> {
    let suffixes = [
        ("MiB", 1u64),
        ("M", 1u64),
        ("GiB", 1024),
        ("G", 1024),
        ("TiB", 1024 * 1024),
        ("T", 1024 * 1024),
    ];
    let mut mul = 1u64;
    for (suffix, imul) in suffixes {
        if let Some((sv, rest)) = s.rsplit_once(suffix) {
            if !rest.is_empty() {
                anyhow::bail!("Trailing text after size: {rest}");
            }
            s = sv;
            mul = imul;
        }
    }
    let v = s.parse::<u64>()?;
    Ok(v * mul)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size_mib() {
        let ident_cases = [0, 10, 9, 1024].into_iter().map(|k| (k.to_string(), k));
        let cases = [
            ("0M", 0),
            ("10M", 10),
            ("10MiB", 10),
            ("1G", 1024),
            ("9G", 9216),
            ("11T", 11 * 1024 * 1024),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v));
        for (s, v) in ident_cases.chain(cases) {
            assert_eq!(parse_size_mib(&s).unwrap(), v as u64, "Parsing {s}");
        }
    }

    #[test]
    fn test_device_has_children() {
        let leaf = Device {
            name: "sda1".into(),
            serial: None,
            model: None,
            label: None,
            fstype: None,
            children: None,
        };
        assert!(!leaf.has_children());
        let parent = Device {
            children: Some(vec![leaf.clone()]),
            ..leaf
        };
        assert!(parent.has_children());
    }
}
