//! Drives `slate-blockdev` against a deployment's disk layout:
//! partition the device, format every partition, and lay out
//! top-level btrfs subvolumes for any declared RW volumes.
//!
//! Partitioning is not transactional: a failure here is fatal and no
//! rollback of partition state is attempted, only logging (§4.6).

use std::fmt::Debug;

use anyhow::{Context, Result};
use camino::Utf8Path;
use fn_error_context::context;
use slate_blockdev::{Backend, Disk as BlockDevice, GptBackend, PartitionFlag, PartitionSpec};

use crate::deployment::{Disk, Partition, PartitionRole};
use crate::platform::{Runner, System};

/// Adapts the engine's [`Runner`] to the narrower contract
/// `slate-blockdev` expects, mirroring [`crate::platform::ProdRunner`]'s
/// own implementation of that trait but over a borrowed trait object.
pub(crate) struct BlockdevRunnerBridge<'a>(&'a dyn Runner);

impl<'a> BlockdevRunnerBridge<'a> {
    pub(crate) fn new(runner: &'a dyn Runner) -> Self {
        Self(runner)
    }
}

impl Debug for BlockdevRunnerBridge<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("BlockdevRunnerBridge").finish()
    }
}

impl slate_blockdev::Runner for BlockdevRunnerBridge<'_> {
    fn run_capture(&self, description: &str, cmd: &str, args: &[&str]) -> Result<Vec<u8>> {
        self.0.run(description, cmd, args)
    }
}

fn partition_flags(role: PartitionRole, hidden: bool) -> Vec<PartitionFlag> {
    let mut flags = Vec::new();
    if role == PartitionRole::Efi {
        flags.push(PartitionFlag::Boot);
        flags.push(PartitionFlag::Esp);
    }
    if hidden {
        flags.push(PartitionFlag::Hidden);
    }
    flags
}

/// Partition `disk` per its layout, format every partition, and
/// create top-level btrfs subvolumes for any partition's declared RW
/// volumes.
#[context("partitioning and formatting {}", disk.device)]
pub(crate) fn partition_and_format_device(system: &System, disk: &Disk) -> Result<()> {
    let runner = BlockdevRunnerBridge::new(system.runner.as_ref());
    let specs: Vec<PartitionSpec> = disk
        .partitions
        .iter()
        .map(|p| PartitionSpec {
            label: p.label.clone(),
            fs: p.file_system,
            size_mib: p.size_mib,
            uuid: p.uuid.clone(),
            flags: partition_flags(p.role, p.hidden),
        })
        .collect();

    let device = Utf8Path::new(&disk.device);
    let blockdev = BlockDevice::new(device.to_owned(), GptBackend);
    let created = blockdev.partition(&runner, &specs, true)?;

    for (created_partition, partition) in created.iter().zip(disk.partitions.iter()) {
        let path = slate_blockdev::partition_device_path(device, created_partition.number);
        slate_blockdev::mkfs(&runner, &path, partition.file_system, &partition.label, &partition.uuid)
            .with_context(|| format!("formatting partition {}", partition.label))?;

        if !partition.rw_volumes.is_empty() {
            create_rw_volumes(system, &runner, &path, partition)
                .with_context(|| format!("creating RW volume subvolumes on partition {}", partition.label))?;
        }
    }
    Ok(())
}

/// Temp-mount a just-formatted btrfs partition and create a top-level
/// subvolume for each of its non-snapshotted RW volumes.
fn create_rw_volumes(
    system: &System,
    runner: &dyn slate_blockdev::Runner,
    partition_path: &Utf8Path,
    partition: &Partition,
) -> Result<()> {
    let scratch_dir = tempfile::tempdir().context("creating scratch mount point for subvolume setup")?;
    let scratch = camino::Utf8Path::from_path(scratch_dir.path())
        .ok_or_else(|| anyhow::anyhow!("scratch mount point path is not UTF-8"))?
        .to_owned();
    system.fs.mkdir_all(&scratch)?;

    system
        .mounter
        .mount(system.runner.as_ref(), partition_path.as_str(), &scratch)
        .context("mounting partition to create subvolumes")?;

    let result = (|| -> Result<()> {
        for volume in &partition.rw_volumes {
            let name = volume.path.trim_start_matches('/');
            runner.run_capture(
                &format!("Creating subvolume {name}"),
                "btrfs",
                &["subvolume", "create", scratch.join(name).as_str()],
            )?;
        }
        Ok(())
    })();

    let unmount_result = system.mounter.unmount(system.runner.as_ref(), &scratch);
    result?;
    unmount_result.context("unmounting partition after creating subvolumes")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_efi_partition_gets_boot_and_esp_flags() {
        let flags = partition_flags(PartitionRole::Efi, false);
        assert_eq!(flags, vec![PartitionFlag::Boot, PartitionFlag::Esp]);
    }

    #[test]
    fn test_hidden_data_partition_gets_hidden_flag_only() {
        let flags = partition_flags(PartitionRole::Data, true);
        assert_eq!(flags, vec![PartitionFlag::Hidden]);
    }

    #[test]
    fn test_system_partition_gets_no_flags() {
        let flags = partition_flags(PartitionRole::System, false);
        assert!(flags.is_empty());
    }
}
