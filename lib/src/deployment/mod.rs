//! The in-memory description of a deployment: disks, partitions,
//! writable volumes, boot configuration, firmware entries, security
//! policy, and image sources, plus validation and YAML persistence.

mod source;

pub use source::ImageSource;

use std::fmt::Debug;

use anyhow::{bail, Context, Result};
use camino::Utf8Path;
use fn_error_context::context;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use slate_blockdev::FsKind;

use crate::platform::Fs;

/// Where the persisted deployment descriptor lives, relative to a
/// snapshot or system root.
pub const DEPLOYMENT_FILE_PATH: &str = "etc/elemental/deployment.yaml";

/// A partition's purpose within the deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "PascalCase")]
pub enum PartitionRole {
    Efi,
    System,
    Recovery,
    Data,
}

/// A writable btrfs subvolume overlaid onto the read-only snapshot
/// root, e.g. `/var` or `/home`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct RwVolume {
    pub path: String,
    /// Whether this volume gets its own per-snapshot subvolume
    /// (`true`) or is a single subvolume shared across snapshots.
    pub snapshotted: bool,
}

/// One partition on a disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Partition {
    pub label: String,
    pub role: PartitionRole,
    pub file_system: FsKind,
    /// Size in mebibytes; 0 means "remaining space" and is only valid
    /// on the last partition of a disk.
    pub size_mib: u64,
    #[serde(default)]
    pub uuid: String,
    pub mount_point: String,
    #[serde(default)]
    pub rw_volumes: Vec<RwVolume>,
    /// Hidden partitions (e.g. a "prepare" partition for first-boot
    /// network scripts) are materialised but not exposed in status
    /// output.
    #[serde(default)]
    pub hidden: bool,
}

/// One target block device and its partition layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Disk {
    pub device: String,
    #[serde(default)]
    pub start_sector: u64,
    pub partitions: Vec<Partition>,
}

/// Which bootloader to install.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum Bootloader {
    Grub,
    SystemdBoot,
    None,
}

/// Boot configuration: bootloader choice and kernel command line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct BootConfig {
    pub bootloader: Bootloader,
    #[serde(default)]
    pub kernel_cmdline: String,
}

/// An EFI boot entry to create via the firmware's boot manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct BootEntry {
    pub label: String,
    pub loader_path: String,
}

/// Firmware-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Firmware {
    #[serde(default)]
    pub boot_entries: Vec<BootEntry>,
}

/// Security policy; `Fips` appends `fips=1 boot=LABEL=<efi-label>` to
/// the kernel command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "PascalCase")]
pub enum SecurityPolicy {
    Default,
    Fips,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Security {
    pub policy: SecurityPolicy,
}

impl Default for Security {
    fn default() -> Self {
        Self { policy: SecurityPolicy::Default }
    }
}

/// Which snapshotter backend manages the system partition.
/// `Overwrite` degrades the system partition to ext4 with no RW
/// volumes; debugging only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotterKind {
    Snapper,
    Overwrite,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Snapshotter {
    pub name: SnapshotterKind,
}

/// The root entity, persisted as YAML inside the committed snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Deployment {
    pub disks: Vec<Disk>,
    pub boot_config: BootConfig,
    #[serde(default)]
    pub firmware: Firmware,
    #[serde(default)]
    pub security: Security,
    pub snapshotter: Snapshotter,
    pub source_os: ImageSource,
    #[serde(default)]
    pub overlay_tree: ImageSource,
    /// Host-relative path to a post-commit configuration script.
    #[serde(default)]
    pub cfg_script: Option<String>,
}

/// The canonical shape: one disk, EFI + System partitions, btrfs
/// snapshotter, grub.
pub fn default_deployment() -> Deployment {
    Deployment {
        disks: vec![Disk {
            device: String::new(),
            start_sector: 0,
            partitions: vec![
                Partition {
                    label: "efi".into(),
                    role: PartitionRole::Efi,
                    file_system: FsKind::Vfat,
                    size_mib: 1024,
                    uuid: String::new(),
                    mount_point: "/boot/efi".into(),
                    rw_volumes: Vec::new(),
                    hidden: false,
                },
                Partition {
                    label: "system".into(),
                    role: PartitionRole::System,
                    file_system: FsKind::Btrfs,
                    size_mib: 0,
                    uuid: String::new(),
                    mount_point: "/".into(),
                    rw_volumes: vec![
                        RwVolume { path: "/var".into(), snapshotted: false },
                        RwVolume { path: "/home".into(), snapshotted: false },
                    ],
                    hidden: false,
                },
            ],
        }],
        boot_config: BootConfig { bootloader: Bootloader::Grub, kernel_cmdline: String::new() },
        firmware: Firmware::default(),
        security: Security::default(),
        snapshotter: Snapshotter { name: SnapshotterKind::Snapper },
        source_os: ImageSource::Empty,
        overlay_tree: ImageSource::Empty,
        cfg_script: None,
    }
}

/// Validate and normalise a deployment in place: generate missing
/// UUIDs, reject conflicting labels, and enforce the structural
/// invariants from the data model.
#[context("validating deployment")]
pub fn sanitize(deployment: &mut Deployment) -> Result<()> {
    let mut efi_count = 0usize;
    let mut system_count = 0usize;
    let mut labels = std::collections::BTreeSet::new();

    for disk in &mut deployment.disks {
        let last_index = disk.partitions.len().saturating_sub(1);
        for (i, part) in disk.partitions.iter_mut().enumerate() {
            match part.role {
                PartitionRole::Efi => efi_count += 1,
                PartitionRole::System => system_count += 1,
                _ => {}
            }
            if !labels.insert(part.label.clone()) {
                bail!("duplicate partition label {:?}", part.label);
            }
            if part.size_mib == 0 && i != last_index {
                bail!(
                    "partition {:?} has size 0 (\"remaining space\") but is not the last partition on its disk",
                    part.label
                );
            }
            part.uuid = slate_blockdev::validate_or_generate_uuid(part.file_system, &part.uuid)
                .with_context(|| format!("validating UUID for partition {:?}", part.label))?;
        }
    }

    if efi_count != 1 {
        bail!("deployment must have exactly one EFI partition, found {efi_count}");
    }
    if system_count != 1 {
        bail!("deployment must have exactly one System partition, found {system_count}");
    }

    let system_fs = deployment
        .disks
        .iter()
        .flat_map(|d| &d.partitions)
        .find(|p| p.role == PartitionRole::System)
        .map(|p| p.file_system);
    match (deployment.snapshotter.name, system_fs) {
        (SnapshotterKind::Overwrite, _) => {}
        (SnapshotterKind::Snapper, Some(FsKind::Btrfs)) => {}
        (SnapshotterKind::Snapper, Some(other)) => {
            bail!("snapshotter \"snapper\" requires a btrfs system partition, found {other}")
        }
        (SnapshotterKind::Snapper, None) => bail!("no system partition found"),
    }

    Ok(())
}

/// Marshal `deployment` to YAML under `<root>/etc/elemental/deployment.yaml`.
#[context("writing deployment file under {root}")]
pub fn write_deployment_file(fs: &dyn Fs, deployment: &Deployment, root: &Utf8Path) -> Result<()> {
    let path = root.join(DEPLOYMENT_FILE_PATH);
    if let Some(parent) = path.parent() {
        fs.mkdir_all(parent)?;
    }
    let yaml = serde_yaml::to_string(deployment).context("serialising deployment")?;
    fs.write_bytes(&path, yaml.as_bytes())
}

/// Read a previously persisted deployment back from `<root>/etc/elemental/deployment.yaml`.
#[context("parsing deployment file under {root}")]
pub fn parse(fs: &dyn Fs, root: &Utf8Path) -> Result<Deployment> {
    let path = root.join(DEPLOYMENT_FILE_PATH);
    let bytes = fs.read_to_vec(&path)?;
    serde_yaml::from_slice(&bytes).context("deserialising deployment")
}

/// Mount paths of every declared RW volume across all disks, in
/// declaration order. Used to keep image-sync's preserved-path list
/// and snapshot reconciliation in sync with the deployment.
pub(crate) fn rw_volume_paths(deployment: &Deployment) -> Vec<String> {
    deployment
        .disks
        .iter()
        .flat_map(|d| &d.partitions)
        .flat_map(|p| &p.rw_volumes)
        .map(|v| v.path.clone())
        .collect()
}

/// The declared RW volumes of the system partition, the only partition
/// role that carries them in practice.
pub(crate) fn system_rw_volumes(deployment: &Deployment) -> Vec<RwVolume> {
    deployment
        .disks
        .iter()
        .flat_map(|d| &d.partitions)
        .find(|p| p.role == PartitionRole::System)
        .map(|p| p.rw_volumes.clone())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::TestFs;

    #[test]
    fn test_default_deployment_sanitizes_cleanly() {
        let mut d = default_deployment();
        d.disks[0].device = "/dev/fake0".into();
        sanitize(&mut d).unwrap();
        assert!(!d.disks[0].partitions[0].uuid.is_empty());
        assert!(!d.disks[0].partitions[1].uuid.is_empty());
    }

    #[test]
    fn test_sanitize_rejects_missing_efi_or_system() {
        let mut d = default_deployment();
        d.disks[0].partitions.remove(0);
        assert!(sanitize(&mut d).is_err());
    }

    #[test]
    fn test_sanitize_rejects_duplicate_labels() {
        let mut d = default_deployment();
        d.disks[0].partitions[1].label = d.disks[0].partitions[0].label.clone();
        assert!(sanitize(&mut d).is_err());
    }

    #[test]
    fn test_sanitize_rejects_zero_size_non_last_partition() {
        let mut d = default_deployment();
        d.disks[0].partitions[0].size_mib = 0;
        assert!(sanitize(&mut d).is_err());
    }

    #[test]
    fn test_sanitize_rejects_overwrite_needing_btrfs_only_when_snapper() {
        let mut d = default_deployment();
        d.disks[0].partitions[1].file_system = FsKind::Ext4;
        assert!(sanitize(&mut d).is_err());
        d.snapshotter.name = SnapshotterKind::Overwrite;
        sanitize(&mut d).unwrap();
    }

    #[test]
    fn test_write_then_parse_roundtrip() {
        let fs = TestFs::default();
        let mut d = default_deployment();
        d.disks[0].device = "/dev/fake0".into();
        sanitize(&mut d).unwrap();
        let root = Utf8Path::new("/mnt/snapshot1");
        write_deployment_file(&fs, &d, root).unwrap();
        let parsed = parse(&fs, root).unwrap();
        assert_eq!(parsed, d);
    }
}
