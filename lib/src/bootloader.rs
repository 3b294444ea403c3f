//! Bootloader configuration and EFI boot-entry management (§4.6):
//! the second hook `Transaction::commit` runs after the user's
//! `config.sh`, plus a host-side step for firmware boot entries.
//!
//! Grub and systemd-boot both write their configuration from inside
//! the snapshot, the same way a user hook does, so `plan_hook` builds
//! a [`Hook`] that reuses `commit`'s existing bind-mount/chroot
//! machinery rather than adding a second execution path.
//! `create_efi_boot_entries` runs directly against the host: the
//! firmware's NVRAM is host state that no chroot changes touch.

use anyhow::Result;
use camino::Utf8PathBuf;

use crate::deployment::{Bootloader, Deployment, PartitionRole};
use crate::platform::{Runner, System};
use crate::transaction::{Hook, Transaction, UpgradeHelper};

const HOOK_IN_SNAPSHOT_PATH: &str = "/etc/slate-bootloader-config.sh";
const HOOK_STAGING_PATH: &str = "/var/tmp/slate/bootloader-config.sh";

/// Write the bootloader's configuration script to a host staging path
/// and return the [`Hook`] that binds and runs it inside the
/// snapshot, or `None` if the deployment installs no bootloader.
pub(crate) fn plan_hook(
    system: &System,
    deployment: &Deployment,
    helper: &dyn UpgradeHelper,
) -> Result<Option<Hook>> {
    let cmdline = helper.generate_kernel_cmdline(deployment);
    let script = match deployment.boot_config.bootloader {
        Bootloader::Grub => grub_config_script(&cmdline),
        Bootloader::SystemdBoot => systemd_boot_config_script(&cmdline),
        Bootloader::None => return Ok(None),
    };
    let host_script = Utf8PathBuf::from(HOOK_STAGING_PATH);
    if let Some(parent) = host_script.parent() {
        system.fs.mkdir_all(parent)?;
    }
    system.fs.write_bytes(&host_script, script.as_bytes())?;
    system.fs.chmod(&host_script, 0o755)?;
    Ok(Some(Hook { host_script, in_snapshot_path: Utf8PathBuf::from(HOOK_IN_SNAPSHOT_PATH) }))
}

fn grub_config_script(cmdline: &str) -> String {
    format!(
        "#!/bin/sh\nset -e\ngrub2-mkconfig -o /boot/grub2/grub.cfg\ngrubby --update-kernel=ALL --args=\"{cmdline}\"\n"
    )
}

fn systemd_boot_config_script(cmdline: &str) -> String {
    format!(
        "#!/bin/sh\nset -e\nbootctl install\nmkdir -p /boot/loader/entries\nprintf 'options %s\\n' \"{cmdline}\" > /boot/loader/entries/slate.conf.options\n"
    )
}

/// Create every declared firmware boot entry, pointing at the EFI
/// partition of whichever disk carries one. A no-op if the deployment
/// declares no entries (e.g. BIOS-only or a test deployment).
///
/// Partition numbers are derived from each disk's layout order (the
/// same 1-based numbering `C3` assigns when partitioning): the
/// deployment model doesn't persist the partition number it was
/// created with, and re-deriving it from layout order avoids adding a
/// field that would otherwise only ever agree with this count.
pub(crate) fn create_efi_boot_entries(runner: &dyn Runner, deployment: &Deployment) -> Result<()> {
    if deployment.firmware.boot_entries.is_empty() {
        return Ok(());
    }
    for disk in &deployment.disks {
        let Some(part_number) = disk
            .partitions
            .iter()
            .position(|p| p.role == PartitionRole::Efi)
            .map(|i| i + 1)
        else {
            continue;
        };
        let part_number = part_number.to_string();
        for entry in &deployment.firmware.boot_entries {
            runner.run_quiet(
                &format!("Creating EFI boot entry {:?}", entry.label),
                "efibootmgr",
                &[
                    "--create",
                    "--disk",
                    &disk.device,
                    "--part",
                    &part_number,
                    "--loader",
                    &entry.loader_path,
                    "--label",
                    &entry.label,
                ],
            )?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deployment::{default_deployment, BootEntry};
    use crate::platform::{System, TestRunner};

    struct FakeHelper;
    impl std::fmt::Debug for FakeHelper {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("FakeHelper")
        }
    }
    impl UpgradeHelper for FakeHelper {
        fn sync_image_content(
            &self,
            _system: &System,
            _trans: &Transaction,
            _source: &mut crate::deployment::ImageSource,
            _excludes: &[String],
            _preserve_paths: &[String],
        ) -> Result<()> {
            Ok(())
        }
        fn merge(&self, _system: &System, _trans: &Transaction) -> Result<()> {
            Ok(())
        }
        fn update_fstab(&self, _system: &System, _trans: &Transaction, _deployment: &Deployment) -> Result<()> {
            Ok(())
        }
        fn lock(&self, _system: &System, _trans: &Transaction) -> Result<()> {
            Ok(())
        }
        fn generate_kernel_cmdline(&self, deployment: &Deployment) -> String {
            deployment.boot_config.kernel_cmdline.clone()
        }
    }

    #[test]
    fn test_plan_hook_none_for_no_bootloader() {
        let system = System::test();
        let mut deployment = default_deployment();
        deployment.boot_config.bootloader = Bootloader::None;
        let hook = plan_hook(&system, &deployment, &FakeHelper).unwrap();
        assert!(hook.is_none());
    }

    #[test]
    fn test_plan_hook_writes_grub_script() {
        let system = System::test();
        let mut deployment = default_deployment();
        deployment.boot_config.kernel_cmdline = "quiet".into();
        let hook = plan_hook(&system, &deployment, &FakeHelper).unwrap().unwrap();
        assert_eq!(hook.in_snapshot_path, Utf8PathBuf::from(HOOK_IN_SNAPSHOT_PATH));
        let script = String::from_utf8(system.fs.read_to_vec(&hook.host_script).unwrap()).unwrap();
        assert!(script.contains("grub2-mkconfig"));
        assert!(script.contains("quiet"));
    }

    #[test]
    fn test_create_efi_boot_entries_targets_efi_partition_number() {
        let runner = TestRunner::default();
        let mut deployment = default_deployment();
        deployment.disks[0].device = "/dev/fake0".into();
        deployment.firmware.boot_entries =
            vec![BootEntry { label: "slate".into(), loader_path: "\\EFI\\slate\\grubx64.efi".into() }];
        create_efi_boot_entries(&runner, &deployment).unwrap();
        let calls = runner.calls.borrow();
        let (cmd, args) = &calls[0];
        assert_eq!(cmd, "efibootmgr");
        assert!(args.windows(2).any(|w| w == ["--part", "1"]));
    }

    #[test]
    fn test_create_efi_boot_entries_noop_when_no_entries_declared() {
        let runner = TestRunner::default();
        let mut deployment = default_deployment();
        deployment.disks[0].device = "/dev/fake0".into();
        create_efi_boot_entries(&runner, &deployment).unwrap();
        assert!(runner.calls.borrow().is_empty());
    }
}
