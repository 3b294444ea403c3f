//! Fresh-install flow (C6 §4.6): partition and format every disk,
//! open a snapshot transaction, unpack the base OS into it, persist
//! the deployment descriptor, run the config and bootloader hooks,
//! then commit and register the EFI boot entry.
//!
//! Every step after `Transaction::start` funnels through one closure
//! so a single `match` decides between `Commit` and `Rollback`,
//! mirroring the state machine in §4.5.

use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use crate::deployment::{self, Deployment, PartitionRole};
use crate::disk::BlockdevRunnerBridge;
use crate::errors::EngineError;
use crate::platform::System;
use crate::transaction::{pick_snapshotter, Hook, Transaction, UpgradeHelper};
use crate::{bootloader, disk};

/// Where the system partition is mounted for the duration of an
/// install; unrelated to any mountpoint baked into the deployment
/// itself, since before install there is no existing system to mount
/// at its eventual `/`.
const SYSTEM_MOUNT_POINT: &str = "/run/slate/system";

const CONFIG_SCRIPT_NAME: &str = "config.sh";
const CONFIG_SCRIPT_IN_SNAPSHOT: &str = "/etc/config.sh";

/// Run the fresh-install flow. `deployment` is sanitized in place.
/// `config_script`, if given (the CLI's `--config`), overrides the
/// default `./config.sh`-in-the-working-directory convention.
/// `create_boot_entry` gates the host-side EFI NVRAM registration step
/// (the CLI's `--create-boot-entry`), since not every install target
/// is the firmware this process is running under.
pub(crate) fn install(
    system: &System,
    deployment: &mut Deployment,
    config_script: Option<&Utf8Path>,
    create_boot_entry: bool,
) -> Result<(), EngineError> {
    install_onto_declared_device(system, deployment, config_script)?;
    if create_boot_entry {
        bootloader::create_efi_boot_entries(system.runner.as_ref(), deployment).map_err(EngineError::Boot)?;
    }
    Ok(())
}

/// The device-agnostic core of the install flow: partition, format,
/// mount, run the snapshot transaction, unmount. Used directly by
/// [`install`] against a physical disk and by [`crate::build`] against
/// a loop device, neither of which shares the other's notion of a
/// firmware boot entry worth registering on this host.
pub(crate) fn install_onto_declared_device(
    system: &System,
    deployment: &mut Deployment,
    config_script: Option<&Utf8Path>,
) -> Result<(), EngineError> {
    deployment::sanitize(deployment).map_err(EngineError::Validation)?;

    for disk_def in &deployment.disks {
        reject_if_device_in_use(system, &disk_def.device).map_err(EngineError::Validation)?;
    }

    for disk_def in &deployment.disks {
        disk::partition_and_format_device(system, disk_def).map_err(EngineError::Preparation)?;
    }

    let device = system_partition_device(deployment).map_err(EngineError::Preparation)?;
    let root = Utf8PathBuf::from(SYSTEM_MOUNT_POINT);
    system.fs.mkdir_all(&root).map_err(EngineError::Preparation)?;
    system
        .mounter
        .mount(system.runner.as_ref(), device.as_str(), &root)
        .map_err(EngineError::Preparation)?;

    let result = run_transaction(system, deployment, &root, config_script);

    let unmount_result = system.mounter.unmount(system.runner.as_ref(), &root);
    let outcome = result;
    if let Err(e) = unmount_result {
        system.logger.warn(&format!("failed to unmount system partition at {root}: {e:#}"));
    }
    outcome
}

/// Refuse to install onto `device` if `lsblk` reports it already has
/// partitions (or other children), matching the safety preflight every
/// install-capable tool runs before repartitioning a disk out from
/// under a mounted filesystem.
#[context("checking whether {device} is already in use")]
fn reject_if_device_in_use(system: &System, device: &str) -> Result<()> {
    let runner = BlockdevRunnerBridge::new(system.runner.as_ref());
    let listed = slate_blockdev::list_dev(&runner, Utf8Path::new(device))?;
    if listed.has_children() {
        bail!("refusing to install onto {device}: it already has partitions");
    }
    Ok(())
}

fn run_transaction(
    system: &System,
    deployment: &mut Deployment,
    root: &Utf8Path,
    config_script: Option<&Utf8Path>,
) -> Result<(), EngineError> {
    let snapshotter = pick_snapshotter(deployment, root.to_owned());
    let helper = snapshotter.init(system, deployment).map_err(EngineError::Transaction)?;
    let mut trans = snapshotter.start(system).map_err(EngineError::Transaction)?;

    let body = install_body(system, deployment, &trans, helper.as_ref(), config_script);
    match body {
        Ok(hooks) => snapshotter
            .commit(system, &mut trans, &hooks, &BTreeMap::new())
            .map_err(EngineError::Transaction),
        Err(e) => Err(EngineError::Transaction(snapshotter.rollback(system, &mut trans, e))),
    }
}

/// Unpacks the base OS into the fresh snapshot, persists the
/// deployment descriptor, and resolves the hooks `Commit` will run.
/// Returned as a `Result` so [`run_transaction`] can route any failure
/// here to `Rollback` instead of `Commit`.
///
/// A deployment with an empty `source_os` (no image to unpack, e.g. a
/// bare partition layout prepared for later population) skips the
/// unpack step entirely, the same way `upgrade`'s overlay application
/// skips an empty `overlay_tree`.
fn install_body(
    system: &System,
    deployment: &mut Deployment,
    trans: &Transaction,
    helper: &dyn UpgradeHelper,
    config_script: Option<&Utf8Path>,
) -> Result<Vec<Hook>> {
    if !deployment.source_os.is_empty() {
        let preserve_paths = deployment::rw_volume_paths(deployment);
        helper.sync_image_content(system, trans, &mut deployment.source_os, &[], &preserve_paths)?;
    }

    deployment::write_deployment_file(system.fs.as_ref(), deployment, &trans.path)?;

    let mut hooks = Vec::new();
    if let Some(hook) = resolve_config_hook(system, config_script)? {
        hooks.push(hook);
    }
    if let Some(hook) = bootloader::plan_hook(system, deployment, helper)? {
        hooks.push(hook);
    }
    Ok(hooks)
}

/// Resolve the config-script hook: an explicit `config_script` override
/// must exist; absent an override, fall back to `config.sh` in the
/// current working directory, silently skipped if not present there.
fn resolve_config_hook(system: &System, config_script: Option<&Utf8Path>) -> Result<Option<Hook>> {
    let host_script = match config_script {
        Some(path) => {
            system.fs.stat(path).with_context(|| format!("config script {path} not found"))?;
            path.to_owned()
        }
        None => {
            let default_path = Utf8PathBuf::from(CONFIG_SCRIPT_NAME);
            if system.fs.stat(&default_path).is_err() {
                return Ok(None);
            }
            default_path
        }
    };
    Ok(Some(Hook { host_script, in_snapshot_path: Utf8PathBuf::from(CONFIG_SCRIPT_IN_SNAPSHOT) }))
}

/// The device node of the deployment's single System partition,
/// derived from its disk's device and its 1-based position in that
/// disk's partition list (the same numbering `disk::partition_and_format_device`
/// assigns).
#[context("locating system partition device node")]
fn system_partition_device(deployment: &Deployment) -> Result<Utf8PathBuf> {
    for disk_def in &deployment.disks {
        if let Some(index) = disk_def.partitions.iter().position(|p| p.role == PartitionRole::System) {
            let device = Utf8Path::new(&disk_def.device);
            return Ok(slate_blockdev::partition_device_path(device, (index + 1) as u32));
        }
    }
    bail!("deployment has no System partition")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deployment::default_deployment;
    use crate::platform::{DiscardLogger, System, TestFs, TestMounter, TestRunner};

    /// A `System::test()`-equivalent bundle whose runner has a scripted
    /// empty-`lsblk` response queued up front, so `install`'s
    /// device-in-use preflight check doesn't choke on the default
    /// unscripted-call passthrough, which isn't valid JSON.
    fn system_with_clean_device() -> System {
        let runner = TestRunner::default();
        runner.push_ok(
            "lsblk",
            br#"{"blockdevices":[{"name":"fake0","serial":null,"model":null,"label":null,"fstype":null,"children":null}]}"#
                .as_slice(),
        );
        System {
            fs: Box::new(TestFs::default()),
            runner: Box::new(runner),
            mounter: Box::new(TestMounter::default()),
            logger: Box::new(DiscardLogger),
        }
    }

    #[test]
    fn test_system_partition_device_is_second_partition_of_first_disk() {
        let mut deployment = default_deployment();
        deployment.disks[0].device = "/dev/fake0".into();
        let device = system_partition_device(&deployment).unwrap();
        assert_eq!(device, Utf8PathBuf::from("/dev/fake0p2"));
    }

    #[test]
    fn test_resolve_config_hook_none_when_absent() {
        let system = System::test();
        assert!(resolve_config_hook(&system, None).unwrap().is_none());
    }

    #[test]
    fn test_resolve_config_hook_present_when_found() {
        let system = System::test();
        system.fs.write_bytes(Utf8Path::new(CONFIG_SCRIPT_NAME), b"#!/bin/sh\n").unwrap();
        let hook = resolve_config_hook(&system, None).unwrap().unwrap();
        assert_eq!(hook.in_snapshot_path, Utf8PathBuf::from(CONFIG_SCRIPT_IN_SNAPSHOT));
    }

    #[test]
    fn test_resolve_config_hook_override_must_exist() {
        let system = System::test();
        let result = resolve_config_hook(&system, Some(Utf8Path::new("/missing/config.sh")));
        assert!(result.is_err());
    }

    #[test]
    fn test_resolve_config_hook_override_used_when_present() {
        let system = System::test();
        system.fs.write_bytes(Utf8Path::new("/srv/custom.sh"), b"#!/bin/sh\n").unwrap();
        let hook = resolve_config_hook(&system, Some(Utf8Path::new("/srv/custom.sh"))).unwrap().unwrap();
        assert_eq!(hook.host_script, Utf8PathBuf::from("/srv/custom.sh"));
    }

    #[test]
    fn test_install_runs_end_to_end_against_fake_disk() {
        let system = system_with_clean_device();
        let mut deployment = default_deployment();
        deployment.disks[0].device = "/dev/fake0".into();
        let result = install(&system, &mut deployment, None, false);
        assert!(result.is_ok(), "{result:?}");
    }

    #[test]
    fn test_install_rejects_device_already_partitioned() {
        let runner = TestRunner::default();
        runner.push_ok(
            "lsblk",
            br#"{"blockdevices":[{"name":"fake0","serial":null,"model":null,"label":null,"fstype":null,"children":[{"name":"fake0p1","serial":null,"model":null,"label":null,"fstype":null,"children":null}]}]}"#
                .as_slice(),
        );
        let system = System {
            fs: Box::new(TestFs::default()),
            runner: Box::new(runner),
            mounter: Box::new(TestMounter::default()),
            logger: Box::new(DiscardLogger),
        };
        let mut deployment = default_deployment();
        deployment.disks[0].device = "/dev/fake0".into();
        let result = install(&system, &mut deployment, None, false);
        assert!(result.is_err());
    }

    #[test]
    fn test_install_skips_boot_entry_creation_unless_requested() {
        let system = system_with_clean_device();
        let mut deployment = default_deployment();
        deployment.disks[0].device = "/dev/fake0".into();
        assert!(install(&system, &mut deployment, None, true).is_ok());
    }
}
