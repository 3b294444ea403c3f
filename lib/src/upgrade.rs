//! Upgrade flow (C6 §4.6): read the live deployment, snapshot the
//! running system, sync new image content into it, reconcile RW
//! volumes and `/etc/fstab`, apply an overlay tree, run hooks while
//! the snapshot is still writable, lock it read-only, then commit.
//!
//! Unlike install, there is no system-partition mount step: the
//! running system's root already *is* the mount the snapshot is taken
//! from.

use std::collections::BTreeMap;

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};

use crate::bootloader;
use crate::deployment::{self, Deployment, ImageSource};
use crate::errors::EngineError;
use crate::platform::System;
use crate::transaction::{pick_snapshotter, run_hooks_in_snapshot, Hook, Transaction, UpgradeHelper};

const LIVE_ROOT: &str = "/";

const CONFIG_SCRIPT_IN_SNAPSHOT: &str = "/etc/config.sh";

/// Options overriding the persisted deployment for this upgrade; any
/// field left `None` keeps the currently-deployed value.
#[derive(Debug, Default)]
pub(crate) struct UpgradeRequest {
    pub(crate) source_os: Option<String>,
    pub(crate) overlay_tree: Option<String>,
    pub(crate) cfg_script: Option<String>,
    pub(crate) excludes: Vec<String>,
}

/// Run the upgrade flow against the deployment persisted at `/`.
pub(crate) fn upgrade(system: &System, request: UpgradeRequest) -> Result<(), EngineError> {
    let mut deployment =
        deployment::parse(system.fs.as_ref(), Utf8Path::new(LIVE_ROOT)).map_err(EngineError::Validation)?;
    apply_overrides(&mut deployment, &request).map_err(EngineError::Validation)?;
    deployment::sanitize(&mut deployment).map_err(EngineError::Validation)?;

    let root = Utf8PathBuf::from(LIVE_ROOT);
    let snapshotter = pick_snapshotter(&deployment, root);
    let helper = snapshotter.init(system, &deployment).map_err(EngineError::Transaction)?;
    let mut trans = snapshotter.start(system).map_err(EngineError::Transaction)?;

    let body = upgrade_body(system, &mut deployment, &trans, helper.as_ref(), &request.excludes);
    match body {
        Ok(()) => {
            snapshotter
                .commit(system, &mut trans, &[], &BTreeMap::new())
                .map_err(EngineError::Transaction)?;
            bootloader::create_efi_boot_entries(system.runner.as_ref(), &deployment).map_err(EngineError::Boot)
        }
        Err(e) => Err(EngineError::Transaction(snapshotter.rollback(system, &mut trans, e))),
    }
}

/// Steps 4–8 of the upgrade flow: sync the new image, merge RW
/// volumes, rewrite `fstab`, apply the overlay tree, run hooks on the
/// still-writable snapshot, then lock it. Everything here runs before
/// `Commit`, which is why it's split out: a failure at any point
/// routes to `Rollback` instead.
fn upgrade_body(
    system: &System,
    deployment: &mut Deployment,
    trans: &Transaction,
    helper: &dyn UpgradeHelper,
    excludes: &[String],
) -> Result<()> {
    let preserve_paths = deployment::rw_volume_paths(deployment);
    helper.sync_image_content(system, trans, &mut deployment.source_os, excludes, &preserve_paths)?;
    helper.merge(system, trans)?;
    helper.update_fstab(system, trans, deployment)?;

    if !deployment.overlay_tree.is_empty() {
        apply_overlay(system, trans, &mut deployment.overlay_tree)?;
    }

    deployment::write_deployment_file(system.fs.as_ref(), deployment, &trans.path)?;

    let mut hooks = Vec::new();
    if let Some(hook) = resolve_config_hook(system, deployment)? {
        hooks.push(hook);
    }
    if let Some(hook) = bootloader::plan_hook(system, deployment, helper)? {
        hooks.push(hook);
    }
    run_hooks_in_snapshot(system, trans, &hooks, &BTreeMap::new())?;

    helper.lock(system, trans)
}

/// Unpack `overlay_tree` directly on top of the synced snapshot,
/// recording its resulting digest the same way `sync_image_content`
/// does for the base OS.
fn apply_overlay(system: &System, trans: &Transaction, overlay_tree: &mut ImageSource) -> Result<()> {
    let unpacker = crate::unpack::pick_unpacker(overlay_tree)?;
    let cancel = tokio_util::sync::CancellationToken::new();
    let digest = unpacker.unpack(system, &trans.path, &[], &cancel)?;
    overlay_tree.set_digest(digest);
    Ok(())
}

fn resolve_config_hook(system: &System, deployment: &Deployment) -> Result<Option<Hook>> {
    let Some(cfg_script) = &deployment.cfg_script else {
        return Ok(None);
    };
    let host_script = Utf8PathBuf::from(cfg_script);
    if system.fs.stat(&host_script).is_err() {
        return Ok(None);
    }
    Ok(Some(Hook { host_script, in_snapshot_path: Utf8PathBuf::from(CONFIG_SCRIPT_IN_SNAPSHOT) }))
}

/// Apply `request`'s overrides onto a freshly-parsed deployment.
fn apply_overrides(deployment: &mut Deployment, request: &UpgradeRequest) -> Result<()> {
    if let Some(uri) = &request.source_os {
        deployment.source_os = ImageSource::from_uri(uri)?;
    }
    if let Some(uri) = &request.overlay_tree {
        deployment.overlay_tree = ImageSource::from_uri(uri)?;
    }
    if let Some(cfg_script) = &request.cfg_script {
        deployment.cfg_script = Some(cfg_script.clone());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deployment::{default_deployment, write_deployment_file};
    use crate::platform::System;

    fn seed_live_deployment(system: &System) -> Deployment {
        let mut deployment = default_deployment();
        deployment.disks[0].device = "/dev/fake0".into();
        deployment::sanitize(&mut deployment).unwrap();
        write_deployment_file(system.fs.as_ref(), &deployment, Utf8Path::new(LIVE_ROOT)).unwrap();
        deployment
    }

    #[test]
    fn test_apply_overrides_replaces_only_requested_fields() {
        let mut deployment = default_deployment();
        let original_cfg = deployment.cfg_script.clone();
        let request = UpgradeRequest {
            source_os: Some("oci://example/os:2".into()),
            overlay_tree: None,
            cfg_script: None,
            excludes: Vec::new(),
        };
        apply_overrides(&mut deployment, &request).unwrap();
        assert!(deployment.source_os.is_oci());
        assert_eq!(deployment.overlay_tree, ImageSource::Empty);
        assert_eq!(deployment.cfg_script, original_cfg);
    }

    #[test]
    fn test_resolve_config_hook_none_when_unset() {
        let system = System::test();
        let deployment = default_deployment();
        assert!(resolve_config_hook(&system, &deployment).unwrap().is_none());
    }

    #[test]
    fn test_resolve_config_hook_none_when_missing_from_disk() {
        let system = System::test();
        let mut deployment = default_deployment();
        deployment.cfg_script = Some("/srv/config.sh".into());
        assert!(resolve_config_hook(&system, &deployment).unwrap().is_none());
    }

    #[test]
    fn test_upgrade_runs_end_to_end_against_seeded_deployment() {
        let system = System::test();
        seed_live_deployment(&system);
        let request = UpgradeRequest {
            source_os: Some("oci://example/os:2".into()),
            overlay_tree: None,
            cfg_script: None,
            excludes: Vec::new(),
        };
        let result = upgrade(&system, request);
        assert!(result.is_ok(), "{result:?}");
    }
}
