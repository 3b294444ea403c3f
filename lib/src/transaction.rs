//! Snapshot transactions: create a numbered btrfs snapshot of the
//! system subvolume, run hooks under a bind-mounted chroot, and
//! atomically promote or discard it.
//!
//! The snapshotter is injectable ([`SnapshotTransaction`]); `snapper`
//! is the default backend, `overwrite` is a no-snapshot degraded mode
//! used for debugging (see [`crate::deployment::SnapshotterKind`]).

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::io::{BufRead, BufReader};

use anyhow::{bail, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use crate::deployment::{Deployment, RwVolume, SnapshotterKind};
use crate::platform::{Logger, System};

/// One snapshot, from `Start` to `Commit`/`Rollback`.
#[derive(Debug, Clone)]
pub(crate) struct Transaction {
    pub(crate) id: u64,
    pub(crate) path: Utf8PathBuf,
    pub(crate) in_progress: bool,
}

/// A post-unpack hook run inside the snapshot's chroot: either the
/// user-supplied `config.sh`, or the bootloader's own configuration
/// step, which the caller appends as a second entry in `commit`'s
/// hook list.
pub(crate) struct Hook {
    /// Host-absolute path to the script to bind-mount and execute.
    pub(crate) host_script: Utf8PathBuf,
    /// Path the script is bound to inside the snapshot.
    pub(crate) in_snapshot_path: Utf8PathBuf,
}

/// Methods usable only while a transaction is in progress, returned by
/// [`SnapshotTransaction::init`].
pub(crate) trait UpgradeHelper: Debug {
    /// Unpack `source` into `trans`'s path with [`crate::unpack`]'s
    /// synchronised mode, recording the resulting digest onto `source`.
    /// `preserve_paths` (the deployment's declared RW volume mount
    /// points) are folded into the sync's delete-exclude list alongside
    /// `/etc` and the deployment file, so a writable path never gets
    /// deleted for not appearing in the new image.
    fn sync_image_content(
        &self,
        system: &System,
        trans: &Transaction,
        source: &mut crate::deployment::ImageSource,
        excludes: &[String],
        preserve_paths: &[String],
    ) -> Result<()>;

    /// Reconcile RW volume contents from the previous snapshot: for
    /// volumes declared `snapshotted`, materialise a fresh per-snapshot
    /// subvolume seeded from the volume's current contents. Volumes
    /// that are not `snapshotted` are a single subvolume shared across
    /// snapshots and need no action here.
    fn merge(&self, system: &System, trans: &Transaction) -> Result<()>;

    /// Rewrite `/etc/fstab` inside the snapshot from the live deployment.
    fn update_fstab(&self, system: &System, trans: &Transaction, deployment: &Deployment) -> Result<()>;

    /// Demote the snapshot to read-only.
    fn lock(&self, system: &System, trans: &Transaction) -> Result<()>;

    /// Compute the kernel command line for this snapshot (base cmdline
    /// plus FIPS additions if the deployment's security policy calls
    /// for them).
    fn generate_kernel_cmdline(&self, deployment: &Deployment) -> String;
}

/// The transactional envelope over a snapshot store.
pub(crate) trait SnapshotTransaction: Debug {
    /// Prepare the snapshot store on the system partition (idempotent).
    fn init(&self, system: &System, deployment: &Deployment) -> Result<Box<dyn UpgradeHelper>>;

    /// Create a new snapshot, numbered one above the current max.
    /// Exclusive: fails if another transaction is already in progress.
    fn start(&self, system: &System) -> Result<Transaction>;

    /// Run `hooks` in order (config script, then bootloader
    /// configuration) under the bind-mounted chroot described by
    /// `binds`, then promote the snapshot to the default boot target.
    fn commit(
        &self,
        system: &System,
        trans: &mut Transaction,
        hooks: &[Hook],
        binds: &BTreeMap<Utf8PathBuf, Utf8PathBuf>,
    ) -> Result<()>;

    /// Discard the in-progress snapshot, surfacing `cause`.
    fn rollback(&self, system: &System, trans: &mut Transaction, cause: anyhow::Error) -> anyhow::Error;
}

/// The default backend: snapshots are btrfs subvolumes managed via
/// `snapper`/`btrfs` directly.
#[derive(Debug)]
pub(crate) struct Snapper {
    /// Mountpoint of the system partition's top-level btrfs subvolume.
    pub(crate) root: Utf8PathBuf,
}

impl Snapper {
    pub(crate) fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn snapshots_dir(&self) -> Utf8PathBuf {
        self.root.join(".snapshots")
    }

    /// The next snapshot id, tracked in a small counter file rather
    /// than by scanning the snapshot directory: a rolled-back or
    /// deleted snapshot must not have its id reused, and `snapper`
    /// itself keeps this bookkeeping out-of-band from the subvolume
    /// tree for the same reason.
    fn next_id(&self, system: &System) -> Result<u64> {
        let counter = self.snapshots_dir().join(".next_id");
        let current = match system.fs.read_to_vec(&counter) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).trim().parse::<u64>().unwrap_or(0),
            Err(_) => 0,
        };
        let next = current + 1;
        system.fs.write_bytes(&counter, next.to_string().as_bytes())?;
        Ok(next)
    }
}

impl SnapshotTransaction for Snapper {
    #[context("initialising snapper snapshot store at {}", self.root)]
    fn init(&self, system: &System, deployment: &Deployment) -> Result<Box<dyn UpgradeHelper>> {
        let dir = self.snapshots_dir();
        system.fs.mkdir_all(&dir)?;
        let rw_volumes = crate::deployment::system_rw_volumes(deployment);
        Ok(Box::new(SnapperHelper { root: self.root.clone(), rw_volumes }))
    }

    #[context("starting a new snapshot under {}", self.root)]
    fn start(&self, system: &System) -> Result<Transaction> {
        let in_progress_marker = self.snapshots_dir().join(".in_progress");
        if system.fs.stat(&in_progress_marker).is_ok() {
            bail!("a snapshot transaction is already in progress");
        }
        let id = self.next_id(system)?;
        let path = self.snapshots_dir().join(id.to_string());
        system.runner.run_quiet(
            &format!("Creating snapshot {id}"),
            "btrfs",
            &["subvolume", "snapshot", self.root.as_str(), path.as_str()],
        )?;
        // `btrfs subvolume snapshot` creates `path` as a side effect of
        // the runner call above; record it through `Fs` too so later
        // writes into the snapshot (fstab, deployment file) work
        // against the in-memory test filesystem the same way they do
        // against the real one.
        system.fs.mkdir_all(&path)?;
        system.fs.write_bytes(&in_progress_marker, id.to_string().as_bytes())?;
        Ok(Transaction { id, path, in_progress: true })
    }

    #[context("committing snapshot {}", trans.id)]
    fn commit(
        &self,
        system: &System,
        trans: &mut Transaction,
        hooks: &[Hook],
        binds: &BTreeMap<Utf8PathBuf, Utf8PathBuf>,
    ) -> Result<()> {
        run_hooks(system, &trans.path, hooks, binds)?;
        system.runner.run_quiet(
            "Setting default subvolume",
            "btrfs",
            &["subvolume", "set-default", trans.path.as_str()],
        )?;
        system.fs.remove(&self.snapshots_dir().join(".in_progress")).ok();
        trans.in_progress = false;
        Ok(())
    }

    #[context("rolling back snapshot {}", trans.id)]
    fn rollback(&self, system: &System, trans: &mut Transaction, cause: anyhow::Error) -> anyhow::Error {
        if let Err(e) = system.runner.run_quiet(
            &format!("Deleting snapshot {}", trans.id),
            "btrfs",
            &["subvolume", "delete", trans.path.as_str()],
        ) {
            system.logger.warn(&format!("rollback cleanup failed for snapshot {}: {e:#}", trans.id));
        }
        system.fs.remove_all(&trans.path).ok();
        system.fs.remove(&self.snapshots_dir().join(".in_progress")).ok();
        trans.in_progress = false;
        cause
    }
}

#[derive(Debug)]
struct SnapperHelper {
    root: Utf8PathBuf,
    /// RW volumes declared on the system partition at `init` time.
    rw_volumes: Vec<RwVolume>,
}

impl UpgradeHelper for SnapperHelper {
    fn sync_image_content(
        &self,
        system: &System,
        trans: &Transaction,
        source: &mut crate::deployment::ImageSource,
        excludes: &[String],
        preserve_paths: &[String],
    ) -> Result<()> {
        let unpacker = crate::unpack::pick_unpacker(source)?;
        let mut delete_excludes = vec![
            "etc".to_string(),
            crate::deployment::DEPLOYMENT_FILE_PATH.to_string(),
        ];
        delete_excludes.extend(preserve_paths.iter().map(|p| p.trim_start_matches('/').to_string()));
        let cancel = tokio_util::sync::CancellationToken::new();
        let digest = unpacker.synched_unpack(system, &trans.path, excludes, &delete_excludes, &cancel)?;
        source.set_digest(digest);
        Ok(())
    }

    #[context("merging RW volumes into snapshot {}", trans.id)]
    fn merge(&self, system: &System, trans: &Transaction) -> Result<()> {
        for volume in &self.rw_volumes {
            if !volume.snapshotted {
                // A single subvolume shared across snapshots; the new
                // snapshot reaches it at the same top-level path.
                continue;
            }
            let rel = volume.path.trim_start_matches('/');
            let previous = self.root.join(rel);
            let target = trans.path.join(rel);
            if let Some(parent) = target.parent() {
                system.fs.mkdir_all(parent)?;
            }
            system.runner.run_quiet(
                &format!("Reconciling RW volume {} into snapshot {}", volume.path, trans.id),
                "btrfs",
                &["subvolume", "snapshot", previous.as_str(), target.as_str()],
            )?;
        }
        Ok(())
    }

    fn update_fstab(&self, system: &System, trans: &Transaction, deployment: &Deployment) -> Result<()> {
        render_fstab(system, trans, deployment)
    }

    fn lock(&self, system: &System, trans: &Transaction) -> Result<()> {
        system.runner.run_quiet(
            "Locking snapshot read-only",
            "btrfs",
            &["property", "set", trans.path.as_str(), "ro", "true"],
        )
    }

    fn generate_kernel_cmdline(&self, deployment: &Deployment) -> String {
        let mut cmdline = deployment.boot_config.kernel_cmdline.clone();
        if deployment.security.policy == crate::deployment::SecurityPolicy::Fips {
            let efi_label = deployment
                .disks
                .iter()
                .flat_map(|d| &d.partitions)
                .find(|p| p.role == crate::deployment::PartitionRole::Efi)
                .map(|p| p.label.as_str())
                .unwrap_or("EFI");
            if !cmdline.is_empty() {
                cmdline.push(' ');
            }
            cmdline.push_str(&format!("fips=1 boot=LABEL={efi_label}"));
        }
        cmdline
    }
}

/// The degraded backend for `Snapshotter::Overwrite`: no subvolumes,
/// no history, the "snapshot" is the live root itself. Debugging only.
#[derive(Debug)]
pub(crate) struct Overwrite {
    pub(crate) root: Utf8PathBuf,
}

impl SnapshotTransaction for Overwrite {
    fn init(&self, _system: &System, _deployment: &Deployment) -> Result<Box<dyn UpgradeHelper>> {
        Ok(Box::new(OverwriteHelper { root: self.root.clone() }))
    }

    fn start(&self, _system: &System) -> Result<Transaction> {
        Ok(Transaction { id: 0, path: self.root.clone(), in_progress: true })
    }

    fn commit(
        &self,
        system: &System,
        trans: &mut Transaction,
        hooks: &[Hook],
        binds: &BTreeMap<Utf8PathBuf, Utf8PathBuf>,
    ) -> Result<()> {
        run_hooks(system, &trans.path, hooks, binds)?;
        trans.in_progress = false;
        Ok(())
    }

    fn rollback(&self, _system: &System, trans: &mut Transaction, cause: anyhow::Error) -> anyhow::Error {
        trans.in_progress = false;
        cause
    }
}

#[derive(Debug)]
struct OverwriteHelper {
    root: Utf8PathBuf,
}

impl UpgradeHelper for OverwriteHelper {
    fn sync_image_content(
        &self,
        system: &System,
        trans: &Transaction,
        source: &mut crate::deployment::ImageSource,
        excludes: &[String],
        _preserve_paths: &[String],
    ) -> Result<()> {
        // `overwrite` has no synchronised delete pass to exclude paths
        // from; the whole root is simply overwritten in place.
        let unpacker = crate::unpack::pick_unpacker(source)?;
        let cancel = tokio_util::sync::CancellationToken::new();
        let digest = unpacker.unpack(system, &trans.path, excludes, &cancel)?;
        source.set_digest(digest);
        Ok(())
    }

    fn merge(&self, _system: &System, _trans: &Transaction) -> Result<()> {
        // `overwrite` degrades to ext4 with no RW volumes; nothing to reconcile.
        Ok(())
    }

    fn update_fstab(&self, system: &System, trans: &Transaction, deployment: &Deployment) -> Result<()> {
        let _ = &self.root;
        render_fstab(system, trans, deployment)
    }

    fn lock(&self, _system: &System, _trans: &Transaction) -> Result<()> {
        Ok(())
    }

    fn generate_kernel_cmdline(&self, deployment: &Deployment) -> String {
        deployment.boot_config.kernel_cmdline.clone()
    }
}

/// Render `/etc/fstab` for `deployment`'s mounted partitions into
/// `trans`'s snapshot.
fn render_fstab(system: &System, trans: &Transaction, deployment: &Deployment) -> Result<()> {
    let mut fstab = String::new();
    for disk in &deployment.disks {
        for part in &disk.partitions {
            if part.mount_point.is_empty() {
                continue;
            }
            fstab.push_str(&format!(
                "UUID={} {} {} defaults 0 {}\n",
                part.uuid,
                part.mount_point,
                part.file_system,
                if part.mount_point == "/" { 1 } else { 2 }
            ));
        }
    }
    system.fs.write_bytes(&trans.path.join("etc/fstab"), fstab.as_bytes())
}

/// Run `hooks` inside `trans`'s snapshot ahead of `Commit`, for flows
/// (upgrade) that need the snapshot still writable when the hook runs
/// but must `Lock` it before the final `Commit` call sets the default
/// subvolume; `Commit` itself also accepts hooks for flows (install)
/// that have no lock step to interleave.
pub(crate) fn run_hooks_in_snapshot(
    system: &System,
    trans: &Transaction,
    hooks: &[Hook],
    binds: &BTreeMap<Utf8PathBuf, Utf8PathBuf>,
) -> Result<()> {
    run_hooks(system, &trans.path, hooks, binds)
}

/// Pick the snapshotter backend named by the deployment.
pub(crate) fn pick_snapshotter(deployment: &Deployment, system_root: impl Into<Utf8PathBuf>) -> Box<dyn SnapshotTransaction> {
    let root = system_root.into();
    match deployment.snapshotter.name {
        SnapshotterKind::Snapper => Box::new(Snapper::new(root)),
        SnapshotterKind::Overwrite => Box::new(Overwrite { root }),
    }
}

/// The standard bind set established before every hook, in addition to
/// the caller-supplied `binds`.
fn standard_binds() -> [&'static str; 4] {
    ["/dev", "/dev/pts", "/proc", "/sys"]
}

/// Bind-mount `/dev`, `/dev/pts`, `/proc`, `/sys`, plus `binds`, into
/// `snapshot`, run each of `hooks` in order inside a chroot of
/// `snapshot`, capture its stdout/stderr line-by-line at Debug, then
/// unmount everything in reverse order regardless of outcome. An empty
/// `hooks` slice still establishes and tears down the standard binds,
/// matching `Commit`'s unconditional bind-mount contract.
///
/// Binds are tracked in a plain `Vec` rather than a [`CleanupStack`]:
/// the teardown needs `system.runner` to issue `umount`, and a
/// cleanup closure can't borrow it without requiring a `'static`
/// bound that `System` (borrowed for the duration of one operation)
/// doesn't satisfy.
fn run_hooks(
    system: &System,
    snapshot: &Utf8Path,
    hooks: &[Hook],
    binds: &BTreeMap<Utf8PathBuf, Utf8PathBuf>,
) -> Result<()> {
    let mut mounted = Vec::new();
    let result = (|| -> Result<()> {
        for host in standard_binds() {
            bind(system, Utf8Path::new(host), &snapshot.join(host.trim_start_matches('/')), &mut mounted)?;
        }
        for (host, in_snapshot) in binds {
            let target = snapshot.join(in_snapshot.as_str().trim_start_matches('/'));
            bind(system, host, &target, &mut mounted)?;
        }
        for hook in hooks {
            let hook_target = snapshot.join(hook.in_snapshot_path.as_str().trim_start_matches('/'));
            bind(system, &hook.host_script, &hook_target, &mut mounted)?;
            exec_hook_in_chroot(system, snapshot, &hook.in_snapshot_path)?;
        }
        Ok(())
    })();

    for target in mounted.iter().rev() {
        if let Err(e) = system.runner.run_quiet(&format!("Unmounting {target}"), "umount", &[target.as_str()]) {
            system.logger.warn(&format!("failed to unmount {target}: {e:#}"));
        }
    }

    result
}

fn bind(system: &System, host: &Utf8Path, target: &Utf8Path, mounted: &mut Vec<Utf8PathBuf>) -> Result<()> {
    if let Some(parent) = target.parent() {
        system.fs.mkdir_all(parent)?;
    }
    system
        .runner
        .run_quiet(&format!("Bind-mounting {host} at {target}"), "mount", &["--bind", host.as_str(), target.as_str()])
        .with_context(|| format!("bind-mounting {host} onto {target}"))?;
    mounted.push(target.to_owned());
    Ok(())
}

/// Re-exec this binary under `internal-exec-in-chroot`, which performs
/// the actual `chroot`/`chdir`/exec (see [`exec_in_chroot`]).
#[context("running hook inside chroot of {snapshot}")]
fn exec_hook_in_chroot(system: &System, snapshot: &Utf8Path, script: &Utf8Path) -> Result<()> {
    let output = system.runner.run(
        "Running hook",
        "/proc/self/exe",
        &["internal-exec-in-chroot", snapshot.as_str(), script.as_str()],
    )?;
    for line in BufReader::new(output.as_slice()).lines().map_while(std::io::Result::ok) {
        system.logger.debug(&line);
    }
    Ok(())
}

/// The hidden re-exec entry point dispatched from `main` before normal
/// CLI parsing: `chroot`s into `snapshot` and execs `script`. This is
/// the only place in the crate that calls `chroot`; everything else
/// reaches the filesystem through [`crate::platform::Fs`].
pub(crate) fn exec_in_chroot(args: &[String]) -> Result<()> {
    let [snapshot, script] = args else {
        bail!("internal-exec-in-chroot expects exactly two arguments");
    };
    rustix::process::chroot(snapshot.as_str()).context("chroot")?;
    rustix::process::chdir("/").context("chdir")?;
    use std::os::unix::process::CommandExt;
    Err(std::process::Command::new(script).exec()).context("exec")?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deployment::{default_deployment, SecurityPolicy};
    use crate::platform::System;

    #[test]
    fn test_snapper_start_requires_init_dir_but_is_idempotent_on_reinit() {
        let system = System::test();
        let snapper = Snapper::new("/mnt/system");
        let deployment = default_deployment();
        snapper.init(&system, &deployment).unwrap();
        snapper.init(&system, &deployment).unwrap();
        let trans = snapper.start(&system).unwrap();
        assert_eq!(trans.id, 1);
        assert!(trans.in_progress);
    }

    #[test]
    fn test_snapper_rejects_concurrent_transactions() {
        let system = System::test();
        let snapper = Snapper::new("/mnt/system");
        snapper.init(&system, &default_deployment()).unwrap();
        let _first = snapper.start(&system).unwrap();
        assert!(snapper.start(&system).is_err());
    }

    #[test]
    fn test_rollback_clears_in_progress_marker() {
        let system = System::test();
        let snapper = Snapper::new("/mnt/system");
        snapper.init(&system, &default_deployment()).unwrap();
        let mut trans = snapper.start(&system).unwrap();
        let err = snapper.rollback(&system, &mut trans, anyhow::anyhow!("boom"));
        assert_eq!(err.to_string(), "boom");
        assert!(!trans.in_progress);
        let trans2 = snapper.start(&system).unwrap();
        assert_eq!(trans2.id, 2);
    }

    #[test]
    fn test_generate_kernel_cmdline_appends_fips() {
        let helper = SnapperHelper { root: "/mnt/system".into(), rw_volumes: Vec::new() };
        let mut deployment = default_deployment();
        deployment.boot_config.kernel_cmdline = "quiet".into();
        deployment.security.policy = SecurityPolicy::Fips;
        deployment.disks[0].partitions[0].label = "efi".into();
        let cmdline = helper.generate_kernel_cmdline(&deployment);
        assert_eq!(cmdline, "quiet fips=1 boot=LABEL=efi");
    }

    #[test]
    fn test_merge_snapshots_snapshotted_volumes_but_skips_shared_ones() {
        use std::cell::RefCell;
        use std::rc::Rc;

        #[derive(Debug, Default)]
        struct RecordingRunner {
            calls: Rc<RefCell<Vec<(String, Vec<String>)>>>,
        }
        impl crate::platform::Runner for RecordingRunner {
            fn run(&self, _description: &str, cmd: &str, args: &[&str]) -> Result<Vec<u8>> {
                self.calls.borrow_mut().push((cmd.to_string(), args.iter().map(|s| s.to_string()).collect()));
                Ok(Vec::new())
            }
            fn run_with_env(
                &self,
                _description: &str,
                cmd: &str,
                args: &[&str],
                _env: &[(&str, &str)],
            ) -> Result<Vec<u8>> {
                self.run(_description, cmd, args)
            }
        }

        let calls = Rc::new(RefCell::new(Vec::new()));
        let system = System {
            fs: Box::new(crate::platform::TestFs::default()),
            runner: Box::new(RecordingRunner { calls: calls.clone() }),
            mounter: Box::new(crate::platform::TestMounter::default()),
            logger: Box::new(crate::platform::DiscardLogger),
        };
        let helper = SnapperHelper {
            root: "/mnt/system".into(),
            rw_volumes: vec![
                RwVolume { path: "/var".into(), snapshotted: true },
                RwVolume { path: "/home".into(), snapshotted: false },
            ],
        };
        let trans = Transaction { id: 2, path: "/mnt/system/.snapshots/2".into(), in_progress: true };
        helper.merge(&system, &trans).unwrap();

        let recorded = calls.borrow();
        assert_eq!(recorded.len(), 1);
        let (cmd, args) = &recorded[0];
        assert_eq!(cmd, "btrfs");
        assert!(args.contains(&"/mnt/system/var".to_string()));
        assert!(args.contains(&"/mnt/system/.snapshots/2/var".to_string()));
        assert!(!args.iter().any(|a| a.contains("home")));
    }
}
