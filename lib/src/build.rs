//! Image-build flow (`slate build`): resolve an on-disk image
//! definition and its release manifest into a [`Deployment`], then run
//! the install machinery against a loop device instead of a physical
//! disk.
//!
//! §2's data-flow note for `build` is: "identical [to install], but C3
//! targets a loop-backed raw file instead of a physical disk" — so
//! this module supplies the loop-file plumbing and otherwise defers
//! entirely to [`crate::install::install_onto_declared_device`]. It
//! skips `install`'s firmware boot-entry step: a raw image's eventual
//! NVRAM entries belong to whatever host it's written to, not this
//! build host.

use anyhow::{anyhow, bail, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use crate::config;
use crate::deployment::{self, Deployment};
use crate::disk::BlockdevRunnerBridge;
use crate::errors::EngineError;
use crate::manifest::{self, FileReader, OciReader, Reader, ResolvedManifest};
use crate::platform::System;

/// Where [`OciReader`] caches an unpacked release-manifest image.
const MANIFEST_CACHE_ROOT: &str = "/var/tmp/slate/manifest-cache";

/// Load `config_dir`'s image definition, resolve its release manifest,
/// and fold both into a sanitized [`Deployment`] ready to build.
pub(crate) fn resolve_deployment(system: &System, config_dir: &Utf8Path) -> Result<Deployment, EngineError> {
    let def = config::load_image_definition(system.fs.as_ref(), config_dir).map_err(EngineError::Validation)?;
    let resolved = resolve_release(system, &def.release.uri).map_err(EngineError::Validation)?;
    let mut deployment = config::to_deployment(&def, &resolved).map_err(EngineError::Validation)?;
    deployment::sanitize(&mut deployment).map_err(EngineError::Validation)?;
    Ok(deployment)
}

#[context("resolving release manifest {uri}")]
fn resolve_release(system: &System, uri: &str) -> Result<ResolvedManifest> {
    if uri.starts_with("file://") {
        let reader = FileReader { fs: system.fs.as_ref() };
        manifest::resolve(&reader, uri)
    } else if uri.starts_with("oci://") {
        let reader = OciReader { system, cache_root: Utf8PathBuf::from(MANIFEST_CACHE_ROOT) };
        manifest::resolve(&reader, uri)
    } else {
        bail!("unsupported release manifest URI scheme: {uri}")
    }
}

/// Build a raw disk image at `output`: create a file sized to the
/// deployment's single disk, attach it as a loop device, and run the
/// install flow onto that loop device exactly as it would run onto a
/// physical one.
///
/// Requires exactly one disk with every partition concretely sized —
/// there is no physical disk here to bound a trailing zero-sized
/// partition against.
pub(crate) fn build_raw_image(system: &System, mut deployment: Deployment, output: &Utf8Path) -> Result<(), EngineError> {
    let disk_count = deployment.disks.len();
    let disk = deployment
        .disks
        .first()
        .filter(|_| disk_count == 1)
        .ok_or_else(|| EngineError::Validation(anyhow!("raw image build supports exactly one disk, found {disk_count}")))?;
    if disk.partitions.iter().any(|p| p.size_mib == 0) {
        return Err(EngineError::Validation(anyhow!(
            "raw image build requires every partition to declare a concrete size_mib"
        )));
    }
    let total_size_mib: u64 = disk.partitions.iter().map(|p| p.size_mib).sum();

    let blockdev_runner = BlockdevRunnerBridge::new(system.runner.as_ref());
    slate_blockdev::create_empty_file(&blockdev_runner, output, total_size_mib, false)
        .map_err(EngineError::Preparation)?;

    let loop_dev = attach_loop_device(system, output).map_err(EngineError::Preparation)?;
    deployment.disks[0].device = loop_dev.clone();

    let config_script = deployment.cfg_script.clone().map(Utf8PathBuf::from);
    let result =
        crate::install::install_onto_declared_device(system, &mut deployment, config_script.as_deref());
    if let Err(e) = detach_loop_device(system, &loop_dev) {
        system.logger.warn(&format!("failed to detach loop device {loop_dev}: {e:#}"));
    }
    result
}

/// Build installer media (`slate build-iso`): produce a raw disk image
/// the same way [`build_raw_image`] does, then squash the output
/// directory into a single compressed image for distribution.
///
/// This packages the raw image as installer media rather than
/// authoring a bootable optical-disc filesystem outright — the
/// dependency stack carries `mksquashfs` but no ISO-9660 authoring
/// tool, so squashfs is the closest available "installer media"
/// artifact `slate-blockdev` already knows how to produce.
pub(crate) fn build_installer_iso(
    system: &System,
    deployment: Deployment,
    output_dir: &Utf8Path,
    squashfs_options: &[String],
) -> Result<(), EngineError> {
    system.fs.mkdir_all(output_dir).map_err(EngineError::Preparation)?;
    let raw_path = output_dir.join("disk.raw");
    build_raw_image(system, deployment, &raw_path)?;

    let squashfs_path = output_dir.join("slate-installer.squashfs");
    let blockdev_runner = BlockdevRunnerBridge::new(system.runner.as_ref());
    slate_blockdev::create_squashfs(&blockdev_runner, output_dir, &squashfs_path, squashfs_options)
        .map_err(EngineError::Preparation)
}

/// Attach `image` to a free loop device with partition scanning
/// enabled (`-P`), so the freshly-partitioned disk's nodes appear as
/// `/dev/loopNpM` the same way a physical disk's partitions would.
#[context("attaching {image} as a loop device")]
fn attach_loop_device(system: &System, image: &Utf8Path) -> Result<String> {
    let out = system.runner.run("Attaching loop device", "losetup", &["--show", "-f", "-P", image.as_str()])?;
    let loop_dev = String::from_utf8(out).context("non-utf8 losetup output")?;
    Ok(loop_dev.trim().to_string())
}

fn detach_loop_device(system: &System, loop_dev: &str) -> Result<()> {
    system.runner.run_quiet("Detaching loop device", "losetup", &["-d", loop_dev])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deployment::default_deployment;
    use crate::platform::{Fs, System};

    fn write_config_dir(fs: &dyn Fs, dir: &Utf8Path) {
        fs.write_bytes(
            &dir.join("os.yaml"),
            br#"
disks:
  - device: /dev/fake0
    partitions:
      - label: efi
        role: Efi
        file_system: vfat
        size_mib: 100
        mount_point: /boot/efi
      - label: system
        role: System
        file_system: btrfs
        size_mib: 4096
        mount_point: /
boot_config:
  bootloader: grub
snapshotter:
  name: snapper
"#,
        )
        .unwrap();
        fs.write_bytes(&dir.join("install.yaml"), b"{}\n").unwrap();
        fs.write_bytes(&dir.join("release.yaml"), b"uri: file:///release.yaml\n").unwrap();
        fs.write_bytes(&dir.join("kubernetes.yaml"), b"{}\n").unwrap();
        fs.write_bytes(
            Utf8Path::new("/release.yaml"),
            br#"
operatingSystem:
  image: registry.example/os
  version: "1.0.0"
kubernetes:
  rke2:
    image: registry.example/rke2
    version: "v1.30.0"
"#,
        )
        .unwrap();
    }

    #[test]
    fn test_resolve_deployment_reads_config_dir_and_manifest() {
        let system = System::test();
        let dir = Utf8Path::new("/config");
        write_config_dir(system.fs.as_ref(), dir);
        let deployment = resolve_deployment(&system, dir).unwrap();
        assert!(deployment.source_os.is_oci());
        assert_eq!(deployment.source_os.uri(), "registry.example/os:1.0.0");
    }

    #[test]
    fn test_build_raw_image_rejects_multiple_disks() {
        let system = System::test();
        let mut deployment = default_deployment();
        deployment.disks.push(deployment.disks[0].clone());
        let result = build_raw_image(&system, deployment, Utf8Path::new("/out.raw"));
        assert!(result.is_err());
    }

    #[test]
    fn test_build_raw_image_rejects_zero_sized_partition() {
        let system = System::test();
        let deployment = default_deployment();
        let result = build_raw_image(&system, deployment, Utf8Path::new("/out.raw"));
        assert!(result.is_err());
    }

    fn concrete_sized_deployment() -> Deployment {
        let mut deployment = default_deployment();
        deployment.disks[0].partitions[1].size_mib = 4096;
        deployment
    }

    #[test]
    fn test_build_installer_iso_produces_raw_image_and_squashfs() {
        let system = System::test();
        let deployment = concrete_sized_deployment();
        // `create_empty_file` writes through the real filesystem (it
        // backs `qemu-img`/sparse-file creation, not a capability this
        // crate virtualises), so the output directory has to actually
        // exist on disk for the success path.
        let tmp = tempfile::tempdir().unwrap();
        let output_dir = Utf8PathBuf::from_path_buf(tmp.path().to_owned()).unwrap();
        let result = build_installer_iso(&system, deployment, &output_dir, &[]);
        assert!(result.is_ok(), "{result:?}");
    }

    #[test]
    fn test_build_installer_iso_rejects_multiple_disks() {
        let system = System::test();
        let mut deployment = concrete_sized_deployment();
        deployment.disks.push(deployment.disks[0].clone());
        let result = build_installer_iso(&system, deployment, Utf8Path::new("/out/iso"), &[]);
        assert!(result.is_err());
    }
}
