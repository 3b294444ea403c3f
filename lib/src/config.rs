//! Strict YAML loading of the on-disk image definition consumed by
//! `slate build`: a directory holding `os.yaml`, `install.yaml`,
//! `release.yaml` and `kubernetes.yaml`, each parsed independently
//! with unknown keys rejected, matching
//! `bootc-lib::install::config::InstallConfigurationToplevel`'s strict
//! parsing discipline (without its TOML-fragment-merging machinery,
//! which this single-directory format has no use for).

use anyhow::{Context, Result};
use camino::Utf8Path;
use fn_error_context::context;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::deployment::{BootConfig, Deployment, Disk, Firmware, Security, Snapshotter};
use crate::manifest::ResolvedManifest;
use crate::platform::Fs;

/// `os.yaml`: the parts of the data model that describe the target
/// system rather than how to deploy onto it.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub(crate) struct OsConfig {
    pub(crate) disks: Vec<Disk>,
    pub(crate) boot_config: BootConfig,
    #[serde(default)]
    pub(crate) firmware: Firmware,
    #[serde(default)]
    pub(crate) security: Security,
    pub(crate) snapshotter: Snapshotter,
}

/// `install.yaml`: options that only matter at install/build time, not
/// part of the persisted deployment shape itself.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub(crate) struct InstallConfig {
    /// `dir://`/`tar://`/`oci://` URI for an overlay tree applied on
    /// top of the unpacked OS.
    #[serde(default)]
    pub(crate) overlay: Option<String>,
    /// Host-relative path to a post-commit configuration script.
    #[serde(default)]
    pub(crate) cfg_script: Option<String>,
}

/// `release.yaml`: a pointer to the release manifest to resolve
/// (§4.7); the manifest content itself is opaque to this layer.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub(crate) struct ReleaseConfig {
    /// `file://` or `oci://` URI of the product or core manifest.
    pub(crate) uri: String,
}

/// `kubernetes.yaml`: kernel command-line additions needed by the
/// pinned Kubernetes distribution (e.g. cgroup configuration). Helm
/// chart/CRD generation itself is a peripheral concern outside this
/// layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub(crate) struct KubernetesConfig {
    #[serde(default)]
    pub(crate) extra_kargs: Vec<String>,
}

/// The full image definition read from a `config-dir`.
#[derive(Debug, Clone)]
pub(crate) struct ImageDefinition {
    pub(crate) os: OsConfig,
    pub(crate) install: InstallConfig,
    pub(crate) release: ReleaseConfig,
    pub(crate) kubernetes: KubernetesConfig,
}

fn load_strict<T: serde::de::DeserializeOwned>(fs: &dyn Fs, path: &Utf8Path) -> Result<T> {
    let bytes = fs.read_to_vec(path).with_context(|| format!("reading {path}"))?;
    serde_yaml::from_slice(&bytes).with_context(|| format!("parsing {path}"))
}

/// Load and strictly parse the four files of `config_dir`'s image
/// definition.
#[context("loading image definition from {config_dir}")]
pub(crate) fn load_image_definition(fs: &dyn Fs, config_dir: &Utf8Path) -> Result<ImageDefinition> {
    Ok(ImageDefinition {
        os: load_strict(fs, &config_dir.join("os.yaml"))?,
        install: load_strict(fs, &config_dir.join("install.yaml"))?,
        release: load_strict(fs, &config_dir.join("release.yaml"))?,
        kubernetes: load_strict(fs, &config_dir.join("kubernetes.yaml"))?,
    })
}

/// Build an in-memory [`Deployment`] from a loaded image definition
/// and its resolved release manifest, ready for `Sanitize`.
pub(crate) fn to_deployment(def: &ImageDefinition, resolved: &ResolvedManifest) -> Result<Deployment> {
    let os = &resolved.core.operating_system;
    let source_os = crate::deployment::ImageSource::from_uri(&format!("oci://{}:{}", os.image, os.version))?;
    let overlay_tree = match &def.install.overlay {
        Some(uri) => crate::deployment::ImageSource::from_uri(uri)?,
        None => crate::deployment::ImageSource::Empty,
    };

    let mut boot_config = def.os.boot_config.clone();
    if !def.kubernetes.extra_kargs.is_empty() {
        if !boot_config.kernel_cmdline.is_empty() {
            boot_config.kernel_cmdline.push(' ');
        }
        boot_config.kernel_cmdline.push_str(&def.kubernetes.extra_kargs.join(" "));
    }

    Ok(Deployment {
        disks: def.os.disks.clone(),
        boot_config,
        firmware: def.os.firmware.clone(),
        security: def.os.security.clone(),
        snapshotter: def.os.snapshotter.clone(),
        source_os,
        overlay_tree,
        cfg_script: def.install.cfg_script.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::TestFs;

    fn write_all(fs: &TestFs, dir: &Utf8Path) {
        fs.write_bytes(
            &dir.join("os.yaml"),
            br#"
disks:
  - device: /dev/fake0
    partitions:
      - label: efi
        role: Efi
        file_system: vfat
        size_mib: 1024
        mount_point: /boot/efi
      - label: system
        role: System
        file_system: btrfs
        size_mib: 0
        mount_point: /
boot_config:
  bootloader: grub
snapshotter:
  name: snapper
"#,
        )
        .unwrap();
        fs.write_bytes(&dir.join("install.yaml"), b"overlay: dir:///srv/overlay\n").unwrap();
        fs.write_bytes(
            &dir.join("release.yaml"),
            b"uri: oci://registry.example/release:1.0.0\n",
        )
        .unwrap();
        fs.write_bytes(&dir.join("kubernetes.yaml"), b"extra_kargs: [\"cgroup_enable=memory\"]\n").unwrap();
    }

    #[test]
    fn test_load_image_definition_roundtrip() {
        let fs = TestFs::default();
        let dir = Utf8Path::new("/config");
        write_all(&fs, dir);
        let def = load_image_definition(&fs, dir).unwrap();
        assert_eq!(def.os.disks.len(), 1);
        assert_eq!(def.install.overlay.as_deref(), Some("dir:///srv/overlay"));
        assert_eq!(def.release.uri, "oci://registry.example/release:1.0.0");
        assert_eq!(def.kubernetes.extra_kargs, vec!["cgroup_enable=memory".to_string()]);
    }

    #[test]
    fn test_rejects_unknown_key() {
        let fs = TestFs::default();
        let dir = Utf8Path::new("/config");
        write_all(&fs, dir);
        fs.write_bytes(&dir.join("install.yaml"), b"overlay: dir:///x\nbogus: true\n").unwrap();
        assert!(load_image_definition(&fs, dir).is_err());
    }
}
