//! Implementation of the `slate status` CLI command: report the
//! currently deployed description plus the snapshot it was committed
//! from. Read-only, grounded on the live `/etc/elemental/deployment.yaml`
//! — there's no ostree sysroot here, so "status" is just "what does
//! the persisted deployment say".

use anyhow::{Context, Result};
use camino::Utf8Path;
use serde::Serialize;

use crate::deployment::{Deployment, ImageSource};
use crate::platform::System;

/// A deployment's image source, reduced to what's worth printing.
#[derive(Debug, Serialize)]
struct SourceStatus {
    uri: String,
    digest: String,
}

impl From<&ImageSource> for SourceStatus {
    fn from(source: &ImageSource) -> Self {
        Self { uri: source.uri().to_string(), digest: source.digest().to_string() }
    }
}

/// Representation of the live deployment suitable for serialization.
#[derive(Debug, Serialize)]
struct DeploymentStatus {
    source_os: SourceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    overlay_tree: Option<SourceStatus>,
    bootloader: String,
    kernel_cmdline: String,
    snapshotter: String,
}

impl From<&Deployment> for DeploymentStatus {
    fn from(deployment: &Deployment) -> Self {
        Self {
            source_os: SourceStatus::from(&deployment.source_os),
            overlay_tree: (!deployment.overlay_tree.is_empty()).then(|| SourceStatus::from(&deployment.overlay_tree)),
            bootloader: format!("{:?}", deployment.boot_config.bootloader),
            kernel_cmdline: deployment.boot_config.kernel_cmdline.clone(),
            snapshotter: format!("{:?}", deployment.snapshotter.name),
        }
    }
}

/// Print the deployment persisted at `/etc/elemental/deployment.yaml`,
/// as JSON if `json` is set, otherwise as a short human summary.
pub(crate) fn status(system: &System, json: bool) -> Result<()> {
    let deployment = crate::deployment::parse(system.fs.as_ref(), Utf8Path::new("/"))
        .context("reading the installed deployment")?;
    let status = DeploymentStatus::from(&deployment);

    if json {
        let out = std::io::stdout();
        serde_json::to_writer_pretty(out.lock(), &status).context("writing status as JSON")?;
        println!();
        return Ok(());
    }

    println!("Source: {}", status.source_os.uri);
    if !status.source_os.digest.is_empty() {
        println!("  Digest: {}", status.source_os.digest);
    }
    if let Some(overlay) = &status.overlay_tree {
        println!("Overlay: {}", overlay.uri);
    }
    println!("Bootloader: {}", status.bootloader);
    if !status.kernel_cmdline.is_empty() {
        println!("Kernel cmdline: {}", status.kernel_cmdline);
    }
    println!("Snapshotter: {}", status.snapshotter);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deployment::{default_deployment, write_deployment_file};

    #[test]
    fn test_status_reads_persisted_deployment() {
        let system = System::test();
        let mut deployment = default_deployment();
        deployment.disks[0].device = "/dev/fake0".into();
        deployment.source_os = ImageSource::from_uri("oci://example/os:1").unwrap();
        write_deployment_file(system.fs.as_ref(), &deployment, Utf8Path::new("/")).unwrap();

        assert!(status(&system, false).is_ok());
        let reread = DeploymentStatus::from(&deployment);
        assert_eq!(reread.source_os.uri, "example/os:1");
        assert!(reread.overlay_tree.is_none());
    }

    #[test]
    fn test_status_fails_cleanly_when_no_deployment_present() {
        let system = System::test();
        assert!(status(&system, false).is_err());
    }
}
