//! The OCI unpacker: pulls an image by shelling out to `skopeo`
//! (never linking a registry client crate), then extracts its layer
//! tarballs directly onto the destination.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use camino::Utf8Path;
use fn_error_context::context;
use openssl::hash::{Hasher, MessageDigest};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::{extract_tar, Unpacker};
use crate::platform::System;

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_INTERVAL: Duration = Duration::from_secs(3);

pub(crate) struct OciUnpacker {
    pub(crate) uri: String,
}

impl Unpacker for OciUnpacker {
    fn unpack(
        &self,
        system: &System,
        destination: &Utf8Path,
        excludes: &[String],
        cancel: &CancellationToken,
    ) -> Result<String> {
        unpack_oci(system, &self.uri, destination, excludes, cancel)
    }

    fn synched_unpack(
        &self,
        system: &System,
        destination: &Utf8Path,
        excludes: &[String],
        delete_excludes: &[String],
        cancel: &CancellationToken,
    ) -> Result<String> {
        let workdir = destination.with_extension("workdir");
        system.fs.mkdir_all(&workdir)?;
        let digest = unpack_oci(system, &self.uri, &workdir, excludes, cancel)?;
        super::dir::rsync_sync(system, &workdir, destination, excludes, delete_excludes)?;
        system.fs.remove_all(&workdir)?;
        Ok(digest)
    }
}

/// Pull `uri` (already stripped of its `oci://` scheme prefix) into a
/// temporary OCI layout with `skopeo copy`, retrying transient
/// transport errors, then unpack its platform-matching manifest's
/// layers onto `destination`.
#[context("unpacking oci image {uri}")]
fn unpack_oci(
    system: &System,
    uri: &str,
    destination: &Utf8Path,
    excludes: &[String],
    cancel: &CancellationToken,
) -> Result<String> {
    let layout_dir = tempfile::tempdir().context("creating temporary OCI layout directory")?;
    let layout_path = camino::Utf8Path::from_path(layout_dir.path())
        .ok_or_else(|| anyhow::anyhow!("temporary directory path is not UTF-8"))?;

    pull_with_retry(system, uri, layout_path, cancel)?;

    let index: Value = serde_json::from_slice(
        &std::fs::read(layout_path.join("index.json")).context("reading index.json")?,
    )
    .context("parsing index.json")?;
    let manifest_digest = index["manifests"][0]["digest"]
        .as_str()
        .ok_or_else(|| anyhow::anyhow!("index.json has no manifest digest"))?
        .to_string();

    let manifest_bytes = read_blob(layout_path, &manifest_digest)?;
    let manifest: Value = serde_json::from_slice(&manifest_bytes).context("parsing image manifest")?;
    let layers = manifest["layers"]
        .as_array()
        .ok_or_else(|| anyhow::anyhow!("manifest has no layers"))?;

    system.fs.mkdir_all(destination)?;
    for layer in layers {
        if cancel.is_cancelled() {
            bail!("unpack cancelled");
        }
        let digest = layer["digest"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("layer entry has no digest"))?;
        let media_type = layer["mediaType"].as_str().unwrap_or_default();
        let blob_path = layout_path.join(format!(
            "blobs/sha256/{}",
            digest.strip_prefix("sha256:").unwrap_or(digest)
        ));
        extract_layer(system, &blob_path, media_type, destination, excludes)
            .with_context(|| format!("extracting layer {digest}"))?;
    }

    // The image's content digest is the raw manifest bytes hashed the
    // way `ostree-ext::container::unencapsulate::fetch_manifest` does,
    // rather than trusting the (attacker-influenceable) digest field.
    Ok(format!("sha256:{}", sha256_hex(&manifest_bytes)?))
}

fn pull_with_retry(
    system: &System,
    uri: &str,
    layout_path: &Utf8Path,
    cancel: &CancellationToken,
) -> Result<()> {
    let dest = format!("oci:{layout_path}");
    let mut last_err = None;
    for attempt in 0..RETRY_ATTEMPTS {
        if cancel.is_cancelled() {
            bail!("pull cancelled");
        }
        match system.runner.run("Pulling OCI image", "skopeo", &["copy", &format!("docker://{uri}"), &dest]) {
            Ok(_) => return Ok(()),
            Err(e) => {
                system.logger.warn(&format!("skopeo copy attempt {} failed: {e:#}", attempt + 1));
                last_err = Some(e);
                if attempt + 1 < RETRY_ATTEMPTS {
                    std::thread::sleep(RETRY_INTERVAL);
                }
            }
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("skopeo copy failed")))
}

fn read_blob(layout_path: &Utf8Path, digest: &str) -> Result<Vec<u8>> {
    let hex = digest.strip_prefix("sha256:").unwrap_or(digest);
    std::fs::read(layout_path.join("blobs/sha256").join(hex))
        .with_context(|| format!("reading blob {digest}"))
}

fn extract_layer(
    system: &System,
    blob_path: &Utf8Path,
    media_type: &str,
    destination: &Utf8Path,
    excludes: &[String],
) -> Result<()> {
    let file = std::fs::File::open(blob_path).with_context(|| format!("opening layer blob {blob_path}"))?;
    if media_type.contains("gzip") {
        extract_tar(system, flate2::read::GzDecoder::new(file), destination, excludes)
    } else if media_type.contains("zstd") {
        extract_tar(system, zstd::stream::Decoder::new(file)?, destination, excludes)
    } else {
        extract_tar(system, file, destination, excludes)
    }
}

fn sha256_hex(data: &[u8]) -> Result<String> {
    let mut hasher = Hasher::new(MessageDigest::sha256())?;
    hasher.update(data)?;
    let digest = hasher.finish()?;
    Ok(hex::encode(digest))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_hex_is_stable() {
        let a = sha256_hex(b"hello").unwrap();
        let b = sha256_hex(b"hello").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }
}
