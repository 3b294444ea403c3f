//! Unpacking from a plain directory tree, via `rsync`.

use anyhow::{Context, Result};
use camino::Utf8Path;
use fn_error_context::context;
use tokio_util::sync::CancellationToken;

use super::Unpacker;
use crate::platform::System;

pub(crate) struct DirUnpacker {
    pub(crate) uri: String,
}

impl Unpacker for DirUnpacker {
    fn unpack(
        &self,
        system: &System,
        destination: &Utf8Path,
        excludes: &[String],
        _cancel: &CancellationToken,
    ) -> Result<String> {
        rsync_copy(system, Utf8Path::new(&self.uri), destination, excludes)?;
        digest_from_deployment_file(system, destination)
    }

    fn synched_unpack(
        &self,
        system: &System,
        destination: &Utf8Path,
        excludes: &[String],
        delete_excludes: &[String],
        _cancel: &CancellationToken,
    ) -> Result<String> {
        rsync_sync(system, Utf8Path::new(&self.uri), destination, excludes, delete_excludes)?;
        digest_from_deployment_file(system, destination)
    }
}

/// A plain one-way mirror, without deletion.
#[context("syncing {source} to {destination}")]
pub(crate) fn rsync_copy(system: &System, source: &Utf8Path, destination: &Utf8Path, excludes: &[String]) -> Result<()> {
    let mut args = vec!["-a".to_string(), format!("{source}/"), destination.to_string()];
    for pattern in excludes {
        args.push(format!("--exclude={pattern}"));
    }
    let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
    system.runner.run_quiet("Syncing directory content", "rsync", &arg_refs)
}

/// A mirror that also deletes anything in `destination` absent from
/// `source`, except paths matching `delete_excludes`.
#[context("synchronising {source} to {destination}")]
pub(crate) fn rsync_sync(
    system: &System,
    source: &Utf8Path,
    destination: &Utf8Path,
    excludes: &[String],
    delete_excludes: &[String],
) -> Result<()> {
    let mut args = vec!["-a".to_string(), "--delete".to_string(), format!("{source}/"), destination.to_string()];
    for pattern in excludes {
        args.push(format!("--exclude={pattern}"));
    }
    for pattern in delete_excludes {
        args.push(format!("--filter=protect {pattern}"));
    }
    let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
    system.runner.run_quiet("Synchronising directory content", "rsync", &arg_refs)
}

/// Directory unpacks may return a digest recorded in an already-present
/// `deployment.yaml` under the source root, supporting upgrade from an
/// already-deployed image rather than always returning an empty digest.
pub(crate) fn digest_from_deployment_file(system: &System, destination: &Utf8Path) -> Result<String> {
    let deployment_path = destination.join(crate::deployment::DEPLOYMENT_FILE_PATH);
    match system.fs.read_to_vec(&deployment_path) {
        Ok(bytes) => {
            let parsed: Result<crate::deployment::Deployment, _> = serde_yaml::from_slice(&bytes);
            Ok(parsed.ok().map(|d| d.source_os.digest().to_string()).unwrap_or_default())
        }
        Err(_) => Ok(String::new()),
    }
    .context("reading digest from existing deployment file")
}
