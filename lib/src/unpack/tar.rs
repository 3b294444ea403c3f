//! Unpacking a bare tar stream (optionally gzip- or bzip2-compressed,
//! detected by filename suffix) directly onto the destination, with a
//! context-cancellable reader.

use std::io::Read;

use anyhow::{bail, Context, Result};
use camino::Utf8Path;
use fn_error_context::context;
use tokio_util::sync::CancellationToken;

use super::{extract_tar, Unpacker};
use crate::platform::System;

pub(crate) struct TarUnpacker {
    pub(crate) uri: String,
}

impl Unpacker for TarUnpacker {
    fn unpack(
        &self,
        system: &System,
        destination: &Utf8Path,
        excludes: &[String],
        cancel: &CancellationToken,
    ) -> Result<String> {
        extract(system, &self.uri, destination, excludes, cancel)?;
        Ok(String::new())
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
        extract(system, &self.uri, &workdir, excludes, cancel)?;
        super::dir::rsync_sync(system, &workdir, destination, excludes, delete_excludes)?;
        system.fs.remove_all(&workdir)?;
        Ok(String::new())
    }
}

/// Open `uri`, pick a decompressor by suffix, and stream-extract into
/// `destination` with path sanitisation and a deferred symlink pass.
#[context("unpacking tar archive {uri}")]
fn extract(
    system: &System,
    uri: &str,
    destination: &Utf8Path,
    excludes: &[String],
    cancel: &CancellationToken,
) -> Result<()> {
    let file = std::fs::File::open(uri).with_context(|| format!("opening {uri}"))?;
    let reader = CancellableReader { inner: file, cancel: cancel.clone() };
    if uri.ends_with(".tar.gz") || uri.ends_with(".tgz") {
        extract_tar(system, flate2::read::GzDecoder::new(reader), destination, excludes)
    } else if uri.ends_with(".tar.bz2") {
        extract_tar(system, bzip2::read::BzDecoder::new(reader), destination, excludes)
    } else if uri.ends_with(".tar") {
        extract_tar(system, reader, destination, excludes)
    } else {
        bail!("unrecognised tar archive suffix for {uri}; expected .tar, .tar.gz, .tgz, or .tar.bz2")
    }
}

struct CancellableReader<R> {
    inner: R,
    cancel: CancellationToken,
}

impl<R: Read> Read for CancellableReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.cancel.is_cancelled() {
            return Err(std::io::Error::new(std::io::ErrorKind::Interrupted, "unpack cancelled"));
        }
        self.inner.read(buf)
    }
}
