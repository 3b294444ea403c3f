//! The polymorphic image source: a tagged sum over where deployment
//! content comes from, parsed from a scheme-prefixed URI.

use anyhow::{bail, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Where the bytes for a deployment (OS, overlay) come from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase", tag = "kind")]
pub enum ImageSource {
    /// A container image in a registry or local daemon.
    Oci {
        /// The image reference, without the `oci://` prefix.
        uri: String,
        /// The content digest once consumed; empty before unpack.
        #[serde(default, skip_serializing_if = "String::is_empty")]
        digest: String,
    },
    /// A plain directory tree.
    Dir {
        /// Host-absolute path, without the `dir://` prefix.
        uri: String,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        digest: String,
    },
    /// A raw disk image, loop-mounted before unpacking.
    Raw {
        /// Path to the image file, without the `raw://` prefix.
        uri: String,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        digest: String,
    },
    /// A tar stream (optionally compressed), detected by suffix.
    Tar {
        /// Path to the archive, without the `tar://` prefix.
        uri: String,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        digest: String,
    },
    /// No source: used for optional fields like `OverlayTree` that
    /// are unset.
    Empty,
}

impl Default for ImageSource {
    fn default() -> Self {
        ImageSource::Empty
    }
}

impl ImageSource {
    /// Parse a `scheme://rest` URI into the matching variant.
    /// `file://` is accepted as a synonym for `dir://`.
    pub fn from_uri(uri: &str) -> Result<Self> {
        let Some((scheme, rest)) = uri.split_once("://") else {
            bail!("image source URI {uri} is missing a scheme (oci://, dir://, raw://, tar://)");
        };
        if rest.is_empty() {
            bail!("image source URI {uri} has an empty path");
        }
        let uri = rest.to_string();
        Ok(match scheme {
            "oci" => ImageSource::Oci { uri, digest: String::new() },
            "dir" | "file" => ImageSource::Dir { uri, digest: String::new() },
            "raw" => ImageSource::Raw { uri, digest: String::new() },
            "tar" => ImageSource::Tar { uri, digest: String::new() },
            other => bail!("unrecognised image source scheme {other:?}"),
        })
    }

    /// The bare path/reference, without its scheme prefix.
    pub fn uri(&self) -> &str {
        match self {
            ImageSource::Oci { uri, .. }
            | ImageSource::Dir { uri, .. }
            | ImageSource::Raw { uri, .. }
            | ImageSource::Tar { uri, .. } => uri,
            ImageSource::Empty => "",
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, ImageSource::Empty)
    }

    pub fn is_oci(&self) -> bool {
        matches!(self, ImageSource::Oci { .. })
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, ImageSource::Dir { .. })
    }

    pub fn is_raw(&self) -> bool {
        matches!(self, ImageSource::Raw { .. })
    }

    pub fn is_tar(&self) -> bool {
        matches!(self, ImageSource::Tar { .. })
    }

    pub fn digest(&self) -> &str {
        match self {
            ImageSource::Oci { digest, .. }
            | ImageSource::Dir { digest, .. }
            | ImageSource::Raw { digest, .. }
            | ImageSource::Tar { digest, .. } => digest,
            ImageSource::Empty => "",
        }
    }

    pub fn set_digest(&mut self, value: impl Into<String>) {
        match self {
            ImageSource::Oci { digest, .. }
            | ImageSource::Dir { digest, .. }
            | ImageSource::Raw { digest, .. }
            | ImageSource::Tar { digest, .. } => *digest = value.into(),
            ImageSource::Empty => {}
        }
    }
}
