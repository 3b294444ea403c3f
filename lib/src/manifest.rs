//! Release-manifest resolution (C7): a pure input-side concern that
//! the `build` path consumes upstream of the engine. Resolves a
//! product-release URI recursively to its core-platform manifest.

use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::platform::{Fs, System};

/// A pinned `{image, version}` reference, used both for the operating
/// system and as a product manifest's back-reference to its core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub(crate) struct ImageVersion {
    pub(crate) image: String,
    pub(crate) version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub(crate) struct Rke2 {
    pub(crate) image: String,
    pub(crate) version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub(crate) struct Kubernetes {
    pub(crate) rke2: Rke2,
}

/// A Helm chart pinned by a release manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub(crate) struct HelmChart {
    pub(crate) name: String,
    pub(crate) chart: String,
    pub(crate) version: String,
    #[serde(default)]
    pub(crate) depends_on: Vec<String>,
}

/// A systemd system extension (sysext) pinned by a release manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub(crate) struct SystemdExtension {
    pub(crate) name: String,
    pub(crate) image: String,
    #[serde(default)]
    pub(crate) required: bool,
}

/// A *core* manifest: pins the OS, the Kubernetes distribution, and
/// the base set of Helm charts and systemd extensions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub(crate) struct CoreManifest {
    #[serde(default)]
    pub(crate) metadata: BTreeMap<String, String>,
    pub(crate) operating_system: ImageVersion,
    pub(crate) kubernetes: Kubernetes,
    #[serde(default)]
    pub(crate) helm: Vec<HelmChart>,
    #[serde(default)]
    pub(crate) systemd: Vec<SystemdExtension>,
}

/// A *product* manifest: extends a core manifest (referenced by
/// `core_platform`) with additional components. Has no
/// `operating_system` field of its own — the OS always comes from the
/// referenced core, and `deny_unknown_fields` is what actually rejects
/// a product manifest that tries to set one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub(crate) struct ProductManifest {
    pub(crate) core_platform: ImageVersion,
    #[serde(default)]
    pub(crate) metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub(crate) kubernetes: Option<Kubernetes>,
    #[serde(default)]
    pub(crate) helm: Vec<HelmChart>,
    #[serde(default)]
    pub(crate) systemd: Vec<SystemdExtension>,
}

/// The result of resolving a release-manifest URI: always a core
/// manifest, plus the product extension that referenced it, if any.
#[derive(Debug, Clone)]
pub(crate) struct ResolvedManifest {
    pub(crate) core: CoreManifest,
    pub(crate) product: Option<ProductManifest>,
}

/// Source access for a release-manifest document, behind two
/// backends: plain files and OCI images.
pub(crate) trait Reader {
    fn read(&self, uri: &str) -> Result<Vec<u8>>;
}

/// Reads `file://`-prefixed manifest URIs straight off the [`Fs`]
/// capability.
pub(crate) struct FileReader<'a> {
    pub(crate) fs: &'a dyn Fs,
}

impl Reader for FileReader<'_> {
    #[context("reading release manifest {uri}")]
    fn read(&self, uri: &str) -> Result<Vec<u8>> {
        let path = uri
            .strip_prefix("file://")
            .ok_or_else(|| anyhow::anyhow!("{uri} is not a file:// URI"))?;
        self.fs.read_to_vec(Utf8Path::new(path))
    }
}

/// Directories searched for a release manifest, relative to the
/// unpacked image root, outermost first.
const MANIFEST_DIRS: &[&str] = &["", "etc/release-manifest"];

/// Glob patterns a release-manifest filename must match, checked in
/// each of [`MANIFEST_DIRS`] in turn.
const MANIFEST_PATTERNS: &[&str] = &["release_manifest*.yaml", "release_manifest*.yml"];

/// Find the first file directly under `dir` (if it exists) whose name
/// matches one of [`MANIFEST_PATTERNS`].
fn find_manifest_candidate(fs: &dyn Fs, dir: &Utf8Path) -> Option<Utf8PathBuf> {
    let entries = fs.read_dir(dir).ok()?;
    entries.into_iter().find(|entry| {
        entry
            .file_name()
            .is_some_and(|name| MANIFEST_PATTERNS.iter().any(|pattern| crate::unpack::glob_match(pattern, name)))
    })
}

/// Reads `oci://`-prefixed manifest URIs by unpacking the image into a
/// digest-derived cache directory and locating the first candidate
/// path present.
pub(crate) struct OciReader<'a> {
    pub(crate) system: &'a System,
    pub(crate) cache_root: camino::Utf8PathBuf,
}

impl Reader for OciReader<'_> {
    #[context("reading release manifest from {uri}")]
    fn read(&self, uri: &str) -> Result<Vec<u8>> {
        let oci_ref = uri
            .strip_prefix("oci://")
            .ok_or_else(|| anyhow::anyhow!("{uri} is not an oci:// URI"))?;
        let source = crate::deployment::ImageSource::from_uri(&format!("oci://{oci_ref}"))?;
        let cache_dir = self.cache_root.join(cache_key(oci_ref));
        if self.system.fs.stat(&cache_dir).is_err() {
            let unpacker = crate::unpack::pick_unpacker(&source)?;
            let cancel = tokio_util::sync::CancellationToken::new();
            unpacker.unpack(self.system, &cache_dir, &[], &cancel)?;
        }
        for dir in MANIFEST_DIRS {
            let dir_path = if dir.is_empty() { cache_dir.clone() } else { cache_dir.join(dir) };
            if let Some(path) = find_manifest_candidate(self.system.fs.as_ref(), &dir_path) {
                return self.system.fs.read_to_vec(&path);
            }
        }
        bail!("no release_manifest*.y{{a,}}ml found in {uri}")
    }
}

/// A filesystem-safe directory name derived from an OCI reference, so
/// repeated resolutions of the same tag reuse the same unpack.
fn cache_key(oci_ref: &str) -> String {
    oci_ref.replace(['/', ':', '@'], "_")
}

/// Resolve `uri`: parse strictly as a product manifest first; on
/// success, follow its `core_platform` reference (as `oci://image:version`)
/// to load the core manifest it extends. On failure, parse strictly as
/// a core manifest instead. An empty document is rejected either way.
#[context("resolving release manifest {uri}")]
pub(crate) fn resolve(reader: &dyn Reader, uri: &str) -> Result<ResolvedManifest> {
    let bytes = reader.read(uri)?;
    if bytes.is_empty() {
        bail!("release manifest at {uri} is empty");
    }
    match serde_yaml::from_slice::<ProductManifest>(&bytes) {
        Ok(product) => {
            let core_uri = format!("oci://{}:{}", product.core_platform.image, product.core_platform.version);
            let core_bytes = reader.read(&core_uri)?;
            if core_bytes.is_empty() {
                bail!("core platform manifest at {core_uri} is empty");
            }
            let core: CoreManifest = serde_yaml::from_slice(&core_bytes)
                .with_context(|| format!("parsing core platform manifest at {core_uri}"))?;
            Ok(ResolvedManifest { core, product: Some(product) })
        }
        Err(product_err) => {
            let core: CoreManifest = serde_yaml::from_slice(&bytes).with_context(|| {
                format!("parsing {uri} as a core manifest (product manifest parse failed: {product_err:#})")
            })?;
            Ok(ResolvedManifest { core, product: None })
        }
    }
}
