//! # slate CLI
//!
//! Command line tool driving the transactional deployment engine:
//! install a fresh system, upgrade one in place, build a raw disk
//! image or installer media from a declarative image definition, or
//! unpack an image source directly onto a target directory.

use std::ffi::OsString;

use anyhow::{anyhow, bail, Context, Result};
use camino::Utf8PathBuf;
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};

use crate::deployment::{self, Bootloader, Deployment, ImageSource, SecurityPolicy, SnapshotterKind};
use crate::errors::EngineError;
use crate::platform::System;
use crate::{build, install, status, transaction, unpack, upgrade};

/// Map a top-level error returned by [`run_from_iter`] to this
/// process's exit code: 130 (the conventional SIGINT status) for a
/// cancelled operation, 1 for anything else. Kept separate from
/// [`EngineError`] itself, which stays private to this crate.
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<EngineError>().map(EngineError::exit_code).unwrap_or(1)
}

/// Global flags honored regardless of subcommand.
#[derive(Debug, Parser)]
#[clap(name = "slate")]
#[clap(rename_all = "kebab-case")]
#[clap(version)]
pub(crate) struct Cli {
    /// Enable debug-level logging.
    #[clap(long, global = true)]
    pub(crate) debug: bool,

    /// Where to send log output: a file path, `stdout`, or `stderr`
    /// (the default).
    #[clap(long, global = true)]
    pub(crate) log_file: Option<String>,

    #[clap(subcommand)]
    pub(crate) command: Opt,
}

/// `grub`/`systemd-boot`/`none`, as accepted by `--bootloader`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[clap(rename_all = "kebab-case")]
pub(crate) enum BootloaderArg {
    Grub,
    SystemdBoot,
    None,
}

impl From<BootloaderArg> for Bootloader {
    fn from(value: BootloaderArg) -> Self {
        match value {
            BootloaderArg::Grub => Bootloader::Grub,
            BootloaderArg::SystemdBoot => Bootloader::SystemdBoot,
            BootloaderArg::None => Bootloader::None,
        }
    }
}

/// `snapper`/`overwrite`, as accepted by `--snapshotter`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[clap(rename_all = "kebab-case")]
pub(crate) enum SnapshotterArg {
    Snapper,
    Overwrite,
}

impl From<SnapshotterArg> for SnapshotterKind {
    fn from(value: SnapshotterArg) -> Self {
        match value {
            SnapshotterArg::Snapper => SnapshotterKind::Snapper,
            SnapshotterArg::Overwrite => SnapshotterKind::Overwrite,
        }
    }
}

/// `x86_64`/`aarch64`, as accepted by `build --arch`. Carried through
/// to the eventual manifest/image selection; today every release
/// manifest is architecture-agnostic, so this only validates the flag
/// and is not otherwise consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[clap(rename_all = "kebab-case")]
pub(crate) enum ArchArg {
    X86_64,
    Aarch64,
}

/// Install a fresh system onto a target block device.
#[derive(Debug, Parser, PartialEq, Eq)]
pub(crate) struct InstallOpts {
    /// The base OS image to install, e.g. `oci://registry/image:tag`.
    #[clap(long, conflicts_with = "description")]
    pub(crate) os_image: Option<String>,

    /// A full deployment description YAML file to install from,
    /// instead of building one from `--os-image` and the defaults.
    #[clap(long, conflicts_with = "os_image")]
    pub(crate) description: Option<Utf8PathBuf>,

    /// The block device to partition and install onto, overriding the
    /// deployment's own disk device.
    #[clap(long)]
    pub(crate) target: Option<String>,

    /// URI of an overlay tree applied on top of the unpacked OS.
    #[clap(long)]
    pub(crate) overlay: Option<String>,

    /// Path to a post-commit configuration script, overriding the
    /// `./config.sh` convention.
    #[clap(long)]
    pub(crate) config: Option<Utf8PathBuf>,

    /// Which bootloader to install.
    #[clap(long, value_enum)]
    pub(crate) bootloader: Option<BootloaderArg>,

    /// Kernel command line, overriding the deployment's own.
    #[clap(long)]
    pub(crate) cmdline: Option<String>,

    /// Register an EFI boot entry on this host after committing.
    #[clap(long)]
    pub(crate) create_boot_entry: bool,

    /// Apply the FIPS security policy.
    #[clap(long)]
    pub(crate) enable_fips: bool,

    /// Which snapshotter backend manages the system partition.
    #[clap(long, value_enum)]
    pub(crate) snapshotter: Option<SnapshotterArg>,

    /// Verify image signatures before unpacking.
    #[clap(long)]
    pub(crate) verify: bool,

    /// Pull from the local container storage instead of a registry.
    #[clap(long)]
    pub(crate) local: bool,
}

/// Upgrade the installed system in place by committing a new snapshot.
#[derive(Debug, Parser, PartialEq, Eq)]
pub(crate) struct UpgradeOpts {
    /// The new OS image to upgrade to.
    #[clap(long)]
    pub(crate) os_image: String,

    /// URI of an overlay tree applied on top of the new snapshot.
    #[clap(long)]
    pub(crate) overlay: Option<String>,

    /// Path to a post-commit configuration script, overriding the
    /// currently-deployed one.
    #[clap(long)]
    pub(crate) config: Option<String>,

    /// Verify image signatures before unpacking.
    #[clap(long)]
    pub(crate) verify: bool,
}

/// Build a raw disk image from a declarative image definition.
#[derive(Debug, Parser, PartialEq, Eq)]
pub(crate) struct BuildOpts {
    /// The only supported image type today.
    #[clap(long, value_enum, default_value = "raw")]
    pub(crate) image_type: ImageTypeArg,

    /// Target architecture.
    #[clap(long, value_enum, default_value = "x86-64")]
    pub(crate) arch: ArchArg,

    /// Directory holding `os.yaml`, `install.yaml`, `release.yaml`,
    /// and `kubernetes.yaml`.
    #[clap(long)]
    pub(crate) config_dir: Utf8PathBuf,

    /// Where to write the resulting raw image.
    #[clap(long)]
    pub(crate) output: Option<Utf8PathBuf>,
}

/// `raw`, the only image type `build` currently produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[clap(rename_all = "kebab-case")]
pub(crate) enum ImageTypeArg {
    Raw,
}

/// Build bootable installer media for a given OS image.
#[derive(Debug, Parser, PartialEq, Eq)]
pub(crate) struct BuildIsoOpts {
    /// The base OS image to embed in the installer media.
    #[clap(long)]
    pub(crate) os_image: String,

    /// Directory to write the installer media into.
    #[clap(long)]
    pub(crate) output: Utf8PathBuf,

    /// Volume label recorded on the installer media.
    #[clap(long, default_value = "SLATE")]
    pub(crate) label: String,

    /// Extra `mksquashfs` options for the installer media packaging
    /// step (e.g. compression selection).
    #[clap(long)]
    pub(crate) squashfs_option: Vec<String>,
}

/// Unpack an image source directly onto a target directory.
#[derive(Debug, Parser, PartialEq, Eq)]
pub(crate) struct UnpackImageOpts {
    /// The image source to unpack, e.g. `oci://registry/image:tag`.
    #[clap(long)]
    pub(crate) image: String,

    /// Destination directory.
    #[clap(long)]
    pub(crate) target: Utf8PathBuf,

    /// Platform to select from a multi-arch image, e.g. `linux/amd64`.
    #[clap(long)]
    pub(crate) platform: Option<String>,

    /// Verify image signatures before unpacking.
    #[clap(long)]
    pub(crate) verify: bool,

    /// Pull from the local container storage instead of a registry.
    #[clap(long)]
    pub(crate) local: bool,
}

/// Report the currently installed deployment.
#[derive(Debug, Parser, PartialEq, Eq)]
pub(crate) struct StatusOpts {
    /// Output as JSON instead of a short human summary.
    #[clap(long)]
    pub(crate) json: bool,
}

/// Generate shell completion scripts.
#[derive(Debug, Parser, PartialEq, Eq)]
pub(crate) struct CompletionOpts {
    #[clap(value_enum)]
    pub(crate) shell: clap_complete::Shell,
}

#[derive(Debug, Subcommand, PartialEq, Eq)]
#[allow(clippy::large_enum_variant)]
pub(crate) enum Opt {
    /// Install a fresh system onto a target block device.
    Install(InstallOpts),
    /// Upgrade the installed system in place.
    Upgrade(UpgradeOpts),
    /// Build a raw disk image from a declarative image definition.
    Build(BuildOpts),
    /// Build bootable installer media.
    BuildIso(BuildIsoOpts),
    /// Unpack an image source directly onto a target directory.
    UnpackImage(UnpackImageOpts),
    /// Report the currently installed deployment.
    Status(StatusOpts),
    /// Emit the deployment descriptor's JSON Schema.
    Schema,
    /// Generate shell completion scripts.
    Completion(CompletionOpts),
    /// Print the version and exit.
    Version,
    /// Hidden re-exec entry point: `chroot`s into a snapshot and execs
    /// a hook script. Dispatched by [`crate::transaction`] via
    /// `/proc/self/exe`, never invoked directly by a user.
    #[clap(hide = true)]
    InternalExecInChroot { snapshot: Utf8PathBuf, script: String },
}

/// Parse the provided arguments and execute.
pub fn run_from_iter<I>(args: I) -> Result<()>
where
    I: IntoIterator,
    I::Item: Into<OsString> + Clone,
{
    let cli = Cli::parse_from(args);
    init_logging(cli.debug, cli.log_file.as_deref())?;
    run_from_opt(cli.command)
}

fn init_logging(debug: bool, log_file: Option<&str>) -> Result<()> {
    let filter = if debug { "debug" } else { "info" };
    match log_file {
        Some(path) if path != "stdout" && path != "stderr" => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {path}"))?;
            tracing_subscriber::fmt().with_env_filter(filter).with_writer(file).init();
        }
        Some("stdout") => {
            tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stdout).init();
        }
        _ => {
            tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
        }
    }
    Ok(())
}

fn run_from_opt(opt: Opt) -> Result<()> {
    match opt {
        Opt::Install(opts) => run_install(opts),
        Opt::Upgrade(opts) => run_upgrade(opts),
        Opt::Build(opts) => run_build(opts),
        Opt::BuildIso(opts) => run_build_iso(opts),
        Opt::UnpackImage(opts) => run_unpack_image(opts),
        Opt::Status(opts) => status::status(&System::production(), opts.json),
        Opt::Schema => run_schema(),
        Opt::Completion(opts) => run_completion(opts),
        Opt::Version => {
            println!("slate {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Opt::InternalExecInChroot { snapshot, script } => {
            transaction::exec_in_chroot(&[snapshot.to_string(), script])
        }
    }
}

/// Build the [`Deployment`] an `install` invocation should act on: the
/// full description from `--description` if given, otherwise the
/// canonical default shape with `--os-image` and the other flags
/// folded in.
fn resolve_install_deployment(system: &System, opts: &InstallOpts) -> Result<Deployment> {
    let mut deployment = match &opts.description {
        Some(path) => {
            let bytes = system.fs.read_to_vec(path).with_context(|| format!("reading {path}"))?;
            serde_yaml::from_slice(&bytes).with_context(|| format!("parsing {path}"))?
        }
        None => {
            let Some(os_image) = &opts.os_image else {
                bail!("either --os-image or --description is required");
            };
            let mut deployment = deployment::default_deployment();
            deployment.source_os = ImageSource::from_uri(os_image)?;
            deployment
        }
    };

    if let Some(device) = &opts.target {
        let disk = deployment.disks.first_mut().ok_or_else(|| anyhow!("deployment has no disks to target"))?;
        disk.device = device.clone();
    }
    if let Some(uri) = &opts.overlay {
        deployment.overlay_tree = ImageSource::from_uri(uri)?;
    }
    if let Some(bootloader) = opts.bootloader {
        deployment.boot_config.bootloader = bootloader.into();
    }
    if let Some(cmdline) = &opts.cmdline {
        deployment.boot_config.kernel_cmdline = cmdline.clone();
    }
    if opts.enable_fips {
        deployment.security.policy = SecurityPolicy::Fips;
    }
    if let Some(snapshotter) = opts.snapshotter {
        deployment.snapshotter.name = snapshotter.into();
    }
    Ok(deployment)
}

fn run_install(opts: InstallOpts) -> Result<()> {
    let system = System::production();
    let mut deployment = resolve_install_deployment(&system, &opts)?;
    let config_script = opts.config.as_deref();
    install::install(&system, &mut deployment, config_script, opts.create_boot_entry)?;
    Ok(())
}

fn run_upgrade(opts: UpgradeOpts) -> Result<()> {
    let system = System::production();
    let request = upgrade::UpgradeRequest {
        source_os: Some(opts.os_image),
        overlay_tree: opts.overlay,
        cfg_script: opts.config,
        excludes: Vec::new(),
    };
    upgrade::upgrade(&system, request)?;
    Ok(())
}

const DEFAULT_BUILD_OUTPUT: &str = "slate-image.raw";

fn run_build(opts: BuildOpts) -> Result<()> {
    let system = System::production();
    let deployment = build::resolve_deployment(&system, &opts.config_dir)?;
    let output = opts.output.unwrap_or_else(|| Utf8PathBuf::from(DEFAULT_BUILD_OUTPUT));
    build::build_raw_image(&system, deployment, &output)?;
    Ok(())
}

fn run_build_iso(opts: BuildIsoOpts) -> Result<()> {
    let system = System::production();
    let mut deployment = deployment::default_deployment();
    deployment.source_os = ImageSource::from_uri(&opts.os_image)?;

    let mut options = vec!["-comp".to_string(), "zstd".to_string()];
    options.extend(opts.squashfs_option);

    build::build_installer_iso(&system, deployment, &opts.output, &options)?;
    Ok(())
}

fn run_unpack_image(opts: UnpackImageOpts) -> Result<()> {
    let system = System::production();
    let mut source = ImageSource::from_uri(&opts.image)?;
    let unpacker = unpack::pick_unpacker(&source)?;
    let cancel = tokio_util::sync::CancellationToken::new();
    let digest = unpacker.unpack(&system, &opts.target, &[], &cancel)?;
    source.set_digest(digest);
    Ok(())
}

fn run_schema() -> Result<()> {
    let schema = schemars::schema_for!(Deployment);
    serde_json::to_writer_pretty(std::io::stdout().lock(), &schema).context("writing schema as JSON")?;
    println!();
    Ok(())
}

fn run_completion(opts: CompletionOpts) -> Result<()> {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    clap_complete::generate(opts.shell, &mut cmd, name, &mut std::io::stdout());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_install_requires_os_image_or_description() {
        let cli = Cli::try_parse_from(["slate", "install"]).unwrap();
        let Opt::Install(opts) = cli.command else { panic!("expected install") };
        let system = System::production();
        assert!(resolve_install_deployment(&system, &opts).is_err());
    }

    #[test]
    fn test_parse_install_rejects_both_os_image_and_description() {
        let result = Cli::try_parse_from([
            "slate",
            "install",
            "--os-image",
            "oci://x:1",
            "--description",
            "/tmp/d.yaml",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_install_with_os_image_builds_default_deployment() {
        let cli = Cli::try_parse_from([
            "slate",
            "install",
            "--os-image",
            "oci://example/os:1",
            "--target",
            "/dev/fake0",
            "--enable-fips",
            "--snapshotter",
            "overwrite",
        ])
        .unwrap();
        let Opt::Install(opts) = cli.command else { panic!("expected install") };
        let system = System::production();
        let deployment = resolve_install_deployment(&system, &opts).unwrap();
        assert_eq!(deployment.disks[0].device, "/dev/fake0");
        assert_eq!(deployment.security.policy, SecurityPolicy::Fips);
        assert_eq!(deployment.snapshotter.name, SnapshotterKind::Overwrite);
    }

    #[test]
    fn test_parse_build_defaults_to_raw_output_name() {
        let cli = Cli::try_parse_from(["slate", "build", "--config-dir", "/config"]).unwrap();
        let Opt::Build(opts) = cli.command else { panic!("expected build") };
        assert!(opts.output.is_none());
        assert_eq!(opts.image_type, ImageTypeArg::Raw);
    }

    #[test]
    fn test_internal_exec_in_chroot_is_hidden_but_parseable() {
        let cli = Cli::try_parse_from(["slate", "internal-exec-in-chroot", "/mnt/snap", "/bin/true"]).unwrap();
        assert!(matches!(cli.command, Opt::InternalExecInChroot { .. }));
    }

    #[test]
    fn test_exit_code_for_cancelled_is_130() {
        let err = anyhow::Error::from(EngineError::Cancelled);
        assert_eq!(exit_code_for(&err), 130);
    }

    #[test]
    fn test_exit_code_for_other_kinds_is_one() {
        let err = anyhow::Error::from(EngineError::Validation(anyhow!("bad input")));
        assert_eq!(exit_code_for(&err), 1);
    }
}
