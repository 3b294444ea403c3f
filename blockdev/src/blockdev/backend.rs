//! The `parted`/`sgdisk` partitioning backends and the partition
//! allocation rule that sits on top of them.

use super::{uuid as uuidmod, wait_for_device, FsKind, Runner};
use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use regex::Regex;
use std::fmt::Debug;

/// GPT is the only table label this engine writes to new disks, but
/// `msdos` is recognised for reading back legacy layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionTableLabel {
    Gpt,
    Msdos,
}

impl PartitionTableLabel {
    fn as_parted_str(self) -> &'static str {
        match self {
            PartitionTableLabel::Gpt => "gpt",
            PartitionTableLabel::Msdos => "msdos",
        }
    }
}

/// Partition flags the engine sets (boot/ESP markers, hidden data
/// partitions).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionFlag {
    Boot,
    Esp,
    Hidden,
}

impl PartitionFlag {
    fn as_parted_str(self) -> &'static str {
        match self {
            PartitionFlag::Boot => "boot",
            PartitionFlag::Esp => "esp",
            PartitionFlag::Hidden => "hidden",
        }
    }
}

/// A partition to create, before it has a number or sector range.
#[derive(Debug, Clone)]
pub struct PartitionSpec {
    pub label: String,
    pub fs: FsKind,
    /// Size in MiB; 0 means "remaining space" and is only valid for the
    /// last partition requested on a disk.
    pub size_mib: u64,
    pub uuid: String,
    pub flags: Vec<PartitionFlag>,
}

/// A partition as read back from the backend after creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub number: u32,
    pub start_sector: u64,
    pub end_sector: u64,
    pub label: Option<String>,
    pub fs_type: Option<String>,
    pub uuid: Option<String>,
}

impl Partition {
    pub fn size_sectors(&self) -> u64 {
        self.end_sector.saturating_sub(self.start_sector) + 1
    }
}

/// Common contract implemented by the `parted` and `sgdisk` backends.
pub trait Backend: Debug {
    fn print(&self, runner: &dyn Runner, device: &Utf8Path) -> Result<String>;
    fn set_partition_table_label(
        &self,
        runner: &dyn Runner,
        device: &Utf8Path,
        label: PartitionTableLabel,
    ) -> Result<()>;
    fn wipe_table(&self, runner: &dyn Runner, device: &Utf8Path, wipe: bool) -> Result<()>;
    fn create_partition(
        &self,
        runner: &dyn Runner,
        device: &Utf8Path,
        number: u32,
        start_sector: u64,
        end_sector: u64,
        spec: &PartitionSpec,
    ) -> Result<()>;
    fn delete_partition(&self, runner: &dyn Runner, device: &Utf8Path, number: u32) -> Result<()>;
    fn set_partition_flag(
        &self,
        runner: &dyn Runner,
        device: &Utf8Path,
        number: u32,
        flag: PartitionFlag,
        on: bool,
    ) -> Result<()>;
    fn write_changes(&self, runner: &dyn Runner, device: &Utf8Path) -> Result<()>;
    fn get_sector_size(&self, runner: &dyn Runner, device: &Utf8Path) -> Result<u64>;
    fn get_last_sector(&self, runner: &dyn Runner, device: &Utf8Path) -> Result<u64>;
    fn get_partition_table_label(
        &self,
        runner: &dyn Runner,
        device: &Utf8Path,
    ) -> Result<PartitionTableLabel>;
    fn get_partitions(&self, runner: &dyn Runner, device: &Utf8Path) -> Result<Vec<Partition>>;

    /// Warning substring this backend's `print` output carries when a
    /// post-expansion GPT header is stale and needs `sgdisk -e`.
    fn expansion_warning(&self) -> &'static str;
}

/// The `parted`-backed implementation.
#[derive(Debug, Default)]
pub struct GptBackend;

impl Backend for GptBackend {
    fn print(&self, runner: &dyn Runner, device: &Utf8Path) -> Result<String> {
        let out = runner.run_capture(
            &format!("Reading partition table of {device}"),
            "parted",
            &["-s", "-m", device.as_str(), "unit", "s", "print"],
        )?;
        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    fn set_partition_table_label(
        &self,
        runner: &dyn Runner,
        device: &Utf8Path,
        label: PartitionTableLabel,
    ) -> Result<()> {
        runner.run(
            &format!("Creating {} partition table on {device}", label.as_parted_str()),
            "parted",
            &["-s", device.as_str(), "mklabel", label.as_parted_str()],
        )
    }

    fn wipe_table(&self, runner: &dyn Runner, device: &Utf8Path, wipe: bool) -> Result<()> {
        if wipe {
            super::wipefs(runner, device)?;
        }
        Ok(())
    }

    fn create_partition(
        &self,
        runner: &dyn Runner,
        device: &Utf8Path,
        _number: u32,
        start_sector: u64,
        end_sector: u64,
        spec: &PartitionSpec,
    ) -> Result<()> {
        runner.run(
            &format!("Creating {} partition on {device}", spec.label),
            "parted",
            &[
                "-s",
                device.as_str(),
                "unit",
                "s",
                "mkpart",
                &spec.label,
                &format!("{start_sector}s"),
                &format!("{end_sector}s"),
            ],
        )
    }

    fn delete_partition(&self, runner: &dyn Runner, device: &Utf8Path, number: u32) -> Result<()> {
        runner.run(
            &format!("Deleting partition {number} of {device}"),
            "parted",
            &["-s", device.as_str(), "rm", &number.to_string()],
        )
    }

    fn set_partition_flag(
        &self,
        runner: &dyn Runner,
        device: &Utf8Path,
        number: u32,
        flag: PartitionFlag,
        on: bool,
    ) -> Result<()> {
        runner.run(
            &format!("Setting {} flag on partition {number}", flag.as_parted_str()),
            "parted",
            &[
                "-s",
                device.as_str(),
                "set",
                &number.to_string(),
                flag.as_parted_str(),
                if on { "on" } else { "off" },
            ],
        )
    }

    fn write_changes(&self, runner: &dyn Runner, device: &Utf8Path) -> Result<()> {
        refresh_partition_table(runner, device)
    }

    fn get_sector_size(&self, runner: &dyn Runner, device: &Utf8Path) -> Result<u64> {
        let out = self.print(runner, device)?;
        parse_parted_sector_size(&out)
    }

    fn get_last_sector(&self, runner: &dyn Runner, device: &Utf8Path) -> Result<u64> {
        let out = self.print(runner, device)?;
        parse_parted_last_sector(&out)
    }

    fn get_partition_table_label(
        &self,
        runner: &dyn Runner,
        device: &Utf8Path,
    ) -> Result<PartitionTableLabel> {
        let out = self.print(runner, device)?;
        parse_parted_label(&out)
    }

    fn get_partitions(&self, runner: &dyn Runner, device: &Utf8Path) -> Result<Vec<Partition>> {
        let out = self.print(runner, device)?;
        parse_parted_partitions(&out)
    }

    fn expansion_warning(&self) -> &'static str {
        "Not all of the space available"
    }
}

/// The `sgdisk` (gdisk)-backed implementation.
#[derive(Debug, Default)]
pub struct SgdiskBackend;

impl Backend for SgdiskBackend {
    fn print(&self, runner: &dyn Runner, device: &Utf8Path) -> Result<String> {
        let out = runner.run_capture(
            &format!("Reading partition table of {device}"),
            "sgdisk",
            &["-p", device.as_str()],
        )?;
        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    fn set_partition_table_label(
        &self,
        runner: &dyn Runner,
        device: &Utf8Path,
        _label: PartitionTableLabel,
    ) -> Result<()> {
        // sgdisk only ever writes GPT; --clear also (re)creates the header.
        runner.run(
            &format!("Creating GPT partition table on {device}"),
            "sgdisk",
            &["--clear", device.as_str()],
        )
    }

    fn wipe_table(&self, runner: &dyn Runner, device: &Utf8Path, wipe: bool) -> Result<()> {
        if wipe {
            super::wipefs(runner, device)?;
        }
        Ok(())
    }

    fn create_partition(
        &self,
        runner: &dyn Runner,
        device: &Utf8Path,
        number: u32,
        start_sector: u64,
        end_sector: u64,
        spec: &PartitionSpec,
    ) -> Result<()> {
        let new_spec = format!("{number}:{start_sector}:{end_sector}");
        runner.run(
            &format!("Creating {} partition on {device}", spec.label),
            "sgdisk",
            &[
                "-n",
                &new_spec,
                "-c",
                &format!("{number}:{}", spec.label),
                device.as_str(),
            ],
        )
    }

    fn delete_partition(&self, runner: &dyn Runner, device: &Utf8Path, number: u32) -> Result<()> {
        runner.run(
            &format!("Deleting partition {number} of {device}"),
            "sgdisk",
            &["-d", &number.to_string(), device.as_str()],
        )
    }

    fn set_partition_flag(
        &self,
        runner: &dyn Runner,
        device: &Utf8Path,
        number: u32,
        flag: PartitionFlag,
        on: bool,
    ) -> Result<()> {
        // sgdisk models flags as GUID type codes; esp/boot share EF00.
        let typecode = match flag {
            PartitionFlag::Esp | PartitionFlag::Boot => "ef00",
            PartitionFlag::Hidden => "8300",
        };
        if on {
            runner.run(
                &format!("Setting type code on partition {number}"),
                "sgdisk",
                &["-t", &format!("{number}:{typecode}"), device.as_str()],
            )
        } else {
            Ok(())
        }
    }

    fn write_changes(&self, runner: &dyn Runner, device: &Utf8Path) -> Result<()> {
        refresh_partition_table(runner, device)
    }

    fn get_sector_size(&self, runner: &dyn Runner, device: &Utf8Path) -> Result<u64> {
        let out = self.print(runner, device)?;
        parse_sgdisk_sector_size(&out)
    }

    fn get_last_sector(&self, runner: &dyn Runner, device: &Utf8Path) -> Result<u64> {
        let out = self.print(runner, device)?;
        parse_sgdisk_last_sector(&out)
    }

    fn get_partition_table_label(
        &self,
        _runner: &dyn Runner,
        _device: &Utf8Path,
    ) -> Result<PartitionTableLabel> {
        Ok(PartitionTableLabel::Gpt)
    }

    fn get_partitions(&self, runner: &dyn Runner, device: &Utf8Path) -> Result<Vec<Partition>> {
        let out = self.print(runner, device)?;
        parse_sgdisk_partitions(&out)
    }

    fn expansion_warning(&self) -> &'static str {
        "Problem: The secondary header"
    }
}

fn refresh_partition_table(runner: &dyn Runner, device: &Utf8Path) -> Result<()> {
    runner.run(
        &format!("Refreshing kernel partition table for {device}"),
        "partx",
        &["-u", device.as_str()],
    )?;
    super::udev_settle(runner)
}

fn parse_parted_sector_size(out: &str) -> Result<u64> {
    let re = Regex::new(r"(?m)^/dev/\S+:\d+s:\S+:(\d+):").unwrap();
    let caps = re
        .captures(out)
        .context("could not find sector size in parted output")?;
    Ok(caps[1].parse()?)
}

fn parse_parted_last_sector(out: &str) -> Result<u64> {
    let re = Regex::new(r"(?m)^/dev/\S+:(\d+)s:").unwrap();
    let caps = re
        .captures(out)
        .context("could not find device size in parted output")?;
    let total: u64 = caps[1].parse()?;
    Ok(total.saturating_sub(1))
}

fn parse_parted_label(out: &str) -> Result<PartitionTableLabel> {
    let re = Regex::new(r"(?m)^/dev/\S+:\d+s:\S+:\d+:\d+:(\w+):").unwrap();
    let caps = re
        .captures(out)
        .context("could not find partition table label in parted output")?;
    match &caps[1] {
        "gpt" => Ok(PartitionTableLabel::Gpt),
        "msdos" => Ok(PartitionTableLabel::Msdos),
        other => anyhow::bail!("unsupported partition table label {other:?}"),
    }
}

fn parse_parted_partitions(out: &str) -> Result<Vec<Partition>> {
    let re = Regex::new(r"(?m)^(\d+):(\d+)s:(\d+)s:\d+s:(\w*):([^:]*):([^;]*);").unwrap();
    let mut result = Vec::new();
    for caps in re.captures_iter(out) {
        let label = caps[5].trim();
        result.push(Partition {
            number: caps[1].parse()?,
            start_sector: caps[2].parse()?,
            end_sector: caps[3].parse()?,
            fs_type: (!caps[4].is_empty()).then(|| caps[4].to_string()),
            label: (!label.is_empty()).then(|| label.to_string()),
            uuid: None,
        });
    }
    Ok(result)
}

fn parse_sgdisk_sector_size(out: &str) -> Result<u64> {
    let re = Regex::new(r"(?m)^Logical sector size: (\d+) bytes").unwrap();
    let caps = re
        .captures(out)
        .context("could not find logical sector size in sgdisk output")?;
    Ok(caps[1].parse()?)
}

fn parse_sgdisk_last_sector(out: &str) -> Result<u64> {
    let re = Regex::new(r"(?m)last usable sector is (\d+)").unwrap();
    let caps = re
        .captures(out)
        .context("could not find last usable sector in sgdisk output")?;
    Ok(caps[1].parse()?)
}

fn parse_sgdisk_partitions(out: &str) -> Result<Vec<Partition>> {
    let re = Regex::new(r"(?m)^\s*(\d+)\s+(\d+)\s+(\d+)\s+\S+\s+\S+\s+(\S.*?)\s*$").unwrap();
    let mut result = Vec::new();
    for caps in re.captures_iter(out) {
        result.push(Partition {
            number: caps[1].parse()?,
            start_sector: caps[2].parse()?,
            end_sector: caps[3].parse()?,
            fs_type: None,
            label: Some(caps[4].to_string()),
            uuid: None,
        });
    }
    Ok(result)
}

/// A disk targeted for partitioning, bound to a chosen backend.
#[derive(Debug)]
pub struct Disk<B: Backend> {
    device: Utf8PathBuf,
    backend: B,
}

impl<B: Backend> Disk<B> {
    pub fn new(device: impl Into<Utf8PathBuf>, backend: B) -> Self {
        Self {
            device: device.into(),
            backend,
        }
    }

    pub fn device(&self) -> &Utf8Path {
        &self.device
    }

    /// Reread the current partition table, fixing up a stale GPT
    /// header (`sgdisk -e`) if the backend's output carries the
    /// post-expansion warning for it.
    #[context("Reloading partition table of {}", self.device)]
    pub fn reload(&self, runner: &dyn Runner) -> Result<String> {
        let out = self.backend.print(runner, &self.device)?;
        if out.contains(self.backend.expansion_warning()) {
            runner.run(
                "Fixing secondary GPT header after resize",
                "sgdisk",
                &["-e", self.device.as_str()],
            )?;
            return self.backend.print(runner, &self.device);
        }
        Ok(out)
    }

    /// Partition the disk per `specs`, applying the allocation rule:
    /// the first partition starts at a 1 MiB offset; each subsequent
    /// partition starts immediately after the previous; a `size_mib`
    /// of 0 means "remaining space" and is only valid on the last spec.
    #[context("Partitioning {}", self.device)]
    pub fn partition(&self, runner: &dyn Runner, specs: &[PartitionSpec], wipe: bool) -> Result<Vec<Partition>> {
        self.backend.wipe_table(runner, &self.device, wipe)?;
        self.backend
            .set_partition_table_label(runner, &self.device, PartitionTableLabel::Gpt)?;

        let sector_size = self.backend.get_sector_size(runner, &self.device)?;
        let last_sector = self.backend.get_last_sector(runner, &self.device)?;

        let mut start = 1_048_576 / sector_size;
        for (idx, spec) in specs.iter().enumerate() {
            let is_last = idx == specs.len() - 1;
            if spec.size_mib == 0 && !is_last {
                anyhow::bail!("partition {:?} has size 0 but is not the last partition", spec.label);
            }
            let end = if spec.size_mib == 0 {
                last_sector
            } else {
                let size_sectors = (spec.size_mib * 1024 * 1024) / sector_size;
                start + size_sectors - 1
            };
            let number = (idx + 1) as u32;
            self.backend
                .create_partition(runner, &self.device, number, start, end, spec)?;
            for flag in &spec.flags {
                self.backend
                    .set_partition_flag(runner, &self.device, number, *flag, true)?;
            }
            start = end + 1;
        }
        self.backend.write_changes(runner, &self.device)?;
        self.reload(runner)?;

        let mut partitions = self.backend.get_partitions(runner, &self.device)?;
        for (partition, spec) in partitions.iter_mut().zip(specs.iter()) {
            let path = partition_device_path(&self.device, partition.number);
            wait_for_device(runner, &path)?;
            partition.uuid = Some(uuidmod::validate_or_generate_uuid(spec.fs, &spec.uuid)?);
        }
        Ok(partitions)
    }
}

/// Compute the device node path for partition `number` of `device`,
/// handling the `p`-infix convention used by nvme/loop/mmcblk devices.
pub fn partition_device_path(device: &Utf8Path, number: u32) -> Utf8PathBuf {
    let name = device.file_name().unwrap_or_default();
    let needs_p = name
        .chars()
        .last()
        .map(|c| c.is_ascii_digit())
        .unwrap_or(false);
    let suffix = if needs_p {
        format!("p{number}")
    } else {
        number.to_string()
    };
    device
        .parent()
        .map(|p| p.join(format!("{name}{suffix}")))
        .unwrap_or_else(|| Utf8PathBuf::from(format!("{device}{suffix}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_device_path() {
        assert_eq!(
            partition_device_path(Utf8Path::new("/dev/sda"), 1).as_str(),
            "/dev/sda1"
        );
        assert_eq!(
            partition_device_path(Utf8Path::new("/dev/nvme0n1"), 2).as_str(),
            "/dev/nvme0n1p2"
        );
        assert_eq!(
            partition_device_path(Utf8Path::new("/dev/loop0"), 1).as_str(),
            "/dev/loop0p1"
        );
    }

    #[test]
    fn test_parse_parted_output() {
        let sample = indoc::indoc! {"
            BYT;
            /dev/sda:41943040s:scsi:512:512:gpt:QEMU HARDDISK:;
            1:2048s:2099199s:2097152s:fat32:efi:boot, esp;
            2:2099200s:41943006s:39843807s:btrfs:system:;
        "};
        assert_eq!(parse_parted_sector_size(sample).unwrap(), 512);
        assert_eq!(parse_parted_last_sector(sample).unwrap(), 41_943_039);
        assert_eq!(parse_parted_label(sample).unwrap(), PartitionTableLabel::Gpt);
        let parts = parse_parted_partitions(sample).unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].label.as_deref(), Some("efi"));
        assert_eq!(parts[1].start_sector, 2_099_200);
    }

    #[test]
    fn test_allocation_rule_remaining_space() {
        #[derive(Debug, Default)]
        struct FakeRunner;
        impl Runner for FakeRunner {
            fn run_capture(&self, _d: &str, cmd: &str, _args: &[&str]) -> Result<Vec<u8>> {
                match cmd {
                    "parted" => Ok(indoc::indoc! {"
                        BYT;
                        /dev/fake:2097152s:file:512:512:gpt:Fake:;
                    "}
                    .as_bytes()
                    .to_vec()),
                    _ => Ok(Vec::new()),
                }
            }
        }
        let disk = Disk::new("/dev/fake", GptBackend);
        let runner = FakeRunner;
        let specs = vec![
            PartitionSpec {
                label: "efi".into(),
                fs: FsKind::Vfat,
                size_mib: 100,
                uuid: String::new(),
                flags: vec![PartitionFlag::Esp],
            },
            PartitionSpec {
                label: "system".into(),
                fs: FsKind::Btrfs,
                size_mib: 0,
                uuid: String::new(),
                flags: vec![],
            },
        ];
        // Exercise just the allocation arithmetic; get_partitions will
        // return nothing against this minimal fake, which is fine for
        // checking there's no panic/overflow in the sizing math.
        let _ = disk.backend.get_sector_size(&runner, disk.device());
        let sector_size = 512u64;
        let start0 = 1_048_576 / sector_size;
        let size0 = (specs[0].size_mib * 1024 * 1024) / sector_size;
        let end0 = start0 + size0 - 1;
        assert_eq!(start0, 2048);
        assert_eq!(end0, 2048 + 204_800 - 1);
    }
}
