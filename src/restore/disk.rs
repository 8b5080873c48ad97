use chrono::NaiveDateTime;

use crate::types::GuestType;
use crate::zfs::snapshot_suffix;

/// What happens to a backed-up disk. A disk carries exactly one action;
/// `Pending` means the plan has not decided yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiskAction {
    #[default]
    Pending,
    Restore,
    Rollback,
    Keep,
    Skip,
}

/// What happens to a disk that the guest config references but the backup
/// does not contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExtraDiskAction {
    #[default]
    Pending,
    Recreate,
    Leave,
    /// Already present locally, nothing to ask.
    Present,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackedUpDisk {
    pub guest_id: String,
    /// Dataset leaf, e.g. `subvol-100-disk-0`.
    pub name: String,
    /// Remote dataset path.
    pub full_name: String,
    /// Newest remote snapshot carrying the backup tag, `dataset@suffix`.
    pub last_snapshot: String,
    /// Remote config file the snapshot belongs to.
    pub last_config: String,
    pub unique_name: String,
    pub destination: String,
    pub guest_type: GuestType,
    pub action: DiskAction,
}

impl BackedUpDisk {
    pub fn snapshot_suffix(&self) -> &str {
        snapshot_suffix(&self.last_snapshot)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NonBackedUpDisk {
    pub unique_name: String,
    /// Disk line as found in the remote config.
    pub config_line: String,
    pub destination: String,
    pub action: ExtraDiskAction,
}

/// All disks of one guest.
#[derive(Debug, Clone)]
pub struct DiskGroup {
    pub id: String,
    pub guest_type: GuestType,
    pub backed_up: Vec<BackedUpDisk>,
    pub non_backed_up: Vec<NonBackedUpDisk>,
    pub skip: bool,
    /// Text of the remote config chosen by [`DiskGroup::last_config`],
    /// fetched once.
    pub remote_config: Option<String>,
}

impl PartialEq for DiskGroup {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for DiskGroup {}

/// `YYYY-MM-DD_HH:MM:SS` taken from the last two `_` separated fields of a
/// config name like `100.conf.qemu.rep_daily_2024-01-01_00:13:50`.
fn config_timestamp(name: &str) -> Option<NaiveDateTime> {
    let mut fields = name.rsplit('_');
    let time = fields.next()?;
    let date = fields.next()?;
    NaiveDateTime::parse_from_str(&format!("{}_{}", date, time), "%Y-%m-%d_%H:%M:%S").ok()
}

impl DiskGroup {
    pub fn new(id: &str, guest_type: GuestType) -> Self {
        Self {
            id: id.to_string(),
            guest_type,
            backed_up: Vec::new(),
            non_backed_up: Vec::new(),
            skip: false,
            remote_config: None,
        }
    }

    /// Latest config file among the backed-up disks, by embedded timestamp
    /// and then by name.
    pub fn last_config(&self) -> Option<&str> {
        self.backed_up
            .iter()
            .map(|disk| disk.last_config.as_str())
            .max_by(|a, b| {
                config_timestamp(a)
                    .cmp(&config_timestamp(b))
                    .then_with(|| a.cmp(b))
            })
    }

    /// Snapshot suffix every rollback and keep is aligned to: the one of
    /// the first disk being restored.
    pub fn reference_suffix(&self) -> Option<&str> {
        self.backed_up
            .iter()
            .find(|disk| disk.action == DiskAction::Restore)
            .map(BackedUpDisk::snapshot_suffix)
    }

    pub fn has_restore(&self) -> bool {
        self.backed_up
            .iter()
            .any(|disk| disk.action == DiskAction::Restore)
    }

    /// Unique names of every disk of the group.
    pub fn unique_names(&self) -> impl Iterator<Item = (&str, &str)> {
        self.backed_up
            .iter()
            .map(|d| (d.unique_name.as_str(), d.destination.as_str()))
            .chain(
                self.non_backed_up
                    .iter()
                    .map(|d| (d.unique_name.as_str(), d.destination.as_str())),
            )
    }
}

#[cfg(test)]
pub(crate) fn sample_disk(id: &str, n: u32, config: &str, suffix: &str) -> BackedUpDisk {
    let name = format!("subvol-{}-disk-{}", id, n);
    BackedUpDisk {
        guest_id: id.to_string(),
        full_name: format!("backup/{}", name),
        last_snapshot: format!("backup/{}@{}", name, suffix),
        last_config: config.to_string(),
        unique_name: format!("vmssd:{}", name),
        destination: format!("vmssd/{}", name),
        name,
        guest_type: GuestType::Container,
        action: DiskAction::Pending,
    }
}
