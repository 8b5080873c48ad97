use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Default)]
pub struct RunMode {
    pub dry_run: bool,
    pub verbose: bool,
}

/// Kind of guest a disk belongs to. Selects the management command and the
/// directory its configuration lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GuestType {
    Container,
    Vm,
}

impl GuestType {
    /// Infers the guest type from a pve-zsync config file name such as
    /// `100.conf.qemu.rep_daily_2024-01-01_00:00:01`.
    pub fn from_config_name(name: &str) -> Option<Self> {
        if name.contains("qemu") {
            Some(GuestType::Vm)
        } else if name.contains("lxc") {
            Some(GuestType::Container)
        } else {
            None
        }
    }

    pub fn command(&self) -> &'static str {
        match self {
            GuestType::Container => "pct",
            GuestType::Vm => "qm",
        }
    }

    pub fn config_dir(&self) -> &'static str {
        match self {
            GuestType::Container => "lxc",
            GuestType::Vm => "qemu-server",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            GuestType::Container => "CT",
            GuestType::Vm => "VM",
        }
    }
}

impl fmt::Display for GuestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            GuestType::Container => "lxc",
            GuestType::Vm => "qemu",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GuestId(String);

impl GuestId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for GuestId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err("guest id is empty".to_string());
        }
        if !s.chars().all(|c| c.is_ascii_digit()) {
            return Err(format!("guest id {} must be numeric", s));
        }
        Ok(GuestId(s.to_string()))
    }
}

impl fmt::Display for GuestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guest_type_from_config_name() {
        assert_eq!(
            GuestType::from_config_name("100.conf.qemu.rep_daily_2024-01-01_00:00:01"),
            Some(GuestType::Vm)
        );
        assert_eq!(
            GuestType::from_config_name("101.conf.lxc.rep_daily_2024-01-01_00:00:01"),
            Some(GuestType::Container)
        );
        assert_eq!(GuestType::from_config_name("101.conf"), None);
    }

    #[test]
    fn guest_id_must_be_numeric() {
        assert!("100".parse::<GuestId>().is_ok());
        assert!("10a".parse::<GuestId>().is_err());
        assert!("".parse::<GuestId>().is_err());
    }
}
