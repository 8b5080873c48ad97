use std::str::FromStr;

use crate::error::{ConfigError, PzmError, Result};
use crate::guest::GuestCommand;
use crate::types::{GuestId, GuestType};
use crate::util::command::Runner;

/// Parsed `--ids` argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdSelection {
    /// `all`, optionally followed by `-<id>` exclusions.
    All { exclude: Vec<GuestId> },
    /// Explicit IDs. Entries with a `:` are pull sources (`host:id`) and are
    /// passed through without checking the local guest lists.
    Explicit(Vec<String>),
}

impl FromStr for IdSelection {
    type Err = PzmError;

    fn from_str(s: &str) -> Result<Self> {
        let tokens: Vec<&str> = s
            .split(',')
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .collect();
        if tokens.is_empty() {
            return Err(ConfigError::Invalid("no guest IDs given".to_string()).into());
        }

        let mut all = false;
        let mut exclude = Vec::new();
        let mut explicit = Vec::new();
        for token in tokens {
            if token.eq_ignore_ascii_case("all") {
                all = true;
            } else if let Some(id) = token.strip_prefix('-') {
                exclude.push(parse_guest_id(id)?);
            } else if token.contains(':') {
                explicit.push(token.to_string());
            } else {
                explicit.push(parse_guest_id(token)?.to_string());
            }
        }

        match (all, exclude.is_empty(), explicit.is_empty()) {
            (true, _, true) => Ok(IdSelection::All { exclude }),
            (false, true, false) => Ok(IdSelection::Explicit(explicit)),
            (true, _, false) => Err(ConfigError::Invalid(
                "'all' can only be combined with exclusions (-<id>)".to_string(),
            )
            .into()),
            _ => Err(ConfigError::Invalid("exclusions (-<id>) require 'all'".to_string()).into()),
        }
    }
}

fn parse_guest_id(raw: &str) -> Result<GuestId> {
    raw.parse::<GuestId>()
        .map_err(|err| ConfigError::Invalid(err).into())
}

/// A guest picked by the selection. Pull sources carry no local type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedGuest {
    pub id: String,
    pub guest_type: Option<GuestType>,
}

impl IdSelection {
    /// Applies the selection to the IDs that exist locally for one guest type.
    pub fn select(&self, existing: &[String]) -> Vec<String> {
        match self {
            IdSelection::All { exclude } => existing
                .iter()
                .filter(|id| !exclude.iter().any(|ex| ex.as_str() == id.as_str()))
                .cloned()
                .collect(),
            IdSelection::Explicit(ids) => ids
                .iter()
                .filter(|id| id.contains(':') || existing.contains(id))
                .cloned()
                .collect(),
        }
    }

    /// Resolves the selection against `qm list` and `pct list`. Each ID
    /// appears once, VMs first.
    pub fn resolve(&self, runner: &Runner) -> Result<Vec<SelectedGuest>> {
        let mut selected: Vec<SelectedGuest> = Vec::new();
        for guest_type in [GuestType::Vm, GuestType::Container] {
            let existing = GuestCommand::new(runner, guest_type).list_ids()?;
            for id in self.select(&existing) {
                if selected.iter().any(|guest| guest.id == id) {
                    continue;
                }
                let guest_type = (!id.contains(':')).then_some(guest_type);
                selected.push(SelectedGuest { id, guest_type });
            }
        }
        Ok(selected)
    }
}
