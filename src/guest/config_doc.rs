use std::fmt;

use crate::guest::storage::unique_name_from_config_line;

/// One block of a guest config. The live block has no header; every
/// `[name]` line opens a snapshot section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub name: Option<String>,
    header: Option<String>,
    lines: Vec<String>,
}

impl Section {
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(String::as_str)
    }
}

/// A guest config split into sections. Lines keep their original text and
/// line endings, so an untouched document serializes back byte-for-byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestConfig {
    sections: Vec<Section>,
}

fn section_name(line: &str) -> Option<&str> {
    let inner = line.trim_end().strip_prefix('[')?.strip_suffix(']')?;
    let valid = !inner.is_empty()
        && inner
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    valid.then_some(inner)
}

impl GuestConfig {
    pub fn parse(text: &str) -> Self {
        let mut sections = vec![Section {
            name: None,
            header: None,
            lines: Vec::new(),
        }];
        for line in text.split_inclusive('\n') {
            if let Some(name) = section_name(line) {
                sections.push(Section {
                    name: Some(name.to_string()),
                    header: Some(line.to_string()),
                    lines: Vec::new(),
                });
                continue;
            }
            if let Some(current) = sections.last_mut() {
                current.lines.push(line.to_string());
            }
        }
        Self { sections }
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    /// Names of all snapshot sections, in file order.
    pub fn snapshot_names(&self) -> Vec<&str> {
        self.sections
            .iter()
            .filter_map(|s| s.name.as_deref())
            .collect()
    }

    pub fn section(&self, name: &str) -> Option<&Section> {
        self.sections
            .iter()
            .find(|s| s.name.as_deref() == Some(name))
    }

    /// Drops the disk lines of snapshot section `snapshot` that reference
    /// `unique_name`. Returns the number of removed lines.
    pub fn remove_disk_references(&mut self, snapshot: &str, unique_name: &str) -> usize {
        let Some(section) = self
            .sections
            .iter_mut()
            .find(|s| s.name.as_deref() == Some(snapshot))
        else {
            return 0;
        };
        let before = section.lines.len();
        section
            .lines
            .retain(|line| !references_disk(line, unique_name));
        before - section.lines.len()
    }
}

/// True when a config line is a disk entry pointing at `unique_name`.
pub fn references_disk(line: &str, unique_name: &str) -> bool {
    unique_name_from_config_line(line.trim_end()).as_deref() == Some(unique_name)
}

impl fmt::Display for GuestConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for section in &self.sections {
            if let Some(header) = &section.header {
                f.write_str(header)?;
            }
            for line in &section.lines {
                f.write_str(line)?;
            }
        }
        Ok(())
    }
}
