use anyhow::{Context, anyhow, bail};
use dnsprobe_core::orchestration::{DomainEntry, ManualClock, MemoryStore, SystemClock};
use serde::{Deserialize, Serialize};
use std::{fs, io::BufRead, path::Path, time::Duration};

use super::probe::ConfigFormat;

/// One monitored name and its optional per-name schedule.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct DomainSpec {
    pub name: String,
    /// Falls back to the list's or the store's default interval.
    #[serde(default)]
    pub refresh_interval_secs: Option<u64>,
    /// Pins the refresh position within the interval; otherwise derived from
    /// the name.
    #[serde(default)]
    pub refresh_offset_secs: Option<u64>,
}

/// Domain list file contents.
///
/// TOML and JSON files carry a `domains` table array; any other file is read
/// as one name per line with `#` comments.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct DomainList {
    pub default_refresh_interval_secs: Option<u64>,
    pub domains: Vec<DomainSpec>,
}

impl DomainList {
    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read domain list {}", path.display()))?;

        match ConfigFormat::of(path) {
            ConfigFormat::Json => serde_json::from_str(&contents)
                .map_err(|err| anyhow!("invalid domain list {}: {}", path.display(), err)),
            ConfigFormat::Toml => toml::from_str(&contents)
                .map_err(|err| anyhow!("invalid domain list {}: {}", path.display(), err)),
            ConfigFormat::Either => Ok(Self::from_names(parse_name_list(&contents))),
        }
    }

    pub fn from_names<I, N>(names: I) -> Self
    where
        I: IntoIterator<Item = N>,
        N: Into<String>,
    {
        Self {
            default_refresh_interval_secs: None,
            domains: names
                .into_iter()
                .map(|name| DomainSpec {
                    name: name.into(),
                    refresh_interval_secs: None,
                    refresh_offset_secs: None,
                })
                .collect(),
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.domains.iter().map(|spec| spec.name.as_str())
    }

    /// Store entries, with `fallback` used where neither the entry nor the
    /// list names an interval.
    pub fn entries(&self, fallback: Duration) -> anyhow::Result<Vec<DomainEntry>> {
        let default = self
            .default_refresh_interval_secs
            .map(Duration::from_secs)
            .unwrap_or(fallback);

        self.domains
            .iter()
            .map(|spec| {
                let interval = spec
                    .refresh_interval_secs
                    .map(Duration::from_secs)
                    .unwrap_or(default);
                if interval.is_zero() {
                    bail!("refresh interval for {} must be at least one second", spec.name);
                }
                let entry = DomainEntry::new(&spec.name, interval);
                Ok(match spec.refresh_offset_secs {
                    Some(offset) => entry.with_offset(Duration::from_secs(offset)),
                    None => entry,
                })
            })
            .collect()
    }

    pub fn into_store(self, fallback: Duration) -> anyhow::Result<MemoryStore<SystemClock>> {
        let entries = self.entries(fallback)?;
        MemoryStore::from_entries(SystemClock, entries).map_err(|err| anyhow!("{err}"))
    }

    /// Same as [`Self::into_store`] but driven by a hand-set clock.
    pub fn into_manual_store(
        self,
        fallback: Duration,
        clock: ManualClock,
    ) -> anyhow::Result<MemoryStore<ManualClock>> {
        let entries = self.entries(fallback)?;
        MemoryStore::from_entries(clock, entries).map_err(|err| anyhow!("{err}"))
    }
}

/// Names from plain text, one per line; blank lines and `#` comments are
/// skipped.
pub fn parse_name_list(contents: &str) -> Vec<String> {
    contents
        .lines()
        .map(|line| line.split('#').next().unwrap_or_default().trim())
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Like [`parse_name_list`], over any buffered reader (stdin for batch runs).
pub fn read_name_list<R: BufRead>(reader: R) -> anyhow::Result<Vec<String>> {
    let mut names = Vec::new();
    for line in reader.lines() {
        let line = line.context("failed to read domain names")?;
        names.extend(parse_name_list(&line));
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_list_skips_comments_and_blanks() {
        let names = parse_name_list("example.com\n\n# staging\nexample.net  # secondary\n");
        assert_eq!(names, vec!["example.com", "example.net"]);
    }

    #[test]
    fn intervals_fall_back_in_order() {
        let list: DomainList = toml::from_str(
            r#"
            default_refresh_interval_secs = 3600

            [[domains]]
            name = "a.example"

            [[domains]]
            name = "b.example"
            refresh_interval_secs = 600
            refresh_offset_secs = 42
            "#,
        )
        .unwrap();

        let entries = list.entries(Duration::from_secs(86_400)).unwrap();
        assert_eq!(entries[0].refresh_interval, Duration::from_secs(3_600));
        assert_eq!(entries[1].refresh_interval, Duration::from_secs(600));
        assert_eq!(entries[1].refresh_offset, Duration::from_secs(42));
    }

    #[test]
    fn zero_interval_is_rejected() {
        let list = DomainList {
            default_refresh_interval_secs: Some(0),
            domains: vec![DomainSpec {
                name: "a.example".into(),
                refresh_interval_secs: None,
                refresh_offset_secs: None,
            }],
        };
        assert!(list.entries(Duration::from_secs(60)).is_err());
    }

    #[test]
    fn reader_collects_every_line() {
        let names = read_name_list("a.example\nb.example\n".as_bytes()).unwrap();
        assert_eq!(names, vec!["a.example", "b.example"]);
    }
}
