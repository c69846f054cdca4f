//! Tag manifest: the tab-separated `path<TAB>label` file that training reads.
//!
//! The file is an append-only log. Corrections append a new line for the same
//! path instead of editing the old one, so readers resolve the log into one
//! label per sample (or keep every line) according to a [`DuplicatePolicy`].
//!
//! Lines without a label (`path` alone, or `path<TAB>`) are placeholders for
//! samples ingested before anyone labeled them. They never reach training.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::CoreError;
use crate::sample::SampleState;

/// How repeated lines for the same path are turned into training examples.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DuplicatePolicy {
    /// One example per path carrying its most recent label.
    #[default]
    LastWriteWins,
    /// Every labeled line is its own training example.
    KeepAll,
}

/// One line of the manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub path: String,
    pub label: Option<String>,
}

impl ManifestEntry {
    pub fn labeled(path: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            label: Some(label.into()),
        }
    }

    pub fn unlabeled(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            label: None,
        }
    }

    /// Render the entry as a manifest line, without terminator.
    pub fn to_line(&self) -> String {
        match &self.label {
            Some(label) => format!("{}\t{}", self.path, label),
            None => self.path.clone(),
        }
    }
}

/// A training example after duplicate resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSample {
    pub path: String,
    pub label: String,
    pub state: SampleState,
}

/// Whether `field` can be written into a manifest line unchanged.
///
/// Tabs and line breaks would split the record; empty fields are rejected.
/// Leading or trailing whitespace is rejected too, because [`Manifest::parse`]
/// trims it and the value read back would differ from the value written.
pub fn is_valid_field(field: &str) -> bool {
    !field.is_empty() && field.trim() == field && !field.contains(['\t', '\n', '\r'])
}

/// Parsed manifest contents, in file order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    entries: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn new(entries: Vec<ManifestEntry>) -> Self {
        Self { entries }
    }

    /// Parse manifest text. Blank lines and `\r\n` terminators are tolerated.
    pub fn parse(text: &str) -> Self {
        let text = text.strip_prefix('\u{feff}').unwrap_or(text);
        let mut entries = Vec::new();
        for line in text.lines() {
            let line = line.trim_end_matches('\r');
            if line.trim().is_empty() {
                continue;
            }
            let mut fields = line.splitn(3, '\t');
            let path = fields.next().unwrap_or_default().trim();
            if path.is_empty() {
                continue;
            }
            let label = fields
                .next()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string);
            entries.push(ManifestEntry {
                path: path.to_string(),
                label,
            });
        }
        Self { entries }
    }

    /// Read and parse a manifest file.
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let text = std::fs::read_to_string(path).map_err(|source| CoreError::ManifestRead {
            path: path.to_path_buf(),
            source,
        })?;
        let manifest = Self::parse(&text);
        tracing::debug!(path = %path.display(), lines = manifest.len(), "loaded manifest");
        Ok(manifest)
    }

    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Most recent label recorded for `path`.
    pub fn current_label(&self, path: &str) -> Option<&str> {
        self.entries
            .iter()
            .rev()
            .filter(|e| e.path == path)
            .find_map(|e| e.label.as_deref())
    }

    /// Lifecycle state of `path`, or `None` if it never appeared.
    pub fn state(&self, path: &str) -> Option<SampleState> {
        let mut state = None;
        for entry in self.entries.iter().filter(|e| e.path == path) {
            state = Some(match (state, &entry.label) {
                (None, None) => SampleState::Unlabeled,
                (Some(s), None) => s,
                (None | Some(SampleState::Unlabeled), Some(_)) => SampleState::Labeled,
                (Some(_), Some(_)) => SampleState::Corrected,
            });
        }
        state
    }

    /// Paths that only ever appeared as placeholders.
    pub fn unlabeled_paths(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.entries
            .iter()
            .map(|e| e.path.as_str())
            .filter(|p| seen.insert(*p))
            .filter(|p| self.state(p) == Some(SampleState::Unlabeled))
            .collect()
    }

    /// Turn the line log into training examples.
    ///
    /// Output keeps first-introduction order for `LastWriteWins` and line
    /// order for `KeepAll`.
    pub fn resolve(&self, policy: DuplicatePolicy) -> Vec<ResolvedSample> {
        match policy {
            DuplicatePolicy::LastWriteWins => {
                let mut index: HashMap<&str, usize> = HashMap::new();
                let mut out: Vec<ResolvedSample> = Vec::new();
                for entry in &self.entries {
                    let Some(label) = &entry.label else {
                        continue;
                    };
                    match index.get(entry.path.as_str()) {
                        Some(&i) => {
                            out[i].label.clone_from(label);
                            out[i].state = SampleState::Corrected;
                        }
                        None => {
                            index.insert(&entry.path, out.len());
                            out.push(ResolvedSample {
                                path: entry.path.clone(),
                                label: label.clone(),
                                state: SampleState::Labeled,
                            });
                        }
                    }
                }
                out
            }
            DuplicatePolicy::KeepAll => {
                let mut seen: HashSet<&str> = HashSet::new();
                self.entries
                    .iter()
                    .filter_map(|entry| {
                        let label = entry.label.as_ref()?;
                        let state = if seen.insert(&entry.path) {
                            SampleState::Labeled
                        } else {
                            SampleState::Corrected
                        };
                        Some(ResolvedSample {
                            path: entry.path.clone(),
                            label: label.clone(),
                            state,
                        })
                    })
                    .collect()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tab_separated_lines() {
        let m = Manifest::parse("img1.jpg\ttoaster\nimg2.jpg\tmicrowave\n");
        assert_eq!(
            m.entries(),
            &[
                ManifestEntry::labeled("img1.jpg", "toaster"),
                ManifestEntry::labeled("img2.jpg", "microwave"),
            ]
        );
    }

    #[test]
    fn tolerates_blank_lines_crlf_and_bom() {
        let m = Manifest::parse("\u{feff}a.jpg\tcat\r\n\r\n\nb.jpg\tdog\r\n   \n");
        assert_eq!(m.len(), 2);
        assert_eq!(m.entries()[1], ManifestEntry::labeled("b.jpg", "dog"));
    }

    #[test]
    fn placeholder_lines_are_unlabeled() {
        let m = Manifest::parse("a.jpg\nb.jpg\t\nc.jpg\tcat\n");
        assert_eq!(m.entries()[0].label, None);
        assert_eq!(m.entries()[1].label, None);
        assert_eq!(m.state("a.jpg"), Some(SampleState::Unlabeled));
        assert_eq!(m.unlabeled_paths(), vec!["a.jpg", "b.jpg"]);
        assert_eq!(m.resolve(DuplicatePolicy::KeepAll).len(), 1);
    }

    #[test]
    fn state_machine_follows_line_history() {
        let m = Manifest::parse("a.jpg\na.jpg\tcat\nb.jpg\tdog\nb.jpg\tfox\nb.jpg\towl\n");
        assert_eq!(m.state("a.jpg"), Some(SampleState::Labeled));
        assert_eq!(m.state("b.jpg"), Some(SampleState::Corrected));
        assert_eq!(m.state("zzz.jpg"), None);
        assert_eq!(m.current_label("b.jpg"), Some("owl"));
    }

    #[test]
    fn last_write_wins_keeps_one_label_per_path() {
        let m = Manifest::parse("a.jpg\tcat\nb.jpg\tdog\na.jpg\tfox\n");
        let resolved = m.resolve(DuplicatePolicy::LastWriteWins);
        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved[0].path, "a.jpg");
        assert_eq!(resolved[0].label, "fox");
        assert_eq!(resolved[0].state, SampleState::Corrected);
        assert_eq!(resolved[1].label, "dog");
        assert_eq!(resolved[1].state, SampleState::Labeled);
    }

    #[test]
    fn keep_all_duplicates_examples() {
        let m = Manifest::parse("a.jpg\tcat\na.jpg\tcat\na.jpg\tfox\n");
        let resolved = m.resolve(DuplicatePolicy::KeepAll);
        assert_eq!(resolved.len(), 3);
        assert_eq!(resolved[0].state, SampleState::Labeled);
        assert_eq!(resolved[2].label, "fox");
        assert_eq!(resolved[2].state, SampleState::Corrected);
    }

    #[test]
    fn line_rendering() {
        assert_eq!(ManifestEntry::labeled("a.jpg", "cat").to_line(), "a.jpg\tcat");
        assert_eq!(ManifestEntry::unlabeled("a.jpg").to_line(), "a.jpg");
    }

    #[test]
    fn field_validation() {
        assert!(is_valid_field("toaster"));
        assert!(!is_valid_field(""));
        assert!(!is_valid_field("  "));
        assert!(!is_valid_field("a\tb"));
        assert!(!is_valid_field("a\nb"));
        assert!(is_valid_field("golden retriever"));
        assert!(!is_valid_field(" cat"));
        assert!(!is_valid_field("cat "));
    }

    #[test]
    fn valid_fields_read_back_unchanged() {
        for label in ["cat", "golden retriever", "x"] {
            assert!(is_valid_field(label));
            let m = Manifest::parse(&ManifestEntry::labeled("a.jpg", label).to_line());
            assert_eq!(m.current_label("a.jpg"), Some(label));
        }
    }

    #[test]
    fn load_missing_file_errors() {
        let err = Manifest::load(Path::new("/nonexistent/tags.tsv")).unwrap_err();
        assert!(matches!(err, CoreError::ManifestRead { .. }));
    }

    #[test]
    fn load_from_disk() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("tags.tsv");
        std::fs::write(&path, "a.jpg\tcat\n").unwrap();
        let m = Manifest::load(&path).unwrap();
        assert_eq!(m.current_label("a.jpg"), Some("cat"));
    }
}
