//! Closed label set of a trained model.
//!
//! Labels are kept sorted and deduplicated; a label's key is its index, so
//! keys are stable for a given set of labels regardless of manifest order.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Vocabulary {
    labels: Vec<String>,
}

impl Vocabulary {
    pub fn from_labels<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut labels: Vec<String> = labels.into_iter().map(Into::into).collect();
        labels.sort();
        labels.dedup();
        Self { labels }
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn key(&self, label: &str) -> Option<usize> {
        self.labels
            .binary_search_by(|candidate| candidate.as_str().cmp(label))
            .ok()
    }

    pub fn label(&self, key: usize) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// True if the stored labels are strictly increasing (sorted, unique).
    pub fn is_canonical(&self) -> bool {
        self.labels.windows(2).all(|w| w[0] < w[1])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sorted_and_deduplicated() {
        let v = Vocabulary::from_labels(["toaster", "microwave", "toaster", "kettle"]);
        assert_eq!(v.labels(), ["kettle", "microwave", "toaster"]);
        assert_eq!(v.key("microwave"), Some(1));
        assert_eq!(v.key("fridge"), None);
        assert_eq!(v.label(2), Some("toaster"));
        assert_eq!(v.label(3), None);
        assert!(v.is_canonical());
    }

    #[test]
    fn keys_independent_of_input_order() {
        let a = Vocabulary::from_labels(["b", "a", "c"]);
        let b = Vocabulary::from_labels(["c", "b", "a", "a"]);
        assert_eq!(a, b);
    }

    #[test]
    fn serializes_as_plain_list() {
        let v = Vocabulary::from_labels(["dog", "cat"]);
        assert_eq!(serde_json::to_string(&v).unwrap(), r#"["cat","dog"]"#);
        let unsorted: Vocabulary = serde_json::from_str(r#"["dog","cat"]"#).unwrap();
        assert!(!unsorted.is_canonical());
    }
}
