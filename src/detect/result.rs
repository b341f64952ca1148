use indexmap::IndexSet;
use serde::Serialize;

/// Unique object-class labels detected in one frame.
///
/// Labels keep the order in which the detector first reported them; duplicates
/// collapse onto the first occurrence. Equality is set equality.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct DetectionSet {
    labels: IndexSet<String>,
}

impl DetectionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_labels<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut set = Self::new();
        for label in labels {
            set.insert(label);
        }
        set
    }

    /// Add a label, kept verbatim. Empty or whitespace-only labels are
    /// ignored. Returns false for those and for duplicates.
    pub fn insert(&mut self, label: impl Into<String>) -> bool {
        let label = label.into();
        if label.trim().is_empty() {
            return false;
        }
        self.labels.insert(label)
    }

    pub fn contains(&self, label: &str) -> bool {
        self.labels.contains(label)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Labels in detector order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.labels.iter().map(String::as_str)
    }
}

impl<S: Into<String>> FromIterator<S> for DetectionSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self::from_labels(iter)
    }
}
