use serde::Serialize;
use std::collections::BTreeMap;

pub type Reading = i64;

/// Readings from one scrape, keyed by exposition metric name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ReadingSet(BTreeMap<String, Reading>);

impl ReadingSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last write wins for a repeated name.
    pub fn insert(&mut self, name: impl Into<String>, value: Reading) -> Option<Reading> {
        self.0.insert(name.into(), value)
    }

    #[cfg(test)]
    pub fn get(&self, name: &str) -> Option<Reading> {
        self.0.get(name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Reading)> {
        self.0.iter().map(|(name, value)| (name.as_str(), *value))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

impl<S: Into<String>> FromIterator<(S, Reading)> for ReadingSet {
    fn from_iter<I: IntoIterator<Item = (S, Reading)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(name, value)| (name.into(), value))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_as_flat_object() {
        let set: ReadingSet = [("humidity", 55), ("cpu_temp", 23500)].into_iter().collect();
        let json = String::from_utf8(set.to_json().unwrap()).unwrap();
        assert_eq!(json, r#"{"cpu_temp":23500,"humidity":55}"#);
    }

    #[test]
    fn insert_overwrites_previous_value() {
        let mut set = ReadingSet::new();
        assert_eq!(set.insert("a", 1), None);
        assert_eq!(set.insert("a", 2), Some(1));
        assert_eq!(set.get("a"), Some(2));
        assert_eq!(set.len(), 1);
    }
}
