//! Session parameter sets
//!
//! Parameter names are matched case-insensitively, the way the backend
//! treats GUC names, while the first spelling seen is kept for reporting.

/// Ordered set of `name = value` session parameters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParamSet {
    items: Vec<(String, String)>,
}

impl ParamSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.items
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Insert or replace; returns true when the stored value changed
    pub fn set(&mut self, name: &str, value: &str) -> bool {
        match self
            .items
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
        {
            Some((_, v)) if v == value => false,
            Some((_, v)) => {
                *v = value.to_owned();
                true
            }
            None => {
                self.items.push((name.to_owned(), value.to_owned()));
                true
            }
        }
    }

    /// Overlay every entry of `other` onto this set
    pub fn merge(&mut self, other: &ParamSet) {
        for (name, value) in other.iter() {
            self.set(name, value);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.items.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Entries of `target` restricted to `names` whose value differs from `self`
    pub fn diff<'a>(&self, target: &'a ParamSet, names: &[&str]) -> Vec<(&'a str, &'a str)> {
        target
            .iter()
            .filter(|(name, _)| names.iter().any(|n| n.eq_ignore_ascii_case(name)))
            .filter(|(name, value)| self.get(name) != Some(*value))
            .collect()
    }
}

impl<'a> FromIterator<(&'a str, &'a str)> for ParamSet {
    fn from_iter<I: IntoIterator<Item = (&'a str, &'a str)>>(iter: I) -> Self {
        let mut set = Self::new();
        for (name, value) in iter {
            set.set(name, value);
        }
        set
    }
}
