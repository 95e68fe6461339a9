//! Insertion-ordered `provider → backend → [T]` maps.
//!
//! [`Dispatch`](crate::Dispatch), [`ResultCollector`](crate::ResultCollector)
//! and the payloads handed to merge policies all share this shape. Providers
//! and backends are kept in first-insertion order; a run rarely touches more
//! than a handful of either, so lookups are linear scans.

use std::ops::Index;

use serde::ser::{Serialize, SerializeMap, Serializer};

/// Backend name → items, in insertion order.
#[derive(Debug, Clone, PartialEq)]
pub struct Buckets<T> {
    entries: Vec<(String, Vec<T>)>,
}

impl<T> Buckets<T> {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn get(&self, backend: &str) -> Option<&Vec<T>> {
        self.entries
            .iter()
            .find(|(name, _)| name == backend)
            .map(|(_, items)| items)
    }

    fn get_mut(&mut self, backend: &str) -> Option<&mut Vec<T>> {
        self.entries
            .iter_mut()
            .find(|(name, _)| name == backend)
            .map(|(_, items)| items)
    }

    fn entry(&mut self, backend: &str) -> &mut Vec<T> {
        let pos = match self.entries.iter().position(|(name, _)| name == backend) {
            Some(pos) => pos,
            None => {
                self.entries.push((backend.to_string(), Vec::new()));
                self.entries.len() - 1
            }
        };
        &mut self.entries[pos].1
    }

    pub fn contains(&self, backend: &str) -> bool {
        self.get(backend).is_some()
    }

    /// Backend names in insertion order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[T])> {
        self.entries
            .iter()
            .map(|(name, items)| (name.as_str(), items.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T> Index<&str> for Buckets<T> {
    type Output = Vec<T>;

    fn index(&self, backend: &str) -> &Vec<T> {
        self.get(backend)
            .unwrap_or_else(|| panic!("no backend '{backend}' in bucket"))
    }
}

/// Provider name → [`Buckets`], in insertion order.
#[derive(Debug, Clone, PartialEq)]
pub struct Nested<T> {
    providers: Vec<(String, Buckets<T>)>,
}

impl<T> Default for Nested<T> {
    fn default() -> Self {
        Self {
            providers: Vec::new(),
        }
    }
}

impl<T> Nested<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, provider: &str) -> Option<&Buckets<T>> {
        self.providers
            .iter()
            .find(|(name, _)| name == provider)
            .map(|(_, buckets)| buckets)
    }

    pub fn bucket(&self, provider: &str, backend: &str) -> Option<&Vec<T>> {
        self.get(provider).and_then(|buckets| buckets.get(backend))
    }

    pub(crate) fn bucket_mut(&mut self, provider: &str, backend: &str) -> Option<&mut Vec<T>> {
        self.providers
            .iter_mut()
            .find(|(name, _)| name == provider)
            .and_then(|(_, buckets)| buckets.get_mut(backend))
    }

    /// The `provider → backend` bucket, created empty if absent.
    pub(crate) fn entry(&mut self, provider: &str, backend: &str) -> &mut Vec<T> {
        let pos = match self.providers.iter().position(|(name, _)| name == provider) {
            Some(pos) => pos,
            None => {
                self.providers.push((provider.to_string(), Buckets::new()));
                self.providers.len() - 1
            }
        };
        self.providers[pos].1.entry(backend)
    }

    /// Append `item` to its bucket and return its position within it.
    pub fn push(&mut self, provider: &str, backend: &str, item: T) -> usize {
        let bucket = self.entry(provider, backend);
        bucket.push(item);
        bucket.len() - 1
    }

    pub fn contains(&self, provider: &str) -> bool {
        self.get(provider).is_some()
    }

    /// Provider names in insertion order.
    pub fn providers(&self) -> impl Iterator<Item = &str> {
        self.providers.iter().map(|(name, _)| name.as_str())
    }

    /// `(provider, backends)` in insertion order.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &Buckets<T>)> {
        self.providers
            .iter()
            .map(|(name, buckets)| (name.as_str(), buckets))
    }

    /// `(provider, backend, items)` for every bucket.
    pub fn buckets(&self) -> impl Iterator<Item = (&str, &str, &[T])> {
        self.providers.iter().flat_map(|(provider, buckets)| {
            buckets
                .iter()
                .map(move |(backend, items)| (provider.as_str(), backend, items))
        })
    }

    /// `(provider, backend, item)` across providers, then backends, then items.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, &T)> {
        self.buckets()
            .flat_map(|(provider, backend, items)| {
                items.iter().map(move |item| (provider, backend, item))
            })
    }

    pub(crate) fn values_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.providers.iter_mut().flat_map(|(_, buckets)| {
            buckets
                .entries
                .iter_mut()
                .flat_map(|(_, items)| items.iter_mut())
        })
    }

    /// Number of providers.
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Number of items across every bucket.
    pub fn total(&self) -> usize {
        self.buckets().map(|(_, _, items)| items.len()).sum()
    }

    /// Same shape, every item mapped through `f`.
    pub fn map<U>(&self, mut f: impl FnMut(&T) -> U) -> Nested<U> {
        Nested {
            providers: self
                .providers
                .iter()
                .map(|(provider, buckets)| {
                    let entries = buckets
                        .entries
                        .iter()
                        .map(|(backend, items)| (backend.clone(), items.iter().map(&mut f).collect()))
                        .collect();
                    (provider.clone(), Buckets { entries })
                })
                .collect(),
        }
    }

    /// Consume the map, yielding owned `(provider, backend, items)` buckets.
    pub fn into_buckets(self) -> impl Iterator<Item = (String, String, Vec<T>)> {
        self.providers.into_iter().flat_map(|(provider, buckets)| {
            buckets
                .entries
                .into_iter()
                .map(move |(backend, items)| (provider.clone(), backend, items))
        })
    }
}

impl<T> Index<&str> for Nested<T> {
    type Output = Buckets<T>;

    fn index(&self, provider: &str) -> &Buckets<T> {
        self.get(provider)
            .unwrap_or_else(|| panic!("no provider '{provider}' in map"))
    }
}

impl<T: Serialize> Serialize for Buckets<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (backend, items) in &self.entries {
            map.serialize_entry(backend, items)?;
        }
        map.end()
    }
}

impl<T: Serialize> Serialize for Nested<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.providers.len()))?;
        for (provider, buckets) in &self.providers {
            map.serialize_entry(provider, buckets)?;
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insertion_order_is_kept() {
        let mut nested = Nested::new();
        nested.push("p2", "b1", 1);
        nested.push("p1", "b9", 2);
        nested.push("p2", "b0", 3);
        nested.push("p2", "b1", 4);

        let order: Vec<_> = nested.iter().map(|(p, b, v)| (p, b, *v)).collect();
        assert_eq!(
            order,
            vec![("p2", "b1", 1), ("p2", "b1", 4), ("p2", "b0", 3), ("p1", "b9", 2)]
        );
        assert_eq!(nested.providers().collect::<Vec<_>>(), vec!["p2", "p1"]);
        assert_eq!(nested["p2"]["b1"], vec![1, 4]);
        assert_eq!(nested.total(), 4);
    }

    #[test]
    fn test_map_preserves_shape() {
        let mut nested = Nested::new();
        nested.push("p", "a", 2);
        nested.push("p", "b", 3);

        let doubled = nested.map(|v| v * 2);
        assert_eq!(doubled.bucket("p", "a"), Some(&vec![4]));
        assert_eq!(doubled.bucket("p", "b"), Some(&vec![6]));
        assert!(doubled.bucket("q", "a").is_none());
    }

    #[test]
    fn test_serializes_as_ordered_maps() {
        let mut nested = Nested::new();
        nested.push("zeta", "b", "x");
        nested.push("alpha", "a", "y");

        let json = serde_json::to_string(&nested).unwrap();
        assert_eq!(json, r#"{"zeta":{"b":["x"]},"alpha":{"a":["y"]}}"#);
    }
}
