//! Tag keys and canonicalized tag sets.
//!
//! A [`TagSet`] is the dimension key for recorded measurements: an
//! immutable, name-sorted sequence of `(key, value)` pairs with a
//! precomputed content hash, so the delta buffer can use it directly as
//! a hash-map key without re-hashing on every record.

use std::cmp::Ordering;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// A tag dimension key: an interned name with a stable precomputed hash.
///
/// Keys order and compare by name, so two independently created keys
/// with the same name are interchangeable.
#[derive(Debug, Clone)]
pub struct TagKey {
    name: Arc<str>,
    hash: u64,
}

impl TagKey {
    /// Creates a key for `name`.
    pub fn new(name: impl AsRef<str>) -> Self {
        let name: Arc<str> = Arc::from(name.as_ref());
        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        Self {
            hash: hasher.finish(),
            name,
        }
    }

    /// The canonical key name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The precomputed name hash.
    pub fn hash_value(&self) -> u64 {
        self.hash
    }
}

impl PartialEq for TagKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.name == other.name
    }
}

impl Eq for TagKey {}

impl PartialOrd for TagKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TagKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.name.cmp(&other.name)
    }
}

impl Hash for TagKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

/// An immutable, canonicalized set of `(key, value)` tag pairs.
///
/// Pairs are sorted by key name and carry no duplicates; when the input
/// contains the same key more than once, the last occurrence wins. The
/// content hash is computed once at construction, and two tag sets are
/// equal iff their canonical sequences are equal element-wise.
#[derive(Debug, Clone)]
pub struct TagSet {
    tags: Vec<(TagKey, String)>,
    hash: u64,
}

impl TagSet {
    /// Builds a tag set from arbitrary `(key, value)` pairs.
    pub fn new(pairs: impl IntoIterator<Item = (TagKey, String)>) -> Self {
        let mut tags: Vec<(TagKey, String)> = pairs.into_iter().collect();
        canonicalize(&mut tags);
        let hash = content_hash(&tags);
        Self { tags, hash }
    }

    /// Builds a tag set from string pairs, creating the keys inline.
    pub fn from_pairs<K: AsRef<str>, V: Into<String>>(
        pairs: impl IntoIterator<Item = (K, V)>,
    ) -> Self {
        Self::new(
            pairs
                .into_iter()
                .map(|(k, v)| (TagKey::new(k.as_ref()), v.into())),
        )
    }

    /// An empty tag set.
    pub fn empty() -> Self {
        Self::new(std::iter::empty())
    }

    /// Returns a tag set with `overlay` applied: values for existing keys
    /// are replaced, new keys are inserted at their sorted position.
    ///
    /// A single merge walk over the two sorted sequences preserves
    /// canonical order without a full resort.
    pub fn with_tags(&self, overlay: impl IntoIterator<Item = (TagKey, String)>) -> Self {
        let mut overlay: Vec<(TagKey, String)> = overlay.into_iter().collect();
        canonicalize(&mut overlay);

        let mut merged: Vec<(TagKey, String)> =
            Vec::with_capacity(self.tags.len() + overlay.len());
        let mut existing = 0;
        let mut incoming = 0;
        while existing < self.tags.len() && incoming < overlay.len() {
            match self.tags[existing].0.cmp(&overlay[incoming].0) {
                Ordering::Less => {
                    merged.push(self.tags[existing].clone());
                    existing += 1;
                }
                Ordering::Greater => {
                    merged.push(overlay[incoming].clone());
                    incoming += 1;
                }
                Ordering::Equal => {
                    merged.push(overlay[incoming].clone());
                    existing += 1;
                    incoming += 1;
                }
            }
        }
        merged.extend_from_slice(&self.tags[existing..]);
        merged.extend_from_slice(&overlay[incoming..]);

        let hash = content_hash(&merged);
        Self { tags: merged, hash }
    }

    /// The canonical `(key, value)` sequence, sorted by key name.
    pub fn pairs(&self) -> &[(TagKey, String)] {
        &self.tags
    }

    /// Number of tags.
    pub fn len(&self) -> usize {
        self.tags.len()
    }

    /// Whether the set carries no tags.
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    /// The precomputed content hash.
    pub fn hash_value(&self) -> u64 {
        self.hash
    }
}

impl PartialEq for TagSet {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.tags == other.tags
    }
}

impl Eq for TagSet {}

impl Hash for TagSet {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

/// Sorts by key name and drops duplicate keys, keeping the last
/// occurrence in the original input order.
fn canonicalize(tags: &mut Vec<(TagKey, String)>) {
    // Stable sort keeps equal keys in input order, so the last entry of
    // each run is the last occurrence.
    tags.sort_by(|a, b| a.0.cmp(&b.0));
    let mut write = 0;
    let mut read = 0;
    while read < tags.len() {
        let mut last = read;
        while last + 1 < tags.len() && tags[last + 1].0 == tags[read].0 {
            last += 1;
        }
        tags.swap(write, last);
        write += 1;
        read = last + 1;
    }
    tags.truncate(write);
}

/// Mixes the pair hashes through a position-dependent hasher, so that
/// distinct orderings of distinct content do not collide. The sequence
/// is canonical, so equal sets produce identical hashes.
fn content_hash(tags: &[(TagKey, String)]) -> u64 {
    let mut mixer = DefaultHasher::new();
    for (key, value) in tags {
        mixer.write_u64(key.hash_value());
        let mut value_hasher = DefaultHasher::new();
        value.hash(&mut value_hasher);
        mixer.write_u64(value_hasher.finish());
    }
    mixer.finish()
}
