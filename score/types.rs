// ========================================================================================
//                             High-Level Data Contracts
// ========================================================================================

// This file is ONLY for types that are SHARED BETWEEN FILES, not types that only are used in one file.

use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// The unreachable distance. A pair carrying this value never joins a cluster at
/// any finite threshold of interest.
pub const ALMOST_INF: i32 = i32::MAX;

/// The number of unordered pairs over `n` items, i.e. the length of a distance triangle.
#[inline]
pub fn pair_count(n: usize) -> usize {
    n * n.saturating_sub(1) / 2
}

/// A stable identifier for one allelic profile (an ST).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProfileId(pub String);

impl ProfileId {
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProfileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProfileId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ProfileId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// An opaque allele identifier as it appears upstream.
///
/// The variants are deliberately not coerced into each other: `Int(1)` and
/// `Str("1")` name different alleles, and the derived `Eq`/`Hash` keep them apart.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AlleleValue {
    Int(i64),
    Str(String),
    Null,
}

impl AlleleValue {
    /// Whether this value is an actual allele call. Null and empty strings mean
    /// the locus was not called for this profile.
    #[inline]
    pub fn is_call(&self) -> bool {
        match self {
            Self::Int(_) => true,
            Self::Str(s) => !s.is_empty(),
            Self::Null => false,
        }
    }
}

impl From<i64> for AlleleValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for AlleleValue {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<&str> for AlleleValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

/// One organism's allele assignments, as delivered by the parser.
///
/// `matches` is ordered by gene name so that indexing a profile always mints
/// tokens in the same order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub st: ProfileId,
    #[serde(default)]
    pub matches: BTreeMap<String, AlleleValue>,
    #[serde(default, rename = "schemeSize", alias = "scheme_size")]
    pub scheme_size: u32,
}

impl Profile {
    pub fn new<I, G, A>(st: impl Into<ProfileId>, matches: I) -> Self
    where
        I: IntoIterator<Item = (G, A)>,
        G: Into<String>,
        A: Into<AlleleValue>,
    {
        let matches: BTreeMap<String, AlleleValue> = matches
            .into_iter()
            .map(|(gene, allele)| (gene.into(), allele.into()))
            .collect();
        let scheme_size = matches.len() as u32;
        Self {
            st: st.into(),
            matches,
            scheme_size,
        }
    }
}

/// The work order for a single invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub sts: Vec<ProfileId>,
    #[serde(alias = "maxThreshold")]
    pub threshold: i32,
}

/// The artifacts of a previous run, used to seed the score store.
///
/// `edges` maps a distance to the pairs of cache positions found at exactly that
/// distance; it only covers distances up to `threshold`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Cache {
    pub sts: Vec<ProfileId>,
    pub pi: Vec<usize>,
    pub lambda: Vec<i32>,
    pub threshold: i32,
    pub edges: BTreeMap<i32, Vec<[usize; 2]>>,
}

impl Cache {
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.sts.is_empty()
    }
}

/// Collapses repeated ids, keeping the first occurrence, and returns the ordered
/// unique ids together with a lookup from id to position.
pub fn position_lookup(ids: &[ProfileId]) -> (Vec<ProfileId>, AHashMap<ProfileId, usize>) {
    let mut unique = Vec::with_capacity(ids.len());
    let mut lookup = AHashMap::with_capacity(ids.len());
    for id in ids {
        if !lookup.contains_key(id) {
            lookup.insert(id.clone(), unique.len());
            unique.push(id.clone());
        }
    }
    (unique, lookup)
}
