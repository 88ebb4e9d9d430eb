use super::slink::{ClusterError, Clusters};
use crate::types::{Cache, ProfileId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One document of clustering output.
///
/// A run emits one `Edges` document for every distance from 0 to the threshold, each
/// listing the pairs of store positions `[b, a]` (with `b < a`) found at exactly that
/// distance, and then a single `Summary` carrying the pointer representation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged, try_from = "RawOutput")]
pub enum ClusterOutput {
    Edges {
        edges: BTreeMap<i32, Vec<[usize; 2]>>,
    },
    Summary {
        sts: Vec<ProfileId>,
        pi: Vec<usize>,
        lambda: Vec<i32>,
        threshold: i32,
    },
}

// Untagged enums buffer their input, which loses serde_json's integer map keys, so
// documents are read through a flat struct and sorted into variants afterwards.
#[derive(Deserialize)]
struct RawOutput {
    edges: Option<BTreeMap<i32, Vec<[usize; 2]>>>,
    sts: Option<Vec<ProfileId>>,
    pi: Option<Vec<usize>>,
    lambda: Option<Vec<i32>>,
    threshold: Option<i32>,
}

impl TryFrom<RawOutput> for ClusterOutput {
    type Error = String;

    fn try_from(raw: RawOutput) -> Result<Self, Self::Error> {
        match raw {
            RawOutput {
                edges: Some(edges),
                sts: None,
                ..
            } => Ok(Self::Edges { edges }),
            RawOutput {
                edges: None,
                sts: Some(sts),
                pi: Some(pi),
                lambda: Some(lambda),
                threshold: Some(threshold),
            } => Ok(Self::Summary {
                sts,
                pi,
                lambda,
                threshold,
            }),
            _ => Err("expected either an edges or a summary document".to_string()),
        }
    }
}

/// Groups the pairs of the distance triangle whose distance lies in `0..=threshold`.
/// Only distances that actually occur get an entry.
pub fn edges_by_distance(
    distances: &[i32],
    n_items: usize,
    threshold: i32,
) -> BTreeMap<i32, Vec<[usize; 2]>> {
    let mut edges: BTreeMap<i32, Vec<[usize; 2]>> = BTreeMap::new();
    let mut k = 0;
    for a in 1..n_items {
        for b in 0..a {
            let distance = distances[k];
            if (0..=threshold).contains(&distance) {
                edges.entry(distance).or_default().push([b, a]);
            }
            k += 1;
        }
    }
    edges
}

/// The number of documents [`Clusters::format`] yields for `threshold`.
pub fn document_count(threshold: i32) -> u64 {
    (i64::from(threshold).max(-1) + 2) as u64
}

/// The output documents of one clustering, produced one at a time.
///
/// Distances in `0..=threshold` with no pairs still get their (empty) document, but
/// those are made on demand, so memory only grows with the pairs that exist.
#[derive(Debug)]
pub struct Documents<'a> {
    clusters: &'a Clusters,
    threshold: i32,
    next_distance: i64,
    edges: BTreeMap<i32, Vec<[usize; 2]>>,
    summary_sent: bool,
}

impl Iterator for Documents<'_> {
    type Item = ClusterOutput;

    fn next(&mut self) -> Option<ClusterOutput> {
        if self.next_distance <= i64::from(self.threshold) {
            let distance = self.next_distance as i32;
            self.next_distance += 1;
            let pairs = self.edges.remove(&distance).unwrap_or_default();
            return Some(ClusterOutput::Edges {
                edges: BTreeMap::from([(distance, pairs)]),
            });
        }
        if self.summary_sent {
            return None;
        }
        self.summary_sent = true;
        Some(ClusterOutput::Summary {
            sts: self.clusters.sts().to_vec(),
            pi: self.clusters.pi().to_vec(),
            lambda: self.clusters.lambda().to_vec(),
            threshold: self.threshold,
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let edges_left = (i64::from(self.threshold) + 1 - self.next_distance).max(0) as u64;
        let left = edges_left + u64::from(!self.summary_sent);
        match usize::try_from(left) {
            Ok(left) => (left, Some(left)),
            Err(_) => (usize::MAX, None),
        }
    }
}

impl Clusters {
    /// Renders the clustering as output documents. `distances` must be the triangle
    /// these clusters were built from.
    pub fn format<'a>(&'a self, threshold: i32, distances: &[i32]) -> Documents<'a> {
        Documents {
            clusters: self,
            threshold,
            next_distance: 0,
            edges: edges_by_distance(distances, self.n_items(), threshold),
            summary_sent: false,
        }
    }

    /// The cache a later run can resume from, without going through the documents.
    pub fn cache(&self, threshold: i32, distances: &[i32]) -> Cache {
        Cache {
            sts: self.sts().to_vec(),
            pi: self.pi().to_vec(),
            lambda: self.lambda().to_vec(),
            threshold,
            edges: edges_by_distance(distances, self.n_items(), threshold),
        }
    }
}

impl Cache {
    /// Reassembles the documents of a previous run into a cache for the next one.
    pub fn from_outputs<I>(outputs: I) -> Result<Cache, ClusterError>
    where
        I: IntoIterator<Item = ClusterOutput>,
    {
        let mut edges: BTreeMap<i32, Vec<[usize; 2]>> = BTreeMap::new();
        let mut summary = None;
        for output in outputs {
            match output {
                ClusterOutput::Edges { edges: found } => {
                    for (distance, pairs) in found.into_iter().filter(|(_, p)| !p.is_empty()) {
                        edges.entry(distance).or_default().extend(pairs);
                    }
                }
                ClusterOutput::Summary {
                    sts,
                    pi,
                    lambda,
                    threshold,
                } => {
                    if summary.is_some() {
                        return Err(ClusterError::Inconsistent(
                            "more than one summary document".to_string(),
                        ));
                    }
                    summary = Some((sts, pi, lambda, threshold));
                }
            }
        }
        let (sts, pi, lambda, threshold) = summary.ok_or_else(|| {
            ClusterError::Inconsistent("no summary document".to_string())
        })?;
        Ok(Cache {
            sts,
            pi,
            lambda,
            threshold,
            edges,
        })
    }
}
