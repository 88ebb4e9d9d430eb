// ========================================================================================
//
//                      Single-linkage clustering in pointer form
//
// ========================================================================================
//
// Sibson's SLINK builds the pointer representation of the single-linkage dendrogram
// one item at a time. For every item `i`:
//
//   lambda[i] is the distance at which `i` joins a cluster containing a larger item,
//   pi[i]     is the largest item of that cluster.
//
// The last item points at itself with lambda = ALMOST_INF. Because item `n` only ever
// needs distances to items `0..n`, the state for a prefix of items can be stored and
// extended later with the remaining rows of the triangle.

use crate::types::{ALMOST_INF, Cache, ProfileId, pair_count};
use log::info;
use std::time::Instant;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ClusterError {
    #[error("expected {expected} distances for the given items but found {actual}")]
    WrongDistanceCount { expected: usize, actual: usize },
    #[error("the cache holds {cached} items but only {items} are being clustered")]
    CacheTooLarge { cached: usize, items: usize },
    #[error("inconsistent clustering input: {0}")]
    Inconsistent(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Clusters {
    pi: Vec<usize>,
    lambda: Vec<i32>,
    sts: Vec<ProfileId>,
}

fn check_distances(distances: &[i32], n_items: usize) -> Result<(), ClusterError> {
    let expected = pair_count(n_items);
    if distances.len() != expected {
        return Err(ClusterError::WrongDistanceCount {
            expected,
            actual: distances.len(),
        });
    }
    Ok(())
}

impl Clusters {
    /// Clusters `sts` given their distance triangle, where the distance between
    /// `a > b` sits at `a * (a - 1) / 2 + b`.
    pub fn from_scratch(distances: &[i32], sts: Vec<ProfileId>) -> Result<Self, ClusterError> {
        check_distances(distances, sts.len())?;
        let n_items = sts.len();
        let mut clusters = Self {
            pi: vec![0; n_items],
            lambda: vec![ALMOST_INF; n_items],
            sts,
        };
        clusters.extend(distances, 0);
        Ok(clusters)
    }

    /// Resumes clustering from the pointer state of a previous run.
    ///
    /// The cached items must be the first `cache.pi.len()` items of `sts`; only the
    /// rows of `distances` for the remaining items are read.
    pub fn from_cache(
        distances: &[i32],
        sts: Vec<ProfileId>,
        cache: &Cache,
    ) -> Result<Self, ClusterError> {
        check_distances(distances, sts.len())?;
        let n_items = sts.len();
        let cached = cache.pi.len();
        if cached > n_items {
            return Err(ClusterError::CacheTooLarge {
                cached,
                items: n_items,
            });
        }
        if cache.lambda.len() != cached {
            return Err(ClusterError::Inconsistent(format!(
                "{} pi values but {} lambda values",
                cached,
                cache.lambda.len()
            )));
        }
        if !cache.sts.is_empty() && cache.sts[..] != sts[..cached.min(cache.sts.len())] {
            return Err(ClusterError::Inconsistent(
                "cached ids are not a prefix of the items".to_string(),
            ));
        }
        if let Some((i, &p)) = cache
            .pi
            .iter()
            .enumerate()
            .find(|&(i, &p)| p >= cached || p < i)
        {
            return Err(ClusterError::Inconsistent(format!(
                "pi[{i}] = {p} does not point at a later cached item"
            )));
        }

        let mut pi = vec![0; n_items];
        let mut lambda = vec![ALMOST_INF; n_items];
        pi[..cached].copy_from_slice(&cache.pi);
        lambda[..cached].copy_from_slice(&cache.lambda);
        let mut clusters = Self { pi, lambda, sts };
        info!(
            "Resuming clustering of {} items from {} cached items",
            n_items, cached
        );
        clusters.extend(distances, cached);
        Ok(clusters)
    }

    /// Adds items `start..` to a pointer representation that covers `0..start`.
    fn extend(&mut self, distances: &[i32], start: usize) {
        let n_items = self.sts.len();
        let begin = Instant::now();
        let mut m = vec![ALMOST_INF; n_items];
        for n in start..n_items {
            let row = pair_count(n);
            m[..n].copy_from_slice(&distances[row..row + n]);
            self.pi[n] = n;
            self.lambda[n] = ALMOST_INF;

            for i in 0..n {
                let p = self.pi[i];
                if m[i] <= self.lambda[i] {
                    m[p] = m[p].min(self.lambda[i]);
                    self.pi[i] = n;
                    self.lambda[i] = m[i];
                } else {
                    m[p] = m[p].min(m[i]);
                }
            }
            for i in 0..n {
                if self.lambda[i] >= self.lambda[self.pi[i]] {
                    self.pi[i] = n;
                }
            }
        }
        info!(
            "Clustered {} items ({} new) in {:.2?}",
            n_items,
            n_items.saturating_sub(start),
            begin.elapsed()
        );
    }

    pub fn n_items(&self) -> usize {
        self.sts.len()
    }

    pub fn pi(&self) -> &[usize] {
        &self.pi
    }

    pub fn lambda(&self) -> &[i32] {
        &self.lambda
    }

    pub fn sts(&self) -> &[ProfileId] {
        &self.sts
    }

    /// Cuts the dendrogram at `threshold`: each item maps to the largest item of its
    /// cluster, which serves as the cluster's representative.
    pub fn get(&self, threshold: i32) -> Vec<usize> {
        let mut representatives = vec![0; self.n_items()];
        for i in (0..self.n_items()).rev() {
            representatives[i] = if self.lambda[i] > threshold || self.pi[i] == i {
                i
            } else {
                representatives[self.pi[i]]
            };
        }
        representatives
    }

    /// Like [`Clusters::get`], naming each representative by its id.
    pub fn labels(&self, threshold: i32) -> Vec<&ProfileId> {
        self.get(threshold)
            .into_iter()
            .map(|representative| &self.sts[representative])
            .collect()
    }
}
