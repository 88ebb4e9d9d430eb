// ========================================================================================
//
//                    The score store: one slot per unordered pair
//
// ========================================================================================
//
// Distances are kept once per unordered pair in a packed lower triangle. The slot for
// positions `a > b` is `a * (a - 1) / 2 + b`, so slots for row `a` are contiguous and
// rows follow each other in order. This is exactly the layout SLINK consumes.
//
// Slots are written concurrently by the scoring workers. Each slot is owned by exactly
// one worker (the work queue hands out every pending slot once), so values and statuses
// are plain atomics written with relaxed ordering; joining the workers publishes them.

use crate::types::{ALMOST_INF, Cache, ProfileId, Request, pair_count, position_lookup};
use ahash::AHashMap;
use log::info;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI32, AtomicU8, AtomicUsize, Ordering};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("invalid cache: {0}")]
    BadCache(String),
    #[error("pair ({a}, {b}) is not addressable in a store of {n} profiles")]
    OutOfRangePair { a: usize, b: usize, n: usize },
    #[error("{pending} pairs have not been scored yet")]
    Incomplete { pending: usize },
}

/// Lifecycle of a slot. The discriminants are stable and appear in serialised output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ScoreStatus {
    Pending = 0,
    Complete = 1,
    FromCache = 2,
}

impl ScoreStatus {
    #[inline]
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Complete,
            2 => Self::FromCache,
            _ => Self::Pending,
        }
    }
}

/// A snapshot of one slot. `st_a > st_b` always; both are store positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScoreSlot {
    pub st_a: u32,
    pub st_b: u32,
    pub value: i32,
    pub status: ScoreStatus,
}

/// One unit of work for the scoring pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScoreJob {
    pub slot: usize,
    pub a: usize,
    pub b: usize,
}

/// The finished distance triangle, in store order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoresResult {
    pub sts: Vec<ProfileId>,
    pub scores: Vec<i32>,
}

// Slot of the unordered pair `{a, b}`; callers have already checked `a != b`.
#[inline(always)]
fn slot_index(a: usize, b: usize) -> usize {
    let (max, min) = if a > b { (a, b) } else { (b, a) };
    max * (max - 1) / 2 + min
}

/// How the ids of a request are laid out in the store, and how the cache maps onto it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreOrder {
    /// Store positions to ids: cached ids first, in cache order, then the rest of the request.
    pub sts: Vec<ProfileId>,
    /// For each cache position, its store position, or -1 if the request does not need it.
    pub cache_to_store: Vec<isize>,
    /// Whether the cached SLINK state may be extended instead of recomputed.
    pub reusable: bool,
}

impl StoreOrder {
    pub fn new(request: &Request, cache: &Cache) -> Self {
        let (_, requested) = position_lookup(&request.sts);
        let mut reusable = !cache.sts.is_empty()
            && cache.pi.len() == cache.sts.len()
            && cache.lambda.len() == cache.sts.len()
            && cache.threshold >= request.threshold;

        let mut sts = Vec::with_capacity(requested.len());
        let mut placed: AHashMap<&ProfileId, usize> = AHashMap::with_capacity(requested.len());
        let mut cache_to_store = Vec::with_capacity(cache.sts.len());

        for st in &cache.sts {
            if let Some(&previous) = placed.get(st) {
                reusable = false;
                cache_to_store.push(previous as isize);
            } else if !requested.contains_key(st) {
                reusable = false;
                cache_to_store.push(-1);
            } else {
                placed.insert(st, sts.len());
                cache_to_store.push(sts.len() as isize);
                sts.push(st.clone());
            }
        }

        for st in &request.sts {
            if !placed.contains_key(st) {
                placed.insert(st, sts.len());
                sts.push(st.clone());
            }
        }

        Self {
            sts,
            cache_to_store,
            reusable,
        }
    }
}

fn validate_cache(cache: &Cache) -> Result<(), StoreError> {
    let n = cache.sts.len();
    if cache.pi.len() != n || cache.lambda.len() != n {
        return Err(StoreError::BadCache(format!(
            "{} sts but {} pi and {} lambda values",
            n,
            cache.pi.len(),
            cache.lambda.len()
        )));
    }
    if let Some(&bad) = cache.pi.iter().find(|&&p| p >= n) {
        return Err(StoreError::BadCache(format!(
            "pi value {bad} is outside [0, {n})"
        )));
    }
    for (distance, pairs) in &cache.edges {
        if *distance < 0 {
            return Err(StoreError::BadCache(format!("negative distance {distance}")));
        }
        for &[i, j] in pairs {
            if i >= n || j >= n || i == j {
                return Err(StoreError::BadCache(format!(
                    "edge ({i}, {j}) at distance {distance} is outside [0, {n})"
                )));
            }
        }
    }
    Ok(())
}

/// Triangular storage of per-pair scores for one request.
#[derive(Debug)]
pub struct ScoreStore {
    sts: Vec<ProfileId>,
    index_offsets: Vec<usize>,
    cache_to_store: Vec<isize>,
    cache_reusable: bool,
    values: Vec<AtomicI32>,
    statuses: Vec<AtomicU8>,
    todo: AtomicUsize,
}

impl ScoreStore {
    /// Lays out the request, allocates every slot as pending and seeds what the cache knows.
    pub fn new(request: &Request, cache: &Cache) -> Result<Self, StoreError> {
        validate_cache(cache)?;
        let order = StoreOrder::new(request, cache);
        let (_, requested) = position_lookup(&request.sts);
        let index_offsets = order.sts.iter().map(|st| requested[st]).collect();

        let n_slots = pair_count(order.sts.len());
        let store = Self {
            sts: order.sts,
            index_offsets,
            cache_to_store: order.cache_to_store,
            cache_reusable: order.reusable,
            values: (0..n_slots).map(|_| AtomicI32::new(ALMOST_INF)).collect(),
            statuses: (0..n_slots)
                .map(|_| AtomicU8::new(ScoreStatus::Pending as u8))
                .collect(),
            todo: AtomicUsize::new(n_slots),
        };
        store.seed_from_cache(request, cache);
        info!(
            "Score store holds {} pairs over {} profiles; {} taken from cache, cache reusable: {}",
            store.len(),
            store.n_items(),
            store.done(),
            store.cache_reusable
        );
        Ok(store)
    }

    fn seed_from_cache(&self, request: &Request, cache: &Cache) {
        let map = &self.cache_to_store;
        if cache.threshold >= request.threshold {
            // Pairs of cached ids absent from the edge list are further apart than the
            // cached threshold, and so also beyond the requested one.
            for (i, &a) in map.iter().enumerate() {
                if a < 0 {
                    continue;
                }
                for &b in &map[..i] {
                    if b < 0 || a == b {
                        continue;
                    }
                    self.set(
                        slot_index(a as usize, b as usize),
                        ALMOST_INF,
                        ScoreStatus::FromCache,
                    );
                }
            }
        }

        for (&distance, pairs) in &cache.edges {
            for &[i, j] in pairs {
                let (a, b) = (map[i], map[j]);
                if a < 0 || b < 0 || a == b {
                    continue;
                }
                self.set(
                    slot_index(a as usize, b as usize),
                    distance,
                    ScoreStatus::FromCache,
                );
            }
        }
    }

    /// The number of slots, `N * (N - 1) / 2`.
    #[inline]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    #[inline]
    pub fn n_items(&self) -> usize {
        self.sts.len()
    }

    pub fn sts(&self) -> &[ProfileId] {
        &self.sts
    }

    /// The indexer offset of the id at store position `position`.
    #[inline]
    pub fn index_offset(&self, position: usize) -> usize {
        self.index_offsets[position]
    }

    pub fn cache_to_store(&self) -> &[isize] {
        &self.cache_to_store
    }

    pub fn cache_reusable(&self) -> bool {
        self.cache_reusable
    }

    /// Slots still waiting for a score.
    pub fn todo(&self) -> usize {
        self.todo.load(Ordering::Relaxed)
    }

    /// Slots with a value, whether computed or cached.
    pub fn done(&self) -> usize {
        self.len() - self.todo()
    }

    fn check_pair(&self, a: usize, b: usize) -> Result<usize, StoreError> {
        let n = self.n_items();
        if a == b || a >= n || b >= n {
            return Err(StoreError::OutOfRangePair { a, b, n });
        }
        Ok(slot_index(a, b))
    }

    pub fn index_of(&self, a: usize, b: usize) -> Result<usize, StoreError> {
        self.check_pair(a, b)
    }

    /// Reads the slot for `{a, b}`; the order of the arguments does not matter.
    pub fn get(&self, a: usize, b: usize) -> Result<ScoreSlot, StoreError> {
        let k = self.check_pair(a, b)?;
        Ok(ScoreSlot {
            st_a: a.max(b) as u32,
            st_b: a.min(b) as u32,
            value: self.values[k].load(Ordering::Relaxed),
            status: ScoreStatus::from_u8(self.statuses[k].load(Ordering::Relaxed)),
        })
    }

    /// Writes slot `k`. Only the worker that owns `k` may call this during scoring.
    #[inline]
    pub fn set(&self, k: usize, value: i32, status: ScoreStatus) {
        self.values[k].store(value, Ordering::Relaxed);
        let previous = ScoreStatus::from_u8(self.statuses[k].swap(status as u8, Ordering::Relaxed));
        if previous == ScoreStatus::Pending && status != ScoreStatus::Pending {
            self.todo.fetch_sub(1, Ordering::Relaxed);
        } else if previous != ScoreStatus::Pending && status == ScoreStatus::Pending {
            self.todo.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn set_pair(
        &self,
        a: usize,
        b: usize,
        value: i32,
        status: ScoreStatus,
    ) -> Result<(), StoreError> {
        let k = self.check_pair(a, b)?;
        self.set(k, value, status);
        Ok(())
    }

    /// Every pending slot, in slot order.
    pub fn pending(&self) -> impl Iterator<Item = ScoreJob> + '_ {
        (1..self.n_items())
            .flat_map(|a| (0..a).map(move |b| (a, b)))
            .enumerate()
            .filter(|&(slot, _)| {
                self.statuses[slot].load(Ordering::Relaxed) == ScoreStatus::Pending as u8
            })
            .map(|(slot, (a, b))| ScoreJob { slot, a, b })
    }

    /// The distance triangle in slot order. Fails while any slot is pending.
    pub fn distances(&self) -> Result<Vec<i32>, StoreError> {
        let pending = self.todo();
        if pending > 0 {
            return Err(StoreError::Incomplete { pending });
        }
        Ok(self
            .values
            .iter()
            .map(|value| value.load(Ordering::Relaxed))
            .collect())
    }

    pub fn result(&self) -> Result<ScoresResult, StoreError> {
        Ok(ScoresResult {
            sts: self.sts.clone(),
            scores: self.distances()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(names: &[&str]) -> Vec<ProfileId> {
        names.iter().map(|&name| ProfileId::from(name)).collect()
    }

    fn request(names: &[&str], threshold: i32) -> Request {
        Request {
            sts: ids(names),
            threshold,
        }
    }

    fn cache(names: &[&str], threshold: i32) -> Cache {
        Cache {
            sts: ids(names),
            pi: (0..names.len()).map(|_| names.len() - 1).collect(),
            lambda: vec![ALMOST_INF; names.len()],
            threshold,
            ..Cache::default()
        }
    }

    #[test]
    fn index_of_is_symmetric_and_dense() {
        let mut expected = 0;
        for a in 1..20 {
            for b in 0..a {
                assert_eq!(slot_index(a, b), expected);
                assert_eq!(slot_index(b, a), expected);
                expected += 1;
            }
        }
    }

    #[test]
    fn equal_or_out_of_range_pairs_are_errors() {
        let store = ScoreStore::new(&request(&["a", "b", "c"], 1), &Cache::default()).unwrap();
        assert_eq!(store.index_of(2, 0), Ok(1));
        assert_eq!(
            store.index_of(0, 0),
            Err(StoreError::OutOfRangePair { a: 0, b: 0, n: 3 })
        );
        assert_eq!(
            store.index_of(3, 1),
            Err(StoreError::OutOfRangePair { a: 3, b: 1, n: 3 })
        );
        assert!(store.get(1, 1).is_err());
    }

    #[test]
    fn cached_ids_lead_the_store_order() {
        let order = StoreOrder::new(&request(&["a", "b", "c"], 5), &cache(&["b", "a"], 5));
        assert_eq!(order.sts, ids(&["b", "a", "c"]));
        assert_eq!(order.cache_to_store, vec![0, 1]);
        assert!(order.reusable);
    }

    #[test]
    fn a_dropped_cached_id_prevents_reuse() {
        let order = StoreOrder::new(&request(&["a", "b", "c"], 5), &cache(&["b", "d", "a"], 5));
        assert_eq!(order.sts, ids(&["b", "a", "c"]));
        assert_eq!(order.cache_to_store, vec![0, -1, 1]);
        assert!(!order.reusable);
    }

    #[test]
    fn repeated_cached_ids_and_higher_thresholds_prevent_reuse() {
        let repeated = StoreOrder::new(&request(&["a", "b"], 5), &cache(&["a", "b", "a"], 5));
        assert_eq!(repeated.cache_to_store, vec![0, 1, 0]);
        assert!(!repeated.reusable);

        let higher = StoreOrder::new(&request(&["a", "b"], 6), &cache(&["a", "b"], 5));
        assert!(!higher.reusable);

        let empty = StoreOrder::new(&request(&["a", "b"], 6), &Cache::default());
        assert_eq!(empty.sts, ids(&["a", "b"]));
        assert!(!empty.reusable);
    }

    #[test]
    fn a_single_profile_has_no_pairs() {
        let store = ScoreStore::new(&request(&["a"], 3), &Cache::default()).unwrap();
        assert_eq!(store.len(), 0);
        assert!(store.is_empty());
        assert_eq!(
            store.get(0, 0),
            Err(StoreError::OutOfRangePair { a: 0, b: 0, n: 1 })
        );
        assert!(matches!(
            store.get(0, 1),
            Err(StoreError::OutOfRangePair { .. })
        ));
        assert_eq!(store.distances().unwrap(), Vec::<i32>::new());
    }

    #[test]
    fn fresh_slots_are_pending_and_unreachable() {
        let store = ScoreStore::new(&request(&["a", "b", "c"], 3), &Cache::default()).unwrap();
        assert_eq!(store.len(), 3);
        assert_eq!(store.todo(), 3);
        let slot = store.get(0, 2).unwrap();
        assert_eq!(
            slot,
            ScoreSlot {
                st_a: 2,
                st_b: 0,
                value: ALMOST_INF,
                status: ScoreStatus::Pending
            }
        );
        assert_eq!(store.distances(), Err(StoreError::Incomplete { pending: 3 }));

        store.set_pair(2, 0, 4, ScoreStatus::Complete).unwrap();
        assert_eq!(store.get(0, 2).unwrap().value, 4);
        assert_eq!(store.todo(), 2);
        let pending: Vec<ScoreJob> = store.pending().collect();
        assert_eq!(
            pending,
            vec![
                ScoreJob { slot: 0, a: 1, b: 0 },
                ScoreJob { slot: 2, a: 2, b: 1 }
            ]
        );
    }

    #[test]
    fn edges_seed_slots_through_the_cache_map() {
        let mut seeded = cache(&["b", "d", "a"], 5);
        seeded.edges.insert(2, vec![[0, 2]]);
        seeded.edges.insert(4, vec![[1, 2]]);
        let store = ScoreStore::new(&request(&["a", "b", "c"], 5), &seeded).unwrap();

        assert_eq!(store.sts(), ids(&["b", "a", "c"]).as_slice());
        assert!(!store.cache_reusable());
        let ab = store.get(0, 1).unwrap();
        assert_eq!((ab.value, ab.status), (2, ScoreStatus::FromCache));
        assert_eq!(store.get(0, 2).unwrap().status, ScoreStatus::Pending);
        assert_eq!(store.todo(), 2);
        assert_eq!(store.index_offset(0), 1);
        assert_eq!(store.index_offset(1), 0);
        assert_eq!(store.index_offset(2), 2);
    }

    #[test]
    fn unlisted_cached_pairs_are_unreachable_when_the_threshold_allows() {
        let mut seeded = cache(&["a", "b", "c"], 5);
        seeded.edges.insert(1, vec![[0, 1]]);
        let store = ScoreStore::new(&request(&["a", "b", "c", "d"], 4), &seeded).unwrap();
        assert!(store.cache_reusable());
        assert_eq!(store.get(0, 1).unwrap().value, 1);
        let bc = store.get(1, 2).unwrap();
        assert_eq!((bc.value, bc.status), (ALMOST_INF, ScoreStatus::FromCache));
        assert_eq!(store.done(), 3);
        assert_eq!(store.todo(), 3);

        let lower = ScoreStore::new(&request(&["a", "b", "c", "d"], 6), &seeded).unwrap();
        assert!(!lower.cache_reusable());
        assert_eq!(lower.done(), 1);
        assert_eq!(lower.get(1, 2).unwrap().status, ScoreStatus::Pending);
    }

    #[test]
    fn inconsistent_caches_are_rejected() {
        let mut short = cache(&["a", "b"], 5);
        short.lambda.pop();
        assert!(matches!(
            ScoreStore::new(&request(&["a", "b"], 5), &short),
            Err(StoreError::BadCache(_))
        ));

        let mut outside = cache(&["a", "b"], 5);
        outside.edges.insert(1, vec![[0, 2]]);
        assert!(matches!(
            ScoreStore::new(&request(&["a", "b"], 5), &outside),
            Err(StoreError::BadCache(_))
        ));
    }
}
