// ========================================================================================
//
//                       The indexer: profiles into token bit-sets
//
// ========================================================================================
//
// Each declared profile gets exactly one slot. Indexing a profile mints a gene-presence
// token and a (gene, allele) token for every called locus and sets those bits. Once every
// slot is filled the indexer is frozen into an immutable `IndexTable`, which is what the
// scoring workers read from.

use crate::bits::{BitArray, BitSet};
use crate::tokens::{AlleleKey, Tokeniser};
use crate::types::{Profile, ProfileId, position_lookup};
use ahash::AHashMap;
use log::{debug, info};
use rayon::prelude::*;
use std::fmt;
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

/// The default allocation floor, in bits, for a fresh allele bit-set.
pub const DEFAULT_CAPACITY_HINT: u64 = 2500;

/// How many missing ids to name in an `Incomplete` error message.
const MISSING_IDS_REPORTED: usize = 10;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("profile '{st}' was not declared in the request")]
    UnknownProfile { st: ProfileId },
    #[error("{} declared profiles were never indexed (first: {})", .missing.len(), format_ids(.missing))]
    Incomplete { missing: Vec<ProfileId> },
}

fn format_ids(ids: &[ProfileId]) -> String {
    ids.iter()
        .take(MISSING_IDS_REPORTED)
        .map(ProfileId::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

/// The per-profile bit-sets while they are still being built.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Index {
    pub genes: BitArray,
    pub alleles: BitArray,
    pub ready: bool,
}

/// What `Indexer::index` did with a profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexOutcome {
    /// True if the slot was already populated; the call was then a no-op.
    pub duplicate: bool,
    /// The slot the profile belongs to.
    pub offset: usize,
}

#[derive(Debug)]
struct IndexSlots {
    indices: Vec<Index>,
    scheme_size: Option<u32>,
}

/// Builds one [`Index`] per declared profile id.
///
/// `index` may be called from many threads at once. Token minting is serialised by
/// the tokenisers; slot writes and the scheme-size minimum are serialised here.
#[derive(Debug)]
pub struct Indexer {
    gene_tokens: Tokeniser,
    allele_tokens: Tokeniser,
    ids: Vec<ProfileId>,
    lookup: AHashMap<ProfileId, usize>,
    slots: Mutex<IndexSlots>,
    capacity_hint: u64,
}

impl Indexer {
    /// Declares the profiles to expect. Repeated ids share one slot.
    pub fn new(ids: &[ProfileId]) -> Self {
        Self::with_capacity_hint(ids, DEFAULT_CAPACITY_HINT)
    }

    pub fn with_capacity_hint(ids: &[ProfileId], capacity_hint: u64) -> Self {
        let (ids, lookup) = position_lookup(ids);
        let indices = vec![Index::default(); ids.len()];
        Self {
            gene_tokens: Tokeniser::new(),
            allele_tokens: Tokeniser::new(),
            ids,
            lookup,
            slots: Mutex::new(IndexSlots {
                indices,
                scheme_size: None,
            }),
            capacity_hint,
        }
    }

    pub fn ids(&self) -> &[ProfileId] {
        &self.ids
    }

    pub fn offset_of(&self, st: &ProfileId) -> Option<usize> {
        self.lookup.get(st).copied()
    }

    pub fn gene_tokens(&self) -> &Tokeniser {
        &self.gene_tokens
    }

    pub fn allele_tokens(&self) -> &Tokeniser {
        &self.allele_tokens
    }

    /// The smallest scheme size declared by any indexed profile.
    pub fn scheme_size(&self) -> Option<u32> {
        self.lock_slots().scheme_size
    }

    /// A copy of the slot for `st`, if it was declared.
    pub fn snapshot(&self, st: &ProfileId) -> Option<Index> {
        let offset = self.offset_of(st)?;
        Some(self.lock_slots().indices[offset].clone())
    }

    fn lock_slots(&self) -> std::sync::MutexGuard<'_, IndexSlots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fills the slot for `profile.st`. Uncalled loci (null or empty alleles) are skipped.
    pub fn index(&self, profile: &Profile) -> Result<IndexOutcome, IndexError> {
        let offset = self
            .offset_of(&profile.st)
            .ok_or_else(|| IndexError::UnknownProfile {
                st: profile.st.clone(),
            })?;

        if self.lock_slots().indices[offset].ready {
            return Ok(IndexOutcome {
                duplicate: true,
                offset,
            });
        }

        let allele_capacity = self
            .allele_tokens
            .last_token()
            .unwrap_or(0)
            .max(self.capacity_hint);
        let gene_capacity = self
            .gene_tokens
            .last_token()
            .unwrap_or(0)
            .max(self.capacity_hint);
        let mut genes = BitArray::new(gene_capacity);
        let mut alleles = BitArray::new(allele_capacity);

        for (gene, allele) in &profile.matches {
            if !allele.is_call() {
                continue;
            }
            alleles.set_bit(self.allele_tokens.get(&AlleleKey::new(gene.as_str(), allele.clone())));
            genes.set_bit(self.gene_tokens.get(&AlleleKey::gene(gene.as_str())));
        }

        let mut slots = self.lock_slots();
        let slot = &mut slots.indices[offset];
        if slot.ready {
            // Another thread indexed the same id while we were building.
            return Ok(IndexOutcome {
                duplicate: true,
                offset,
            });
        }
        *slot = Index {
            genes,
            alleles,
            ready: true,
        };
        slots.scheme_size = Some(match slots.scheme_size {
            Some(current) => current.min(profile.scheme_size),
            None => profile.scheme_size,
        });
        Ok(IndexOutcome {
            duplicate: false,
            offset,
        })
    }

    /// Succeeds iff every declared id has been indexed.
    pub fn complete(&self) -> Result<(), IndexError> {
        let slots = self.lock_slots();
        let missing: Vec<ProfileId> = slots
            .indices
            .iter()
            .zip(&self.ids)
            .filter(|(index, _)| !index.ready)
            .map(|(_, st)| st.clone())
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(IndexError::Incomplete { missing })
        }
    }

    /// Checks completeness and converts every slot into its scoring representation.
    ///
    /// Each token space is frozen to sparse form when the mean fraction of non-zero
    /// blocks, measured against the whole token universe, is below `sparse_density`.
    pub fn freeze(self, sparse_density: f64) -> Result<IndexTable, IndexError> {
        self.complete()?;
        let gene_universe = universe_blocks(&self.gene_tokens);
        let allele_universe = universe_blocks(&self.allele_tokens);
        let slots = self.slots.into_inner().unwrap_or_else(PoisonError::into_inner);

        let gene_repr = Representation::choose(
            slots.indices.iter().map(|index| &index.genes),
            gene_universe,
            sparse_density,
        );
        let allele_repr = Representation::choose(
            slots.indices.iter().map(|index| &index.alleles),
            allele_universe,
            sparse_density,
        );
        info!(
            "Freezing {} profiles: genes are {gene_repr} ({} tokens), alleles are {allele_repr} ({} tokens)",
            slots.indices.len(),
            self.gene_tokens.len(),
            self.allele_tokens.len()
        );

        let profiles: Vec<ProfileBits> = slots
            .indices
            .into_par_iter()
            .map(|index| ProfileBits {
                genes: gene_repr.convert(index.genes),
                alleles: allele_repr.convert(index.alleles),
            })
            .collect();

        Ok(IndexTable {
            ids: self.ids,
            lookup: self.lookup,
            profiles,
            scheme_size: slots.scheme_size,
            gene_repr,
            allele_repr,
        })
    }
}

fn universe_blocks(tokens: &Tokeniser) -> usize {
    tokens.last_token().map_or(1, |last| (last / 64) as usize + 1)
}

/// The representation chosen for one token space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Representation {
    Dense,
    Sparse,
}

impl Representation {
    fn choose<'a>(
        bit_sets: impl ExactSizeIterator<Item = &'a BitArray>,
        universe_blocks: usize,
        sparse_density: f64,
    ) -> Self {
        let n_sets = bit_sets.len();
        if n_sets == 0 {
            return Self::Dense;
        }
        let non_zero: usize = bit_sets.map(BitArray::non_zero_blocks).sum();
        let density = non_zero as f64 / (n_sets as f64 * universe_blocks.max(1) as f64);
        debug!("Mean block density {density:.4} over {universe_blocks} blocks");
        if density < sparse_density {
            Self::Sparse
        } else {
            Self::Dense
        }
    }

    fn convert(self, bits: BitArray) -> BitSet {
        match self {
            Self::Dense => BitSet::Dense(bits),
            Self::Sparse => BitSet::Sparse(bits.freeze()),
        }
    }
}

impl fmt::Display for Representation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dense => f.write_str("dense"),
            Self::Sparse => f.write_str("sparse"),
        }
    }
}

/// The scoring view of one profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileBits {
    pub genes: BitSet,
    pub alleles: BitSet,
}

/// The immutable, fully-populated index shared read-only by the scoring workers.
#[derive(Debug)]
pub struct IndexTable {
    ids: Vec<ProfileId>,
    lookup: AHashMap<ProfileId, usize>,
    profiles: Vec<ProfileBits>,
    scheme_size: Option<u32>,
    gene_repr: Representation,
    allele_repr: Representation,
}

impl IndexTable {
    pub fn ids(&self) -> &[ProfileId] {
        &self.ids
    }

    pub fn offset_of(&self, st: &ProfileId) -> Option<usize> {
        self.lookup.get(st).copied()
    }

    #[inline]
    pub fn profiles(&self) -> &[ProfileBits] {
        &self.profiles
    }

    pub fn scheme_size(&self) -> Option<u32> {
        self.scheme_size
    }

    pub fn representations(&self) -> (Representation, Representation) {
        (self.gene_repr, self.allele_repr)
    }
}
