use crate::types::AlleleValue;
use ahash::AHashMap;
use std::sync::{Mutex, PoisonError};

/// A dense integer issued by a [`Tokeniser`], in first-seen order from 0.
pub type Token = u64;

/// A (gene, allele) pair. With `allele == AlleleValue::Null` the key stands for
/// "gene present, any allele" and is used in the gene-presence token space.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AlleleKey {
    pub gene: String,
    pub allele: AlleleValue,
}

impl AlleleKey {
    pub fn new(gene: impl Into<String>, allele: impl Into<AlleleValue>) -> Self {
        Self {
            gene: gene.into(),
            allele: allele.into(),
        }
    }

    /// The gene-presence key for `gene`.
    pub fn gene(gene: impl Into<String>) -> Self {
        Self {
            gene: gene.into(),
            allele: AlleleValue::Null,
        }
    }
}

#[derive(Debug, Default)]
struct TokenTable {
    lookup: AHashMap<AlleleKey, Token>,
    next: Token,
}

/// Interns arbitrary keys into dense tokens. Safe to share between threads; the
/// lookup and the counter sit behind one coarse lock.
#[derive(Debug, Default)]
pub struct Tokeniser {
    table: Mutex<TokenTable>,
}

impl Tokeniser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the token for `key`, minting the next one if the key is unseen.
    pub fn get(&self, key: &AlleleKey) -> Token {
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(&token) = table.lookup.get(key) {
            return token;
        }
        let token = table.next;
        table.next += 1;
        table.lookup.insert(key.clone(), token);
        token
    }

    /// The highest token issued so far, or `None` before the first key.
    pub fn last_token(&self) -> Option<Token> {
        let table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        table.next.checked_sub(1)
    }

    pub fn len(&self) -> usize {
        self.table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .lookup
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn tokens_are_issued_in_first_seen_order_and_respect_allele_types() {
        let tokens = Tokeniser::new();
        assert_eq!(tokens.last_token(), None);
        assert_eq!(tokens.get(&AlleleKey::new("foo", 1)), 0);
        assert_eq!(tokens.get(&AlleleKey::new("foo", 1)), 0);
        assert_eq!(tokens.get(&AlleleKey::new("bar", 1)), 1);
        assert_eq!(tokens.get(&AlleleKey::new("foo", 1)), 0);
        assert_eq!(tokens.get(&AlleleKey::new("foo", "1")), 2);
        assert_eq!(tokens.last_token(), Some(2));
        assert_eq!(tokens.len(), 3);
    }

    #[test]
    fn gene_keys_are_separate_from_allele_keys() {
        let tokens = Tokeniser::new();
        let with_allele = tokens.get(&AlleleKey::new("gene1", 1));
        let presence = tokens.get(&AlleleKey::gene("gene1"));
        assert_ne!(with_allele, presence);
        assert_eq!(tokens.get(&AlleleKey::gene("gene1")), presence);
    }

    #[test]
    fn concurrent_callers_receive_one_token_per_key() {
        let tokens = Arc::new(Tokeniser::new());
        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let tokens = Arc::clone(&tokens);
                thread::spawn(move || {
                    (0..500)
                        .map(|i| {
                            let gene = format!("gene{}", (i + worker * 37) % 500);
                            (gene.clone(), tokens.get(&AlleleKey::new(gene, 1)))
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen: AHashMap<String, Token> = AHashMap::new();
        for handle in handles {
            for (gene, token) in handle.join().unwrap() {
                let previous = *seen.entry(gene).or_insert(token);
                assert_eq!(previous, token);
            }
        }
        assert_eq!(tokens.len(), 500);
        assert_eq!(tokens.last_token(), Some(499));
        let mut issued: Vec<Token> = seen.values().copied().collect();
        issued.sort_unstable();
        assert_eq!(issued, (0..500).collect::<Vec<_>>());
    }
}
