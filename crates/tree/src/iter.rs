//! Unversioned iteration over the working tree: a k-way merge of persisted
//! fast-path entries with the unsaved `additions`/`removals` deltas
//! (spec.md §4.5, §9 "implement as a k-way merge of three ordered
//! cursors"). Ascending key order only; a caller wanting descending order
//! can collect and reverse.

use merkle_kv_store::FastNode;
use merkle_kv_types::StoreError;
use std::cmp::Ordering;
use std::collections::btree_map;
use std::collections::BTreeSet;
use std::iter::Peekable;

/// Merges a persisted fast-path stream with unsaved additions/removals. A
/// removed key suppresses its persisted entry; an added key shadows it.
pub struct FastPathMerge<'a, P>
where
    P: Iterator<Item = Result<FastNode, StoreError>>,
{
    persisted: Peekable<P>,
    additions: Peekable<btree_map::Iter<'a, Vec<u8>, FastNode>>,
    removals: &'a BTreeSet<Vec<u8>>,
}

impl<'a, P> FastPathMerge<'a, P>
where
    P: Iterator<Item = Result<FastNode, StoreError>>,
{
    pub fn new(
        persisted: P,
        additions: &'a std::collections::BTreeMap<Vec<u8>, FastNode>,
        removals: &'a BTreeSet<Vec<u8>>,
    ) -> Self {
        Self {
            persisted: persisted.peekable(),
            additions: additions.iter().peekable(),
            removals,
        }
    }
}

impl<'a, P> Iterator for FastPathMerge<'a, P>
where
    P: Iterator<Item = Result<FastNode, StoreError>>,
{
    type Item = Result<(Vec<u8>, Vec<u8>), StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if matches!(self.persisted.peek(), Some(Err(_))) {
                return match self.persisted.next() {
                    Some(Err(e)) => Some(Err(e)),
                    _ => continue,
                };
            }
            let persisted_key = match self.persisted.peek() {
                Some(Ok(node)) => Some(node.key.clone()),
                _ => None,
            };
            let addition_key = self.additions.peek().map(|(k, _)| (*k).clone());

            match (persisted_key, addition_key) {
                (None, None) => return None,
                (Some(pk), None) => {
                    let node = match self.persisted.next() {
                        Some(Ok(n)) => n,
                        _ => continue,
                    };
                    if self.removals.contains(&pk) {
                        continue;
                    }
                    return Some(Ok((node.key, node.value)));
                }
                (None, Some(_)) => {
                    let (_, fast_node) = match self.additions.next() {
                        Some(pair) => pair,
                        None => continue,
                    };
                    return Some(Ok((fast_node.key.clone(), fast_node.value.clone())));
                }
                (Some(pk), Some(ak)) => match pk.cmp(&ak) {
                    Ordering::Less => {
                        let node = match self.persisted.next() {
                            Some(Ok(n)) => n,
                            _ => continue,
                        };
                        if self.removals.contains(&pk) {
                            continue;
                        }
                        return Some(Ok((node.key, node.value)));
                    }
                    Ordering::Equal => {
                        // The in-memory addition shadows the persisted entry.
                        let _ = self.persisted.next();
                        let (_, fast_node) = match self.additions.next() {
                            Some(pair) => pair,
                            None => continue,
                        };
                        return Some(Ok((fast_node.key.clone(), fast_node.value.clone())));
                    }
                    Ordering::Greater => {
                        let (_, fast_node) = match self.additions.next() {
                            Some(pair) => pair,
                            None => continue,
                        };
                        return Some(Ok((fast_node.key.clone(), fast_node.value.clone())));
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn fast(key: &str, value: &str) -> FastNode {
        FastNode::new(key.as_bytes().to_vec(), value.as_bytes().to_vec(), 1)
    }

    #[test]
    fn addition_shadows_persisted_and_removal_suppresses() {
        let persisted = vec![
            Ok(fast("a", "1")),
            Ok(fast("b", "2")),
            Ok(fast("c", "3")),
        ];
        let mut additions = BTreeMap::new();
        additions.insert(b"b".to_vec(), fast("b", "20"));
        let mut removals = BTreeSet::new();
        removals.insert(b"c".to_vec());

        let merged: Vec<_> = FastPathMerge::new(persisted.into_iter(), &additions, &removals)
            .collect::<Result<_, _>>()
            .unwrap();

        assert_eq!(
            merged,
            vec![
                (b"a".to_vec(), b"1".to_vec()),
                (b"b".to_vec(), b"20".to_vec()),
            ]
        );
    }

    #[test]
    fn pure_addition_with_no_persisted_entries() {
        let persisted: Vec<Result<FastNode, StoreError>> = Vec::new();
        let mut additions = BTreeMap::new();
        additions.insert(b"z".to_vec(), fast("z", "9"));
        let removals = BTreeSet::new();

        let merged: Vec<_> = FastPathMerge::new(persisted.into_iter(), &additions, &removals)
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(merged, vec![(b"z".to_vec(), b"9".to_vec())]);
    }
}
