//! Longest-prefix-set membership tries for IP rule fields.
//!
//! Two independent tries are built on top of a single generic implementation: one keyed by
//! [`u32`] (IPv4, max depth 32) and one keyed by [`u128`] (IPv6, max depth 128). Unlike a
//! classic longest-prefix-*match* trie, [`PrefixTrie::search`] collects every rule whose
//! inserted prefix contains the queried address, not just the most specific one.

use std::net::{Ipv4Addr, Ipv6Addr};

use smallvec::SmallVec;

/// An address type a [`PrefixTrie`] can be keyed by.
pub trait Address: Copy + Eq {
    /// Maximum prefix length (bit width) for this address type.
    const MAX_LEN: u8;

    /// Returns the bit at `pos` (0 = most significant bit).
    fn bit(self, pos: u8) -> bool;
}

impl Address for u32 {
    const MAX_LEN: u8 = 32;

    fn bit(self, pos: u8) -> bool {
        (self >> (31 - pos)) & 1 == 1
    }
}

impl Address for u128 {
    const MAX_LEN: u8 = 128;

    fn bit(self, pos: u8) -> bool {
        (self >> (127 - pos)) & 1 == 1
    }
}

fn mask<A>(len: u8) -> A
where
    A: Address + MaskOps,
{
    A::mask_of(len)
}

/// Helper so `mask` can be generic without exposing bit-width arithmetic on [`Address`]
/// itself. Implemented for every type [`Address`] is implemented for.
pub trait MaskOps {
    fn mask_of(len: u8) -> Self;
}

impl MaskOps for u32 {
    fn mask_of(len: u8) -> Self {
        if len == 0 {
            0
        } else if len >= 32 {
            u32::MAX
        } else {
            u32::MAX << (32 - len)
        }
    }
}

impl MaskOps for u128 {
    fn mask_of(len: u8) -> Self {
        if len == 0 {
            0
        } else if len >= 128 {
            u128::MAX
        } else {
            u128::MAX << (128 - len)
        }
    }
}

fn common_prefix_len<A: Address>(a: A, b: A, max_len: u8) -> u8 {
    for i in 0..max_len {
        if a.bit(i) != b.bit(i) {
            return i;
        }
    }
    max_len
}

fn matches_prefix<A: Address + MaskOps>(addr: A, prefix: A, len: u8) -> bool
where
    A: std::ops::BitAnd<Output = A>,
{
    if len == 0 {
        return true;
    }
    let m = mask::<A>(len);
    (addr & m) == (prefix & m)
}

struct Node<A> {
    prefix: A,
    prefix_len: u8,
    rule_ids: SmallVec<[u32; 4]>,
    left: Option<Box<Node<A>>>,
    right: Option<Box<Node<A>>>,
}

impl<A: Address> Node<A> {
    fn leaf(prefix: A, prefix_len: u8, rule_id: u32) -> Self {
        Node {
            prefix,
            prefix_len,
            rule_ids: smallvec::smallvec![rule_id],
            left: None,
            right: None,
        }
    }
}

/// A radix trie mapping IP prefixes to the set of rule ids that inserted a containing prefix.
pub struct PrefixTrie<A> {
    root: Option<Box<Node<A>>>,
}

impl<A> Default for PrefixTrie<A> {
    fn default() -> Self {
        PrefixTrie { root: None }
    }
}

impl<A> PrefixTrie<A>
where
    A: Address + MaskOps + std::ops::BitAnd<Output = A>,
{
    /// Creates an empty trie.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `rule_id` under `prefix/prefix_len`, splitting nodes on divergence as needed.
    pub fn insert(&mut self, prefix: A, prefix_len: u8, rule_id: u32) {
        let prefix_len = prefix_len.min(A::MAX_LEN);
        match self.root.take() {
            None => {
                self.root = Some(Box::new(Node::leaf(prefix, prefix_len, rule_id)));
            }
            Some(root) => {
                self.root = Some(Self::insert_at(root, prefix, prefix_len, rule_id));
            }
        }
    }

    fn insert_at(mut node: Box<Node<A>>, prefix: A, prefix_len: u8, rule_id: u32) -> Box<Node<A>> {
        let common = common_prefix_len(node.prefix, prefix, node.prefix_len.min(prefix_len));

        if common < node.prefix_len {
            // The existing node's prefix diverges from the new one partway through; split it
            // into a shorter parent with the old node hanging off whichever side its surviving
            // bit selects.
            let bit_after_common = node.prefix.bit(common);
            let mut parent = Box::new(Node {
                prefix: node.prefix,
                prefix_len: common,
                rule_ids: SmallVec::new(),
                left: None,
                right: None,
            });
            if bit_after_common {
                parent.right = Some(node);
            } else {
                parent.left = Some(node);
            }
            node = parent;
        }

        if prefix_len == common {
            node.rule_ids.push(rule_id);
            return node;
        }

        let bit = prefix.bit(common);
        if bit {
            node.right = Some(match node.right.take() {
                Some(child) => Self::insert_at(child, prefix, prefix_len, rule_id),
                None => Box::new(Node::leaf(prefix, prefix_len, rule_id)),
            });
        } else {
            node.left = Some(match node.left.take() {
                Some(child) => Self::insert_at(child, prefix, prefix_len, rule_id),
                None => Box::new(Node::leaf(prefix, prefix_len, rule_id)),
            });
        }
        node
    }

    /// Collects every rule id whose inserted prefix contains `addr`. Order is unspecified.
    pub fn search(&self, addr: A) -> Vec<u32> {
        let mut result = Vec::new();
        let mut current = self.root.as_deref();
        while let Some(node) = current {
            if matches_prefix(addr, node.prefix, node.prefix_len) {
                result.extend_from_slice(&node.rule_ids);
            }
            if node.prefix_len >= A::MAX_LEN {
                break;
            }
            let bit = addr.bit(node.prefix_len);
            current = if bit {
                node.right.as_deref()
            } else {
                node.left.as_deref()
            };
        }
        result
    }
}

/// A trie over IPv4 addresses (max prefix length 32).
pub type PrefixTrieV4 = PrefixTrie<u32>;

/// A trie over IPv6 addresses (max prefix length 128).
pub type PrefixTrieV6 = PrefixTrie<u128>;

/// Converts an [`Ipv4Addr`] to the `u32` key a [`PrefixTrieV4`] expects.
pub fn ipv4_key(addr: Ipv4Addr) -> u32 {
    u32::from(addr)
}

/// Converts an [`Ipv6Addr`] to the `u128` key a [`PrefixTrieV6`] expects.
pub fn ipv6_key(addr: Ipv6Addr) -> u128 {
    u128::from(addr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_prefix_matches_every_v4_address() {
        let mut trie = PrefixTrieV4::new();
        trie.insert(0, 0, 7);
        assert_eq!(trie.search(ipv4_key(Ipv4Addr::new(1, 2, 3, 4))), vec![7]);
        assert_eq!(
            trie.search(ipv4_key(Ipv4Addr::new(255, 255, 255, 255))),
            vec![7]
        );
    }

    #[test]
    fn empty_prefix_matches_every_v6_address() {
        let mut trie = PrefixTrieV6::new();
        trie.insert(0, 0, 3);
        assert_eq!(trie.search(ipv6_key(Ipv6Addr::UNSPECIFIED)), vec![3]);
        assert_eq!(trie.search(ipv6_key(Ipv6Addr::LOCALHOST)), vec![3]);
    }

    #[test]
    fn longest_prefix_collection_returns_all_containing_rules() {
        let mut trie = PrefixTrieV4::new();
        trie.insert(ipv4_key(Ipv4Addr::new(10, 0, 0, 0)), 8, 1);
        trie.insert(ipv4_key(Ipv4Addr::new(10, 1, 0, 0)), 16, 2);
        trie.insert(ipv4_key(Ipv4Addr::new(10, 1, 2, 0)), 24, 3);

        let mut hits = trie.search(ipv4_key(Ipv4Addr::new(10, 1, 2, 200)));
        hits.sort_unstable();
        assert_eq!(hits, vec![1, 2, 3]);

        let mut hits = trie.search(ipv4_key(Ipv4Addr::new(10, 2, 0, 0)));
        hits.sort_unstable();
        assert_eq!(hits, vec![1]);
    }

    #[test]
    fn disjoint_prefixes_do_not_cross_contaminate() {
        let mut trie = PrefixTrieV4::new();
        trie.insert(ipv4_key(Ipv4Addr::new(10, 0, 0, 0)), 8, 1);
        trie.insert(ipv4_key(Ipv4Addr::new(192, 168, 0, 0)), 16, 2);

        assert_eq!(trie.search(ipv4_key(Ipv4Addr::new(10, 5, 5, 5))), vec![1]);
        assert_eq!(
            trie.search(ipv4_key(Ipv4Addr::new(192, 168, 1, 1))),
            vec![2]
        );
        assert!(trie
            .search(ipv4_key(Ipv4Addr::new(172, 16, 0, 1)))
            .is_empty());
    }

    #[test]
    fn host_prefix_splits_existing_node() {
        let mut trie = PrefixTrieV4::new();
        trie.insert(ipv4_key(Ipv4Addr::new(10, 0, 0, 0)), 8, 1);
        trie.insert(ipv4_key(Ipv4Addr::new(10, 0, 0, 1)), 32, 2);

        let mut hits = trie.search(ipv4_key(Ipv4Addr::new(10, 0, 0, 1)));
        hits.sort_unstable();
        assert_eq!(hits, vec![1, 2]);
        assert_eq!(
            trie.search(ipv4_key(Ipv4Addr::new(10, 0, 0, 2))),
            vec![1]
        );
    }

    proptest::proptest! {
        #[test]
        fn search_always_contains_rule_whose_prefix_contains_address(
            prefix in 0u32..=u32::MAX,
            prefix_len in 0u8..=32,
            addr in 0u32..=u32::MAX,
        ) {
            let mut trie = PrefixTrieV4::new();
            trie.insert(prefix, prefix_len, 42);
            if matches_prefix(addr, prefix, prefix_len) {
                proptest::prop_assert!(trie.search(addr).contains(&42));
            } else {
                proptest::prop_assert!(!trie.search(addr).contains(&42));
            }
        }
    }
}
