//! Property-based tests for the block allocation table
//!
//! Random interleavings of allocate and free must never double-allocate a
//! block or lose track of the free count.

use capsulefs::{Fat, CHAIN_END};
use proptest::prelude::*;
use std::collections::HashSet;

#[derive(Debug, Clone)]
enum Op {
    Allocate(u64),
    FreeOldest,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1u64..24).prop_map(Op::Allocate),
        Just(Op::FreeOldest),
    ]
}

proptest! {
    #[test]
    fn prop_no_double_allocation(ops in prop::collection::vec(op_strategy(), 1..60)) {
        let total = 256u64;
        let mut fat = Fat::new(total);
        let mut live: Vec<Vec<u32>> = Vec::new();

        for op in ops {
            match op {
                Op::Allocate(n) => {
                    match fat.allocate(n) {
                        Ok(blocks) => {
                            prop_assert_eq!(blocks.len() as u64, n);
                            live.push(blocks);
                        }
                        Err(_) => {
                            // Refused allocations must leave the free count alone.
                            let held: u64 = live.iter().map(|c| c.len() as u64).sum();
                            prop_assert_eq!(fat.free_blocks(), total - held);
                        }
                    }
                }
                Op::FreeOldest => {
                    if !live.is_empty() {
                        let chain = live.remove(0);
                        let freed = fat.free(chain[0] as i64).unwrap();
                        prop_assert_eq!(freed, chain.len() as u64);
                    }
                }
            }

            // No block may appear in two live chains.
            let mut seen = HashSet::new();
            for chain in &live {
                for &block in chain {
                    prop_assert!(seen.insert(block), "block {} in two chains", block);
                    prop_assert!(block >= 1 && block as u64 <= total);
                }
            }

            // The free count always accounts for exactly the live chains.
            let held: u64 = live.iter().map(|c| c.len() as u64).sum();
            prop_assert_eq!(fat.free_blocks(), total - held);
        }
    }

    #[test]
    fn prop_chain_walk_matches_allocation(n in 1u64..100) {
        let mut fat = Fat::new(128);
        let blocks = fat.allocate(n).unwrap();
        let walked = fat.chain(blocks[0] as i64).unwrap();
        prop_assert_eq!(walked, blocks);
    }

    #[test]
    fn prop_serialization_preserves_chains(sizes in prop::collection::vec(1u64..16, 1..10)) {
        let total = 200u64;
        let mut fat = Fat::new(total);
        let mut chains = Vec::new();
        for n in sizes {
            if let Ok(blocks) = fat.allocate(n) {
                chains.push(blocks);
            }
        }

        let decoded = Fat::from_bytes(&fat.to_bytes(), total).unwrap();
        prop_assert_eq!(decoded.free_blocks(), fat.free_blocks());
        for chain in &chains {
            prop_assert_eq!(&decoded.chain(chain[0] as i64).unwrap(), chain);
        }
    }

    #[test]
    fn prop_free_everything_restores_empty_table(sizes in prop::collection::vec(1u64..20, 1..12)) {
        let total = 300u64;
        let mut fat = Fat::new(total);
        let mut starts = Vec::new();
        for n in sizes {
            let blocks = fat.allocate(n).unwrap();
            starts.push(blocks[0] as i64);
        }
        for start in starts {
            fat.free(start).unwrap();
        }
        prop_assert_eq!(fat.free_blocks(), total);
        // A fully freed table has no chain to walk.
        prop_assert_eq!(fat.free(CHAIN_END).unwrap(), 0);
    }
}
