//! Property-based tests for versioning and transport.
//!
//! - Propagation: a change mints exactly the changed node and its owners
//! - Stability: untouched entities keep their ids across revisions
//! - Idempotence: versioning an unchanged tree mints nothing
//! - Structural equality ignores identity
//! - Encode/decode preserves ids and content

mod common;

use common::{catalog, folder_with, item};
use proptest::prelude::*;
use std::collections::HashSet;
use versioned_entities::ids::EntityId;
use versioned_entities::{decode, encode, Entity, Registry};

type Shape = Vec<(String, Vec<String>)>;

// =============================================================================
// HELPER STRATEGIES
// =============================================================================

fn name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z]{1,8}").unwrap()
}

fn shape_strategy() -> impl Strategy<Value = Shape> {
    prop::collection::vec(
        (name_strategy(), prop::collection::vec(name_strategy(), 0..4)),
        1..4,
    )
}

/// root -> one folder per shape entry -> its items
fn build_tree(shape: &Shape) -> Entity {
    let subs = shape
        .iter()
        .map(|(name, items)| folder_with(name, items.iter().map(|n| item(n)).collect()))
        .collect();
    folder_with("root", subs)
}

/// Rename one node of the tree and return the ids on its ownership path
fn touch(root: &mut Entity, sub_pick: usize, leaf_pick: usize) -> Vec<EntityId> {
    let mut path = vec![root.entity_id()];
    let subs = root.items_mut("items").unwrap();
    let sub_index = sub_pick % subs.len();
    let sub = &mut subs[sub_index];
    path.push(sub.entity_id());

    let leaves = sub.items_mut("items").unwrap();
    if leaves.is_empty() {
        let name = format!("{}'", sub.scalar("name").unwrap());
        sub.set("name", name).unwrap();
    } else {
        let n = leaves.len();
        let leaf = &mut leaves[leaf_pick % n];
        path.push(leaf.entity_id());
        let name = format!("{}'", leaf.scalar("name").unwrap());
        leaf.set("name", name).unwrap();
    }
    path
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Exactly the touched node and its owners get new ids
    #[test]
    fn change_mints_ownership_path(
        shape in shape_strategy(),
        sub_pick in 0usize..8,
        leaf_pick in 0usize..8,
    ) {
        let registry = Registry::new();
        let mut root = build_tree(&shape);
        let before = registry.register_entity(&mut root).unwrap();

        let path: HashSet<EntityId> = touch(&mut root, sub_pick, leaf_pick).into_iter().collect();
        let after = registry.version_entity(&mut root).unwrap();

        prop_assert_eq!(after.node_count(), before.node_count());
        let kept: HashSet<EntityId> = before.entity_ids().iter().copied().collect();
        let now: HashSet<EntityId> = after.entity_ids().iter().copied().collect();
        let gone: HashSet<EntityId> = kept.difference(&now).copied().collect();
        prop_assert_eq!(gone, path);
    }

    /// Entities outside the touched path read back identically from both versions
    #[test]
    fn untouched_entities_are_stable(
        shape in shape_strategy(),
        sub_pick in 0usize..8,
        leaf_pick in 0usize..8,
    ) {
        let registry = Registry::new();
        let mut root = build_tree(&shape);
        let before = registry.register_entity(&mut root).unwrap();
        let old_root = before.root_id();

        touch(&mut root, sub_pick, leaf_pick);
        let after = registry.version_entity(&mut root).unwrap();

        for id in after.entity_ids().iter().filter(|id| before.contains(**id)) {
            let old = registry.get_stored_entity(*id, old_root).unwrap();
            let new = registry.get_stored_entity(*id, after.root_id()).unwrap();
            prop_assert_eq!(old.entity_id(), new.entity_id());
            prop_assert_eq!(old.lineage_id(), new.lineage_id());
            prop_assert_eq!(old, new);
        }
    }

    /// Versioning an unchanged tree is a no-op, however often it is repeated
    #[test]
    fn unchanged_versioning_is_idempotent(shape in shape_strategy(), rounds in 1usize..4) {
        let registry = Registry::new();
        let mut root = build_tree(&shape);
        let registered = registry.register_entity(&mut root).unwrap();
        let status = registry.status();

        for _ in 0..rounds {
            let graph = registry.version_entity(&mut root).unwrap();
            prop_assert_eq!(graph.root_id(), registered.root_id());
        }
        prop_assert_eq!(registry.status(), status);
    }

    /// Two independently built trees of one shape are equal but share no ids
    #[test]
    fn structural_equality_ignores_identity(shape in shape_strategy()) {
        let a = build_tree(&shape);
        let b = build_tree(&shape);
        prop_assert_ne!(a.entity_id(), b.entity_id());
        prop_assert_ne!(a.lineage_id(), b.lineage_id());
        prop_assert_eq!(&a, &b);
    }

    /// Decoding an encoded tree restores content and every id
    #[test]
    fn encode_decode_preserves_tree(shape in shape_strategy()) {
        let catalog = catalog();
        let root = build_tree(&shape);
        let decoded = decode(&encode(&root), &catalog).unwrap();

        prop_assert_eq!(&decoded, &root);
        prop_assert_eq!(encode(&decoded), encode(&root));
    }
}
