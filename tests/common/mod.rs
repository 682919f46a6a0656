//! Shared fixtures for integration tests

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use versioned_entities::{Entity, EntitySchema, SchemaCatalog, ValueKind};

/// Leaf record with a single scalar payload
pub fn item_schema() -> Arc<EntitySchema> {
    EntitySchema::new("Item")
        .field("name", ValueKind::Scalar)
        .field("meta", ValueKind::Plain)
        .build()
}

/// Container exercising every entity-valued kind
pub fn folder_schema() -> Arc<EntitySchema> {
    EntitySchema::new("Folder")
        .field("name", ValueKind::Scalar)
        .optional("primary", ValueKind::Entity)
        .field("items", ValueKind::EntitySequence)
        .field("index", ValueKind::EntityMapping)
        .optional("pinned", ValueKind::Reference)
        .build()
}

pub fn catalog() -> SchemaCatalog {
    [item_schema(), folder_schema()].into_iter().collect()
}

pub fn item(name: &str) -> Entity {
    Entity::new(item_schema())
        .with("name", name)
        .expect("item fixture")
}

pub fn folder(name: &str) -> Entity {
    Entity::new(folder_schema())
        .with("name", name)
        .expect("folder fixture")
}

/// Root folder holding the given items in `items`
pub fn folder_with(name: &str, items: Vec<Entity>) -> Entity {
    folder(name).with("items", items).expect("folder fixture")
}

/// root -> [sub -> [leaf], sibling], plus one keyed entry
pub fn nested() -> Entity {
    let sub = folder_with("sub", vec![item("leaf")]);
    let mut index = BTreeMap::new();
    index.insert("k".to_string(), item("keyed"));
    folder_with("root", vec![sub, item("sibling")])
        .with("index", index)
        .expect("nested fixture")
}
