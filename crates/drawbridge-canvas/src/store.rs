//! Authoritative element store.
//!
//! A plain id → element map with per-element monotonic versions. The store
//! does no locking of its own: the owner serialises access, so every call
//! runs to completion before another caller can observe the map.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::debug;

use drawbridge_core::element::{Element, ElementPatch, Provenance};
use drawbridge_core::error::Result;

/// Result of an upsert: the stored element and whether the id was new.
#[derive(Debug, Clone)]
pub struct Upserted {
    pub element: Element,
    pub created: bool,
}

#[derive(Debug, Default)]
pub struct ElementStore {
    elements: HashMap<String, Element>,
}

impl ElementStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<&Element> {
        self.elements.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.elements.contains_key(id)
    }

    /// All elements, in no particular order.
    pub fn list(&self) -> Vec<Element> {
        self.elements.values().cloned().collect()
    }

    /// All elements ordered by creation time, then id.
    pub fn sorted(&self) -> Vec<Element> {
        let mut elements = self.list();
        elements.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        elements
    }

    pub fn iter(&self) -> impl Iterator<Item = &Element> {
        self.elements.values()
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Create `id` from `patch`, or merge `patch` over the existing record.
    ///
    /// Creating with an id that already exists is an intentional upsert, not
    /// a conflict: the existing element is updated and its version bumped.
    pub fn upsert(&mut self, id: &str, patch: ElementPatch, source: Provenance) -> Result<Upserted> {
        self.upsert_at(id, patch, source, Utc::now())
    }

    pub fn upsert_at(
        &mut self,
        id: &str,
        patch: ElementPatch,
        source: Provenance,
        now: DateTime<Utc>,
    ) -> Result<Upserted> {
        if let Some(existing) = self.elements.get_mut(id) {
            existing.apply(patch, now);
            debug!(element_id = %id, version = existing.version, "Element updated");
            return Ok(Upserted {
                element: existing.clone(),
                created: false,
            });
        }

        let element = Element::from_patch(id.to_string(), patch, source, now)?;
        debug!(element_id = %id, kind = %element.kind, "Element created");
        self.elements.insert(id.to_string(), element.clone());
        Ok(Upserted {
            element,
            created: true,
        })
    }

    /// Add a fully built element under its own id, replacing any previous one.
    pub fn insert(&mut self, element: Element) {
        debug!(element_id = %element.id, kind = %element.kind, "Element inserted");
        self.elements.insert(element.id.clone(), element);
    }

    /// Remove `id`. Returns whether anything was removed.
    pub fn delete(&mut self, id: &str) -> bool {
        let removed = self.elements.remove(id).is_some();
        if removed {
            debug!(element_id = %id, "Element deleted");
        }
        removed
    }

    /// Swap the whole map for `elements`, discarding prior version history:
    /// every incoming element starts again at version 1. A later duplicate id
    /// replaces an earlier one. Returns the new element count.
    pub fn replace_all(&mut self, elements: Vec<Element>) -> usize {
        let mut next = HashMap::with_capacity(elements.len());
        for mut element in elements {
            element.version = 1;
            next.insert(element.id.clone(), element);
        }
        self.elements = next;
        debug!(count = self.elements.len(), "Store replaced");
        self.elements.len()
    }

    /// Remove everything. Returns how many elements were removed.
    pub fn clear(&mut self) -> usize {
        let count = self.elements.len();
        self.elements.clear();
        debug!(count, "Store cleared");
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drawbridge_core::element::ElementKind;

    fn rect(x: f64, y: f64) -> ElementPatch {
        ElementPatch {
            kind: Some(ElementKind::Rectangle),
            x: Some(x),
            y: Some(y),
            ..Default::default()
        }
    }

    #[test]
    fn test_create_starts_at_version_one() {
        let mut store = ElementStore::new();
        let out = store.upsert("r1", rect(0.0, 0.0), Provenance::Agent).unwrap();
        assert!(out.created);
        assert_eq!(out.element.version, 1);
        assert_eq!(out.element.created_at, out.element.updated_at);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_update_bumps_version_and_keeps_fields() {
        let mut store = ElementStore::new();
        let t0 = Utc::now();
        let mut patch = rect(0.0, 0.0);
        patch.background_color = Some("#ffec99".into());
        store.upsert_at("r1", patch, Provenance::Agent, t0).unwrap();

        let t1 = t0 + chrono::Duration::milliseconds(10);
        let out = store
            .upsert_at(
                "r1",
                ElementPatch {
                    width: Some(300.0),
                    ..Default::default()
                },
                Provenance::Agent,
                t1,
            )
            .unwrap();

        assert!(!out.created);
        assert_eq!(out.element.version, 2);
        assert_eq!(out.element.created_at, t0);
        assert_eq!(out.element.updated_at, t1);
        assert_eq!(out.element.width, Some(300.0));
        assert_eq!(out.element.background_color.as_deref(), Some("#ffec99"));
    }

    #[test]
    fn test_versions_strictly_increase() {
        let mut store = ElementStore::new();
        store.upsert("a", rect(0.0, 0.0), Provenance::Agent).unwrap();
        let mut last = 1;
        for i in 0..5 {
            let out = store
                .upsert(
                    "a",
                    ElementPatch {
                        x: Some(i as f64),
                        ..Default::default()
                    },
                    Provenance::Agent,
                )
                .unwrap();
            assert_eq!(out.element.version, last + 1);
            last = out.element.version;
        }
    }

    #[test]
    fn test_create_on_existing_id_upserts() {
        let mut store = ElementStore::new();
        store.upsert("dup", rect(0.0, 0.0), Provenance::Agent).unwrap();
        let out = store.upsert("dup", rect(5.0, 5.0), Provenance::Agent).unwrap();
        assert!(!out.created);
        assert_eq!(out.element.version, 2);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_upsert_absent_id_requires_complete_patch() {
        let mut store = ElementStore::new();
        let result = store.upsert(
            "ghost",
            ElementPatch {
                x: Some(1.0),
                ..Default::default()
            },
            Provenance::Agent,
        );
        assert!(result.is_err());
        assert!(store.is_empty());
    }

    #[test]
    fn test_insert_keeps_element_as_built() {
        let mut store = ElementStore::new();
        store.upsert("a", rect(0.0, 0.0), Provenance::Agent).unwrap();
        let built = Element::from_patch("b".into(), rect(5.0, 5.0), Provenance::Import, Utc::now())
            .unwrap();
        store.insert(built);
        assert_eq!(store.len(), 2);
        let b = store.get("b").unwrap();
        assert_eq!(b.version, 1);
        assert_eq!(b.source, Some(Provenance::Import));
    }

    #[test]
    fn test_delete_twice() {
        let mut store = ElementStore::new();
        store.upsert("r1", rect(0.0, 0.0), Provenance::Agent).unwrap();
        assert!(store.delete("r1"));
        assert!(store.get("r1").is_none());
        assert!(!store.delete("r1"));
    }

    #[test]
    fn test_replace_all_resets_versions() {
        let mut store = ElementStore::new();
        store.upsert("old", rect(0.0, 0.0), Provenance::Agent).unwrap();

        let now = Utc::now();
        let mut a = Element::from_patch("a".into(), rect(1.0, 1.0), Provenance::Sync, now).unwrap();
        a.version = 17;
        let b = Element::from_patch("b".into(), rect(2.0, 2.0), Provenance::Sync, now).unwrap();

        assert_eq!(store.replace_all(vec![a, b]), 2);
        assert!(store.get("old").is_none());
        assert_eq!(store.get("a").unwrap().version, 1);
        assert_eq!(store.get("b").unwrap().version, 1);
    }

    #[test]
    fn test_clear() {
        let mut store = ElementStore::new();
        store.upsert("a", rect(0.0, 0.0), Provenance::Agent).unwrap();
        store.upsert("b", rect(0.0, 0.0), Provenance::Agent).unwrap();
        assert_eq!(store.clear(), 2);
        assert_eq!(store.len(), 0);
        assert!(store.list().is_empty());
        assert_eq!(store.clear(), 0);
    }

    #[test]
    fn test_sorted_is_stable() {
        let mut store = ElementStore::new();
        let now = Utc::now();
        store.upsert_at("b", rect(0.0, 0.0), Provenance::Agent, now).unwrap();
        store.upsert_at("a", rect(0.0, 0.0), Provenance::Agent, now).unwrap();
        store
            .upsert_at("c", rect(0.0, 0.0), Provenance::Agent, now - chrono::Duration::seconds(1))
            .unwrap();
        let ids: Vec<_> = store.sorted().into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }
}
