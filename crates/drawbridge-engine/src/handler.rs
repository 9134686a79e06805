//! Canvas sync protocol.
//!
//! Every mutation validates its input, applies it to the store, and publishes
//! the matching event while still holding the store's write lock. Viewers
//! therefore see events in exactly the order the store applied them.

use std::collections::HashMap;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::info;

use drawbridge_canvas::{
    export::export_scene, render_scene, render_svg, ElementQuery, ElementStore, ExportOptions,
    SceneDocument,
};
use drawbridge_core::element::{generate_id, validate_id, Element, ElementInput, Provenance};
use drawbridge_core::error::{DrawbridgeError, Result};
use drawbridge_core::protocol::{
    CanvasEvent, ImportMode, ImportResponse, ItemError, SyncResponse, SyncStatus,
};

use crate::hub::{Hub, Subscription};

pub struct SyncHandler {
    store: RwLock<ElementStore>,
    hub: Hub,
    sync_enabled: bool,
}

impl SyncHandler {
    pub fn new(subscriber_buffer: usize, sync_enabled: bool) -> Self {
        Self {
            store: RwLock::new(ElementStore::new()),
            hub: Hub::new(subscriber_buffer),
            sync_enabled,
        }
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    pub fn sync_enabled(&self) -> bool {
        self.sync_enabled
    }

    /// Register a viewer. Its queue starts with the current snapshot and a
    /// status frame; every later event follows in publish order.
    pub async fn subscribe(&self) -> Subscription {
        let store = self.store.read().await;
        let bootstrap = [
            CanvasEvent::InitialElements {
                elements: store.sorted(),
            },
            CanvasEvent::SyncStatus {
                element_count: store.len(),
                timestamp: Utc::now(),
            },
        ];
        self.hub.subscribe(&bootstrap)
    }

    pub async fn element_count(&self) -> usize {
        self.store.read().await.len()
    }

    /// Create an element. A caller-supplied id that already exists turns the
    /// create into an update of that element.
    pub async fn create(&self, body: &Value) -> Result<Element> {
        let input = ElementInput::parse_complete(body)?;
        let id = input.id.unwrap_or_else(generate_id);

        let mut store = self.store.write().await;
        let out = store.upsert(&id, input.patch, Provenance::Agent)?;
        let event = if out.created {
            CanvasEvent::ElementCreated {
                element: out.element.clone(),
            }
        } else {
            CanvasEvent::ElementUpdated {
                element: out.element.clone(),
            }
        };
        self.hub.publish(&event);
        self.record_mutation(event.name(), store.len());
        Ok(out.element)
    }

    pub async fn update(&self, id: &str, body: &Value) -> Result<Element> {
        validate_id(id)?;
        let input = ElementInput::parse(body)?;
        if let Some(body_id) = &input.id {
            if body_id != id {
                return Err(DrawbridgeError::Validation(format!(
                    "body id '{body_id}' does not match path id '{id}'"
                )));
            }
        }

        let mut store = self.store.write().await;
        if !store.contains(id) {
            return Err(DrawbridgeError::NotFound(id.to_string()));
        }
        let out = store.upsert(id, input.patch, Provenance::Agent)?;
        let event = CanvasEvent::ElementUpdated {
            element: out.element.clone(),
        };
        self.hub.publish(&event);
        self.record_mutation(event.name(), store.len());
        Ok(out.element)
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let mut store = self.store.write().await;
        if !store.delete(id) {
            return Err(DrawbridgeError::NotFound(id.to_string()));
        }
        let event = CanvasEvent::ElementDeleted {
            element_id: id.to_string(),
        };
        self.hub.publish(&event);
        self.record_mutation(event.name(), store.len());
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Element> {
        self.store
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| DrawbridgeError::NotFound(id.to_string()))
    }

    pub async fn list(&self) -> Vec<Element> {
        self.store.read().await.sorted()
    }

    pub async fn query(&self, query: &ElementQuery) -> Vec<Element> {
        let store = self.store.read().await;
        query.apply(store.sorted().iter())
    }

    /// Create several elements at once. Every item gets a fresh id. The
    /// batch is all-or-nothing: one invalid item rejects the whole request.
    pub async fn batch_create(&self, items: &[Value]) -> Result<Vec<Element>> {
        if items.is_empty() {
            return Err(DrawbridgeError::Validation("elements must not be empty".into()));
        }
        let inputs = items
            .iter()
            .enumerate()
            .map(|(index, item)| {
                ElementInput::parse_complete(item).map_err(|e| {
                    DrawbridgeError::Validation(format!("element {index}: {}", describe(&e)))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let mut store = self.store.write().await;
        let now = Utc::now();
        let mut created = Vec::with_capacity(inputs.len());
        for input in inputs {
            let id = generate_id();
            created.push(store.upsert_at(&id, input.patch, Provenance::Agent, now)?.element);
        }
        let event = CanvasEvent::ElementsBatchCreated {
            elements: created.clone(),
        };
        self.hub.publish(&event);
        self.record_mutation(event.name(), store.len());
        info!(count = created.len(), "Batch created");
        Ok(created)
    }

    /// Replace the whole store with a viewer's snapshot. Malformed items are
    /// skipped and reported, the rest are applied.
    pub async fn full_sync(
        &self,
        items: &[Value],
        client_timestamp: Option<&str>,
    ) -> Result<SyncResponse> {
        if !self.sync_enabled {
            return Err(DrawbridgeError::SyncDisabled);
        }

        let now = Utc::now();
        let mut errors = Vec::new();
        let mut parsed_items = Vec::with_capacity(items.len());
        for (index, item) in items.iter().enumerate() {
            let parsed = ElementInput::parse_complete(item).and_then(|input| {
                let id = input.id.unwrap_or_else(generate_id);
                Element::from_patch(id, input.patch, Provenance::Sync, now)
            });
            match parsed {
                Ok(element) => parsed_items.push((index, element)),
                Err(e) => errors.push(ItemError {
                    index,
                    error: describe(&e),
                }),
            }
        }
        let incoming = dedupe_last_wins(parsed_items, &mut errors);

        let count = incoming.len();
        let mut store = self.store.write().await;
        let before_count = store.len();
        let after_count = store.replace_all(incoming);
        let event = CanvasEvent::ElementsSynced {
            count,
            skipped: errors.len(),
            timestamp: now,
            source: "sync".to_string(),
            elements: store.sorted(),
        };
        self.hub.publish(&event);
        self.record_mutation(event.name(), after_count);
        info!(
            count,
            skipped = errors.len(),
            before_count,
            after_count,
            client_timestamp = client_timestamp.unwrap_or("-"),
            "Canvas synced"
        );

        Ok(SyncResponse {
            success: true,
            count,
            skipped: errors.len(),
            before_count,
            after_count,
            errors,
            timestamp: now,
        })
    }

    /// Import elements from a scene document.
    ///
    /// `Merge` adds every item under a fresh id next to the existing content.
    /// `Replace` swaps the store for the document's elements, keeping their
    /// ids; a repeated id keeps its last occurrence.
    pub async fn import(&self, items: &[Value], mode: ImportMode) -> Result<ImportResponse> {
        let now = Utc::now();
        let mut errors = Vec::new();
        let mut parsed_items = Vec::with_capacity(items.len());
        for (index, item) in items.iter().enumerate() {
            let parsed = ElementInput::parse_complete(item).and_then(|input| {
                let id = match mode {
                    ImportMode::Merge => generate_id(),
                    ImportMode::Replace => input.id.unwrap_or_else(generate_id),
                };
                Element::from_patch(id, input.patch, Provenance::Import, now)
            });
            match parsed {
                Ok(element) => parsed_items.push((index, element)),
                Err(e) => errors.push(ItemError {
                    index,
                    error: describe(&e),
                }),
            }
        }
        let imported = dedupe_last_wins(parsed_items, &mut errors);

        let mut store = self.store.write().await;
        match mode {
            ImportMode::Merge => {
                for element in &imported {
                    store.insert(element.clone());
                }
            }
            ImportMode::Replace => {
                store.replace_all(imported.clone());
            }
        }

        let event = CanvasEvent::ElementsImported {
            count: imported.len(),
            skipped: errors.len(),
            mode,
            elements: imported.clone(),
        };
        self.hub.publish(&event);
        self.record_mutation(event.name(), store.len());
        info!(count = imported.len(), skipped = errors.len(), ?mode, "Scene imported");

        Ok(ImportResponse {
            success: true,
            count: imported.len(),
            skipped: errors.len(),
            mode,
            errors,
            elements: imported,
        })
    }

    /// Remove every element. Returns how many were removed.
    pub async fn clear(&self) -> usize {
        let mut store = self.store.write().await;
        let count = store.clear();
        let event = CanvasEvent::ElementsCleared { count };
        self.hub.publish(&event);
        self.record_mutation(event.name(), 0);
        info!(count, "Canvas cleared");
        count
    }

    pub async fn export_svg(&self, options: &ExportOptions) -> Result<String> {
        let elements = self.list().await;
        render_svg(&elements, options)
    }

    /// Scene export; fails on an empty canvas.
    pub async fn export_scene(&self) -> Result<SceneDocument> {
        let elements = self.list().await;
        export_scene(&elements)
    }

    /// Current scene, which may be empty.
    pub async fn scene(&self) -> SceneDocument {
        let elements = self.list().await;
        render_scene(&elements)
    }

    pub async fn sync_status(&self) -> SyncStatus {
        let element_count = self.element_count().await;
        SyncStatus {
            success: true,
            element_count,
            subscriber_count: self.hub.len(),
            sync_enabled: self.sync_enabled,
            timestamp: Utc::now(),
        }
    }

    #[cfg(feature = "metrics")]
    fn record_mutation(&self, event: &'static str, element_count: usize) {
        crate::metrics::record_mutation(event, element_count);
    }

    #[cfg(not(feature = "metrics"))]
    fn record_mutation(&self, event: &'static str, element_count: usize) {
        tracing::debug!(event, element_count, "Canvas mutated");
    }
}

/// Keep the last element for each id. Earlier occurrences are reported as
/// skipped items so the success count matches what the store ends up holding.
fn dedupe_last_wins(items: Vec<(usize, Element)>, errors: &mut Vec<ItemError>) -> Vec<Element> {
    let mut last_index: HashMap<String, usize> = HashMap::with_capacity(items.len());
    for (index, element) in &items {
        last_index.insert(element.id.clone(), *index);
    }

    let mut kept = Vec::with_capacity(last_index.len());
    for (index, element) in items {
        match last_index.get(&element.id) {
            Some(&winner) if winner != index => errors.push(ItemError {
                index,
                error: format!("duplicate id '{}', superseded by item {winner}", element.id),
            }),
            _ => kept.push(element),
        }
    }
    errors.sort_by_key(|e| e.index);
    kept
}

/// Item-level error text without the error-kind prefix.
fn describe(err: &DrawbridgeError) -> String {
    match err {
        DrawbridgeError::Validation(msg) => msg.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn handler() -> SyncHandler {
        SyncHandler::new(64, true)
    }

    fn drain(sub: &mut Subscription) -> Vec<Value> {
        std::iter::from_fn(|| sub.rx.try_recv().ok())
            .map(|f| serde_json::from_str(&f).unwrap())
            .collect()
    }

    fn types(frames: &[Value]) -> Vec<String> {
        frames
            .iter()
            .map(|f| f["type"].as_str().unwrap().to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_create_then_update_bumps_version() {
        let h = handler();
        let created = h
            .create(&json!({"type": "rectangle", "x": 10, "y": 20}))
            .await
            .unwrap();
        assert_eq!(created.version, 1);
        assert_eq!(created.id.len(), 32);

        let updated = h
            .update(&created.id, &json!({"width": 300, "strokeColor": "#ff0000"}))
            .await
            .unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(updated.width, Some(300.0));
        assert_eq!(updated.x, 10.0);
    }

    #[tokio::test]
    async fn test_create_with_existing_id_upserts() {
        let h = handler();
        let mut sub = h.subscribe().await;
        h.create(&json!({"id": "r1", "type": "rectangle", "x": 0, "y": 0}))
            .await
            .unwrap();
        let again = h
            .create(&json!({"id": "r1", "type": "rectangle", "x": 5, "y": 5}))
            .await
            .unwrap();
        assert_eq!(again.version, 2);
        assert_eq!(h.element_count().await, 1);

        let frames = drain(&mut sub);
        assert_eq!(
            types(&frames),
            vec!["initial_elements", "sync_status", "element_created", "element_updated"]
        );
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_input() {
        let h = handler();
        let err = h.create(&json!({"type": "rectangle", "x": 0})).await.unwrap_err();
        assert!(matches!(err, DrawbridgeError::Validation(_)));
        let err = h
            .create(&json!({"type": "rectangle", "x": 0, "y": 0, "opacity": 150}))
            .await
            .unwrap_err();
        assert!(matches!(err, DrawbridgeError::Validation(_)));
        assert_eq!(h.element_count().await, 0);
    }

    #[tokio::test]
    async fn test_update_missing_is_not_found() {
        let h = handler();
        let err = h.update("nope", &json!({"x": 1})).await.unwrap_err();
        assert!(matches!(err, DrawbridgeError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_update_rejects_mismatched_body_id() {
        let h = handler();
        h.create(&json!({"id": "a", "type": "text", "x": 0, "y": 0, "text": "hi"}))
            .await
            .unwrap();
        let err = h.update("a", &json!({"id": "b", "x": 1})).await.unwrap_err();
        assert!(matches!(err, DrawbridgeError::Validation(_)));
    }

    #[tokio::test]
    async fn test_delete_twice() {
        let h = handler();
        let el = h
            .create(&json!({"type": "ellipse", "x": 0, "y": 0}))
            .await
            .unwrap();
        h.delete(&el.id).await.unwrap();
        assert!(matches!(h.get(&el.id).await, Err(DrawbridgeError::NotFound(_))));
        assert!(matches!(h.delete(&el.id).await, Err(DrawbridgeError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_events_follow_mutation_order() {
        let h = handler();
        let mut sub = h.subscribe().await;
        let el = h
            .create(&json!({"type": "diamond", "x": 0, "y": 0}))
            .await
            .unwrap();
        h.update(&el.id, &json!({"x": 50})).await.unwrap();
        h.delete(&el.id).await.unwrap();
        h.clear().await;

        let frames = drain(&mut sub);
        assert_eq!(
            types(&frames),
            vec![
                "initial_elements",
                "sync_status",
                "element_created",
                "element_updated",
                "element_deleted",
                "elements_cleared"
            ]
        );
        assert_eq!(frames[4]["elementId"], el.id);
    }

    #[tokio::test]
    async fn test_snapshot_reflects_existing_elements() {
        let h = handler();
        h.create(&json!({"type": "line", "x": 0, "y": 0})).await.unwrap();
        h.create(&json!({"type": "arrow", "x": 0, "y": 0})).await.unwrap();

        let mut sub = h.subscribe().await;
        let frames = drain(&mut sub);
        assert_eq!(frames[0]["elements"].as_array().unwrap().len(), 2);
        assert_eq!(frames[1]["elementCount"], 2);
    }

    #[tokio::test]
    async fn test_batch_is_all_or_nothing() {
        let h = handler();
        let err = h
            .batch_create(&[
                json!({"type": "rectangle", "x": 0, "y": 0}),
                json!({"type": "rectangle"}),
            ])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("element 1"));
        assert_eq!(h.element_count().await, 0);

        let created = h
            .batch_create(&[
                json!({"id": "ignored", "type": "rectangle", "x": 0, "y": 0}),
                json!({"type": "text", "x": 0, "y": 40, "text": "caption"}),
            ])
            .await
            .unwrap();
        assert_eq!(created.len(), 2);
        assert!(created.iter().all(|e| e.version == 1 && e.id != "ignored"));
    }

    #[tokio::test]
    async fn test_full_sync_skips_malformed_items() {
        let h = handler();
        h.create(&json!({"id": "old", "type": "rectangle", "x": 0, "y": 0}))
            .await
            .unwrap();
        let mut sub = h.subscribe().await;

        let out = h
            .full_sync(
                &[
                    json!({"id": "a", "type": "rectangle", "x": 1, "y": 1}),
                    json!({"id": "b", "type": "hexagon", "x": 1, "y": 1}),
                    json!("not an object"),
                    json!({"id": "c", "type": "ellipse", "x": 2, "y": 2}),
                ],
                Some("2026-01-01T00:00:00Z"),
            )
            .await
            .unwrap();

        assert_eq!(out.count, 2);
        assert_eq!(out.skipped, 2);
        assert_eq!(out.before_count, 1);
        assert_eq!(out.after_count, 2);
        assert_eq!(
            out.errors.iter().map(|e| e.index).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert!(matches!(h.get("old").await, Err(DrawbridgeError::NotFound(_))));
        assert_eq!(h.get("a").await.unwrap().version, 1);

        let frames = drain(&mut sub);
        let synced = frames.last().unwrap();
        assert_eq!(synced["type"], "elements_synced");
        assert_eq!(synced["count"], 2);
        assert_eq!(synced["skipped"], 2);
        assert_eq!(synced["elements"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_full_sync_repeated_id_counts_once() {
        let h = handler();
        let mut sub = h.subscribe().await;
        let out = h
            .full_sync(
                &[
                    json!({"id": "k", "type": "rectangle", "x": 0, "y": 0}),
                    json!({"id": "k", "type": "rectangle", "x": 5, "y": 5}),
                ],
                None,
            )
            .await
            .unwrap();

        assert_eq!(out.count, 1);
        assert_eq!(out.skipped, 1);
        assert_eq!(out.after_count, 1);
        assert_eq!(out.count, out.after_count);
        assert_eq!(h.get("k").await.unwrap().x, 5.0);

        let frames = drain(&mut sub);
        let synced = frames.last().unwrap();
        assert_eq!(synced["count"], 1);
        assert_eq!(synced["skipped"], 1);
    }

    #[tokio::test]
    async fn test_full_sync_empty_clears() {
        let h = handler();
        h.create(&json!({"type": "rectangle", "x": 0, "y": 0})).await.unwrap();
        let out = h.full_sync(&[], None).await.unwrap();
        assert_eq!(out.count, 0);
        assert_eq!(out.after_count, 0);
        assert_eq!(h.element_count().await, 0);
    }

    #[tokio::test]
    async fn test_full_sync_disabled() {
        let h = SyncHandler::new(8, false);
        let err = h.full_sync(&[], None).await.unwrap_err();
        assert!(matches!(err, DrawbridgeError::SyncDisabled));
    }

    #[tokio::test]
    async fn test_import_merge_assigns_fresh_ids() {
        let h = handler();
        h.create(&json!({"id": "keep", "type": "rectangle", "x": 0, "y": 0}))
            .await
            .unwrap();
        let out = h
            .import(
                &[json!({"id": "keep", "type": "ellipse", "x": 5, "y": 5})],
                ImportMode::Merge,
            )
            .await
            .unwrap();
        assert_eq!(out.count, 1);
        assert_ne!(out.elements[0].id, "keep");
        assert_eq!(out.elements[0].source, Some(Provenance::Import));
        assert_eq!(h.element_count().await, 2);
    }

    #[tokio::test]
    async fn test_import_replace_keeps_ids() {
        let h = handler();
        h.create(&json!({"id": "gone", "type": "rectangle", "x": 0, "y": 0}))
            .await
            .unwrap();
        let out = h
            .import(
                &[
                    json!({"id": "k1", "type": "ellipse", "x": 5, "y": 5}),
                    json!({"type": "nope"}),
                ],
                ImportMode::Replace,
            )
            .await
            .unwrap();
        assert_eq!(out.count, 1);
        assert_eq!(out.skipped, 1);
        assert_eq!(h.list().await.len(), 1);
        assert!(h.get("k1").await.is_ok());
        assert!(h.get("gone").await.is_err());
    }

    #[tokio::test]
    async fn test_import_replace_repeated_id_keeps_last() {
        let h = handler();
        let out = h
            .import(
                &[
                    json!({"id": "k", "type": "rectangle", "x": 0, "y": 0}),
                    json!({"id": "k", "type": "ellipse", "x": 9, "y": 9}),
                ],
                ImportMode::Replace,
            )
            .await
            .unwrap();
        assert_eq!(out.count, 1);
        assert_eq!(out.skipped, 1);
        assert_eq!(out.errors[0].index, 0);
        assert_eq!(out.elements.len(), 1);
        assert_eq!(h.element_count().await, 1);

        let stored = h.get("k").await.unwrap();
        assert_eq!(stored.version, 1);
        assert_eq!(stored.kind, drawbridge_core::element::ElementKind::Ellipse);
        assert_eq!(stored.source, Some(Provenance::Import));
    }

    #[tokio::test]
    async fn test_clear_and_exports() {
        let h = handler();
        assert!(matches!(
            h.export_svg(&ExportOptions::default()).await,
            Err(DrawbridgeError::EmptyCanvas)
        ));
        assert!(matches!(h.export_scene().await, Err(DrawbridgeError::EmptyCanvas)));
        assert!(h.scene().await.elements.is_empty());

        h.create(&json!({"type": "rectangle", "x": 0, "y": 0})).await.unwrap();
        assert!(h.export_svg(&ExportOptions::default()).await.unwrap().starts_with("<svg"));
        assert_eq!(h.export_scene().await.unwrap().elements.len(), 1);

        assert_eq!(h.clear().await, 1);
        assert_eq!(h.clear().await, 0);
    }

    #[tokio::test]
    async fn test_query_by_kind() {
        let h = handler();
        h.create(&json!({"type": "rectangle", "x": 0, "y": 0})).await.unwrap();
        h.create(&json!({"type": "ellipse", "x": 0, "y": 0})).await.unwrap();
        let q = ElementQuery::from_params([("type", "ellipse")]).unwrap();
        let found = h.query(&q).await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].kind.as_str(), "ellipse");
    }

    #[tokio::test]
    async fn test_sync_status_counts() {
        let h = handler();
        let _sub = h.subscribe().await;
        h.create(&json!({"type": "rectangle", "x": 0, "y": 0})).await.unwrap();
        let status = h.sync_status().await;
        assert_eq!(status.element_count, 1);
        assert_eq!(status.subscriber_count, 1);
        assert!(status.sync_enabled);
    }
}
