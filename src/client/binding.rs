//! Scene binding: keeps an external rendering surface and the document in
//! step without echoing changes back and forth.
//!
//! DESIGN
//! ======
//! The binding caches the last element state it knows the scene shows.
//!
//! - Local path: the host reports the full scene; the binding diffs it
//!   against the cache and emits a field-level `Mutation`. Removed fields are
//!   written as null; missing or `isDeleted` elements become tombstones.
//! - Remote path: `Origin::Remote` change sets are pushed into the scene and
//!   the cache, so the next local diff does not send them back.
//! - `Origin::Local` change sets are ignored; they came from the scene.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use serde_json::Value;

use super::doc::{Change, ChangeSet, Element, ElementId, Fields, Mutation, Origin};
use super::lock;
use super::presence::Viewport;

/// The external rendering surface.
pub trait Scene: Send {
    /// Everything currently drawn, including elements flagged `isDeleted`.
    fn elements(&self) -> Vec<Element>;
    fn replace_elements(&mut self, elements: Vec<Element>);
    fn upsert_elements(&mut self, elements: Vec<Element>);
    fn remove_elements(&mut self, ids: &[ElementId]);
    fn viewport(&self) -> Viewport;
    fn set_viewport(&mut self, viewport: Viewport);
}

pub struct SceneBinding {
    scene: Box<dyn Scene>,
    cache: HashMap<ElementId, Fields>,
}

impl SceneBinding {
    /// Bind `scene`, replacing whatever it shows with `snapshot`.
    #[must_use]
    pub fn new(mut scene: Box<dyn Scene>, snapshot: Vec<Element>) -> Self {
        let cache = snapshot
            .iter()
            .map(|element| (element.id.clone(), element.fields.clone()))
            .collect();
        scene.replace_elements(snapshot);
        Self { scene, cache }
    }

    /// Field-level edits that turn the cached state into `reported`.
    #[must_use]
    pub fn diff(&self, reported: &[Element]) -> Mutation {
        let mut mutation = Mutation::new();
        let mut seen: HashSet<&str> = HashSet::with_capacity(reported.len());

        for element in reported {
            seen.insert(&element.id);
            let cached = self.cache.get(&element.id);
            if element.is_deleted() {
                if cached.is_some() {
                    mutation = mutation.delete(element.id.clone());
                }
                continue;
            }

            let mut changed = Fields::new();
            for (name, value) in &element.fields {
                if cached.and_then(|fields| fields.get(name)) != Some(value) {
                    changed.insert(name.clone(), value.clone());
                }
            }
            if let Some(fields) = cached {
                for name in fields.keys() {
                    if !element.fields.contains_key(name) {
                        changed.insert(name.clone(), Value::Null);
                    }
                }
            }
            if !changed.is_empty() {
                mutation = mutation.upsert(element.id.clone(), changed);
            }
        }

        for id in self.cache.keys() {
            if !seen.contains(id.as_str()) {
                mutation = mutation.delete(id.clone());
            }
        }
        mutation
    }

    /// Diff a reported scene and adopt it as the new cache.
    pub fn local_change(&mut self, reported: &[Element]) -> Mutation {
        let mutation = self.diff(reported);
        self.cache = reported
            .iter()
            .filter(|element| !element.is_deleted())
            .map(|element| (element.id.clone(), element.fields.clone()))
            .collect();
        mutation
    }

    /// Push a remote change set into the scene. Local change sets are ignored.
    pub fn apply_change_set(&mut self, change_set: &ChangeSet) {
        if change_set.origin == Origin::Local {
            return;
        }
        let mut upserts = Vec::new();
        let mut removals = Vec::new();
        for change in &change_set.changes {
            match change {
                Change::Upserted(element) => {
                    self.cache.insert(element.id.clone(), element.fields.clone());
                    upserts.push(element.clone());
                }
                Change::Removed(id) => {
                    self.cache.remove(id);
                    removals.push(id.clone());
                }
            }
        }
        if !upserts.is_empty() {
            self.scene.upsert_elements(upserts);
        }
        if !removals.is_empty() {
            self.scene.remove_elements(&removals);
        }
    }

    /// Drop elements the document keeps hidden (tombstoned remotely) even
    /// though the scene just edited them.
    pub fn hide(&mut self, ids: &[ElementId]) {
        if ids.is_empty() {
            return;
        }
        for id in ids {
            self.cache.remove(id);
        }
        self.scene.remove_elements(ids);
    }

    #[must_use]
    pub fn scene_elements(&self) -> Vec<Element> {
        self.scene.elements()
    }

    #[must_use]
    pub fn viewport(&self) -> Viewport {
        self.scene.viewport()
    }

    pub fn set_viewport(&mut self, viewport: Viewport) {
        self.scene.set_viewport(viewport);
    }
}

/// Holds the scene until both the renderer is ready and the document has
/// been seeded, then binds exactly once.
#[derive(Default)]
pub struct PendingBinding {
    scene: Option<Box<dyn Scene>>,
    seeded: bool,
    bound: bool,
}

impl PendingBinding {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn renderer_ready(&mut self, scene: Box<dyn Scene>) {
        if !self.bound {
            self.scene = Some(scene);
        }
    }

    pub fn mark_seeded(&mut self) {
        self.seeded = true;
    }

    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.bound
    }

    /// Bind if both conditions hold. `snapshot` is only called when binding.
    pub fn try_bind(&mut self, snapshot: impl FnOnce() -> Vec<Element>) -> Option<SceneBinding> {
        if self.bound || !self.seeded {
            return None;
        }
        let scene = self.scene.take()?;
        self.bound = true;
        Some(SceneBinding::new(scene, snapshot()))
    }
}

// =============================================================================
// HEADLESS SCENE
// =============================================================================

#[derive(Default)]
struct MemorySceneState {
    elements: Vec<Element>,
    viewport: Viewport,
}

/// Headless scene: an ordered element list plus a viewport. Clones share
/// state, so a host can keep one handle and give the session another.
#[derive(Clone, Default)]
pub struct MemoryScene {
    inner: Arc<Mutex<MemorySceneState>>,
}

impl MemoryScene {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mutate the drawn elements as a user would.
    pub fn edit(&self, edit: impl FnOnce(&mut Vec<Element>)) {
        edit(&mut lock(&self.inner).elements);
    }
}

impl Scene for MemoryScene {
    fn elements(&self) -> Vec<Element> {
        lock(&self.inner).elements.clone()
    }

    fn replace_elements(&mut self, elements: Vec<Element>) {
        lock(&self.inner).elements = elements;
    }

    fn upsert_elements(&mut self, elements: Vec<Element>) {
        let mut state = lock(&self.inner);
        for element in elements {
            match state.elements.iter_mut().find(|e| e.id == element.id) {
                Some(existing) => *existing = element,
                None => state.elements.push(element),
            }
        }
    }

    fn remove_elements(&mut self, ids: &[ElementId]) {
        lock(&self.inner)
            .elements
            .retain(|element| !ids.contains(&element.id));
    }

    fn viewport(&self) -> Viewport {
        lock(&self.inner).viewport
    }

    fn set_viewport(&mut self, viewport: Viewport) {
        lock(&self.inner).viewport = viewport;
    }
}

#[cfg(test)]
#[path = "binding_test.rs"]
mod tests;
