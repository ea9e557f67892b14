//! In-memory [`RenderTarget`].
//!
//! Behaves like a map engine whose style loads asynchronously: until
//! [`HeadlessTarget::finish_style_load`] is called every resource operation
//! fails with [`TargetError::NotReady`], and a style swap discards all sources
//! and layers. Every trait call is recorded so tests can spy on exactly what
//! the synchronizer and hover binder did.

use std::cell::RefCell;
use std::collections::BTreeMap;

use foundation::geo::{FeatureCollection, LngLat};

use crate::layer::LayerSpec;
use crate::target::{
    Cursor, ListenerId, PointerEvent, PointerEventKind, PointerHandler, PopupId, PopupOptions,
    RenderTarget, StyleLoadHandler, TargetError,
};

#[derive(Debug, Clone, PartialEq)]
pub enum TargetCall {
    HasSource(String),
    AddSource(String),
    SetSourceData(String),
    HasLayer(String),
    AddLayer { source: String, layer: String },
    OnStyleLoad(ListenerId),
    OnLayerPointer {
        layer: String,
        kind: PointerEventKind,
    },
    Off(ListenerId),
    SetCursor(Cursor),
    CreatePopup(PopupId),
    ShowPopup(PopupId),
    HidePopup(PopupId),
    RemovePopup(PopupId),
}

impl TargetCall {
    /// Calls that read or write sources and layers.
    pub fn is_upsert(&self) -> bool {
        matches!(
            self,
            TargetCall::HasSource(_)
                | TargetCall::AddSource(_)
                | TargetCall::SetSourceData(_)
                | TargetCall::HasLayer(_)
                | TargetCall::AddLayer { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PopupState {
    pub options: PopupOptions,
    pub visible: bool,
    pub at: Option<LngLat>,
    pub html: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AddedLayer {
    pub source: String,
    pub spec: LayerSpec,
}

#[derive(Default)]
struct State {
    style_loaded: bool,
    sources: BTreeMap<String, FeatureCollection>,
    layers: BTreeMap<String, AddedLayer>,
    next_id: u64,
    style_listeners: BTreeMap<ListenerId, StyleLoadHandler>,
    pointer_listeners: BTreeMap<ListenerId, (String, PointerEventKind, PointerHandler)>,
    cursor: Cursor,
    popups: BTreeMap<PopupId, PopupState>,
    reject_next: u32,
    reject_pointer: Option<PointerEventKind>,
    calls: Vec<TargetCall>,
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Gate for resource operations: not-loaded style and injected
    /// rejections both fail here.
    fn check_ready(&mut self) -> Result<(), TargetError> {
        if !self.style_loaded {
            return Err(TargetError::NotReady);
        }
        if self.reject_next > 0 {
            self.reject_next -= 1;
            return Err(TargetError::Rejected("injected failure".to_string()));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct HeadlessTarget {
    state: RefCell<State>,
}

impl HeadlessTarget {
    /// A target whose style has not finished loading.
    pub fn new() -> Self {
        Self::default()
    }

    /// A target that is ready from the start. No style-load signal is
    /// emitted.
    pub fn loaded() -> Self {
        let target = Self::default();
        target.state.borrow_mut().style_loaded = true;
        target
    }

    pub fn is_style_loaded(&self) -> bool {
        self.state.borrow().style_loaded
    }

    /// Marks the style loaded and emits the style-load signal.
    pub fn finish_style_load(&self) {
        self.state.borrow_mut().style_loaded = true;
        // Handlers may call back into the target.
        let handlers: Vec<StyleLoadHandler> =
            self.state.borrow().style_listeners.values().cloned().collect();
        tracing::trace!(listeners = handlers.len(), "style loaded");
        for handler in handlers {
            handler();
        }
    }

    /// Starts a style swap: every source and layer is discarded and resource
    /// operations fail until [`finish_style_load`](Self::finish_style_load).
    pub fn begin_style_swap(&self) {
        let mut state = self.state.borrow_mut();
        state.style_loaded = false;
        state.sources.clear();
        state.layers.clear();
    }

    pub fn swap_style(&self) {
        self.begin_style_swap();
        self.finish_style_load();
    }

    /// Makes the next `n` resource operations fail with
    /// [`TargetError::Rejected`].
    pub fn reject_next(&self, n: u32) {
        self.state.borrow_mut().reject_next = n;
    }

    /// Makes pointer registrations of `kind` fail until cleared with `None`.
    pub fn reject_pointer(&self, kind: Option<PointerEventKind>) {
        self.state.borrow_mut().reject_pointer = kind;
    }

    pub fn remove_layer(&self, id: &str) -> bool {
        self.state.borrow_mut().layers.remove(id).is_some()
    }

    pub fn remove_source(&self, id: &str) -> bool {
        let mut state = self.state.borrow_mut();
        state.layers.retain(|_, l| l.source != id);
        state.sources.remove(id).is_some()
    }

    /// Delivers a pointer event to the listeners of `layer`. Returns how many
    /// handlers ran; none do while the layer is absent.
    ///
    /// Listeners outlive the layer they were registered on, as in the real
    /// engine: they fire again once a layer with the same id comes back.
    pub fn dispatch_pointer(&self, layer: &str, kind: PointerEventKind, event: &PointerEvent) -> usize {
        let state = self.state.borrow();
        if !state.layers.contains_key(layer) {
            return 0;
        }
        let handlers: Vec<PointerHandler> = state
            .pointer_listeners
            .values()
            .filter(|(l, k, _)| l == layer && *k == kind)
            .map(|(_, _, h)| h.clone())
            .collect();
        drop(state);
        for handler in &handlers {
            handler(event);
        }
        handlers.len()
    }

    pub fn source_data(&self, id: &str) -> Option<FeatureCollection> {
        self.state.borrow().sources.get(id).cloned()
    }

    pub fn source_ids(&self) -> Vec<String> {
        self.state.borrow().sources.keys().cloned().collect()
    }

    pub fn layer(&self, id: &str) -> Option<AddedLayer> {
        self.state.borrow().layers.get(id).cloned()
    }

    pub fn layer_ids(&self) -> Vec<String> {
        self.state.borrow().layers.keys().cloned().collect()
    }

    pub fn style_listener_count(&self) -> usize {
        self.state.borrow().style_listeners.len()
    }

    pub fn pointer_listener_count(&self) -> usize {
        self.state.borrow().pointer_listeners.len()
    }

    pub fn cursor(&self) -> Cursor {
        self.state.borrow().cursor
    }

    pub fn popup(&self, id: PopupId) -> Option<PopupState> {
        self.state.borrow().popups.get(&id).cloned()
    }

    pub fn popup_count(&self) -> usize {
        self.state.borrow().popups.len()
    }

    pub fn calls(&self) -> Vec<TargetCall> {
        self.state.borrow().calls.clone()
    }

    pub fn count_calls(&self, pred: impl Fn(&TargetCall) -> bool) -> usize {
        self.state.borrow().calls.iter().filter(|c| pred(c)).count()
    }

    pub fn clear_calls(&self) {
        self.state.borrow_mut().calls.clear();
    }
}

impl std::fmt::Debug for HeadlessTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("HeadlessTarget")
            .field("style_loaded", &state.style_loaded)
            .field("sources", &state.sources.keys().collect::<Vec<_>>())
            .field("layers", &state.layers.keys().collect::<Vec<_>>())
            .field("calls", &state.calls.len())
            .finish()
    }
}

impl RenderTarget for HeadlessTarget {
    fn has_source(&self, id: &str) -> Result<bool, TargetError> {
        let mut state = self.state.borrow_mut();
        state.calls.push(TargetCall::HasSource(id.to_string()));
        state.check_ready()?;
        Ok(state.sources.contains_key(id))
    }

    fn add_source(&self, id: &str, data: &FeatureCollection) -> Result<(), TargetError> {
        let mut state = self.state.borrow_mut();
        state.calls.push(TargetCall::AddSource(id.to_string()));
        state.check_ready()?;
        if state.sources.contains_key(id) {
            return Err(TargetError::DuplicateSource(id.to_string()));
        }
        state.sources.insert(id.to_string(), data.clone());
        Ok(())
    }

    fn set_source_data(&self, id: &str, data: &FeatureCollection) -> Result<(), TargetError> {
        let mut state = self.state.borrow_mut();
        state.calls.push(TargetCall::SetSourceData(id.to_string()));
        state.check_ready()?;
        match state.sources.get_mut(id) {
            Some(existing) => {
                *existing = data.clone();
                Ok(())
            }
            None => Err(TargetError::Rejected(format!("no source {id}"))),
        }
    }

    fn has_layer(&self, id: &str) -> Result<bool, TargetError> {
        let mut state = self.state.borrow_mut();
        state.calls.push(TargetCall::HasLayer(id.to_string()));
        state.check_ready()?;
        Ok(state.layers.contains_key(id))
    }

    fn add_layer(&self, source: &str, spec: &LayerSpec) -> Result<(), TargetError> {
        let mut state = self.state.borrow_mut();
        state.calls.push(TargetCall::AddLayer {
            source: source.to_string(),
            layer: spec.id.clone(),
        });
        state.check_ready()?;
        if !state.sources.contains_key(source) {
            return Err(TargetError::Rejected(format!("no source {source}")));
        }
        if state.layers.contains_key(&spec.id) {
            return Err(TargetError::DuplicateLayer(spec.id.clone()));
        }
        state.layers.insert(
            spec.id.clone(),
            AddedLayer {
                source: source.to_string(),
                spec: spec.clone(),
            },
        );
        Ok(())
    }

    fn on_style_load(&self, handler: StyleLoadHandler) -> ListenerId {
        let mut state = self.state.borrow_mut();
        let id = ListenerId(state.next_id());
        state.style_listeners.insert(id, handler);
        state.calls.push(TargetCall::OnStyleLoad(id));
        id
    }

    fn on_layer_pointer(
        &self,
        layer: &str,
        kind: PointerEventKind,
        handler: PointerHandler,
    ) -> Result<ListenerId, TargetError> {
        let mut state = self.state.borrow_mut();
        state.calls.push(TargetCall::OnLayerPointer {
            layer: layer.to_string(),
            kind,
        });
        if !state.layers.contains_key(layer) {
            return Err(TargetError::UnknownLayer(layer.to_string()));
        }
        if state.reject_pointer == Some(kind) {
            return Err(TargetError::Rejected(format!("{kind:?} listener refused")));
        }
        let id = ListenerId(state.next_id());
        state
            .pointer_listeners
            .insert(id, (layer.to_string(), kind, handler));
        Ok(id)
    }

    fn off(&self, listener: ListenerId) -> Result<(), TargetError> {
        let mut state = self.state.borrow_mut();
        state.calls.push(TargetCall::Off(listener));
        let removed = state.style_listeners.remove(&listener).is_some()
            || state.pointer_listeners.remove(&listener).is_some();
        if removed {
            Ok(())
        } else {
            Err(TargetError::UnknownListener(listener))
        }
    }

    fn set_cursor(&self, cursor: Cursor) {
        let mut state = self.state.borrow_mut();
        state.calls.push(TargetCall::SetCursor(cursor));
        state.cursor = cursor;
    }

    fn create_popup(&self, options: &PopupOptions) -> PopupId {
        let mut state = self.state.borrow_mut();
        let id = PopupId(state.next_id());
        state.popups.insert(
            id,
            PopupState {
                options: options.clone(),
                visible: false,
                at: None,
                html: String::new(),
            },
        );
        state.calls.push(TargetCall::CreatePopup(id));
        id
    }

    fn show_popup(&self, popup: PopupId, at: LngLat, html: &str) {
        let mut state = self.state.borrow_mut();
        state.calls.push(TargetCall::ShowPopup(popup));
        if let Some(p) = state.popups.get_mut(&popup) {
            p.visible = true;
            p.at = Some(at);
            p.html = html.to_string();
        }
    }

    fn hide_popup(&self, popup: PopupId) {
        let mut state = self.state.borrow_mut();
        state.calls.push(TargetCall::HidePopup(popup));
        if let Some(p) = state.popups.get_mut(&popup) {
            p.visible = false;
        }
    }

    fn remove_popup(&self, popup: PopupId) {
        let mut state = self.state.borrow_mut();
        state.calls.push(TargetCall::RemovePopup(popup));
        state.popups.remove(&popup);
    }
}
