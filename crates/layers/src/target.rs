//! The render-target seam.
//!
//! A render target is an external, stateful map engine that initializes
//! asynchronously and may discard every user-added source and layer when its
//! style is swapped. All methods take `&self`: the engine is driven from a
//! single event loop and implementations keep their own interior state.

use std::rc::Rc;

use foundation::geo::{Feature, FeatureCollection, LngLat};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::layer::LayerSpec;

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerId(pub u64);

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PopupId(pub u64);

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum PointerEventKind {
    Move,
    Leave,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PointerEvent {
    /// Pointer position on the map.
    pub lng_lat: LngLat,
    /// Features of the layer under the pointer, topmost first.
    pub features: Vec<Feature>,
}

impl PointerEvent {
    pub fn leave(lng_lat: LngLat) -> Self {
        Self {
            lng_lat,
            features: Vec::new(),
        }
    }
}

pub type PointerHandler = Rc<dyn Fn(&PointerEvent)>;
pub type StyleLoadHandler = Rc<dyn Fn()>;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum Cursor {
    #[default]
    Default,
    Pointer,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PopupOptions {
    pub close_button: bool,
    pub close_on_click: bool,
    pub class_name: String,
    pub max_width: String,
    /// Pixel offset from the anchor point.
    pub offset: f64,
}

impl Default for PopupOptions {
    fn default() -> Self {
        Self {
            close_button: false,
            close_on_click: false,
            class_name: "datadiver-tooltip".to_string(),
            max_width: "240px".to_string(),
            offset: 12.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TargetError {
    /// The style is still loading. Always retried, never surfaced.
    #[error("render target style is not loaded")]
    NotReady,

    #[error("unknown layer: {0}")]
    UnknownLayer(String),

    #[error("unknown listener: {0:?}")]
    UnknownListener(ListenerId),

    #[error("source already exists: {0}")]
    DuplicateSource(String),

    #[error("layer already exists: {0}")]
    DuplicateLayer(String),

    #[error("render target rejected operation: {0}")]
    Rejected(String),
}

impl TargetError {
    pub fn is_not_ready(&self) -> bool {
        matches!(self, TargetError::NotReady)
    }
}

pub trait RenderTarget {
    fn has_source(&self, id: &str) -> Result<bool, TargetError>;

    fn add_source(&self, id: &str, data: &FeatureCollection) -> Result<(), TargetError>;

    /// Replaces the data of an existing source in place.
    fn set_source_data(&self, id: &str, data: &FeatureCollection) -> Result<(), TargetError>;

    fn has_layer(&self, id: &str) -> Result<bool, TargetError>;

    /// Adds a layer drawing from `source`. Fails on a duplicate id.
    fn add_layer(&self, source: &str, spec: &LayerSpec) -> Result<(), TargetError>;

    /// Subscribes to the style-loaded signal. Fires on the initial load and
    /// after every style swap.
    fn on_style_load(&self, handler: StyleLoadHandler) -> ListenerId;

    fn on_layer_pointer(
        &self,
        layer: &str,
        kind: PointerEventKind,
        handler: PointerHandler,
    ) -> Result<ListenerId, TargetError>;

    fn off(&self, listener: ListenerId) -> Result<(), TargetError>;

    fn set_cursor(&self, cursor: Cursor);

    fn create_popup(&self, options: &PopupOptions) -> PopupId;

    /// Moves the popup to `at`, replaces its content and makes it visible.
    fn show_popup(&self, popup: PopupId, at: LngLat, html: &str);

    fn hide_popup(&self, popup: PopupId);

    fn remove_popup(&self, popup: PopupId);
}

/// Shared handle to a render target, `None` until the engine exists.
pub type TargetHandle = Option<Rc<dyn RenderTarget>>;

pub(crate) fn same_target(a: &Rc<dyn RenderTarget>, b: &Rc<dyn RenderTarget>) -> bool {
    std::ptr::addr_eq(Rc::as_ptr(a), Rc::as_ptr(b))
}
