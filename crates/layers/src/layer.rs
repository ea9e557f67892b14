use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LayerKind {
    Circle,
    Heatmap,
    Symbol,
    Line,
    Fill,
}

/// Declarative rendering rule for one layer of an overlay.
///
/// Paint, layout and filter are opaque to this crate and passed through to
/// the render target untouched. The layer id is global on the target, so two
/// overlays must not declare the same id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerSpec {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: LayerKind,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub paint: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub layout: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Value>,
    #[serde(default, rename = "minzoom", skip_serializing_if = "Option::is_none")]
    pub min_zoom: Option<f32>,
    #[serde(default, rename = "maxzoom", skip_serializing_if = "Option::is_none")]
    pub max_zoom: Option<f32>,
}

impl LayerSpec {
    pub fn new(id: impl Into<String>, kind: LayerKind) -> Self {
        Self {
            id: id.into(),
            kind,
            paint: Map::new(),
            layout: Map::new(),
            filter: None,
            min_zoom: None,
            max_zoom: None,
        }
    }

    pub fn circle(id: impl Into<String>) -> Self {
        Self::new(id, LayerKind::Circle)
    }

    pub fn heatmap(id: impl Into<String>) -> Self {
        Self::new(id, LayerKind::Heatmap)
    }

    pub fn paint(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.paint.insert(key.into(), value.into());
        self
    }

    pub fn layout(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.layout.insert(key.into(), value.into());
        self
    }

    pub fn filter(mut self, filter: Value) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn zoom_range(mut self, min: f32, max: f32) -> Self {
        self.min_zoom = Some(min);
        self.max_zoom = Some(max);
        self
    }

    /// Sets `layout.visibility` to `none`.
    pub fn hidden(self) -> Self {
        self.layout("visibility", "none")
    }

    pub fn is_visible(&self) -> bool {
        self.layout.get("visibility").and_then(Value::as_str) != Some("none")
    }
}

#[cfg(test)]
mod tests {
    use super::{LayerKind, LayerSpec};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn serializes_in_style_document_shape() {
        let spec = LayerSpec::circle("fire-points")
            .paint("circle-radius", 4)
            .paint("circle-color", "#ff6b35")
            .zoom_range(10.0, 22.0);

        assert_eq!(
            serde_json::to_value(&spec).unwrap(),
            json!({
                "id": "fire-points",
                "type": "circle",
                "paint": { "circle-radius": 4, "circle-color": "#ff6b35" },
                "minzoom": 10.0,
                "maxzoom": 22.0
            })
        );
    }

    #[test]
    fn visibility_follows_layout() {
        let spec = LayerSpec::new("heat", LayerKind::Heatmap);
        assert!(spec.is_visible());
        assert!(!spec.hidden().is_visible());

        let parsed: LayerSpec =
            serde_json::from_value(json!({ "id": "x", "type": "fill" })).unwrap();
        assert_eq!(parsed, LayerSpec::new("x", LayerKind::Fill));
    }
}
