//! Export renderers: SVG and the portable scene document.
//!
//! Both are pure functions of the element set. Elements are drawn in
//! `(createdAt, id)` order regardless of input order, so identical stores
//! always render identical output.

use serde::{Deserialize, Serialize};

use drawbridge_core::element::{Element, ElementKind, Label};
use drawbridge_core::error::{DrawbridgeError, Result};

pub const EXPORT_PADDING: f64 = 20.0;
pub const CORNER_RADIUS: f64 = 8.0;
pub const SCENE_FORMAT: &str = "excalidraw";
pub const SCENE_VERSION: u32 = 2;
pub const SCENE_SOURCE: &str = "drawbridge";

const LINE_HEIGHT: f64 = 1.25;

#[derive(Debug, Clone)]
pub struct ExportOptions {
    pub padding: f64,
    /// Fill behind the drawing; `None` leaves the SVG transparent.
    pub background: Option<String>,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            padding: EXPORT_PADDING,
            background: Some("#ffffff".to_string()),
        }
    }
}

/// Axis-aligned bounding box over element geometry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Bounds {
    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    pub fn pad(&self, padding: f64) -> Self {
        Self {
            min_x: self.min_x - padding,
            min_y: self.min_y - padding,
            max_x: self.max_x + padding,
            max_y: self.max_y + padding,
        }
    }
}

/// Bounding box over all elements using their effective sizes. `None` when empty.
pub fn bounds(elements: &[Element]) -> Option<Bounds> {
    elements.iter().fold(None, |acc, el| {
        let (x0, x1) = span(el.x, el.effective_width());
        let (y0, y1) = span(el.y, el.effective_height());
        Some(match acc {
            None => Bounds {
                min_x: x0,
                min_y: y0,
                max_x: x1,
                max_y: y1,
            },
            Some(b) => Bounds {
                min_x: b.min_x.min(x0),
                min_y: b.min_y.min(y0),
                max_x: b.max_x.max(x1),
                max_y: b.max_y.max(y1),
            },
        })
    })
}

fn span(origin: f64, extent: f64) -> (f64, f64) {
    let end = origin + extent;
    (origin.min(end), origin.max(end))
}

fn ordered(elements: &[Element]) -> Vec<&Element> {
    let mut refs: Vec<&Element> = elements.iter().collect();
    refs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    refs
}

fn escape_xml(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

fn font_family_name(family: u32) -> &'static str {
    match family {
        2 => "Helvetica, Segoe UI Emoji",
        3 => "Cascadia, Segoe UI Emoji",
        _ => "Virgil, Segoe UI Emoji",
    }
}

fn fill(el: &Element) -> String {
    match el.effective_background_color() {
        "transparent" => "none".to_string(),
        color => escape_xml(color),
    }
}

/// Shared stroke/opacity attributes.
fn paint(el: &Element) -> String {
    format!(
        r#"stroke="{}" stroke-width="{}" opacity="{}""#,
        escape_xml(el.effective_stroke_color()),
        el.effective_stroke_width(),
        el.effective_opacity() / 100.0
    )
}

fn text_block(x: f64, first_baseline: f64, anchor: Option<&str>, el: &Element, text: &str) -> String {
    let font_size = el.effective_font_size();
    let anchor_attr = anchor
        .map(|a| format!(r#" text-anchor="{a}" dominant-baseline="middle""#))
        .unwrap_or_default();
    let mut out = format!(
        r#"<text x="{x}" y="{first_baseline}" font-family="{}" font-size="{font_size}" fill="{}" opacity="{}"{anchor_attr}>"#,
        font_family_name(el.effective_font_family()),
        escape_xml(el.effective_stroke_color()),
        el.effective_opacity() / 100.0,
    );
    for (i, line) in text.lines().enumerate() {
        let dy = if i == 0 { 0.0 } else { font_size * LINE_HEIGHT };
        out.push_str(&format!(
            r#"<tspan x="{x}" dy="{dy}">{}</tspan>"#,
            escape_xml(line)
        ));
    }
    out.push_str("</text>");
    out
}

fn render_label(el: &Element, label: &Label) -> String {
    let cx = el.x + el.effective_width() / 2.0;
    let cy = el.y + el.effective_height() / 2.0;
    text_block(cx, cy, Some("middle"), el, &label.text)
}

fn render_element(el: &Element) -> String {
    let w = el.effective_width();
    let h = el.effective_height();
    let (x0, x1) = span(el.x, w);
    let (y0, y1) = span(el.y, h);
    let (bw, bh) = (x1 - x0, y1 - y0);

    let mut out = match el.kind {
        ElementKind::Rectangle => format!(
            r#"<rect x="{x0}" y="{y0}" width="{bw}" height="{bh}" rx="{CORNER_RADIUS}" ry="{CORNER_RADIUS}" fill="{}" {}/>"#,
            fill(el),
            paint(el)
        ),
        ElementKind::Ellipse => format!(
            r#"<ellipse cx="{}" cy="{}" rx="{}" ry="{}" fill="{}" {}/>"#,
            x0 + bw / 2.0,
            y0 + bh / 2.0,
            bw / 2.0,
            bh / 2.0,
            fill(el),
            paint(el)
        ),
        ElementKind::Diamond => {
            let cx = x0 + bw / 2.0;
            let cy = y0 + bh / 2.0;
            format!(
                r#"<polygon points="{cx},{y0} {x1},{cy} {cx},{y1} {x0},{cy}" fill="{}" {}/>"#,
                fill(el),
                paint(el)
            )
        }
        ElementKind::Text => {
            let text = el.text.as_deref().unwrap_or_default();
            text_block(el.x, el.y + el.effective_font_size(), None, el, text)
        }
        ElementKind::Line | ElementKind::Arrow => {
            let marker = if el.kind == ElementKind::Arrow {
                r#" marker-end="url(#arrowhead)""#
            } else {
                ""
            };
            format!(
                r#"<line x1="{}" y1="{}" x2="{}" y2="{}" {}{marker}/>"#,
                el.x,
                el.y,
                el.x + w,
                el.y + h,
                paint(el)
            )
        }
        ElementKind::Label | ElementKind::Freedraw => format!(
            r#"<rect x="{x0}" y="{y0}" width="{bw}" height="{bh}" fill="none" stroke-dasharray="4 4" {}/>"#,
            paint(el)
        ),
    };

    if el.kind != ElementKind::Text {
        if let Some(label) = &el.label {
            out.push_str(&render_label(el, label));
        }
    }
    out
}

/// Render elements as a standalone SVG document.
pub fn render_svg(elements: &[Element], options: &ExportOptions) -> Result<String> {
    let bounds = bounds(elements).ok_or(DrawbridgeError::EmptyCanvas)?;
    let view = bounds.pad(options.padding);
    let (w, h) = (view.width(), view.height());

    let mut out = format!(
        r#"<svg xmlns="http://www.w3.org/2000/svg" width="{w}" height="{h}" viewBox="{} {} {w} {h}">"#,
        view.min_x, view.min_y
    );
    out.push('\n');

    if elements.iter().any(|e| e.kind == ElementKind::Arrow) {
        out.push_str(concat!(
            r#"<defs><marker id="arrowhead" markerWidth="10" markerHeight="7" refX="10" refY="3.5" orient="auto">"#,
            r##"<polygon points="0 0, 10 3.5, 0 7" fill="#1e1e1e"/></marker></defs>"##,
        ));
        out.push('\n');
    }

    if let Some(background) = &options.background {
        out.push_str(&format!(
            r#"<rect x="{}" y="{}" width="{w}" height="{h}" fill="{}"/>"#,
            view.min_x,
            view.min_y,
            escape_xml(background)
        ));
        out.push('\n');
    }

    for el in ordered(elements) {
        out.push_str(&render_element(el));
        out.push('\n');
    }
    out.push_str("</svg>\n");
    Ok(out)
}

/// An element as it appears in a portable scene: server metadata removed,
/// geometry made concrete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SceneElement {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ElementKind,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stroke_color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background_color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stroke_width: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opacity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roughness: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub font_size: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub font_family: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<Label>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked: Option<bool>,
}

impl From<&Element> for SceneElement {
    fn from(el: &Element) -> Self {
        Self {
            id: el.id.clone(),
            kind: el.kind,
            x: el.x,
            y: el.y,
            width: el.effective_width(),
            height: el.effective_height(),
            stroke_color: el.stroke_color.clone(),
            background_color: el.background_color.clone(),
            stroke_width: el.stroke_width,
            opacity: el.opacity,
            roughness: el.roughness,
            text: el.text.clone(),
            font_size: el.font_size,
            font_family: el.font_family,
            label: el.label.clone(),
            group_id: el.group_id.clone(),
            locked: el.locked,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Zoom {
    pub value: f64,
}

/// Default view settings shipped with every scene.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppState {
    pub view_background_color: String,
    pub grid_size: Option<u32>,
    pub zoom: Zoom,
    pub scroll_x: f64,
    pub scroll_y: f64,
}

impl Default for AppState {
    fn default() -> Self {
        Self {
            view_background_color: "#ffffff".to_string(),
            grid_size: None,
            zoom: Zoom { value: 1.0 },
            scroll_x: 0.0,
            scroll_y: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SceneDocument {
    #[serde(rename = "type")]
    pub format: String,
    pub version: u32,
    pub source: String,
    pub elements: Vec<SceneElement>,
    pub app_state: AppState,
    pub files: serde_json::Map<String, serde_json::Value>,
}

/// Wrap elements in a scene envelope. An empty canvas gives an empty scene.
pub fn render_scene(elements: &[Element]) -> SceneDocument {
    SceneDocument {
        format: SCENE_FORMAT.to_string(),
        version: SCENE_VERSION,
        source: SCENE_SOURCE.to_string(),
        elements: ordered(elements).into_iter().map(SceneElement::from).collect(),
        app_state: AppState::default(),
        files: serde_json::Map::new(),
    }
}

/// Scene export for an explicit download: an empty canvas is an error.
pub fn export_scene(elements: &[Element]) -> Result<SceneDocument> {
    if elements.is_empty() {
        return Err(DrawbridgeError::EmptyCanvas);
    }
    Ok(render_scene(elements))
}
