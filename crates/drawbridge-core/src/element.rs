//! Canvas element model, partial updates, and boundary validation.
//!
//! Everything that enters the store passes through [`ElementPatch::validate`]
//! first. Consumers that need a width, colour, or font size must go through the
//! `effective_*` accessors so every renderer applies the same defaults.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{DrawbridgeError, Result};

pub const DEFAULT_SHAPE_SIZE: f64 = 100.0;
pub const DEFAULT_STROKE_COLOR: &str = "#1e1e1e";
pub const DEFAULT_BACKGROUND_COLOR: &str = "transparent";
pub const DEFAULT_STROKE_WIDTH: f64 = 2.0;
pub const DEFAULT_OPACITY: f64 = 100.0;
pub const DEFAULT_ROUGHNESS: f64 = 1.0;
pub const DEFAULT_FONT_SIZE: f64 = 20.0;
pub const DEFAULT_FONT_FAMILY: u32 = 1;

const MAX_TEXT_LEN: usize = 10_000;
const MAX_ID_LEN: usize = 128;

/// The closed set of element kinds the canvas understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementKind {
    Rectangle,
    Ellipse,
    Diamond,
    Text,
    Label,
    Line,
    Arrow,
    Freedraw,
}

impl ElementKind {
    pub const ALL: [ElementKind; 8] = [
        ElementKind::Rectangle,
        ElementKind::Ellipse,
        ElementKind::Diamond,
        ElementKind::Text,
        ElementKind::Label,
        ElementKind::Line,
        ElementKind::Arrow,
        ElementKind::Freedraw,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rectangle => "rectangle",
            Self::Ellipse => "ellipse",
            Self::Diamond => "diamond",
            Self::Text => "text",
            Self::Label => "label",
            Self::Line => "line",
            Self::Arrow => "arrow",
            Self::Freedraw => "freedraw",
        }
    }

    /// Lines and arrows: geometry is a segment, not a box.
    pub fn is_linear(&self) -> bool {
        matches!(self, Self::Line | Self::Arrow)
    }

    /// Default (width, height) when the element does not carry its own.
    pub fn default_size(&self, font_size: f64) -> (f64, f64) {
        match self {
            Self::Line | Self::Arrow => (DEFAULT_SHAPE_SIZE, 0.0),
            Self::Text => (DEFAULT_SHAPE_SIZE, font_size),
            _ => (DEFAULT_SHAPE_SIZE, DEFAULT_SHAPE_SIZE),
        }
    }
}

impl fmt::Display for ElementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ElementKind {
    type Err = DrawbridgeError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| DrawbridgeError::Validation(format!("unknown element type '{s}'")))
    }
}

/// Where an element came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    Agent,
    Sync,
    Import,
}

/// Display text bound to a non-text shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Label {
    pub text: String,
}

/// A stored canvas element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Element {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ElementKind,
    pub x: f64,
    pub y: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<f64>,
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
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<Provenance>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A partial set of element fields. Used for creates (where `type`, `x`, `y`
/// are required) and for merge-updates (where everything is optional).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementPatch {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ElementKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<f64>,
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

/// An element record as it arrives over the wire: an optional id plus fields.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ElementInput {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(flatten)]
    pub patch: ElementPatch,
}

impl ElementInput {
    /// Parse and validate a loosely-typed JSON record.
    pub fn parse(value: &serde_json::Value) -> Result<Self> {
        if !value.is_object() {
            return Err(DrawbridgeError::Validation(
                "element must be a JSON object".into(),
            ));
        }
        let input: ElementInput = serde_json::from_value(value.clone())
            .map_err(|e| DrawbridgeError::Validation(e.to_string()))?;
        if let Some(id) = &input.id {
            validate_id(id)?;
        }
        input.patch.validate()?;
        Ok(input)
    }

    /// Parse a record that must describe a complete element.
    pub fn parse_complete(value: &serde_json::Value) -> Result<Self> {
        let input = Self::parse(value)?;
        input.patch.require_complete()?;
        Ok(input)
    }
}

/// Generate a fresh element id (32 lowercase hex chars).
pub fn generate_id() -> String {
    Uuid::new_v4().simple().to_string()
}

pub fn validate_id(id: &str) -> Result<()> {
    if id.trim().is_empty() {
        return Err(DrawbridgeError::Validation("id must not be empty".into()));
    }
    if id.len() > MAX_ID_LEN {
        return Err(DrawbridgeError::Validation(format!(
            "id exceeds {MAX_ID_LEN} characters"
        )));
    }
    Ok(())
}

fn check_finite(name: &str, value: Option<f64>) -> Result<()> {
    match value {
        Some(v) if !v.is_finite() => Err(DrawbridgeError::Validation(format!(
            "{name} must be a finite number"
        ))),
        _ => Ok(()),
    }
}

fn check_range(name: &str, value: Option<f64>, min: f64, max: f64) -> Result<()> {
    check_finite(name, value)?;
    match value {
        Some(v) if v < min || v > max => Err(DrawbridgeError::Validation(format!(
            "{name} must be between {min} and {max}, got {v}"
        ))),
        _ => Ok(()),
    }
}

fn check_color(name: &str, value: &Option<String>) -> Result<()> {
    match value {
        Some(c) if c.trim().is_empty() => Err(DrawbridgeError::Validation(format!(
            "{name} must not be empty"
        ))),
        _ => Ok(()),
    }
}

fn check_text(name: &str, value: Option<&str>) -> Result<()> {
    match value {
        Some(t) if t.chars().count() > MAX_TEXT_LEN => Err(DrawbridgeError::Validation(format!(
            "{name} exceeds {MAX_TEXT_LEN} characters"
        ))),
        _ => Ok(()),
    }
}

impl ElementPatch {
    /// Type-check every field that is present.
    pub fn validate(&self) -> Result<()> {
        check_finite("x", self.x)?;
        check_finite("y", self.y)?;
        check_finite("width", self.width)?;
        check_finite("height", self.height)?;
        check_range("strokeWidth", self.stroke_width, 0.0, f64::MAX)?;
        check_range("fontSize", self.font_size, 0.0, f64::MAX)?;
        check_range("opacity", self.opacity, 0.0, 100.0)?;
        check_range("roughness", self.roughness, 0.0, 2.0)?;
        check_color("strokeColor", &self.stroke_color)?;
        check_color("backgroundColor", &self.background_color)?;
        check_text("text", self.text.as_deref())?;
        check_text("label.text", self.label.as_ref().map(|l| l.text.as_str()))?;
        Ok(())
    }

    /// A create needs a kind and a position.
    pub fn require_complete(&self) -> Result<()> {
        if self.kind.is_none() {
            return Err(DrawbridgeError::Validation("missing required field 'type'".into()));
        }
        if self.x.is_none() || self.y.is_none() {
            return Err(DrawbridgeError::Validation(
                "missing required fields 'x' and 'y'".into(),
            ));
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Move free text on a non-text shape into its bound label.
fn normalize_label(kind: ElementKind, text: &mut Option<String>, label: &mut Option<Label>) {
    if kind == ElementKind::Text {
        return;
    }
    if let Some(t) = text.take() {
        if label.is_none() {
            *label = Some(Label { text: t });
        }
    }
}

impl Element {
    /// Build a fresh element at version 1.
    pub fn from_patch(
        id: String,
        patch: ElementPatch,
        source: Provenance,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        patch.require_complete()?;
        let ElementPatch {
            kind,
            x,
            y,
            width,
            height,
            stroke_color,
            background_color,
            stroke_width,
            opacity,
            roughness,
            mut text,
            font_size,
            font_family,
            mut label,
            group_id,
            locked,
        } = patch;
        // require_complete checked these
        let (Some(kind), Some(x), Some(y)) = (kind, x, y) else {
            return Err(DrawbridgeError::Validation("incomplete element".into()));
        };
        normalize_label(kind, &mut text, &mut label);

        Ok(Self {
            id,
            kind,
            x,
            y,
            width,
            height,
            stroke_color,
            background_color,
            stroke_width,
            opacity,
            roughness,
            text,
            font_size,
            font_family,
            label,
            group_id,
            locked,
            source: Some(source),
            version: 1,
            created_at: now,
            updated_at: now,
        })
    }

    /// Merge the present fields of `patch` over this element and bump the version.
    ///
    /// `text` sent for a non-text kind replaces the label unless the same
    /// patch also carries a label.
    pub fn apply(&mut self, mut patch: ElementPatch, now: DateTime<Utc>) {
        normalize_label(
            patch.kind.unwrap_or(self.kind),
            &mut patch.text,
            &mut patch.label,
        );

        macro_rules! merge {
            ($($field:ident),* $(,)?) => {
                $(if patch.$field.is_some() { self.$field = patch.$field; })*
            };
        }

        if let Some(kind) = patch.kind {
            self.kind = kind;
        }
        if let Some(x) = patch.x {
            self.x = x;
        }
        if let Some(y) = patch.y {
            self.y = y;
        }
        merge!(
            width,
            height,
            stroke_color,
            background_color,
            stroke_width,
            opacity,
            roughness,
            text,
            font_size,
            font_family,
            label,
            group_id,
            locked,
        );
        normalize_label(self.kind, &mut self.text, &mut self.label);

        self.version += 1;
        self.updated_at = now;
    }

    pub fn effective_font_size(&self) -> f64 {
        self.font_size.unwrap_or(DEFAULT_FONT_SIZE)
    }

    pub fn effective_width(&self) -> f64 {
        self.width
            .unwrap_or_else(|| self.kind.default_size(self.effective_font_size()).0)
    }

    pub fn effective_height(&self) -> f64 {
        self.height
            .unwrap_or_else(|| self.kind.default_size(self.effective_font_size()).1)
    }

    pub fn effective_stroke_color(&self) -> &str {
        self.stroke_color.as_deref().unwrap_or(DEFAULT_STROKE_COLOR)
    }

    pub fn effective_background_color(&self) -> &str {
        self.background_color
            .as_deref()
            .unwrap_or(DEFAULT_BACKGROUND_COLOR)
    }

    pub fn effective_stroke_width(&self) -> f64 {
        self.stroke_width.unwrap_or(DEFAULT_STROKE_WIDTH)
    }

    pub fn effective_opacity(&self) -> f64 {
        self.opacity.unwrap_or(DEFAULT_OPACITY)
    }

    pub fn effective_roughness(&self) -> f64 {
        self.roughness.unwrap_or(DEFAULT_ROUGHNESS)
    }

    pub fn effective_font_family(&self) -> u32 {
        self.font_family.unwrap_or(DEFAULT_FONT_FAMILY)
    }

    /// Text to display: the text payload, or the bound label for shapes.
    pub fn display_text(&self) -> Option<&str> {
        self.text
            .as_deref()
            .or_else(|| self.label.as_ref().map(|l| l.text.as_str()))
    }
}
