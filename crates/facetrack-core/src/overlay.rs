//! Overlay layout: what to draw over the video for the tracked face.
//!
//! The renderer stays outside the core; this module only decides geometry,
//! colours and text. Text widths come from a [`TextMeasure`] so the label
//! background can be sized to the renderer's font.

use crate::types::BoundingBox;
use serde::{Deserialize, Serialize};

pub const BOX_PADDING: f32 = 15.0;
pub const STROKE_WIDTH: f32 = 3.0;
pub const LABEL_TEXT_PADDING: f32 = 8.0;
pub const LABEL_HEIGHT: f32 = 45.0;
pub const LABEL_GAP: f32 = 5.0;
pub const LABEL_FONT: &str = "bold 16px Arial";
const FIRST_LINE_OFFSET: f32 = 20.0;
const SECOND_LINE_OFFSET: f32 = 40.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rgba {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: f32,
}

impl Rgba {
    pub const fn opaque(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b, a: 1.0 }
    }

    pub const fn with_alpha(self, a: f32) -> Self {
        Self { a, ..self }
    }
}

pub const MATCHED: Rgba = Rgba::opaque(0x00, 0xff, 0x00);
pub const UNMATCHED: Rgba = Rgba::opaque(0xff, 0x00, 0x00);
pub const LABEL_TEXT: Rgba = Rgba::opaque(0xff, 0xff, 0xff);
const LABEL_ALPHA: f32 = 0.85;

/// Width of rendered text in pixels.
pub trait TextMeasure: Send {
    fn width(&self, text: &str, font: &str) -> f32;
}

/// Monospace approximation for hosts without font metrics.
#[derive(Debug, Clone, Copy)]
pub struct FixedAdvance(pub f32);

impl Default for FixedAdvance {
    fn default() -> Self {
        Self(9.0)
    }
}

impl TextMeasure for FixedAdvance {
    fn width(&self, text: &str, _font: &str) -> f32 {
        text.chars().count() as f32 * self.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextLine {
    pub text: String,
    pub x: f32,
    pub y: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverlayInstructions {
    /// Padded face outline.
    pub outline: BoundingBox,
    pub stroke: Rgba,
    pub stroke_width: f32,
    /// Filled rectangle behind the text, directly above the outline.
    pub label_background: BoundingBox,
    pub fill: Rgba,
    pub text_color: Rgba,
    pub font: String,
    pub lines: Vec<TextLine>,
}

/// Text content of the label.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelInfo {
    /// `None` draws as "Unknown".
    pub name: Option<String>,
    pub confidence: f32,
    pub age: Option<u32>,
    pub gender: Option<String>,
}

impl LabelInfo {
    pub fn unknown() -> Self {
        Self {
            name: None,
            confidence: 0.0,
            age: None,
            gender: None,
        }
    }

    fn main_line(&self) -> String {
        match &self.name {
            Some(name) => format!("{name} ({}%)", (self.confidence * 100.0).round() as i32),
            None => "Unknown".to_string(),
        }
    }

    fn detail_line(&self) -> String {
        let age = self.age.map_or_else(|| "?".to_string(), |a| a.to_string());
        let gender = self.gender.as_deref().unwrap_or("?");
        format!("Age: ~{age}, {gender}")
    }
}

pub fn layout(bbox: &BoundingBox, label: &LabelInfo, measure: &dyn TextMeasure) -> OverlayInstructions {
    let outline = bbox.expand(BOX_PADDING);
    let color = if label.name.is_some() { MATCHED } else { UNMATCHED };

    let main = label.main_line();
    let detail = label.detail_line();
    let text_width = measure
        .width(&main, LABEL_FONT)
        .max(measure.width(&detail, LABEL_FONT));

    let label_background = BoundingBox::new(
        outline.x,
        outline.y - LABEL_HEIGHT - LABEL_GAP,
        text_width + LABEL_TEXT_PADDING * 2.0,
        LABEL_HEIGHT,
    );
    let text_x = label_background.x + LABEL_TEXT_PADDING;

    OverlayInstructions {
        outline,
        stroke: color,
        stroke_width: STROKE_WIDTH,
        label_background,
        fill: color.with_alpha(LABEL_ALPHA),
        text_color: LABEL_TEXT,
        font: LABEL_FONT.to_string(),
        lines: vec![
            TextLine {
                text: main,
                x: text_x,
                y: label_background.y + FIRST_LINE_OFFSET,
            },
            TextLine {
                text: detail,
                x: text_x,
                y: label_background.y + SECOND_LINE_OFFSET,
            },
        ],
    }
}
