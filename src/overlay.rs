//! Text cards rendered as full-frame stills.
//!
//! Each card is a self-contained HTML document built from a fixed
//! template, handed to a [`MarkupRasterizer`] at the output resolution.
//! The document depends only on the card text and template, so equal
//! input always rasterizes to the same image.

use crate::config::Config;
use crate::error::RenderError;
use crate::logw;
use crate::timeline::Segment;
use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::process::Command;

const MAX_KEYWORD_TAGS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CardKind {
    Title,
    /// Zero-based key point index.
    KeyPoint(usize),
    CallToAction,
}

impl CardKind {
    /// Card type label: `title`, `keypoint-N` (1-based) or `cta`.
    pub fn label(&self) -> String {
        match self {
            CardKind::Title => "title".to_string(),
            CardKind::KeyPoint(i) => format!("keypoint-{}", i + 1),
            CardKind::CallToAction => "cta".to_string(),
        }
    }

    pub fn template(&self) -> &'static Template {
        match self {
            CardKind::Title => &TITLE_TEMPLATE,
            CardKind::KeyPoint(_) => &KEYPOINT_TEMPLATE,
            CardKind::CallToAction => &CTA_TEMPLATE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardSpec {
    pub kind: CardKind,
    pub text: String,
}

/// Title, one card per key point, then the call to action.
pub fn card_specs(segment: &Segment) -> Vec<CardSpec> {
    let mut specs = Vec::with_capacity(segment.key_points.len() + 2);
    specs.push(CardSpec {
        kind: CardKind::Title,
        text: segment.title.clone(),
    });
    for (i, point) in segment.key_points.iter().enumerate() {
        specs.push(CardSpec {
            kind: CardKind::KeyPoint(i),
            text: point.clone(),
        });
    }
    specs.push(CardSpec {
        kind: CardKind::CallToAction,
        text: segment.call_to_action.clone(),
    });
    specs
}

#[derive(Debug, PartialEq, Eq)]
pub struct Template {
    pub id: &'static str,
    pub background: &'static str,
    pub heading_px: u32,
    pub body_px: u32,
    pub text_colour: &'static str,
    pub accent_colour: &'static str,
}

pub static TITLE_TEMPLATE: Template = Template {
    id: "title",
    background: "linear-gradient(135deg, #667eea 0%, #764ba2 100%)",
    heading_px: 48,
    body_px: 32,
    text_colour: "#ffffff",
    accent_colour: "#ffd700",
};

pub static KEYPOINT_TEMPLATE: Template = Template {
    id: "keypoint",
    background: "linear-gradient(135deg, #f093fb 0%, #f5576c 100%)",
    heading_px: 72,
    body_px: 28,
    text_colour: "#ffffff",
    accent_colour: "#00d4ff",
};

pub static CTA_TEMPLATE: Template = Template {
    id: "cta",
    background: "linear-gradient(135deg, #4facfe 0%, #00f2fe 100%)",
    heading_px: 48,
    body_px: 28,
    text_colour: "#ffffff",
    accent_colour: "#00d4ff",
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

/// Canvas geometry and fixed copy shared by every card.
#[derive(Debug, Clone)]
pub struct CardLayout {
    pub viewport: Viewport,
    pub margin_top: u32,
    pub margin_bottom: u32,
    pub margin_left: u32,
    pub margin_right: u32,
    pub font_family: String,
    pub title_tagline: String,
    pub cta_button: String,
}

impl CardLayout {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            viewport: Viewport {
                width: cfg.video.width,
                height: cfg.video.height,
            },
            margin_top: cfg.overlay.margin_top,
            margin_bottom: cfg.overlay.margin_bottom,
            margin_left: cfg.overlay.margin_left,
            margin_right: cfg.overlay.margin_right,
            font_family: cfg.overlay.font_family.clone(),
            title_tagline: cfg.overlay.title_tagline.clone(),
            cta_button: cfg.overlay.cta_button.clone(),
        }
    }

    pub fn content_width(&self) -> u32 {
        self.viewport
            .width
            .saturating_sub(self.margin_left + self.margin_right)
    }

    pub fn content_height(&self) -> u32 {
        self.viewport
            .height
            .saturating_sub(self.margin_top + self.margin_bottom)
    }
}

pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}

fn card_body(segment: &Segment, spec: &CardSpec, layout: &CardLayout) -> String {
    let text = escape_html(&spec.text);
    match spec.kind {
        CardKind::Title => format!(
            r#"<div class="heading">{}</div><div class="sub">{}</div>"#,
            text,
            escape_html(&layout.title_tagline)
        ),
        CardKind::KeyPoint(i) => {
            let tags: String = segment
                .keywords
                .iter()
                .take(MAX_KEYWORD_TAGS)
                .map(|k| format!(r#"<span class="tag">{}</span>"#, escape_html(k)))
                .collect();
            format!(
                r#"<div class="heading">{}</div><div class="body">{}</div><div class="tags">{}</div>"#,
                i + 1,
                text,
                tags
            )
        }
        CardKind::CallToAction => format!(
            r#"<div class="body">{}</div><div class="button">{}</div>"#,
            text,
            escape_html(&layout.cta_button)
        ),
    }
}

/// Builds the self-contained document for one card. Pure: the same
/// segment, card and layout always produce the same string.
pub fn build_markup(segment: &Segment, spec: &CardSpec, layout: &CardLayout) -> String {
    let t = spec.kind.template();
    format!(
        r#"<!DOCTYPE html>
<html data-template="{id}">
<head>
<meta charset="UTF-8">
<style>
html, body {{ margin: 0; padding: 0; overflow: hidden; }}
body {{
  width: {w}px; height: {h}px;
  background: {bg};
  font-family: {font};
  color: {fg};
  display: flex; align-items: center; justify-content: center;
  box-sizing: border-box;
  padding: {mt}px {mr}px {mb}px {ml}px;
}}
.card {{
  box-sizing: border-box;
  max-width: {cw}px; max-height: {ch}px;
  overflow: hidden; overflow-wrap: anywhere;
  text-align: center;
  padding: 48px 40px;
  background: rgba(0, 0, 0, 0.8);
  border-radius: 20px;
}}
.heading {{ font-size: {hp}px; font-weight: bold; line-height: 1.2; margin-bottom: 20px; color: {accent}; }}
.sub {{ font-size: {bp}px; color: {accent}; opacity: 0.9; }}
.body {{ font-size: {bp}px; line-height: 1.4; margin-bottom: 24px; }}
.tags {{ display: flex; flex-wrap: wrap; justify-content: center; gap: 10px; }}
.tag {{ background: {accent}; padding: 8px 16px; border-radius: 20px; font-size: 18px; }}
.button {{ display: inline-block; background: {accent}; padding: 20px 40px; border-radius: 50px; font-size: 24px; font-weight: bold; }}
</style>
</head>
<body><div class="card">{content}</div></body>
</html>
"#,
        id = t.id,
        w = layout.viewport.width,
        h = layout.viewport.height,
        bg = t.background,
        font = layout.font_family,
        fg = t.text_colour,
        mt = layout.margin_top,
        mr = layout.margin_right,
        mb = layout.margin_bottom,
        ml = layout.margin_left,
        cw = layout.content_width(),
        ch = layout.content_height(),
        hp = t.heading_px,
        bp = t.body_px,
        accent = t.accent_colour,
        content = card_body(segment, spec, layout),
    )
}

/// Structured markup in, PNG bytes out.
#[async_trait]
pub trait MarkupRasterizer: Send + Sync {
    async fn rasterize(&self, markup: &str, viewport: Viewport) -> Result<Vec<u8>, RenderError>;
}

/// Screenshots the document with a headless Chromium at a fixed viewport.
pub struct ChromiumRasterizer {
    binary: String,
}

impl ChromiumRasterizer {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

#[async_trait]
impl MarkupRasterizer for ChromiumRasterizer {
    async fn rasterize(&self, markup: &str, viewport: Viewport) -> Result<Vec<u8>, RenderError> {
        let workdir = tempfile::tempdir()?;
        let page = workdir.path().join("card.html");
        let shot = workdir.path().join("card.png");
        fs::write(&page, markup).await?;

        let output = Command::new(&self.binary)
            .args([
                "--headless",
                "--disable-gpu",
                "--no-sandbox",
                "--hide-scrollbars",
                "--force-device-scale-factor=1",
            ])
            .arg(format!("--window-size={},{}", viewport.width, viewport.height))
            .arg(format!("--screenshot={}", shot.display()))
            .arg(format!("file://{}", page.display()))
            .output()
            .await
            .map_err(|e| RenderError::Rasterizer(format!("{} not runnable: {}", self.binary, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RenderError::Rasterizer(format!(
                "{} exited with {}: {}",
                self.binary,
                output.status,
                stderr.chars().take(300).collect::<String>()
            )));
        }

        let bytes = fs::read(&shot).await?;
        if bytes.is_empty() {
            return Err(RenderError::EmptyImage);
        }
        Ok(bytes)
    }
}

/// A successfully rendered card, not yet placed on the timeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenderedCard {
    pub segment_ordinal: usize,
    pub segment_id: String,
    pub kind: CardKind,
    pub card_id: String,
    pub text: String,
    pub image_path: PathBuf,
}

fn file_safe(input: &str) -> String {
    input
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

pub fn card_id(segment: &Segment, kind: CardKind) -> String {
    let slug = match kind {
        CardKind::Title => "title".to_string(),
        CardKind::KeyPoint(i) => format!("keypoint{}", i + 1),
        CardKind::CallToAction => "cta".to_string(),
    };
    format!("{:02}_{}_{}", segment.ordinal, file_safe(&segment.id), slug)
}

pub struct OverlayRenderer {
    rasterizer: Arc<dyn MarkupRasterizer>,
    layout: CardLayout,
    out_dir: PathBuf,
}

impl OverlayRenderer {
    pub fn new(rasterizer: Arc<dyn MarkupRasterizer>, layout: CardLayout, out_dir: PathBuf) -> Self {
        Self {
            rasterizer,
            layout,
            out_dir,
        }
    }

    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    pub async fn render(&self, segment: &Segment, spec: &CardSpec) -> Result<RenderedCard, RenderError> {
        let markup = build_markup(segment, spec, &self.layout);
        let png = self.rasterizer.rasterize(&markup, self.layout.viewport).await?;
        if png.is_empty() {
            return Err(RenderError::EmptyImage);
        }

        fs::create_dir_all(&self.out_dir).await?;
        let id = card_id(segment, spec.kind);
        let image_path = self.out_dir.join(format!("{}.png", id));
        fs::write(&image_path, &png).await?;

        Ok(RenderedCard {
            segment_ordinal: segment.ordinal,
            segment_id: segment.id.clone(),
            kind: spec.kind,
            card_id: id,
            text: spec.text.clone(),
            image_path,
        })
    }

    /// Renders every card of the segment; failed cards are logged and left out.
    pub async fn render_all(&self, segment: &Segment) -> Vec<RenderedCard> {
        let mut cards = Vec::new();
        for spec in card_specs(segment) {
            match self.render(segment, &spec).await {
                Ok(card) => cards.push(card),
                Err(err) => logw(format!(
                    "Overlay {} for segment {} skipped: {}",
                    spec.kind.label(),
                    segment.ordinal,
                    err
                )),
            }
        }
        cards
    }
}
