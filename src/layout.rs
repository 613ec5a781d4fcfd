//! Placement of the floating menu, launcher and windows inside the viewport.
//!
//! Pure geometry: the host reports rectangles, we answer with a
//! [`LayoutPlan`] and the host applies it.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::document::Document;

pub const MENU_ID: &str = "uie-main-menu";
pub const LAUNCHER_ID: &str = "uie-launcher";

const MENU_PAD: f64 = 10.0;
const LAUNCHER_PAD: f64 = 6.0;
const WINDOW_MARGIN: f64 = 100.0;
const MOBILE_WIDTH: f64 = 800.0;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Viewport {
    pub width: f64,
    pub height: f64,
    #[serde(default)]
    pub touch: bool,
}

impl Viewport {
    pub fn is_mobile(&self) -> bool {
        self.width < MOBILE_WIDTH || self.touch
    }

    fn is_usable(&self) -> bool {
        self.width > 0.0 && self.height > 0.0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn right(&self) -> f64 {
        self.left + self.width
    }

    pub fn bottom(&self) -> f64 {
        self.top + self.height
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Placement {
    pub id: String,
    pub left: f64,
    pub top: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayoutPlan {
    pub scale: f64,
    pub launcher_hidden: bool,
    pub placements: Vec<Placement>,
}

/// UI scale from the document, clamped to [0.5, 1.5].
pub fn ui_scale(doc: &Document) -> f64 {
    let raw = doc
        .get("ui")
        .and_then(|ui| ui.get("scale"))
        .or_else(|| doc.get("uiScale"))
        .and_then(Value::as_f64)
        .filter(|s| s.is_finite())
        .unwrap_or(1.0);
    raw.clamp(0.5, 1.5)
}

/// New top-left corner for an element lying wholly outside the viewport,
/// or `None` when it is (partly) visible.
pub fn clamp_offscreen(rect: &Rect, viewport: &Viewport, pad: f64, fallback: (f64, f64)) -> Option<(f64, f64)> {
    if !viewport.is_usable() {
        return None;
    }
    let out = rect.right() < pad
        || rect.bottom() < pad
        || rect.left > viewport.width - pad
        || rect.top > viewport.height - pad;
    if !out {
        return None;
    }

    let w = if rect.width > 0.0 { rect.width } else { fallback.0 };
    let h = if rect.height > 0.0 { rect.height } else { fallback.1 };
    let mut left = if rect.left.is_finite() { rect.left } else { pad };
    let mut top = if rect.top.is_finite() { rect.top } else { pad };
    left = left.max(pad);
    top = top.max(pad);
    if left > viewport.width - w - pad {
        left = viewport.width - w - pad;
    }
    if top > viewport.height - h - pad {
        top = viewport.height - h - pad;
    }
    Some((left, top))
}

pub fn clamp_menu(id: &str, rect: &Rect, viewport: &Viewport) -> Option<Placement> {
    clamp_offscreen(rect, viewport, MENU_PAD, (320.0, 420.0)).map(|(left, top)| Placement {
        id: id.to_string(),
        left,
        top,
    })
}

fn launcher_hidden(doc: &Document) -> bool {
    doc.get("launcher")
        .and_then(|l| l.get("hidden"))
        .and_then(Value::as_bool)
        == Some(true)
}

fn clamp_launcher(rect: &Rect, viewport: &Viewport) -> Option<Placement> {
    clamp_offscreen(rect, viewport, LAUNCHER_PAD, (60.0, 60.0)).map(|(left, top)| Placement {
        id: LAUNCHER_ID.to_string(),
        left,
        top,
    })
}

/// Only pull the menu and launcher back when they ended up off-screen.
/// `None` when nothing needs to move.
pub fn clamp_floating(
    doc: &Document,
    viewport: &Viewport,
    menu: Option<Rect>,
    launcher: Option<Rect>,
) -> Option<LayoutPlan> {
    let hidden = launcher_hidden(doc);
    let mut placements = Vec::new();
    if let Some(p) = menu.and_then(|rect| clamp_menu(MENU_ID, &rect, viewport)) {
        placements.push(p);
    }
    if !hidden {
        if let Some(p) = launcher.and_then(|rect| clamp_launcher(&rect, viewport)) {
            placements.push(p);
        }
    }
    if placements.is_empty() {
        return None;
    }
    Some(LayoutPlan {
        scale: ui_scale(doc),
        launcher_hidden: hidden,
        placements,
    })
}

/// Full layout pass: scale, launcher visibility and clamping, saved window
/// positions (desktop only).
pub fn compute_layout(doc: &Document, viewport: &Viewport, launcher: Option<Rect>) -> LayoutPlan {
    let scale = ui_scale(doc);
    let launcher_hidden = launcher_hidden(doc);

    let mut placements = Vec::new();

    if !launcher_hidden {
        if let Some(p) = launcher.and_then(|rect| clamp_launcher(&rect, viewport)) {
            placements.push(p);
        }
    }

    if !viewport.is_mobile() {
        if let Some(windows) = doc.get("windows").and_then(Value::as_object) {
            for (id, pos) in windows {
                let (Some(top), Some(left)) = (
                    pos.get("top").and_then(Value::as_f64),
                    pos.get("left").and_then(Value::as_f64),
                ) else {
                    continue;
                };
                let left = left.min(viewport.width - WINDOW_MARGIN).max(0.0);
                let top = top.min(viewport.height - WINDOW_MARGIN).max(0.0);
                placements.push(Placement {
                    id: id.clone(),
                    left,
                    top,
                });
            }
        }
    }

    LayoutPlan {
        scale,
        launcher_hidden,
        placements,
    }
}
