//! Annotated frames: the streaming pipeline's output to the rendering layer.

use ab_glyph::{FontRef, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use serde::Serialize;
use sightline_core::BoundingBox;
use std::sync::OnceLock;

pub const MATCHED_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
pub const UNKNOWN_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const LABEL_TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);

const BOX_THICKNESS: i32 = 2;
const LABEL_BAND_HEIGHT: i32 = 35;
/// Offset of the label baseline from the band's bottom-left corner.
const LABEL_INSET: i32 = 6;
const LABEL_SCALE: f32 = 24.0;

static LABEL_FONT_DATA: &[u8] = include_bytes!("../assets/DejaVuSans.ttf");
static LABEL_FONT: OnceLock<Option<FontRef<'static>>> = OnceLock::new();

fn label_font() -> Option<&'static FontRef<'static>> {
    LABEL_FONT
        .get_or_init(|| match FontRef::try_from_slice(LABEL_FONT_DATA) {
            Ok(font) => Some(font),
            Err(e) => {
                tracing::warn!(error = %e, "label font unusable; frames will carry boxes only");
                None
            }
        })
        .as_ref()
}

/// One recognised (or unknown) face on a frame, in full-frame coordinates.
#[derive(Debug, Clone, Serialize)]
pub struct Annotation {
    pub bbox: BoundingBox,
    pub label: String,
    pub matched: bool,
    pub distance: Option<f32>,
}

/// A full-resolution frame with its annotations already drawn.
#[derive(Clone)]
pub struct AnnotatedFrame {
    pub image: RgbImage,
    pub annotations: Vec<Annotation>,
    pub sequence: u32,
}

/// `[x0, x1) x [y0, y1)` as a drawable rect, or `None` when empty.
fn span(x0: i32, y0: i32, x1: i32, y1: i32) -> Option<Rect> {
    (x1 > x0 && y1 > y0).then(|| Rect::at(x0, y0).of_size((x1 - x0) as u32, (y1 - y0) as u32))
}

/// Draw a box around each face, a filled band along its bottom edge and
/// the label inside the band.
pub fn draw_annotations(image: &mut RgbImage, annotations: &[Annotation]) {
    let font = label_font();
    let scale = PxScale::from(LABEL_SCALE);

    for a in annotations {
        let color = if a.matched { MATCHED_COLOR } else { UNKNOWN_COLOR };
        let x0 = a.bbox.x.round() as i32;
        let y0 = a.bbox.y.round() as i32;
        let x1 = (a.bbox.x + a.bbox.width).round() as i32;
        let y1 = (a.bbox.y + a.bbox.height).round() as i32;

        for inset in 0..BOX_THICKNESS {
            if let Some(rect) = span(x0 + inset, y0 + inset, x1 - inset, y1 - inset) {
                draw_hollow_rect_mut(image, rect, color);
            }
        }

        let band_top = (y1 - LABEL_BAND_HEIGHT).max(y0);
        if let Some(band) = span(x0, band_top, x1, y1) {
            draw_filled_rect_mut(image, band, color);
        }

        if let Some(font) = font {
            let text_top = (y1 - LABEL_INSET - LABEL_SCALE as i32).max(band_top);
            let text_left = x0 + LABEL_INSET;
            draw_text_mut(image, LABEL_TEXT_COLOR, text_left, text_top, scale, font, &a.label);
        }
    }
}
