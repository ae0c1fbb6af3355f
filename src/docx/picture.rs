//! Inline pictures: image probing and the DrawingML run that shows them.

use super::DocxError;
use image::{ImageFormat, ImageReader};
use quick_xml::escape::escape;
use std::io::Cursor;

/// English Metric Units per inch, the DrawingML length unit.
pub const EMU_PER_INCH: u64 = 914_400;

/// An encoded PNG or JPEG picture with its pixel size.
#[derive(Clone)]
pub struct InlineImage {
    pub bytes: Vec<u8>,
    pub width_px: u32,
    pub height_px: u32,
    pub format: ImageFormat,
}

impl std::fmt::Debug for InlineImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InlineImage")
            .field("format", &self.format)
            .field("width_px", &self.width_px)
            .field("height_px", &self.height_px)
            .field("len", &self.bytes.len())
            .finish()
    }
}

impl InlineImage {
    /// Probe `bytes` for format and dimensions without decoding pixels.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, DocxError> {
        let reader = ImageReader::new(Cursor::new(bytes.as_slice()))
            .with_guessed_format()
            .map_err(|e| DocxError(format!("cannot read image: {e}")))?;
        let format = reader
            .format()
            .ok_or_else(|| DocxError("unrecognised image format".into()))?;
        if !matches!(format, ImageFormat::Png | ImageFormat::Jpeg) {
            return Err(DocxError(format!(
                "unsupported image format {format:?} (expected PNG or JPEG)"
            )));
        }
        let (width_px, height_px) = reader
            .into_dimensions()
            .map_err(|e| DocxError(format!("cannot read image size: {e}")))?;
        if width_px == 0 || height_px == 0 {
            return Err(DocxError("image has zero width or height".into()));
        }
        Ok(Self {
            bytes,
            width_px,
            height_px,
            format,
        })
    }

    pub fn extension(&self) -> &'static str {
        match self.format {
            ImageFormat::Jpeg => "jpeg",
            _ => "png",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self.format {
            ImageFormat::Jpeg => "image/jpeg",
            _ => "image/png",
        }
    }

    /// Display size in EMU for a fixed width, keeping the aspect ratio.
    /// An image without a pixel width is shown square.
    pub fn extent_for_width(&self, width_emu: u64) -> (u64, u64) {
        let height = width_emu
            .checked_mul(u64::from(self.height_px))
            .and_then(|n| n.checked_div(u64::from(self.width_px)))
            .unwrap_or(width_emu);
        (width_emu, height.max(1))
    }
}

/// Display width in EMU for `inches`.
pub fn inches_to_emu(inches: f32) -> u64 {
    (f64::from(inches) * EMU_PER_INCH as f64).round() as u64
}

/// A `<w:r>` holding an inline picture that references relationship `rel_id`.
///
/// Namespaces are declared on the drawing itself so the run can be dropped
/// into any document, whatever its root element declares.
pub fn drawing_run(rel_id: &str, id: u32, cx: u64, cy: u64, name: &str) -> String {
    let name = escape(name);
    format!(
        concat!(
            r#"<w:r><w:drawing>"#,
            r#"<wp:inline distT="0" distB="0" distL="0" distR="0" "#,
            r#"xmlns:wp="http://schemas.openxmlformats.org/drawingml/2006/wordprocessingDrawing">"#,
            r#"<wp:extent cx="{cx}" cy="{cy}"/>"#,
            r#"<wp:docPr id="{id}" name="Picture {id}"/>"#,
            r#"<wp:cNvGraphicFramePr>"#,
            r#"<a:graphicFrameLocks xmlns:a="http://schemas.openxmlformats.org/drawingml/2006/main" noChangeAspect="1"/>"#,
            r#"</wp:cNvGraphicFramePr>"#,
            r#"<a:graphic xmlns:a="http://schemas.openxmlformats.org/drawingml/2006/main">"#,
            r#"<a:graphicData uri="http://schemas.openxmlformats.org/drawingml/2006/picture">"#,
            r#"<pic:pic xmlns:pic="http://schemas.openxmlformats.org/drawingml/2006/picture">"#,
            r#"<pic:nvPicPr><pic:cNvPr id="{id}" name="{name}"/><pic:cNvPicPr/></pic:nvPicPr>"#,
            r#"<pic:blipFill>"#,
            r#"<a:blip r:embed="{rel_id}" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships"/>"#,
            r#"<a:stretch><a:fillRect/></a:stretch>"#,
            r#"</pic:blipFill>"#,
            r#"<pic:spPr><a:xfrm><a:off x="0" y="0"/><a:ext cx="{cx}" cy="{cy}"/></a:xfrm>"#,
            r#"<a:prstGeom prst="rect"><a:avLst/></a:prstGeom></pic:spPr>"#,
            r#"</pic:pic></a:graphicData></a:graphic></wp:inline>"#,
            r#"</w:drawing></w:r>"#,
        ),
        cx = cx,
        cy = cy,
        id = id,
        name = name,
        rel_id = rel_id,
    )
}

#[cfg(test)]
pub(crate) fn png_fixture(width: u32, height: u32) -> Vec<u8> {
    let img = image::RgbImage::from_pixel(width, height, image::Rgb([200, 10, 10]));
    let mut buf = Vec::new();
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .unwrap();
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probes_png_dimensions() {
        let img = InlineImage::from_bytes(png_fixture(40, 20)).unwrap();
        assert_eq!((img.width_px, img.height_px), (40, 20));
        assert_eq!(img.extension(), "png");
        assert_eq!(img.content_type(), "image/png");
    }

    #[test]
    fn six_inch_extent_keeps_aspect_ratio() {
        let img = InlineImage::from_bytes(png_fixture(1700, 2200)).unwrap();
        let width = inches_to_emu(6.0);
        assert_eq!(width, 5_486_400);
        let (cx, cy) = img.extent_for_width(width);
        assert_eq!(cx, 5_486_400);
        assert_eq!(cy, 5_486_400 * 2200 / 1700);
    }

    #[test]
    fn extent_without_pixel_width_does_not_panic() {
        let img = InlineImage {
            bytes: Vec::new(),
            width_px: 0,
            height_px: 0,
            format: ImageFormat::Png,
        };
        assert_eq!(img.extent_for_width(100), (100, 100));
    }

    #[test]
    fn rejects_non_images() {
        assert!(InlineImage::from_bytes(b"%PDF-1.4".to_vec()).is_err());
    }

    #[test]
    fn drawing_run_is_well_formed() {
        let run = drawing_run("rId9", 3, 100, 50, "a&b.png");
        let el = crate::docx::xml::split_element(&run).unwrap();
        assert_eq!(el.name, "w:r");
        assert!(run.contains(r#"r:embed="rId9""#));
        assert!(run.contains(r#"<wp:docPr id="3""#));
        assert!(run.contains("a&amp;b.png"));
    }
}
