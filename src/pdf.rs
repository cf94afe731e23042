//! PDF utilities: page counting and image-to-PDF conversion.
//!
//! Page counts come from the document's page index; nothing is rendered.
//! Uploaded images are wrapped into a single-page PDF so the rest of the
//! pipeline only ever deals with PDFs.

use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use lopdf::{Document, Object, Stream, content::{Content, Operation}, dictionary};

use crate::prelude::*;

/// JPEG quality used when re-encoding uploaded images.
const JPEG_QUALITY: u8 = 90;

/// Count pages by reading the page index.
pub fn count_pages(bytes: &[u8]) -> Result<usize> {
    let doc = Document::load_mem(bytes).context("failed to parse PDF")?;
    Ok(doc.get_pages().len())
}

/// Wrap a single image (JPEG or PNG bytes) into a one-page PDF sized so
/// the image renders at `dpi`.
pub fn image_to_pdf(image_bytes: &[u8], dpi: u32) -> Result<Vec<u8>> {
    let decoded =
        image::load_from_memory(image_bytes).context("failed to decode image")?;
    let (width_px, height_px) = (decoded.width(), decoded.height());
    if width_px == 0 || height_px == 0 {
        return Err(anyhow!("image has zero dimensions"));
    }

    // Re-encode as JPEG so the PDF can embed the data directly (DCTDecode).
    let rgb = decoded.to_rgb8();
    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut Cursor::new(&mut jpeg), JPEG_QUALITY)
        .encode_image(&rgb)
        .context("failed to re-encode image as JPEG")?;

    let width_pt = width_px as f32 * 72.0 / dpi as f32;
    let height_pt = height_px as f32 * 72.0 / dpi as f32;

    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();

    let image_id = doc.add_object(Stream::new(
        dictionary! {
            "Type" => "XObject",
            "Subtype" => "Image",
            "Width" => width_px as i64,
            "Height" => height_px as i64,
            "ColorSpace" => "DeviceRGB",
            "BitsPerComponent" => 8i64,
            "Filter" => "DCTDecode",
        },
        jpeg,
    ));

    let content = Content {
        operations: vec![
            Operation::new("q", vec![]),
            Operation::new(
                "cm",
                vec![
                    Object::Real(width_pt),
                    Object::Real(0.0),
                    Object::Real(0.0),
                    Object::Real(height_pt),
                    Object::Real(0.0),
                    Object::Real(0.0),
                ],
            ),
            Operation::new("Do", vec![Object::Name(b"Im0".to_vec())]),
            Operation::new("Q", vec![]),
        ],
    };
    let content_id = doc.add_object(Stream::new(
        dictionary! {},
        content.encode().context("failed to encode content stream")?,
    ));

    let resources_id = doc.add_object(dictionary! {
        "XObject" => dictionary! { "Im0" => Object::Reference(image_id) },
    });
    let page_id = doc.add_object(dictionary! {
        "Type" => "Page",
        "Parent" => Object::Reference(pages_id),
        "MediaBox" => vec![
            Object::Integer(0),
            Object::Integer(0),
            Object::Real(width_pt),
            Object::Real(height_pt),
        ],
        "Contents" => Object::Reference(content_id),
        "Resources" => Object::Reference(resources_id),
    });
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => vec![Object::Reference(page_id)],
            "Count" => 1i64,
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => Object::Reference(pages_id),
    });
    doc.trailer.set("Root", catalog_id);

    let mut out = Vec::new();
    doc.save_to(&mut out).context("failed to serialize PDF")?;
    Ok(out)
}

/// Build a text-free PDF with `page_count` empty pages. Used by tests that
/// need a structurally valid document of a known size.
pub fn blank_pdf(page_count: usize) -> Result<Vec<u8>> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let kids: Vec<Object> = (0..page_count)
        .map(|_| {
            let content = Content {
                operations: vec![],
            };
            let content_id = doc.add_object(Stream::new(
                dictionary! {},
                content.encode().unwrap_or_default(),
            ));
            let page_id = doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => Object::Reference(pages_id),
                "MediaBox" => vec![
                    Object::Integer(0),
                    Object::Integer(0),
                    Object::Integer(595),
                    Object::Integer(842),
                ],
                "Contents" => Object::Reference(content_id),
                "Resources" => Object::Dictionary(dictionary! {}),
            });
            Object::Reference(page_id)
        })
        .collect();
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => page_count as i64,
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => Object::Reference(pages_id),
    });
    doc.trailer.set("Root", catalog_id);

    let mut out = Vec::new();
    doc.save_to(&mut out).context("failed to serialize PDF")?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use image::{Rgb, RgbImage};

    use super::*;

    #[test]
    fn test_count_pages() {
        let pdf = blank_pdf(3).unwrap();
        assert_eq!(count_pages(&pdf).unwrap(), 3);
    }

    #[test]
    fn test_count_pages_rejects_garbage() {
        assert!(count_pages(b"not a pdf").is_err());
    }

    #[test]
    fn test_image_to_pdf_single_page() {
        let mut img = RgbImage::new(20, 10);
        for pixel in img.pixels_mut() {
            *pixel = Rgb([250, 250, 250]);
        }
        let mut png = Vec::new();
        img.write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();

        let pdf = image_to_pdf(&png, 300).unwrap();
        assert_eq!(count_pages(&pdf).unwrap(), 1);
    }

    #[test]
    fn test_image_to_pdf_rejects_garbage() {
        assert!(image_to_pdf(b"\x00\x01\x02", 300).is_err());
    }
}
