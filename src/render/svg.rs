//! SVG render backend built on resvg

use std::collections::HashMap;
use std::path::Path;

use image::RgbaImage;
use log::{debug, warn};
use rayon::prelude::*;
use resvg::tiny_skia::{Color, Pixmap, Transform};
use resvg::usvg;

use crate::geometry::{PointF, RectF, SizeF};
use crate::page::{Link, Page, PageId, PageSource};

use super::backend::{BackendError, RenderBackend, TargetSize, VectorFormat};

/// CSS pixels per inch, the unit of SVG user space
pub const SVG_DPI: f64 = 96.0;

const XLINK_NS: &str = "http://www.w3.org/1999/xlink";

struct SvgPage {
    tree: usvg::Tree,
    /// `<text>` contents anchored at their intrinsic position
    text: Vec<(PointF, String)>,
}

/// Renders SVG documents, one document per page
#[derive(Default)]
pub struct SvgBackend {
    pages: HashMap<PageId, SvgPage>,
    next_id: u64,
}

impl SvgBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load an SVG file as a new page
    pub fn open(&mut self, path: &Path) -> Result<Page, BackendError> {
        let data = std::fs::read(path)
            .map_err(|e| BackendError::generic(format!("failed to read {}: {e}", path.display())))?;
        let mut options = usvg::Options::default();
        if let Some(dir) = path.parent() {
            options.resources_dir = Some(dir.to_path_buf());
        }
        self.add_page_with(&data, options)
    }

    /// Parse SVG data as a new page
    pub fn add_page(&mut self, data: &[u8]) -> Result<Page, BackendError> {
        self.add_page_with(data, usvg::Options::default())
    }

    fn add_page_with(&mut self, data: &[u8], mut options: usvg::Options<'_>) -> Result<Page, BackendError> {
        if svg_needs_fonts(data) {
            options.fontdb_mut().load_system_fonts();
        }
        let tree = usvg::Tree::from_data(data, &options)
            .map_err(|e| BackendError::generic(format!("invalid SVG: {e}")))?;
        let size = SizeF::new(f64::from(tree.size().width()), f64::from(tree.size().height()));

        let id = PageId(self.next_id);
        self.next_id += 1;
        let (links, text) = match std::str::from_utf8(data).map(roxmltree::Document::parse) {
            Ok(Ok(doc)) => (extract_links(&doc, size), extract_text(&doc, size)),
            Ok(Err(e)) => {
                warn!("Cannot scan SVG for links: {e}");
                (Vec::new(), Vec::new())
            }
            Err(_) => (Vec::new(), Vec::new()),
        };
        debug!(
            "Loaded SVG {id}: {}x{}, {} links, {} text fragments",
            size.width,
            size.height,
            links.len(),
            text.len()
        );

        let page = Page::new(id, size, SVG_DPI)
            .map_err(|e| BackendError::generic(e.to_string()))?
            .with_links(links);
        self.pages.insert(id, SvgPage { tree, text });
        Ok(page)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    fn page(&self, id: PageId) -> Result<&SvgPage, BackendError> {
        self.pages.get(&id).ok_or(BackendError::UnknownPage(id))
    }
}

impl RenderBackend for SvgBackend {
    fn render_region(
        &self,
        page: &PageSource,
        rect: RectF,
        target: TargetSize,
    ) -> Result<RgbaImage, BackendError> {
        let svg = self.page(page.id)?;
        if rect.is_empty() {
            return Err(BackendError::generic(format!("empty render area {rect:?}")));
        }
        let mut pixmap = Pixmap::new(target.width, target.height)
            .ok_or_else(|| BackendError::generic(format!("cannot allocate {target} pixmap")))?;
        pixmap.fill(Color::WHITE);

        let scale_x = f64::from(target.width) / rect.width;
        let scale_y = f64::from(target.height) / rect.height;
        let transform = Transform::from_translate(-rect.x as f32, -rect.y as f32)
            .post_scale(scale_x as f32, scale_y as f32);
        resvg::render(&svg.tree, transform, &mut pixmap.as_mut());

        let mut rgba = pixmap.take();
        unpremultiply_rgba(&mut rgba);
        RgbaImage::from_raw(target.width, target.height, rgba)
            .ok_or_else(|| BackendError::generic("pixmap size mismatch"))
    }

    fn vector_output(
        &self,
        page: &PageSource,
        format: VectorFormat,
        rect: RectF,
    ) -> Result<Vec<u8>, BackendError> {
        let svg = self.page(page.id)?;
        if format != VectorFormat::Svg {
            return Err(BackendError::UnsupportedFormat {
                format: format.as_str(),
            });
        }

        let body = svg.tree.to_string(&usvg::WriteOptions::default());
        let body = match body.strip_prefix("<?xml") {
            Some(rest) => rest.split_once("?>").map_or(rest, |(_, b)| b).trim_start(),
            None => body.as_str(),
        };
        let (x, y, w, h) = (rect.x, rect.y, rect.width, rect.height);
        Ok(format!(
            r#"<svg xmlns="http://www.w3.org/2000/svg" width="{w}" height="{h}" viewBox="{x} {y} {w} {h}">{body}</svg>"#
        )
        .into_bytes())
    }

    fn text(&self, page: &PageSource, rect: RectF) -> Result<String, BackendError> {
        let svg = self.page(page.id)?;
        let found: Vec<&str> = svg
            .text
            .iter()
            .filter(|(anchor, _)| rect.contains(*anchor))
            .map(|(_, text)| text.as_str())
            .collect();
        Ok(found.join("\n"))
    }
}

fn svg_needs_fonts(svg_data: &[u8]) -> bool {
    let svg_text = String::from_utf8_lossy(svg_data);
    svg_text.contains("<text") || svg_text.contains("font-family")
}

fn unpremultiply_rgba(data: &mut [u8]) {
    data.par_chunks_mut(4).for_each(|pixel| {
        let alpha = pixel[3];
        if alpha == 0 {
            pixel[0] = 0;
            pixel[1] = 0;
            pixel[2] = 0;
            return;
        }
        let a = u32::from(alpha);
        pixel[0] = ((u32::from(pixel[0]) * 255 + a / 2) / a).min(255) as u8;
        pixel[1] = ((u32::from(pixel[1]) * 255 + a / 2) / a).min(255) as u8;
        pixel[2] = ((u32::from(pixel[2]) * 255 + a / 2) / a).min(255) as u8;
    });
}

/// Links from `<a>` elements wrapping `<rect>`s.
///
/// Transforms are ignored. `#page=N` targets become internal links to the
/// one-based page N.
fn extract_links(doc: &roxmltree::Document<'_>, size: SizeF) -> Vec<Link> {
    let view = view_box(doc, size);
    if view.is_empty() {
        return Vec::new();
    }

    let mut links = Vec::new();
    for anchor in doc.descendants().filter(|n| n.has_tag_name("a")) {
        let Some(href) = anchor
            .attribute("href")
            .or_else(|| anchor.attribute((XLINK_NS, "href")))
        else {
            continue;
        };
        for rect in anchor.descendants().filter(|n| n.has_tag_name("rect")) {
            let number = |name: &str| rect.attribute(name).and_then(parse_length);
            let (Some(x), Some(y), Some(w), Some(h)) =
                (number("x").or(Some(0.0)), number("y").or(Some(0.0)), number("width"), number("height"))
            else {
                continue;
            };
            let area = RectF::new(
                (x - view.x) / view.width,
                (y - view.y) / view.height,
                w / view.width,
                h / view.height,
            );
            let link = match href.strip_prefix("#page=").and_then(|n| n.parse::<usize>().ok()) {
                Some(n) if n > 0 => Link::internal(area, n - 1),
                _ => Link::url(area, href),
            };
            links.push(link);
        }
    }
    links
}

/// Text of `<text>` elements, anchored at their `x`/`y` in page units.
///
/// Transforms are ignored, as for links.
fn extract_text(doc: &roxmltree::Document<'_>, size: SizeF) -> Vec<(PointF, String)> {
    let view = view_box(doc, size);
    if view.is_empty() {
        return Vec::new();
    }
    doc.descendants()
        .filter(|n| n.has_tag_name("text"))
        .filter_map(|node| {
            let content: String = node
                .descendants()
                .filter(|n| n.is_text())
                .filter_map(|n| n.text())
                .collect();
            let content = content.trim();
            if content.is_empty() {
                return None;
            }
            let number = |name: &str| node.attribute(name).and_then(parse_length).unwrap_or(0.0);
            let anchor = PointF::new(
                (number("x") - view.x) / view.width * size.width,
                (number("y") - view.y) / view.height * size.height,
            );
            Some((anchor, content.to_string()))
        })
        .collect()
}

fn view_box(doc: &roxmltree::Document<'_>, size: SizeF) -> RectF {
    doc.root_element()
        .attribute("viewBox")
        .and_then(parse_view_box)
        .unwrap_or(RectF::new(0.0, 0.0, size.width, size.height))
}

fn parse_length(value: &str) -> Option<f64> {
    value.trim().trim_end_matches("px").parse().ok()
}

fn parse_view_box(value: &str) -> Option<RectF> {
    let nums: Vec<f64> = value
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|s| !s.is_empty())
        .map(str::parse)
        .collect::<Result<_, _>>()
        .ok()?;
    match nums[..] {
        [x, y, w, h] => Some(RectF::new(x, y, w, h)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r##"<svg xmlns="http://www.w3.org/2000/svg" xmlns:xlink="http://www.w3.org/1999/xlink" width="200" height="100" viewBox="0 0 200 100">
  <rect x="0" y="0" width="100" height="100" fill="#ff0000"/>
  <a href="https://example.org/manual.pdf"><rect x="150" y="50" width="20" height="10" fill="#0000ff"/></a>
  <a xlink:href="#page=3"><rect x="0" y="0" width="10" height="10" fill="none"/></a>
</svg>"##;

    #[test]
    fn loads_page_with_links() {
        let mut backend = SvgBackend::new();
        let page = backend.add_page(DOC.as_bytes()).unwrap();
        assert_eq!(page.intrinsic_size(), SizeF::new(200.0, 100.0));
        assert_eq!(page.dpi(), SVG_DPI);

        let links: Vec<&Link> = page.links().iter().collect();
        assert_eq!(links.len(), 2);
        assert_eq!(links[0].url.as_deref(), Some("https://example.org/manual.pdf"));
        assert_eq!(links[0].area, RectF::new(0.75, 0.5, 0.1, 0.1));
        assert_eq!(links[1].target_page, Some(2));
    }

    #[test]
    fn renders_requested_region() {
        let mut backend = SvgBackend::new();
        let page = backend.add_page(DOC.as_bytes()).unwrap();

        let image = backend
            .render_region(page.source(), RectF::new(0.0, 0.0, 100.0, 100.0), TargetSize::new(50, 50))
            .unwrap();
        assert_eq!(image.dimensions(), (50, 50));
        assert_eq!(image.get_pixel(25, 25).0, [255, 0, 0, 255]);

        let image = backend
            .render_region(page.source(), RectF::new(100.0, 0.0, 40.0, 40.0), TargetSize::new(40, 40))
            .unwrap();
        assert_eq!(image.get_pixel(20, 20).0, [255, 255, 255, 255]);
    }

    #[test]
    fn svg_export_crops_to_rect() {
        let mut backend = SvgBackend::new();
        let page = backend.add_page(DOC.as_bytes()).unwrap();
        let bytes = backend
            .vector_output(page.source(), VectorFormat::Svg, RectF::new(10.0, 0.0, 50.0, 50.0))
            .unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("<svg"));
        assert!(text.contains(r#"viewBox="10 0 50 50""#));

        let err = backend
            .vector_output(page.source(), VectorFormat::Pdf, RectF::new(0.0, 0.0, 1.0, 1.0))
            .unwrap_err();
        assert!(matches!(err, BackendError::UnsupportedFormat { .. }));
    }

    #[test]
    fn text_inside_rect() {
        const LABELS: &str = r#"<svg xmlns="http://www.w3.org/2000/svg" width="200" height="100" viewBox="0 0 400 200">
  <text x="20" y="40">Overture</text>
  <text x="300" y="160"><tspan>Coda</tspan></text>
</svg>"#;
        let mut backend = SvgBackend::new();
        let page = backend.add_page(LABELS.as_bytes()).unwrap();

        let left = backend.text(page.source(), RectF::new(0.0, 0.0, 100.0, 100.0)).unwrap();
        assert_eq!(left, "Overture");
        let all = backend.text(page.source(), RectF::new(0.0, 0.0, 200.0, 100.0)).unwrap();
        assert_eq!(all, "Overture\nCoda");
        let none = backend.text(page.source(), RectF::new(50.0, 0.0, 20.0, 20.0)).unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn unknown_page_fails() {
        let backend = SvgBackend::new();
        let source = PageSource {
            id: PageId(9),
            intrinsic_size: SizeF::new(1.0, 1.0),
            dpi: SVG_DPI,
        };
        let err = backend
            .render_region(&source, RectF::new(0.0, 0.0, 1.0, 1.0), TargetSize::new(1, 1))
            .unwrap_err();
        assert!(matches!(err, BackendError::UnknownPage(PageId(9))));
    }
}
