//! Image reference reconstruction.
//!
//! MediaWiki renders an image as a nest of thumb divs, anchors and magnify
//! chrome. The target content model wants a flat
//! `<span class="image_frame">` holding the `<img>` and an optional caption
//! span, with the binary attached to the page under `_files/`.

use anyhow::Result;
use log::{info, warn};

use crate::api::WikiApi;
use crate::forest::{Element, Forest};
use crate::passes::unquote_url;
use crate::store::SharedStore;

/// Rewrites every reference to one image into the target span shape.
///
/// Three wrapper shapes occur: a thumb div (caption and float classes live
/// on it), a floated plain div, and a bare anchor. The whole wrapper is
/// replaced in place so the rewrite slots into the surrounding flow.
pub fn fix_image_html(forest: &mut Forest, quoted_image_title: &str, filename: &str, border: bool) {
    for root in forest.root_elements_mut() {
        rewrite_references(root, quoted_image_title, filename, border);
    }
}

fn rewrite_references(element: &mut Element, quoted_title: &str, filename: &str, border: bool) {
    let is_thumb_wrapper = element.tag == "div"
        && ((element.has_class("thumb") && find_matching_anchor(element, quoted_title).is_some())
            || element
                .children
                .iter()
                .any(|child| anchor_matches(child, quoted_title) && holds_thumb_image(child)));
    if is_thumb_wrapper {
        rewrite_thumb(element, quoted_title, filename, border);
        return;
    }
    if has_float_class(element)
        && let Some(anchor) = element
            .children
            .iter()
            .find(|child| anchor_matches(child, quoted_title))
    {
        let float = float_class(element);
        let anchor = anchor.clone();
        build_image_span(element, &anchor, filename, border, float, None);
        return;
    }
    if anchor_matches(element, quoted_title) {
        let anchor = element.clone();
        build_image_span(element, &anchor, filename, border, None, None);
        return;
    }
    for child in &mut element.children {
        rewrite_references(child, quoted_title, filename, border);
    }
}

/// An image reference is an anchor whose percent-decoded href ends with
/// the image's quoted title, holding the `<img>` as a direct child.
fn anchor_matches(element: &Element, quoted_title: &str) -> bool {
    element.tag == "a"
        && element
            .attr("href")
            .map(|href| unquote_url(href).ends_with(quoted_title))
            .unwrap_or(false)
        && element.children.iter().any(|child| child.tag == "img")
}

fn holds_thumb_image(anchor: &Element) -> bool {
    anchor
        .children
        .iter()
        .any(|child| child.tag == "img" && child.has_class("thumbimage"))
}

fn find_matching_anchor<'a>(element: &'a Element, quoted_title: &str) -> Option<&'a Element> {
    if anchor_matches(element, quoted_title) {
        return Some(element);
    }
    element.find_descendant(&|candidate| anchor_matches(candidate, quoted_title))
}

fn has_float_class(element: &Element) -> bool {
    element.has_class("floatright") || element.has_class("floatleft") || element.has_class("floatnone")
}

fn float_class(element: &Element) -> Option<&'static str> {
    if element.has_class("floatright") {
        Some("image_right")
    } else if element.has_class("floatleft") {
        Some("image_left")
    } else {
        None
    }
}

fn rewrite_thumb(wrapper: &mut Element, quoted_title: &str, filename: &str, border: bool) {
    let Some(anchor) = find_matching_anchor(wrapper, quoted_title).cloned() else {
        return;
    };
    let float = if wrapper.has_class("tright") || wrapper.has_class("floatright") {
        Some("image_right")
    } else if wrapper.has_class("tleft") || wrapper.has_class("floatleft") {
        Some("image_left")
    } else {
        None
    };
    let caption = wrapper
        .find_descendant(&|candidate| candidate.tag == "div" && candidate.has_class("thumbcaption"))
        .cloned()
        .and_then(clean_thumb_caption);
    build_image_span(wrapper, &anchor, filename, border, float, caption);
}

/// Strips the magnify chrome from a thumb caption, folding its tail text
/// back in. MediaWiki emits the caption div even for captionless images,
/// so an empty result means no caption at all.
fn clean_thumb_caption(mut caption: Element) -> Option<Element> {
    if let Some(position) = caption
        .children
        .iter()
        .position(|child| child.tag == "div" && child.has_class("magnify"))
    {
        let magnify = caption.children.remove(position);
        caption.text.push_str(&magnify.tail);
    }
    if caption.is_effectively_empty() {
        return None;
    }
    Some(caption)
}

fn build_image_span(
    wrapper: &mut Element,
    anchor: &Element,
    filename: &str,
    border: bool,
    float: Option<&str>,
    caption: Option<Element>,
) {
    let (width, height) = anchor
        .children
        .iter()
        .find(|child| child.tag == "img")
        .map(|img| {
            (
                img.attr("width").map(str::to_string),
                img.attr("height").map(str::to_string),
            )
        })
        .unwrap_or((None, None));

    let mut classes = String::from("image_frame");
    if border {
        classes.push_str(" image_frame_border");
    }
    if let Some(float) = float {
        classes.push(' ');
        classes.push_str(float);
    }

    wrapper.clear();
    wrapper.tag = "span".to_string();
    wrapper.set_attr("class", &classes);

    let mut img = Element::new("img");
    img.set_attr("src", &format!("_files/{filename}"));
    if let (Some(width), Some(height)) = (&width, &height) {
        img.set_attr("style", &format!("width: {width}px; height: {height}px;"));
    }
    wrapper.children.push(img);

    if let Some(mut caption) = caption {
        caption.tag = "span".to_string();
        caption.attrs.clear();
        caption.set_attr("class", "image_caption");
        if let Some(width) = &width {
            caption.set_attr("style", &format!("width: {width}px;"));
        }
        caption.tail.clear();
        wrapper.children.push(caption);
    }
}

/// Replaces every gallery table with a flat paragraph of image spans,
/// moving each gallery text caption into its image span. Runs after the
/// image rewrite, so gallery entries are already `image_frame` spans.
pub fn flatten_galleries(forest: &mut Forest) {
    for root in forest.root_elements_mut() {
        flatten_in(root);
    }
}

fn flatten_in(element: &mut Element) {
    if element.tag == "table" && element.has_class("gallery") {
        flatten_gallery(element);
        return;
    }
    for child in &mut element.children {
        flatten_in(child);
    }
}

fn flatten_gallery(table: &mut Element) {
    let mut images = Vec::new();
    collect_gallery_boxes(table, &mut images);
    if images.is_empty() {
        // No box structure; salvage any bare image spans.
        collect_bare_image_spans(table, &mut images);
    }
    if images.is_empty() {
        table.mark_removed();
        return;
    }
    table.clear();
    table.tag = "p".to_string();
    table.children = images;
}

fn collect_gallery_boxes(element: &Element, out: &mut Vec<Element>) {
    for child in &element.children {
        if child.has_class("gallerybox") {
            let caption_div = child
                .find_descendant(&|e| e.tag == "div" && e.has_class("gallerytext"))
                .cloned();
            if let Some(image) = child.find_descendant(&is_image_frame) {
                let mut image = image.clone();
                if let Some(caption_div) = &caption_div
                    && let Some(caption) = gallery_caption(&image, caption_div)
                {
                    image.children.push(caption);
                }
                image.tail.clear();
                out.push(image);
            }
            continue;
        }
        collect_gallery_boxes(child, out);
    }
}

fn collect_bare_image_spans(element: &Element, out: &mut Vec<Element>) {
    for child in &element.children {
        if is_image_frame(child) {
            let mut image = child.clone();
            image.tail.clear();
            out.push(image);
            continue;
        }
        collect_bare_image_spans(child, out);
    }
}

fn is_image_frame(element: &Element) -> bool {
    element.tag == "span" && element.has_class("image_frame")
}

/// Builds a caption span from the gallery text, sized to the image width
/// taken off the image's style. The gallery text wraps its content in a
/// paragraph we do not want.
fn gallery_caption(image: &Element, caption_div: &Element) -> Option<Element> {
    let img = image.children.iter().find(|child| child.tag == "img")?;
    let style = img.attr("style")?;
    let width = style
        .split(';')
        .map(str::trim)
        .find(|prop| prop.starts_with("width:"))?;
    let mut caption = Element::new("span");
    caption.set_attr("class", "image_caption");
    caption.set_attr("style", &format!("{width};"));
    let source = caption_div
        .children
        .iter()
        .find(|child| child.tag == "p")
        .unwrap_or(caption_div);
    caption.text = source.text.clone();
    caption.children = source.children.clone();
    Some(caption)
}

/// Extracts the page name from a description URL; wikis use either pretty
/// urls or `?title=`.
pub fn page_url_to_name(page_url: &str) -> String {
    if let Some((_, rest)) = page_url.split_once("?title=") {
        return rest.split(['&', '#']).next().unwrap_or(rest).to_string();
    }
    let path = page_url.split(['?', '#']).next().unwrap_or("");
    path.rsplit('/').next().unwrap_or("").to_string()
}

/// Attaches every image actually referenced on the page and rewrites its
/// HTML. Images the API lists but the rendered HTML never references are
/// left alone, as are images whose info lookup fails.
pub fn resolve_images(
    forest: &mut Forest,
    api: &mut dyn WikiApi,
    store: &SharedStore,
    page_id: i64,
    page_name: &str,
    attach_to: Option<&str>,
    show_image_borders: bool,
) -> Result<()> {
    let image_titles = api.list_images(page_id)?;
    let attach_to = attach_to.unwrap_or(page_name);
    for image_title in image_titles {
        let filename = image_title
            .strip_prefix("File:")
            .unwrap_or(&image_title)
            .to_string();
        let image_info = match api.image_info(&image_title) {
            Ok(image_info) => image_info,
            Err(error) => {
                warn!("no image info for {image_title}, skipping: {error}");
                continue;
            }
        };
        let quoted_title = page_url_to_name(&image_info.description_url);

        if store.file_exists(attach_to, &filename)? {
            continue;
        }

        // The query API lists images that templates pulled in but the page
        // never shows. Only a reference that the rewrite actually touched
        // earns an attachment.
        let html_before_fix = forest.to_html();
        fix_image_html(forest, &quoted_title, &filename, show_image_borders);
        if forest.to_html() == html_before_fix {
            continue;
        }

        let content = match api.fetch_binary(&image_info.url) {
            Ok(content) => content,
            Err(error) => {
                warn!("failed to download {}, skipping: {error}", image_info.url);
                continue;
            }
        };
        info!("attaching {filename} to {attach_to}");
        store.attach_file(attach_to, &filename, &content)?;
    }
    Ok(())
}
