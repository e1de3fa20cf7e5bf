//! Structural normalizer passes.
//!
//! Each pass walks the forest and mutates it in place, optionally marking
//! elements for removal; the caller sweeps at the points the chain order
//! requires (see `pipeline::process_html`). The order of the chain is
//! load-bearing: link rewriting must not run before image resolution, and
//! div conversion must run after every pass that recognizes divs.

use log::debug;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};
use reqwest::Url;

use crate::config::SiteContext;
use crate::forest::{Element, Forest};
use crate::records::{MapData, SideChannels};

/// Mirrors urllib-style quoting: alphanumerics and `_.-~/` pass through.
const PAGE_NAME_ENCODE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'_')
    .remove(b'.')
    .remove(b'-')
    .remove(b'~')
    .remove(b'/');

pub fn quote_page_name(name: &str) -> String {
    utf8_percent_encode(name, PAGE_NAME_ENCODE).to_string()
}

pub fn unquote_url(value: &str) -> String {
    percent_decode_str(value).decode_utf8_lossy().into_owned()
}

/// Maps wiki namespaces onto the target page tree.
pub fn fix_pagename(name: &str) -> String {
    if let Some(rest) = name.strip_prefix("Talk:") {
        return format!("{rest}/Talk");
    }
    if let Some(rest) = name.strip_prefix("User:") {
        return format!("Users/{rest}");
    }
    if let Some(rest) = name.strip_prefix("User talk:") {
        return format!("Users/{rest}/Talk");
    }
    if let Some(rest) = name.strip_prefix("Category talk:") {
        return format!("{rest}/Talk");
    }
    if let Some(rest) = name.strip_prefix("Category:") {
        // Categories land in the main namespace; tags carry the grouping.
        return rest.to_string();
    }
    name.to_string()
}

/// Recovers the page name from a broken-link title of the form
/// `"Name (page does not exist)"`: cut at the last `(` and drop one
/// preceding character.
pub fn broken_link_page_name(title: &str) -> String {
    match title.rfind('(') {
        Some(index) => {
            let head = &title[..index];
            match head.char_indices().next_back() {
                Some((cut, _)) => head[..cut].to_string(),
                None => String::new(),
            }
        }
        None => title.to_string(),
    }
}

fn is_fragment_href(element: &Element) -> bool {
    element.tag == "a"
        && element
            .attr("href")
            .map(|href| href.starts_with('#'))
            .unwrap_or(false)
}

/// Rewrites citation list items: the backlink markup (`↑`, `#cite`
/// anchors and their `<sup>` wrappers) is removed and replaced with a
/// plain named anchor followed by the citation text.
pub fn fix_references(forest: &mut Forest) {
    forest.visit_elements_mut(&mut |element| {
        if element.tag != "li" {
            return;
        }
        let Some(id) = element.attr("id").map(str::to_string) else {
            return;
        };
        if !id.starts_with("cite") {
            return;
        }
        // Already normalized: the name anchor is always inserted first.
        if element
            .children
            .first()
            .is_some_and(|child| child.tag == "a" && child.attr("name") == Some(id.as_str()))
        {
            return;
        }
        let mut text = std::mem::take(&mut element.text);
        if let Some(stripped) = text.strip_prefix('\u{2191}') {
            text = stripped.to_string();
        }
        remove_backlinks(element, &mut text);
        let mut anchor = Element::new("a");
        anchor.set_attr("name", &id);
        anchor.tail = text.trim_start().to_string();
        element.children.insert(0, anchor);
    });
}

fn remove_backlinks(parent: &mut Element, text: &mut String) {
    let mut index = 0;
    while index < parent.children.len() {
        let child = &parent.children[index];
        let drop = is_fragment_href(child)
            || (child.tag == "sup" && child.any_descendant(&is_fragment_href));
        if drop {
            let removed = parent.children.remove(index);
            text.push_str(&removed.tail);
        } else {
            remove_backlinks(&mut parent.children[index], text);
            index += 1;
        }
    }
}

/// Replaces `<object>` embeds we understand with a plugin span wrapping an
/// iframe. Unrecognized objects are left alone.
pub fn fix_embeds(forest: &mut Forest) {
    forest.visit_elements_mut(&mut |element| {
        if element.tag == "object" {
            fix_embed(element);
        }
    });
}

fn fix_embed(object: &mut Element) {
    let mut iframe = Element::new("iframe");
    if let Some(width) = object.attr("width") {
        iframe.set_attr("width", width);
    }
    if let Some(height) = object.attr("height") {
        iframe.set_attr("height", height);
    }
    let movie = object
        .find_descendant(&|element| element.tag == "param" && element.attr("name") == Some("movie"))
        .and_then(|param| param.attr("value"))
        .map(str::to_string);
    let Some(movie) = movie else {
        return;
    };
    if movie.starts_with("http://www.archive.org/flow/") {
        iframe.set_attr("src", &parse_flow_player(&movie));
    }
    object.clear();
    object.tag = "span".to_string();
    object.set_attr("class", "plugin embed");
    // The plugin body carries the iframe as escaped markup.
    object.text = iframe.to_html();
}

fn parse_flow_player(movie_url: &str) -> String {
    let Ok(parsed) = Url::parse(movie_url) else {
        return String::new();
    };
    let config = parsed
        .query_pairs()
        .find(|(key, _)| key == "config")
        .map(|(_, value)| value.into_owned());
    let Some(config) = config else {
        return String::new();
    };
    let Some(rest) = config.split("url:'").nth(1) else {
        return String::new();
    };
    let video_id = rest.split('/').next().unwrap_or("");
    if video_id.is_empty() {
        return String::new();
    }
    format!("http://www.archive.org/embed/{video_id}")
}

/// Divs emitted by the installed googlemap extension carry an id with a
/// `map` prefix; their coordinates are captured and the div is marked for
/// removal so the div→table pass never sees it.
pub fn fix_googlemap_divs(
    forest: &mut Forest,
    page_name: &str,
    records: &SideChannels,
    historic: bool,
) {
    forest.visit_elements_mut(&mut |element| {
        if element.tag != "div" {
            return;
        }
        let is_map = element
            .attr("id")
            .map(|id| id.starts_with("map"))
            .unwrap_or(false);
        if !is_map {
            return;
        }
        if !historic
            && let Some((lat, lon)) = map_div_center(element)
        {
            records.push_mapdata(MapData {
                page_name: page_name.to_string(),
                lat,
                lon,
            });
        }
        element.mark_removed();
    });
}

fn map_div_center(div: &Element) -> Option<(String, String)> {
    let img = div.find_descendant(&|element| element.tag == "img")?;
    let src = img.attr("src")?;
    let query = src.split_once('?')?.1;
    let center = query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == "center").then(|| unquote_url(value))
    })?;
    let (lat, lon) = center.split_once(',')?;
    Some((lat.trim().to_string(), lon.trim().to_string()))
}

/// Canonicalizes intra-wiki anchors: the target page name (recovered from
/// the title attribute) becomes a quoted relative href, and every other
/// attribute is dropped. Non-wiki links are untouched.
pub fn fix_internal_links(forest: &mut Forest, context: &SiteContext) {
    forest.visit_elements_mut(&mut |element| {
        if element.tag != "a" {
            return;
        }
        let Some(page_name) = wiki_link_target(element, context) else {
            return;
        };
        element.attrs.clear();
        element.set_attr("href", &quote_page_name(&page_name));
    });
}

fn wiki_link_target(link: &Element, context: &SiteContext) -> Option<String> {
    let href = link.attr("href")?;
    if !context.is_wiki_page_url(href) {
        return None;
    }
    let title = link.attr("title")?;
    let page_name = if link.has_class("new") {
        broken_link_page_name(title)
    } else {
        title.to_string()
    };
    if page_name.is_empty() {
        return None;
    }
    Some(fix_pagename(&page_name))
}

/// Tag-name simplification onto the sanitizer-friendly subset.
pub fn fix_basic_tags(forest: &mut Forest) {
    forest.visit_elements_mut(&mut |element| {
        let replacement = match element.tag.as_str() {
            "b" | "big" | "font" => "strong",
            "i" => "em",
            "code" => "tt",
            _ => return,
        };
        element.tag = replacement.to_string();
    });
}

pub fn remove_edit_links(forest: &mut Forest) {
    forest.visit_elements_mut(&mut |element| {
        if element.tag == "span" && element.has_class("editsection") {
            element.mark_removed();
        }
    });
}

/// Hoists `span.mw-headline` text into its parent heading. The rendering
/// pads the label with whitespace, so the hoisted text is trimmed.
pub fn remove_headline_labels(forest: &mut Forest) {
    for root in forest.root_elements_mut() {
        hoist_children(
            root,
            &|element| element.tag == "span" && element.has_class("mw-headline"),
            true,
        );
    }
}

/// Hoists `<small>` text into the parent and drops the wrapper.
pub fn unwrap_small_tags(forest: &mut Forest) {
    for root in forest.root_elements_mut() {
        hoist_children(root, &|element| element.tag == "small", false);
    }
}

fn hoist_children<F>(parent: &mut Element, matches: &F, trim: bool)
where
    F: Fn(&Element) -> bool,
{
    for index in 0..parent.children.len() {
        if matches(&parent.children[index]) && !parent.children[index].is_removed() {
            let text = parent.children[index].text.clone();
            let tail = parent.children[index].tail.clone();
            if !text.is_empty() {
                if trim {
                    parent.text.push_str(text.trim());
                } else {
                    parent.text.push_str(&text);
                }
                parent.text.push_str(&tail);
            }
            parent.children[index].mark_removed();
        } else {
            hoist_children(&mut parent.children[index], matches, trim);
        }
    }
}

pub fn remove_toc(forest: &mut Forest) {
    forest.visit_elements_mut(&mut |element| {
        if element.tag == "table" && element.attr("id") == Some("toc") {
            element.mark_removed();
        }
    });
}

pub fn replace_blockquotes(forest: &mut Forest) {
    forest.visit_elements_mut(&mut |element| {
        if element.tag == "blockquote" {
            element.tag = "p".to_string();
            element.set_attr("class", "indent1");
        }
    });
}

/// Collapses `<dl><dd>` nesting chains into `<p class="indentN">` where N
/// is the nesting depth.
pub fn fix_indents(forest: &mut Forest) {
    for root in forest.root_elements_mut() {
        collapse_indents(root);
    }
}

fn collapse_indents(element: &mut Element) {
    if element.tag == "dl"
        && let Some((depth, innermost)) = indent_chain(element)
    {
        let tail = std::mem::take(&mut element.tail);
        let mut paragraph = Element::new("p");
        paragraph.set_attr("class", &format!("indent{depth}"));
        paragraph.text = innermost.text;
        paragraph.children = innermost.children;
        paragraph.tail = tail;
        *element = paragraph;
        for child in &mut element.children {
            collapse_indents(child);
        }
        return;
    }
    for child in &mut element.children {
        collapse_indents(child);
    }
}

/// Follows dl → dd → dl → dd …, returning the depth and a clone of the
/// innermost dd's content. A dd with its own text stops the chain there.
fn indent_chain(dl: &Element) -> Option<(usize, Element)> {
    let mut depth = 0usize;
    let mut current = dl;
    loop {
        let dd = current.children.iter().find(|child| child.tag == "dd")?;
        depth += 1;
        let inner = dd
            .children
            .iter()
            .find(|child| child.tag == "dl")
            .filter(|_| dd.text.trim().is_empty());
        match inner {
            Some(inner_dl) => current = inner_dl,
            None => return Some((depth, dd.clone())),
        }
    }
}

/// Div classes that become spans rather than tables (address markup).
const SPECIAL_DIV_CLASSES: &[&str] = &["adr"];

/// Generic divs are not allowed downstream; they become single-cell tables
/// (styling carried on the td), except the special classes above.
pub fn convert_divs_to_tables(forest: &mut Forest) {
    forest.visit_elements_mut(&mut |element| {
        if element.tag != "div" || element.is_removed() {
            return;
        }
        if SPECIAL_DIV_CLASSES
            .iter()
            .any(|class| element.has_class(class))
        {
            element.tag = "span".to_string();
            return;
        }
        let mut cell = Element::new("td");
        cell.text = std::mem::take(&mut element.text);
        cell.children = std::mem::take(&mut element.children);
        if let Some(style) = element.attr("style") {
            cell.set_attr("style", style);
        }
        let mut row = Element::new("tr");
        row.children.push(cell);
        element.attrs.clear();
        element.tag = "table".to_string();
        element.children.push(row);
    });
}

/// Logs a skipped item with enough context to re-run it manually.
pub fn log_skip(kind: &str, name: &str, reason: &str) {
    debug!("skipping {kind} {name}: {reason}");
}

#[cfg(test)]
mod tests {
    use super::{
        broken_link_page_name, convert_divs_to_tables, fix_basic_tags, fix_embeds,
        fix_googlemap_divs, fix_indents, fix_internal_links, fix_pagename, fix_references,
        quote_page_name, remove_edit_links, remove_headline_labels, remove_toc,
        replace_blockquotes, unwrap_small_tags,
    };
    use crate::config::SiteContext;
    use crate::forest::Forest;
    use crate::records::SideChannels;

    fn context() -> SiteContext {
        SiteContext::new(Some("/mediawiki-1.16.0/".to_string()))
    }

    #[test]
    fn broken_link_title_recovers_page_name() {
        assert_eq!(
            broken_link_page_name("Elephant (page does not exist)"),
            "Elephant"
        );
    }

    #[test]
    fn pagename_namespace_mapping() {
        assert_eq!(fix_pagename("Talk:Front Page"), "Front Page/Talk");
        assert_eq!(fix_pagename("User:Alice"), "Users/Alice");
        assert_eq!(fix_pagename("User talk:Alice"), "Users/Alice/Talk");
        assert_eq!(fix_pagename("Category:Parks"), "Parks");
        assert_eq!(fix_pagename("Category talk:Parks"), "Parks/Talk");
        assert_eq!(fix_pagename("Front Page"), "Front Page");
    }

    #[test]
    fn internal_links_are_canonicalized() {
        let mut forest = Forest::parse(
            "<p><a href=\"/mediawiki-1.16.0/index.php/Front_Page\" title=\"Front Page\" class=\"mw\">home</a></p>",
        );
        fix_internal_links(&mut forest, &context());
        assert_eq!(
            forest.to_html(),
            "<p><a href=\"Front%20Page\">home</a></p>"
        );
    }

    #[test]
    fn broken_internal_links_use_title_recovery() {
        let mut forest = Forest::parse(
            "<p><a href=\"/mediawiki-1.16.0/index.php?title=Elephant&action=edit\" class=\"new\" title=\"Elephant (page does not exist)\">Elephant</a></p>",
        );
        fix_internal_links(&mut forest, &context());
        assert_eq!(forest.to_html(), "<p><a href=\"Elephant\">Elephant</a></p>");
    }

    #[test]
    fn external_links_are_untouched() {
        let html = "<p><a href=\"http://example.org/page\" title=\"x\">out</a></p>";
        let mut forest = Forest::parse(html);
        fix_internal_links(&mut forest, &context());
        assert_eq!(forest.to_html(), html);
    }

    #[test]
    fn basic_tags_are_simplified() {
        let mut forest =
            Forest::parse("<b>a</b><i>b</i><big>c</big><font>d</font><code>e</code>");
        fix_basic_tags(&mut forest);
        assert_eq!(
            forest.to_html(),
            "<strong>a</strong><em>b</em><strong>c</strong><strong>d</strong><tt>e</tt>"
        );
    }

    #[test]
    fn references_become_named_anchors() {
        let mut forest = Forest::parse(
            "<ol><li id=\"cite_note-1\">\u{2191} <sup><a href=\"#cite_ref-1\">1.0</a></sup> Jones 1977</li></ol>",
        );
        fix_references(&mut forest);
        forest.sweep();
        assert_eq!(
            forest.to_html(),
            "<ol><li id=\"cite_note-1\"><a name=\"cite_note-1\"></a>Jones 1977</li></ol>"
        );
    }

    #[test]
    fn reapplying_the_reference_fix_adds_no_second_anchor() {
        let mut forest = Forest::parse(
            "<ol><li id=\"cite_note-1\">\u{2191} <sup><a href=\"#cite_ref-1\">1.0</a></sup> Jones 1977</li></ol>",
        );
        fix_references(&mut forest);
        forest.sweep();
        let once = forest.to_html();
        fix_references(&mut forest);
        forest.sweep();
        assert_eq!(forest.to_html(), once);
    }

    #[test]
    fn non_citation_list_items_are_untouched() {
        let html = "<ul><li id=\"other\">item</li><li>plain</li></ul>";
        let mut forest = Forest::parse(html);
        fix_references(&mut forest);
        forest.sweep();
        assert_eq!(forest.to_html(), html);
    }

    #[test]
    fn archive_embeds_become_plugin_spans() {
        let mut forest = Forest::parse(
            "<object width=\"400\" height=\"300\"><param name=\"movie\" value=\"http://www.archive.org/flow/flowplayer.commercial-3.2.1.swf?config=%7B%22key%22%3A%22x%22%2C%22clip%22%3A%7Burl%3A%27video123/item.mp4%27%7D%7D\"/></object>",
        );
        fix_embeds(&mut forest);
        let html = forest.to_html();
        assert!(html.starts_with("<span class=\"plugin embed\">"));
        assert!(html.contains("&lt;iframe"));
        assert!(html.contains("http://www.archive.org/embed/video123"));
    }

    #[test]
    fn map_divs_are_captured_and_removed() {
        let channels = SideChannels::new();
        let mut forest = Forest::parse(
            "<div id=\"map_canvas_1\"><img src=\"http://maps.example/staticmap?center=45.1,-93.2&zoom=14\"/></div><p>after</p>",
        );
        fix_googlemap_divs(&mut forest, "Park", &channels, false);
        forest.sweep();
        assert_eq!(forest.to_html(), "<p>after</p>");
        let records = channels.take_mapdata();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].lat, "45.1");
        assert_eq!(records[0].lon, "-93.2");
    }

    #[test]
    fn edit_section_spans_are_removed() {
        let mut forest = Forest::parse(
            "<h2><span class=\"editsection\">[<a href=\"#\">edit</a>]</span><span class=\"mw-headline\"> History</span></h2>",
        );
        remove_edit_links(&mut forest);
        remove_headline_labels(&mut forest);
        forest.sweep();
        assert_eq!(forest.to_html(), "<h2>History</h2>");
    }

    #[test]
    fn small_tags_are_unwrapped() {
        let mut forest = Forest::parse("<p><small>fine print</small> rest</p>");
        unwrap_small_tags(&mut forest);
        forest.sweep();
        assert_eq!(forest.to_html(), "<p>fine print rest</p>");
    }

    #[test]
    fn toc_table_is_removed() {
        let mut forest =
            Forest::parse("<table id=\"toc\"><tbody><tr><td>contents</td></tr></tbody></table><p>body</p>");
        remove_toc(&mut forest);
        forest.sweep();
        assert_eq!(forest.to_html(), "<p>body</p>");
    }

    #[test]
    fn blockquotes_become_indented_paragraphs() {
        let mut forest = Forest::parse("<blockquote>quoted</blockquote>");
        replace_blockquotes(&mut forest);
        assert_eq!(forest.to_html(), "<p class=\"indent1\">quoted</p>");
    }

    #[test]
    fn nested_definition_lists_collapse_to_indent_depth() {
        let mut forest = Forest::parse("<dl><dd><dl><dd>text</dd></dl></dd></dl>");
        fix_indents(&mut forest);
        assert_eq!(forest.to_html(), "<p class=\"indent2\">text</p>");
    }

    #[test]
    fn single_indent_keeps_inline_markup() {
        let mut forest = Forest::parse("<dl><dd>one <strong>two</strong></dd></dl>");
        fix_indents(&mut forest);
        assert_eq!(
            forest.to_html(),
            "<p class=\"indent1\">one <strong>two</strong></p>"
        );
    }

    #[test]
    fn divs_become_single_cell_tables() {
        let mut forest = Forest::parse("<div style=\"color: red;\">content</div>");
        convert_divs_to_tables(&mut forest);
        assert_eq!(
            forest.to_html(),
            "<table><tr><td style=\"color: red;\">content</td></tr></table>"
        );
    }

    #[test]
    fn address_divs_become_spans() {
        let mut forest = Forest::parse("<div class=\"adr\">123 Main St</div>");
        convert_divs_to_tables(&mut forest);
        assert_eq!(forest.to_html(), "<span class=\"adr\">123 Main St</span>");
    }

    #[test]
    fn quoting_leaves_slashes_alone() {
        assert_eq!(quote_page_name("Users/Alice"), "Users/Alice");
        assert_eq!(quote_page_name("Front Page"), "Front%20Page");
    }
}
