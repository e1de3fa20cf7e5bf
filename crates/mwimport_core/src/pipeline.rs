//! The page-processing chain.
//!
//! One entry point turns a rendered MediaWiki page into the target HTML
//! dialect. Pass order matters: template diffing must see the markup
//! before any rewriting, image resolution must see thumb structure before
//! tag simplification, and galleries are flattened only after images have
//! been rewritten into spans.

use anyhow::Result;

use crate::api::WikiApi;
use crate::config::SiteContext;
use crate::extract::{extract_extension_tags, remove_script_tags};
use crate::forest::Forest;
use crate::images::{flatten_galleries, resolve_images};
use crate::passes;
use crate::records::SideChannels;
use crate::store::SharedStore;
use crate::templates::replace_templates_with_includes;

/// Per-call knobs for one page (or one historical revision, or one
/// include page) moving through the chain.
#[derive(Debug, Clone, Copy)]
pub struct ProcessOptions<'a> {
    pub page_name: &'a str,
    /// Source wiki page id; 0 disables image resolution (no id to query).
    pub page_id: i64,
    pub templates: &'a [String],
    /// Page the binaries attach to when it differs from `page_name`.
    pub attach_to: Option<&'a str>,
    pub show_image_borders: bool,
    /// Historic renditions do not re-emit map data.
    pub historic: bool,
}

/// Converts one rendered HTML string into cleaned target HTML, emitting
/// map-data records and include pages as side effects.
pub fn process_html(
    html: &str,
    options: &ProcessOptions<'_>,
    api: &mut dyn WikiApi,
    store: &SharedStore,
    records: &SideChannels,
    context: &SiteContext,
) -> Result<String> {
    let html = extract_extension_tags(html, options.page_name, records, options.historic);
    let html = remove_script_tags(&html);
    let mut forest = Forest::parse(&html);

    replace_templates_with_includes(
        &mut forest,
        options.templates,
        options.page_name,
        api,
        store,
        records,
        context,
    )?;
    passes::fix_references(&mut forest);
    passes::fix_embeds(&mut forest);
    passes::fix_googlemap_divs(&mut forest, options.page_name, records, options.historic);
    forest.sweep();

    if options.page_id != 0 {
        resolve_images(
            &mut forest,
            api,
            store,
            options.page_id,
            options.page_name,
            options.attach_to,
            options.show_image_borders,
        )?;
    }

    passes::fix_internal_links(&mut forest, context);
    passes::fix_basic_tags(&mut forest);
    passes::remove_edit_links(&mut forest);
    passes::remove_headline_labels(&mut forest);
    passes::unwrap_small_tags(&mut forest);
    passes::remove_toc(&mut forest);
    passes::replace_blockquotes(&mut forest);
    flatten_galleries(&mut forest);
    passes::fix_indents(&mut forest);
    passes::convert_divs_to_tables(&mut forest);
    forest.sweep();

    Ok(forest.to_html())
}
