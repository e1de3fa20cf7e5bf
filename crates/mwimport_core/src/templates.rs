//! Template-to-include detection.
//!
//! The query API names the templates a page uses but not whether they take
//! parameters. A parameter-free template renders to exactly the HTML that
//! is inlined in the page, so each template is rendered standalone,
//! normalized through the same parse/serialize round trip as the page, and
//! substituted by substring match. Parameterized templates never match and
//! stay inlined verbatim.

use anyhow::Result;
use log::{debug, info};

use crate::api::WikiApi;
use crate::config::SiteContext;
use crate::forest::Forest;
use crate::passes::quote_page_name;
use crate::pipeline::{ProcessOptions, process_html};
use crate::records::SideChannels;
use crate::store::SharedStore;

/// Replaces each matching template occurrence with an include-marker
/// anchor, creating the standalone include page on first sight.
pub fn replace_templates_with_includes(
    forest: &mut Forest,
    templates: &[String],
    page_title: &str,
    api: &mut dyn WikiApi,
    store: &SharedStore,
    records: &SideChannels,
    context: &SiteContext,
) -> Result<()> {
    if templates.is_empty() {
        return Ok(());
    }
    let mut html = forest.to_html();
    let mut changed = false;
    for template_name in templates {
        let Some(include_name) = template_name.strip_prefix("Template:") else {
            continue;
        };
        let rendered = api.render_wikitext(&format!("{{{{{include_name}}}}}"), page_title)?;
        let normalized = Forest::parse(&rendered).to_html();
        let template_html = normalized.trim();
        if template_html.is_empty() || !html.contains(template_html) {
            debug!("template {template_name} on {page_title} takes parameters or differs, leaving inline");
            continue;
        }
        create_include_page(template_name, include_name, template_html, api, store, records, context)?;
        let marker = include_marker(include_name);
        html = html.replace(template_html, &marker);
        changed = true;
    }
    if changed {
        *forest = Forest::parse(&html);
    }
    Ok(())
}

pub fn include_marker(include_name: &str) -> String {
    format!(
        "<a href=\"{}\" class=\"plugin includepage\">Include page {}</a>",
        quote_page_name(include_name),
        include_name
    )
}

/// Creates the standalone page holding the template's rendered content,
/// once per run. The claim makes check-then-create atomic across workers,
/// and the store check makes re-runs idempotent.
fn create_include_page(
    template_name: &str,
    include_name: &str,
    template_html: &str,
    api: &mut dyn WikiApi,
    store: &SharedStore,
    records: &SideChannels,
    context: &SiteContext,
) -> Result<()> {
    if !records.claim_include_page(include_name) {
        return Ok(());
    }
    if store.page_exists(include_name)? {
        return Ok(());
    }
    let page_id = api.page_id(template_name)?.unwrap_or(0);
    // The include page goes through the full chain itself, historic so it
    // does not re-emit map data, borderless per the include plugin's look.
    let options = ProcessOptions {
        page_name: template_name,
        page_id,
        templates: &[],
        attach_to: Some(include_name),
        show_image_borders: false,
        historic: true,
    };
    let content = process_html(template_html, &options, api, store, records, context)?;
    info!("creating include page {include_name}");
    store.save_page(include_name, &content)?;
    Ok(())
}
