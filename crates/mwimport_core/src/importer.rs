//! Per-page import orchestration.
//!
//! Each function here is one unit of pool work: import a page (with its
//! history, tags, and images), or import a redirect. Map data is folded
//! into the store at end of run, once the pages it points at exist.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use log::{info, warn};
use serde_json::json;

use crate::api::{ParsedPage, WikiApi};
use crate::config::SiteContext;
use crate::passes::{fix_pagename, log_skip, quote_page_name};
use crate::pipeline::{ProcessOptions, process_html};
use crate::records::SideChannels;
use crate::store::{ChangeType, SharedStore, slugify};

pub const DEFAULT_REVISION_COMMENT_LIMIT: usize = 200;

/// Imports one page: renders it, runs the chain, stores the result, then
/// its history and category tags. Blank pages are skipped.
pub fn import_page(
    title: &str,
    page_id: i64,
    api: &mut dyn WikiApi,
    store: &SharedStore,
    records: &SideChannels,
    context: &SiteContext,
    show_image_borders: bool,
) -> Result<()> {
    info!("importing {title}");
    let parsed = api
        .render_page(title)
        .with_context(|| format!("failed to render {title}"))?;
    let name = fix_pagename(title);

    let mut html = parsed.html.clone();
    if title.starts_with("Category:") {
        // Category pages get a live listing of their tagged pages appended.
        html.push_str(&tag_list_marker(&name));
    }

    let options = ProcessOptions {
        page_name: &name,
        page_id,
        templates: &parsed.templates,
        attach_to: None,
        show_image_borders,
        historic: false,
    };
    let content = process_html(&html, &options, api, store, records, context)?;
    if content.trim().is_empty() {
        log_skip("page", &name, "empty after processing");
        return Ok(());
    }
    store.save_page(&name, &content)?;

    import_page_revisions(&name, title, page_id, &parsed, api, store, records, context)?;

    let tags: Vec<String> = parsed
        .categories
        .iter()
        .map(|category| category.replace('_', " "))
        .collect();
    if !tags.is_empty() {
        store.add_tags(&name, &tags)?;
    }
    Ok(())
}

fn tag_list_marker(tag_name: &str) -> String {
    format!(
        "<a href=\"tags/{}\" class=\"plugin includetag includepage_showtitle\">List of pages tagged &quot;{}&quot;</a>",
        quote_page_name(tag_name),
        tag_name
    )
}

/// Imports the revision history of a page as historic renditions. Pages
/// whose revision listing is missing are skipped whole.
pub fn import_page_revisions(
    name: &str,
    title: &str,
    page_id: i64,
    parsed: &ParsedPage,
    api: &mut dyn WikiApi,
    store: &SharedStore,
    records: &SideChannels,
    context: &SiteContext,
) -> Result<()> {
    let Some(revisions) = api.page_revisions(title)? else {
        log_skip("history", name, "no revision listing in response");
        return Ok(());
    };
    for (index, revision) in revisions.iter().enumerate() {
        // The listing is newest first, and the newest rendition is the
        // page itself, so reuse the page's parse result for it.
        let rendered = if index == 0 {
            parsed.clone()
        } else {
            api.render_revision(revision.revision_id).with_context(|| {
                format!("failed to render revision {} of {name}", revision.revision_id)
            })?
        };
        let options = ProcessOptions {
            page_name: name,
            page_id,
            templates: &rendered.templates,
            attach_to: None,
            show_image_borders: true,
            historic: true,
        };
        let mut content = process_html(&rendered.html, &options, api, store, records, context)?;
        if content.trim().is_empty() {
            // Stored renditions cannot be blank.
            warn!("revision {} of {name} is empty, storing placeholder", revision.revision_id);
            content = "<p></p>".to_string();
        }
        let comment = revision
            .comment
            .as_deref()
            .map(|comment| truncate_chars(comment, DEFAULT_REVISION_COMMENT_LIMIT));
        // The listing is newest first, so the last entry is the revision
        // that created the page.
        let change_type = if index == revisions.len() - 1 {
            ChangeType::Added
        } else {
            ChangeType::Updated
        };
        store.save_page_version(
            name,
            &content,
            revision.revision_id,
            &revision.timestamp,
            change_type,
            revision.user.as_deref(),
            comment.as_deref(),
        )?;
    }
    info!("imported {} historical renditions of {name}", revisions.len());
    Ok(())
}

fn truncate_chars(value: &str, limit: usize) -> String {
    value.chars().take(limit).collect()
}

/// Imports one redirect page. The destination is the first link on the
/// rendered redirect; a redirect to a page that was never imported is
/// dropped with a log line.
pub fn import_redirect(title: &str, api: &mut dyn WikiApi, store: &SharedStore) -> Result<()> {
    let parsed = api
        .render_page(title)
        .with_context(|| format!("failed to render redirect {title}"))?;
    let Some(destination) = parsed.links.first() else {
        warn!("redirect {title} has no link, dropping");
        return Ok(());
    };
    let destination = fix_pagename(destination);
    if !store.page_exists(&destination)? {
        warn!("redirect {title} -> {destination} dropped, destination does not exist");
        return Ok(());
    }
    if slugify(title) == slugify(&destination) {
        return Ok(());
    }
    store.save_redirect(title, &destination)?;
    info!("redirect {title} -> {destination} created");
    Ok(())
}

/// Folds the accumulated map records into one MultiPoint geometry per
/// page. Runs after all pages exist; records for pages that were skipped
/// are dropped with a log line.
pub fn fold_mapdata(records: &SideChannels, store: &SharedStore) -> Result<usize> {
    let mut by_page: BTreeMap<String, Vec<(f64, f64)>> = BTreeMap::new();
    for record in records.take_mapdata() {
        let (Ok(lat), Ok(lon)) = (record.lat.parse::<f64>(), record.lon.parse::<f64>()) else {
            warn!(
                "dropping unparsable coordinates ({}, {}) for {}",
                record.lat, record.lon, record.page_name
            );
            continue;
        };
        by_page.entry(record.page_name).or_default().push((lon, lat));
    }

    let mut saved = 0;
    for (page_name, points) in by_page {
        if !store.page_exists(&page_name)? {
            warn!("dropping map data for {page_name}, page was not imported");
            continue;
        }
        let geojson = json!({
            "type": "MultiPoint",
            "coordinates": points.iter().map(|(lon, lat)| json!([lon, lat])).collect::<Vec<_>>(),
        });
        store.set_mapdata(&page_name, &geojson.to_string())?;
        saved += 1;
    }
    Ok(saved)
}

#[cfg(test)]
mod tests {
    use anyhow::{Result, bail};
    use tempfile::tempdir;

    use super::{fold_mapdata, import_page, import_redirect, truncate_chars};
    use crate::api::{ImageInfo, PageRef, ParsedPage, RevisionInfo, WikiApi};
    use crate::config::SiteContext;
    use crate::records::{MapData, SideChannels};
    use crate::store::{ChangeType, SharedStore};

    struct ScriptedApi {
        pages: Vec<(String, ParsedPage)>,
        revisions: Vec<(String, Vec<RevisionInfo>)>,
        revision_html: Vec<(i64, ParsedPage)>,
    }

    impl WikiApi for ScriptedApi {
        fn site_name(&mut self) -> Result<String> {
            bail!("not used")
        }
        fn render_page(&mut self, page_name: &str) -> Result<ParsedPage> {
            self.pages
                .iter()
                .find(|(name, _)| name == page_name)
                .map(|(_, parsed)| parsed.clone())
                .ok_or_else(|| anyhow::anyhow!("no page {page_name}"))
        }
        fn render_revision(&mut self, revision_id: i64) -> Result<ParsedPage> {
            self.revision_html
                .iter()
                .find(|(id, _)| *id == revision_id)
                .map(|(_, parsed)| parsed.clone())
                .ok_or_else(|| anyhow::anyhow!("no revision {revision_id}"))
        }
        fn render_wikitext(&mut self, _wikitext: &str, _title: &str) -> Result<String> {
            bail!("not used")
        }
        fn page_id(&mut self, _title: &str) -> Result<Option<i64>> {
            Ok(None)
        }
        fn page_revisions(&mut self, title: &str) -> Result<Option<Vec<RevisionInfo>>> {
            Ok(self
                .revisions
                .iter()
                .find(|(name, _)| name == title)
                .map(|(_, revisions)| revisions.clone()))
        }
        fn list_pages(&mut self, _redirects: bool) -> Result<Vec<PageRef>> {
            bail!("not used")
        }
        fn list_images(&mut self, _page_id: i64) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
        fn image_info(&mut self, _image_title: &str) -> Result<ImageInfo> {
            bail!("not used")
        }
        fn fetch_binary(&mut self, _url: &str) -> Result<Vec<u8>> {
            bail!("not used")
        }
    }

    fn parsed(html: &str) -> ParsedPage {
        ParsedPage {
            html: html.to_string(),
            ..ParsedPage::default()
        }
    }

    fn harness() -> (tempfile::TempDir, SharedStore, SideChannels, SiteContext) {
        let temp = tempdir().expect("tempdir");
        let store = SharedStore::open(&temp.path().join("import.db")).expect("open store");
        (temp, store, SideChannels::new(), SiteContext::default())
    }

    #[test]
    fn page_with_history_and_categories_is_imported() {
        let (_temp, store, records, context) = harness();
        let mut page = parsed("<p>current</p>");
        page.categories = vec!["Historic_Buildings".to_string()];
        let mut api = ScriptedApi {
            pages: vec![("Old Mill".to_string(), page)],
            revisions: vec![(
                "Old Mill".to_string(),
                vec![
                    RevisionInfo {
                        revision_id: 22,
                        timestamp: "2010-02-01T00:00:00Z".to_string(),
                        user: Some("alice".to_string()),
                        comment: Some("tweak".to_string()),
                    },
                    RevisionInfo {
                        revision_id: 21,
                        timestamp: "2010-01-01T00:00:00Z".to_string(),
                        user: None,
                        comment: None,
                    },
                ],
            )],
            revision_html: vec![(21, parsed("<p>older</p>"))],
        };

        import_page("Old Mill", 0, &mut api, &store, &records, &context, true)
            .expect("import page");

        assert_eq!(
            store.page_content("Old Mill").expect("read").as_deref(),
            Some("<p>current</p>")
        );
        // The oldest revision created the page, the newer one updated it.
        assert_eq!(
            store.page_version_change_type("Old Mill", 21).expect("read").as_deref(),
            Some("added")
        );
        assert_eq!(
            store.page_version_change_type("Old Mill", 22).expect("read").as_deref(),
            Some("updated")
        );
        // Re-inserting the same revisions is a no-op.
        let fresh = store
            .save_page_version(
                "Old Mill",
                "<p>x</p>",
                22,
                "2010-02-01T00:00:00Z",
                ChangeType::Updated,
                None,
                None,
            )
            .expect("save version");
        assert!(!fresh);
    }

    #[test]
    fn talk_namespace_folds_into_subpage() {
        let (_temp, store, records, context) = harness();
        let mut api = ScriptedApi {
            pages: vec![("Talk:Old Mill".to_string(), parsed("<p>discussion</p>"))],
            revisions: Vec::new(),
            revision_html: Vec::new(),
        };
        import_page("Talk:Old Mill", 0, &mut api, &store, &records, &context, true)
            .expect("import page");
        assert!(store.page_exists("Old Mill/Talk").expect("exists"));
    }

    #[test]
    fn category_pages_gain_a_tag_listing() {
        let (_temp, store, records, context) = harness();
        let mut api = ScriptedApi {
            pages: vec![("Category:Parks".to_string(), parsed("<p>about parks</p>"))],
            revisions: Vec::new(),
            revision_html: Vec::new(),
        };
        import_page("Category:Parks", 0, &mut api, &store, &records, &context, true)
            .expect("import page");
        let content = store.page_content("Parks").expect("read").expect("page");
        assert!(content.contains("includetag"));
        assert!(content.contains("List of pages tagged \"Parks\""));
    }

    #[test]
    fn blank_page_is_skipped() {
        let (_temp, store, records, context) = harness();
        let mut api = ScriptedApi {
            pages: vec![("Empty".to_string(), parsed("   "))],
            revisions: Vec::new(),
            revision_html: Vec::new(),
        };
        import_page("Empty", 0, &mut api, &store, &records, &context, true).expect("import page");
        assert!(!store.page_exists("Empty").expect("exists"));
    }

    #[test]
    fn redirect_to_missing_page_is_dropped() {
        let (_temp, store, _records, _context) = harness();
        let mut api = ScriptedApi {
            pages: vec![(
                "Old Name".to_string(),
                ParsedPage {
                    html: String::new(),
                    links: vec!["Nowhere".to_string()],
                    ..ParsedPage::default()
                },
            )],
            revisions: Vec::new(),
            revision_html: Vec::new(),
        };
        import_redirect("Old Name", &mut api, &store).expect("import redirect");
        assert_eq!(store.redirect_count().expect("count"), 0);
    }

    #[test]
    fn redirect_to_existing_page_is_created() {
        let (_temp, store, _records, _context) = harness();
        store.save_page("New Name", "<p>x</p>").expect("save");
        let mut api = ScriptedApi {
            pages: vec![(
                "Old Name".to_string(),
                ParsedPage {
                    html: String::new(),
                    links: vec!["New Name".to_string()],
                    ..ParsedPage::default()
                },
            )],
            revisions: Vec::new(),
            revision_html: Vec::new(),
        };
        import_redirect("Old Name", &mut api, &store).expect("import redirect");
        assert_eq!(store.redirect_count().expect("count"), 1);
    }

    #[test]
    fn mapdata_folds_to_one_geometry_per_page() {
        let (_temp, store, records, _context) = harness();
        store.save_page("Park", "<p>x</p>").expect("save");
        for (lat, lon) in [("38.54", "-121.74"), ("38.55", "-121.73")] {
            records.push_mapdata(MapData {
                page_name: "Park".to_string(),
                lat: lat.to_string(),
                lon: lon.to_string(),
            });
        }
        records.push_mapdata(MapData {
            page_name: "Ghost Page".to_string(),
            lat: "1".to_string(),
            lon: "2".to_string(),
        });
        let saved = fold_mapdata(&records, &store).expect("fold mapdata");
        assert_eq!(saved, 1);
    }

    #[test]
    fn comments_are_truncated_by_characters() {
        let long = "é".repeat(300);
        assert_eq!(truncate_chars(&long, 200).chars().count(), 200);
    }
}
