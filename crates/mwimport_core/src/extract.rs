//! Pre-parse string passes.
//!
//! Some wiki extensions emit custom tags (for example `<googlemap>`) that
//! survive rendering as entity-escaped text. They are extracted from the
//! raw HTML string before fragment parsing, and the markup is deleted.

use std::sync::OnceLock;

use log::debug;
use regex::Regex;

use crate::records::{MapData, SideChannels};

fn googlemap_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?s)&lt;googlemap (?P<attribs>.+?)&gt;.*?&lt;/googlemap&gt;")
            .expect("googlemap pattern")
    })
}

fn script_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(?is)<script.*?>.*?</script>").expect("script tag pattern"))
}

/// Removes every recognized extension tag from the raw HTML and appends a
/// map-data record per well-formed occurrence. Malformed attribute
/// fragments still have their markup deleted, but emit nothing.
pub fn extract_extension_tags(
    html: &str,
    page_name: &str,
    records: &SideChannels,
    historic: bool,
) -> String {
    googlemap_pattern()
        .replace_all(html, |caps: &regex::Captures<'_>| {
            let attribs = caps.name("attribs").map(|m| m.as_str()).unwrap_or("");
            match parse_map_attributes(attribs) {
                Some((lat, lon)) => {
                    if !historic {
                        records.push_mapdata(MapData {
                            page_name: page_name.to_string(),
                            lat,
                            lon,
                        });
                    }
                }
                None => {
                    debug!("skipping malformed googlemap markup on {page_name}: {attribs}");
                }
            }
            String::new()
        })
        .into_owned()
}

/// Parses the captured attribute fragment as a minimal attribute-only XML
/// element and reads the coordinate pair.
fn parse_map_attributes(attribs: &str) -> Option<(String, String)> {
    let fragment = format!("<googlemap {attribs}/>");
    let document = roxmltree::Document::parse(&fragment).ok()?;
    let element = document.root_element();
    let lat = element.attribute("lat")?.to_string();
    let lon = element.attribute("lon")?.to_string();
    Some((lat, lon))
}

/// Scripts are not representable in the target content model at all.
pub fn remove_script_tags(html: &str) -> String {
    script_pattern().replace_all(html, "").into_owned()
}
