//! MediaWiki query API client.
//!
//! The pipeline consumes rendering and image lookups through the `WikiApi`
//! trait so tests can substitute a mock; `MediaWikiClient` is the blocking
//! reqwest implementation used by real runs.

use std::env;
use std::thread::sleep;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde_json::Value;

use crate::config::ImportConfig;

/// Namespaces crawled for the master page list: main, talk, user, user
/// talk, category, category talk.
pub const IMPORT_NAMESPACES: &[i32] = &[0, 1, 2, 3, 14, 15];

/// One rendered page: HTML plus the structural metadata the pipeline needs.
#[derive(Debug, Clone, Default)]
pub struct ParsedPage {
    pub html: String,
    pub links: Vec<String>,
    pub templates: Vec<String>,
    pub categories: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct PageRef {
    pub title: String,
    pub page_id: i64,
}

impl std::fmt::Display for PageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.title)
    }
}

#[derive(Debug, Clone)]
pub struct RevisionInfo {
    pub revision_id: i64,
    pub timestamp: String,
    pub user: Option<String>,
    pub comment: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ImageInfo {
    pub url: String,
    pub description_url: String,
    pub width: Option<u64>,
    pub height: Option<u64>,
}

pub trait WikiApi {
    fn site_name(&mut self) -> Result<String>;
    fn render_page(&mut self, page_name: &str) -> Result<ParsedPage>;
    fn render_revision(&mut self, revision_id: i64) -> Result<ParsedPage>;
    fn render_wikitext(&mut self, wikitext: &str, title: &str) -> Result<String>;
    fn page_id(&mut self, title: &str) -> Result<Option<i64>>;
    fn page_revisions(&mut self, title: &str) -> Result<Option<Vec<RevisionInfo>>>;
    fn list_pages(&mut self, redirects: bool) -> Result<Vec<PageRef>>;
    fn list_images(&mut self, page_id: i64) -> Result<Vec<String>>;
    fn image_info(&mut self, image_title: &str) -> Result<ImageInfo>;
    fn fetch_binary(&mut self, url: &str) -> Result<Vec<u8>>;
}

#[derive(Debug, Clone)]
pub struct MediaWikiClientConfig {
    pub api_url: String,
    pub user_agent: String,
    pub timeout_ms: u64,
    pub rate_limit_ms: u64,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
}

impl MediaWikiClientConfig {
    pub fn from_config(config: &ImportConfig) -> Result<Self> {
        let api_url = config
            .api_url()
            .ok_or_else(|| anyhow::anyhow!("no API url configured (set [site] url or api_url)"))?;
        Ok(Self {
            api_url,
            user_agent: config.user_agent(),
            timeout_ms: env_value_u64("MWIMPORT_HTTP_TIMEOUT_MS", 30_000),
            rate_limit_ms: env_value_u64("MWIMPORT_RATE_LIMIT_MS", 100),
            max_retries: env_value_usize("MWIMPORT_HTTP_RETRIES", 2),
            retry_delay_ms: env_value_u64("MWIMPORT_HTTP_RETRY_DELAY_MS", 350),
        })
    }
}

pub struct MediaWikiClient {
    client: Client,
    config: MediaWikiClientConfig,
    last_request_at: Option<Instant>,
}

impl MediaWikiClient {
    pub fn new(config: MediaWikiClientConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .cookie_store(true)
            .build()
            .context("failed to build MediaWiki HTTP client")?;
        Ok(Self {
            client,
            config,
            last_request_at: None,
        })
    }

    fn request_json(&mut self, params: &[(&str, String)]) -> Result<Value> {
        let mut pairs = Vec::with_capacity(params.len() + 2);
        pairs.push(("format".to_string(), "json".to_string()));
        pairs.push(("formatversion".to_string(), "2".to_string()));
        for (key, value) in params {
            if !value.is_empty() {
                pairs.push(((*key).to_string(), value.clone()));
            }
        }

        for attempt in 0..=self.config.max_retries {
            self.apply_rate_limit();
            let response = self
                .client
                .get(&self.config.api_url)
                .header("User-Agent", self.config.user_agent.clone())
                .query(&pairs)
                .send();

            match response {
                Ok(response) => {
                    let status = response.status();
                    if !status.is_success() {
                        if attempt < self.config.max_retries && is_retryable_status(status) {
                            self.wait_before_retry(attempt);
                            continue;
                        }
                        bail!("MediaWiki API request failed with HTTP {status}");
                    }
                    let payload: Value = response
                        .json()
                        .context("failed to decode MediaWiki API JSON response")?;
                    if let Some(error) = payload.get("error") {
                        let code = error
                            .get("code")
                            .and_then(Value::as_str)
                            .unwrap_or("unknown_error");
                        let info = error
                            .get("info")
                            .and_then(Value::as_str)
                            .unwrap_or("unknown info");
                        bail!("MediaWiki API error [{code}]: {info}");
                    }
                    return Ok(payload);
                }
                Err(error) => {
                    if attempt < self.config.max_retries {
                        self.wait_before_retry(attempt);
                        continue;
                    }
                    return Err(error).context("failed to call MediaWiki API");
                }
            }
        }

        bail!("MediaWiki API request exhausted retry budget")
    }

    fn apply_rate_limit(&mut self) {
        let delay = Duration::from_millis(self.config.rate_limit_ms);
        if let Some(last) = self.last_request_at {
            let elapsed = last.elapsed();
            if elapsed < delay {
                sleep(delay - elapsed);
            }
        }
        self.last_request_at = Some(Instant::now());
    }

    fn wait_before_retry(&self, attempt: usize) {
        let exponent = u32::try_from(attempt).unwrap_or(16);
        let base = self
            .config
            .retry_delay_ms
            .saturating_mul(2u64.saturating_pow(exponent));
        let jitter = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| u64::from(duration.subsec_millis() % 100))
            .unwrap_or(0);
        sleep(Duration::from_millis(base.saturating_add(jitter)));
    }

    fn parse_action(&mut self, extra: &[(&str, String)]) -> Result<ParsedPage> {
        let mut params = vec![("action", "parse".to_string())];
        params.extend_from_slice(extra);
        let payload = self.request_json(&params)?;
        let parse = payload
            .get("parse")
            .ok_or_else(|| anyhow::anyhow!("parse response missing `parse` object"))?;
        Ok(decode_parse_result(parse))
    }
}

fn decode_parse_result(parse: &Value) -> ParsedPage {
    let html = parse
        .get("text")
        .and_then(|text| text.as_str().map(str::to_string).or_else(|| {
            // formatversion=1 shape: {"text": {"*": "..."}}
            text.get("*").and_then(Value::as_str).map(str::to_string)
        }))
        .unwrap_or_default();
    ParsedPage {
        html,
        links: star_list(parse.get("links"), "title"),
        templates: star_list(parse.get("templates"), "title"),
        categories: star_list(parse.get("categories"), "category"),
    }
}

/// Decodes a list of `{"title": ...}` / `{"*": ...}` entries, tolerating
/// both formatversion shapes.
fn star_list(value: Option<&Value>, key: &str) -> Vec<String> {
    let Some(entries) = value.and_then(Value::as_array) else {
        return Vec::new();
    };
    entries
        .iter()
        .filter_map(|entry| {
            entry
                .get(key)
                .or_else(|| entry.get("*"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .collect()
}

impl WikiApi for MediaWikiClient {
    fn site_name(&mut self) -> Result<String> {
        let payload = self.request_json(&[
            ("action", "query".to_string()),
            ("meta", "siteinfo".to_string()),
        ])?;
        payload
            .get("query")
            .and_then(|query| query.get("general"))
            .and_then(|general| general.get("sitename"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("siteinfo response missing sitename"))
    }

    fn render_page(&mut self, page_name: &str) -> Result<ParsedPage> {
        self.parse_action(&[("page", page_name.to_string())])
    }

    fn render_revision(&mut self, revision_id: i64) -> Result<ParsedPage> {
        self.parse_action(&[("oldid", revision_id.to_string())])
    }

    fn render_wikitext(&mut self, wikitext: &str, title: &str) -> Result<String> {
        let page = self.parse_action(&[
            ("text", wikitext.to_string()),
            ("title", title.to_string()),
        ])?;
        Ok(page.html)
    }

    fn page_id(&mut self, title: &str) -> Result<Option<i64>> {
        let payload = self.request_json(&[
            ("action", "query".to_string()),
            ("titles", title.to_string()),
        ])?;
        let id = first_page(&payload).and_then(|page| page.get("pageid").and_then(Value::as_i64));
        Ok(id)
    }

    fn page_revisions(&mut self, title: &str) -> Result<Option<Vec<RevisionInfo>>> {
        let payload = self.request_json(&[
            ("action", "query".to_string()),
            ("prop", "revisions".to_string()),
            ("rvprop", "ids|timestamp|user|comment".to_string()),
            ("rvlimit", "500".to_string()),
            ("titles", title.to_string()),
        ])?;
        let Some(revisions) = first_page(&payload)
            .and_then(|page| page.get("revisions"))
            .and_then(Value::as_array)
        else {
            // Some responses simply lack the revisions key; the caller
            // skips history for the page.
            return Ok(None);
        };
        let mut out = Vec::with_capacity(revisions.len());
        for revision in revisions {
            let Some(revision_id) = revision.get("revid").and_then(Value::as_i64) else {
                continue;
            };
            out.push(RevisionInfo {
                revision_id,
                timestamp: revision
                    .get("timestamp")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                user: revision
                    .get("user")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                comment: revision
                    .get("comment")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            });
        }
        Ok(Some(out))
    }

    fn list_pages(&mut self, redirects: bool) -> Result<Vec<PageRef>> {
        let filter = if redirects {
            "redirects"
        } else {
            "nonredirects"
        };
        let mut pages = Vec::new();
        for namespace in IMPORT_NAMESPACES {
            let mut continue_token: Option<String> = None;
            loop {
                let mut params = vec![
                    ("action", "query".to_string()),
                    ("list", "allpages".to_string()),
                    ("apnamespace", namespace.to_string()),
                    ("aplimit", "500".to_string()),
                    ("apfilterredir", filter.to_string()),
                ];
                if let Some(token) = &continue_token {
                    params.push(("apcontinue", token.clone()));
                }
                let payload = self.request_json(&params)?;
                if let Some(entries) = payload
                    .get("query")
                    .and_then(|query| query.get("allpages"))
                    .and_then(Value::as_array)
                {
                    for entry in entries {
                        let Some(title) = entry.get("title").and_then(Value::as_str) else {
                            continue;
                        };
                        pages.push(PageRef {
                            title: title.to_string(),
                            page_id: entry.get("pageid").and_then(Value::as_i64).unwrap_or(0),
                        });
                    }
                }
                continue_token = payload
                    .get("continue")
                    .and_then(|cont| cont.get("apcontinue"))
                    .and_then(Value::as_str)
                    .map(str::to_string);
                if continue_token.is_none() {
                    break;
                }
            }
        }
        Ok(pages)
    }

    fn list_images(&mut self, page_id: i64) -> Result<Vec<String>> {
        let payload = self.request_json(&[
            ("action", "query".to_string()),
            ("prop", "images".to_string()),
            ("imlimit", "500".to_string()),
            ("pageids", page_id.to_string()),
        ])?;
        let titles = first_page(&payload)
            .and_then(|page| page.get("images"))
            .and_then(Value::as_array)
            .map(|images| star_list(Some(&Value::Array(images.clone())), "title"))
            .unwrap_or_default();
        Ok(titles)
    }

    fn image_info(&mut self, image_title: &str) -> Result<ImageInfo> {
        let payload = self.request_json(&[
            ("action", "query".to_string()),
            ("prop", "imageinfo".to_string()),
            ("titles", image_title.to_string()),
            ("iiprop", "timestamp|user|url|dimensions|comment".to_string()),
        ])?;
        let info = first_page(&payload)
            .and_then(|page| page.get("imageinfo"))
            .and_then(Value::as_array)
            .and_then(|entries| entries.first())
            .ok_or_else(|| anyhow::anyhow!("no imageinfo for {image_title}"))?;
        let url = info
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow::anyhow!("imageinfo for {image_title} missing url"))?
            .to_string();
        let description_url = info
            .get("descriptionurl")
            .and_then(Value::as_str)
            .unwrap_or(&url)
            .to_string();
        Ok(ImageInfo {
            url,
            description_url,
            width: info.get("width").and_then(Value::as_u64),
            height: info.get("height").and_then(Value::as_u64),
        })
    }

    fn fetch_binary(&mut self, url: &str) -> Result<Vec<u8>> {
        self.apply_rate_limit();
        let response = self
            .client
            .get(url)
            .header("User-Agent", self.config.user_agent.clone())
            .send()
            .with_context(|| format!("failed to fetch {url}"))?;
        let status = response.status();
        if !status.is_success() {
            bail!("HTTP {} while fetching {}", status.as_u16(), url);
        }
        let bytes = response
            .bytes()
            .with_context(|| format!("failed to read body of {url}"))?;
        Ok(bytes.to_vec())
    }
}

/// Pulls the first page object out of a `query.pages` payload; tolerates
/// the formatversion=2 array and the formatversion=1 map shapes.
fn first_page(payload: &Value) -> Option<&Value> {
    let pages = payload.get("query")?.get("pages")?;
    if let Some(array) = pages.as_array() {
        return array.first();
    }
    pages.as_object()?.values().next()
}

fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

fn env_value_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_value_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
        .unwrap_or(default)
}
