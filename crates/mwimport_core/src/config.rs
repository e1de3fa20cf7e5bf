//! Import run configuration: TOML file, env overrides, defaults.

use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use reqwest::Url;
use serde::{Deserialize, Serialize};

pub const DEFAULT_USER_AGENT: &str = "mwimport/0.3";
pub const DEFAULT_WORKERS: usize = 10;
pub const DEFAULT_DB_PATH: &str = "mwimport.db";

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct ImportConfig {
    #[serde(default)]
    pub site: SiteSection,
    #[serde(default)]
    pub import: ImportSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct SiteSection {
    pub url: Option<String>,
    pub api_url: Option<String>,
    pub script_path: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct ImportSection {
    pub workers: Option<usize>,
    pub db_path: Option<String>,
    pub show_image_borders: Option<bool>,
}

impl ImportConfig {
    /// Resolve the api.php endpoint: env MWIMPORT_API_URL > config api_url >
    /// derived from the site url.
    pub fn api_url(&self) -> Option<String> {
        if let Some(value) = non_empty_env("MWIMPORT_API_URL") {
            return Some(value);
        }
        if let Some(api_url) = &self.site.api_url {
            return Some(api_url.clone());
        }
        self.site
            .url
            .as_deref()
            .and_then(|url| guess_api_endpoint(url))
    }

    /// Resolve the wiki script path: env > config > derived from the site url.
    pub fn script_path(&self) -> Option<String> {
        if let Some(value) = non_empty_env("MWIMPORT_SCRIPT_PATH") {
            return Some(value);
        }
        if let Some(path) = &self.site.script_path {
            return Some(path.clone());
        }
        self.site
            .url
            .as_deref()
            .and_then(|url| guess_script_path(url))
    }

    pub fn user_agent(&self) -> String {
        non_empty_env("MWIMPORT_USER_AGENT")
            .or_else(|| self.site.user_agent.clone())
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }

    pub fn workers(&self) -> usize {
        env::var("MWIMPORT_WORKERS")
            .ok()
            .and_then(|value| value.trim().parse::<usize>().ok())
            .or(self.import.workers)
            .unwrap_or(DEFAULT_WORKERS)
            .max(1)
    }

    pub fn db_path(&self) -> String {
        non_empty_env("MWIMPORT_DB_PATH")
            .or_else(|| self.import.db_path.clone())
            .unwrap_or_else(|| DEFAULT_DB_PATH.to_string())
    }

    pub fn show_image_borders(&self) -> bool {
        self.import.show_image_borders.unwrap_or(true)
    }
}

/// Load an ImportConfig from a TOML file. Returns default when the file is
/// absent.
pub fn load_config(config_path: &Path) -> Result<ImportConfig> {
    if !config_path.exists() {
        return Ok(ImportConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: ImportConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

/// Per-run site facts threaded explicitly through the pipeline instead of
/// living in process-wide state.
#[derive(Debug, Clone, Default)]
pub struct SiteContext {
    pub script_path: Option<String>,
}

impl SiteContext {
    pub fn new(script_path: Option<String>) -> Self {
        Self { script_path }
    }

    /// A wiki-internal href either starts with the site's script path, or is
    /// a relative URL whose path component ends in index.php.
    pub fn is_wiki_page_url(&self, href: &str) -> bool {
        if let Some(script_path) = &self.script_path
            && !script_path.is_empty()
            && href.starts_with(script_path.as_str())
        {
            return true;
        }
        if !href.contains("://") {
            let path = href.split(['?', '#']).next().unwrap_or("");
            if path.ends_with("index.php") {
                return true;
            }
        }
        false
    }
}

/// Best-effort guess of the api.php endpoint next to a wiki's base URL.
pub fn guess_api_endpoint(url: &str) -> Option<String> {
    let base = Url::parse(url).ok()?;
    base.join("api.php").ok().map(|joined| joined.to_string())
}

/// Best-effort guess of the wiki script path from its base URL: a .php path
/// is taken verbatim, otherwise the containing directory.
pub fn guess_script_path(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let path = parsed.path();
    if path.ends_with(".php") {
        return Some(path.to_string());
    }
    if path.is_empty() || path == "/" {
        return Some("/".to_string());
    }
    match path.rfind('/') {
        Some(index) => Some(path[..=index].to_string()),
        None => Some("/".to_string()),
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use tempfile::tempdir;

    use super::{ImportConfig, SiteContext, guess_api_endpoint, guess_script_path, load_config};

    #[test]
    fn guess_api_endpoint_joins_relative() {
        assert_eq!(
            guess_api_endpoint("http://arborwiki.org/").as_deref(),
            Some("http://arborwiki.org/api.php")
        );
        assert_eq!(
            guess_api_endpoint("http://example.org/mediawiki-1.16.0/index.php").as_deref(),
            Some("http://example.org/mediawiki-1.16.0/api.php")
        );
    }

    #[test]
    fn guess_script_path_keeps_php_and_directories() {
        assert_eq!(
            guess_script_path("http://example.org/mediawiki-1.16.0/index.php").as_deref(),
            Some("/mediawiki-1.16.0/index.php")
        );
        assert_eq!(
            guess_script_path("http://example.org/wiki/Main").as_deref(),
            Some("/wiki/")
        );
        assert_eq!(
            guess_script_path("http://example.org/").as_deref(),
            Some("/")
        );
    }

    #[test]
    fn wiki_url_detection_uses_script_path_and_index_php() {
        let context = SiteContext::new(Some("/mediawiki-1.16.0/".to_string()));
        assert!(context.is_wiki_page_url("/mediawiki-1.16.0/index.php/File:Foo.png"));
        assert!(context.is_wiki_page_url("index.php?title=Front_Page"));
        assert!(!context.is_wiki_page_url("http://elsewhere.example/index.html"));
    }

    #[test]
    fn load_config_returns_default_for_missing_file() {
        let config = load_config(Path::new("/nonexistent/mwimport.toml")).expect("load config");
        assert!(config.site.url.is_none());
        assert_eq!(config.workers(), super::DEFAULT_WORKERS);
    }

    #[test]
    fn load_config_parses_sections() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("mwimport.toml");
        fs::write(
            &config_path,
            r#"
[site]
url = "http://arborwiki.org/"
user_agent = "test-agent/1.0"

[import]
workers = 4
db_path = "out.db"
"#,
        )
        .expect("write config");

        let config = load_config(&config_path).expect("load config");
        assert_eq!(config.site.url.as_deref(), Some("http://arborwiki.org/"));
        assert_eq!(config.user_agent(), "test-agent/1.0");
        assert_eq!(config.import.workers, Some(4));
        assert_eq!(config.db_path(), "out.db");
    }

    #[test]
    fn api_url_derived_from_site_url() {
        let config: ImportConfig =
            toml::from_str("[site]\nurl = \"http://arborwiki.org/\"\n").expect("parse");
        assert_eq!(
            config.api_url().as_deref(),
            Some("http://arborwiki.org/api.php")
        );
    }
}
