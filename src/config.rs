use anyhow::Context;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use url::Url;

pub const DEFAULT_SCRIPT_URL: &str = "https://www.google.com/recaptcha/api.js";
pub const DEFAULT_SCRIPT_ID: &str = "recaptcha-api-script-id";
pub const DEFAULT_VERSIONED_SCRIPT_PATTERN: &str =
    r"^https://www\.gstatic\.com/recaptcha/releases/";
pub const DEFAULT_MARKER_CLASS: &str = "g-recaptcha";
/// reCAPTCHA's public test key; always passes.
pub const TEST_SITE_KEY: &str = "6LeIxAcTAAAAAJcZVRqyHh71UXzLZUmYlBmfKWsrR0rJBNRK";

/// Third-party contract constants. The defaults match the documented reCAPTCHA
/// bootstrap; a TOML file may override any of them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WidgetSettings {
    pub script_url: Url,
    pub script_id: String,
    /// Regex for the version-pinned script the bootstrap loads lazily.
    pub versioned_script_pattern: String,
    pub marker_class: String,
    pub test_site_key: String,
}

impl Default for WidgetSettings {
    fn default() -> Self {
        Self {
            script_url: Url::parse(DEFAULT_SCRIPT_URL).expect("default script url is valid"),
            script_id: DEFAULT_SCRIPT_ID.to_string(),
            versioned_script_pattern: DEFAULT_VERSIONED_SCRIPT_PATTERN.to_string(),
            marker_class: DEFAULT_MARKER_CLASS.to_string(),
            test_site_key: TEST_SITE_KEY.to_string(),
        }
    }
}

impl WidgetSettings {
    pub fn from_toml_str(raw: &str) -> anyhow::Result<Self> {
        let settings: Self = toml::from_str(raw).context("failed to parse widget settings")?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_path(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading widget settings {:?}", path))?;
        Self::from_toml_str(&raw)
    }

    pub fn versioned_regex(&self) -> anyhow::Result<Regex> {
        Regex::new(&self.versioned_script_pattern).with_context(|| {
            format!(
                "invalid versioned_script_pattern {:?}",
                self.versioned_script_pattern
            )
        })
    }

    fn validate(&self) -> anyhow::Result<()> {
        self.versioned_regex()?;
        if self.script_id.trim().is_empty() {
            anyhow::bail!("script_id must not be empty");
        }
        if self.marker_class.trim().is_empty() || self.marker_class.contains(char::is_whitespace)
        {
            anyhow::bail!("marker_class must be a single class name");
        }
        Ok(())
    }
}
