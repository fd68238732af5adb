//! Linked page model
//!
//! Flat extraction of `id`, `title`, `icon` and `link` from the sitemap
//! representations the server returns (XML child elements or JSON fields).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("invalid XML: {0}")]
    Xml(#[from] quick_xml::DeError),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// A page linked from a sitemap widget
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkedPage {
    pub id: String,
    pub title: String,
    pub icon: String,
    pub link: String,
}

impl LinkedPage {
    /// Missing or non-string fields are left empty
    pub fn from_json(value: &Value) -> Self {
        let field = |name: &str| {
            value
                .get(name)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string()
        };
        Self {
            id: field("id"),
            title: field("title"),
            icon: field("icon"),
            link: field("link"),
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self, ModelError> {
        let value: Value = serde_json::from_str(json)?;
        Ok(Self::from_json(&value))
    }

    /// Parse from a `<linkedPage>` element; unknown children are ignored
    pub fn from_xml(xml: &str) -> Result<Self, ModelError> {
        Ok(quick_xml::de::from_str(xml)?)
    }

    /// Title without the trailing state part (`"Kitchen [21 °C]"` → `"Kitchen "`)
    pub fn display_title(&self) -> &str {
        match self.title.find('[') {
            Some(idx) if idx > 0 => &self.title[..idx],
            _ => &self.title,
        }
    }
}
