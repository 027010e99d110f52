//! Template rendering using minijinja with embedded templates.

use chrono::{DateTime, Utc};
use minijinja::{Environment, Error as JinjaError, ErrorKind};
use rust_embed::Embed;
use serde::Serialize;

use crate::daemon::protocol::{share_url, ShareRecord};
use crate::format::{human_bytes, human_duration};

/// Embedded HTML templates.
#[derive(Embed)]
#[folder = "templates/"]
pub struct Templates;

/// A template engine for rendering share pages.
pub struct TemplateEngine {
    env: Environment<'static>,
}

impl TemplateEngine {
    /// Create a new template engine with embedded templates.
    pub fn new() -> Result<Self, JinjaError> {
        let mut env = Environment::new();

        for file in Templates::iter() {
            let filename = file.to_string();
            if let Some(content) = Templates::get(&filename) {
                let template_str = std::str::from_utf8(content.data.as_ref())
                    .map_err(|_| JinjaError::from(ErrorKind::InvalidOperation))?;
                env.add_template_owned(filename, template_str.to_string())?;
            }
        }

        Ok(Self { env })
    }

    /// Render the website-mode page of a share.
    pub fn render_share(&self, view: &SharePageView) -> Result<String, JinjaError> {
        let template = self.env.get_template("share.html")?;
        template.render(minijinja::context! { share => view })
    }
}

/// A view model for rendering a share page.
#[derive(Debug, Clone, Serialize)]
pub struct SharePageView {
    pub id: String,
    pub name: String,
    /// Human-readable size
    pub size: String,
    pub size_bytes: u64,
    pub expires_at: String,
    /// Human-readable time left
    pub remaining: String,
    pub download_url: String,
    /// Shown when the share also allows wget access
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wget_command: Option<String>,
}

impl SharePageView {
    pub fn from_record(record: &ShareRecord, public_url: &str, now: DateTime<Utc>) -> Self {
        let url = share_url(public_url, record.id);
        Self {
            id: record.id.to_string(),
            name: record.name.clone(),
            size: human_bytes(record.size),
            size_bytes: record.size,
            expires_at: record.expires_at.to_rfc3339(),
            remaining: human_duration(record.remaining_at(now)),
            download_url: format!("/{}/download", record.id),
            wget_command: record
                .modes
                .wget
                .then(|| format!("wget --content-disposition '{}?mode=wget'", url)),
        }
    }
}
