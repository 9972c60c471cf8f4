//! Named metadata templates with per-SIP field substitution.
//!
//! Templates live in `<templates_dir>/<name>.xml`, their schemas in
//! `<schemas_dir>/<name>.xsd`. Placeholders use the `{{field}}` form; unknown
//! fields are left untouched.

use crate::error::{Result, SipError};
use regex::Regex;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use tracing::debug;

const TEMPLATE_EXTENSION: &str = "xml";
const SCHEMA_EXTENSION: &str = "xsd";

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").expect("valid regex"))
}

/// A template available in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateInfo {
    pub name: String,
    pub path: PathBuf,
    pub has_schema: bool,
}

/// Per-SIP values substituted into templates.
#[derive(Debug, Clone, Default)]
pub struct TemplateFields {
    pub id: String,
    pub title: String,
    pub parent_id: Option<String>,
    pub level: Option<String>,
}

impl TemplateFields {
    fn lookup(&self, key: &str) -> Option<String> {
        match key {
            "id" => Some(self.id.clone()),
            "title" => Some(self.title.clone()),
            "parentid" | "parent_id" => Some(self.parent_id.clone().unwrap_or_default()),
            "level" => Some(self.level.clone().unwrap_or_else(|| "item".to_string())),
            "date" => Some(chrono::Local::now().format("%Y-%m-%d").to_string()),
            _ => None,
        }
    }
}

/// Read-only access to templates and schemas, with raw template text cached.
#[derive(Debug)]
pub struct TemplateStore {
    templates_dir: PathBuf,
    schemas_dir: PathBuf,
    cache: Mutex<HashMap<String, String>>,
}

impl TemplateStore {
    pub fn new(templates_dir: impl Into<PathBuf>, schemas_dir: impl Into<PathBuf>) -> Self {
        Self {
            templates_dir: templates_dir.into(),
            schemas_dir: schemas_dir.into(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn templates_dir(&self) -> &Path {
        &self.templates_dir
    }

    /// Templates found on disk, sorted by name. A missing directory lists nothing.
    pub fn list(&self) -> Result<Vec<TemplateInfo>> {
        let entries = match fs::read_dir(&self.templates_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(SipError::io_with_path(e, &self.templates_dir)),
        };

        let mut templates: Vec<TemplateInfo> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().and_then(|e| e.to_str()) == Some(TEMPLATE_EXTENSION))
            .filter_map(|path| {
                let name = path.file_stem()?.to_string_lossy().into_owned();
                let has_schema = self.schema_path(&name).is_some();
                Some(TemplateInfo {
                    name,
                    path,
                    has_schema,
                })
            })
            .collect();
        templates.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(templates)
    }

    /// Raw template text.
    pub fn raw(&self, name: &str) -> Result<String> {
        {
            let cache = self.cache.lock().expect("template cache lock poisoned");
            if let Some(text) = cache.get(name) {
                return Ok(text.clone());
            }
        }

        let path = self
            .templates_dir
            .join(format!("{}.{}", name, TEMPLATE_EXTENSION));
        let text = fs::read_to_string(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SipError::TemplateNotFound(name.to_string())
            } else {
                SipError::io_with_path(e, &path)
            }
        })?;
        debug!("Loaded metadata template {}", path.display());

        let mut cache = self.cache.lock().expect("template cache lock poisoned");
        cache.insert(name.to_string(), text.clone());
        Ok(text)
    }

    /// Template instantiated for one SIP.
    pub fn render(&self, name: &str, fields: &TemplateFields) -> Result<String> {
        let raw = self.raw(name)?;
        Ok(substitute(&raw, fields))
    }

    /// Schema file for a metadata type, when one is installed.
    pub fn schema_path(&self, name: &str) -> Option<PathBuf> {
        let path = self
            .schemas_dir
            .join(format!("{}.{}", name, SCHEMA_EXTENSION));
        path.is_file().then_some(path)
    }
}

fn substitute(raw: &str, fields: &TemplateFields) -> String {
    placeholder_regex()
        .replace_all(raw, |caps: &regex::Captures<'_>| {
            fields
                .lookup(&caps[1].to_lowercase())
                .map(|value| escape_xml(&value))
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

fn escape_xml(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store_with(name: &str, body: &str) -> (TempDir, TemplateStore) {
        let temp = TempDir::new().unwrap();
        let templates = temp.path().join("templates");
        let schemas = temp.path().join("schemas");
        fs::create_dir_all(&templates).unwrap();
        fs::create_dir_all(&schemas).unwrap();
        fs::write(templates.join(format!("{}.xml", name)), body).unwrap();
        fs::write(schemas.join(format!("{}.xsd", name)), "<xs:schema/>").unwrap();
        let store = TemplateStore::new(templates, schemas);
        (temp, store)
    }

    #[test]
    fn test_render_substitutes_fields() {
        let (_temp, store) = store_with("dc", "<dc><title>{{title}}</title><id>{{ id }}</id></dc>");
        let fields = TemplateFields {
            id: "sip_1".to_string(),
            title: "Letters & Notes".to_string(),
            ..Default::default()
        };

        let rendered = store.render("dc", &fields).unwrap();
        assert_eq!(
            rendered,
            "<dc><title>Letters &amp; Notes</title><id>sip_1</id></dc>"
        );
    }

    #[test]
    fn test_unknown_placeholder_is_kept() {
        let (_temp, store) = store_with("ead", "<ead>{{unknownfield}}</ead>");
        let rendered = store.render("ead", &TemplateFields::default()).unwrap();
        assert_eq!(rendered, "<ead>{{unknownfield}}</ead>");
    }

    #[test]
    fn test_missing_template() {
        let (_temp, store) = store_with("dc", "<dc/>");
        assert!(matches!(
            store.raw("mods"),
            Err(SipError::TemplateNotFound(name)) if name == "mods"
        ));
    }

    #[test]
    fn test_list_and_schema_lookup() {
        let (_temp, store) = store_with("dc", "<dc/>");
        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "dc");
        assert!(listed[0].has_schema);
        assert!(store.schema_path("ead").is_none());
    }
}
