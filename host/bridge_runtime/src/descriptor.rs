use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Ownership {
    UiOwned,
    BackendOwned,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigDescriptor {
    #[serde(rename = "type")]
    widget_type: String,
    title: String,
    inputs: Vec<String>,
    fields: BTreeMap<String, Ownership>,
}

#[derive(Debug, Deserialize)]
struct RawDescriptor {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    inputs: Vec<String>,
    #[serde(default)]
    fields: Vec<String>,
    #[serde(default, alias = "javascriptStateKeys")]
    javascript_state: Vec<String>,
    #[serde(default, alias = "pythonStateKeys")]
    python_state: Vec<String>,
}

impl ConfigDescriptor {
    pub fn from_json_str(widget_type: &str, raw: &str) -> Result<Self, ConfigError> {
        let raw: RawDescriptor =
            serde_json::from_str(raw).map_err(|source| ConfigError::Parse {
                widget_type: widget_type.to_string(),
                source,
            })?;
        Self::from_raw(widget_type, raw)
    }

    pub fn from_value(widget_type: &str, value: serde_json::Value) -> Result<Self, ConfigError> {
        let raw: RawDescriptor =
            serde_json::from_value(value).map_err(|source| ConfigError::Parse {
                widget_type: widget_type.to_string(),
                source,
            })?;
        Self::from_raw(widget_type, raw)
    }

    pub fn load(widget_type: &str, path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            widget_type: widget_type.to_string(),
            source,
        })?;
        Self::from_json_str(widget_type, &raw)
    }

    fn from_raw(widget_type: &str, raw: RawDescriptor) -> Result<Self, ConfigError> {
        let title = raw
            .title
            .map(|title| title.trim().to_string())
            .filter(|title| !title.is_empty())
            .ok_or_else(|| ConfigError::invalid(widget_type, "missing title"))?;

        let mut declared = BTreeSet::new();
        for field in &raw.fields {
            if !declared.insert(field.as_str()) {
                return Err(ConfigError::invalid(
                    widget_type,
                    format!("field '{field}' is declared more than once"),
                ));
            }
        }

        let ui_owned = owned_set(
            widget_type,
            "javascript_state",
            &raw.javascript_state,
            &declared,
        )?;
        let backend_owned = owned_set(widget_type, "python_state", &raw.python_state, &declared)?;

        let mut fields = BTreeMap::new();
        for field in declared {
            let ownership = match (ui_owned.contains(field), backend_owned.contains(field)) {
                (true, false) => Ownership::UiOwned,
                (false, true) => Ownership::BackendOwned,
                (true, true) => {
                    return Err(ConfigError::invalid(
                        widget_type,
                        format!("field '{field}' is both javascript_state and python_state"),
                    ));
                }
                (false, false) => {
                    return Err(ConfigError::invalid(
                        widget_type,
                        format!("field '{field}' has no ownership annotation"),
                    ));
                }
            };
            fields.insert(field.to_string(), ownership);
        }

        Ok(Self {
            widget_type: widget_type.to_string(),
            title,
            inputs: raw.inputs,
            fields,
        })
    }

    pub fn widget_type(&self) -> &str {
        &self.widget_type
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    pub fn ownership(&self, field: &str) -> Option<Ownership> {
        self.fields.get(field).copied()
    }

    pub fn is_backend_owned(&self, field: &str) -> bool {
        self.ownership(field) == Some(Ownership::BackendOwned)
    }

    pub fn is_ui_owned(&self, field: &str) -> bool {
        self.ownership(field) == Some(Ownership::UiOwned)
    }

    pub fn backend_fields(&self) -> impl Iterator<Item = &str> {
        self.fields_owned_by(Ownership::BackendOwned)
    }

    pub fn ui_fields(&self) -> impl Iterator<Item = &str> {
        self.fields_owned_by(Ownership::UiOwned)
    }

    fn fields_owned_by(&self, ownership: Ownership) -> impl Iterator<Item = &str> {
        self.fields
            .iter()
            .filter(move |(_, owner)| **owner == ownership)
            .map(|(field, _)| field.as_str())
    }
}

fn owned_set<'a>(
    widget_type: &str,
    set_name: &str,
    entries: &'a [String],
    declared: &BTreeSet<&str>,
) -> Result<BTreeSet<&'a str>, ConfigError> {
    let mut set = BTreeSet::new();
    for entry in entries {
        if !declared.contains(entry.as_str()) {
            return Err(ConfigError::invalid(
                widget_type,
                format!("{set_name} names undeclared field '{entry}'"),
            ));
        }
        set.insert(entry.as_str());
    }
    Ok(set)
}

#[derive(Debug, Default)]
pub struct DescriptorCache {
    entries: HashMap<String, Arc<ConfigDescriptor>>,
}

impl DescriptorCache {
    pub fn get(&self, widget_type: &str) -> Option<Arc<ConfigDescriptor>> {
        self.entries.get(widget_type).cloned()
    }

    pub fn load_str(
        &mut self,
        widget_type: &str,
        raw: &str,
    ) -> Result<Arc<ConfigDescriptor>, ConfigError> {
        self.get_or_try_insert(widget_type, || ConfigDescriptor::from_json_str(widget_type, raw))
    }

    pub fn load_path(
        &mut self,
        widget_type: &str,
        path: impl AsRef<Path>,
    ) -> Result<Arc<ConfigDescriptor>, ConfigError> {
        self.get_or_try_insert(widget_type, || ConfigDescriptor::load(widget_type, path))
    }

    fn get_or_try_insert<F>(
        &mut self,
        widget_type: &str,
        load: F,
    ) -> Result<Arc<ConfigDescriptor>, ConfigError>
    where
        F: FnOnce() -> Result<ConfigDescriptor, ConfigError>,
    {
        if let Some(existing) = self.entries.get(widget_type) {
            return Ok(existing.clone());
        }

        let descriptor = Arc::new(load()?);
        self.entries.insert(widget_type.to_string(), descriptor.clone());
        Ok(descriptor)
    }
}
