//! Quest templates: a name plus JSON parameters rendered into a [`QuestDesc`].

use crate::config::TemplateConfig;
use crate::models::{QuestDesc, QuestMeta, TemplateSpec};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt::Debug;

pub trait TemplateRenderer: Send + Sync + Debug {
    /// Render `name` with `parameters`. Errors are reported back to the caller
    /// per template, so they are plain messages.
    fn render(&self, name: &str, parameters: &Value) -> Result<(QuestDesc, TemplateSpec), String>;
}

/// Templates defined in configuration
#[derive(Debug, Clone, Default)]
pub struct StaticTemplates {
    templates: HashMap<String, TemplateConfig>,
}

impl StaticTemplates {
    pub fn new(templates: HashMap<String, TemplateConfig>) -> Self {
        Self { templates }
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.templates.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

fn as_object(value: &Value, what: &str) -> Result<Map<String, Value>, String> {
    match value {
        Value::Null => Ok(Map::new()),
        Value::Object(map) => Ok(map.clone()),
        _ => Err(format!("{what} must be a JSON object")),
    }
}

impl TemplateRenderer for StaticTemplates {
    fn render(&self, name: &str, parameters: &Value) -> Result<(QuestDesc, TemplateSpec), String> {
        let template = self
            .templates
            .get(name)
            .ok_or_else(|| format!("unknown template {name:?}"))?;

        let mut merged = as_object(&template.defaults, "template defaults")?;
        merged.extend(as_object(parameters, "template parameters")?);
        if let Some(missing) = template.required.iter().find(|k| !merged.contains_key(*k)) {
            return Err(format!("template {name:?} requires parameter {missing:?}"));
        }

        let desc = QuestDesc {
            distributor_config_name: template.distributor_config_name.clone(),
            parameters: Value::Object(merged),
            distributor_parameters: template.distributor_parameters.clone(),
            meta: QuestMeta::default(),
        };
        let spec = TemplateSpec {
            name: name.to_string(),
            version: template.version.clone(),
        };
        Ok((desc, spec))
    }
}
