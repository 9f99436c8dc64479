use orakle_protocol::skill_wire::{MatcherInfo, SkillManifestEntry};
use serde_json::Value;

/// A capability exposed by a remote skill server (data model §3). Built from
/// a [`SkillManifestEntry`] fetched over the wire; `ui` is normalized into a
/// typed shape here even though the wire form is a free-form JSON value.
#[derive(Debug, Clone)]
pub struct SkillDescriptor {
    pub name: String,
    pub description: String,
    pub matcher_info: MatcherInfo,
    pub parameters: Vec<SkillParameter>,
    pub skill_type: SkillType,
    pub ui: Option<UiInfo>,
    pub embeddings_boost_factor: f32,
}

#[derive(Debug, Clone)]
pub struct SkillParameter {
    pub name: String,
    pub param_type: String,
    pub description: Option<String>,
    pub required: bool,
    pub default: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkillType {
    Regular,
    Ui,
}

#[derive(Debug, Clone)]
pub struct UiInfo {
    pub component: Option<String>,
    pub vendor: Option<String>,
    pub bundle: Option<String>,
}

impl SkillDescriptor {
    pub fn from_manifest_entry(name: &str, entry: SkillManifestEntry) -> Self {
        let mut parameters: Vec<SkillParameter> = entry
            .run_info
            .parameters
            .into_iter()
            .map(|(name, p)| SkillParameter {
                name,
                param_type: p.param_type,
                description: p.description,
                required: p.required,
                default: p.default,
            })
            .collect();
        parameters.sort_by(|a, b| a.name.cmp(&b.name));

        let skill_type = match entry.skill_type.as_deref() {
            Some("ui") => SkillType::Ui,
            _ => SkillType::Regular,
        };

        let ui = entry.ui.as_ref().and_then(|v| v.as_object()).map(|obj| UiInfo {
            component: obj.get("component").and_then(|v| v.as_str()).map(str::to_string),
            vendor: entry
                .vendor
                .clone()
                .or_else(|| obj.get("vendor").and_then(|v| v.as_str()).map(str::to_string)),
            bundle: entry
                .bundle
                .clone()
                .or_else(|| obj.get("bundle").and_then(|v| v.as_str()).map(str::to_string)),
        });

        Self {
            name: name.to_string(),
            description: entry.description,
            matcher_info: entry.matcher_info,
            parameters,
            skill_type,
            ui,
            embeddings_boost_factor: entry.embeddings_boost_factor.unwrap_or(1.0),
        }
    }
}
