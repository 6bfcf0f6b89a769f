use serde::{Deserialize, Serialize};

/// How a preset's stored tags or expression combine into a filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresetStrategy {
    Or,
    And,
    Advanced,
}

/// A named, pre-stored tag filter (`[presets.<name>]`).
///
/// `or` / `and` presets carry a tag list; `advanced` presets carry a raw
/// expression in the `tag-filter` grammar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresetConfig {
    pub strategy: PresetStrategy,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
}

impl PresetConfig {
    /// Render the preset back into `tag-filter` expression syntax.
    pub fn to_expression(&self) -> Option<String> {
        match self.strategy {
            PresetStrategy::Or => {
                if self.tags.is_empty() {
                    return None;
                }
                Some(self.tags.join(","))
            }
            PresetStrategy::And => {
                if self.tags.is_empty() {
                    return None;
                }
                Some(self.tags.join("+"))
            }
            PresetStrategy::Advanced => self.expression.clone(),
        }
    }
}
