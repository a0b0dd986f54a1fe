// SPDX-License-Identifier: MIT

//! Agent definitions
//!
//! An [`AgentDefinition`] describes how to open a sub-agent session: its
//! instructions, model and tool allow-list. Definitions are usually parsed
//! by the host from YAML or markdown front matter and registered before a
//! graph runs.

use serde::{Deserialize, Serialize};

use super::session::SessionConfig;

/// Where a definition came from, in override order (project wins)
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AgentSource {
    Project,
    User,
    #[default]
    Builtin,
}

/// Agent definition
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct AgentDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub instructions: Option<String>,
    pub model: Option<String>,
    /// Tool allow-list; `None` means the provider's default tool set
    pub tools: Option<Vec<String>>,
}

impl AgentDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            instructions: None,
            model: None,
            tools: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_tools(mut self, tools: Vec<String>) -> Self {
        self.tools = Some(tools);
        self
    }

    /// Session settings for this definition; explicit overrides win
    pub fn session_config(
        &self,
        model_override: Option<&str>,
        tools_override: Option<&[String]>,
    ) -> SessionConfig {
        SessionConfig {
            system_prompt: self.instructions.clone(),
            model: model_override
                .map(str::to_string)
                .or_else(|| self.model.clone()),
            tools: tools_override
                .map(<[String]>::to_vec)
                .or_else(|| self.tools.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_agent_definition_yaml() {
        let yaml = r#"
name: codebase-analyzer
description: "Analyzes implementation details"
instructions: "You are a code analyst."
model: opus
tools: [Read, Grep]
"#;
        let def: AgentDefinition = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(def.name, "codebase-analyzer");
        assert_eq!(def.model.as_deref(), Some("opus"));
        assert_eq!(def.tools, Some(vec!["Read".to_string(), "Grep".to_string()]));
    }

    #[test]
    fn test_minimal_definition_defaults() {
        let def: AgentDefinition = serde_yaml::from_str("name: worker").unwrap();
        assert!(def.description.is_empty());
        assert!(def.instructions.is_none());
        assert!(def.tools.is_none());
    }

    #[test]
    fn test_session_config_overrides() {
        let def = AgentDefinition::new("worker")
            .with_instructions("Be brief.")
            .with_model("haiku")
            .with_tools(vec!["Read".into()]);

        let cfg = def.session_config(None, None);
        assert_eq!(cfg.system_prompt.as_deref(), Some("Be brief."));
        assert_eq!(cfg.model.as_deref(), Some("haiku"));

        let tools = vec!["Bash".to_string()];
        let cfg = def.session_config(Some("sonnet"), Some(&tools));
        assert_eq!(cfg.model.as_deref(), Some("sonnet"));
        assert_eq!(cfg.tools, Some(tools));
    }

    #[test]
    fn test_agent_source_default() {
        assert_eq!(AgentSource::default(), AgentSource::Builtin);
    }
}
