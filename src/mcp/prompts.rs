//! The prompt catalogue — reusable message templates a client requests via
//! `prompts/get`.

use async_trait::async_trait;
use serde_json::Value;

use crate::errors::FlyError;

use super::registry::{PromptStrategy, PromptVariable};

/// Asks the assistant to scaffold a new project from a named template,
/// nudging it to run the compatibility gate before applying.
struct ScaffoldTemplatePrompt;

const SCAFFOLD_VARIABLES: &[PromptVariable] = &[
    PromptVariable {
        name: "templateName",
        required: true,
        description: "Name of the template to scaffold from.",
    },
    PromptVariable {
        name: "projectName",
        required: true,
        description: "Name of the new project.",
    },
    PromptVariable {
        name: "version",
        required: false,
        description: "Template version constraint, e.g. \"^2.0.0\". Defaults to latest.",
    },
];

#[async_trait]
impl PromptStrategy for ScaffoldTemplatePrompt {
    fn id(&self) -> &str {
        "fly.scaffold_template"
    }

    fn title(&self) -> &str {
        "Scaffold a Flutter project from a template"
    }

    fn description(&self) -> &str {
        "Produces a message asking the assistant to scaffold a new Flutter project from a named template, checking compatibility first."
    }

    fn variables(&self) -> &[PromptVariable] {
        SCAFFOLD_VARIABLES
    }

    async fn render(&self, arguments: &Value) -> Result<Value, FlyError> {
        let template_name = arguments.get("templateName").and_then(|v| v.as_str()).unwrap_or("");
        let project_name = arguments.get("projectName").and_then(|v| v.as_str()).unwrap_or("");
        let version = arguments.get("version").and_then(|v| v.as_str());

        let version_clause = match version {
            Some(v) => format!(" at version {v}"),
            None => " at the latest compatible version".to_string(),
        };
        let text = format!(
            "Scaffold a new Flutter project named '{project_name}' using the '{template_name}' \
             template{version_clause}. Call fly.template.list to confirm the version resolves, \
             then fly.template.apply to bring it into the workspace. Stop and report back if the \
             compatibility gate reports any errors."
        );

        Ok(serde_json::json!({
            "messages": [
                { "role": "user", "content": { "type": "text", "text": text } }
            ]
        }))
    }
}

/// Build the prompt strategy table.
pub fn catalogue() -> Vec<Box<dyn PromptStrategy>> {
    vec![Box::new(ScaffoldTemplatePrompt)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn renders_a_user_message_mentioning_both_names() {
        let prompt = ScaffoldTemplatePrompt;
        let rendered = prompt
            .render(&serde_json::json!({ "templateName": "riverpod", "projectName": "my_app" }))
            .await
            .unwrap();
        let text = rendered["messages"][0]["content"]["text"].as_str().unwrap();
        assert!(text.contains("riverpod"));
        assert!(text.contains("my_app"));
    }

    #[test]
    fn declares_two_required_variables() {
        let prompt = ScaffoldTemplatePrompt;
        let required: Vec<&str> = prompt.variables().iter().filter(|v| v.required).map(|v| v.name).collect();
        assert_eq!(required, vec!["templateName", "projectName"]);
    }
}
