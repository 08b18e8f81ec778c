use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::core::error::EstimateError;
use crate::core::iac::IacType;

pub const JSON_ONLY_INSTRUCTION: &str = "You're an assistant that only speaks JSON. Do not write normal text. Strictly start your response with { and end with }. Entire responses should be valid JSON.";

const RESPONSE_FORMAT: &str = r#"{
    "analysis_note": string, // descriptive analysis and your thought process in approaching the problem
    "resources_names": string[],
    "resources": {
        "resource_name": string,
        "resource_type": string,
        "change_to_resource": string, // change to the resource, e.g. "create", "update", "increase memory" etc
        "base_cost_analysis": string, // thought process and cost breakdown
        "base_cost": number,
        "average_usage_assumptions_and_analysis": string, // assumptions and analysis for average usage including cost breakdown
        "average_usage_cost": number,
        "high_usage_assumptions_and_analysis": string, // assumptions and analysis for high usage including cost breakdown
        "high_usage_cost": number,
        "low_usage_assumptions_and_analysis": string, // assumptions and analysis for low usage including cost breakdown
        "low_usage_cost": number,
        "notes": string[] // notes about the cost estimation
    }[]
}"#;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PromptTemplate {
    pub prompt: String,
    pub response_format: String,
}

impl PromptTemplate {
    pub fn for_tool(tool_name: &str) -> Self {
        Self {
            prompt: cost_prompt(tool_name),
            response_format: RESPONSE_FORMAT.to_string(),
        }
    }

    /// Prompt body followed by the preview document.
    pub fn render(&self, content: &str) -> String {
        format!("{}\n\n{}", self.prompt.trim_end(), content)
    }
}

/// Read-only tag → template mapping shared by every backend.
#[derive(Debug, Clone, Default)]
pub struct PromptTemplates {
    templates: HashMap<String, PromptTemplate>,
}

impl PromptTemplates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn standard() -> Self {
        IacType::ALL.iter().fold(Self::new(), |templates, iac_type| {
            templates.with(iac_type.as_str(), PromptTemplate::for_tool(iac_type.display_name()))
        })
    }

    pub fn with(mut self, tag: &str, template: PromptTemplate) -> Self {
        self.templates.insert(tag.to_string(), template);
        self
    }

    pub fn get(&self, tag: &str) -> Result<&PromptTemplate, EstimateError> {
        self.templates
            .get(tag)
            .ok_or_else(|| EstimateError::UnknownIacType(tag.to_string()))
    }
}

fn cost_prompt(tool_name: &str) -> String {
    format!(
        r#"Analyze the following {tool} preview JSON output and provide a cost estimation report based on your knowledge of common AWS/Azure (or other relevant provider) pricing. The report should meet these requirements:

1. Examine the planned changes in the {tool} preview JSON.
2. Identify all resources that will be added, modified, or deleted.
3. Provide estimated costs by making reasonable assumptions based on general knowledge of AWS/Azure (or other relevant provider) pricing. If exact prices are unknown, provide an estimated guess.
4. Calculate estimated monthly costs for:
   - Base Cost (fixed monthly charges)
   - Variable Cost scenarios based on the resource type. Define appropriate usage tiers for each resource:
     * Low Usage (minimal expected usage)
     * Average Usage (moderate expected usage)
     * High Usage (heavy expected usage)
5. If a cost estimation is not possible, return null for the numeric fields instead of omitting them.

Format the response as a structured JSON with the following fields:
{format}

Do not include any other text or comments in your response. Response should be json only.

Here's the {tool} preview JSON:"#,
        tool = tool_name,
        format = RESPONSE_FORMAT,
    )
}
