//! Interactive tools exposed via Model Context Protocol
//!
//! Provides the eyes (`eyes_analyze`, `eyes_compare`), hands (`hands_gen_image`)
//! and mouth (`mouth_speak`) tools by validating arguments and delegating to the
//! configured `MediaProvider`.

use chrono::{SecondsFormat, Utc};
use rust_mcp_sdk::{
    macros,
    schema::{CallToolRequestParams, CallToolResult, ContentBlock, TextContent, Tool},
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::domain::provider::{MediaOutput, MediaProvider};
use crate::domain::utils::{
    normalize_choice, require_source, require_text, MAX_PROMPT_CHARS, MAX_SPEECH_CHARS,
    VALID_ASPECT_RATIOS, VALID_DETAIL_LEVELS,
};
use crate::errors::AppError;
use crate::mcp::rpc::{
    app_error_to_json_rpc, json_rpc_error, json_rpc_error_with_data, json_rpc_result,
    INVALID_PARAMS, METHOD_NOT_FOUND,
};

#[macros::mcp_tool(
    name = "eyes_analyze",
    description = "Analyze an image, screenshot or video and describe what it shows"
)]
#[derive(Debug, Clone, Deserialize, Serialize, macros::JsonSchema)]
pub struct EyesAnalyzeTool {
    pub source: String,
    pub focus: Option<String>,
    pub detail: Option<String>,
}

#[macros::mcp_tool(
    name = "eyes_compare",
    description = "Compare two images and report the visual differences"
)]
#[derive(Debug, Clone, Deserialize, Serialize, macros::JsonSchema)]
pub struct EyesCompareTool {
    pub source1: String,
    pub source2: String,
    pub focus: Option<String>,
}

#[macros::mcp_tool(
    name = "hands_gen_image",
    description = "Generate an image from a text prompt"
)]
#[derive(Debug, Clone, Deserialize, Serialize, macros::JsonSchema)]
pub struct HandsGenImageTool {
    pub prompt: String,
    pub style: Option<String>,
    pub aspect_ratio: Option<String>,
    pub negative_prompt: Option<String>,
}

#[macros::mcp_tool(name = "mouth_speak", description = "Convert text to natural speech audio")]
#[derive(Debug, Clone, Deserialize, Serialize, macros::JsonSchema)]
pub struct MouthSpeakTool {
    pub text: String,
    pub voice: Option<String>,
    pub language: Option<String>,
}

pub fn build_tools_list() -> Vec<Tool> {
    vec![
        EyesAnalyzeTool::tool(),
        EyesCompareTool::tool(),
        HandsGenImageTool::tool(),
        MouthSpeakTool::tool(),
    ]
}

fn parse_arguments<T: DeserializeOwned>(arguments: Option<Map<String, Value>>) -> Result<T, AppError> {
    serde_json::from_value(Value::Object(arguments.unwrap_or_default())).map_err(|err| {
        AppError::invalid_params("invalid_arguments", format!("invalid tool arguments: {err}"), None)
    })
}

pub fn validate_analyze(mut request: EyesAnalyzeTool) -> Result<EyesAnalyzeTool, AppError> {
    request.source = require_source("source", &request.source)?;
    request.detail = normalize_choice("detail", request.detail, &VALID_DETAIL_LEVELS)?;
    request.focus = request
        .focus
        .map(|focus| focus.trim().to_string())
        .filter(|focus| !focus.is_empty());
    Ok(request)
}

pub fn validate_compare(mut request: EyesCompareTool) -> Result<EyesCompareTool, AppError> {
    request.source1 = require_source("source1", &request.source1)?;
    request.source2 = require_source("source2", &request.source2)?;
    Ok(request)
}

pub fn validate_gen_image(mut request: HandsGenImageTool) -> Result<HandsGenImageTool, AppError> {
    request.prompt = require_text("prompt", &request.prompt, MAX_PROMPT_CHARS)?;
    request.aspect_ratio = normalize_choice("aspect_ratio", request.aspect_ratio, &VALID_ASPECT_RATIOS)?;
    Ok(request)
}

pub fn validate_speak(mut request: MouthSpeakTool) -> Result<MouthSpeakTool, AppError> {
    request.text = require_text("text", &request.text, MAX_SPEECH_CHARS)?;
    Ok(request)
}

async fn dispatch(
    provider: &dyn MediaProvider,
    name: &str,
    arguments: Option<Map<String, Value>>,
) -> Option<Result<MediaOutput, AppError>> {
    let outcome = match name {
        "eyes_analyze" => match parse_arguments(arguments).and_then(validate_analyze) {
            Ok(request) => provider.analyze(&request).await,
            Err(err) => Err(err),
        },
        "eyes_compare" => match parse_arguments(arguments).and_then(validate_compare) {
            Ok(request) => provider.compare(&request).await,
            Err(err) => Err(err),
        },
        "hands_gen_image" => match parse_arguments(arguments).and_then(validate_gen_image) {
            Ok(request) => provider.generate_image(&request).await,
            Err(err) => Err(err),
        },
        "mouth_speak" => match parse_arguments(arguments).and_then(validate_speak) {
            Ok(request) => provider.speak(&request).await,
            Err(err) => Err(err),
        },
        _ => return None,
    };

    Some(outcome)
}

pub async fn handle_tools_call(
    provider: &dyn MediaProvider,
    id: Option<Value>,
    params: Option<Value>,
) -> Value {
    let Some(raw_params) = params else {
        return json_rpc_error(id, INVALID_PARAMS, "Invalid params");
    };

    let tool_call: CallToolRequestParams = match serde_json::from_value(raw_params) {
        Ok(value) => value,
        Err(_) => return json_rpc_error(id, INVALID_PARAMS, "Invalid params"),
    };

    match dispatch(provider, &tool_call.name, tool_call.arguments).await {
        Some(Ok(output)) => {
            let generated_at_utc = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
            let mut structured = output.data;
            structured.insert("generated_at_utc".to_string(), json!(generated_at_utc));

            json_rpc_result(
                id,
                serde_json::to_value(CallToolResult {
                    content: vec![ContentBlock::from(TextContent::new(
                        output.summary,
                        None,
                        None,
                    ))],
                    is_error: None,
                    meta: None,
                    structured_content: Some(structured),
                })
                .expect("tool result serialization"),
            )
        }
        Some(Err(err)) => app_error_to_json_rpc(id, err),
        None => json_rpc_error_with_data(
            id,
            METHOD_NOT_FOUND,
            "Method not found",
            Some(json!({
                "code": "tool_not_found",
                "message": "unknown tool name",
                "details": {
                    "name": tool_call.name,
                },
            })),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lists_all_tools_in_order() {
        let names = build_tools_list()
            .into_iter()
            .map(|tool| tool.name)
            .collect::<Vec<_>>();
        assert_eq!(
            names,
            vec!["eyes_analyze", "eyes_compare", "hands_gen_image", "mouth_speak"]
        );
    }

    #[test]
    fn rejects_unknown_aspect_ratio() {
        let error = validate_gen_image(HandsGenImageTool {
            prompt: "a lighthouse at dusk".to_string(),
            style: None,
            aspect_ratio: Some("2:1".to_string()),
            negative_prompt: None,
        })
        .expect_err("expected invalid aspect ratio");
        assert!(error.to_string().contains("bad request"));
    }

    #[test]
    fn trims_speech_text() {
        let request = validate_speak(MouthSpeakTool {
            text: "  hello there  ".to_string(),
            voice: None,
            language: None,
        })
        .expect("valid speech request");
        assert_eq!(request.text, "hello there");
    }

    #[test]
    fn compare_requires_both_sources() {
        let error = validate_compare(EyesCompareTool {
            source1: "https://example.com/a.png".to_string(),
            source2: " ".to_string(),
            focus: None,
        })
        .expect_err("expected missing source2");
        assert!(error.to_string().contains("source2"));
    }
}
