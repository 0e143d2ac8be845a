//! Media provider seam
//!
//! The model-backed work behind every tool (image understanding, generation,
//! speech synthesis) lives behind `MediaProvider`. Deployments plug in a real
//! backend; the server itself ships only `UnconfiguredProvider`.

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::domain::tools::{EyesAnalyzeTool, EyesCompareTool, HandsGenImageTool, MouthSpeakTool};
use crate::errors::AppError;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MediaOutput {
    pub summary: String,
    pub data: Map<String, Value>,
}

#[async_trait]
pub trait MediaProvider: Send + Sync {
    async fn analyze(&self, request: &EyesAnalyzeTool) -> Result<MediaOutput, AppError>;
    async fn compare(&self, request: &EyesCompareTool) -> Result<MediaOutput, AppError>;
    async fn generate_image(&self, request: &HandsGenImageTool) -> Result<MediaOutput, AppError>;
    async fn speak(&self, request: &MouthSpeakTool) -> Result<MediaOutput, AppError>;
}

#[derive(Debug, Default)]
pub struct UnconfiguredProvider;

impl UnconfiguredProvider {
    pub fn new() -> Self {
        Self
    }

    fn unavailable() -> AppError {
        AppError::not_implemented(
            "provider_unavailable",
            "no media provider is configured for this server",
        )
    }
}

#[async_trait]
impl MediaProvider for UnconfiguredProvider {
    async fn analyze(&self, _request: &EyesAnalyzeTool) -> Result<MediaOutput, AppError> {
        Err(Self::unavailable())
    }

    async fn compare(&self, _request: &EyesCompareTool) -> Result<MediaOutput, AppError> {
        Err(Self::unavailable())
    }

    async fn generate_image(&self, _request: &HandsGenImageTool) -> Result<MediaOutput, AppError> {
        Err(Self::unavailable())
    }

    async fn speak(&self, _request: &MouthSpeakTool) -> Result<MediaOutput, AppError> {
        Err(Self::unavailable())
    }
}
