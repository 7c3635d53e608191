//! services/api/src/adapters/annotation_llm.rs
//!
//! This module contains the adapter for the annotation-extracting LLM.
//! It implements the `StructuredCompletionService` port from the `core` crate.

use async_openai::{
    config::OpenAIConfig,
    error::OpenAIError,
    types::chat::{
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequestArgs,
    },
    Client,
};
use async_trait::async_trait;
use textlift_core::ports::{PortError, PortResult, StructuredCompletionService};

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// An adapter that implements `StructuredCompletionService` using an OpenAI-compatible LLM.
#[derive(Clone)]
pub struct OpenAiAnnotationAdapter {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAiAnnotationAdapter {
    /// Creates a new `OpenAiAnnotationAdapter`.
    pub fn new(client: Client<OpenAIConfig>, model: String) -> Self {
        Self { client, model }
    }
}

//=========================================================================================
// `StructuredCompletionService` Trait Implementation
//=========================================================================================

#[async_trait]
impl StructuredCompletionService for OpenAiAnnotationAdapter {
    /// Sends one extraction prompt and returns the raw reply, which the core validates.
    async fn complete_structured(&self, prompt: &str) -> PortResult<String> {
        let messages = vec![
            ChatCompletionRequestSystemMessageArgs::default()
                .content("You reply with a single JSON array and nothing else.")
                .build()
                .map_err(|e| PortError::Unexpected(e.to_string()))?
                .into(),
            ChatCompletionRequestUserMessageArgs::default()
                .content(prompt)
                .build()
                .map_err(|e| PortError::Unexpected(e.to_string()))?
                .into(),
        ];

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(messages)
            .temperature(0.0)
            .n(1)
            .build()
            .map_err(|e| PortError::Unexpected(e.to_string()))?;

        // Map the client error by hand; the orphan rule rules out a `From` impl.
        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(|e: OpenAIError| PortError::Unexpected(e.to_string()))?;

        response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| PortError::Unexpected("Annotation LLM returned no choices in its response.".to_string()))?
            .message
            .content
            .ok_or_else(|| {
                PortError::Unexpected("Annotation LLM response contained no text content.".to_string())
            })
    }
}
