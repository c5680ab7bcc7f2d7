use serde::{Deserialize, Serialize};

// OpenAI-compatible chat completion request
#[derive(Debug, Serialize, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
}

#[derive(Debug, Serialize, Clone)]
pub struct ChatMessage {
    pub role: String,
    pub content: MessageContent,
}

impl ChatMessage {
    pub fn user(content: MessageContent) -> Self {
        Self {
            role: "user".to_string(),
            content,
        }
    }
}

// plain string, or a list of typed parts for multimodal input
#[derive(Debug, Serialize, Clone)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Serialize, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize, Clone)]
pub struct ImageUrl {
    pub url: String,
}

// only the fields the gateway reads
#[derive(Debug, Deserialize, Clone)]
pub struct ChatResponse {
    pub choices: Vec<Choice>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Choice {
    pub message: ResponseMessage,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ResponseMessage {
    pub content: Option<String>,
}

impl ChatResponse {
    pub fn into_content(self) -> Option<String> {
        self.choices.into_iter().next().and_then(|c| c.message.content)
    }
}

// Body of a successful POST /analyze_medical_report
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AnalyzeResponse {
    pub analysis_result: String,
    pub health_recommendations: String,
    pub processing_time: f64,
    pub analysis_time: f64,
    pub recommendation_time: f64,
    pub cache_hit: bool,
}
