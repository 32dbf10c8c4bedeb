//! Classifier backed by a chat-completion gateway.
//!
//! Each category carries its own instruction. The model is asked for a JSON
//! object `{"detected": true|false|null, "confidence": 0..1}`; anything else
//! is a malformed response.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::{Classification, Classifier, ClassifierError};
use crate::gateway::{
    Attribution, ChatGateway, ChatModel, ChatRequest, FinishReason, Message, ProviderError,
};
use crate::ledger::Detected;
use crate::source::Category;

const OUTPUT_CONTRACT: &str = "Respond with a single JSON object and nothing else: \
{\"detected\": true | false | null, \"confidence\": <number between 0 and 1>}. \
Use null when the text does not allow a decision.";

pub struct ChatClassifier {
    gateway: Arc<dyn ChatGateway>,
    model: ChatModel,
    instructions: BTreeMap<Category, String>,
    max_tokens: u32,
    experiment_id: Option<String>,
}

impl ChatClassifier {
    pub fn new(gateway: Arc<dyn ChatGateway>, model: ChatModel) -> Self {
        Self {
            gateway,
            model,
            instructions: BTreeMap::new(),
            max_tokens: 200,
            experiment_id: None,
        }
    }

    /// What "detected" means for `category`.
    pub fn instruction(mut self, category: Category, instruction: impl Into<String>) -> Self {
        self.instructions.insert(category, instruction.into());
        self
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Tag every request with the experiment it serves.
    pub fn for_experiment(mut self, experiment_id: impl Into<String>) -> Self {
        self.experiment_id = Some(experiment_id.into());
        self
    }

    fn request(&self, text: &str, category: &Category) -> Result<ChatRequest, ClassifierError> {
        let instruction = self.instructions.get(category).ok_or_else(|| {
            ClassifierError::Config(format!("no instruction for category {category}"))
        })?;
        let system = format!(
            "You are a triage classifier for the category \"{category}\".\n{instruction}\n\n{OUTPUT_CONTRACT}"
        );
        let messages = vec![Message::system(system), Message::user(text)];
        let mut attribution = Attribution::new("classifier::chat");
        if let Some(experiment_id) = &self.experiment_id {
            attribution = attribution.with_experiment(experiment_id.clone());
        }
        Ok(ChatRequest::new(self.model.clone(), messages, attribution)
            .temperature(0.0)
            .max_tokens(self.max_tokens)
            .json())
    }
}

#[async_trait]
impl Classifier for ChatClassifier {
    async fn classify(
        &self,
        text: &str,
        category: &Category,
    ) -> Result<Classification, ClassifierError> {
        let request = self.request(text, category)?;
        let response = match self.gateway.chat(request).await {
            Ok(response) => response,
            Err(ProviderError::Refused { message, .. }) => {
                // A refusal is an answer about this input, not a service failure.
                let mut classification = Classification::new(Detected::Unknown, None);
                classification.error = Some(format!("refused: {message}"));
                return Ok(classification);
            }
            Err(e) => return Err(e.into()),
        };
        match response.finish_reason {
            FinishReason::ContentFilter => {
                let mut classification = Classification::new(Detected::Unknown, None);
                classification.raw_output = response.content;
                classification.error = Some("content filtered".to_string());
                Ok(classification)
            }
            FinishReason::Length => parse_classification(&response.content).map_err(|e| {
                ClassifierError::Malformed(format!(
                    "reply truncated at {} tokens: {e}",
                    self.max_tokens
                ))
            }),
            FinishReason::Stop => parse_classification(&response.content),
        }
    }
}

/// Parse a model response into a classification.
///
/// Accepts prose around the JSON object. `detected` may be a boolean, null,
/// or one of the strings "true", "false", "unknown". Confidence is clamped to
/// [0, 1].
pub fn parse_classification(raw: &str) -> Result<Classification, ClassifierError> {
    let json = extract_json(raw);
    let value: Value = serde_json::from_str(json)
        .map_err(|e| ClassifierError::Malformed(format!("{e}: {}", truncate(raw, 120))))?;
    let object = value
        .as_object()
        .ok_or_else(|| ClassifierError::Malformed("expected a JSON object".into()))?;

    let detected = match object.get("detected") {
        Some(Value::Bool(b)) => Detected::from_bool(*b),
        Some(Value::Null) => Detected::Unknown,
        Some(Value::String(s)) => Detected::parse(&s.trim().to_ascii_lowercase())
            .ok_or_else(|| ClassifierError::Malformed(format!("unrecognised detected value {s:?}")))?,
        Some(other) => {
            return Err(ClassifierError::Malformed(format!(
                "unrecognised detected value {other}"
            )))
        }
        None => return Err(ClassifierError::Malformed("missing \"detected\" field".into())),
    };

    let confidence = match object.get("confidence") {
        None | Some(Value::Null) => None,
        Some(Value::Number(n)) => n.as_f64().filter(|c| c.is_finite()).map(|c| c.clamp(0.0, 1.0)),
        Some(other) => {
            return Err(ClassifierError::Malformed(format!(
                "confidence must be a number, got {other}"
            )))
        }
    };

    let mut classification = Classification::new(detected, confidence);
    classification.raw_output = raw.to_string();
    Ok(classification)
}

fn extract_json(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(start) = trimmed.find('{') else {
        return trimmed;
    };
    let remainder = &trimmed[start..];
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape = false;
    for (i, c) in remainder.char_indices() {
        if escape {
            escape = false;
            continue;
        }
        match c {
            '\\' if in_string => escape = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return &remainder[..=i];
                }
            }
            _ => {}
        }
    }
    trimmed
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_chars).collect();
        format!("{head}...")
    }
}
