//! Quality evaluation of generated images.
//!
//! The evaluator is an external collaborator and strictly best-effort: when
//! it is disabled or unreachable, an image is auto-accepted at exactly the
//! threshold score rather than blocking the pipeline.

use async_trait::async_trait;
use serde::Deserialize;

use crate::backend::{GeneratedImage, SceneRequest};
use crate::config::QualityConfig;
use crate::llm::{parse_json_reply, ChatClient};
use crate::Result;

/// Per-factor breakdown on the 0–10 scale.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FactorScores {
    pub prompt_match: f64,
    pub composition: f64,
    pub vertical_format: f64,
    pub artifacts: f64,
    pub narrative_fit: f64,
}

/// One evaluation result. Ephemeral — consumed immediately by the quality
/// gate to decide accept vs. retry.
#[derive(Debug, Clone)]
pub struct QualityScore {
    pub overall: f64,
    pub factors: FactorScores,
    pub analysis: String,
    /// Free-text improvement suggestion, fed back into the next draft.
    pub suggestion: Option<String>,
}

impl QualityScore {
    /// Score used when evaluation is unavailable: exactly the threshold, so
    /// the image passes the gate without inflating reported quality.
    pub fn auto_accept(threshold: f64) -> Self {
        Self {
            overall: threshold,
            factors: FactorScores::default(),
            analysis: "quality evaluation unavailable".to_string(),
            suggestion: None,
        }
    }
}

#[async_trait]
pub trait QualityEvaluator: Send + Sync {
    async fn score(&self, image: &GeneratedImage, request: &SceneRequest) -> Result<QualityScore>;
}

#[derive(Deserialize)]
struct EvaluationReply {
    overall_score: f64,
    #[serde(default)]
    factor_scores: FactorScores,
    #[serde(default)]
    analysis: String,
    #[serde(default)]
    refinement_suggestions: Vec<String>,
}

const EVALUATE_SYSTEM: &str = "You are an expert image quality analyst for vertical short-video backgrounds. \
Based on the prompt and context provided, evaluate the generated image's likely quality. \
Rate each requested factor on a scale of 1-10 and respond with JSON: \
{\"overall_score\": 8.5, \"factor_scores\": {\"prompt_match\": 8, \"composition\": 9, \"vertical_format\": 7, \"artifacts\": 9, \"narrative_fit\": 8}, \
\"analysis\": \"...\", \"refinement_suggestions\": [\"...\"]}";

pub struct LlmQualityEvaluator {
    chat: Option<ChatClient>,
    threshold: f64,
    factors: Vec<String>,
}

impl LlmQualityEvaluator {
    pub fn new(chat: ChatClient, config: &QualityConfig) -> Self {
        Self {
            chat: config.enabled.then_some(chat),
            threshold: config.threshold,
            factors: config.factors.clone(),
        }
    }

    /// Evaluator that accepts everything at the threshold score.
    pub fn disabled(config: &QualityConfig) -> Self {
        Self {
            chat: None,
            threshold: config.threshold,
            factors: Vec::new(),
        }
    }
}

#[async_trait]
impl QualityEvaluator for LlmQualityEvaluator {
    async fn score(&self, image: &GeneratedImage, request: &SceneRequest) -> Result<QualityScore> {
        let Some(chat) = &self.chat else {
            return Ok(QualityScore::auto_accept(self.threshold));
        };

        let mut user = format!(
            "Analyze this short-video background generation:\n\n\
             Original Prompt: {}\nNegative Prompt: {}\nScene Description: {}\n\
             Generated by backend: {} in {:.1}s\nFactors to score: {}\n",
            image.params.prompt,
            image.params.negative_prompt,
            request.description,
            image.backend,
            image.elapsed.as_secs_f64(),
            self.factors.join(", "),
        );
        if let Some(context) = &request.context {
            let preview: String = context.narration.chars().take(200).collect();
            user.push_str(&format!(
                "Video Title: {}\nTopic: {}\nScript Context: {}\n",
                context.title, context.topic, preview
            ));
        }
        user.push_str("\nEvaluate the quality of the prompt and likely resulting image.");

        let reply = chat.complete(EVALUATE_SYSTEM, &user).await?;
        let parsed: EvaluationReply = parse_json_reply(&reply)?;

        let suggestion = if parsed.refinement_suggestions.is_empty() {
            None
        } else {
            Some(parsed.refinement_suggestions.join("; "))
        };
        Ok(QualityScore {
            overall: parsed.overall_score.clamp(0.0, 10.0),
            factors: parsed.factor_scores,
            analysis: parsed.analysis,
            suggestion,
        })
    }
}
