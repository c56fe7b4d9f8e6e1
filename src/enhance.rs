//! Prompt enhancement.
//!
//! Expands a raw scene description into a diffusion-ready prompt with
//! style/continuity cues and a negative prompt. Enhancement is an
//! optimization, never a correctness requirement: every failure path here
//! degrades to [`fallback_enhancement`], which appends the standard
//! vertical-format suffix and stock negative prompt to the raw description.
//!
//! Two stages, both best-effort:
//!
//! 1. [`PromptEnhancer::analyze`] — one up-front pass over the script
//!    (title, topic, narration) that yields style cues reused for every
//!    scene of the run.
//! 2. [`PromptEnhancer::enhance`] — per-scene expansion, aware of the
//!    scene's role in the narrative arc and of any quality-evaluator
//!    feedback from a previous attempt.

use async_trait::async_trait;
use serde::Deserialize;

use crate::backend::{SceneRequest, ScriptContext};
use crate::llm::{parse_json_reply, ChatClient};
use crate::Result;

/// Vertical-format cue appended to every prompt that lacks one.
const VERTICAL_SUFFIX: &str = "vertical composition, portrait orientation, 9:16 aspect ratio";

const QUALITY_BOOSTERS: &[&str] = &[
    "high quality",
    "detailed",
    "cinematic",
    "professional photography",
    "vibrant colors",
    "sharp focus",
    "mobile optimized",
];

const STANDARD_NEGATIVES: &[&str] = &[
    "blurry",
    "low quality",
    "distorted",
    "ugly",
    "bad composition",
    "horizontal",
    "landscape orientation",
    "text",
    "watermark",
];

/// Style cues derived from the whole script, shared across scenes.
#[derive(Debug, Clone)]
pub struct NarrativeStyle {
    pub mood: String,
    pub visual_style: String,
    pub color_palette: String,
    pub lighting: String,
    pub composition: String,
}

impl Default for NarrativeStyle {
    fn default() -> Self {
        Self {
            mood: "engaging".to_string(),
            visual_style: "cinematic".to_string(),
            color_palette: "vibrant".to_string(),
            lighting: "dramatic".to_string(),
            composition: "dynamic".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EnhancedPrompt {
    pub prompt: String,
    pub negative_prompt: String,
}

#[async_trait]
pub trait PromptEnhancer: Send + Sync {
    /// Analyze the script once to derive run-wide style cues.
    async fn analyze(&self, context: &ScriptContext) -> Result<NarrativeStyle>;

    /// Expand one scene description. `suggestion` carries quality-evaluator
    /// feedback from the previous attempt, when present.
    async fn enhance(
        &self,
        request: &SceneRequest,
        style: Option<&NarrativeStyle>,
        suggestion: Option<&str>,
    ) -> Result<EnhancedPrompt>;
}

/// Deterministic enhancement used when no language model is reachable.
pub fn fallback_enhancement(description: &str) -> EnhancedPrompt {
    EnhancedPrompt {
        prompt: format!(
            "{description}, {VERTICAL_SUFFIX}, cinematic, high quality, detailed, vibrant colors, mobile optimized"
        ),
        negative_prompt: STANDARD_NEGATIVES.join(", "),
    }
}

/// Place a scene in the narrative arc.
fn scene_role(index: usize, total: usize) -> &'static str {
    if total <= 1 {
        "complete_story"
    } else if index == 0 {
        "opener"
    } else if index == total - 1 {
        "climax"
    } else if index < total / 2 {
        "build"
    } else {
        "development"
    }
}

/// Append `addition` unless the prompt already mentions it.
fn append_missing(prompt: &mut String, addition: &str) {
    if !prompt.to_lowercase().contains(&addition.to_lowercase()) {
        if !prompt.is_empty() {
            prompt.push_str(", ");
        }
        prompt.push_str(addition);
    }
}

/// Merge the standard suffix, quality boosters and negatives into a model
/// reply so a sparse reply still yields a complete parameter set.
fn normalize(mut prompt: String, mut negative: String) -> EnhancedPrompt {
    let lower = prompt.to_lowercase();
    if !lower.contains("vertical") && !lower.contains("portrait") {
        append_missing(&mut prompt, VERTICAL_SUFFIX);
    }
    for booster in QUALITY_BOOSTERS {
        append_missing(&mut prompt, booster);
    }
    for stock in STANDARD_NEGATIVES {
        append_missing(&mut negative, stock);
    }
    EnhancedPrompt {
        prompt,
        negative_prompt: negative,
    }
}

pub struct LlmPromptEnhancer {
    chat: ChatClient,
}

#[derive(Deserialize)]
struct AnalysisReply {
    #[serde(default)]
    mood: Option<String>,
    #[serde(default)]
    visual_style: Option<String>,
    #[serde(default)]
    color_palette: Option<String>,
    #[serde(default)]
    lighting: Option<String>,
    #[serde(default)]
    composition: Option<String>,
}

#[derive(Deserialize)]
struct EnhanceReply {
    optimized_prompt: String,
    #[serde(default)]
    negative_prompt: String,
}

const ANALYZE_SYSTEM: &str = "You are an expert visual storytelling analyst. \
Analyze the provided video content to determine the optimal visual style for AI image generation. \
Focus on overall mood and tone, visual style, color palette, lighting, and composition. \
Respond with a JSON object containing: mood, visual_style, color_palette, lighting, composition.";

const ENHANCE_SYSTEM: &str = "You are an expert diffusion prompt engineer specializing in vertical short-video backgrounds. \
Transform the given scene description into an optimized prompt for high-quality vertical background images. \
Always include vertical composition (9:16 aspect ratio), cinematic terminology, and technical photography terms. \
Respond with JSON: {\"optimized_prompt\": \"...\", \"negative_prompt\": \"...\"}";

impl LlmPromptEnhancer {
    pub fn new(chat: ChatClient) -> Self {
        Self { chat }
    }
}

#[async_trait]
impl PromptEnhancer for LlmPromptEnhancer {
    async fn analyze(&self, context: &ScriptContext) -> Result<NarrativeStyle> {
        let narration_preview: String = context.narration.chars().take(500).collect();
        let user = format!(
            "Analyze this short video content:\n\nTitle: {}\nTopic: {}\nScript: {}\n\n\
             Determine the optimal visual style for background images that will support this narration.",
            context.title, context.topic, narration_preview
        );
        let reply = self.chat.complete(ANALYZE_SYSTEM, &user).await?;
        let parsed: AnalysisReply = parse_json_reply(&reply)?;
        let defaults = NarrativeStyle::default();
        Ok(NarrativeStyle {
            mood: parsed.mood.unwrap_or(defaults.mood),
            visual_style: parsed.visual_style.unwrap_or(defaults.visual_style),
            color_palette: parsed.color_palette.unwrap_or(defaults.color_palette),
            lighting: parsed.lighting.unwrap_or(defaults.lighting),
            composition: parsed.composition.unwrap_or(defaults.composition),
        })
    }

    async fn enhance(
        &self,
        request: &SceneRequest,
        style: Option<&NarrativeStyle>,
        suggestion: Option<&str>,
    ) -> Result<EnhancedPrompt> {
        let role = scene_role(request.index, request.scene_count);
        let mut user = format!("Scene Description: {}\nScene Role: {}\n", request.description, role);
        if let Some(context) = &request.context {
            user.push_str(&format!("Video Title: {}\n", context.title));
        }
        if let Some(style) = style {
            user.push_str(&format!(
                "Visual Style: {}\nMood: {}\nColor Palette: {}\nLighting: {}\nComposition: {}\n",
                style.visual_style, style.mood, style.color_palette, style.lighting, style.composition
            ));
        }
        if let Some(suggestion) = suggestion {
            user.push_str(&format!(
                "\nA previous attempt was rejected by the quality gate. Address this feedback: {suggestion}\n"
            ));
        }
        user.push_str("\nGenerate an optimized prompt for this scene.");

        let reply = self.chat.complete(ENHANCE_SYSTEM, &user).await?;
        let parsed: EnhanceReply = parse_json_reply(&reply)?;
        Ok(normalize(parsed.optimized_prompt, parsed.negative_prompt))
    }
}

/// Enhancer used when no language model is configured: deterministic
/// expansion, with style cues folded in when available.
pub struct StaticEnhancer;

#[async_trait]
impl PromptEnhancer for StaticEnhancer {
    async fn analyze(&self, _context: &ScriptContext) -> Result<NarrativeStyle> {
        Ok(NarrativeStyle::default())
    }

    async fn enhance(
        &self,
        request: &SceneRequest,
        style: Option<&NarrativeStyle>,
        _suggestion: Option<&str>,
    ) -> Result<EnhancedPrompt> {
        let mut enhanced = fallback_enhancement(&request.description);
        if let Some(style) = style {
            append_missing(&mut enhanced.prompt, &format!("{} lighting", style.lighting));
            append_missing(&mut enhanced.prompt, &format!("{} composition", style.composition));
        }
        Ok(enhanced)
    }
}
