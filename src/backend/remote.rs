//! Remote inference service client (SD-WebUI wire format).
//!
//! The service exposes a lightweight options endpoint used as the liveness
//! probe, and a `txt2img` endpoint returning base64 image payloads plus a
//! metadata block with the parameters actually used.

use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use image::RgbImage;
use serde::{Deserialize, Serialize};

use crate::backend::{GenerationParams, ImageBackend, SceneRequest};
use crate::config::RemoteConfig;
use crate::{Error, Result};

const BACKEND_NAME: &str = "remote";

pub struct RemoteBackend {
    base_url: String,
    http: reqwest::Client,
    probe_timeout: Duration,
    controlnet_model: Option<String>,
}

#[derive(Serialize)]
struct Txt2ImgRequest<'a> {
    prompt: &'a str,
    negative_prompt: &'a str,
    width: u32,
    height: u32,
    steps: u32,
    cfg_scale: f64,
    sampler_name: &'a str,
    seed: i64,
    n_iter: u32,
    batch_size: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    alwayson_scripts: Option<AlwaysonScripts>,
}

#[derive(Serialize)]
struct AlwaysonScripts {
    controlnet: ControlNetArgs,
}

#[derive(Serialize)]
struct ControlNetArgs {
    args: Vec<ControlNetUnit>,
}

#[derive(Serialize)]
struct ControlNetUnit {
    input_image: String,
    model: String,
    weight: f64,
}

#[derive(Deserialize)]
struct Txt2ImgResponse {
    images: Vec<String>,
    /// Parameters the service actually used; logged for diagnostics.
    #[serde(default)]
    parameters: serde_json::Value,
}

#[derive(Deserialize)]
struct NamedEntry {
    name: String,
}

impl RemoteBackend {
    pub fn new(config: &RemoteConfig, probe_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_s))
            .build()?;
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            http,
            probe_timeout,
            controlnet_model: config.controlnet_model.clone(),
        })
    }

    /// List the samplers the service offers.
    pub async fn samplers(&self) -> Result<Vec<String>> {
        let entries: Vec<NamedEntry> = self
            .http
            .get(format!("{}/sdapi/v1/samplers", self.base_url))
            .timeout(Duration::from_secs(10))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(entries.into_iter().map(|e| e.name).collect())
    }

    fn guide_unit(&self, params: &GenerationParams) -> Option<ControlNetUnit> {
        let model = self.controlnet_model.as_ref()?;
        let guide = params.guide.as_ref()?;
        match std::fs::read(guide) {
            Ok(bytes) => Some(ControlNetUnit {
                input_image: BASE64.encode(bytes),
                model: model.clone(),
                weight: 0.5,
            }),
            Err(error) => {
                // The guide is an optional hint; an unreadable file degrades
                // to an unguided generation.
                tracing::warn!(guide = %guide.display(), %error, "could not read continuity guide");
                None
            }
        }
    }
}

#[async_trait]
impl ImageBackend for RemoteBackend {
    fn name(&self) -> &'static str {
        BACKEND_NAME
    }

    async fn probe(&self) -> Result<()> {
        let response = self
            .http
            .get(format!("{}/sdapi/v1/options", self.base_url))
            .timeout(self.probe_timeout)
            .send()
            .await
            .map_err(|e| Error::backend(BACKEND_NAME, format!("probe failed: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::backend(
                BACKEND_NAME,
                format!("probe returned HTTP {}", response.status()),
            ));
        }
        Ok(())
    }

    async fn generate(
        &self,
        request: &SceneRequest,
        params: &GenerationParams,
    ) -> Result<RgbImage> {
        let body = Txt2ImgRequest {
            prompt: &params.prompt,
            negative_prompt: &params.negative_prompt,
            width: request.width,
            height: request.height,
            steps: params.steps,
            cfg_scale: params.guidance,
            sampler_name: &params.sampler,
            // -1 asks the service to pick a random seed.
            seed: params.seed.map(|s| s as i64).unwrap_or(-1),
            n_iter: 1,
            batch_size: 1,
            alwayson_scripts: self.guide_unit(params).map(|unit| AlwaysonScripts {
                controlnet: ControlNetArgs { args: vec![unit] },
            }),
        };

        let response = self
            .http
            .post(format!("{}/sdapi/v1/txt2img", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::backend(BACKEND_NAME, format!("txt2img request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::backend(
                BACKEND_NAME,
                format!("txt2img returned HTTP {status}: {text}"),
            ));
        }

        let reply: Txt2ImgResponse = response
            .json()
            .await
            .map_err(|e| Error::backend(BACKEND_NAME, format!("malformed txt2img response: {e}")))?;

        let Some(payload) = reply.images.first() else {
            return Err(Error::backend(BACKEND_NAME, "no images in response"));
        };

        tracing::debug!(parameters = %reply.parameters, "service-reported generation parameters");

        let bytes = BASE64
            .decode(payload)
            .map_err(|e| Error::backend(BACKEND_NAME, format!("invalid base64 payload: {e}")))?;
        let image = image::load_from_memory(&bytes)
            .map_err(|e| Error::backend(BACKEND_NAME, format!("undecodable image payload: {e}")))?;
        Ok(image.to_rgb8())
    }
}
