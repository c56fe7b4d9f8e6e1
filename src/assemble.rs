//! Final render assembly.
//!
//! Builds and executes the ffmpeg filter graph that combines visual clips,
//! the narration track, and caption overlays into one MP4.
//!
//! Input indexing is the single highest-risk correctness point in the whole
//! pipeline: an off-by-one maps the wrong stream and silently produces a
//! black frame or missing audio instead of an error. [`FilterGraph`] is an
//! append-only builder that owns the running input counter; call sites never
//! compute indices themselves, and the audio index is checked against the
//! visual input count immediately before the external tool is invoked.
//!
//! Two render strategies, selected up front by inspecting the clip kinds —
//! never per-clip mid-stream, because the two graphs have incompatible
//! shapes:
//!
//! - fast: every clip is a static image; image files are handed directly to
//!   a single concat+overlay invocation.
//! - slow: at least one motion clip; every clip is pre-rendered to an
//!   intermediate MP4 (zoompan for motion, scale/pad for static), and the
//!   intermediates are concatenated.
//!
//! A fast-path failure falls back to the slow path automatically. A
//! slow-path failure is fatal for the video.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use crate::captions::{escape_drawtext, CaptionCue};
use crate::config::{AssemblyConfig, VideoConfig, WatermarkConfig, WatermarkPosition};
use crate::voice::AudioTrack;
use crate::{Error, Result};

/// Tolerance when comparing clip durations against the audio track.
const DURATION_EPSILON: f64 = 1e-6;

/// Linear zoom transform for motion clips.
#[derive(Debug, Clone, Copy)]
pub struct ZoomPan {
    /// Final zoom factor (1.0 = none).
    pub target: f64,
    /// Zoom increment per output frame.
    pub step: f64,
}

impl Default for ZoomPan {
    fn default() -> Self {
        Self {
            target: 1.12,
            step: 0.0025,
        }
    }
}

/// One visual clip: a still image, or an image with a zoom transform over
/// its duration.
#[derive(Debug, Clone)]
pub enum VisualClip {
    Static { image: PathBuf, duration: f64 },
    Motion {
        image: PathBuf,
        duration: f64,
        zoom: ZoomPan,
    },
}

impl VisualClip {
    pub fn duration(&self) -> f64 {
        match self {
            VisualClip::Static { duration, .. } | VisualClip::Motion { duration, .. } => *duration,
        }
    }

    fn with_duration(self, duration: f64) -> Self {
        match self {
            VisualClip::Static { image, .. } => VisualClip::Static { image, duration },
            VisualClip::Motion { image, zoom, .. } => VisualClip::Motion {
                image,
                duration,
                zoom,
            },
        }
    }

    fn is_motion(&self) -> bool {
        matches!(self, VisualClip::Motion { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderStrategy {
    Fast,
    Slow,
}

/// Pick the render strategy by inspecting all clip kinds up front.
pub fn select_strategy(clips: &[VisualClip]) -> RenderStrategy {
    if clips.iter().any(VisualClip::is_motion) {
        RenderStrategy::Slow
    } else {
        RenderStrategy::Fast
    }
}

/// Everything the final render needs. Invariant: the clip durations sum to
/// at least the audio duration ([`AssemblyPlan::fit_to_audio`] enforces it).
#[derive(Debug, Clone)]
pub struct AssemblyPlan {
    pub clips: Vec<VisualClip>,
    pub audio: AudioTrack,
    pub captions: Vec<CaptionCue>,
    pub output: PathBuf,
}

impl AssemblyPlan {
    pub fn total_visual_duration(&self) -> f64 {
        self.clips.iter().map(VisualClip::duration).sum()
    }

    /// Adjust clip durations so the visual track covers the audio exactly:
    /// the final clip is padded on a shortfall and trimmed on an overshoot,
    /// dropping clips that would start past the end of the audio.
    pub fn fit_to_audio(&mut self) {
        if self.clips.is_empty() {
            return;
        }
        let target = self.audio.duration_s;
        let total = self.total_visual_duration();

        if total + DURATION_EPSILON < target {
            let deficit = target - total;
            if let Some(last) = self.clips.pop() {
                let duration = last.duration() + deficit;
                self.clips.push(last.with_duration(duration));
            }
        } else if total > target + DURATION_EPSILON {
            let mut kept = Vec::with_capacity(self.clips.len());
            let mut elapsed = 0.0;
            for clip in self.clips.drain(..) {
                if elapsed + DURATION_EPSILON >= target {
                    break;
                }
                let duration = clip.duration().min(target - elapsed);
                elapsed += duration;
                kept.push(clip.with_duration(duration));
            }
            self.clips = kept;
        }
    }
}

/// Append-only ffmpeg graph builder.
///
/// Every registered input gets the next index from a single running counter;
/// the counter is read back for the audio mapping instead of being
/// recomputed at any call site.
pub struct FilterGraph {
    width: u32,
    height: u32,
    /// Count of every `-i` emitted so far.
    inputs: usize,
    /// Count of inputs that entered the visual concat chain.
    visual_inputs: usize,
    input_args: Vec<String>,
    filters: Vec<String>,
    concat_labels: Vec<String>,
}

impl FilterGraph {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            inputs: 0,
            visual_inputs: 0,
            input_args: Vec::new(),
            filters: Vec::new(),
            concat_labels: Vec::new(),
        }
    }

    /// Register a looped still image as the next visual input.
    pub fn push_image(&mut self, path: &Path, duration: f64) -> usize {
        self.input_args.extend([
            "-loop".into(),
            "1".into(),
            "-t".into(),
            format!("{duration}"),
            "-i".into(),
            path.display().to_string(),
        ]);
        self.register_visual()
    }

    /// Register a pre-rendered video clip as the next visual input.
    pub fn push_video(&mut self, path: &Path, duration: f64) -> usize {
        self.input_args.extend([
            "-t".into(),
            format!("{duration}"),
            "-i".into(),
            path.display().to_string(),
        ]);
        self.register_visual()
    }

    fn register_visual(&mut self) -> usize {
        let index = self.inputs;
        let label = format!("v{index}");
        self.filters.push(format!(
            "[{index}:v]scale=w={w}:h={h}:force_original_aspect_ratio=decrease,\
             pad={w}:{h}:(ow-iw)/2:(oh-ih)/2,setsar=1[{label}]",
            w = self.width,
            h = self.height,
        ));
        self.concat_labels.push(format!("[{label}]"));
        self.inputs += 1;
        self.visual_inputs += 1;
        index
    }

    pub fn visual_input_count(&self) -> usize {
        self.visual_inputs
    }

    /// Index the audio input will occupy: computed from the running counter,
    /// never hard-coded.
    pub fn audio_input_index(&self) -> usize {
        self.inputs
    }

    /// Emit the complete argument list for the final render invocation.
    ///
    /// Panics if the audio index diverged from the visual input count — a
    /// wrong index would not fail the render, it would silently map the
    /// wrong stream.
    pub fn into_command_args(
        mut self,
        audio: &Path,
        audio_duration: f64,
        overlays: &[String],
        encoder: &AssemblyConfig,
        fps: u32,
        output: &Path,
    ) -> Vec<String> {
        let audio_index = self.audio_input_index();
        assert_eq!(
            audio_index,
            self.visual_input_count(),
            "audio input index diverged from visual input count"
        );

        let concat_out = if overlays.is_empty() { "vout" } else { "vc" };
        self.filters.push(format!(
            "{}concat=n={}:v=1:a=0[{concat_out}]",
            self.concat_labels.join(""),
            self.visual_inputs,
        ));

        let mut current = concat_out.to_string();
        let count = overlays.len();
        for (i, body) in overlays.iter().enumerate() {
            let next = if i + 1 == count {
                "vout".to_string()
            } else {
                format!("vc{}", i + 1)
            };
            self.filters.push(format!("[{current}]{body}[{next}]"));
            current = next;
        }

        let mut args: Vec<String> = vec!["-y".into(), "-loglevel".into(), "error".into()];
        args.extend(self.input_args);
        args.extend(["-i".into(), audio.display().to_string()]);
        args.extend(["-filter_complex".into(), self.filters.join(";")]);
        args.extend(["-map".into(), "[vout]".into()]);
        args.extend(["-map".into(), format!("{audio_index}:a")]);
        args.extend([
            "-shortest".into(),
            "-r".into(),
            fps.to_string(),
            "-c:v".into(),
            encoder.video_codec.clone(),
            "-preset".into(),
            encoder.preset.clone(),
            "-crf".into(),
            encoder.crf.to_string(),
            "-c:a".into(),
            encoder.audio_codec.clone(),
            "-b:a".into(),
            encoder.audio_bitrate.clone(),
            "-pix_fmt".into(),
            "yuv420p".into(),
            "-t".into(),
            format!("{audio_duration}"),
        ]);
        args.push(output.display().to_string());
        args
    }
}

/// Build the drawtext overlay stages (captions first, then watermark).
fn overlay_filters(
    captions: &[CaptionCue],
    watermark: Option<&WatermarkConfig>,
    assembly: &AssemblyConfig,
) -> Vec<String> {
    let mut overlays = Vec::new();
    for cue in captions {
        overlays.push(format!(
            "drawtext=text='{}':fontcolor={}:fontsize={}:borderw={}:bordercolor={}:\
             x=(w-tw)/2:y=(h/2):enable='between(t,{:.2},{:.2})'",
            escape_drawtext(&cue.text),
            assembly.caption_font_color,
            assembly.caption_font_size,
            assembly.caption_border_width,
            assembly.caption_border_color,
            cue.start,
            cue.end,
        ));
    }
    if let Some(wm) = watermark {
        let position = match wm.position {
            WatermarkPosition::TopRight => "x=w-tw-20:y=20",
            WatermarkPosition::TopLeft => "x=20:y=20",
            WatermarkPosition::BottomRight => "x=w-tw-20:y=h-th-20",
            WatermarkPosition::BottomLeft => "x=20:y=h-th-20",
        };
        overlays.push(format!(
            "drawtext=text='{}':fontcolor=white:fontsize={}:{position}:alpha={}",
            escape_drawtext(&wm.text),
            wm.font_size,
            wm.opacity,
        ));
    }
    overlays
}

pub struct Assembler {
    video: VideoConfig,
    assembly: AssemblyConfig,
    ffmpeg_timeout: Duration,
    scratch: PathBuf,
}

impl Assembler {
    /// Fails fast when ffmpeg is missing — a run must not get as far as
    /// generation only to discover it cannot render.
    pub fn new(video: &VideoConfig, assembly: &AssemblyConfig, scratch: &Path) -> Result<Self> {
        if !is_ffmpeg_available() {
            return Err(Error::Config(
                "ffmpeg is required for assembly but was not found on PATH".into(),
            ));
        }
        Ok(Self {
            video: video.clone(),
            assembly: assembly.clone(),
            ffmpeg_timeout: Duration::from_secs(assembly.ffmpeg_timeout_s),
            scratch: scratch.to_path_buf(),
        })
    }

    /// Render the plan to its output path.
    pub async fn build(&self, plan: &AssemblyPlan) -> Result<PathBuf> {
        if plan.clips.is_empty() {
            return Err(Error::Assembly("assembly plan has no visual clips".into()));
        }
        if plan.total_visual_duration() + DURATION_EPSILON < plan.audio.duration_s {
            return Err(Error::Assembly(format!(
                "visual clips cover {:.2}s but the audio runs {:.2}s — run fit_to_audio first",
                plan.total_visual_duration(),
                plan.audio.duration_s
            )));
        }
        if let Some(parent) = plan.output.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let strategy = select_strategy(&plan.clips);
        tracing::info!(
            clips = plan.clips.len(),
            captions = plan.captions.len(),
            audio_s = plan.audio.duration_s,
            ?strategy,
            "assembling final video"
        );

        match strategy {
            RenderStrategy::Fast => match self.render_fast(plan).await {
                Ok(path) => Ok(path),
                Err(error) => {
                    tracing::warn!(%error, "fast assembly path failed — falling back to pre-rendered path");
                    self.render_slow(plan).await
                }
            },
            RenderStrategy::Slow => self.render_slow(plan).await,
        }
    }

    async fn render_fast(&self, plan: &AssemblyPlan) -> Result<PathBuf> {
        let mut graph = FilterGraph::new(self.video.width, self.video.height);
        for clip in &plan.clips {
            match clip {
                VisualClip::Static { image, duration } => {
                    graph.push_image(image, *duration);
                }
                VisualClip::Motion { .. } => {
                    // The strategies use incompatible graph shapes; a motion
                    // clip can never be rendered inline.
                    return Err(Error::Assembly(
                        "motion clip reached the fast assembly path".into(),
                    ));
                }
            }
        }
        self.run_graph(graph, plan).await
    }

    async fn render_slow(&self, plan: &AssemblyPlan) -> Result<PathBuf> {
        let mut parts: Vec<(PathBuf, f64)> = Vec::with_capacity(plan.clips.len());
        for (i, clip) in plan.clips.iter().enumerate() {
            let part = self.scratch.join(format!("clip_{i}.mp4"));
            match clip {
                VisualClip::Motion {
                    image,
                    duration,
                    zoom,
                } => {
                    if let Err(error) = self.render_motion(image, *duration, *zoom, &part).await {
                        tracing::warn!(clip = i, %error, "motion pre-render failed — falling back to static clip");
                        self.render_static(image, *duration, &part).await?;
                    }
                }
                VisualClip::Static { image, duration } => {
                    self.render_static(image, *duration, &part).await?;
                }
            }
            parts.push((part, clip.duration()));
        }

        let mut graph = FilterGraph::new(self.video.width, self.video.height);
        for (part, duration) in &parts {
            graph.push_video(part, *duration);
        }
        self.run_graph(graph, plan).await
    }

    async fn run_graph(&self, graph: FilterGraph, plan: &AssemblyPlan) -> Result<PathBuf> {
        let overlays = overlay_filters(
            &plan.captions,
            self.assembly.watermark.as_ref(),
            &self.assembly,
        );
        // Write to a temporary name in the destination directory; the real
        // path only ever holds a complete file.
        let staging = plan.output.with_extension("mp4.part");
        let args = graph.into_command_args(
            &plan.audio.path,
            plan.audio.duration_s,
            &overlays,
            &self.assembly,
            self.video.fps,
            &staging,
        );

        let result = self.run_ffmpeg(&args).await;
        if let Err(error) = result {
            let _ = std::fs::remove_file(&staging);
            return Err(error);
        }
        std::fs::rename(&staging, &plan.output)?;
        tracing::info!(output = %plan.output.display(), "final video written");
        Ok(plan.output.clone())
    }

    /// Pre-render a motion clip: pre-scale past the zoom target so zoompan
    /// always has pixels to crop from, then zoom linearly toward the target.
    async fn render_motion(
        &self,
        image: &Path,
        duration: f64,
        zoom: ZoomPan,
        output: &Path,
    ) -> Result<()> {
        let frames = ((duration * self.video.fps as f64).round() as i64).max(1);
        let vf = format!(
            "scale=iw*{target}:ih*{target},zoompan=z='min(zoom+{step},{target})':d={frames}:\
             x='iw/2-(iw/zoom/2)':y='ih/2-(ih/zoom/2)':s={w}x{h}",
            target = zoom.target,
            step = zoom.step,
            w = self.video.width,
            h = self.video.height,
        );
        let args = vec![
            "-y".into(),
            "-loglevel".into(),
            "error".into(),
            "-loop".into(),
            "1".into(),
            "-t".into(),
            format!("{duration}"),
            "-i".into(),
            image.display().to_string(),
            "-vf".into(),
            vf,
            "-c:v".into(),
            "libx264".into(),
            "-pix_fmt".into(),
            "yuv420p".into(),
            "-r".into(),
            self.video.fps.to_string(),
            output.display().to_string(),
        ];
        self.run_ffmpeg(&args).await
    }

    async fn render_static(&self, image: &Path, duration: f64, output: &Path) -> Result<()> {
        let vf = format!(
            "scale={w}:{h}:force_original_aspect_ratio=decrease,pad={w}:{h}:(ow-iw)/2:(oh-ih)/2",
            w = self.video.width,
            h = self.video.height,
        );
        let args = vec![
            "-y".into(),
            "-loglevel".into(),
            "error".into(),
            "-loop".into(),
            "1".into(),
            "-i".into(),
            image.display().to_string(),
            "-t".into(),
            format!("{duration}"),
            "-vf".into(),
            vf,
            "-c:v".into(),
            "libx264".into(),
            "-pix_fmt".into(),
            "yuv420p".into(),
            "-r".into(),
            self.video.fps.to_string(),
            output.display().to_string(),
        ];
        self.run_ffmpeg(&args).await
    }

    async fn run_ffmpeg(&self, args: &[String]) -> Result<()> {
        tracing::debug!(args = %args.join(" "), "running ffmpeg");
        let child = tokio::process::Command::new("ffmpeg")
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Assembly(format!("failed to spawn ffmpeg: {e}")))?;

        match tokio::time::timeout(self.ffmpeg_timeout, child.wait_with_output()).await {
            Ok(Ok(output)) if output.status.success() => Ok(()),
            Ok(Ok(output)) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                Err(Error::Assembly(format!(
                    "ffmpeg exited with {}: {}",
                    output.status,
                    stderr.trim()
                )))
            }
            Ok(Err(e)) => Err(Error::Assembly(format!("failed to wait for ffmpeg: {e}"))),
            Err(_) => Err(Error::Assembly(format!(
                "ffmpeg timed out after {}s",
                self.ffmpeg_timeout.as_secs()
            ))),
        }
    }
}

pub fn is_ffmpeg_available() -> bool {
    std::process::Command::new("ffmpeg")
        .arg("-version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn still(duration: f64) -> VisualClip {
        VisualClip::Static {
            image: PathBuf::from("/scratch/scene.png"),
            duration,
        }
    }

    fn moving(duration: f64) -> VisualClip {
        VisualClip::Motion {
            image: PathBuf::from("/scratch/scene.png"),
            duration,
            zoom: ZoomPan::default(),
        }
    }

    fn plan(clips: Vec<VisualClip>, audio_duration: f64) -> AssemblyPlan {
        AssemblyPlan {
            clips,
            audio: AudioTrack {
                path: PathBuf::from("/scratch/narration.wav"),
                duration_s: audio_duration,
            },
            captions: Vec::new(),
            output: PathBuf::from("/out/short.mp4"),
        }
    }

    #[test]
    fn audio_index_equals_visual_count_for_all_sizes() {
        for n in [0usize, 1, 5, 50] {
            let mut graph = FilterGraph::new(1080, 1920);
            for i in 0..n {
                let index = graph.push_image(Path::new("img.png"), 2.0);
                assert_eq!(index, i);
            }
            assert_eq!(graph.visual_input_count(), n);
            assert_eq!(graph.audio_input_index(), n);
        }
    }

    #[test]
    fn command_args_map_audio_after_the_last_visual_input() {
        let mut graph = FilterGraph::new(1080, 1920);
        graph.push_image(Path::new("a.png"), 2.0);
        graph.push_image(Path::new("b.png"), 2.0);
        let args = graph.into_command_args(
            Path::new("narration.wav"),
            4.0,
            &[],
            &AssemblyConfig::default(),
            30,
            Path::new("out.mp4.part"),
        );
        let joined = args.join(" ");
        assert!(joined.contains("-map [vout]"));
        assert!(joined.contains("-map 2:a"));
        assert!(joined.contains("concat=n=2:v=1:a=0[vout]"));
    }

    #[test]
    fn overlays_chain_and_terminate_in_vout() {
        let mut graph = FilterGraph::new(1080, 1920);
        graph.push_image(Path::new("a.png"), 2.0);
        let overlays = vec!["drawtext=text='HI'".to_string(), "drawtext=text='LO'".to_string()];
        let args = graph.into_command_args(
            Path::new("narration.wav"),
            2.0,
            &overlays,
            &AssemblyConfig::default(),
            30,
            Path::new("out.mp4.part"),
        );
        let filter = args
            .iter()
            .position(|a| a == "-filter_complex")
            .map(|i| args[i + 1].clone())
            .unwrap();
        assert!(filter.contains("concat=n=1:v=1:a=0[vc]"));
        assert!(filter.contains("[vc]drawtext=text='HI'[vc1]"));
        assert!(filter.contains("[vc1]drawtext=text='LO'[vout]"));
    }

    #[test]
    fn strategy_is_fast_only_when_every_clip_is_static() {
        let all_static = vec![still(3.0), still(3.0), still(3.0)];
        assert_eq!(select_strategy(&all_static), RenderStrategy::Fast);

        let mut one_motion = all_static.clone();
        one_motion[1] = moving(3.0);
        assert_eq!(select_strategy(&one_motion), RenderStrategy::Slow);
    }

    #[test]
    fn overshoot_trims_the_final_clip_exactly() {
        let mut plan = plan(vec![still(10.0), still(10.0), still(10.0)], 27.4);
        plan.fit_to_audio();
        assert_eq!(plan.clips.len(), 3);
        assert!((plan.clips[2].duration() - 7.4).abs() < 1e-9);
        assert!((plan.total_visual_duration() - 27.4).abs() < 1e-9);
    }

    #[test]
    fn shortfall_pads_the_final_clip() {
        let mut plan = plan(vec![still(5.0), still(5.0)], 12.0);
        plan.fit_to_audio();
        assert_eq!(plan.clips.len(), 2);
        assert!((plan.clips[1].duration() - 7.0).abs() < 1e-9);
    }

    #[test]
    fn clips_entirely_past_the_audio_are_dropped() {
        let mut plan = plan(vec![still(10.0), still(10.0), still(10.0)], 15.0);
        plan.fit_to_audio();
        assert_eq!(plan.clips.len(), 2);
        assert!((plan.clips[1].duration() - 5.0).abs() < 1e-9);
    }

    #[test]
    fn watermark_positions_render_distinct_anchors() {
        let assembly = AssemblyConfig::default();
        let wm = WatermarkConfig {
            position: WatermarkPosition::BottomLeft,
            ..WatermarkConfig::default()
        };
        let overlays = overlay_filters(&[], Some(&wm), &assembly);
        assert_eq!(overlays.len(), 1);
        assert!(overlays[0].contains("x=20:y=h-th-20"));
    }

    #[test]
    fn caption_overlays_are_windowed() {
        let assembly = AssemblyConfig::default();
        let cues = vec![CaptionCue {
            text: "IT'S HERE".into(),
            start: 1.0,
            end: 2.5,
        }];
        let overlays = overlay_filters(&cues, None, &assembly);
        assert!(overlays[0].contains("enable='between(t,1.00,2.50)'"));
        assert!(overlays[0].contains("IT\\'S"));
    }
}
