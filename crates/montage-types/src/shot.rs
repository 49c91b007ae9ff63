use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShotStatus {
    Init,
    KeyframeGenerated,
    PreviewReady,
    QaPassed,
    Approved,
    FinalRendered,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceLine {
    pub speaker: String,
    pub text: String,
    /// Seconds from shot start.
    pub start: f64,
    pub end: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ShotScript {
    pub description: String,
    #[serde(default)]
    pub mood_tags: Vec<String>,
    #[serde(default)]
    pub voice_lines: Vec<VoiceLine>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CameraSpec {
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub movement: String,
}

/// Artifact URIs for the up-to-three anchor frames of a shot.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Keyframes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioStrategy {
    ModelEmbedded,
    ExternalFull,
    HybridOverlay,
    ExternalFullReplace,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShotAudio {
    pub strategy: AudioStrategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub music: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
    /// BGM gain when mixing external music over model-embedded audio.
    #[serde(default = "default_overlay_gain")]
    pub overlay_gain: f64,
}

fn default_overlay_gain() -> f64 {
    0.3
}

impl Default for ShotAudio {
    fn default() -> Self {
        Self {
            strategy: AudioStrategy::ModelEmbedded,
            music: None,
            voice: None,
            overlay_gain: default_overlay_gain(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QaStatus {
    Pass,
    Warn,
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QaOutcome {
    pub status: QaStatus,
    /// Per-metric scores, e.g. face_identity -> 0.68.
    #[serde(default)]
    pub scores: HashMap<String, f64>,
    /// Thresholds the scores were judged against.
    #[serde(default)]
    pub thresholds: HashMap<String, f64>,
}

/// One segment of the final video, generated and QA'd as a unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Shot {
    pub id: String,
    pub index: u32,
    pub status: ShotStatus,
    pub duration_seconds: f64,
    /// Shot ids that must reach FinalRendered first.
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub script: ShotScript,
    #[serde(default)]
    pub camera: CameraSpec,
    #[serde(default)]
    pub keyframes: Keyframes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview_video: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_video: Option<String>,
    #[serde(default)]
    pub audio: ShotAudio,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qa: Option<QaOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub render_meta: Option<Value>,
}

impl Shot {
    pub fn new(id: impl Into<String>, index: u32, duration_seconds: f64) -> Self {
        Self {
            id: id.into(),
            index,
            status: ShotStatus::Init,
            duration_seconds,
            dependencies: Vec::new(),
            script: ShotScript::default(),
            camera: CameraSpec::default(),
            keyframes: Keyframes::default(),
            preview_video: None,
            final_video: None,
            audio: ShotAudio::default(),
            qa: None,
            render_meta: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_shot_starts_at_init() {
        let shot = Shot::new("S01", 0, 6.0);
        assert_eq!(shot.status, ShotStatus::Init);
        assert!(shot.final_video.is_none());
    }

    #[test]
    fn audio_defaults_to_embedded_with_overlay_gain() {
        let audio = ShotAudio::default();
        assert_eq!(audio.strategy, AudioStrategy::ModelEmbedded);
        assert!((audio.overlay_gain - 0.3).abs() < f64::EPSILON);
    }

    #[test]
    fn overlay_gain_survives_deserialization_when_absent() {
        let audio: ShotAudio = serde_json::from_str(r#"{"strategy":"hybrid_overlay"}"#).unwrap();
        assert!((audio.overlay_gain - 0.3).abs() < f64::EPSILON);
    }
}
