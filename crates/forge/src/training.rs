//! Submission requests and the launch contract handed to training pods.

use forge_gpu::PodSpec;
use serde::{Deserialize, Serialize};

use crate::config::{TrainingDefaults, MAX_GPU_PREFERENCES};
use crate::error::{OrchestratorError, Result};
use crate::model::{JobId, TrainingConfig};

/// Dataset root on the pod.
pub const DATA_ROOT: &str = "/workspace/data";
/// Output root on the pod.
pub const OUTPUT_ROOT: &str = "/workspace/output";

/// A job submission. Omitted hyperparameters take configured defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubmitJob {
    pub project_name: String,
    pub image_set: String,
    pub image_count: u32,
    /// Pricing tier such as `character`, `face` or `object`.
    #[serde(default)]
    pub model_type: Option<String>,
    #[serde(default)]
    pub base_model: Option<String>,
    /// Falls back to a slug of the project name.
    #[serde(default)]
    pub trigger_token: String,
    #[serde(default)]
    pub steps: Option<u32>,
    #[serde(default)]
    pub learning_rate: Option<f64>,
    #[serde(default)]
    pub train_text_encoder: Option<bool>,
    #[serde(default)]
    pub repeat: Option<u32>,
    #[serde(default)]
    pub gpu_preferences: Option<Vec<String>>,
}

impl SubmitJob {
    /// Validate the request and resolve defaults.
    pub fn into_config(self, defaults: &TrainingDefaults) -> Result<TrainingConfig> {
        let project_name = self.project_name.trim().to_string();
        if project_name.is_empty() {
            return Err(OrchestratorError::Validation("project name is required".into()));
        }
        if self.image_set.trim().is_empty() {
            return Err(OrchestratorError::Validation("image set is required".into()));
        }
        if self.image_count == 0 {
            return Err(OrchestratorError::Validation(
                "at least one image is required".into(),
            ));
        }

        let steps = self.steps.unwrap_or(defaults.steps);
        if steps == 0 {
            return Err(OrchestratorError::Validation("steps must be positive".into()));
        }
        let learning_rate = self.learning_rate.unwrap_or(defaults.learning_rate);
        if !(learning_rate > 0.0 && learning_rate < 1.0) {
            return Err(OrchestratorError::Validation(format!(
                "learning rate {learning_rate} must be between 0 and 1"
            )));
        }
        let repeat = self.repeat.unwrap_or(defaults.repeat);
        if repeat == 0 {
            return Err(OrchestratorError::Validation("repeat must be positive".into()));
        }

        let gpu_preferences = dedup_preferences(
            self.gpu_preferences
                .unwrap_or_else(|| defaults.gpu_preferences.clone()),
        );
        if gpu_preferences.is_empty() {
            return Err(OrchestratorError::Validation(
                "at least one GPU type is required".into(),
            ));
        }
        if gpu_preferences.len() > MAX_GPU_PREFERENCES {
            return Err(OrchestratorError::Validation(format!(
                "at most {MAX_GPU_PREFERENCES} GPU types may be given"
            )));
        }

        let model_type = non_blank(self.model_type).unwrap_or_else(|| defaults.model_type.clone());
        let base_model = non_blank(self.base_model).unwrap_or_else(|| defaults.base_model.clone());

        let trigger_token = match self.trigger_token.trim() {
            "" => slug(&project_name),
            token => token.to_string(),
        };

        Ok(TrainingConfig {
            project_name,
            model_type,
            base_model,
            image_set: self.image_set.trim().to_string(),
            image_count: self.image_count,
            steps,
            learning_rate,
            train_text_encoder: self.train_text_encoder.unwrap_or(defaults.train_text_encoder),
            trigger_token,
            repeat,
            gpu_preferences,
        })
    }
}

/// Drop blanks and duplicates, keeping the first occurrence.
#[must_use]
pub fn dedup_preferences(gpus: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(gpus.len());
    for gpu in gpus {
        let gpu = gpu.trim().to_string();
        if !gpu.is_empty() && !out.contains(&gpu) {
            out.push(gpu);
        }
    }
    out
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn slug(name: &str) -> String {
    let s: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect();
    match s.trim_matches('_') {
        "" => "sks".to_string(),
        token => token.to_string(),
    }
}

/// Pod name for a job. Unique, so an orphaned pod can be found after a crash.
#[must_use]
pub fn pod_name(job_id: JobId) -> String {
    format!("forge-{job_id}")
}

/// Where the trained weights land on the pod.
#[must_use]
pub fn remote_output_path(job_id: JobId) -> String {
    format!("{OUTPUT_ROOT}/{job_id}/{job_id}.safetensors")
}

/// Pod spec carrying the training parameters as environment.
#[must_use]
pub fn pod_spec(job_id: JobId, config: &TrainingConfig, callback_url: &str) -> PodSpec {
    PodSpec::new(pod_name(job_id))
        .with_env("FORGE_JOB_ID", job_id.to_string())
        .with_env("FORGE_CALLBACK_URL", callback_url)
        .with_env("FORGE_IMAGE_SET", config.image_set.clone())
        .with_env("FORGE_BASE_MODEL", config.base_model.clone())
        .with_env(
            "FORGE_DATASET_DIR",
            format!(
                "{DATA_ROOT}/{job_id}/{}_{}",
                config.repeat, config.trigger_token
            ),
        )
        .with_env("FORGE_OUTPUT_PATH", remote_output_path(job_id))
        .with_env("FORGE_TRIGGER_TOKEN", config.trigger_token.clone())
        .with_env("FORGE_REPEAT", config.repeat.to_string())
        .with_env("FORGE_MAX_TRAIN_STEPS", config.steps.to_string())
        .with_env("FORGE_LEARNING_RATE", config.learning_rate.to_string())
        .with_env(
            "FORGE_TRAIN_TEXT_ENCODER",
            if config.train_text_encoder { "1" } else { "0" },
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> SubmitJob {
        SubmitJob {
            project_name: "My Cat".to_string(),
            image_set: "uploads/cat".to_string(),
            image_count: 14,
            ..SubmitJob::default()
        }
    }

    #[test]
    fn test_defaults_are_applied() {
        let config = request().into_config(&TrainingDefaults::default()).unwrap();
        assert_eq!(config.steps, 2000);
        assert_eq!(config.repeat, 5);
        assert!(!config.train_text_encoder);
        assert_eq!(config.trigger_token, "my_cat");
        assert_eq!(config.model_type, "character");
        assert_eq!(config.base_model, "stabilityai/stable-diffusion-xl-base-1.0");
        assert_eq!(
            config.gpu_preferences,
            vec!["NVIDIA_L4", "NVIDIA_A10G", "NVIDIA_A100"]
        );
    }

    #[test]
    fn test_preferences_are_deduplicated_in_order() {
        let gpus = vec![
            "NVIDIA_A100".to_string(),
            " NVIDIA_L4".to_string(),
            "NVIDIA_A100".to_string(),
            String::new(),
            "NVIDIA_L4".to_string(),
        ];
        assert_eq!(dedup_preferences(gpus), vec!["NVIDIA_A100", "NVIDIA_L4"]);
    }

    #[test]
    fn test_rejects_bad_requests() {
        let defaults = TrainingDefaults::default();
        let cases = [
            SubmitJob { gpu_preferences: Some(vec![]), ..request() },
            SubmitJob { steps: Some(0), ..request() },
            SubmitJob { learning_rate: Some(1.5), ..request() },
            SubmitJob { learning_rate: Some(0.0), ..request() },
            SubmitJob { image_count: 0, ..request() },
            SubmitJob { project_name: "  ".into(), ..request() },
            SubmitJob {
                gpu_preferences: Some((0..9).map(|n| format!("GPU_{n}")).collect()),
                ..request()
            },
        ];
        for case in cases {
            assert!(matches!(
                case.into_config(&defaults),
                Err(OrchestratorError::Validation(_))
            ));
        }
    }

    #[test]
    fn test_pod_spec_env() {
        let id = JobId::new();
        let config = SubmitJob {
            trigger_token: "sks".into(),
            train_text_encoder: Some(true),
            model_type: Some(" face ".into()),
            base_model: Some("runwayml/stable-diffusion-v1-5".into()),
            ..request()
        }
        .into_config(&TrainingDefaults::default())
        .unwrap();
        let spec = pod_spec(id, &config, "https://forge.test/callbacks/pods/x");

        assert_eq!(spec.name, format!("forge-{id}"));
        assert_eq!(spec.env["FORGE_DATASET_DIR"], format!("/workspace/data/{id}/5_sks"));
        assert_eq!(
            spec.env["FORGE_OUTPUT_PATH"],
            format!("/workspace/output/{id}/{id}.safetensors")
        );
        assert_eq!(spec.env["FORGE_TRAIN_TEXT_ENCODER"], "1");
        assert_eq!(spec.env["FORGE_MAX_TRAIN_STEPS"], "2000");
        assert_eq!(spec.env["FORGE_BASE_MODEL"], "runwayml/stable-diffusion-v1-5");
        assert_eq!(config.model_type, "face");
    }
}
