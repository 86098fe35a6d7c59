//! Service configuration.
//!
//! Built once at startup from environment variables, validated, then shared
//! read-only behind an `Arc`.

use std::collections::BTreeMap;
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use forge_gpu::RetryPolicy;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

/// Forge service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP listen address.
    pub bind_addr: SocketAddr,
    /// Externally reachable base URL, used to build pod callback URLs.
    pub public_url: String,
    /// Bearer token pods present on status callbacks.
    pub callback_token: Option<String>,
    /// JSON snapshot file for the job store. In-memory when unset.
    pub state_path: Option<PathBuf>,
    /// Root directory for artifact manifests.
    pub artifact_root: PathBuf,
    pub training: TrainingDefaults,
    pub pricing: PricingConfig,
    pub policy: PolicyConfig,
    pub reconcile: ReconcileConfig,
    pub retry: RetryPolicy,
    pub runpod: RunPodConfig,
    pub stripe: StripeConfig,
}

/// Longest GPU preference list a job may carry.
pub const MAX_GPU_PREFERENCES: usize = 8;

/// Hyperparameters applied when a submission omits them.
#[derive(Debug, Clone)]
pub struct TrainingDefaults {
    /// Pricing tier used when a submission names none.
    pub model_type: String,
    /// Base checkpoint the LoRA is trained against.
    pub base_model: String,
    pub steps: u32,
    pub learning_rate: f64,
    pub train_text_encoder: bool,
    pub repeat: u32,
    pub gpu_preferences: Vec<String>,
}

impl Default for TrainingDefaults {
    fn default() -> Self {
        Self {
            model_type: "character".to_string(),
            base_model: "stabilityai/stable-diffusion-xl-base-1.0".to_string(),
            steps: 2000,
            learning_rate: 0.0001,
            train_text_encoder: false,
            repeat: 5,
            gpu_preferences: vec![
                "NVIDIA_L4".to_string(),
                "NVIDIA_A10G".to_string(),
                "NVIDIA_A100".to_string(),
            ],
        }
    }
}

/// Price list, in USD cents.
#[derive(Debug, Clone)]
pub struct PricingConfig {
    /// Base price per model type.
    pub base_prices: BTreeMap<String, i64>,
    pub per_image_cents: i64,
    /// Image count charged at minimum.
    pub min_images: u32,
    /// Fixed USD to CNY conversion rate for display amounts.
    pub usd_to_cny_rate: f64,
    /// Hourly compute rate per GPU type.
    pub gpu_hourly_cents: BTreeMap<String, i64>,
    /// Hourly rate for GPU types missing from the table.
    pub default_hourly_cents: i64,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            base_prices: BTreeMap::from([
                ("character".to_string(), 500),
                ("face".to_string(), 600),
                ("object".to_string(), 400),
            ]),
            per_image_cents: 10,
            min_images: 10,
            usd_to_cny_rate: 7.2,
            gpu_hourly_cents: BTreeMap::from([
                ("NVIDIA_L4".to_string(), 44),
                ("NVIDIA_A10G".to_string(), 76),
                ("NVIDIA_A100".to_string(), 189),
            ]),
            default_hourly_cents: 100,
        }
    }
}

/// Timing policy for jobs.
#[derive(Debug, Clone)]
pub struct PolicyConfig {
    /// Provider updates newer than this make a reconciliation poll unnecessary.
    pub staleness_threshold: Duration,
    /// How long a pod may go unanswered before the job fails.
    pub grace_window: Duration,
    /// How long a pod may stay in provisioning.
    pub startup_timeout: Duration,
    /// How long an allocation claim is honoured before another allocator may take over.
    pub allocation_timeout: Duration,
    /// Re-read and retry attempts for internal handlers on a stale write.
    pub conflict_retries: u32,
    /// Service deadline counted from payment confirmation.
    pub payment_deadline: Duration,
    /// Tries at collecting a finished model before completing without it.
    pub artifact_attempts: u32,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            staleness_threshold: Duration::from_secs(60),
            grace_window: Duration::from_secs(15 * 60),
            startup_timeout: Duration::from_secs(30 * 60),
            allocation_timeout: Duration::from_secs(10 * 60),
            conflict_retries: 3,
            payment_deadline: Duration::from_secs(24 * 60 * 60),
            artifact_attempts: 3,
        }
    }
}

/// Reconciliation loop settings.
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    pub interval: Duration,
    /// Jobs reconciled in parallel.
    pub concurrency: usize,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            concurrency: 8,
        }
    }
}

/// RunPod credentials and endpoint.
#[derive(Clone, Default)]
pub struct RunPodConfig {
    pub api_key: String,
    pub template_id: String,
    pub api_url: Option<String>,
    pub timeout_secs: u64,
    pub community_cloud: bool,
}

impl std::fmt::Debug for RunPodConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunPodConfig")
            .field("api_key", &"<redacted>")
            .field("template_id", &self.template_id)
            .field("api_url", &self.api_url)
            .field("timeout_secs", &self.timeout_secs)
            .field("community_cloud", &self.community_cloud)
            .finish()
    }
}

/// Stripe credentials and webhook settings.
#[derive(Clone, Default)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    pub api_url: Option<String>,
    pub tolerance_secs: i64,
}

impl std::fmt::Debug for StripeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripeConfig")
            .field("secret_key", &"<redacted>")
            .field("webhook_secret", &"<redacted>")
            .field("api_url", &self.api_url)
            .field("tolerance_secs", &self.tolerance_secs)
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            public_url: "http://localhost:8080".to_string(),
            callback_token: None,
            state_path: None,
            artifact_root: PathBuf::from("trained_models"),
            training: TrainingDefaults::default(),
            pricing: PricingConfig::default(),
            policy: PolicyConfig::default(),
            reconcile: ReconcileConfig::default(),
            retry: RetryPolicy::default(),
            runpod: RunPodConfig {
                timeout_secs: 30,
                ..RunPodConfig::default()
            },
            stripe: StripeConfig {
                tolerance_secs: forge_payments::webhook::DEFAULT_TOLERANCE_SECS,
                ..StripeConfig::default()
            },
        }
    }
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        config.bind_addr = parse_or(&get, "FORGE_BIND_ADDR", config.bind_addr)?;
        if let Some(url) = get("FORGE_PUBLIC_URL") {
            config.public_url = url.trim_end_matches('/').to_string();
        }
        config.callback_token = get("FORGE_CALLBACK_TOKEN");
        config.state_path = get("FORGE_STATE_PATH").map(PathBuf::from);
        if let Some(root) = get("FORGE_ARTIFACT_ROOT") {
            config.artifact_root = PathBuf::from(root);
        }

        let training = &mut config.training;
        training.steps = parse_or(&get, "FORGE_DEFAULT_STEPS", training.steps)?;
        training.learning_rate =
            parse_or(&get, "FORGE_DEFAULT_LEARNING_RATE", training.learning_rate)?;
        training.repeat = parse_or(&get, "FORGE_DEFAULT_REPEAT", training.repeat)?;
        training.train_text_encoder = parse_bool_or(
            &get,
            "FORGE_DEFAULT_TRAIN_TEXT_ENCODER",
            training.train_text_encoder,
        )?;
        if let Some(list) = get("FORGE_GPU_PREFERENCES") {
            training.gpu_preferences = split_list(&list);
        }
        if let Some(model_type) = get("FORGE_DEFAULT_MODEL_TYPE") {
            training.model_type = model_type.trim().to_string();
        }
        if let Some(base_model) = get("FORGE_BASE_MODEL") {
            training.base_model = base_model.trim().to_string();
        }

        let pricing = &mut config.pricing;
        if let Some(prices) = get("FORGE_BASE_PRICES") {
            pricing.base_prices = parse_rates(&prices, "FORGE_BASE_PRICES")?;
        }
        pricing.per_image_cents = parse_or(&get, "FORGE_PER_IMAGE_CENTS", pricing.per_image_cents)?;
        pricing.min_images = parse_or(&get, "FORGE_MIN_IMAGES", pricing.min_images)?;
        pricing.usd_to_cny_rate = parse_or(&get, "USD_TO_CNY_RATE", pricing.usd_to_cny_rate)?;
        if let Some(rates) = get("FORGE_GPU_HOURLY_CENTS") {
            pricing.gpu_hourly_cents = parse_rates(&rates, "FORGE_GPU_HOURLY_CENTS")?;
        }

        let policy = &mut config.policy;
        policy.staleness_threshold =
            parse_secs_or(&get, "FORGE_STALENESS_SECS", policy.staleness_threshold)?;
        policy.grace_window = parse_secs_or(&get, "FORGE_GRACE_WINDOW_SECS", policy.grace_window)?;
        policy.startup_timeout =
            parse_secs_or(&get, "FORGE_STARTUP_TIMEOUT_SECS", policy.startup_timeout)?;
        policy.allocation_timeout =
            parse_secs_or(&get, "FORGE_ALLOCATION_TIMEOUT_SECS", policy.allocation_timeout)?;
        policy.conflict_retries =
            parse_or(&get, "FORGE_CONFLICT_RETRIES", policy.conflict_retries)?;
        policy.artifact_attempts =
            parse_or(&get, "FORGE_ARTIFACT_ATTEMPTS", policy.artifact_attempts)?;

        config.reconcile.interval =
            parse_secs_or(&get, "FORGE_RECONCILE_INTERVAL_SECS", config.reconcile.interval)?;
        config.reconcile.concurrency =
            parse_or(&get, "FORGE_RECONCILE_CONCURRENCY", config.reconcile.concurrency)?;

        config.retry.max_attempts =
            parse_or(&get, "FORGE_RETRY_ATTEMPTS", config.retry.max_attempts)?;
        config.retry.initial_delay =
            parse_secs_or(&get, "FORGE_RETRY_BASE_SECS", config.retry.initial_delay)?;
        config.retry.max_delay = parse_secs_or(&get, "FORGE_RETRY_MAX_SECS", config.retry.max_delay)?;

        config.runpod.api_key = get("RUNPOD_API_KEY").unwrap_or_default();
        config.runpod.template_id = get("RUNPOD_TEMPLATE_ID").unwrap_or_default();
        config.runpod.api_url = get("RUNPOD_API_URL");
        config.runpod.timeout_secs =
            parse_or(&get, "RUNPOD_TIMEOUT_SECS", config.runpod.timeout_secs)?;
        config.runpod.community_cloud =
            parse_bool_or(&get, "RUNPOD_COMMUNITY_CLOUD", config.runpod.community_cloud)?;

        config.stripe.secret_key = get("STRIPE_SECRET_KEY").unwrap_or_default();
        config.stripe.webhook_secret = get("STRIPE_WEBHOOK_SECRET").unwrap_or_default();
        config.stripe.api_url = get("STRIPE_API_URL");
        config.stripe.tolerance_secs =
            parse_or(&get, "STRIPE_WEBHOOK_TOLERANCE_SECS", config.stripe.tolerance_secs)?;

        config.validate()?;
        Ok(config)
    }

    /// Check values that would make the service misbehave.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stripe.webhook_secret.trim().is_empty() {
            return Err(ConfigError::Missing("STRIPE_WEBHOOK_SECRET"));
        }
        if self.training.gpu_preferences.is_empty() {
            return Err(ConfigError::Missing("FORGE_GPU_PREFERENCES"));
        }
        if self.training.gpu_preferences.len() > MAX_GPU_PREFERENCES {
            return Err(ConfigError::Invalid {
                key: "FORGE_GPU_PREFERENCES",
                value: self.training.gpu_preferences.join(","),
            });
        }
        if !self.pricing.base_prices.contains_key(&self.training.model_type) {
            return Err(ConfigError::Invalid {
                key: "FORGE_DEFAULT_MODEL_TYPE",
                value: self.training.model_type.clone(),
            });
        }
        if self.pricing.base_prices.values().any(|cents| *cents < 0) {
            return Err(ConfigError::Invalid {
                key: "FORGE_BASE_PRICES",
                value: format!("{:?}", self.pricing.base_prices),
            });
        }
        if self.training.base_model.is_empty() {
            return Err(ConfigError::Missing("FORGE_BASE_MODEL"));
        }
        if !(self.training.learning_rate > 0.0 && self.training.learning_rate < 1.0) {
            return Err(ConfigError::Invalid {
                key: "FORGE_DEFAULT_LEARNING_RATE",
                value: self.training.learning_rate.to_string(),
            });
        }
        if self.training.steps == 0 {
            return Err(ConfigError::Invalid {
                key: "FORGE_DEFAULT_STEPS",
                value: "0".to_string(),
            });
        }
        if !(self.pricing.usd_to_cny_rate.is_finite() && self.pricing.usd_to_cny_rate > 0.0) {
            return Err(ConfigError::Invalid {
                key: "USD_TO_CNY_RATE",
                value: self.pricing.usd_to_cny_rate.to_string(),
            });
        }
        if self.reconcile.concurrency == 0 {
            return Err(ConfigError::Invalid {
                key: "FORGE_RECONCILE_CONCURRENCY",
                value: "0".to_string(),
            });
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                key: "FORGE_RETRY_ATTEMPTS",
                value: "0".to_string(),
            });
        }
        if self.policy.artifact_attempts == 0 {
            return Err(ConfigError::Invalid {
                key: "FORGE_ARTIFACT_ATTEMPTS",
                value: "0".to_string(),
            });
        }
        Ok(())
    }

    /// How long an allocation claim over `preferences` GPU types is honoured.
    ///
    /// Covers the worst case of one allocator: the initial lookup, every GPU
    /// type's deploy attempts each followed by a lookup, and the final lookup,
    /// all at the full provider timeout with every backoff slept.
    #[must_use]
    pub fn allocation_claim_ttl(&self, preferences: usize) -> Duration {
        let per_call = Duration::from_secs(self.runpod.timeout_secs)
            .saturating_mul(self.retry.max_attempts)
            .saturating_add(self.retry.total_backoff());
        let per_gpu = self.retry.max_attempts.saturating_add(1);
        let calls = u32::try_from(preferences.min(MAX_GPU_PREFERENCES))
            .unwrap_or(u32::MAX)
            .saturating_mul(per_gpu)
            .saturating_add(2);
        per_call
            .saturating_mul(calls)
            .max(self.policy.allocation_timeout)
    }

    /// URL a pod calls to report status for a job.
    #[must_use]
    pub fn callback_url(&self, job_id: &str) -> String {
        format!("{}/callbacks/pods/{}", self.public_url, job_id)
    }
}

fn parse_or<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value }),
        None => Ok(default),
    }
}

fn parse_secs_or<G>(get: &G, key: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    parse_or(get, key, default.as_secs()).map(Duration::from_secs)
}

fn parse_bool_or<G>(get: &G, key: &'static str, default: bool) -> Result<bool, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match get(key).as_deref().map(str::trim) {
        None => Ok(default),
        Some("true" | "1" | "yes") => Ok(true),
        Some("false" | "0" | "no") => Ok(false),
        Some(other) => Err(ConfigError::Invalid {
            key,
            value: other.to_string(),
        }),
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

/// Parse `NAME=cents,NAME=cents`.
fn parse_rates(value: &str, key: &'static str) -> Result<BTreeMap<String, i64>, ConfigError> {
    split_list(value)
        .into_iter()
        .map(|pair| {
            pair.split_once('=')
                .and_then(|(gpu, cents)| Some((gpu.trim().to_string(), cents.trim().parse().ok()?)))
                .ok_or(ConfigError::Invalid {
                    key,
                    value: pair.clone(),
                })
        })
        .collect()
}
