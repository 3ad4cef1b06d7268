pub type Result<T> = core::result::Result<T, EngineError>;

pub const OK: i32 = 0;
pub const ERR_INVALID_ARGUMENT: i32 = 1;
pub const ERR_BACKEND: i32 = 2;
pub const ERR_PARSE_FAILED: i32 = 3;
pub const ERR_MODEL_INVALID: i32 = 4;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("backend: {0}")]
    Backend(&'static str),
    #[error("parse failed: {0}")]
    ParseFailed(&'static str),
    #[error("model invalid: {0}")]
    ModelInvalid(&'static str),
    #[error("sequencing violation: {0}")]
    Sequencing(&'static str),
}

impl EngineError {
    /// Stable integer code for snapshot-style assertions and request
    /// `error_out` slots. Sequencing violations report as backend failures.
    pub fn code(&self) -> i32 {
        match self {
            EngineError::InvalidArgument(_) => ERR_INVALID_ARGUMENT,
            EngineError::Backend(_) => ERR_BACKEND,
            EngineError::ParseFailed(_) => ERR_PARSE_FAILED,
            EngineError::ModelInvalid(_) => ERR_MODEL_INVALID,
            EngineError::Sequencing(_) => ERR_BACKEND,
        }
    }
}

pub mod config {
    use serde::Deserialize;
    use std::env;

    #[derive(Debug, Clone, Deserialize)]
    pub struct EngineConfig {
        pub kv_size: usize,
        pub n_stream: usize,
        pub n_pad: usize,
        pub n_ubatch: usize,
        pub split_mode: Option<String>,
        pub buffer_alignment: Option<u64>,
        pub max_chunk_size: Option<u64>,
    }

    impl Default for EngineConfig {
        fn default() -> Self {
            Self {
                kv_size: 2048,
                n_stream: 1,
                n_pad: 32,
                n_ubatch: 512,
                split_mode: None,
                buffer_alignment: Some(16),
                max_chunk_size: None,
            }
        }
    }

    impl EngineConfig {
        pub fn load() -> Self {
            if let Ok(path) = env::var("ENGINE_CONFIG") {
                let Ok(text) = std::fs::read_to_string(path) else { return Self::default() };
                let Ok(cfg) = serde_yaml::from_str::<EngineConfig>(&text) else { return Self::default() };
                return cfg;
            }
            let mut cfg = Self::default();
            if let Some(v) = env::var("ENGINE_KV_SIZE").ok().and_then(|v| v.parse().ok()) { cfg.kv_size = v; }
            if let Some(v) = env::var("ENGINE_N_STREAM").ok().and_then(|v| v.parse().ok()) { cfg.n_stream = v; }
            if let Some(v) = env::var("ENGINE_N_PAD").ok().and_then(|v| v.parse().ok()) { cfg.n_pad = v; }
            if let Some(v) = env::var("ENGINE_N_UBATCH").ok().and_then(|v| v.parse().ok()) { cfg.n_ubatch = v; }
            if let Ok(v) = env::var("ENGINE_SPLIT_MODE") { cfg.split_mode = Some(v); }
            if let Some(v) = env::var("ENGINE_BUFFER_ALIGNMENT").ok().and_then(|v| v.parse().ok()) { cfg.buffer_alignment = Some(v); }
            if let Some(v) = env::var("ENGINE_MAX_CHUNK_SIZE").ok().and_then(|v| v.parse().ok()) { cfg.max_chunk_size = Some(v); }
            cfg
        }
    }
}

pub mod logging {
    use once_cell::sync::OnceCell;
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    static INIT: OnceCell<()> = OnceCell::new();

    /// Idempotent tracing bootstrap; honors RUST_LOG, defaults to "info".
    pub fn init() {
        INIT.get_or_init(|| {
            let env_filter = tracing_subscriber::EnvFilter::new(
                std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
            );
            let _ = tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .try_init();
        });
    }
}
