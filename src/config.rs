use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use config::{Config, ConfigError, Environment, File};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DirectoryConfig {
    pub name: String,
    pub path: PathBuf,
    #[serde(default = "default_visible")]
    pub is_visible: bool,
}

fn default_visible() -> bool {
    true
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct AppConfig {
    /// A search fires once more than this many demands wait in one directory.
    pub face_searching_batch_size: usize,
    /// Minutes a demand may wait before the sweep forces a search.
    pub max_waiting_time_before_search: i64,
    pub face_searching_chunk_size: usize,
    pub indexing_chunk_size: usize,
    pub face_matching_threshold: f64,
    pub with_face_recognition: bool,
    pub simulated_encode_delay_ms: u64,
    pub encodings_directory: PathBuf,
    pub upload_directory: PathBuf,
    /// SQLite database holding directories, photos, demands and job results.
    pub database_path: PathBuf,
    pub num_workers: usize,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub job_result_retention_secs: i64,
    pub sweep_interval_secs: u64,
    /// Minutes during which a second demand from the same person is refused.
    pub min_time_between_demands: i64,
    pub base_url: String,
    pub email_from: String,
    pub smtp_host: Option<String>,
    pub smtp_port: u16,
    pub smtp_username: Option<String>,
    pub smtp_password: Option<String>,
    pub web_port: u16,
    pub log_level: String,
    pub directories: Vec<DirectoryConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            face_searching_batch_size: 10,
            max_waiting_time_before_search: 30,
            face_searching_chunk_size: 100,
            indexing_chunk_size: 50,
            face_matching_threshold: 0.6,
            with_face_recognition: true,
            simulated_encode_delay_ms: 5000,
            encodings_directory: PathBuf::from("data/encodings"),
            upload_directory: PathBuf::from("data/uploads"),
            database_path: PathBuf::from("data/facefinder.db"),
            num_workers: 4,
            max_retries: 3,
            retry_backoff_ms: 1000,
            job_result_retention_secs: 86_400,
            sweep_interval_secs: 300,
            min_time_between_demands: 5,
            base_url: "http://localhost:8080".to_string(),
            email_from: "facefinder@localhost".to_string(),
            smtp_host: None,
            smtp_port: 587,
            smtp_username: None,
            smtp_password: None,
            web_port: 8080,
            log_level: "info".to_string(),
            directories: Vec::new(),
        }
    }
}

impl AppConfig {
    pub fn new() -> Result<Self, ConfigError> {
        let env = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = Config::builder()
            .add_source(Config::try_from(&AppConfig::default())?)
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", env)).required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(Environment::with_prefix("FACEFINDER").try_parsing(true))
            .build()?;

        s.try_deserialize()
    }

    pub fn max_waiting_time(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.max_waiting_time_before_search)
    }

    pub fn min_time_between_demands(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.min_time_between_demands)
    }

    pub fn result_retention(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.job_result_retention_secs)
    }
}
