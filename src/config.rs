use std::{env, path::PathBuf, time::Duration};

pub const DEFAULT_PLACEHOLDER_IMAGE: &str = "/images/no_image.png";

/// Settings for the import supervisor and its run.
#[derive(Debug, Clone)]
pub struct ImportConfig {
    /// Where uploaded spreadsheets and archives are written before a run owns them.
    pub upload_dir: PathBuf,
    /// Root for per-run extracted image directories.
    pub temp_dir: PathBuf,
    pub placeholder_image: String,
    /// Number of log lines returned by a status poll.
    pub log_tail: usize,
    pub job_timeout: Duration,
}

impl ImportConfig {
    pub fn from_env() -> Self {
        let base = env::temp_dir().join("catalog-import");
        Self {
            upload_dir: env::var("IMPORT_UPLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| base.join("uploads")),
            temp_dir: env::var("IMPORT_TEMP_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| base.join("scratch")),
            placeholder_image: env::var("PLACEHOLDER_IMAGE_URL")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_PLACEHOLDER_IMAGE.to_string()),
            log_tail: parse_env("IMPORT_LOG_TAIL")
                .filter(|v: &usize| *v > 0)
                .unwrap_or(100),
            job_timeout: Duration::from_secs(
                parse_env("IMPORT_JOB_TIMEOUT_SECS")
                    .filter(|v: &u64| *v > 0)
                    .unwrap_or(3600),
            ),
        }
    }
}

/// Where product images end up.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Remote object-storage endpoint. When unset images are mirrored locally.
    pub remote_url: Option<String>,
    pub remote_key: Option<String>,
    pub remote_secret: Option<String>,
    pub media_dir: PathBuf,
    pub media_base_url: String,
    /// Reuse already uploaded assets with identical content.
    pub dedup: bool,
    pub redis_url: Option<String>,
    pub http_timeout: Duration,
    pub http_connect_timeout: Duration,
}

impl StorageConfig {
    pub fn from_env() -> Self {
        Self {
            remote_url: non_empty("ASSET_STORE_URL"),
            remote_key: non_empty("ASSET_STORE_KEY"),
            remote_secret: non_empty("ASSET_STORE_SECRET"),
            media_dir: env::var("MEDIA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("media")),
            media_base_url: non_empty("MEDIA_BASE_URL").unwrap_or_else(|| "/media".to_string()),
            dedup: parse_env_bool("ASSET_DEDUP"),
            redis_url: non_empty("REDIS_URL"),
            http_timeout: Duration::from_secs(parse_env("HTTP_TIMEOUT_SECS").unwrap_or(30)),
            http_connect_timeout: Duration::from_secs(
                parse_env("HTTP_CONNECT_TIMEOUT_SECS").unwrap_or(5),
            ),
        }
    }
}

/// HTTP listener settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub body_limit: usize,
    pub catalog_snapshot: Option<PathBuf>,
    /// Required in `X-Metrics-Key` when set.
    pub metrics_key: Option<String>,
    /// Required in `X-Docs-Key` when set.
    pub openapi_key: Option<String>,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self {
            port: parse_env("PORT").unwrap_or(8000),
            body_limit: parse_env("REQUEST_MAX_BYTES")
                .filter(|v: &usize| *v > 0)
                .unwrap_or(256 * 1024 * 1024),
            catalog_snapshot: non_empty("CATALOG_SNAPSHOT_PATH").map(PathBuf::from),
            metrics_key: non_empty("METRICS_KEY"),
            openapi_key: non_empty("OPENAPI_KEY"),
        }
    }
}

fn non_empty(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}

pub fn parse_env_bool(key: &str) -> bool {
    match env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_without_environment() {
        let config = ImportConfig::from_env();
        assert!(config.log_tail > 0);
        assert!(config.job_timeout.as_secs() > 0);
        assert!(!config.placeholder_image.is_empty());
    }

    #[test]
    fn unknown_bool_values_are_false() {
        assert!(!parse_env_bool("CATALOG_IMPORT_TEST_UNSET_FLAG"));
    }
}
