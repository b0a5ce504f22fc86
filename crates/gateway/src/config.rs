use std::collections::{BTreeSet, HashMap};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use unigraph_contracts::ValidationBudget;

use crate::batch::FlushTrigger;

pub const DEFAULT_JWT_SECRET: &str = "unigraph-dev-secret-change-me";

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_addr: SocketAddr,
    pub environment: Environment,
    pub introspection_enabled: bool,
    pub budget: ValidationBudget,
    pub complexity_list_factor: u64,
    pub rate_limit_window_ms: u64,
    pub rate_limit_max: u32,
    pub rate_limit_max_keys: usize,
    pub audit_enabled: bool,
    pub ledger_capacity: usize,
    pub jwt_secret: String,
    pub token_ttl_secs: u64,
    pub token_clock_skew_secs: u64,
    pub upstream_url: String,
    pub upstream_timeout_ms: u64,
    pub batch_delay_ms: u64,
    pub posts_limit: usize,
    pub blocked_fields: BTreeSet<String>,
    pub max_body_bytes: usize,
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    pub fn as_str(self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Production => "production",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupError {
    pub code: &'static str,
    pub message: String,
}

impl std::fmt::Display for StartupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for StartupError {}

impl GatewayConfig {
    pub fn load() -> Result<Self, StartupError> {
        let mut merged = HashMap::new();

        if let Ok(config_path) = std::env::var("UNIGRAPH_CONFIG_PATH") {
            let config_path = config_path.trim();
            if !config_path.is_empty() {
                let file_kv = parse_env_file(config_path)?;
                merged.extend(file_kv);
            }
        }

        merged.extend(std::env::vars());

        Self::from_kv(&merged)
    }

    pub fn from_kv(kv: &HashMap<String, String>) -> Result<Self, StartupError> {
        let bind_addr = parse_socket_addr(
            kv.get("UNIGRAPH_BIND_ADDR"),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 4000),
            "UNIGRAPH_BIND_ADDR",
        )?;

        let environment = parse_environment(kv.get("UNIGRAPH_ENVIRONMENT"))?;

        let introspection_enabled = match kv.get("UNIGRAPH_INTROSPECTION_ENABLED") {
            None => environment != Environment::Production,
            Some(raw) => parse_bool(Some(raw)).ok_or_else(|| StartupError {
                code: "ERR_INVALID_CONFIG",
                message: "UNIGRAPH_INTROSPECTION_ENABLED must be a boolean".to_string(),
            })?,
        };

        let defaults = ValidationBudget::default();
        let max_depth = parse_u32(
            kv.get("UNIGRAPH_QUERY_DEPTH_LIMIT"),
            defaults.max_depth,
            "UNIGRAPH_QUERY_DEPTH_LIMIT",
        )?;
        let max_cost = parse_u64(
            kv.get("UNIGRAPH_QUERY_COMPLEXITY_LIMIT"),
            defaults.max_cost,
            "UNIGRAPH_QUERY_COMPLEXITY_LIMIT",
        )?;
        if max_depth == 0 || max_cost == 0 {
            return Err(StartupError {
                code: "ERR_INVALID_CONFIG",
                message: "query depth and complexity limits must be >= 1".to_string(),
            });
        }

        let complexity_list_factor = parse_u64(
            kv.get("UNIGRAPH_COMPLEXITY_LIST_FACTOR"),
            10,
            "UNIGRAPH_COMPLEXITY_LIST_FACTOR",
        )?;
        if complexity_list_factor == 0 {
            return Err(StartupError {
                code: "ERR_INVALID_CONFIG",
                message: "UNIGRAPH_COMPLEXITY_LIST_FACTOR must be >= 1".to_string(),
            });
        }

        let rate_limit_window_ms = parse_u64(
            kv.get("UNIGRAPH_RATE_LIMIT_WINDOW_MS"),
            15 * 60 * 1000,
            "UNIGRAPH_RATE_LIMIT_WINDOW_MS",
        )?;
        if rate_limit_window_ms == 0 {
            return Err(StartupError {
                code: "ERR_INVALID_CONFIG",
                message: "UNIGRAPH_RATE_LIMIT_WINDOW_MS must be >= 1".to_string(),
            });
        }
        let rate_limit_max = parse_u32(
            kv.get("UNIGRAPH_RATE_LIMIT_MAX"),
            100,
            "UNIGRAPH_RATE_LIMIT_MAX",
        )?;
        let rate_limit_max_keys = parse_usize(
            kv.get("UNIGRAPH_RATE_LIMIT_MAX_KEYS"),
            16_384,
            "UNIGRAPH_RATE_LIMIT_MAX_KEYS",
        )?;

        let audit_enabled = match kv.get("UNIGRAPH_AUDIT_ENABLED") {
            None => true,
            Some(raw) => parse_bool(Some(raw)).ok_or_else(|| StartupError {
                code: "ERR_INVALID_CONFIG",
                message: "UNIGRAPH_AUDIT_ENABLED must be a boolean".to_string(),
            })?,
        };

        let ledger_capacity = parse_usize(
            kv.get("UNIGRAPH_LEDGER_CAPACITY"),
            unigraph_ledger::DEFAULT_CAPACITY,
            "UNIGRAPH_LEDGER_CAPACITY",
        )?;
        if ledger_capacity == 0 {
            return Err(StartupError {
                code: "ERR_INVALID_CONFIG",
                message: "UNIGRAPH_LEDGER_CAPACITY must be >= 1".to_string(),
            });
        }

        let jwt_secret = kv
            .get("UNIGRAPH_JWT_SECRET")
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_JWT_SECRET)
            .to_string();

        if environment == Environment::Production
            && !bind_addr.ip().is_loopback()
            && jwt_secret == DEFAULT_JWT_SECRET
        {
            return Err(StartupError {
                code: "ERR_DEFAULT_SECRET_IN_PRODUCTION",
                message: "non-local production bind requires UNIGRAPH_JWT_SECRET; refuse startup"
                    .to_string(),
            });
        }

        let token_ttl_secs = parse_u64(
            kv.get("UNIGRAPH_TOKEN_TTL_SECS"),
            24 * 60 * 60,
            "UNIGRAPH_TOKEN_TTL_SECS",
        )?;
        if token_ttl_secs == 0 {
            return Err(StartupError {
                code: "ERR_INVALID_CONFIG",
                message: "UNIGRAPH_TOKEN_TTL_SECS must be >= 1".to_string(),
            });
        }
        let token_clock_skew_secs = parse_u64(
            kv.get("UNIGRAPH_TOKEN_CLOCK_SKEW_SECS"),
            0,
            "UNIGRAPH_TOKEN_CLOCK_SKEW_SECS",
        )?;

        let upstream_url = kv
            .get("UNIGRAPH_UPSTREAM_URL")
            .map(|s| s.trim().trim_end_matches('/'))
            .filter(|s| !s.is_empty())
            .unwrap_or("https://jsonplaceholder.typicode.com")
            .to_string();
        if !(upstream_url.starts_with("http://") || upstream_url.starts_with("https://")) {
            return Err(StartupError {
                code: "ERR_INVALID_CONFIG",
                message: "UNIGRAPH_UPSTREAM_URL must be an http(s) url".to_string(),
            });
        }

        let upstream_timeout_ms = parse_u64(
            kv.get("UNIGRAPH_UPSTREAM_TIMEOUT_MS"),
            5000,
            "UNIGRAPH_UPSTREAM_TIMEOUT_MS",
        )?;
        let batch_delay_ms = parse_u64(
            kv.get("UNIGRAPH_BATCH_DELAY_MS"),
            0,
            "UNIGRAPH_BATCH_DELAY_MS",
        )?;
        let posts_limit = parse_usize(kv.get("UNIGRAPH_POSTS_LIMIT"), 20, "UNIGRAPH_POSTS_LIMIT")?;

        let blocked_fields = kv
            .get("UNIGRAPH_BLOCKED_FIELDS")
            .map(|s| s.as_str())
            .unwrap_or("")
            .split(',')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .collect::<BTreeSet<_>>();

        let max_body_bytes = parse_usize(
            kv.get("UNIGRAPH_MAX_BODY_BYTES"),
            1024 * 1024,
            "UNIGRAPH_MAX_BODY_BYTES",
        )?;

        let log_format = parse_log_format(kv.get("UNIGRAPH_LOG_FORMAT"))?;

        Ok(Self {
            bind_addr,
            environment,
            introspection_enabled,
            budget: ValidationBudget {
                max_depth,
                max_cost,
            },
            complexity_list_factor,
            rate_limit_window_ms,
            rate_limit_max,
            rate_limit_max_keys,
            audit_enabled,
            ledger_capacity,
            jwt_secret,
            token_ttl_secs,
            token_clock_skew_secs,
            upstream_url,
            upstream_timeout_ms,
            batch_delay_ms,
            posts_limit,
            blocked_fields,
            max_body_bytes,
            log_format,
        })
    }

    pub fn is_production(&self) -> bool {
        self.environment == Environment::Production
    }

    pub fn rate_window(&self) -> Duration {
        Duration::from_millis(self.rate_limit_window_ms)
    }

    pub fn flush_trigger(&self) -> FlushTrigger {
        if self.batch_delay_ms == 0 {
            FlushTrigger::EndOfTurn
        } else {
            FlushTrigger::Delay(Duration::from_millis(self.batch_delay_ms))
        }
    }
}

fn parse_env_file(path: &str) -> Result<HashMap<String, String>, StartupError> {
    let contents = std::fs::read_to_string(path).map_err(|_| StartupError {
        code: "ERR_CONFIG_FILE_READ",
        message: format!("failed to read config file at {}", path),
    })?;

    parse_env_lines(&contents)
}

fn parse_env_lines(contents: &str) -> Result<HashMap<String, String>, StartupError> {
    let mut kv = HashMap::new();

    for (idx, raw_line) in contents.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (key, value) = line.split_once('=').ok_or_else(|| StartupError {
            code: "ERR_CONFIG_FILE_PARSE",
            message: format!("invalid config line {} (expected KEY=VALUE)", idx + 1),
        })?;

        let key = key.trim();
        if key.is_empty() {
            return Err(StartupError {
                code: "ERR_CONFIG_FILE_PARSE",
                message: format!("invalid config line {} (empty key)", idx + 1),
            });
        }

        kv.insert(key.to_string(), strip_quotes(value.trim()));
    }

    Ok(kv)
}

fn strip_quotes(s: &str) -> String {
    let bytes = s.as_bytes();
    if bytes.len() >= 2 {
        let first = bytes[0];
        let last = bytes[bytes.len() - 1];
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            return s[1..bytes.len() - 1].to_string();
        }
    }
    s.to_string()
}

fn parse_socket_addr(
    value: Option<&String>,
    default: SocketAddr,
    key: &'static str,
) -> Result<SocketAddr, StartupError> {
    match value {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v.trim().parse::<SocketAddr>().map_err(|_| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be a valid host:port socket address", key),
        }),
    }
}

fn parse_usize(
    value: Option<&String>,
    default: usize,
    key: &'static str,
) -> Result<usize, StartupError> {
    match value {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v.trim().parse::<usize>().map_err(|_| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be an integer", key),
        }),
    }
}

fn parse_u64(value: Option<&String>, default: u64, key: &'static str) -> Result<u64, StartupError> {
    match value {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v.trim().parse::<u64>().map_err(|_| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be an integer", key),
        }),
    }
}

fn parse_u32(value: Option<&String>, default: u32, key: &'static str) -> Result<u32, StartupError> {
    match value {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v.trim().parse::<u32>().map_err(|_| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be an integer", key),
        }),
    }
}

fn parse_environment(value: Option<&String>) -> Result<Environment, StartupError> {
    let env = value
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .unwrap_or("development");

    match env {
        "development" | "dev" => Ok(Environment::Development),
        "production" | "prod" => Ok(Environment::Production),
        _ => Err(StartupError {
            code: "ERR_INVALID_CONFIG",
            message: "UNIGRAPH_ENVIRONMENT must be development or production".to_string(),
        }),
    }
}

fn parse_log_format(value: Option<&String>) -> Result<LogFormat, StartupError> {
    let format = value
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .unwrap_or("text");

    match format {
        "text" => Ok(LogFormat::Text),
        "json" => Ok(LogFormat::Json),
        _ => Err(StartupError {
            code: "ERR_INVALID_CONFIG",
            message: "UNIGRAPH_LOG_FORMAT must be text or json".to_string(),
        }),
    }
}

fn parse_bool(value: Option<&String>) -> Option<bool> {
    let value = value.map(|v| v.trim()).filter(|v| !v.is_empty())?;

    match value {
        "1" | "true" | "TRUE" | "yes" | "YES" => Some(true),
        "0" | "false" | "FALSE" | "no" | "NO" => Some(false),
        _ => None,
    }
}
