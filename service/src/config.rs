use clap::builder::TypedValueParser as _;
use clap::Parser;
use dotenvy::dotenv;
use log::LevelFilter;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Default brokerage API base URL used when `BROKERAGE_BASE_URL` is not set.
pub const DEFAULT_BROKERAGE_BASE_URL: &str = "https://api.brokerage.example/v1";
/// Default exchange API base URL used when `EXCHANGE_BASE_URL` is not set.
pub const DEFAULT_EXCHANGE_BASE_URL: &str = "https://api.exchange.example";
/// Default market data API base URL used when `MARKET_DATA_BASE_URL` is not set.
pub const DEFAULT_MARKET_DATA_BASE_URL: &str = "https://www.alphavantage.co";
/// Default chat-completions API base URL used when `AI_BASE_URL` is not set.
pub const DEFAULT_AI_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Clone, Debug, PartialEq)]
pub enum RustEnv {
    Development,
    Production,
    Staging,
}

#[derive(Debug, PartialEq, Eq)]
pub struct RustEnvParseError;

impl FromStr for RustEnv {
    type Err = RustEnvParseError;
    fn from_str(level: &str) -> Result<RustEnv, Self::Err> {
        match level.to_lowercase().as_str() {
            "development" => Ok(RustEnv::Development),
            "production" => Ok(RustEnv::Production),
            "staging" => Ok(RustEnv::Staging),
            _ => Err(RustEnvParseError),
        }
    }
}

impl fmt::Display for RustEnv {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RustEnv::Development => write!(f, "development"),
            RustEnv::Production => write!(f, "production"),
            RustEnv::Staging => write!(f, "staging"),
        }
    }
}

#[derive(Clone, Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// 64 hex characters (32 bytes) used to encrypt stored broker credentials.
    #[arg(long, env, hide_env_values = true)]
    credentials_encryption_key: Option<String>,

    /// The base URL of the brokerage API.
    /// Override in tests to point at a mock server.
    #[arg(long, env, default_value = DEFAULT_BROKERAGE_BASE_URL)]
    brokerage_base_url: String,
    /// The OAuth client ID registered with the brokerage.
    #[arg(long, env)]
    brokerage_client_id: Option<String>,
    /// The OAuth client secret registered with the brokerage.
    #[arg(long, env, hide_env_values = true)]
    brokerage_client_secret: Option<String>,

    /// The base URL of the exchange API.
    #[arg(long, env, default_value = DEFAULT_EXCHANGE_BASE_URL)]
    exchange_base_url: String,

    /// The base URL of the metered market data API.
    #[arg(long, env, default_value = DEFAULT_MARKET_DATA_BASE_URL)]
    market_data_base_url: String,
    /// The API key to use when calling the market data API.
    #[arg(long, env, hide_env_values = true)]
    market_data_api_key: Option<String>,
    /// Market data calls allowed per UTC day.
    #[arg(long, env, default_value_t = 25)]
    pub market_data_daily_limit: u32,
    /// Market data calls held back from automatic use each day.
    #[arg(long, env, default_value_t = 1)]
    pub market_data_reserve: u32,
    /// Remaining market data calls at which the quota is reported as low.
    #[arg(long, env, default_value_t = 5)]
    pub market_data_warning_threshold: u32,
    /// Seconds a market data response stays cached.
    #[arg(long, env, default_value_t = 900)]
    pub market_data_cache_ttl_secs: u64,

    /// The base URL of the chat-completions API used for portfolio analysis.
    #[arg(long, env, default_value = DEFAULT_AI_BASE_URL)]
    ai_base_url: String,
    /// The API key to use when calling the chat-completions API.
    #[arg(long, env, hide_env_values = true)]
    ai_api_key: Option<String>,
    /// The model to request completions from.
    #[arg(long, env, default_value = "gpt-4o-mini")]
    ai_model: String,
    /// Attempts per completion, including the first one.
    #[arg(long, env, default_value_t = 3)]
    pub ai_max_attempts: u32,
    /// Delay before the first retry; doubled on every further attempt.
    #[arg(long, env, default_value_t = 1000)]
    pub ai_base_delay_ms: u64,

    /// Timeout in seconds for any outbound HTTP request
    #[arg(long, env, default_value_t = 30)]
    pub http_timeout_secs: u64,

    /// Seconds before reported expiry at which access tokens are refreshed
    #[arg(long, env, default_value_t = 300)]
    pub token_refresh_buffer_secs: i64,

    /// Set the log level verbosity threshold (level) to control what gets displayed on console output
    #[arg(
        short,
        long,
        env,
        default_value_t = LevelFilter::Info,
        value_parser = clap::builder::PossibleValuesParser::new(["OFF", "ERROR", "WARN", "INFO", "DEBUG", "TRACE"])
            .map(|s| s.parse::<LevelFilter>().unwrap()),
        )]
    pub log_level_filter: LevelFilter,

    /// Set the Rust runtime environment to use.
    #[arg(
    short,
    long,
    env,
    default_value_t = RustEnv::Development,
    value_parser = clap::builder::PossibleValuesParser::new([
        "DEVELOPMENT", "PRODUCTION", "STAGING",
        "development", "production", "staging"
    ])
        .map(|s| s.parse::<RustEnv>().unwrap()),
    )]
    pub runtime_env: RustEnv,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    pub fn new() -> Self {
        // Load .env file first
        dotenv().ok();
        // Then parse the command line parameters and flags
        Config::parse()
    }

    /// Returns the credentials encryption key, if configured.
    pub fn credentials_encryption_key(&self) -> Option<String> {
        self.credentials_encryption_key.clone()
    }

    pub fn set_credentials_encryption_key(mut self, key: String) -> Self {
        self.credentials_encryption_key = Some(key);
        self
    }

    /// Returns the brokerage API base URL.
    pub fn brokerage_base_url(&self) -> &str {
        &self.brokerage_base_url
    }

    pub fn set_brokerage_base_url(mut self, url: String) -> Self {
        self.brokerage_base_url = url;
        self
    }

    pub fn brokerage_client_id(&self) -> Option<String> {
        self.brokerage_client_id.clone()
    }

    pub fn brokerage_client_secret(&self) -> Option<String> {
        self.brokerage_client_secret.clone()
    }

    /// Returns the exchange API base URL.
    pub fn exchange_base_url(&self) -> &str {
        &self.exchange_base_url
    }

    pub fn set_exchange_base_url(mut self, url: String) -> Self {
        self.exchange_base_url = url;
        self
    }

    /// Returns the market data API base URL.
    pub fn market_data_base_url(&self) -> &str {
        &self.market_data_base_url
    }

    pub fn set_market_data_base_url(mut self, url: String) -> Self {
        self.market_data_base_url = url;
        self
    }

    /// Returns the market data API key, if configured.
    pub fn market_data_api_key(&self) -> Option<String> {
        self.market_data_api_key.clone()
    }

    pub fn set_market_data_api_key(mut self, key: String) -> Self {
        self.market_data_api_key = Some(key);
        self
    }

    pub fn market_data_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.market_data_cache_ttl_secs)
    }

    /// Returns the chat-completions API base URL.
    pub fn ai_base_url(&self) -> &str {
        &self.ai_base_url
    }

    pub fn set_ai_base_url(mut self, url: String) -> Self {
        self.ai_base_url = url;
        self
    }

    /// Returns the chat-completions API key, if configured.
    pub fn ai_api_key(&self) -> Option<String> {
        self.ai_api_key.clone()
    }

    pub fn set_ai_api_key(mut self, key: String) -> Self {
        self.ai_api_key = Some(key);
        self
    }

    pub fn ai_model(&self) -> &str {
        &self.ai_model
    }

    pub fn ai_base_delay(&self) -> Duration {
        Duration::from_millis(self.ai_base_delay_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn runtime_env(&self) -> RustEnv {
        self.runtime_env.clone()
    }

    pub fn is_production(&self) -> bool {
        self.runtime_env() == RustEnv::Production
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        let mut argv = vec!["portfolio_sync"];
        argv.extend_from_slice(args);
        Config::try_parse_from(argv).expect("arguments should parse")
    }

    #[test]
    fn test_base_url_and_limits() {
        let config = parse(&[
            "--brokerage-base-url",
            DEFAULT_BROKERAGE_BASE_URL,
            "--market-data-daily-limit",
            "25",
        ]);
        assert_eq!(config.brokerage_base_url(), DEFAULT_BROKERAGE_BASE_URL);
        assert_eq!(config.market_data_daily_limit, 25);
        assert_eq!(config.http_timeout(), Duration::from_secs(config.http_timeout_secs));
    }

    #[test]
    fn test_overrides() {
        let config = parse(&[
            "--exchange-base-url",
            "http://127.0.0.1:9999",
            "--ai-max-attempts",
            "5",
            "--runtime-env",
            "PRODUCTION",
            "--log-level-filter",
            "DEBUG",
        ]);
        assert_eq!(config.exchange_base_url(), "http://127.0.0.1:9999");
        assert_eq!(config.ai_max_attempts, 5);
        assert!(config.is_production());
        assert_eq!(config.log_level_filter, LevelFilter::Debug);
    }

    #[test]
    fn test_setters() {
        let config = parse(&[])
            .set_credentials_encryption_key("ab".repeat(32))
            .set_market_data_api_key("demo".to_string());
        assert_eq!(config.credentials_encryption_key(), Some("ab".repeat(32)));
        assert_eq!(config.market_data_api_key().as_deref(), Some("demo"));
    }

    #[test]
    fn test_rust_env_parse() {
        assert_eq!("Staging".parse::<RustEnv>(), Ok(RustEnv::Staging));
        assert_eq!("qa".parse::<RustEnv>(), Err(RustEnvParseError));
        assert_eq!(RustEnv::Production.to_string(), "production");
    }
}
