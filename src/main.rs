use std::io::{self, Read};
use std::process;

use clap::{Parser, Subcommand};
use domain::gateway::market_data::{MarketDataClient, MarketDataSettings};
use integration_auth::vault::{generate_key_hex, is_legacy_plaintext, Vault};
use log::*;
use secrecy::SecretString;
use serde_json::Value;
use service::{config::Config, logging::Logger};

/// Operator tooling for stored brokerage credentials.
#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    config: Config,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print a new random CREDENTIALS_ENCRYPTION_KEY.
    Keygen,
    /// Encrypt credential JSON read from stdin.
    Seal,
    /// Decrypt a credential blob read from stdin.
    Open,
    /// Report whether a blob from stdin is legacy plaintext, encrypted or unrecoverable.
    Inspect,
    /// Look up a quote through the metered market data provider.
    Quote { symbol: String },
}

fn read_stdin() -> Result<String, io::Error> {
    let mut input = String::new();
    io::stdin().read_to_string(&mut input)?;
    Ok(input.trim().to_string())
}

fn vault(config: &Config) -> Vault {
    Vault::new(config.credentials_encryption_key().map(SecretString::from))
}

fn fail(message: impl std::fmt::Display) -> ! {
    error!("{message}");
    process::exit(1);
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    Logger::init_logger(&cli.config);

    match cli.command {
        Command::Keygen => println!("{}", generate_key_hex()),
        Command::Seal => {
            let input = read_stdin().unwrap_or_else(|e| fail(e));
            let credentials: Value = serde_json::from_str(&input)
                .unwrap_or_else(|e| fail(format!("Input is not valid JSON: {e}")));
            let blob = vault(&cli.config)
                .encrypt_credentials(&credentials)
                .unwrap_or_else(|e| fail(e));
            println!("{blob}");
        }
        Command::Open => {
            let input = read_stdin().unwrap_or_else(|e| fail(e));
            let plaintext = vault(&cli.config)
                .decrypt(&input)
                .unwrap_or_else(|e| fail(e));
            println!("{}", String::from_utf8_lossy(&plaintext));
        }
        Command::Inspect => {
            let input = read_stdin().unwrap_or_else(|e| fail(e));
            if is_legacy_plaintext(&input) {
                println!("legacy-plaintext");
                return;
            }
            match vault(&cli.config).decrypt(&input) {
                Ok(_) => println!("encrypted"),
                Err(e) if e.is_unrecoverable() => println!("unrecoverable"),
                Err(e) => fail(e),
            }
        }
        Command::Quote { symbol } => {
            let settings = MarketDataSettings::from_config(&cli.config);
            let cache = MarketDataClient::shared_cache(&settings);
            let client = MarketDataClient::new(settings, cache).unwrap_or_else(|e| fail(e));
            match client.quote(&symbol).await {
                Some(quote) => {
                    let json = serde_json::to_string_pretty(&quote).unwrap_or_else(|e| fail(e));
                    println!("{json}");
                }
                None => fail(format!("No quote available for {symbol}")),
            }
            let status = client.quota_status();
            info!(
                "Market data budget: {} used, {} remaining",
                status.used, status.remaining
            );
        }
    }
}
