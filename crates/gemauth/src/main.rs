// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::io::Write;

use clap::{Parser, Subcommand};
use reqwest::header::{HeaderName, HeaderValue};
use reqwest::Method;
use tracing::error;

use gemauth::broker::{AuthBroker, IMPORT_INSTRUCTIONS};
use gemauth::config::BrokerConfig;
use gemauth::credential::store::FileStore;
use gemauth::error::AuthError;
use gemauth::fetch::ApiRequest;

#[derive(Debug, Parser)]
#[command(name = "gemauth", version, about = "Google OAuth credential broker")]
struct Cli {
    #[command(flatten)]
    config: BrokerConfig,

    /// Log format (text or json).
    #[arg(long, default_value = "text", env = "GEMAUTH_LOG_FORMAT")]
    log_format: String,

    /// Log level filter.
    #[arg(long, default_value = "info", env = "GEMAUTH_LOG_LEVEL")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Sign in with Google in the browser and store the credential.
    Login,
    /// Import a credential from the Gemini CLI or gcloud ADC.
    Import,
    /// Show which credential would be used and whether it is healthy.
    Status,
    /// Send an authenticated request and print the response body.
    Fetch(FetchArgs),
}

#[derive(Debug, clap::Args)]
struct FetchArgs {
    /// HTTP method.
    #[arg(short = 'X', long, default_value = "GET")]
    method: String,

    /// Request body.
    #[arg(short = 'd', long)]
    data: Option<String>,

    /// Extra header as `Name: value` (repeatable).
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,

    url: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(&cli);

    if let Err(e) = run(cli).await {
        error!("fatal: {e:#}");
        eprintln!("error: {e:#}");
        if let Some(auth) = e.downcast_ref::<AuthError>() {
            eprintln!("hint: {}", auth.hint());
        }
        std::process::exit(1);
    }
}

fn init_tracing(cli: &Cli) {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    let result = match cli.log_format.as_str() {
        "json" => fmt::fmt().with_env_filter(filter).with_writer(std::io::stderr).json().try_init(),
        _ => fmt::fmt().with_env_filter(filter).with_writer(std::io::stderr).try_init(),
    };
    drop(result);
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let broker = AuthBroker::from_config(cli.config)?;
    let result = match cli.command {
        Command::Login => login(&broker).await,
        Command::Import => import(&broker).await,
        Command::Status => status(&broker).await,
        Command::Fetch(args) => fetch(&broker, args).await,
    };
    broker.stop().await;
    result
}

async fn login(broker: &AuthBroker<FileStore>) -> anyhow::Result<()> {
    let auth = broker.authorize().await?;
    println!("{}\n\n  {}\n", auth.instructions, auth.url);
    let credential = broker.callback(auth.session).await?;
    if credential.is_refreshable() {
        println!("Connected.");
    } else {
        println!("Connected without a refresh token; sign in again when the token expires.");
    }
    Ok(())
}

async fn import(broker: &AuthBroker<FileStore>) -> anyhow::Result<()> {
    println!("{IMPORT_INSTRUCTIONS}");
    broker.import_external().await?;
    println!("Imported.");
    Ok(())
}

async fn status(broker: &AuthBroker<FileStore>) -> anyhow::Result<()> {
    let report = broker.status().await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn fetch(broker: &AuthBroker<FileStore>, args: FetchArgs) -> anyhow::Result<()> {
    let method = Method::from_bytes(args.method.to_uppercase().as_bytes())?;
    let mut request = ApiRequest::parse(method, &args.url)?;
    for header in &args.headers {
        let (name, value) = header
            .split_once(':')
            .ok_or_else(|| anyhow::anyhow!("header must be `Name: value`: {header}"))?;
        request = request.with_header(
            HeaderName::from_bytes(name.trim().as_bytes())?,
            HeaderValue::from_str(value.trim())?,
        );
    }
    if let Some(data) = args.data {
        request = request.with_body(data);
    }

    let response = broker.fetch(&request).await?;
    eprintln!("{}", response.status);
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(&response.body)?;
    stdout.flush()?;
    Ok(())
}
