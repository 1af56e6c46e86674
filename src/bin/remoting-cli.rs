use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use clap::{Parser, Subcommand};
use serde_json::{json, Value};

use remoting_endpoint::net::Endpoint;
use remoting_endpoint::outbound::{ClientTls, OutboundConnection};
use remoting_endpoint::realm::tls::{client_config, load_certs, load_private_key, load_roots};
use remoting_endpoint::sasl::client::PasswordCredentials;

#[derive(Parser)]
#[command(name = "remoting-cli")]
#[command(about = "Client for a remoting endpoint", long_about = None)]
struct Cli {
    /// Endpoint URI, e.g. remote://localhost:4447
    #[arg(short, long, default_value = "remote://localhost:4447")]
    uri: String,

    #[arg(long)]
    user: Option<String>,

    #[arg(long, requires = "user")]
    password: Option<String>,

    /// CA bundle (PEM) used to verify the server when TLS is offered.
    #[arg(long)]
    ca: Option<PathBuf>,

    /// Client certificate (PEM) for EXTERNAL authentication.
    #[arg(long, requires_all = ["ca", "key"])]
    cert: Option<PathBuf>,

    #[arg(long, requires = "cert")]
    key: Option<PathBuf>,

    /// Channel service to open.
    #[arg(short, long, default_value = "echo")]
    service: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Authenticate and report the granted identity
    Probe,
    /// Open a channel and send each message, printing the replies
    Echo { messages: Vec<String> },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let endpoint = Endpoint::new("remoting-cli");
    let mut outbound = OutboundConnection::generic("cli", &cli.uri, Some(endpoint))?;
    if let Some(user) = &cli.user {
        outbound = outbound.with_credentials(Arc::new(PasswordCredentials::new(
            user.clone(),
            cli.password.clone().unwrap_or_default(),
        )));
    }
    if let Some(ca) = &cli.ca {
        let identity = match (&cli.cert, &cli.key) {
            (Some(cert), Some(key)) => Some((load_certs(cert)?, load_private_key(key)?)),
            _ => None,
        };
        let has_certificate = identity.is_some();
        outbound = outbound.with_tls(ClientTls {
            config: client_config(load_roots(ca)?, identity)?,
            has_certificate,
        });
    }

    let started = Instant::now();
    let connection = outbound.connect().await?;
    let mut report = json!({
        "uri": connection.uri().as_str(),
        "remote_endpoint": connection.remote_endpoint(),
        "identity": connection.identity(),
        "connect_ms": started.elapsed().as_millis() as u64,
    });

    if let Commands::Echo { messages } = cli.command {
        let mut channel = connection.open_channel(&cli.service).await?;
        let mut replies = Vec::with_capacity(messages.len());
        for message in &messages {
            let reply = channel.request(message).await?;
            replies.push(reply.map_or(Value::Null, Value::String));
        }
        report["channel"] = json!(channel.id());
        report["replies"] = Value::Array(replies);
        channel.close().await?;
    }

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
