//! The operator CLI (spec section 6): a thin HTTP client against the same
//! router `gateway-server` exposes, standing in for the original's
//! Unix-socket command server.

use clap::{Parser, Subcommand};
use serde::Serialize;

#[derive(Parser)]
#[command(name = "gatewayctl", about = "Control a running gateway instance")]
struct Cli {
    /// Base URL of the gateway's HTTP surface.
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    endpoint: String,

    /// Operator username to authenticate as.
    #[arg(long)]
    username: String,

    /// Shared passcode configured on the gateway.
    #[arg(long)]
    passcode: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Rescans the install directory and re-homes bindings by name.
    Reload,
    /// Starts a backend.
    Start { name: String },
    /// Gracefully stops a backend.
    Stop { name: String },
    /// Force-kills a backend without the countdown.
    Kill { name: String },
    /// Sends a literal line to a backend's stdin.
    Send { name: String, line: Vec<String> },
    /// Binds the current operator session to a backend.
    Connect { name: String },
    /// Prints the status of every backend.
    Status,
}

#[derive(Serialize)]
struct LoginBody<'a> {
    username: &'a str,
    passcode: &'a str,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let client = match reqwest::Client::builder().cookie_store(true).build() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = login(&client, &cli.endpoint, &cli.username, &cli.passcode).await {
        eprintln!("login failed: {e}");
        std::process::exit(1);
    }

    let result = match &cli.command {
        Command::Reload => post(&client, &cli.endpoint, "/reload", None).await,
        Command::Start { name } => {
            post(&client, &cli.endpoint, &format!("/{name}/start"), None).await
        }
        Command::Stop { name } => {
            post(&client, &cli.endpoint, &format!("/{name}/stop"), None).await
        }
        Command::Kill { name } => {
            post(&client, &cli.endpoint, &format!("/{name}/kill"), None).await
        }
        Command::Send { name, line } => {
            let body = line.join(" ");
            post(&client, &cli.endpoint, &format!("/{name}/send"), Some(body)).await
        }
        Command::Connect { name } => {
            post(&client, &cli.endpoint, &format!("/{name}/connect"), None).await
        }
        Command::Status => get(&client, &cli.endpoint, "/servers").await,
    };

    match result {
        Ok(body) => println!("{body}"),
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    }
}

async fn login(
    client: &reqwest::Client,
    endpoint: &str,
    username: &str,
    passcode: &str,
) -> Result<(), reqwest::Error> {
    client
        .post(format!("{endpoint}/login"))
        .json(&LoginBody { username, passcode })
        .send()
        .await?
        .error_for_status()?;
    Ok(())
}

async fn post(
    client: &reqwest::Client,
    endpoint: &str,
    path: &str,
    body: Option<String>,
) -> Result<String, reqwest::Error> {
    let mut req = client.post(format!("{endpoint}{path}"));
    if let Some(body) = body {
        req = req.body(body);
    }
    let resp = req.send().await?.error_for_status()?;
    resp.text().await
}

async fn get(client: &reqwest::Client, endpoint: &str, path: &str) -> Result<String, reqwest::Error> {
    let resp = client
        .get(format!("{endpoint}{path}"))
        .send()
        .await?
        .error_for_status()?;
    resp.text().await
}
