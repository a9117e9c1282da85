use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[zbus::proxy(
    interface = "org.tumtum.Challenge1",
    default_service = "org.tumtum.Challenge1",
    default_path = "/org/tumtum/Challenge1"
)]
trait Challenge {
    fn start(&self) -> zbus::Result<()>;
    fn stop(&self) -> zbus::Result<()>;
    fn switch_device(&self, device: &str) -> zbus::Result<()>;
    fn switch_backend(&self, backend: &str) -> zbus::Result<()>;
    fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "tumtum", version, about = "Control the tumtum liveness challenge daemon")]
struct Cli {
    /// Debug logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Command {
    /// Start a new challenge
    Start,
    /// Cancel the running challenge
    Stop,
    /// Restart the challenge on another video source
    SwitchDevice {
        /// Image file or directory to replay
        device: String,
    },
    /// Restart the challenge against another verification backend
    SwitchBackend {
        #[arg(value_parser = ["aws_demo", "sst"])]
        backend: String,
    },
    /// Print the daemon status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let default_filter = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let conn = zbus::Connection::session()
        .await
        .context("cannot connect to the session bus")?;
    let proxy = ChallengeProxy::new(&conn)
        .await
        .context("tumtumd is not reachable")?;

    tracing::debug!(command = ?cli.command, "sending request");
    match cli.command {
        Command::Start => proxy.start().await.context("start failed")?,
        Command::Stop => proxy.stop().await.context("stop failed")?,
        Command::SwitchDevice { device } => proxy
            .switch_device(&device)
            .await
            .context("switch-device failed")?,
        Command::SwitchBackend { backend } => proxy
            .switch_backend(&backend)
            .await
            .context("switch-backend failed")?,
        Command::Status => {
            let raw = proxy.status().await.context("status failed")?;
            println!("{}", pretty(&raw));
        }
    }
    Ok(())
}

/// Re-indent a JSON document, passing anything else through untouched.
fn pretty(raw: &str) -> String {
    serde_json::from_str::<serde_json::Value>(raw)
        .and_then(|v| serde_json::to_string_pretty(&v))
        .unwrap_or_else(|_| raw.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_subcommands() {
        let cli = Cli::try_parse_from(["tumtum", "switch-device", "/tmp/faces"]).unwrap();
        assert_eq!(
            cli.command,
            Command::SwitchDevice {
                device: "/tmp/faces".into()
            }
        );
        let cli = Cli::try_parse_from(["tumtum", "-v", "status"]).unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.command, Command::Status);
    }

    #[test]
    fn test_unknown_backend_rejected() {
        assert!(Cli::try_parse_from(["tumtum", "switch-backend", "azure"]).is_err());
        assert!(Cli::try_parse_from(["tumtum", "switch-backend", "sst"]).is_ok());
    }

    #[test]
    fn test_pretty_passes_through_non_json() {
        assert_eq!(pretty("not json"), "not json");
        assert_eq!(pretty(r#"{"a":1}"#), "{\n  \"a\": 1\n}");
    }
}
