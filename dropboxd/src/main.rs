use anyhow::Context;
use dropboxd::daemon::{DaemonConfig, DaemonRuntime};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CliMode {
    Run,
    SyncOnce,
    Status,
    Reset,
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut mode = CliMode::Run;
    for arg in args.into_iter().skip(1) {
        match arg.as_str() {
            "--sync-once" => mode = CliMode::SyncOnce,
            "--status" => mode = CliMode::Status,
            "--reset" => mode = CliMode::Reset,
            "--help" | "-h" => mode = CliMode::Help,
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(mode)
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let mode = parse_cli_mode(std::env::args())?;
    if mode == CliMode::Help {
        println!("Usage: dropboxd [--sync-once | --status | --reset]");
        println!("  --sync-once  Run one full sync, upload everything and exit");
        println!("  --status     Print the saved sync state and account usage");
        println!("  --reset      Forget the saved index and queue");
        return Ok(());
    }
    init_tracing();

    let config = DaemonConfig::from_env()?;
    let daemon = DaemonRuntime::bootstrap(config).await?;
    match mode {
        CliMode::Run => daemon.run().await,
        CliMode::SyncOnce => {
            let steps = daemon
                .engine()
                .sync_and_drain()
                .await
                .context("sync failed")?;
            println!("Completed {steps} operations");
            Ok(())
        }
        CliMode::Status => {
            let status = daemon
                .engine()
                .status()
                .await
                .context("failed to read sync state")?;
            print!("{status}");
            match daemon.engine().account_summary().await {
                Ok(summary) => print!("{summary}"),
                Err(err) => tracing::debug!(error = %err, "account summary unavailable"),
            }
            Ok(())
        }
        CliMode::Reset => {
            daemon
                .engine()
                .reset()
                .await
                .context("failed to clear sync state")?;
            println!("Sync state cleared");
            Ok(())
        }
        CliMode::Help => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> Vec<String> {
        std::iter::once("dropboxd")
            .chain(extra.iter().copied())
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn parse_cli_mode_defaults_to_run() {
        assert_eq!(parse_cli_mode(args(&[])).unwrap(), CliMode::Run);
    }

    #[test]
    fn parse_cli_mode_supports_one_shot_commands() {
        assert_eq!(parse_cli_mode(args(&["--sync-once"])).unwrap(), CliMode::SyncOnce);
        assert_eq!(parse_cli_mode(args(&["--status"])).unwrap(), CliMode::Status);
        assert_eq!(parse_cli_mode(args(&["--reset"])).unwrap(), CliMode::Reset);
    }

    #[test]
    fn parse_cli_mode_supports_help() {
        assert_eq!(parse_cli_mode(args(&["-h"])).unwrap(), CliMode::Help);
    }

    #[test]
    fn parse_cli_mode_rejects_unknown_flags() {
        let err = parse_cli_mode(args(&["--logout"])).unwrap_err();
        assert_eq!(err.to_string(), "unknown argument: --logout");
    }
}
