use cloudmirror_core::Bookmark;
use cloudmirrord::config::CoreConfig;
use cloudmirrord::sync::action_queue::QueueError;
use cloudmirrord::sync::record::{RecordPayload, SyncRecord};
use cloudmirrord::sync::vault::Vault;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, PartialEq, Eq)]
enum CliMode {
    Status(String),
    Retry(String),
    Dismiss(String),
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter().skip(1);
    let Some(command) = args.next() else {
        return Ok(CliMode::Help);
    };
    let mode = match command.as_str() {
        "--help" | "-h" => return Ok(CliMode::Help),
        "status" | "retry" | "dismiss" => {
            let Some(bookmark) = args.next() else {
                anyhow::bail!("{command} needs a bookmark");
            };
            match command.as_str() {
                "status" => CliMode::Status(bookmark),
                "retry" => CliMode::Retry(bookmark),
                _ => CliMode::Dismiss(bookmark),
            }
        }
        other => anyhow::bail!("unknown argument: {other}"),
    };
    if let Some(extra) = args.next() {
        anyhow::bail!("unexpected argument: {extra}");
    }
    Ok(mode)
}

fn print_usage() {
    println!("Usage: cloudmirrord <command> <bookmark>");
    println!("  status <bookmark>    Show item and sync record counts");
    println!("  retry <bookmark>     Re-queue every record that needs attention");
    println!("  dismiss <bookmark>   Drop every record that needs attention");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("cloudmirrord=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let mode = parse_cli_mode(std::env::args())?;
    let bookmark = match &mode {
        CliMode::Help => {
            print_usage();
            return Ok(());
        }
        CliMode::Status(bookmark) | CliMode::Retry(bookmark) | CliMode::Dismiss(bookmark) => {
            Bookmark::new(bookmark.as_str())
        }
    };
    let config = CoreConfig::from_env();
    let vault = Vault::open(&config.vault_root, &bookmark, config.path_case()).await?;
    let result = match mode {
        CliMode::Status(_) => status(&vault).await,
        CliMode::Retry(_) => retry_all(&vault).await,
        CliMode::Dismiss(_) => dismiss_all(&vault).await,
        CliMode::Help => Ok(()),
    };
    vault.close().await;
    result
}

async fn status(vault: &Vault) -> anyhow::Result<()> {
    let mut read = vault.read().await?;
    let items = read.items().count().await?;
    let counts = read.queue().count_by_state().await?;
    let open = read.queue().list_non_terminal().await?;
    let attention = read.queue().list_needing_attention().await?;
    drop(read);

    println!("bookmark: {}", vault.bookmark());
    if let Some(location) = vault.location() {
        println!("vault:    {}", location.display());
    }
    println!("items:    {items}");
    for (state, total) in counts {
        println!("records {state}: {total}");
    }
    for record in open.iter().chain(attention.iter()) {
        print_record(record);
    }
    Ok(())
}

fn print_record(record: &SyncRecord) {
    let target = match &record.dest_path {
        Some(dest) => format!("{} -> {dest}", record.path),
        None => record.path.clone(),
    };
    match &record.last_error {
        Some(error) => println!(
            "  #{} {} {} [{}] {error}",
            record.seq, record.kind, target, record.state
        ),
        None => println!("  #{} {} {} [{}]", record.seq, record.kind, target, record.state),
    }
}

async fn retry_all(vault: &Vault) -> anyhow::Result<()> {
    let mut txn = vault.write().await?;
    let parked = txn.queue().list_needing_attention().await?;
    let mut retried = 0;
    for record in &parked {
        match txn.queue().retry(record.seq).await {
            Ok(Some(_)) => retried += 1,
            Ok(None) => {}
            Err(QueueError::Conflict { seq, .. }) => {
                eprintln!("[cloudmirrord] record #{} blocked by #{seq}; left as is", record.seq);
            }
            Err(err) => return Err(err.into()),
        }
    }
    txn.commit().await?;
    println!("re-queued {retried} of {} records", parked.len());
    Ok(())
}

async fn dismiss_all(vault: &Vault) -> anyhow::Result<()> {
    let mut txn = vault.write().await?;
    let parked = txn.queue().list_needing_attention().await?;
    let mut dismissed = Vec::new();
    for record in &parked {
        if let Some(record) = txn.queue().dismiss(record.seq).await? {
            dismissed.push(record);
        }
    }
    txn.commit().await?;
    for record in &dismissed {
        if let RecordPayload::Upload { source, .. } = &record.payload
            && source.starts_with(vault.staging_root())
        {
            tokio::fs::remove_file(source).await.ok();
        }
    }
    println!("dismissed {} records", dismissed.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> Vec<String> {
        std::iter::once("cloudmirrord")
            .chain(values.iter().copied())
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn parse_cli_mode_defaults_to_help() {
        assert_eq!(parse_cli_mode(args(&[])).unwrap(), CliMode::Help);
        assert_eq!(parse_cli_mode(args(&["-h"])).unwrap(), CliMode::Help);
    }

    #[test]
    fn parse_cli_mode_reads_bookmark() {
        assert_eq!(
            parse_cli_mode(args(&["status", "alice@example.com"])).unwrap(),
            CliMode::Status("alice@example.com".into())
        );
        assert_eq!(
            parse_cli_mode(args(&["retry", "b"])).unwrap(),
            CliMode::Retry("b".into())
        );
        assert_eq!(
            parse_cli_mode(args(&["dismiss", "b"])).unwrap(),
            CliMode::Dismiss("b".into())
        );
    }

    #[test]
    fn parse_cli_mode_rejects_bad_input() {
        assert!(parse_cli_mode(args(&["status"])).is_err());
        assert!(parse_cli_mode(args(&["--logout"])).is_err());
        assert!(parse_cli_mode(args(&["status", "a", "b"])).is_err());
    }
}
