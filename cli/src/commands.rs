pub mod get;
pub mod init;
pub mod list;
pub mod put;
pub mod tree;

pub use get::GetCommand;
pub use init::InitCommand;
pub use list::ListCommand;
pub use put::PutCommand;
pub use tree::TreeCommand;

use anyhow::{Result, anyhow};
use clap::ValueEnum;
use coffre_backends::LocalStore;
use coffre_core::{ObjectStore, Scheduler};
use std::io::{self, Write};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Human,
    Json,
    Xml,
}

pub(crate) fn password(cli: &crate::Cli) -> Result<String> {
    cli.password
        .clone()
        .or_else(|| {
            print!("Enter repository password: ");
            io::stdout().flush().ok()?;
            rpassword::read_password().ok()
        })
        .ok_or_else(|| anyhow!("Password required"))
}

pub(crate) fn scheduler(cli: &crate::Cli) -> Scheduler {
    match cli.threads {
        Some(threads) => Scheduler::new(threads),
        None => Scheduler::with_default_parallelism(),
    }
}

pub(crate) async fn open_store(cli: &crate::Cli) -> Result<(Arc<dyn ObjectStore>, Scheduler)> {
    let repo = cli.repository.as_ref().ok_or_else(|| {
        anyhow!("Repository path required (--repository or COFFRE_REPOSITORY)")
    })?;
    let password = password(cli)?;

    let store = LocalStore::open(repo, &password).await?;
    info!("Repository: {} ({})", repo, store.mode());

    Ok((Arc::new(store), scheduler(cli)))
}

pub(crate) fn format_size(bytes: i64) -> String {
    const UNITS: [&str; 6] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB"];

    let mut value = bytes as f64;
    let mut unit = 0;
    while value.abs() >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

pub(crate) fn format_time(time: i64) -> String {
    chrono::DateTime::<chrono::Utc>::from_timestamp(time, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| time.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_render_with_binary_units() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.0 KiB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.0 MiB");
    }
}
