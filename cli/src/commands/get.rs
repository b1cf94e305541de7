use anyhow::{Result, anyhow};
use clap::Args;
use coffre_core::ObjectId;
use coffre_core::get::{GetSettings, get};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use std::str::FromStr;
use std::time::{Duration, Instant};

#[derive(Args)]
pub struct GetCommand {
    #[arg(help = "Object id to restore")]
    id: String,

    #[arg(help = "Destination path")]
    dest: String,

    #[arg(long, help = "Flatten top-level snapshot entries")]
    flat: bool,
}

impl GetCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let (store, scheduler) = super::open_store(cli).await?;

        let id = ObjectId::from_str(&self.id)
            .map_err(|_| anyhow!("Invalid object id '{}'", self.id))?;

        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {msg}")?,
        );
        pb.set_message("Extracting...");
        pb.enable_steady_tick(Duration::from_millis(100));

        let settings = GetSettings { flat: self.flat };
        let started = Instant::now();
        let restored = get(store, &scheduler, &id, &settings, Path::new(&self.dest)).await?;
        pb.finish_and_clear();

        println!("Restored: {} ({})", self.dest, super::format_size(restored));
        println!("Elapsed: {:.1}s", started.elapsed().as_secs_f64());
        Ok(())
    }
}
