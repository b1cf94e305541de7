use anyhow::{Result, anyhow};
use clap::Args;
use coffre_core::chunker::DEFAULT_AVG_CHUNK_SIZE;
use coffre_core::put::{PutSettings, put};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use walkdir::WalkDir;

#[derive(Args)]
pub struct PutCommand {
    #[arg(help = "Paths to back up", required = true)]
    paths: Vec<String>,

    #[arg(short, long, help = "Snapshot name")]
    name: Option<String>,

    #[arg(long, help = "Average chunk size in bytes")]
    chunk_size: Option<u32>,
}

impl PutCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let (store, scheduler) = super::open_store(cli).await?;

        let paths: Vec<PathBuf> = self.paths.iter().map(PathBuf::from).collect();
        for path in &paths {
            if !path.exists() {
                return Err(anyhow!("Path does not exist: {}", path.display()));
            }
        }

        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {msg}")?,
        );
        pb.set_message("Scanning files...");

        let mut total_files = 0u64;
        let mut total_size = 0i64;
        for path in &paths {
            for entry in WalkDir::new(path)
                .follow_links(false)
                .into_iter()
                .filter_map(|e| e.ok())
            {
                if entry.file_type().is_file() {
                    total_files += 1;
                    total_size += entry.metadata().map(|m| m.len() as i64).unwrap_or(0);
                }
            }
        }

        pb.set_message(format!(
            "Backing up {} files ({})...",
            total_files,
            super::format_size(total_size)
        ));
        pb.enable_steady_tick(Duration::from_millis(100));

        let settings = PutSettings {
            name: self.name.clone().unwrap_or_default(),
            chunk_avg_size: self.chunk_size.unwrap_or(DEFAULT_AVG_CHUNK_SIZE),
            time: None,
        };

        let started = Instant::now();
        let (id, stats) = put(store, &scheduler, &settings, &paths).await?;
        pb.finish_and_clear();

        println!("Snapshot: {id}");
        println!("Size: {}", super::format_size(stats.len));
        println!("Storage: {}", super::format_size(stats.stored));
        println!("Written: {}", super::format_size(stats.written));
        println!("Elapsed: {:.1}s", started.elapsed().as_secs_f64());
        Ok(())
    }
}
