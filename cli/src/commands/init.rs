use anyhow::{Result, anyhow};
use clap::Args;
use coffre_backends::LocalStore;
use rand::Rng;

#[derive(Args)]
pub struct InitCommand {
    #[arg(help = "Repository path")]
    repository: Option<String>,

    #[arg(long, help = "Password for the write-only key (generated when omitted)")]
    write_password: Option<String>,
}

impl InitCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let repo = self
            .repository
            .as_ref()
            .or(cli.repository.as_ref())
            .ok_or_else(|| {
                anyhow!("Repository path required (--repository or COFFRE_REPOSITORY)")
            })?;
        let password = super::password(cli)?;

        let (write_password, generated) = match &self.write_password {
            Some(password) => (password.clone(), false),
            None => (generate_password(), true),
        };

        LocalStore::init(repo, &password, &write_password).await?;

        println!("Initialized repository at {repo}");
        if generated {
            println!("Write-only password: {write_password}");
            println!("Store it safely, it cannot be recovered later");
        }
        Ok(())
    }
}

fn generate_password() -> String {
    let mut rng = rand::thread_rng();
    (0..24)
        .map(|_| rng.sample(rand::distributions::Alphanumeric) as char)
        .collect()
}
