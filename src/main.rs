use anyhow::{Result, bail};
use clap::Parser;

use stupamap_core::{
    MediaServices,
    cli::{Cli, Command},
    logging, run,
    settings::Settings,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(&cli)?;
    logging::init_logger(cli.log.unwrap_or(settings.log))?;
    match cli.command {
        Command::Run => run(settings).await,
        command => execute(command, &settings).await,
    }
}

async fn execute(command: Command, settings: &Settings) -> Result<()> {
    let services = MediaServices::start_http(settings).await?;
    let fetcher = services.fetcher();
    let outcome = match command {
        Command::Fetch { urls } => {
            let mut failed = 0usize;
            for url in &urls {
                match fetcher.fetch(url).await {
                    Ok(path) => println!("{}\t{url}", path.display()),
                    Err(err) => {
                        eprintln!("{url}: {err}");
                        failed += 1;
                    }
                }
            }
            if failed > 0 {
                bail!("{failed} of {} fetch(es) failed", urls.len());
            }
            Ok(())
        }
        Command::Usage => {
            let usage = fetcher.usage().await?;
            println!(
                "entries={} total_bytes={} max_cache_bytes={}",
                usage.entries, usage.total_bytes, usage.max_cache_bytes
            );
            Ok(())
        }
        Command::Evict => {
            let report = fetcher.evict_now().await?;
            println!(
                "evicted={} bytes_freed={} remaining_bytes={} failures={}",
                report.evicted, report.bytes_freed, report.remaining_bytes, report.failures
            );
            Ok(())
        }
        Command::Clear { owner } => {
            let removed = fetcher.invalidate_owner(&owner).await?;
            println!("cleared {removed} media director(ies) of {owner}");
            Ok(())
        }
        Command::Upload {
            owner,
            media_type,
            file,
        } => {
            let url = services
                .uploader()
                .upload(&owner, media_type.map(Into::into), &file)
                .await?;
            println!("{url}");
            Ok(())
        }
        Command::Run => Err(anyhow::anyhow!("run is not a one-shot command")),
    };
    services.shutdown().await;
    outcome
}
