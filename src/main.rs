use std::path::PathBuf;

use anyhow::Context;
use audioharvest::harvester::{Harvester, HarvesterOptions};
use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Recording catalog harvester", long_about = None)]
struct Args {
    /// Root URL of the paginated recording catalog
    #[arg(long)]
    root_url: String,
    /// Endpoint of the remote blob store
    #[arg(long)]
    store_endpoint: String,
    /// Bucket to upload into
    #[arg(long)]
    store_bucket: String,
    /// Key prefix under which media files are stored
    #[arg(long, default_value = "raw_audio")]
    key_prefix: String,
    /// Local directory archives are downloaded and extracted into
    #[arg(short = 'd', long, default_value = "./recordings")]
    save_dir: PathBuf,
    /// Path of the append-only audit ledger
    #[arg(long, default_value = "harvest_ledger.jsonl")]
    ledger_path: PathBuf,
    /// Number of sessions processed concurrently
    #[arg(short = 's', long, default_value_t = 3)]
    session_workers: usize,
    /// Number of files uploaded concurrently within one folder
    #[arg(short = 'f', long, default_value_t = 8)]
    file_workers: usize,
    /// Attempts per page fetch before giving up on a page
    #[arg(short = 'r', long, default_value_t = 3)]
    page_attempts: usize,
    /// Delay in milliseconds between subpage fetches within a session
    #[arg(long, default_value_t = 1000)]
    politeness_delay_ms: u64,
    /// Treat an inconclusive existence probe as "object absent" and upload
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    optimistic_on_probe_failure: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args = Args::parse();

    let options = HarvesterOptions::default_builder()
        .root_url(args.root_url)
        .store_endpoint(args.store_endpoint)
        .store_bucket(args.store_bucket)
        .key_prefix(args.key_prefix)
        .save_dir(args.save_dir)
        .ledger_path(args.ledger_path)
        .session_workers(args.session_workers)
        .file_workers(args.file_workers)
        .page_attempts(args.page_attempts)
        .politeness_delay_ms(args.politeness_delay_ms)
        .optimistic_on_probe_failure(args.optimistic_on_probe_failure)
        .build()?;

    let harvester = Harvester::new(options).context("could not build harvester")?;
    let summary = harvester.run().await?;

    println!("harvest summary");
    println!("  uploaded:           {}", summary.uploaded);
    println!("  duplicates skipped: {}", summary.skipped_duplicates);
    println!("  failed:             {}", summary.failed);
    println!("  folders processed:  {}", summary.folders_processed);
    println!(
        "  folders skipped:    {}",
        summary.folders_skipped_total()
    );
    for (reason, count) in &summary.folders_skipped {
        println!("    {}: {}", reason, count);
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    const REQUIRED: [&str; 7] = [
        "audioharvest",
        "--root-url",
        "http://catalog",
        "--store-endpoint",
        "http://store",
        "--store-bucket",
        "recordings",
    ];

    #[test]
    fn probe_policy_flag_takes_a_value() {
        let args = Args::try_parse_from(REQUIRED).unwrap();
        assert!(args.optimistic_on_probe_failure);

        let mut off = REQUIRED.to_vec();
        off.extend(["--optimistic-on-probe-failure", "false"]);
        let args = Args::try_parse_from(off).unwrap();
        assert!(!args.optimistic_on_probe_failure);
    }
}
