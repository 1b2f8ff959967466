//! getfile: fetches files from a getfiled server over one connection

use chrono::DateTime;
use getfile::client::{self, Client, Fetched};
use getfile::config::ClientConfig;
use getfile::transfer::TransferProgress;
use std::io::Write;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let config = ClientConfig::load();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let stream = match client::connect(&config.address, config.port, config.connect_timeout).await {
        Ok(stream) => stream,
        Err(e) => {
            eprintln!("getfile: {}", e);
            return ExitCode::FAILURE;
        }
    };
    println!("connected.");

    let client = Client::new(stream, config.read_timeout, &config.output_dir)
        .with_progress(Box::new(print_progress));

    let result = client.fetch_all(config.files.as_slice()).await;
    println!("closed.");

    match result {
        Ok(fetched) => {
            for file in &fetched {
                print_summary(file);
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("\ngetfile: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn print_progress(name: &str, progress: &TransferProgress) {
    print!(
        "\r{} receiving.. {}%  {:.1}MB/s        ",
        name,
        progress.percent(),
        progress.rate_mb_per_sec()
    );
    if progress.is_complete() {
        println!();
    }
    let _ = std::io::stdout().flush();
}

fn print_summary(file: &Fetched) {
    let modified = DateTime::from_timestamp(i64::from(file.metadata.modified_at), 0)
        .map(|t| t.to_rfc3339())
        .unwrap_or_default();

    println!(
        "{{{}}} received as {}\n|- bytes: {} of {}\n|- timestamp: {} ({})\n|- elapsed: {:.3}s",
        file.requested,
        file.local_path.display(),
        file.progress.received_bytes(),
        file.progress.expected_bytes(),
        file.metadata.modified_at,
        modified,
        file.progress.elapsed().as_secs_f64()
    );
}
