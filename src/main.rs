use std::{process::ExitCode, time::Duration};

use clap::Parser;
use disk_importer::{config::Config, run, Context, Progress};

fn initialize_tracing() {
    // Timestamps are added by the container runtime.
    let format = tracing_subscriber::fmt::format()
        .without_time()
        .with_target(false)
        .compact();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .event_format(format)
        .with_writer(std::io::stderr)
        .init();
}

/// Log the number of bytes written every `interval`.
fn spawn_progress_reporter(progress: Progress, interval: Duration) {
    std::thread::spawn(move || {
        let mut last = 0;

        loop {
            std::thread::sleep(interval);

            let bytes = progress.bytes();
            if bytes != last {
                tracing::info!(bytes, "Progress.");
                last = bytes;
            }
        }
    });
}

fn main() -> ExitCode {
    initialize_tracing();

    let config = Config::parse();
    let interval = config.progress_interval();

    let job = match config.into_job() {
        Ok(job) => job,
        Err(err) => {
            tracing::error!(kind = err.kind(), %err, "Invalid configuration.");
            return ExitCode::FAILURE;
        }
    };

    let progress = Progress::new();
    spawn_progress_reporter(progress.clone(), interval);

    let result = run(&job, &Context::new(progress));
    ExitCode::from(result.exit_code())
}
