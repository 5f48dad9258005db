use anyhow::Result;
use std::fs;
use std::path::Path;

const LOG_PREFIX: &str = "server_gateway_";

// Transport crates that log every frame at debug level.
const CHATTY_TARGETS: [&str; 5] = ["hyper", "hyper_util", "reqwest", "tungstenite", "tokio_tungstenite"];

/// Logs to stdout and to a fresh timestamped file in `log_dir`. Only the
/// previous run's gateway log is kept next to it.
pub fn setup_logging(log_dir: &Path, log_level: &str) -> Result<()> {
    fs::create_dir_all(log_dir)?;
    prune_logs(log_dir, 1)?;

    let log_path = log_dir.join(format!(
        "{}{}.log",
        LOG_PREFIX,
        chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
    ));

    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}] {}",
                chrono::Local::now().format("[%Y-%m-%d %H:%M:%S%.3f]"),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(parse_level(log_level));
    for target in CHATTY_TARGETS {
        dispatch = dispatch.level_for(target, log::LevelFilter::Warn);
    }

    dispatch
        .chain(std::io::stdout())
        .chain(fern::log_file(&log_path)?)
        .apply()?;

    log::info!("Logging to {} at level {}", log_path.display(), parse_level(log_level));
    Ok(())
}

/// Unknown names fall back to `Info`.
fn parse_level(log_level: &str) -> log::LevelFilter {
    log_level.parse().unwrap_or(log::LevelFilter::Info)
}

/// Deletes gateway logs in `log_dir` beyond the `keep` most recent ones.
fn prune_logs(log_dir: &Path, keep: usize) -> Result<()> {
    let mut logs: Vec<_> = fs::read_dir(log_dir)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            name.starts_with(LOG_PREFIX) && name.ends_with(".log")
        })
        .filter_map(|entry| {
            let modified = entry.metadata().and_then(|m| m.modified()).ok()?;
            Some((modified, entry.path()))
        })
        .collect();

    logs.sort_by_key(|(modified, _)| std::cmp::Reverse(*modified));

    for (_, path) in logs.iter().skip(keep) {
        if let Err(e) = fs::remove_file(path) {
            eprintln!("Failed to delete old log file {}: {}", path.display(), e);
        }
    }
    Ok(())
}
