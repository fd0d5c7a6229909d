use anyhow::Result;
use std::fs;
use std::path::Path;

/// Installs a `fern` dispatcher writing to stdout and to a fresh timestamped
/// file `<app_name>_<timestamp>.log` in `log_dir`, after pruning older logs.
pub fn setup_logging(log_dir: &Path, log_level: &str, app_name: &str) -> Result<()> {
    if !log_dir.exists() {
        fs::create_dir_all(log_dir)?;
    }

    // Keep only the most recent previous run next to the new file
    cleanup_old_logs(log_dir, 1)?;

    let log_file_name = format!("{}_{}.log", app_name, chrono::Local::now().format("%Y-%m-%d_%H-%M-%S"));
    let log_path = log_dir.join(log_file_name);

    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}] {}",
                chrono::Local::now().format("[%Y-%m-%d %H:%M:%S]"),
                record.target(),
                record.level(),
                message
            ))
        })
        .level(parse_level(log_level))
        .chain(std::io::stdout())
        .chain(fern::log_file(log_path)?)
        .apply()?;

    Ok(())
}

/// Maps a level name to a filter; anything unrecognised means `Info`.
pub fn parse_level(log_level: &str) -> log::LevelFilter {
    match log_level.to_lowercase().as_str() {
        "trace" => log::LevelFilter::Trace,
        "debug" => log::LevelFilter::Debug,
        "warn" => log::LevelFilter::Warn,
        "error" => log::LevelFilter::Error,
        "off" => log::LevelFilter::Off,
        _ => log::LevelFilter::Info,
    }
}

/// Deletes all but the `keep` most recently modified `.log` files in `log_dir`.
pub fn cleanup_old_logs(log_dir: &Path, keep: usize) -> Result<usize> {
    let mut entries: Vec<_> = fs::read_dir(log_dir)?
        .filter_map(|res| res.ok())
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "log"))
        .collect();

    // Newest first; unreadable timestamps sort last
    entries.sort_by_key(|e| std::cmp::Reverse(e.metadata().and_then(|m| m.modified()).ok()));

    let mut removed = 0;
    for entry in entries.iter().skip(keep) {
        match fs::remove_file(entry.path()) {
            Ok(()) => removed += 1,
            Err(e) => eprintln!("Failed to delete old log file {:?}: {}", entry.path(), e),
        }
    }

    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime};
    use tempfile::tempdir;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("DEBUG"), log::LevelFilter::Debug);
        assert_eq!(parse_level("trace"), log::LevelFilter::Trace);
        assert_eq!(parse_level("fatal"), log::LevelFilter::Info);
    }

    #[test]
    fn test_cleanup_keeps_newest_logs_only() {
        let dir = tempdir().unwrap();
        let now = SystemTime::now();
        for (i, name) in ["a.log", "b.log", "c.log"].iter().enumerate() {
            let path = dir.path().join(name);
            fs::write(&path, "x").unwrap();
            let file = fs::File::options().write(true).open(&path).unwrap();
            file.set_modified(now - Duration::from_secs(100 * (3 - i as u64))).unwrap();
        }
        fs::write(dir.path().join("notes.txt"), "keep me").unwrap();

        assert_eq!(cleanup_old_logs(dir.path(), 1).unwrap(), 2);
        assert!(dir.path().join("c.log").exists());
        assert!(!dir.path().join("a.log").exists());
        assert!(dir.path().join("notes.txt").exists());
    }
}
