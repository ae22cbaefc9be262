use std::path::Path;

use crate::config::Config;
use crate::daemon::{DownloadDaemon, RqbitDaemon};

pub struct CheckResult {
    pub name: String,
    pub status: CheckStatus,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStatus {
    Ok,
    Warning,
    Error,
}

impl CheckResult {
    fn ok(name: &str, message: &str) -> Self {
        Self {
            name: name.to_string(),
            status: CheckStatus::Ok,
            message: message.to_string(),
        }
    }

    fn warning(name: &str, message: &str) -> Self {
        Self {
            name: name.to_string(),
            status: CheckStatus::Warning,
            message: message.to_string(),
        }
    }

    fn error(name: &str, message: &str) -> Self {
        Self {
            name: name.to_string(),
            status: CheckStatus::Error,
            message: message.to_string(),
        }
    }

    pub fn icon(&self) -> &'static str {
        match self.status {
            CheckStatus::Ok => "✓",
            CheckStatus::Warning => "⚠",
            CheckStatus::Error => "✗",
        }
    }

    pub fn color(&self) -> &'static str {
        match self.status {
            CheckStatus::Ok => "\x1b[32m",      // green
            CheckStatus::Warning => "\x1b[33m", // yellow
            CheckStatus::Error => "\x1b[31m",   // red
        }
    }
}

pub async fn run_checks(config: &Config) -> Vec<CheckResult> {
    let mut results = Vec::new();

    results.push(check_daemon(config).await);
    results.push(check_ffmpeg(&config.transcode.ffmpeg));

    results.push(check_dir("Downloads", &config.storage.download_dir()));
    results.push(check_dir("Videos", &config.storage.video_dir()));
    let state_file = config.storage.state_file();
    if let Some(parent) = state_file.parent() {
        results.push(check_dir("State", parent));
    }

    results
}

async fn check_daemon(config: &Config) -> CheckResult {
    let Some(url) = &config.daemon.url else {
        return CheckResult::ok(
            "Daemon",
            "No daemon.url configured, an embedded session will be started",
        );
    };

    let daemon = match RqbitDaemon::connect(url, config.daemon.request_timeout()) {
        Ok(daemon) => daemon,
        Err(e) => return CheckResult::error("Daemon", &format!("Invalid daemon URL: {}", e)),
    };

    match daemon.ping().await {
        Ok(()) => CheckResult::ok("Daemon", &format!("Reachable at {}", daemon.base_url())),
        Err(e) => CheckResult::error("Daemon", &format!("Connection failed: {}", e)),
    }
}

fn check_ffmpeg(command: &str) -> CheckResult {
    match which::which(command) {
        Ok(path) => CheckResult::ok("ffmpeg", &format!("{} found at {}", command, path.display())),
        Err(_) => CheckResult::error("ffmpeg", &format!("'{}' not found in PATH", command)),
    }
}

fn check_dir(name: &str, dir: &Path) -> CheckResult {
    if !dir.exists() {
        return match std::fs::create_dir_all(dir) {
            Ok(_) => CheckResult::warning(name, &format!("Created {}", dir.display())),
            Err(e) => CheckResult::error(name, &format!("Cannot create {}: {}", dir.display(), e)),
        };
    }

    let test_file = dir.join(".hypertube_test");
    match std::fs::write(&test_file, "test") {
        Ok(_) => {
            let _ = std::fs::remove_file(&test_file);
            CheckResult::ok(name, &dir.display().to_string())
        }
        Err(e) => CheckResult::error(name, &format!("{} not writable: {}", dir.display(), e)),
    }
}

pub fn print_results(results: &[CheckResult]) {
    let reset = "\x1b[0m";

    println!("\nhypertube doctor\n");

    for result in results {
        println!(
            "  {}{} {}{}  {}",
            result.color(),
            result.icon(),
            result.name,
            reset,
            result.message
        );
    }

    println!();

    let errors = results
        .iter()
        .filter(|r| r.status == CheckStatus::Error)
        .count();
    let warnings = results
        .iter()
        .filter(|r| r.status == CheckStatus::Warning)
        .count();

    if errors > 0 {
        println!("  {} error(s), {} warning(s)", errors, warnings);
        println!("  Fix errors above before acquiring movies.\n");
    } else if warnings > 0 {
        println!("  {} warning(s)\n", warnings);
    } else {
        println!("  All checks passed!\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_ffmpeg() {
        let result = check_ffmpeg("definitely-not-a-real-ffmpeg-binary");
        assert_eq!(result.status, CheckStatus::Error);
    }

    #[test]
    fn test_dir_checks() {
        let tmp = tempfile::tempdir().unwrap();
        assert_eq!(check_dir("Videos", tmp.path()).status, CheckStatus::Ok);

        let nested = tmp.path().join("a/b");
        assert_eq!(check_dir("Videos", &nested).status, CheckStatus::Warning);
        assert!(nested.is_dir());
    }

    #[tokio::test]
    async fn test_embedded_daemon_needs_no_ping() {
        let result = check_daemon(&Config::default()).await;
        assert_eq!(result.status, CheckStatus::Ok);
    }
}
