//! Progress display module
//!
//! Renders the downloader's periodic snapshots as a single status line.

use std::io::{self, Write};
use std::time::{Duration, Instant};

/// Point-in-time view of one download
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub name: String,
    pub downloaded: u64,
    pub uploaded: u64,
    /// Bytes of selected pieces still missing
    pub left: u64,
    /// Bytes of selected pieces in total
    pub wanted: u64,
    pub pieces_done: usize,
    pub pieces_wanted: usize,
    pub peers_known: usize,
    pub peers_active: usize,
    pub complete: bool,
}

impl ProgressSnapshot {
    /// Fraction of the selected data present (0.0 to 1.0)
    pub fn progress(&self) -> f64 {
        if self.wanted == 0 {
            return 1.0;
        }
        (self.wanted.saturating_sub(self.left)) as f64 / self.wanted as f64
    }
}

/// Format bytes to human readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

pub fn format_speed(bytes_per_sec: f64) -> String {
    format!("{}/s", format_bytes(bytes_per_sec as u64))
}

pub fn format_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// Remaining time at the current rate
pub fn calculate_eta(left: u64, speed: f64) -> Option<Duration> {
    if speed <= 0.0 || left == 0 {
        return None;
    }
    Some(Duration::from_secs_f64(left as f64 / speed))
}

/// Progress display for the CLI
#[derive(Debug)]
pub struct ProgressDisplay {
    start_time: Instant,
    quiet: bool,
    previous: Option<(Instant, u64, u64)>,
}

impl ProgressDisplay {
    pub fn new(quiet: bool) -> Self {
        Self {
            start_time: Instant::now(),
            quiet,
            previous: None,
        }
    }

    /// Transfer rates since the previous snapshot, in bytes per second
    fn rates(&mut self, snapshot: &ProgressSnapshot) -> (f64, f64) {
        let now = Instant::now();
        let rates = match self.previous {
            Some((at, down, up)) => {
                let secs = now.duration_since(at).as_secs_f64().max(0.001);
                (
                    snapshot.downloaded.saturating_sub(down) as f64 / secs,
                    snapshot.uploaded.saturating_sub(up) as f64 / secs,
                )
            }
            None => (0.0, 0.0),
        };
        self.previous = Some((now, snapshot.downloaded, snapshot.uploaded));
        rates
    }

    /// One status line for `snapshot`
    pub fn render(&mut self, snapshot: &ProgressSnapshot) -> String {
        let (down, up) = self.rates(snapshot);
        let percent = snapshot.progress() * 100.0;
        let bar_width: usize = 30;
        let filled = ((percent / 100.0) * bar_width as f64) as usize;
        let bar = "=".repeat(filled.min(bar_width)) + &" ".repeat(bar_width.saturating_sub(filled));
        let eta = calculate_eta(snapshot.left, down)
            .map(format_duration)
            .unwrap_or_else(|| "-".to_string());
        format!(
            "[{}] {:.1}% | {}/{} pieces | down {} | up {} | peers {}/{} | eta {}",
            bar,
            percent,
            snapshot.pieces_done,
            snapshot.pieces_wanted,
            format_speed(down),
            format_speed(up),
            snapshot.peers_active,
            snapshot.peers_known,
            eta
        )
    }

    pub fn update(&mut self, snapshot: &ProgressSnapshot) -> io::Result<()> {
        if self.quiet {
            return Ok(());
        }
        let line = self.render(snapshot);
        let mut out = io::stdout();
        write!(out, "\r\x1b[2K{}", line)?;
        out.flush()
    }

    pub fn print_complete(&self, snapshot: &ProgressSnapshot) -> io::Result<()> {
        if self.quiet {
            return Ok(());
        }
        println!("\r\x1b[2K");
        println!("Download complete: {}", snapshot.name);
        println!("  Downloaded: {}", format_bytes(snapshot.downloaded));
        println!("  Uploaded: {}", format_bytes(snapshot.uploaded));
        println!("  Elapsed: {}", format_duration(self.start_time.elapsed()));
        Ok(())
    }

    pub fn is_quiet(&self) -> bool {
        self.quiet
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0.00 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1024 * 1024), "1.00 MB");
        assert_eq!(format_speed(1024.0), "1.00 KB/s");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(30)), "30s");
        assert_eq!(format_duration(Duration::from_secs(90)), "1m 30s");
        assert_eq!(format_duration(Duration::from_secs(3661)), "1h 1m 1s");
    }

    #[test]
    fn test_calculate_eta() {
        assert_eq!(calculate_eta(50, 10.0), Some(Duration::from_secs(5)));
        assert_eq!(calculate_eta(0, 10.0), None);
        assert_eq!(calculate_eta(50, 0.0), None);
    }

    #[test]
    fn test_progress_fraction() {
        let mut snapshot = ProgressSnapshot {
            wanted: 200,
            left: 50,
            ..Default::default()
        };
        assert!((snapshot.progress() - 0.75).abs() < f64::EPSILON);
        snapshot.wanted = 0;
        assert_eq!(snapshot.progress(), 1.0);
    }

    #[test]
    fn test_render_line() {
        let mut display = ProgressDisplay::new(true);
        let snapshot = ProgressSnapshot {
            wanted: 100,
            left: 50,
            pieces_done: 1,
            pieces_wanted: 2,
            peers_known: 4,
            peers_active: 2,
            ..Default::default()
        };
        let line = display.render(&snapshot);
        assert!(line.contains("50.0%"));
        assert!(line.contains("1/2 pieces"));
        assert!(line.contains("peers 2/4"));
        assert!(display.is_quiet());
    }
}
