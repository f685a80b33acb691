use colored::*;
use std::time::Duration;

/// User-facing status line for build progress.
///
/// Structured logs go through `Logger`; this is the short human summary
/// printed to the terminal ("Building index.js...", "Built in 84ms.").
#[derive(Debug, Clone)]
pub struct StatusLine {
    enabled: bool,
}

impl StatusLine {
    pub fn new(log_level: u8) -> Self {
        Self {
            enabled: log_level >= 3,
        }
    }

    pub fn building(&self, what: Option<&str>) {
        if !self.enabled {
            return;
        }
        match what {
            Some(name) => println!("  {} Building {}...", "⏳".bright_black(), name.bright_cyan()),
            None => println!("  {} Building...", "⏳".bright_black()),
        }
    }

    pub fn built(&self, elapsed: Duration) {
        if !self.enabled {
            return;
        }
        println!(
            "  {} Built in {}.",
            "✓".bright_green(),
            format_duration(elapsed).bright_white().bold()
        );
    }

    pub fn failed(&self, detail: &str) {
        if !self.enabled {
            return;
        }
        eprintln!("  {} {}", "✗".bright_red(), detail.red());
    }
}

/// `840ms` below a second, `1.25s` above
pub fn format_duration(elapsed: Duration) -> String {
    let millis = elapsed.as_millis();
    if millis < 1000 {
        format!("{}ms", millis)
    } else {
        format!("{:.2}s", elapsed.as_secs_f64())
    }
}
