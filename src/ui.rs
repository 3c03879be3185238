//! Startup reporting for the daemon: a spinner per stage on a terminal,
//! plain `==>` lines otherwise.

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UiMode {
    Auto,
    Plain,
    Pretty,
}

impl UiMode {
    pub fn parse(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some("plain") => Self::Plain,
            Some("pretty") => Self::Pretty,
            _ => Self::Auto,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Ui {
    pretty: bool,
}

impl Ui {
    /// `Auto` draws spinners only on a terminal and only when logging is not
    /// already writing to it at a chatty level.
    pub fn new(mode: UiMode, is_tty: bool, verbose_logs: bool) -> Self {
        let pretty = is_tty
            && match mode {
                UiMode::Pretty => true,
                UiMode::Auto => !verbose_logs,
                UiMode::Plain => false,
            };
        Self { pretty }
    }

    pub fn is_pretty(&self) -> bool {
        self.pretty
    }

    /// Start a stage. It reports success only through [`Stage::done`];
    /// a stage dropped unfinished is reported as failed.
    pub fn stage(&self, name: &str) -> Stage {
        let spinner = if self.pretty {
            let spinner = ProgressBar::new_spinner();
            spinner.set_draw_target(ProgressDrawTarget::stderr());
            spinner.enable_steady_tick(Duration::from_millis(120));
            let style = ProgressStyle::with_template("{spinner} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner());
            spinner.set_style(style);
            spinner.set_message(format!("{name}…"));
            Some(spinner)
        } else {
            eprintln!("==> {}", name);
            None
        };
        Stage {
            name: name.to_string(),
            start: Instant::now(),
            spinner,
            finished: false,
        }
    }
}

pub struct Stage {
    name: String,
    start: Instant,
    spinner: Option<ProgressBar>,
    finished: bool,
}

impl Stage {
    /// Mark the stage successful, with an optional detail such as a count.
    pub fn done(mut self, detail: &str) {
        self.finished = true;
        let elapsed = format_duration(self.start.elapsed());
        let message = if detail.is_empty() {
            format!("✔ {} ({})", self.name, elapsed)
        } else {
            format!("✔ {}: {} ({})", self.name, detail, elapsed)
        };
        self.emit(message);
    }

    fn emit(&self, message: String) {
        match &self.spinner {
            Some(spinner) => spinner.finish_with_message(message),
            None => eprintln!("{message}"),
        }
    }
}

impl Drop for Stage {
    fn drop(&mut self) {
        if !self.finished {
            self.emit(format!("✘ {} failed", self.name));
        }
    }
}

fn format_duration(duration: Duration) -> String {
    if duration.as_secs() >= 1 {
        format!("{:.2}s", duration.as_secs_f64())
    } else {
        format!("{}ms", duration.as_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_mode_needs_a_quiet_terminal() {
        assert!(Ui::new(UiMode::Auto, true, false).is_pretty());
        assert!(!Ui::new(UiMode::Auto, true, true).is_pretty());
        assert!(!Ui::new(UiMode::Pretty, false, false).is_pretty());
        assert!(!Ui::new(UiMode::Plain, true, false).is_pretty());
    }

    #[test]
    fn mode_parsing() {
        assert_eq!(UiMode::parse(Some("plain")), UiMode::Plain);
        assert_eq!(UiMode::parse(Some("pretty")), UiMode::Pretty);
        assert_eq!(UiMode::parse(None), UiMode::Auto);
    }

    #[test]
    fn format_duration_units() {
        assert_eq!(format_duration(Duration::from_millis(250)), "250ms");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1.50s");
    }
}
