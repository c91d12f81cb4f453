use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use harvester::collector::CollectProgress;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

const TICK: Duration = Duration::from_millis(100);

/// Label used for collectors without fan-out items.
const SINGLE_ITEM: &str = "-";

/// Consolidated progress state to avoid multiple mutex locks.
#[derive(Default)]
struct ProgressState {
    /// Overall page counter for the run.
    total_bar: Option<ProgressBar>,
    /// One counter per fan-out item, keyed by its serialized form.
    item_bars: HashMap<String, ProgressBar>,
    /// Records persisted so far.
    records: u64,
}

/// Interactive progress reporter using indicatif.
///
/// Shows one spinner for the whole run and one per fan-out item. All
/// mutable state sits behind a single `Mutex<ProgressState>`.
pub struct InteractiveReporter {
    multi: MultiProgress,
    state: Mutex<ProgressState>,
}

impl InteractiveReporter {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            state: Mutex::new(ProgressState::default()),
        }
    }

    fn item_bar<'a>(&self, state: &'a mut ProgressState, label: &str) -> &'a ProgressBar {
        let multi = &self.multi;
        state.item_bars.entry(label.to_string()).or_insert_with(|| {
            let bar = multi.add(ProgressBar::new_spinner());
            bar.set_style(Self::counter_style());
            bar.set_prefix(format!("{:>16}", truncate(label, 16)));
            bar.enable_steady_tick(TICK);
            bar
        })
    }

    pub fn handle(&self, event: CollectProgress) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        match event {
            CollectProgress::Started { table, concurrency } => {
                let bar = self.multi.add(ProgressBar::new_spinner());
                bar.set_style(Self::spinner_style());
                bar.set_prefix(table);
                bar.set_message(format!("collecting with {concurrency} worker(s)..."));
                bar.enable_steady_tick(TICK);
                state.total_bar = Some(bar);
            }

            CollectProgress::Progress { current, .. } => {
                let records = state.records;
                if let Some(bar) = &state.total_bar {
                    bar.set_message(format!("{current} pages, {records} records"));
                }
            }

            CollectProgress::PageCollected {
                input,
                page,
                records,
            } => {
                state.records += records as u64;
                let label = input.unwrap_or_else(|| SINGLE_ITEM.to_string());
                let bar = self.item_bar(&mut state, &label);
                bar.inc(records as u64);
                bar.set_message(format!("records (page {page})"));
            }

            CollectProgress::ItemSkipped { input, status } => {
                let label = input.unwrap_or_else(|| SINGLE_ITEM.to_string());
                let bar = self.item_bar(&mut state, &label);
                bar.set_style(Self::skipped_style());
                bar.finish_with_message(format!("skipped (HTTP {status})"));
            }

            CollectProgress::BoundaryReached { input, boundary } => {
                let label = input.unwrap_or_else(|| SINGLE_ITEM.to_string());
                let bar = self.item_bar(&mut state, &label);
                bar.finish_with_message(format!(
                    "records, up to date since {}",
                    boundary.format("%Y-%m-%d %H:%M")
                ));
            }

            CollectProgress::Finished { stats } => {
                for bar in state.item_bars.values() {
                    if !bar.is_finished() {
                        bar.finish();
                    }
                }
                if let Some(bar) = &state.total_bar {
                    bar.finish_with_message(format!(
                        "done: {} records from {} pages ({} requests, {} skipped)",
                        stats.records, stats.pages, stats.requests, stats.skipped_items
                    ));
                }
            }

            _ => {}
        }
    }

    /// Finish every bar that is still running.
    pub fn finish(&self) {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        for bar in state.item_bars.values().chain(state.total_bar.iter()) {
            if !bar.is_finished() {
                bar.abandon();
            }
        }
    }

    fn spinner_style() -> ProgressStyle {
        ProgressStyle::default_spinner()
            .template("{prefix:.bold.cyan} {spinner:.green} {msg}")
            .expect("Invalid template")
            .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏")
    }

    fn skipped_style() -> ProgressStyle {
        ProgressStyle::default_spinner()
            .template("{prefix:.bold.cyan} {spinner:.yellow} {msg}")
            .expect("Invalid template")
            .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏")
    }

    fn counter_style() -> ProgressStyle {
        ProgressStyle::default_spinner()
            .template("{prefix:.bold.cyan} {spinner:.green} {pos:>6} {msg}")
            .expect("Invalid template")
            .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏")
    }
}

impl Default for InteractiveReporter {
    fn default() -> Self {
        Self::new()
    }
}

fn truncate(label: &str, max: usize) -> String {
    if label.chars().count() <= max {
        return label.to_string();
    }
    let mut short: String = label.chars().take(max.saturating_sub(1)).collect();
    short.push('…');
    short
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_keeps_short_labels() {
        assert_eq!(truncate("42", 16), "42");
    }

    #[test]
    fn test_truncate_long_labels() {
        let label = "{\"repo\":\"rust-lang/rust\"}";
        let short = truncate(label, 8);
        assert_eq!(short.chars().count(), 8);
        assert!(short.ends_with('…'));
    }

    #[test]
    fn test_styles_build() {
        let _ = InteractiveReporter::spinner_style();
        let _ = InteractiveReporter::skipped_style();
        let _ = InteractiveReporter::counter_style();
    }
}
