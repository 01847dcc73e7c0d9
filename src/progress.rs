use burn::train::renderer::{MetricState, MetricsRenderer, TrainingProgress};
use crossterm::{
    cursor, execute,
    terminal::{Clear, ClearType},
};
use std::collections::BTreeMap;
use std::io::{self, Write};
use std::time::Instant;

const UPDATE_FREQUENCY: usize = 10;

/// Single-line terminal progress for the learner, redrawn in place.
pub struct ProgressIndicator {
    start_time: Instant,
    last_update: Option<usize>,
    train_metrics: BTreeMap<String, String>,
    valid_metrics: BTreeMap<String, String>,
}

impl Default for ProgressIndicator {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressIndicator {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            last_update: None,
            train_metrics: BTreeMap::new(),
            valid_metrics: BTreeMap::new(),
        }
    }

    fn record(metrics: &mut BTreeMap<String, String>, state: MetricState) {
        let entry = match state {
            MetricState::Generic(entry) => entry,
            MetricState::Numeric(entry, _) => entry,
        };
        metrics.insert(entry.name, entry.formatted);
    }

    fn should_render(&mut self, iteration: usize, done: bool) -> bool {
        let due = match self.last_update {
            Some(last) => iteration < last || iteration - last >= UPDATE_FREQUENCY,
            None => true,
        };
        if due || done {
            self.last_update = Some(iteration);
        }
        due || done
    }

    fn line(
        &self,
        mode: &str,
        item: &TrainingProgress,
        metrics: &BTreeMap<String, String>,
    ) -> String {
        let elapsed = self.start_time.elapsed();
        let mins = elapsed.as_secs() / 60;
        let percent = if item.progress.items_total == 0 {
            100
        } else {
            item.progress.items_processed * 100 / item.progress.items_total
        };

        let metrics = metrics
            .iter()
            .map(|(name, value)| format!("{name}: {value}"))
            .collect::<Vec<_>>()
            .join(" - ");

        format!(
            "{} | Epoch: {}/{} | Step: {} | Items: {}/{} | ({} mins) | {} | {}%",
            mode,
            item.epoch,
            item.epoch_total,
            item.iteration,
            item.progress.items_processed,
            item.progress.items_total,
            mins,
            metrics,
            percent,
        )
    }

    fn draw(&self, line: &str, done: bool) -> io::Result<()> {
        let mut stdout = io::stdout();
        execute!(stdout, cursor::MoveToColumn(0), Clear(ClearType::CurrentLine))?;
        if done {
            writeln!(stdout, "{line}")?;
        } else {
            write!(stdout, "{line}")?;
        }
        stdout.flush()
    }

    fn render(&mut self, mode: &str, item: TrainingProgress, valid: bool) {
        let done = item.progress.items_processed >= item.progress.items_total;
        if !self.should_render(item.iteration, done) {
            return;
        }

        let metrics = if valid {
            &self.valid_metrics
        } else {
            &self.train_metrics
        };
        let line = self.line(mode, &item, metrics);
        if let Err(err) = self.draw(&line, done) {
            tracing::debug!(%err, "failed to draw progress");
        }
    }
}

impl MetricsRenderer for ProgressIndicator {
    fn update_train(&mut self, state: MetricState) {
        Self::record(&mut self.train_metrics, state);
    }

    fn update_valid(&mut self, state: MetricState) {
        Self::record(&mut self.valid_metrics, state);
    }

    fn render_train(&mut self, item: TrainingProgress) {
        self.render("Training", item, false);
    }

    fn render_valid(&mut self, item: TrainingProgress) {
        self.render("Validating", item, true);
    }
}
