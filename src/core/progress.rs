//! CLI progress tracking with EWMA-smoothed throughput and ETA.
//!
//! Direct translation of the original's progress module: EWMA smoothing
//! (alpha = 0.15), weighted multi-stage progress within the item currently
//! being processed, and human-readable duration/throughput/ETA formatting.

use std::time::Instant;

/// Capture pipeline stage, used only for weighting progress within one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CaptureStage {
    Initializing,
    Navigating,
    Waiting,
    Behaviors,
    Validating,
    Screenshot,
    Pdf,
    Html,
    Warc,
    Learning,
    Complete,
}

impl CaptureStage {
    /// Step weight; values sum to 100 so the total is a direct percentage.
    fn weight(self) -> u32 {
        match self {
            CaptureStage::Initializing => 2,
            CaptureStage::Navigating => 25,
            CaptureStage::Waiting => 15,
            CaptureStage::Behaviors => 20,
            CaptureStage::Validating => 3,
            CaptureStage::Screenshot => 10,
            CaptureStage::Pdf => 10,
            CaptureStage::Html => 5,
            CaptureStage::Warc => 8,
            CaptureStage::Learning => 2,
            CaptureStage::Complete => 0,
        }
    }
}

const TOTAL_STAGE_WEIGHT: u32 = 100;

/// Exponentially weighted moving average, alpha defaults to 0.15
/// (roughly a 12-sample window).
#[derive(Debug, Clone, Copy)]
pub struct EwmaCalculator {
    alpha: f64,
    value: f64,
    initialized: bool,
}

impl Default for EwmaCalculator {
    fn default() -> Self {
        Self::new(0.15)
    }
}

impl EwmaCalculator {
    pub fn new(alpha: f64) -> Self {
        Self {
            alpha,
            value: 0.0,
            initialized: false,
        }
    }

    pub fn update(&mut self, sample: f64) -> f64 {
        if !self.initialized {
            self.value = sample;
            self.initialized = true;
        } else {
            self.value = self.alpha * sample + (1.0 - self.alpha) * self.value;
        }
        self.value
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn reset(&mut self) {
        self.value = 0.0;
        self.initialized = false;
    }
}

/// Progress and ETA tracking for a batch of items, each moving through
/// [`CaptureStage`]s.
pub struct ProgressState {
    pub total_items: u64,
    pub completed_items: u64,
    pub failed_items: u64,

    pub total_bytes: u64,
    pub completed_bytes: u64,

    pub current_item: String,
    pub current_stage: CaptureStage,
    pub current_stage_progress: f64,

    started_at: Instant,
    last_update: Instant,

    items_ewma: EwmaCalculator,
    bytes_ewma: EwmaCalculator,

    completed_stages: Vec<CaptureStage>,
}

impl ProgressState {
    pub fn new(total_items: u64) -> Self {
        let now = Instant::now();
        Self {
            total_items,
            completed_items: 0,
            failed_items: 0,
            total_bytes: 0,
            completed_bytes: 0,
            current_item: String::new(),
            current_stage: CaptureStage::Initializing,
            current_stage_progress: 0.0,
            started_at: now,
            last_update: now,
            items_ewma: EwmaCalculator::default(),
            bytes_ewma: EwmaCalculator::default(),
            completed_stages: Vec::new(),
        }
    }

    pub fn start_item(&mut self, item: impl Into<String>) {
        self.current_item = item.into();
        self.current_stage = CaptureStage::Initializing;
        self.current_stage_progress = 0.0;
        self.completed_stages.clear();
        self.last_update = Instant::now();
    }

    pub fn set_stage(&mut self, stage: CaptureStage, progress: f64) {
        if self.current_stage != stage {
            if !self.completed_stages.contains(&self.current_stage) {
                self.completed_stages.push(self.current_stage);
            }
            self.current_stage = stage;
        }
        self.current_stage_progress = progress.clamp(0.0, 100.0);
    }

    pub fn complete_item(&mut self, success: bool, bytes_processed: u64) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update).as_secs_f64();

        if success {
            self.completed_items += 1;
            if bytes_processed > 0 {
                self.completed_bytes += bytes_processed;
                if elapsed > 0.0 {
                    self.bytes_ewma.update(bytes_processed as f64 / elapsed);
                }
            }
        } else {
            self.failed_items += 1;
        }

        if elapsed > 0.0 {
            self.items_ewma.update(1.0 / elapsed);
        }

        self.current_stage = CaptureStage::Complete;
        self.completed_stages.clear();
        self.last_update = now;
    }

    pub fn items_per_second(&self) -> f64 {
        self.items_ewma.value()
    }

    pub fn bytes_per_second(&self) -> f64 {
        self.bytes_ewma.value()
    }

    pub fn elapsed_seconds(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64()
    }

    pub fn remaining_items(&self) -> u64 {
        self.total_items
            .saturating_sub(self.completed_items)
            .saturating_sub(self.failed_items)
    }

    pub fn eta_seconds(&self) -> Option<f64> {
        let rate = self.items_per_second();
        if rate <= 0.0 {
            return None;
        }
        let remaining = self.remaining_items();
        if remaining == 0 {
            return Some(0.0);
        }
        Some(remaining as f64 / rate)
    }

    pub fn percent_complete(&self) -> f64 {
        if self.total_items == 0 {
            return 0.0;
        }

        let items_done = self.completed_items + self.failed_items;
        let mut percent = (items_done as f64 / self.total_items as f64) * 100.0;

        if self.remaining_items() > 0 && !self.current_item.is_empty() {
            let item_weight = 100.0 / self.total_items as f64;
            let stage_percent = self.weighted_stage_progress();
            percent += (stage_percent / 100.0) * item_weight;
        }

        percent.min(100.0)
    }

    fn weighted_stage_progress(&self) -> f64 {
        let completed_weight: u32 = self
            .completed_stages
            .iter()
            .map(|stage| stage.weight())
            .sum();
        let current_weight = self.current_stage.weight();
        let partial = current_weight as f64 * (self.current_stage_progress / 100.0);

        ((completed_weight as f64 + partial) / TOTAL_STAGE_WEIGHT as f64) * 100.0
    }
}

/// `"short"` (`2m30s`) or `"long"` (`2 minutes and 30 seconds`) duration rendering.
pub enum DurationStyle {
    Short,
    Long,
}

pub fn format_duration(ms: f64, style: DurationStyle) -> String {
    if ms < 0.0 {
        return "now".to_string();
    }
    if ms < 1000.0 {
        return match style {
            DurationStyle::Short => "< 1s".to_string(),
            DurationStyle::Long => "less than 1 second".to_string(),
        };
    }

    let seconds = (ms / 1000.0) as u64 % 60;
    let minutes = (ms / 60_000.0) as u64 % 60;
    let hours = (ms / 3_600_000.0) as u64 % 24;
    let days = (ms / 86_400_000.0) as u64;

    match style {
        DurationStyle::Short => {
            let mut out = String::new();
            if days > 0 {
                out.push_str(&format!("{days}d"));
            }
            if hours > 0 {
                out.push_str(&format!("{hours}h"));
            }
            if minutes > 0 {
                out.push_str(&format!("{minutes}m"));
            }
            if seconds > 0 && hours == 0 {
                out.push_str(&format!("{seconds}s"));
            }
            if out.is_empty() {
                "< 1s".to_string()
            } else {
                out
            }
        }
        DurationStyle::Long => {
            let mut parts = Vec::new();
            if days > 0 {
                parts.push(format!("{days} day{}", if days != 1 { "s" } else { "" }));
            }
            if hours > 0 {
                parts.push(format!("{hours} hour{}", if hours != 1 { "s" } else { "" }));
            }
            if minutes > 0 {
                parts.push(format!("{minutes} minute{}", if minutes != 1 { "s" } else { "" }));
            }
            if seconds > 0 && hours == 0 {
                parts.push(format!("{seconds} second{}", if seconds != 1 { "s" } else { "" }));
            }
            if parts.is_empty() {
                "less than 1 second".to_string()
            } else if parts.len() == 1 {
                parts.remove(0)
            } else {
                let last = parts.pop().expect("non-empty");
                format!("{} and {}", parts.join(", "), last)
            }
        }
    }
}

pub fn format_throughput(bytes_per_sec: f64) -> String {
    if bytes_per_sec <= 0.0 {
        return "-- B/s".to_string();
    }

    const UNITS: [(&str, f64); 4] = [
        ("B/s", 1.0),
        ("KB/s", 1024.0),
        ("MB/s", 1024.0 * 1024.0),
        ("GB/s", 1024.0 * 1024.0 * 1024.0),
    ];

    for (unit, divisor) in UNITS.iter().rev() {
        if bytes_per_sec >= *divisor {
            let value = bytes_per_sec / divisor;
            return if value >= 100.0 {
                format!("{value:.0} {unit}")
            } else if value >= 10.0 {
                format!("{value:.1} {unit}")
            } else {
                format!("{value:.2} {unit}")
            };
        }
    }

    format!("{bytes_per_sec:.0} B/s")
}

pub fn format_eta(seconds: Option<f64>) -> String {
    match seconds {
        None => "calculating...".to_string(),
        Some(s) if s.is_infinite() => "unknown".to_string(),
        Some(s) if s <= 0.0 => "finishing...".to_string(),
        Some(s) => format_duration(s * 1000.0, DurationStyle::Short),
    }
}

/// Truncates `text` in the middle, preserving `max_len` characters total
/// split evenly between the start and end.
pub fn truncate_middle(text: &str, max_len: usize) -> String {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= max_len {
        return text.to_string();
    }
    if max_len < 5 {
        return chars[..max_len].iter().collect();
    }

    let keep = (max_len - 3) / 2;
    let head: String = chars[..keep].iter().collect();
    let tail: String = chars[chars.len() - keep..].iter().collect();
    format!("{head}...{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ewma_first_sample_is_the_value() {
        let mut ewma = EwmaCalculator::default();
        assert_eq!(ewma.update(10.0), 10.0);
    }

    #[test]
    fn ewma_smooths_subsequent_samples() {
        let mut ewma = EwmaCalculator::default();
        ewma.update(10.0);
        let second = ewma.update(20.0);
        assert!((second - 11.5).abs() < 1e-9);
    }

    #[test]
    fn percent_complete_is_zero_with_no_items() {
        let state = ProgressState::new(0);
        assert_eq!(state.percent_complete(), 0.0);
    }

    #[test]
    fn percent_complete_reflects_finished_items() {
        let mut state = ProgressState::new(4);
        state.start_item("a");
        state.complete_item(true, 0);
        state.start_item("b");
        state.complete_item(true, 0);
        assert!((state.percent_complete() - 50.0).abs() < 1e-9);
    }

    #[test]
    fn eta_is_none_with_zero_throughput() {
        let state = ProgressState::new(10);
        assert_eq!(state.eta_seconds(), None);
    }

    #[test]
    fn format_duration_short_hides_seconds_past_an_hour() {
        assert_eq!(format_duration(3_661_000.0, DurationStyle::Short), "1h1m");
    }

    #[test]
    fn format_duration_sub_second() {
        assert_eq!(format_duration(500.0, DurationStyle::Short), "< 1s");
    }

    #[test]
    fn format_throughput_picks_unit() {
        assert_eq!(format_throughput(0.0), "-- B/s");
        assert_eq!(format_throughput(500.0), "500 B/s");
        assert_eq!(format_throughput(2048.0), "2.00 KB/s");
    }

    #[test]
    fn format_eta_variants() {
        assert_eq!(format_eta(None), "calculating...");
        assert_eq!(format_eta(Some(0.0)), "finishing...");
        assert_eq!(format_eta(Some(f64::INFINITY)), "unknown");
    }

    #[test]
    fn truncate_middle_keeps_ends() {
        assert_eq!(truncate_middle("short", 10), "short");
        assert_eq!(truncate_middle("a-very-long-identifier-string", 13), "a-ver...tring");
    }
}
