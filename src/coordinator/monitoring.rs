//! Stage timing and per-worker reply statistics.

use std::time::{Duration, Instant};

/// Protocol stages tracked by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    GetLabelStatistics,
    SetInitialPredictions,
    StartNewIter,
    FindSplits,
    EvaluateSplits,
    ShareSplits,
    EndIter,
    RestoreCheckpoint,
    CreateCheckpoint,
    StartTraining,
}

pub const NUM_STAGES: usize = 10;

impl Stage {
    pub const ALL: [Stage; NUM_STAGES] = [
        Stage::GetLabelStatistics,
        Stage::SetInitialPredictions,
        Stage::StartNewIter,
        Stage::FindSplits,
        Stage::EvaluateSplits,
        Stage::ShareSplits,
        Stage::EndIter,
        Stage::RestoreCheckpoint,
        Stage::CreateCheckpoint,
        Stage::StartTraining,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::GetLabelStatistics => "GetLabelStatistics",
            Self::SetInitialPredictions => "SetInitialPredictions",
            Self::StartNewIter => "StartNewIter",
            Self::FindSplits => "FindSplits",
            Self::EvaluateSplits => "EvaluateSplits",
            Self::ShareSplits => "ShareSplits",
            Self::EndIter => "EndIter",
            Self::RestoreCheckpoint => "RestoreCheckpoint",
            Self::CreateCheckpoint => "CreateCheckpoint",
            Self::StartTraining => "StartTraining",
        }
    }

    fn index(&self) -> usize {
        match self {
            Self::GetLabelStatistics => 0,
            Self::SetInitialPredictions => 1,
            Self::StartNewIter => 2,
            Self::FindSplits => 3,
            Self::EvaluateSplits => 4,
            Self::ShareSplits => 5,
            Self::EndIter => 6,
            Self::RestoreCheckpoint => 7,
            Self::CreateCheckpoint => 8,
            Self::StartTraining => 9,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct StageStats {
    count: u64,
    sum_duration: Duration,
}

/// Collects stage durations and `FindSplits` reply latencies; renders the
/// human-readable inline log suffix, throttled to one display per 30 s.
pub struct Monitoring {
    verbose: bool,
    stage_stats: [StageStats; NUM_STAGES],
    current_stage: Option<(Stage, Instant)>,

    num_iters: u64,
    time_first_iter: Option<Instant>,

    // FindSplits reply latencies of the current stage.
    reply_times: Vec<(usize, Duration)>,
    last_min: Duration,
    last_median: Duration,
    last_max: Duration,
    last_fastest_worker: usize,
    last_slowest_worker: usize,
    sum_min: Duration,
    sum_median: Duration,
    sum_max: Duration,
    count_reply_times: u64,

    logs_already_displayed: bool,
    last_display_logs: Option<Instant>,
}

impl Default for Monitoring {
    fn default() -> Self {
        Self::new()
    }
}

impl Monitoring {
    pub fn new() -> Self {
        Self {
            verbose: false,
            stage_stats: [StageStats::default(); NUM_STAGES],
            current_stage: None,
            num_iters: 0,
            time_first_iter: None,
            reply_times: Vec::new(),
            last_min: Duration::ZERO,
            last_median: Duration::ZERO,
            last_max: Duration::ZERO,
            last_fastest_worker: 0,
            last_slowest_worker: 0,
            sum_min: Duration::ZERO,
            sum_median: Duration::ZERO,
            sum_max: Duration::ZERO,
            count_reply_times: 0,
            logs_already_displayed: false,
            last_display_logs: None,
        }
    }

    pub fn new_iter(&mut self) {
        if self.num_iters == 0 {
            self.time_first_iter = Some(Instant::now());
        }
        self.num_iters += 1;
    }

    pub fn begin_stage(&mut self, stage: Stage) {
        if let Some((current, _)) = self.current_stage {
            tracing::warn!(
                "Starting stage {} before the previous stage {} was marked as completed",
                stage.name(),
                current.name()
            );
            return;
        }
        self.current_stage = Some((stage, Instant::now()));
        if self.verbose {
            tracing::info!("Starting stage {}", stage.name());
        }
    }

    pub fn end_stage(&mut self, stage: Stage) {
        let Some((_, begin)) = self.current_stage.take() else {
            tracing::warn!("EndStage without BeginStage. stage={}", stage.name());
            return;
        };
        let duration = begin.elapsed();
        let stats = &mut self.stage_stats[stage.index()];
        stats.count += 1;
        stats.sum_duration += duration;

        if stage == Stage::FindSplits && !self.reply_times.is_empty() {
            self.reply_times.sort_by_key(|(_, duration)| *duration);
            let median = self.reply_times[self.reply_times.len() / 2].1;
            let (fastest_worker, min) = self.reply_times[0];
            let (slowest_worker, max) = self.reply_times[self.reply_times.len() - 1];

            self.last_min = min;
            self.last_median = median;
            self.last_max = max;
            self.last_fastest_worker = fastest_worker;
            self.last_slowest_worker = slowest_worker;
            self.sum_min += min;
            self.sum_median += median;
            self.sum_max += max;
            self.count_reply_times += 1;
            self.reply_times.clear();
        }

        if self.verbose {
            tracing::info!("Finishing stage {} in {:?}", stage.name(), duration);
        }
    }

    /// Records the latency of one worker's `FindSplits` reply.
    pub fn find_split_reply_time(&mut self, worker_idx: usize, delay: Duration) {
        if self.verbose {
            tracing::info!("Worker #{worker_idx} replied to FindSplits in {delay:?}");
        }
        self.reply_times.push((worker_idx, delay));
    }

    /// Throttles inline log display to at most once per 30 s.
    pub fn should_display_logs(&mut self) -> bool {
        let now = Instant::now();
        if !self.logs_already_displayed {
            self.logs_already_displayed = true;
            self.last_display_logs = Some(now);
            return true;
        }
        if self
            .last_display_logs
            .is_some_and(|last| now.duration_since(last) >= Duration::from_secs(30))
        {
            self.last_display_logs = Some(now);
            return true;
        }
        false
    }

    /// Human-readable summary appended to the per-iteration training log.
    pub fn inline_logs(&self) -> String {
        let mut logs = String::new();
        if self.num_iters > 0 {
            if let Some(first) = self.time_first_iter {
                let time_per_iter = first.elapsed() / self.num_iters as u32;
                logs.push_str(&format!("time-per-iter:{time_per_iter:?}"));
            }
        }
        logs.push_str(&format!(
            " last-{{min,median,max}}-split-time:{:?} {:?} {:?}",
            self.last_min, self.last_median, self.last_max
        ));
        logs.push_str(&format!(
            " last-{{slowest,fastest}}-worker:{} {}",
            self.last_slowest_worker, self.last_fastest_worker
        ));
        if self.count_reply_times > 0 {
            let n = self.count_reply_times as u32;
            logs.push_str(&format!(
                " mean-{{min,median,max}}-split-time:{:?} {:?} {:?}",
                self.sum_min / n,
                self.sum_median / n,
                self.sum_max / n
            ));
        }
        for stage in Stage::ALL {
            let stats = &self.stage_stats[stage.index()];
            if stats.count > 0 {
                logs.push_str(&format!(
                    "\n\t\t{}: avg:{:?} count:{}",
                    stage.name(),
                    stats.sum_duration / stats.count as u32,
                    stats.count
                ));
            }
        }
        logs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_accounting() {
        let mut monitoring = Monitoring::new();
        monitoring.begin_stage(Stage::FindSplits);
        monitoring.find_split_reply_time(1, Duration::from_millis(5));
        monitoring.find_split_reply_time(0, Duration::from_millis(1));
        monitoring.end_stage(Stage::FindSplits);

        assert_eq!(monitoring.last_fastest_worker, 0);
        assert_eq!(monitoring.last_slowest_worker, 1);
        assert_eq!(monitoring.count_reply_times, 1);

        let logs = monitoring.inline_logs();
        assert!(logs.contains("FindSplits: avg:"));
        assert!(logs.contains("last-{slowest,fastest}-worker:1 0"));
    }

    #[test]
    fn test_first_display_is_allowed_then_throttled() {
        let mut monitoring = Monitoring::new();
        assert!(monitoring.should_display_logs());
        assert!(!monitoring.should_display_logs());
    }

    #[test]
    fn test_unbalanced_stage_is_tolerated() {
        let mut monitoring = Monitoring::new();
        monitoring.end_stage(Stage::EndIter);
        monitoring.begin_stage(Stage::StartNewIter);
        monitoring.begin_stage(Stage::EndIter);
        monitoring.end_stage(Stage::StartNewIter);
        assert_eq!(monitoring.stage_stats[Stage::StartNewIter.index()].count, 1);
    }
}
