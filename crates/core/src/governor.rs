//! CPU/memory gate for every worker pool the crate spawns.
//!
//! [`ResourceGovernor::recommend_workers`] sizes a pool from a fresh sample;
//! [`ResourceGovernor::monitor`] keeps sampling while the pool runs, asking
//! workers to pause above `max_cpu_percent` and latching an emergency stop
//! after `emergency_samples` consecutive samples above `emergency_cpu_percent`.

use crate::config::GovernorConfig;
use crate::error::SampleError;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sysinfo::System;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const FALLBACK_WORKERS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceSample {
    pub cpu_percent: f32,
    pub memory_percent: f32,
}

pub trait ResourceSampler: Send + Sync {
    fn sample(&self) -> Result<ResourceSample, SampleError>;
    fn physical_cores(&self) -> usize;
}

/// Samples the host through `sysinfo`; each CPU sample spans `window`.
pub struct SystemSampler {
    system: Mutex<System>,
    window: Duration,
}

impl SystemSampler {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
            window: Duration::from_millis(100),
        }
    }
}

impl Default for SystemSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceSampler for SystemSampler {
    fn sample(&self) -> Result<ResourceSample, SampleError> {
        let mut system = self
            .system
            .lock()
            .map_err(|_| SampleError("system sampler lock poisoned".to_string()))?;

        system.refresh_cpu();
        std::thread::sleep(self.window.max(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL));
        system.refresh_cpu();
        let cpu_percent = system.global_cpu_info().cpu_usage();

        system.refresh_memory();
        let total = system.total_memory();
        if total == 0 {
            return Err(SampleError("total memory reported as zero".to_string()));
        }
        let memory_percent = system.used_memory() as f32 / total as f32 * 100.0;

        Ok(ResourceSample {
            cpu_percent,
            memory_percent,
        })
    }

    fn physical_cores(&self) -> usize {
        num_cpus::get_physical().max(1)
    }
}

/// Replays a fixed sequence of samples, repeating the last one forever.
///
/// Useful for dry runs and for reproducing throttling decisions.
pub struct ScriptedSampler {
    script: Mutex<VecDeque<ResourceSample>>,
    last: Mutex<Option<ResourceSample>>,
    cores: usize,
}

impl ScriptedSampler {
    pub fn new(cores: usize, samples: impl IntoIterator<Item = ResourceSample>) -> Self {
        Self {
            script: Mutex::new(samples.into_iter().collect()),
            last: Mutex::new(None),
            cores: cores.max(1),
        }
    }

    pub fn constant(cores: usize, cpu_percent: f32, memory_percent: f32) -> Self {
        Self::new(
            cores,
            [ResourceSample {
                cpu_percent,
                memory_percent,
            }],
        )
    }
}

impl ResourceSampler for ScriptedSampler {
    fn sample(&self) -> Result<ResourceSample, SampleError> {
        let next = self
            .script
            .lock()
            .map_err(|_| SampleError("script lock poisoned".to_string()))?
            .pop_front();
        let mut last = self
            .last
            .lock()
            .map_err(|_| SampleError("script lock poisoned".to_string()))?;
        if let Some(sample) = next {
            *last = Some(sample);
        }
        last.ok_or_else(|| SampleError("empty sample script".to_string()))
    }

    fn physical_cores(&self) -> usize {
        self.cores
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkKind {
    Ocr,
    Embedding,
    Decode,
}

impl fmt::Display for WorkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            WorkKind::Ocr => "ocr",
            WorkKind::Embedding => "embedding",
            WorkKind::Decode => "decode",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerPlan {
    pub workers: usize,
    pub strategy: String,
}

#[derive(Debug, Default)]
struct MonitorState {
    active: AtomicBool,
    throttled: AtomicBool,
    emergency: AtomicBool,
    consecutive_hot: AtomicU32,
}

pub struct ResourceGovernor {
    config: GovernorConfig,
    sampler: Arc<dyn ResourceSampler>,
    state: Arc<MonitorState>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl ResourceGovernor {
    pub fn new(config: GovernorConfig, sampler: Arc<dyn ResourceSampler>) -> Self {
        Self {
            config,
            sampler,
            state: Arc::new(MonitorState::default()),
            monitor: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &GovernorConfig {
        &self.config
    }

    /// Worker count for `task_count` tasks of `kind`, never above the physical core count.
    ///
    /// Blocks for one CPU sample window.
    pub fn recommend_workers(&self, task_count: usize, kind: WorkKind) -> WorkerPlan {
        let sample = match self.sampler.sample() {
            Ok(sample) => sample,
            Err(error) => {
                warn!(%error, %kind, "resource sample failed; using conservative worker count");
                return WorkerPlan {
                    workers: FALLBACK_WORKERS.min(task_count.max(1)),
                    strategy: format!("{kind}:fallback"),
                };
            }
        };
        let cores = self.sampler.physical_cores().max(1);
        let plan = plan_workers(&self.config, sample, cores, task_count, kind);
        debug!(
            cpu = sample.cpu_percent,
            memory = sample.memory_percent,
            cores,
            task_count,
            workers = plan.workers,
            strategy = %plan.strategy,
            "worker plan"
        );
        plan
    }

    /// Starts the background sampler; a running monitor is left as is.
    pub fn monitor(&self, worker_count: usize) {
        let mut slot = match self.monitor.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        if slot.is_some() {
            return;
        }

        self.state.active.store(true, Ordering::SeqCst);
        let state = Arc::clone(&self.state);
        let sampler = Arc::clone(&self.sampler);
        let config = self.config.clone();
        debug!(worker_count, "resource monitor started");

        *slot = Some(tokio::spawn(async move {
            while state.active.load(Ordering::SeqCst) {
                let sampler = Arc::clone(&sampler);
                match tokio::task::spawn_blocking(move || sampler.sample()).await {
                    Ok(Ok(sample)) => observe(&state, &config, sample),
                    Ok(Err(error)) => debug!(%error, "monitor sample failed"),
                    Err(error) => debug!(%error, "monitor sample task failed"),
                }
                if state.emergency.load(Ordering::SeqCst) {
                    break;
                }
                tokio::time::sleep(config.sample_interval()).await;
            }
        }));
    }

    pub fn should_emergency_stop(&self) -> bool {
        self.state.emergency.load(Ordering::SeqCst)
    }

    pub fn is_throttled(&self) -> bool {
        self.state.throttled.load(Ordering::SeqCst)
    }

    /// Yields for `throttle_pause` while the last sample was above `max_cpu_percent`.
    pub async fn pause_if_throttled(&self) {
        if self.is_throttled() && !self.should_emergency_stop() {
            debug!(pause_ms = self.config.throttle_pause_ms, "cpu above limit; worker yielding");
            tokio::time::sleep(self.config.throttle_pause()).await;
        }
    }

    /// Stops the background sampler. Safe to call repeatedly.
    pub fn stop(&self) {
        self.state.active.store(false, Ordering::SeqCst);
        let handle = match self.monitor.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

impl Drop for ResourceGovernor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn observe(state: &MonitorState, config: &GovernorConfig, sample: ResourceSample) {
    let throttled = sample.cpu_percent > config.max_cpu_percent;
    if throttled && !state.throttled.load(Ordering::SeqCst) {
        warn!(cpu = sample.cpu_percent, limit = config.max_cpu_percent, "cpu above limit; throttling workers");
    }
    state.throttled.store(throttled, Ordering::SeqCst);

    if sample.cpu_percent > config.emergency_cpu_percent {
        let hot = state.consecutive_hot.fetch_add(1, Ordering::SeqCst) + 1;
        if hot >= config.emergency_samples && !state.emergency.swap(true, Ordering::SeqCst) {
            warn!(
                cpu = sample.cpu_percent,
                consecutive = hot,
                "sustained cpu saturation; emergency stop raised"
            );
        }
    } else {
        state.consecutive_hot.store(0, Ordering::SeqCst);
    }
}

/// The sizing table: cpu load picks a cap, then cores, tasks and memory narrow it.
pub fn plan_workers(
    config: &GovernorConfig,
    sample: ResourceSample,
    cores: usize,
    task_count: usize,
    kind: WorkKind,
) -> WorkerPlan {
    let cpu = sample.cpu_percent;
    let (cap, label) = if cpu >= config.max_cpu_percent {
        (1, "cpu-limit")
    } else if cpu > 85.0 {
        (1, "cpu-critical")
    } else if cpu > 70.0 {
        (2, "cpu-high")
    } else if cpu > 50.0 {
        (3, "cpu-elevated")
    } else if cpu >= 20.0 {
        (cores.div_ceil(6).min(3), "cpu-moderate")
    } else {
        (cores.div_ceil(4).min(4), "cpu-idle")
    };

    let mut workers = cap.min(cores).min(task_count.max(1));
    let mut strategy = format!("{kind}:{label}");
    if sample.memory_percent > config.memory_cap_percent && workers > 2 {
        workers = 2;
        strategy.push_str("+mem-capped");
    }

    WorkerPlan {
        workers: workers.max(1),
        strategy,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(cpu_percent: f32, memory_percent: f32) -> ResourceSample {
        ResourceSample {
            cpu_percent,
            memory_percent,
        }
    }

    struct FailingSampler;

    impl ResourceSampler for FailingSampler {
        fn sample(&self) -> Result<ResourceSample, SampleError> {
            Err(SampleError("no sensors".to_string()))
        }

        fn physical_cores(&self) -> usize {
            8
        }
    }

    #[test]
    fn policy_table_caps_by_cpu_band() {
        let config = GovernorConfig::default();
        let plan = |cpu| plan_workers(&config, sample(cpu, 10.0), 16, 100, WorkKind::Ocr).workers;

        assert_eq!(plan(90.0), 1);
        assert_eq!(plan(75.0), 2);
        assert_eq!(plan(60.0), 3);
        assert_eq!(plan(30.0), 3);
        assert_eq!(plan(10.0), 4);
    }

    #[test]
    fn moderate_band_scales_with_cores() {
        let config = GovernorConfig::default();
        let plan = plan_workers(&config, sample(30.0, 10.0), 6, 100, WorkKind::Ocr);
        assert_eq!(plan.workers, 1);
        assert_eq!(plan.strategy, "ocr:cpu-moderate");
    }

    #[test]
    fn workers_never_exceed_cores_or_tasks() {
        let config = GovernorConfig::default();
        assert_eq!(plan_workers(&config, sample(5.0, 10.0), 1, 100, WorkKind::Ocr).workers, 1);
        assert_eq!(plan_workers(&config, sample(5.0, 10.0), 16, 2, WorkKind::Ocr).workers, 2);
        assert_eq!(plan_workers(&config, sample(5.0, 10.0), 16, 0, WorkKind::Ocr).workers, 1);
    }

    #[test]
    fn memory_pressure_caps_at_two() {
        let config = GovernorConfig::default();
        let plan = plan_workers(&config, sample(5.0, 85.0), 16, 100, WorkKind::Embedding);
        assert_eq!(plan.workers, 2);
        assert!(plan.strategy.ends_with("+mem-capped"));
    }

    #[test]
    fn cpu_at_limit_forces_single_worker() {
        let config = GovernorConfig {
            max_cpu_percent: 50.0,
            ..GovernorConfig::default()
        };
        let plan = plan_workers(&config, sample(55.0, 10.0), 16, 100, WorkKind::Ocr);
        assert_eq!(plan.workers, 1);
        assert_eq!(plan.strategy, "ocr:cpu-limit");
    }

    #[test]
    fn sampling_errors_fall_back_to_two_workers() {
        let governor = ResourceGovernor::new(GovernorConfig::default(), Arc::new(FailingSampler));
        let plan = governor.recommend_workers(10, WorkKind::Ocr);
        assert_eq!(plan.workers, 2);
        assert_eq!(plan.strategy, "ocr:fallback");
    }

    #[test]
    fn three_hot_samples_latch_emergency_stop() {
        let config = GovernorConfig::default();
        let state = MonitorState::default();

        observe(&state, &config, sample(99.0, 10.0));
        observe(&state, &config, sample(99.0, 10.0));
        assert!(!state.emergency.load(Ordering::SeqCst));
        observe(&state, &config, sample(99.0, 10.0));
        assert!(state.emergency.load(Ordering::SeqCst));
    }

    #[test]
    fn a_cool_sample_resets_the_hot_streak() {
        let config = GovernorConfig::default();
        let state = MonitorState::default();

        observe(&state, &config, sample(99.0, 10.0));
        observe(&state, &config, sample(99.0, 10.0));
        observe(&state, &config, sample(40.0, 10.0));
        observe(&state, &config, sample(99.0, 10.0));
        assert!(!state.emergency.load(Ordering::SeqCst));
        assert!(state.throttled.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn monitor_raises_emergency_from_scripted_samples() {
        let config = GovernorConfig {
            sample_interval_ms: 1,
            ..GovernorConfig::default()
        };
        let sampler = ScriptedSampler::new(1, [sample(10.0, 10.0), sample(99.0, 10.0)]);
        let governor = ResourceGovernor::new(config, Arc::new(sampler));

        governor.monitor(1);
        for _ in 0..200 {
            if governor.should_emergency_stop() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(governor.should_emergency_stop());
        governor.stop();
        governor.stop();
    }
}
