//! Background polling worker for the TPU backend.
//!
//! There is no in-process query library for these devices, so a dedicated
//! thread shells out to a Python interpreter on a fixed cadence, parses the
//! line-oriented output and publishes into the shared usage table. The
//! worker owns no device objects; readers copy single records out under the
//! table mutex.

use std::io::Write;
use std::process::Command;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::Context;
use tempfile::NamedTempFile;

/// Upper bound on chips a single host can expose; also the fixed size of
/// the usage table, so slot indices never move.
pub(crate) const MAX_CHIPS_PER_HOST: usize = 64;

/// Chip family names wider than this are truncated.
pub(crate) const CHIP_NAME_LEN: usize = 7;

/// Printed by the query script when its metrics package cannot be imported.
/// Seeing this line means no retry can ever succeed, so the backend
/// permanently disables itself.
pub(crate) const MISSING_DEPENDENCY_SENTINEL: &str = "TPU_INFO_MISSING";

pub(crate) const PYTHON_ENV_VAR: &str = "GPUINFO_PYTHON";

const POLL_PERIOD: Duration = Duration::from_secs(1);
/// Granularity at which the cancellation flag is observed, bounding
/// shutdown latency well below the polling period.
const CANCEL_CHECK_INTERVAL: Duration = Duration::from_millis(10);
const SOFT_RESET_AFTER_FAILURES: u32 = 2;
const FAILURE_COUNT_CAP: u32 = 10;

pub(crate) const QUERY_SCRIPT: &str = r#"try:
    from tpu_info import device, metrics
except ImportError:
    print("TPU_INFO_MISSING")
else:
    chip_type, count = device.get_local_chips()
    for chip_usage in metrics.get_chip_usage(chip_type):
        print(f"{chip_usage.device_id:d} {chip_usage.memory_usage:d}"
              f" {chip_usage.total_memory:d} {chip_usage.duty_cycle_pct:.4f}"
              f" {chip_type.value.name}")
"#;

/// Latest readings for one chip slot. Overwritten wholesale on every
/// successful poll cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct ChipUsageData {
    /// Chip family name, at most [`CHIP_NAME_LEN`] characters
    pub name: String,
    pub device_id: i64,
    // bytes
    pub memory_usage: i64,
    // bytes
    pub total_memory: i64,
    // %
    pub duty_cycle_pct: f64,
}

/// The shared usage table. One mutex guards all slots: records are small
/// and fixed-size, and readers only need a consistent snapshot of a single
/// slot, never concurrent updates to disjoint slots.
pub(crate) struct ChipUsageTable {
    slots: Mutex<Vec<ChipUsageData>>,
}

impl ChipUsageTable {
    pub(crate) fn new(slot_count: usize) -> Self {
        Self {
            slots: Mutex::new(vec![ChipUsageData::default(); slot_count]),
        }
    }

    /// Copies one slot out under the lock. The lock is never held across a
    /// foreign call or I/O.
    pub(crate) fn snapshot(&self, slot: usize) -> Option<ChipUsageData> {
        self.slots.lock().expect("poisoned").get(slot).cloned()
    }

    pub(crate) fn publish(&self, slot: usize, data: ChipUsageData) -> bool {
        let mut slots = self.slots.lock().expect("poisoned");
        match slots.get_mut(slot) {
            Some(stored) => {
                *stored = data;
                true
            }
            None => false,
        }
    }

    /// Zeroes volatile readings so stale values are not displayed while the
    /// external source is unavailable. Identity fields (name, capacity)
    /// survive.
    pub(crate) fn soft_reset(&self) {
        for slot in self.slots.lock().expect("poisoned").iter_mut() {
            slot.memory_usage = 0;
            slot.duty_cycle_pct = 0.0;
        }
    }

    /// Startup-only reset clearing identity fields too.
    pub(crate) fn full_reset(&self) {
        for slot in self.slots.lock().expect("poisoned").iter_mut() {
            *slot = ChipUsageData::default();
        }
    }
}

/// State shared between the backend and its worker thread.
pub(crate) struct SharedChipState {
    pub table: ChipUsageTable,
    /// Number of chips readers may trust. Dropped to zero on permanent
    /// disablement so the backend presents as absent.
    pub chip_count: AtomicUsize,
    /// Cooperative cancellation flag, checked between sleep increments.
    pub stop: AtomicBool,
}

impl SharedChipState {
    pub(crate) fn new() -> Self {
        Self {
            table: ChipUsageTable::new(MAX_CHIPS_PER_HOST),
            chip_count: AtomicUsize::new(0),
            stop: AtomicBool::new(false),
        }
    }
}

/// How the query script is handed to the interpreter.
///
/// Selected once per session: the script body is written to a private
/// temporary file so repeated invocations skip per-call quoting and reuse
/// the interpreter's bytecode cache. When the file cannot be created, or
/// the file-based form produces no output at all, the session permanently
/// falls back to passing the body inline.
pub(crate) enum ScriptInvocation {
    File {
        argv: Vec<String>,
        /// Keeps the script on disk for the lifetime of the strategy.
        _script: NamedTempFile,
    },
    Inline {
        argv: Vec<String>,
    },
}

impl ScriptInvocation {
    pub(crate) fn preferred(interpreter: &str) -> Self {
        match Self::try_file(interpreter) {
            Ok(invocation) => invocation,
            Err(err) => {
                tracing::debug!(error = %err, "cannot stage query script on disk, using inline form");
                Self::inline(interpreter)
            }
        }
    }

    fn try_file(interpreter: &str) -> anyhow::Result<Self> {
        let mut script = tempfile::Builder::new()
            .prefix("query_tpu_data")
            .suffix(".py")
            .tempfile()
            .context("create temporary script file")?;
        script
            .write_all(QUERY_SCRIPT.as_bytes())
            .context("write script body")?;
        let path = script.path().to_string_lossy().into_owned();
        Ok(Self::File {
            argv: vec![interpreter.to_string(), path],
            _script: script,
        })
    }

    fn inline(interpreter: &str) -> Self {
        Self::Inline {
            argv: vec![
                interpreter.to_string(),
                "-c".to_string(),
                QUERY_SCRIPT.to_string(),
            ],
        }
    }

    /// Verbatim command line, for tests that substitute the interpreter.
    #[cfg(test)]
    pub(crate) fn custom(argv: Vec<String>) -> Self {
        Self::Inline { argv }
    }

    fn argv(&self) -> &[String] {
        match self {
            Self::File { argv, .. } | Self::Inline { argv } => argv,
        }
    }

    fn is_file(&self) -> bool {
        matches!(self, Self::File { .. })
    }
}

pub(crate) fn configured_interpreter() -> String {
    std::env::var(PYTHON_ENV_VAR).unwrap_or_else(|_| "python3".to_string())
}

/// One parsed line of interpreter output.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ParsedLine {
    Usage(ChipUsageData),
    MissingDependency,
}

/// Parses one output line against the strict grammar: exactly five
/// whitespace-separated fields, `<device_id> <memory_used> <memory_total>
/// <duty_cycle_pct> <name>`, the first three integral, the duty cycle a
/// float. Anything else is `None` and gets logged and skipped by the
/// caller.
pub(crate) fn parse_usage_line(line: &str) -> Option<ParsedLine> {
    if line == MISSING_DEPENDENCY_SENTINEL {
        return Some(ParsedLine::MissingDependency);
    }
    let mut fields = line.split_whitespace();
    let device_id: i64 = fields.next()?.parse().ok()?;
    let memory_usage: i64 = fields.next()?.parse().ok()?;
    let total_memory: i64 = fields.next()?.parse().ok()?;
    let duty_cycle_pct: f64 = fields.next()?.parse().ok()?;
    let name_field = fields.next()?;
    if fields.next().is_some() {
        return None;
    }
    Some(ParsedLine::Usage(ChipUsageData {
        name: name_field.chars().take(CHIP_NAME_LEN).collect(),
        device_id,
        memory_usage,
        total_memory,
        duty_cycle_pct,
    }))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PollOutcome {
    /// Every known chip slot received a fresh reading.
    Success,
    /// Fewer readings than known chips; counted towards the reset
    /// threshold.
    Failure,
    /// The interpreter's metrics package is missing; no retry can succeed.
    Disabled,
}

pub(crate) struct UsagePoller {
    shared: Arc<SharedChipState>,
    invocation: ScriptInvocation,
    interpreter: String,
    consecutive_failures: u32,
}

impl UsagePoller {
    pub(crate) fn new(
        shared: Arc<SharedChipState>,
        invocation: ScriptInvocation,
        interpreter: String,
    ) -> Self {
        Self {
            shared,
            invocation,
            interpreter,
            consecutive_failures: 0,
        }
    }

    fn run(mut self) {
        while !self.shared.stop.load(Ordering::Acquire) {
            let cycle_started = Instant::now();
            if self.poll_cycle() == PollOutcome::Disabled {
                tracing::warn!(
                    "external usage source reported its dependency missing, disabling TPU backend"
                );
                return;
            }
            while cycle_started.elapsed() < POLL_PERIOD {
                if self.shared.stop.load(Ordering::Acquire) {
                    return;
                }
                thread::sleep(CANCEL_CHECK_INTERVAL);
            }
        }
    }

    /// Runs one invocation, applies its output and updates the failure
    /// counter. A cycle is a success only when the number of distinct slots
    /// published equals the known chip count.
    pub(crate) fn poll_cycle(&mut self) -> PollOutcome {
        let output = self.capture_output();
        let outcome = self.apply_output(&output);
        match outcome {
            PollOutcome::Success => self.consecutive_failures = 0,
            PollOutcome::Failure => {
                self.consecutive_failures = (self.consecutive_failures + 1).min(FAILURE_COUNT_CAP);
                if self.consecutive_failures == SOFT_RESET_AFTER_FAILURES {
                    tracing::warn!(
                        failures = self.consecutive_failures,
                        "consecutive poll failures, resetting published TPU readings"
                    );
                    self.shared.table.soft_reset();
                }
            }
            PollOutcome::Disabled => {
                self.shared.chip_count.store(0, Ordering::Release);
                self.shared.stop.store(true, Ordering::Release);
            }
        }
        outcome
    }

    fn capture_output(&mut self) -> String {
        let first = run_capture(self.invocation.argv());
        let produced_output = matches!(&first, Ok(stdout) if !stdout.is_empty());
        if !produced_output && self.invocation.is_file() {
            // The staged file producing nothing at all usually means the
            // interpreter cannot run it as configured; the inline form is
            // used for the rest of the session.
            if let Err(err) = &first {
                tracing::debug!(error = %err, "file-based script invocation failed");
            }
            tracing::info!("switching to inline script invocation");
            self.invocation = ScriptInvocation::inline(&self.interpreter);
            return run_capture(self.invocation.argv()).unwrap_or_else(|err| {
                tracing::warn!(error = %err, "failed to run usage query interpreter");
                String::new()
            });
        }
        first.unwrap_or_else(|err| {
            tracing::warn!(error = %err, "failed to run usage query interpreter");
            String::new()
        })
    }

    fn apply_output(&self, output: &str) -> PollOutcome {
        let expected = self
            .shared
            .chip_count
            .load(Ordering::Acquire)
            .min(MAX_CHIPS_PER_HOST);
        let mut published_slots: u64 = 0;
        for line in output.lines() {
            if line.is_empty() {
                continue;
            }
            match parse_usage_line(line) {
                Some(ParsedLine::MissingDependency) => return PollOutcome::Disabled,
                Some(ParsedLine::Usage(data)) => {
                    let slot = data.device_id;
                    if (0..expected as i64).contains(&slot)
                        && self.shared.table.publish(slot as usize, data)
                    {
                        published_slots |= 1 << slot;
                    } else {
                        tracing::warn!(device_id = slot, "usage line for unknown chip slot");
                    }
                }
                None => tracing::warn!(line, "could not parse usage line"),
            }
        }
        if published_slots.count_ones() as usize == expected {
            PollOutcome::Success
        } else {
            PollOutcome::Failure
        }
    }
}

fn run_capture(argv: &[String]) -> anyhow::Result<String> {
    let (program, args) = argv.split_first().context("empty interpreter command")?;
    let output = Command::new(program)
        .args(args)
        .output()
        .with_context(|| format!("spawn {program}"))?;
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Starts the polling thread. It runs until cancelled through
/// `shared.stop` or until the source permanently disables itself.
pub(crate) fn spawn_poller(
    shared: Arc<SharedChipState>,
    invocation: ScriptInvocation,
    interpreter: String,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("tpu-usage-poller".to_string())
        .spawn(move || UsagePoller::new(shared, invocation, interpreter).run())
}
