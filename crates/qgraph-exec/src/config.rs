//! Scheduler configuration: everything a caller decides before `execute` runs.

use std::num::NonZeroUsize;
use std::time::Duration;

/// How a worker process is started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum StartMethod {
    /// Fresh re-exec of the current binary. Portable; the default.
    Spawn,
    /// POSIX `fork`. Fastest; unavailable off Unix.
    Fork,
    /// A single pre-forked server process forks each worker from itself.
    #[clap(name = "forkserver")]
    ForkServer,
}

impl Default for StartMethod {
    fn default() -> Self {
        StartMethod::Spawn
    }
}

/// Debugger spec: when set, forces `num_proc == 1` and drops a failing task
/// into the named debugger in-process rather than classifying and continuing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PdbSpec {
    pub debugger: String,
}

impl PdbSpec {
    pub fn new(debugger: impl Into<String>) -> Self {
        Self { debugger: debugger.into() }
    }
}

/// The scheduler's configuration, assembled by the caller before `execute`.
///
/// Built with plain field construction rather than a derive(Builder): the
/// field count is small and every field is meaningful on its own, matching
/// how the upstream CLI args struct is put together.
pub struct SchedulerConfig {
    /// Maximum concurrent workers. `1` means in-process execution, no child worker.
    pub num_proc: NonZeroUsize,
    /// Per-worker deadline from dispatch time. `Duration::ZERO` times out instantly.
    pub timeout: Duration,
    pub start_method: StartMethod,
    /// Tear down the whole run on the first non-`Succeeded` terminal.
    pub fail_fast: bool,
    /// Forces `num_proc == 1`; failed tasks drop into the named debugger in-process.
    pub pdb: Option<PdbSpec>,
}

impl SchedulerConfig {
    pub fn new(num_proc: NonZeroUsize, timeout: Duration) -> Self {
        Self {
            num_proc,
            timeout,
            start_method: StartMethod::default(),
            fail_fast: false,
            pdb: None,
        }
    }

    pub fn with_start_method(mut self, start_method: StartMethod) -> Self {
        self.start_method = start_method;
        self
    }

    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    pub fn with_pdb(mut self, pdb: Option<PdbSpec>) -> Self {
        self.pdb = pdb;
        self
    }

    /// In-process execution: no child worker is ever started.
    pub fn is_serial(&self) -> bool {
        self.num_proc.get() == 1
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::new(NonZeroUsize::new(1).unwrap(), Duration::from_secs(60))
    }
}
