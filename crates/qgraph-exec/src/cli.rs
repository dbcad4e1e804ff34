//! Flag surface for a runner front-end built on top of this crate. The core
//! scheduler never parses argv itself; this is the fixed flag → config
//! mapping callers are expected to reuse.

use crate::config::{PdbSpec, SchedulerConfig, StartMethod};
use qgraph_core::logging::LoggingArgs;
use std::num::NonZeroUsize;
use std::time::Duration;

#[derive(Debug, clap::Args)]
#[clap(about)]
pub struct SchedulerArgs {
    #[clap(flatten)]
    pub log_level: LoggingArgs,

    /// Maximum concurrent workers. `1` runs every quantum in-process.
    #[clap(short = 'j', long = "processes", default_value_t = NonZeroUsize::new(1).unwrap())]
    pub processes: NonZeroUsize,

    /// Per-worker deadline, in seconds, from dispatch time.
    #[clap(long, default_value_t = 60)]
    pub timeout: u64,

    /// How a worker process is started.
    #[clap(long = "start-method", value_enum, default_value = "spawn")]
    pub start_method: StartMethod,

    /// Tear down the whole run on the first non-succeeded terminal.
    #[clap(long = "fail-fast")]
    pub fail_fast: bool,

    /// Drop a failed task into the named debugger in-process. Forces `-j 1`.
    #[clap(long)]
    pub pdb: Option<String>,
}

impl SchedulerArgs {
    pub fn to_config(&self) -> SchedulerConfig {
        let num_proc = if self.pdb.is_some() { NonZeroUsize::new(1).unwrap() } else { self.processes };
        SchedulerConfig::new(num_proc, Duration::from_secs(self.timeout))
            .with_start_method(self.start_method)
            .with_fail_fast(self.fail_fast)
            .with_pdb(self.pdb.clone().map(PdbSpec::new))
    }
}
