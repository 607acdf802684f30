//! Staged packaging pipeline for web applications.
//!
//! charmforge turns an uploaded or cloned web-application source tree into
//! a pair of deployment artifacts (a "rock" image and a "charm" operator
//! package) and bundles them into one downloadable archive. It is the
//! pipeline core behind thin presentation adapters (the bundled CLI, a web
//! API, a GUI): the adapters render progress and collect input, the
//! sequencing lives here.
//!
//! # Architecture
//!
//! ```text
//! orchestrator ──── drives ────────────┐
//!     │                                │
//!     ├── source        acquire an archive upload or a git checkout
//!     ├── validate      framework gate before any packaging
//!     ├── rock          image-builder init/pack stages
//!     ├── charm         operator-builder init/mutate/pack stages
//!     ├── bundle        combine both artifacts into one download
//!     │                                │
//!     ├── registry      job → workspace/stages/artifacts (single mutator)
//!     ├── events        append-only per-job status channel
//!     └── runner        one external process, streamed and time-boxed
//! ```
//!
//! Jobs run in parallel, one pipeline thread each; stages within a job are
//! strictly sequential. Every external tool line and stage transition is
//! published to the job's event log, and each job ends with exactly one
//! terminal outcome: a bundle handle or a human-readable error.
//!
//! # Example
//!
//! ```rust,ignore
//! use charmforge::{ForgeConfig, JobRequest, Orchestrator, SourceSpec};
//! use charmforge::validate::Framework;
//!
//! let orch = Orchestrator::new(ForgeConfig::default());
//! let job = orch.submit(JobRequest {
//!     source: SourceSpec::Remote(charmforge::source::RemoteSource {
//!         url: "https://github.com/example/app".into(),
//!         branch: "main".into(),
//!         subfolder: None,
//!     }),
//!     framework: Framework::Flask,
//!     integrations: vec!["postgresql".into()],
//!     options: Default::default(),
//! })?;
//!
//! let mut cursor = 0;
//! loop {
//!     let (events, outcome) = orch.events(job, cursor)?;
//!     cursor += events.len();
//!     for event in events {
//!         println!("{}", event.text);
//!     }
//!     if outcome.is_some() {
//!         break;
//!     }
//! }
//! # Ok::<(), charmforge::PipelineError>(())
//! ```

pub mod artifact;
pub mod bundle;
pub mod charm;
pub mod config;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod registry;
pub mod rock;
pub mod runner;
pub mod source;
pub mod validate;

use std::path::PathBuf;
use std::time::Duration;

pub use charm::{CharmPackager, ConfigOption, OptionSet, OptionType};
pub use config::ForgeConfig;
pub use error::PipelineError;
pub use events::{EventKind, Outcome, StatusEvent};
pub use orchestrator::{JobRequest, Orchestrator, SourceSpec};
pub use registry::{JobId, JobRegistry, Stage, StageState};
pub use rock::RockPackager;
pub use runner::{CancelToken, CommandRunner, CommandSpec};
pub use validate::Framework;

use events::EventLog;

/// Everything a stage body needs: the shared runner and configuration, the
/// job's cancellation token, and its event log.
pub struct StageContext<'a> {
    pub config: &'a ForgeConfig,
    pub runner: &'a CommandRunner,
    pub cancel: &'a CancelToken,
    pub events: &'a EventLog,
}

impl StageContext<'_> {
    /// Spec for one packaging-tool invocation, carrying the configured
    /// silence window.
    pub fn tool(&self, tool: &str, cwd: PathBuf, timeout: Duration) -> CommandSpec {
        CommandSpec::new(tool, cwd, timeout).idle_timeout(self.config.idle_timeout)
    }

    /// Spec for one git invocation under the fetch timeout.
    pub fn git(&self, cwd: PathBuf) -> CommandSpec {
        self.tool(&self.config.git_tool, cwd, self.config.fetch_timeout)
    }
}
