pub mod agent;
pub mod analysis;
pub mod config;
pub mod coverage;
pub mod depot;
pub mod execution;
pub mod gadget;
pub mod generator;
pub mod journal;
pub mod metas;
pub mod mutation;
pub mod project;
pub mod prompt;
pub mod state;
pub mod validate;

use std::path::Path;

use eyre::Result;
use flexi_logger::{Duplicate, FileSpec, Logger, LoggerHandle};
use once_cell::sync::OnceCell;

pub use crate::config::Config;
pub use crate::coverage::Coverage;
pub use crate::depot::Depot;
pub use crate::gadget::{ApiGadget, TypeGadget};
pub use crate::generator::HarnessGenerator;
pub use crate::mutation::ApiMutator;
pub use crate::project::Project;
pub use crate::state::{Covered, State, Trial};
pub use crate::validate::{HarnessValidator, Success, ValidationError, Verdict};

static LOGGER: OnceCell<LoggerHandle> = OnceCell::new();

/// Initialize the global logger; with a workdir the stream also lands in
/// `<workdir>/fuzz.log`. Safe to call more than once.
pub fn init_logger(workdir: Option<&Path>, spec: &str) -> Result<()> {
    if LOGGER.get().is_some() {
        return Ok(());
    }
    let mut logger = Logger::try_with_env_or_str(spec)?;
    if let Some(workdir) = workdir {
        logger = logger
            .log_to_file(
                FileSpec::default()
                    .directory(workdir)
                    .basename("fuzz")
                    .suppress_timestamp(),
            )
            .duplicate_to_stderr(Duplicate::All);
    }
    let handle = logger.start()?;
    LOGGER.set(handle).ok();
    Ok(())
}
