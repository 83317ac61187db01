use anyhow::{Context, Result, anyhow};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;
use uuid::Uuid;
use zima_core::AppConfig;
use zima_observe::init_tracing;
use zima_runtime::ZimaCore;

/// Everything a command needs: the tokio runtime and a core whose state has
/// been loaded from the workspace. `close` saves the state back.
pub(crate) struct CliContext {
    runtime: Runtime,
    core: Arc<ZimaCore>,
}

impl CliContext {
    pub(crate) fn open(workspace: &Path) -> Result<Self> {
        let config = AppConfig::load(workspace)?;
        if let Err(err) = init_tracing(&config.log) {
            eprintln!("zima: {err:#}");
        }
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("failed to start async runtime")?;
        let core = ZimaCore::builder(workspace).config(config).build()?;
        let report = core.load_state();
        for error in &report.errors {
            tracing::warn!(error = %error, "state not fully loaded");
        }
        Ok(Self { runtime, core })
    }

    pub(crate) fn core(&self) -> &Arc<ZimaCore> {
        &self.core
    }

    pub(crate) fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    pub(crate) fn close(self) {
        let report = self.core.save_state();
        for error in &report.errors {
            tracing::warn!(error = %error, "state not fully saved");
        }
        // A pending stdin read would otherwise hold the runtime open.
        self.runtime.shutdown_timeout(Duration::from_millis(500));
    }
}

pub(crate) fn parse_session(raw: Option<&str>) -> Result<Option<Uuid>> {
    raw.map(|s| Uuid::parse_str(s).map_err(|_| anyhow!("invalid session id: {s}")))
        .transpose()
}
