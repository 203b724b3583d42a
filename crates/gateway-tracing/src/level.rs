//! Runtime log filter control.

use thiserror::Error;
use tracing_subscriber::filter::ParseError;
use tracing_subscriber::{reload, EnvFilter, Registry};

/// Reload handle for the filter layer installed directly on the registry.
pub type FilterHandle = reload::Handle<EnvFilter, Registry>;

/// Errors from changing the active log filter.
#[derive(Debug, Error)]
pub enum TracingError {
    #[error("invalid log filter {directives:?}: {source}")]
    InvalidFilter {
        directives: String,
        #[source]
        source: ParseError,
    },

    #[error("log filter can no longer be reloaded: {0}")]
    Reload(#[from] reload::Error),
}

/// Cheap-to-clone handle for reading and replacing the active log filter.
#[derive(Debug, Clone)]
pub struct LogLevelHandle {
    inner: FilterHandle,
}

impl LogLevelHandle {
    /// Wrap the handle of a `reload::Layer<EnvFilter, Registry>`.
    pub fn new(inner: FilterHandle) -> Self {
        Self { inner }
    }

    /// The active filter directives.
    pub fn current(&self) -> Result<String, TracingError> {
        Ok(self.inner.with_current(|filter| filter.to_string())?)
    }

    /// Replace the active filter, e.g. `"debug"` or `"gateway_proxy=trace,info"`.
    ///
    /// The previous filter stays in place if `directives` does not parse.
    pub fn set(&self, directives: &str) -> Result<(), TracingError> {
        let filter = EnvFilter::try_new(directives).map_err(|source| TracingError::InvalidFilter {
            directives: directives.to_string(),
            source,
        })?;
        self.inner.reload(filter)?;

        tracing::info!(log_level = %directives, "Log filter changed");
        Ok(())
    }
}
