//! Configuration loading for Cloudflare Workers.

use once_cell::sync::OnceCell;
use pageview_config::{EnvSource, RuntimeConfig, ENV_PREFIX};
use worker::Env;

static CONFIG: OnceCell<RuntimeConfig> = OnceCell::new();

/// Environment source for Cloudflare Workers.
///
/// Reads `PAGEVIEW_*` vars from the Worker environment. Used by both the
/// fetch handler and the Durable Object.
pub(crate) struct WorkerEnvSource<'a> {
    pub env: &'a Env,
}

impl EnvSource for WorkerEnvSource<'_> {
    fn get(&self, key: &str) -> Option<String> {
        let binding = format!("{}{}", ENV_PREFIX, key);
        match self.env.var(&binding) {
            Ok(val) => {
                tracing::trace!(binding = %binding, "EnvSource: found var");
                Some(val.to_string())
            }
            Err(_) => None,
        }
    }
}

/// Load the runtime config once per isolate.
///
/// Inline TOML comes from `PAGEVIEW_CONFIG_CONTENT`; individual vars override it.
pub(crate) fn runtime_config(env: &Env) -> worker::Result<&'static RuntimeConfig> {
    CONFIG.get_or_try_init(|| {
        let provider = WorkerEnvSource { env };
        let inline = provider.get("CONFIG_CONTENT");
        RuntimeConfig::from_toml_with_env(inline.as_deref(), &provider).map_err(|e| {
            tracing::error!(error = %e, "Invalid worker configuration");
            worker::Error::RustError(format!("invalid configuration: {:#}", e))
        })
    })
}
