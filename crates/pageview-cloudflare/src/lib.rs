//! Cloudflare Workers runtime adapter for the pageview batcher.
//!
//! Every tracked request is forwarded to the `PageviewQueue` Durable Object
//! named after the configured queue. The object owns the debounced queue
//! state; its storage alarm drives the flush.
//!
//! Entry point is #[event(fetch)] macro, not main().

mod config;
mod errors;
#[cfg(target_arch = "wasm32")]
mod queue_object;
mod request;

// Re-export Durable Object classes at crate root for worker-build
#[cfg(target_arch = "wasm32")]
pub use queue_object::PageviewQueue;

use tracing_subscriber::fmt::format::Pretty;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::prelude::*;
use tracing_web::{performance_layer, MakeConsoleWriter};
use worker::*;

/// Durable Object namespace binding declared in wrangler.toml.
pub(crate) const QUEUE_BINDING: &str = "PAGEVIEW_QUEUE";

/// Initialize tracing subscriber for Cloudflare Workers.
/// Must be called via #[event(start)] to run once on worker initialization.
#[event(start)]
fn init_tracing() {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .json()
        .flatten_event(true) // Put message at top level for $metadata.message in dashboard
        .with_ansi(false) // ANSI codes not supported in Workers console
        .with_timer(UtcTime::rfc_3339())
        .with_writer(MakeConsoleWriter);

    let perf_layer = performance_layer().with_details_from_fields(Pretty::default());

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(perf_layer)
        .init();
}

/// Cloudflare Workers entry point.
#[event(fetch)]
pub async fn main(req: Request, env: Env, _ctx: Context) -> Result<Response> {
    request::handle(req, env).await
}
