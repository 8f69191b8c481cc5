//! Feature-gated profiling support via `tracing-chrome`.
//!
//! When the `profiling` feature is enabled, [`init`] installs a Chrome trace
//! subscriber. Every decoder stage runs inside the `vae_decode` span, so the
//! trace shows per-stage timings. Open the file in `chrome://tracing` or
//! [Perfetto](https://ui.perfetto.dev).
//!
//! When the feature is disabled, [`init`] returns `None` and does nothing.

use std::path::Path;

/// Flushes the trace file on drop. Hold it until the workload is finished.
#[cfg(feature = "profiling")]
pub struct ProfilingGuard {
    _guard: tracing_chrome::FlushGuard,
}

#[cfg(not(feature = "profiling"))]
pub struct ProfilingGuard;

/// Install the Chrome tracing layer, writing to `trace_path`.
///
/// Events are filtered through `RUST_LOG` (default `voxel_vae=debug`).
///
/// ```rust,ignore
/// let _guard = voxel_vae::profiling::init("decode_trace.json");
/// decoder.forward(&latent)?;
/// ```
pub fn init(trace_path: impl AsRef<Path>) -> Option<ProfilingGuard> {
    #[cfg(feature = "profiling")]
    {
        use tracing_chrome::ChromeLayerBuilder;
        use tracing_subscriber::layer::SubscriberExt;
        use tracing_subscriber::util::SubscriberInitExt;
        use tracing_subscriber::EnvFilter;

        let trace_path = trace_path.as_ref();
        let (chrome_layer, guard) = ChromeLayerBuilder::new()
            .file(trace_path)
            .include_args(true)
            .build();

        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("voxel_vae=debug"));
        tracing_subscriber::registry()
            .with(filter)
            .with(chrome_layer)
            .init();

        tracing::info!(path = %trace_path.display(), "Chrome trace enabled");
        Some(ProfilingGuard { _guard: guard })
    }

    #[cfg(not(feature = "profiling"))]
    {
        let _ = trace_path;
        None
    }
}
