//! Telemetry helpers for tracing spans and Prometheus metrics.

use std::{
    fs::File,
    io,
    path::{Path, PathBuf},
    sync::OnceLock,
    thread,
    time::Duration,
};

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::warn;
use tracing_subscriber::{
    filter::{EnvFilter, filter_fn},
    fmt,
    prelude::*,
};

use crate::config::TelemetryOptions;

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static PROM_UPKEEP_THREAD: OnceLock<thread::JoinHandle<()>> = OnceLock::new();

const PROM_UPKEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Keeps the Chrome trace writer alive for the program run.
pub(crate) struct TelemetryGuard {
    chrome_guard: Option<tracing_chrome::FlushGuard>,
    chrome_trace_path: Option<PathBuf>,
}

/// Install the global tracing subscriber according to the telemetry options.
pub(crate) fn install(opts: &TelemetryOptions) -> TelemetryGuard {
    let default_directive = if opts.verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    let mut chrome_error = None;
    let (chrome_layer, chrome_guard) = match opts.chrome_trace_path.as_deref() {
        Some(path) => match build_chrome_layer(path) {
            Ok((layer, guard)) => (Some(layer), Some(guard)),
            Err(err) => {
                chrome_error = Some((path.to_path_buf(), err));
                (None, None)
            }
        },
        None => (None, None),
    };

    let span_only_filter = filter_fn(|metadata| metadata.is_span());
    let installed = tracing_subscriber::registry()
        .with(chrome_layer.map(|layer| layer.with_filter(span_only_filter)))
        .with(
            fmt::layer()
                .with_target(false)
                .with_timer(fmt::time::uptime())
                .with_filter(env_filter),
        )
        .with(tracing_error::ErrorLayer::default())
        .try_init();

    if let Err(err) = installed {
        warn!("tracing subscriber already installed: {err}");
    }
    if let Some((path, err)) = chrome_error {
        warn!(
            "failed to initialise chrome trace writer at {}: {err}",
            path.display()
        );
    }

    TelemetryGuard {
        chrome_trace_path: chrome_guard.as_ref().and(opts.chrome_trace_path.clone()),
        chrome_guard,
    }
}

/// Ensure the global metrics recorder is installed and return the Prometheus handle.
pub(crate) fn init_metrics_recorder() -> Option<&'static PrometheusHandle> {
    if let Some(handle) = PROM_HANDLE.get() {
        return Some(handle);
    }

    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();
    if let Err(err) = metrics::set_global_recorder(recorder) {
        warn!("metrics recorder already installed: {err}");
        return None;
    }

    let upkeep_handle = handle.clone();
    let spawned = thread::Builder::new()
        .name("prometheus-upkeep".into())
        .spawn(move || {
            loop {
                thread::sleep(PROM_UPKEEP_INTERVAL);
                upkeep_handle.run_upkeep();
            }
        });
    match spawned {
        Ok(upkeep) => {
            let _ = PROM_UPKEEP_THREAD.set(upkeep);
        }
        Err(err) => warn!("failed to spawn prometheus upkeep thread: {err}"),
    }

    Some(PROM_HANDLE.get_or_init(|| handle))
}

/// Render the current metrics snapshot in the Prometheus text format.
pub(crate) fn render_metrics() -> Option<String> {
    PROM_HANDLE.get().map(PrometheusHandle::render)
}

fn build_chrome_layer(
    path: &Path,
) -> io::Result<(
    tracing_chrome::ChromeLayer<tracing_subscriber::Registry>,
    tracing_chrome::FlushGuard,
)> {
    let file = File::create(path)?;
    let (layer, guard) = tracing_chrome::ChromeLayerBuilder::new()
        .writer(file)
        .include_args(true)
        .trace_style(tracing_chrome::TraceStyle::Async)
        .build();
    Ok((layer, guard))
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(guard) = self.chrome_guard.take() {
            guard.flush();
            drop(guard);
            if let Some(path) = self.chrome_trace_path.as_ref() {
                eprintln!("chrome trace written to {}", path.display());
            }
        }
    }
}
