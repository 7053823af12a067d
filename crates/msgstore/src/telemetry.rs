use tracing_log::LogTracer;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Environment variable checked before `RUST_LOG`.
pub const LOG_ENV: &str = "MSGSTORE_LOG";

/// Filter used when neither environment variable is set. Other crates stay at `warn`.
pub fn default_directive(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn,msgstore=info",
        1 => "warn,msgstore=debug",
        _ => "info,msgstore=trace",
    }
}

/// Install the process-wide subscriber. Events go to stderr so command output on stdout
/// stays clean; `log` records are bridged through `LogTracer`. Repeated calls are no-ops.
pub fn init(verbosity: u8) {
    let _ = LogTracer::init();

    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbosity)));

    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_names(true)
        .compact();

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init();
}

/// Silence all instrumentation so benchmarks measure the store only.
pub fn init_for_benchmarks() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::new("off"))
        .try_init();
}
