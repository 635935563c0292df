use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Fmt logging for the sim. Targets stay visible so relay lines
/// (`stillpoint.relay`) and engine lines (`stillpoint.sync`) can be told
/// apart when several peers share one process.
pub fn init_tracing(filter: &str) {
    let env_filter = EnvFilter::try_new(filter)
        .unwrap_or_else(|_| EnvFilter::new("info,stillpoint.sync=debug"));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_target(true)
        .with_thread_ids(false);
    Registry::default().with(env_filter).with(fmt_layer).init();
}
