//! Tracing setup
//!
//! Logs go to stderr. Set `LOG_FORMAT=json` for structured output; `RUST_LOG`
//! overrides the verbosity picked from the command line.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Default filter directive for a `-v` count
pub fn default_directive(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "mcp_supervisor=info,mcp_supervisor::connection=warn",
        1 => "mcp_supervisor=info",
        2 => "mcp_supervisor=debug",
        _ => "mcp_supervisor=trace",
    }
}

/// Initialize the global subscriber
///
/// Returns an error if a subscriber is already installed or `RUST_LOG`
/// contains an unparseable directive.
pub fn init_tracing(verbosity: u8) -> anyhow::Result<()> {
    let filter = match std::env::var("RUST_LOG") {
        Ok(env) if !env.is_empty() => EnvFilter::try_new(env)?,
        _ => EnvFilter::try_new(default_directive(verbosity))?,
    };

    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);

    if use_json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .try_init()?;
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_ansi(false),
            )
            .try_init()?;
    }

    Ok(())
}
