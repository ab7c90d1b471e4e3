use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "CONCILIAR_LOG";

/// Installs the stderr subscriber. `CONCILIAR_LOG` wins over `fallback`;
/// `verbose` forces `debug` regardless of both.
pub fn init(fallback: &str, verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_env(LOG_ENV)
            .or_else(|_| EnvFilter::try_new(fallback))
            .unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .try_init()
        .ok();
}
