use crate::cli::{actions::Action, commands, dispatch::handler};
use anyhow::Result;
use tracing_subscriber::{EnvFilter, Registry, fmt, layer::SubscriberExt};

const fn verbosity_to_level(verbosity: u8) -> tracing::Level {
    match verbosity {
        0 => tracing::Level::ERROR,
        1 => tracing::Level::WARN,
        2 => tracing::Level::INFO,
        3 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    }
}

/// `RUST_LOG` refines the `-v` default per target.
fn init_tracing(verbosity: u8) -> Result<()> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(verbosity_to_level(verbosity).into())
        .from_env_lossy();

    let fmt_layer = fmt::layer()
        .with_file(true)
        .with_line_number(true)
        .with_thread_ids(true)
        .with_target(false);

    let subscriber = Registry::default().with(fmt_layer).with(env_filter);
    tracing::subscriber::set_global_default(subscriber)?;

    Ok(())
}

/// Parse arguments, initialize tracing, and return the action to run.
///
/// # Errors
/// Returns an error if a tracing subscriber is already installed or the
/// arguments do not dispatch to a known action.
pub fn start() -> Result<Action> {
    let matches = commands::new().get_matches();

    init_tracing(matches.get_one::<u8>("verbosity").copied().unwrap_or(0))?;

    handler(&matches)
}

#[cfg(test)]
mod tests {
    use super::verbosity_to_level;

    #[test]
    fn verbosity_maps_to_levels() {
        assert_eq!(verbosity_to_level(0), tracing::Level::ERROR);
        assert_eq!(verbosity_to_level(2), tracing::Level::INFO);
        assert_eq!(verbosity_to_level(9), tracing::Level::TRACE);
    }
}
