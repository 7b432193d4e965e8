//! Startup banner: version, config source, and the handful of settings
//! that matter most to someone watching the process come up (listen
//! address, data directory, interception scope).

use crate::config::{Config, VERSION};

mod colors {
    pub const RESET: &str = "\x1b[0m";
    pub const BOLD: &str = "\x1b[1m";
    pub const DIM: &str = "\x1b[2m";
    pub const CYAN: &str = "\x1b[36m";
    pub const GREEN: &str = "\x1b[32m";
}

/// Print the startup banner before the accept loop begins.
pub fn print_startup(config: &Config) {
    use colors::*;

    println!();
    println!("  {BOLD}{CYAN}Langley{RESET} {DIM}v{VERSION}{RESET}");
    println!("  {DIM}Observability proxy for LLM API traffic{RESET}");
    println!();

    match Config::config_path() {
        Some(path) if path.exists() => println!("  {DIM}Config:{RESET} {GREEN}\u{2713}{RESET} {}", path.display()),
        _ => println!("  {DIM}Config:{RESET} {DIM}(using defaults){RESET}"),
    }
    println!("  {DIM}Data dir:{RESET} {}", config.data_dir.display());
    println!();

    println!("  {DIM}Listening on{RESET} {BOLD}{}{RESET}", config.proxy.listen);
    if config.proxy.intercept_hosts.is_empty() {
        println!("  {DIM}Intercepting:{RESET} built-in providers only");
    } else {
        println!("  {DIM}Intercepting:{RESET} built-in providers + {}", config.proxy.intercept_hosts.join(", "));
    }
    println!();
}

/// Mirror the banner into the log stream, so the same facts are visible
/// in headless/file-logged runs that never render the banner to a tty.
pub fn log_startup(config: &Config) {
    tracing::info!("langley v{VERSION} starting");
    tracing::info!(listen = %config.proxy.listen, data_dir = %config.data_dir.display(), "proxy configured");
    if !config.proxy.intercept_hosts.is_empty() {
        tracing::info!(hosts = ?config.proxy.intercept_hosts, "additional intercept hosts configured");
    }
}
