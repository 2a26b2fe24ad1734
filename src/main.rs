//! crosstest CLI entry point

fn main() {
    // Logging honours CROSSTEST_DEBUG before any config file is read
    let config = crosstest::CrossTestConfig::default().with_env().unwrap_or_default();
    crosstest::logging::init(&config);

    crosstest::cli::run();
}
