use simplelog::*;

/// Install the stderr logger of the coordinator binary.
pub fn init(verbose: bool) {
    let level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    // stdout belongs to the fuzzing engine's pipes, so log to stderr only.
    CombinedLogger::init(vec![WriteLogger::new(
        level,
        Config::default(),
        std::io::stderr(),
    )])
    .unwrap_or_else(|e| eprintln!("logger already installed: {}", e));
}
