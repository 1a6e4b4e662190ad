/// Maps `-v` occurrences to a filter: info by default, then debug, then
/// trace (which includes per-packet dumps).
pub fn init(verbose: u8) {
    let level = match verbose {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    let _ = env_logger::Builder::from_default_env()
        .filter_level(level)
        .format_timestamp_millis()
        .try_init();
}
