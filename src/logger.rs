use log::LevelFilter;
use log4rs::append::rolling_file::RollingFileAppender;
use log4rs::append::rolling_file::policy::compound::{
    CompoundPolicy, roll::fixed_window::FixedWindowRoller, trigger::size::SizeTrigger,
};
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;
use std::path::Path;

/// Initializes logging from a `log4rs.yaml` file in the working directory.
/// Prefer [`configure`] for programmatic control.
pub fn init() -> Result<(), Box<dyn std::error::Error>> {
    let _ = log4rs::init_file("log4rs.yaml", log4rs::config::Deserializers::default());
    Ok(())
}

/// Configures a rolling file log at `{dir}/capturefile.log`.
///
/// - `dir`: base directory for logs; defaults to the current directory.
/// - `level`: error|warn|info|debug|trace (defaults to info).
///
/// # Errors
/// Returns an error if the appender cannot be built or the logger fails to
/// initialize (for example when a logger is already installed).
pub fn configure(dir: Option<&Path>, level: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
    let base = dir.map_or_else(
        || std::env::current_dir().unwrap_or_else(|_| ".".into()),
        Path::to_path_buf,
    );
    let level = match level.unwrap_or("info").to_ascii_lowercase().as_str() {
        "error" => LevelFilter::Error,
        "warn" => LevelFilter::Warn,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        _ => LevelFilter::Info,
    };

    let roller = FixedWindowRoller::builder()
        .build(&format!("{}", base.join("capturefile.{}.log").display()), 7)?;
    let policy =
        CompoundPolicy::new(Box::new(SizeTrigger::new(10 * 1024 * 1024)), Box::new(roller));
    let appender = RollingFileAppender::builder()
        .encoder(Box::new(PatternEncoder::new("{d(%Y-%m-%d %H:%M:%S%.3f)} [{l}] {t} - {m}{n}")))
        .build(base.join("capturefile.log"), Box::new(policy))?;

    let config = Config::builder()
        .appender(Appender::builder().build("file", Box::new(appender)))
        .build(Root::builder().appender("file").build(level))?;
    log4rs::init_config(config)?;
    Ok(())
}
