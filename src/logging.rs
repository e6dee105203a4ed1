use crate::LoggingSettings;
use anyhow::{anyhow, Context, Result};
use simplelog::{
    ColorChoice, CombinedLogger, ConfigBuilder, LevelFilter, SharedLogger, TermLogger,
    TerminalMode, WriteLogger,
};
use std::fs::File;
use time::macros::format_description;

/// Install the global logger: the terminal, plus a file when one is configured.
pub fn init_logging(settings: &LoggingSettings) -> Result<()> {
    let level: LevelFilter = settings
        .level
        .parse()
        .map_err(|_| anyhow!("bad log level '{}'", settings.level))?;
    let config = ConfigBuilder::new()
        .set_time_format_custom(format_description!(
            "[hour]:[minute]:[second].[subsecond digits:3]"
        ))
        .build();

    let mut loggers: Vec<Box<dyn SharedLogger>> = vec![TermLogger::new(
        level,
        config.clone(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )];
    if let Some(path) = &settings.file {
        let file = File::create(path)
            .with_context(|| format!("cannot create log file {}", path.display()))?;
        loggers.push(WriteLogger::new(level, config, file));
    }
    CombinedLogger::init(loggers).context("a logger is already installed")?;
    Ok(())
}
