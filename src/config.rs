use confique::Config;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Run-control settings of the driver itself. The hardware configuration
/// lives in the `handel_ini` file instead.
#[derive(Config, Debug, Clone)]
pub struct Conf {
    #[config(nested)]
    pub polling: PollingSettings,
    #[config(nested)]
    pub logging: LoggingSettings,
}

#[derive(Config, Debug, Clone)]
pub struct PollingSettings {
    #[config(env = "HANDEL_POLL_TIME_MS", default = 1)]
    pub poll_time_ms: u64,
    #[config(default = "mca_spectra")]
    pub frame_mode: FrameMode,
    /// Publish decoded frames to the frame channel.
    #[config(default = true)]
    pub array_callbacks: bool,
    /// Polls allowed while waiting for switched list-mode buffers to fill.
    #[config(default = 10000)]
    pub switch_spin_limit: u32,
    /// Stop a mapping run after this many pixels; 0 runs until stopped.
    #[config(default = 0)]
    pub pixels_per_run: u32,
}

#[derive(Config, Debug, Clone)]
pub struct LoggingSettings {
    #[config(env = "HANDEL_LOG_LEVEL", default = "info")]
    pub level: String,
    pub file: Option<PathBuf>,
}

#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FrameMode {
    /// One frame per buffer pair holding the raw words of every channel.
    RawBuffers,
    /// One frame per pixel holding the spectrum of every channel.
    McaSpectra,
}

impl Conf {
    /// Load from the environment, then from `path` if given.
    pub fn load(path: Option<&Path>) -> Result<Self, confique::Error> {
        let mut builder = Conf::builder().env();
        if let Some(path) = path {
            builder = builder.file(path);
        }
        builder.load()
    }

    pub fn poll_time(&self) -> Duration {
        Duration::from_millis(self.polling.poll_time_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_apply_without_a_file() {
        let conf = Conf::builder().load().unwrap();
        assert_eq!(conf.polling.poll_time_ms, 1);
        assert_eq!(conf.polling.frame_mode, FrameMode::McaSpectra);
        assert!(conf.polling.array_callbacks);
        assert_eq!(conf.polling.switch_spin_limit, 10000);
        assert_eq!(conf.logging.level, "info");
        assert!(conf.logging.file.is_none());
        assert_eq!(conf.poll_time(), Duration::from_millis(1));
    }

    #[test]
    fn toml_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[polling]\npoll_time_ms = 20\nframe_mode = \"raw_buffers\"\npixels_per_run = 100\n\n[logging]\nfile = \"handel.log\""
        )
        .unwrap();
        let conf = Conf::builder().file(file.path()).load().unwrap();
        assert_eq!(conf.polling.poll_time_ms, 20);
        assert_eq!(conf.polling.frame_mode, FrameMode::RawBuffers);
        assert_eq!(conf.polling.pixels_per_run, 100);
        assert_eq!(conf.logging.file, Some(PathBuf::from("handel.log")));
    }
}
