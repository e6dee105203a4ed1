mod tui;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use handel::{params, CollectMode, Conf, Controller, Handel, SimulatedFalconX};
use log::info;
use std::path::PathBuf;
use std::time::Duration;
use tui::{Status, StatusExit};

const FILE_TYPE: &str = "handel_ini";

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Driver settings (TOML)
    #[arg(short, long, global = true)]
    settings: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Load a configuration, start the system, dump its values and end it
    Check { ini: PathBuf },
    /// Run an acquisition against the simulated backend
    Acquire {
        ini: PathBuf,
        #[arg(short, long, value_enum, default_value_t = Mode::Mca)]
        mode: Mode,
        #[arg(long, default_value_t = 10)]
        seconds: u64,
        /// Record frames to this HDF5 file
        #[cfg(feature = "hdf5")]
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Load a configuration and save it again
    Convert { input: PathBuf, output: PathBuf },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Mode {
    Mca,
    McaMapping,
    ScaMapping,
    ListMapping,
}

impl From<Mode> for CollectMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Mca => CollectMode::Mca,
            Mode::McaMapping => CollectMode::McaMapping,
            Mode::ScaMapping => CollectMode::ScaMapping,
            Mode::ListMapping => CollectMode::ListMapping,
        }
    }
}

fn load(ini: &PathBuf) -> Result<Handel> {
    let mut handel = Handel::new().with_backend(SimulatedFalconX::default());
    handel
        .load_system(FILE_TYPE, ini)
        .with_context(|| format!("loading {}", ini.display()))?;
    Ok(handel)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let conf = Conf::load(cli.settings.as_deref()).context("reading driver settings")?;
    handel::init_logging(&conf.logging)?;

    match cli.command {
        Commands::Check { ini } => {
            let mut handel = load(&ini)?;
            handel.start_system()?;
            params::log_all(&mut handel);
            handel.end_system()?;
            info!(
                "{}: {} modules, {} detChans",
                ini.display(),
                handel.num_modules(),
                handel.channels().singles().len()
            );
        }
        Commands::Acquire {
            ini,
            mode,
            seconds,
            #[cfg(feature = "hdf5")]
            output,
        } => {
            let mut handel = load(&ini)?;
            handel.start_system()?;
            params::log_all(&mut handel);

            let mode = CollectMode::from(mode);
            let mut controller = Controller::new(handel.into_shared(), conf.clone());
            controller.start_acquisition(mode)?;

            let mut status = Status::new(mode, Duration::from_secs(seconds));
            #[cfg(feature = "hdf5")]
            {
                status.output = output.map(|path| (path, conf.polling.frame_mode));
            }
            let mut terminal = ratatui::init();
            let result = status.run(&mut terminal, &mut controller);
            ratatui::restore();
            let exit = result?;

            let counter = controller.counters()?;
            info!(
                "acquisition ended ({exit:?}): {} buffers, {} pixels, {} frames, {:.2} MB/s average",
                counter.buffer_counter,
                counter.pixels,
                status.frames,
                counter.average_rate()
            );
            controller.shutdown()?;
            if exit == StatusExit::Quit {
                info!("stopped by user");
            }
        }
        Commands::Convert { input, output } => {
            let handel = load(&input)?;
            handel
                .save_system(FILE_TYPE, &output)
                .with_context(|| format!("writing {}", output.display()))?;
            info!("{} -> {}", input.display(), output.display());
        }
    }
    Ok(())
}
