use anyhow::Result;
use crossbeam_channel::tick;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind};
use handel::{CollectMode, Controller, Counter};
use ratatui::{
    buffer::Buffer,
    layout::Rect,
    style::Stylize,
    symbols::border,
    text::{Line, Text},
    widgets::{Block, Paragraph, Widget},
    DefaultTerminal, Frame,
};
use std::time::{Duration, Instant};

#[cfg(feature = "hdf5")]
use handel::{FrameData, FrameMode, FrameWriter};
#[cfg(feature = "hdf5")]
use std::path::PathBuf;

/// Frames a recording file is sized for.
#[cfg(feature = "hdf5")]
const MAX_RECORDED_FRAMES: usize = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusExit {
    Quit,
    Timeout,
    Finished,
}

/// Live view of one acquisition.
pub struct Status {
    pub counter: Counter,
    pub t_begin: Instant,
    pub run_duration: Duration,
    pub mode: CollectMode,
    pub frames: usize,
    pub peak: Option<(usize, u32)>,
    pub exit: Option<StatusExit>,
    #[cfg(feature = "hdf5")]
    pub output: Option<(PathBuf, FrameMode)>,
    #[cfg(feature = "hdf5")]
    writer: Option<FrameWriter>,
}

impl Status {
    pub fn new(mode: CollectMode, run_duration: Duration) -> Self {
        Self {
            counter: Counter::default(),
            t_begin: Instant::now(),
            run_duration,
            mode,
            frames: 0,
            peak: None,
            exit: None,
            #[cfg(feature = "hdf5")]
            output: None,
            #[cfg(feature = "hdf5")]
            writer: None,
        }
    }

    /// Redraw four times a second until the run times out, the worker finishes,
    /// or the user quits. The acquisition is stopped on the way out.
    pub fn run(&mut self, terminal: &mut DefaultTerminal, controller: &mut Controller) -> Result<StatusExit> {
        let ticker = tick(Duration::from_millis(250));
        self.t_begin = Instant::now();
        self.exit = None;

        while self.exit.is_none() {
            let _ = ticker.recv();
            self.drain(controller)?;
            self.handle_events()?;

            if !controller.is_acquiring() {
                self.exit = Some(StatusExit::Finished);
            } else if self.t_begin.elapsed() >= self.run_duration {
                self.exit = Some(StatusExit::Timeout);
            }
            terminal.draw(|f| self.draw(f))?;
        }

        if controller.is_acquiring() {
            controller.stop_acquisition()?;
        }
        self.drain(controller)?;
        #[cfg(feature = "hdf5")]
        if let Some(writer) = &mut self.writer {
            writer.flush_all()?;
        }
        Ok(self.exit.unwrap_or(StatusExit::Finished))
    }

    fn drain(&mut self, controller: &Controller) -> Result<()> {
        while let Ok(frame) = controller.frames().try_recv() {
            self.frames += 1;
            #[cfg(feature = "hdf5")]
            self.record(&frame)?;
            #[cfg(not(feature = "hdf5"))]
            let _ = frame;
        }
        self.counter = controller.counters()?;
        let first = controller
            .handel()
            .lock()
            .ok()
            .and_then(|h| h.channels().singles().first().copied());
        if let Some(first) = first {
            if let Ok(spectrum) = controller.spectrum(first) {
                self.peak = spectrum
                    .iter()
                    .enumerate()
                    .max_by_key(|(_, &c)| c)
                    .map(|(bin, &c)| (bin, c));
            }
        }
        Ok(())
    }

    /// Append `frame` to the output file, creating it from the first frame's
    /// shape.
    #[cfg(feature = "hdf5")]
    fn record(&mut self, frame: &handel::Frame) -> Result<()> {
        let Some((path, mode)) = &self.output else {
            return Ok(());
        };
        if self.writer.is_none() {
            let (len, channels) = match &frame.data {
                FrameData::Raw(a) => a.dim(),
                FrameData::Spectra(a) => a.dim(),
            };
            self.writer = Some(FrameWriter::new(path, *mode, channels, len, MAX_RECORDED_FRAMES, 64)?);
        }
        if let Some(writer) = &mut self.writer {
            writer.append(frame)?;
        }
        Ok(())
    }

    fn draw(&self, frame: &mut Frame) {
        frame.render_widget(self, frame.area());
    }

    fn handle_events(&mut self) -> Result<()> {
        if event::poll(Duration::ZERO)? {
            if let Event::Key(key_event) = event::read()? {
                if key_event.kind == KeyEventKind::Press {
                    self.handle_key_event(key_event);
                }
            }
        }
        Ok(())
    }

    fn handle_key_event(&mut self, key_event: KeyEvent) {
        if let KeyCode::Char('q') = key_event.code {
            self.exit = Some(StatusExit::Quit);
        }
    }
}

impl Widget for &Status {
    fn render(self, area: Rect, buf: &mut Buffer) {
        let title = Line::from(format!(" {:?} Acquisition ", self.mode).bold());
        let instructions = Line::from(vec![" Quit ".into(), "<Q> ".blue().bold()]);
        let block = Block::bordered()
            .title(title.centered())
            .title_bottom(instructions.centered())
            .border_set(border::THICK);

        let peak = match self.peak {
            Some((bin, counts)) => format!("bin {bin} ({counts} counts)"),
            None => "-".to_string(),
        };
        let status_text = Text::from(vec![
            Line::from(vec![
                "Elapsed time: ".into(),
                self.t_begin.elapsed().as_secs().to_string().yellow(),
                " s".into(),
                " Buffers: ".into(),
                self.counter.buffer_counter.to_string().yellow(),
                " Pixels: ".into(),
                self.counter.pixels.to_string().yellow(),
                " Frames: ".into(),
                self.frames.to_string().yellow(),
            ]),
            Line::from(vec![
                "Read rate: ".into(),
                format!("{:.2}", self.counter.read_rate).yellow(),
                " MB/s ".into(),
                " Data rate: ".into(),
                format!("{:.2}", self.counter.rate()).yellow(),
                " MB/s ".into(),
                " Peak: ".into(),
                peak.yellow(),
            ]),
        ]);

        Paragraph::new(status_text)
            .centered()
            .block(block)
            .render(area, buf);
    }
}
