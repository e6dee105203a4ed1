use crate::channels::ALL_CHANNELS;
use crate::poller::{lock, Command, LiveData, Poller};
use crate::{CollectMode, Conf, Counter, Frame, Result, SharedHandel};
use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// How long `stop_acquisition` waits for the worker to drain.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Owns the polling worker of one started driver and exposes the
/// acquisition-level operations.
pub struct Controller {
    handel: SharedHandel,
    conf: Conf,
    live: Arc<Mutex<LiveData>>,
    commands: Sender<Command>,
    frames: Receiver<Frame>,
    worker: Option<JoinHandle<()>>,
    polling: Arc<AtomicBool>,
    acquiring: Arc<AtomicBool>,
    mode: Option<CollectMode>,
    trace_time: Vec<f64>,
}

impl Controller {
    pub fn new(handel: SharedHandel, conf: Conf) -> Self {
        let live = Arc::new(Mutex::new(LiveData::default()));
        let (tx_commands, rx_commands) = unbounded();
        let (tx_frames, rx_frames) = unbounded();
        let polling = Arc::new(AtomicBool::new(true));
        let acquiring = Arc::new(AtomicBool::new(false));

        let worker = Poller::new(
            Arc::clone(&handel),
            Arc::clone(&live),
            tx_frames,
            rx_commands,
            conf.polling.clone(),
            Arc::clone(&polling),
            Arc::clone(&acquiring),
        )
        .spawn();

        Controller {
            handel,
            conf,
            live,
            commands: tx_commands,
            frames: rx_frames,
            worker: Some(worker),
            polling,
            acquiring,
            mode: None,
            trace_time: Vec::new(),
        }
    }

    pub fn handel(&self) -> &SharedHandel {
        &self.handel
    }

    /// Decoded frames, in acquisition order.
    pub fn frames(&self) -> &Receiver<Frame> {
        &self.frames
    }

    pub fn is_acquiring(&self) -> bool {
        self.acquiring.load(Ordering::SeqCst)
    }

    pub fn start_acquisition(&mut self, mode: CollectMode) -> Result<()> {
        if self.is_acquiring() {
            bail!(IllegalOperation, "an acquisition is already running");
        }
        {
            let mut handel = lock(&self.handel)?;
            let mut mapping_mode = mode.mapping_mode();
            handel.set_acquisition_values(ALL_CHANNELS, "mapping_mode", &mut mapping_mode)?;
            handel.start_run(ALL_CHANNELS, false)?;
        }
        // Flag the run before the worker picks it up so callers never see a gap.
        self.acquiring.store(true, Ordering::SeqCst);
        self.commands
            .send(Command::Start(mode))
            .map_err(|_| err!(Unknown, "the polling worker is gone"))?;
        self.mode = Some(mode);
        info!("{mode:?} acquisition started");
        Ok(())
    }

    /// Stop the run and wait for the worker to read out what is left.
    pub fn stop_acquisition(&mut self) -> Result<()> {
        lock(&self.handel)?.stop_run(ALL_CHANNELS)?;
        self.wait_idle(STOP_TIMEOUT);
        info!("acquisition stopped");
        Ok(())
    }

    /// Block until the worker finishes the current acquisition or `timeout`
    /// runs out. Returns whether it finished.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let started = Instant::now();
        while self.is_acquiring() {
            if started.elapsed() >= timeout {
                warn!("polling worker still busy after {timeout:?}");
                return false;
            }
            thread::sleep(self.conf.poll_time());
        }
        true
    }

    /// Latest spectrum of `det_chan`. Mapping runs serve the last decoded
    /// pixel; MCA runs read the hardware.
    pub fn spectrum(&self, det_chan: i32) -> Result<Vec<u32>> {
        if self.mode.is_some_and(CollectMode::is_mapping) {
            let live = self
                .live
                .lock()
                .map_err(|_| err!(Unknown, "the live data lock is poisoned"))?;
            return live
                .spectrum(det_chan)
                .map(<[u32]>::to_vec)
                .ok_or_else(|| err!(InvalidDetChan, "detChan {det_chan} has no spectrum"));
        }
        lock(&self.handel)?.get_run_data(det_chan, "mca")?.into_counts()
    }

    pub fn counters(&self) -> Result<Counter> {
        let live = self
            .live
            .lock()
            .map_err(|_| err!(Unknown, "the live data lock is poisoned"))?;
        Ok(live.counter.clone())
    }

    /// Program SCA windows on `det_chan`. Windows past the hardware limit are
    /// dropped and an inverted window collapses to its low edge. A running
    /// acquisition is stopped for the change and restarted after.
    pub fn configure_scas(&mut self, det_chan: i32, windows: &[(u32, u32)]) -> Result<()> {
        let restart = if self.is_acquiring() { self.mode } else { None };
        if restart.is_some() {
            self.stop_acquisition()?;
        }

        {
            let mut handel = lock(&self.handel)?;
            let first = first_single(&handel, det_chan)?;
            let max = handel.get_acquisition_values(first, "max_number_of_scas")?;
            let count = windows.len().min(max as usize);
            if count < windows.len() {
                warn!(
                    "detChan {det_chan}: {} SCA windows requested, hardware allows {count}",
                    windows.len()
                );
            }
            let mut n = count as f64;
            handel.set_acquisition_values(det_chan, "number_of_scas", &mut n)?;
            for (i, &(lo, hi)) in windows.iter().take(count).enumerate() {
                let hi = hi.max(lo);
                let mut lo = f64::from(lo);
                let mut hi = f64::from(hi);
                handel.set_acquisition_values(det_chan, &format!("sca{i}_lo"), &mut lo)?;
                handel.set_acquisition_values(det_chan, &format!("sca{i}_hi"), &mut hi)?;
                debug!("detChan {det_chan}: SCA {i} = [{lo}, {hi}]");
            }
        }

        if let Some(mode) = restart {
            self.start_acquisition(mode)?;
        }
        Ok(())
    }

    /// Capture an ADC trace of `points` samples. Returns the samples and the
    /// sample times in microseconds.
    pub fn get_trace(&mut self, det_chan: i32, points: usize) -> Result<(Vec<u32>, &[f64])> {
        let (trace, clock_mhz) = {
            let mut handel = lock(&self.handel)?;
            handel.do_special_run(det_chan, "adc_trace", &[points as f64])?;
            let trace = handel
                .get_special_run_data(det_chan, "adc_trace")?
                .into_counts()?;
            let clock_mhz = handel.get_acquisition_values(det_chan, "clock_speed")?;
            (trace, clock_mhz)
        };
        if clock_mhz <= 0.0 {
            bail!(BadValue, "detChan {det_chan}: clock speed is {clock_mhz} MHz");
        }
        if self.trace_time.len() != points {
            self.trace_time = (0..points).map(|i| i as f64 / clock_mhz).collect();
        }
        Ok((trace, &self.trace_time))
    }

    /// Stop the worker and end the system.
    pub fn shutdown(&mut self) -> Result<()> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        self.polling.store(false, Ordering::SeqCst);
        let _ = self.commands.send(Command::Shutdown);
        thread::sleep(2 * self.conf.poll_time());
        if worker.join().is_err() {
            warn!("polling worker panicked");
        }
        lock(&self.handel)?.end_system()
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!("shutdown failed: {e}");
        }
    }
}

fn first_single(handel: &crate::Handel, det_chan: i32) -> Result<i32> {
    handel
        .channels()
        .resolve(det_chan)?
        .first()
        .copied()
        .ok_or_else(|| err!(NoDetChans, "detChan {det_chan} has no members"))
}
