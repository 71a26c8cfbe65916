//! Simulated MDP3 hardware for tests.
use std::{
    collections::{HashMap, HashSet},
    sync::{Condvar, Mutex},
    time::{Duration, Instant},
};

use embedded_hal_async::delay::DelayNs;

use crate::{
    dma::{DmaChannel, DmaEngine},
    irq::{InterruptController, Irq, IrqError, IrqHandler},
    regs::{offset, Registers},
    Mdp,
};

const TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) fn trace_init() {
    use tracing_subscriber::{
        filter::{EnvFilter, LevelFilter},
        prelude::*,
    };
    let env = std::env::var("RUST_LOG").unwrap_or_default();
    let builder = EnvFilter::builder().with_default_directive(LevelFilter::INFO.into());
    let filter = if env.is_empty() {
        builder.parse("mdp3=debug").unwrap()
    } else {
        builder.parse_lossy(env)
    };

    let _res = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .with_thread_names(true)
        .without_time()
        .finish()
        .try_init();
}

/// Fake MDP3 hardware. Everything in it is leaked, so engines built on it can
/// register themselves as `'static` interrupt handlers.
pub(crate) struct Harness {
    pub(crate) regs: &'static FakeRegs,
    pub(crate) irq: &'static FakeIrq,
    pub(crate) mdp: Mdp,
}

impl Harness {
    pub(crate) fn new() -> Self {
        trace_init();
        let regs: &'static FakeRegs = Box::leak(Box::default());
        let irq: &'static FakeIrq = Box::leak(Box::default());
        Self {
            regs,
            irq,
            mdp: Mdp::new(regs, irq),
        }
    }

    pub(crate) fn engine(&self, channel: DmaChannel) -> &'static DmaEngine {
        Box::leak(Box::new(DmaEngine::new(self.mdp, channel)))
    }
}

/// Polls `cond` until it holds, panicking after a few seconds.
#[track_caller]
pub(crate) fn wait_for(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + TIMEOUT;
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// A register file that remembers every write.
#[derive(Default)]
pub(crate) struct FakeRegs {
    state: Mutex<RegState>,
}

#[derive(Default)]
struct RegState {
    values: HashMap<u32, u32>,
    log: Vec<(u32, u32)>,
    /// `DISPLAY_STATUS` reads as this value for `busy_reads` more reads, then
    /// as zero.
    busy_status: u32,
    busy_reads: usize,
    status_reads: usize,
}

impl FakeRegs {
    /// The last value written to `offset`.
    pub(crate) fn get(&self, offset: u32) -> Option<u32> {
        self.state.lock().unwrap().values.get(&offset).copied()
    }

    /// Presets a register, as if the hardware had updated it.
    pub(crate) fn set(&self, offset: u32, value: u32) {
        self.state.lock().unwrap().values.insert(offset, value);
    }

    pub(crate) fn writes(&self) -> Vec<(u32, u32)> {
        self.state.lock().unwrap().log.clone()
    }

    pub(crate) fn writes_to(&self, offset: u32) -> Vec<u32> {
        self.state
            .lock()
            .unwrap()
            .log
            .iter()
            .filter(|&&(off, _)| off == offset)
            .map(|&(_, value)| value)
            .collect()
    }

    /// Makes `DISPLAY_STATUS` report `status` for the next `reads` reads.
    pub(crate) fn hold_status(&self, status: u32, reads: usize) {
        let mut state = self.state.lock().unwrap();
        state.busy_status = status;
        state.busy_reads = reads;
    }

    pub(crate) fn status_reads(&self) -> usize {
        self.state.lock().unwrap().status_reads
    }
}

impl Registers for FakeRegs {
    fn read(&self, offset: u32) -> u32 {
        let mut state = self.state.lock().unwrap();
        if offset == offset::DISPLAY_STATUS {
            state.status_reads += 1;
            if state.busy_reads == 0 {
                return 0;
            }
            state.busy_reads -= 1;
            return state.busy_status;
        }
        state.values.get(&offset).copied().unwrap_or(0)
    }

    fn write(&self, offset: u32, value: u32) {
        let mut state = self.state.lock().unwrap();
        state.values.insert(offset, value);
        state.log.push((offset, value));
    }
}

/// An interrupt controller whose interrupts are raised by the test.
#[derive(Default)]
pub(crate) struct FakeIrq {
    state: Mutex<IrqState>,
    changed: Condvar,
}

#[derive(Default)]
struct IrqState {
    handlers: HashMap<Irq, &'static dyn IrqHandler>,
    enabled: HashSet<Irq>,
    enables: HashMap<Irq, usize>,
    disables: HashMap<Irq, usize>,
    rejected: HashSet<Irq>,
}

impl FakeIrq {
    /// Raises `irq`, calling its handler if the source is unmasked. Returns
    /// whether a handler ran.
    pub(crate) fn fire(&self, irq: Irq) -> bool {
        let handler = {
            let state = self.state.lock().unwrap();
            if !state.enabled.contains(&irq) {
                return false;
            }
            state.handlers.get(&irq).copied()
        };
        match handler {
            Some(handler) => {
                handler.handle_irq(irq);
                true
            }
            None => false,
        }
    }

    pub(crate) fn is_enabled(&self, irq: Irq) -> bool {
        self.state.lock().unwrap().enabled.contains(&irq)
    }

    pub(crate) fn has_handler(&self, irq: Irq) -> bool {
        self.state.lock().unwrap().handlers.contains_key(&irq)
    }

    /// Number of `enable` calls for `irq`.
    pub(crate) fn enables(&self, irq: Irq) -> usize {
        self.state.lock().unwrap().enables.get(&irq).copied().unwrap_or(0)
    }

    /// Number of `disable` and `disable_nosync` calls for `irq`.
    pub(crate) fn disables(&self, irq: Irq) -> usize {
        self.state
            .lock()
            .unwrap()
            .disables
            .get(&irq)
            .copied()
            .unwrap_or(0)
    }

    /// Waits until `irq` has been enabled at least `count` times in total.
    #[track_caller]
    pub(crate) fn wait_enables(&self, irq: Irq, count: usize) {
        let state = self.state.lock().unwrap();
        let (_state, timeout) = self
            .changed
            .wait_timeout_while(state, TIMEOUT, |state| {
                state.enables.get(&irq).copied().unwrap_or(0) < count
            })
            .unwrap();
        assert!(
            !timeout.timed_out(),
            "timed out waiting for {irq} to be enabled {count} times"
        );
    }

    /// Makes `set_callback` fail for `irq`.
    pub(crate) fn reject(&self, irq: Irq) {
        self.state.lock().unwrap().rejected.insert(irq);
    }

    fn mask(&self, irq: Irq) {
        let mut state = self.state.lock().unwrap();
        state.enabled.remove(&irq);
        *state.disables.entry(irq).or_default() += 1;
        self.changed.notify_all();
    }
}

impl InterruptController for FakeIrq {
    fn set_callback(&self, irq: Irq, handler: &'static dyn IrqHandler) -> Result<(), IrqError> {
        let mut state = self.state.lock().unwrap();
        if state.rejected.contains(&irq) {
            return Err(IrqError::Rejected(irq));
        }
        state.handlers.insert(irq, handler);
        Ok(())
    }

    fn enable(&self, irq: Irq) {
        let mut state = self.state.lock().unwrap();
        state.enabled.insert(irq);
        *state.enables.entry(irq).or_default() += 1;
        self.changed.notify_all();
    }

    fn disable(&self, irq: Irq) {
        self.mask(irq);
    }

    fn disable_nosync(&self, irq: Irq) {
        self.mask(irq);
    }
}

/// A delay that returns immediately, recording how long it was asked to wait.
#[derive(Debug, Default)]
pub(crate) struct NoDelay {
    pub(crate) total_ns: u64,
    pub(crate) calls: usize,
}

impl DelayNs for NoDelay {
    async fn delay_ns(&mut self, ns: u32) {
        self.total_ns += u64::from(ns);
        self.calls += 1;
    }
}

/// Returns the start register for `channel`.
pub(crate) fn start_reg(channel: DmaChannel) -> u32 {
    match channel {
        DmaChannel::Primary => offset::DMA_P_START,
        DmaChannel::Secondary => offset::DMA_S_START,
        DmaChannel::External => unreachable!("DMA_E has no start register"),
    }
}
