//! MDP3 DMA engines.
//!
//! A [`DmaEngine`] owns one of the MDP3's display DMA channels. It programs
//! the channel, hands framebuffer addresses to it, and sequences each hand-off
//! against the frame-boundary ("vsync") and DMA-done interrupts.
//!
//! # Callbacks
//!
//! The engine's interrupt sources are grouped into two [`Callbacks`]
//! categories: `VSYNC` (a frame boundary) and `DMA_DONE` (a command-mode
//! transfer finished). Which hardware source backs each category depends on
//! the output the channel feeds:
//!
//! | output          | `VSYNC`                                   | `DMA_DONE`                |
//! |-----------------|-------------------------------------------|---------------------------|
//! | LCDC, DSI video | [`Irq::LcdcStartOfFrame`]                 | unsupported               |
//! | DSI command     | [`Irq::SyncPrimaryLine`]/[`SyncSecondaryLine`][ssl] | [`Irq::DmaPDone`]/[`DmaSDone`][sd] |
//!
//! A category's bit in the engine's callback set is set exactly when its
//! source is unmasked at the interrupt controller. Arming a category that is
//! already armed, or disarming one that isn't, does nothing.
//!
//! [ssl]: Irq::SyncSecondaryLine
//! [sd]: Irq::DmaSDone
//!
//! # Command mode
//!
//! A command-mode panel has no free-running timing generator: every frame is
//! an explicit transfer, started by writing the channel's start register. Only
//! one transfer may be in flight, so [`DmaEngine::update`] first waits for the
//! previous transfer's DMA-done interrupt if the channel is still busy.
use core::{cell::RefCell, fmt};

use critical_section::Mutex;
use embedded_hal_async::delay::DelayNs;
use mycelium_bitfield::bitfield;
use serde::{Deserialize, Serialize};

use crate::{
    completion::{Completion, Interrupted},
    config::{DmaAddr, OutputConfig, OutputSelect, SourceConfig, StopPoll},
    intf::{IntfError, Panel},
    irq::{Irq, IrqError, IrqHandler},
    regs::{offset, status, DmaConfigWord, Pair16},
    Mdp,
};

mod extended;


pub use self::extended::{
    Ccs, ColorCorrectConfig, CursorBlend, CursorConfig, ExtError, Extended, HistogramConfig,
    HistogramData, HistogramOp, Lut, LutTable, HISTOGRAM_BINS, LUT_LEN,
};

/// The MDP3's DMA channels.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum DmaChannel {
    /// DMA_P. The only channel with the cursor, color correction and
    /// histogram blocks.
    Primary,
    /// DMA_S.
    Secondary,
    /// DMA_E. Present in the channel selector but not supported.
    External,
}

bitfield! {
    /// A set of engine callback categories.
    #[derive(Eq, PartialEq)]
    pub struct Callbacks<u8> {
        /// Frame boundary.
        pub const VSYNC: bool;
        /// Command-mode transfer completion.
        pub const DMA_DONE: bool;
    }
}

/// The lifecycle state of a [`DmaEngine`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EngineState {
    Uninitialized,
    Configured,
    Streaming,
    Stopped,
}

/// Something that wants to hear about every frame boundary.
///
/// `on_vsync` runs in interrupt context. It may call back into the engine
/// (the engine lock is not held), but must not wait.
pub trait VsyncHandler: Sync {
    fn on_vsync(&self);
}

/// A persistent vsync subscriber. Two clients are the same client if they
/// refer to the same handler object.
#[derive(Copy, Clone)]
pub struct VsyncClient(&'static dyn VsyncHandler);

/// A request the engine can't satisfy in its current configuration.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CapabilityError {
    /// The engine has no configured output.
    NotConfigured,
    /// DMA-done callbacks were requested on an output with no DMA-done
    /// interrupt.
    NoDmaDone(OutputSelect),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DmaError {
    Capability(CapabilityError),
    /// A wait was cancelled by [`DmaEngine::cancel_waiters`].
    Interrupted,
    /// The channel did not go quiet while stopping. The engine was stopped
    /// anyway; `status` is the last `DISPLAY_STATUS` read.
    StopTimeout { status: u32 },
    UnsupportedChannel(DmaChannel),
    UnsupportedOutput(OutputSelect),
    InvalidState {
        op: &'static str,
        state: EngineState,
    },
    PanelMismatch {
        engine: OutputSelect,
        panel: OutputSelect,
    },
    Irq(IrqError),
    Panel(IntfError),
}

/// A DMA engine for one MDP3 display channel.
///
/// Engines are meant to live in `static`s (or be leaked): [`DmaEngine::init`]
/// registers the engine itself as the interrupt handler for its sources.
pub struct DmaEngine {
    mdp: Mdp,
    channel: DmaChannel,
    stop_poll: StopPoll,
    inner: Mutex<RefCell<Inner>>,
    /// Signalled by the frame-boundary handler.
    vsync_done: Completion,
    /// Signalled when a command-mode transfer completes.
    dma_done: Completion,
}

struct Inner {
    state: EngineState,
    busy: bool,
    callbacks: Callbacks,
    vsync_client: Option<VsyncClient>,
    session: Option<Session>,
    ext: extended::ExtState,
    /// The completion a caller is currently waiting on, if any.
    waiting: Option<Signal>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Signal {
    FrameBoundary,
    DmaDone,
}

/// Clears [`Inner::waiting`] when a wait ends, including when the waiting
/// future is dropped.
struct Waiting<'engine>(&'engine DmaEngine);

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        let engine = self.0;
        critical_section::with(|cs| {
            if let Some(signal) = engine.inner.borrow_ref_mut(cs).waiting.take() {
                // an interruption the waiter never saw must not fail the next
                // wait.
                engine.completion(signal).withdraw_interrupt();
            }
        });
    }
}

/// What `init` programmed.
struct Session {
    bank: Bank,
    sources: Sources,
    source: SourceConfig,
    output: OutputConfig,
}

/// A channel's register bank.
#[derive(Copy, Clone, Debug)]
struct Bank {
    base: u32,
    start: u32,
    rd_ptr_irq: u32,
    /// `DISPLAY_STATUS` bits that are set while the channel is fetching.
    active: u32,
}

/// The interrupt sources backing each callback category.
#[derive(Copy, Clone, Debug)]
struct Sources {
    vsync: Irq,
    dma_done: Option<Irq>,
}

/// `DMA_P_FETCH_CFG` with a max burst size of 4; larger bursts can hang the
/// MDP.
const FETCH_CFG: u32 = 0x20;
/// Read-pointer line interrupt position.
const RD_PTR_IRQ_LINE: u32 = 0x10;

// === impl DmaChannel ===

impl DmaChannel {
    const fn bank(self) -> Option<Bank> {
        match self {
            Self::Primary => Some(Bank {
                base: offset::DMA_P_BASE,
                start: offset::DMA_P_START,
                rd_ptr_irq: offset::PRIMARY_RD_PTR_IRQ,
                active: status::DMA_P_ACTIVE,
            }),
            Self::Secondary => Some(Bank {
                base: offset::DMA_S_BASE,
                start: offset::DMA_S_START,
                rd_ptr_irq: offset::SECONDARY_RD_PTR_IRQ,
                active: status::DMA_S_ACTIVE,
            }),
            Self::External => None,
        }
    }
}

impl fmt::Display for DmaChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Primary => "DMA_P",
            Self::Secondary => "DMA_S",
            Self::External => "DMA_E",
        };
        f.write_str(name)
    }
}

// === impl Callbacks ===

impl Callbacks {
    #[must_use]
    pub fn vsync() -> Self {
        Self::new().with(Self::VSYNC, true)
    }

    #[must_use]
    pub fn dma_done() -> Self {
        Self::new().with(Self::DMA_DONE, true)
    }

    #[must_use]
    pub fn all() -> Self {
        Self::vsync().union(Self::dma_done())
    }

    #[must_use]
    pub fn union(self, other: Self) -> Self {
        Self::from_bits(self.bits() | other.bits())
    }

    #[must_use]
    pub fn intersection(self, other: Self) -> Self {
        Self::from_bits(self.bits() & other.bits())
    }

    /// Returns the categories in `self` that are not in `other`.
    #[must_use]
    pub fn difference(self, other: Self) -> Self {
        Self::from_bits(self.bits() & !other.bits())
    }

    #[must_use]
    pub fn is_empty(self) -> bool {
        self.bits() == 0
    }
}

// === impl Sources ===

impl Sources {
    fn new(channel: DmaChannel, out_sel: OutputSelect) -> Option<Self> {
        match (out_sel, channel) {
            (OutputSelect::Lcdc | OutputSelect::DsiVideo, _) => Some(Self {
                vsync: Irq::LcdcStartOfFrame,
                dma_done: None,
            }),
            (OutputSelect::DsiCmd, DmaChannel::Primary) => Some(Self {
                vsync: Irq::SyncPrimaryLine,
                dma_done: Some(Irq::DmaPDone),
            }),
            (OutputSelect::DsiCmd, DmaChannel::Secondary) => Some(Self {
                vsync: Irq::SyncSecondaryLine,
                dma_done: Some(Irq::DmaSDone),
            }),
            _ => None,
        }
    }

    /// The categories this output can arm.
    fn supported(&self) -> Callbacks {
        Callbacks::new()
            .with(Callbacks::VSYNC, true)
            .with(Callbacks::DMA_DONE, self.dma_done.is_some())
    }

    /// The sources backing the categories in `set`.
    fn each(self, set: Callbacks) -> impl Iterator<Item = Irq> {
        let vsync = set.get(Callbacks::VSYNC).then_some(self.vsync);
        let dma_done = self.dma_done.filter(|_| set.get(Callbacks::DMA_DONE));
        vsync.into_iter().chain(dma_done)
    }

    fn category(&self, irq: Irq) -> Callbacks {
        if Some(irq) == self.dma_done {
            Callbacks::dma_done()
        } else {
            Callbacks::vsync()
        }
    }
}

// === impl Inner ===

impl Inner {
    const fn new() -> Self {
        Self {
            state: EngineState::Uninitialized,
            busy: false,
            callbacks: Callbacks::new(),
            vsync_client: None,
            session: None,
            ext: extended::ExtState::new(),
            waiting: None,
        }
    }

    /// Forgets the session. Nothing may be armed at the controller.
    fn reset(&mut self) {
        self.state = EngineState::Uninitialized;
        self.busy = false;
        self.callbacks = Callbacks::new();
        self.vsync_client = None;
        self.session = None;
        self.ext = extended::ExtState::new();
    }

    fn session(&self) -> Result<&Session, DmaError> {
        self.session
            .as_ref()
            .ok_or(DmaError::Capability(CapabilityError::NotConfigured))
    }

    fn expect_state(&self, op: &'static str, expected: EngineState) -> Result<(), DmaError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(DmaError::InvalidState {
                op,
                state: self.state,
            })
        }
    }

    /// Checks that the current output can arm `set`, returning the sources to
    /// use.
    fn sources_for(&self, set: Callbacks) -> Result<Sources, DmaError> {
        let session = self.session()?;
        if !set.difference(session.sources.supported()).is_empty() {
            return Err(DmaError::Capability(CapabilityError::NoDmaDone(
                session.output.out_sel,
            )));
        }
        Ok(session.sources)
    }

    fn is_command_mode(&self) -> bool {
        self.session
            .as_ref()
            .map(|s| s.output.out_sel.is_command_mode())
            .unwrap_or(false)
    }
}

// === impl DmaEngine ===

impl DmaEngine {
    #[must_use]
    pub const fn new(mdp: Mdp, channel: DmaChannel) -> Self {
        Self::with_stop_poll(mdp, channel, StopPoll::DEFAULT)
    }

    #[must_use]
    pub const fn with_stop_poll(mdp: Mdp, channel: DmaChannel, stop_poll: StopPoll) -> Self {
        Self {
            mdp,
            channel,
            stop_poll,
            inner: Mutex::new(RefCell::new(Inner::new())),
            vsync_done: Completion::new(),
            dma_done: Completion::new(),
        }
    }

    #[must_use]
    pub fn channel(&self) -> DmaChannel {
        self.channel
    }

    #[must_use]
    pub fn state(&self) -> EngineState {
        critical_section::with(|cs| self.inner.borrow_ref(cs).state)
    }

    /// Returns `true` while a command-mode transfer is in flight.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        critical_section::with(|cs| self.inner.borrow_ref(cs).busy)
    }

    /// Returns the currently armed callback categories.
    #[must_use]
    pub fn callbacks(&self) -> Callbacks {
        critical_section::with(|cs| self.inner.borrow_ref(cs).callbacks)
    }

    /// Returns the source configuration, with `buf` set to the buffer most
    /// recently handed to the hardware.
    #[must_use]
    pub fn source(&self) -> Option<SourceConfig> {
        critical_section::with(|cs| {
            let inner = self.inner.borrow_ref(cs);
            inner.session.as_ref().map(|s| s.source.clone())
        })
    }

    #[must_use]
    pub fn output(&self) -> Option<OutputConfig> {
        critical_section::with(|cs| {
            let inner = self.inner.borrow_ref(cs);
            inner.session.as_ref().map(|s| s.output.clone())
        })
    }

    /// Returns the primary channel's cursor, color correction and histogram
    /// controls. `None` on the other channels.
    #[must_use]
    pub fn extended(&self) -> Option<Extended<'_>> {
        (self.channel == DmaChannel::Primary).then(|| Extended::new(self))
    }

    /// Programs the channel and registers the engine's interrupt handlers.
    ///
    /// Anything armed by a previous session is disarmed first, and the vsync
    /// subscriber is cleared. If registering a handler fails, the previous
    /// session is forgotten as well (the channel registers were already
    /// rewritten) and the engine is left
    /// [`Uninitialized`](EngineState::Uninitialized) with nothing armed.
    #[tracing::instrument(
        level = tracing::Level::DEBUG,
        skip(self, source, output),
        fields(channel = %self.channel, out_sel = %output.out_sel),
    )]
    pub fn init(&'static self, source: SourceConfig, output: OutputConfig) -> Result<(), DmaError> {
        let bank = self
            .channel
            .bank()
            .ok_or(DmaError::UnsupportedChannel(self.channel))?;
        let sources = Sources::new(self.channel, output.out_sel)
            .ok_or(DmaError::UnsupportedOutput(output.out_sel))?;

        let streaming = critical_section::with(|cs| {
            let inner = self.inner.borrow_ref(cs);
            inner.state == EngineState::Streaming
        });
        if streaming {
            return Err(DmaError::InvalidState {
                op: "init",
                state: EngineState::Streaming,
            });
        }
        self.disarm_all();

        self.write_channel_config(bank, &source, &output);

        let irq = self.mdp.irq();
        for src in sources.each(sources.supported()) {
            if let Err(error) = irq.set_callback(src, self) {
                tracing::warn!(%error, "failed to register interrupt handler");
                critical_section::with(|cs| self.inner.borrow_ref_mut(cs).reset());
                return Err(DmaError::Irq(error));
            }
        }

        critical_section::with(|cs| {
            let mut inner = self.inner.borrow_ref_mut(cs);
            inner.reset();
            inner.session = Some(Session {
                bank,
                sources,
                source,
                output,
            });
            inner.state = EngineState::Configured;
            self.vsync_done.reinit();
            self.dma_done.reinit();
        });

        tracing::debug!(?sources, "DMA engine configured");
        Ok(())
    }

    /// Disarms everything, drops the vsync subscriber and forgets the
    /// configuration.
    #[tracing::instrument(level = tracing::Level::DEBUG, skip(self), fields(channel = %self.channel))]
    pub fn deinit(&self) {
        self.disarm_all();
        critical_section::with(|cs| self.inner.borrow_ref_mut(cs).reset());
        // wake anyone still waiting on a transfer that will never be
        // acknowledged now.
        self.dma_done.complete();
    }

    /// Arms each category in `callbacks` that isn't armed already.
    pub fn enable_callbacks(&self, callbacks: Callbacks) -> Result<(), DmaError> {
        let (sources, arm) = critical_section::with(|cs| {
            let mut inner = self.inner.borrow_ref_mut(cs);
            let sources = inner.sources_for(callbacks)?;
            let arm = callbacks.difference(inner.callbacks);
            inner.callbacks = inner.callbacks.union(arm);
            Ok::<_, DmaError>((sources, arm))
        })
        .map_err(|error| {
            tracing::warn!(channel = %self.channel, ?callbacks, %error, "can't enable callbacks");
            error
        })?;

        let irq = self.mdp.irq();
        for src in sources.each(arm) {
            tracing::trace!(%src, "unmask");
            irq.enable(src);
        }
        Ok(())
    }

    /// Disarms each category in `callbacks` that is currently armed.
    pub fn disable_callbacks(&self, callbacks: Callbacks) -> Result<(), DmaError> {
        let (sources, disarm) = critical_section::with(|cs| {
            let mut inner = self.inner.borrow_ref_mut(cs);
            let sources = inner.sources_for(callbacks)?;
            let disarm = callbacks.intersection(inner.callbacks);
            inner.callbacks = inner.callbacks.difference(disarm);
            Ok::<_, DmaError>((sources, disarm))
        })
        .map_err(|error| {
            tracing::warn!(channel = %self.channel, ?callbacks, %error, "can't disable callbacks");
            error
        })?;

        let irq = self.mdp.irq();
        for src in sources.each(disarm) {
            tracing::trace!(%src, "mask");
            irq.disable(src);
        }
        Ok(())
    }

    /// Installs `client` as the vsync subscriber, replacing any previous one.
    ///
    /// While a subscriber is installed, the frame-boundary source stays armed
    /// and the subscriber is called on every frame.
    pub fn subscribe_vsync(&self, client: VsyncClient) -> Result<(), DmaError> {
        self.set_vsync_client(Some(client))
    }

    /// Removes the vsync subscriber, disarming the frame-boundary source if
    /// there was one.
    pub fn unsubscribe_vsync(&self) -> Result<(), DmaError> {
        self.set_vsync_client(None)
    }

    fn set_vsync_client(&self, client: Option<VsyncClient>) -> Result<(), DmaError> {
        let changed = critical_section::with(|cs| {
            let mut inner = self.inner.borrow_ref_mut(cs);
            inner.session()?;
            if inner.vsync_client == client {
                return Ok::<_, DmaError>(false);
            }
            inner.vsync_client = client;
            Ok(true)
        })
        .map_err(|error| {
            tracing::warn!(channel = %self.channel, %error, "can't change vsync subscriber");
            error
        })?;

        if !changed {
            return Ok(());
        }
        tracing::debug!(
            channel = %self.channel,
            subscribed = client.is_some(),
            "vsync subscriber changed",
        );
        if client.is_some() {
            self.enable_callbacks(Callbacks::vsync())
        } else {
            self.disable_callbacks(Callbacks::vsync())
        }
    }

    /// Returns `true` while a caller is waiting in [`update`](Self::update)
    /// or [`start`](Self::start).
    #[must_use]
    pub fn has_waiter(&self) -> bool {
        critical_section::with(|cs| self.inner.borrow_ref(cs).waiting.is_some())
    }

    /// Interrupts the caller waiting on this engine, if there is one.
    ///
    /// A pending `update` or `start` returns [`DmaError::Interrupted`]. Only
    /// the wait actually in progress is interrupted; with no waiter, this
    /// does nothing. The hardware is not touched: an in-flight transfer still
    /// completes and clears the busy flag.
    pub fn cancel_waiters(&self) {
        let cancelled = critical_section::with(|cs| {
            let signal = self.inner.borrow_ref(cs).waiting?;
            Some((signal, self.completion(signal).interrupt()))
        });
        tracing::debug!(channel = %self.channel, ?cancelled, "cancel waiters");
    }

    /// Hands `buf` to the hardware and waits for the frame boundary that
    /// latches it.
    ///
    /// On a command-mode output, this first waits for the previous transfer
    /// to finish, then starts a new one.
    #[tracing::instrument(level = tracing::Level::TRACE, skip(self), fields(channel = %self.channel))]
    pub async fn update(&self, buf: DmaAddr) -> Result<(), DmaError> {
        let arm = loop {
            let wait_for_transfer = critical_section::with(|cs| {
                let mut inner = self.inner.borrow_ref_mut(cs);
                inner.expect_state("update", EngineState::Streaming)?;
                let wait = inner.is_command_mode() && inner.busy;
                if wait {
                    inner.waiting = Some(Signal::DmaDone);
                }
                Ok::<_, DmaError>(wait)
            })?;

            if wait_for_transfer {
                tracing::trace!("waiting for previous transfer");
                let _waiting = Waiting(self);
                self.dma_done.wait().await?;
            }

            let submitted = critical_section::with(|cs| {
                let mut guard = self.inner.borrow_ref_mut(cs);
                let inner = &mut *guard;
                inner.expect_state("update", EngineState::Streaming)?;
                if inner.busy {
                    // another transfer snuck in while we were waking up.
                    return Ok(None);
                }

                let regs = self.mdp.regs();
                let session = inner
                    .session
                    .as_mut()
                    .ok_or(DmaError::Capability(CapabilityError::NotConfigured))?;
                regs.write(session.bank.base + offset::dma::IBUF_ADDR, buf.0);
                session.source.buf = buf;

                let mut arm = Callbacks::vsync();
                if session.output.out_sel.is_command_mode() {
                    regs.write(session.bank.start, 1);
                    inner.busy = true;
                    self.dma_done.reinit();
                    arm = arm.union(Callbacks::dma_done());
                }
                regs.wmb();
                self.vsync_done.reinit();
                inner.waiting = Some(Signal::FrameBoundary);
                Ok::<_, DmaError>(Some(arm))
            })?;

            if let Some(arm) = submitted {
                break arm;
            }
        };

        let _waiting = Waiting(self);
        self.enable_callbacks(arm)?;
        self.vsync_done.wait().await?;
        tracing::trace!("frame latched");
        Ok(())
    }

    /// Starts `panel` and the channel, and waits for the first frame
    /// boundary.
    #[tracing::instrument(level = tracing::Level::DEBUG, skip(self, panel), fields(channel = %self.channel))]
    pub async fn start(&self, panel: &mut dyn Panel) -> Result<(), DmaError> {
        let arm = critical_section::with(|cs| {
            let mut inner = self.inner.borrow_ref_mut(cs);
            inner.expect_state("start", EngineState::Configured)?;
            let (bank, out_sel) = {
                let session = inner.session()?;
                (session.bank, session.output.out_sel)
            };
            if panel.output() != out_sel {
                return Err(DmaError::PanelMismatch {
                    engine: out_sel,
                    panel: panel.output(),
                });
            }

            panel.start().map_err(DmaError::Panel)?;

            let regs = self.mdp.regs();
            let mut arm = Callbacks::vsync();
            if out_sel.is_command_mode() {
                regs.write(bank.start, 1);
                inner.busy = true;
                self.dma_done.reinit();
                arm = arm.union(Callbacks::dma_done());
            }
            regs.wmb();
            self.vsync_done.reinit();
            inner.waiting = Some(Signal::FrameBoundary);
            inner.state = EngineState::Streaming;
            Ok(arm)
        })?;

        let _waiting = Waiting(self);
        self.enable_callbacks(arm)?;
        tracing::debug!("waiting for first frame");
        self.vsync_done.wait().await?;
        tracing::debug!("streaming");
        Ok(())
    }

    /// Stops `panel`, then waits for the channel to go quiet, polling
    /// `DISPLAY_STATUS` every [`StopPoll::interval_us`] for at most
    /// [`StopPoll::timeout_us`].
    ///
    /// Whether or not the channel went quiet, the engine is stopped: both
    /// callback categories are disarmed, the busy flag is cleared and the
    /// vsync subscriber is dropped.
    #[tracing::instrument(level = tracing::Level::DEBUG, skip(self, panel, delay), fields(channel = %self.channel))]
    pub async fn stop(
        &self,
        panel: &mut dyn Panel,
        delay: &mut impl DelayNs,
    ) -> Result<(), DmaError> {
        let mask = critical_section::with(|cs| {
            let inner = self.inner.borrow_ref(cs);
            inner.expect_state("stop", EngineState::Streaming)?;
            let session = inner.session()?;
            let out_sel = session.output.out_sel;
            if panel.output() != out_sel {
                return Err(DmaError::PanelMismatch {
                    engine: out_sel,
                    panel: panel.output(),
                });
            }
            let mut mask = session.bank.active;
            if out_sel == OutputSelect::DsiVideo {
                mask |= status::DSI_VIDEO_ACTIVE;
            }
            Ok(mask)
        })?;

        panel.stop().map_err(DmaError::Panel)?;
        let quiesced = self.poll_quiescent(mask, delay).await;

        self.disarm_all();
        critical_section::with(|cs| {
            let mut inner = self.inner.borrow_ref_mut(cs);
            if inner.busy {
                inner.busy = false;
                self.dma_done.complete();
            }
            inner.vsync_client = None;
            inner.state = EngineState::Stopped;
        });
        tracing::debug!(ok = quiesced.is_ok(), "stopped");
        quiesced
    }

    async fn poll_quiescent(&self, mask: u32, delay: &mut impl DelayNs) -> Result<(), DmaError> {
        let StopPoll {
            interval_us,
            timeout_us,
        } = self.stop_poll;
        // a zero interval still counts as 1us, so the poll stays bounded.
        let step_us = interval_us.max(1);
        let regs = self.mdp.regs();
        let mut elapsed_us = 0u32;
        loop {
            let status = regs.read(offset::DISPLAY_STATUS);
            if status & mask == 0 {
                tracing::trace!(elapsed_us, "channel quiet");
                return Ok(());
            }
            if elapsed_us >= timeout_us {
                tracing::warn!(
                    status = ?format_args!("{status:#x}"),
                    mask = ?format_args!("{mask:#x}"),
                    elapsed_us,
                    "timed out waiting for channel to stop",
                );
                return Err(DmaError::StopTimeout { status });
            }
            delay.delay_us(interval_us).await;
            elapsed_us = elapsed_us.saturating_add(step_us);
        }
    }

    fn completion(&self, signal: Signal) -> &Completion {
        match signal {
            Signal::FrameBoundary => &self.vsync_done,
            Signal::DmaDone => &self.dma_done,
        }
    }

    /// Disarms every armed category, whatever the current output.
    fn disarm_all(&self) {
        let armed = critical_section::with(|cs| {
            let mut inner = self.inner.borrow_ref_mut(cs);
            let armed = core::mem::replace(&mut inner.callbacks, Callbacks::new());
            inner.session.as_ref().map(|s| (s.sources, armed))
        });
        if let Some((sources, armed)) = armed {
            let irq = self.mdp.irq();
            for src in sources.each(armed) {
                tracing::trace!(%src, "mask");
                irq.disable(src);
            }
        }
    }

    fn write_channel_config(&self, bank: Bank, source: &SourceConfig, output: &OutputConfig) {
        let config = DmaConfigWord::new()
            .with(DmaConfigWord::FORMAT, source.format as u32)
            .with(DmaConfigWord::DITHER_EN, output.dither_en)
            .with(DmaConfigWord::OUT_SEL, output.out_sel as u32)
            .with(DmaConfigWord::BIT_MASK_POLARITY, output.bit_mask_polarity)
            .with(DmaConfigWord::COLOR_COMPONENTS_FLIP, output.color_components_flip)
            .with(DmaConfigWord::PACK_PATTERN, u32::from(output.pack_pattern & 0x3F))
            .with(DmaConfigWord::PACK_ALIGN, output.pack_align)
            .with(
                DmaConfigWord::COLOR_COMP_OUT_BITS,
                u32::from(output.color_comp_out_bits & 0x3F),
            );
        tracing::trace!(?config);

        let regs = self.mdp.regs();
        regs.write(bank.base + offset::dma::CONFIG, config.bits());
        regs.write(
            bank.base + offset::dma::SIZE,
            Pair16::pack(source.width, source.height),
        );
        regs.write(bank.base + offset::dma::IBUF_ADDR, source.buf.0);
        regs.write(bank.base + offset::dma::IBUF_Y_STRIDE, source.stride);
        regs.write(bank.base + offset::dma::OUT_XY, Pair16::pack(source.x, source.y));
        if self.channel == DmaChannel::Primary {
            regs.write(offset::DMA_P_FETCH_CFG, FETCH_CFG);
        }
        regs.write(bank.rd_ptr_irq, RD_PTR_IRQ_LINE);
    }

    fn on_frame_boundary(&self, irq: Irq) {
        let client = critical_section::with(|cs| {
            let mut inner = self.inner.borrow_ref_mut(cs);
            // signal under the lock, so that a submitter that re-initializes
            // the completion afterwards waits for the next boundary.
            self.vsync_done.complete();
            let client = inner.vsync_client;
            if client.is_none() {
                inner.callbacks.set(Callbacks::VSYNC, false);
            }
            client
        });

        match client {
            Some(client) => client.0.on_vsync(),
            None => self.mask_from_isr(irq, Callbacks::vsync()),
        }
    }

    fn on_dma_done(&self, irq: Irq) {
        critical_section::with(|cs| {
            let mut inner = self.inner.borrow_ref_mut(cs);
            inner.busy = false;
            inner.callbacks.set(Callbacks::DMA_DONE, false);
            // signal while still holding the lock, so that a submitter that
            // sets `busy` again re-arms after this signal, not before it.
            self.dma_done.complete();
        });
        self.mask_from_isr(irq, Callbacks::dma_done());
    }

    /// Masks `irq` from its own handler, after `category` was cleared.
    fn mask_from_isr(&self, irq: Irq, category: Callbacks) {
        let ctrl = self.mdp.irq();
        ctrl.disable_nosync(irq);
        // if a caller re-armed the category between our clearing it and the
        // mask, its unmask may already have happened: unmask again.
        let rearmed = critical_section::with(|cs| {
            let inner = self.inner.borrow_ref(cs);
            !inner.callbacks.intersection(category).is_empty()
        });
        if rearmed {
            tracing::trace!(%irq, "re-armed while masking");
            ctrl.enable(irq);
        }
    }
}

impl IrqHandler for DmaEngine {
    fn handle_irq(&self, irq: Irq) {
        let category = critical_section::with(|cs| {
            let inner = self.inner.borrow_ref(cs);
            inner.session.as_ref().map(|s| s.sources.category(irq))
        });
        tracing::trace!(channel = %self.channel, %irq, "MDP3 interrupt");
        match category {
            Some(c) if c == Callbacks::dma_done() => self.on_dma_done(irq),
            Some(_) => self.on_frame_boundary(irq),
            None => {
                tracing::debug!(%irq, "spurious interrupt on unconfigured engine");
                self.mdp.irq().disable_nosync(irq);
            }
        }
    }
}

impl fmt::Debug for DmaEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (state, busy, callbacks) = critical_section::with(|cs| {
            let inner = self.inner.borrow_ref(cs);
            (inner.state, inner.busy, inner.callbacks)
        });
        f.debug_struct("DmaEngine")
            .field("channel", &self.channel)
            .field("state", &state)
            .field("busy", &busy)
            .field("callbacks", &callbacks)
            .field("vsync_done", &self.vsync_done)
            .field("dma_done", &self.dma_done)
            .finish()
    }
}

// === impl VsyncClient ===

impl VsyncClient {
    #[must_use]
    pub const fn new(handler: &'static dyn VsyncHandler) -> Self {
        Self(handler)
    }
}

impl PartialEq for VsyncClient {
    fn eq(&self, other: &Self) -> bool {
        let this = self.0 as *const dyn VsyncHandler;
        let that = other.0 as *const dyn VsyncHandler;
        this.cast::<()>() == that.cast::<()>()
    }
}

impl Eq for VsyncClient {}

impl fmt::Debug for VsyncClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let addr = self.0 as *const dyn VsyncHandler;
        f.debug_tuple("VsyncClient").field(&addr.cast::<()>()).finish()
    }
}

// === impl DmaError ===

impl From<Interrupted> for DmaError {
    fn from(_: Interrupted) -> Self {
        Self::Interrupted
    }
}

impl From<CapabilityError> for DmaError {
    fn from(error: CapabilityError) -> Self {
        Self::Capability(error)
    }
}

impl fmt::Display for CapabilityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotConfigured => f.write_str("engine has no configured output"),
            Self::NoDmaDone(out) => write!(f, "{out} output has no DMA-done interrupt"),
        }
    }
}

impl fmt::Display for DmaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Capability(e) => write!(f, "unsupported request: {e}"),
            Self::Interrupted => f.write_str("wait interrupted"),
            Self::StopTimeout { status } => {
                write!(f, "channel still active after stop (status {status:#x})")
            }
            Self::UnsupportedChannel(ch) => write!(f, "{ch} is not supported"),
            Self::UnsupportedOutput(out) => write!(f, "{out} output is not supported"),
            Self::InvalidState { op, state } => write!(f, "can't {op} while {state:?}"),
            Self::PanelMismatch { engine, panel } => {
                write!(f, "engine feeds {engine}, but panel is {panel}")
            }
            Self::Irq(e) => fmt::Display::fmt(e, f),
            Self::Panel(e) => write!(f, "panel interface error: {e}"),
        }
    }
}
