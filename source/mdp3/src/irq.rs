//! The interrupt controller interface.
//!
//! The MDP3 raises all of its interrupts through one controller, which the
//! platform owns. Drivers in this crate register an [`IrqHandler`] for each
//! interrupt source they care about, then mask and unmask those sources as
//! their callbacks are armed and disarmed.
use core::fmt;

/// MDP3 interrupt sources.
///
/// The discriminant is the source's bit in the MDP3 interrupt status/enable
/// registers.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum Irq {
    /// The secondary DMA channel finished a command-mode transfer.
    DmaSDone = 2,
    /// Primary read-pointer line sync (command-mode vsync, primary channel).
    SyncPrimaryLine = 8,
    /// Secondary read-pointer line sync (command-mode vsync, secondary channel).
    SyncSecondaryLine = 9,
    /// The primary DMA channel finished a command-mode transfer.
    DmaPDone = 14,
    /// The video timing generator started a new frame.
    LcdcStartOfFrame = 15,
}

/// Something that handles interrupts delivered by an [`InterruptController`].
///
/// `handle_irq` runs in interrupt context: it must not wait, and must not
/// take any lock that a waiting task may hold.
pub trait IrqHandler: Sync {
    fn handle_irq(&self, irq: Irq);
}

/// The interrupt controller the MDP3's interrupt lines are routed through.
pub trait InterruptController: Sync {
    /// Registers `handler` as the handler for `irq`, replacing any previous
    /// handler. The source is left masked.
    fn set_callback(&self, irq: Irq, handler: &'static dyn IrqHandler) -> Result<(), IrqError>;

    /// Unmasks `irq`.
    fn enable(&self, irq: Irq);

    /// Masks `irq`, waiting for any running handler for it to return.
    fn disable(&self, irq: Irq);

    /// Masks `irq` without waiting for running handlers. This is the variant
    /// a handler may call on its own source.
    fn disable_nosync(&self, irq: Irq);
}

/// Errors returned by [`InterruptController::set_callback`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum IrqError {
    /// The controller has no line for this source.
    NotFound(Irq),
    /// The controller refused the handler (for example, its handler table is
    /// locked while the source is unmasked).
    Rejected(Irq),
}

// === impl Irq ===

impl Irq {
    /// Returns this source's bit in the interrupt status/enable registers.
    #[inline]
    #[must_use]
    pub const fn mask(self) -> u32 {
        1 << self as u8
    }

    /// Returns `true` if this is one of the DMA-done sources.
    #[inline]
    #[must_use]
    pub const fn is_dma_done(self) -> bool {
        matches!(self, Self::DmaPDone | Self::DmaSDone)
    }
}

impl fmt::Display for Irq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::DmaSDone => "DMA_S_DONE",
            Self::SyncPrimaryLine => "SYNC_PRIMARY_LINE",
            Self::SyncSecondaryLine => "SYNC_SECONDARY_LINE",
            Self::DmaPDone => "DMA_P_DONE",
            Self::LcdcStartOfFrame => "LCDC_START_OF_FRAME",
        };
        f.write_str(name)
    }
}

// === impl IrqError ===

impl fmt::Display for IrqError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound(irq) => write!(f, "no interrupt line for {irq}"),
            Self::Rejected(irq) => write!(f, "interrupt controller rejected handler for {irq}"),
        }
    }
}
