//! # MDP3 display DMA
//!
//! Drivers for the DMA engines and panel interfaces of the MDP3 display
//! processor, implemented as a `no_std` library. Platform code supplies the
//! two things this crate never owns: the register bus ([`Registers`]) and the
//! interrupt controller ([`InterruptController`]). Both are bundled into an
//! [`Mdp`] handle, which is passed to every driver in place of a global
//! register base.
//!
//! ## Sessions
//!
//! A display session is made of a [`PanelInterface`] (the timing generator or
//! command-mode link that drives the panel) and a [`DmaEngine`] (the channel
//! that fetches the framebuffer). A session looks like this:
//!
//! 1. [`PanelInterface::init`] programs the panel timing.
//! 2. [`DmaEngine::init`] programs the channel and registers the engine's
//!    interrupt handlers.
//! 3. [`DmaEngine::start`] starts the panel and waits for the first frame
//!    boundary.
//! 4. [`DmaEngine::update`] is called once per frame. It hands the new buffer
//!    to the hardware and waits for the frame boundary that latches it.
//! 5. [`DmaEngine::stop`] stops the panel and waits (bounded) for the pipe to
//!    go quiet.
//!
//! The waiting operations are `async`. Interrupt handlers wake the waiting
//! task, so any executor can drive them: the engine never spins on a flag.
//!
//! ## Interrupt context
//!
//! The platform's interrupt dispatcher calls [`IrqHandler::handle_irq`] on the
//! engine that registered for a source. Handlers never wait and never hold
//! the engine lock while calling out, so a vsync subscriber may call back into
//! the engine from its handler.
#![cfg_attr(not(test), no_std)]
#![allow(clippy::missing_safety_doc)]

pub mod completion;
pub mod config;
pub mod dma;
pub mod intf;
pub mod irq;
pub mod regs;

#[cfg(test)]
pub(crate) mod test_util;

use core::fmt;

pub use self::{
    completion::{Completion, Interrupted},
    config::{DisplayConfig, DmaAddr, OutputConfig, OutputSelect, SourceConfig},
    dma::{Callbacks, DmaChannel, DmaEngine, DmaError, EngineState, VsyncClient, VsyncHandler},
    intf::{IntfError, Panel, PanelInterface},
    irq::{InterruptController, Irq, IrqError, IrqHandler},
    regs::Registers,
};

/// A handle to the MDP3 hardware: its register surface and the interrupt
/// controller its interrupt lines are routed through.
///
/// This is essentially the board resource struct. It is `Copy`, so every
/// driver in a session can hold its own.
#[derive(Copy, Clone)]
pub struct Mdp {
    regs: &'static dyn Registers,
    irq: &'static dyn InterruptController,
}

impl Mdp {
    #[must_use]
    pub const fn new(
        regs: &'static dyn Registers,
        irq: &'static dyn InterruptController,
    ) -> Self {
        Self { regs, irq }
    }

    #[inline]
    #[must_use]
    pub fn regs(&self) -> &'static dyn Registers {
        self.regs
    }

    #[inline]
    #[must_use]
    pub fn irq(&self) -> &'static dyn InterruptController {
        self.irq
    }
}

impl fmt::Debug for Mdp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mdp").finish_non_exhaustive()
    }
}
