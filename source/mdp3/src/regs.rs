//! The MDP3 register surface.
//!
//! Drivers in this crate only ever talk to hardware through the
//! [`Registers`] trait, so that the same driver code runs against memory-mapped
//! hardware ([`Mmio`]) and against a simulated register file in tests.
// Register offsets are listed as they appear in the hardware documentation.
#![allow(clippy::unusual_byte_groupings)]

use core::{
    ptr::{self, NonNull},
    sync::atomic::{fence, Ordering},
};

use mycelium_bitfield::bitfield;

/// A 32-bit register space addressed by byte offset from the MDP3 base.
pub trait Registers: Sync {
    /// Reads the register at `offset`.
    fn read(&self, offset: u32) -> u32;

    /// Writes `value` to the register at `offset`.
    fn write(&self, offset: u32, value: u32);

    /// Write barrier: every register write issued before this call is visible
    /// to the hardware before any write issued after it, and before any
    /// interrupt that depends on it can be observed.
    #[inline]
    fn wmb(&self) {
        fence(Ordering::SeqCst);
    }
}

/// Memory-mapped MDP3 registers.
#[derive(Debug)]
pub struct Mmio {
    base: NonNull<u8>,
}

// Safety: all accesses are volatile single-word reads and writes to device
// memory; the `Mmio` itself holds no other state.
unsafe impl Send for Mmio {}
unsafe impl Sync for Mmio {}

impl Mmio {
    /// Returns an `Mmio` for the register block mapped at `base`.
    ///
    /// # Safety
    ///
    /// `base` must point to the mapped MDP3 register block, which must stay
    /// mapped for as long as the returned `Mmio` (or anything it is lent to)
    /// exists. Nothing else may assume exclusive access to that block.
    #[must_use]
    pub const unsafe fn new(base: NonNull<u8>) -> Self {
        Self { base }
    }

    #[inline]
    fn reg(&self, offset: u32) -> *mut u32 {
        debug_assert_eq!(offset % 4, 0, "unaligned MDP3 register offset {offset:#x}");
        unsafe { self.base.as_ptr().add(offset as usize).cast() }
    }
}

impl Registers for Mmio {
    #[inline]
    fn read(&self, offset: u32) -> u32 {
        unsafe { ptr::read_volatile(self.reg(offset)) }
    }

    #[inline]
    fn write(&self, offset: u32, value: u32) {
        unsafe { ptr::write_volatile(self.reg(offset), value) }
    }
}

/// Writes `values` to consecutive registers starting at `start`.
pub(crate) fn write_seq(regs: &dyn Registers, start: u32, values: impl IntoIterator<Item = u32>) {
    let mut addr = start;
    for value in values {
        regs.write(addr, value);
        addr += 4;
    }
}

bitfield! {
    /// Two 16-bit quantities packed into one register, low half first.
    ///
    /// Sizes (`width | height << 16`), positions (`x | y << 16`) and the
    /// horizontal timing words all use this layout.
    pub struct Pair16<u32> {
        pub const LO: u16;
        pub const HI: u16;
    }
}

impl Pair16 {
    #[inline]
    #[must_use]
    pub fn pack(lo: u16, hi: u16) -> u32 {
        Self::new().with(Self::LO, lo).with(Self::HI, hi).bits()
    }
}

bitfield! {
    /// The `DMA_P_CONFIG`/`DMA_S_CONFIG` word.
    pub struct DmaConfigWord<u32> {
        /// Output bits per color component.
        pub const COLOR_COMP_OUT_BITS = 6;
        const _RESERVED_0 = 1;
        pub const PACK_ALIGN: bool;
        pub const PACK_PATTERN = 6;
        pub const COLOR_COMPONENTS_FLIP: bool;
        const _RESERVED_1 = 3;
        pub const BIT_MASK_POLARITY: bool;
        /// Raw [`OutputSelect`](crate::OutputSelect) value.
        pub const OUT_SEL = 3;
        const _RESERVED_2 = 2;
        pub const DITHER_EN: bool;
        /// Raw [`SourceFormat`](crate::config::SourceFormat) value.
        pub const FORMAT = 3;
    }
}

/// Bits of `DISPLAY_STATUS`.
pub mod status {
    /// The primary DMA channel is still fetching.
    pub const DMA_P_ACTIVE: u32 = 1 << 6;
    /// The secondary DMA channel is still fetching.
    pub const DMA_S_ACTIVE: u32 = 1 << 7;
    /// The DSI video timing generator is still running.
    pub const DSI_VIDEO_ACTIVE: u32 = 1 << 11;
}

/// Register offsets from the MDP3 base.
pub mod offset {
    pub const DISPLAY_STATUS: u32 = 0x0038;
    pub const DMA_P_START: u32 = 0x0044;
    pub const DMA_S_START: u32 = 0x0048;

    pub const PRIMARY_RD_PTR_IRQ: u32 = 0x021C;
    pub const SECONDARY_RD_PTR_IRQ: u32 = 0x0220;

    pub const DMA_P_BASE: u32 = 0x9_0000;
    pub const DMA_S_BASE: u32 = 0xA_0000;

    /// Offsets within a DMA channel bank (`DMA_P_BASE`/`DMA_S_BASE`).
    pub mod dma {
        pub const CONFIG: u32 = 0x00;
        pub const SIZE: u32 = 0x04;
        pub const IBUF_ADDR: u32 = 0x08;
        pub const IBUF_Y_STRIDE: u32 = 0x0C;
        pub const OUT_XY: u32 = 0x10;
    }

    pub const DMA_P_FETCH_CFG: u32 = 0x9_0074;

    pub const DMA_P_CURSOR_FORMAT: u32 = 0x9_0040;
    pub const DMA_P_CURSOR_SIZE: u32 = 0x9_0044;
    pub const DMA_P_CURSOR_BUF_ADDR: u32 = 0x9_0048;
    pub const DMA_P_CURSOR_POS: u32 = 0x9_004C;
    pub const DMA_P_CURSOR_BLEND_CONFIG: u32 = 0x9_0060;
    pub const DMA_P_CURSOR_BLEND_PARAM: u32 = 0x9_0064;
    pub const DMA_P_CURSOR_BLEND_TRANS_MASK: u32 = 0x9_0068;

    pub const DMA_P_COLOR_CORRECT_CONFIG: u32 = 0x9_0070;
    pub const DMA_P_CSC_MV1: u32 = 0x9_3400;
    pub const DMA_P_CSC_MV2: u32 = 0x9_3440;
    pub const DMA_P_CSC_PRE_BV1: u32 = 0x9_3500;
    pub const DMA_P_CSC_PRE_BV2: u32 = 0x9_3540;
    pub const DMA_P_CSC_POST_BV1: u32 = 0x9_3580;
    pub const DMA_P_CSC_POST_BV2: u32 = 0x9_35C0;
    pub const DMA_P_CSC_PRE_LV1: u32 = 0x9_3600;
    pub const DMA_P_CSC_PRE_LV2: u32 = 0x9_3640;
    pub const DMA_P_CSC_POST_LV1: u32 = 0x9_3680;
    pub const DMA_P_CSC_POST_LV2: u32 = 0x9_36C0;
    pub const DMA_P_CSC_LUT1: u32 = 0x9_3800;
    pub const DMA_P_CSC_LUT2: u32 = 0x9_3C00;

    pub const DMA_P_HIST_START: u32 = 0x9_4000;
    pub const DMA_P_HIST_FRAME_CNT: u32 = 0x9_4004;
    pub const DMA_P_HIST_BIT_MASK: u32 = 0x9_4008;
    pub const DMA_P_HIST_RESET_SEQ_START: u32 = 0x9_400C;
    pub const DMA_P_HIST_CONTROL: u32 = 0x9_4010;
    pub const DMA_P_HIST_INTR_STATUS: u32 = 0x9_4014;
    pub const DMA_P_HIST_INTR_CLEAR: u32 = 0x9_4018;
    pub const DMA_P_HIST_INTR_ENABLE: u32 = 0x9_401C;
    pub const DMA_P_HIST_STOP_REQ: u32 = 0x9_4020;
    pub const DMA_P_HIST_CANCEL_REQ: u32 = 0x9_4024;
    pub const DMA_P_HIST_EXTRA_INFO_0: u32 = 0x9_4028;
    pub const DMA_P_HIST_EXTRA_INFO_1: u32 = 0x9_402C;
    pub const DMA_P_HIST_R_DATA: u32 = 0x9_4100;
    pub const DMA_P_HIST_G_DATA: u32 = 0x9_4200;
    pub const DMA_P_HIST_B_DATA: u32 = 0x9_4300;

    pub const LCDC_BASE: u32 = 0xE_0000;
    pub const DSI_VIDEO_BASE: u32 = 0xF_0000;

    /// Offsets within a video timing bank (`LCDC_BASE`/`DSI_VIDEO_BASE`).
    pub mod timing {
        pub const EN: u32 = 0x00;
        pub const HSYNC_CTL: u32 = 0x04;
        pub const VSYNC_PERIOD: u32 = 0x08;
        pub const VSYNC_PULSE_WIDTH: u32 = 0x0C;
        pub const DISPLAY_HCTL: u32 = 0x10;
        pub const DISPLAY_V_START: u32 = 0x14;
        pub const DISPLAY_V_END: u32 = 0x18;
        pub const ACTIVE_HCTL: u32 = 0x1C;
        pub const ACTIVE_V_START: u32 = 0x20;
        pub const ACTIVE_V_END: u32 = 0x24;
        pub const UNDERFLOW_CTL: u32 = 0x2C;
        pub const HSYNC_SKEW: u32 = 0x30;
        pub const CTL_POLARITY: u32 = 0x38;
    }

    pub const DSI_CMD_MODE_ID_MAP: u32 = 0xF_1000;
    pub const DSI_CMD_MODE_TRIGGER_EN: u32 = 0xF_1004;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dma_config_word_is_valid() {
        DmaConfigWord::assert_valid();
        Pair16::assert_valid();
    }

    #[test]
    fn dma_config_word_layout() {
        let word = DmaConfigWord::new()
            .with(DmaConfigWord::COLOR_COMP_OUT_BITS, 0x3F)
            .with(DmaConfigWord::PACK_ALIGN, true)
            .with(DmaConfigWord::PACK_PATTERN, 0x21)
            .with(DmaConfigWord::COLOR_COMPONENTS_FLIP, true)
            .with(DmaConfigWord::BIT_MASK_POLARITY, true)
            .with(DmaConfigWord::OUT_SEL, 0b011)
            .with(DmaConfigWord::DITHER_EN, true)
            .with(DmaConfigWord::FORMAT, 0b010);
        let manual = 0x3F
            | (1 << 7)
            | (0x21 << 8)
            | (1 << 14)
            | (1 << 18)
            | (0b011 << 19)
            | (1 << 24)
            | (0b010 << 25);
        assert_eq!(word.bits(), manual, "{word:?}");
    }

    #[test]
    fn pair16_packs_low_half_first() {
        assert_eq!(Pair16::pack(480, 800), 480 | (800 << 16));
        assert_eq!(Pair16::pack(0xFFFF, 0), 0x0000_FFFF);
    }
}
