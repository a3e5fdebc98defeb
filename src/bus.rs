//! Bus (memory-mapped address decode) functions and structures.
//!
//! Owns every peripheral that answers to an address in 0x0000-0xFFFF
//! and is the only component with a full picture of the address map.
//! `consume_machine_cycles` is the sole timing primitive exposed
//! upward to the CPU; everything else is read/write dispatch.

use std::sync::Mutex;

use crate::{
    apu::Apu,
    cartridge::Cartridge,
    dma::Dma,
    gb::{GameBoyConfig, GameBoyMode, GameBoySpeed},
    memory::Memory,
    pad::Pad,
    ppu::Ppu,
    serial::Serial,
    timer::Timer,
    warnln,
};
use gameboy_core_common::util::SharedThread;

pub const BOOT_SIZE_DMG: usize = 256;
pub const BOOT_SIZE_CGB: usize = 2304;

/// Read/write contract shared by every bus-mapped peripheral.
///
/// `read_many`/`write_many` exist so the CPU's fetch path and any
/// future bulk-transfer logic never need to special-case a component
/// that only implements single-byte access.
pub trait BusComponent {
    fn read(&self, addr: u16) -> u8;
    fn write(&mut self, addr: u16, value: u8);
    fn read_many(&self, addr: u16, count: usize) -> Vec<u8> {
        (0..count)
            .map(|offset| self.read(addr + offset as u16))
            .collect()
    }
    fn write_many(&mut self, addr: u16, values: &[u8]) {
        for (offset, &value) in values.iter().enumerate() {
            self.write(addr + offset as u16, value);
        }
    }
}

/// The Game Boy's 16-bit address bus: owns every peripheral and
/// resolves every address to exactly one of them.
pub struct Bus {
    /// Interrupt-enable register (0xFFFF). Bits 5-7 are unused and
    /// always read back as set.
    pub ie: u8,

    /// KEY0: compatibility-mode flag, CGB only. 0x80 selects
    /// CGB-enhanced mode, 0xC0 selects CGB-only mode.
    pub key0: u8,

    /// Set while a CGB double-speed switch is pending a STOP
    /// instruction to take effect.
    pub switching: bool,

    speed: GameBoySpeed,
    speed_callback: fn(speed: GameBoySpeed),

    /// Invoked after every bus read completes, with the address and
    /// the byte returned.
    read_callback: Option<Box<dyn FnMut(u16, u8)>>,

    /// Invoked after every bus write completes, with the address,
    /// the value requested and the value actually committed.
    write_callback: Option<Box<dyn FnMut(u16, u8, u8)>>,

    ppu: Ppu,
    apu: Apu,
    dma: Dma,
    pad: Pad,
    timer: Timer,
    serial: Serial,

    /// The cartridge currently attached to the bus. `None` before the
    /// lifecycle's attach step runs, or after it detaches.
    cartridge: Option<Cartridge>,

    boot_active: bool,
    boot: Vec<u8>,

    memory: Memory,

    mode: GameBoyMode,

    gbc: SharedThread<GameBoyConfig>,
}

impl Bus {
    pub fn new(mode: GameBoyMode, gbc: SharedThread<GameBoyConfig>) -> Self {
        Self {
            ie: 0x00,
            key0: 0x00,
            switching: false,
            speed: GameBoySpeed::Normal,
            speed_callback: |_| {},
            read_callback: None,
            write_callback: None,
            ppu: Ppu::new(mode),
            apu: Apu::new(),
            dma: Dma::new(),
            pad: Pad::new(),
            timer: Timer::new(),
            serial: Serial::new(),
            cartridge: None,
            boot_active: true,
            boot: vec![],
            memory: Memory::new(mode),
            mode,
            gbc,
        }
    }

    pub fn reset(&mut self) {
        self.ie = 0x00;
        self.key0 = 0x00;
        self.switching = false;
        self.speed = GameBoySpeed::Normal;
        self.ppu.reset();
        self.apu.reset();
        self.dma.reset();
        self.pad.reset();
        self.timer.reset();
        self.serial.reset();
        self.boot_active = true;
        self.memory.reset();
    }

    pub fn attach_cartridge(&mut self, cartridge: Cartridge) {
        self.cartridge = Some(cartridge);
    }

    pub fn detach_cartridge(&mut self) -> Option<Cartridge> {
        self.cartridge.take()
    }

    pub fn cartridge(&self) -> Option<&Cartridge> {
        self.cartridge.as_ref()
    }

    pub fn cartridge_mut(&mut self) -> Option<&mut Cartridge> {
        self.cartridge.as_mut()
    }

    pub fn allocate_boot(&mut self) {
        self.boot = match self.mode {
            GameBoyMode::Cgb => vec![0x00; BOOT_SIZE_CGB],
            _ => vec![0x00; BOOT_SIZE_DMG],
        };
    }

    /// Advances every clocked peripheral by one machine cycle (4
    /// T-cycles at normal speed, 2 at double speed). This is the only
    /// timing primitive the CPU calls; T-cycle bookkeeping stays
    /// internal to the bus and its peripherals.
    pub fn consume_machine_cycles(&mut self, cycles: u16) {
        for _ in 0..cycles {
            self.timer.tick();
        }
    }

    pub fn switch_speed(&mut self) {
        self.speed = self.speed.switch();
        self.switching = false;
        self.timer.set_double_speed(self.speed == GameBoySpeed::Double);
        (self.speed_callback)(self.speed);
    }

    pub fn speed(&self) -> GameBoySpeed {
        self.speed
    }

    pub fn set_speed(&mut self, value: GameBoySpeed) {
        self.speed = value;
        self.timer.set_double_speed(value == GameBoySpeed::Double);
    }

    pub fn set_speed_callback(&mut self, callback: fn(speed: GameBoySpeed)) {
        self.speed_callback = callback;
    }

    pub fn set_read_callback<F>(&mut self, callback: F)
    where
        F: FnMut(u16, u8) + 'static,
    {
        self.read_callback = Some(Box::new(callback));
    }

    pub fn set_write_callback<F>(&mut self, callback: F)
    where
        F: FnMut(u16, u8, u8) + 'static,
    {
        self.write_callback = Some(Box::new(callback));
    }

    pub fn ppu(&mut self) -> &mut Ppu {
        &mut self.ppu
    }

    pub fn ppu_i(&self) -> &Ppu {
        &self.ppu
    }

    pub fn apu(&mut self) -> &mut Apu {
        &mut self.apu
    }

    pub fn dma(&mut self) -> &mut Dma {
        &mut self.dma
    }

    pub fn pad(&mut self) -> &mut Pad {
        &mut self.pad
    }

    pub fn timer(&mut self) -> &mut Timer {
        &mut self.timer
    }

    pub fn timer_i(&self) -> &Timer {
        &self.timer
    }

    pub fn serial(&mut self) -> &mut Serial {
        &mut self.serial
    }

    pub fn boot_active(&self) -> bool {
        self.boot_active
    }

    pub fn set_boot_active(&mut self, value: bool) {
        self.boot_active = value;
    }

    pub fn write_boot(&mut self, addr: u16, buffer: &[u8]) {
        self.boot[addr as usize..addr as usize + buffer.len()].clone_from_slice(buffer);
    }

    pub fn mode(&self) -> GameBoyMode {
        self.mode
    }

    pub fn set_mode(&mut self, value: GameBoyMode) {
        self.mode = value;
        self.ppu.set_mode(value);
        self.memory.set_mode(value);
    }

    pub fn set_gbc(&mut self, value: SharedThread<GameBoyConfig>) {
        self.gbc = value;
    }

    pub fn read(&mut self, addr: u16) -> u8 {
        let value = self.read_inner(addr);
        if let Some(callback) = self.read_callback.as_mut() {
            callback(addr, value);
        }
        value
    }

    fn read_inner(&self, addr: u16) -> u8 {
        match addr {
            // 0x0000-0x0FFF - BOOT (256 B) + ROM0
            0x0000..=0x0fff => {
                if self.boot_active && addr <= 0x00ff {
                    return self.boot[addr as usize];
                }
                if self.boot_active
                    && self.mode == GameBoyMode::Cgb
                    && (0x0200..=0x08ff).contains(&addr)
                {
                    return self.boot[addr as usize];
                }
                self.read_cartridge(addr)
            }

            // 0x1000-0x7FFF - ROM (fixed + banked)
            0x1000..=0x7fff => self.read_cartridge(addr),

            // 0x8000-0x9FFF - VRAM
            0x8000..=0x9fff => self.ppu.read(addr),

            // 0xA000-0xBFFF - External RAM
            0xa000..=0xbfff => self.read_cartridge(addr),

            // 0xC000-0xFDFF - Work RAM and its echo
            0xc000..=0xdfff => self.memory.read_wram(addr - 0xc000),
            0xe000..=0xfdff => self.memory.read_wram((addr - 0xe000) & 0x1fff),

            // 0xFE00-0xFE9F - OAM
            0xfe00..=0xfe9f => self.ppu.read(addr),

            // 0xFEA0-0xFEFF - Not usable
            0xfea0..=0xfeff => 0xff,

            // 0xFF00 - Joypad input
            0xff00 => self.pad.read(addr),

            // 0xFF01-0xFF02 - Serial
            0xff01..=0xff02 => self.serial.read(addr),

            // 0xFF04-0xFF07 - Timer and divider
            0xff04..=0xff07 => self.timer.read(addr),

            // 0xFF0F - IF: each peripheral owns its own interrupt
            // line; unused bits 5-7 read back as set.
            0xff0f =>
            {
                #[allow(clippy::bool_to_int_with_if)]
                (if self.ppu.int_vblank() { 0x01 } else { 0x00 }
                    | if self.ppu.int_stat() { 0x02 } else { 0x00 }
                    | if self.timer.int_tima() { 0x04 } else { 0x00 }
                    | if self.serial.int_serial() { 0x08 } else { 0x00 }
                    | if self.pad.int_pad() { 0x10 } else { 0x00 }
                    | 0xe0)
            }

            // 0xFF10-0xFF26 and 0xFF30-0xFF3F - Audio
            0xff10..=0xff26 | 0xff30..=0xff3f => self.apu.read(addr),

            // 0xFF40-0xFF45, 0xFF47-0xFF4B - PPU registers
            0xff40..=0xff45 | 0xff47..=0xff4b => self.ppu.read(addr),

            // 0xFF46 - OAM DMA start
            0xff46 => self.dma.read(addr),

            // 0xFF4C - KEY0 (CGB only)
            0xff4c => self.key0,

            // 0xFF4D - KEY1 speed switch (CGB only)
            0xff4d => {
                (if self.switching { 0x01 } else { 0x00 }) | ((self.speed as u8) << 7) | 0x7e
            }

            // 0xFF4F - VRAM bank select (CGB only)
            0xff4f => self.ppu.read(addr),

            // 0xFF50 - Boot-active flag
            0xff50 => u8::from(!self.boot_active),

            // 0xFF51-0xFF55 - HDMA (CGB only)
            0xff51..=0xff55 => self.dma.read(addr),

            // 0xFF56 - Infrared port (CGB only), never wired up
            0xff56 => 0xff,

            // 0xFF68-0xFF6B - CGB palettes
            0xff68..=0xff6b => self.ppu.read(addr),

            // 0xFF70 - SVBK (CGB only)
            0xff70 => self.memory.read_svbk(),

            // 0xFF80-0xFFFE - High RAM
            0xff80..=0xfffe => self.memory.read_hram(addr - 0xff80),

            // 0xFFFF - IE
            0xffff => self.ie,

            addr => {
                warnln!("Reading from unknown bus location 0x{:04x}", addr);
                0xff
            }
        }
    }

    pub fn write(&mut self, addr: u16, value: u8) {
        self.write_inner(addr, value);
        let committed = self.read_inner(addr);
        if let Some(callback) = self.write_callback.as_mut() {
            callback(addr, value, committed);
        }
    }

    fn write_inner(&mut self, addr: u16, value: u8) {
        match addr {
            0x0000..=0x7fff => self.write_cartridge(addr, value),

            0x8000..=0x9fff => self.ppu.write(addr, value),

            0xa000..=0xbfff => self.write_cartridge(addr, value),

            0xc000..=0xdfff => self.memory.write_wram(addr - 0xc000, value),
            0xe000..=0xfdff => self.memory.write_wram((addr - 0xe000) & 0x1fff, value),

            0xfe00..=0xfe9f => self.ppu.write(addr, value),

            0xfea0..=0xfeff => {}

            0xff00 => self.pad.write(addr, value),

            0xff01..=0xff02 => self.serial.write(addr, value),

            0xff04..=0xff07 => self.timer.write(addr, value),

            0xff0f => {
                self.ppu.set_int_vblank(value & 0x01 == 0x01);
                self.ppu.set_int_stat(value & 0x02 == 0x02);
                self.timer.set_int_tima(value & 0x04 == 0x04);
                self.serial.set_int_serial(value & 0x08 == 0x08);
                self.pad.set_int_pad(value & 0x10 == 0x10);
            }

            0xff10..=0xff26 | 0xff30..=0xff3f => self.apu.write(addr, value),

            0xff40..=0xff45 | 0xff47..=0xff4b => self.ppu.write(addr, value),

            0xff46 => self.dma.write(addr, value),

            0xff4c => {
                self.key0 = value;
                if value == 0x04 {
                    self.ppu.set_dmg_compat(true);
                }
            }

            0xff4d => self.switching = value & 0x01 == 0x01,

            0xff4f => self.ppu.write(addr, value),

            0xff50 => self.boot_active = value == 0x00,

            0xff51..=0xff55 => self.dma.write(addr, value),

            0xff56 => {}

            0xff68..=0xff6b => self.ppu.write(addr, value),

            0xff70 => self.memory.write_svbk(value),

            0xff80..=0xfffe => self.memory.write_hram(addr - 0xff80, value),

            0xffff => self.ie = value,

            addr => warnln!("Writing to unknown bus location 0x{:04x}", addr),
        }
    }

    fn read_cartridge(&self, addr: u16) -> u8 {
        match &self.cartridge {
            Some(cartridge) => cartridge.read(addr),
            None => {
                warnln!("Reading from cartridge space with no cartridge attached");
                0xff
            }
        }
    }

    fn write_cartridge(&mut self, addr: u16, value: u8) {
        match &mut self.cartridge {
            Some(cartridge) => cartridge.write(addr, value),
            None => warnln!("Writing to cartridge space with no cartridge attached"),
        }
    }

    pub fn read_raw(&mut self, addr: u16) -> u8 {
        match addr {
            0xff10..=0xff3f => self.apu.read_raw(addr),
            _ => self.read(addr),
        }
    }

    pub fn write_raw(&mut self, addr: u16, value: u8) {
        match addr {
            0xff10..=0xff3f => self.apu.write_raw(addr, value),
            _ => self.write(addr, value),
        }
    }

    pub fn read_many(&mut self, addr: u16, count: u16) -> Vec<u8> {
        (0..count).map(|index| self.read(addr + index)).collect()
    }

    pub fn write_many(&mut self, addr: u16, data: &[u8]) {
        for (index, byte) in data.iter().enumerate() {
            self.write(addr + index as u16, *byte);
        }
    }
}

impl Default for Bus {
    fn default() -> Self {
        let mode = GameBoyMode::Dmg;
        let gbc = SharedThread::new(Mutex::new(GameBoyConfig::default()));
        Bus::new(mode, gbc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cartridge::Cartridge;
    use crate::consts::{
        CART_TYPE_ADDR, CHECKSUM_ADDR, CHECKSUM_END, CHECKSUM_START, LOGO_END, LOGO_START,
        NINTENDO_LOGO, RAM_SIZE_ADDR, ROM_BANK_SIZE, ROM_SIZE_ADDR,
    };

    fn make_rom() -> Vec<u8> {
        let mut data = vec![0u8; 2 * ROM_BANK_SIZE];
        data[LOGO_START..=LOGO_END].copy_from_slice(&NINTENDO_LOGO);
        data[CART_TYPE_ADDR] = 0x00;
        data[ROM_SIZE_ADDR] = 0x00;
        data[RAM_SIZE_ADDR] = 0x00;
        let mut sum: u8 = 0;
        for &byte in &data[CHECKSUM_START..=CHECKSUM_END] {
            sum = sum.wrapping_sub(byte).wrapping_sub(1);
        }
        data[CHECKSUM_ADDR] = sum;
        data
    }

    #[test]
    fn test_if_register_composes_peripheral_lines() {
        let mut bus = Bus::default();
        bus.ppu.set_int_vblank(true);
        bus.pad.set_int_pad(true);
        assert_eq!(bus.read(0xff0f), 0x11 | 0xe0);
    }

    #[test]
    fn test_wram_echo_mirrors_work_ram() {
        let mut bus = Bus::default();
        bus.write(0xc010, 0x42);
        assert_eq!(bus.read(0xe010), 0x42);
    }

    #[test]
    fn test_read_with_no_cartridge_returns_open_bus() {
        let mut bus = Bus::default();
        assert_eq!(bus.read(0x0200), 0xff);
    }

    #[test]
    fn test_cartridge_attach_serves_rom_reads() {
        let mut bus = Bus::default();
        bus.set_boot_active(false);
        let cartridge = Cartridge::from_data(&make_rom()).unwrap();
        bus.attach_cartridge(cartridge);
        assert_eq!(bus.read(0x0104), NINTENDO_LOGO[0]);
    }

    #[test]
    fn test_consume_machine_cycles_advances_timer() {
        let mut bus = Bus::default();
        bus.timer.write(crate::consts::TAC_ADDR, 0x05);
        bus.timer.write(crate::consts::TIMA_ADDR, 0xfd);
        bus.consume_machine_cycles(48);
        assert_eq!(bus.read(crate::consts::TIMA_ADDR), 0x00);
    }
}
