//! Game Boy emulation context and associated functions and structures.
//!
//! The [`GameBoy`] context is the library's entry point: create one, attach
//! a cartridge, then drive it forward with [`GameBoy::clock`] (the Tick
//! entry point) one CPU step at a time.
//!
//! # Examples
//!
//! ```rust
//! use gameboy_core::gb::{GameBoy, GameBoyMode};
//! let mut game_boy = GameBoy::new(Some(GameBoyMode::Dmg));
//! game_boy.boot();
//! let cycles = game_boy.clock();
//! println!("Ran {} cycles", cycles);
//! ```

use std::{
    fmt::{self, Display, Formatter},
    sync::{Arc, Mutex},
};

use gameboy_core_common::{error::Error, util::SharedThread};

use crate::{bus::Bus, cartridge::Cartridge, cpu::Cpu};

/// Enumeration that describes the multiple running modes of the Game
/// Boy emulator.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum GameBoyMode {
    Dmg = 1,
    Cgb = 2,
    Sgb = 3,
}

impl GameBoyMode {
    pub fn description(&self) -> &'static str {
        match self {
            GameBoyMode::Dmg => "Game Boy (DMG)",
            GameBoyMode::Cgb => "Game Boy Color (CGB)",
            GameBoyMode::Sgb => "Super Game Boy (SGB)",
        }
    }

    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => GameBoyMode::Dmg,
            2 => GameBoyMode::Cgb,
            3 => GameBoyMode::Sgb,
            _ => panic!("Invalid mode value: {}", value),
        }
    }

    pub fn is_dmg(&self) -> bool {
        *self == GameBoyMode::Dmg
    }

    pub fn is_cgb(&self) -> bool {
        *self == GameBoyMode::Cgb
    }

    pub fn is_sgb(&self) -> bool {
        *self == GameBoyMode::Sgb
    }
}

impl Display for GameBoyMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

impl From<u8> for GameBoyMode {
    fn from(value: u8) -> Self {
        Self::from_u8(value)
    }
}

/// The two clock rates the CPU (and the Timer, via `Timer::set_double_speed`)
/// can run at. Only reachable in CGB mode, through the `KEY1` switch.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum GameBoySpeed {
    Normal = 0,
    Double = 1,
}

impl GameBoySpeed {
    pub fn description(&self) -> &'static str {
        match self {
            GameBoySpeed::Normal => "Normal Speed",
            GameBoySpeed::Double => "Double Speed",
        }
    }

    pub fn switch(&self) -> Self {
        match self {
            GameBoySpeed::Normal => GameBoySpeed::Double,
            GameBoySpeed::Double => GameBoySpeed::Normal,
        }
    }

    pub fn multiplier(&self) -> u8 {
        match self {
            GameBoySpeed::Normal => 1,
            GameBoySpeed::Double => 2,
        }
    }
}

impl Display for GameBoySpeed {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Shared configuration handed down to every component that needs a
/// global, mutable-at-a-distance view of the running mode.
///
/// Kept behind a `SharedThread` (an `Arc<Mutex<_>>`) rather than passed by
/// value so a caller holding a `GameBoy` and a caller holding a cloned
/// handle observe the same mode without routing every mode change through
/// the context.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct GameBoyConfig {
    mode: GameBoyMode,
    clock_freq: u32,
}

impl GameBoyConfig {
    pub fn mode(&self) -> GameBoyMode {
        self.mode
    }

    pub fn set_mode(&mut self, value: GameBoyMode) {
        self.mode = value;
    }

    pub fn clock_freq(&self) -> u32 {
        self.clock_freq
    }

    pub fn set_clock_freq(&mut self, value: u32) {
        self.clock_freq = value;
    }
}

impl Default for GameBoyConfig {
    fn default() -> Self {
        Self {
            mode: GameBoyMode::Dmg,
            clock_freq: GameBoy::CPU_FREQ,
        }
    }
}

/// Top level structure abstracting the Game Boy system: CPU, bus, and
/// every peripheral reachable from it.
///
/// Owns at most one attached cartridge at a time. Follows a
/// create/initialize/attach/tick/detach lifecycle: [`GameBoy::new`]
/// creates the context with components in their reset state,
/// [`GameBoy::reset`] re-initializes them in place, [`GameBoy::attach_cartridge`]
/// re-initializes and then attaches a cartridge (inferring the running
/// mode from its header), and [`GameBoy::clock`] is the Tick entry point
/// the host drives forward.
pub struct GameBoy {
    cpu: Cpu,
    gbc: SharedThread<GameBoyConfig>,
}

impl GameBoy {
    /// The logic frequency of the Game Boy CPU in hz.
    pub const CPU_FREQ: u32 = 4194304;

    /// The visual frequency (refresh rate) of the Game Boy, close to 60 hz.
    pub const VISUAL_FREQ: f32 = 59.7275;

    pub fn new(mode: Option<GameBoyMode>) -> Self {
        let mode = mode.unwrap_or(GameBoyMode::Dmg);
        let gbc = Arc::new(Mutex::new(GameBoyConfig {
            mode,
            clock_freq: GameBoy::CPU_FREQ,
        }));
        let bus = Bus::new(mode, gbc.clone());
        let cpu = Cpu::new(bus, gbc.clone());
        Self { cpu, gbc }
    }

    pub fn verify_rom(data: &[u8]) -> bool {
        Cartridge::from_data(data).is_ok()
    }

    /// Initialize step: resets the CPU and every component reachable
    /// from it, keeping whatever cartridge is currently attached.
    pub fn reset(&mut self) {
        self.cpu.reset();
    }

    /// Direct-boot shortcut that jumps straight to the post-boot-ROM
    /// register state, skipping the boot sequence entirely.
    pub fn boot(&mut self) {
        self.cpu.boot();
    }

    /// Attach step: re-initializes the context, then attaches the
    /// cartridge. The running mode is inferred from the cartridge
    /// header's CGB flag (bit 7 of 0x143) before the re-initialize
    /// runs, so the reset components come up already configured for it.
    pub fn attach_cartridge(&mut self, cartridge: Cartridge) {
        self.set_mode(cartridge.gb_mode());
        self.reset();
        self.cpu.bus.attach_cartridge(cartridge);
        self.cpu.bus.allocate_boot();
    }

    pub fn load_cartridge(&mut self, data: &[u8]) -> Result<(), Error> {
        let cartridge = Cartridge::from_data(data)?;
        self.attach_cartridge(cartridge);
        Ok(())
    }

    /// Detach step: releases the attached cartridge, if any, handing
    /// ownership back to the caller (e.g. to flush battery RAM to disk).
    pub fn detach_cartridge(&mut self) -> Option<Cartridge> {
        self.cpu.bus.detach_cartridge()
    }

    /// Tick entry point: services at most one pending interrupt, then
    /// fetches, decodes and executes one instruction, returning the
    /// machine cycles it consumed. Every machine cycle consumed along
    /// the way has already advanced the Timer by the time this returns.
    pub fn clock(&mut self) -> u8 {
        self.cpu.clock()
    }

    /// Runs `clock` until the CPU's Program Counter reaches `addr`,
    /// returning the total machine cycles consumed.
    pub fn step_to(&mut self, addr: u16) -> u32 {
        let mut cycles = 0u32;
        while self.cpu.pc != addr {
            cycles += self.clock() as u32;
        }
        cycles
    }

    pub fn cpu(&mut self) -> &mut Cpu {
        &mut self.cpu
    }

    pub fn cpu_i(&self) -> &Cpu {
        &self.cpu
    }

    pub fn bus(&mut self) -> &mut Bus {
        &mut self.cpu.bus
    }

    pub fn bus_i(&self) -> &Bus {
        &self.cpu.bus
    }

    pub fn cartridge(&self) -> Option<&Cartridge> {
        self.cpu.bus.cartridge()
    }

    pub fn cartridge_mut(&mut self) -> Option<&mut Cartridge> {
        self.cpu.bus.cartridge_mut()
    }

    pub fn read_memory(&mut self, addr: u16) -> u8 {
        self.cpu.bus.read(addr)
    }

    pub fn write_memory(&mut self, addr: u16, value: u8) {
        self.cpu.bus.write(addr, value);
    }

    pub fn is_dmg(&self) -> bool {
        self.mode().is_dmg()
    }

    pub fn is_cgb(&self) -> bool {
        self.mode().is_cgb()
    }

    pub fn is_sgb(&self) -> bool {
        self.mode().is_sgb()
    }

    pub fn mode(&self) -> GameBoyMode {
        self.cpu.bus.mode()
    }

    pub fn set_mode(&mut self, value: GameBoyMode) {
        (*self.gbc).lock().unwrap().set_mode(value);
        self.cpu.bus.set_mode(value);
    }

    pub fn speed(&self) -> GameBoySpeed {
        self.cpu.bus.speed()
    }

    pub fn clock_freq(&self) -> u32 {
        (*self.gbc).lock().unwrap().clock_freq()
    }

    pub fn set_clock_freq(&mut self, value: u32) {
        (*self.gbc).lock().unwrap().set_clock_freq(value);
    }

    pub fn set_speed_callback(&mut self, callback: fn(speed: GameBoySpeed)) {
        self.cpu.bus.set_speed_callback(callback);
    }

    /// Registers the bus-read callback: `(address, value read)`,
    /// invoked after every completed bus read.
    pub fn set_read_callback<F>(&mut self, callback: F)
    where
        F: FnMut(u16, u8) + 'static,
    {
        self.cpu.bus.set_read_callback(callback);
    }

    /// Registers the bus-write callback: `(address, value requested,
    /// value actually committed)`, invoked after every completed
    /// bus write.
    pub fn set_write_callback<F>(&mut self, callback: F)
    where
        F: FnMut(u16, u8, u8) + 'static,
    {
        self.cpu.bus.set_write_callback(callback);
    }

    /// Registers the instruction-fetch callback: `(pc, opcode16) ->
    /// continue?`. Returning `false` converts the step into a NOP,
    /// cycle cost included.
    pub fn set_fetch_callback<F>(&mut self, callback: F)
    where
        F: FnMut(u16, u16) -> bool + 'static,
    {
        self.cpu.set_fetch_callback(callback);
    }

    /// Registers the instruction-execute callback: `(pc, opcode16,
    /// success)`, invoked once the step (or its NOP substitute) has run.
    pub fn set_execute_callback<F>(&mut self, callback: F)
    where
        F: FnMut(u16, u16, bool) + 'static,
    {
        self.cpu.set_execute_callback(callback);
    }

    /// Registers the interrupt-service callback: `(interrupt index)`,
    /// invoked once per interrupt actually serviced.
    pub fn set_interrupt_callback<F>(&mut self, callback: F)
    where
        F: FnMut(u8) + 'static,
    {
        self.cpu.set_interrupt_callback(callback);
    }

    /// Registers the restart-vector callback: `(vector address)`,
    /// invoked when interrupt servicing sets `PC` to it.
    pub fn set_restart_callback<F>(&mut self, callback: F)
    where
        F: FnMut(u16) + 'static,
    {
        self.cpu.set_restart_callback(callback);
    }

    /// Registers the timer-overflow callback, invoked whenever `TIMA`
    /// wraps and reloads from `TMA`.
    pub fn set_timer_overflow_callback<F>(&mut self, callback: F)
    where
        F: FnMut() + 'static,
    {
        self.cpu.bus.timer().set_overflow_callback(callback);
    }

    pub fn description(&self, column_length: usize) -> String {
        let mode_l = format!("{:width$}", "Mode", width = column_length);
        let clock_l = format!("{:width$}", "Clock", width = column_length);
        format!(
            "{}  {}\n{}  {:.02} Mhz",
            mode_l,
            self.mode(),
            clock_l,
            self.clock_freq() as f32 / 1000.0 / 1000.0,
        )
    }

    pub fn description_debug(&self) -> String {
        format!(
            "{}\nCPU:\n{}",
            self.description(8),
            self.cpu_i().description_default(),
        )
    }
}

impl Default for GameBoy {
    fn default() -> Self {
        Self::new(None)
    }
}

impl Display for GameBoy {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description(8))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_rom() -> Vec<u8> {
        let mut data = vec![0u8; 0x8000];
        data[0x0104..0x0134].copy_from_slice(&crate::consts::NINTENDO_LOGO);
        data[0x0147] = 0x00;
        data[0x0148] = 0x00;
        data[0x0149] = 0x00;
        let checksum = data[0x0134..0x014d]
            .iter()
            .fold(0u8, |acc, &byte| acc.wrapping_sub(byte).wrapping_sub(1));
        data[0x014d] = checksum;
        data
    }

    #[test]
    fn test_new_defaults_to_dmg() {
        let game_boy = GameBoy::new(None);
        assert!(game_boy.is_dmg());
    }

    #[test]
    fn test_attach_cartridge_infers_mode_from_header() {
        let mut data = make_rom();
        data[0x0143] = 0x80;
        let cartridge = Cartridge::from_data(&data).unwrap();
        let mut game_boy = GameBoy::new(None);
        game_boy.attach_cartridge(cartridge);
        assert!(game_boy.is_cgb());
    }

    #[test]
    fn test_boot_then_clock_runs_cartridge_code() {
        let data = make_rom();
        let mut game_boy = GameBoy::new(Some(GameBoyMode::Dmg));
        game_boy.load_cartridge(&data).unwrap();
        game_boy.boot();
        assert_eq!(game_boy.cpu_i().pc, 0x0100);
        game_boy.clock();
        assert_eq!(game_boy.cpu_i().pc, 0x0101);
    }

    #[test]
    fn test_detach_cartridge_returns_it() {
        let data = make_rom();
        let mut game_boy = GameBoy::new(Some(GameBoyMode::Dmg));
        game_boy.load_cartridge(&data).unwrap();
        assert!(game_boy.detach_cartridge().is_some());
        assert!(game_boy.cartridge().is_none());
    }

    #[test]
    fn test_read_callback_observes_bus_traffic() {
        let mut game_boy = GameBoy::new(Some(GameBoyMode::Dmg));
        let seen = SharedThread::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        game_boy.set_read_callback(move |addr, value| {
            seen_clone.lock().unwrap().push((addr, value));
        });
        game_boy.write_memory(0xc000, 0x42);
        game_boy.read_memory(0xc000);
        assert_eq!(seen.lock().unwrap().last(), Some(&(0xc000, 0x42)));
    }

    #[test]
    fn test_fetch_callback_can_veto_instruction() {
        let mut game_boy = GameBoy::new(Some(GameBoyMode::Dmg));
        game_boy.bus().set_boot_active(false);
        game_boy.cpu().pc = 0xc000;
        game_boy.write_memory(0xc000, 0x3c); // INC A
        game_boy.set_fetch_callback(|_pc, _opcode| false);
        game_boy.clock();
        assert_eq!(game_boy.cpu_i().a, 0x00);
        assert_eq!(game_boy.cpu_i().pc, 0xc001);
    }
}
