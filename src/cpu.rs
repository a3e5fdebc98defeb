//! Implementation of the core CPU ([Sharp LR35902](https://en.wikipedia.org/wiki/Game_Boy)) logic for the Game Boy.
//!
//! Does not include the instruction set implementation, only the core
//! CPU logic and the CPU struct definition.

use gameboy_core_common::util::SharedThread;

use crate::{
    bus::Bus,
    consts::{IF_ADDR, LCDC_ADDR},
    debugln,
    gb::GameBoyConfig,
    inst::{EXTENDED, INSTRUCTIONS},
};

/// Number of machine cycles a CGB double-speed switch suspends the
/// CPU (and, via `Timer::set_suppressed`, the divider) for.
const SPEED_SWITCH_CYCLES: u16 = 2050;

pub struct Cpu {
    pub pc: u16,
    pub sp: u16,

    pub a: u8,
    pub b: u8,
    pub c: u8,
    pub d: u8,
    pub e: u8,
    pub h: u8,
    pub l: u8,

    /// Interrupt Master Enable. Gates whether a pending interrupt is
    /// serviced; does not gate `IF`/`IE` bookkeeping.
    ime: bool,

    /// Set by `EI`; takes effect only after the *next* instruction
    /// completes, matching the one-instruction-delayed hardware
    /// semantics. `RETI` sets `ime` directly and leaves this alone.
    ime_pending: bool,

    zero: bool,
    sub: bool,
    half_carry: bool,
    carry: bool,

    halted: bool,

    /// Set when HALT was entered with IME=0 and an interrupt already
    /// pending: the CPU does not actually halt, and the very next
    /// opcode fetch re-reads the byte at PC without advancing it.
    halt_bug: bool,

    stopped: bool,

    pub bus: Bus,
    pub cycles: u8,
    pub ppc: u16,

    /// Set by `illegal()` when the opcode just dispatched is one of the
    /// 11 undefined LR35902 encodings. Folded into the `success`
    /// argument of `execute_callback` instead of panicking, and cleared
    /// before every fetch.
    illegal_opcode: bool,

    gbc: SharedThread<GameBoyConfig>,

    /// Invoked right before an opcode is decoded; returning `false`
    /// converts the step into a NOP, cycle cost included.
    fetch_callback: Option<Box<dyn FnMut(u16, u16) -> bool>>,

    /// Invoked after an instruction finishes executing.
    execute_callback: Option<Box<dyn FnMut(u16, u16, bool)>>,

    /// Invoked once per interrupt actually serviced, with its index.
    interrupt_callback: Option<Box<dyn FnMut(u8)>>,

    /// Invoked when `service_interrupt` sets `PC` to a vector address.
    restart_callback: Option<Box<dyn FnMut(u16)>>,
}

impl Cpu {
    pub fn new(bus: Bus, gbc: SharedThread<GameBoyConfig>) -> Self {
        Self {
            pc: 0x0000,
            sp: 0x0000,
            a: 0x00,
            b: 0x00,
            c: 0x00,
            d: 0x00,
            e: 0x00,
            h: 0x00,
            l: 0x00,
            ime: false,
            ime_pending: false,
            zero: false,
            sub: false,
            half_carry: false,
            carry: false,
            halted: false,
            halt_bug: false,
            stopped: false,
            bus,
            cycles: 0,
            ppc: 0x0000,
            illegal_opcode: false,
            gbc,
            fetch_callback: None,
            execute_callback: None,
            interrupt_callback: None,
            restart_callback: None,
        }
    }

    pub fn set_fetch_callback<F>(&mut self, callback: F)
    where
        F: FnMut(u16, u16) -> bool + 'static,
    {
        self.fetch_callback = Some(Box::new(callback));
    }

    pub fn set_execute_callback<F>(&mut self, callback: F)
    where
        F: FnMut(u16, u16, bool) + 'static,
    {
        self.execute_callback = Some(Box::new(callback));
    }

    pub fn set_interrupt_callback<F>(&mut self, callback: F)
    where
        F: FnMut(u8) + 'static,
    {
        self.interrupt_callback = Some(Box::new(callback));
    }

    pub fn set_restart_callback<F>(&mut self, callback: F)
    where
        F: FnMut(u16) + 'static,
    {
        self.restart_callback = Some(Box::new(callback));
    }

    pub fn reset(&mut self) {
        self.pc = 0x0000;
        self.sp = 0x0000;
        self.a = 0x00;
        self.b = 0x00;
        self.c = 0x00;
        self.d = 0x00;
        self.e = 0x00;
        self.h = 0x00;
        self.l = 0x00;
        self.ime = false;
        self.ime_pending = false;
        self.zero = false;
        self.sub = false;
        self.half_carry = false;
        self.carry = false;
        self.halted = false;
        self.halt_bug = false;
        self.stopped = false;
        self.cycles = 0;
        self.ppc = 0x0000;
        self.illegal_opcode = false;
        self.bus.reset();
    }

    /// Sets register state to what it would be immediately after the
    /// boot ROM hands control to cartridge code, and closes the boot
    /// overlay window.
    pub fn boot(&mut self) {
        self.set_af(0x01b0);
        self.set_bc(0x0013);
        self.set_de(0x00d8);
        self.set_hl(0x014d);
        self.sp = 0xfffe;
        self.pc = 0x0100;
        self.bus.set_boot_active(false);
        self.bus.write(LCDC_ADDR, 0x91);
    }

    /// Runs one fetch/execute step, honoring HALT/STOP/interrupt
    /// servicing, and returns the machine cycles it consumed. All
    /// timing-relevant work already happened through
    /// `Bus::consume_machine_cycles`; the return value exists only
    /// for callers that want a cycle count (e.g. frame pacing).
    pub fn clock(&mut self) -> u8 {
        self.cycles = 0;

        if self.stopped {
            return 0;
        }

        if self.halted {
            if self.pending_enabled_interrupt() != 0 {
                self.halted = false;
            } else {
                self.bus.consume_machine_cycles(1);
                self.cycles = 1;
                return self.cycles;
            }
        }

        if !self.halted {
            self.service_interrupt();
        }

        if !self.halted && !self.stopped {
            self.ppc = self.pc;
            let pc_before = self.pc;

            let (instruction, table_cycles, opcode16) = self.fetch();
            let proceed = match self.fetch_callback.as_mut() {
                Some(callback) => callback(pc_before, opcode16),
                None => true,
            };

            self.illegal_opcode = false;
            if proceed {
                instruction(self);
            }
            self.cycles = self.cycles.wrapping_add(table_cycles);
            self.bus.consume_machine_cycles(self.cycles as u16);

            if let Some(callback) = self.execute_callback.as_mut() {
                callback(pc_before, opcode16, proceed && !self.illegal_opcode);
            }
        }

        if self.ime_pending {
            self.ime_pending = false;
            self.ime = true;
        }

        self.cycles
    }

    #[inline(always)]
    fn pending_enabled_interrupt(&self) -> u8 {
        self.bus.read(IF_ADDR) & self.bus.ie & 0x1f
    }

    /// Fetches the next opcode and its instruction-table entry,
    /// honoring the halt-bug's "read PC without advancing" quirk and
    /// the `0xCB` two-byte prefix. The table's cycle count already
    /// accounts for the fetch itself, so no separate bus timing is
    /// charged here. The returned `u16` is the opcode as seen by the
    /// fetch callback: the plain opcode, or `0xcb00 | extended` for a
    /// prefixed instruction.
    fn fetch(&mut self) -> (fn(&mut Cpu), u8, u16) {
        let bugged = self.halt_bug;
        self.halt_bug = false;

        let opcode = if bugged {
            self.bus.read(self.pc)
        } else {
            self.read_u8()
        };

        if opcode == 0xcb {
            let extended = if bugged {
                self.bus.read(self.pc)
            } else {
                self.read_u8()
            };
            (
                EXTENDED[extended as usize].0,
                EXTENDED[extended as usize].1,
                0xcb00 | extended as u16,
            )
        } else {
            (
                INSTRUCTIONS[opcode as usize].0,
                INSTRUCTIONS[opcode as usize].1,
                opcode as u16,
            )
        }
    }

    /// Services at most one pending interrupt per call, in priority
    /// order 0 (VBlank) through 4 (Joypad).
    fn service_interrupt(&mut self) {
        if !self.ime {
            return;
        }

        let pending = self.pending_enabled_interrupt();
        if pending == 0 {
            return;
        }

        for i in 0..5u8 {
            if pending & (1 << i) == 0 {
                continue;
            }

            let if_reg = self.bus.read(IF_ADDR);
            self.bus.write(IF_ADDR, if_reg & !(1 << i));
            self.ime = false;
            self.halted = false;
            self.halt_bug = false;

            self.bus.consume_machine_cycles(2);
            self.cycles = self.cycles.wrapping_add(2);

            let pc = self.pc;
            self.push_byte((pc >> 8) as u8);
            self.bus.consume_machine_cycles(1);
            self.cycles = self.cycles.wrapping_add(1);
            self.push_byte(pc as u8);
            self.bus.consume_machine_cycles(1);
            self.cycles = self.cycles.wrapping_add(1);

            self.pc = 0x40 + 8 * i as u16;
            self.bus.consume_machine_cycles(1);
            self.cycles = self.cycles.wrapping_add(1);

            if let Some(callback) = self.restart_callback.as_mut() {
                callback(self.pc);
            }
            if let Some(callback) = self.interrupt_callback.as_mut() {
                callback(i);
            }

            break;
        }
    }

    pub fn bus(&mut self) -> &mut Bus {
        &mut self.bus
    }

    pub fn bus_i(&self) -> &Bus {
        &self.bus
    }

    pub fn halted(&self) -> bool {
        self.halted
    }

    pub fn set_halted(&mut self, value: bool) {
        self.halted = value;
    }

    pub fn stopped(&self) -> bool {
        self.stopped
    }

    pub fn cycles(&self) -> u8 {
        self.cycles
    }

    pub fn f(&self) -> u8 {
        (if self.zero { 0x80 } else { 0x00 })
            | (if self.sub { 0x40 } else { 0x00 })
            | (if self.half_carry { 0x20 } else { 0x00 })
            | (if self.carry { 0x10 } else { 0x00 })
    }

    pub fn set_f(&mut self, value: u8) {
        self.zero = value & 0x80 != 0x00;
        self.sub = value & 0x40 != 0x00;
        self.half_carry = value & 0x20 != 0x00;
        self.carry = value & 0x10 != 0x00;
    }

    pub fn af(&self) -> u16 {
        ((self.a as u16) << 8) | (self.f() & 0xf0) as u16
    }

    pub fn set_af(&mut self, value: u16) {
        self.a = (value >> 8) as u8;
        self.set_f((value & 0x00f0) as u8);
    }

    pub fn bc(&self) -> u16 {
        ((self.b as u16) << 8) | self.c as u16
    }

    pub fn set_bc(&mut self, value: u16) {
        self.b = (value >> 8) as u8;
        self.c = value as u8;
    }

    pub fn de(&self) -> u16 {
        ((self.d as u16) << 8) | self.e as u16
    }

    pub fn set_de(&mut self, value: u16) {
        self.d = (value >> 8) as u8;
        self.e = value as u8;
    }

    pub fn hl(&self) -> u16 {
        ((self.h as u16) << 8) | self.l as u16
    }

    pub fn set_hl(&mut self, value: u16) {
        self.h = (value >> 8) as u8;
        self.l = value as u8;
    }

    pub fn zero(&self) -> bool {
        self.zero
    }

    pub fn set_zero(&mut self, value: bool) {
        self.zero = value;
    }

    pub fn sub(&self) -> bool {
        self.sub
    }

    pub fn set_sub(&mut self, value: bool) {
        self.sub = value;
    }

    pub fn half_carry(&self) -> bool {
        self.half_carry
    }

    pub fn set_half_carry(&mut self, value: bool) {
        self.half_carry = value;
    }

    pub fn carry(&self) -> bool {
        self.carry
    }

    pub fn set_carry(&mut self, value: bool) {
        self.carry = value;
    }

    pub fn ime(&self) -> bool {
        self.ime
    }

    pub fn set_ime(&mut self, value: bool) {
        self.ime = value;
    }

    pub fn read_u8(&mut self) -> u8 {
        let value = self.bus.read(self.pc);
        self.pc = self.pc.wrapping_add(1);
        value
    }

    pub fn read_u16(&mut self) -> u16 {
        let low = self.read_u8();
        let high = self.read_u8();
        ((high as u16) << 8) | low as u16
    }

    pub fn push_byte(&mut self, value: u8) {
        self.sp = self.sp.wrapping_sub(1);
        self.bus.write(self.sp, value);
    }

    pub fn push_word(&mut self, value: u16) {
        self.push_byte((value >> 8) as u8);
        self.push_byte(value as u8);
    }

    pub fn pop_byte(&mut self) -> u8 {
        let value = self.bus.read(self.sp);
        self.sp = self.sp.wrapping_add(1);
        value
    }

    pub fn pop_word(&mut self) -> u16 {
        let low = self.pop_byte();
        let high = self.pop_byte();
        ((high as u16) << 8) | low as u16
    }

    /// Flags the opcode just dispatched as one of the 11 undefined
    /// LR35902 encodings, so `clock()` reports `success = false` to
    /// `execute_callback` instead of the CPU crashing the host process.
    pub fn mark_illegal_opcode(&mut self) {
        self.illegal_opcode = true;
    }

    /// Enters HALT, resolving which of the three hardware behaviors
    /// applies at entry time.
    pub fn halt(&mut self) {
        if self.ime {
            self.halted = true;
            return;
        }

        if self.pending_enabled_interrupt() != 0 {
            self.halt_bug = true;
        } else {
            self.halted = true;
        }
    }

    /// Enters STOP. Consumes the instruction's second (ignored) byte,
    /// resets `DIV_CNT`, and, on CGB with a speed switch armed,
    /// suspends the CPU for the duration of the switch instead of
    /// fully stopping.
    pub fn stop(&mut self) {
        self.read_u8();
        self.bus.timer().set_div_cnt(0);

        if self.bus.switching {
            self.bus.switching = false;
            self.bus.timer().set_suppressed(true);
            self.bus.consume_machine_cycles(SPEED_SWITCH_CYCLES);
            self.bus.timer().set_suppressed(false);
            self.bus.switch_speed();
        } else {
            self.stopped = true;
        }
    }

    /// Clears the stopped state, e.g. on an external joypad press.
    pub fn resume(&mut self) {
        self.stopped = false;
    }

    pub fn enable_int(&mut self) {
        self.ime_pending = true;
    }

    pub fn disable_int(&mut self) {
        self.ime = false;
        self.ime_pending = false;
    }

    /// `RETI`: unlike `EI`, takes effect immediately.
    pub fn return_int(&mut self) {
        self.ime = true;
        self.ime_pending = false;
    }

    pub fn key0(&self) -> u8 {
        if self.bus.mode().is_cgb() {
            self.bus.key0
        } else {
            0xff
        }
    }

    /// Writes from software are ignored: by the time cartridge code
    /// runs, the boot ROM has already closed this window.
    pub fn set_key0(&mut self, _value: u8) {}

    pub fn key1(&self) -> u8 {
        if !self.bus.mode().is_cgb() {
            return 0xff;
        }
        (if self.bus.switching { 0x01 } else { 0x00 }) | ((self.bus.speed() as u8) << 7) | 0x7e
    }

    pub fn set_key1(&mut self, value: u8) {
        self.bus.switching = value & 0x01 == 0x01;
    }

    pub fn set_gbc(&mut self, value: SharedThread<GameBoyConfig>) {
        self.gbc = value;
    }

    pub fn description(&self) -> String {
        format!(
            "PC: 0x{:04x} SP: 0x{:04x} A: 0x{:02x} F: 0x{:02x} BC: 0x{:04x} DE: 0x{:04x} HL: 0x{:04x} IME: {}",
            self.pc,
            self.sp,
            self.a,
            self.f(),
            self.bc(),
            self.de(),
            self.hl(),
            self.ime,
        )
    }

    pub fn description_default(&self) -> String {
        debugln!("{}", self.description());
        self.description()
    }
}

impl Default for Cpu {
    fn default() -> Self {
        let gbc = SharedThread::new(std::sync::Mutex::new(GameBoyConfig::default()));
        let bus = Bus::default();
        Self::new(bus, gbc)
    }
}

impl std::fmt::Display for Cpu {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_clock_basic_opcodes() {
        let mut cpu = Cpu::default();
        cpu.bus.set_boot_active(false);
        cpu.pc = 0xc000;

        // LD A,d8
        cpu.bus.write(0xc000, 0x3e);
        cpu.bus.write(0xc001, 0x05);
        cpu.clock();
        assert_eq!(cpu.a, 0x05);
        assert_eq!(cpu.pc, 0xc002);

        // INC A
        cpu.bus.write(0xc002, 0x3c);
        cpu.clock();
        assert_eq!(cpu.a, 0x06);

        // DEC A
        cpu.bus.write(0xc003, 0x3d);
        cpu.clock();
        assert_eq!(cpu.a, 0x05);

        // LD (HL),A then LD A,(HL)
        cpu.set_hl(0xc100);
        cpu.bus.write(0xc004, 0x77);
        cpu.clock();
        assert_eq!(cpu.bus.read(0xc100), 0x05);

        cpu.a = 0x00;
        cpu.bus.write(0xc005, 0x7e);
        cpu.clock();
        assert_eq!(cpu.a, 0x05);
    }

    #[test]
    fn test_ei_is_deferred_by_one_instruction() {
        let mut cpu = Cpu::default();
        cpu.bus.set_boot_active(false);
        cpu.pc = 0xc000;

        // EI; NOP
        cpu.bus.write(0xc000, 0xfb);
        cpu.bus.write(0xc001, 0x00);

        cpu.clock();
        assert!(
            !cpu.ime(),
            "IME must not be set until after the next instruction"
        );

        cpu.clock();
        assert!(cpu.ime());
    }

    #[test]
    fn test_reti_sets_ime_immediately() {
        let mut cpu = Cpu::default();
        cpu.bus.set_boot_active(false);
        cpu.sp = 0xd000;
        cpu.push_word(0xc100);
        cpu.pc = 0xc000;

        // RETI
        cpu.bus.write(0xc000, 0xd9);
        cpu.clock();
        assert!(cpu.ime());
        assert_eq!(cpu.pc, 0xc100);
    }

    #[test]
    fn test_halt_with_ime_set_services_pending_interrupt() {
        let mut cpu = Cpu::default();
        cpu.bus.set_boot_active(false);
        cpu.bus.ie = 0x01;
        cpu.set_ime(true);
        cpu.pc = 0xc000;
        cpu.bus.write(0xc000, 0x76); // HALT
        cpu.clock();
        assert!(cpu.halted());

        cpu.bus.ppu().set_int_vblank(true);
        cpu.clock();
        assert!(!cpu.halted());
        assert_eq!(cpu.pc, 0x40);
    }

    #[test]
    fn test_halt_bug_repeats_next_fetch() {
        let mut cpu = Cpu::default();
        cpu.bus.set_boot_active(false);
        cpu.bus.ie = 0x01;
        cpu.bus.ppu().set_int_vblank(true);
        cpu.set_ime(false);
        cpu.pc = 0xc000;

        // HALT, then INC A twice: the bug replays the INC A byte once.
        cpu.bus.write(0xc000, 0x76);
        cpu.bus.write(0xc001, 0x3c);
        cpu.bus.write(0xc002, 0x3c);

        cpu.clock(); // HALT: triggers the bug, does not actually halt
        assert!(!cpu.halted());
        assert_eq!(cpu.pc, 0xc001);

        cpu.clock(); // replayed INC A: fetch doesn't advance past itself
        assert_eq!(cpu.a, 0x01);
        assert_eq!(cpu.pc, 0xc001);

        cpu.clock(); // second INC A, fetch resumes advancing normally
        assert_eq!(cpu.a, 0x02);
        assert_eq!(cpu.pc, 0xc002);
    }

    #[test]
    fn test_interrupt_priority_services_lowest_bit_first() {
        let mut cpu = Cpu::default();
        cpu.bus.set_boot_active(false);
        cpu.bus.ie = 0x1f;
        cpu.set_ime(true);
        cpu.sp = 0xd000;
        cpu.pc = 0xc000;
        cpu.bus.ppu().set_int_stat(true);
        cpu.bus.timer().set_int_tima(true);

        cpu.clock();
        assert_eq!(cpu.pc, 0x48);
        assert!(!cpu.ime());
        assert!(cpu.bus.timer().int_tima());
    }
}
