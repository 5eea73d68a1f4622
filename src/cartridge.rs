use std::{
    fs, io,
    path::Path,
    time::SystemTime,
};

use thiserror::Error;

const ROM_BANK_SIZE: usize = 0x4000;
const RAM_BANK_SIZE: usize = 0x2000;

/// Fatal startup conditions while loading a ROM image.
#[derive(Debug, Error)]
pub enum CartridgeError {
    #[error("failed to read ROM: {0}")]
    Io(#[from] io::Error),
    #[error("ROM image is {0} bytes, smaller than one 16 KiB bank")]
    TooSmall(usize),
    #[error("unknown mapper byte {0:#04X} in cartridge header")]
    UnknownMapper(u8),
}

/// Mapper chip selected by header byte 0x0147. MBC2 and MBC5 are extension
/// points; ROMs that request them are rejected at load time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MbcType {
    NoMbc,
    Mbc1,
    Mbc3,
}

pub struct Cartridge {
    pub rom: Vec<u8>,
    pub ram: Vec<u8>,
    pub mbc: MbcType,
    pub title: String,
    mbc_state: MbcState,
}

enum MbcState {
    NoMbc,
    Mbc1 {
        rom_bank: u8,
        ram_bank: u8,
        ram_enable: bool,
    },
    Mbc3 {
        rom_bank: u8,
        ram_bank: u8,
        ram_enable: bool,
        /// RAM mapped at 0xA000 (as opposed to the selected RTC register).
        ram_mapped: bool,
        /// Selected RTC register, 0x08..=0x0C, while RTC is mapped.
        rtc_select: u8,
        latch_pending: bool,
        rtc: Rtc,
    },
}

impl Cartridge {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, CartridgeError> {
        let data = fs::read(path)?;
        let cart = Self::load(data)?;
        log::info!(
            "loaded ROM: {} (mapper: {:?}, RAM: {} bytes)",
            cart.title,
            cart.mbc,
            cart.ram.len()
        );
        Ok(cart)
    }

    /// Builds a cartridge from an in-memory image.
    pub fn load(data: Vec<u8>) -> Result<Self, CartridgeError> {
        if data.len() < ROM_BANK_SIZE {
            return Err(CartridgeError::TooSmall(data.len()));
        }
        let header = Header::parse(&data);
        let mbc = header.mbc_type()?;
        let ram_size = header.ram_size();
        let title = header.title();

        let mbc_state = match mbc {
            MbcType::NoMbc => MbcState::NoMbc,
            MbcType::Mbc1 => MbcState::Mbc1 {
                rom_bank: 1,
                ram_bank: 0,
                ram_enable: false,
            },
            MbcType::Mbc3 => MbcState::Mbc3 {
                rom_bank: 1,
                ram_bank: 0,
                ram_enable: false,
                ram_mapped: true,
                rtc_select: 0x08,
                latch_pending: false,
                rtc: Rtc::new(),
            },
        };

        Ok(Self {
            rom: data,
            ram: vec![0; ram_size],
            mbc,
            title,
            mbc_state,
        })
    }

    pub fn read(&self, addr: u16) -> u8 {
        match (&self.mbc_state, addr) {
            (MbcState::NoMbc, 0x0000..=0x7FFF) => {
                self.rom.get(addr as usize).copied().unwrap_or(0xFF)
            }
            (MbcState::NoMbc, 0xA000..=0xBFFF) => self
                .ram
                .get(addr as usize - 0xA000)
                .copied()
                .unwrap_or(0xFF),
            (MbcState::Mbc1 { .. }, 0x0000..=0x3FFF)
            | (MbcState::Mbc3 { .. }, 0x0000..=0x3FFF) => {
                self.rom.get(addr as usize).copied().unwrap_or(0xFF)
            }
            (MbcState::Mbc1 { rom_bank, .. }, 0x4000..=0x7FFF)
            | (MbcState::Mbc3 { rom_bank, .. }, 0x4000..=0x7FFF) => {
                let offset = (addr as usize - 0x4000) + ROM_BANK_SIZE * *rom_bank as usize;
                self.rom.get(offset).copied().unwrap_or(0xFF)
            }
            (MbcState::Mbc1 { ram_bank, .. }, 0xA000..=0xBFFF) => {
                let offset = (addr as usize - 0xA000) + RAM_BANK_SIZE * *ram_bank as usize;
                self.ram.get(offset).copied().unwrap_or(0xFF)
            }
            (
                MbcState::Mbc3 {
                    ram_bank,
                    ram_mapped,
                    rtc_select,
                    rtc,
                    ..
                },
                0xA000..=0xBFFF,
            ) => {
                if *ram_mapped {
                    let offset = (addr as usize - 0xA000) + RAM_BANK_SIZE * *ram_bank as usize;
                    self.ram.get(offset).copied().unwrap_or(0xFF)
                } else {
                    rtc.read(*rtc_select)
                }
            }
            _ => {
                log::debug!("cartridge read from unmapped address {addr:#06X}");
                0xFF
            }
        }
    }

    pub fn write(&mut self, addr: u16, val: u8) {
        match (&mut self.mbc_state, addr) {
            (MbcState::NoMbc, 0xA000..=0xBFFF) => {
                if let Some(b) = self.ram.get_mut(addr as usize - 0xA000) {
                    *b = val;
                }
            }
            (MbcState::Mbc1 { ram_enable, .. }, 0x0000..=0x1FFF)
            | (MbcState::Mbc3 { ram_enable, .. }, 0x0000..=0x1FFF) => {
                // Any value written here counts as an enable.
                *ram_enable = true;
            }
            (MbcState::Mbc1 { rom_bank, .. }, 0x2000..=0x3FFF) => {
                *rom_bank = match val {
                    0x00 => 0x01,
                    0x20 => 0x21,
                    0x40 => 0x41,
                    0x60 => 0x61,
                    _ => val & 0x1F,
                };
            }
            (MbcState::Mbc3 { rom_bank, .. }, 0x2000..=0x3FFF) => {
                *rom_bank = if val == 0 { 0x01 } else { val & 0x7F };
            }
            (
                MbcState::Mbc3 {
                    ram_bank,
                    ram_mapped,
                    rtc_select,
                    ..
                },
                0x4000..=0x5FFF,
            ) => match val {
                0x00..=0x03 => {
                    *ram_mapped = true;
                    *ram_bank = val;
                }
                0x08..=0x0C => {
                    *ram_mapped = false;
                    *rtc_select = val;
                }
                _ => log::debug!("MBC3 bank select ignored value {val:#04X}"),
            },
            (
                MbcState::Mbc3 {
                    latch_pending, rtc, ..
                },
                0x6000..=0x7FFF,
            ) => {
                // Two-step latch: a 0x00 write followed by a 0x01 write takes
                // a fresh snapshot of the clock.
                if val == 0x00 {
                    *latch_pending = true;
                } else if val == 0x01 && *latch_pending {
                    rtc.latch();
                    *latch_pending = false;
                } else {
                    *latch_pending = false;
                }
            }
            (
                MbcState::Mbc1 {
                    ram_bank,
                    ram_enable,
                    ..
                },
                0xA000..=0xBFFF,
            ) => {
                if *ram_enable {
                    let offset = (addr as usize - 0xA000) + RAM_BANK_SIZE * *ram_bank as usize;
                    if let Some(b) = self.ram.get_mut(offset) {
                        *b = val;
                    }
                }
            }
            (
                MbcState::Mbc3 {
                    ram_bank,
                    ram_enable,
                    ram_mapped,
                    rtc_select,
                    rtc,
                    ..
                },
                0xA000..=0xBFFF,
            ) => {
                if *ram_mapped {
                    if *ram_enable {
                        let offset =
                            (addr as usize - 0xA000) + RAM_BANK_SIZE * *ram_bank as usize;
                        if let Some(b) = self.ram.get_mut(offset) {
                            *b = val;
                        }
                    }
                } else {
                    rtc.write(*rtc_select, val);
                }
            }
            _ => {
                log::debug!("unhandled mapper write {addr:#06X} <- {val:#04X}");
            }
        }
    }
}

/// MBC3 real-time clock.
///
/// The wall clock is sampled at cartridge load; each latch recomputes the
/// register set from the time elapsed since then, unless the halt flag in the
/// control register is set.
struct Rtc {
    start: SystemTime,
    /// Latched S, M, H, day-low, control registers in that order.
    latched: [u8; 5],
}

impl Rtc {
    fn new() -> Self {
        Self {
            start: SystemTime::now(),
            latched: [0; 5],
        }
    }

    fn latch(&mut self) {
        if self.halted() {
            return;
        }
        let elapsed = SystemTime::now()
            .duration_since(self.start)
            .unwrap_or_default()
            .as_secs();
        self.latched = rtc_snapshot(elapsed, false);
    }

    fn halted(&self) -> bool {
        self.latched[4] & 0x40 != 0
    }

    fn read(&self, reg: u8) -> u8 {
        match reg {
            0x08..=0x0C => self.latched[(reg - 0x08) as usize],
            _ => 0xFF,
        }
    }

    fn write(&mut self, reg: u8, val: u8) {
        if let 0x08..=0x0C = reg {
            self.latched[(reg - 0x08) as usize] = val;
        }
    }
}

/// RTC register set for a given number of elapsed seconds: seconds, minutes,
/// hours, day-low, and the control byte (day bit 8, halt flag, day carry).
fn rtc_snapshot(total_seconds: u64, halted: bool) -> [u8; 5] {
    let seconds = (total_seconds % 60) as u8;
    let minutes = (total_seconds / 60 % 60) as u8;
    let hours = (total_seconds / 3600 % 24) as u8;
    let days = total_seconds / 86400;

    let mut control = ((days >> 8) & 0x01) as u8;
    if halted {
        control |= 0x40;
    }
    if days > 0x1FF {
        control |= 0x80;
    }
    [seconds, minutes, hours, (days & 0xFF) as u8, control]
}

/// Read-only view over the cartridge header fields the core consults.
struct Header<'a> {
    data: &'a [u8],
}

impl<'a> Header<'a> {
    fn parse(data: &'a [u8]) -> Self {
        Self { data }
    }

    fn title(&self) -> String {
        let end = 0x0143.min(self.data.len());
        let mut slice = &self.data[0x0134.min(self.data.len())..end];
        if let Some(pos) = slice.iter().position(|&b| b == 0) {
            slice = &slice[..pos];
        }
        String::from_utf8_lossy(slice).trim().to_string()
    }

    fn mbc_type(&self) -> Result<MbcType, CartridgeError> {
        let code = self.data.get(0x0147).copied().unwrap_or(0);
        match code {
            0x00 => Ok(MbcType::NoMbc),
            0x01..=0x03 | 0xFF => Ok(MbcType::Mbc1),
            0x0F..=0x13 => Ok(MbcType::Mbc3),
            _ => Err(CartridgeError::UnknownMapper(code)),
        }
    }

    fn ram_size(&self) -> usize {
        match self.data.get(0x0148).copied().unwrap_or(0) {
            0x00 => 0,
            0x01 => 0x800,
            0x02 => 0x2000,
            0x03 => 0x8000,
            0x04 => 0x20000,
            0x05 => 0x10000,
            code => {
                log::warn!("unknown RAM size code {code:#04X}, assuming none");
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rtc_snapshot_splits_fields() {
        // 2 days, 3 hours, 4 minutes, 5 seconds
        let secs = 2 * 86400 + 3 * 3600 + 4 * 60 + 5;
        assert_eq!(rtc_snapshot(secs, false), [5, 4, 3, 2, 0]);
    }

    #[test]
    fn rtc_snapshot_day_high_bit_and_carry() {
        let regs = rtc_snapshot(300 * 86400, false);
        assert_eq!(regs[3], (300 % 256) as u8);
        assert_eq!(regs[4] & 0x01, 0x01);

        let regs = rtc_snapshot(600 * 86400, false);
        assert_eq!(regs[4] & 0x80, 0x80);
    }

    #[test]
    fn rtc_halt_flag_lands_in_control() {
        let regs = rtc_snapshot(90, true);
        assert_eq!(regs[..4], [30, 1, 0, 0]);
        assert_eq!(regs[4] & 0x40, 0x40);
    }

    #[test]
    fn rtc_write_while_halted_freezes_latch() {
        let mut rtc = Rtc::new();
        rtc.write(0x0C, 0x40); // halt
        rtc.write(0x08, 12);
        rtc.latch();
        assert_eq!(rtc.read(0x08), 12);
    }

    fn rom_with(mapper: u8, ram_code: u8, banks: usize) -> Vec<u8> {
        let mut rom = vec![0u8; ROM_BANK_SIZE * banks];
        rom[0x0147] = mapper;
        rom[0x0148] = ram_code;
        for bank in 0..banks {
            rom[bank * ROM_BANK_SIZE] = bank as u8;
        }
        rom
    }

    #[test]
    fn header_selects_the_mapper() {
        assert_eq!(Cartridge::load(rom_with(0x00, 0, 1)).unwrap().mbc, MbcType::NoMbc);
        assert_eq!(Cartridge::load(rom_with(0x01, 0, 2)).unwrap().mbc, MbcType::Mbc1);
        assert_eq!(Cartridge::load(rom_with(0xFF, 0, 2)).unwrap().mbc, MbcType::Mbc1);
        assert_eq!(Cartridge::load(rom_with(0x10, 3, 2)).unwrap().mbc, MbcType::Mbc3);
        assert!(matches!(
            Cartridge::load(rom_with(0x19, 0, 2)),
            Err(CartridgeError::UnknownMapper(0x19))
        ));
        assert!(matches!(
            Cartridge::load(vec![0u8; 0x100]),
            Err(CartridgeError::TooSmall(0x100))
        ));
    }

    #[test]
    fn ram_size_comes_from_the_header_table() {
        assert_eq!(Cartridge::load(rom_with(0x01, 0x00, 2)).unwrap().ram.len(), 0);
        assert_eq!(Cartridge::load(rom_with(0x01, 0x01, 2)).unwrap().ram.len(), 0x800);
        assert_eq!(Cartridge::load(rom_with(0x01, 0x03, 2)).unwrap().ram.len(), 0x8000);
        assert_eq!(Cartridge::load(rom_with(0x01, 0x05, 2)).unwrap().ram.len(), 0x10000);
    }

    #[test]
    fn mbc1_zero_banks_map_one_higher() {
        let mut cart = Cartridge::load(rom_with(0x01, 0, 0x40)).unwrap();
        cart.write(0x2000, 0x00);
        assert_eq!(cart.read(0x4000), 0x01);
        cart.write(0x2000, 0x20);
        assert_eq!(cart.read(0x4000), 0x21);
        cart.write(0x2000, 0x02);
        assert_eq!(cart.read(0x4000), 0x02);
    }

    #[test]
    fn mbc1_ram_needs_enable_for_writes() {
        let mut cart = Cartridge::load(rom_with(0x03, 0x02, 2)).unwrap();
        cart.write(0xA000, 0x55);
        assert_eq!(cart.read(0xA000), 0x00);
        cart.write(0x0000, 0x0A);
        cart.write(0xA000, 0x55);
        assert_eq!(cart.read(0xA000), 0x55);
    }

    #[test]
    fn mbc3_rom_bank_uses_seven_bits() {
        let mut cart = Cartridge::load(rom_with(0x11, 0, 0x80)).unwrap();
        cart.write(0x2000, 0x00);
        assert_eq!(cart.read(0x4000), 0x01);
        cart.write(0x2000, 0x7F);
        assert_eq!(cart.read(0x4000), 0x7F);
    }

    #[test]
    fn mbc3_switches_between_ram_and_rtc() {
        let mut cart = Cartridge::load(rom_with(0x10, 0x03, 2)).unwrap();
        cart.write(0x0000, 0x0A);
        cart.write(0x4000, 0x02); // RAM bank 2
        cart.write(0xA000, 0x42);
        assert_eq!(cart.read(0xA000), 0x42);

        cart.write(0x4000, 0x08); // RTC seconds register
        cart.write(0x6000, 0x00);
        cart.write(0x6000, 0x01); // latch
        assert!(cart.read(0xA000) < 60);

        cart.write(0x4000, 0x02);
        assert_eq!(cart.read(0xA000), 0x42);
    }

    #[test]
    fn out_of_range_ram_bank_reads_open_bus() {
        let mut cart = Cartridge::load(rom_with(0x10, 0x02, 2)).unwrap(); // one 8 KiB bank
        cart.write(0x0000, 0x0A);
        cart.write(0x4000, 0x03); // beyond the only bank
        assert_eq!(cart.read(0xA000), 0xFF);
        cart.write(0xA000, 0x99); // dropped, must not panic
        assert_eq!(cart.read(0xA000), 0xFF);
    }

    #[test]
    fn from_file_reads_the_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("game.gb");
        std::fs::write(&path, rom_with(0x01, 0x02, 2)).unwrap();
        let cart = Cartridge::from_file(&path).unwrap();
        assert_eq!(cart.mbc, MbcType::Mbc1);
        assert_eq!(cart.ram.len(), 0x2000);
    }
}
