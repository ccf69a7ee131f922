//! OBD-II PID Definitions and Supported-PID Discovery
//!
//! Names the common service 01 PIDs and decodes the "supported PIDs"
//! bitmaps returned for PIDs 0x00, 0x20, 0x40, ...

use serde::{Deserialize, Serialize};

/// Standard OBD-II PIDs for Mode 01 (current data)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Pid {
    /// Supported PIDs 0x01-0x20 (0x00)
    SupportedPids01To20 = 0x00,
    /// Calculated engine load (0x04)
    EngineLoad = 0x04,
    /// Engine coolant temperature (0x05)
    CoolantTemp = 0x05,
    /// Short-term fuel trim bank 1 (0x06)
    ShortFuelTrim = 0x06,
    /// Long-term fuel trim bank 1 (0x07)
    LongFuelTrim = 0x07,
    /// Intake manifold absolute pressure (0x0B)
    IntakeManifoldPressure = 0x0B,
    /// Engine RPM (0x0C)
    Rpm = 0x0C,
    /// Vehicle speed (0x0D)
    Speed = 0x0D,
    /// Mass air flow rate (0x10)
    Maf = 0x10,
    /// Throttle position (0x11)
    ThrottlePosition = 0x11,
    /// Oxygen sensor voltage bank 1, sensor 1 (0x14)
    O2Voltage = 0x14,
    /// Control module voltage (0x42)
    ControlModuleVoltage = 0x42,
}

impl Pid {
    /// Get the PID hex value
    pub fn as_hex(&self) -> u8 {
        *self as u8
    }
}

impl From<Pid> for u8 {
    fn from(pid: Pid) -> Self {
        pid.as_hex()
    }
}

/// Highest group the supported-PID walk will query
const LAST_GROUP: u8 = 0xC0;

/// PIDs the vehicle reported as supported
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupportedPids {
    pids: Vec<u8>,
}

impl SupportedPids {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode the 4-byte bitmap answering `01 <group>`.
    ///
    /// Bit 7 of the first byte stands for `group + 1`, bit 0 of the last byte
    /// for `group + 32`. Extra bytes are ignored.
    pub fn extend_from_bitmap(&mut self, group: u8, bitmap: &[u8]) {
        for (byte_index, byte) in bitmap.iter().take(4).enumerate() {
            for bit in 0..8u8 {
                if byte & (0x80 >> bit) == 0 {
                    continue;
                }
                let offset = byte_index as u16 * 8 + bit as u16 + 1;
                let pid = group as u16 + offset;
                if pid <= u8::MAX as u16 && !self.pids.contains(&(pid as u8)) {
                    self.pids.push(pid as u8);
                }
            }
        }
    }

    /// Whether the group after `group` is advertised and worth querying
    pub fn next_group(&self, group: u8) -> Option<u8> {
        if group >= LAST_GROUP {
            return None;
        }
        let next = group + 0x20;
        self.contains(next).then_some(next)
    }

    /// Linear membership test; the list never exceeds 224 entries
    pub fn contains(&self, pid: u8) -> bool {
        self.pids.iter().any(|p| *p == pid)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.pids
    }

    pub fn len(&self) -> usize {
        self.pids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pids.is_empty()
    }

    pub fn clear(&mut self) {
        self.pids.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitmap_decode() {
        // BE 1F A8 13: the classic example reply for 01 00
        let mut supported = SupportedPids::new();
        supported.extend_from_bitmap(0x00, &[0xBE, 0x1F, 0xA8, 0x13]);

        for pid in [
            0x01, 0x03, 0x04, 0x05, 0x06, 0x07, 0x0C, 0x0D, 0x0E, 0x0F, 0x10, 0x11, 0x13, 0x15,
            0x1C, 0x1F, 0x20,
        ] {
            assert!(supported.contains(pid), "PID {:02X} should be supported", pid);
        }
        assert!(!supported.contains(0x02));
        assert!(!supported.contains(0x0A));
        assert_eq!(supported.len(), 17);
    }

    #[test]
    fn test_next_group_follows_last_bit() {
        let mut supported = SupportedPids::new();
        supported.extend_from_bitmap(0x00, &[0x00, 0x00, 0x00, 0x01]);
        assert_eq!(supported.next_group(0x00), Some(0x20));
        assert_eq!(supported.next_group(0x20), None);

        supported.extend_from_bitmap(0xC0, &[0xFF, 0xFF, 0xFF, 0xFF]);
        assert!(supported.contains(0xE0));
        assert_eq!(supported.next_group(0xC0), None);
    }

    #[test]
    fn test_short_bitmap_and_duplicates() {
        let mut supported = SupportedPids::new();
        supported.extend_from_bitmap(0x00, &[0x80]);
        supported.extend_from_bitmap(0x00, &[0x80]);
        assert_eq!(supported.as_slice(), &[0x01]);
        assert_eq!(Pid::Rpm.as_hex(), 0x0C);
    }
}
