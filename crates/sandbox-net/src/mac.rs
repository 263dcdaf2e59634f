//! Deterministic, locally-administered MAC addresses for TAP devices.

use std::fmt;

/// A 48-bit MAC address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddr([u8; 6]);

impl MacAddr {
    /// Derive the guest MAC for device index `index`.
    ///
    /// The first octet is `0x02` (locally administered, unicast); the low
    /// 32 bits carry the index, so distinct indices never collide.
    pub fn from_index(index: u32) -> Self {
        let [a, b, c, d] = index.to_be_bytes();
        MacAddr([0x02, 0x00, a, b, c, d])
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_index_formats() {
        assert_eq!(MacAddr::from_index(0).to_string(), "02:00:00:00:00:00");
        assert_eq!(MacAddr::from_index(5).to_string(), "02:00:00:00:00:05");
        assert_eq!(MacAddr::from_index(0x0102_0304).to_string(), "02:00:01:02:03:04");
    }

    #[test]
    fn test_locally_administered_unicast() {
        let first = MacAddr::from_index(77).octets()[0];
        assert_eq!(first & 0b10, 0b10, "locally administered bit set");
        assert_eq!(first & 0b01, 0, "multicast bit clear");
    }

    #[test]
    fn test_distinct_indices_distinct_macs() {
        assert_ne!(MacAddr::from_index(1), MacAddr::from_index(256));
    }
}
