use crc::{Crc, CRC_16_IBM_3740};

/// CRC-16/CCITT-FALSE (poly 0x1021, init 0xFFFF, no reflection)
const CCITT_FALSE: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// Checksum over a header or extra-data region
pub fn crc16(bytes: &[u8]) -> u16 {
    CCITT_FALSE.checksum(bytes)
}
