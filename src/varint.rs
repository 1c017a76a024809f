use bytes::{Buf, BufMut};

//  +------+--------+-------------+-----------------------+
//  | 2Bit | Length | Usable Bits | Range                 |
//  +------+--------+-------------+-----------------------+
//  | 00   | 1      | 6           | 0-63                  |
//  |      |        |             |                       |
//  | 01   | 2      | 14          | 0-16383               |
//  |      |        |             |                       |
//  | 10   | 4      | 30          | 0-1073741823          |
//  |      |        |             |                       |
//  | 11   | 8      | 62          | 0-4611686018427387903 |
//  +------+--------+-------------+-----------------------+

const ONE_OCTET_MAX: u64 = 63;
const TWO_OCTETS_MAX: u64 = 16383;
const FOUR_OCTETS_MAX: u64 = 1_073_741_823;
const EIGHT_OCTETS_MAX: u64 = 4_611_686_018_427_387_903;

/// Number of bytes in the smallest encoding of `x`, if it's representable
pub fn size(x: u64) -> Option<usize> {
    if x <= ONE_OCTET_MAX {
        Some(1)
    } else if x <= TWO_OCTETS_MAX {
        Some(2)
    } else if x <= FOUR_OCTETS_MAX {
        Some(4)
    } else if x <= EIGHT_OCTETS_MAX {
        Some(8)
    } else {
        None
    }
}

pub fn read<R: Buf>(r: &mut R) -> Option<u64> {
    if !r.has_remaining() {
        return None;
    }
    let mut buf = [0; 8];
    buf[0] = r.chunk()[0];
    r.advance(1);
    let tag = buf[0] >> 6;
    buf[0] &= 0b0011_1111;
    Some(match tag {
        0b00 => u64::from(buf[0]),
        0b01 => {
            if r.remaining() < 1 {
                return None;
            }
            r.copy_to_slice(&mut buf[1..2]);
            u64::from(u16::from_be_bytes(buf[..2].try_into().unwrap()))
        }
        0b10 => {
            if r.remaining() < 3 {
                return None;
            }
            r.copy_to_slice(&mut buf[1..4]);
            u64::from(u32::from_be_bytes(buf[..4].try_into().unwrap()))
        }
        _ => {
            if r.remaining() < 7 {
                return None;
            }
            r.copy_to_slice(&mut buf[1..8]);
            u64::from_be_bytes(buf)
        }
    })
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum WriteError {
    InsufficientSpace,
    OversizedValue,
}

pub fn write<W: BufMut>(x: u64, w: &mut W) -> Result<(), WriteError> {
    if x <= ONE_OCTET_MAX {
        if w.remaining_mut() < 1 {
            return Err(WriteError::InsufficientSpace);
        }
        w.put_u8(x as u8);
    } else if x <= TWO_OCTETS_MAX {
        if w.remaining_mut() < 2 {
            return Err(WriteError::InsufficientSpace);
        }
        w.put_u16(0b01 << 14 | x as u16);
    } else if x <= FOUR_OCTETS_MAX {
        if w.remaining_mut() < 4 {
            return Err(WriteError::InsufficientSpace);
        }
        w.put_u32(0b10 << 30 | x as u32);
    } else if x <= EIGHT_OCTETS_MAX {
        if w.remaining_mut() < 8 {
            return Err(WriteError::InsufficientSpace);
        }
        w.put_u64(0b11 << 62 | x);
    } else {
        return Err(WriteError::OversizedValue);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io;

    #[test]
    fn sizes() {
        assert_eq!(size(0), Some(1));
        assert_eq!(size(63), Some(1));

        assert_eq!(size(64), Some(2));
        assert_eq!(size(16383), Some(2));

        assert_eq!(size(16384), Some(4));
        assert_eq!(size(1_073_741_823), Some(4));

        assert_eq!(size(1_073_741_824), Some(8));
        assert_eq!(size(4_611_686_018_427_387_903), Some(8));

        assert_eq!(size(4_611_686_018_427_387_904), None);
        assert_eq!(size(u64::MAX), None);
    }

    fn roundtrip(x: u64) {
        let mut buf = Vec::new();
        write(x, &mut buf).unwrap();
        assert_eq!(buf.len(), size(x).unwrap());
        let mut r = io::Cursor::new(&buf);
        assert_eq!(read(&mut r), Some(x));
        assert_eq!(r.position() as usize, buf.len());
    }

    #[test]
    fn roundtrips() {
        for x in [
            0,
            1,
            63,
            64,
            255,
            256,
            16383,
            16384,
            65535,
            65536,
            1_073_741_823,
            1_073_741_824,
            0xFFFF_FFFF,
            0x1_0000_0000,
            0x3FFF_FFFF_FFFF_FFFF,
        ] {
            roundtrip(x);
        }
    }

    #[test]
    fn two_octet_form() {
        let mut buf = Vec::new();
        write(0x3FFF, &mut buf).unwrap();
        assert_eq!(&buf[..], [0x7F, 0xFF]);
    }

    #[test]
    fn eight_octet_form() {
        let mut buf = Vec::new();
        write(151_288_809_941_952_652, &mut buf).unwrap();
        assert_eq!(&buf[..], [0xC2, 0x19, 0x7C, 0x5E, 0xFF, 0x14, 0xE8, 0x8C]);
    }

    #[test]
    fn truncated_reads_fail() {
        for x in [64u64, 16384, 1_073_741_824, 0x1_0000_0000] {
            let mut buf = Vec::new();
            write(x, &mut buf).unwrap();
            for len in 0..buf.len() {
                assert_eq!(read(&mut io::Cursor::new(&buf[..len])), None);
            }
        }
    }

    #[test]
    fn insufficient_space() {
        let mut buf = [0u8; 1];
        let mut w = &mut buf[..];
        let err = write(100, &mut w).unwrap_err();
        assert_eq!(err, WriteError::InsufficientSpace);
    }

    #[test]
    fn oversized_value() {
        let mut buf = [0u8; 8];
        let mut w = &mut buf[..];
        let err = write(0x4000_0000_0000_0000, &mut w).unwrap_err();
        assert_eq!(err, WriteError::OversizedValue);
    }
}
