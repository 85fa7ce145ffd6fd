use bytes::Buf;

/// Big-endian reads that return `None` instead of panicking when the buffer
/// runs short. Everything read off the wire goes through these.
pub(crate) trait BufExt: Buf {
    fn get_u8_checked(&mut self) -> Option<u8> {
        if self.remaining() < 1 {
            return None;
        }
        Some(self.get_u8())
    }

    fn get_u16_checked(&mut self) -> Option<u16> {
        if self.remaining() < 2 {
            return None;
        }
        Some(self.get_u16())
    }

    fn get_u32_checked(&mut self) -> Option<u32> {
        if self.remaining() < 4 {
            return None;
        }
        Some(self.get_u32())
    }
}

impl<T: Buf + ?Sized> BufExt for T {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    pub fn checked_reads_stop_at_end() {
        let mut buf = &[0x01u8, 0x02, 0x03][..];
        assert_eq!(buf.get_u16_checked(), Some(0x0102));
        assert_eq!(buf.get_u16_checked(), None);
        assert_eq!(buf.get_u8_checked(), Some(0x03));
        assert_eq!(buf.get_u8_checked(), None);
    }
}
