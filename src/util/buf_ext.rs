use anyhow::anyhow;
use bytes::{Buf, BufMut};
use crate::util::safe_cast::PrecheckedCast;

macro_rules! get_try_impl {
    ($try_getter: ident, $ty:ty, $getter: ident) => {
        fn $try_getter(&mut self) -> anyhow::Result<$ty> {
            if self.remaining() < std::mem::size_of::<$ty>() {
                return Err(anyhow!("buffer underflow"));
            }
            Ok(self.$getter())
        }
    }
}

/// Checked big-endian getters for control payloads. Everything on the wire is network byte order.
pub trait BufExt: Buf {
    get_try_impl!(try_read_u8, u8, get_u8);
    get_try_impl!(try_read_u16, u16, get_u16);
    get_try_impl!(try_read_u32, u32, get_u32);

    fn try_read_string(&mut self) -> anyhow::Result<String> {
        let len = self.try_read_u16()? as usize;
        if self.remaining() < len {
            return Err(anyhow!("buffer underflow"));
        }
        let mut raw = vec![0u8; len];
        self.copy_to_slice(&mut raw);
        Ok(String::from_utf8(raw)?)
    }

    fn try_read_string_list(&mut self) -> anyhow::Result<Vec<String>> {
        let n = self.try_read_u16()?;
        let mut result = Vec::with_capacity(n as usize);
        for _ in 0..n {
            result.push(self.try_read_string()?);
        }
        Ok(result)
    }
}

pub trait BufMutExt: BufMut {
    /// NB: callers are responsible for keeping strings below 64k
    fn put_string(&mut self, s: &str) {
        self.put_u16(s.len().prechecked_cast());
        self.put_slice(s.as_bytes());
    }

    fn put_string_list<'a>(&mut self, items: impl ExactSizeIterator<Item = &'a String>) {
        self.put_u16(items.len().prechecked_cast());
        for s in items {
            self.put_string(s);
        }
    }
}

impl <T: Buf> BufExt for T {
}

impl <T: BufMut> BufMutExt for T {
}
