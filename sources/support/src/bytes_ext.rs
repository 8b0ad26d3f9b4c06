use anyhow::anyhow;

macro_rules! impl_safebuf {
    ( $($type:ty),* ) => {
        /// Checked big-endian reads over a `bytes::Buf`.
        pub trait SafeBuf: bytes::Buf {
            paste::paste! {
                $(
                fn [<try_get_ $type>](&mut self) -> anyhow::Result<$type> {
                    if self.remaining() >= std::mem::size_of::<$type>() {
                        Ok(self.[<get_ $type>]())
                    } else {
                        Err(anyhow!("out of bytes"))
                    }
                }
                )*
            }

            fn try_skip(&mut self, count: usize) -> anyhow::Result<()> {
                if self.remaining() >= count {
                    self.advance(count);
                    Ok(())
                } else {
                    Err(anyhow!("out of bytes (wanted to skip {}, had {})", count, self.remaining()))
                }
            }
        }

        impl<T: bytes::Buf> SafeBuf for T { }
    }
}

impl_safebuf!(u8, u16, u32, u64, i8, i16, i32, i64, f32, f64);

macro_rules! impl_byte_slice {
    ( $($type:ty),* ) => {
        /// Checked big-endian random access into a byte slice, used for
        /// patching bytecode and method-info in place.
        pub trait ByteSlice {
            paste::paste! {
                $(
                fn [<$type _at>](&self, pos: usize) -> anyhow::Result<$type>;
                fn [<put_ $type _at>](&mut self, pos: usize, value: $type) -> anyhow::Result<()>;
                )*
            }
        }

        impl ByteSlice for [u8] {
            paste::paste! {
                $(
                fn [<$type _at>](&self, pos: usize) -> anyhow::Result<$type> {
                    const WIDTH: usize = std::mem::size_of::<$type>();
                    let bytes = self
                        .get(pos..pos + WIDTH)
                        .ok_or_else(|| anyhow!("out of bytes reading {} at {} (len {})", stringify!($type), pos, self.len()))?;

                    let mut raw = [0u8; WIDTH];
                    raw.copy_from_slice(bytes);
                    Ok(<$type>::from_be_bytes(raw))
                }

                fn [<put_ $type _at>](&mut self, pos: usize, value: $type) -> anyhow::Result<()> {
                    const WIDTH: usize = std::mem::size_of::<$type>();
                    let len = self.len();
                    let bytes = self
                        .get_mut(pos..pos + WIDTH)
                        .ok_or_else(|| anyhow!("out of bytes writing {} at {} (len {})", stringify!($type), pos, len))?;

                    bytes.copy_from_slice(&value.to_be_bytes());
                    Ok(())
                }
                )*
            }
        }
    }
}

impl_byte_slice!(u8, i8, u16, i16, u32, i32);
