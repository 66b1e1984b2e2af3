use anyhow::{anyhow, bail};

const SEPARATOR: [u8; 2] = [0x00, 0x01];
const ESCAPED_00: [u8; 2] = [0x00, 0xff];

fn copy_escaped(mut from: &[u8], to: &mut Vec<u8>) {
    while !from.is_empty() {
        match from.iter().position(|x| *x == 0x00) {
            Some(idx) => {
                to.extend(&from[..idx + 1]);
                to.push(0xff);
                from = &from[(idx + 1)..];
            }
            None => {
                to.extend(from);
                return;
            }
        }
    }
}

fn copy_unescaped(mut from: &[u8], to: &mut Vec<u8>) {
    while !from.is_empty() {
        match from.windows(2).position(|w| w == ESCAPED_00) {
            Some(idx) => {
                to.extend(&from[..idx + 1]);
                from = &from[(idx + 2)..];
            }
            None => {
                to.extend(from);
                return;
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct KeyWriter {
    pub(crate) buf: Vec<u8>,
}

impl KeyWriter {
    pub fn new() -> Self {
        KeyWriter { buf: Vec::new() }
    }

    pub fn clear(&mut self) {
        self.buf.clear()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    fn write(&mut self, buf: &[u8]) {
        copy_escaped(buf, &mut self.buf);
    }

    fn separator(&mut self) {
        self.buf.extend(SEPARATOR);
    }
}

/// Splits an encoded buffer back into its fields.
///
/// Unlike the writer, the reader must cope with arbitrary input: every method
/// returns an error instead of panicking when the buffer does not hold what
/// the caller asked for.
pub struct KeyReader<'a> {
    buf: &'a [u8],
    from: usize,
    scratch: Vec<u8>,
}

impl<'a> KeyReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        KeyReader {
            buf,
            from: 0,
            scratch: Vec::new(),
        }
    }

    pub fn next(&mut self) -> anyhow::Result<&[u8]> {
        if self.from > self.buf.len() {
            bail!("unexpected end of encoded value");
        }
        let rest = &self.buf[self.from..];
        let split_position = rest
            .windows(2)
            .position(|x| x == SEPARATOR)
            .unwrap_or(rest.len());

        self.scratch.clear();
        copy_unescaped(&rest[..split_position], &mut self.scratch);
        self.from += split_position + 2;

        Ok(&self.scratch)
    }

    // Errors if there are fields that nobody asked for.
    pub fn finish(&self) -> anyhow::Result<()> {
        if self.from <= self.buf.len() {
            bail!(
                "{} trailing bytes after encoded value",
                self.buf.len() + 2 - self.from
            );
        }
        Ok(())
    }
}

pub trait Encode: std::fmt::Debug {
    fn write_bytes(&self, kw: &mut KeyWriter);
}

pub trait Decode: Sized {
    fn decode(kr: &mut KeyReader) -> anyhow::Result<Self>;
}

// Decodes a complete buffer, rejecting trailing data.
pub fn decode_exact<T: Decode>(buf: &[u8]) -> anyhow::Result<T> {
    let mut kr = KeyReader::new(buf);
    let v = T::decode(&mut kr)?;
    kr.finish()?;
    Ok(v)
}

fn fixed<const N: usize>(kr: &mut KeyReader) -> anyhow::Result<[u8; N]> {
    let field = kr.next()?;
    field
        .try_into()
        .map_err(|_| anyhow!("expected {} byte field, found {}", N, field.len()))
}

impl<T: Encode> Encode for Vec<T> {
    fn write_bytes(&self, kw: &mut KeyWriter) {
        (self.len() as u64).write_bytes(kw);
        for v in self {
            kw.separator();
            v.write_bytes(kw);
        }
    }
}

impl<T: Decode> Decode for Vec<T> {
    fn decode(kr: &mut KeyReader) -> anyhow::Result<Self> {
        let len = u64::decode(kr)?;
        // Every element takes at least a separator, so a length larger than
        // the buffer is garbage. Don't trust it for the allocation.
        if len > kr.buf.len() as u64 {
            bail!("sequence length {} exceeds encoded size", len);
        }
        let mut result = Vec::with_capacity(len as usize);
        for _ in 0..len {
            result.push(T::decode(kr)?);
        }
        Ok(result)
    }
}

impl Encode for String {
    fn write_bytes(&self, kw: &mut KeyWriter) {
        kw.write(self.as_bytes())
    }
}

impl Decode for String {
    fn decode(kr: &mut KeyReader) -> anyhow::Result<Self> {
        let result = String::from_utf8(kr.next()?.to_vec())?;
        Ok(result)
    }
}

impl Encode for u32 {
    fn write_bytes(&self, kw: &mut KeyWriter) {
        kw.write(&self.to_le_bytes())
    }
}

impl Decode for u32 {
    fn decode(kr: &mut KeyReader) -> anyhow::Result<Self> {
        Ok(Self::from_le_bytes(fixed(kr)?))
    }
}

impl Encode for u64 {
    fn write_bytes(&self, kw: &mut KeyWriter) {
        kw.write(&self.to_le_bytes())
    }
}

impl Decode for u64 {
    fn decode(kr: &mut KeyReader) -> anyhow::Result<Self> {
        Ok(Self::from_le_bytes(fixed(kr)?))
    }
}

impl Encode for i64 {
    fn write_bytes(&self, kw: &mut KeyWriter) {
        kw.write(&self.to_le_bytes())
    }
}

impl Decode for i64 {
    fn decode(kr: &mut KeyReader) -> anyhow::Result<Self> {
        Ok(Self::from_le_bytes(fixed(kr)?))
    }
}

impl Encode for f64 {
    fn write_bytes(&self, kw: &mut KeyWriter) {
        kw.write(&self.to_bits().to_le_bytes())
    }
}

impl Decode for f64 {
    fn decode(kr: &mut KeyReader) -> anyhow::Result<Self> {
        Ok(Self::from_bits(u64::from_le_bytes(fixed(kr)?)))
    }
}

impl<A> Encode for &A
where
    A: Encode,
{
    fn write_bytes(&self, kw: &mut KeyWriter) {
        (*self).write_bytes(kw)
    }
}

impl<A, B> Encode for (A, B)
where
    A: Encode,
    B: Encode,
{
    fn write_bytes(&self, kw: &mut KeyWriter) {
        self.0.write_bytes(kw);
        kw.separator();
        self.1.write_bytes(kw);
    }
}

impl<A, B> Decode for (A, B)
where
    A: Decode,
    B: Decode,
{
    fn decode(kr: &mut KeyReader) -> anyhow::Result<Self> {
        let a = A::decode(kr)?;
        let b = B::decode(kr)?;
        Ok((a, b))
    }
}
