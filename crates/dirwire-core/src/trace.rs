//! Raw wire tracing.

use std::io::Write;

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Sent,
    Received,
}

impl Direction {
    fn label(self) -> &'static str {
        match self {
            Self::Sent => "Write buffer",
            Self::Received => "Read buffer",
        }
    }
}

/// Sink for every frame written to or read from the wire.
pub trait WireTrace: Send + Sync + 'static {
    fn record(&self, direction: Direction, bytes: &[u8]);
}

/// Writes a hex and ASCII dump of each frame, 16 bytes per line.
pub struct HexDumpTrace<W> {
    out: Mutex<W>,
}

impl<W: Write + Send + 'static> HexDumpTrace<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner()
    }
}

pub(crate) fn hex_dump(out: &mut impl Write, bytes: &[u8]) -> std::io::Result<()> {
    for (line, chunk) in bytes.chunks(16).enumerate() {
        write!(out, "{:04x}: ", line * 16)?;
        for i in 0..16 {
            match chunk.get(i) {
                Some(b) => write!(out, "{b:02x} ")?,
                None => write!(out, "   ")?,
            }
        }
        write!(out, " ")?;
        for b in chunk {
            let c = if b.is_ascii_graphic() || *b == b' ' {
                *b as char
            } else {
                '.'
            };
            write!(out, "{c}")?;
        }
        writeln!(out)?;
    }
    Ok(())
}

impl<W: Write + Send + 'static> WireTrace for HexDumpTrace<W> {
    fn record(&self, direction: Direction, bytes: &[u8]) {
        let mut out = self.out.lock();
        let result = writeln!(out, "{} [{} bytes]", direction.label(), bytes.len())
            .and_then(|()| hex_dump(&mut *out, bytes))
            .and_then(|()| writeln!(out))
            .and_then(|()| out.flush());
        if let Err(e) = result {
            tracing::debug!(error = %e, "wire trace write failed");
        }
    }
}

/// Emits each frame as a `tracing` event at trace level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingWireTrace;

impl WireTrace for TracingWireTrace {
    fn record(&self, direction: Direction, bytes: &[u8]) {
        let mut dump = Vec::with_capacity(bytes.len() * 4);
        if hex_dump(&mut dump, bytes).is_ok() {
            tracing::trace!(
                ?direction,
                len = bytes.len(),
                "wire frame\n{}",
                String::from_utf8_lossy(&dump)
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dumps_hex_and_ascii() {
        let trace = HexDumpTrace::new(Vec::new());
        trace.record(Direction::Received, b"0\x05\x02\x01\x01AB");
        let text = String::from_utf8(trace.into_inner()).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("Read buffer [7 bytes]"));
        let row = lines.next().unwrap();
        assert!(row.starts_with("0000: 30 05 02 01 01 41 42 "));
        assert!(row.ends_with(" 0....AB"));
    }

    #[test]
    fn wraps_every_sixteen_bytes() {
        let mut out = Vec::new();
        hex_dump(&mut out, &[0u8; 20]).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(text.lines().nth(1).unwrap().starts_with("0010: "));
    }
}
