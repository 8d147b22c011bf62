use std::io::{self, Write};

pub mod tactile;

/// Byte-oriented sink for protocol frames.
///
/// This is the only capability the encoder needs from a transport: write a
/// single command byte, write a whole frame, and flush. `flush` forces
/// delivery and is the synchronization point between operations. A blanket
/// implementation covers any `io::Write`, so both a serial port handle and
/// an in-memory buffer satisfy it.
pub trait FrameSink {
    fn write_byte(&mut self, byte: u8) -> io::Result<()>;
    fn write_frame(&mut self, frame: &[u8]) -> io::Result<()>;
    fn flush(&mut self) -> io::Result<()>;
}

impl<W: Write> FrameSink for W {
    fn write_byte(&mut self, byte: u8) -> io::Result<()> {
        self.write_all(&[byte])
    }

    fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        self.write_all(frame)
    }

    fn flush(&mut self) -> io::Result<()> {
        Write::flush(self)
    }
}
