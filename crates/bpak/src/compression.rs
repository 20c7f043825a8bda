//! Streaming byte processors for transport encoding.
//!
//! Processors consume input in arbitrary-size chunks and emit into a
//! [`Write`] sink. The trait is object-safe so the transport engine can pick
//! a processor per part at runtime.

use std::io::{self, Write};

use xz2::stream::{Action, Status, Stream};

/// Chunk-driven byte stream transformer.
pub trait ByteProcessor {
    /// Feed a chunk of input, writing any produced output.
    fn process(&mut self, input: &[u8], output: &mut dyn Write) -> io::Result<()>;

    /// Flush trailing state. The processor must not be used afterwards.
    fn finalize(&mut self, output: &mut dyn Write) -> io::Result<()>;
}

/// Pass-through processor.
pub struct Identity;

impl ByteProcessor for Identity {
    fn process(&mut self, input: &[u8], output: &mut dyn Write) -> io::Result<()> {
        output.write_all(input)
    }

    fn finalize(&mut self, _: &mut dyn Write) -> io::Result<()> {
        Ok(())
    }
}

/// Scratch size for one round through the lzma stream.
const DRAIN_CHUNK: usize = 16 * 1024;

/// Run `input` through an lzma stream until it is fully consumed, draining
/// whatever the stream produces into `output` as it appears.
///
/// With [`Action::Finish`] the loop keeps draining until the stream reports
/// its end; with [`Action::Run`] it stops once the input is consumed and the
/// stream has nothing ready, leaving undrained state for later calls.
fn drain_through(
    stream: &mut Stream,
    mut input: &[u8],
    action: Action,
    output: &mut dyn Write,
) -> io::Result<()> {
    let mut scratch = [0u8; DRAIN_CHUNK];
    loop {
        let in_mark = stream.total_in();
        let out_mark = stream.total_out();
        let status = stream
            .process(input, &mut scratch, action)
            .map_err(io::Error::other)?;
        let consumed = (stream.total_in() - in_mark) as usize;
        let emitted = (stream.total_out() - out_mark) as usize;
        output.write_all(&scratch[..emitted])?;
        input = &input[consumed..];
        if matches!(status, Status::StreamEnd) {
            return Ok(());
        }
        if !matches!(action, Action::Finish) && input.is_empty() && emitted == 0 {
            return Ok(());
        }
    }
}

pub struct XzEncoder {
    stream: Stream,
}

impl XzEncoder {
    pub fn new(level: u8) -> Self {
        assert!(level <= 9, "compression level must be between 0 and 9");
        Self {
            stream: Stream::new_easy_encoder(level as u32, xz2::stream::Check::Crc64)
                .expect("encoder preset is valid"),
        }
    }
}

impl ByteProcessor for XzEncoder {
    fn process(&mut self, input: &[u8], output: &mut dyn Write) -> io::Result<()> {
        drain_through(&mut self.stream, input, Action::Run, output)
    }

    fn finalize(&mut self, output: &mut dyn Write) -> io::Result<()> {
        drain_through(&mut self.stream, &[], Action::Finish, output)
    }
}

pub struct XzDecoder {
    stream: Stream,
}

impl XzDecoder {
    pub fn new() -> Self {
        Self {
            stream: Stream::new_stream_decoder(u64::MAX, 0)
                .expect("decoder options are valid"),
        }
    }
}

impl Default for XzDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ByteProcessor for XzDecoder {
    fn process(&mut self, input: &[u8], output: &mut dyn Write) -> io::Result<()> {
        drain_through(&mut self.stream, input, Action::Run, output)
    }

    fn finalize(&mut self, output: &mut dyn Write) -> io::Result<()> {
        drain_through(&mut self.stream, &[], Action::Finish, output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xz_round_trip() {
        let input: Vec<u8> = (0..64 * 1024u32).map(|i| (i % 251) as u8).collect();
        let mut compressed = Vec::new();
        let mut encoder = XzEncoder::new(6);
        for chunk in input.chunks(1000) {
            encoder.process(chunk, &mut compressed).unwrap();
        }
        encoder.finalize(&mut compressed).unwrap();
        assert!(compressed.len() < input.len());

        let mut decompressed = Vec::new();
        let mut decoder = XzDecoder::new();
        for chunk in compressed.chunks(777) {
            decoder.process(chunk, &mut decompressed).unwrap();
        }
        decoder.finalize(&mut decompressed).unwrap();
        assert_eq!(decompressed, input);
    }

    #[test]
    fn large_output_rounds_drain_fully() {
        // Decompressing forces many scratch-sized rounds out of few input
        // bytes; the drain loop must not stall on a full scratch buffer.
        let input = vec![0u8; 1024 * 1024];
        let mut compressed = Vec::new();
        let mut encoder = XzEncoder::new(9);
        encoder.process(&input, &mut compressed).unwrap();
        encoder.finalize(&mut compressed).unwrap();

        let mut decompressed = Vec::new();
        let mut decoder = XzDecoder::new();
        decoder.process(&compressed, &mut decompressed).unwrap();
        decoder.finalize(&mut decompressed).unwrap();
        assert_eq!(decompressed, input);
    }
}
