//! Full-copy baseline: serialise the segments into one staging buffer and
//! write it out. Every byte is copied twice (segments → staging → kernel).

use std::io::Write;
use std::net::TcpStream;

use crate::config::StrategyKind;
use crate::error::TransferError;
use crate::message::Message;

use super::{SubmitOutcome, TransferStrategy};

pub struct FullCopy<W: Write + Send = TcpStream> {
    writer: W,
    /// Reused across submissions; grows to the message size once.
    staging: Vec<u8>,
}

impl<W: Write + Send> FullCopy<W> {
    pub fn new(writer: W) -> Self {
        FullCopy {
            writer,
            staging: Vec::new(),
        }
    }
}

impl<W: Write + Send> TransferStrategy for FullCopy<W> {
    fn kind(&self) -> StrategyKind {
        StrategyKind::FullCopy
    }

    fn submit(&mut self, message: Message) -> Result<SubmitOutcome, TransferError> {
        message.serialize_into(&mut self.staging);
        self.writer.write_all(&self.staging)?;
        Ok(SubmitOutcome::Sent {
            bytes: self.staging.len(),
            message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    /// Accepts at most `chunk` bytes per write.
    struct Trickle {
        out: Vec<u8>,
        chunk: usize,
        calls: usize,
    }

    impl Write for Trickle {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.calls += 1;
            let n = buf.len().min(self.chunk);
            self.out.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn short_writes_are_continued() {
        let mut s = FullCopy::new(Trickle {
            out: Vec::new(),
            chunk: 5,
            calls: 0,
        });
        let outcome = s.submit(Message::new(16).unwrap()).unwrap();
        assert_eq!(outcome.bytes(), 16);
        assert_eq!(s.writer.out, b"AABBCCDDEEFFGGHH");
        assert_eq!(s.writer.calls, 4);
    }

    #[test]
    fn staging_buffer_is_reused() {
        let mut s = FullCopy::new(Vec::new());
        let msg = match s.submit(Message::new(64).unwrap()).unwrap() {
            SubmitOutcome::Sent { message, .. } => message,
            other => panic!("unexpected {other:?}"),
        };
        let cap = s.staging.capacity();
        s.submit(msg).unwrap();
        assert_eq!(s.staging.capacity(), cap);
        assert_eq!(s.writer.len(), 128);
    }

    #[test]
    fn write_errors_propagate() {
        struct Closed;
        impl Write for Closed {
            fn write(&mut self, _: &[u8]) -> io::Result<usize> {
                Err(io::ErrorKind::BrokenPipe.into())
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }
        let err = FullCopy::new(Closed)
            .submit(Message::new(8).unwrap())
            .unwrap_err();
        assert!(err.is_disconnect());
    }
}
