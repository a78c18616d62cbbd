//! Scatter-gather: the segments go straight to one vectored send
//! (`writev`), so the staging copy of [`FullCopy`](super::FullCopy)
//! disappears and only the kernel copy remains.

use std::io::{self, IoSlice, Write};
use std::net::TcpStream;

use crate::config::StrategyKind;
use crate::error::TransferError;
use crate::message::Message;

use super::{SubmitOutcome, TransferStrategy};

pub struct ScatterGather<W: Write + Send = TcpStream> {
    writer: W,
}

impl<W: Write + Send> ScatterGather<W> {
    pub fn new(writer: W) -> Self {
        ScatterGather { writer }
    }
}

impl<W: Write + Send> TransferStrategy for ScatterGather<W> {
    fn kind(&self) -> StrategyKind {
        StrategyKind::ScatterGather
    }

    fn submit(&mut self, message: Message) -> Result<SubmitOutcome, TransferError> {
        let total = message.len();
        {
            let mut slices = message.io_slices();
            let mut bufs: &mut [IoSlice<'_>] = &mut slices;
            while !bufs.is_empty() {
                match self.writer.write_vectored(bufs) {
                    Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                    Ok(n) => IoSlice::advance_slices(&mut bufs, n),
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(SubmitOutcome::Sent {
            bytes: total,
            message,
        })
    }
}
