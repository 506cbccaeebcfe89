use std::sync::Arc;

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{code, LibError};
use crate::frame::codec::FrameCodec;
use crate::frame::{Frame, HEADER_SIZE, MAX_PAYLOAD_SIZE};
use crate::transport::{Descriptor, TransportProvider};

const READ_CHUNK: usize = 4096;

/// Cap on buffered inbound bytes. One maximal frame plus a read's slack.
const MAX_READ_BUF: usize = MAX_PAYLOAD_SIZE as usize + HEADER_SIZE + READ_CHUNK;

/// Frames over a connected descriptor of any transport provider.
pub(crate) struct Wire {
    io: Arc<dyn TransportProvider>,
    fd: Descriptor,
    codec: FrameCodec,
    read_buf: BytesMut,
    write_buf: BytesMut,
}

impl Wire {
    pub(crate) fn new(io: Arc<dyn TransportProvider>, fd: Descriptor) -> Self {
        Self {
            io,
            fd,
            codec: FrameCodec::new(),
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            write_buf: BytesMut::with_capacity(READ_CHUNK),
        }
    }

    pub(crate) fn fd(&self) -> Descriptor {
        self.fd
    }

    /// Encode `frame` and push every byte of it to the transport.
    pub(crate) fn send_frame(&mut self, frame: Frame) -> Result<(), LibError> {
        self.write_buf.clear();
        self.codec.encode(frame, &mut self.write_buf)?;

        let mut sent = 0;
        while sent < self.write_buf.len() {
            let n = self.io.send(self.fd, &self.write_buf[sent..])?;
            if n == 0 {
                return Err(LibError::new(code::TRANSPORT, "peer stopped accepting bytes"));
            }
            sent += n;
        }
        Ok(())
    }

    /// Block until one complete frame has arrived.
    pub(crate) fn recv_frame(&mut self) -> Result<Frame, LibError> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some(frame) = self.codec.decode(&mut self.read_buf)? {
                return Ok(frame);
            }
            if self.read_buf.len() > MAX_READ_BUF {
                return Err(LibError::new(
                    code::PROTOCOL,
                    format!("read buffer overflow: {} bytes", self.read_buf.len()),
                ));
            }
            let n = self.io.recv(self.fd, &mut chunk)?;
            if n == 0 {
                return Err(LibError::new(code::PEER_CLOSED, "connection closed by peer"));
            }
            self.read_buf.extend_from_slice(&chunk[..n]);
        }
    }
}
