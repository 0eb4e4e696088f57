//! Framing for the attach transport.
//!
//! Every frame starts with a little-endian u16 command word: the low two bits
//! select the opcode, the upper 14 bits carry the payload length or a small
//! argument. Data frames are followed by `length` bytes.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::{Arc, Mutex};

pub const CMD_MASK: u16 = 0x3;
pub const CMD_SHIFT: u32 = 2;
pub const MAX_DATA_LEN: usize = (u16::MAX >> CMD_SHIFT) as usize;

// Guest → Host commands
pub const CMD_WRITE_STDOUT: u16 = 0;
pub const CMD_WRITE_STDERR: u16 = 1;

// Host → Guest commands
pub const CMD_WRITE_STDIN: u16 = 0;
pub const CMD_UPDATE_SIZE: u16 = 1;
pub const CMD_SIGNAL: u16 = 2;

#[inline]
pub fn encode_cmd(opcode: u16, value: usize) -> u16 {
    debug_assert!(value <= MAX_DATA_LEN);
    opcode | ((value as u16) << CMD_SHIFT)
}

#[inline]
pub fn decode_cmd(cmd: u16) -> (u16, usize) {
    let opcode = cmd & CMD_MASK;
    let value = (cmd >> CMD_SHIFT) as usize;
    (opcode, value)
}

/// Something arriving from the session's input side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Data(Vec<u8>),
    Resize { cols: u16, rows: u16 },
    Signal(i32),
    Eof,
}

/// Source of session input: raw bytes, or a framed transport that also
/// carries window-size and signal events.
pub trait InputSource: Send {
    fn next(&mut self) -> io::Result<Inbound>;
}

/// Plain byte stream; only ever yields data and EOF.
pub struct RawInput<R> {
    reader: R,
    buf: Vec<u8>,
}

impl<R: Read + Send> RawInput<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: vec![0u8; 4096],
        }
    }
}

impl<R: Read + Send> InputSource for RawInput<R> {
    fn next(&mut self) -> io::Result<Inbound> {
        loop {
            match self.reader.read(&mut self.buf) {
                Ok(0) => return Ok(Inbound::Eof),
                Ok(n) => return Ok(Inbound::Data(self.buf[..n].to_vec())),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

/// Host-to-guest half of the attach protocol.
pub struct FramedInput<R> {
    reader: R,
}

impl<R: Read + Send> FramedInput<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }
}

impl<R: Read + Send> InputSource for FramedInput<R> {
    fn next(&mut self) -> io::Result<Inbound> {
        let mut cmd_buf = [0u8; 2];
        match self.reader.read_exact(&mut cmd_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(Inbound::Eof),
            Err(e) => return Err(e),
        }

        let (opcode, value) = decode_cmd(u16::from_le_bytes(cmd_buf));
        match opcode {
            CMD_WRITE_STDIN if value == 0 => Ok(Inbound::Eof),
            CMD_WRITE_STDIN => {
                let mut data = vec![0u8; value];
                self.reader.read_exact(&mut data)?;
                Ok(Inbound::Data(data))
            }
            CMD_UPDATE_SIZE => {
                let mut size_buf = [0u8; 4];
                self.reader.read_exact(&mut size_buf)?;
                Ok(Inbound::Resize {
                    cols: u16::from_le_bytes([size_buf[0], size_buf[1]]),
                    rows: u16::from_le_bytes([size_buf[2], size_buf[3]]),
                })
            }
            CMD_SIGNAL => Ok(Inbound::Signal(value as i32)),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown attach opcode {}", other),
            )),
        }
    }
}

/// Guest-to-host half of the attach protocol.
pub struct FramedOutput<W> {
    writer: W,
    opcode: u16,
}

impl<W: Write> FramedOutput<W> {
    pub fn stdout(writer: W) -> Self {
        Self {
            writer,
            opcode: CMD_WRITE_STDOUT,
        }
    }

    pub fn stderr(writer: W) -> Self {
        Self {
            writer,
            opcode: CMD_WRITE_STDERR,
        }
    }
}

impl<W: Write> Write for FramedOutput<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let n = buf.len().min(MAX_DATA_LEN);
        let mut frame = Vec::with_capacity(2 + n);
        frame.extend_from_slice(&encode_cmd(self.opcode, n).to_le_bytes());
        frame.extend_from_slice(&buf[..n]);
        self.writer.write_all(&frame)?;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

/// Writer shared by several output streams.
///
/// Each `write` lands on the underlying stream in one piece, so frames from
/// stdout and stderr never interleave.
pub struct SharedWriter<W> {
    inner: Arc<Mutex<W>>,
}

impl<W> Clone for SharedWriter<W> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<W: Write> SharedWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            inner: Arc::new(Mutex::new(writer)),
        }
    }
}

impl<W: Write> Write for SharedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| io::Error::other("writer poisoned"))?;
        inner.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| io::Error::other("writer poisoned"))?;
        inner.flush()
    }
}

/// Connect a stream socket to the host over vsock.
pub fn connect_vsock(port: u32) -> io::Result<OwnedFd> {
    use nix::sys::socket::{AddressFamily, SockFlag, SockType, VsockAddr, connect, socket};

    // VMADDR_CID_HOST
    const HOST_CID: u32 = 2;

    let fd = socket(
        AddressFamily::Vsock,
        SockType::Stream,
        SockFlag::SOCK_CLOEXEC,
        None,
    )?;
    connect(fd.as_raw_fd(), &VsockAddr::new(HOST_CID, port))?;
    Ok(fd)
}

pub type FramedWriter = FramedOutput<SharedWriter<File>>;

/// Split a connected transport into framed input, stdout and stderr halves.
pub fn framed_transport(fd: OwnedFd) -> io::Result<(FramedInput<File>, FramedWriter, FramedWriter)> {
    let reader = File::from(fd);
    let writer = SharedWriter::new(reader.try_clone()?);
    Ok((
        FramedInput::new(reader),
        FramedOutput::stdout(writer.clone()),
        FramedOutput::stderr(writer),
    ))
}
