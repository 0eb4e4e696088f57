//! Copy workers joining a running session to its I/O endpoints.
//!
//! Output (PTY or pipes → sink) and input (source → PTY or stdin pipe) run
//! on their own threads. Either direction may end on its own; errors are
//! logged and only stop the direction they happened on.

use crate::attach::{Inbound, InputSource};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;
use std::thread::JoinHandle;

pub fn set_window_size(fd: RawFd, cols: u16, rows: u16) -> io::Result<()> {
    let size = libc::winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };

    if unsafe { libc::ioctl(fd, libc::TIOCSWINSZ, &size) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Applies out-of-band events from the input side to the live session.
#[derive(Clone)]
pub struct Control {
    pid: Pid,
    pty: Option<Arc<File>>,
}

impl Control {
    pub fn new(pid: Pid, pty: Option<Arc<File>>) -> Self {
        Self { pid, pty }
    }

    pub fn resize(&self, cols: u16, rows: u16) -> io::Result<()> {
        match &self.pty {
            Some(pty) => set_window_size(pty.as_raw_fd(), cols, rows),
            None => Ok(()),
        }
    }

    pub fn signal(&self, signal: i32) -> io::Result<()> {
        let signal = Signal::try_from(signal)?;
        kill(self.pid, signal)?;
        Ok(())
    }
}

/// Handles of the copy workers for one session.
#[derive(Default)]
pub struct Bridge {
    input: Option<JoinHandle<()>>,
    outputs: Vec<JoinHandle<()>>,
}

impl Bridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy everything from `reader` into `writer` until EOF or error.
    pub fn output<R, W>(&mut self, name: String, mut reader: R, mut writer: W) -> io::Result<()>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                match io::copy(&mut reader, &mut writer) {
                    Ok(n) => tracing::debug!("{}: copied {} bytes, source closed", name, n),
                    // EIO is how a PTY master reports that the slave side is gone
                    Err(e) if e.raw_os_error() == Some(libc::EIO) => {
                        tracing::debug!("{}: terminal closed", name)
                    }
                    Err(e) => tracing::debug!("{}: copy stopped: {}", name, e),
                }
                let _ = writer.flush();
            })?;
        self.outputs.push(handle);
        Ok(())
    }

    /// Feed `source` into `sink`, applying resize and signal events through
    /// `control`. The sink is dropped when the source reaches EOF.
    pub fn input<W>(
        &mut self,
        name: String,
        mut source: Box<dyn InputSource>,
        mut sink: W,
        control: Control,
    ) -> io::Result<()>
    where
        W: Write + Send + 'static,
    {
        let handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                loop {
                    match source.next() {
                        Ok(Inbound::Data(data)) => {
                            if let Err(e) = sink.write_all(&data) {
                                tracing::debug!("{}: write failed: {}", name, e);
                                break;
                            }
                        }
                        Ok(Inbound::Resize { cols, rows }) => {
                            if let Err(e) = control.resize(cols, rows) {
                                tracing::warn!("{}: resize to {}x{} failed: {}", name, cols, rows, e);
                            }
                        }
                        Ok(Inbound::Signal(signal)) => {
                            if let Err(e) = control.signal(signal) {
                                tracing::warn!("{}: forwarding signal {} failed: {}", name, signal, e);
                            }
                        }
                        Ok(Inbound::Eof) => {
                            tracing::debug!("{}: input closed", name);
                            break;
                        }
                        Err(e) => {
                            tracing::debug!("{}: input transport error: {}", name, e);
                            break;
                        }
                    }
                }
            })?;
        self.input = Some(handle);
        Ok(())
    }

    /// Wait for the input worker to finish.
    pub fn join_input(&mut self) {
        if let Some(handle) = self.input.take() {
            let _ = handle.join();
        }
    }

    /// Wait for all output workers to finish.
    pub fn join_outputs(&mut self) {
        for handle in self.outputs.drain(..) {
            let _ = handle.join();
        }
    }
}

/// Write half of a shared PTY master.
pub struct PtyWriter(pub Arc<File>);

impl Write for PtyWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (&*self.0).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        (&*self.0).flush()
    }
}

/// Read half of a shared PTY master.
pub struct PtyReader(pub Arc<File>);

impl Read for PtyReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (&*self.0).read(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attach::RawInput;
    use std::io::Cursor;
    use std::sync::Mutex;
    use std::sync::mpsc;

    #[derive(Clone, Default)]
    struct Buffer(Arc<Mutex<Vec<u8>>>);

    impl Write for Buffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Buffer {
        fn contents(&self) -> Vec<u8> {
            self.0.lock().unwrap().clone()
        }
    }

    /// Reader fed chunk by chunk from the test body.
    struct ChannelReader {
        rx: mpsc::Receiver<Vec<u8>>,
        pending: Vec<u8>,
    }

    impl Read for ChannelReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.pending.is_empty() {
                match self.rx.recv() {
                    Ok(chunk) => self.pending = chunk,
                    Err(_) => return Ok(0),
                }
            }
            let n = buf.len().min(self.pending.len());
            buf[..n].copy_from_slice(&self.pending[..n]);
            self.pending.drain(..n);
            Ok(n)
        }
    }

    fn control() -> Control {
        Control::new(Pid::this(), None)
    }

    #[test]
    fn test_input_close_does_not_stop_output() {
        let (tx, rx) = mpsc::channel();
        let output = Buffer::default();
        let stdin = Buffer::default();

        let mut bridge = Bridge::new();
        bridge
            .output(
                "s1-stdout".to_string(),
                ChannelReader {
                    rx,
                    pending: Vec::new(),
                },
                output.clone(),
            )
            .unwrap();
        bridge
            .input(
                "s1-stdin".to_string(),
                Box::new(RawInput::new(Cursor::new(b"typed".to_vec()))),
                stdin.clone(),
                control(),
            )
            .unwrap();

        bridge.join_input();
        assert_eq!(stdin.contents(), b"typed");

        tx.send(b"still ".to_vec()).unwrap();
        tx.send(b"flowing".to_vec()).unwrap();
        drop(tx);

        bridge.join_outputs();
        assert_eq!(output.contents(), b"still flowing");
    }

    #[test]
    fn test_output_close_does_not_stop_input() {
        let (tx, rx) = mpsc::channel::<Vec<u8>>();
        let stdin = Buffer::default();

        let mut bridge = Bridge::new();
        bridge
            .output("s2-stdout".to_string(), Cursor::new(Vec::new()), Buffer::default())
            .unwrap();
        bridge.join_outputs();

        bridge
            .input(
                "s2-stdin".to_string(),
                Box::new(RawInput::new(ChannelReader {
                    rx,
                    pending: Vec::new(),
                })),
                stdin.clone(),
                control(),
            )
            .unwrap();

        tx.send(b"late input".to_vec()).unwrap();
        drop(tx);
        bridge.join_input();
        assert_eq!(stdin.contents(), b"late input");
    }

    #[test]
    fn test_resize_without_pty_is_noop() {
        assert!(control().resize(80, 24).is_ok());
    }

    fn window_size(fd: RawFd) -> libc::winsize {
        let mut size = libc::winsize {
            ws_row: 0,
            ws_col: 0,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        assert_eq!(unsafe { libc::ioctl(fd, libc::TIOCGWINSZ, &mut size) }, 0);
        size
    }

    #[test]
    fn test_resize_applies_to_pty() {
        let pty = nix::pty::openpty(
            None::<&nix::pty::Winsize>,
            None::<&nix::sys::termios::Termios>,
        )
        .unwrap();
        let master = Arc::new(File::from(pty.master));
        let control = Control::new(Pid::this(), Some(master));

        control.resize(120, 40).unwrap();

        let size = window_size(pty.slave.as_raw_fd());
        assert_eq!((size.ws_row, size.ws_col), (40, 120));
    }

    #[test]
    fn test_invalid_signal_rejected() {
        assert!(control().signal(9999).is_err());
    }
}
