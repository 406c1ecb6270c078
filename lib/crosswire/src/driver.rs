//! Byte transports under the framer. A driver hands the event loop one
//! descriptor to watch and moves raw bytes; it never sees frames.

use std::ffi::CString;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;
use std::time::Duration;

pub trait Driver: Send {
    /// Descriptor registered for readability in the event loop.
    fn raw_fd(&self) -> RawFd;

    /// Interrupt line asserted by the secondary (SPI only): readiness means
    /// the secondary has a frame to clock out.
    fn irq_fd(&self) -> Option<RawFd> {
        None
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn send(&mut self, buf: &[u8]) -> io::Result<usize>;
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// UART transport. The port is configured through `serialport` and then
/// driven non-blocking off its raw descriptor.
pub struct UartDriver {
    port: serialport::TTYPort,
}

impl UartDriver {
    pub fn open(device: &Path, baud: u32, hardware_flow_control: bool) -> io::Result<UartDriver> {
        let flow_control = if hardware_flow_control {
            serialport::FlowControl::Hardware
        } else {
            serialport::FlowControl::None
        };

        let port = serialport::new(device.to_string_lossy(), baud)
            .flow_control(flow_control)
            .timeout(Duration::from_millis(0))
            .open_native()
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;

        set_nonblocking(port.as_raw_fd())?;

        Ok(UartDriver { port })
    }
}

impl Driver for UartDriver {
    fn raw_fd(&self) -> RawFd {
        self.port.as_raw_fd()
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.port.read(buf) {
            // A zero timeout surfaces as TimedOut; the loop treats both as
            // "nothing to read right now".
            Err(ref err) if err.kind() == io::ErrorKind::TimedOut => {
                Err(io::ErrorKind::WouldBlock.into())
            }
            other => other,
        }
    }

    fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.port.write(buf) {
            Err(ref err) if err.kind() == io::ErrorKind::TimedOut => {
                Err(io::ErrorKind::WouldBlock.into())
            }
            other => other,
        }
    }
}

/// SPI transport: a spidev character device plus the GPIO value file of the
/// secondary's IRQ line.
pub struct SpiDriver {
    fd: RawFd,
    irq: RawFd,
}

impl SpiDriver {
    pub fn open(device: &Path, irq_gpio: &Path) -> io::Result<SpiDriver> {
        let fd = Self::open_raw(device, libc::O_RDWR)?;
        let irq = match Self::open_raw(irq_gpio, libc::O_RDONLY) {
            Ok(irq) => irq,
            Err(err) => {
                unsafe { libc::close(fd) };
                return Err(err);
            }
        };

        Ok(SpiDriver { fd, irq })
    }

    fn open_raw(path: &Path, mode: libc::c_int) -> io::Result<RawFd> {
        let c_path = CString::new(path.to_string_lossy().as_bytes())
            .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;

        let fd = unsafe {
            libc::open(
                c_path.as_ptr(),
                mode | libc::O_NONBLOCK | libc::O_CLOEXEC,
            )
        };

        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(fd)
    }
}

impl Driver for SpiDriver {
    fn raw_fd(&self) -> RawFd {
        self.fd
    }

    fn irq_fd(&self) -> Option<RawFd> {
        Some(self.irq)
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let count = unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if count < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(count as usize)
    }

    fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        let count = unsafe { libc::write(self.fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if count < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(count as usize)
    }
}

impl Drop for SpiDriver {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
            libc::close(self.irq);
        }
    }
}

unsafe impl Send for SpiDriver {}

/// In-process driver pair used by test harnesses: two connected ends, each
/// looking like a serial line to its owner.
pub struct PipeDriver {
    stream: std::os::unix::net::UnixStream,
}

impl PipeDriver {
    pub fn pair() -> io::Result<(PipeDriver, PipeDriver)> {
        let (a, b) = std::os::unix::net::UnixStream::pair()?;
        a.set_nonblocking(true)?;
        b.set_nonblocking(true)?;
        Ok((PipeDriver { stream: a }, PipeDriver { stream: b }))
    }
}

impl Driver for PipeDriver {
    fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }

    fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipe_driver_roundtrip() {
        let (mut a, mut b) = PipeDriver::pair().unwrap();

        assert_eq!(a.send(b"hello").unwrap(), 5);

        let mut buf = [0u8; 16];
        let count = b.recv(&mut buf).unwrap();
        assert_eq!(&buf[..count], b"hello");
    }

    #[test]
    fn test_pipe_driver_is_nonblocking() {
        let (mut a, _b) = PipeDriver::pair().unwrap();

        let mut buf = [0u8; 16];
        let err = a.recv(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn test_uart_open_missing_device_fails() {
        assert!(UartDriver::open(Path::new("/dev/does-not-exist"), 115_200, false).is_err());
    }

    #[test]
    fn test_spi_open_missing_device_fails() {
        assert!(SpiDriver::open(
            Path::new("/dev/does-not-exist"),
            Path::new("/sys/does-not-exist")
        )
        .is_err());
    }
}
