//! Device transports for endpoints.
//!
//! The device locator of an endpoint picks the transport:
//!
//! - `tcp:<host>:<port>` connects to a TCP server (terminal servers, ser2net)
//! - `pty` allocates a pseudo-terminal and logs the path to attach to
//! - anything else is a serial device path, configured raw with the
//!   endpoint's line settings

use futures::future::BoxFuture;
use tokio::net::TcpStream;
use tracing::info;

use tunnel_core::{BoxedTransport, TransportConfig, TransportOpener, TunnelError};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Locator<'a> {
    Tcp(&'a str),
    Pty,
    Device(&'a str),
}

impl<'a> Locator<'a> {
    pub fn parse(device: &'a str) -> Self {
        if let Some(addr) = device.strip_prefix("tcp:") {
            Locator::Tcp(addr)
        } else if device == "pty" {
            Locator::Pty
        } else {
            Locator::Device(device)
        }
    }
}

/// Opens real devices; see the module docs for the locator syntax
#[derive(Clone, Copy, Debug, Default)]
pub struct DeviceOpener;

impl TransportOpener for DeviceOpener {
    fn open<'a>(
        &'a self,
        config: &'a TransportConfig,
    ) -> BoxFuture<'a, Result<BoxedTransport, TunnelError>> {
        Box::pin(async move {
            let opened = match Locator::parse(&config.device) {
                Locator::Tcp(addr) => open_tcp(addr).await,
                Locator::Pty => open_pty(),
                Locator::Device(path) => open_device(path, config),
            };
            opened.map_err(|source| TunnelError::TransportOpen {
                device: config.device.clone(),
                source,
            })
        })
    }
}

async fn open_tcp(addr: &str) -> std::io::Result<BoxedTransport> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    info!("Connected to {}", addr);
    Ok(Box::new(stream))
}

#[cfg(target_os = "linux")]
fn open_pty() -> std::io::Result<BoxedTransport> {
    let (stream, path) = unix::FdStream::open_pty()?;
    info!("Pseudo-terminal ready at {}", path);
    Ok(Box::new(stream))
}

#[cfg(unix)]
fn open_device(path: &str, config: &TransportConfig) -> std::io::Result<BoxedTransport> {
    Ok(Box::new(unix::FdStream::open_serial(path, config)?))
}

#[cfg(not(target_os = "linux"))]
fn open_pty() -> std::io::Result<BoxedTransport> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "pseudo-terminals are only supported on linux",
    ))
}

#[cfg(not(unix))]
fn open_device(_path: &str, _config: &TransportConfig) -> std::io::Result<BoxedTransport> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "serial devices are only supported on unix",
    ))
}

#[cfg(unix)]
mod unix {
    #[cfg(target_os = "linux")]
    use nix::fcntl::{FcntlArg, OFlag, fcntl};
    #[cfg(target_os = "linux")]
    use nix::pty::{grantpt, posix_openpt, ptsname_r, unlockpt};
    use nix::sys::termios::{self, BaudRate, ControlFlags, SetArg};
    use std::fs::{File, OpenOptions};
    use std::io::{self, Read, Write};
    #[cfg(target_os = "linux")]
    use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd};
    use std::os::unix::fs::OpenOptionsExt;
    use std::pin::Pin;
    use std::task::{Context, Poll, ready};
    use tokio::io::unix::AsyncFd;
    use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
    use tracing::warn;

    use tunnel_core::{Parity, StopBits, TransportConfig};

    /// A non-blocking tty file descriptor driven by the tokio reactor
    pub struct FdStream {
        inner: AsyncFd<File>,
        /// Keeps the slave side of a pty open so the master never sees EIO
        /// while no terminal program is attached.
        _slave: Option<File>,
    }

    impl FdStream {
        pub fn open_serial(path: &str, config: &TransportConfig) -> io::Result<Self> {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .custom_flags(nix::libc::O_NOCTTY | nix::libc::O_NONBLOCK)
                .open(path)?;
            configure_line(&file, config)?;
            Ok(Self {
                inner: AsyncFd::new(file)?,
                _slave: None,
            })
        }

        /// Allocate a pseudo-terminal; returns the stream on the master side
        /// and the slave path a user can open.
        #[cfg(target_os = "linux")]
        pub fn open_pty() -> io::Result<(Self, String)> {
            let master = posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY)?;
            grantpt(&master)?;
            unlockpt(&master)?;
            let path = ptsname_r(&master)?;

            let slave = OpenOptions::new()
                .read(true)
                .write(true)
                .custom_flags(nix::libc::O_NOCTTY)
                .open(&path)?;
            let mut raw = termios::tcgetattr(&slave)?;
            termios::cfmakeraw(&mut raw);
            termios::tcsetattr(&slave, SetArg::TCSANOW, &raw)?;

            // SAFETY: `into_raw_fd` hands over sole ownership of a valid,
            // open descriptor.
            let master = unsafe { File::from(OwnedFd::from_raw_fd(master.into_raw_fd())) };
            set_nonblocking(&master)?;
            Ok((
                Self {
                    inner: AsyncFd::new(master)?,
                    _slave: Some(slave),
                },
                path,
            ))
        }
    }

    #[cfg(target_os = "linux")]
    fn set_nonblocking(file: &File) -> io::Result<()> {
        let flags = OFlag::from_bits_truncate(fcntl(file.as_raw_fd(), FcntlArg::F_GETFL)?);
        fcntl(file.as_raw_fd(), FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
        Ok(())
    }

    pub(super) fn baud_rate(speed: u32) -> io::Result<BaudRate> {
        let rate = match speed {
            300 => BaudRate::B300,
            1200 => BaudRate::B1200,
            2400 => BaudRate::B2400,
            4800 => BaudRate::B4800,
            9600 => BaudRate::B9600,
            19200 => BaudRate::B19200,
            38400 => BaudRate::B38400,
            57600 => BaudRate::B57600,
            115_200 => BaudRate::B115200,
            230_400 => BaudRate::B230400,
            #[cfg(target_os = "linux")]
            460_800 => BaudRate::B460800,
            #[cfg(target_os = "linux")]
            921_600 => BaudRate::B921600,
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("unsupported speed {other}"),
                ));
            }
        };
        Ok(rate)
    }

    fn configure_line(file: &File, config: &TransportConfig) -> io::Result<()> {
        let mut tio = termios::tcgetattr(file)?;
        termios::cfmakeraw(&mut tio);
        termios::cfsetspeed(&mut tio, baud_rate(config.speed)?)?;

        tio.control_flags &= !ControlFlags::CSIZE;
        tio.control_flags |= match config.data_bits {
            5 => ControlFlags::CS5,
            6 => ControlFlags::CS6,
            7 => ControlFlags::CS7,
            _ => ControlFlags::CS8,
        };

        match config.parity {
            Parity::None => tio.control_flags &= !(ControlFlags::PARENB | ControlFlags::PARODD),
            Parity::Odd => tio.control_flags |= ControlFlags::PARENB | ControlFlags::PARODD,
            Parity::Even => {
                tio.control_flags |= ControlFlags::PARENB;
                tio.control_flags &= !ControlFlags::PARODD;
            }
        }

        match config.stop_bits {
            StopBits::One => tio.control_flags &= !ControlFlags::CSTOPB,
            StopBits::OnePointFive => {
                warn!(
                    "{}: termios has no 1.5 stop bits, using 2",
                    config.device
                );
                tio.control_flags |= ControlFlags::CSTOPB;
            }
            StopBits::Two => tio.control_flags |= ControlFlags::CSTOPB,
        }

        tio.control_flags |= ControlFlags::CREAD | ControlFlags::CLOCAL;
        termios::tcsetattr(file, SetArg::TCSANOW, &tio)?;
        Ok(())
    }

    impl AsyncRead for FdStream {
        fn poll_read(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            loop {
                let mut guard = ready!(self.inner.poll_read_ready(cx))?;
                let unfilled = buf.initialize_unfilled();
                match guard.try_io(|inner| {
                    let mut file = inner.get_ref();
                    file.read(unfilled)
                }) {
                    Ok(Ok(len)) => {
                        buf.advance(len);
                        return Poll::Ready(Ok(()));
                    }
                    Ok(Err(e)) => return Poll::Ready(Err(e)),
                    Err(_would_block) => continue,
                }
            }
        }
    }

    impl AsyncWrite for FdStream {
        fn poll_write(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            data: &[u8],
        ) -> Poll<io::Result<usize>> {
            loop {
                let mut guard = ready!(self.inner.poll_write_ready(cx))?;
                match guard.try_io(|inner| {
                    let mut file = inner.get_ref();
                    file.write(data)
                }) {
                    Ok(result) => return Poll::Ready(result),
                    Err(_would_block) => continue,
                }
            }
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }
}
