//! The access channel, interposer side.
//!
//! Frames are a 4-byte little-endian length followed by facet-json bytes.
//! Everything here is synchronous: it runs inside libc wrappers where no
//! async machinery (and as little allocation as possible) may live.

use ferret_proto::{AccessReply, AccessReport, AutodepEnv};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::os::unix::net::UnixStream;

/// Where reports go.
pub enum Channel {
    /// Connected socket to the supervisor.
    Tcp(TcpStream),
    Unix(UnixStream),
    /// Append to a file (tests, debugging).
    File(std::fs::File),
    /// Accumulate in memory; used by the server's own helpers where no
    /// supervisor exists.
    Static(Vec<AccessReport>),
    /// Reporting turned off.
    Disabled,
}

impl Channel {
    /// Open the channel designated by `env.service`: `host:port` for TCP, an
    /// absolute path for a unix socket, a path suffixed by `:` for append.
    pub fn connect(env: &AutodepEnv) -> Channel {
        if env.disabled || env.service.is_empty() {
            return Channel::Disabled;
        }
        if let Some(path) = env.service.strip_suffix(':') {
            match std::fs::OpenOptions::new().create(true).append(true).open(path) {
                Ok(f) => return Channel::File(f),
                Err(_) => return Channel::Disabled,
            }
        }
        if env.service.starts_with('/') {
            match UnixStream::connect(&env.service) {
                Ok(s) => return Channel::Unix(s),
                Err(_) => return Channel::Disabled,
            }
        }
        match TcpStream::connect(&env.service) {
            Ok(s) => Channel::Tcp(s),
            Err(_) => Channel::Disabled,
        }
    }

    pub fn send(&mut self, report: &AccessReport) -> std::io::Result<()> {
        match self {
            Channel::Tcp(s) => send_frame(s, report),
            Channel::Unix(s) => send_frame(s, report),
            Channel::File(f) => {
                let json = facet_json::to_string(report);
                f.write_all(json.as_bytes())?;
                f.write_all(b"\n")
            }
            Channel::Static(acc) => {
                acc.push(report.clone());
                Ok(())
            }
            Channel::Disabled => Ok(()),
        }
    }

    pub fn recv_reply(&mut self) -> std::io::Result<AccessReply> {
        match self {
            Channel::Tcp(s) => recv_frame(s),
            Channel::Unix(s) => recv_frame(s),
            _ => Ok(AccessReply::default()),
        }
    }

    /// Raw descriptor of the connected socket, if any; needed so the
    /// interposer can move it out of the way of user fd manipulations.
    pub fn raw_fd(&self) -> Option<i32> {
        use std::os::fd::AsRawFd;
        match self {
            Channel::Tcp(s) => Some(s.as_raw_fd()),
            Channel::Unix(s) => Some(s.as_raw_fd()),
            Channel::File(f) => Some(f.as_raw_fd()),
            _ => None,
        }
    }

    /// Hand the descriptor over to the user: forget it without closing, so
    /// their close/dup2 sees exactly the fd they expect.
    pub fn abandon(self) {
        match self {
            Channel::Tcp(s) => std::mem::forget(s),
            Channel::Unix(s) => std::mem::forget(s),
            Channel::File(f) => std::mem::forget(f),
            _ => {}
        }
    }
}

fn send_frame<W: Write>(w: &mut W, report: &AccessReport) -> std::io::Result<()> {
    let json = facet_json::to_string(report);
    let len = (json.len() as u32).to_le_bytes();
    w.write_all(&len)?;
    w.write_all(json.as_bytes())
}

fn recv_frame<R: Read>(r: &mut R) -> std::io::Result<AccessReply> {
    let mut len = [0u8; 4];
    r.read_exact(&mut len)?;
    let len = u32::from_le_bytes(len) as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    let txt = std::str::from_utf8(&buf)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    facet_json::from_str(txt).map_err(|e| {
        std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())
    })
}
