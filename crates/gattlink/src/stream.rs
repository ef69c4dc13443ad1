//! Byte-stream adapter
//!
//! Turns the tagged notifications of one session into a serial-port style
//! byte stream. Payloads are concatenated in arrival order; a payload that
//! is only partly consumed keeps its remainder for the next read.

use crate::error::{Error, Result};
use crate::gatt::DeviceSession;
use crate::queue::NotificationEvent;
use log::{debug, trace};
use parking_lot::{Mutex, MutexGuard};
use std::collections::VecDeque;
use std::io;
use std::time::Duration;

/// Bytes of partly read payloads, valid only for the connection they came
/// from
#[derive(Default)]
struct Carry {
    epoch: u64,
    bytes: VecDeque<u8>,
}

pub struct ByteStream {
    session: DeviceSession,
    /// `None` blocks reads until they are satisfied
    read_timeout: Option<Duration>,
    write_timeout: Duration,
    carry: Mutex<Carry>,
}

impl ByteStream {
    pub fn new(
        session: DeviceSession,
        read_timeout: Option<Duration>,
        write_timeout: Duration,
    ) -> Self {
        Self {
            session,
            read_timeout,
            write_timeout,
            carry: Mutex::new(Carry::default()),
        }
    }

    pub fn session(&self) -> &DeviceSession {
        &self.session
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout
    }

    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) {
        self.read_timeout = timeout;
    }

    /// Forget bytes held over from partially read notifications
    pub fn discard_buffered(&self) {
        self.carry.lock().bytes.clear();
    }

    /// The carry buffer, emptied first if the session has reconnected since
    /// it was filled
    fn carry(&self) -> MutexGuard<'_, Carry> {
        let epoch = self.session.connection_epoch();
        let mut carry = self.carry.lock();
        if carry.epoch != epoch {
            if !carry.bytes.is_empty() {
                debug!(
                    "Dropping {} bytes left over from an earlier link to {}",
                    carry.bytes.len(),
                    self.session.identity()
                );
                carry.bytes.clear();
            }
            carry.epoch = epoch;
        }
        carry
    }

    fn take_carry(&self, out: &mut Vec<u8>, n: usize) {
        let mut carry = self.carry();
        let count = n.saturating_sub(out.len()).min(carry.bytes.len());
        out.extend(carry.bytes.drain(..count));
    }

    /// Move payload bytes into `out` up to `n`, keeping the rest
    fn absorb(&self, out: &mut Vec<u8>, n: usize, events: Vec<NotificationEvent>) {
        let mut carry = self.carry();
        for event in events {
            let room = n.saturating_sub(out.len());
            let split = room.min(event.payload.len());
            out.extend_from_slice(&event.payload[..split]);
            carry.bytes.extend(&event.payload[split..]);
        }
    }

    /// Pop whatever is already queued, without waiting, until `out` holds
    /// `n` bytes.
    fn fill_available(&self, out: &mut Vec<u8>, n: usize) -> Result<()> {
        let queue = self.session.queue();
        let device = self.session.identity();
        while out.len() < n {
            match queue.pop_n(device, 1, Some(Duration::ZERO)) {
                Ok(events) if events.is_empty() => break,
                Ok(events) => self.absorb(out, n, events),
                Err(Error::NotConnected) if !out.is_empty() => break,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Everything available up to `n`; if nothing is, wait up to `wait`
    /// (`None` for ever) for one notification and take what is there then.
    fn collect(&self, n: usize, wait: Option<Duration>) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(n);
        self.take_carry(&mut out, n);
        self.fill_available(&mut out, n)?;
        if !out.is_empty() {
            return Ok(out);
        }

        let events = self
            .session
            .queue()
            .pop_n(self.session.identity(), 1, wait)?;
        self.absorb(&mut out, n, events);
        self.fill_available(&mut out, n)?;
        Ok(out)
    }

    /// Read up to `n` bytes.
    ///
    /// With a read timeout this returns what is available straight away,
    /// waiting up to the timeout only when nothing is. Without one it blocks
    /// until exactly `n` bytes have arrived. If the link goes away mid-read
    /// the bytes collected so far are returned, otherwise
    /// [`Error::NotConnected`].
    pub fn read(&self, n: usize) -> Result<Vec<u8>> {
        if n == 0 {
            return Ok(Vec::new());
        }

        let out = match self.read_timeout {
            Some(timeout) => self.collect(n, Some(timeout))?,
            None => {
                let queue = self.session.queue();
                let device = self.session.identity();
                let mut out = Vec::with_capacity(n);
                self.take_carry(&mut out, n);
                while out.len() < n {
                    match queue.pop_n(device, 1, None) {
                        Ok(events) => self.absorb(&mut out, n, events),
                        Err(Error::NotConnected) if !out.is_empty() => {
                            debug!(
                                "Stream from {} ended after {} of {} bytes",
                                device,
                                out.len(),
                                n
                            );
                            break;
                        }
                        Err(e) => return Err(e),
                    }
                }
                out
            }
        };

        trace!("read({}) -> {}", n, hex::encode(&out));
        Ok(out)
    }

    /// Read everything buffered. If nothing is, wait up to the read timeout
    /// for data; without a timeout return immediately.
    pub fn read_all(&self) -> Result<Vec<u8>> {
        let queue = self.session.queue();
        let device = self.session.identity();

        let mut out: Vec<u8> = self.carry().bytes.drain(..).collect();
        match queue.drain(device, Some(Duration::ZERO)) {
            Ok(events) => out.extend(events.into_iter().flat_map(|e| e.payload)),
            Err(Error::NotConnected) if !out.is_empty() => {}
            Err(e) => return Err(e),
        }

        if out.is_empty() {
            if let Some(timeout) = self.read_timeout {
                let events = queue.drain(device, Some(timeout))?;
                out.extend(events.into_iter().flat_map(|e| e.payload));
            }
        }

        trace!("read_all() -> {}", hex::encode(&out));
        Ok(out)
    }

    /// Send `data` to whichever service accepts it. Returns the number of
    /// bytes written.
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        if !self.session.is_connected() {
            return Err(Error::NotConnected);
        }
        if data.is_empty() {
            return Ok(0);
        }

        let router = self.session.router().ok_or(Error::NotConnected)?;
        let route = router.route_write(data)?;
        self.session
            .write_characteristic(&route.write, data, self.write_timeout)?;
        Ok(data.len())
    }

    /// Writes are not buffered
    pub fn flush(&self) -> Result<()> {
        Ok(())
    }
}

impl io::Read for ByteStream {
    /// A stream that has ended reads as end-of-file.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let bytes = match self.collect(buf.len(), self.read_timeout) {
            Ok(bytes) if bytes.is_empty() => return Err(Error::ReadTimeout.into()),
            Ok(bytes) => bytes,
            Err(Error::NotConnected) => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        buf[..bytes.len()].copy_from_slice(&bytes);
        Ok(bytes.len())
    }
}

impl io::Write for ByteStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        ByteStream::write(self, buf).map_err(io::Error::from)
    }

    fn flush(&mut self) -> io::Result<()> {
        ByteStream::flush(self).map_err(io::Error::from)
    }
}
