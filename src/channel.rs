//! Per-client data channel
//!
//! A connected `AF_UNIX`/`SOCK_SEQPACKET` socketpair shipping fixed-size
//! sample records from the broker to one client. Both directions are
//! non-blocking and message boundaries are preserved, so a reader always
//! receives whole records. A full buffer or a closed peer fails the send
//! immediately instead of stalling the delivery loop.

use crate::config::ChannelConfig;
use crate::core::types::{SensorId, SensorSample, SAMPLE_RECORD_SIZE};
use crate::error::{Error, Result};
use libc::c_int;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};

/// Broker-side endpoint pair of one client session.
///
/// The channel is either fully open (both descriptors valid) or fully
/// closed; callers never observe a half-torn-down state. Descriptors are
/// owned handles and released on every exit path, including early errors
/// during creation.
pub struct DataChannel {
    send_fd: Mutex<Option<OwnedFd>>,
    recv_fd: Mutex<Option<OwnedFd>>,
    active: AtomicBool,
    /// Most recent sample per sensor, so a late-joining or re-enabled
    /// reader can be handed last-known state without waiting for the next
    /// hardware tick.
    last_samples: Mutex<HashMap<SensorId, SensorSample>>,
}

impl DataChannel {
    /// Allocate a connected non-blocking socketpair.
    ///
    /// The broker->client direction gets a send buffer sized for
    /// `send_buffer_samples` records; the reverse direction is kept small.
    pub fn create(config: &ChannelConfig) -> Result<Self> {
        let mut fds: [c_int; 2] = [0; 2];
        // SAFETY: fds points at a writable array of two c_ints
        let rc = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_SEQPACKET, 0, fds.as_mut_ptr()) };
        if rc != 0 {
            return Err(Error::SocketCreateFailed(io::Error::last_os_error()));
        }
        // SAFETY: socketpair succeeded, both fds are valid and unowned
        let send_fd = unsafe { OwnedFd::from_raw_fd(fds[0]) };
        // SAFETY: see above
        let recv_fd = unsafe { OwnedFd::from_raw_fd(fds[1]) };

        let data_bytes = (config.send_buffer_samples * SAMPLE_RECORD_SIZE) as c_int;
        let control_bytes = config.recv_buffer_bytes as c_int;
        set_sock_buf(send_fd.as_raw_fd(), libc::SO_SNDBUF, data_bytes)
            .and_then(|_| set_sock_buf(recv_fd.as_raw_fd(), libc::SO_RCVBUF, data_bytes))
            .and_then(|_| set_sock_buf(send_fd.as_raw_fd(), libc::SO_RCVBUF, control_bytes))
            .and_then(|_| set_sock_buf(recv_fd.as_raw_fd(), libc::SO_SNDBUF, control_bytes))
            .and_then(|_| set_nonblocking(send_fd.as_raw_fd()))
            .and_then(|_| set_nonblocking(recv_fd.as_raw_fd()))
            .map_err(Error::SocketCreateFailed)?;

        Ok(Self {
            send_fd: Mutex::new(Some(send_fd)),
            recv_fd: Mutex::new(Some(recv_fd)),
            active: AtomicBool::new(true),
            last_samples: Mutex::new(HashMap::new()),
        })
    }

    /// Non-blocking send of one record. Retried only when interrupted by a
    /// signal; a full buffer or closed peer yields `SendFailed` without
    /// blocking the caller.
    pub fn send(&self, sample: &SensorSample) -> Result<()> {
        let guard = self.send_fd.lock();
        let fd = guard.as_ref().ok_or(Error::ChannelClosed)?.as_raw_fd();
        let record = sample.encode();
        loop {
            // SAFETY: record outlives the call and fd is held open by the guard
            let sent = unsafe {
                libc::send(
                    fd,
                    record.as_ptr() as *const libc::c_void,
                    record.len(),
                    libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL,
                )
            };
            if sent >= 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            log::debug!("Channel send failed: {}", err);
            return Err(Error::SendFailed);
        }
    }

    /// Non-blocking read into `buf`; returns the byte count of one whole
    /// record, or a `WouldBlock` I/O error when nothing is queued.
    pub fn receive(&self, buf: &mut [u8]) -> Result<usize> {
        let guard = self.recv_fd.lock();
        let fd = guard.as_ref().ok_or(Error::ChannelClosed)?.as_raw_fd();
        loop {
            // SAFETY: buf is writable for buf.len() bytes and fd is held open
            let received = unsafe {
                libc::recv(
                    fd,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                    libc::MSG_DONTWAIT,
                )
            };
            if received >= 0 {
                return Ok(received as usize);
            }
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(Error::Io(err));
        }
    }

    /// Convenience wrapper: read one record if available
    pub fn receive_sample(&self) -> Result<Option<SensorSample>> {
        let mut buf = [0u8; SAMPLE_RECORD_SIZE];
        match self.receive(&mut buf) {
            Ok(n) if n >= SAMPLE_RECORD_SIZE => Ok(SensorSample::decode(&buf)),
            Ok(_) => Ok(None),
            Err(Error::Io(e)) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Close both descriptors. Idempotent; also runs on drop.
    pub fn close(&self) {
        self.active.store(false, Ordering::Relaxed);
        drop(self.send_fd.lock().take());
        drop(self.recv_fd.lock().take());
    }

    /// Drop only the client-facing endpoint, e.g. after its descriptor has
    /// been transferred to the client process over the control channel.
    pub fn close_receive(&self) {
        drop(self.recv_fd.lock().take());
    }

    pub fn is_open(&self) -> bool {
        self.send_fd.lock().is_some()
    }

    /// Whether the delivery loop should write into this channel
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Relaxed);
    }

    /// Remember the most recent sample for a sensor
    pub fn cache_sample(&self, sample: &SensorSample) {
        self.last_samples.lock().insert(sample.sensor_id, *sample);
    }

    /// Last-known sample for a sensor, if any was ever delivered
    pub fn cached_sample(&self, sensor_id: SensorId) -> Option<SensorSample> {
        self.last_samples.lock().get(&sensor_id).copied()
    }
}

impl Drop for DataChannel {
    fn drop(&mut self) {
        self.close();
    }
}

fn set_sock_buf(fd: RawFd, option: c_int, bytes: c_int) -> io::Result<()> {
    // SAFETY: bytes lives across the call; option size matches c_int
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            option,
            &bytes as *const c_int as *const libc::c_void,
            std::mem::size_of::<c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: plain fcntl on a valid fd
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: see above
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn test_channel() -> DataChannel {
        DataChannel::create(&Config::defaults().channel).expect("socketpair")
    }

    #[test]
    fn test_round_trip_preserves_order_and_bytes() {
        let channel = test_channel();

        let samples: Vec<SensorSample> = (0..8)
            .map(|i| SensorSample::with_floats(1, i as i64 * 1_000, &[i as f32, 0.5]))
            .collect();
        for sample in &samples {
            channel.send(sample).expect("send");
        }
        for expected in &samples {
            let got = channel
                .receive_sample()
                .expect("receive")
                .expect("record available");
            assert_eq!(&got, expected);
        }
        // queue drained
        assert!(channel.receive_sample().unwrap().is_none());
    }

    #[test]
    fn test_receive_on_empty_does_not_block() {
        let channel = test_channel();
        assert!(channel.receive_sample().unwrap().is_none());
    }

    #[test]
    fn test_send_after_peer_close_fails_without_blocking() {
        let channel = test_channel();
        channel.close_receive();

        let sample = SensorSample::new(3, 7);
        match channel.send(&sample) {
            Err(Error::SendFailed) => {}
            other => panic!("expected SendFailed, got {other:?}"),
        }
        // the channel itself is still usable for bookkeeping
        channel.cache_sample(&sample);
        assert_eq!(channel.cached_sample(3), Some(sample));
    }

    #[test]
    fn test_close_is_idempotent() {
        let channel = test_channel();
        channel.close();
        channel.close();
        assert!(!channel.is_open());
        assert!(matches!(
            channel.send(&SensorSample::new(1, 0)),
            Err(Error::ChannelClosed)
        ));
    }

    #[test]
    fn test_cache_keeps_latest_per_sensor() {
        let channel = test_channel();
        channel.cache_sample(&SensorSample::with_floats(8, 1, &[0.0]));
        channel.cache_sample(&SensorSample::with_floats(8, 2, &[5.0]));
        let cached = channel.cached_sample(8).unwrap();
        assert_eq!(cached.timestamp_ns, 2);
        assert_eq!(cached.float(0), Some(5.0));
        assert!(channel.cached_sample(1).is_none());
    }
}
