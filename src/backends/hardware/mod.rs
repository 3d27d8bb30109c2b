//! Hardware backend connection
//!
//! Binds to the device-subsystem process over its Unix socket and speaks
//! the framed protocol in [`protocol`]. Commands are answered synchronously
//! with a status reply; sample records arrive unsolicited and are routed to
//! the registered sink by a dedicated reader thread. The reader doubles as
//! the death watch: when the stream breaks it clears the connection under
//! lock and emits a death event so the hub can reconnect.

pub mod protocol;

use crate::config::BackendConfig;
use crate::core::backend::{BackendEvent, SensorBackend};
use crate::core::types::{RateConfig, SensorDescriptor, SensorId, SensorSample};
use crate::error::{Error, Result};
use crossbeam_channel::{Receiver, Sender};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use protocol::Frame;
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// How long to wait for the backend to answer one command
const REPLY_TIMEOUT: Duration = Duration::from_secs(2);

/// Hardware backend variant
pub struct HardwareBackend {
    socket_path: String,
    connect_retries: u32,
    retry_delay: Duration,
    /// Writer half; cleared under lock when the connection dies
    stream: Arc<Mutex<Option<UnixStream>>>,
    /// Set while tearing the connection down on purpose, so the reader
    /// does not report a death for it
    expect_close: Arc<AtomicBool>,
    replies: Option<Receiver<(i32, Vec<u8>)>>,
    sample_tx: Option<Sender<SensorSample>>,
    lifecycle_tx: Option<Sender<BackendEvent>>,
    reader: Option<JoinHandle<()>>,
}

impl HardwareBackend {
    pub fn new(config: &BackendConfig) -> Self {
        Self {
            socket_path: config.socket_path.clone(),
            connect_retries: config.connect_retries.max(1),
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            stream: Arc::new(Mutex::new(None)),
            expect_close: Arc::new(AtomicBool::new(false)),
            replies: None,
            sample_tx: None,
            lifecycle_tx: None,
            reader: None,
        }
    }

    fn teardown_connection(&mut self) {
        self.expect_close.store(true, Ordering::Relaxed);
        if let Some(stream) = self.stream.lock().take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        if let Some(handle) = self.reader.take() {
            let _ = handle.join();
        }
        self.replies = None;
        self.expect_close.store(false, Ordering::Relaxed);
    }

    /// Send one command frame and wait for its status reply
    fn request(&self, frame: &Frame) -> Result<(i32, Vec<u8>)> {
        let replies = self.replies.as_ref().ok_or(Error::NotConnected)?;
        // Drop stale replies left over from a command that timed out
        while replies.try_recv().is_ok() {}
        {
            let mut guard = self.stream.lock();
            let stream = guard.as_mut().ok_or(Error::NotConnected)?;
            protocol::write_frame(stream, frame)?;
        }
        replies
            .recv_timeout(REPLY_TIMEOUT)
            .map_err(|_| Error::Timeout)
    }

    fn command(&self, frame: &Frame, what: &str) -> Result<()> {
        let (status, _) = self.request(frame)?;
        if status != 0 {
            return Err(Error::ConfigureFailed(format!(
                "{what} rejected with backend status {status}"
            )));
        }
        Ok(())
    }
}

impl SensorBackend for HardwareBackend {
    fn connect(&mut self) -> Result<()> {
        self.teardown_connection();

        let mut attempt = 0;
        let stream = loop {
            attempt += 1;
            match UnixStream::connect(&self.socket_path) {
                Ok(stream) => break stream,
                Err(e) => {
                    warn!(
                        "Backend connect attempt {}/{} failed: {}",
                        attempt, self.connect_retries, e
                    );
                    if attempt >= self.connect_retries {
                        error!(
                            "Hardware backend unreachable at {}, giving up",
                            self.socket_path
                        );
                        return Err(Error::ConnectFailed(self.connect_retries));
                    }
                    thread::sleep(self.retry_delay);
                }
            }
        };

        let reader_stream = stream.try_clone()?;
        *self.stream.lock() = Some(stream);

        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        self.replies = Some(reply_rx);

        let sample_tx = self.sample_tx.clone();
        let lifecycle_tx = self.lifecycle_tx.clone();
        let stream_slot = Arc::clone(&self.stream);
        let expect_close = Arc::clone(&self.expect_close);
        self.reader = Some(
            thread::Builder::new()
                .name("backend-reader".to_string())
                .spawn(move || {
                    reader_loop(
                        reader_stream,
                        reply_tx,
                        sample_tx,
                        lifecycle_tx,
                        stream_slot,
                        expect_close,
                    );
                })?,
        );

        info!("Connected to hardware backend at {}", self.socket_path);
        Ok(())
    }

    fn list_sensors(&self) -> Result<Vec<SensorDescriptor>> {
        let (status, body) = self.request(&Frame::ListSensors)?;
        if status != 0 {
            return Err(Error::Other(format!(
                "sensor list query failed with backend status {status}"
            )));
        }
        protocol::decode_descriptors(&body)
    }

    fn enable(&mut self, sensor_id: SensorId) -> Result<()> {
        self.command(&Frame::Enable(sensor_id), "enable")
    }

    fn disable(&mut self, sensor_id: SensorId) -> Result<()> {
        self.command(&Frame::Disable(sensor_id), "disable")
    }

    fn configure(&mut self, sensor_id: SensorId, rate: RateConfig) -> Result<()> {
        self.command(&Frame::Configure(sensor_id, rate), "configure")
    }

    fn register_sample_sink(&mut self, sink: Sender<SensorSample>) {
        self.sample_tx = Some(sink);
    }

    fn register_lifecycle_sink(&mut self, sink: Sender<BackendEvent>) {
        self.lifecycle_tx = Some(sink);
    }

    fn disconnect(&mut self) {
        self.teardown_connection();
    }
}

impl Drop for HardwareBackend {
    fn drop(&mut self) {
        self.teardown_connection();
    }
}

fn reader_loop(
    mut stream: UnixStream,
    reply_tx: Sender<(i32, Vec<u8>)>,
    sample_tx: Option<Sender<SensorSample>>,
    lifecycle_tx: Option<Sender<BackendEvent>>,
    stream_slot: Arc<Mutex<Option<UnixStream>>>,
    expect_close: Arc<AtomicBool>,
) {
    debug!("Backend reader thread started");
    loop {
        match protocol::read_frame(&mut stream) {
            Ok(Frame::Sample(sample)) => {
                if let Some(tx) = sample_tx.as_ref() {
                    if tx.try_send(sample).is_err() {
                        warn!("Sample sink full, dropping record of sensor {}", sample.sensor_id);
                    }
                }
            }
            Ok(Frame::Reply { status, body }) => {
                let _ = reply_tx.try_send((status, body));
            }
            Ok(other) => {
                warn!("Unexpected frame from backend: {:?}", other);
            }
            Err(e) => {
                if expect_close.load(Ordering::Relaxed) {
                    debug!("Backend reader closing: {}", e);
                } else {
                    warn!("Backend connection lost: {}", e);
                    stream_slot.lock().take();
                    if let Some(tx) = lifecycle_tx.as_ref() {
                        let _ = tx.send(BackendEvent::Died);
                    }
                }
                break;
            }
        }
    }
    debug!("Backend reader thread exiting");
}
