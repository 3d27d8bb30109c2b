//! Core data types for sensors, sampling configuration, and samples.
//!
//! Key types:
//! - [`SensorDescriptor`]: static metadata discovered from the backend
//! - [`RateConfig`]: one (sampling period, max report delay) pair
//! - [`SensorSample`]: the fixed-size binary record shipped to clients

use crossbeam_channel::{Receiver, Sender};

/// Sensor identifier assigned by the backend
pub type SensorId = i32;

/// Client identifier (the subscribing process)
pub type ClientId = i32;

/// Sensor type id for accelerometers
pub const SENSOR_TYPE_ACCELEROMETER: i32 = 1;
/// Sensor type id for gyroscopes
pub const SENSOR_TYPE_GYROSCOPE: i32 = 2;
/// Sensor type id for ambient light sensors
pub const SENSOR_TYPE_AMBIENT_LIGHT: i32 = 5;
/// Sensor type id for proximity sensors
pub const SENSOR_TYPE_PROXIMITY: i32 = 8;

/// Distance value a proximity sensor reports when nothing is near.
///
/// Written back into the stored sample when the last subscriber leaves so
/// a later subscriber never observes a stale "near" reading.
pub const PROXIMITY_FAR: f32 = 5.0;

/// Payload capacity of one sample record, in bytes (16 f32 values)
pub const SAMPLE_PAYLOAD_LEN: usize = 64;

/// Encoded size of one sample record on the wire
pub const SAMPLE_RECORD_SIZE: usize = 28 + SAMPLE_PAYLOAD_LEN;

/// Static metadata about one physical sensor.
///
/// Populated once when the backend connects; replaced only by a full
/// reconnect.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorDescriptor {
    pub sensor_id: SensorId,
    pub type_id: i32,
    pub name: String,
    pub vendor: String,
    pub firmware_version: String,
    pub hardware_version: String,
    /// Maximum measurement range of the sensor
    pub max_range: f32,
    /// Smallest measurable increment
    pub resolution: f32,
    /// Power draw in mA while enabled
    pub power: f32,
    /// Minimum sampling period allowed, in ns
    pub min_sample_period_ns: i64,
    /// Maximum sampling period allowed, in ns
    pub max_sample_period_ns: i64,
    /// Largest number of samples the hardware FIFO can queue
    pub fifo_max_event_count: i64,
}

impl SensorDescriptor {
    /// Proximity-class sensors get a "far" default written into the stored
    /// sample when their last subscriber leaves.
    pub fn is_proximity(&self) -> bool {
        self.type_id == SENSOR_TYPE_PROXIMITY
    }
}

/// One (sampling period, max report delay) pair, in nanoseconds.
///
/// Used both for client requests and for the aggregate configuration
/// applied to hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateConfig {
    pub sampling_period_ns: i64,
    pub max_report_delay_ns: i64,
}

impl RateConfig {
    pub fn new(sampling_period_ns: i64, max_report_delay_ns: i64) -> Self {
        Self {
            sampling_period_ns,
            max_report_delay_ns,
        }
    }
}

/// One client's subscription to one sensor
#[derive(Debug, Clone, Copy)]
pub struct Subscription {
    pub rate: RateConfig,
    pub enabled: bool,
}

/// Fixed-size binary sample record.
///
/// Encoded little-endian at [`SAMPLE_RECORD_SIZE`] bytes; copied on fanout
/// and never mutated after creation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorSample {
    pub sensor_id: SensorId,
    /// Schema version of the payload layout
    pub version: i32,
    pub timestamp_ns: i64,
    /// Option bits (range / accuracy flags)
    pub option: u32,
    /// Reporting mode the sample was produced under
    pub mode: i32,
    /// Valid byte count in `data`
    pub data_len: u32,
    pub data: [u8; SAMPLE_PAYLOAD_LEN],
}

impl SensorSample {
    pub fn new(sensor_id: SensorId, timestamp_ns: i64) -> Self {
        Self {
            sensor_id,
            version: 1,
            timestamp_ns,
            option: 0,
            mode: 0,
            data_len: 0,
            data: [0u8; SAMPLE_PAYLOAD_LEN],
        }
    }

    /// Build a sample whose payload is a sequence of f32 values
    pub fn with_floats(sensor_id: SensorId, timestamp_ns: i64, values: &[f32]) -> Self {
        let mut sample = Self::new(sensor_id, timestamp_ns);
        sample.set_floats(values);
        sample
    }

    /// Overwrite the payload with a sequence of f32 values
    pub fn set_floats(&mut self, values: &[f32]) {
        let count = values.len().min(SAMPLE_PAYLOAD_LEN / 4);
        for (i, v) in values.iter().take(count).enumerate() {
            self.data[i * 4..i * 4 + 4].copy_from_slice(&v.to_le_bytes());
        }
        self.data_len = (count * 4) as u32;
    }

    /// Read the i-th f32 of the payload, if present
    pub fn float(&self, index: usize) -> Option<f32> {
        let offset = index * 4;
        if offset + 4 > self.data_len as usize {
            return None;
        }
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.data[offset..offset + 4]);
        Some(f32::from_le_bytes(bytes))
    }

    /// Overwrite the i-th f32 of the payload in place
    pub fn set_float(&mut self, index: usize, value: f32) {
        let offset = index * 4;
        if offset + 4 <= SAMPLE_PAYLOAD_LEN {
            self.data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
            if (offset + 4) as u32 > self.data_len {
                self.data_len = (offset + 4) as u32;
            }
        }
    }

    /// Encode to the fixed wire layout
    pub fn encode(&self) -> [u8; SAMPLE_RECORD_SIZE] {
        let mut buf = [0u8; SAMPLE_RECORD_SIZE];
        buf[0..4].copy_from_slice(&self.sensor_id.to_le_bytes());
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..16].copy_from_slice(&self.timestamp_ns.to_le_bytes());
        buf[16..20].copy_from_slice(&self.option.to_le_bytes());
        buf[20..24].copy_from_slice(&self.mode.to_le_bytes());
        buf[24..28].copy_from_slice(&self.data_len.to_le_bytes());
        buf[28..].copy_from_slice(&self.data);
        buf
    }

    /// Decode from the fixed wire layout. Returns `None` when the buffer is
    /// shorter than one whole record; partial records are never produced by
    /// a message-boundary-preserving channel.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < SAMPLE_RECORD_SIZE {
            return None;
        }
        let mut data = [0u8; SAMPLE_PAYLOAD_LEN];
        data.copy_from_slice(&buf[28..SAMPLE_RECORD_SIZE]);
        let data_len = u32::from_le_bytes(buf[24..28].try_into().ok()?);
        if data_len as usize > SAMPLE_PAYLOAD_LEN {
            return None;
        }
        Some(Self {
            sensor_id: i32::from_le_bytes(buf[0..4].try_into().ok()?),
            version: i32::from_le_bytes(buf[4..8].try_into().ok()?),
            timestamp_ns: i64::from_le_bytes(buf[8..16].try_into().ok()?),
            option: u32::from_le_bytes(buf[16..20].try_into().ok()?),
            mode: i32::from_le_bytes(buf[20..24].try_into().ok()?),
            data_len,
            data,
        })
    }
}

/// Bound of the backend-to-delivery sample channel: a couple of seconds of
/// headroom at the fastest supported rates.
const SAMPLE_CHANNEL_BOUND: usize = 1024;

/// Create the bounded channel the backend pushes samples into
pub fn create_sample_channel() -> (Sender<SensorSample>, Receiver<SensorSample>) {
    crossbeam_channel::bounded(SAMPLE_CHANNEL_BOUND)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_encode_decode() {
        let mut sample = SensorSample::with_floats(8, 123_456_789, &[0.25, -3.5, 9.81]);
        sample.option = 3;
        sample.mode = 2;

        let encoded = sample.encode();
        assert_eq!(encoded.len(), SAMPLE_RECORD_SIZE);

        let decoded = SensorSample::decode(&encoded).expect("record should decode");
        assert_eq!(decoded, sample);
        assert_eq!(decoded.data_len, 12);
        assert_eq!(decoded.float(2), Some(9.81));
        assert_eq!(decoded.float(3), None);
    }

    #[test]
    fn test_decode_rejects_short_buffer() {
        let sample = SensorSample::new(1, 0);
        let encoded = sample.encode();
        assert!(SensorSample::decode(&encoded[..SAMPLE_RECORD_SIZE - 1]).is_none());
    }

    #[test]
    fn test_set_float_extends_len() {
        let mut sample = SensorSample::new(8, 0);
        sample.set_float(0, PROXIMITY_FAR);
        assert_eq!(sample.data_len, 4);
        assert_eq!(sample.float(0), Some(PROXIMITY_FAR));
    }
}
