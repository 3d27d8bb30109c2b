//! Wire protocol spoken to the hardware backend process
//!
//! Frame format: `[LEN u32 big-endian] [OPCODE u8] [BODY]`
//!
//! Commands (broker -> backend): LIST_SENSORS, ENABLE, DISABLE, CONFIGURE.
//! Each command is answered by one REPLY frame carrying an i32 status
//! (0 = success) and an optional body. SAMPLE frames arrive unsolicited and
//! carry exactly one fixed-size sample record.

use crate::core::types::{RateConfig, SensorDescriptor, SensorId, SensorSample};
use crate::error::{Error, Result};
use std::io::{Read, Write};

/// Frame opcode: request the sensor descriptor list
pub const OP_LIST_SENSORS: u8 = 0x01;
/// Frame opcode: enable one sensor
pub const OP_ENABLE: u8 = 0x02;
/// Frame opcode: disable one sensor
pub const OP_DISABLE: u8 = 0x03;
/// Frame opcode: apply a sampling configuration
pub const OP_CONFIGURE: u8 = 0x04;
/// Frame opcode: unsolicited sample record
pub const OP_SAMPLE: u8 = 0x40;
/// Frame opcode: command reply
pub const OP_REPLY: u8 = 0x80;

/// Upper bound on any frame body; larger frames indicate a desynchronized
/// or hostile peer and close the connection.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// One frame of the backend protocol
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    ListSensors,
    Enable(SensorId),
    Disable(SensorId),
    Configure(SensorId, RateConfig),
    Reply { status: i32, body: Vec<u8> },
    Sample(SensorSample),
}

impl Frame {
    /// Encode opcode + body (without the length prefix)
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Frame::ListSensors => vec![OP_LIST_SENSORS],
            Frame::Enable(sensor_id) => {
                let mut buf = vec![OP_ENABLE];
                buf.extend_from_slice(&sensor_id.to_le_bytes());
                buf
            }
            Frame::Disable(sensor_id) => {
                let mut buf = vec![OP_DISABLE];
                buf.extend_from_slice(&sensor_id.to_le_bytes());
                buf
            }
            Frame::Configure(sensor_id, rate) => {
                let mut buf = vec![OP_CONFIGURE];
                buf.extend_from_slice(&sensor_id.to_le_bytes());
                buf.extend_from_slice(&rate.sampling_period_ns.to_le_bytes());
                buf.extend_from_slice(&rate.max_report_delay_ns.to_le_bytes());
                buf
            }
            Frame::Reply { status, body } => {
                let mut buf = vec![OP_REPLY];
                buf.extend_from_slice(&status.to_le_bytes());
                buf.extend_from_slice(body);
                buf
            }
            Frame::Sample(sample) => {
                let mut buf = vec![OP_SAMPLE];
                buf.extend_from_slice(&sample.encode());
                buf
            }
        }
    }

    /// Decode one frame payload (opcode + body)
    pub fn decode(payload: &[u8]) -> Result<Frame> {
        let (&opcode, body) = payload
            .split_first()
            .ok_or_else(|| Error::Protocol("empty frame".to_string()))?;
        match opcode {
            OP_LIST_SENSORS => Ok(Frame::ListSensors),
            OP_ENABLE => Ok(Frame::Enable(read_i32(body, 0)?)),
            OP_DISABLE => Ok(Frame::Disable(read_i32(body, 0)?)),
            OP_CONFIGURE => Ok(Frame::Configure(
                read_i32(body, 0)?,
                RateConfig::new(read_i64(body, 4)?, read_i64(body, 12)?),
            )),
            OP_REPLY => Ok(Frame::Reply {
                status: read_i32(body, 0)?,
                body: body[4.min(body.len())..].to_vec(),
            }),
            OP_SAMPLE => SensorSample::decode(body)
                .map(Frame::Sample)
                .ok_or_else(|| Error::Protocol("short sample record".to_string())),
            other => Err(Error::Protocol(format!("unknown opcode {other:#04x}"))),
        }
    }
}

/// Read one length-prefixed frame from the stream
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Frame> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 || len > MAX_FRAME_LEN {
        return Err(Error::Protocol(format!("bad frame length {len}")));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Frame::decode(&payload)
}

/// Write one length-prefixed frame to the stream
pub fn write_frame<W: Write>(writer: &mut W, frame: &Frame) -> Result<()> {
    let payload = frame.encode();
    writer.write_all(&(payload.len() as u32).to_be_bytes())?;
    writer.write_all(&payload)?;
    writer.flush()?;
    Ok(())
}

/// Encode a descriptor list as a LIST_SENSORS reply body
pub fn encode_descriptors(descriptors: &[SensorDescriptor]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&(descriptors.len() as u32).to_le_bytes());
    for d in descriptors {
        buf.extend_from_slice(&d.sensor_id.to_le_bytes());
        buf.extend_from_slice(&d.type_id.to_le_bytes());
        buf.extend_from_slice(&d.max_range.to_le_bytes());
        buf.extend_from_slice(&d.resolution.to_le_bytes());
        buf.extend_from_slice(&d.power.to_le_bytes());
        buf.extend_from_slice(&d.min_sample_period_ns.to_le_bytes());
        buf.extend_from_slice(&d.max_sample_period_ns.to_le_bytes());
        buf.extend_from_slice(&d.fifo_max_event_count.to_le_bytes());
        for s in [&d.name, &d.vendor, &d.firmware_version, &d.hardware_version] {
            buf.extend_from_slice(&(s.len() as u16).to_le_bytes());
            buf.extend_from_slice(s.as_bytes());
        }
    }
    buf
}

/// Decode a LIST_SENSORS reply body
pub fn decode_descriptors(body: &[u8]) -> Result<Vec<SensorDescriptor>> {
    let count = read_u32(body, 0)? as usize;
    let mut offset = 4;
    let mut descriptors = Vec::with_capacity(count);
    for _ in 0..count {
        let sensor_id = read_i32(body, offset)?;
        let type_id = read_i32(body, offset + 4)?;
        let max_range = read_f32(body, offset + 8)?;
        let resolution = read_f32(body, offset + 12)?;
        let power = read_f32(body, offset + 16)?;
        let min_sample_period_ns = read_i64(body, offset + 20)?;
        let max_sample_period_ns = read_i64(body, offset + 28)?;
        let fifo_max_event_count = read_i64(body, offset + 36)?;
        offset += 44;

        let mut strings = Vec::with_capacity(4);
        for _ in 0..4 {
            let len = read_u16(body, offset)? as usize;
            offset += 2;
            let bytes = body
                .get(offset..offset + len)
                .ok_or_else(|| Error::Protocol("truncated descriptor string".to_string()))?;
            strings.push(String::from_utf8_lossy(bytes).into_owned());
            offset += len;
        }
        let mut strings = strings.into_iter();
        descriptors.push(SensorDescriptor {
            sensor_id,
            type_id,
            name: strings.next().unwrap_or_default(),
            vendor: strings.next().unwrap_or_default(),
            firmware_version: strings.next().unwrap_or_default(),
            hardware_version: strings.next().unwrap_or_default(),
            max_range,
            resolution,
            power,
            min_sample_period_ns,
            max_sample_period_ns,
            fifo_max_event_count,
        });
    }
    Ok(descriptors)
}

fn field<const N: usize>(buf: &[u8], offset: usize) -> Result<[u8; N]> {
    buf.get(offset..offset + N)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| Error::Protocol("truncated frame".to_string()))
}

fn read_u16(buf: &[u8], offset: usize) -> Result<u16> {
    Ok(u16::from_le_bytes(field(buf, offset)?))
}

fn read_u32(buf: &[u8], offset: usize) -> Result<u32> {
    Ok(u32::from_le_bytes(field(buf, offset)?))
}

fn read_i32(buf: &[u8], offset: usize) -> Result<i32> {
    Ok(i32::from_le_bytes(field(buf, offset)?))
}

fn read_i64(buf: &[u8], offset: usize) -> Result<i64> {
    Ok(i64::from_le_bytes(field(buf, offset)?))
}

fn read_f32(buf: &[u8], offset: usize) -> Result<f32> {
    Ok(f32::from_le_bytes(field(buf, offset)?))
}
