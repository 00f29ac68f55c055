//! Wire format of the device-control protocol.
//!
//! Client to server: `opcode[4] | length: u32 BE | payload[length]`.
//! Server to client: `length: u16 BE | command[4] | payload`, where `length`
//! counts the command and the payload.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::coordinator::Track;
use crate::protocol_constants::{
    SLIM_CLIENT_HEADER_LEN, SLIM_MAX_INBOUND, STREAM_PATH, STRM_PARAMS_LEN,
};

/// A client message whose payload is shorter than its opcode requires.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("{opcode} frame truncated: need {need} bytes, got {got}")]
pub struct FrameError {
    pub opcode: String,
    pub need: usize,
    pub got: usize,
}

// ─────────────────────────────────────────────────────────────────────────────
// Framing
// ─────────────────────────────────────────────────────────────────────────────

/// One undecoded client frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub opcode: [u8; 4],
    pub payload: Bytes,
}

/// Reassembles client frames from arbitrary read boundaries.
///
/// The buffer is bounded, so input is taken in pieces that fit and complete
/// frames are split off between pieces. A frame that declares a length the
/// buffer could never hold is skipped over without losing alignment.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
    /// Bytes of an oversized frame still to be thrown away.
    skip: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes received bytes and returns every frame they complete.
    pub fn decode(&mut self, mut data: &[u8]) -> Vec<RawFrame> {
        let mut frames = Vec::new();
        while !data.is_empty() {
            if self.skip > 0 {
                let n = self.skip.min(data.len());
                self.skip -= n;
                data = &data[n..];
                continue;
            }

            let take = (SLIM_MAX_INBOUND - self.buf.len()).min(data.len());
            self.buf.extend_from_slice(&data[..take]);
            data = &data[take..];

            let before = frames.len();
            while let Some(frame) = self.next_frame() {
                frames.push(frame);
            }
            if take == 0 && frames.len() == before && self.skip == 0 {
                // A full buffer always holds a frame or an oversized header.
                log::warn!("[Slim] Inbound buffer stalled, dropping {} bytes", data.len());
                break;
            }
        }
        frames
    }

    /// Bytes buffered but not yet returned as frames.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Pops the next complete frame, if any.
    pub fn next_frame(&mut self) -> Option<RawFrame> {
        if self.skip > 0 || self.buf.len() < SLIM_CLIENT_HEADER_LEN {
            return None;
        }
        let len = u32::from_be_bytes([self.buf[4], self.buf[5], self.buf[6], self.buf[7]]) as usize;
        if len > SLIM_MAX_INBOUND - SLIM_CLIENT_HEADER_LEN {
            log::warn!("[Slim] Discarding oversized frame ({} bytes)", len);
            self.buf.advance(SLIM_CLIENT_HEADER_LEN);
            let buffered = self.buf.len().min(len);
            self.buf.advance(buffered);
            self.skip = len - buffered;
            return None;
        }
        if self.buf.len() < SLIM_CLIENT_HEADER_LEN + len {
            return None;
        }

        let mut opcode = [0u8; 4];
        opcode.copy_from_slice(&self.buf[..4]);
        self.buf.advance(SLIM_CLIENT_HEADER_LEN);
        let payload = self.buf.split_to(len).freeze();
        Some(RawFrame { opcode, payload })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Client messages
// ─────────────────────────────────────────────────────────────────────────────

/// Device greeting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Helo {
    pub device_id: u8,
    pub revision: u8,
    pub mac: [u8; 6],
    pub uuid: Option<[u8; 16]>,
    pub wlan_channels: u16,
    pub bytes_received: u64,
}

impl Helo {
    /// Lowercase colon-separated MAC, used as the client id.
    pub fn client_id(&self) -> String {
        self.mac
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<Vec<_>>()
            .join(":")
    }
}

/// Status event carried in a `STAT` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatEvent {
    /// `STMs`: playback started.
    Started,
    /// `STMd`: decoder ready for the next track.
    DecoderReady,
    /// `STMu`: buffer underrun, the track ended.
    Underrun,
    /// `STMt`: periodic heartbeat.
    Heartbeat,
    /// `STMp`: paused.
    Paused,
    /// `STMr`: resumed.
    Resumed,
    /// `STMf`: buffers flushed (stopped).
    Flushed,
    Other([u8; 4]),
}

impl StatEvent {
    fn from_code(code: [u8; 4]) -> Self {
        match &code {
            b"STMs" => Self::Started,
            b"STMd" => Self::DecoderReady,
            b"STMu" => Self::Underrun,
            b"STMt" => Self::Heartbeat,
            b"STMp" => Self::Paused,
            b"STMr" => Self::Resumed,
            b"STMf" => Self::Flushed,
            _ => Self::Other(code),
        }
    }
}

/// Device status report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stat {
    pub event: StatEvent,
    pub buffer_size: u32,
    pub buffer_fullness: u32,
    pub bytes_received: u64,
    pub signal_strength: u16,
    pub jiffies: u32,
    pub output_buffer_size: u32,
    pub output_buffer_fullness: u32,
    pub elapsed_seconds: u32,
    pub voltage: u16,
    pub elapsed_ms: Option<u32>,
}

impl Stat {
    /// Playback position, preferring the millisecond field.
    pub fn elapsed_ms(&self) -> u64 {
        self.elapsed_ms
            .map(u64::from)
            .unwrap_or(u64::from(self.elapsed_seconds) * 1000)
    }
}

/// Decoded client message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    Helo(Helo),
    Stat(Stat),
    Bye,
    Resp(Bytes),
    Unknown { opcode: [u8; 4], len: usize },
}

/// Device id, revision and MAC.
const HELO_MIN_LEN: usize = 1 + 1 + 6;
/// Id, revision, MAC, UUID, wlan channels, bytes received, language.
const HELO_UUID_LEN: usize = 1 + 1 + 6 + 16 + 2 + 8 + 2;
/// STAT up to and including the voltage field.
const STAT_MIN_LEN: usize = 43;

impl ClientMessage {
    pub fn parse(frame: RawFrame) -> Result<Self, FrameError> {
        let mut p = frame.payload;
        let truncated = |need: usize, got: usize| FrameError {
            opcode: String::from_utf8_lossy(&frame.opcode).into_owned(),
            need,
            got,
        };

        match &frame.opcode {
            b"HELO" => {
                let len = p.len();
                if len < HELO_MIN_LEN {
                    return Err(truncated(HELO_MIN_LEN, len));
                }
                let device_id = p.get_u8();
                let revision = p.get_u8();
                let mut mac = [0u8; 6];
                p.copy_to_slice(&mut mac);
                let uuid = if len >= HELO_UUID_LEN {
                    let mut uuid = [0u8; 16];
                    p.copy_to_slice(&mut uuid);
                    Some(uuid)
                } else {
                    None
                };
                let wlan_channels = if p.remaining() >= 2 { p.get_u16() } else { 0 };
                let bytes_received = if p.remaining() >= 8 { p.get_u64() } else { 0 };
                Ok(Self::Helo(Helo {
                    device_id,
                    revision,
                    mac,
                    uuid,
                    wlan_channels,
                    bytes_received,
                }))
            }
            b"STAT" => {
                if p.len() < STAT_MIN_LEN {
                    return Err(truncated(STAT_MIN_LEN, p.len()));
                }
                let mut code = [0u8; 4];
                p.copy_to_slice(&mut code);
                p.advance(3); // crlf count, mas init, mas mode
                let buffer_size = p.get_u32();
                let buffer_fullness = p.get_u32();
                let bytes_received = p.get_u64();
                let signal_strength = p.get_u16();
                let jiffies = p.get_u32();
                let output_buffer_size = p.get_u32();
                let output_buffer_fullness = p.get_u32();
                let elapsed_seconds = p.get_u32();
                let voltage = p.get_u16();
                let elapsed_ms = (p.remaining() >= 4).then(|| p.get_u32());
                Ok(Self::Stat(Stat {
                    event: StatEvent::from_code(code),
                    buffer_size,
                    buffer_fullness,
                    bytes_received,
                    signal_strength,
                    jiffies,
                    output_buffer_size,
                    output_buffer_fullness,
                    elapsed_seconds,
                    voltage,
                    elapsed_ms,
                }))
            }
            b"BYE!" => Ok(Self::Bye),
            b"RESP" => Ok(Self::Resp(p)),
            _ => Ok(Self::Unknown {
                opcode: frame.opcode,
                len: p.len(),
            }),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Server commands
// ─────────────────────────────────────────────────────────────────────────────

/// Frames a server command.
///
/// The length field is 16 bits wide; a payload that does not fit is logged
/// and nothing is framed.
pub fn encode_frame(command: &[u8; 4], payload: &[u8]) -> Bytes {
    let Ok(len) = u16::try_from(4 + payload.len()) else {
        log::error!(
            "[Slim] {} payload of {} bytes exceeds the frame limit",
            String::from_utf8_lossy(command),
            payload.len()
        );
        return Bytes::new();
    };
    let mut out = BytesMut::with_capacity(2 + 4 + payload.len());
    out.put_u16(len);
    out.put_slice(command);
    out.put_slice(payload);
    out.freeze()
}

/// Parameters of a `strm` command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamCommand {
    /// `s` start, `q` stop, `p` pause, `u` unpause, `t` status request.
    pub command: u8,
    pub autostart: u8,
    pub format: u8,
    pub pcm_sample_size: u8,
    pub pcm_sample_rate: u8,
    pub pcm_channels: u8,
    pub pcm_endian: u8,
    /// KiB of input buffered before autostart.
    pub threshold: u8,
    pub spdif: u8,
    pub transition_duration: u8,
    pub transition_type: u8,
    pub flags: u8,
    pub output_threshold: u8,
    /// 16.16 fixed point, only sent with `s`.
    pub replay_gain: u32,
    pub server_port: u16,
    /// 0 = the address of the control connection.
    pub server_ip: u32,
    /// HTTP request the device sends to fetch the stream (start only).
    pub http_request: Option<String>,
}

impl Default for StreamCommand {
    fn default() -> Self {
        Self {
            command: b'q',
            autostart: b'1',
            format: b'm',
            pcm_sample_size: b'?',
            pcm_sample_rate: b'?',
            pcm_channels: b'?',
            pcm_endian: b'?',
            threshold: 255,
            spdif: b'0',
            transition_duration: 0,
            transition_type: b'0',
            flags: 0,
            output_threshold: 0,
            replay_gain: 0,
            server_port: 0,
            server_ip: 0,
            http_request: None,
        }
    }
}

impl StreamCommand {
    /// Start streaming `track` from the HTTP server on `http_port`.
    pub fn start(track: &Track, http_port: u16, client_id: &str) -> Self {
        Self {
            command: b's',
            format: track.format.strm_code(),
            pcm_sample_size: pcm_sample_size_code(track.bits_per_sample),
            pcm_sample_rate: pcm_sample_rate_code(track.sample_rate),
            pcm_channels: match track.channels {
                1..=9 => b'0' + track.channels,
                _ => b'?',
            },
            server_port: http_port,
            http_request: Some(format!(
                "GET {STREAM_PATH}?player={client_id} HTTP/1.0\r\n\r\n"
            )),
            ..Self::default()
        }
    }

    pub fn stop() -> Self {
        Self::default()
    }

    pub fn pause() -> Self {
        Self {
            command: b'p',
            ..Self::default()
        }
    }

    pub fn unpause() -> Self {
        Self {
            command: b'u',
            ..Self::default()
        }
    }

    /// Encodes the complete `strm` frame.
    pub fn encode(&self) -> Bytes {
        let request = self.http_request.as_deref().unwrap_or_default();
        let mut payload = BytesMut::with_capacity(STRM_PARAMS_LEN + request.len());
        payload.put_slice(&[
            self.command,
            self.autostart,
            self.format,
            self.pcm_sample_size,
            self.pcm_sample_rate,
            self.pcm_channels,
            self.pcm_endian,
            self.threshold,
            self.spdif,
            self.transition_duration,
            self.transition_type,
            self.flags,
            self.output_threshold,
            0, // reserved
        ]);
        payload.put_u32(if self.command == b's' {
            self.replay_gain
        } else {
            0
        });
        payload.put_u16(self.server_port);
        payload.put_u32(self.server_ip);
        debug_assert_eq!(payload.len(), STRM_PARAMS_LEN);
        if self.command == b's' {
            payload.put_slice(request.as_bytes());
        }
        encode_frame(b"strm", &payload)
    }
}

fn pcm_sample_size_code(bits: u8) -> u8 {
    match bits {
        8 => b'0',
        16 => b'1',
        24 => b'2',
        32 => b'3',
        _ => b'?',
    }
}

fn pcm_sample_rate_code(hz: u32) -> u8 {
    match hz {
        11025 => b'0',
        22050 => b'1',
        44100 => b'2',
        48000 => b'3',
        8000 => b'5',
        12000 => b'6',
        16000 => b'7',
        24000 => b'8',
        96000 => b'9',
        _ => b'?',
    }
}

/// Converts a gain in dB to the device's 16.16 fixed-point format.
pub fn db_to_fixed(db: f32) -> u32 {
    let mult = 10f32.powf(db / 20.0);
    if (-30.0..=0.0).contains(&db) {
        ((mult * 256.0 + 0.5) as u32) << 8
    } else {
        (mult * 65536.0 + 0.5) as u32
    }
}

/// `audg` frame setting the volume (0-100, 2 steps per dB).
pub fn volume_frame(volume: u8) -> Bytes {
    let volume = volume.min(100);
    let gain = if volume == 0 {
        0
    } else {
        db_to_fixed((f32::from(volume) - 100.0) / 2.0)
    };

    let mut payload = BytesMut::with_capacity(18);
    payload.put_u32(gain); // legacy left
    payload.put_u32(gain); // legacy right
    payload.put_u8(1); // digital volume control
    payload.put_u8(255); // preamp
    payload.put_u32(gain);
    payload.put_u32(gain);
    encode_frame(b"audg", &payload)
}

/// `aude` frame enabling or disabling the S/PDIF and DAC outputs.
pub fn outputs_frame(spdif: bool, dac: bool) -> Bytes {
    encode_frame(b"aude", &[u8::from(spdif), u8::from(dac)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::AudioFormat;

    fn client_frame(opcode: &[u8; 4], payload: &[u8]) -> Vec<u8> {
        let mut out = opcode.to_vec();
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    fn helo_payload(with_uuid: bool) -> Vec<u8> {
        let mut p = vec![4, 2, 0x00, 0x04, 0x20, 0xAB, 0xCD, 0xEF];
        if with_uuid {
            p.extend_from_slice(&[7u8; 16]);
        }
        p.extend_from_slice(&0x4001u16.to_be_bytes());
        p.extend_from_slice(&1234u64.to_be_bytes());
        p.extend_from_slice(b"EN");
        p
    }

    fn stat_payload(event: &[u8; 4], elapsed_ms: Option<u32>) -> Vec<u8> {
        let mut p = event.to_vec();
        p.extend_from_slice(&[0, b'm', 0]);
        p.extend_from_slice(&100_000u32.to_be_bytes()); // buffer size
        p.extend_from_slice(&5_000u32.to_be_bytes()); // fullness
        p.extend_from_slice(&99u64.to_be_bytes()); // bytes received
        p.extend_from_slice(&80u16.to_be_bytes()); // signal
        p.extend_from_slice(&1u32.to_be_bytes()); // jiffies
        p.extend_from_slice(&2u32.to_be_bytes()); // out size
        p.extend_from_slice(&3u32.to_be_bytes()); // out fullness
        p.extend_from_slice(&12u32.to_be_bytes()); // elapsed s
        p.extend_from_slice(&0u16.to_be_bytes()); // voltage
        if let Some(ms) = elapsed_ms {
            p.extend_from_slice(&ms.to_be_bytes());
        }
        p
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Decoding
    // ─────────────────────────────────────────────────────────────────────────

    #[test]
    fn reassembles_frames_split_across_reads() {
        let mut wire = client_frame(b"HELO", &helo_payload(false));
        wire.extend(client_frame(b"BYE!", &[0]));

        let mut decoder = FrameDecoder::new();
        let (a, b) = wire.split_at(5);
        assert!(decoder.decode(a).is_empty());
        assert_eq!(decoder.buffered(), 5);

        let frames = decoder.decode(b);
        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[0].opcode, b"HELO");
        assert_eq!(ClientMessage::parse(frames[1].clone()).unwrap(), ClientMessage::Bye);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn decodes_bursts_larger_than_the_buffer() {
        let stat = client_frame(b"STAT", &stat_payload(b"STMt", Some(7)));
        let wire: Vec<u8> = stat.iter().copied().cycle().take(stat.len() * 100).collect();
        assert!(wire.len() > SLIM_MAX_INBOUND);

        let mut decoder = FrameDecoder::new();
        // Start mid-frame so the burst straddles a partially buffered frame.
        let (head, rest) = wire.split_at(3);
        assert!(decoder.decode(head).is_empty());
        let frames = decoder.decode(rest);

        assert_eq!(frames.len(), 100);
        assert!(frames.iter().all(|f| &f.opcode == b"STAT"));
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn skips_frame_declaring_impossible_length() {
        let mut wire = b"IR  ".to_vec();
        wire.extend_from_slice(&(5000u32).to_be_bytes());
        wire.extend(std::iter::repeat(0xAA).take(5000));
        wire.extend(client_frame(b"BYE!", &[0]));

        let mut decoder = FrameDecoder::new();
        let (a, b) = wire.split_at(100);
        assert!(decoder.decode(a).is_empty());
        assert_eq!(decoder.buffered(), 0);

        let frames = decoder.decode(b);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0].opcode, b"BYE!");
    }

    #[test]
    fn parses_helo_with_and_without_uuid() {
        for with_uuid in [false, true] {
            let frame = RawFrame {
                opcode: *b"HELO",
                payload: Bytes::from(helo_payload(with_uuid)),
            };
            let ClientMessage::Helo(helo) = ClientMessage::parse(frame).unwrap() else {
                panic!("expected HELO");
            };
            assert_eq!(helo.device_id, 4);
            assert_eq!(helo.client_id(), "00:04:20:ab:cd:ef");
            assert_eq!(helo.uuid.is_some(), with_uuid);
            assert_eq!(helo.wlan_channels, 0x4001);
            assert_eq!(helo.bytes_received, 1234);
        }
    }

    #[test]
    fn parses_stat_fields() {
        let frame = RawFrame {
            opcode: *b"STAT",
            payload: Bytes::from(stat_payload(b"STMt", Some(12_345))),
        };
        let ClientMessage::Stat(stat) = ClientMessage::parse(frame).unwrap() else {
            panic!("expected STAT");
        };
        assert_eq!(stat.event, StatEvent::Heartbeat);
        assert_eq!(stat.buffer_fullness, 5_000);
        assert_eq!(stat.bytes_received, 99);
        assert_eq!(stat.elapsed_seconds, 12);
        assert_eq!(stat.elapsed_ms(), 12_345);

        let frame = RawFrame {
            opcode: *b"STAT",
            payload: Bytes::from(stat_payload(b"STMd", None)),
        };
        let ClientMessage::Stat(stat) = ClientMessage::parse(frame).unwrap() else {
            panic!("expected STAT");
        };
        assert_eq!(stat.event, StatEvent::DecoderReady);
        assert_eq!(stat.elapsed_ms(), 12_000);
    }

    #[test]
    fn truncated_stat_is_an_error() {
        let frame = RawFrame {
            opcode: *b"STAT",
            payload: Bytes::from_static(b"STMs"),
        };
        let err = ClientMessage::parse(frame).unwrap_err();
        assert_eq!(err.need, STAT_MIN_LEN);
        assert_eq!(err.got, 4);
    }

    #[test]
    fn unknown_opcodes_are_reported() {
        let frame = RawFrame {
            opcode: *b"IR  ",
            payload: Bytes::from_static(&[1, 2, 3]),
        };
        assert_eq!(
            ClientMessage::parse(frame).unwrap(),
            ClientMessage::Unknown { opcode: *b"IR  ", len: 3 }
        );
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Encoding
    // ─────────────────────────────────────────────────────────────────────────

    #[test]
    fn stop_frame_is_24_parameter_bytes() {
        let frame = StreamCommand::stop().encode();
        assert_eq!(frame.len(), 2 + 4 + STRM_PARAMS_LEN);
        assert_eq!(u16::from_be_bytes([frame[0], frame[1]]) as usize, 4 + STRM_PARAMS_LEN);
        assert_eq!(&frame[2..6], b"strm");
        assert_eq!(frame[6], b'q');
        assert_eq!(frame[6 + 7], 255);
    }

    #[test]
    fn start_frame_carries_http_request() {
        let track = Track {
            format: AudioFormat::Flac,
            channels: 2,
            bits_per_sample: 16,
            sample_rate: 44100,
            ..Track::from_path("/music/a.flac")
        };
        let frame = StreamCommand::start(&track, 9000, "00:04:20:ab:cd:ef").encode();
        let params = &frame[6..6 + STRM_PARAMS_LEN];
        assert_eq!(params[0], b's');
        assert_eq!(params[2], b'f');
        assert_eq!(params[3], b'1');
        assert_eq!(params[4], b'2');
        assert_eq!(params[5], b'2');
        assert_eq!(u16::from_be_bytes([params[18], params[19]]), 9000);
        assert_eq!(&params[20..24], &[0, 0, 0, 0]);

        let request = std::str::from_utf8(&frame[6 + STRM_PARAMS_LEN..]).unwrap();
        assert_eq!(
            request,
            "GET /stream.mp3?player=00:04:20:ab:cd:ef HTTP/1.0\r\n\r\n"
        );
    }

    #[test]
    fn volume_gain_follows_db_curve() {
        assert_eq!(db_to_fixed(0.0), 256 << 8);
        // -6 dB is roughly half amplitude.
        let half = db_to_fixed(-6.0);
        assert!((32_000..33_500).contains(&half), "{half}");
        // Outside the table range the raw 16.16 value is used.
        assert_eq!(db_to_fixed(-40.0), (0.01f32 * 65536.0 + 0.5) as u32);

        let frame = volume_frame(100);
        assert_eq!(&frame[2..6], b"audg");
        assert_eq!(frame.len(), 6 + 18);
        assert_eq!(&frame[6..10], &(256u32 << 8).to_be_bytes());

        let muted = volume_frame(0);
        assert_eq!(&muted[6..10], &[0, 0, 0, 0]);
    }

    #[test]
    fn refuses_to_frame_payload_beyond_length_field() {
        assert!(encode_frame(b"strm", &vec![0u8; usize::from(u16::MAX)]).is_empty());

        let fits = encode_frame(b"strm", &vec![0u8; usize::from(u16::MAX) - 4]);
        assert_eq!(&fits[..2], &u16::MAX.to_be_bytes());
        assert_eq!(fits.len(), 2 + usize::from(u16::MAX));
    }
}
