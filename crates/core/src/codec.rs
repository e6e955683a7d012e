//! Bidirectional MIDI codec between RTP-MIDI command lists and typed messages.
//!
//! The session layer hands this module the *MIDI command list* portion of an
//! RTP-MIDI payload (RFC 6295 §3) — the journal is stripped below this seam.
//!
//! ```text
//! command list:  [delta] command [delta command ...]
//! command:       [status] data*          (status omitted under running status)
//! ```
//!
//! Decoding keeps a running-status byte for the duration of one buffer only;
//! state is never carried across packets. A zero byte between commands is
//! treated as a delta-time octet and skipped (same-instant commands carry
//! zero deltas; non-zero deltas are consumed by the session library before
//! the list reaches this codec).
//!
//! Encoding always emits a full status byte per command — running status is
//! understood on receive, never produced on send. Pitch-bend travels as LSB,
//! MSB of the unsigned 14-bit value `v + 8192`.

use crate::error::{BridgeError, Result};

/// Default cap on an encoded SysEx message, matching the 4 KiB send buffer
/// used for outgoing RTP-MIDI payloads.
pub const DEFAULT_MAX_SYSEX: usize = 4096;

/// A structured MIDI 1.0 message.
///
/// Channel numbers are 0-based (`0..=15`). Data bytes are 7-bit. SysEx
/// carries the full byte range including the `0xF0` / `0xF7` frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MidiMessage {
    NoteOff { channel: u8, note: u8, velocity: u8 },
    NoteOn { channel: u8, note: u8, velocity: u8 },
    PolyPressure { channel: u8, note: u8, pressure: u8 },
    ControlChange { channel: u8, controller: u8, value: u8 },
    ProgramChange { channel: u8, program: u8 },
    ChannelPressure { channel: u8, pressure: u8 },
    /// 14-bit bend as a signed offset in `[-8192, 8191]`.
    PitchBend { channel: u8, value: i16 },
    /// Full SysEx bytes, `0xF0 ... 0xF7` inclusive.
    SysEx(Vec<u8>),
    /// MTC quarter-frame data byte.
    QuarterFrame(u8),
    SongSelect(u8),
    TuneRequest,
    TimingClock,
    Start,
    Continue,
    Stop,
    ActiveSensing,
    SystemReset,
}

/// Decoder for RTP-MIDI command lists.
///
/// Carries no wire state between buffers — running status is scoped to a
/// single [`decode`](Self::decode) call. The only thing that persists is
/// the set of unsupported command types already warned about, so each
/// unknown type is logged once per decoder (one per router), not once per
/// packet.
#[derive(Debug, Default)]
pub struct Decoder {
    /// One bit per status byte; set once the first warning for that
    /// command type has been emitted.
    warned_unsupported: [u64; 4],
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    fn unsupported(&mut self, status: u8) -> BridgeError {
        let word = (status >> 6) as usize;
        let bit = 1u64 << (status & 0x3f);
        if self.warned_unsupported[word] & bit == 0 {
            self.warned_unsupported[word] |= bit;
            tracing::warn!(
                command = format_args!("{status:#04x}"),
                "unsupported MIDI command type, dropping rest of buffer"
            );
        }
        BridgeError::UnsupportedCommand(status)
    }

    /// Decode one command list, delivering each message to `sink`.
    ///
    /// Running status is tracked within this buffer only. On error the
    /// already decoded prefix has been delivered to `sink`; the remainder
    /// of the buffer is dropped.
    pub fn decode(&mut self, buffer: &[u8], mut sink: impl FnMut(MidiMessage)) -> Result<()> {
        let mut pos = 0usize;
        let mut running_status = 0u8;

        while pos < buffer.len() {
            let first = buffer[pos];
            if first & 0x80 != 0 {
                running_status = first;
                pos += 1;
            } else if running_status == 0 {
                // Data byte with no status to run under.
                return Err(self.unsupported(first));
            }
            let status = running_status;

            let message = match status & 0xf0 {
                0x80 => {
                    let [note, velocity] = take::<2>(buffer, &mut pos, status)?;
                    MidiMessage::NoteOff { channel: status & 0x0f, note, velocity }
                }
                0x90 => {
                    let [note, velocity] = take::<2>(buffer, &mut pos, status)?;
                    MidiMessage::NoteOn { channel: status & 0x0f, note, velocity }
                }
                0xa0 => {
                    let [note, pressure] = take::<2>(buffer, &mut pos, status)?;
                    MidiMessage::PolyPressure { channel: status & 0x0f, note, pressure }
                }
                0xb0 => {
                    let [controller, value] = take::<2>(buffer, &mut pos, status)?;
                    MidiMessage::ControlChange { channel: status & 0x0f, controller, value }
                }
                0xc0 => {
                    let [program] = take::<1>(buffer, &mut pos, status)?;
                    MidiMessage::ProgramChange { channel: status & 0x0f, program }
                }
                0xd0 => {
                    let [pressure] = take::<1>(buffer, &mut pos, status)?;
                    MidiMessage::ChannelPressure { channel: status & 0x0f, pressure }
                }
                0xe0 => {
                    let [lsb, msb] = take::<2>(buffer, &mut pos, status)?;
                    let value = (((msb as i16) << 7) | lsb as i16) - 8192;
                    MidiMessage::PitchBend { channel: status & 0x0f, value }
                }
                0xf0 => match status {
                    0xf0 => decode_sysex(buffer, &mut pos)?,
                    0xf1 => {
                        let [data] = take::<1>(buffer, &mut pos, status)?;
                        MidiMessage::QuarterFrame(data)
                    }
                    0xf3 => {
                        let [song] = take::<1>(buffer, &mut pos, status)?;
                        MidiMessage::SongSelect(song)
                    }
                    0xf6 => MidiMessage::TuneRequest,
                    0xf8 => MidiMessage::TimingClock,
                    0xfa => MidiMessage::Start,
                    0xfb => MidiMessage::Continue,
                    0xfc => MidiMessage::Stop,
                    0xfe => MidiMessage::ActiveSensing,
                    0xff => MidiMessage::SystemReset,
                    other => return Err(self.unsupported(other)),
                },
                other => return Err(self.unsupported(other)),
            };

            sink(message);

            // Zero delta-time octet between same-instant commands.
            if pos < buffer.len() && buffer[pos] == 0x00 {
                pos += 1;
            }
        }

        Ok(())
    }
}

/// Read `N` data bytes, failing if the buffer ends mid-command.
fn take<const N: usize>(buffer: &[u8], pos: &mut usize, status: u8) -> Result<[u8; N]> {
    if *pos + N > buffer.len() {
        return Err(BridgeError::TruncatedCommand(status));
    }
    let mut out = [0u8; N];
    out.copy_from_slice(&buffer[*pos..*pos + N]);
    *pos += N;
    Ok(out)
}

/// Scan from just after the `0xF0` status to the `0xF7` terminator.
fn decode_sysex(buffer: &[u8], pos: &mut usize) -> Result<MidiMessage> {
    let mut bytes = vec![0xf0];
    loop {
        if *pos >= buffer.len() {
            tracing::warn!("SysEx in buffer has no end byte");
            return Err(BridgeError::MalformedSysEx);
        }
        let b = buffer[*pos];
        *pos += 1;
        bytes.push(b);
        if b == 0xf7 {
            return Ok(MidiMessage::SysEx(bytes));
        }
    }
}

/// Encode one message onto the wire with [`DEFAULT_MAX_SYSEX`] as the cap.
pub fn encode(message: &MidiMessage, out: &mut Vec<u8>) -> Result<()> {
    encode_limited(message, out, DEFAULT_MAX_SYSEX)
}

/// Encode one message, rejecting SysEx larger than `max_sysex` bytes.
///
/// Every command carries a full status byte; the decoder's running-status
/// handling is not exploited on the send side.
pub fn encode_limited(message: &MidiMessage, out: &mut Vec<u8>, max_sysex: usize) -> Result<()> {
    match *message {
        MidiMessage::NoteOff { channel, note, velocity } => {
            out.extend_from_slice(&[0x80 | (channel & 0x0f), note, velocity]);
        }
        MidiMessage::NoteOn { channel, note, velocity } => {
            out.extend_from_slice(&[0x90 | (channel & 0x0f), note, velocity]);
        }
        MidiMessage::PolyPressure { channel, note, pressure } => {
            out.extend_from_slice(&[0xa0 | (channel & 0x0f), note, pressure]);
        }
        MidiMessage::ControlChange { channel, controller, value } => {
            out.extend_from_slice(&[0xb0 | (channel & 0x0f), controller, value]);
        }
        MidiMessage::ProgramChange { channel, program } => {
            out.extend_from_slice(&[0xc0 | (channel & 0x0f), program]);
        }
        MidiMessage::ChannelPressure { channel, pressure } => {
            out.extend_from_slice(&[0xd0 | (channel & 0x0f), pressure]);
        }
        MidiMessage::PitchBend { channel, value } => {
            let unsigned = (value as i32 + 8192) as u16;
            out.extend_from_slice(&[
                0xe0 | (channel & 0x0f),
                (unsigned & 0x7f) as u8,
                ((unsigned >> 7) & 0x7f) as u8,
            ]);
        }
        MidiMessage::SysEx(ref bytes) => {
            if bytes.len() > max_sysex {
                tracing::warn!(size = bytes.len(), max = max_sysex, "SysEx over send cap, not sending");
                return Err(BridgeError::MessageTooLarge { size: bytes.len(), max: max_sysex });
            }
            out.extend_from_slice(bytes);
        }
        MidiMessage::QuarterFrame(data) => out.extend_from_slice(&[0xf1, data]),
        MidiMessage::SongSelect(song) => out.extend_from_slice(&[0xf3, song]),
        MidiMessage::TuneRequest => out.push(0xf6),
        MidiMessage::TimingClock => out.push(0xf8),
        MidiMessage::Start => out.push(0xfa),
        MidiMessage::Continue => out.push(0xfb),
        MidiMessage::Stop => out.push(0xfc),
        MidiMessage::ActiveSensing => out.push(0xfe),
        MidiMessage::SystemReset => out.push(0xff),
    }
    Ok(())
}

/// Split a framed SysEx message into frames of at most `max_frame` bytes
/// for delivery to hosts with a small per-event buffer.
///
/// Framing: the first frame opens with `0xF0`, continuation frames open
/// with `0xF7`; every frame with a successor closes with `0xF0` as a
/// continuation marker, and the final frame closes with the real `0xF7`.
/// Dropping the markers and concatenating the frames reconstructs the
/// original payload.
pub fn segment_sysex(message: &[u8], max_frame: usize) -> Vec<Vec<u8>> {
    if message.len() <= max_frame || message.len() < 2 || max_frame < 3 {
        return vec![message.to_vec()];
    }

    let payload = &message[1..message.len() - 1];
    let chunk = max_frame - 2;
    let mut frames = Vec::with_capacity(payload.len() / chunk + 1);
    let mut offset = 0usize;

    while offset < payload.len() {
        let remaining = payload.len() - offset;
        let take = remaining.min(chunk);
        let last = remaining <= chunk;

        let mut frame = Vec::with_capacity(take + 2);
        frame.push(if offset == 0 { 0xf0 } else { 0xf7 });
        frame.extend_from_slice(&payload[offset..offset + take]);
        frame.push(if last { 0xf7 } else { 0xf0 });
        frames.push(frame);

        offset += take;
    }

    tracing::trace!(
        sysex_bytes = message.len(),
        frames = frames.len(),
        max_frame,
        "segmented SysEx for local delivery"
    );
    frames
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(buffer: &[u8]) -> Vec<MidiMessage> {
        let mut out = Vec::new();
        Decoder::new().decode(buffer, |m| out.push(m)).unwrap();
        out
    }

    fn round_trip(message: MidiMessage) {
        let mut wire = Vec::new();
        encode(&message, &mut wire).unwrap();
        assert_eq!(decode_all(&wire), vec![message]);
    }

    #[test]
    fn round_trip_channel_voice() {
        for channel in [0u8, 5, 15] {
            round_trip(MidiMessage::NoteOff { channel, note: 60, velocity: 0 });
            round_trip(MidiMessage::NoteOn { channel, note: 60, velocity: 64 });
            round_trip(MidiMessage::PolyPressure { channel, note: 61, pressure: 99 });
            round_trip(MidiMessage::ControlChange { channel, controller: 7, value: 127 });
            round_trip(MidiMessage::ProgramChange { channel, program: 42 });
            round_trip(MidiMessage::ChannelPressure { channel, pressure: 1 });
            round_trip(MidiMessage::PitchBend { channel, value: -512 });
        }
    }

    #[test]
    fn round_trip_system() {
        round_trip(MidiMessage::QuarterFrame(0x35));
        round_trip(MidiMessage::SongSelect(3));
        round_trip(MidiMessage::TuneRequest);
        round_trip(MidiMessage::TimingClock);
        round_trip(MidiMessage::Start);
        round_trip(MidiMessage::Continue);
        round_trip(MidiMessage::Stop);
        round_trip(MidiMessage::ActiveSensing);
        round_trip(MidiMessage::SystemReset);
    }

    #[test]
    fn running_status_two_note_ons() {
        let messages = decode_all(&[0x90, 60, 64, 62, 64]);
        assert_eq!(
            messages,
            vec![
                MidiMessage::NoteOn { channel: 0, note: 60, velocity: 64 },
                MidiMessage::NoteOn { channel: 0, note: 62, velocity: 64 },
            ]
        );
    }

    #[test]
    fn running_status_interrupted_by_new_status() {
        let messages = decode_all(&[0x90, 60, 64, 0x80, 60, 0]);
        assert_eq!(
            messages,
            vec![
                MidiMessage::NoteOn { channel: 0, note: 60, velocity: 64 },
                MidiMessage::NoteOff { channel: 0, note: 60, velocity: 0 },
            ]
        );
    }

    #[test]
    fn zero_delta_between_commands_is_skipped() {
        let messages = decode_all(&[0x90, 60, 64, 0x00, 62, 64]);
        assert_eq!(
            messages,
            vec![
                MidiMessage::NoteOn { channel: 0, note: 60, velocity: 64 },
                MidiMessage::NoteOn { channel: 0, note: 62, velocity: 64 },
            ]
        );
    }

    #[test]
    fn pitch_bend_wire_format() {
        for value in [-8192i16, -1, 0, 1, 2000, 8191] {
            let mut wire = Vec::new();
            encode(&MidiMessage::PitchBend { channel: 3, value }, &mut wire).unwrap();
            let unsigned = (value as i32 + 8192) as u16;
            assert_eq!(
                wire,
                vec![0xe3, (unsigned & 0x7f) as u8, ((unsigned >> 7) & 0x7f) as u8]
            );
            assert_eq!(
                decode_all(&wire),
                vec![MidiMessage::PitchBend { channel: 3, value }]
            );
        }
    }

    #[test]
    fn sysex_framing() {
        let body: Vec<u8> = (0u8..0x40).collect();
        let mut framed = vec![0xf0];
        framed.extend_from_slice(&body);
        framed.push(0xf7);

        let mut wire = Vec::new();
        encode(&MidiMessage::SysEx(framed.clone()), &mut wire).unwrap();
        assert_eq!(wire, framed);
        assert_eq!(decode_all(&wire), vec![MidiMessage::SysEx(framed)]);
    }

    #[test]
    fn sysex_missing_terminator() {
        let mut seen = Vec::new();
        let err = Decoder::new().decode(&[0xf0, 1, 2, 3], |m| seen.push(m)).unwrap_err();
        assert!(matches!(err, BridgeError::MalformedSysEx));
        assert!(seen.is_empty());
    }

    #[test]
    fn sysex_over_cap_rejected() {
        let framed = {
            let mut v = vec![0xf0];
            v.extend(std::iter::repeat(0x11u8).take(64));
            v.push(0xf7);
            v
        };
        let mut wire = Vec::new();
        let err = encode_limited(&MidiMessage::SysEx(framed), &mut wire, 32).unwrap_err();
        assert!(matches!(err, BridgeError::MessageTooLarge { size: 66, max: 32 }));
        assert!(wire.is_empty());
    }

    #[test]
    fn unsupported_command_keeps_decoded_prefix() {
        // Song position pointer (0xF2) is not handled; the note-on before
        // it must still come through.
        let mut seen = Vec::new();
        let mut decoder = Decoder::new();
        let err = decoder.decode(&[0x90, 60, 64, 0xf2, 0x01, 0x02], |m| seen.push(m)).unwrap_err();
        assert!(matches!(err, BridgeError::UnsupportedCommand(0xf2)));
        assert_eq!(seen, vec![MidiMessage::NoteOn { channel: 0, note: 60, velocity: 64 }]);
    }

    #[test]
    fn data_byte_without_status_rejected() {
        let err = Decoder::new().decode(&[0x33, 0x44], |_| {}).unwrap_err();
        assert!(matches!(err, BridgeError::UnsupportedCommand(0x33)));
    }

    #[test]
    fn truncated_command() {
        let err = Decoder::new().decode(&[0x90, 60], |_| {}).unwrap_err();
        assert!(matches!(err, BridgeError::TruncatedCommand(0x90)));
    }

    #[test]
    fn unsupported_command_still_fails_after_first_warning() {
        // The per-decoder warning dedup must not change the error result.
        let mut decoder = Decoder::new();
        for _ in 0..2 {
            let err = decoder.decode(&[0xf2, 0x01, 0x02], |_| {}).unwrap_err();
            assert!(matches!(err, BridgeError::UnsupportedCommand(0xf2)));
        }
    }

    #[test]
    fn segmentation_round_trip() {
        // 600-byte SysEx split into 256-byte frames.
        let mut message = vec![0xf0];
        message.extend((0..598u32).map(|i| (i % 128) as u8));
        message.push(0xf7);
        assert_eq!(message.len(), 600);

        let frames = segment_sysex(&message, 256);
        assert_eq!(frames.len(), 3);

        // First frame opens the SysEx, continuations open with 0xF7.
        assert_eq!(frames[0][0], 0xf0);
        assert_eq!(frames[1][0], 0xf7);
        assert_eq!(frames[2][0], 0xf7);
        // Non-final frames close with the 0xF0 continuation marker.
        assert_eq!(*frames[0].last().unwrap(), 0xf0);
        assert_eq!(*frames[1].last().unwrap(), 0xf0);
        assert_eq!(*frames[2].last().unwrap(), 0xf7);
        for frame in &frames {
            assert!(frame.len() <= 256);
        }

        // Dropping the markers and concatenating reconstructs the payload.
        let mut rebuilt = vec![0xf0];
        for frame in &frames {
            rebuilt.extend_from_slice(&frame[1..frame.len() - 1]);
        }
        rebuilt.push(0xf7);
        assert_eq!(rebuilt, message);
    }

    #[test]
    fn segmentation_small_message_single_frame() {
        let message = vec![0xf0, 1, 2, 3, 0xf7];
        assert_eq!(segment_sysex(&message, 256), vec![message.clone()]);
    }
}
