//! MPEG-TS packetization
//!
//! Segments are sequences of 188-byte packets: a fixed two-packet PAT/PMT
//! preamble, then the PES payloads split across packets per PID.
//!
//! ```text
//! Packet:        4 bytes              184 bytes
//!   +-----------+---------------------------------------+
//!   | ts header | [adaptation field] [stuffing] payload |
//!   +-----------+---------------------------------------+
//! ```

use bytes::{BufMut, BytesMut};

/// TS packet size
pub const TS_PACKET_SIZE: usize = 188;

/// Elementary stream PIDs
pub const PID_VIDEO: u16 = 0x100;
pub const PID_AUDIO: u16 = 0x101;

/// Program map table PID referenced from the PAT
const PID_PMT: u16 = 0x1001;

/// Stream types carried in the PMT
const STREAM_TYPE_H264: u8 = 0x1B;
const STREAM_TYPE_AAC: u8 = 0x0F;

/// CRC-32/MPEG-2 over a PSI section
fn crc32_mpeg(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xFFFF_FFFF;
    for &byte in data {
        crc ^= (byte as u32) << 24;
        for _ in 0..8 {
            crc = if crc & 0x8000_0000 != 0 {
                (crc << 1) ^ 0x04C1_1DB7
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// One 188-byte packet holding a PSI section, stuffed with 0xFF
fn psi_packet(pid: u16, section: &[u8]) -> [u8; TS_PACKET_SIZE] {
    let mut packet = [0xFFu8; TS_PACKET_SIZE];
    packet[0] = 0x47;
    packet[1] = 0x40 | ((pid >> 8) as u8 & 0x1F); // PUSI set
    packet[2] = pid as u8;
    packet[3] = 0x10; // payload only, CC 0
    packet[4] = 0x00; // pointer field

    let crc = crc32_mpeg(section);
    packet[5..5 + section.len()].copy_from_slice(section);
    packet[5 + section.len()..5 + section.len() + 4].copy_from_slice(&crc.to_be_bytes());
    packet
}

/// The PAT packet: one program pointing at the PMT
pub fn pat_packet() -> [u8; TS_PACKET_SIZE] {
    let section: [u8; 12] = [
        0x00, // table_id
        0xB0, 0x0D, // section_syntax + length 13
        0x00, 0x01, // transport_stream_id
        0xC1, // version 0, current
        0x00, // section_number
        0x00, // last_section_number
        0x00, 0x01, // program_number 1
        0xF0 | ((PID_PMT >> 8) as u8 & 0x1F),
        PID_PMT as u8,
    ];
    psi_packet(0x0000, &section)
}

/// The PMT packet: H.264 on PID 0x100 (also PCR), AAC on PID 0x101
pub fn pmt_packet() -> [u8; TS_PACKET_SIZE] {
    let section: [u8; 22] = [
        0x02, // table_id
        0xB0, 0x17, // section_syntax + length 23
        0x00, 0x01, // program_number
        0xC1, // version 0, current
        0x00, // section_number
        0x00, // last_section_number
        0xE0 | ((PID_VIDEO >> 8) as u8 & 0x1F),
        PID_VIDEO as u8, // PCR PID
        0xF0, 0x00, // program_info_length
        STREAM_TYPE_H264,
        0xE0 | ((PID_VIDEO >> 8) as u8 & 0x1F),
        PID_VIDEO as u8,
        0xF0, 0x00,
        STREAM_TYPE_AAC,
        0xE0 | ((PID_AUDIO >> 8) as u8 & 0x1F),
        PID_AUDIO as u8,
        0xF0, 0x00,
    ];
    psi_packet(PID_PMT, &section)
}

/// The fixed preamble written at the start of every segment file
pub fn pat_pmt_preamble() -> [u8; TS_PACKET_SIZE * 2] {
    let mut preamble = [0u8; TS_PACKET_SIZE * 2];
    preamble[..TS_PACKET_SIZE].copy_from_slice(&pat_packet());
    preamble[TS_PACKET_SIZE..].copy_from_slice(&pmt_packet());
    preamble
}

/// Split one PES into TS packets appended to `out`
///
/// The first packet sets PUSI and carries an adaptation field with
/// PCR = `pcr`; keyframes additionally set the random-access bit. The
/// continuity counter wraps modulo 16 per PID. Short tails are stuffed
/// with 0xFF through the adaptation field.
pub fn write_pes(out: &mut BytesMut, pid: u16, keyframe: bool, cc: &mut u8, pcr: u64, pes: &[u8]) {
    let mut first = true;
    let mut pes_idx = 0;

    while pes_idx < pes.len() {
        *cc = (*cc + 1) & 0x0F;

        let mut packet = [0xFFu8; TS_PACKET_SIZE];
        packet[0] = 0x47;
        packet[1] = ((pid >> 8) as u8) & 0x1F;
        if first {
            packet[1] |= 0x40; // payload_unit_start_indicator
        }
        packet[2] = pid as u8;
        packet[3] = 0x10 | *cc; // payload, counter

        let mut header_len = 4;

        if first {
            // Adaptation field with PCR
            packet[3] |= 0x20;
            packet[4] = 7;
            packet[5] = 0x10; // PCR flag
            if keyframe {
                packet[5] |= 0x40; // random access indicator
            }
            packet[6] = (pcr >> 25) as u8;
            packet[7] = (pcr >> 17) as u8;
            packet[8] = (pcr >> 9) as u8;
            packet[9] = (pcr >> 1) as u8;
            packet[10] = ((pcr << 7) as u8) | 0x7E;
            packet[11] = 0x00;
            header_len += 8;
            first = false;
        }

        let ts_remaining = TS_PACKET_SIZE - header_len;
        let pes_remaining = pes.len() - pes_idx;

        if ts_remaining <= pes_remaining {
            // Full packet
            packet[header_len..].copy_from_slice(&pes[pes_idx..pes_idx + ts_remaining]);
            pes_idx += ts_remaining;
        } else {
            // Tail packet: stuff the gap through the adaptation field
            let stuffing = ts_remaining - pes_remaining;

            if packet[3] & 0x20 != 0 {
                // Extend the existing adaptation field (already 0xFF-filled)
                packet[4] += stuffing as u8;
            } else {
                packet[3] |= 0x20;
                packet[4] = (stuffing - 1) as u8;
                if stuffing >= 2 {
                    packet[5] = 0x00; // adaptation flags, then 0xFF stuffing
                }
            }

            packet[TS_PACKET_SIZE - pes_remaining..].copy_from_slice(&pes[pes_idx..]);
            pes_idx += pes_remaining;
        }

        out.put_slice(&packet);
    }
}
