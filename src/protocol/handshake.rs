//! RTMP handshake implementation
//!
//! ```text
//! Client                                   Server
//!   |------- C0 (1 byte: version) --------->|
//!   |------- C1 (1536 bytes) -------------->|
//!   |<------ S0 (1 byte: version) ----------|
//!   |<------ S1 (1536 bytes) ---------------|
//!   |<------ S2 (1536 bytes) ---------------|
//!   |------- C2 (1536 bytes) -------------->|
//! ```
//!
//! Two flavors share the exchange:
//! - **Simple**: C1 version bytes are zero; S1 and S2 echo C1, no digests.
//! - **Complex**: C1/S1 carry a version word and two 764-byte blocks (key
//!   and digest). Schema-0 orders them key||digest, schema-1 digest||key.
//!   The digest sits inside its block at
//!   `(sum of 4 bytes at base) % 728 + base + 4` and is the HMAC-SHA256 of
//!   the packet with the 32 digest bytes removed. S2/C2 chain a digest off
//!   the validated peer digest.
//!
//! Every phase runs under a 5-second deadline.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use crate::error::{Error, HandshakeError, Result};
use crate::protocol::constants::{HANDSHAKE_SIZE, RTMP_VERSION};

/// Digest length inside C1/S1/C2/S2
pub const DIGEST_SIZE: usize = 32;

/// Per-phase deadline
const PHASE_TIMEOUT: Duration = Duration::from_secs(5);

/// Digest-block base offset for schema-1 (digest||key)
const SCHEMA1_BASE: usize = 8;

/// Digest-block base offset for schema-0 (key||digest)
const SCHEMA0_BASE: usize = 8 + 764;

/// Flash Media Server version word carried in S1
const FMS_VERSION: [u8; 4] = [0x04, 0x05, 0x00, 0x00];

/// Flash Player version word carried in a complex C1
const FP_VERSION: [u8; 4] = [0x09, 0x00, 0x7C, 0x02];

/// "Genuine Adobe Flash Player 001" plus the shared tail
const GENUINE_FP_KEY: [u8; 62] = [
    b'G', b'e', b'n', b'u', b'i', b'n', b'e', b' ', b'A', b'd', b'o', b'b', b'e', b' ', b'F',
    b'l', b'a', b's', b'h', b' ', b'P', b'l', b'a', b'y', b'e', b'r', b' ', b'0', b'0', b'1',
    0xF0, 0xEE, 0xC2, 0x4A, 0x80, 0x68, 0xBE, 0xE8, 0x2E, 0x00, 0xD0, 0xD1, 0x02, 0x9E, 0x7E,
    0x57, 0x6E, 0xEC, 0x5D, 0x2D, 0x29, 0x80, 0x6F, 0xAB, 0x93, 0xB8, 0xE6, 0x36, 0xCF, 0xEB,
    0x31, 0xAE,
];

/// "Genuine Adobe Flash Media Server 001" plus the shared tail
const GENUINE_FMS_KEY: [u8; 68] = [
    b'G', b'e', b'n', b'u', b'i', b'n', b'e', b' ', b'A', b'd', b'o', b'b', b'e', b' ', b'F',
    b'l', b'a', b's', b'h', b' ', b'M', b'e', b'd', b'i', b'a', b' ', b'S', b'e', b'r', b'v',
    b'e', b'r', b' ', b'0', b'0', b'1', 0xF0, 0xEE, 0xC2, 0x4A, 0x80, 0x68, 0xBE, 0xE8, 0x2E,
    0x00, 0xD0, 0xD1, 0x02, 0x9E, 0x7E, 0x57, 0x6E, 0xEC, 0x5D, 0x2D, 0x29, 0x80, 0x6F, 0xAB,
    0x93, 0xB8, 0xE6, 0x36, 0xCF, 0xEB, 0x31, 0xAE,
];

fn hmac_sha256(data: &[u8], key: &[u8]) -> [u8; DIGEST_SIZE] {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Digest position inside a 764-byte block starting at `base`
fn digest_offset(packet: &[u8], base: usize) -> usize {
    let sum = packet[base] as usize
        + packet[base + 1] as usize
        + packet[base + 2] as usize
        + packet[base + 3] as usize;
    sum % 728 + base + 4
}

/// HMAC over the packet with its 32 digest bytes removed
fn make_digest(packet: &[u8], base: usize, key: &[u8]) -> [u8; DIGEST_SIZE] {
    let pos = digest_offset(packet, base);
    let mut joined = Vec::with_capacity(HANDSHAKE_SIZE - DIGEST_SIZE);
    joined.extend_from_slice(&packet[..pos]);
    joined.extend_from_slice(&packet[pos + DIGEST_SIZE..]);
    hmac_sha256(&joined, key)
}

/// Check the digest at `base`'s schema; return its position when valid
fn find_digest(packet: &[u8], base: usize, key: &[u8]) -> Option<usize> {
    let pos = digest_offset(packet, base);
    let expected = make_digest(packet, base, key);
    if packet[pos..pos + DIGEST_SIZE] == expected {
        Some(pos)
    } else {
        None
    }
}

/// Validate a complex C1: schema-0 (key||digest) first, then schema-1
fn validate_c1(c1: &[u8]) -> Option<usize> {
    find_digest(c1, SCHEMA0_BASE, &GENUINE_FP_KEY[..30])
        .or_else(|| find_digest(c1, SCHEMA1_BASE, &GENUINE_FP_KEY[..30]))
}

fn now_ms() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u32)
        .unwrap_or(0)
}

/// Fill with pseudo-random bytes
///
/// An LCG is plenty: the handshake filler carries no secrets.
fn fill_random(buf: &mut [u8]) {
    let mut seed = now_ms() as u64 ^ (buf.as_ptr() as u64);
    for chunk in buf.chunks_mut(8) {
        seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
        let bytes = seed.to_le_bytes();
        let len = chunk.len().min(8);
        chunk[..len].copy_from_slice(&bytes[..len]);
    }
}

/// Build a complex C1/S1 with a digest at the schema-1 position
fn make_digest_packet(version: [u8; 4], key: &[u8]) -> [u8; HANDSHAKE_SIZE] {
    let mut packet = [0u8; HANDSHAKE_SIZE];
    fill_random(&mut packet);
    packet[0..4].copy_from_slice(&now_ms().to_be_bytes());
    packet[4..8].copy_from_slice(&version);
    let pos = digest_offset(&packet, SCHEMA1_BASE);
    let digest = make_digest(&packet, SCHEMA1_BASE, key);
    packet[pos..pos + DIGEST_SIZE].copy_from_slice(&digest);
    packet
}

/// Build S2/C2: random body, peer time words, trailing chained digest
fn make_echo_packet(peer: &[u8], peer_digest: &[u8], key: &[u8]) -> [u8; HANDSHAKE_SIZE] {
    let mut packet = [0u8; HANDSHAKE_SIZE];
    fill_random(&mut packet);
    packet[0..4].copy_from_slice(&peer[0..4]);
    packet[4..8].copy_from_slice(&now_ms().to_be_bytes());

    let secret = hmac_sha256(peer_digest, key);
    let digest = hmac_sha256(&packet[..HANDSHAKE_SIZE - DIGEST_SIZE], &secret);
    packet[HANDSHAKE_SIZE - DIGEST_SIZE..].copy_from_slice(&digest);
    packet
}

/// Server side of the handshake
///
/// Reads C0C1, answers S0S1S2 (mirroring C1 in simple mode), reads C2.
pub async fn server_handshake<S>(stream: &mut S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // C0 + C1
    let mut c0 = [0u8; 1];
    let mut c1 = [0u8; HANDSHAKE_SIZE];
    timeout(PHASE_TIMEOUT, async {
        stream.read_exact(&mut c0).await?;
        stream.read_exact(&mut c1).await?;
        Ok::<_, Error>(())
    })
    .await
    .map_err(|_| Error::Timeout)??;

    if c0[0] < RTMP_VERSION {
        return Err(HandshakeError::InvalidVersion(c0[0]).into());
    }

    let simple = c1[4..8] == [0, 0, 0, 0];

    let (s1, s2) = if simple {
        // Mirror C1 as both S1 and S2
        (c1, c1)
    } else {
        let digest_pos = validate_c1(&c1).ok_or(HandshakeError::DigestMismatch)?;
        let s1 = make_digest_packet(FMS_VERSION, &GENUINE_FMS_KEY[..36]);
        let s2 = make_echo_packet(
            &c1,
            &c1[digest_pos..digest_pos + DIGEST_SIZE],
            &GENUINE_FMS_KEY,
        );
        (s1, s2)
    };

    // S0 + S1 + S2
    timeout(PHASE_TIMEOUT, async {
        stream.write_all(&[RTMP_VERSION]).await?;
        stream.write_all(&s1).await?;
        stream.write_all(&s2).await?;
        stream.flush().await?;
        Ok::<_, Error>(())
    })
    .await
    .map_err(|_| Error::Timeout)??;

    // C2 (consumed, not validated)
    let mut c2 = [0u8; HANDSHAKE_SIZE];
    timeout(PHASE_TIMEOUT, stream.read_exact(&mut c2))
        .await
        .map_err(|_| Error::Timeout)??;

    Ok(())
}

/// Client side, simple mode: C1 with zero version bytes, C2 echoing S1
pub async fn client_handshake<S>(stream: &mut S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut c1 = [0u8; HANDSHAKE_SIZE];
    fill_random(&mut c1);
    c1[0..4].copy_from_slice(&now_ms().to_be_bytes());
    c1[4..8].copy_from_slice(&[0, 0, 0, 0]);

    timeout(PHASE_TIMEOUT, async {
        stream.write_all(&[RTMP_VERSION]).await?;
        stream.write_all(&c1).await?;
        stream.flush().await?;
        Ok::<_, Error>(())
    })
    .await
    .map_err(|_| Error::Timeout)??;

    let mut s0 = [0u8; 1];
    let mut s1 = [0u8; HANDSHAKE_SIZE];
    let mut s2 = [0u8; HANDSHAKE_SIZE];
    timeout(PHASE_TIMEOUT, async {
        stream.read_exact(&mut s0).await?;
        stream.read_exact(&mut s1).await?;
        stream.read_exact(&mut s2).await?;
        Ok::<_, Error>(())
    })
    .await
    .map_err(|_| Error::Timeout)??;

    if s0[0] < RTMP_VERSION {
        return Err(HandshakeError::InvalidVersion(s0[0]).into());
    }

    // C2: echo S1 with our receive time
    let mut c2 = s1;
    c2[4..8].copy_from_slice(&now_ms().to_be_bytes());
    timeout(PHASE_TIMEOUT, async {
        stream.write_all(&c2).await?;
        stream.flush().await?;
        Ok::<_, Error>(())
    })
    .await
    .map_err(|_| Error::Timeout)??;

    Ok(())
}

/// Client side, complex mode: digest-carrying C1, S2 verification, chained C2
pub async fn client_handshake_complex<S>(stream: &mut S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let c1 = make_digest_packet(FP_VERSION, &GENUINE_FP_KEY[..30]);
    let c1_digest_pos = digest_offset(&c1, SCHEMA1_BASE);

    timeout(PHASE_TIMEOUT, async {
        stream.write_all(&[RTMP_VERSION]).await?;
        stream.write_all(&c1).await?;
        stream.flush().await?;
        Ok::<_, Error>(())
    })
    .await
    .map_err(|_| Error::Timeout)??;

    let mut s0 = [0u8; 1];
    let mut s1 = [0u8; HANDSHAKE_SIZE];
    let mut s2 = [0u8; HANDSHAKE_SIZE];
    timeout(PHASE_TIMEOUT, async {
        stream.read_exact(&mut s0).await?;
        stream.read_exact(&mut s1).await?;
        stream.read_exact(&mut s2).await?;
        Ok::<_, Error>(())
    })
    .await
    .map_err(|_| Error::Timeout)??;

    if s0[0] < RTMP_VERSION {
        return Err(HandshakeError::InvalidVersion(s0[0]).into());
    }

    let s1_digest_pos = find_digest(&s1, SCHEMA0_BASE, &GENUINE_FMS_KEY[..36])
        .or_else(|| find_digest(&s1, SCHEMA1_BASE, &GENUINE_FMS_KEY[..36]))
        .ok_or(HandshakeError::DigestMismatch)?;

    // S2 must chain off our C1 digest
    let secret = hmac_sha256(&c1[c1_digest_pos..c1_digest_pos + DIGEST_SIZE], &GENUINE_FMS_KEY);
    let expected = hmac_sha256(&s2[..HANDSHAKE_SIZE - DIGEST_SIZE], &secret);
    if s2[HANDSHAKE_SIZE - DIGEST_SIZE..] != expected {
        return Err(HandshakeError::DigestMismatch.into());
    }

    // C2 chains off S1's digest through the Flash Player key
    let c2 = make_echo_packet(
        &s1,
        &s1[s1_digest_pos..s1_digest_pos + DIGEST_SIZE],
        &GENUINE_FP_KEY,
    );
    timeout(PHASE_TIMEOUT, async {
        stream.write_all(&c2).await?;
        stream.flush().await?;
        Ok::<_, Error>(())
    })
    .await
    .map_err(|_| Error::Timeout)??;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a C1 with a valid digest at the given schema base
    fn make_c1_at(base: usize) -> [u8; HANDSHAKE_SIZE] {
        let mut c1 = [0u8; HANDSHAKE_SIZE];
        fill_random(&mut c1);
        c1[4..8].copy_from_slice(&FP_VERSION);
        let pos = digest_offset(&c1, base);
        let digest = make_digest(&c1, base, &GENUINE_FP_KEY[..30]);
        c1[pos..pos + DIGEST_SIZE].copy_from_slice(&digest);
        c1
    }

    #[test]
    fn test_digest_offset_in_block() {
        let mut packet = [0u8; HANDSHAKE_SIZE];
        packet[8] = 0xFF;
        packet[9] = 0xFF;
        packet[10] = 0xFF;
        packet[11] = 0xFF;
        let pos = digest_offset(&packet, SCHEMA1_BASE);
        // Stays within the 764-byte block with room for the digest
        assert!(pos >= SCHEMA1_BASE + 4);
        assert!(pos + DIGEST_SIZE <= SCHEMA1_BASE + 764);

        let pos0 = digest_offset(&packet, SCHEMA0_BASE);
        assert!(pos0 >= SCHEMA0_BASE + 4);
        assert!(pos0 + DIGEST_SIZE <= SCHEMA0_BASE + 764);
    }

    #[test]
    fn test_schema0_c1_accepted() {
        let c1 = make_c1_at(SCHEMA0_BASE);
        assert!(validate_c1(&c1).is_some());
    }

    #[test]
    fn test_schema1_c1_accepted() {
        let c1 = make_c1_at(SCHEMA1_BASE);
        assert!(validate_c1(&c1).is_some());
    }

    #[test]
    fn test_corrupted_digest_rejected() {
        let mut c1 = make_c1_at(SCHEMA1_BASE);
        let pos = digest_offset(&c1, SCHEMA1_BASE);
        c1[pos] ^= 0xFF;
        assert!(validate_c1(&c1).is_none());
    }

    #[test]
    fn test_s2_chains_off_c1_digest() {
        let c1 = make_c1_at(SCHEMA1_BASE);
        let pos = digest_offset(&c1, SCHEMA1_BASE);
        let s2 = make_echo_packet(&c1, &c1[pos..pos + DIGEST_SIZE], &GENUINE_FMS_KEY);

        assert_eq!(&s2[0..4], &c1[0..4]);
        let secret = hmac_sha256(&c1[pos..pos + DIGEST_SIZE], &GENUINE_FMS_KEY);
        let expected = hmac_sha256(&s2[..HANDSHAKE_SIZE - DIGEST_SIZE], &secret);
        assert_eq!(&s2[HANDSHAKE_SIZE - DIGEST_SIZE..], &expected);
    }

    #[tokio::test]
    async fn test_simple_handshake_mirrors_c1() {
        let (mut client, mut server) = tokio::io::duplex(8192);

        let server_task = tokio::spawn(async move {
            server_handshake(&mut server).await.unwrap();
        });

        let mut c1 = [0u8; HANDSHAKE_SIZE];
        fill_random(&mut c1);
        c1[4..8].copy_from_slice(&[0, 0, 0, 0]);
        client.write_all(&[RTMP_VERSION]).await.unwrap();
        client.write_all(&c1).await.unwrap();

        let mut s0 = [0u8; 1];
        let mut s1 = [0u8; HANDSHAKE_SIZE];
        let mut s2 = [0u8; HANDSHAKE_SIZE];
        client.read_exact(&mut s0).await.unwrap();
        client.read_exact(&mut s1).await.unwrap();
        client.read_exact(&mut s2).await.unwrap();

        assert_eq!(s0[0], RTMP_VERSION);
        assert_eq!(s1, c1);
        assert_eq!(s2, c1);

        client.write_all(&c1).await.unwrap(); // C2
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_complex_handshake_end_to_end() {
        let (mut client, mut server) = tokio::io::duplex(8192);

        let server_task = tokio::spawn(async move { server_handshake(&mut server).await });
        let client_result = client_handshake_complex(&mut client).await;

        assert!(client_result.is_ok());
        assert!(server_task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_corrupt_c1_closes_handshake() {
        let (mut client, mut server) = tokio::io::duplex(8192);

        let server_task = tokio::spawn(async move { server_handshake(&mut server).await });

        let mut c1 = make_c1_at(SCHEMA1_BASE);
        let pos = digest_offset(&c1, SCHEMA1_BASE);
        c1[pos] ^= 0x01;
        client.write_all(&[RTMP_VERSION]).await.unwrap();
        client.write_all(&c1).await.unwrap();

        let result = server_task.await.unwrap();
        assert!(matches!(
            result,
            Err(Error::Handshake(HandshakeError::DigestMismatch))
        ));
    }
}
