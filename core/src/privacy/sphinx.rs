// Sphinx Packet Format: fixed-size layered encryption for mix routing
//
// Construction follows Danezis & Goldberg, "Sphinx: A Compact and Provably
// Secure Mix Format" (2009), over Curve25519:
//
//   header  = alpha (32) || gamma (32) || beta (MAX_HOPS * ROUTING_BLOCK_SIZE)
//   payload = delta (PAYLOAD_SIZE)
//
// Each hop derives a shared secret from alpha, checks gamma over beta and
// delta, strips one layer of both, blinds alpha for the next hop and learns
// only its own routing block: the next hop address (or the final action)
// and its own delay. Packets have the same size at every hop.

use curve25519_dalek::constants::X25519_BASEPOINT;
use curve25519_dalek::montgomery::MontgomeryPoint;
use curve25519_dalek::scalar::Scalar;
use rand::{CryptoRng, RngCore};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use super::padding::{pad_message, unpad_message};
use super::timing::DelayVector;
use crate::descriptor::Path;

/// Maximum number of nodes on a path, terminal node included
pub const MAX_HOPS: usize = 5;

pub const GROUP_ELEMENT_SIZE: usize = 32;
pub const MAC_SIZE: usize = 32;
/// Length-prefixed address or recipient id field
pub const ADDRESS_FIELD_SIZE: usize = 64;
pub const MAX_ADDRESS_LEN: usize = ADDRESS_FIELD_SIZE - 1;
const DELAY_SIZE: usize = 8;

const COMMAND_OFFSET: usize = 0;
const ADDRESS_OFFSET: usize = 1;
const DELAY_OFFSET: usize = ADDRESS_OFFSET + ADDRESS_FIELD_SIZE;
const MAC_OFFSET: usize = DELAY_OFFSET + DELAY_SIZE;

/// Routing block revealed to a single hop
pub const ROUTING_BLOCK_SIZE: usize = MAC_OFFSET + MAC_SIZE;
pub const ROUTING_INFO_SIZE: usize = MAX_HOPS * ROUTING_BLOCK_SIZE;
pub const HEADER_SIZE: usize = GROUP_ELEMENT_SIZE + MAC_SIZE + ROUTING_INFO_SIZE;
pub const PAYLOAD_SIZE: usize = 2048;
/// Largest message that fits the padded payload
pub const MAX_MESSAGE_SIZE: usize = PAYLOAD_SIZE - 1;
pub const PACKET_SIZE: usize = HEADER_SIZE + PAYLOAD_SIZE;

const CMD_FORWARD: u8 = 0x01;
const CMD_DELIVER: u8 = 0x02;
const CMD_DROP: u8 = 0x03;

const HEADER_STREAM_CONTEXT: &str = "loopmix sphinx 2026-01 header stream";
const PAYLOAD_STREAM_CONTEXT: &str = "loopmix sphinx 2026-01 payload stream";
const MAC_KEY_CONTEXT: &str = "loopmix sphinx 2026-01 mac key";
const BLINDING_CONTEXT: &str = "loopmix sphinx 2026-01 blinding factor";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SphinxError {
    #[error("Empty path")]
    EmptyPath,
    #[error("Too many hops (max {0})")]
    TooManyHops(usize),
    #[error("Path has {hops} hops but {delays} delays")]
    DelayMismatch { hops: usize, delays: usize },
    #[error("Delays must be finite and non-negative")]
    InvalidDelay,
    #[error("Routing field exceeds {MAX_ADDRESS_LEN} bytes: {0}")]
    FieldTooLong(String),
    #[error("Invalid hop public key")]
    InvalidPublicKey,
    #[error("Message too large: {0} bytes (max {MAX_MESSAGE_SIZE})")]
    MessageTooLarge(usize),
    #[error("Malformed packet")]
    Malformed,
    #[error("Integrity check failed")]
    Integrity,
    #[error("Invalid routing information")]
    InvalidRouting,
}

impl SphinxError {
    /// Errors a relay must treat as a forged or corrupted packet
    pub fn is_integrity_failure(&self) -> bool {
        matches!(self, SphinxError::Integrity | SphinxError::Malformed)
    }
}

/// Final action carried by the last routing block
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Terminal {
    /// Hand the payload to the named recipient (mailbox deposit at a provider)
    Deliver { recipient_id: String },
    /// Discard on arrival: drop cover traffic
    Drop,
}

/// A fixed-size Sphinx packet
#[derive(Clone, PartialEq, Eq)]
pub struct SphinxPacket {
    header: Vec<u8>,
    payload: Vec<u8>,
}

impl SphinxPacket {
    pub fn header(&self) -> &[u8] {
        &self.header
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(PACKET_SIZE);
        bytes.extend_from_slice(&self.header);
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SphinxError> {
        if bytes.len() != PACKET_SIZE {
            return Err(SphinxError::Malformed);
        }
        Ok(Self {
            header: bytes[..HEADER_SIZE].to_vec(),
            payload: bytes[HEADER_SIZE..].to_vec(),
        })
    }

    fn alpha(&self) -> [u8; GROUP_ELEMENT_SIZE] {
        let mut alpha = [0u8; GROUP_ELEMENT_SIZE];
        alpha.copy_from_slice(&self.header[..GROUP_ELEMENT_SIZE]);
        alpha
    }

    fn gamma(&self) -> [u8; MAC_SIZE] {
        let mut gamma = [0u8; MAC_SIZE];
        gamma.copy_from_slice(&self.header[GROUP_ELEMENT_SIZE..GROUP_ELEMENT_SIZE + MAC_SIZE]);
        gamma
    }

    fn beta(&self) -> &[u8] {
        &self.header[GROUP_ELEMENT_SIZE + MAC_SIZE..]
    }
}

impl fmt::Debug for SphinxPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SphinxPacket")
            .field("alpha", &hex::encode(&self.header[..8]))
            .field("len", &(self.header.len() + self.payload.len()))
            .finish()
    }
}

/// Outcome of removing one layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeelResult {
    /// Hold for `delay`, then send `packet` to `next_hop`
    Forward {
        next_hop: String,
        delay: Duration,
        packet: SphinxPacket,
    },
    /// This node is the terminal hop for `recipient_id`
    Deliver {
        recipient_id: String,
        delay: Duration,
        payload: Vec<u8>,
    },
    /// Explicit drop marker reached
    Drop { delay: Duration },
}

struct HopKeys {
    header_stream: [u8; 32],
    payload_stream: [u8; 32],
    mac: [u8; 32],
    blinding: Scalar,
}

impl Drop for HopKeys {
    fn drop(&mut self) {
        self.header_stream.zeroize();
        self.payload_stream.zeroize();
        self.mac.zeroize();
    }
}

fn hop_keys(alpha: &[u8; 32], shared_secret: &[u8; 32]) -> HopKeys {
    let mut material = [0u8; 64];
    material[..32].copy_from_slice(alpha);
    material[32..].copy_from_slice(shared_secret);
    let blinding = Scalar::from_bytes_mod_order(blake3::derive_key(BLINDING_CONTEXT, &material));
    material.zeroize();

    HopKeys {
        header_stream: blake3::derive_key(HEADER_STREAM_CONTEXT, shared_secret),
        payload_stream: blake3::derive_key(PAYLOAD_STREAM_CONTEXT, shared_secret),
        mac: blake3::derive_key(MAC_KEY_CONTEXT, shared_secret),
        blinding,
    }
}

fn keystream(key: &[u8; 32], len: usize) -> Vec<u8> {
    let mut stream = vec![0u8; len];
    blake3::Hasher::new_keyed(key).finalize_xof().fill(&mut stream);
    stream
}

fn xor_in_place(data: &mut [u8], stream: &[u8]) {
    for (byte, key) in data.iter_mut().zip(stream) {
        *byte ^= key;
    }
}

/// MAC over routing information and payload; `blake3::Hash` equality is constant time
fn compute_mac(key: &[u8; 32], routing_info: &[u8], payload: &[u8]) -> blake3::Hash {
    let mut hasher = blake3::Hasher::new_keyed(key);
    hasher.update(routing_info);
    hasher.update(payload);
    hasher.finalize()
}

fn encode_block(command: u8, field: &str, delay: f64) -> Result<[u8; ROUTING_BLOCK_SIZE], SphinxError> {
    if field.len() > MAX_ADDRESS_LEN {
        return Err(SphinxError::FieldTooLong(field.to_string()));
    }
    if !delay.is_finite() || delay < 0.0 {
        return Err(SphinxError::InvalidDelay);
    }

    let mut block = [0u8; ROUTING_BLOCK_SIZE];
    block[COMMAND_OFFSET] = command;
    block[ADDRESS_OFFSET] = field.len() as u8;
    block[ADDRESS_OFFSET + 1..ADDRESS_OFFSET + 1 + field.len()].copy_from_slice(field.as_bytes());
    block[DELAY_OFFSET..MAC_OFFSET].copy_from_slice(&delay.to_be_bytes());
    Ok(block)
}

fn decode_field(block: &[u8]) -> Result<String, SphinxError> {
    let len = block[ADDRESS_OFFSET] as usize;
    if len > MAX_ADDRESS_LEN {
        return Err(SphinxError::InvalidRouting);
    }
    let bytes = &block[ADDRESS_OFFSET + 1..ADDRESS_OFFSET + 1 + len];
    String::from_utf8(bytes.to_vec()).map_err(|_| SphinxError::InvalidRouting)
}

fn decode_delay(block: &[u8]) -> Result<Duration, SphinxError> {
    let mut raw = [0u8; DELAY_SIZE];
    raw.copy_from_slice(&block[DELAY_OFFSET..MAC_OFFSET]);
    Duration::try_from_secs_f64(f64::from_be_bytes(raw)).map_err(|_| SphinxError::InvalidRouting)
}

/// Build a packet that travels `path`, holding `delays[i]` at hop `i`, and
/// ends with `terminal` at the last hop.
///
/// The per-packet ephemeral scalar is drawn from `rng`, so two encodings of
/// the same input never share ciphertext.
pub fn encode<R: RngCore + CryptoRng>(
    message: &[u8],
    path: &Path,
    delays: &DelayVector,
    terminal: &Terminal,
    rng: &mut R,
) -> Result<SphinxPacket, SphinxError> {
    let hops = path.len();
    if hops == 0 {
        return Err(SphinxError::EmptyPath);
    }
    if hops > MAX_HOPS {
        return Err(SphinxError::TooManyHops(MAX_HOPS));
    }
    if delays.len() != hops {
        return Err(SphinxError::DelayMismatch {
            hops,
            delays: delays.len(),
        });
    }
    if message.len() > MAX_MESSAGE_SIZE {
        return Err(SphinxError::MessageTooLarge(message.len()));
    }

    let mut blocks = Vec::with_capacity(hops);
    for (i, delay) in delays.as_slice().iter().enumerate() {
        let block = if i + 1 < hops {
            encode_block(CMD_FORWARD, &path.hops[i + 1].address(), *delay)?
        } else {
            match terminal {
                Terminal::Deliver { recipient_id } => encode_block(CMD_DELIVER, recipient_id, *delay)?,
                Terminal::Drop => encode_block(CMD_DROP, "", *delay)?,
            }
        };
        blocks.push(block);
    }

    let public_keys = path
        .hops
        .iter()
        .map(|hop| hop.public_key_bytes().map(MontgomeryPoint).ok_or(SphinxError::InvalidPublicKey))
        .collect::<Result<Vec<_>, _>>()?;

    // Per-hop group elements and shared secrets, blinding as we go
    let mut wide = [0u8; 64];
    rng.fill_bytes(&mut wide);
    let mut exponent = Scalar::from_bytes_mod_order_wide(&wide);
    wide.zeroize();

    let mut alphas = Vec::with_capacity(hops);
    let mut keys = Vec::with_capacity(hops);
    for public_key in &public_keys {
        let alpha = (&X25519_BASEPOINT * &exponent).to_bytes();
        let mut shared = (public_key * &exponent).to_bytes();
        if shared == [0u8; 32] {
            return Err(SphinxError::InvalidPublicKey);
        }
        let hop = hop_keys(&alpha, &shared);
        shared.zeroize();
        exponent = &exponent * &hop.blinding;
        alphas.push(alpha);
        keys.push(hop);
    }
    exponent.zeroize();

    // Payload layers, innermost first
    let mut delta = pad_message(message, PAYLOAD_SIZE).map_err(|_| SphinxError::MessageTooLarge(message.len()))?;
    let mut deltas = vec![Vec::new(); hops];
    for i in (0..hops).rev() {
        xor_in_place(&mut delta, &keystream(&keys[i].payload_stream, PAYLOAD_SIZE));
        deltas[i] = delta.clone();
    }

    let header_streams: Vec<Vec<u8>> = keys
        .iter()
        .map(|k| keystream(&k.header_stream, ROUTING_INFO_SIZE + ROUTING_BLOCK_SIZE))
        .collect();

    // Filler: what the earlier hops' decryption appends to the routing info
    let mut filler: Vec<u8> = Vec::with_capacity((hops - 1) * ROUTING_BLOCK_SIZE);
    for stream in header_streams.iter().take(hops - 1) {
        filler.extend_from_slice(&[0u8; ROUTING_BLOCK_SIZE]);
        let start = ROUTING_INFO_SIZE + ROUTING_BLOCK_SIZE - filler.len();
        xor_in_place(&mut filler, &stream[start..]);
    }

    // Innermost routing info
    let open = ROUTING_INFO_SIZE - filler.len();
    let mut beta = vec![0u8; ROUTING_INFO_SIZE];
    beta[..ROUTING_BLOCK_SIZE].copy_from_slice(&blocks[hops - 1]);
    rng.fill_bytes(&mut beta[ROUTING_BLOCK_SIZE..open]);
    xor_in_place(&mut beta[..open], &header_streams[hops - 1][..open]);
    beta[open..].copy_from_slice(&filler);
    let mut gamma = compute_mac(&keys[hops - 1].mac, &beta, &deltas[hops - 1]);

    for i in (0..hops - 1).rev() {
        let mut block = blocks[i];
        block[MAC_OFFSET..].copy_from_slice(gamma.as_bytes());

        let mut wrapped = Vec::with_capacity(ROUTING_INFO_SIZE);
        wrapped.extend_from_slice(&block);
        wrapped.extend_from_slice(&beta[..ROUTING_INFO_SIZE - ROUTING_BLOCK_SIZE]);
        xor_in_place(&mut wrapped, &header_streams[i][..ROUTING_INFO_SIZE]);

        beta = wrapped;
        gamma = compute_mac(&keys[i].mac, &beta, &deltas[i]);
    }

    let mut header = Vec::with_capacity(HEADER_SIZE);
    header.extend_from_slice(&alphas[0]);
    header.extend_from_slice(gamma.as_bytes());
    header.extend_from_slice(&beta);

    Ok(SphinxPacket {
        header,
        payload: deltas.swap_remove(0),
    })
}

/// Remove the layer addressed to `secret`.
///
/// The MAC is verified before anything decrypted is inspected; every
/// authentication failure yields the same `SphinxError::Integrity`.
pub fn peel(packet: &SphinxPacket, secret: &StaticSecret) -> Result<PeelResult, SphinxError> {
    if packet.header.len() != HEADER_SIZE || packet.payload.len() != PAYLOAD_SIZE {
        return Err(SphinxError::Malformed);
    }

    let alpha = packet.alpha();
    let shared = secret.diffie_hellman(&PublicKey::from(alpha));
    if !shared.was_contributory() {
        return Err(SphinxError::Integrity);
    }
    let keys = hop_keys(&alpha, shared.as_bytes());

    let expected = compute_mac(&keys.mac, packet.beta(), &packet.payload);
    if expected != blake3::Hash::from(packet.gamma()) {
        return Err(SphinxError::Integrity);
    }

    let mut routing = Vec::with_capacity(ROUTING_INFO_SIZE + ROUTING_BLOCK_SIZE);
    routing.extend_from_slice(packet.beta());
    routing.extend_from_slice(&[0u8; ROUTING_BLOCK_SIZE]);
    let stream = keystream(&keys.header_stream, routing.len());
    xor_in_place(&mut routing, &stream);

    let mut payload = packet.payload.clone();
    xor_in_place(&mut payload, &keystream(&keys.payload_stream, PAYLOAD_SIZE));

    let block = &routing[..ROUTING_BLOCK_SIZE];
    let delay = decode_delay(block)?;

    match block[COMMAND_OFFSET] {
        CMD_FORWARD => {
            let next_hop = decode_field(block)?;
            let next_alpha = (&MontgomeryPoint(alpha) * &keys.blinding).to_bytes();

            let mut header = Vec::with_capacity(HEADER_SIZE);
            header.extend_from_slice(&next_alpha);
            header.extend_from_slice(&block[MAC_OFFSET..]);
            header.extend_from_slice(&routing[ROUTING_BLOCK_SIZE..]);

            Ok(PeelResult::Forward {
                next_hop,
                delay,
                packet: SphinxPacket { header, payload },
            })
        }
        CMD_DELIVER => {
            let recipient_id = decode_field(block)?;
            let message = unpad_message(&payload).map_err(|_| SphinxError::InvalidRouting)?;
            Ok(PeelResult::Deliver {
                recipient_id,
                delay,
                payload: message,
            })
        }
        CMD_DROP => Ok(PeelResult::Drop { delay }),
        _ => Err(SphinxError::InvalidRouting),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::ParticipantKind;
    use crate::identity::NodeKeys;
    use proptest::prelude::*;
    use rand::rngs::OsRng;

    fn network(hops: usize) -> (Vec<NodeKeys>, Path) {
        let keys: Vec<NodeKeys> = (0..hops).map(|_| NodeKeys::generate()).collect();
        let descriptors = keys
            .iter()
            .enumerate()
            .map(|(i, k)| {
                let kind = if i + 1 == hops { ParticipantKind::Provider } else { ParticipantKind::Mix };
                k.descriptor(format!("node{i}"), kind, "127.0.0.1", format!("{}", 9000 + i))
            })
            .collect();
        (keys, Path::new(descriptors))
    }

    fn deliver_to(id: &str) -> Terminal {
        Terminal::Deliver { recipient_id: id.to_string() }
    }

    /// Peel hop by hop, checking next hops and delays; returns the final result
    fn walk(packet: SphinxPacket, keys: &[NodeKeys], path: &Path, delays: &DelayVector) -> PeelResult {
        let mut current = packet;
        for (i, key) in keys.iter().enumerate() {
            let result = peel(&current, key.secret()).expect("peel failed");
            let expected_delay = Duration::from_secs_f64(delays.as_slice()[i]);
            if i + 1 < keys.len() {
                match result {
                    PeelResult::Forward { next_hop, delay, packet } => {
                        assert_eq!(next_hop, path.hops[i + 1].address());
                        assert_eq!(delay, expected_delay);
                        assert_eq!(packet.to_bytes().len(), PACKET_SIZE);
                        current = packet;
                    }
                    other => panic!("expected forward at hop {i}, got {other:?}"),
                }
            } else {
                return result;
            }
        }
        unreachable!("path is non-empty")
    }

    #[test]
    fn test_round_trip_all_path_lengths() {
        for hops in 1..=MAX_HOPS {
            let (keys, path) = network(hops);
            let delays = DelayVector::new((0..hops).map(|i| 0.125 * (i + 1) as f64).collect());
            let message = format!("message over {hops} hops");
            let packet = encode(message.as_bytes(), &path, &delays, &deliver_to("alice"), &mut OsRng).unwrap();
            assert_eq!(packet.to_bytes().len(), PACKET_SIZE);

            match walk(packet, &keys, &path, &delays) {
                PeelResult::Deliver { recipient_id, delay, payload } => {
                    assert_eq!(recipient_id, "alice");
                    assert_eq!(delay, Duration::from_secs_f64(delays.as_slice()[hops - 1]));
                    assert_eq!(payload, message.as_bytes());
                }
                other => panic!("expected deliver, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_drop_terminal() {
        let (keys, path) = network(3);
        let delays = DelayVector::new(vec![0.0, 0.1, 0.2]);
        let packet = encode(b"cover", &path, &delays, &Terminal::Drop, &mut OsRng).unwrap();
        assert_eq!(
            walk(packet, &keys, &path, &delays),
            PeelResult::Drop { delay: Duration::from_millis(200) }
        );
    }

    #[test]
    fn test_max_size_message() {
        let (keys, path) = network(2);
        let delays = DelayVector::zero(2);
        let message = vec![0xabu8; MAX_MESSAGE_SIZE];
        let packet = encode(&message, &path, &delays, &deliver_to("bob"), &mut OsRng).unwrap();
        match walk(packet, &keys, &path, &delays) {
            PeelResult::Deliver { payload, .. } => assert_eq!(payload, message),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_encoding_errors() {
        let (_, path) = network(3);
        let delays = DelayVector::zero(3);
        let t = deliver_to("x");

        assert_eq!(
            encode(b"m", &Path::new(vec![]), &DelayVector::zero(0), &t, &mut OsRng),
            Err(SphinxError::EmptyPath)
        );
        assert_eq!(
            encode(b"m", &path, &DelayVector::zero(2), &t, &mut OsRng),
            Err(SphinxError::DelayMismatch { hops: 3, delays: 2 })
        );
        assert_eq!(
            encode(&vec![0; PAYLOAD_SIZE], &path, &delays, &t, &mut OsRng),
            Err(SphinxError::MessageTooLarge(PAYLOAD_SIZE))
        );
        assert_eq!(
            encode(b"m", &path, &DelayVector::new(vec![0.0, -1.0, 0.0]), &t, &mut OsRng),
            Err(SphinxError::InvalidDelay)
        );
        let long_id = deliver_to(&"r".repeat(MAX_ADDRESS_LEN + 1));
        assert!(matches!(
            encode(b"m", &path, &delays, &long_id, &mut OsRng),
            Err(SphinxError::FieldTooLong(_))
        ));

        let (_, long_path) = network(MAX_HOPS + 1);
        assert_eq!(
            encode(b"m", &long_path, &DelayVector::zero(MAX_HOPS + 1), &t, &mut OsRng),
            Err(SphinxError::TooManyHops(MAX_HOPS))
        );
    }

    #[test]
    fn test_invalid_public_key() {
        let (_, mut path) = network(2);
        path.hops[1].public_key = vec![1, 2, 3];
        assert_eq!(
            encode(b"m", &path, &DelayVector::zero(2), &deliver_to("x"), &mut OsRng),
            Err(SphinxError::InvalidPublicKey)
        );
        // Low-order point yields an all-zero shared secret
        path.hops[1].public_key = vec![0u8; 32];
        assert_eq!(
            encode(b"m", &path, &DelayVector::zero(2), &deliver_to("x"), &mut OsRng),
            Err(SphinxError::InvalidPublicKey)
        );
    }

    #[test]
    fn test_tamper_rejection_every_region() {
        let (keys, path) = network(3);
        let delays = DelayVector::zero(3);
        let packet = encode(b"integrity", &path, &delays, &deliver_to("alice"), &mut OsRng).unwrap();
        let bytes = packet.to_bytes();

        let positions = [
            0,                                      // alpha
            GROUP_ELEMENT_SIZE + 5,                 // gamma
            GROUP_ELEMENT_SIZE + MAC_SIZE,          // first routing byte
            HEADER_SIZE - 1,                        // last routing byte
            HEADER_SIZE,                            // first payload byte
            PACKET_SIZE - 1,                        // last payload byte
        ];
        for pos in positions {
            for bit in [0u8, 3, 7] {
                let mut tampered = bytes.clone();
                tampered[pos] ^= 1 << bit;
                let tampered = SphinxPacket::from_bytes(&tampered).unwrap();
                assert_eq!(
                    peel(&tampered, keys[0].secret()),
                    Err(SphinxError::Integrity),
                    "flip at byte {pos} bit {bit} not detected"
                );
            }
        }
    }

    #[test]
    fn test_tamper_detected_at_owning_hop() {
        let (keys, path) = network(3);
        let delays = DelayVector::zero(3);
        let packet = encode(b"later hop", &path, &delays, &deliver_to("alice"), &mut OsRng).unwrap();

        let forwarded = match peel(&packet, keys[0].secret()).unwrap() {
            PeelResult::Forward { packet, .. } => packet,
            other => panic!("unexpected {other:?}"),
        };
        let mut bytes = forwarded.to_bytes();
        bytes[HEADER_SIZE + 100] ^= 0x10;
        let tampered = SphinxPacket::from_bytes(&bytes).unwrap();
        assert_eq!(peel(&tampered, keys[1].secret()), Err(SphinxError::Integrity));
    }

    #[test]
    fn test_wrong_key_rejected() {
        let (_, path) = network(2);
        let packet = encode(b"m", &path, &DelayVector::zero(2), &deliver_to("x"), &mut OsRng).unwrap();
        let stranger = NodeKeys::generate();
        assert_eq!(peel(&packet, stranger.secret()), Err(SphinxError::Integrity));
    }

    #[test]
    fn test_low_order_alpha_rejected() {
        let (keys, path) = network(1);
        let packet = encode(b"m", &path, &DelayVector::zero(1), &deliver_to("x"), &mut OsRng).unwrap();
        let mut bytes = packet.to_bytes();
        bytes[..GROUP_ELEMENT_SIZE].fill(0);
        let forged = SphinxPacket::from_bytes(&bytes).unwrap();
        assert_eq!(peel(&forged, keys[0].secret()), Err(SphinxError::Integrity));
    }

    #[test]
    fn test_from_bytes_wrong_length() {
        assert_eq!(SphinxPacket::from_bytes(&[0u8; 10]), Err(SphinxError::Malformed));
        assert_eq!(SphinxPacket::from_bytes(&vec![0u8; PACKET_SIZE + 1]), Err(SphinxError::Malformed));
    }

    #[test]
    fn test_encodings_differ() {
        let (_, path) = network(2);
        let delays = DelayVector::zero(2);
        let a = encode(b"same", &path, &delays, &deliver_to("x"), &mut OsRng).unwrap();
        let b = encode(b"same", &path, &delays, &deliver_to("x"), &mut OsRng).unwrap();
        assert_ne!(a.to_bytes(), b.to_bytes());
    }

    #[test]
    fn test_integrity_classification() {
        assert!(SphinxError::Integrity.is_integrity_failure());
        assert!(SphinxError::Malformed.is_integrity_failure());
        assert!(!SphinxError::InvalidRouting.is_integrity_failure());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn prop_round_trip(
            message in proptest::collection::vec(any::<u8>(), 0..512),
            hops in 1usize..=MAX_HOPS,
            delay_ms in proptest::collection::vec(0u32..5_000, MAX_HOPS),
        ) {
            let (keys, path) = network(hops);
            let delays = DelayVector::new(delay_ms[..hops].iter().map(|d| *d as f64 / 1000.0).collect());
            let packet = encode(&message, &path, &delays, &deliver_to("prop"), &mut OsRng).unwrap();
            match walk(packet, &keys, &path, &delays) {
                PeelResult::Deliver { payload, .. } => prop_assert_eq!(payload, message),
                other => prop_assert!(false, "unexpected {:?}", other),
            }
        }
    }
}
