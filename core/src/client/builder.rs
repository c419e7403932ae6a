//! Outbound packet construction: seal → path → delays → encode → flag

use rand::rngs::StdRng;
use rand::SeedableRng;

use super::payload::ClientPayload;
use super::ClientError;
use crate::descriptor::{ParticipantDescriptor, Path};
use crate::privacy::circuit::PathSelector;
use crate::privacy::cover::CoverKind;
use crate::privacy::sphinx::{self, Terminal};
use crate::privacy::timing::DelaySampler;
use crate::relay::protocol::{Flag, FlaggedFrame};
use crate::topology::Topology;

/// A frame ready to go to the entry node of its path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundPacket {
    pub address: String,
    pub frame: FlaggedFrame,
}

/// Owns every generator a client needs to build packets
pub struct PacketBuilder {
    selector: PathSelector,
    sampler: DelaySampler,
    rng: StdRng,
    hop_count: usize,
}

impl PacketBuilder {
    pub fn new(hop_count: usize) -> Self {
        Self {
            selector: PathSelector::new(),
            sampler: DelaySampler::new(),
            rng: StdRng::from_entropy(),
            hop_count,
        }
    }

    /// Real message for `recipient_id`, routed to the recipient's provider
    pub fn message(
        &mut self,
        topology: &Topology,
        sender_id: &str,
        recipient_id: &str,
        body: &[u8],
        delay_rate: f64,
    ) -> Result<OutboundPacket, ClientError> {
        let recipient = topology
            .client(recipient_id)
            .ok_or_else(|| ClientError::UnknownRecipient(recipient_id.to_string()))?;
        let payload = ClientPayload::Message {
            sender: sender_id.to_string(),
            body: body.to_vec(),
        };
        self.deliverable(topology, recipient, &payload, Flag::Comm, delay_rate)
    }

    /// Loop cover: a sealed loop marker back to ourselves through our provider
    pub fn loop_cover(
        &mut self,
        topology: &Topology,
        own: &ParticipantDescriptor,
        nonce: u64,
        delay_rate: f64,
    ) -> Result<OutboundPacket, ClientError> {
        let payload = ClientPayload::LoopCover { nonce };
        self.deliverable(topology, own, &payload, CoverKind::Loop.flag(), delay_rate)
    }

    /// Drop cover through the mixes, discarded at a random final mix
    pub fn drop_cover(
        &mut self,
        topology: &Topology,
        kind: CoverKind,
        delay_rate: f64,
    ) -> Result<OutboundPacket, ClientError> {
        let path = self.selector.select_drop_path(&topology.mixes, self.hop_count)?;
        let mut filler = [0u8; 32];
        rand::RngCore::fill_bytes(&mut self.rng, &mut filler);
        self.encode(&filler, path, &Terminal::Drop, kind.flag(), delay_rate)
    }

    fn deliverable(
        &mut self,
        topology: &Topology,
        recipient: &ParticipantDescriptor,
        payload: &ClientPayload,
        flag: Flag,
        delay_rate: f64,
    ) -> Result<OutboundPacket, ClientError> {
        let provider_id = recipient
            .provider
            .as_deref()
            .ok_or_else(|| ClientError::UnknownProvider(format!("{} has no provider", recipient.id)))?;
        let provider = topology
            .provider(provider_id)
            .ok_or_else(|| ClientError::UnknownProvider(provider_id.to_string()))?;
        let recipient_key = recipient
            .public_key_bytes()
            .ok_or_else(|| ClientError::UnknownRecipient(format!("{} has a malformed key", recipient.id)))?;

        let sealed = payload.seal(&recipient_key, &mut self.rng)?;
        let path = self.selector.select_path(&topology.mixes, self.hop_count, provider)?;
        let terminal = Terminal::Deliver {
            recipient_id: recipient.id.clone(),
        };
        self.encode(&sealed, path, &terminal, flag, delay_rate)
    }

    fn encode(
        &mut self,
        message: &[u8],
        path: Path,
        terminal: &Terminal,
        flag: Flag,
        delay_rate: f64,
    ) -> Result<OutboundPacket, ClientError> {
        let delays = self.sampler.sample(delay_rate, path.len())?;
        let packet = sphinx::encode(message, &path, &delays, terminal, &mut self.rng)?;
        let address = path
            .first()
            .map(|hop| hop.address())
            .ok_or(ClientError::Encoding(sphinx::SphinxError::EmptyPath))?;
        Ok(OutboundPacket {
            address,
            frame: FlaggedFrame::new(flag, packet.to_bytes()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::ParticipantKind;
    use crate::identity::NodeKeys;
    use crate::privacy::sphinx::{peel, PeelResult, SphinxPacket};
    use std::collections::HashMap;

    struct Net {
        topology: Topology,
        keys: HashMap<String, NodeKeys>,
    }

    fn net() -> Net {
        let mut keys = HashMap::new();
        let mut mixes = Vec::new();
        for i in 0..3 {
            let k = NodeKeys::generate();
            let d = k.descriptor(format!("m{i}"), ParticipantKind::Mix, "127.0.0.1", format!("{}", 9100 + i));
            keys.insert(d.address(), k);
            mixes.push(d);
        }
        let pk = NodeKeys::generate();
        let provider = pk.descriptor("p1", ParticipantKind::Provider, "127.0.0.1", "9200");
        keys.insert(provider.address(), pk);

        let mut clients = Vec::new();
        for id in ["alice", "bob"] {
            let k = NodeKeys::generate();
            clients.push(k.descriptor(id, ParticipantKind::Client, "127.0.0.1", "0").with_provider("p1"));
            keys.insert(id.to_string(), k);
        }
        Net {
            topology: Topology::new(mixes, vec![provider], clients),
            keys,
        }
    }

    /// Route a packet through the key map until it terminates
    fn route(net: &Net, packet: &OutboundPacket) -> PeelResult {
        let mut address = packet.address.clone();
        let mut current = SphinxPacket::from_bytes(&packet.frame.body).unwrap();
        loop {
            match peel(&current, net.keys[&address].secret()).unwrap() {
                PeelResult::Forward { next_hop, packet, .. } => {
                    address = next_hop;
                    current = packet;
                }
                other => return other,
            }
        }
    }

    #[test]
    fn test_message_reaches_recipient() {
        let net = net();
        let mut builder = PacketBuilder::new(2);
        let out = builder.message(&net.topology, "alice", "bob", b"hello bob", 1e6).unwrap();
        assert_eq!(out.frame.flag, Flag::Comm);

        match route(&net, &out) {
            PeelResult::Deliver { recipient_id, payload, .. } => {
                assert_eq!(recipient_id, "bob");
                let opened = ClientPayload::open(net.keys["bob"].secret(), &payload).unwrap();
                assert_eq!(
                    opened,
                    ClientPayload::Message {
                        sender: "alice".to_string(),
                        body: b"hello bob".to_vec()
                    }
                );
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_loop_cover_returns_to_sender() {
        let net = net();
        let alice = net.topology.client("alice").unwrap().clone();
        let mut builder = PacketBuilder::new(2);
        let out = builder.loop_cover(&net.topology, &alice, 99, 1e6).unwrap();
        assert_eq!(out.frame.flag, Flag::Comm);

        match route(&net, &out) {
            PeelResult::Deliver { recipient_id, payload, .. } => {
                assert_eq!(recipient_id, "alice");
                let opened = ClientPayload::open(net.keys["alice"].secret(), &payload).unwrap();
                assert_eq!(opened, ClientPayload::LoopCover { nonce: 99 });
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_drop_cover_ends_in_drop() {
        let net = net();
        let mut builder = PacketBuilder::new(2);
        let out = builder.drop_cover(&net.topology, CoverKind::Drop, 1e6).unwrap();
        assert_eq!(out.frame.flag, Flag::Cover);
        assert!(matches!(route(&net, &out), PeelResult::Drop { .. }));

        let rate = builder.drop_cover(&net.topology, CoverKind::RateCompliant, 1e6).unwrap();
        assert_eq!(rate.frame.flag, Flag::Comm);
    }

    #[test]
    fn test_unknown_recipient() {
        let net = net();
        let mut builder = PacketBuilder::new(2);
        assert!(matches!(
            builder.message(&net.topology, "alice", "carol", b"x", 1.0),
            Err(ClientError::UnknownRecipient(_))
        ));
    }

    #[test]
    fn test_not_enough_mixes() {
        let net = net();
        let mut builder = PacketBuilder::new(4);
        assert!(matches!(
            builder.message(&net.topology, "alice", "bob", b"x", 1.0),
            Err(ClientError::Path(_))
        ));
    }
}
