use anyhow::bail;
use bytes::{Buf, BufMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;

/// Upper bound for the number of seqs carried in one DATA or ACK packet.
pub const MAX_SEQS_PER_PACKET: usize = 8;

/// Seqs are assigned by the originator starting at 1 and never exceed i32
/// range, so a u32 on the wire has headroom for sanity checking.
const MAX_SEQ: u32 = i32::MAX as u32;

const DISCRIMINATOR_DATA: u8 = 0x01;
const DISCRIMINATOR_ACK: u8 = 0x02;

/// One UDP datagram's worth of protocol traffic. The datagram boundary
/// delimits the packet, there is no length prefix.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Packet {
    /// Payload seqs from a single origin. The origin is the process that
    /// first broadcast the seqs, which is not necessarily the process that
    /// sent the datagram (relay traffic keeps the original origin).
    Data { origin: u32, seqs: Vec<u32> },
    /// Acknowledges seqs of DATA packets previously received from the
    /// datagram's destination. Carries no origin: the ACK is correlated by
    /// the transport-level address it is sent back to.
    Ack { seqs: Vec<u32> },
}

impl Packet {
    /// A DATA packet carrying a full batch is the largest frame this
    /// protocol ever produces: discriminator, origin, count, eight seqs.
    pub const MAX_SERIALIZED_LEN: usize =
        1 + size_of::<u32>() + 1 + MAX_SEQS_PER_PACKET * size_of::<u32>();

    pub fn ser(&self, buf: &mut impl BufMut) {
        match self {
            Packet::Data { origin, seqs } => {
                buf.put_u8(DISCRIMINATOR_DATA);
                buf.put_u32(*origin);
                Self::ser_seqs(seqs, buf);
            }
            Packet::Ack { seqs } => {
                buf.put_u8(DISCRIMINATOR_ACK);
                Self::ser_seqs(seqs, buf);
            }
        }
    }

    fn ser_seqs(seqs: &[u32], buf: &mut impl BufMut) {
        debug_assert!(!seqs.is_empty() && seqs.len() <= MAX_SEQS_PER_PACKET);
        buf.put_u8(seqs.len() as u8);
        for &seq in seqs {
            buf.put_u32(seq);
        }
    }

    /// Fails loudly on any malformed frame; the caller is expected to drop
    /// the datagram.
    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Packet> {
        let discriminator = buf.try_get_u8()?;
        let packet = match discriminator {
            DISCRIMINATOR_DATA => {
                let origin = buf.try_get_u32()?;
                if origin == 0 {
                    bail!("DATA packet with origin 0");
                }
                Packet::Data { origin, seqs: Self::deser_seqs(buf)? }
            }
            DISCRIMINATOR_ACK => Packet::Ack { seqs: Self::deser_seqs(buf)? },
            n => bail!("unknown packet discriminator {:#04x}", n),
        };

        if buf.has_remaining() {
            bail!("{} trailing bytes after packet", buf.remaining());
        }
        Ok(packet)
    }

    fn deser_seqs(buf: &mut impl Buf) -> anyhow::Result<Vec<u32>> {
        let count = buf.try_get_u8()? as usize;
        if count == 0 || count > MAX_SEQS_PER_PACKET {
            bail!("seq count {} outside 1..={}", count, MAX_SEQS_PER_PACKET);
        }

        let mut seqs = Vec::with_capacity(count);
        for _ in 0..count {
            let seq = buf.try_get_u32()?;
            if seq == 0 || seq > MAX_SEQ {
                bail!("seq {} outside valid range", seq);
            }
            seqs.push(seq);
        }
        Ok(seqs)
    }
}
