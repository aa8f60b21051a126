//! Dialing a destination through a relay.
//!
//! The input address splits at `p2p-circuit` into a relay part and a
//! destination part. The hop stream offers the v2 protocol first and
//! falls back to v1; the host's multistream negotiator picks one.

use multiaddr::Multiaddr;
use tracing::debug;

use circuit_core::addr::split_circuit;
use circuit_core::codec::{read_delimited, write_delimited};
use circuit_core::host::{DialOpts, MuxStream, TEMP_ADDR_TTL};
use circuit_core::peer::{AddrInfo, PeerId};
use circuit_core::proto::{
    addr_info_to_peer, circuit_relay, hop_message, CircuitRelay, HopMessage, Status,
};
use circuit_core::{PROTO_V1, PROTO_V2_HOP};

use crate::client::{Client, ClientInner};
use crate::conn::{Conn, ConnStat};
use crate::error::Error;

impl Client {
    /// Dial `dest` through the relay named in `addr`
    /// (`/…/p2p/<relay>/p2p-circuit[/p2p/<dest>]`).
    pub async fn dial(&self, addr: &Multiaddr, dest: PeerId) -> Result<Conn, Error> {
        self.inner.dial(addr, dest).await
    }
}

impl ClientInner {
    pub(crate) async fn dial(&self, addr: &Multiaddr, dest: PeerId) -> Result<Conn, Error> {
        let (relayaddr, destaddr) =
            split_circuit(addr).ok_or_else(|| Error::NotRelayAddr(addr.clone()))?;
        if relayaddr.is_empty() {
            return Err(Error::NoRelaySpecified(addr.clone()));
        }

        let rinfo = AddrInfo::from_p2p_addr(&relayaddr)?;

        let mut dinfo = AddrInfo::new(dest);
        if !destaddr.is_empty() {
            // keep any destination address for active relays; strip a
            // redundant /p2p/<dest> suffix
            match AddrInfo::from_p2p_addr(&destaddr) {
                Ok(info) if info.id == dest => dinfo.addrs = info.addrs,
                _ => dinfo.addrs.push(destaddr),
            }
        }

        self.dial_peer(rinfo, dinfo).await
    }

    async fn dial_peer(&self, relay: AddrInfo, dest: AddrInfo) -> Result<Conn, Error> {
        debug!("dialing peer {} through relay {}", dest.id, relay.id);

        if !relay.addrs.is_empty() {
            self.host.add_addrs(&relay.id, &relay.addrs, TEMP_ADDR_TTL);
        }

        let stream = self
            .host
            .new_stream(&relay.id, &[PROTO_V2_HOP, PROTO_V1], DialOpts::default())
            .await?;

        match stream.protocol() {
            PROTO_V2_HOP => self.connect_v2(stream, dest).await,
            PROTO_V1 => self.connect_v1(stream, dest).await,
            other => {
                stream.resetter().reset();
                Err(Error::UnexpectedProtocol(other))
            }
        }
    }

    async fn connect_v2(
        &self,
        mut stream: Box<dyn MuxStream>,
        dest: AddrInfo,
    ) -> Result<Conn, Error> {
        let msg = HopMessage::connect(addr_info_to_peer(&dest));
        if let Err(err) = write_delimited(&mut stream, &msg).await {
            stream.resetter().reset();
            return Err(err.into());
        }

        let reply: HopMessage = match read_delimited(&mut stream).await {
            Ok(reply) => reply,
            Err(err) => {
                stream.resetter().reset();
                return Err(err.into());
            }
        };

        if reply.msg_type() != Some(hop_message::Type::Status) {
            stream.resetter().reset();
            return Err(Error::UnexpectedResponse);
        }
        match reply.status_code() {
            Some(Status::Ok) => {}
            Some(status) => {
                stream.resetter().reset();
                return Err(Error::CircuitFailed(status));
            }
            None => {
                stream.resetter().reset();
                return Err(Error::UnexpectedResponse);
            }
        }

        let mut stat = ConnStat::default();
        if let Some(limit) = &reply.limit {
            stat.transient = true;
            stat.limit_duration =
                limit.duration.map(|secs| std::time::Duration::from_secs(u64::from(secs)));
            stat.limit_data = limit.data;
        }

        let relay = stream.remote_peer();
        Ok(Conn::new(stream, dest, relay, stat, self.weak()))
    }

    async fn connect_v1(
        &self,
        mut stream: Box<dyn MuxStream>,
        dest: AddrInfo,
    ) -> Result<Conn, Error> {
        let self_info = AddrInfo::with_addrs(self.host.id(), self.host.addrs());
        let msg = CircuitRelay::hop(addr_info_to_peer(&self_info), addr_info_to_peer(&dest));

        if let Err(err) = write_delimited(&mut stream, &msg).await {
            stream.resetter().reset();
            return Err(err.into());
        }

        let reply: CircuitRelay = match read_delimited(&mut stream).await {
            Ok(reply) => reply,
            Err(err) => {
                stream.resetter().reset();
                return Err(err.into());
            }
        };

        if reply.msg_type() != Some(circuit_relay::Type::Status) {
            stream.resetter().reset();
            return Err(Error::UnexpectedResponse);
        }
        match reply.status_code() {
            Some(circuit_relay::Status::Success) => {}
            Some(code) => {
                stream.resetter().reset();
                return Err(Error::CircuitFailedV1(code));
            }
            None => {
                stream.resetter().reset();
                return Err(Error::UnexpectedResponse);
            }
        }

        let relay = stream.remote_peer();
        Ok(Conn::new(stream, dest, relay, ConnStat::default(), self.weak()))
    }
}
