//! Obtaining relay-slot reservations.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use multiaddr::Multiaddr;
use tracing::debug;

use circuit_core::codec::{read_delimited, write_delimited};
use circuit_core::host::{DialOpts, TEMP_ADDR_TTL};
use circuit_core::peer::AddrInfo;
use circuit_core::proto::{hop_message, peer_to_addr_info, HopMessage, Status};
use circuit_core::PROTO_V2_HOP;
use circuit_crypto::voucher::ReservationVoucher;

use crate::client::Client;
use crate::error::Error;

const RESERVE_TIMEOUT: Duration = Duration::from_secs(60);

/// A relay-slot reservation held at a relay.
#[derive(Clone, Debug)]
pub struct Reservation {
    /// When the reservation lapses unless refreshed.
    pub expiration: SystemTime,
    /// The relay's public addresses, usable for advertising
    /// relay-specific addresses.
    pub relay: AddrInfo,
    /// Wall-time cap the relay applies to each circuit; `None` is
    /// unlimited.
    pub limit_duration: Option<Duration>,
    /// Byte cap per circuit direction; `None` is unlimited.
    pub limit_data: Option<u64>,
    /// The relay's signed reservation voucher, when it issues one.
    pub voucher: Option<ReservationVoucher>,
}

impl Client {
    /// Reserve a slot at `relay`. Destinations must hold a reservation
    /// for the relay to accept circuits to them.
    pub async fn reserve(&self, relay: &AddrInfo) -> Result<Reservation, Error> {
        if !relay.addrs.is_empty() {
            self.inner.host.add_addrs(&relay.id, &relay.addrs, TEMP_ADDR_TTL);
        }

        let mut stream = self
            .inner
            .host
            .new_stream(&relay.id, &[PROTO_V2_HOP], DialOpts::default())
            .await?;

        let exchange = tokio::time::timeout(RESERVE_TIMEOUT, async {
            write_delimited(&mut stream, &HopMessage::reserve()).await?;
            read_delimited::<HopMessage, _>(&mut stream).await
        })
        .await;

        let reply = match exchange {
            Ok(Ok(reply)) => reply,
            Ok(Err(err)) => {
                stream.resetter().reset();
                return Err(err.into());
            }
            Err(_) => {
                stream.resetter().reset();
                return Err(Error::Timeout);
            }
        };

        if reply.msg_type() != Some(hop_message::Type::Status) {
            return Err(Error::UnexpectedResponse);
        }
        match reply.status_code() {
            Some(Status::Ok) => {}
            Some(status) => return Err(Error::ReservationFailed(status)),
            None => return Err(Error::UnexpectedResponse),
        }

        let rsvp = reply.reservation.ok_or(Error::MissingReservation)?;

        // two wire forms coexist: absolute expiry or relative ttl
        let expiration = if let Some(expire) = rsvp.expire {
            UNIX_EPOCH + Duration::from_secs(expire)
        } else if let Some(ttl) = rsvp.ttl {
            SystemTime::now() + Duration::from_secs(u64::from(ttl))
        } else {
            return Err(Error::MissingReservation);
        };

        let relay_info = match peer_to_addr_info(rsvp.relay.as_ref()) {
            Ok(info) => info,
            Err(_) => {
                // older form: bare address list alongside the known relay ID
                let mut addrs = Vec::new();
                for bytes in &rsvp.addrs {
                    if let Ok(addr) = Multiaddr::try_from(bytes.clone()) {
                        addrs.push(addr);
                    }
                }
                AddrInfo::with_addrs(relay.id, addrs)
            }
        };

        let voucher = rsvp.voucher.as_deref().and_then(|bytes| {
            match ReservationVoucher::unmarshal(bytes) {
                Ok(voucher) => Some(voucher),
                Err(err) => {
                    debug!("discarding malformed reservation voucher: {err}");
                    None
                }
            }
        });

        let (limit_duration, limit_data) = match &reply.limit {
            Some(limit) => (
                limit.duration.map(|secs| Duration::from_secs(u64::from(secs))),
                limit.data,
            ),
            None => (None, None),
        };

        Ok(Reservation { expiration, relay: relay_info, limit_duration, limit_data, voucher })
    }
}
