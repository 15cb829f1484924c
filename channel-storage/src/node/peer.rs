//! Member-to-member traffic on the peer port.
//!
//! Members only authenticate each other here: a `hello` carrying the
//! cluster token and a known member id is answered with `welcome`,
//! anything else with `rejected`. Log replication does not travel over
//! this port.

use std::{io, time::Duration};

use anyhow::{Result, bail};
use tokio::{
    io::BufReader,
    net::{TcpListener, TcpStream},
    select,
    task::JoinSet,
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::cluster::ClusterMembership;
use crate::protocol::{PeerMessage, read_message, write_message};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);

pub struct PeerListener {
    listener: TcpListener,
    member: String,
    token: String,
    cluster: ClusterMembership,
}

impl PeerListener {
    pub fn new(
        listener: TcpListener,
        member: String,
        token: String,
        cluster: ClusterMembership,
    ) -> Self {
        Self {
            listener,
            member,
            token,
            cluster,
        }
    }

    pub async fn run_until(self, shutdown: CancellationToken) {
        let mut handshakes = JoinSet::new();

        loop {
            select! {
                _ = shutdown.cancelled() => break,
                accept_result = self.listener.accept() => match accept_result {
                    Ok((stream, peer)) => {
                        let reply_as = self.member.clone();
                        let token = self.token.clone();
                        let cluster = self.cluster.clone();
                        handshakes.spawn(async move {
                            let result = timeout(
                                HANDSHAKE_TIMEOUT,
                                answer_handshake(stream, &reply_as, &token, &cluster),
                            )
                            .await;
                            match result {
                                Ok(Ok(())) => {}
                                Ok(Err(err)) => warn!(peer = %peer, error = ?err, "peer handshake failed"),
                                Err(_) => warn!(peer = %peer, "peer handshake timed out"),
                            }
                        });
                    }
                    Err(err) => warn!(error = ?err, "failed to accept peer connection"),
                },
                Some(_) = handshakes.join_next(), if !handshakes.is_empty() => {}
            }
        }

        handshakes.shutdown().await;
        info!(member = %self.member, "peer listener stopped");
    }
}

async fn answer_handshake(
    stream: TcpStream,
    member: &str,
    token: &str,
    cluster: &ClusterMembership,
) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    let hello = match read_message::<_, PeerMessage>(&mut reader).await? {
        Some(message) => message,
        None => bail!("connection closed before handshake"),
    };

    let reply = match hello {
        PeerMessage::Hello {
            member: from,
            token: presented,
        } => {
            if presented != token {
                warn!(from = %from, "peer presented a foreign cluster token");
                PeerMessage::Rejected {
                    reason: "cluster token mismatch".to_string(),
                }
            } else if cluster.member(&from).is_none() {
                PeerMessage::Rejected {
                    reason: format!("'{from}' is not a cluster member"),
                }
            } else {
                debug!(from = %from, "peer joined");
                PeerMessage::Welcome {
                    member: member.to_string(),
                }
            }
        }
        other => PeerMessage::Rejected {
            reason: format!("expected hello, got {other:?}"),
        },
    };

    write_message(&mut writer, &reply).await?;
    Ok(())
}

/// Introduces `member` to the peer listening on `addr` and returns its answer.
pub async fn handshake(addr: &str, member: &str, token: &str) -> io::Result<PeerMessage> {
    let stream = timeout(HANDSHAKE_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "peer connect timed out"))??;
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    write_message(
        &mut writer,
        &PeerMessage::Hello {
            member: member.to_string(),
            token: token.to_string(),
        },
    )
    .await?;

    read_message(&mut reader)
        .await?
        .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed connection"))
}

/// Greets every other member once at startup. Unreachable members are
/// normal while a cluster is still coming up, so failures are only logged.
pub async fn announce(
    cluster: ClusterMembership,
    member: String,
    token: String,
    shutdown: CancellationToken,
) {
    for peer in cluster.peers_of(&member) {
        let result = select! {
            _ = shutdown.cancelled() => return,
            result = handshake(&peer.peer_addr, &member, &token) => result,
        };
        match result {
            Ok(PeerMessage::Welcome { .. }) => info!(peer = %peer.id, "peer acknowledged membership"),
            Ok(reply) => warn!(peer = %peer.id, ?reply, "peer refused membership"),
            Err(err) => debug!(peer = %peer.id, error = %err, "peer not reachable yet"),
        }
    }
}
