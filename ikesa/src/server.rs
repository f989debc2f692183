//! The single-threaded cooperative event loop
//!
//! One task owns the [Demux] and everything in it. The loop multiplexes
//! the UDP socket, the timer queue, operator commands and the results
//! coming back from the blocking worker pool; every SA mutation happens
//! here, workers only ever see immutable inputs and return owned
//! outputs.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, instrument, trace};

use crate::crypto::CryptoResult;
use crate::dispatch::Demux;
use crate::sa::{OffloadTicket, SerialNo};

const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Operator requests delivered into the loop
#[derive(Debug)]
pub enum Command {
    /// Bring up an IKE SA under the named connection
    Initiate {
        /// Connection name from the configuration
        connection: String,
        /// Peer endpoint
        remote: SocketAddr,
    },
    /// Tear an IKE SA down with a Delete exchange
    Delete(SerialNo),
    /// Leave the loop
    Shutdown,
}

/// Errors that end the event loop
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum ServerError {
    #[error("Could not bind: {0}")]
    CouldNotBind(io::Error),
    #[error("Could not recv: {0}")]
    Receive(io::Error),
    #[error("Could not send: {0}")]
    Send(io::Error),
}

/// The event loop around one [Demux]
pub struct Server {
    demux: Demux,
    socket: UdpSocket,
    commands: mpsc::UnboundedReceiver<Command>,
}

impl Server {
    /// Bind the IKE port and wire up the command channel
    pub async fn bind(
        demux: Demux,
        local: SocketAddr,
    ) -> Result<(Self, mpsc::UnboundedSender<Command>), ServerError> {
        let socket = UdpSocket::bind(local)
            .await
            .map_err(ServerError::CouldNotBind)?;
        info!("listening for IKEv2 on {local}");
        let (tx, rx) = mpsc::unbounded_channel();
        Ok((
            Self {
                demux,
                socket,
                commands: rx,
            },
            tx,
        ))
    }

    /// Run until a shutdown command arrives
    #[instrument(skip_all)]
    pub async fn run(mut self) -> Result<(), ServerError> {
        let (done_tx, mut done_rx) =
            mpsc::unbounded_channel::<(SerialNo, OffloadTicket, CryptoResult)>();
        let mut buf = [0u8; MAX_DATAGRAM_SIZE];

        loop {
            self.flush(&done_tx).await?;
            self.fire_due_timers();

            let deadline = self
                .demux
                .timers
                .next_deadline()
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            select! {
                received = self.socket.recv_from(&mut buf) => {
                    let (len, sender) = received.map_err(ServerError::Receive)?;
                    trace!("received {len} octets from {sender}");
                    self.demux.process_packet(buf[..len].to_vec(), sender);
                }

                completion = done_rx.recv() => {
                    if let Some((serial, ticket, result)) = completion {
                        self.demux.resume(serial, ticket, result);
                    }
                }

                command = self.commands.recv() => {
                    match command {
                        None | Some(Command::Shutdown) => {
                            info!("shutting down");
                            return Ok(());
                        }
                        Some(Command::Initiate { connection, remote }) => {
                            match self.demux.initiate_ike_sa(&connection, remote) {
                                Ok(serial) => debug!("initiated {serial} towards {remote}"),
                                Err(err) => error!("cannot initiate '{connection}': {err}"),
                            }
                        }
                        Some(Command::Delete(serial)) => {
                            if let Err(err) = self.demux.initiate_delete(serial) {
                                error!("cannot delete {serial}: {err}");
                            }
                        }
                    }
                }

                _ = sleep_until(deadline) => {
                    // handled at the top of the next iteration
                }
            }
        }
    }

    /// Transmit queued packets and ship queued crypto work to workers
    async fn flush(
        &mut self,
        done_tx: &mpsc::UnboundedSender<(SerialNo, OffloadTicket, CryptoResult)>,
    ) -> Result<(), ServerError> {
        for packet in self.demux.drain_outbox() {
            self.socket
                .send_to(&packet.data, packet.dest)
                .await
                .map_err(ServerError::Send)?;
        }

        for offload in self.demux.drain_offloads() {
            let crypto = Arc::clone(&self.demux.crypto);
            let done = done_tx.clone();
            tokio::task::spawn_blocking(move || {
                let result = crypto.offload(offload.request);
                // the loop may be gone during shutdown; nothing to do then
                let _ = done.send((offload.serial, offload.ticket, result));
            });
        }
        Ok(())
    }

    fn fire_due_timers(&mut self) {
        let now = Instant::now();
        while let Some((serial, generation, event)) = self.demux.timers.pop_due(now) {
            trace!("timer {event:?} fired for {serial}");
            self.demux.handle_timer(serial, generation, event);
        }
    }
}
