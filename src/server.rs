use crate::encoding::Value as _;
use crate::error::Result;
use crate::service::{KvService, Request, Response};
use crate::store::Store;

use log::{debug, error, info};
use std::io::{BufReader, BufWriter, Write as _};
use std::net::{TcpListener, TcpStream};

/// A regionkv client server. Serves the client protocol over TCP: each
/// connection is a session sending Bincode-encoded service::Requests and
/// receiving a Result<service::Response> for each, in order.
///
/// Raft traffic between stores uses a separate listener, see
/// raft::TcpTransport.
pub struct Server {
    service: KvService,
}

impl Server {
    pub fn new(store: Store) -> Self {
        Self { service: KvService::new(store) }
    }

    /// Serves client connections, spawning a thread per session. Blocks
    /// until the listener fails.
    pub fn serve(self, listener: TcpListener) -> Result<()> {
        info!("Listening for clients on {}", listener.local_addr()?);
        std::thread::scope(|s| loop {
            let (socket, peer) = match listener.accept() {
                Ok(r) => r,
                Err(err) => {
                    error!("Client connection failed: {err}");
                    continue;
                }
            };
            let service = self.service.clone();
            s.spawn(move || {
                debug!("Client {peer} connected");
                match Self::session(service, socket) {
                    Ok(()) => debug!("Client {peer} disconnected"),
                    Err(err) => error!("Client {peer} error: {err}"),
                }
            });
        })
    }

    /// Runs a client session.
    fn session(service: KvService, socket: TcpStream) -> Result<()> {
        let mut reader = BufReader::new(socket.try_clone()?);
        let mut writer = BufWriter::new(socket);
        while let Some(request) = Request::maybe_decode_from(&mut reader)? {
            debug!("Received request {request:?}");
            let response: Result<Response> = service.execute(request);
            if let Err(err) = &response {
                debug!("Request failed: {err}");
            }
            response.encode_into(&mut writer)?;
            writer.flush()?;
        }
        Ok(())
    }
}
