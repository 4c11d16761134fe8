//! TCP port fabric of the switch.
//!
//! Hosts and devices connect over TCP; the first frame is the client's
//! prologue identifying its port index and side (`RootPort` for hosts, the
//! device kinds otherwise). The switch binds the connection to the matching
//! physical port's transport and then pumps length-prefixed packet frames in
//! both directions. A port accepts one connection at a time.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use cxl_protocol::fabric::pump_connection;
use cxl_protocol::wire::{recv_frame, send_frame, PortClientKind, PortPrologue, PrologueAck, WireError};

use crate::manager::PhysicalPortManager;
use crate::ports::PhysicalPort;

/// Switch-side fabric server.
pub struct SwitchConnectionManager {
    listener: TcpListener,
    ports: Arc<PhysicalPortManager>,
    claimed: Arc<Mutex<HashSet<u8>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SwitchConnectionManager {
    pub async fn bind(
        addr: impl ToSocketAddrs,
        ports: Arc<PhysicalPortManager>,
    ) -> Result<Self, WireError> {
        Ok(SwitchConnectionManager {
            listener: TcpListener::bind(addr).await?,
            ports,
            claimed: Arc::new(Mutex::new(HashSet::new())),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, WireError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept loop. Runs until the task is dropped.
    pub async fn serve(&self) {
        loop {
            let Ok((stream, peer)) = self.listener.accept().await else {
                break;
            };
            info!("fabric client connected from {peer}");
            match self.handshake(stream).await {
                Ok(Some(task)) => self.tasks.lock().unwrap().push(task),
                Ok(None) => {}
                Err(error) => warn!("fabric handshake failed: {error}"),
            }
        }
    }

    async fn handshake(&self, mut stream: TcpStream) -> Result<Option<JoinHandle<()>>, WireError> {
        let prologue: PortPrologue = recv_frame(&mut stream).await?;
        let port = self
            .ports
            .ports()
            .iter()
            .find(|port| port.port_index() == prologue.port_index)
            .cloned();

        let reject = |reason: &str| PrologueAck {
            accepted: false,
            reason: Some(reason.to_string()),
        };

        let Some(port) = port else {
            send_frame(&mut stream, &reject("unknown port index")).await?;
            return Ok(None);
        };
        let host_side = prologue.kind == PortClientKind::RootPort;
        let kind_matches = match &port {
            PhysicalPort::Usp(_) => host_side,
            PhysicalPort::Dsp(_) => !host_side,
        };
        if !kind_matches {
            send_frame(&mut stream, &reject("port kind mismatch")).await?;
            return Ok(None);
        }
        let already_claimed = {
            let mut claimed = self.claimed.lock().unwrap();
            !claimed.insert(prologue.port_index)
        };
        if already_claimed {
            send_frame(&mut stream, &reject("port already claimed")).await?;
            return Ok(None);
        }

        send_frame(
            &mut stream,
            &PrologueAck {
                accepted: true,
                reason: None,
            },
        )
        .await?;

        let connection = port.transport().clone();
        let dsp = match &port {
            PhysicalPort::Dsp(dsp) => {
                dsp.set_connected(true);
                Some(dsp.clone())
            }
            PhysicalPort::Usp(_) => None,
        };
        let claimed = self.claimed.clone();
        let port_index = prologue.port_index;
        Ok(Some(tokio::spawn(async move {
            pump_connection(stream, connection, host_side).await;
            if let Some(dsp) = dsp {
                dsp.set_connected(false);
            }
            claimed.lock().unwrap().remove(&port_index);
            info!("fabric client for port {port_index} disconnected");
        })))
    }

    pub fn shutdown(&self) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}
