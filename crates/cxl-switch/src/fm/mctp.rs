//! MCTP-style transport for the FM CCI: length-prefixed frames over TCP,
//! tag-matched request/response plus unsolicited notifications.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use cxl_protocol::wire::{recv_frame, send_frame, WireError};

use super::cci::{CciBackend, CciExecutor, CciRequest, CciResponse, CciReturnCode};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Notification {
    SwitchUpdate { vcs_id: u8, vppb_id: u8, binding_status: u8 },
    PortUpdate { port_id: u8 },
    DeviceUpdate,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
enum FmFrame {
    Request {
        tag: u16,
        opcode: u16,
        payload: Vec<u8>,
    },
    Response {
        tag: u16,
        bo_flag: bool,
        return_code: u16,
        vendor_specific_status: u16,
        payload: Vec<u8>,
    },
    Notification(Notification),
}

/// Switch-side CCI server.
pub struct FmCciServer<B: CciBackend> {
    listener: TcpListener,
    executor: Arc<CciExecutor<B>>,
    clients: Arc<Mutex<Vec<mpsc::UnboundedSender<FmFrame>>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<B: CciBackend> FmCciServer<B> {
    pub async fn bind(
        addr: impl ToSocketAddrs,
        executor: Arc<CciExecutor<B>>,
    ) -> Result<Self, WireError> {
        Ok(FmCciServer {
            listener: TcpListener::bind(addr).await?,
            executor,
            clients: Arc::new(Mutex::new(Vec::new())),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, WireError> {
        Ok(self.listener.local_addr()?)
    }

    /// Pushes a notification to every connected FM client.
    pub fn notify(&self, notification: Notification) {
        let mut clients = self.clients.lock().unwrap();
        clients.retain(|tx| tx.send(FmFrame::Notification(notification)).is_ok());
    }

    pub async fn serve(&self) {
        loop {
            let Ok((stream, peer)) = self.listener.accept().await else {
                break;
            };
            debug!("FM client connected from {peer}");
            let (read_half, write_half) = stream.into_split();
            let (tx, rx) = mpsc::unbounded_channel();
            self.clients.lock().unwrap().push(tx.clone());

            let writer = tokio::spawn(write_loop(write_half, rx));
            let executor = self.executor.clone();
            let reader = tokio::spawn(async move {
                let mut read_half = read_half;
                loop {
                    let frame: FmFrame = match recv_frame(&mut read_half).await {
                        Ok(frame) => frame,
                        Err(_) => break,
                    };
                    let FmFrame::Request { tag, opcode, payload } = frame else {
                        warn!("FM client sent a non-request frame, ignored");
                        continue;
                    };
                    let response = executor.execute(CciRequest { opcode, payload }).await;
                    let _ = tx.send(FmFrame::Response {
                        tag,
                        bo_flag: response.bo_flag,
                        return_code: response.return_code as u16,
                        vendor_specific_status: response.vendor_specific_status,
                        payload: response.payload,
                    });
                }
            });
            let mut tasks = self.tasks.lock().unwrap();
            tasks.push(writer);
            tasks.push(reader);
        }
    }

    pub fn shutdown(&self) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}

async fn write_loop(mut write_half: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<FmFrame>) {
    while let Some(frame) = rx.recv().await {
        if send_frame(&mut write_half, &frame).await.is_err() {
            break;
        }
    }
}

/// FM-side API client: tag-matched requests plus a notification stream.
pub struct FmApiClient {
    tx: mpsc::UnboundedSender<FmFrame>,
    pending: Arc<Mutex<HashMap<u16, oneshot::Sender<CciResponse>>>>,
    notifications: tokio::sync::Mutex<mpsc::UnboundedReceiver<Notification>>,
    next_tag: Mutex<u16>,
    tasks: Vec<JoinHandle<()>>,
}

impl FmApiClient {
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, WireError> {
        let stream = TcpStream::connect(addr).await?;
        let (mut read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let pending: Arc<Mutex<HashMap<u16, oneshot::Sender<CciResponse>>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let writer = tokio::spawn(write_loop(write_half, rx));
        let reader = {
            let pending = pending.clone();
            tokio::spawn(async move {
                loop {
                    let frame: FmFrame = match recv_frame(&mut read_half).await {
                        Ok(frame) => frame,
                        Err(_) => break,
                    };
                    match frame {
                        FmFrame::Response {
                            tag,
                            bo_flag,
                            return_code,
                            vendor_specific_status,
                            payload,
                        } => {
                            let waiter = pending.lock().unwrap().remove(&tag);
                            if let Some(waiter) = waiter {
                                let _ = waiter.send(CciResponse {
                                    bo_flag,
                                    return_code: decode_return_code(return_code),
                                    vendor_specific_status,
                                    payload,
                                });
                            }
                        }
                        FmFrame::Notification(notification) => {
                            let _ = notify_tx.send(notification);
                        }
                        FmFrame::Request { .. } => {
                            warn!("switch sent a request frame to the FM client, ignored");
                        }
                    }
                }
            })
        };

        Ok(FmApiClient {
            tx,
            pending,
            notifications: tokio::sync::Mutex::new(notify_rx),
            next_tag: Mutex::new(0),
            tasks: vec![writer, reader],
        })
    }

    pub async fn request(&self, opcode: u16, payload: Vec<u8>) -> Result<CciResponse, WireError> {
        let tag = {
            let mut next = self.next_tag.lock().unwrap();
            *next = next.wrapping_add(1);
            *next
        };
        let (response_tx, response_rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(tag, response_tx);
        self.tx
            .send(FmFrame::Request {
                tag,
                opcode,
                payload,
            })
            .map_err(|_| {
                WireError::Io(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "FM connection closed",
                ))
            })?;
        response_rx.await.map_err(|_| {
            WireError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "FM connection closed",
            ))
        })
    }

    /// Next unsolicited notification.
    pub async fn recv_notification(&self) -> Option<Notification> {
        self.notifications.lock().await.recv().await
    }

    pub fn shutdown(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

fn decode_return_code(value: u16) -> CciReturnCode {
    match value {
        0x0000 => CciReturnCode::Success,
        0x0001 => CciReturnCode::BackgroundCommandStarted,
        0x0002 => CciReturnCode::InvalidInput,
        0x0003 => CciReturnCode::Unsupported,
        0x0007 => CciReturnCode::Busy,
        _ => CciReturnCode::InternalError,
    }
}
