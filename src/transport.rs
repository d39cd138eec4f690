//! Worker-facing frame gateway.
//!
//! Workers connect over TCP and speak the binary frame protocol:
//! register/unregister control frames populate the tool registry,
//! function-call frames flow out to the connection hosting the tag,
//! and result frames flow back to the tenant's reducer channel. The
//! hub implements the caller's [`Source`]/[`Reducer`] seams on top.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::caller::{Reducer, Source};
use crate::codec::{CodecError, Frame, FunctionCallFrame, FunctionResultFrame};
use crate::registry::ToolRegistry;

/// One registration owned by a worker connection, remembered so a
/// disconnect can clean up after the worker.
#[derive(Debug, Clone)]
struct OwnedRegistration {
    app_id: String,
    name: String,
    tag: u32,
}

/// Routes frames between per-credential callers and worker connections.
pub struct WorkerHub {
    registry: Arc<ToolRegistry>,
    /// tag → write half of the connection hosting that tool.
    routes: Mutex<HashMap<u32, mpsc::UnboundedSender<Vec<u8>>>>,
    /// app_id → reducer channel feeding that tenant's caller.
    results: Mutex<HashMap<String, mpsc::Sender<FunctionResultFrame>>>,
}

impl WorkerHub {
    pub fn new(registry: Arc<ToolRegistry>) -> Arc<Self> {
        Arc::new(Self {
            registry,
            routes: Mutex::new(HashMap::new()),
            results: Mutex::new(HashMap::new()),
        })
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Outbound endpoint for a caller. Shared hub state underneath, so
    /// closing one caller never touches worker connections.
    pub fn source(self: &Arc<Self>) -> Arc<dyn Source> {
        Arc::new(HubSource {
            hub: Arc::clone(self),
        })
    }

    /// Inbound endpoint for a tenant's caller. A newer reducer for the
    /// same tenant replaces the old route; the old caller then sees EOF
    /// and resolves any stragglers through its deadline.
    pub fn reducer(self: &Arc<Self>, app_id: &str) -> Box<dyn Reducer> {
        let (tx, rx) = mpsc::channel(64);
        self.results.lock().unwrap().insert(app_id.to_string(), tx);
        Box::new(HubReducer { rx })
    }

    /// Accept loop for worker connections.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, addr) = listener.accept().await?;
            info!(%addr, "Worker connected");
            let hub = Arc::clone(&self);
            tokio::spawn(async move {
                hub.handle_worker(stream).await;
                info!(%addr, "Worker disconnected");
            });
        }
    }

    /// Per-connection loop: carve complete frames out of the read
    /// buffer, apply control frames, route results. Ends on EOF, read
    /// error, or a malformed frame.
    async fn handle_worker(self: Arc<Self>, stream: TcpStream) {
        let (mut reader, mut writer) = stream.into_split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        let write_task = tokio::spawn(async move {
            while let Some(bytes) = out_rx.recv().await {
                if let Err(e) = writer.write_all(&bytes).await {
                    error!("Worker write error: {e}");
                    break;
                }
            }
        });

        let mut owned: Vec<OwnedRegistration> = Vec::new();
        let mut read_buf = vec![0u8; 64 * 1024];
        let mut frame_buf: Vec<u8> = Vec::new();

        'conn: loop {
            let n = match reader.read(&mut read_buf).await {
                Ok(0) => break 'conn,
                Ok(n) => n,
                Err(e) => {
                    error!("Worker read error: {e}");
                    break 'conn;
                }
            };
            frame_buf.extend_from_slice(&read_buf[..n]);

            // Drain every complete frame in the buffer.
            loop {
                match Frame::decode(&frame_buf) {
                    Ok((frame, used)) => {
                        frame_buf.drain(..used);
                        self.apply_frame(frame, &out_tx, &mut owned);
                    }
                    Err(CodecError::ShortFrame { .. }) => break,
                    Err(e) => {
                        warn!("Resetting worker connection after codec error: {e}");
                        break 'conn;
                    }
                }
            }
        }

        // Tools live only as long as their worker: unregister
        // everything this connection announced.
        {
            let mut routes = self.routes.lock().unwrap();
            for reg in &owned {
                routes.remove(&reg.tag);
            }
        }
        for reg in &owned {
            self.registry.unregister(&reg.app_id, &reg.name);
        }
        write_task.abort();
    }

    fn apply_frame(
        &self,
        frame: Frame,
        out_tx: &mpsc::UnboundedSender<Vec<u8>>,
        owned: &mut Vec<OwnedRegistration>,
    ) {
        match &frame {
            Frame::RegisterFunction(f) => {
                self.routes.lock().unwrap().insert(f.tag, out_tx.clone());
                owned.push(OwnedRegistration {
                    app_id: f.app_id.clone(),
                    name: f.name.clone(),
                    tag: f.tag,
                });
                self.registry.handle_control_frame(&frame);
            }
            Frame::UnregisterFunction(f) => {
                let mut routes = self.routes.lock().unwrap();
                owned.retain(|reg| {
                    if reg.app_id == f.app_id && reg.name == f.name {
                        routes.remove(&reg.tag);
                        false
                    } else {
                        true
                    }
                });
                drop(routes);
                self.registry.handle_control_frame(&frame);
            }
            Frame::FunctionResult(f) => {
                self.route_result(owned, f);
            }
            Frame::FunctionCall(_) => {
                warn!("Worker sent a function-call frame, dropping");
            }
        }
    }

    /// Delivers a result to the reducers of the tenants this worker
    /// serves. A caller that does not recognize the `req_id` drops the
    /// frame, so delivery to sibling tenants of the same worker is
    /// harmless.
    fn route_result(&self, owned: &[OwnedRegistration], frame: &FunctionResultFrame) {
        let results = self.results.lock().unwrap();
        let mut delivered = false;
        let mut seen_apps: Vec<&str> = Vec::new();
        for reg in owned {
            if seen_apps.contains(&reg.app_id.as_str()) {
                continue;
            }
            seen_apps.push(reg.app_id.as_str());
            if let Some(tx) = results.get(&reg.app_id) {
                if tx.try_send(frame.clone()).is_ok() {
                    delivered = true;
                }
            }
        }
        if !delivered {
            debug!(req_id = %frame.req_id, "No reducer for worker result, dropping");
        }
    }
}

/// Binds the gateway listener and serves worker connections.
pub async fn serve_worker_gateway(hub: Arc<WorkerHub>, addr: &str) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Worker gateway listening on {addr}");
    hub.serve(listener).await
}

struct HubSource {
    hub: Arc<WorkerHub>,
}

#[async_trait]
impl Source for HubSource {
    async fn write_call(&self, frame: FunctionCallFrame) -> Result<()> {
        let tx = self.hub.routes.lock().unwrap().get(&frame.tag).cloned();
        let Some(tx) = tx else {
            return Err(anyhow!("no worker hosts tag 0x{:02x}", frame.tag));
        };
        tx.send(Frame::FunctionCall(frame).encode())
            .map_err(|_| anyhow!("worker connection closed"))
    }

    fn close(&self) {}
}

struct HubReducer {
    rx: mpsc::Receiver<FunctionResultFrame>,
}

#[async_trait]
impl Reducer for HubReducer {
    async fn next_result(&mut self) -> Option<FunctionResultFrame> {
        self.rx.recv().await
    }
}
