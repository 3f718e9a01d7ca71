//! Line-oriented TCP control server.

use super::protocol::{ControlRequest, Reply, Request};
use crate::tasks::TaskManager;
use std::collections::BTreeMap;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tracing::{debug, error, info, warn};

/// Accepts remote-control clients and dispatches their requests to a [`TaskManager`].
pub struct RemoteServer {
    listener: TcpListener,
    manager: TaskManager,
}

impl RemoteServer {
    /// Listen on `addr`, serving requests against `manager`.
    pub async fn bind(addr: impl ToSocketAddrs, manager: TaskManager) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "remote control listening");
        Ok(Self { listener, manager })
    }

    /// Bound address, useful after binding port 0.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve clients until the process ends.
    pub async fn run(self) {
        self.run_until(std::future::pending()).await
    }

    /// Serve clients until `shutdown` resolves. Open connections are left to finish.
    pub async fn run_until(self, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((socket, addr)) => {
                        let manager = self.manager.clone();
                        tokio::spawn(async move {
                            if let Err(e) = serve_client(socket, addr, manager).await {
                                warn!(client = %addr, error = %e, "client connection failed");
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "accept failed"),
                },
                _ = &mut shutdown => {
                    info!("remote control shutting down");
                    break;
                }
            }
        }
    }
}

async fn serve_client(socket: TcpStream, addr: SocketAddr, manager: TaskManager) -> io::Result<()> {
    info!(client = %addr, "client connected");
    let (reader, mut writer) = socket.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        debug!(client = %addr, request = line, "request");

        let reply = match Request::parse(line) {
            Ok(request) => dispatch(&manager, request).await,
            Err(message) => {
                warn!(client = %addr, %message, "unparseable request");
                Reply::error("parse", message)
            }
        };

        let mut out = reply.to_line();
        out.push('\n');
        writer.write_all(out.as_bytes()).await?;
        writer.flush().await?;
    }

    info!(client = %addr, "client disconnected");
    Ok(())
}

/// Execute one parsed request against `manager`.
pub async fn dispatch(manager: &TaskManager, request: Request) -> Reply {
    match request {
        Request::Task(request) => match manager.submit(request) {
            Ok(id) => Reply::submitted(id),
            Err(e) => Reply::from(&e),
        },
        Request::Control(ControlRequest::Status { task }) => match manager.status(task) {
            Ok(snapshot) => Reply::snapshot(snapshot),
            Err(e) => Reply::from(&e),
        },
        Request::Control(ControlRequest::Stop { task }) => match manager.stop(task) {
            Ok(state) => Reply::stopping(task, state),
            Err(e) => Reply::from(&e),
        },
        Request::Control(ControlRequest::Wait { task }) => match manager.wait(task).await {
            Ok(snapshot) => Reply::snapshot(snapshot),
            Err(e) => Reply::from(&e),
        },
        Request::Control(ControlRequest::List) => {
            let sets: BTreeMap<String, Vec<String>> = manager
                .set_names()
                .into_iter()
                .filter_map(|name| {
                    let members = manager.set(&name)?.member_names().to_vec();
                    Some((name, members))
                })
                .collect();
            Reply::listing(manager.tasks(), sets)
        }
        Request::Control(ControlRequest::Purge) => Reply::purged(manager.purge_finished()),
    }
}
