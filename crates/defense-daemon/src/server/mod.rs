//! Local control server.
//!
//! Listens on a Unix stream socket, answers one NDJSON response per request
//! line, and turns `subscribe` connections into push-event streams fed from
//! the state manager.

use anyhow::{Context, Result};
use defense_core::ipc::{decode_request, write_frame, Command, Response, INVALID_JSON};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

mod dispatch;
mod subscribers;

pub use dispatch::{Dispatcher, ServerContext};
pub use subscribers::SubscriberSet;

const SOCKET_MODE: u32 = 0o660;
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

struct Shared {
    dispatcher: Dispatcher,
    subscribers: SubscriberSet,
}

pub struct ControlServer {
    listener: UnixListener,
    socket_path: PathBuf,
}

impl ControlServer {
    /// Creates the socket directory, replaces any stale socket file, binds
    /// and restricts the socket to owner and group.
    pub fn bind(socket_path: impl Into<PathBuf>) -> Result<Self> {
        let socket_path = socket_path.into();
        if let Some(parent) = socket_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create socket dir {}", parent.display()))?;
        }
        match std::fs::remove_file(&socket_path) {
            Ok(()) => debug!(socket = %socket_path.display(), "removed stale socket"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("remove stale socket {}", socket_path.display()))
            }
        }

        let listener = UnixListener::bind(&socket_path)
            .with_context(|| format!("bind control socket {}", socket_path.display()))?;
        std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(SOCKET_MODE))
            .with_context(|| format!("chmod control socket {}", socket_path.display()))?;

        info!(socket = %socket_path.display(), "control socket listening");
        Ok(Self {
            listener,
            socket_path,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Accepts connections until `shutdown` flips to true or its sender is
    /// dropped, then closes the listener and removes the socket file.
    /// Connections already accepted keep running.
    pub async fn serve(self, ctx: ServerContext, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let state = ctx.state.clone();
        let shared = Arc::new(Shared {
            dispatcher: Dispatcher::new(ctx),
            subscribers: SubscriberSet::new(),
        });

        let fanout = shared.clone();
        let token = state.on_change(move |event| {
            let reached = fanout.subscribers.publish(event);
            debug!(from = %event.old, to = %event.new, subscribers = reached, "state change published");
        });

        while !*shutdown.borrow() {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let shared = shared.clone();
                        tokio::spawn(async move {
                            if let Err(err) = handle_connection(stream, shared).await {
                                debug!(error = %err, "control connection ended with error");
                            }
                        });
                    }
                    Err(err) => {
                        warn!(error = %err, "control socket accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                }
            }
        }

        state.remove_listener(token);
        let ControlServer {
            listener,
            socket_path,
        } = self;
        drop(listener);
        match std::fs::remove_file(&socket_path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(socket = %socket_path.display(), error = %err, "failed to remove control socket"),
        }
        info!(socket = %socket_path.display(), "control server stopped");
        Ok(())
    }
}

async fn handle_connection(stream: UnixStream, shared: Arc<Shared>) -> std::io::Result<()> {
    let (read_half, mut writer) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            return Ok(());
        }
        let line = String::from_utf8_lossy(&buf);

        let request = match decode_request(&line) {
            Ok(request) => request,
            Err(err) => {
                debug!(error = %err, "malformed control request");
                write_frame(&mut writer, &Response::error("", INVALID_JSON)).await?;
                continue;
            }
        };
        if let Err(mismatch) = request.check_version() {
            warn!(cmd = %request.command, error = %mismatch, "rejected request");
            write_frame(&mut writer, &Response::error(request.id, mismatch.to_string())).await?;
            continue;
        }
        if request.command == Command::Subscribe.as_str() {
            return serve_subscriber(request.id, reader, writer, &shared).await;
        }

        let response = shared.dispatcher.dispatch(&request);
        write_frame(&mut writer, &response).await?;
    }
}

/// After the ack, the connection only carries events. Anything the client
/// sends is discarded; end of input or a failed write unsubscribes it.
async fn serve_subscriber(
    request_id: String,
    mut reader: BufReader<OwnedReadHalf>,
    mut writer: OwnedWriteHalf,
    shared: &Shared,
) -> std::io::Result<()> {
    let (id, mut events) = shared.subscribers.subscribe();
    if let Err(err) = write_frame(&mut writer, &Response::ok(request_id, "subscribed")).await {
        shared.subscribers.unsubscribe(id);
        return Err(err);
    }
    info!(subscriber = %id, total = shared.subscribers.len(), "subscriber registered");

    let mut discard = Vec::new();
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                if let Err(err) = write_frame(&mut writer, &Response::event(event)).await {
                    debug!(subscriber = %id, error = %err, "subscriber write failed");
                    break;
                }
            }
            read = reader.read_until(b'\n', &mut discard) => {
                match read {
                    Ok(0) | Err(_) => break,
                    Ok(_) => discard.clear(),
                }
            }
        }
    }

    shared.subscribers.unsubscribe(id);
    info!(subscriber = %id, "subscriber removed");
    Ok(())
}
