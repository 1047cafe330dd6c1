//! Listener fan-out: one TCP listener per configured port

use crate::controller::ServerHandle;
use std::net::{IpAddr, SocketAddr};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Bind `bind:port` and hand every accepted connection to `handle`.
///
/// A bind failure is logged and the port simply goes unserved; other
/// listeners are unaffected. Returns when `shutdown_rx` flips to true or
/// the controller has gone away.
pub async fn listen(bind: IpAddr, port: u16, handle: ServerHandle, shutdown_rx: watch::Receiver<bool>) {
    let addr = SocketAddr::new(bind, port);
    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(server = %handle.name(), %addr, error = %e, "Failed to bind listener");
            return;
        }
    };
    serve(listener, handle, shutdown_rx).await;
}

/// Accept loop over an already bound listener.
pub async fn serve(listener: TcpListener, handle: ServerHandle, mut shutdown_rx: watch::Receiver<bool>) {
    let addr = listener.local_addr().ok();
    info!(server = %handle.name(), ?addr, "Listening");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        debug!(server = %handle.name(), %peer, "Accepted connection");
                        if !handle.submit_connection(stream) {
                            warn!(server = %handle.name(), "Controller is gone, closing listener");
                            break;
                        }
                    }
                    Err(e) => {
                        error!(server = %handle.name(), error = %e, "Failed to accept connection");
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!(server = %handle.name(), ?addr, "Listener shutting down");
                    break;
                }
            }
        }
    }
}
