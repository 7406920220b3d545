// mcr-stub - Loopback memcached stub for McRing tests
//
// Runs a small text-protocol server on 127.0.0.1 with an ephemeral port, on
// its own thread with a current-thread tokio runtime. Tests start one stub
// per simulated endpoint and use the fault switches and counters to observe
// client behavior.

mod server;
mod stats;
mod store;

use std::io;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;

use tokio::sync::oneshot;
use tracing::{debug, warn};

use server::{handle_connection, Fault, StubState};

pub use stats::StubStats;

/// Handle to a running stub server; stops it on drop.
pub struct StubServer {
    addr: SocketAddr,
    state: Arc<StubState>,
    shutdown: Option<oneshot::Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl StubServer {
    /// Binds an ephemeral loopback port and starts serving.
    pub fn start() -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let state = Arc::new(StubState::default());
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let thread_state = Arc::clone(&state);
        let join = std::thread::Builder::new()
            .name(format!("mcr-stub-{}", addr.port()))
            .spawn(move || runtime.block_on(serve(listener, thread_state, shutdown_rx)))?;

        debug!(%addr, "stub started");
        Ok(StubServer {
            addr,
            state,
            shutdown: Some(shutdown_tx),
            join: Some(join),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Address in `host:port` form, ready for a client config.
    pub fn endpoint(&self) -> String {
        self.addr.to_string()
    }

    pub fn stats(&self) -> StubStats {
        self.state.counters.snapshot()
    }

    /// While set, requests are read and counted but never answered.
    pub fn set_stall(&self, stall: bool) {
        self.state.stall.store(stall, Ordering::Release);
    }

    /// Closes the connection instead of answering the next `count` requests.
    pub fn fail_next(&self, count: usize) {
        self.state.queue_fault(Fault::Drop, count);
    }

    /// Sends only half of the next `count` replies, then stops answering on
    /// that connection until the client hangs up.
    pub fn truncate_next(&self, count: usize) {
        self.state.queue_fault(Fault::Truncate, count);
    }

    /// Answers the next `count` requests with an unparseable line.
    pub fn garble_next(&self, count: usize) {
        self.state.queue_fault(Fault::Garble, count);
    }

    /// Number of live items.
    pub fn item_count(&self) -> usize {
        self.state.store.len()
    }

    /// Stops accepting, closes every connection and waits for the thread.
    ///
    /// The port is released, so later connects are refused.
    pub fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                warn!(addr = %self.addr, "stub thread panicked");
            }
        }
    }
}

impl Drop for StubServer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn serve(listener: TcpListener, state: Arc<StubState>, mut shutdown: oneshot::Receiver<()>) {
    let listener = match tokio::net::TcpListener::from_std(listener) {
        Ok(listener) => listener,
        Err(err) => {
            warn!(error = %err, "stub listener setup failed");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let _ = stream.set_nodelay(true);
                    state.counters.connection_opened();
                    let state = Arc::clone(&state);
                    tokio::spawn(async move {
                        if let Err(err) = handle_connection(stream, Arc::clone(&state)).await {
                            debug!(%peer, error = %err, "stub connection ended with error");
                        }
                        state.counters.connection_closed();
                    });
                }
                Err(err) => warn!(error = %err, "stub accept failed"),
            },
        }
    }
    // Dropping the runtime after this returns cancels every connection task.
}
