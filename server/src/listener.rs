//! TCP accept loop
//!
//! Every accepted connection becomes a [`Session`] driven by its own task.
//! The listener keeps a handle to each live session, admitted or not, so a
//! shutdown can kick and join all of them.

use crate::error::ServerError;
use crate::server::ServerContext;
use crate::session::{drive, Session};
use crate::utils::{lock, wait_for_flag};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

type LiveSessions = Arc<Mutex<HashMap<u64, (Arc<Session>, JoinHandle<()>)>>>;

pub struct Listener {
    local_addr: SocketAddr,
    stop: watch::Sender<bool>,
    accept_task: Option<JoinHandle<()>>,
    sessions: LiveSessions,
    shutdown_timeout: Duration,
}

impl Listener {
    /// Binds the configured address and starts accepting.
    pub async fn bind(ctx: Arc<ServerContext>) -> Result<Self, ServerError> {
        let addr = ctx.config.bind_address();
        let socket = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind { addr: addr.clone(), source })?;
        let local_addr = socket
            .local_addr()
            .map_err(|source| ServerError::Bind { addr, source })?;
        info!("Listening on {}", local_addr);

        let (stop, stop_rx) = watch::channel(false);
        let sessions: LiveSessions = Arc::new(Mutex::new(HashMap::new()));
        let shutdown_timeout = ctx.config.shutdown_timeout;
        let accept_task = tokio::spawn(accept_loop(ctx, socket, Arc::clone(&sessions), stop_rx));

        Ok(Self {
            local_addr,
            stop,
            accept_task: Some(accept_task),
            sessions,
            shutdown_timeout,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Connections with a running session task, admitted or not.
    pub fn connection_count(&self) -> usize {
        lock(&self.sessions).len()
    }

    /// Stops accepting, kicks every connection with `reason` and waits up to
    /// the shutdown timeout for their tasks to finish. Returns how many did
    /// not finish in time; those are left to wind down on their own.
    pub async fn shutdown(&mut self, reason: &str) -> usize {
        self.stop.send_replace(true);
        if let Some(task) = self.accept_task.take() {
            if let Err(e) = task.await {
                error!("accept loop failed: {}", e);
            }
        }

        let live: Vec<_> = lock(&self.sessions).drain().map(|(_, entry)| entry).collect();
        info!("Closing {} connections: {}", live.len(), reason);
        for (session, _) in &live {
            session.close(Some(reason));
        }

        let deadline = Instant::now() + self.shutdown_timeout;
        let mut stragglers = 0;
        for (session, task) in live {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("session {} task failed: {}", session.id(), e),
                Err(_) => {
                    warn!("session {} did not finish within {:?}", session.id(), self.shutdown_timeout);
                    stragglers += 1;
                }
            }
        }
        info!("Listener on {} stopped", self.local_addr);
        stragglers
    }
}

async fn accept_loop(ctx: Arc<ServerContext>, socket: TcpListener, sessions: LiveSessions, mut stop: watch::Receiver<bool>) {
    loop {
        let accepted = tokio::select! {
            accepted = socket.accept() => accepted,
            _ = wait_for_flag(&mut stop) => break,
        };
        match accepted {
            Ok((stream, addr)) => start_session(&ctx, &sessions, stream, addr),
            Err(e) => {
                error!("accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
    debug!("accept loop exiting");
}

fn start_session(ctx: &Arc<ServerContext>, sessions: &LiveSessions, stream: TcpStream, addr: SocketAddr) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("set_nodelay for {}: {}", addr, e);
    }
    let (session, outbound) = Session::new(addr, Arc::clone(&ctx.registry), ctx.config.outbound_queue);
    let id = session.id();
    debug!("accepted {} as session {}", addr, id);

    // Held across the spawn so the task cannot remove its entry before it
    // has been inserted.
    let mut live = lock(sessions);
    let task = {
        let ctx = Arc::clone(ctx);
        let session = Arc::clone(&session);
        let sessions = Arc::clone(sessions);
        tokio::spawn(async move {
            drive(ctx, session, outbound, stream).await;
            lock(&sessions).remove(&id);
        })
    };
    live.insert(id, (session, task));
}
