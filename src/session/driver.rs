//! Async driver for a [`Session`]
//!
//! Three tasks share the session behind one mutex:
//! - inbound: link -> session -> tunnel
//! - outbound: tunnel -> session -> link
//! - ticker: timers
//!
//! Packets for the link are pushed while the lock is held, so they leave
//! in the order the session produced them.

use super::{Session, SessionEvent, SessionState};
use crate::transport::{LinkInterface, PacketTunnel};
use crate::{Error, Result};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Receiver of session events
pub type SessionEvents = mpsc::UnboundedReceiver<SessionEvent>;

struct Shared {
    session: Mutex<Session>,
    events: mpsc::UnboundedSender<SessionEvent>,
    shutdown: watch::Sender<bool>,
    closing: AtomicBool,
    link: OnceLock<Arc<dyn LinkInterface>>,
}

impl Shared {
    fn forward_events(&self, session: &mut Session) {
        while let Some(event) = session.poll_event() {
            // Nobody listening is fine.
            let _ = self.events.send(event);
        }
    }

    async fn flush(&self, session: &mut Session, link: &dyn LinkInterface) -> Result<()> {
        self.forward_events(session);
        let packets = session.poll_transmit();
        if !packets.is_empty() {
            link.push_many(packets).await?;
        }
        Ok(())
    }

    fn stop(&self) {
        self.shutdown.send_replace(true);
    }
}

/// Shareable handle driving a session
#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<Shared>,
}

impl SessionHandle {
    pub fn new(session: Session) -> (Self, SessionEvents) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            session: Mutex::new(session),
            events: events_tx,
            shutdown,
            closing: AtomicBool::new(false),
            link: OnceLock::new(),
        });
        (Self { shared }, events_rx)
    }

    /// Exclusive access to the session
    pub async fn lock(&self) -> MutexGuard<'_, Session> {
        self.shared.session.lock().await
    }

    pub async fn state(&self) -> SessionState {
        self.lock().await.state()
    }

    pub async fn request_rekey(&self) {
        self.lock().await.request_rekey();
    }

    /// Drive the session until it closes, fails or is shut down
    pub async fn run(&self, link: Arc<dyn LinkInterface>, tun: Arc<dyn PacketTunnel>) -> Result<()> {
        if self.shared.link.set(Arc::clone(&link)).is_err() {
            return Err(Error::InvalidState {
                operation: "run twice",
                state: self.state().await,
            });
        }

        let tick = {
            let mut session = self.lock().await;
            session.clamp_mtu(tun.mtu());
            if session.state() == SessionState::Idle {
                let started = session.start(Instant::now());
                self.shared.flush(&mut session, link.as_ref()).await?;
                started?;
            }
            session.tick_interval()
        };

        let tasks = [
            self.spawn(inbound(
                Arc::clone(&self.shared),
                Arc::clone(&link),
                Arc::clone(&tun),
            )),
            self.spawn(outbound(
                Arc::clone(&self.shared),
                Arc::clone(&link),
                Arc::clone(&tun),
            )),
            self.spawn(ticker(Arc::clone(&self.shared), Arc::clone(&link), tick)),
        ];

        let mut first_error = None;
        for task in tasks {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    first_error.get_or_insert(Error::Task(e.to_string()));
                }
            }
        }

        if self.shared.closing.load(Ordering::SeqCst) {
            return Ok(());
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Close the session and stop its tasks
    ///
    /// Waits for in-flight work holding the session, then drops every key.
    pub async fn shutdown(&self) {
        self.shared.closing.store(true, Ordering::SeqCst);
        {
            let mut session = self.lock().await;
            session.close();
            match self.shared.link.get() {
                Some(link) => {
                    if let Err(e) = self.shared.flush(&mut session, link.as_ref()).await {
                        tracing::debug!(error = %e, "close_notify not delivered");
                    }
                }
                None => self.shared.forward_events(&mut session),
            }
        }
        self.shared.stop();
        tracing::debug!("session shutdown");
    }

    fn spawn<F>(&self, task: F) -> JoinHandle<Result<()>>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let result = task.await;
            shared.stop();
            result
        })
    }
}

async fn inbound(
    shared: Arc<Shared>,
    link: Arc<dyn LinkInterface>,
    tun: Arc<dyn PacketTunnel>,
) -> Result<()> {
    let mut stop = shared.shutdown.subscribe();
    loop {
        if *stop.borrow() {
            return Ok(());
        }
        let packets = tokio::select! {
            _ = stop.changed() => return Ok(()),
            pulled = link.pull() => match pulled {
                Ok(packets) => packets,
                Err(e) if e.is_transient() => {
                    tracing::debug!(error = %e, "link receive failed, retrying");
                    continue;
                }
                Err(e) => return Err(e.into()),
            },
        };
        if shared.closing.load(Ordering::SeqCst) {
            return Ok(());
        }

        let now = Instant::now();
        let mut delivered = Vec::new();
        let mut fatal = None;
        let terminal = {
            let mut session = shared.session.lock().await;
            for packet in packets {
                match session.handle_inbound(packet, now) {
                    Ok(Some(packet)) => delivered.push(packet),
                    Ok(None) => {}
                    Err(e) if e.is_fatal() => {
                        fatal = Some(e);
                        break;
                    }
                    Err(Error::SessionClosed) => break,
                    Err(e) => tracing::debug!(error = %e, "inbound packet dropped"),
                }
            }
            shared.flush(&mut session, link.as_ref()).await?;
            session.state().is_terminal()
        };

        if !delivered.is_empty() {
            tun.write_packets(delivered).await?;
        }
        if let Some(e) = fatal {
            return Err(e);
        }
        if terminal {
            return Ok(());
        }
    }
}

async fn outbound(
    shared: Arc<Shared>,
    link: Arc<dyn LinkInterface>,
    tun: Arc<dyn PacketTunnel>,
) -> Result<()> {
    let mut stop = shared.shutdown.subscribe();
    loop {
        if *stop.borrow() {
            return Ok(());
        }
        let packets = tokio::select! {
            _ = stop.changed() => return Ok(()),
            read = tun.read_packets() => read?,
        };
        if shared.closing.load(Ordering::SeqCst) {
            return Ok(());
        }

        let now = Instant::now();
        let mut session = shared.session.lock().await;
        let mut fatal = None;
        for packet in packets {
            match session.handle_outbound(&packet, now) {
                Ok(()) => {}
                Err(e) if e.is_fatal() => {
                    fatal = Some(e);
                    break;
                }
                Err(Error::SessionClosed) => break,
                Err(e) => tracing::debug!(len = packet.len(), error = %e, "outbound packet dropped"),
            }
        }
        shared.flush(&mut session, link.as_ref()).await?;
        if let Some(e) = fatal {
            return Err(e);
        }
        if session.state().is_terminal() {
            return Ok(());
        }
    }
}

async fn ticker(shared: Arc<Shared>, link: Arc<dyn LinkInterface>, tick: Duration) -> Result<()> {
    let mut stop = shared.shutdown.subscribe();
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        if *stop.borrow() {
            return Ok(());
        }
        tokio::select! {
            _ = stop.changed() => return Ok(()),
            _ = interval.tick() => {}
        }

        let mut session = shared.session.lock().await;
        let ticked = session.tick(Instant::now());
        shared.flush(&mut session, link.as_ref()).await?;
        match ticked {
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => tracing::debug!(error = %e, "tick error"),
            Ok(()) => {}
        }
        if session.state().is_terminal() {
            return Ok(());
        }
    }
}
