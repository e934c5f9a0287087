//! Per-relay connection task.
//!
//! One tokio task owns the transport link, the subscription multiplexer and
//! the publish acks for a single relay. Reconnects with exponential backoff,
//! replays pending wire subscriptions on transport-up, and terminates for
//! good when the relay is removed or blacklisted.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::error::{Error, Result};
use crate::event::{Event, EventId};
use crate::message::{ClientMessage, RelayMessage, parse_relay_message};
use crate::transport::{Transport, TransportSink};
use crate::verification::{Verification, VerificationSampler};

use super::multiplexer::Multiplexer;
use super::pool::PoolNotification;
use super::subscription::{SubscriptionCore, SubscriptionId};
use super::{RelayStatus, RelayUrl};

const COMMAND_BUFFER: usize = 64;

#[derive(Debug, Clone)]
pub(crate) struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub connect_timeout: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

struct Backoff {
    policy: ReconnectPolicy,
    attempt: u32,
}

impl Backoff {
    fn new(policy: ReconnectPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    fn next(&mut self) -> Duration {
        let exp = self
            .policy
            .initial_delay
            .saturating_mul(1u32 << self.attempt.min(16));
        let delay = exp.min(self.policy.max_delay);
        self.attempt = self.attempt.saturating_add(1);
        // Up to 25% jitter so a fleet of clients does not reconnect in sync.
        let jitter_ms = rand::thread_rng().gen_range(0..=delay.as_millis() as u64 / 4);
        delay + Duration::from_millis(jitter_ms)
    }

    fn reset(&mut self) {
        self.attempt = 0;
    }
}

pub(crate) enum RelayCommand {
    Subscribe(Arc<SubscriptionCore>),
    Unsubscribe(SubscriptionId),
    Publish {
        event: Box<Event>,
        ack: oneshot::Sender<Result<()>>,
    },
    Disconnect,
}

/// Cloneable handle to one relay's connection task.
#[derive(Clone)]
pub struct Relay {
    url: RelayUrl,
    commands: mpsc::Sender<RelayCommand>,
    status: watch::Receiver<RelayStatus>,
}

impl Relay {
    pub(crate) fn spawn(
        url: RelayUrl,
        transport: Arc<dyn Transport>,
        sampler: Arc<VerificationSampler>,
        notifications: broadcast::Sender<PoolNotification>,
        policy: ReconnectPolicy,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        let (status_tx, status_rx) = watch::channel(RelayStatus::Disconnected);
        let state = TaskState {
            url: url.clone(),
            transport,
            sampler,
            mux: Multiplexer::new(url.clone()),
            status: status_tx,
            notifications,
            acks: HashMap::new(),
        };
        tokio::spawn(run(state, commands_rx, policy));
        Self {
            url,
            commands: commands_tx,
            status: status_rx,
        }
    }

    pub fn url(&self) -> &RelayUrl {
        &self.url
    }

    pub fn status(&self) -> RelayStatus {
        *self.status.borrow()
    }

    pub(crate) async fn subscribe(&self, core: Arc<SubscriptionCore>) -> bool {
        self.commands
            .send(RelayCommand::Subscribe(core))
            .await
            .is_ok()
    }

    pub(crate) async fn unsubscribe(&self, id: SubscriptionId) {
        let _ = self.commands.send(RelayCommand::Unsubscribe(id)).await;
    }

    /// Queue a publish; the returned channel resolves with the relay's OK
    /// verdict (or a transport error).
    pub(crate) async fn publish(&self, event: Event) -> Result<oneshot::Receiver<Result<()>>> {
        let (ack, ack_rx) = oneshot::channel();
        self.commands
            .send(RelayCommand::Publish {
                event: Box::new(event),
                ack,
            })
            .await
            .map_err(|_| Error::TransportClosed)?;
        Ok(ack_rx)
    }

    pub(crate) async fn disconnect(&self) {
        let _ = self.commands.send(RelayCommand::Disconnect).await;
    }
}

enum LoopControl {
    Continue,
    Reconnect,
    Terminate,
}

struct TaskState {
    url: RelayUrl,
    transport: Arc<dyn Transport>,
    sampler: Arc<VerificationSampler>,
    mux: Multiplexer,
    status: watch::Sender<RelayStatus>,
    notifications: broadcast::Sender<PoolNotification>,
    acks: HashMap<EventId, oneshot::Sender<Result<()>>>,
}

async fn run(mut state: TaskState, mut commands: mpsc::Receiver<RelayCommand>, policy: ReconnectPolicy) {
    let mut backoff = Backoff::new(policy.clone());

    'session: loop {
        state.set_status(RelayStatus::Connecting);
        let connect = tokio::time::timeout(policy.connect_timeout, state.transport.connect(&state.url));
        let (mut sink, mut stream) = match connect.await {
            Ok(Ok(link)) => link,
            Ok(Err(e)) => {
                log::warn!("connect to {} failed: {e}", state.url);
                state.set_status(RelayStatus::Disconnected);
                if !wait_retry(&mut state, &mut commands, backoff.next()).await {
                    break 'session;
                }
                continue 'session;
            }
            Err(_) => {
                log::warn!("connect to {} timed out", state.url);
                state.set_status(RelayStatus::Disconnected);
                if !wait_retry(&mut state, &mut commands, backoff.next()).await {
                    break 'session;
                }
                continue 'session;
            }
        };
        backoff.reset();
        state.set_status(RelayStatus::Connected);

        let mut control = LoopControl::Continue;
        for frame in state.mux.prepare_replay() {
            if sink.send(frame.to_json()).await.is_err() {
                control = LoopControl::Reconnect;
                break;
            }
        }

        loop {
            match control {
                LoopControl::Continue => {}
                LoopControl::Reconnect => break,
                LoopControl::Terminate => {
                    sink.close().await;
                    state.terminate();
                    return;
                }
            }
            control = tokio::select! {
                cmd = commands.recv() => match cmd {
                    None => LoopControl::Terminate,
                    Some(cmd) => state.handle_command(cmd, &mut sink).await,
                },
                frame = stream.recv() => match frame {
                    Ok(Some(text)) => state.handle_frame(&text, &mut sink).await,
                    Ok(None) => {
                        log::info!("relay {} closed the connection", state.url);
                        LoopControl::Reconnect
                    }
                    Err(e) => {
                        log::warn!("relay {} transport error: {e}", state.url);
                        LoopControl::Reconnect
                    }
                },
            };
        }

        state.on_link_down();
        if !wait_retry(&mut state, &mut commands, backoff.next()).await {
            break 'session;
        }
    }

    state.terminate();
}

/// Sleep out the backoff while staying responsive to commands.
/// Returns false when the task should terminate.
async fn wait_retry(
    state: &mut TaskState,
    commands: &mut mpsc::Receiver<RelayCommand>,
    delay: Duration,
) -> bool {
    let deadline = tokio::time::Instant::now() + delay;
    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => return true,
            cmd = commands.recv() => match cmd {
                None => return false,
                Some(cmd) => {
                    if !state.handle_offline_command(cmd) {
                        return false;
                    }
                }
            },
        }
    }
}

impl TaskState {
    fn set_status(&self, status: RelayStatus) {
        let changed = *self.status.borrow() != status;
        let _ = self.status.send(status);
        if changed {
            let _ = self.notifications.send(PoolNotification::Status {
                relay: self.url.clone(),
                status,
            });
        }
    }

    fn on_link_down(&mut self) {
        self.set_status(RelayStatus::Disconnected);
        self.mux.on_disconnected();
        for (_, ack) in self.acks.drain() {
            let _ = ack.send(Err(Error::TransportClosed));
        }
    }

    fn terminate(&mut self) {
        self.mux.terminate();
        for (_, ack) in self.acks.drain() {
            let _ = ack.send(Err(Error::TransportClosed));
        }
        self.set_status(RelayStatus::Terminated);
    }

    /// Commands arriving while there is no link. Returns false on
    /// `Disconnect`.
    fn handle_offline_command(&mut self, cmd: RelayCommand) -> bool {
        match cmd {
            RelayCommand::Subscribe(core) => {
                self.mux.register(core);
                true
            }
            RelayCommand::Unsubscribe(id) => {
                self.mux.remove(&id);
                true
            }
            RelayCommand::Publish { ack, .. } => {
                let _ = ack.send(Err(Error::TransportClosed));
                true
            }
            RelayCommand::Disconnect => false,
        }
    }

    async fn handle_command(
        &mut self,
        cmd: RelayCommand,
        sink: &mut Box<dyn TransportSink>,
    ) -> LoopControl {
        match cmd {
            RelayCommand::Subscribe(core) => {
                let frames = self.mux.register(core);
                self.send_frames(sink, frames).await
            }
            RelayCommand::Unsubscribe(id) => {
                let frames = self.mux.remove(&id);
                self.send_frames(sink, frames).await
            }
            RelayCommand::Publish { event, ack } => {
                let id = event.id;
                let frame = ClientMessage::Event(event).to_json();
                if sink.send(frame).await.is_err() {
                    let _ = ack.send(Err(Error::TransportClosed));
                    return LoopControl::Reconnect;
                }
                if let Some(stale) = self.acks.insert(id, ack) {
                    let _ = stale.send(Err(Error::Cancelled));
                }
                LoopControl::Continue
            }
            RelayCommand::Disconnect => LoopControl::Terminate,
        }
    }

    async fn handle_frame(
        &mut self,
        text: &str,
        sink: &mut Box<dyn TransportSink>,
    ) -> LoopControl {
        let message = match parse_relay_message(text) {
            Ok(message) => message,
            Err(e) if e.claims_event => {
                // A frame that claims an event but does not parse counts
                // against the relay like a bad signature.
                if self.sampler.record_malformed(&self.url) {
                    let _ = self.notifications.send(PoolNotification::RelayBlacklisted {
                        relay: self.url.clone(),
                    });
                    return LoopControl::Terminate;
                }
                return LoopControl::Continue;
            }
            Err(e) => {
                log::debug!("relay {} sent unparseable frame: {}", self.url, e.reason);
                return LoopControl::Continue;
            }
        };

        match message {
            RelayMessage::Event {
                subscription_id,
                event,
            } => self.handle_event(&subscription_id, *event),
            RelayMessage::EndOfStoredEvents { subscription_id } => {
                let frames = self.mux.handle_eose(&subscription_id);
                self.send_frames(sink, frames).await
            }
            RelayMessage::Ok {
                event_id,
                accepted,
                message,
            } => {
                if let Some(ack) = self.acks.remove(&event_id) {
                    let result = if accepted {
                        Ok(())
                    } else {
                        Err(Error::from_ok_message(&message))
                    };
                    let _ = ack.send(result);
                }
                LoopControl::Continue
            }
            RelayMessage::Notice { message } => {
                log::info!("relay {} notice: {message}", self.url);
                let _ = self.notifications.send(PoolNotification::Notice {
                    relay: self.url.clone(),
                    message,
                });
                LoopControl::Continue
            }
            RelayMessage::Closed {
                subscription_id,
                reason,
            } => {
                self.mux.handle_closed(&subscription_id, &reason);
                LoopControl::Continue
            }
        }
    }

    fn handle_event(&mut self, wire_id: &str, event: Event) -> LoopControl {
        let verdict = self.sampler.inspect(&self.url, &event);
        if verdict == Verification::Invalid {
            if self.sampler.is_blacklisted(&self.url) {
                let _ = self.notifications.send(PoolNotification::RelayBlacklisted {
                    relay: self.url.clone(),
                });
                // Tear the connection down before the relay can deliver
                // anything else.
                return LoopControl::Terminate;
            }
            return LoopControl::Continue;
        }
        if !self.sampler.should_deliver(verdict) {
            return LoopControl::Continue;
        }
        let members = self.mux.route(wire_id);
        if members.is_empty() {
            return LoopControl::Continue;
        }
        for core in &members {
            core.deliver(&self.url, &event);
        }
        let _ = self.notifications.send(PoolNotification::Event {
            relay: self.url.clone(),
            event,
        });
        LoopControl::Continue
    }

    async fn send_frames(
        &mut self,
        sink: &mut Box<dyn TransportSink>,
        frames: Vec<ClientMessage>,
    ) -> LoopControl {
        for frame in frames {
            if sink.send(frame.to_json()).await.is_err() {
                return LoopControl::Reconnect;
            }
        }
        LoopControl::Continue
    }
}
