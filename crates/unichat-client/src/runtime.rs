//! Session actor.
//!
//! Owns the [`SessionSupervisor`] and executes its actions. Slow work (token
//! calls, opening the transport, history fetches) runs in spawned tasks that
//! post their results back on an internal channel, so the loop never blocks
//! on the network and every state change happens on one task.
//!
//! Results carry the epoch or transport generation they were started under.
//! A result from an earlier epoch (before a logout) or an earlier transport
//! is dropped.

use std::{collections::VecDeque, sync::Arc};

use tokio::{
    sync::{broadcast, mpsc},
    time::MissedTickBehavior,
};
use tracing::{debug, info, trace, warn};
use unichat_core::{
    AuthError, Credential, Environment, HandlerRegistry, SessionAction, SessionConfig, SessionEvent,
    SessionSupervisor, TransportFailure,
};
use unichat_proto::{RoomDetails, RoomId};

use crate::{
    api::{ApiError, ChatroomApi},
    auth::TokenProvider,
    connector::{HubConnector, HubLink},
    session::{Command, EventHandler, JoinWaiter, SessionSnapshot},
};

type Action = SessionAction<JoinWaiter>;

/// Results posted back by spawned tasks.
enum Internal {
    TokenAcquired { epoch: u64, result: Result<Option<Credential>, AuthError> },
    TokenRefreshed { epoch: u64, result: Result<Credential, AuthError> },
    TransportOpened { generation: u64, result: Result<HubLink, TransportFailure> },
    HistoryFetched { epoch: u64, room_id: RoomId, result: Result<RoomDetails, ApiError> },
}

pub(crate) struct SessionRuntime<E: Environment, P, C, A> {
    env: E,
    supervisor: SessionSupervisor<E::Instant, JoinWaiter>,
    tokens: Arc<P>,
    connector: Arc<C>,
    api: Arc<A>,
    commands: mpsc::Receiver<Command>,
    results_tx: mpsc::UnboundedSender<Internal>,
    results_rx: mpsc::UnboundedReceiver<Internal>,
    events: broadcast::Sender<SessionEvent>,
    handlers: HandlerRegistry<EventHandler>,
    link: Option<HubLink>,
    generation: u64,
    epoch: u64,
}

impl<E, P, C, A> SessionRuntime<E, P, C, A>
where
    E: Environment,
    P: TokenProvider,
    C: HubConnector,
    A: ChatroomApi,
{
    pub(crate) fn new(
        env: E,
        config: SessionConfig,
        tokens: P,
        connector: C,
        api: A,
        commands: mpsc::Receiver<Command>,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        let supervisor = SessionSupervisor::new(config, env.now());
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        Self {
            env,
            supervisor,
            tokens: Arc::new(tokens),
            connector: Arc::new(connector),
            api: Arc::new(api),
            commands,
            results_tx,
            results_rx,
            events,
            handlers: HandlerRegistry::new(),
            link: None,
            generation: 0,
            epoch: 0,
        }
    }

    /// Run until shutdown or until every handle is dropped.
    pub(crate) async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.supervisor.config().tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command).await,
                },

                Some(result) = self.results_rx.recv() => self.handle_result(result).await,

                frame = next_frame(&mut self.link) => match frame {
                    Some(Ok(text)) => {
                        let actions = self.supervisor.frame_received(&text, self.env.now());
                        self.execute(actions).await;
                    },
                    Some(Err(failure)) => self.lose_transport(failure).await,
                    None => self.lose_transport(TransportFailure::Network("transport closed".into())).await,
                },

                _ = ticker.tick() => {
                    let actions = self.supervisor.tick(self.env.now());
                    self.execute(actions).await;
                },
            }
        }

        let actions = self.supervisor.logout();
        self.execute(actions).await;
        info!("session actor stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        let now = self.env.now();
        match command {
            Command::Login { identity, reply } => match self.supervisor.login(identity) {
                Ok(actions) => {
                    self.epoch += 1;
                    let _ = reply.send(Ok(()));
                    self.execute(actions).await;
                },
                Err(err) => {
                    let _ = reply.send(Err(err));
                },
            },
            Command::Logout { reply } => {
                let actions = self.supervisor.logout();
                self.execute(actions).await;
                let _ = reply.send(());
            },
            Command::Join { room_id, reply } => {
                let actions = self.supervisor.join(room_id, reply, now);
                self.execute(actions).await;
            },
            Command::Leave { room_id, reply } => {
                let actions = self.supervisor.leave(room_id, now);
                self.execute(actions).await;
                let _ = reply.send(());
            },
            Command::Send { room_id, text, reply } => {
                match self.supervisor.send(room_id, &text, now, self.env.wall_clock()) {
                    Ok((message, actions)) => {
                        let _ = reply.send(Ok(message));
                        self.execute(actions).await;
                    },
                    Err(err) => {
                        let _ = reply.send(Err(err));
                    },
                }
            },
            Command::Resend { room_id, local_id, reply } => {
                match self.supervisor.resend(room_id, local_id, now, self.env.wall_clock()) {
                    Ok((message, actions)) => {
                        let _ = reply.send(Ok(message));
                        self.execute(actions).await;
                    },
                    Err(err) => {
                        let _ = reply.send(Err(err));
                    },
                }
            },
            Command::Dismiss { room_id, local_id, reply } => match self.supervisor.dismiss(room_id, local_id) {
                Ok(actions) => {
                    let _ = reply.send(Ok(()));
                    self.execute(actions).await;
                },
                Err(err) => {
                    let _ = reply.send(Err(err));
                },
            },
            Command::Messages { room_id, reply } => {
                let _ = reply.send(self.supervisor.messages(room_id));
            },
            Command::RoomDetails { room_id, reply } => {
                let _ = reply.send(self.supervisor.room_details(room_id).cloned());
            },
            Command::Snapshot { reply } => {
                let _ = reply.send(SessionSnapshot {
                    state: self.supervisor.state(),
                    connection_state: self.supervisor.connection_state(),
                    session: self.supervisor.session(),
                    rooms: self.supervisor.rooms(),
                });
            },
            Command::On { event, handler } => {
                if self.handlers.on(event.as_str(), handler).is_some() {
                    debug!(%event, "handler replaced");
                }
            },
            Command::Off { event } => {
                self.handlers.off(&event);
            },
            // Handled by the loop
            Command::Shutdown => {},
        }
    }

    async fn handle_result(&mut self, result: Internal) {
        let now = self.env.now();
        let actions = match result {
            Internal::TokenAcquired { epoch, result } if epoch == self.epoch => {
                self.supervisor.token_acquired(result, now, self.env.wall_clock())
            },
            Internal::TokenRefreshed { epoch, result } if epoch == self.epoch => {
                self.supervisor.token_refreshed(result, now)
            },
            Internal::TransportOpened { generation, result } if generation == self.generation => match result {
                Ok(link) => {
                    self.link = Some(link);
                    self.supervisor.transport_opened(now)
                },
                Err(failure) => self.supervisor.transport_failed(failure, now),
            },
            Internal::HistoryFetched { epoch, room_id, result } if epoch == self.epoch => match result {
                Ok(details) => self.supervisor.load_history(room_id, &details).unwrap_or_else(|err| {
                    debug!(room_id, %err, "history arrived for a closed room");
                    Vec::new()
                }),
                Err(err) => {
                    warn!(room_id, %err, "history fetch failed");
                    Vec::new()
                },
            },
            _ => {
                trace!("stale task result dropped");
                Vec::new()
            },
        };
        self.execute(actions).await;
    }

    async fn lose_transport(&mut self, failure: TransportFailure) {
        warn!(%failure, "transport lost");
        self.drop_link();
        let actions = self.supervisor.transport_failed(failure, self.env.now());
        self.execute(actions).await;
    }

    fn drop_link(&mut self) {
        self.link = None;
        self.generation += 1;
    }

    async fn execute(&mut self, actions: Vec<Action>) {
        let mut queue = VecDeque::from(actions);
        while let Some(action) = queue.pop_front() {
            match action {
                SessionAction::AcquireToken { delay } => {
                    let tokens = Arc::clone(&self.tokens);
                    let results = self.results_tx.clone();
                    let epoch = self.epoch;
                    tokio::spawn(async move {
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                        let result = tokens.get_token().await;
                        let _ = results.send(Internal::TokenAcquired { epoch, result });
                    });
                },
                SessionAction::RefreshToken { delay } => {
                    let tokens = Arc::clone(&self.tokens);
                    let results = self.results_tx.clone();
                    let epoch = self.epoch;
                    tokio::spawn(async move {
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                        let result = tokens.refresh_token().await;
                        let _ = results.send(Internal::TokenRefreshed { epoch, result });
                    });
                },
                SessionAction::OpenTransport { url, credential } => {
                    self.drop_link();
                    let connector = Arc::clone(&self.connector);
                    let results = self.results_tx.clone();
                    let generation = self.generation;
                    debug!(%url, generation, "opening transport");
                    tokio::spawn(async move {
                        let result = connector.connect(&url, &credential).await;
                        let _ = results.send(Internal::TransportOpened { generation, result });
                    });
                },
                SessionAction::SendFrame(text) => {
                    let sent = match &self.link {
                        Some(link) => link.outgoing.send(text).await.is_ok(),
                        None => false,
                    };
                    if !sent {
                        self.drop_link();
                        let failure = TransportFailure::Network("transport not writable".into());
                        queue.extend(self.supervisor.transport_failed(failure, self.env.now()));
                    }
                },
                SessionAction::CloseTransport => self.drop_link(),
                SessionAction::FetchHistory { room_id } => {
                    let Some(credential) = self.supervisor.credential().cloned() else {
                        continue;
                    };
                    let api = Arc::clone(&self.api);
                    let results = self.results_tx.clone();
                    let epoch = self.epoch;
                    tokio::spawn(async move {
                        let result = api.fetch_room(room_id, &credential).await;
                        let _ = results.send(Internal::HistoryFetched { epoch, room_id, result });
                    });
                },
                SessionAction::ResolveJoin { waiters, outcome } => {
                    for waiter in waiters {
                        let _ = waiter.send(outcome.clone());
                    }
                },
                SessionAction::Dispatch(event) => {
                    if let Some(handler) = self.handlers.get_mut(event.name()) {
                        handler(&event);
                    }
                },
                SessionAction::Emit(event) => {
                    if let SessionEvent::LoggedOut { .. } = event {
                        self.epoch += 1;
                    }
                    // No subscribers is fine
                    let _ = self.events.send(event);
                },
            }
        }
    }
}

async fn next_frame(link: &mut Option<HubLink>) -> Option<Result<String, TransportFailure>> {
    match link {
        Some(link) => link.incoming.recv().await,
        None => std::future::pending().await,
    }
}
