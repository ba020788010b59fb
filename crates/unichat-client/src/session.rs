//! Public session handle.
//!
//! [`SessionHandle`] is a cheap, cloneable front for the session actor. Every
//! method posts a command and, where there is an answer, awaits it on a
//! oneshot channel. Session events are published on a broadcast channel.

use tokio::sync::{broadcast, mpsc, oneshot};
use unichat_core::{
    ConnectionState, Environment, Identity, JoinOutcome, JoinStatus, LocalId, Message, RoomHandle, Session, SessionConfig,
    SessionError, SessionEvent, SupervisorState,
};
use unichat_proto::{RoomDetails, RoomId, ServerEvent};

use crate::{
    api::ChatroomApi, auth::TokenProvider, connector::HubConnector, env::SystemEnv, runtime::SessionRuntime,
};

/// Capacity of the command channel.
pub const COMMAND_CAPACITY: usize = 64;

/// Capacity of the event broadcast; slow subscribers lag beyond this.
pub const EVENT_CAPACITY: usize = 256;

/// Handler for raw server events registered with [`SessionHandle::on`].
pub type EventHandler = Box<dyn FnMut(&ServerEvent) + Send>;

/// Join waiter held by the supervisor.
pub(crate) type JoinWaiter = oneshot::Sender<JoinOutcome>;

/// Point-in-time view of the session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    /// Supervisor state
    pub state: SupervisorState,
    /// Hub connection state
    pub connection_state: ConnectionState,
    /// Current session, if authenticated
    pub session: Option<Session>,
    /// Tracked rooms
    pub rooms: Vec<RoomHandle>,
}

pub(crate) enum Command {
    Login { identity: Option<Identity>, reply: oneshot::Sender<Result<(), SessionError>> },
    Logout { reply: oneshot::Sender<()> },
    Join { room_id: RoomId, reply: JoinWaiter },
    Leave { room_id: RoomId, reply: oneshot::Sender<()> },
    Send { room_id: RoomId, text: String, reply: oneshot::Sender<Result<Message, SessionError>> },
    Resend { room_id: RoomId, local_id: LocalId, reply: oneshot::Sender<Result<Message, SessionError>> },
    Dismiss { room_id: RoomId, local_id: LocalId, reply: oneshot::Sender<Result<(), SessionError>> },
    Messages { room_id: RoomId, reply: oneshot::Sender<Option<Vec<Message>>> },
    RoomDetails { room_id: RoomId, reply: oneshot::Sender<Option<RoomDetails>> },
    Snapshot { reply: oneshot::Sender<SessionSnapshot> },
    On { event: String, handler: EventHandler },
    Off { event: String },
    Shutdown,
}

/// Handle to a running session actor.
///
/// Dropping every handle stops the actor and closes the hub connection.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionHandle {
    /// Spawn a session actor on the current tokio runtime.
    pub fn spawn<P, C, A>(config: SessionConfig, tokens: P, connector: C, api: A) -> Self
    where
        P: TokenProvider,
        C: HubConnector,
        A: ChatroomApi,
    {
        Self::spawn_with_env(SystemEnv, config, tokens, connector, api)
    }

    /// Spawn a session actor reading time from `env`.
    pub fn spawn_with_env<E, P, C, A>(env: E, config: SessionConfig, tokens: P, connector: C, api: A) -> Self
    where
        E: Environment,
        P: TokenProvider,
        C: HubConnector,
        A: ChatroomApi,
    {
        let (commands, receiver) = mpsc::channel(COMMAND_CAPACITY);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let runtime = SessionRuntime::new(env, config, tokens, connector, api, receiver, events.clone());
        tokio::spawn(runtime.run());

        Self { commands, events }
    }

    /// Subscribe to session events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Log in. With no `identity`, the user is read from the credential.
    ///
    /// Returns once the login has started; watch [`SessionEvent::StateChanged`]
    /// for `Active`.
    pub async fn login(&self, identity: Option<Identity>) -> Result<(), SessionError> {
        self.request(|reply| Command::Login { identity, reply }).await?
    }

    /// Log out, releasing every room and closing the hub connection.
    pub async fn logout(&self) -> Result<(), SessionError> {
        self.request(|reply| Command::Logout { reply }).await
    }

    /// Join a room. Concurrent joins of the same room share one call.
    pub async fn join(&self, room_id: RoomId) -> Result<JoinStatus, SessionError> {
        self.request(|reply| Command::Join { room_id, reply }).await?
    }

    /// Leave a room. Never fails while the session is running.
    pub async fn leave(&self, room_id: RoomId) -> Result<(), SessionError> {
        self.request(|reply| Command::Leave { room_id, reply }).await
    }

    /// Send a message. The returned entry is Pending.
    pub async fn send(&self, room_id: RoomId, text: impl Into<String>) -> Result<Message, SessionError> {
        let text = text.into();
        self.request(|reply| Command::Send { room_id, text, reply }).await?
    }

    /// Send a Rejected message again.
    pub async fn resend(&self, room_id: RoomId, local_id: LocalId) -> Result<Message, SessionError> {
        self.request(|reply| Command::Resend { room_id, local_id, reply }).await?
    }

    /// Remove a Rejected message.
    pub async fn dismiss(&self, room_id: RoomId, local_id: LocalId) -> Result<(), SessionError> {
        self.request(|reply| Command::Dismiss { room_id, local_id, reply }).await?
    }

    /// Message list of an open room, newest first.
    pub async fn messages(&self, room_id: RoomId) -> Result<Option<Vec<Message>>, SessionError> {
        self.request(|reply| Command::Messages { room_id, reply }).await
    }

    /// Name, description and members of an open room, as last loaded.
    pub async fn room_details(&self, room_id: RoomId) -> Result<Option<RoomDetails>, SessionError> {
        self.request(|reply| Command::RoomDetails { room_id, reply }).await
    }

    /// Current session state.
    pub async fn snapshot(&self) -> Result<SessionSnapshot, SessionError> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    /// Register `handler` for a server event name, replacing any previous
    /// handler for that name.
    pub async fn on(
        &self,
        event: impl Into<String>,
        handler: impl FnMut(&ServerEvent) + Send + 'static,
    ) -> Result<(), SessionError> {
        self.post(Command::On { event: event.into(), handler: Box::new(handler) }).await
    }

    /// Remove the handler for a server event name.
    pub async fn off(&self, event: impl Into<String>) -> Result<(), SessionError> {
        self.post(Command::Off { event: event.into() }).await
    }

    /// Stop the actor. The hub connection is closed.
    pub async fn shutdown(&self) {
        // Already stopped if the send fails
        let _ = self.commands.send(Command::Shutdown).await;
    }

    async fn post(&self, command: Command) -> Result<(), SessionError> {
        self.commands.send(command).await.map_err(|_| SessionError::SessionClosed)
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, SessionError> {
        let (reply, response) = oneshot::channel();
        self.post(command(reply)).await?;
        response.await.map_err(|_| SessionError::SessionClosed)
    }
}
