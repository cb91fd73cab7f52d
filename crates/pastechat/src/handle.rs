//! Runs a [`SessionController`] on its own task so several callers can drive
//! one session. Commands are applied one at a time in the order they were
//! sent; notifications are forwarded as soon as they are ready.

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use crate::controller::{Notification, SessionController};
use crate::error::{HandleError, SessionError};
use crate::relay::{ChannelState, TranscriptEntry};
use crate::session::{Role, SessionState};
use crate::transport::TransportFactory;

const COMMAND_QUEUE_DEPTH: usize = 32;

type Reply = oneshot::Sender<Result<(), SessionError>>;

enum Command {
    CreateOffer(Reply),
    CreateAnswer(String, Reply),
    SetRemote(String, Reply),
    AddCandidate(String, Reply),
    SendMessage(String, Reply),
    Reset(oneshot::Sender<()>),
    Snapshot(oneshot::Sender<SessionSnapshot>),
}

/// Point-in-time view of the session owned by the actor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub role: Option<Role>,
    pub channel: ChannelState,
    pub transcript: Vec<TranscriptEntry>,
}

#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
}

impl SessionHandle {
    /// Spawns the session task. It stops once every handle is dropped.
    pub fn spawn<F>(factory: F) -> (Self, mpsc::UnboundedReceiver<Notification>)
    where
        F: TransportFactory + 'static,
    {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let controller = SessionController::new(factory);
        tokio::spawn(run(controller, commands_rx, notify_tx));
        (
            Self {
                commands: commands_tx,
            },
            notify_rx,
        )
    }

    pub async fn create_offer(&self) -> Result<(), HandleError> {
        self.request(Command::CreateOffer).await
    }

    pub async fn create_answer(&self, remote_offer_text: &str) -> Result<(), HandleError> {
        let text = remote_offer_text.to_owned();
        self.request(|reply| Command::CreateAnswer(text, reply)).await
    }

    pub async fn set_remote(&self, remote_description_text: &str) -> Result<(), HandleError> {
        let text = remote_description_text.to_owned();
        self.request(|reply| Command::SetRemote(text, reply)).await
    }

    pub async fn add_candidate(&self, candidate_text: &str) -> Result<(), HandleError> {
        let text = candidate_text.to_owned();
        self.request(|reply| Command::AddCandidate(text, reply)).await
    }

    pub async fn send_message(&self, text: &str) -> Result<(), HandleError> {
        let text = text.to_owned();
        self.request(|reply| Command::SendMessage(text, reply)).await
    }

    pub async fn reset(&self) -> Result<(), HandleError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Reset(tx))
            .await
            .map_err(|_| HandleError::Stopped)?;
        rx.await.map_err(|_| HandleError::Stopped)
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot, HandleError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Snapshot(tx))
            .await
            .map_err(|_| HandleError::Stopped)?;
        rx.await.map_err(|_| HandleError::Stopped)
    }

    async fn request(&self, build: impl FnOnce(Reply) -> Command) -> Result<(), HandleError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .await
            .map_err(|_| HandleError::Stopped)?;
        rx.await.map_err(|_| HandleError::Stopped)??;
        Ok(())
    }
}

async fn run<F: TransportFactory>(
    mut controller: SessionController<F>,
    mut commands: mpsc::Receiver<Command>,
    notify: mpsc::UnboundedSender<Notification>,
) {
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(command) => apply(&mut controller, command).await,
                None => break,
            },
            Some(notification) = controller.next_notification() => {
                trace!(?notification, "forwarding notification");
                if notify.send(notification).is_err() {
                    trace!("notification receiver dropped");
                }
            }
        }
    }
    debug!("all session handles dropped; shutting down");
    controller.reset().await;
}

async fn apply<F: TransportFactory>(controller: &mut SessionController<F>, command: Command) {
    // A caller that gave up on its reply is not an error for the session.
    match command {
        Command::CreateOffer(reply) => {
            let _ = reply.send(controller.create_offer().await);
        }
        Command::CreateAnswer(text, reply) => {
            let _ = reply.send(controller.create_answer(&text).await);
        }
        Command::SetRemote(text, reply) => {
            let _ = reply.send(controller.set_remote(&text).await);
        }
        Command::AddCandidate(text, reply) => {
            let _ = reply.send(controller.add_candidate(&text).await);
        }
        Command::SendMessage(text, reply) => {
            let _ = reply.send(controller.send_message(&text).await);
        }
        Command::Reset(reply) => {
            controller.reset().await;
            let _ = reply.send(());
        }
        Command::Snapshot(reply) => {
            let _ = reply.send(SessionSnapshot {
                state: controller.state(),
                role: controller.role(),
                channel: controller.channel_state(),
                transcript: controller.transcript().to_vec(),
            });
        }
    }
}
