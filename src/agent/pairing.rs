//! Agent side of node pairing.
//!
//! The operator arms a window; the first request inside it is shown on the
//! terminal and waits for a yes/no. Whatever the answer, the window is used
//! up and later requests get `Pairing mode not active` until re-armed.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{info, warn};

use super::link::PairingSink;
use crate::config::PanelLinkConfig;
use crate::crypto::NodeToken;
use crate::protocol::{PairRequest, PairResponse, PairingError};

/// How long the operator has to answer a request.
pub const ANSWER_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PairingOutcome {
    Accepted,
    Rejected,
    TimedOut,
    Expired,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingState {
    Idle,
    Armed { expires_at: Instant },
    AwaitingConfirmation { expires_at: Instant },
    Settled(PairingOutcome),
}

/// Asks whoever runs the agent to confirm a request.
#[async_trait]
pub trait OperatorPrompt: Send + Sync {
    /// `Ok(true)` accepts.
    async fn confirm(&self, request: &PairRequest) -> std::io::Result<bool>;
}

/// `y` or `yes`, any case.
#[must_use]
pub fn is_affirmative(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

#[must_use]
pub fn banner(request: &PairRequest) -> String {
    format!(
        "\n========================================\n  \
         Pairing request from {}\n  \
         Code: {}\n  \
         Make sure this code matches the panel.\n\
         ========================================\n\
         Accept pairing? [y/N] ",
        request.panel_url, request.code
    )
}

/// Interactive prompt on the agent's terminal.
///
/// One task owns the input for the life of the process and forwards lines
/// over a channel, so a prompt that times out leaves no read behind. Lines
/// typed while no prompt is open are dropped before the next one waits.
pub struct StdinPrompt {
    lines: tokio::sync::Mutex<mpsc::Receiver<String>>,
}

impl StdinPrompt {
    /// Must be called inside the runtime.
    #[must_use]
    pub fn spawn() -> Self {
        Self::from_reader(tokio::io::stdin())
    }

    pub fn from_reader<R>(reader: R) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if tx.send(line).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "Failed to read operator input");
                        break;
                    }
                }
            }
        });

        Self {
            lines: tokio::sync::Mutex::new(rx),
        }
    }
}

#[async_trait]
impl OperatorPrompt for StdinPrompt {
    async fn confirm(&self, request: &PairRequest) -> std::io::Result<bool> {
        let mut lines = self.lines.lock().await;
        while lines.try_recv().is_ok() {}

        let mut stdout = tokio::io::stdout();
        stdout.write_all(banner(request).as_bytes()).await?;
        stdout.flush().await?;

        match lines.recv().await {
            Some(answer) => Ok(is_affirmative(&answer)),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "operator input closed",
            )),
        }
    }
}

struct Inner {
    state: PairingState,
    /// Bumped on every arm so stale timers and settles are ignored.
    generation: u64,
}

pub struct PairingManager {
    inner: Mutex<Inner>,
    status: watch::Sender<PairingState>,
    prompt: Arc<dyn OperatorPrompt>,
    sink: Arc<dyn PairingSink>,
    answer_timeout: Duration,
}

impl PairingManager {
    #[must_use]
    pub fn new(prompt: Arc<dyn OperatorPrompt>, sink: Arc<dyn PairingSink>) -> Self {
        Self::with_answer_timeout(prompt, sink, ANSWER_TIMEOUT)
    }

    #[must_use]
    pub fn with_answer_timeout(
        prompt: Arc<dyn OperatorPrompt>,
        sink: Arc<dyn PairingSink>,
        answer_timeout: Duration,
    ) -> Self {
        let (status, _) = watch::channel(PairingState::Idle);
        Self {
            inner: Mutex::new(Inner {
                state: PairingState::Idle,
                generation: 0,
            }),
            status,
            prompt,
            sink,
            answer_timeout,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, inner: &mut Inner, state: PairingState) {
        inner.state = state;
        self.status.send_replace(state);
    }

    #[must_use]
    pub fn state(&self) -> PairingState {
        self.lock().state
    }

    /// Watch state changes, e.g. to wait for the window to settle.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<PairingState> {
        self.status.subscribe()
    }

    /// Open a pairing window. Re-arming replaces any previous window.
    pub fn arm(self: &Arc<Self>, window: Duration) -> Instant {
        let expires_at = Instant::now() + window;
        let generation = {
            let mut inner = self.lock();
            inner.generation += 1;
            self.set_state(&mut inner, PairingState::Armed { expires_at });
            inner.generation
        };

        info!(
            event = "pairing_armed",
            window_secs = window.as_secs(),
            "Pairing mode active, waiting for the panel"
        );

        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep_until(expires_at).await;
            if let Some(manager) = weak.upgrade() {
                manager.expire(generation);
            }
        });

        expires_at
    }

    fn expire(&self, generation: u64) {
        let mut inner = self.lock();
        if inner.generation == generation && matches!(inner.state, PairingState::Armed { .. }) {
            self.set_state(&mut inner, PairingState::Settled(PairingOutcome::Expired));
            info!(event = "pairing_expired", "Pairing window elapsed without a request");
        }
    }

    /// Claim the window for one request. Returns the generation and the
    /// deadline for the operator's answer.
    fn begin(&self) -> Result<(u64, Instant), PairingError> {
        let mut inner = self.lock();
        let now = Instant::now();

        match inner.state {
            PairingState::Armed { expires_at } if now < expires_at => {
                self.set_state(
                    &mut inner,
                    PairingState::AwaitingConfirmation { expires_at },
                );
                Ok((inner.generation, (now + self.answer_timeout).min(expires_at)))
            }
            PairingState::Armed { .. } => {
                self.set_state(&mut inner, PairingState::Settled(PairingOutcome::Expired));
                Err(PairingError::NotActive)
            }
            _ => Err(PairingError::NotActive),
        }
    }

    fn settle(&self, generation: u64, outcome: PairingOutcome) {
        let mut inner = self.lock();
        if inner.generation == generation {
            self.set_state(&mut inner, PairingState::Settled(outcome));
        }
    }

    /// Handle one request from a panel.
    pub async fn handle(&self, request: PairRequest) -> Result<PairResponse, PairingError> {
        if request.code.trim().is_empty() {
            return Err(PairingError::Invalid("code is required".to_string()));
        }
        url::Url::parse(&request.panel_url)
            .map_err(|e| PairingError::Invalid(format!("panel_url: {e}")))?;

        let (generation, deadline) = self.begin()?;

        info!(
            event = "pairing_request_received",
            panel_url = %request.panel_url,
            code = %request.code,
            "Pairing request received, waiting for operator"
        );

        let answer = tokio::time::timeout_at(deadline, self.prompt.confirm(&request)).await;
        let result = match answer {
            Ok(Ok(true)) => self.issue(&request).await,
            Ok(Ok(false)) => Err(PairingError::Rejected),
            Ok(Err(e)) => {
                warn!(error = %e, "Operator prompt failed");
                Err(PairingError::Rejected)
            }
            Err(_) => Err(PairingError::TimedOut),
        };

        let outcome = match &result {
            Ok(_) => PairingOutcome::Accepted,
            Err(PairingError::Rejected) => PairingOutcome::Rejected,
            Err(PairingError::TimedOut) => PairingOutcome::TimedOut,
            Err(_) => PairingOutcome::Failed,
        };
        self.settle(generation, outcome);

        match &result {
            Ok(_) => info!(event = "pairing_accepted", panel_url = %request.panel_url, "Pairing accepted"),
            Err(e) => warn!(event = "pairing_refused", error = %e, "Pairing did not complete"),
        }

        result
    }

    async fn issue(&self, request: &PairRequest) -> Result<PairResponse, PairingError> {
        let token = NodeToken::generate();

        self.sink
            .persist(PanelLinkConfig {
                url: Some(request.panel_url.clone()),
                token: Some(token.to_header_value()),
                daemon_token: request.daemon_token.clone(),
            })
            .await
            .map_err(|e| PairingError::Persist(e.to_string()))?;

        Ok(PairResponse::accepted(token.token_id, token.secret))
    }
}
