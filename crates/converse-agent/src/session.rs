//! Session manager.
//!
//! Each session runs the generation state machine
//! `Idle -> Thinking -> Streaming -> (Complete | Error | Cancelled) -> Idle`.
//! The per-session slot is the only mutual-exclusion point: at most one turn
//! is active per session and sessions never wait on each other. The voice
//! toggle and the provider preference live beside the state machine and are
//! independent of it.
//!
//! Closing a session whose turn is still winding down keeps its slot until
//! that turn releases it, so a reopened session cannot start a second
//! generation alongside the cancelled one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{AgentError, Result};
use crate::llm::types::ProviderTarget;

/// How long a preempting request waits for the cancelled turn to wind down.
const PREEMPT_WAIT: Duration = Duration::from_secs(10);

/// What to do with a request for a session that already has an active turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusyPolicy {
    /// Fail fast with [`AgentError::SessionBusy`].
    #[default]
    Reject,
    /// Cancel the active turn, wait for it to settle, then proceed.
    Preempt,
}

/// Generation state of one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationState {
    #[default]
    Idle,
    Thinking,
    Streaming,
    Complete,
    Error,
    Cancelled,
}

impl GenerationState {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Thinking | Self::Streaming)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Error | Self::Cancelled)
    }
}

// ---------------------------------------------------------------------------
// Slots
// ---------------------------------------------------------------------------

struct ActiveTurn {
    turn_id: Uuid,
    cancel: CancellationToken,
}

struct SessionSlot {
    state: watch::Sender<GenerationState>,
    active: Mutex<Option<ActiveTurn>>,
    last_outcome: Mutex<Option<GenerationState>>,
    voice: AtomicBool,
    preference: Mutex<Option<ProviderTarget>>,
    /// Closed while a turn was active; evicted when that turn releases.
    closing: AtomicBool,
    /// No longer in the session map. Holders must look the session up again.
    evicted: AtomicBool,
}

impl SessionSlot {
    fn new() -> Self {
        let (state, _) = watch::channel(GenerationState::Idle);
        Self {
            state,
            active: Mutex::new(None),
            last_outcome: Mutex::new(None),
            voice: AtomicBool::new(false),
            preference: Mutex::new(None),
            closing: AtomicBool::new(false),
            evicted: AtomicBool::new(false),
        }
    }
}

type SlotMap = DashMap<String, Arc<SessionSlot>>;

/// Drop `slot` from the map if it is still the entry for `session_id`.
/// Called with the slot's `active` lock held.
fn evict(sessions: &SlotMap, session_id: &str, slot: &Arc<SessionSlot>) {
    slot.evicted.store(true, Ordering::SeqCst);
    sessions.remove_if(session_id, |_, current| Arc::ptr_eq(current, slot));
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Tracks generation state, voice toggles and preferences per session.
#[derive(Default)]
pub struct SessionManager {
    sessions: Arc<SlotMap>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// The live slot of `session_id`, created on first use. Using a closing
    /// session reopens it.
    fn slot(&self, session_id: &str) -> Arc<SessionSlot> {
        loop {
            let slot = Arc::clone(
                self.sessions
                    .entry(session_id.to_owned())
                    .or_insert_with(|| Arc::new(SessionSlot::new()))
                    .value(),
            );
            if slot.evicted.load(Ordering::SeqCst) {
                self.sessions
                    .remove_if(session_id, |_, current| Arc::ptr_eq(current, &slot));
                continue;
            }
            slot.closing.store(false, Ordering::SeqCst);
            return slot;
        }
    }

    /// Accept a new turn on `session_id`, moving it to `Thinking`.
    pub async fn begin_turn(&self, session_id: &str, policy: BusyPolicy) -> Result<TurnGuard> {
        loop {
            let slot = self.slot(session_id);
            // Subscribe before inspecting so a release in between is seen.
            let mut state_rx = slot.state.subscribe();
            {
                let mut active = lock(&slot.active);
                if slot.evicted.load(Ordering::SeqCst) {
                    continue;
                }
                match active.as_ref() {
                    None => {
                        let turn_id = Uuid::now_v7();
                        let cancel = CancellationToken::new();
                        *active = Some(ActiveTurn {
                            turn_id,
                            cancel: cancel.clone(),
                        });
                        slot.state.send_replace(GenerationState::Thinking);
                        tracing::debug!(session_id, %turn_id, "turn accepted");
                        return Ok(TurnGuard {
                            sessions: Arc::clone(&self.sessions),
                            slot: Arc::clone(&slot),
                            session_id: session_id.to_owned(),
                            turn_id,
                            cancel,
                            released: false,
                        });
                    }
                    Some(turn) => match policy {
                        BusyPolicy::Reject => {
                            return Err(AgentError::SessionBusy {
                                session_id: session_id.to_owned(),
                            });
                        }
                        BusyPolicy::Preempt => {
                            tracing::info!(session_id, turn_id = %turn.turn_id, "preempting active turn");
                            turn.cancel.cancel();
                        }
                    },
                }
            }

            let settled = tokio::time::timeout(
                PREEMPT_WAIT,
                state_rx.wait_for(|s| *s == GenerationState::Idle),
            )
            .await;
            if !matches!(settled, Ok(Ok(_))) {
                tracing::warn!(session_id, "preempted turn did not settle in time");
                return Err(AgentError::SessionBusy {
                    session_id: session_id.to_owned(),
                });
            }
        }
    }

    /// Cancel the active turn, if any. Returns whether one was cancelled.
    pub fn cancel(&self, session_id: &str) -> bool {
        let Some(slot) = self.sessions.get(session_id).map(|s| Arc::clone(s.value())) else {
            return false;
        };
        let active = lock(&slot.active);
        match active.as_ref() {
            Some(turn) => {
                turn.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn state(&self, session_id: &str) -> GenerationState {
        self.sessions
            .get(session_id)
            .map(|s| *s.state.borrow())
            .unwrap_or_default()
    }

    /// Terminal state of the most recent finished turn.
    pub fn last_outcome(&self, session_id: &str) -> Option<GenerationState> {
        let slot = self.sessions.get(session_id).map(|s| Arc::clone(s.value()))?;
        *lock(&slot.last_outcome)
    }

    /// Watch state changes of one session.
    pub fn subscribe(&self, session_id: &str) -> watch::Receiver<GenerationState> {
        self.slot(session_id).state.subscribe()
    }

    /// Set the voice-capture toggle, returning the previous value.
    pub fn set_voice(&self, session_id: &str, on: bool) -> bool {
        self.slot(session_id).voice.swap(on, Ordering::SeqCst)
    }

    pub fn voice(&self, session_id: &str) -> bool {
        self.sessions
            .get(session_id)
            .is_some_and(|s| s.voice.load(Ordering::SeqCst))
    }

    pub fn set_preference(&self, session_id: &str, target: Option<ProviderTarget>) {
        *lock(&self.slot(session_id).preference) = target;
    }

    pub fn preference(&self, session_id: &str) -> Option<ProviderTarget> {
        let slot = self.sessions.get(session_id).map(|s| Arc::clone(s.value()))?;
        lock(&slot.preference).clone()
    }

    /// Cancel any active turn and forget the session's voice toggle and
    /// preference. The slot itself goes once no turn holds it; until then
    /// the session still counts as busy.
    pub fn remove(&self, session_id: &str) {
        let Some(slot) = self.sessions.get(session_id).map(|s| Arc::clone(s.value())) else {
            return;
        };
        slot.voice.store(false, Ordering::SeqCst);
        *lock(&slot.preference) = None;

        let active = lock(&slot.active);
        match active.as_ref() {
            Some(turn) => {
                turn.cancel.cancel();
                slot.closing.store(true, Ordering::SeqCst);
                tracing::debug!(session_id, turn_id = %turn.turn_id, "session closing, turn still settling");
            }
            None => evict(&self.sessions, session_id, &slot),
        }
    }

    /// Sessions currently thinking or streaming.
    pub fn active_sessions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| entry.state.borrow().is_active())
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Turn guard
// ---------------------------------------------------------------------------

/// Ownership of a session's single active turn.
///
/// Finishing (or dropping) the guard passes through the terminal state and
/// back to `Idle`, which is what lets the next turn in.
pub struct TurnGuard {
    sessions: Arc<SlotMap>,
    slot: Arc<SessionSlot>,
    session_id: String,
    turn_id: Uuid,
    cancel: CancellationToken,
    released: bool,
}

impl std::fmt::Debug for TurnGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnGuard")
            .field("session_id", &self.session_id)
            .field("turn_id", &self.turn_id)
            .finish()
    }
}

impl TurnGuard {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn turn_id(&self) -> Uuid {
        self.turn_id
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// First token arrived.
    pub fn mark_streaming(&self) {
        self.slot.state.send_if_modified(|state| {
            if *state == GenerationState::Thinking {
                *state = GenerationState::Streaming;
                true
            } else {
                false
            }
        });
    }

    /// End the turn in `outcome` (a terminal state) and return to `Idle`.
    pub fn finish(mut self, outcome: GenerationState) {
        self.release(outcome);
    }

    fn release(&mut self, outcome: GenerationState) {
        if self.released {
            return;
        }
        self.released = true;
        let outcome = if outcome.is_terminal() {
            outcome
        } else {
            GenerationState::Error
        };

        let mut active = lock(&self.slot.active);
        if active.as_ref().is_some_and(|t| t.turn_id == self.turn_id) {
            *active = None;
        }
        *lock(&self.slot.last_outcome) = Some(outcome);
        self.slot.state.send_replace(outcome);
        self.slot.state.send_replace(GenerationState::Idle);
        if self.slot.closing.swap(false, Ordering::SeqCst) {
            evict(&self.sessions, &self.session_id, &self.slot);
        }
        drop(active);
        tracing::debug!(session_id = %self.session_id, turn_id = %self.turn_id, ?outcome, "turn released");
    }
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        if !self.released {
            let outcome = if self.cancel.is_cancelled() {
                GenerationState::Cancelled
            } else {
                GenerationState::Error
            };
            self.release(outcome);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn state_machine_round_trip() {
        let sessions = SessionManager::new();
        assert_eq!(sessions.state("s"), GenerationState::Idle);

        let guard = sessions.begin_turn("s", BusyPolicy::Reject).await.unwrap();
        assert_eq!(sessions.state("s"), GenerationState::Thinking);
        guard.mark_streaming();
        assert_eq!(sessions.state("s"), GenerationState::Streaming);
        assert_eq!(sessions.active_sessions(), vec!["s"]);

        guard.finish(GenerationState::Complete);
        assert_eq!(sessions.state("s"), GenerationState::Idle);
        assert_eq!(sessions.last_outcome("s"), Some(GenerationState::Complete));
        assert!(sessions.active_sessions().is_empty());
    }

    #[tokio::test]
    async fn busy_session_rejects() {
        let sessions = SessionManager::new();
        let _guard = sessions.begin_turn("s", BusyPolicy::Reject).await.unwrap();
        let err = sessions.begin_turn("s", BusyPolicy::Reject).await.unwrap_err();
        assert!(matches!(err, AgentError::SessionBusy { .. }));
        // Other sessions are unaffected.
        sessions.begin_turn("other", BusyPolicy::Reject).await.unwrap();
    }

    #[tokio::test]
    async fn preempt_cancels_and_waits_for_idle() {
        let sessions = Arc::new(SessionManager::new());
        let first = sessions.begin_turn("s", BusyPolicy::Reject).await.unwrap();
        let token = first.cancel_token();

        // The first turn winds down once it observes cancellation.
        let worker = tokio::spawn(async move {
            token.cancelled().await;
            tokio::time::sleep(Duration::from_millis(20)).await;
            first.finish(GenerationState::Cancelled);
        });

        let second = sessions.begin_turn("s", BusyPolicy::Preempt).await.unwrap();
        worker.await.unwrap();
        assert_eq!(sessions.last_outcome("s"), Some(GenerationState::Cancelled));
        assert_eq!(sessions.state("s"), GenerationState::Thinking);
        assert!(!second.is_cancelled());
    }

    #[tokio::test]
    async fn dropped_guard_releases_the_session() {
        let sessions = SessionManager::new();
        {
            let guard = sessions.begin_turn("s", BusyPolicy::Reject).await.unwrap();
            assert!(sessions.cancel("s"));
            drop(guard);
        }
        assert_eq!(sessions.state("s"), GenerationState::Idle);
        assert_eq!(sessions.last_outcome("s"), Some(GenerationState::Cancelled));
        assert!(!sessions.cancel("s"));
    }

    #[tokio::test]
    async fn voice_toggle_is_independent() {
        let sessions = SessionManager::new();
        assert!(!sessions.set_voice("s", true));
        assert!(sessions.voice("s"));
        let guard = sessions.begin_turn("s", BusyPolicy::Reject).await.unwrap();
        assert!(sessions.voice("s"));
        guard.finish(GenerationState::Complete);
        assert!(sessions.voice("s"));
        assert!(sessions.set_voice("s", false));
    }

    #[test]
    fn preference_round_trip() {
        let sessions = SessionManager::new();
        assert_eq!(sessions.preference("s"), None);
        sessions.set_preference("s", Some(ProviderTarget::new("groq", "llama")));
        assert_eq!(
            sessions.preference("s"),
            Some(ProviderTarget::new("groq", "llama"))
        );
        sessions.remove("s");
        assert_eq!(sessions.preference("s"), None);
        assert!(sessions.is_empty());
    }

    #[tokio::test]
    async fn closed_session_stays_busy_until_its_turn_settles() {
        let sessions = SessionManager::new();
        let first = sessions.begin_turn("s", BusyPolicy::Reject).await.unwrap();
        sessions.set_preference("s", Some(ProviderTarget::new("groq", "llama")));

        sessions.remove("s");
        assert!(first.is_cancelled());
        assert_eq!(sessions.preference("s"), None);
        let err = sessions.begin_turn("s", BusyPolicy::Reject).await.unwrap_err();
        assert!(matches!(err, AgentError::SessionBusy { .. }));

        first.finish(GenerationState::Cancelled);
        let second = sessions.begin_turn("s", BusyPolicy::Reject).await.unwrap();
        assert!(!second.is_cancelled());
        assert_eq!(sessions.state("s"), GenerationState::Thinking);
    }

    #[tokio::test]
    async fn closed_session_is_evicted_once_idle() {
        let sessions = SessionManager::new();
        let guard = sessions.begin_turn("s", BusyPolicy::Reject).await.unwrap();
        sessions.remove("s");
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions.state("s"), GenerationState::Thinking);

        drop(guard);
        assert!(sessions.is_empty());
        assert_eq!(sessions.state("s"), GenerationState::Idle);
    }

    #[tokio::test]
    async fn preempt_after_close_waits_for_the_old_turn() {
        let sessions = Arc::new(SessionManager::new());
        let first = sessions.begin_turn("s", BusyPolicy::Reject).await.unwrap();
        sessions.remove("s");

        let waiting = tokio::spawn({
            let sessions = Arc::clone(&sessions);
            async move { sessions.begin_turn("s", BusyPolicy::Preempt).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiting.is_finished());

        first.finish(GenerationState::Cancelled);
        let second = waiting.await.unwrap().unwrap();
        assert_eq!(sessions.last_outcome("s"), Some(GenerationState::Cancelled));
        assert_eq!(sessions.active_sessions(), vec!["s"]);
        second.finish(GenerationState::Complete);
        assert_eq!(sessions.len(), 1);
    }

    #[test]
    fn busy_policy_serde() {
        let p: BusyPolicy = serde_json::from_str("\"preempt\"").unwrap();
        assert_eq!(p, BusyPolicy::Preempt);
        assert_eq!(BusyPolicy::default(), BusyPolicy::Reject);
    }
}
