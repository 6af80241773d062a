//! Shared fakes for integration tests.
//!
//! Scripted providers replay queued results and fall back to a fixed
//! answer once the queue is empty. Everything runs against an in-memory
//! SQLite store and a manual clock, so no test waits on real time.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::Notify;
use uuid::Uuid;

use voxnote::adapters::{
    AnalysisProvider, AudioPayload, BlobStore, Completion, CompletionOptions, Prompt,
    ProviderError, TranscribeOptions, TranscriptionProvider,
};
use voxnote::core::{ManualClock, NoJitter, Orchestrator, OrchestratorSettings};
use voxnote::domain::{AudioRef, Note, NoteEvent, NoteUpdate};
use voxnote::store::{
    Claim, ClaimRequest, EligibilityFilter, NoteStore, OwnerUsage, PriorNote, SqliteNoteStore,
    StoreError,
};

pub const TRANSCRIPT: &str = "Call the dentist tomorrow and finish the quarterly report.";

pub const VALID_ANALYSIS: &str = r#"{
  "title": "Dentist and report",
  "summary": "Two errands: book the dentist and finish the quarterly report.",
  "sentiment": {"mood": "neutral", "score": 0.1},
  "topics": {"primary": "errands", "secondary": ["health", "work"], "domain": "personal"},
  "tasks": [
    {"description": "Call the dentist", "urgency": "medium", "due": "tomorrow"},
    {"description": "Finish the quarterly report", "urgency": "high"}
  ],
  "key_ideas": ["Health appointments slip when not booked early"],
  "draft_messages": [],
  "cross_references": []
}"#;

/// Fixed start time for the manual clock
pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
}

/// Blocks a provider call until released, and says when it was entered
#[derive(Clone, Default)]
pub struct Gate {
    pub entered: Arc<Notify>,
    pub release: Arc<Notify>,
}

/// Speech-to-text fake
pub struct ScriptedTranscriber {
    script: Mutex<VecDeque<Result<String, ProviderError>>>,
    fallback: Mutex<Result<String, ProviderError>>,
    failing_audio: Mutex<HashSet<Vec<u8>>>,
    gate: Mutex<Option<Gate>>,
    calls: AtomicU32,
}

impl ScriptedTranscriber {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(Ok(TRANSCRIPT.to_string())),
            failing_audio: Mutex::new(HashSet::new()),
            gate: Mutex::new(None),
            calls: AtomicU32::new(0),
        }
    }

    pub fn push(&self, result: Result<String, ProviderError>) {
        self.script.lock().unwrap().push_back(result);
    }

    pub fn set_fallback(&self, result: Result<String, ProviderError>) {
        *self.fallback.lock().unwrap() = result;
    }

    /// Audio with exactly these bytes always fails as an unreadable file
    pub fn fail_audio(&self, bytes: &[u8]) {
        self.failing_audio.lock().unwrap().insert(bytes.to_vec());
    }

    pub fn hold(&self) -> Gate {
        let gate = Gate::default();
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TranscriptionProvider for ScriptedTranscriber {
    fn name(&self) -> &str {
        "scripted-transcriber"
    }

    async fn transcribe(
        &self,
        audio: &AudioPayload,
        _options: &TranscribeOptions,
    ) -> Result<String, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }

        if self.failing_audio.lock().unwrap().contains(&audio.bytes) {
            return Err(ProviderError::invalid_file("audio could not be decoded"));
        }

        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| self.fallback.lock().unwrap().clone())
    }
}

/// LLM fake
pub struct ScriptedAnalyzer {
    script: Mutex<VecDeque<Result<Completion, ProviderError>>>,
    fallback: Mutex<Result<Completion, ProviderError>>,
    prompts: Mutex<Vec<Prompt>>,
    calls: AtomicU32,
}

impl ScriptedAnalyzer {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(Ok(completion(VALID_ANALYSIS, 420))),
            prompts: Mutex::new(Vec::new()),
            calls: AtomicU32::new(0),
        }
    }

    pub fn push(&self, result: Result<Completion, ProviderError>) {
        self.script.lock().unwrap().push_back(result);
    }

    pub fn set_fallback(&self, result: Result<Completion, ProviderError>) {
        *self.fallback.lock().unwrap() = result;
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_prompt(&self) -> Option<Prompt> {
        self.prompts.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl AnalysisProvider for ScriptedAnalyzer {
    fn name(&self) -> &str {
        "scripted-analyzer"
    }

    async fn complete(
        &self,
        prompt: &Prompt,
        _options: &CompletionOptions,
    ) -> Result<Completion, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(prompt.clone());

        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| self.fallback.lock().unwrap().clone())
    }
}

pub fn completion(text: &str, tokens: u64) -> Completion {
    Completion {
        text: text.to_string(),
        tokens_used: Some(tokens),
    }
}

/// Blob store backed by a map
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<AudioRef, AudioPayload>>,
}

impl MemoryBlobStore {
    pub fn put(&self, bytes: &[u8], mime_type: &str) -> AudioRef {
        let audio_ref = AudioRef::new(format!("{}.webm", Uuid::new_v4()));
        self.blobs
            .lock()
            .unwrap()
            .insert(audio_ref.clone(), AudioPayload::new(bytes.to_vec(), mime_type));
        audio_ref
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn fetch_audio(&self, audio_ref: &AudioRef) -> Result<AudioPayload, ProviderError> {
        self.blobs
            .lock()
            .unwrap()
            .get(audio_ref)
            .cloned()
            .ok_or_else(|| ProviderError::invalid_file(format!("Audio not found: {}", audio_ref)))
    }
}

/// SQLite store whose listing queries can be switched off
pub struct OutageStore {
    inner: Arc<SqliteNoteStore>,
    down: AtomicBool,
}

impl OutageStore {
    pub fn new(inner: Arc<SqliteNoteStore>) -> Self {
        Self {
            inner,
            down: AtomicBool::new(false),
        }
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.down.load(Ordering::SeqCst) {
            Err(StoreError::Task("database unavailable".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl NoteStore for OutageStore {
    async fn insert_note(&self, note: &Note) -> Result<(), StoreError> {
        self.inner.insert_note(note).await
    }

    async fn get_note(&self, note_id: Uuid) -> Result<Note, StoreError> {
        self.inner.get_note(note_id).await
    }

    async fn claim_note(&self, request: ClaimRequest) -> Result<Option<Claim>, StoreError> {
        self.inner.claim_note(request).await
    }

    async fn update_note(&self, claim: &Claim, update: NoteUpdate) -> Result<Note, StoreError> {
        self.inner.update_note(claim, update).await
    }

    async fn list_eligible_notes(
        &self,
        filter: &EligibilityFilter,
        limit: usize,
    ) -> Result<Vec<Note>, StoreError> {
        self.check()?;
        self.inner.list_eligible_notes(filter, limit).await
    }

    async fn list_stuck(
        &self,
        stale_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Note>, StoreError> {
        self.check()?;
        self.inner.list_stuck(stale_before, limit).await
    }

    async fn reset_stuck(
        &self,
        note_id: Uuid,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.inner.reset_stuck(note_id, stale_before, now).await
    }

    async fn owner_usage(
        &self,
        owner_id: &str,
        now: DateTime<Utc>,
    ) -> Result<OwnerUsage, StoreError> {
        self.inner.owner_usage(owner_id, now).await
    }

    async fn record_event(&self, event: &NoteEvent) -> Result<(), StoreError> {
        self.inner.record_event(event).await
    }

    async fn events_for(&self, note_id: Uuid) -> Result<Vec<NoteEvent>, StoreError> {
        self.inner.events_for(note_id).await
    }

    async fn recent_completed(
        &self,
        owner_id: &str,
        exclude: Uuid,
        limit: usize,
    ) -> Result<Vec<PriorNote>, StoreError> {
        self.inner.recent_completed(owner_id, exclude, limit).await
    }
}

/// An orchestrator wired to fakes
pub struct Harness {
    pub store: Arc<SqliteNoteStore>,
    /// What the orchestrator reads through; SQLite unless switched off
    pub outage: Arc<OutageStore>,
    pub blobs: Arc<MemoryBlobStore>,
    pub transcriber: Arc<ScriptedTranscriber>,
    pub analyzer: Arc<ScriptedAnalyzer>,
    pub clock: Arc<ManualClock>,
    pub orchestrator: Arc<Orchestrator>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(OrchestratorSettings::default())
    }

    pub fn with_settings(settings: OrchestratorSettings) -> Self {
        let store = Arc::new(SqliteNoteStore::open_in_memory().unwrap());
        let blobs = Arc::new(MemoryBlobStore::default());
        let transcriber = Arc::new(ScriptedTranscriber::new());
        let analyzer = Arc::new(ScriptedAnalyzer::new());
        let clock = Arc::new(ManualClock::new(start_time()));
        let outage = Arc::new(OutageStore::new(store.clone()));

        let orchestrator = Orchestrator::builder(
            outage.clone(),
            blobs.clone(),
            transcriber.clone(),
            analyzer.clone(),
        )
        .settings(settings)
        .clock(clock.clone())
        .jitter(Arc::new(NoJitter))
        .build();

        Self {
            store,
            outage,
            blobs,
            transcriber,
            analyzer,
            clock,
            orchestrator: Arc::new(orchestrator),
        }
    }

    /// Insert an unprocessed note whose audio is `bytes`
    pub async fn add_note(&self, owner: &str, bytes: &[u8]) -> Note {
        let audio_ref = self.blobs.put(bytes, "audio/webm");
        let note = Note::new(owner, audio_ref, bytes.len() as u64, self.clock_now());
        self.store.insert_note(&note).await.unwrap();
        note
    }

    pub async fn note(&self, note_id: Uuid) -> Note {
        self.store.get_note(note_id).await.unwrap()
    }

    pub fn clock_now(&self) -> DateTime<Utc> {
        use voxnote::core::Clock;
        self.clock.now()
    }
}
