//! In-process provider with scripted results, for tests and local runs.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use super::{AudioOpProvider, OperationOutput, OperationRequest, ProviderError, ProviderResult};
use crate::voices::TrainingStatus;

type Script = Box<dyn Fn(&OperationRequest) -> ProviderResult<OperationOutput> + Send + Sync>;

/// Answers each call from a queue of scripted results, falling back to a
/// canned success for the request's operation class.
pub struct ScriptedProvider {
    queue: Mutex<VecDeque<Script>>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Sleep before answering every call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn then(
        self,
        script: impl Fn(&OperationRequest) -> ProviderResult<OperationOutput> + Send + Sync + 'static,
    ) -> Self {
        self.lock().push_back(Box::new(script));
        self
    }

    /// Queue a failure built fresh for the next call.
    pub fn then_fail(self, make: impl Fn() -> ProviderError + Send + Sync + 'static) -> Self {
        self.then(move |_| Err(make()))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Script>> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn canned(request: &OperationRequest) -> OperationOutput {
        match request {
            OperationRequest::TextToSpeech(p) => OperationOutput::Speech {
                audio: Bytes::from(format!("audio:{}", p.text)),
                content_type: "audio/mpeg".into(),
            },
            OperationRequest::SpeechToText(p) => OperationOutput::Transcription {
                text: format!("transcript of {}", p.filename),
                language: Some(p.language.clone()),
            },
            OperationRequest::VoiceClone(p) => OperationOutput::VoiceCloned {
                voice_id: format!("clone_{}", p.name.to_lowercase().replace(' ', "_")),
            },
        }
    }
}

impl std::fmt::Debug for ScriptedProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedProvider")
            .field("queued", &self.lock().len())
            .field("calls", &self.calls())
            .finish()
    }
}

#[async_trait]
impl AudioOpProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn run(&self, request: &OperationRequest) -> ProviderResult<OperationOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let script = self.lock().pop_front();
        match script {
            Some(script) => script(request),
            None => Ok(Self::canned(request)),
        }
    }

    async fn voice_status(&self, _voice_id: &str) -> ProviderResult<TrainingStatus> {
        Ok(TrainingStatus::Ready)
    }
}
