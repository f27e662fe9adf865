use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use super::{
    Capability, CapabilityError, CapabilityRequest, CapabilityResponse, Stage, TokenUsage,
};

type Reply = Result<String, CapabilityError>;

/// Replays scripted replies per stage. A stage with an exhausted script answers with its
/// fallback reply, or `EmptyResponse` when none is set.
#[derive(Default)]
pub struct ScriptedCapability {
    scripts: Mutex<Vec<(Stage, VecDeque<Reply>)>>,
    fallbacks: Mutex<Vec<(Stage, Reply)>>,
    requests: Mutex<Vec<CapabilityRequest>>,
    calls: AtomicUsize,
}

impl ScriptedCapability {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(self, stage: Stage, reply: Reply) -> Self {
        {
            let mut scripts = self.scripts.lock().expect("scripts lock");
            match scripts.iter_mut().find(|(candidate, _)| *candidate == stage) {
                Some((_, queue)) => queue.push_back(reply),
                None => scripts.push((stage, VecDeque::from([reply]))),
            }
        }
        self
    }

    pub fn always(self, stage: Stage, reply: Reply) -> Self {
        self.fallbacks
            .lock()
            .expect("fallbacks lock")
            .push((stage, reply));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<CapabilityRequest> {
        self.requests.lock().expect("requests lock").clone()
    }

    pub fn calls_for(&self, stage: Stage) -> usize {
        self.requests()
            .iter()
            .filter(|request| request.stage == stage)
            .count()
    }
}

#[async_trait]
impl Capability for ScriptedCapability {
    async fn invoke(
        &self,
        request: &CapabilityRequest,
    ) -> Result<CapabilityResponse, CapabilityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests
            .lock()
            .expect("requests lock")
            .push(request.clone());

        let scripted = {
            let mut scripts = self.scripts.lock().expect("scripts lock");
            scripts
                .iter_mut()
                .find(|(stage, _)| *stage == request.stage)
                .and_then(|(_, queue)| queue.pop_front())
        };
        let reply = match scripted {
            Some(reply) => reply,
            None => self
                .fallbacks
                .lock()
                .expect("fallbacks lock")
                .iter()
                .find(|(stage, _)| *stage == request.stage)
                .map(|(_, reply)| reply.clone())
                .unwrap_or(Err(CapabilityError::EmptyResponse)),
        };

        reply.map(|content| CapabilityResponse {
            content,
            usage: Some(TokenUsage {
                input_tokens: 10,
                output_tokens: 5,
                total_tokens: 15,
            }),
        })
    }
}
