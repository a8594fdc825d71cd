//! Scripted provider adapters shared by the integration tests.
//!
//! A [`ScriptedProvider`] answers each `chat` call with the next [`Step`] of its
//! script and counts invocations, so tests can assert which candidates the router
//! actually reached.

#![allow(dead_code)]

use ai_relay::types::{ChatResponse, Usage};
use ai_relay::{
    BoxStream, ChatRequest, Error, ProviderAdapter, ProviderContext, ProviderRegistry,
    RelayConfig, Result,
};
use ai_relay::resilience::{QueueConfig, RetryConfig};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type ErrorFn = Arc<dyn Fn() -> Error + Send + Sync>;

#[derive(Clone)]
pub enum Step {
    Reply(String, Usage),
    Fail(ErrorFn),
    /// Never completes; only a timeout or cancellation gets past it.
    Hang,
}

pub fn reply(text: &str) -> Step {
    Step::Reply(text.to_string(), Usage::default())
}

pub fn reply_with_usage(text: &str, prompt: u32, completion: u32) -> Step {
    Step::Reply(text.to_string(), Usage::new(prompt, completion))
}

pub fn fail(f: impl Fn() -> Error + Send + Sync + 'static) -> Step {
    Step::Fail(Arc::new(f))
}

/// HTTP 400: not retryable, falls through to the next candidate.
pub fn bad_request(msg: &'static str) -> Step {
    fail(move || Error::remote(400, msg))
}

pub fn network(msg: &'static str) -> Step {
    fail(move || Error::network(msg))
}

#[derive(Clone)]
pub enum Chunk {
    Text(String),
    Fail(ErrorFn),
}

pub fn text(s: &str) -> Chunk {
    Chunk::Text(s.to_string())
}

pub fn broken(msg: &'static str) -> Chunk {
    Chunk::Fail(Arc::new(move || Error::network(msg)))
}

pub struct ScriptedProvider {
    pub id: String,
    steps: Mutex<VecDeque<Step>>,
    /// Used once the script is exhausted.
    otherwise: Step,
    stream: Vec<Chunk>,
    calls: AtomicU32,
    stream_calls: AtomicU32,
    seen_models: Mutex<Vec<String>>,
    seen_temperatures: Mutex<Vec<Option<f64>>>,
}

impl ScriptedProvider {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            steps: Mutex::new(VecDeque::new()),
            otherwise: Step::Reply(format!("{} says hi", id), Usage::default()),
            stream: vec![Chunk::Text(format!("{} streamed", id))],
            calls: AtomicU32::new(0),
            stream_calls: AtomicU32::new(0),
            seen_models: Mutex::new(Vec::new()),
            seen_temperatures: Mutex::new(Vec::new()),
        }
    }

    pub fn then(self, step: Step) -> Self {
        self.steps.lock().unwrap().push_back(step);
        self
    }

    pub fn always(mut self, step: Step) -> Self {
        self.otherwise = step;
        self
    }

    pub fn streaming(mut self, chunks: Vec<Chunk>) -> Self {
        self.stream = chunks;
        self
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn stream_calls(&self) -> u32 {
        self.stream_calls.load(Ordering::SeqCst)
    }

    pub fn seen_models(&self) -> Vec<String> {
        self.seen_models.lock().unwrap().clone()
    }

    pub fn seen_temperatures(&self) -> Vec<Option<f64>> {
        self.seen_temperatures.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedProvider {
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen_models
            .lock()
            .unwrap()
            .push(request.params.model.clone().unwrap_or_default());
        self.seen_temperatures
            .lock()
            .unwrap()
            .push(request.params.temperature);
        let step = self
            .steps
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.otherwise.clone());
        match step {
            Step::Reply(text, usage) => Ok(ChatResponse::new(text).with_usage(usage)),
            Step::Fail(f) => Err(f()),
            Step::Hang => std::future::pending().await,
        }
    }

    async fn chat_stream(&self, _: &ChatRequest) -> Result<BoxStream<'static, String>> {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);
        let items: Vec<Result<String>> = self
            .stream
            .iter()
            .map(|c| match c {
                Chunk::Text(t) => Ok(t.clone()),
                Chunk::Fail(f) => Err(f()),
            })
            .collect();
        Ok(Box::pin(futures::stream::iter(items)))
    }
}

/// Register every provider under its id with `<id>-model` as default model.
pub fn registry(providers: &[Arc<ScriptedProvider>]) -> ProviderRegistry {
    let mut registry = ProviderRegistry::new();
    for p in providers {
        let p = p.clone();
        registry.register(p.id.clone(), format!("{}-model", p.id), move |_: &ProviderContext| {
            Ok(p.clone() as Arc<dyn ProviderAdapter>)
        });
    }
    registry
}

/// Primary + fallbacks, every candidate credentialed, short delays.
pub fn config(chain: &[&str]) -> RelayConfig {
    let mut cfg = RelayConfig::new(chain[0])
        .with_fallbacks(chain[1..].iter().copied())
        .with_timeout(Duration::from_secs(1))
        .with_max_retries(0)
        .with_retry(
            RetryConfig::new()
                .with_initial_delay(Duration::from_millis(10))
                .with_max_delay(Duration::from_millis(100)),
        )
        .with_queue(QueueConfig::new().with_min_interval(Duration::ZERO));
    for id in chain {
        cfg = cfg.with_credential(*id, format!("key-{}", id));
    }
    cfg
}
