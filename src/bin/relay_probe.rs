//! relay-probe: 在无网络环境下端到端演练路由、缓存、限流与熔断
//!
//! Usage:
//!   relay-probe [--config <path>] [--requests <n>] [--fail-primary]
//!
//! Builds a router over in-process echo providers, sends a few requests and prints
//! cache, rate-limit and breaker statistics as JSON. Logging follows `RUST_LOG`.

use ai_relay::store::MemoryStore;
use ai_relay::types::{ChatResponse, Usage};
use ai_relay::{
    BoxStream, ChatMessage, ChatRequest, ProviderAdapter, ProviderContext, ProviderRegistry,
    RelayConfig, RouterBuilder,
};
use anyhow::Context;
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

struct EchoProvider {
    ctx: ProviderContext,
    fail: bool,
}

#[async_trait]
impl ProviderAdapter for EchoProvider {
    async fn chat(&self, request: &ChatRequest) -> ai_relay::Result<ChatResponse> {
        if self.fail {
            return Err(ai_relay::Error::remote(503, "echo provider is down"));
        }
        let prompt = request.conversation_prompt();
        let words = prompt.split_whitespace().count() as u32;
        Ok(ChatResponse::new(format!("[{}/{}] {}", self.ctx.provider_id, self.ctx.model, prompt))
            .with_usage(Usage::new(words * 4, words * 4)))
    }

    async fn chat_stream(&self, request: &ChatRequest) -> ai_relay::Result<BoxStream<'static, String>> {
        if self.fail {
            return Err(ai_relay::Error::remote(503, "echo provider is down"));
        }
        let chunks: Vec<ai_relay::Result<String>> = request
            .conversation_prompt()
            .split_whitespace()
            .map(|w| Ok(format!("{} ", w)))
            .collect();
        Ok(Box::pin(futures::stream::iter(chunks)))
    }
}

struct Args {
    config: Option<String>,
    requests: usize,
    fail_primary: bool,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut args = Args {
        config: None,
        requests: 3,
        fail_primary: false,
    };
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--config" => args.config = Some(it.next().context("--config needs a path")?),
            "--requests" => {
                args.requests = it
                    .next()
                    .context("--requests needs a number")?
                    .parse()
                    .context("--requests must be a number")?
            }
            "--fail-primary" => args.fail_primary = true,
            "help" | "--help" | "-h" => {
                println!("relay-probe [--config <path>] [--requests <n>] [--fail-primary]");
                std::process::exit(0);
            }
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(args)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = parse_args()?;
    let config = match &args.config {
        Some(path) => RelayConfig::from_path(path)?,
        None => RelayConfig::new("echo-primary")
            .with_model("echo-large")
            .with_fallbacks(["echo-backup"])
            .with_credential("echo-primary", "local")
            .with_credential("echo-backup", "local"),
    }
    .apply_env_overrides();

    let fail_primary = args.fail_primary;
    let primary = config.provider.clone();
    let mut registry = ProviderRegistry::new();
    for id in config.candidates() {
        let fail = fail_primary && id == primary;
        registry.register(id, "echo-small", move |ctx: &ProviderContext| {
            Ok(Arc::new(EchoProvider {
                ctx: ctx.clone(),
                fail,
            }) as Arc<dyn ProviderAdapter>)
        });
    }

    let router = RouterBuilder::new(config, registry)
        .store(Arc::new(MemoryStore::new()))
        .build()
        .await?;

    for i in 0..args.requests {
        // every other request repeats the first prompt to show cache hits
        let prompt = if i % 2 == 0 { "hello relay".to_string() } else { format!("request {i}") };
        let request = ChatRequest::new(vec![ChatMessage::user(prompt)]);
        match router.chat(request).await {
            Ok(resp) => println!(
                "#{i} provider={} cached={} retries={} -> {}",
                resp.provider,
                resp.cached,
                resp.retry_count,
                resp.content()
            ),
            Err(e) => println!("#{i} failed [{}]: {e}", e.kind().name()),
        }
    }

    let mut stream = router.chat_stream(ChatRequest::new(vec![ChatMessage::user("streamed answer")]));
    let mut streamed = String::new();
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(text) => streamed.push_str(&text),
            Err(e) => {
                println!("stream failed [{}]: {e}", e.kind().name());
                break;
            }
        }
    }
    println!("stream -> {}", streamed.trim_end());

    let report = serde_json::json!({
        "cache": router.cache_stats(),
        "usage": router.usage_stats().await,
        "health": router.health_status(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
