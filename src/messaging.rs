//! Inbound messaging - auction and meta-tx channels.
//!
//! The core consumes a small [`Transport`] trait (subscribe + publish over
//! subject-based pub/sub). The production binding is NATS; tests use the
//! in-process [`LoopbackTransport`].

use async_trait::async_trait;
use ethers::types::{Address, H256, U256};
use futures::StreamExt;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::auction::AuctionEvaluator;
use crate::error::{RequestContext, RouterError, RouterResult};
use crate::lifecycle::{FulfillRequest, LifecycleEngine};
use crate::types::{time, AuctionPayload};

pub const AUCTION_SUBJECT: &str = "auction.>";
pub const METATX_SUBJECT: &str = "metatx.>";

/// One delivered message.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub subject: String,
    pub reply_to: Option<String>,
    pub payload: Vec<u8>,
}

/// Subject-based pub/sub with request-reply.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn subscribe(&self, subject: &str) -> RouterResult<mpsc::Receiver<InboundMessage>>;
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> RouterResult<()>;
}

/// Meta-tx fulfill payload as it arrives on the wire.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaTxPayload {
    pub transaction_id: H256,
    pub user: Address,
    pub signature: String,
    pub call_data: String,
    /// Decimal string; zero when the user pays no relayer fee.
    #[serde(default)]
    pub relayer_fee: Option<String>,
}

/// Serves the auction and meta-tx subjects over a transport.
pub struct MessagingServer {
    transport: Arc<dyn Transport>,
    evaluator: Arc<AuctionEvaluator>,
    lifecycle: Arc<LifecycleEngine>,
    shutdown: Arc<RwLock<bool>>,
}

impl MessagingServer {
    pub fn new(
        transport: Arc<dyn Transport>,
        evaluator: Arc<AuctionEvaluator>,
        lifecycle: Arc<LifecycleEngine>,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            evaluator,
            lifecycle,
            shutdown: Arc::new(RwLock::new(false)),
        })
    }

    pub async fn run(self: Arc<Self>) -> RouterResult<()> {
        let mut auctions = self.transport.subscribe(AUCTION_SUBJECT).await?;
        let mut metatx = self.transport.subscribe(METATX_SUBJECT).await?;
        info!("messaging server subscribed to auction and metatx subjects");

        loop {
            if *self.shutdown.read().await {
                break;
            }
            tokio::select! {
                Some(message) = auctions.recv() => {
                    let server = self.clone();
                    tokio::spawn(async move { server.handle_auction(message).await });
                }
                Some(message) = metatx.recv() => {
                    let server = self.clone();
                    tokio::spawn(async move { server.handle_metatx(message).await });
                }
                else => break,
            }
        }
        info!("messaging server stopped");
        Ok(())
    }

    pub async fn stop(&self) {
        *self.shutdown.write().await = true;
    }

    async fn handle_auction(&self, message: InboundMessage) {
        let ctx = RequestContext::new(
            format!("auction-{}", time::now_millis()),
            "auction",
            "evaluate",
        );
        let reply = match serde_json::from_slice::<AuctionPayload>(&message.payload) {
            Ok(payload) => match self.evaluator.evaluate(payload, &ctx).await {
                Ok(bid_reply) => serde_json::to_value(&bid_reply).unwrap_or_default(),
                Err(e) => {
                    crate::metrics::record_auction_failure(e.kind());
                    debug!(request = %ctx.id, kind = e.kind(), "auction rejected");
                    error_envelope(&e, &ctx)
                }
            },
            Err(e) => {
                let err = RouterError::ParamsInvalid {
                    message: format!("malformed auction payload: {}", e),
                };
                crate::metrics::record_auction_failure(err.kind());
                error_envelope(&err, &ctx)
            }
        };
        self.reply(&message, reply).await;
    }

    async fn handle_metatx(&self, message: InboundMessage) {
        let ctx = RequestContext::new(
            format!("metatx-{}", time::now_millis()),
            "metatx",
            "handle_fulfill_request",
        );
        let reply = match parse_fulfill(&message.payload) {
            Ok(request) => match self.lifecycle.handle_fulfill_request(request).await {
                Ok(()) => serde_json::json!({ "success": true }),
                Err(e) => error_envelope(&e, &ctx),
            },
            Err(e) => error_envelope(&e, &ctx),
        };
        self.reply(&message, reply).await;
    }

    async fn reply(&self, message: &InboundMessage, body: serde_json::Value) {
        let Some(reply_to) = &message.reply_to else {
            warn!(subject = %message.subject, "message without reply subject, dropping response");
            return;
        };
        let payload = serde_json::to_vec(&body).unwrap_or_default();
        if let Err(e) = self.transport.publish(reply_to, payload).await {
            error!(reply_to, error = %e, "failed to publish reply");
        }
    }
}

fn parse_fulfill(payload: &[u8]) -> RouterResult<FulfillRequest> {
    let raw: MetaTxPayload =
        serde_json::from_slice(payload).map_err(|e| RouterError::ParamsInvalid {
            message: format!("malformed metatx payload: {}", e),
        })?;
    let relayer_fee = match raw.relayer_fee.as_deref() {
        None | Some("") => U256::zero(),
        Some(value) => U256::from_dec_str(value).map_err(|e| RouterError::ParamsInvalid {
            message: format!("invalid relayerFee '{}': {}", value, e),
        })?,
    };
    Ok(FulfillRequest {
        transaction_id: raw.transaction_id,
        user: raw.user,
        signature: raw.signature,
        call_data: raw.call_data,
        relayer_fee,
    })
}

/// `{ error: { kind, message, context }, requestContext, methodContext }`
fn error_envelope(error: &RouterError, ctx: &RequestContext) -> serde_json::Value {
    serde_json::json!({
        "error": {
            "kind": error.kind(),
            "message": error.to_string(),
            "context": error.context(),
        },
        "requestContext": { "id": ctx.id, "origin": ctx.origin },
        "methodContext": { "name": ctx.method },
    })
}

/// NATS binding.
pub struct NatsTransport {
    client: async_nats::Client,
}

impl NatsTransport {
    pub async fn connect(url: &str) -> RouterResult<Self> {
        let client = async_nats::connect(url).await.map_err(|e| {
            RouterError::ConfigurationError(format!("nats connect {}: {}", url, e))
        })?;
        info!(url, "connected to NATS");
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for NatsTransport {
    async fn subscribe(&self, subject: &str) -> RouterResult<mpsc::Receiver<InboundMessage>> {
        let mut subscription = self
            .client
            .subscribe(subject.to_string())
            .await
            .map_err(|e| RouterError::ConfigurationError(format!("nats subscribe: {}", e)))?;

        let (tx, rx) = mpsc::channel(1_024);
        tokio::spawn(async move {
            while let Some(message) = subscription.next().await {
                let inbound = InboundMessage {
                    subject: message.subject.to_string(),
                    reply_to: message.reply.map(|s| s.to_string()),
                    payload: message.payload.to_vec(),
                };
                if tx.send(inbound).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    async fn publish(&self, subject: &str, payload: Vec<u8>) -> RouterResult<()> {
        self.client
            .publish(subject.to_string(), payload.into())
            .await
            .map_err(|e| RouterError::ConfigurationError(format!("nats publish: {}", e)))
    }
}

/// In-process transport for tests and diagnostic mode.
#[derive(Default)]
pub struct LoopbackTransport {
    subscriptions: Mutex<Vec<(String, mpsc::Sender<InboundMessage>)>>,
}

impl LoopbackTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Request-reply convenience for tests: publish and await the response.
    pub async fn request(
        self: &Arc<Self>,
        subject: &str,
        payload: Vec<u8>,
    ) -> RouterResult<Vec<u8>> {
        let reply_subject = format!("_inbox.{}", time::now_millis());
        let mut rx = self.subscribe(&reply_subject).await?;

        self.deliver(subject, Some(reply_subject), payload).await;

        tokio::time::timeout(std::time::Duration::from_secs(10), rx.recv())
            .await
            .ok()
            .flatten()
            .map(|m| m.payload)
            .ok_or_else(|| RouterError::ParamsInvalid {
                message: "no reply received".into(),
            })
    }

    async fn deliver(&self, subject: &str, reply_to: Option<String>, payload: Vec<u8>) {
        let subscriptions = self.subscriptions.lock().await;
        for (pattern, tx) in subscriptions.iter() {
            if subject_matches(pattern, subject) {
                let _ = tx
                    .send(InboundMessage {
                        subject: subject.to_string(),
                        reply_to: reply_to.clone(),
                        payload: payload.clone(),
                    })
                    .await;
            }
        }
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn subscribe(&self, subject: &str) -> RouterResult<mpsc::Receiver<InboundMessage>> {
        let (tx, rx) = mpsc::channel(1_024);
        self.subscriptions
            .lock()
            .await
            .push((subject.to_string(), tx));
        Ok(rx)
    }

    async fn publish(&self, subject: &str, payload: Vec<u8>) -> RouterResult<()> {
        self.deliver(subject, None, payload).await;
        Ok(())
    }
}

/// NATS-style subject matching: `>` swallows the rest, `*` one token.
fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');
    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), _) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(s)) if p == s => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}
