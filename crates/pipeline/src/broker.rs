//! In-process message broker with exchange/queue topology.
//!
//! The topology mirrors a classic AMQP data plane: a durable direct
//! exchange per capability routing key, a fanout log exchange, and a
//! direct dead-letter exchange. Queues are FIFO; consumers
//! take one delivery at a time (prefetch 1 by construction) and can requeue
//! on failure, which is the manual-ack contract.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::Notify;

/// Direct exchange for capability envelopes.
pub const EX_CAPABILITY: &str = "bdp.capability";
/// Fanout exchange for observability events.
pub const EX_LOG: &str = "bdp.log";
/// Direct exchange for dead letters.
pub const EX_DLQ: &str = "bdp.dlq";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Direct,
    Fanout,
}

/// A FIFO queue of JSON bodies.
pub struct MessageQueue {
    name: String,
    items: Mutex<VecDeque<Value>>,
    notify: Notify,
}

impl MessageQueue {
    fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            items: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue at the back.
    pub fn push(&self, body: Value) {
        self.items
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(body);
        self.notify.notify_one();
    }

    /// Put a delivery back at the front (nack/requeue).
    pub fn requeue(&self, body: Value) {
        self.items
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_front(body);
        self.notify.notify_one();
    }

    /// Take the next delivery, waiting until one arrives.
    pub async fn pop(&self) -> Value {
        loop {
            let notified = self.notify.notified();
            if let Some(item) = self
                .items
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .pop_front()
            {
                return item;
            }
            notified.await;
        }
    }

    /// Take the next delivery if one is ready.
    pub fn try_pop(&self) -> Option<Value> {
        self.items
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct BrokerInner {
    exchanges: HashMap<String, ExchangeKind>,
    queues: HashMap<String, Arc<MessageQueue>>,
    // exchange → [(routing_key, queue_name)]
    bindings: HashMap<String, Vec<(String, String)>>,
}

/// The process-local broker.
pub struct Broker {
    inner: Mutex<BrokerInner>,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

impl Broker {
    pub fn new() -> Self {
        let broker = Self {
            inner: Mutex::new(BrokerInner {
                exchanges: HashMap::new(),
                queues: HashMap::new(),
                bindings: HashMap::new(),
            }),
        };
        broker.ensure_topology();
        broker
    }

    /// Declare the standard exchanges. Idempotent.
    pub fn ensure_topology(&self) {
        self.declare_exchange(EX_CAPABILITY, ExchangeKind::Direct);
        self.declare_exchange(EX_LOG, ExchangeKind::Fanout);
        self.declare_exchange(EX_DLQ, ExchangeKind::Direct);
    }

    pub fn declare_exchange(&self, name: &str, kind: ExchangeKind) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.exchanges.entry(name.to_string()).or_insert(kind);
    }

    /// Declare (or fetch) a queue by name.
    pub fn declare_queue(&self, name: &str) -> Arc<MessageQueue> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .queues
            .entry(name.to_string())
            .or_insert_with(|| MessageQueue::new(name))
            .clone()
    }

    /// Bind a queue to an exchange under a routing key. Idempotent.
    pub fn bind(&self, exchange: &str, routing_key: &str, queue_name: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let binding = (routing_key.to_string(), queue_name.to_string());
        let bindings = inner.bindings.entry(exchange.to_string()).or_default();
        if !bindings.contains(&binding) {
            bindings.push(binding);
        }
    }

    /// Publish a body to an exchange. Returns how many queues received it;
    /// unroutable messages are dropped.
    pub fn publish(&self, exchange: &str, routing_key: &str, body: Value) -> usize {
        let targets: Vec<Arc<MessageQueue>> = {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            let Some(kind) = inner.exchanges.get(exchange).copied() else {
                return 0;
            };
            inner
                .bindings
                .get(exchange)
                .map(|bindings| {
                    bindings
                        .iter()
                        .filter(|(key, _)| kind == ExchangeKind::Fanout || key == routing_key)
                        .filter_map(|(_, queue_name)| inner.queues.get(queue_name).cloned())
                        .collect()
                })
                .unwrap_or_default()
        };

        for queue in &targets {
            queue.push(body.clone());
        }
        targets.len()
    }

    pub fn queue(&self, name: &str) -> Option<Arc<MessageQueue>> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.queues.get(name).cloned()
    }
}
