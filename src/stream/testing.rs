//! In-memory transports for worker tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::rest::{RestClient, RestError};
use crate::stream::error::StreamError;
use crate::stream::proto::RawFrame;
use crate::stream::transport::{Transport, TransportOpener, TransportRequest};

pub(crate) type Feed = mpsc::UnboundedSender<Result<Option<RawFrame>, StreamError>>;

/// What the next `open` call does.
pub(crate) enum OpenScript {
    Open,
    Fail(StreamError),
    Hang,
}

#[derive(Default)]
pub(crate) struct ScriptedOpener {
    script: Mutex<VecDeque<OpenScript>>,
    opens: AtomicUsize,
    closes: Arc<AtomicUsize>,
    open_times: Mutex<Vec<Instant>>,
    requests: Mutex<Vec<TransportRequest>>,
    feeds: Mutex<Vec<Feed>>,
    sent: Arc<Mutex<Vec<String>>>,
}

impl ScriptedOpener {
    /// Opens succeed once the script runs out.
    pub(crate) fn new(script: Vec<OpenScript>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            ..Self::default()
        })
    }

    pub(crate) fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub(crate) fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub(crate) fn open_times(&self) -> Vec<Instant> {
        self.open_times.lock().expect("lock").clone()
    }

    pub(crate) fn requests(&self) -> Vec<TransportRequest> {
        self.requests.lock().expect("lock").clone()
    }

    /// Frame feed of the `index`-th successfully opened transport.
    pub(crate) fn feed(&self, index: usize) -> Feed {
        self.feeds.lock().expect("lock")[index].clone()
    }

    pub(crate) fn opened_transports(&self) -> usize {
        self.feeds.lock().expect("lock").len()
    }

    pub(crate) fn sent(&self) -> Vec<Value> {
        self.sent
            .lock()
            .expect("lock")
            .iter()
            .map(|text| serde_json::from_str(text).expect("sent json"))
            .collect()
    }
}

#[async_trait]
impl TransportOpener for ScriptedOpener {
    async fn open(&self, request: TransportRequest) -> Result<Box<dyn Transport>, StreamError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.open_times.lock().expect("lock").push(Instant::now());
        self.requests.lock().expect("lock").push(request);

        let step = self
            .script
            .lock()
            .expect("lock")
            .pop_front()
            .unwrap_or(OpenScript::Open);
        match step {
            OpenScript::Fail(error) => Err(error),
            OpenScript::Hang => std::future::pending().await,
            OpenScript::Open => {
                let (tx, rx) = mpsc::unbounded_channel();
                self.feeds.lock().expect("lock").push(tx);
                Ok(Box::new(ScriptedTransport {
                    feed: rx,
                    sent: Arc::clone(&self.sent),
                    closes: Arc::clone(&self.closes),
                    closed: false,
                }))
            }
        }
    }
}

struct ScriptedTransport {
    feed: mpsc::UnboundedReceiver<Result<Option<RawFrame>, StreamError>>,
    sent: Arc<Mutex<Vec<String>>>,
    closes: Arc<AtomicUsize>,
    closed: bool,
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&mut self, text: String) -> Result<(), StreamError> {
        self.sent.lock().expect("lock").push(text);
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<RawFrame>, StreamError> {
        match self.feed.recv().await {
            Some(item) => item,
            None => Ok(None),
        }
    }

    async fn close(&mut self) {
        assert!(!self.closed, "transport closed twice");
        self.closed = true;
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Mastodon-shaped `update` frame.
pub(crate) fn mastodon_update(stream: &[&str], id: &str) -> RawFrame {
    let payload = json!({"id": id, "content": format!("<p>{id}</p>")}).to_string();
    RawFrame::Text(json!({"stream": stream, "event": "update", "payload": payload}).to_string())
}

pub(crate) type RestCall = (String, Vec<(String, String)>);

/// REST collaborator answering from a script; empty once exhausted.
#[derive(Default)]
pub(crate) struct ScriptedRest {
    responses: Mutex<VecDeque<Result<Vec<Value>, RestError>>>,
    calls: Mutex<Vec<RestCall>>,
}

impl ScriptedRest {
    pub(crate) fn new(responses: Vec<Result<Vec<Value>, RestError>>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn calls(&self) -> Vec<RestCall> {
        self.calls.lock().expect("lock").clone()
    }
}

#[async_trait]
impl RestClient for ScriptedRest {
    async fn get(&self, path: &str, params: &[(String, String)]) -> Result<Vec<Value>, RestError> {
        self.calls
            .lock()
            .expect("lock")
            .push((path.to_string(), params.to_vec()));
        self.responses
            .lock()
            .expect("lock")
            .pop_front()
            .unwrap_or_else(|| Ok(Vec::new()))
    }
}

/// Status records with the given ids.
pub(crate) fn statuses(ids: &[&str]) -> Vec<Value> {
    ids.iter()
        .map(|id| json!({"id": id, "content": format!("<p>{id}</p>")}))
        .collect()
}
