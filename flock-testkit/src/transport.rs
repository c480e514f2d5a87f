use std::collections::{HashMap, VecDeque};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use flock::PoolError;
use flock::backends::{FrameStream, JsonTransport, StreamTransport};
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

#[derive(Clone, Debug)]
enum Reply {
    Json(Value),
    Error(PoolError),
}

impl Reply {
    fn into_result(self) -> Result<Value> {
        match self {
            Reply::Json(value) => Ok(value),
            Reply::Error(error) => Err(error.into()),
        }
    }
}

/// One recorded call.
#[derive(Clone, Debug, PartialEq)]
pub struct TransportCall {
    pub path: String,
    /// `None` for GET requests.
    pub body: Option<Value>,
}

/// Transport with per-path reply queues.
///
/// Replies for a path are consumed in order; the last one stays and answers
/// every later call. Paths without replies fail like an unreachable server.
#[derive(Default)]
pub struct ScriptedTransport {
    replies: Mutex<HashMap<String, VecDeque<Reply>>>,
    streams: Mutex<HashMap<String, VecDeque<Vec<Value>>>>,
    feeds: Mutex<HashMap<String, VecDeque<mpsc::UnboundedReceiver<Value>>>>,
    calls: Mutex<Vec<TransportCall>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a JSON reply for `path`.
    pub fn on(self, path: &str, reply: Value) -> Self {
        self.push(path, Reply::Json(reply));
        self
    }

    /// Queue a failing reply for `path`.
    pub fn on_error(self, path: &str, error: PoolError) -> Self {
        self.push(path, Reply::Error(error));
        self
    }

    /// Queue the frames one stream opened at `path` will yield before closing.
    pub fn on_stream(self, path: &str, frames: Vec<Value>) -> Self {
        self.streams
            .lock()
            .entry(path.to_string())
            .or_default()
            .push_back(frames);
        self
    }

    /// Queue a stream at `path` that stays open until the returned sender is dropped.
    pub fn feed(&self, path: &str) -> mpsc::UnboundedSender<Value> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.feeds
            .lock()
            .entry(path.to_string())
            .or_default()
            .push_back(rx);
        tx
    }

    /// Add a reply behind the ones already queued.
    pub fn set(&self, path: &str, reply: Value) {
        self.push(path, Reply::Json(reply));
    }

    /// Drop whatever is queued for `path` and answer with `reply` from now on.
    pub fn replace(&self, path: &str, reply: Value) {
        self.replies
            .lock()
            .insert(path.to_string(), VecDeque::from([Reply::Json(reply)]));
    }

    pub fn replace_error(&self, path: &str, error: PoolError) {
        self.replies
            .lock()
            .insert(path.to_string(), VecDeque::from([Reply::Error(error)]));
    }

    fn push(&self, path: &str, reply: Reply) {
        self.replies
            .lock()
            .entry(path.to_string())
            .or_default()
            .push_back(reply);
    }

    fn reply(&self, path: &str, body: Option<&Value>) -> Result<Value> {
        self.calls.lock().push(TransportCall {
            path: path.to_string(),
            body: body.cloned(),
        });
        let mut replies = self.replies.lock();
        let queue = replies
            .get_mut(path)
            .filter(|queue| !queue.is_empty())
            .ok_or_else(|| anyhow!("connection refused: no scripted reply for {path}"))?;
        let reply = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        };
        reply
            .ok_or_else(|| anyhow!("no scripted reply for {path}"))?
            .into_result()
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        self.calls.lock().clone()
    }

    /// Bodies of the calls made to `path`, in order.
    pub fn calls_to(&self, path: &str) -> Vec<Value> {
        self.calls
            .lock()
            .iter()
            .filter(|call| call.path == path)
            .map(|call| call.body.clone().unwrap_or(Value::Null))
            .collect()
    }

    pub fn count(&self, path: &str) -> usize {
        self.calls.lock().iter().filter(|call| call.path == path).count()
    }

    pub fn assert_call_count_eq(&self, path: &str, expected: usize) {
        assert_eq!(
            self.count(path),
            expected,
            "Expected {} calls to {}, got {}",
            expected,
            path,
            self.count(path)
        );
    }
}

#[async_trait]
impl JsonTransport for ScriptedTransport {
    async fn get_json(&self, path: &str) -> Result<Value> {
        self.reply(path, None)
    }

    async fn post_json(&self, path: &str, body: &Value) -> Result<Value> {
        self.reply(path, Some(body))
    }
}

#[async_trait]
impl StreamTransport for ScriptedTransport {
    async fn open_stream(&self, path: &str, body: &Value) -> Result<FrameStream> {
        self.calls.lock().push(TransportCall {
            path: path.to_string(),
            body: Some(body.clone()),
        });
        let feed = self
            .feeds
            .lock()
            .get_mut(path)
            .and_then(VecDeque::pop_front);
        if let Some(rx) = feed {
            let frames = futures::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|frame| (Ok(frame), rx))
            });
            return Ok(frames.boxed());
        }
        let frames = self
            .streams
            .lock()
            .get_mut(path)
            .and_then(VecDeque::pop_front)
            .ok_or_else(|| anyhow!("connection refused: no scripted stream for {path}"))?;
        Ok(futures::stream::iter(frames.into_iter().map(Ok)).boxed())
    }
}
