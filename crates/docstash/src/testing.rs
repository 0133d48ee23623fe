//! Test doubles shared by unit tests.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::transport::{HttpRequest, HttpResponse, HttpTransport, TransportError};

type Reply = Result<HttpResponse, TransportError>;

#[derive(Default)]
struct Script {
    queue: VecDeque<Reply>,
    fallback: Option<Reply>,
    requests: Vec<HttpRequest>,
}

/// Transport that replays queued replies and records every request.
///
/// Clones share state, so a test can keep one handle after boxing another
/// into a fetcher.
#[derive(Clone, Default)]
pub(crate) struct ScriptedTransport {
    script: Rc<RefCell<Script>>,
}

impl ScriptedTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn respond(&self, status: u16, body: impl Into<Vec<u8>>) -> &Self {
        self.push(Ok(HttpResponse::new(status, body)))
    }

    pub(crate) fn fail(&self, error: TransportError) -> &Self {
        self.push(Err(error))
    }

    pub(crate) fn push(&self, reply: Reply) -> &Self {
        self.script.borrow_mut().queue.push_back(reply);
        self
    }

    /// Reply used once the queue is empty.
    pub(crate) fn always(&self, reply: Reply) -> &Self {
        self.script.borrow_mut().fallback = Some(reply);
        self
    }

    pub(crate) fn calls(&self) -> usize {
        self.script.borrow().requests.len()
    }

    pub(crate) fn requests(&self) -> Vec<HttpRequest> {
        self.script.borrow().requests.clone()
    }

    pub(crate) fn boxed(&self) -> Box<dyn HttpTransport> {
        Box::new(self.clone())
    }
}

impl HttpTransport for ScriptedTransport {
    fn get(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut script = self.script.borrow_mut();
        script.requests.push(request.clone());
        match script.queue.pop_front() {
            Some(reply) => reply,
            None => script.fallback.clone().unwrap_or_else(|| {
                Err(TransportError::Connection(format!(
                    "no scripted reply for {}",
                    request.url
                )))
            }),
        }
    }
}
