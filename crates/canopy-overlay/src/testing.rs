//! Recording collaborator doubles for unit tests.

use std::sync::{Arc, Mutex};

use bytes::Bytes;

use crate::bootstrap::{Bootstrap, EventHandler, RequestHandler, Socket, SocketEvent};
use crate::error::Result;
use crate::types::{InboundRequest, JoinRequest, PeerOptions, Signal};

/// Socket that records everything written to it.
#[derive(Default)]
pub(crate) struct MockSocket {
    sent: Mutex<Vec<Bytes>>,
    signals: Mutex<Vec<Signal>>,
    destroyed: Mutex<usize>,
}

impl MockSocket {
    pub(crate) fn sent(&self) -> Vec<Bytes> {
        self.sent.lock().unwrap().clone()
    }

    pub(crate) fn signals(&self) -> Vec<Signal> {
        self.signals.lock().unwrap().clone()
    }

    pub(crate) fn destroy_count(&self) -> usize {
        *self.destroyed.lock().unwrap()
    }
}

impl Socket for Arc<MockSocket> {
    fn signal(&self, signal: Signal) -> Result<()> {
        self.signals.lock().unwrap().push(signal);
        Ok(())
    }

    fn send(&self, frame: Bytes) -> Result<()> {
        self.sent.lock().unwrap().push(frame);
        Ok(())
    }

    fn destroy(&self) {
        *self.destroyed.lock().unwrap() += 1;
    }
}

struct Connection {
    request: Option<JoinRequest>,
    options: PeerOptions,
    socket: Arc<MockSocket>,
    events: EventHandler,
}

/// Bootstrap that hands out [`MockSocket`]s and keeps their event handlers so
/// tests can drive them.
#[derive(Default)]
pub(crate) struct MockBootstrap {
    connections: Mutex<Vec<Connection>>,
    root: Mutex<Option<(String, RequestHandler)>>,
}

impl MockBootstrap {
    pub(crate) fn connections(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    pub(crate) fn socket(&self, index: usize) -> Arc<MockSocket> {
        Arc::clone(&self.connections.lock().unwrap()[index].socket)
    }

    pub(crate) fn request(&self, index: usize) -> Option<JoinRequest> {
        self.connections.lock().unwrap()[index].request.clone()
    }

    pub(crate) fn options(&self, index: usize) -> PeerOptions {
        self.connections.lock().unwrap()[index].options.clone()
    }

    /// Report `event` on the socket opened by the `index`th connect.
    pub(crate) fn emit(&self, index: usize, event: SocketEvent) {
        (self.connections.lock().unwrap()[index].events)(event);
    }

    pub(crate) fn root_secret(&self) -> Option<String> {
        self.root.lock().unwrap().as_ref().map(|(s, _)| s.clone())
    }

    pub(crate) fn deliver_root_request(&self, req: InboundRequest) {
        let root = self.root.lock().unwrap();
        let (_, handler) = root.as_ref().expect("no root registered");
        handler(req);
    }
}

impl Bootstrap for MockBootstrap {
    fn connect(
        &self,
        request: Option<&JoinRequest>,
        options: &PeerOptions,
        events: EventHandler,
    ) -> Box<dyn Socket> {
        let socket = Arc::new(MockSocket::default());
        self.connections.lock().unwrap().push(Connection {
            request: request.cloned(),
            options: options.clone(),
            socket: Arc::clone(&socket),
            events,
        });
        Box::new(socket)
    }

    fn root(&self, secret: &str, requests: RequestHandler) -> Result<()> {
        *self.root.lock().unwrap() = Some((secret.to_owned(), requests));
        Ok(())
    }
}
