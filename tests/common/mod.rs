#![allow(dead_code)]

use std::{
    net::SocketAddr,
    sync::Arc,
    thread::{self, JoinHandle},
};

use ajpkit::{
    Connector, ConnectorConfig, Exchange, ServiceError, ShutdownHandle, server::ServerError,
};

pub struct Running {
    pub addr: Option<SocketAddr>,
    pub handle: ShutdownHandle,
    pub thread: JoinHandle<Result<(), ServerError>>,
}

impl Running {
    pub fn stop(self) {
        self.handle.shutdown();
        self.join();
    }

    pub fn join(self) {
        self.thread
            .join()
            .expect("listener thread panicked")
            .expect("listener failed");
    }
}

pub fn start(config: ConnectorConfig) -> Running {
    let connector = Connector::bind(config, Arc::new(echo)).expect("bind");
    let addr = connector.local_addr();
    let handle = connector.shutdown_handle();
    let thread = thread::spawn(move || connector.listen());
    Running {
        addr,
        handle,
        thread,
    }
}

/// Answers with a one-line summary of the request followed by its body.
pub fn echo(exchange: &mut Exchange<'_>) -> Result<(), ServiceError> {
    let mut body = Vec::new();
    exchange.read_to_end(&mut body)?;

    let request = exchange.request();
    let summary = format!(
        "{} {} query={} host={} user={}\n",
        request.method(),
        request.request_uri(),
        request.query_string(),
        request.header("host").unwrap_or("-"),
        request.remote_user().unwrap_or("-"),
    );
    exchange.add_header("Content-Type", "text/plain")?;
    exchange.write(summary.as_bytes())?;
    exchange.write(&body)?;
    Ok(())
}
