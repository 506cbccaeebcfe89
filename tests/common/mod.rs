#![allow(dead_code)]

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use attested_link::{
    Engine, LogLevel, NativeTransport, Result, Role, Session, SessionConfig, SessionConfigBuilder,
    State, TransportProvider,
};

pub fn loopback() -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)
}

pub fn native() -> Arc<dyn TransportProvider> {
    Arc::new(NativeTransport::new())
}

/// Builder with library logging silenced.
pub fn quiet(role: Role) -> SessionConfigBuilder {
    SessionConfig::builder(role).log_level(LogLevel::None)
}

/// Listen on an ephemeral loopback port, then handle a single connection
/// with `body` on a background thread. The session is always cleaned up.
pub fn serve_one<T, F>(
    config: SessionConfig,
    transport: Arc<dyn TransportProvider>,
    body: F,
) -> (SocketAddrV4, JoinHandle<Result<T>>)
where
    T: Send + 'static,
    F: FnOnce(&mut Session) -> Result<T> + Send + 'static,
{
    let mut session = Session::init(config, &Engine::new(), transport).unwrap();
    session.bind_and_listen(loopback(), 5).unwrap();
    let addr = session.local_addr().unwrap();

    let handle = thread::spawn(move || {
        let result = session.accept_one().and_then(|_| body(&mut session));
        match result {
            Ok(v) if session.state() == State::Closed => Ok(v),
            Ok(v) => session.cleanup().map(|()| v),
            Err(e) => Err(session.fail_with(e)),
        }
    });
    (addr, handle)
}
