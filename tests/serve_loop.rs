#![cfg(feature = "mock")]

mod common;

use std::fmt;
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;

use tracing::field::{Field, Visit};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::Layer;

use attested_link::error::{code, ChannelError};
use attested_link::proxy::Syscall;
use attested_link::sample::client::{self, ClientOptions};
use attested_link::sample::server::{Server, ServerOptions};
use attested_link::sample::{Backends, Identity, GREETING, IDENTITY_LEN};
use attested_link::{
    Engine, Error, LogLevel, NativeTransport, Role, Session, State, TransportProvider, Verdict,
    VerifyCallback,
};

fn backends() -> Backends {
    Backends {
        log_level: LogLevel::None,
        ..Backends::default()
    }
}

fn server_options(max_connections: Option<usize>, report_identity: bool) -> ServerOptions {
    ServerOptions {
        addr: common::loopback(),
        backends: backends(),
        max_connections,
        report_identity,
    }
}

fn client_options(server: &Server) -> ClientOptions {
    ClientOptions {
        addr: server.local_addr().unwrap(),
        backends: backends(),
        verdictd: false,
    }
}

#[test]
fn rejected_connection_stops_server_and_closes_listener() {
    let io = Arc::new(NativeTransport::new());
    let server = Server::bind(
        &server_options(None, false),
        &Engine::new(),
        Arc::clone(&io) as Arc<dyn TransportProvider>,
    )
    .unwrap();
    let addr = server.local_addr().unwrap();
    let good = client_options(&server);
    assert_eq!(io.open_count(), 1);
    let serving = thread::spawn(move || server.serve());

    // One full exchange first, so the failure is not on the first connection.
    let reply = client::run(&good, &Engine::new(), common::native()).unwrap();
    assert_eq!(reply.message, GREETING.as_bytes());

    let mut rejecting = Session::init(
        common::quiet(Role::Client).build().unwrap(),
        &Engine::new(),
        common::native(),
    )
    .unwrap();
    let reject: VerifyCallback = Box::new(|_| Verdict::Reject);
    rejecting.set_verification_callback(Some(reject)).unwrap();
    rejecting.connect(addr).unwrap();
    let err = rejecting.negotiate().unwrap_err();
    rejecting.fail_with(err);

    match serving.join().unwrap() {
        Err(Error::Channel(e @ ChannelError::Negotiate(_))) => {
            assert_eq!(e.code(), code::PEER_ABORTED)
        }
        other => panic!("serve should return the negotiate failure, got {other:?}"),
    }
    assert_eq!(io.open_count(), 0);

    // Nobody is listening any more.
    assert!(TcpStream::connect(addr).is_err());
}

#[test]
fn peer_hang_up_stops_server() {
    let io = Arc::new(NativeTransport::new());
    let server = Server::bind(
        &server_options(None, false),
        &Engine::new(),
        Arc::clone(&io) as Arc<dyn TransportProvider>,
    )
    .unwrap();
    let addr = server.local_addr().unwrap();
    let serving = thread::spawn(move || server.serve());

    drop(TcpStream::connect(addr).unwrap());

    assert!(matches!(
        serving.join().unwrap(),
        Err(Error::Channel(ChannelError::Negotiate(_)))
    ));
    assert_eq!(io.open_count(), 0);
    assert!(TcpStream::connect(addr).is_err());
}

#[test]
fn address_in_use_fails_session_and_releases_socket() {
    let taken = TcpListener::bind(common::loopback()).unwrap();
    let addr = match taken.local_addr().unwrap() {
        std::net::SocketAddr::V4(addr) => addr,
        other => panic!("loopback should be IPv4, got {other}"),
    };

    let io = Arc::new(NativeTransport::new());
    let mut session = Session::init(
        common::quiet(Role::Server).build().unwrap(),
        &Engine::new(),
        Arc::clone(&io) as Arc<dyn TransportProvider>,
    )
    .unwrap();

    let err = session.bind_and_listen(addr, 5).unwrap_err();
    match &err {
        Error::Proxy(e) => {
            assert_eq!(e.stage, Syscall::Bind);
            assert_eq!(e.native_errno(), Some(libc::EADDRINUSE));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(session.state(), State::Failed);
    // The half-built listener is still owned by the session.
    assert_eq!(io.open_count(), 1);

    session.fail_with(err);
    assert_eq!(session.state(), State::Closed);
    assert_eq!(io.open_count(), 0);
}

#[test]
fn server_bind_on_taken_port_leaks_nothing() {
    let taken = TcpListener::bind(common::loopback()).unwrap();
    let std::net::SocketAddr::V4(addr) = taken.local_addr().unwrap() else {
        panic!("loopback should be IPv4");
    };

    let io = Arc::new(NativeTransport::new());
    let options = ServerOptions {
        addr,
        ..server_options(Some(1), false)
    };
    let err = Server::bind(
        &options,
        &Engine::new(),
        Arc::clone(&io) as Arc<dyn TransportProvider>,
    )
    .unwrap_err();
    assert!(matches!(err, Error::Proxy(ref e) if e.stage == Syscall::Bind));
    assert_eq!(io.open_count(), 0);
}

#[test]
fn identity_reply_is_stripped_before_echo_check() {
    let server = Server::bind(&server_options(Some(1), true), &Engine::new(), common::native())
        .unwrap();
    let options = client_options(&server);
    let serving = thread::spawn(move || server.serve());

    let reply = client::run(&options, &Engine::new(), common::native()).unwrap();
    assert_eq!(reply.identity, Some(Identity::for_attester("")));
    assert_eq!(reply.message, GREETING.as_bytes());
    assert_eq!(serving.join().unwrap().unwrap(), 1);
}

#[test]
fn plain_reply_carries_no_identity() {
    let server = Server::bind(&server_options(Some(1), false), &Engine::new(), common::native())
        .unwrap();
    let options = client_options(&server);
    let serving = thread::spawn(move || server.serve());

    let reply = client::run(&options, &Engine::new(), common::native()).unwrap();
    assert!(GREETING.len() < IDENTITY_LEN);
    assert_eq!(reply.identity, None);
    assert_eq!(reply.message, GREETING.as_bytes());
    assert_eq!(serving.join().unwrap().unwrap(), 1);
}

/// Records the message of every event that carries an `elapsed` field.
#[derive(Clone, Default)]
struct Timings(Arc<Mutex<Vec<String>>>);

#[derive(Default)]
struct Fields {
    message: Option<String>,
    elapsed: bool,
}

impl Visit for Fields {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        match field.name() {
            "message" => self.message = Some(format!("{value:?}")),
            "elapsed" => self.elapsed = true,
            _ => {}
        }
    }
}

impl<S: tracing::Subscriber> Layer<S> for Timings {
    fn on_event(&self, event: &tracing::Event<'_>, _: Context<'_, S>) {
        let mut fields = Fields::default();
        event.record(&mut fields);
        if let (true, Some(message)) = (fields.elapsed, fields.message) {
            self.0.lock().unwrap().push(message);
        }
    }
}

#[test]
fn server_logs_each_phase_duration() {
    let timings = Timings::default();
    let subscriber = || tracing_subscriber::registry().with(timings.clone());

    let server = tracing::subscriber::with_default(subscriber(), || {
        Server::bind(&server_options(Some(1), false), &Engine::new(), common::native()).unwrap()
    });
    let options = client_options(&server);
    let serving_subscriber = subscriber();
    let serving = thread::spawn(move || {
        tracing::subscriber::with_default(serving_subscriber, || server.serve())
    });

    client::run(&options, &Engine::new(), common::native()).unwrap();
    assert_eq!(serving.join().unwrap().unwrap(), 1);

    assert_eq!(
        *timings.0.lock().unwrap(),
        [
            "init done",
            "accept done",
            "negotiate done",
            "receive done",
            "transmit done"
        ]
    );
}
