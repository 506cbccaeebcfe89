#![cfg(feature = "mock")]

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};

use attested_link::error::{code, ChannelError, ConfigError, LibError, SessionError};
use attested_link::session::MAX_SELECTOR_LEN;
use attested_link::{
    AttestedChannel, ChannelLibrary, Engine, Error, Role, Session, SessionConfig, State, Verdict,
    VerifyCallback,
};

/// Counts how often the library is asked for a handle.
#[derive(Default)]
struct CountingLibrary {
    inits: AtomicUsize,
}

impl ChannelLibrary for CountingLibrary {
    fn init(&self, config: &SessionConfig) -> Result<Box<dyn AttestedChannel>, LibError> {
        self.inits.fetch_add(1, Ordering::SeqCst);
        Engine.init(config)
    }
}

#[test]
fn established_session_exchanges_then_closes() {
    let (addr, server) = common::serve_one(
        common::quiet(Role::Server).build().unwrap(),
        common::native(),
        |s| {
            s.negotiate()?;
            assert_eq!(s.state(), State::Established);
            let mut buf = [0u8; 64];
            let mut total = 0;
            for _ in 0..3 {
                let n = s.receive(&mut buf)?;
                s.transmit(&buf[..n])?;
                total += n;
            }
            s.end_connection()?;
            assert_eq!(s.state(), State::Listening);
            Ok(total)
        },
    );

    let mut client = Session::init(
        common::quiet(Role::Client).build().unwrap(),
        &Engine::new(),
        common::native(),
    )
    .unwrap();
    client.connect(addr).unwrap();
    assert_eq!(client.state(), State::Negotiating);
    client.negotiate().unwrap();
    assert_eq!(client.state(), State::Established);

    for i in 0..3 {
        let msg = format!("ping {i}");
        assert_eq!(client.transmit(msg.as_bytes()).unwrap(), msg.len());
        let mut buf = [0u8; 64];
        let n = client.receive(&mut buf).unwrap();
        assert_eq!(&buf[..n], msg.as_bytes());
    }

    client.cleanup().unwrap();
    assert_eq!(client.state(), State::Closed);
    assert!(matches!(
        client.transmit(b"late"),
        Err(Error::Session(SessionError::NotEstablished))
    ));
    assert!(matches!(
        client.receive(&mut [0u8; 8]),
        Err(Error::Session(SessionError::NotEstablished))
    ));

    assert_eq!(server.join().unwrap().unwrap(), "ping 0".len() * 3);
}

#[test]
fn rejecting_callback_never_establishes() {
    let (addr, server) = common::serve_one(
        common::quiet(Role::Server).build().unwrap(),
        common::native(),
        |s| s.negotiate(),
    );

    let mut client = Session::init(
        common::quiet(Role::Client).build().unwrap(),
        &Engine::new(),
        common::native(),
    )
    .unwrap();
    let reject: VerifyCallback = Box::new(|_| Verdict::Reject);
    client.set_verification_callback(Some(reject)).unwrap();
    client.connect(addr).unwrap();

    let err = client.negotiate().unwrap_err();
    match &err {
        Error::Channel(e @ ChannelError::Negotiate(_)) => {
            assert_eq!(e.code(), code::VERIFY_REJECTED)
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(client.state(), State::Failed);
    assert!(matches!(
        client.transmit(b"x"),
        Err(Error::Session(SessionError::NotEstablished))
    ));
    assert!(matches!(
        client.receive(&mut [0u8; 8]),
        Err(Error::Session(SessionError::NotEstablished))
    ));

    let err = client.fail_with(err);
    assert!(matches!(err, Error::Channel(ChannelError::Negotiate(_))));
    assert_eq!(client.state(), State::Closed);

    match server.join().unwrap() {
        Err(Error::Channel(e)) => assert_eq!(e.code(), code::PEER_ABORTED),
        other => panic!("server should see the abort, got {other:?}"),
    }
}

#[test]
fn init_then_cleanup_needs_no_network() {
    let library = CountingLibrary::default();
    for role in [Role::Server, Role::Client] {
        for mutual in [false, true] {
            let config = common::quiet(role).mutual(mutual).build().unwrap();
            let mut session = Session::init(config, &library, common::native()).unwrap();
            assert_eq!(session.state(), State::Initialized);
            session.cleanup().unwrap();
        }
    }
    assert_eq!(library.inits.load(Ordering::SeqCst), 4);

    let config = common::quiet(Role::Client)
        .verifier_type("no-such-verifier")
        .build()
        .unwrap();
    match Session::init(config, &library, common::native()) {
        Err(Error::Channel(ChannelError::Init(e))) => assert_eq!(e.code, code::UNKNOWN_BACKEND),
        other => panic!("expected init failure, got {other:?}"),
    }
}

#[test]
fn oversized_selector_never_reaches_library() {
    let library = CountingLibrary::default();
    let result = SessionConfig::builder(Role::Server)
        .attester_type(&"a".repeat(MAX_SELECTOR_LEN + 1))
        .build()
        .map_err(Error::from)
        .and_then(|config| Session::init(config, &library, common::native()));

    assert!(matches!(
        result,
        Err(Error::Config(ConfigError::FieldTooLong { field: "attester_type", .. }))
    ));
    assert_eq!(library.inits.load(Ordering::SeqCst), 0);
}

#[test]
fn scoped_session_cleans_up_on_error() {
    let library = CountingLibrary::default();
    let err = Session::scoped(
        common::quiet(Role::Client).build().unwrap(),
        &library,
        common::native(),
        |s| {
            // Nothing listens on port 1 of loopback.
            s.connect(std::net::SocketAddrV4::new(std::net::Ipv4Addr::LOCALHOST, 1))
        },
    )
    .unwrap_err();
    assert!(matches!(err, Error::Proxy(_)));
    assert_eq!(library.inits.load(Ordering::SeqCst), 1);
}
