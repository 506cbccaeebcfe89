use std::sync::Arc;
use std::thread;

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use attested_link::{
    Engine, LogLevel, NativeTransport, Role, Session, SessionConfig, State, TransportProvider,
};

fn config(role: Role) -> SessionConfig {
    SessionConfig::builder(role)
        .log_level(LogLevel::None)
        .claim("key_0", b"value_0")
        .build()
        .unwrap()
}

/// Server that negotiates and drops connections until the process exits.
fn spawn_server(io: Arc<dyn TransportProvider>) -> std::net::SocketAddrV4 {
    let mut session = Session::init(config(Role::Server), &Engine::new(), io).unwrap();
    session
        .bind_and_listen(std::net::SocketAddrV4::new(std::net::Ipv4Addr::LOCALHOST, 0), 64)
        .unwrap();
    let addr = session.local_addr().unwrap();
    thread::spawn(move || loop {
        if session.accept_one().is_err() {
            break;
        }
        if session.negotiate().is_err() || session.end_connection().is_err() {
            break;
        }
    });
    addr
}

fn bench_negotiate(c: &mut Criterion) {
    let mut group = c.benchmark_group("negotiate");
    let io: Arc<dyn TransportProvider> = Arc::new(NativeTransport::new());
    let addr = spawn_server(Arc::clone(&io));

    // Init, connect and the full attested handshake over loopback TCP.
    group.bench_function("loopback_mock", |b| {
        b.iter(|| {
            let mut session =
                Session::init(config(Role::Client), &Engine::new(), Arc::clone(&io)).unwrap();
            session.connect(addr).unwrap();
            session.negotiate().unwrap();
            assert_eq!(session.state(), State::Established);
            black_box(session.cleanup().unwrap());
        });
    });

    group.finish();
}

criterion_group!(benches, bench_negotiate);
criterion_main!(benches);
