use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;

use attested_link::logging::Logging;
use attested_link::proxy::host::Host;
use attested_link::sample::server::{Server, ServerOptions};
use attested_link::sample::{Backends, DEFAULT_IP, DEFAULT_PORT};
use attested_link::transport::native::NativeTransport;
use attested_link::{Engine, LogLevel, TransportProvider};

#[derive(Parser)]
#[command(name = "attested-server", about = "Attested echo server")]
struct Args {
    /// Attester backend ("" for the default)
    #[arg(short, long, default_value = "")]
    attester: String,

    /// Verifier backend, used when mutual attestation is on
    #[arg(short, long, default_value = "")]
    verifier: String,

    /// Key agreement backend
    #[arg(short, long, default_value = "")]
    tls: String,

    /// Record cipher backend
    #[arg(short, long, default_value = "")]
    crypto: String,

    /// Require the client's evidence too
    #[arg(short, long)]
    mutual: bool,

    /// Include endorsements in our evidence
    #[arg(short, long)]
    endorsements: bool,

    /// debug, info, warn, error, fatal or off
    #[arg(short, long, default_value = "info")]
    log_level: LogLevel,

    #[arg(short, long, default_value_t = DEFAULT_IP)]
    ip: Ipv4Addr,

    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Accepted for compatibility; there is no enclave loader here
    #[arg(short = 'D', long)]
    debug_enclave: bool,

    /// Route every socket call through the syscall bridge
    #[arg(long)]
    isolated: bool,

    /// Prefix every reply with the attester's measurement and signer
    #[arg(short, long)]
    report_identity: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    Logging::new(args.log_level).install();
    if args.debug_enclave {
        tracing::debug!("debug enclave requested");
    }

    let native: Arc<dyn TransportProvider> = Arc::new(NativeTransport::new());
    let (_host, transport): (Option<Host>, Arc<dyn TransportProvider>) = if args.isolated {
        let (host, proxied) = Host::launch(native)?;
        (Some(host), Arc::new(proxied))
    } else {
        (None, native)
    };

    let options = ServerOptions {
        addr: SocketAddrV4::new(args.ip, args.port),
        backends: Backends {
            attester: args.attester,
            verifier: args.verifier,
            tls: args.tls,
            crypto: args.crypto,
            mutual: args.mutual,
            endorsements: args.endorsements,
            log_level: args.log_level,
        },
        max_connections: None,
        report_identity: args.report_identity,
    };

    let server = Server::bind(&options, &Engine::new(), transport)?;
    tracing::info!(addr = %server.local_addr()?, isolated = args.isolated, "server ready");
    server.serve()?;
    Ok(())
}
