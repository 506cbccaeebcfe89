use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;

use attested_link::logging::Logging;
use attested_link::proxy::host::Host;
use attested_link::sample::client::{self, ClientOptions};
use attested_link::sample::{Backends, DEFAULT_IP, DEFAULT_PORT};
use attested_link::transport::native::NativeTransport;
use attested_link::{Engine, LogLevel, TransportProvider};

#[derive(Parser)]
#[command(name = "attested-client", about = "Attested echo client")]
struct Args {
    /// Attester backend, used when mutual attestation is on
    #[arg(short, long, default_value = "")]
    attester: String,

    /// Verifier backend ("" for the default)
    #[arg(short, long, default_value = "")]
    verifier: String,

    #[arg(short, long, default_value = "")]
    tls: String,

    #[arg(short, long, default_value = "")]
    crypto: String,

    /// Present our own evidence if the server asks
    #[arg(short, long)]
    mutual: bool,

    #[arg(short, long)]
    endorsements: bool,

    /// debug, info, warn, error, fatal or off
    #[arg(short, long, default_value = "info")]
    log_level: LogLevel,

    /// Server address
    #[arg(short, long, default_value_t = DEFAULT_IP)]
    ip: Ipv4Addr,

    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    #[arg(short = 'D', long)]
    debug_enclave: bool,

    /// Talk to a verdictd echo service
    #[arg(long)]
    verdictd: bool,

    /// Route every socket call through the syscall bridge
    #[arg(long)]
    isolated: bool,
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

    let options = ClientOptions {
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
        verdictd: args.verdictd,
    };

    client::run(&options, &Engine::new(), transport)?;
    Ok(())
}
