use clap::Parser;
use std::collections::HashSet;
use std::env;
use std::fs::File;
use std::io;
use std::io::BufReader;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use dns_server::catalog::Catalog;
use dns_server::metrics::{ZONES_LOADED, ZONE_RELOADS_TOTAL};
use dns_server::pipeline::{serve_udp, UdpConfig};
use dns_server::quic::{serve_quic, QuicConfig};
use dns_server::requestor::{send_notify, Requestor};
use dns_server::tcp::{serve_tcp, TcpConfig};
use dns_types::zones::types::{Zone, ZoneSet};

use crate::fs_util::*;
use crate::metrics::serve_prometheus_endpoint_task;

mod fs_util;
mod metrics;

/// Load every configured zone file, producing the set the server is
/// authoritative for.
async fn load_zone_set(args: &Args) -> Option<ZoneSet> {
    let mut is_error = false;
    let mut zone_file_paths = args.zone_file.clone();

    for path in &args.zones_dir {
        match get_files_from_dir(path).await {
            Ok(mut paths) => zone_file_paths.append(&mut paths),
            Err(error) => {
                tracing::warn!(?path, ?error, "could not read zone directory");
                is_error = true;
            }
        }
    }

    let mut zones = ZoneSet::new();
    for path in &zone_file_paths {
        match zone_from_file(Path::new(path)).await {
            Ok(Ok(zone)) => {
                tracing::info!(
                    apex = %zone.apex(),
                    serial = %zone.soa().serial,
                    records = %zone.record_count(),
                    "loaded zone"
                );
                zones.insert(zone);
            }
            Ok(Err(error)) => {
                tracing::warn!(?path, %error, "could not parse zone file");
                is_error = true;
            }
            Err(error) => {
                tracing::warn!(?path, ?error, "could not read zone file");
                is_error = true;
            }
        }
    }

    if is_error {
        None
    } else {
        Some(zones)
    }
}

/// Bind one UDP socket per worker on the same address, sharing the
/// port with `SO_REUSEPORT` so the kernel spreads datagrams across
/// workers.
fn bind_udp_worker_sockets(
    address: SocketAddr,
    workers: usize,
) -> io::Result<Vec<std::net::UdpSocket>> {
    let mut sockets = Vec::with_capacity(workers);
    for _ in 0..workers {
        let socket = socket2::Socket::new(
            socket2::Domain::for_address(address),
            socket2::Type::DGRAM,
            Some(socket2::Protocol::UDP),
        )?;
        socket.set_reuse_address(true)?;
        socket.set_reuse_port(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&address.into())?;
        sockets.push(socket.into());
    }
    Ok(sockets)
}

/// Load the DoQ certificate chain and private key.
fn load_tls(cert_path: &Path, key_path: &Path) -> Result<rustls::ServerConfig, String> {
    let mut cert_reader = BufReader::new(
        File::open(cert_path).map_err(|error| format!("could not open certificate: {error}"))?,
    );
    let certs = rustls_pemfile::certs(&mut cert_reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|error| format!("could not parse certificate: {error}"))?;

    let mut key_reader = BufReader::new(
        File::open(key_path).map_err(|error| format!("could not open key: {error}"))?,
    );
    let key = rustls_pemfile::private_key(&mut key_reader)
        .map_err(|error| format!("could not parse key: {error}"))?
        .ok_or_else(|| "no private key in file".to_string())?;

    rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|error| format!("unusable certificate or key: {error}"))
}

/// Send NOTIFY for each zone to every configured secondary.
async fn notify_secondaries(args: &Args, zones: Vec<Zone>) {
    if args.notify.is_empty() || zones.is_empty() {
        return;
    }

    let requestor = Requestor {
        attempt_timeout: Duration::from_secs(args.notify_timeout),
        source: None,
    };

    for zone in &zones {
        for target in &args.notify {
            // outcomes are counted and logged by the requestor
            let _ = send_notify(&requestor, zone, &[*target]).await;
        }
    }
}

/// Reload zones on SIGUSR1, publish the new snapshot, and notify
/// secondaries of every zone whose serial moved.
async fn reload_task(catalog: Arc<Catalog>, args: Args) {
    let mut stream = match signal(SignalKind::user_defined1()) {
        Ok(stream) => stream,
        Err(error) => {
            tracing::error!(?error, "could not subscribe to SIGUSR1");
            process::exit(1);
        }
    };

    loop {
        stream.recv().await;
        tracing::info!("SIGUSR1 received, reloading zones");

        match load_zone_set(&args).await {
            Some(zones) => {
                let old = catalog.lease();
                let changed: Vec<Zone> = zones
                    .iter()
                    .filter(|zone| {
                        old.get(zone.apex())
                            .map_or(true, |previous| previous.soa().serial != zone.soa().serial)
                    })
                    .cloned()
                    .collect();

                ZONES_LOADED.set(i64::try_from(zones.len()).unwrap_or(i64::MAX));
                catalog.publish(zones);
                ZONE_RELOADS_TOTAL.with_label_values(&["ok"]).inc();
                tracing::info!(changed = %changed.len(), "zones reloaded");

                notify_secondaries(&args, changed).await;
            }
            None => {
                ZONE_RELOADS_TOTAL.with_label_values(&["failed"]).inc();
                tracing::warn!("reload failed, keeping the current zones");
            }
        }
    }
}

fn begin_logging() {
    let log_format = if let Ok(var) = env::var("RUST_LOG_FORMAT") {
        let mut set = HashSet::new();
        for s in var.split(',') {
            set.insert(s.to_string());
        }
        set
    } else {
        HashSet::new()
    };

    let logger = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(!log_format.contains("no-ansi"));

    if log_format.contains("json") {
        if log_format.contains("no-time") {
            logger.json().without_time().init();
        } else {
            logger.json().init();
        }
    } else if log_format.contains("pretty") {
        if log_format.contains("no-time") {
            logger.pretty().without_time().init();
        } else {
            logger.pretty().init();
        }
    } else if log_format.contains("no-time") {
        logger.without_time().init();
    } else {
        logger.init();
    }
}

// the doc comments for this struct turn into the CLI help text
#[derive(Debug, Parser, Clone)]
/// An authoritative DNS name server.
///
/// zoned answers queries for the zones it loads from master files,
/// over UDP, TCP, and (given a certificate) QUIC.  It never recurses.
///
/// Zones are reloaded on SIGUSR1; secondaries configured with
/// --notify get a NOTIFY whenever a zone's serial moves.
///
/// Prometheus metrics are served at
/// "http://{metrics_interface}:{metrics_port}/metrics"
struct Args {
    /// Interface to listen on
    #[clap(short, long, value_parser, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    interface: IpAddr,

    /// Port to serve UDP and TCP DNS on
    #[clap(short, long, value_parser, default_value_t = 53)]
    port: u16,

    /// UDP worker tasks, each with its own SO_REUSEPORT socket (0
    /// means one per CPU)
    #[clap(short = 'w', long, value_parser, default_value_t = 0)]
    udp_workers: usize,

    /// Datagrams one worker drains per wakeup before flushing
    /// responses
    #[clap(long, value_parser, default_value_t = 64)]
    batch_size: usize,

    /// Largest UDP response payload to send, EDNS or not
    #[clap(long, value_parser, default_value_t = 1232)]
    payload_max: u16,

    /// Port to serve DNS over QUIC on (requires --tls-cert/--tls-key)
    #[clap(long, value_parser)]
    quic_port: Option<u16>,

    /// PEM certificate chain for DoQ
    #[clap(long, value_parser)]
    tls_cert: Option<PathBuf>,

    /// PEM private key for DoQ
    #[clap(long, value_parser)]
    tls_key: Option<PathBuf>,

    /// Path to a zone file, can be specified more than once
    #[clap(short = 'z', long, value_parser)]
    zone_file: Vec<PathBuf>,

    /// Path to a directory to read zone files from, can be specified
    /// more than once
    #[clap(short = 'Z', long, value_parser)]
    zones_dir: Vec<PathBuf>,

    /// Secondary to NOTIFY on zone changes, can be specified more
    /// than once
    #[clap(short = 'n', long, value_parser)]
    notify: Vec<SocketAddr>,

    /// Seconds to wait for each NOTIFY response
    #[clap(long, value_parser, default_value_t = 5)]
    notify_timeout: u64,

    /// Interface to listen on to serve Prometheus metrics
    #[clap(long, value_parser, default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    metrics_interface: IpAddr,

    /// Port to listen on to serve Prometheus metrics
    #[clap(long, value_parser, default_value_t = 9420)]
    metrics_port: u16,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    begin_logging();

    let zones = match load_zone_set(&args).await {
        Some(zones) => zones,
        None => {
            tracing::error!("could not load zones");
            process::exit(1);
        }
    };
    ZONES_LOADED.set(i64::try_from(zones.len()).unwrap_or(i64::MAX));

    let dns_address = SocketAddr::new(args.interface, args.port);
    let workers = if args.udp_workers == 0 {
        std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
    } else {
        args.udp_workers
    };

    tracing::info!(address = %dns_address, %workers, "binding DNS UDP sockets");
    let udp_sockets = match bind_udp_worker_sockets(dns_address, workers) {
        Ok(sockets) => sockets,
        Err(error) => {
            tracing::error!(?error, "could not bind DNS UDP sockets");
            process::exit(1);
        }
    };

    tracing::info!(address = %dns_address, "binding DNS TCP socket");
    let tcp_listener = match std::net::TcpListener::bind(dns_address) {
        Ok(listener) => listener,
        Err(error) => {
            tracing::error!(?error, "could not bind DNS TCP socket");
            process::exit(1);
        }
    };

    let quic = match (&args.quic_port, &args.tls_cert, &args.tls_key) {
        (Some(port), Some(cert), Some(key)) => {
            let tls = match load_tls(cert, key) {
                Ok(tls) => tls,
                Err(error) => {
                    tracing::error!(%error, "could not load TLS material");
                    process::exit(1);
                }
            };
            let address = SocketAddr::new(args.interface, *port);
            tracing::info!(%address, "binding DNS QUIC socket");
            match std::net::UdpSocket::bind(address) {
                Ok(socket) => Some((socket, tls)),
                Err(error) => {
                    tracing::error!(?error, "could not bind DNS QUIC socket");
                    process::exit(1);
                }
            }
        }
        (None, _, _) => None,
        _ => {
            tracing::error!("--quic-port requires both --tls-cert and --tls-key");
            process::exit(1);
        }
    };

    let catalog = Arc::new(Catalog::new(zones));
    let cancel = CancellationToken::new();
    let mut servers: Vec<JoinHandle<()>> = Vec::new();

    let udp_config = UdpConfig {
        batch_size: args.batch_size.max(1),
        payload_max: args.payload_max,
    };
    for socket in udp_sockets {
        let catalog = catalog.clone();
        let cancel = cancel.clone();
        servers.push(tokio::spawn(async move {
            if let Err(error) = serve_udp(socket, catalog, udp_config, cancel).await {
                tracing::error!(%error, "UDP worker failed");
            }
        }));
    }

    {
        let catalog = catalog.clone();
        let cancel = cancel.clone();
        servers.push(tokio::spawn(async move {
            if let Err(error) = serve_tcp(tcp_listener, catalog, TcpConfig::default(), cancel).await
            {
                tracing::error!(%error, "TCP listener failed");
            }
        }));
    }

    if let Some((socket, tls)) = quic {
        let catalog = catalog.clone();
        let cancel = cancel.clone();
        servers.push(tokio::spawn(async move {
            if let Err(error) =
                serve_quic(socket, tls, catalog, QuicConfig::default(), cancel).await
            {
                tracing::error!(%error, "QUIC endpoint failed");
            }
        }));
    }

    tokio::spawn(reload_task(catalog.clone(), args.clone()));

    {
        // tell secondaries we are up, with whatever serials we hold
        let args = args.clone();
        let catalog = catalog.clone();
        tokio::spawn(async move {
            let zones: Vec<Zone> = catalog.lease().iter().cloned().collect();
            notify_secondaries(&args, zones).await;
        });
    }

    let metrics_address = SocketAddr::new(args.metrics_interface, args.metrics_port);
    tracing::info!(address = %metrics_address, "binding metrics HTTP socket");
    tokio::spawn(async move {
        if let Err(error) = serve_prometheus_endpoint_task(metrics_address).await {
            tracing::error!(?error, "could not serve metrics endpoint");
        }
    });

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(error) => {
            tracing::error!(?error, "could not subscribe to SIGTERM");
            process::exit(1);
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("SIGINT received"),
        _ = sigterm.recv() => tracing::info!("SIGTERM received"),
    }

    tracing::info!("shutting down");
    cancel.cancel();
    for server in servers {
        let _ = server.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn reuseport_sockets_share_an_address() {
        let address = SocketAddr::from(([127, 0, 0, 1], 0));
        let first = bind_udp_worker_sockets(address, 1).unwrap();
        let bound = first[0].local_addr().unwrap();

        // more workers can bind the same concrete port
        let rest = bind_udp_worker_sockets(bound, 3).unwrap();
        assert_eq!(3, rest.len());
        for socket in &rest {
            assert_eq!(bound, socket.local_addr().unwrap());
        }
    }

    #[tokio::test]
    async fn load_zone_set_reads_files_and_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("example.com.zone");
        let mut file = File::create(&path).unwrap();
        writeln!(file, "$ORIGIN example.com.").unwrap();
        writeln!(file, "$TTL 300").unwrap();
        writeln!(file, "@ IN SOA ns1.example.com. host.example.com. 1 2 3 4 5").unwrap();
        writeln!(file, "www IN A 192.0.2.1").unwrap();

        let args = Args::parse_from(["zoned", "-Z", dir.path().to_str().unwrap()]);
        let zones = load_zone_set(&args).await.unwrap();
        assert_eq!(1, zones.len());

        let args = Args::parse_from(["zoned", "-z", path.to_str().unwrap()]);
        let zones = load_zone_set(&args).await.unwrap();
        assert_eq!(1, zones.len());
    }

    #[tokio::test]
    async fn load_zone_set_rejects_broken_zones() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.zone");
        let mut file = File::create(&path).unwrap();
        writeln!(file, "no soa here").unwrap();

        let args = Args::parse_from(["zoned", "-z", path.to_str().unwrap()]);
        assert!(load_zone_set(&args).await.is_none());
    }

    #[test]
    fn tls_loading_requires_real_material() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("cert.pem");
        let key = dir.path().join("key.pem");
        File::create(&cert).unwrap();
        File::create(&key).unwrap();

        assert!(load_tls(&cert, &key).is_err());
        assert!(load_tls(Path::new("/nonexistent"), &key).is_err());
    }
}
