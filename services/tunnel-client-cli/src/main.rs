// tunnel-client: opens a local TCP listener and tunnels connections over
// HTTP long-polling to a tunnel-server-bin instance.

mod local_proxy;

use clap::Parser;
use tracing::{error, info};
use tunnel_client::{ClientByteStream, ClientConfig, ClientStreamProcessor};
use tunnel_wire::{Packet, PacketBody, PacketKind, TunnelOpenPayload, TunnelType};

use local_proxy::LocalProxy;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Base URL of the tunnel server's push endpoint, e.g. http://host:8080/push
    #[arg(long)]
    push_url: String,

    /// Base URL of the tunnel server's poll endpoint, e.g. http://host:8080/poll
    #[arg(long)]
    poll_url: String,

    /// Local TCP port to listen on for consumers of the tunneled stream.
    #[arg(short, long, default_value_t = 0)]
    port: u16,

    /// Advisory client id sent in the initial handshake.
    #[arg(long, default_value_t = 0)]
    client_id: i64,

    /// Mapping id identifying the tunnel route to open.
    #[arg(long)]
    mapping_id: String,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    info!(version = env!("CARGO_PKG_VERSION"), "tunnel-client starting");

    let control = ClientStreamProcessor::new(
        ClientConfig::new(args.push_url.clone(), args.poll_url.clone())
            .with_client_id(args.client_id),
        TunnelType::Control,
    );

    if let Err(e) = control
        .write_packet(Packet::new(
            PacketKind::Handshake,
            PacketBody::Json(serde_json::json!({ "client_id": args.client_id })),
        ))
        .await
    {
        error!(error = %e, "handshake push failed");
        std::process::exit(1);
    }
    match control.read_packet().await {
        Ok(packet) if packet.kind == PacketKind::HandshakeResponse => {
            info!("handshake accepted")
        }
        Ok(packet) => {
            error!(?packet.kind, "unexpected reply to handshake");
            std::process::exit(1);
        }
        Err(e) => {
            error!(error = %e, "handshake response not received");
            std::process::exit(1);
        }
    }

    if let Err(e) = control
        .write_packet(Packet::new(
            PacketKind::TunnelOpen,
            PacketBody::Json(serde_json::json!(TunnelOpenPayload {
                mapping_id: args.mapping_id.clone(),
            })),
        ))
        .await
    {
        error!(error = %e, "tunnel-open push failed");
        std::process::exit(1);
    }
    match control.read_packet().await {
        Ok(packet) if packet.kind == PacketKind::TunnelOpenAck => info!("tunnel open acknowledged"),
        Ok(packet) => {
            error!(?packet.kind, "unexpected reply to tunnel-open");
            std::process::exit(1);
        }
        Err(e) => {
            error!(error = %e, "tunnel-open-ack not received");
            std::process::exit(1);
        }
    }

    let mut data_config = ClientConfig::new(args.push_url, args.poll_url).with_client_id(args.client_id);
    if let Some(connection_id) = control.connection_id().await {
        data_config = data_config.with_connection_id(connection_id);
    }
    let data = ClientStreamProcessor::new(data_config, TunnelType::Data);
    data.start_data_poll();

    let stream = ClientByteStream::new(data);
    let proxy = match LocalProxy::bind(args.port, stream).await {
        Ok(proxy) => proxy,
        Err(e) => {
            error!(error = %e, "failed to bind local proxy");
            std::process::exit(1);
        }
    };
    info!(port = proxy.port, "tunnel bridged to local TCP");

    std::future::pending::<()>().await;
}
