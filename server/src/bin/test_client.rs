//! Headless peer for poking a running server: connects, authenticates,
//! answers every ping and prints what the server sends.

use bytes::Bytes;
use clap::Parser;
use protocol::{Authenticate, Message, Pong, Registry};
use server::transport::{decode_frame, encode_frame, FrameKind, DEFAULT_CHANNEL};
use std::net::SocketAddr;
use tokio::net::UdpSocket;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    #[derive(Parser, Debug)]
    #[clap(author, version, about)]
    struct Args {
        /// Server address
        #[clap(short, long, default_value = "127.0.0.1:27015")]
        server: SocketAddr,
        /// Account id sent in the Authenticate message
        #[clap(short, long, default_value = "76561197960265728")]
        account: u64,
        /// Stop answering pings after this many, to watch the timeout fire
        #[clap(long)]
        pong_limit: Option<u32>,
    }

    let args = Args::parse();
    let registry = Registry::with_defaults();

    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    println!("Client socket bound to {}", socket.local_addr()?);

    println!("Sending connection request to {}", args.server);
    socket
        .send_to(&encode_frame(FrameKind::Connect, 0, &[]), args.server)
        .await?;

    let mut buf = vec![0u8; 65_536];
    let mut pongs_sent = 0u32;

    loop {
        let (len, _) = socket.recv_from(&mut buf).await?;
        let Some((kind, _, payload)) = decode_frame(&buf[..len]) else {
            println!("Ignoring malformed datagram of {} bytes", len);
            continue;
        };

        match kind {
            FrameKind::Accept => {
                println!("Connection accepted, authenticating as {}", args.account);
                let hello = registry.encode_packet(&Message::from(Authenticate::new(args.account, Some(vec![0; 32]))))?;
                socket
                    .send_to(&encode_frame(FrameKind::Data, DEFAULT_CHANNEL, &hello), args.server)
                    .await?;
            }
            FrameKind::Disconnect => {
                println!("Server closed the connection");
                return Ok(());
            }
            FrameKind::Connect => {}
            FrameKind::Data => {
                let packet = match registry.decode_packet(&Bytes::copy_from_slice(payload)) {
                    Ok(packet) => packet,
                    Err(e) => {
                        println!("Undecodable packet: {}", e);
                        continue;
                    }
                };

                match packet.message {
                    Some(Message::Ping(ping)) => {
                        let ping_id = ping.ping_id()?;
                        if args.pong_limit.map_or(false, |limit| pongs_sent >= limit) {
                            println!("Ignoring ping {}", ping_id);
                            continue;
                        }
                        let pong = registry.encode_packet(&Message::from(Pong::new(ping_id)))?;
                        socket
                            .send_to(&encode_frame(FrameKind::Data, DEFAULT_CHANNEL, &pong), args.server)
                            .await?;
                        pongs_sent += 1;
                        println!("Answered ping {}", ping_id);
                    }
                    Some(Message::MapChange(change)) => {
                        println!("Server map: {}", change.map_name()?.unwrap_or("<none>"));
                    }
                    Some(Message::Terminate(terminate)) => {
                        match terminate.reason()? {
                            Some(reason) => println!("Terminated: {}", reason),
                            None => println!("Terminated: authentication failed ({})", terminate.auth_failure()?),
                        }
                    }
                    Some(other) => println!("Received {}", other.name()),
                    None => println!("Received null {:?}", packet.tag),
                }
            }
        }
    }
}
