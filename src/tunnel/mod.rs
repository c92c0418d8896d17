//! The SSH control tunnel between agent and orchestrator.
//!
//! The control channel carries REST traffic both ways: a local forward from
//! the agent to the orchestrator API, and a remote forward that lets the
//! orchestrator reach the agent API. The block-data plane never rides this
//! tunnel; NBD connects directly to the orchestrator's data address. Mixing
//! the two on one channel head-of-line-blocks small control messages behind
//! 32 MiB writes and collapses copy throughput.

pub mod enrollment;

use anyhow::Context;
use log::{info, warn};
use ssh2::Session;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::thread;
use std::time::Duration;

/// Endpoint pair for one tunnel: where to dial, who to be, what to forward.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub oma_host: String,
    pub oma_ssh_port: u16,
    pub tunnel_user: String,
    pub private_key_path: String,
    /// Local listener forwarded to the orchestrator API on the OMA loopback
    pub local_forward_port: u16,
    /// Orchestrator API port on the OMA side of the tunnel
    pub orchestrator_port: u16,
    /// Port opened on the OMA loopback, forwarded back to the agent API
    pub remote_forward_port: u16,
    /// Agent API port on this host
    pub agent_port: u16,
}

/// Keeps the control tunnel up. Each forward direction runs its own SSH
/// session; a lost session is rebuilt with capped exponential backoff.
pub struct TunnelManager {
    config: TunnelConfig,
}

impl TunnelManager {
    pub fn new(config: TunnelConfig) -> Self {
        Self { config }
    }

    /// Spawns the supervisor threads and returns immediately.
    pub fn spawn(self) -> Vec<thread::JoinHandle<()>> {
        let forward_cfg = self.config.clone();
        let reverse_cfg = self.config;

        let forward = thread::Builder::new()
            .name("tunnel-forward".into())
            .spawn(move || supervise("local forward", || run_local_forward(&forward_cfg)))
            .expect("spawning tunnel thread cannot fail");

        let reverse = thread::Builder::new()
            .name("tunnel-reverse".into())
            .spawn(move || supervise("remote forward", || run_remote_forward(&reverse_cfg)))
            .expect("spawning tunnel thread cannot fail");

        vec![forward, reverse]
    }
}

fn supervise<F>(label: &str, mut run: F)
where
    F: FnMut() -> anyhow::Result<()>,
{
    let mut backoff = Duration::from_secs(1);
    loop {
        match run() {
            Ok(()) => backoff = Duration::from_secs(1),
            Err(e) => {
                warn!("Control tunnel {} failed: {:#}; reconnecting in {:?}", label, e, backoff);
                thread::sleep(backoff);
                backoff = (backoff * 2).min(Duration::from_secs(60));
            }
        }
    }
}

fn open_session(config: &TunnelConfig) -> anyhow::Result<Session> {
    let address = format!("{}:{}", config.oma_host, config.oma_ssh_port);
    let tcp = TcpStream::connect(&address)
        .with_context(|| format!("dialing tunnel endpoint {}", address))?;

    let mut session = Session::new().context("creating SSH session")?;
    session.set_tcp_stream(tcp);
    session.handshake().context("SSH handshake")?;
    session
        .userauth_pubkey_file(
            &config.tunnel_user,
            None,
            Path::new(&config.private_key_path),
            None,
        )
        .context("public-key authentication")?;

    if !session.authenticated() {
        anyhow::bail!("tunnel endpoint rejected the enrollment key");
    }

    // Detect a dead peer within two keepalive windows instead of waiting on
    // TCP timeouts
    session.set_keepalive(true, 30);
    // Bounded blocking reads so the pump can alternate directions
    session.set_timeout(50);
    info!("Control tunnel session established to {}", address);
    Ok(session)
}

/// Agent-side listener forwarding to the orchestrator API over the tunnel.
/// Control traffic is short-lived request/response; connections are pumped
/// one at a time, which keeps the session usage single-threaded.
fn run_local_forward(config: &TunnelConfig) -> anyhow::Result<()> {
    let session = open_session(config)?;
    let listener = TcpListener::bind(("127.0.0.1", config.local_forward_port))
        .with_context(|| format!("binding local forward port {}", config.local_forward_port))?;

    for stream in listener.incoming() {
        let stream = stream.context("accepting local forward connection")?;
        let channel = session
            .channel_direct_tcpip("127.0.0.1", config.orchestrator_port, None)
            .context("opening direct-tcpip channel")?;
        if let Err(e) = pump(stream, channel) {
            warn!("Forwarded connection ended with error: {:#}", e);
        }
        if session.keepalive_send().is_err() {
            anyhow::bail!("session lost");
        }
    }

    Ok(())
}

/// OMA-side loopback listener forwarded back to the agent API on this host.
fn run_remote_forward(config: &TunnelConfig) -> anyhow::Result<()> {
    let session = open_session(config)?;
    let (mut listener, actual_port) = session
        .channel_forward_listen(config.remote_forward_port, Some("127.0.0.1"), None)
        .context("requesting remote forward listener")?;
    info!("Remote forward listening on OMA loopback port {}", actual_port);

    loop {
        let channel = listener.accept().context("accepting remote forward channel")?;
        let stream = TcpStream::connect(("127.0.0.1", config.agent_port))
            .context("connecting to local agent API")?;
        if let Err(e) = pump(stream, channel) {
            warn!("Reverse-forwarded connection ended with error: {:#}", e);
        }
    }
}

/// Bidirectional copy between a TCP stream and an SSH channel until either
/// side closes. Channels and blocking sockets have no select; short read
/// timeouts alternate the two directions.
fn pump(stream: TcpStream, mut channel: ssh2::Channel) -> anyhow::Result<()> {
    stream.set_read_timeout(Some(Duration::from_millis(50)))?;
    let mut stream_reader = stream.try_clone()?;
    let mut stream_writer = stream;
    let mut buf = [0u8; 16 * 1024];

    loop {
        match stream_reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                channel.write_all(&buf[..n])?;
                channel.flush()?;
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) => return Err(e.into()),
        }

        match channel.read(&mut buf) {
            Ok(0) => {
                if channel.eof() {
                    break;
                }
            }
            Ok(n) => {
                stream_writer.write_all(&buf[..n])?;
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) => return Err(e.into()),
        }
    }

    let _ = channel.close();
    Ok(())
}
