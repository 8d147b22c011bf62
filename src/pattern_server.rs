use anyhow::{Context, Result};
use std::io::{ErrorKind, Read};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::config::Config;
use crate::element::{decode_records, WIRE_RECORD_SIZE};
use crate::link::BoardLink;

const RECV_BUFFER_SIZE: usize = 16384; // 16KB

// Message commands accepted over TCP. Header is 4 bytes:
// command (1), reserved (1), payload length (2, big-endian).
const MSG_SET_PATTERN: u8 = 0x00;
const MSG_SWAP_BUFFERS: u8 = 0x01;
const MSG_SET_AMP_MOD_STEP: u8 = 0x02;
const MSG_TOGGLE_MULTIPLEX: u8 = 0x03;

/// Server that receives pattern updates and drives the board links
pub struct PatternServer {
    config: Config,
    links: Vec<BoardLink>,
    patterns_received: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
    debug: bool,
    ddebug: bool,
}

impl PatternServer {
    /// Create a new pattern server, opening every configured board
    pub fn new(config: Config, debug: bool, ddebug: bool) -> Result<Self> {
        let mut links = Vec::new();

        for board_config in &config.boards {
            match BoardLink::open(board_config.clone(), debug, ddebug) {
                Ok(link) => links.push(link),
                Err(e) => eprintln!("✗ Failed to open {}: {}", board_config.port, e),
            }
        }

        if links.is_empty() {
            anyhow::bail!("No boards could be opened");
        }

        Ok(PatternServer {
            config,
            links,
            patterns_received: Arc::new(AtomicU64::new(0)),
            running: Arc::new(AtomicBool::new(true)),
            debug,
            ddebug,
        })
    }

    /// Get a clone of the running flag for signal handlers
    pub fn get_running_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Gracefully shutdown - silence all boards and commit
    pub fn shutdown(&mut self) {
        if self.debug {
            println!("Silencing boards...");
        }

        for link in &mut self.links {
            let _ = link.silence();
        }

        if self.debug {
            println!("✓ Server stopped");
        }
    }

    /// Run the pattern server (blocks until the running flag clears)
    pub fn run(&mut self) -> Result<()> {
        let addr = format!("{}:{}", self.config.listen.host, self.config.listen.port);
        let listener = TcpListener::bind(&addr)
            .context(format!("Failed to bind to {}", addr))?;

        // Set nonblocking so accept() can check running flag periodically
        listener.set_nonblocking(true)?;

        if self.debug {
            println!("✓ Pattern server listening on {}", addr);
            println!("Waiting for client connection...");
            println!("(Press Ctrl-C to stop)");
        }

        // Spawn statistics thread if debug enabled
        if self.debug {
            self.spawn_stats_thread();
        }

        loop {
            // Check if we should stop
            if !self.running.load(Ordering::Relaxed) {
                break;
            }

            // Try to accept a connection
            match listener.accept() {
                Ok((stream, peer_addr)) => {
                    if self.debug {
                        println!("✓ Client connected from {}", peer_addr);
                    }

                    if let Err(e) = self.handle_client(stream) {
                        eprintln!("Error handling client: {}", e);
                    }

                    if self.debug {
                        println!("Client disconnected");
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                    // No connection ready, sleep briefly to avoid busy-waiting
                    thread::sleep(Duration::from_millis(100));
                }
                Err(e) => {
                    eprintln!("Error accepting connection: {}", e);
                    thread::sleep(Duration::from_millis(100));
                }
            }
        }

        Ok(())
    }

    /// Handle a single client connection with non-blocking TCP reads
    fn handle_client(&mut self, mut stream: TcpStream) -> Result<()> {
        stream
            .set_nonblocking(true)
            .context("Failed to set socket to non-blocking mode")?;

        let mut buffer = Vec::new();
        let mut read_buf = vec![0u8; RECV_BUFFER_SIZE];

        while self.running.load(Ordering::Relaxed) {
            // Drain everything currently available before parsing
            loop {
                match stream.read(&mut read_buf) {
                    Ok(0) => {
                        // Connection closed by client
                        return Ok(());
                    }
                    Ok(n) => {
                        buffer.extend_from_slice(&read_buf[..n]);
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => {
                        // No more data available right now
                        break;
                    }
                    Err(e) if e.kind() == ErrorKind::Interrupted => {
                        continue;
                    }
                    Err(e) => {
                        return Err(e.into());
                    }
                }
            }

            // Process complete messages from buffer
            while buffer.len() >= 4 {
                let command = buffer[0];
                let length = u16::from_be_bytes([buffer[2], buffer[3]]) as usize;

                // Check if we have the complete message
                let message_size = 4 + length;
                if buffer.len() < message_size {
                    break; // Wait for more data
                }

                let payload: Vec<u8> = buffer.drain(..message_size).skip(4).collect();
                self.dispatch(command, &payload);
            }

            // Small sleep to avoid busy-looping
            thread::sleep(Duration::from_millis(1));
        }

        Ok(())
    }

    /// Decode one message and apply it to every board link
    fn dispatch(&mut self, command: u8, payload: &[u8]) {
        match command {
            MSG_SET_PATTERN => {
                if self.ddebug {
                    eprintln!(
                        "[DEBUG] Pattern message: {} bytes, {} elements",
                        payload.len(),
                        payload.len() / WIRE_RECORD_SIZE
                    );
                    let hex: String = payload
                        .iter()
                        .take(30)
                        .map(|b| format!("{:02x}", b))
                        .collect::<Vec<_>>()
                        .join(" ");
                    eprintln!("[DEBUG] First 30 bytes received: {}", hex);
                }

                // Each link filters by its own origin
                let elements = decode_records(payload);
                self.broadcast(|link| link.send_pattern(&elements));
                self.patterns_received.fetch_add(1, Ordering::Relaxed);
            }
            MSG_SWAP_BUFFERS => {
                self.broadcast(|link| link.switch_buffers());
            }
            MSG_SET_AMP_MOD_STEP => match payload.first() {
                Some(&step) => {
                    self.broadcast(|link| link.set_amp_modulation_step(step));
                }
                None => {
                    eprintln!("Amp-mod step message without a step byte, ignored");
                }
            },
            MSG_TOGGLE_MULTIPLEX => {
                self.broadcast(|link| link.toggle_quick_multiplex());
            }
            other => {
                if self.ddebug {
                    eprintln!("[DEBUG] Ignoring unknown command {:#04x}", other);
                }
            }
        }
    }

    /// Apply an operation to every link, disconnecting links that fail
    fn broadcast<F>(&mut self, op: F)
    where
        F: Fn(&mut BoardLink) -> Result<()>,
    {
        for link in &mut self.links {
            if let Err(e) = op(link) {
                eprintln!("✗ Serial error on {}: {}", link.config().port, e);
                eprintln!("✗ Board {} is now disconnected", link.config().port);
                link.disconnect();
            }
        }
    }

    /// Spawn statistics thread
    fn spawn_stats_thread(&self) {
        let patterns_received = Arc::clone(&self.patterns_received);
        let running = Arc::clone(&self.running);
        let link_counters: Vec<_> = self
            .links
            .iter()
            .map(|l| (l.config().port.clone(), l.frames_sent_counter()))
            .collect();

        thread::spawn(move || {
            let mut last_received = 0u64;
            let mut last_sent: Vec<u64> = vec![0; link_counters.len()];

            while running.load(Ordering::Relaxed) {
                thread::sleep(Duration::from_secs(5));

                let current_received = patterns_received.load(Ordering::Relaxed);
                let received_delta = current_received - last_received;
                let received_fps = received_delta as f64 / 5.0;

                print!("[Stats] Patterns: {:.1}/s", received_fps);

                for (i, (port, counter)) in link_counters.iter().enumerate() {
                    let current = counter.load(Ordering::Relaxed);
                    let delta = current - last_sent[i];
                    let fps = delta as f64 / 5.0;
                    print!(", {}: {:.1}/s", port, fps);
                    last_sent[i] = current;
                }

                println!();

                last_received = current_received;
            }
        });
    }
}
