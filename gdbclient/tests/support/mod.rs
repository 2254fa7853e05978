/// A scripted RSP stub for driving `DebugSession` over an in-memory pipe

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;

use gdbclient::parser::{decode_hex_text, encode_hex};
use gdbclient::{packet, DebugSession, DebuggerState, MachineKind, SessionConfig};

/// How the stub logs a raw break byte
pub const INTERRUPT: &str = "<break>";

pub type Requests = Arc<Mutex<Vec<String>>>;

/// Everything the stub has received so far, in order
pub fn requests(log: &Requests) -> Vec<String> {
    log.lock().unwrap().clone()
}

/// Run a stub on the far end of a duplex pipe. The handler sees each
/// request payload; `None` swallows it without an acknowledgement,
/// `Some(replies)` acknowledges it and sends the replies.
pub fn spawn_stub<F>(mut handler: F) -> (DuplexStream, Requests, JoinHandle<()>)
where
    F: FnMut(&str) -> Option<Vec<String>> + Send + 'static,
{
    let (client, mut server) = duplex(64 * 1024);
    let log: Requests = Arc::new(Mutex::new(Vec::new()));
    let received = Arc::clone(&log);

    let task = tokio::spawn(async move {
        let mut buffer = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = match server.read(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            };
            buffer.extend_from_slice(&chunk[..n]);

            for request in take_requests(&mut buffer) {
                received.lock().unwrap().push(request.clone());
                let Some(replies) = handler(&request) else {
                    continue;
                };

                let mut out = Vec::new();
                if request != INTERRUPT {
                    out.push(b'+');
                }
                for reply in replies {
                    let frame = format!("${}#{:02x}", reply, packet::checksum(reply.as_bytes()));
                    out.extend_from_slice(frame.as_bytes());
                }
                if server.write_all(&out).await.is_err() {
                    return;
                }
            }
        }
    });

    (client, log, task)
}

fn take_requests(buffer: &mut Vec<u8>) -> Vec<String> {
    let mut requests = Vec::new();
    loop {
        while let Some(&byte) = buffer.first() {
            match byte {
                b'$' => break,
                0x03 => {
                    buffer.remove(0);
                    requests.push(INTERRUPT.to_string());
                }
                // acknowledgements and noise
                _ => {
                    buffer.remove(0);
                }
            }
        }

        let Some(hash) = buffer.iter().position(|b| *b == b'#') else {
            break;
        };
        if buffer.len() < hash + 3 {
            break;
        }
        requests.push(String::from_utf8_lossy(&buffer[1..hash]).into_owned());
        buffer.drain(..hash + 3);
    }
    requests
}

/// A simulated halted x86-64 target
pub struct Target {
    /// rax..r15, rip
    pub registers: [u64; 17],
    /// rflags, cs, ss, ds, es, fs, gs
    pub segments: [u32; 7],
    /// Extra bytes appended to the `g` reply
    pub blob_padding: usize,
    pub regions: Vec<(u64, Vec<u8>)>,
    /// monitor command -> output; unknown commands answer `E01`
    pub monitor: HashMap<String, String>,
    pub packet_size: Option<usize>,
}

impl Target {
    pub fn new() -> Self {
        let mut registers = [0u64; 17];
        for (i, value) in registers.iter_mut().enumerate() {
            *value = 0x1000 + i as u64;
        }
        registers[16] = 0x0000_7ff6_1234_0000;

        Target {
            registers,
            segments: [0x246, 0x10, 0x18, 0x2b, 0x2b, 0x53, 0x2b],
            blob_padding: 0,
            regions: Vec::new(),
            monitor: HashMap::new(),
            packet_size: Some(0x190),
        }
    }

    pub fn with_rip(mut self, rip: u64) -> Self {
        self.registers[16] = rip;
        self
    }

    pub fn with_region(mut self, base: u64, bytes: Vec<u8>) -> Self {
        self.regions.push((base, bytes));
        self
    }

    pub fn with_monitor(mut self, command: &str, output: &str) -> Self {
        self.monitor.insert(command.to_string(), output.to_string());
        self
    }

    pub fn register_blob(&self) -> Vec<u8> {
        let mut blob = Vec::new();
        for value in &self.registers {
            blob.extend_from_slice(&value.to_le_bytes());
        }
        for value in &self.segments {
            blob.extend_from_slice(&value.to_le_bytes());
        }
        blob.extend(std::iter::repeat(0xcc).take(self.blob_padding));
        blob
    }

    pub fn read(&self, address: u64, len: usize) -> Option<Vec<u8>> {
        self.regions.iter().find_map(|(base, bytes)| {
            let start = address.checked_sub(*base)? as usize;
            let end = start.checked_add(len)?;
            bytes.get(start..end).map(|b| b.to_vec())
        })
    }

    pub fn respond(&mut self, request: &str) -> Option<Vec<String>> {
        let reply = |r: &str| Some(vec![r.to_string()]);

        if request == INTERRUPT {
            return reply("T02thread:01;");
        }
        if request.starts_with("qSupported") {
            return match self.packet_size {
                Some(size) => reply(&format!("PacketSize={:x};vContSupported+;swbreak+", size)),
                None => reply(""),
            };
        }
        if let Some(hex) = request.strip_prefix("qRcmd,") {
            let command = decode_hex_text(hex).unwrap_or_default();
            return match self.monitor.get(&command) {
                Some(output) => Some(vec![format!("O{}", encode_hex(output.as_bytes())), "OK".to_string()]),
                None => reply("E01"),
            };
        }
        if let Some(args) = request.strip_prefix('m') {
            let (address, len) = args.split_once(',')?;
            let address = u64::from_str_radix(address, 16).ok()?;
            let len = usize::from_str_radix(len, 16).ok()?;
            return match self.read(address, len) {
                Some(bytes) => reply(&encode_hex(&bytes)),
                None => reply("E14"),
            };
        }

        match request {
            "?" => reply("T05thread:01;"),
            "g" => reply(&encode_hex(&self.register_blob())),
            "s" | "vCont;s" => reply("T05thread:01;"),
            // acknowledged only; the target keeps running
            "c" | "vCont;c" => Some(Vec::new()),
            _ if request.starts_with('Z') || request.starts_with('z') => reply("OK"),
            _ => reply(""),
        }
    }
}

pub fn config(machine: MachineKind) -> SessionConfig {
    SessionConfig {
        machine,
        kernel_scan_pages: 0,
        ..Default::default()
    }
}

/// Connect a fresh session to `handler` and wait for the initial halt
pub async fn connect_with<F>(config: SessionConfig, handler: F) -> (DebugSession, Requests, JoinHandle<()>)
where
    F: FnMut(&str) -> Option<Vec<String>> + Send + 'static,
{
    let (stream, log, task) = spawn_stub(handler);
    let session = DebugSession::new(config);
    session.attach(stream).await.unwrap();
    assert!(
        session
            .wait_for_state(DebuggerState::Halted, std::time::Duration::from_secs(5))
            .await
    );
    (session, log, task)
}

pub async fn connect(config: SessionConfig, mut target: Target) -> (DebugSession, Requests, JoinHandle<()>) {
    connect_with(config, move |request| target.respond(request)).await
}

fn put_u16(image: &mut [u8], at: usize, value: u16) {
    image[at..at + 2].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(image: &mut [u8], at: usize, value: u32) {
    image[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

/// First page of a PE32+ image with a CodeView record naming `pdb_name`
pub fn pe_header_page(pdb_name: &str) -> Vec<u8> {
    let mut page = vec![0u8; 0x1000];
    page[..2].copy_from_slice(b"MZ");
    put_u32(&mut page, 0x3c, 0x100);
    page[0x100..0x104].copy_from_slice(b"PE\0\0");
    put_u16(&mut page, 0x104, 0x8664);
    put_u16(&mut page, 0x104 + 16, 0xf0);

    let optional = 0x100 + 24;
    put_u16(&mut page, optional, 0x20b);
    put_u32(&mut page, optional + 108, 16);
    let debug_dir = optional + 112 + 6 * 8;
    put_u32(&mut page, debug_dir, 0x600);
    put_u32(&mut page, debug_dir + 4, 28);

    put_u32(&mut page, 0x600 + 12, 2);
    put_u32(&mut page, 0x600 + 16, (24 + pdb_name.len() + 1) as u32);
    put_u32(&mut page, 0x600 + 20, 0x700);

    page[0x700..0x704].copy_from_slice(b"RSDS");
    for (i, byte) in page[0x704..0x714].iter_mut().enumerate() {
        *byte = 0xa0 + i as u8;
    }
    put_u32(&mut page, 0x714, 1);
    page[0x718..0x718 + pdb_name.len()].copy_from_slice(pdb_name.as_bytes());
    page
}

/// A 64-bit interrupt gate pointing at `handler`
pub fn idt_gate(handler: u64) -> Vec<u8> {
    let mut gate = vec![0u8; 16];
    put_u16(&mut gate, 0, handler as u16);
    put_u16(&mut gate, 2, 0x10);
    gate[5] = 0x8e;
    put_u16(&mut gate, 6, (handler >> 16) as u16);
    put_u32(&mut gate, 8, (handler >> 32) as u32);
    gate
}
