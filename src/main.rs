use std::path::PathBuf;

use clap::Parser;
use gdbclient::parser::parse_hex_u64;
use gdbclient::{BreakpointKind, BreakpointSpec, DebugSession, MachineKind, SessionConfig};
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser, Debug)]
#[command(name = "kdbg")]
#[command(about = "Kernel debugger for VMware and QEMU GDB stubs")]
#[command(version)]
struct Cli {
    /// JSON session config
    #[arg(value_name = "CONFIG")]
    config: Option<PathBuf>,

    /// Stub host, overrides the config
    #[arg(long)]
    host: Option<String>,

    /// Stub port, overrides the config
    #[arg(short, long)]
    port: Option<u16>,

    /// Stub dialect (qemu or vmware), overrides the config
    #[arg(short, long, value_parser = parse_machine)]
    machine: Option<MachineKind>,
}

impl Cli {
    fn session_config(&self) -> Result<SessionConfig, gdbclient::ConfigError> {
        let mut config = match &self.config {
            Some(path) => SessionConfig::load(path)?,
            None => SessionConfig::default(),
        };
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(machine) = self.machine {
            config.machine = machine;
        }
        Ok(config)
    }
}

fn parse_machine(name: &str) -> Result<MachineKind, String> {
    MachineKind::from_str(name).ok_or_else(|| format!("unknown machine '{}'", name))
}

const HELP: &str = "\
commands:
  connect [host:port]        connect to the debug stub
  disconnect
  machine <qemu|vmware>      select the stub dialect (while disconnected)
  s | step                   single step
  c | continue
  break                      interrupt a running target
  regs                       show registers
  mem <addr> <size>          hex dump memory
  dis <addr> [size]          disassemble
  bp <x|w|a> <addr> [size]   add breakpoint
  bc <x|w|a> <addr> [size]   remove breakpoint
  raw <packet>               send a raw RSP command
  mon <command>              run a monitor command
  sym <addr>                 resolve a symbol
  symbols                    load kernel symbols
  state
  quit";

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = match cli.session_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config: {}", e);
            std::process::exit(2);
        }
    };

    simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Warn)
        .with_module_level("kdbg", config.level_filter())
        .with_module_level("gdbclient", config.level_filter())
        .init()
        .unwrap();

    log::info!("kdbg starting ({} stub at {}:{})", config.machine, config.host, config.port);

    let session = DebugSession::new(config);
    session.on_stop(|event| match &event.reply {
        Some(reply) => println!("stopped: {:?} thread {:?}", reply.kind, reply.thread),
        None => println!("stopped: {}", event.packet),
    });
    session.on_state_changed(|state| log::info!("State: {}", state));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("{}", HELP);
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                log::error!("stdin: {}", e);
                break;
            }
        };

        let words: Vec<&str> = line.split_whitespace().collect();
        if words.first() == Some(&"quit") {
            break;
        }
        if let Err(e) = run_command(&session, &words).await {
            println!("error: {}", e);
        }
    }

    session.disconnect().await;
    log::info!("kdbg exiting");
}

async fn run_command(session: &DebugSession, words: &[&str]) -> Result<(), Box<dyn std::error::Error>> {
    let Some((&command, args)) = words.split_first() else {
        return Ok(());
    };

    match command {
        "connect" => match args.first().and_then(|a| a.rsplit_once(':')) {
            Some((host, port)) => session.connect_to(host, port.parse()?).await?,
            None => session.connect().await?,
        },
        "disconnect" => session.disconnect().await,
        "machine" => {
            let kind = args
                .first()
                .and_then(|a| MachineKind::from_str(a))
                .ok_or("expected qemu or vmware")?;
            session.set_active_machine(kind)?;
        }
        "s" | "step" => session.step().await?,
        "c" | "continue" => session.continue_execution().await?,
        "break" => session.break_execution().await?,
        "regs" => println!("{}", session.read_context().await?),
        "mem" => {
            let address = parse_hex_u64(args.first().ok_or("expected address")?)?;
            let size = parse_size(args.get(1), 0x40)?;
            let bytes = session.read_memory(address, size).await?;
            for row in hex_dump(address, &bytes) {
                println!("{}", row);
            }
        }
        "dis" => {
            let address = parse_hex_u64(args.first().ok_or("expected address")?)?;
            let size = parse_size(args.get(1), 0x40)?;
            for instruction in session.disassemble(address, size).await? {
                println!("{}", instruction);
            }
        }
        "bp" | "bc" => {
            let kind = args
                .first()
                .and_then(|a| BreakpointKind::from_str(a))
                .ok_or("expected breakpoint kind x, w or a")?;
            let spec = BreakpointSpec {
                kind,
                address: parse_hex_u64(args.get(1).ok_or("expected address")?)?,
                size: parse_size(args.get(2), 1)? as u64,
            };
            if command == "bp" {
                session.add_breakpoint(&spec).await?;
            } else {
                session.remove_breakpoint(&spec).await?;
            }
        }
        "raw" => println!("{}", session.execute_raw(&args.join(" ")).await?),
        "mon" => println!("{}", session.execute_monitor(&args.join(" ")).await?),
        "sym" => {
            let address = parse_hex_u64(args.first().ok_or("expected address")?)?;
            match session.lookup_symbol(address) {
                Some(symbol) => println!("{}!{}", symbol.module, symbol),
                None => println!("no symbol"),
            }
        }
        "symbols" => {
            if session.load_symbols().await? {
                println!("symbols loaded");
            } else {
                println!("kernel base not known yet");
            }
        }
        "state" => {
            println!("{}", session.state());
            if let Some(base) = session.kernel_base() {
                println!("kernel base {:#x}", base);
            }
        }
        "help" => println!("{}", HELP),
        other => println!("unknown command '{}', try help", other),
    }
    Ok(())
}

fn hex_dump(address: u64, bytes: &[u8]) -> Vec<String> {
    bytes
        .chunks(16)
        .enumerate()
        .map(|(i, row)| {
            let hex: Vec<String> = row.iter().map(|b| format!("{:02x}", b)).collect();
            format!("{:016x}  {}", address.wrapping_add((i * 16) as u64), hex.join(" "))
        })
        .collect()
}

fn parse_size(arg: Option<&&str>, default: usize) -> Result<usize, String> {
    match arg {
        Some(text) => parse_hex_u64(text).map(|n| n as usize),
        None => Ok(default),
    }
}
