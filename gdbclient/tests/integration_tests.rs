/// Integration tests for the debug session
///
/// These drive a full `DebugSession` against a scripted stub over an
/// in-memory pipe, covering the wire traffic and the state machine together.

mod support;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use gdbclient::symbols::{Symbol, KERNEL_MODULE};
use gdbclient::*;
use support::{config, connect, connect_with, idt_gate, pe_header_page, requests, spawn_stub, Target, INTERRUPT};

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn test_connect_negotiates_and_halts() {
    let (session, log, _stub) = connect(config(MachineKind::Qemu), Target::new()).await;

    assert_eq!(session.state(), DebuggerState::Halted);
    let features = session.features().unwrap();
    assert_eq!(features.packet_size, Some(0x190));
    assert!(features.vcont);

    let sent = requests(&log);
    assert_eq!(sent[0], "?");
    assert_eq!(sent[1], SUPPORTED_QUERY);

    // a second connect is refused without touching the live session
    let (stream, _, _) = spawn_stub(|_| None);
    let err = session.attach(stream).await.unwrap_err();
    assert!(matches!(err, DebugError::InvalidState { operation: "connect", .. }));
    assert_eq!(session.state(), DebuggerState::Halted);
}

#[tokio::test]
async fn test_read_context_from_long_blob() {
    let mut target = Target::new().with_rip(0xfffff800_00123456);
    target.blob_padding = 208 - 164;
    let (session, _log, _stub) = connect(config(MachineKind::Qemu), target).await;

    let context = session.read_context().await.unwrap();
    assert_eq!(context.rip, 0xfffff800_00123456);
    assert_eq!(context.rax, 0x1000);
    assert_eq!(context.r15, 0x100f);
    assert_eq!(context.rflags, 0x246);
    assert_eq!(context.cs, 0x10);
    assert!(context.control.is_none());
}

#[tokio::test]
async fn test_vmware_context_tolerates_failed_registers() {
    let target = Target::new()
        .with_monitor("r cr0", "cr0=0x80050033\n")
        .with_monitor("r cr3", "cr3=0x1ad000")
        .with_monitor("r idtr", "idtr base=0xfffff80000400000 limit=0xfff");
    let (session, log, _stub) = connect(config(MachineKind::Vmware), target).await;

    let context = session.read_context().await.unwrap();
    let control = context.control.unwrap();
    assert_eq!(control.cr0, 0x80050033);
    assert_eq!(control.cr3, 0x1ad000);
    assert_eq!(control.cr2, 0);
    assert_eq!(control.idtr.base, 0xfffff800_00400000);
    assert_eq!(control.idtr.limit, 0xfff);
    assert_eq!(control.gdtr.base, 0);

    let monitor_queries = requests(&log).iter().filter(|r| r.starts_with("qRcmd,")).count();
    assert_eq!(monitor_queries, 7);
}

#[tokio::test]
async fn test_monitor_output_accumulates() {
    let mut target = Target::new();
    let handler = move |request: &str| {
        if request == format!("qRcmd,{}", parser::encode_hex(b"hello")) {
            Some(vec![
                "O68656c6c6f".to_string(),
                "O20776f726c64".to_string(),
                "OK".to_string(),
            ])
        } else {
            target.respond(request)
        }
    };
    let (session, _log, _stub) = connect_with(config(MachineKind::Vmware), handler).await;

    assert_eq!(session.execute_monitor("hello").await.unwrap(), "hello world");

    let err = session.execute_monitor("unknown").await.unwrap_err();
    assert!(matches!(err, DebugError::Command(CommandError::Remote(ref e)) if e == "E01"));
}

#[tokio::test]
async fn test_step_round_trip() {
    let (session, log, _stub) = connect(config(MachineKind::Vmware), Target::new()).await;

    let stops = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&stops);
    session.on_stop(move |event| {
        recorded.lock().unwrap().push(event.reply.as_ref().and_then(|r| r.signal()));
    });
    let resumes = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&resumes);
    session.on_resumed(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    session.step().await.unwrap();
    assert!(session.wait_for_state(DebuggerState::Halted, Duration::from_secs(5)).await);
    assert!(eventually(|| !stops.lock().unwrap().is_empty()).await);

    assert_eq!(stops.lock().unwrap()[0], Some(5));
    assert_eq!(resumes.load(Ordering::SeqCst), 1);
    assert!(requests(&log).contains(&"s".to_string()));
}

#[tokio::test]
async fn test_continue_and_break() {
    let (session, log, _stub) = connect(config(MachineKind::Qemu), Target::new()).await;

    let states = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&states);
    session.on_state_changed(move |state| recorded.lock().unwrap().push(state));

    session.continue_execution().await.unwrap();
    assert!(session.wait_for_state(DebuggerState::Running, Duration::from_secs(5)).await);

    // inspection is refused while the target runs
    let err = session.read_memory(0x1000, 4).await.unwrap_err();
    assert!(matches!(err, DebugError::InvalidState { state: DebuggerState::Running, .. }));
    assert!(session.step().await.is_err());

    session.break_execution().await.unwrap();
    assert!(session.wait_for_state(DebuggerState::Halted, Duration::from_secs(5)).await);

    let sent = requests(&log);
    assert!(sent.contains(&"vCont;c".to_string()));
    assert_eq!(sent.last().map(String::as_str), Some(INTERRUPT));
    assert_eq!(
        *states.lock().unwrap(),
        vec![
            DebuggerState::Busy,
            DebuggerState::Running,
            DebuggerState::Busy,
            DebuggerState::Halted
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_step_timeout_rolls_back() {
    let mut target = Target::new();
    let handler = move |request: &str| match request {
        "s" => None,
        _ => target.respond(request),
    };
    let (session, _log, _stub) = connect_with(config(MachineKind::Vmware), handler).await;

    let err = session.step().await.unwrap_err();
    match err {
        DebugError::Command(CommandError::Transport(TransportError::CommandTimeout { command, timeout })) => {
            assert_eq!(command, "s");
            assert_eq!(timeout, Duration::from_secs(3));
        }
        other => panic!("unexpected error: {}", other),
    }

    assert!(session.pending_commands().is_empty());
    assert_eq!(session.state(), DebuggerState::Halted);
}

#[tokio::test(start_paused = true)]
async fn test_commands_are_single_flight() {
    let mut target = Target::new();
    let handler = move |request: &str| match request {
        "qSlow" => None,
        "qFast" => Some(vec!["fast".to_string()]),
        _ => target.respond(request),
    };
    let mut cfg = config(MachineKind::Qemu);
    cfg.command_timeout_ms = 1000;
    let (session, log, _stub) = connect_with(cfg, handler).await;

    let slow = tokio::spawn({
        let session = session.clone();
        async move { session.execute_raw("qSlow").await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    let fast = tokio::spawn({
        let session = session.clone();
        async move { session.execute_raw("qFast").await }
    });

    tokio::time::sleep(Duration::from_millis(500)).await;
    let sent = requests(&log);
    assert!(sent.contains(&"qSlow".to_string()));
    assert!(!sent.contains(&"qFast".to_string()));

    assert!(slow.await.unwrap().is_err());
    assert_eq!(fast.await.unwrap().unwrap(), "fast");

    let sent = requests(&log);
    let slow_at = sent.iter().position(|r| r == "qSlow").unwrap();
    let fast_at = sent.iter().position(|r| r == "qFast").unwrap();
    assert!(slow_at < fast_at);
}

#[tokio::test]
async fn test_chunked_memory_read() {
    let bytes: Vec<u8> = (0..20u8).collect();
    let target = Target::new().with_region(0x401000, bytes.clone());
    let mut cfg = config(MachineKind::Qemu);
    cfg.negotiate_features = false;
    cfg.packet_size = 16;
    let (session, log, _stub) = connect(cfg, target).await;

    assert_eq!(session.read_memory(0x401000, 20).await.unwrap(), bytes);
    let reads: Vec<String> = requests(&log).into_iter().filter(|r| r.starts_with('m')).collect();
    assert_eq!(reads, vec!["m401000,8", "m401008,8", "m401010,4"]);

    // the last chunk runs off the mapped region
    let err = session.read_memory(0x401000, 24).await.unwrap_err();
    assert!(matches!(err, DebugError::Command(CommandError::Remote(ref e)) if e == "E14"));
}

#[tokio::test]
async fn test_breakpoints() {
    let mut target = Target::new();
    let handler = move |request: &str| {
        if request.starts_with("Z4") {
            Some(vec![String::new()])
        } else {
            target.respond(request)
        }
    };
    let (session, log, _stub) = connect_with(config(MachineKind::Qemu), handler).await;

    session.add_breakpoint(&BreakpointSpec::execute(0x401000)).await.unwrap();
    let watch = BreakpointSpec {
        kind: BreakpointKind::Write,
        address: 0xfffff800_00001000,
        size: 8,
    };
    session.add_breakpoint(&watch).await.unwrap();
    session.remove_breakpoint(&watch).await.unwrap();

    let access = BreakpointSpec {
        kind: BreakpointKind::Access,
        ..watch
    };
    let err = session.add_breakpoint(&access).await.unwrap_err();
    assert!(matches!(err, DebugError::Command(CommandError::Unsupported(_))));

    let sent: Vec<String> = requests(&log)
        .into_iter()
        .filter(|r| r.starts_with('Z') || r.starts_with('z'))
        .collect();
    assert_eq!(
        sent,
        vec![
            "Z0,401000,1",
            "Z2,fffff80000001000,8",
            "z2,fffff80000001000,8",
            "Z4,fffff80000001000,8"
        ]
    );
}

#[tokio::test]
async fn test_disassemble_target_memory() {
    let code = vec![0x55, 0x48, 0x89, 0xe5, 0xc3];
    let target = Target::new().with_region(0x401000, code);
    let (session, _log, _stub) = connect(config(MachineKind::Qemu), target).await;

    let listing = session.disassemble(0x401000, 5).await.unwrap();
    assert_eq!(listing.len(), 3);
    assert_eq!(listing[2].ip, 0x401004);
    assert!(listing.iter().all(|i| i.valid && i.symbol.is_none()));

    assert!(session.disassemble(0x900000, 16).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_disconnect_cancels_pending() {
    let mut target = Target::new();
    let handler = move |request: &str| match request {
        "qHang" => None,
        _ => target.respond(request),
    };
    let (session, _log, _stub) = connect_with(config(MachineKind::Qemu), handler).await;

    let hung = tokio::spawn({
        let session = session.clone();
        async move { session.execute_raw("qHang").await }
    });
    assert!(eventually(|| session.pending_commands() == vec!["qHang".to_string()]).await);

    session.disconnect().await;
    let err = hung.await.unwrap().unwrap_err();
    assert!(matches!(err, DebugError::Command(CommandError::Transport(TransportError::Cancelled))));
    assert_eq!(session.state(), DebuggerState::Disconnected);
    assert!(session.features().is_none());

    // disconnecting twice is harmless, and the machine may now be switched
    session.disconnect().await;
    session.set_active_machine(MachineKind::Vmware).unwrap();
}

#[tokio::test]
async fn test_connection_lost() {
    let (session, _log, stub) = connect(config(MachineKind::Qemu), Target::new()).await;
    assert!(session.set_active_machine(MachineKind::Vmware).is_err());

    stub.abort();
    assert!(session.wait_for_state(DebuggerState::Disconnected, Duration::from_secs(5)).await);
    assert!(matches!(session.read_context().await, Err(DebugError::InvalidState { .. })));
}

const KERNEL_BASE: u64 = 0xfffff800_00200000;
const IDT_BASE: u64 = 0xfffff800_00400000;

fn kernel_target() -> Target {
    Target::new()
        .with_rip(0xfffff800_00215000)
        .with_monitor("r idtr", "idtr base=0xfffff80000400000 limit=0xfff")
        .with_region(IDT_BASE, idt_gate(0xfffff800_00215678))
        .with_region(KERNEL_BASE, pe_header_page("ntkrnlmp.pdb"))
}

struct RecordingSource {
    seen: Mutex<Vec<String>>,
}

impl SymbolSource for RecordingSource {
    fn load_symbols(&self, descriptor: &pe::DebugDescriptor, base: u64) -> Option<Vec<Symbol>> {
        self.seen.lock().unwrap().push(descriptor.pdb_name.clone());
        Some(vec![Symbol {
            name: "KiSystemCall64".to_string(),
            address: base + 0x1000,
            size: 0x100,
        }])
    }
}

#[tokio::test]
async fn test_kernel_discovery_loads_symbols() {
    let source = Arc::new(RecordingSource {
        seen: Mutex::new(Vec::new()),
    });
    let mut target = kernel_target();
    let (stream, _log, _stub) = spawn_stub(move |request| target.respond(request));

    let cfg = SessionConfig {
        machine: MachineKind::Vmware,
        ..Default::default()
    };
    let session = DebugSession::with_components(cfg, Box::new(X86_64Disassembler::new()), source.clone());
    session.attach(stream).await.unwrap();

    assert!(eventually(|| session.symbols().has_module(KERNEL_MODULE)).await);
    assert_eq!(session.kernel_base(), Some(KERNEL_BASE));
    assert_eq!(*source.seen.lock().unwrap(), vec!["ntkrnlmp.pdb".to_string()]);

    let hit = session.lookup_symbol(KERNEL_BASE + 0x1010).unwrap();
    assert_eq!(hit.to_string(), "KiSystemCall64+0x10");
}

#[tokio::test]
async fn test_kernel_discovery_falls_back_to_known_exports() {
    let (session, _log, _stub) = connect(
        SessionConfig {
            machine: MachineKind::Vmware,
            ..Default::default()
        },
        kernel_target(),
    )
    .await;

    assert!(eventually(|| session.symbols().has_module(KERNEL_MODULE)).await);
    let hit = session.lookup_symbol(KERNEL_BASE + 0x1D810).unwrap();
    assert_eq!(hit.name, "ExAllocatePoolWithTag");
    assert_eq!(hit.offset, 0x10);

    // loading again explicitly succeeds against the same base
    assert!(session.load_symbols().await.unwrap());
}

#[tokio::test]
async fn test_user_mode_halt_skips_discovery() {
    let (session, log, _stub) = connect(
        SessionConfig {
            machine: MachineKind::Vmware,
            ..Default::default()
        },
        Target::new(),
    )
    .await;

    // discovery reads the context once, then gives up
    assert!(eventually(|| requests(&log).iter().filter(|r| r.starts_with("qRcmd,")).count() == 7).await);
    assert_eq!(session.kernel_base(), None);
    assert!(!session.symbols().has_module(KERNEL_MODULE));
    assert!(!session.load_symbols().await.unwrap());
}
