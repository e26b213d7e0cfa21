//! Integration tests for pepperbridge
//!
//! Tests end-to-end behaviour through `Bridge`: the syscall dispatch,
//! descriptor table, filesystem overlay and sockets, with the loopback
//! host standing in for the browser. Every test builds its own bridge.

use pepperbridge::kernel::net::{AF_INET, AF_INET6, SOCK_DGRAM, SOCK_STREAM};
use pepperbridge::kernel::{
    Bridge, ErrorKind, Fd, HostEvent, InstanceHandlers, OpenFlags, Phase, SockAddr, SyscallError,
    Syscalls,
};
use pepperbridge::platform::{HostError, LogLevel, LoopbackHost, NetAddress, WsMessage};
use pepperbridge::BridgeConfig;
use std::collections::HashMap;
use std::io::SeekFrom;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

struct Idle;

impl InstanceHandlers for Idle {}

/// Bridge with syscalls installed, plus its host for inspection
fn init_test() -> (Arc<Bridge>, LoopbackHost) {
    let host = LoopbackHost::new();
    let config = BridgeConfig {
        random_seed: Some(42),
        ..BridgeConfig::default()
    };
    let bridge = Arc::new(Bridge::new(Arc::new(host.clone()), config));
    bridge.init(|_| Box::new(Idle)).unwrap();
    (bridge, host)
}

fn read_all(bridge: &Bridge, fd: Fd) -> Vec<u8> {
    let sys = bridge.syscalls();
    let mut out = Vec::new();
    let mut buf = [0u8; 100];
    loop {
        let n = sys.read(fd, &mut buf).unwrap();
        if n == 0 {
            return out;
        }
        out.extend_from_slice(&buf[..n]);
    }
}

fn read_exact(bridge: &Bridge, fd: Fd, len: usize) -> Vec<u8> {
    let sys = bridge.syscalls();
    let mut out = vec![0u8; len];
    let mut filled = 0;
    while filled < len {
        let n = sys.read(fd, &mut out[filled..]).unwrap();
        assert!(n > 0, "unexpected end of stream");
        filled += n;
    }
    out
}

fn write_file(bridge: &Bridge, path: &str, data: &[u8]) {
    let sys = bridge.syscalls();
    let fd = sys.open(path, OpenFlags::from_posix(0o1101)).unwrap();
    assert_eq!(sys.write(fd, data).unwrap(), data.len());
    sys.close(fd).unwrap();
}

fn read_file(bridge: &Bridge, path: &str) -> Vec<u8> {
    let sys = bridge.syscalls();
    let fd = sys.open(path, OpenFlags::READ).unwrap();
    let data = read_all(bridge, fd);
    sys.close(fd).unwrap();
    data
}

// ============================================================================
// Sockets
// ============================================================================

#[test]
fn test_loopback_echo() {
    let (bridge, host) = init_test();
    let sys = bridge.syscalls();

    let server = sys.socket(AF_INET, SOCK_STREAM, 0).unwrap();
    sys.bind(server, &SockAddr::parse("127.0.0.1:0").unwrap()).unwrap();
    sys.listen(server, 1).unwrap();
    let addr = sys.getsockname(server).unwrap();
    assert_ne!(addr.port(), 0);

    let server_bridge = Arc::clone(&bridge);
    let handle = thread::spawn(move || {
        let sys = server_bridge.syscalls();
        let (conn, peer) = sys.accept(server).unwrap();
        let msg = read_exact(&server_bridge, conn, 11);
        sys.write(conn, &msg).unwrap();
        sys.close(conn).unwrap();
        (msg, peer)
    });

    let client = sys.socket(AF_INET, SOCK_STREAM, 0).unwrap();
    sys.connect(client, &addr).unwrap();
    assert_eq!(sys.write(client, b"Hello world").unwrap(), 11);
    assert_eq!(read_exact(&bridge, client, 11), b"Hello world");

    let (msg, peer) = handle.join().unwrap();
    assert_eq!(msg, b"Hello world");
    assert_eq!(peer, sys.getsockname(client).unwrap());
    assert_eq!(sys.getpeername(client).unwrap(), addr);

    // Server closed its end
    let mut buf = [0u8; 4];
    assert_eq!(sys.read(client, &mut buf).unwrap(), 0);

    sys.close(client).unwrap();
    sys.close(server).unwrap();
    assert_eq!(host.live_resources(), 0);
}

#[test]
fn test_socket_state_machine() {
    let (bridge, _host) = init_test();
    let sys = bridge.syscalls();

    let fd = sys.socket(AF_INET, SOCK_STREAM, 0).unwrap();
    let err = sys.listen(fd, 1).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    sys.bind(fd, &SockAddr::inet4([127, 0, 0, 1], 8080)).unwrap();
    assert!(sys.bind(fd, &SockAddr::inet4([127, 0, 0, 1], 8081)).is_err());
    sys.listen(fd, 1).unwrap();

    let err = sys
        .connect(fd, &SockAddr::inet4([127, 0, 0, 1], 8080))
        .unwrap_err();
    assert_eq!(err, SyscallError::InvalidState("connect on a listening socket"));
}

#[test]
fn test_accepted_peer_matches_client_name() {
    let (bridge, _host) = init_test();
    let sys = bridge.syscalls();

    let server = sys.socket(AF_INET6, SOCK_STREAM, 0).unwrap();
    sys.bind(server, &SockAddr::parse("[::1]:9000").unwrap()).unwrap();
    sys.listen(server, 4).unwrap();

    let mut clients = Vec::new();
    for _ in 0..3 {
        let client = sys.socket(AF_INET6, SOCK_STREAM, 0).unwrap();
        sys.connect(client, &SockAddr::parse("[::1]:9000").unwrap()).unwrap();
        clients.push(client);
    }
    for client in clients {
        let (_, peer) = sys.accept(server).unwrap();
        assert_eq!(peer, sys.getsockname(client).unwrap());
    }
}

#[test]
fn test_connect_refused_and_bad_port() {
    let (bridge, _host) = init_test();
    let sys = bridge.syscalls();

    let fd = sys.socket(AF_INET, SOCK_STREAM, 0).unwrap();
    let err = sys
        .connect(fd, &SockAddr::inet4([127, 0, 0, 1], 1))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Host);

    let err = sys
        .connect(fd, &SockAddr::inet4([127, 0, 0, 1], 0))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MalformedInput);
}

#[test]
fn test_udp_pair() {
    let (bridge, host) = init_test();
    let sys = bridge.syscalls();
    let a_addr = SockAddr::inet4([127, 0, 0, 1], 40001);
    let b_addr = SockAddr::inet4([127, 0, 0, 1], 40002);

    let a = sys.socket(AF_INET, SOCK_DGRAM, 0).unwrap();
    let b = sys.socket(AF_INET, SOCK_DGRAM, 0).unwrap();
    sys.bind(a, &a_addr).unwrap();
    sys.bind(b, &b_addr).unwrap();
    assert!(sys.listen(a, 1).is_err());

    sys.connect(a, &b_addr).unwrap();
    sys.connect(b, &a_addr).unwrap();

    sys.write(a, b"ping").unwrap();
    let mut buf = [0u8; 16];
    let n = sys.read(b, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"ping");

    sys.write(b, b"pong").unwrap();
    let n = sys.read(a, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"pong");

    sys.close(a).unwrap();
    sys.close(b).unwrap();
    assert_eq!(host.live_resources(), 0);
}

#[test]
fn test_stop_io_aborts_accept() {
    let (bridge, host) = init_test();
    let sys = bridge.syscalls();

    let server = sys.socket(AF_INET, SOCK_STREAM, 0).unwrap();
    sys.bind(server, &SockAddr::parse("0.0.0.0:7000").unwrap()).unwrap();
    sys.listen(server, 1).unwrap();

    let waiter = Arc::clone(&bridge);
    let handle = thread::spawn(move || waiter.syscalls().accept(server).map(|(fd, _)| fd));

    thread::sleep(Duration::from_millis(20));
    sys.stop_io(server).unwrap();
    assert_eq!(handle.join().unwrap(), Err(SyscallError::EndOfStream));

    // Descriptor survives stop_io
    assert!(sys.fstat(server).is_ok());
    sys.close(server).unwrap();
    assert_eq!(host.live_resources(), 0);
}

#[test]
fn test_deadlines_rejected() {
    let (bridge, _host) = init_test();
    let sys = bridge.syscalls();
    let fd = sys.socket(AF_INET, SOCK_STREAM, 0).unwrap();
    let soon = Some(Instant::now() + Duration::from_secs(1));

    assert_eq!(sys.set_deadline(fd, soon), Err(SyscallError::DeadlineUnsupported));
    assert_eq!(sys.set_read_deadline(fd, None), Err(SyscallError::DeadlineUnsupported));
    assert_eq!(sys.set_write_deadline(fd, soon), Err(SyscallError::DeadlineUnsupported));
}

#[test]
fn test_address_round_trip() {
    let addrs = [
        "0.0.0.0:0",
        "127.0.0.1:80",
        "192.168.1.254:65535",
        "[::]:1",
        "[::1]:8080",
        "[fe80::1:2:3:4]:443",
        "[2001:db8::ff00:42:8329]:65535",
    ];
    for text in addrs {
        let addr = SockAddr::parse(text).unwrap();
        let bytes = addr.to_net_address().to_host_bytes();
        let back = SockAddr::from_net_address(NetAddress::from_host_bytes(&bytes).unwrap());
        assert_eq!(back, addr, "{}", text);
        assert_eq!(back.display_string(), text);
    }
    assert!(SockAddr::parse("localhost:80").is_err());
}

#[test]
fn test_bind_family_mismatch() {
    let (bridge, _host) = init_test();
    let sys = bridge.syscalls();
    let v6 = sys.socket(AF_INET6, SOCK_STREAM, 0).unwrap();
    let err = sys.bind(v6, &SockAddr::parse("127.0.0.1:7100").unwrap()).unwrap_err();
    assert!(matches!(err, SyscallError::MalformedAddress(_)));
    assert_eq!(err.kind(), ErrorKind::MalformedInput);

    // The socket is still usable with the right family
    sys.bind(v6, &SockAddr::parse("[::1]:7100").unwrap()).unwrap();
    sys.listen(v6, 1).unwrap();
}

#[test]
fn test_udp_sendto_recvfrom() {
    let (bridge, host) = init_test();
    let sys = bridge.syscalls();
    let server_addr = SockAddr::parse("127.0.0.1:5353").unwrap();

    let server = sys.socket(AF_INET, SOCK_DGRAM, 0).unwrap();
    sys.bind(server, &server_addr).unwrap();
    // A first send claims the bound port
    sys.sendto(server, b"", &SockAddr::parse("127.0.0.1:9").unwrap()).unwrap();

    let client = sys.socket(AF_INET, SOCK_DGRAM, 0).unwrap();
    assert_eq!(sys.sendto(client, b"query", &server_addr).unwrap(), 5);

    let mut buf = [0u8; 32];
    let (n, from) = sys.recvfrom(server, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"query");
    assert_eq!(from.port(), sys.getsockname(client).unwrap().port());

    sys.sendto(server, b"answer", &from).unwrap();
    let (n, replier) = sys.recvfrom(client, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"answer");
    assert_eq!(replier, server_addr);

    sys.close(server).unwrap();
    sys.close(client).unwrap();
    assert_eq!(host.live_resources(), 0);
}

#[test]
fn test_dial_by_name() {
    let (bridge, host) = init_test();
    host.add_host("db.internal", "127.0.0.1".parse().unwrap());
    let sys = bridge.syscalls();

    let server = sys.socket(AF_INET, SOCK_STREAM, 0).unwrap();
    sys.bind(server, &SockAddr::parse("0.0.0.0:5432").unwrap()).unwrap();
    sys.listen(server, 1).unwrap();

    assert_eq!(
        sys.resolve("tcp", "db.internal:5432").unwrap(),
        SockAddr::parse("127.0.0.1:5432").unwrap()
    );
    let client = sys.dial("tcp", "db.internal:5432").unwrap();
    let (accepted, _) = sys.accept(server).unwrap();
    sys.write(client, b"SELECT 1").unwrap();
    assert_eq!(read_exact(&bridge, accepted, 8), b"SELECT 1");

    assert_eq!(
        sys.dial("tcp", "cache.internal:6379"),
        Err(SyscallError::Host(HostError::NameNotResolved))
    );
}

#[test]
fn test_websocket_round_trip() {
    let host = LoopbackHost::new();
    let server = host.serve_websocket("wss://chat.test/room").unwrap();
    let bridge = Bridge::new(Arc::new(host.clone()), BridgeConfig::default());
    let slot = Arc::new(Mutex::new(None));
    let kept = Arc::clone(&slot);
    bridge
        .init(move |instance| {
            *kept.lock().unwrap() = Some(instance);
            Box::new(Idle)
        })
        .unwrap();

    let instance = slot.lock().unwrap().take().unwrap();
    let ws = instance.dial_websocket("wss://chat.test/room").unwrap();
    let peer = server.accept().unwrap();

    ws.send_text("join").unwrap();
    assert_eq!(peer.receive().unwrap(), WsMessage::Text("join".into()));
    peer.send(WsMessage::Binary(b"welcome".to_vec())).unwrap();
    assert_eq!(ws.receive_bytes().unwrap(), b"welcome");

    peer.close();
    assert_eq!(ws.receive(), Err(SyscallError::EndOfStream));
    ws.close();
    assert_eq!(host.live_resources(), 0);
}

// ============================================================================
// Files
// ============================================================================

#[test]
fn test_temp_file_lifecycle() {
    let (bridge, _host) = init_test();
    write_file(&bridge, "/tmp/x", b"abc");
    assert_eq!(read_file(&bridge, "/tmp/x"), b"abc");
}

#[test]
fn test_temp_buffer_growth() {
    let (bridge, _host) = init_test();
    let sys = bridge.syscalls();

    for n in [0usize, 1, 127, 128, 129, 1000, 65537] {
        let path = format!("/tmp/grow-{}", n);
        let data: Vec<u8> = (0..n).map(|i| (i * 31 % 251) as u8).collect();

        let fd = sys.open(&path, OpenFlags::WRITE).unwrap();
        for chunk in data.chunks(97) {
            sys.write(fd, chunk).unwrap();
        }
        sys.close(fd).unwrap();

        assert_eq!(read_file(&bridge, &path), data, "n = {}", n);
        assert_eq!(sys.stat(&path).unwrap().size, n as u64);
    }
}

#[test]
fn test_seek_and_positional_io() {
    let (bridge, _host) = init_test();
    let sys = bridge.syscalls();

    let fd = sys.open("/tmp/pos", OpenFlags::RDWR).unwrap();
    sys.write(fd, b"hello world").unwrap();
    assert_eq!(sys.seek(fd, SeekFrom::Start(6)).unwrap(), 6);
    sys.pwrite(fd, b"H", 0).unwrap();

    let mut buf = [0u8; 5];
    assert_eq!(sys.read(fd, &mut buf).unwrap(), 5);
    assert_eq!(&buf, b"world");
    assert_eq!(sys.pread(fd, &mut buf, 0).unwrap(), 5);
    assert_eq!(&buf, b"Hello");
    assert_eq!(sys.seek(fd, SeekFrom::Current(0)).unwrap(), 11);
}

#[test]
fn test_positional_io_near_max_offset() {
    let (bridge, _host) = init_test();
    let sys = bridge.syscalls();
    let fd = sys.open("/tmp/huge", OpenFlags::RDWR).unwrap();
    sys.write(fd, b"data").unwrap();

    let mut buf = [0u8; 4];
    assert_eq!(sys.pread(fd, &mut buf, u64::MAX).unwrap(), 0);
    assert_eq!(sys.pread(fd, &mut buf, u64::MAX - 1).unwrap(), 0);
    for offset in [u64::MAX, u64::MAX - 1, 1 << 40] {
        let err = sys.pwrite(fd, b"x", offset).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedInput, "offset {}", offset);
    }
    assert_eq!(sys.fstat(fd).unwrap().size, 4);

    sys.seek(fd, SeekFrom::Start(u64::MAX / 2)).unwrap();
    assert!(sys.write(fd, b"x").is_err());
    assert_eq!(sys.pread(fd, &mut buf, 0).unwrap(), 4);
    assert_eq!(&buf, b"data");
}

#[test]
fn test_access_mode_enforced() {
    let (bridge, _host) = init_test();
    let sys = bridge.syscalls();
    write_file(&bridge, "/tmp/ro", b"fixed");

    let ro = sys.open("/tmp/ro", OpenFlags::READ).unwrap();
    let err = sys.write(ro, b"x").unwrap_err();
    assert_eq!(err, SyscallError::NotOpenFor("writing"));
    assert_eq!(err.errno(), SyscallError::BadFd(ro.0).errno());
    assert!(sys.pwrite(ro, b"x", 0).is_err());

    let wo = sys.open("/tmp/ro", OpenFlags::APPEND).unwrap();
    assert_eq!(
        sys.read(wo, &mut [0u8; 4]),
        Err(SyscallError::NotOpenFor("reading"))
    );
    assert_eq!(read_file(&bridge, "/tmp/ro"), b"fixed");
}

#[test]
fn test_symlink_round_trip_and_chain() {
    let (bridge, _host) = init_test();
    let sys = bridge.syscalls();
    write_file(&bridge, "/tmp/a", b"target");

    sys.symlink("/tmp/a", "/tmp/b").unwrap();
    assert_eq!(read_file(&bridge, "/tmp/b"), read_file(&bridge, "/tmp/a"));

    sys.symlink("/tmp/b", "/tmp/c").unwrap();
    assert_eq!(read_file(&bridge, "/tmp/c"), b"target");
    assert_eq!(sys.readlink("/tmp/c").unwrap(), "/tmp/b");

    sys.unlink("/tmp/c").unwrap();
    assert!(sys.readlink("/tmp/c").is_err());
}

#[test]
fn test_symlink_cycle() {
    let (bridge, _host) = init_test();
    let sys = bridge.syscalls();
    sys.symlink("/tmp/a", "/tmp/b").unwrap();
    sys.symlink("/tmp/b", "/tmp/a").unwrap();

    let err = sys.open("/tmp/a", OpenFlags::READ).unwrap_err();
    assert_eq!(err, SyscallError::SymlinkCycle("/tmp/a".into()));
    assert_eq!(err.kind(), ErrorKind::Fatal);
}

#[test]
fn test_synthetic_paths() {
    let (bridge, _host) = init_test();
    let sys = bridge.syscalls();

    assert_eq!(&read_file(&bridge, "/etc/localtime")[..4], b"TZif");

    let fd = sys.open("/dev/urandom", OpenFlags::READ).unwrap();
    let mut buf = [0u8; 64];
    assert_eq!(sys.read(fd, &mut buf).unwrap(), 64);
    assert!(buf.iter().any(|b| *b != 0));
    assert!(sys.write(fd, b"x").is_err());

    assert_eq!(
        sys.open("/etc/hosts", OpenFlags::READ).unwrap_err().kind(),
        ErrorKind::NotFound
    );
}

#[test]
fn test_directories() {
    let (bridge, _host) = init_test();
    let sys = bridge.syscalls();

    sys.mkdir("/tmp/work").unwrap();
    assert!(sys.stat("/tmp/work").unwrap().is_dir());
    assert_eq!(
        sys.mkdir("/tmp/work").unwrap_err().kind(),
        ErrorKind::AlreadyExists
    );
    sys.rmdir("/tmp/work").unwrap();
    assert_eq!(sys.stat("/tmp/work").unwrap_err().kind(), ErrorKind::NotFound);
    assert_eq!(
        sys.mkdir("/var/lib"),
        Err(SyscallError::Unimplemented { op: "mkdir" })
    );
    assert!(sys.rmdir("/tmp").is_err());
    assert!(sys.stat("/tmp").unwrap().is_dir());
}

// ============================================================================
// Descriptors
// ============================================================================

#[test]
fn test_descriptor_reuse() {
    let (bridge, _host) = init_test();
    let sys = bridge.syscalls();

    let mut live: Vec<Fd> = Vec::new();
    // Deterministic interleaving of opens and closes
    for step in 0..200u32 {
        if step % 3 == 2 && !live.is_empty() {
            let victim = live.remove((step as usize * 7) % live.len());
            sys.close(victim).unwrap();
            let fd = sys.open("/dev/random", OpenFlags::READ).unwrap();
            assert_eq!(fd, victim);
            live.push(fd);
        } else {
            let fd = sys.open("/dev/random", OpenFlags::READ).unwrap();
            assert!(!live.contains(&fd));
            live.push(fd);
        }
    }

    // Lowest slot wins when several are free
    let mut sorted = live.clone();
    sorted.sort_by_key(|fd| fd.0);
    sys.close(sorted[5]).unwrap();
    sys.close(sorted[2]).unwrap();
    assert_eq!(sys.open("/dev/random", OpenFlags::READ).unwrap(), sorted[2]);
    assert_eq!(sys.open("/dev/random", OpenFlags::READ).unwrap(), sorted[5]);
}

#[test]
fn test_use_after_close() {
    let (bridge, _host) = init_test();
    let sys = bridge.syscalls();
    let fd = sys.open("/tmp/gone", OpenFlags::WRITE).unwrap();
    sys.close(fd).unwrap();
    assert_eq!(sys.write(fd, b"x"), Err(SyscallError::BadFd(fd.0)));
    assert_eq!(sys.close(fd), Err(SyscallError::BadFd(fd.0)));
}

#[test]
fn test_dup_shares_cursor() {
    let (bridge, _host) = init_test();
    let sys = bridge.syscalls();

    let fd = sys.open("/tmp/dup", OpenFlags::RDWR).unwrap();
    let copy = sys.dup(fd).unwrap();
    sys.write(fd, b"ab").unwrap();
    sys.write(copy, b"cd").unwrap();
    sys.close(fd).unwrap();
    assert_eq!(sys.fstat(copy).unwrap().size, 4);

    // Redirect stdout into the file
    sys.dup2(copy, Fd::STDOUT).unwrap();
    sys.write(Fd::STDOUT, b"ef").unwrap();
    sys.close(copy).unwrap();
    sys.close(Fd::STDOUT).unwrap();
    assert_eq!(read_file(&bridge, "/tmp/dup"), b"abcdef");
}

// ============================================================================
// Console
// ============================================================================

#[test]
fn test_console_chunking() {
    let (bridge, host) = init_test();
    let line = vec![b'x'; 300];
    assert_eq!(bridge.syscalls().write(Fd::STDOUT, &line).unwrap(), 300);

    let logs = host.take_logs();
    let lengths: Vec<usize> = logs.iter().map(|l| l.message.len()).collect();
    assert_eq!(lengths, vec![128, 128, 44]);
    assert!(logs.iter().all(|l| l.source == logs[0].source));
    assert!(logs[0].source.contains("integration.rs:"));
    assert!(logs.iter().all(|l| l.level == LogLevel::Log));
}

#[test]
fn test_standard_descriptors() {
    let (bridge, host) = init_test();
    let sys = bridge.syscalls();

    let err = sys.read(Fd::STDIN, &mut [0u8; 8]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unsupported);

    sys.write(Fd::STDERR, b"first\nsecond\n").unwrap();
    let logs = host.take_logs();
    let messages: Vec<&str> = logs.iter().map(|l| l.message.as_str()).collect();
    assert_eq!(messages, vec!["first", "second"]);
    assert!(logs.iter().all(|l| l.level == LogLevel::Warning));
}

// ============================================================================
// Process surface
// ============================================================================

#[test]
fn test_environment() {
    let (bridge, _host) = init_test();
    let sys = bridge.syscalls();

    assert_eq!(sys.getenv("TMPDIR").unwrap().as_deref(), Some("/tmp"));
    sys.setenv("Lang", "C").unwrap();
    assert_eq!(sys.getenv("LANG").unwrap().as_deref(), Some("C"));
    assert_eq!(sys.environ().unwrap(), vec!["LANG=C", "TMPDIR=/tmp"]);
    sys.unsetenv("lang").unwrap();
    assert_eq!(sys.getenv("LANG").unwrap(), None);
    assert_eq!(sys.getenv("TZ").unwrap(), None);
    assert_eq!(sys.getpid().unwrap(), 1234);
}

#[test]
fn test_unimplemented_ops_named() {
    let (bridge, _host) = init_test();
    let sys = bridge.syscalls();

    let results = [
        ("chdir", sys.chdir("/").err()),
        ("getcwd", sys.getcwd().err()),
        ("chmod", sys.chmod("/tmp/x", 0o600).err()),
        ("chown", sys.chown("/tmp/x", 0, 0).err()),
        ("rename", sys.rename("/tmp/x", "/tmp/y").err()),
        ("link", sys.link("/tmp/x", "/tmp/y").err()),
        ("truncate", sys.truncate("/tmp/x", 0).err()),
        ("pipe", sys.pipe().err()),
        ("kill", sys.kill(1234, 9).err()),
    ];
    for (op, err) in results {
        let err = err.unwrap();
        assert!(err.is_fatal());
        assert_eq!(err.to_string(), format!("{}() not implemented", op));
    }
}

#[test]
fn test_fake_backend() {
    struct Fixed;

    impl Syscalls for Fixed {
        fn getpid(&self) -> Result<u32, SyscallError> {
            Ok(7)
        }
    }

    let (bridge, _host) = init_test();
    bridge.install(Arc::new(Fixed));
    assert_eq!(bridge.syscalls().getpid().unwrap(), 7);
    assert!(bridge.syscalls().open("/tmp/x", OpenFlags::READ).is_err());
}

// ============================================================================
// Instance lifecycle
// ============================================================================

struct Recorder(Arc<Mutex<Vec<String>>>);

impl InstanceHandlers for Recorder {
    fn did_create(&mut self, args: &HashMap<String, String>) -> bool {
        self.0.lock().unwrap().push(format!("create({})", args.len()));
        true
    }

    fn did_destroy(&mut self) {
        self.0.lock().unwrap().push("destroy".into());
    }

    fn did_change_focus(&mut self, has_focus: bool) {
        self.0.lock().unwrap().push(format!("focus({})", has_focus));
    }

    fn handle_message(&mut self, message: &serde_json::Value) {
        self.0.lock().unwrap().push(format!("message({})", message));
    }
}

fn uninitialized() -> Bridge {
    Bridge::new(Arc::new(LoopbackHost::new()), BridgeConfig::default())
}

#[test]
fn test_deferred_destroy_replayed_once() {
    let bridge = uninitialized();
    let calls = Arc::new(Mutex::new(Vec::new()));

    let mut args = HashMap::new();
    args.insert("src".to_string(), "app.nmf".to_string());
    bridge.deliver(HostEvent::DidCreate(args)).unwrap();
    bridge.deliver(HostEvent::DidChangeFocus(true)).unwrap();
    bridge.deliver(HostEvent::DidDestroy).unwrap();
    assert_eq!(bridge.instance().pending_len(), 2);

    let log = Arc::clone(&calls);
    bridge.init(move |_| Box::new(Recorder(log))).unwrap();
    bridge
        .deliver(HostEvent::HandleMessage(serde_json::json!("late")))
        .unwrap();

    assert_eq!(
        *calls.lock().unwrap(),
        vec!["create(1)", "focus(true)", "destroy"]
    );
    assert_eq!(bridge.instance().phase(), Phase::Destroyed);
}

#[test]
fn test_replay_precedes_new_events() {
    let bridge = Arc::new(uninitialized());
    let calls = Arc::new(Mutex::new(Vec::new()));

    bridge.deliver(HostEvent::DidCreate(HashMap::new())).unwrap();
    for i in 0..5 {
        bridge
            .deliver(HostEvent::HandleMessage(serde_json::json!(i)))
            .unwrap();
    }

    // Registration races the host thread
    let host_side = Arc::clone(&bridge);
    let log = Arc::clone(&calls);
    let registrar = thread::spawn(move || {
        host_side.init(move |_| Box::new(Recorder(log))).unwrap();
    });
    let mut next = 5;
    while bridge.instance().phase() != Phase::Active {
        bridge
            .deliver(HostEvent::HandleMessage(serde_json::json!(next)))
            .unwrap();
        next += 1;
        thread::yield_now();
    }
    registrar.join().unwrap();
    bridge
        .deliver(HostEvent::HandleMessage(serde_json::json!(next)))
        .unwrap();

    let calls = calls.lock().unwrap();
    assert_eq!(calls[0], "create(0)");
    let expected: Vec<String> = (0..=next).map(|i| format!("message({})", i)).collect();
    assert_eq!(calls[1..], expected[..]);
}

#[test]
fn test_second_init_keeps_state() {
    let (bridge, _host) = init_test();
    let sys = bridge.syscalls();
    let fd = sys.open("/tmp/x", OpenFlags::RDWR).unwrap();
    sys.write(fd, b"before").unwrap();
    sys.setenv("APP_MODE", "live").unwrap();

    assert_eq!(
        bridge.init(|_| Box::new(Idle)),
        Err(SyscallError::InvalidState("handlers already registered"))
    );

    sys.write(fd, b"+after").unwrap();
    assert_eq!(sys.seek(fd, SeekFrom::Start(0)).unwrap(), 0);
    assert_eq!(read_all(&bridge, fd), b"before+after");
    assert_eq!(read_file(&bridge, "/tmp/x"), b"before+after");
    assert_eq!(sys.getenv("APP_MODE").unwrap().as_deref(), Some("live"));
}

#[test]
fn test_second_instance_is_fatal() {
    let bridge = uninitialized();
    bridge.deliver(HostEvent::DidCreate(HashMap::new())).unwrap();
    let err = bridge
        .deliver(HostEvent::DidCreate(HashMap::new()))
        .unwrap_err();
    assert_eq!(err, SyscallError::DuplicateInstance);
}

#[test]
fn test_wait_ready_handshake() {
    let bridge = Arc::new(uninitialized());
    let app = Arc::clone(&bridge);
    let handle = thread::spawn(move || app.syscalls().wait_ready().getpid());

    thread::sleep(Duration::from_millis(20));
    bridge.init(|_| Box::new(Idle)).unwrap();
    assert_eq!(handle.join().unwrap(), Ok(1234));
}
