//! A client session against an in-process admin directory server.

use std::cell::RefCell;
use std::io;
use std::rc::Rc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use ladmin::admind::protocol::encode_terminal_info;
use ladmin::admind::{AdminDirectory, AdmindClient, DirectoryLocator, RequestState, ServerInfo};
use ladmin::console::{ConsoleSession, ExitReason, SessionTransport};
use ladmin::terminal::{Console, ConsoleEvents, TerminalInfo};
use tempfile::TempDir;

const DEADLINE: Duration = Duration::from_secs(5);

#[derive(Default)]
struct Screen {
    output: Vec<u8>,
    typed: usize,
}

/// Types `keys` one chunk at a time, each only after some output showed up.
struct ScriptedConsole {
    info: TerminalInfo,
    screen: Rc<RefCell<Screen>>,
    keys: Vec<Vec<u8>>,
}

impl Console for ScriptedConsole {
    fn info(&self) -> &TerminalInfo {
        &self.info
    }

    fn refresh_size(&mut self) -> io::Result<TerminalInfo> {
        Ok(self.info.clone())
    }

    fn enter_raw_mode(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn restore_mode(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        let mut screen = self.screen.borrow_mut();
        if screen.output.is_empty() || screen.typed >= self.keys.len() {
            return Ok(Some(0));
        }
        let chunk = &self.keys[screen.typed];
        buf[..chunk.len()].copy_from_slice(chunk);
        screen.typed += 1;
        Ok(Some(chunk.len()))
    }

    fn write_output(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.screen.borrow_mut().output.extend_from_slice(bytes);
        Ok(())
    }

    fn take_events(&mut self) -> ConsoleEvents {
        ConsoleEvents::default()
    }
}

struct World {
    _run_dir: TempDir,
    client: Arc<AdmindClient>,
    server: JoinHandle<Vec<u8>>,
}

/// Publish a server named "app" whose only job is one shell session: greet,
/// then collect input until `stop_at` arrives (or the deadline passes).
fn world(greeting: &'static [u8], stop_at: Option<u8>) -> World {
    let run_dir = TempDir::new().unwrap();
    let locator = DirectoryLocator::new(run_dir.path());
    let info = ServerInfo::current(None);
    let mut directory = AdminDirectory::create(&locator.server_dir("app"), &info).unwrap();
    let client = AdmindClient::new("app", Arc::new(locator))
        .with_poll_interval(Duration::from_millis(5));

    let server = thread::spawn(move || {
        let deadline = Instant::now() + DEADLINE;
        let request = loop {
            if let Some(request) = directory.accept().unwrap().into_iter().next() {
                break request;
            }
            assert!(Instant::now() < deadline, "no request arrived");
            thread::sleep(Duration::from_millis(5));
        };
        assert_eq!(request.command(), "shell");

        let mut channels = request.start().unwrap();
        channels.output.write(greeting).unwrap();

        let mut input = Vec::new();
        let mut buf = [0u8; 256];
        while Instant::now() < deadline {
            let count = channels.input.read_available(&mut buf).unwrap();
            input.extend_from_slice(&buf[..count]);
            match stop_at {
                Some(byte) if input.contains(&byte) => break,
                // Without a stop byte the session ends as soon as the prelude is in
                None if !input.is_empty() => break,
                _ => thread::sleep(Duration::from_millis(5)),
            }
        }
        request.finish().unwrap();
        input
    });

    World {
        _run_dir: run_dir,
        client: Arc::new(client),
        server,
    }
}

#[test]
fn keystrokes_reach_the_server_and_ctrl_d_logs_out() {
    let world = world(b"welcome\r\n", Some(0x04));
    let client = world.client;

    let request = Arc::new(client.submit("shell", "true").unwrap());
    let state = client.wait(&request, DEADLINE, RequestState::Running);
    assert!(state.has_reached(RequestState::Running), "{state}");

    let info = TerminalInfo::new(100, 30, "xterm");
    let transport =
        SessionTransport::attach(Arc::clone(&client), Arc::clone(&request), &info).unwrap();
    let screen = Rc::new(RefCell::new(Screen::default()));
    let console = ScriptedConsole {
        info: info.clone(),
        screen: Rc::clone(&screen),
        keys: vec![b"ls\r".to_vec(), vec![0x04]],
    };

    let reason = ConsoleSession::new(console, transport)
        .idle_sleep(Duration::from_millis(2))
        .run()
        .unwrap();
    assert_eq!(reason, ExitReason::Logout);
    assert!(request.is_closed());

    let input = world.server.join().unwrap();
    let prelude = encode_terminal_info(&info);
    assert!(input.starts_with(&prelude));
    assert_eq!(&input[prelude.len()..], &[b'l', b's', 0x0D, 0x00, 0x04]);
    assert!(screen.borrow().output.starts_with(b"welcome"));
}

#[test]
fn output_is_drained_when_the_session_finishes() {
    let world = world(b"bye\r\n", None);
    let client = world.client;

    let request = Arc::new(client.submit("shell", "true").unwrap());
    assert!(client
        .wait(&request, DEADLINE, RequestState::Running)
        .has_reached(RequestState::Running));

    let info = TerminalInfo::new(80, 24, "vt100");
    let transport =
        SessionTransport::attach(Arc::clone(&client), Arc::clone(&request), &info).unwrap();
    let screen = Rc::new(RefCell::new(Screen::default()));
    let console = ScriptedConsole {
        info,
        screen: Rc::clone(&screen),
        keys: Vec::new(),
    };

    let reason = ConsoleSession::new(console, transport)
        .idle_sleep(Duration::from_millis(2))
        .run()
        .unwrap();

    world.server.join().unwrap();
    assert_eq!(reason, ExitReason::Finished);
    assert_eq!(screen.borrow().output, b"bye\r\n");
}

#[test]
fn unknown_server_is_reported_before_any_request() {
    let run_dir = TempDir::new().unwrap();
    let client = AdmindClient::new("missing", Arc::new(DirectoryLocator::new(run_dir.path())));

    assert!(!client.is_running());
    let err = client.submit("shell", "true").unwrap_err();
    assert_eq!(err.to_string(), "Unable to find 'missing'");
}
