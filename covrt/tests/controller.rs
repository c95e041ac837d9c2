//! End-to-end tests of the control service over loopback TCP.

#![allow(clippy::unwrap_used, clippy::missing_docs_in_private_items, missing_docs)]

use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use covrt::{
    ClassCoverage, ClientProxy, CommandDescriptor, ControlHost, Controller, CoverageData, Error,
    FileLock, Payload, Request, Settings, SocketMutex,
};

struct Host {
    data: Option<Arc<CoverageData>>,
    settings: Settings,
    auto_dump: AtomicBool,
}

impl Host {
    fn new(data: Option<Arc<CoverageData>>, out_dir: &std::path::Path) -> Arc<Self> {
        Self::with_settings(
            data,
            Settings {
                file_lock: false,
                out_file: out_dir.join("remote.ec"),
                out_merge: false,
                ..Settings::default()
            },
        )
    }

    fn with_settings(data: Option<Arc<CoverageData>>, settings: Settings) -> Arc<Self> {
        Arc::new(Self {
            data,
            settings,
            auto_dump: AtomicBool::new(true),
        })
    }
}

impl ControlHost for Host {
    fn coverage(&self) -> Option<Arc<CoverageData>> {
        self.data.clone()
    }

    fn settings(&self) -> Settings {
        self.settings.clone()
    }

    fn disable_auto_dump(&self) {
        self.auto_dump.store(false, Ordering::SeqCst);
    }
}

fn serve(host: &Arc<Host>, grace: Duration) -> (Controller, ClientProxy) {
    let weak: Weak<dyn ControlHost> = Arc::<Host>::downgrade(host);
    let controller = Controller::new(weak, 0).with_grace(grace);
    controller.start().unwrap();
    let client = client_for(&controller);
    (controller, client)
}

fn client_for(controller: &Controller) -> ClientProxy {
    let port = controller.local_addr().unwrap().port();
    ClientProxy::create("127.0.0.1", port)
        .unwrap()
        .io_timeout(Duration::from_secs(20))
}

fn is_transport_error(err: &Error) -> bool {
    matches!(err, Error::Io(_) | Error::Proto(covrt_proto::Error::Io(_)))
}

/// Runs two `ping(delay)` calls from separate clients and returns the
/// total wall time.
fn concurrent_pings(client: &ClientProxy, delay: &'static str) -> Duration {
    let start = Instant::now();
    let workers: Vec<_> = (0..2)
        .map(|_| {
            let client = client.clone();
            thread::spawn(move || client.call(&request("test.ping", &[Some(delay)])).unwrap())
        })
        .collect();
    for w in workers {
        assert!(matches!(w.join().unwrap(), Payload::Int(_)));
    }
    start.elapsed()
}

fn request(name: &str, args: &[Option<&str>]) -> Request {
    CommandDescriptor::lookup(name)
        .unwrap()
        .request(args.iter().map(|a| a.map(str::to_owned)).collect())
        .unwrap()
}

fn sample_data() -> Arc<CoverageData> {
    let data = Arc::new(CoverageData::new());
    data.add_class(ClassCoverage::new("a.B", 7, &[2, 1])).hit(0, 1);
    data.add_class(ClassCoverage::new("a.C", 8, &[1]));
    data
}

#[test]
fn reset_on_empty_store_reports_zero() {
    let dir = tempfile::tempdir().unwrap();
    let host = Host::new(Some(Arc::new(CoverageData::new())), dir.path());
    let (controller, client) = serve(&host, Duration::from_secs(5));

    let payload = client.call(&request("coverage.reset", &[])).unwrap();
    assert_eq!(payload, Payload::Str("coverage reset for 0 classes".into()));
    controller.shutdown();
}

#[test]
fn reset_clears_hits_in_place() {
    let dir = tempfile::tempdir().unwrap();
    let data = sample_data();
    let host = Host::new(Some(Arc::clone(&data)), dir.path());
    let (controller, client) = serve(&host, Duration::from_secs(5));

    let Payload::Str(msg) = client.call(&request("coverage.reset", &[])).unwrap() else {
        panic!("expected a status message");
    };
    assert!(msg.starts_with("coverage reset for 2 classes {in "), "{msg}");
    assert!(data.snapshot().classes["a.B"].blocks.iter().flatten().all(|h| !h));
    controller.shutdown();
}

#[test]
fn ping_echoes_delay_with_matching_id() {
    let dir = tempfile::tempdir().unwrap();
    let host = Host::new(None, dir.path());
    let (controller, client) = serve(&host, Duration::from_secs(5));

    let req = request("test.ping", &[Some("0")]);
    let resp = client.execute(&req).unwrap();
    assert_eq!(resp.id, req.id());
    assert_eq!(resp.payload, Payload::Int(0));
    controller.shutdown();
}

#[test]
fn requests_run_one_at_a_time() {
    let dir = tempfile::tempdir().unwrap();
    let host = Host::new(None, dir.path());
    let (controller, client) = serve(&host, Duration::from_secs(5));

    assert!(concurrent_pings(&client, "200") >= Duration::from_millis(400));
    controller.shutdown();
}

#[test]
fn shutdown_is_idempotent_and_safe_before_start() {
    let dir = tempfile::tempdir().unwrap();
    let host = Host::new(None, dir.path());
    let weak: Weak<dyn ControlHost> = Arc::<Host>::downgrade(&host);
    let idle = Controller::new(weak, 0);
    idle.shutdown();
    assert!(!idle.is_running());

    let (controller, _client) = serve(&host, Duration::from_secs(5));
    assert!(controller.is_running());
    controller.shutdown();
    controller.shutdown();
    assert!(!controller.is_running());
    assert!(controller.local_addr().is_none());
}

#[test]
fn shutdown_interrupts_long_ping() {
    let dir = tempfile::tempdir().unwrap();
    let host = Host::new(None, dir.path());
    let (controller, client) = serve(&host, Duration::from_secs(2));

    let pinger = thread::spawn(move || client.execute(&request("test.ping", &[Some("5000")])));
    thread::sleep(Duration::from_millis(200));

    let start = Instant::now();
    controller.shutdown();
    assert!(start.elapsed() < Duration::from_secs(4));
    // The client either got the early echo or saw the connection drop.
    let _ = pinger.join().unwrap();
}

#[test]
fn second_start_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let host = Host::new(None, dir.path());
    let (controller, _client) = serve(&host, Duration::from_secs(5));

    assert!(matches!(controller.start(), Err(Error::AlreadyStarted)));
    assert!(controller.is_running());
    controller.shutdown();
}

#[test]
fn busy_port_fails_to_bind() {
    let dir = tempfile::tempdir().unwrap();
    let host = Host::new(None, dir.path());
    let taken = TcpListener::bind("0.0.0.0:0").unwrap();
    let port = taken.local_addr().unwrap().port();

    let weak: Weak<dyn ControlHost> = Arc::<Host>::downgrade(&host);
    let controller = Controller::new(weak, port);
    assert!(matches!(controller.start(), Err(Error::Bind { port: p, .. }) if p == port));
    assert!(!controller.is_running());
}

#[test]
fn unknown_command_id_returns_error_payload() {
    let dir = tempfile::tempdir().unwrap();
    let host = Host::new(None, dir.path());
    let (controller, client) = serve(&host, Duration::from_secs(5));

    let resp = client.execute(&Request::new(42, Vec::new())).unwrap();
    assert_eq!(resp.id, 42);
    let Payload::Error(err) = resp.payload else {
        panic!("expected an error payload");
    };
    assert!(err.message.contains("42"), "{err}");
    controller.shutdown();
}

#[test]
fn get_returns_snapshot_and_can_stop_auto_dump() {
    let dir = tempfile::tempdir().unwrap();
    let host = Host::new(Some(sample_data()), dir.path());
    let (controller, client) = serve(&host, Duration::from_secs(5));

    let req = request("coverage.get", &[None, None, Some("false")]);
    let Payload::Coverage(snapshot) = client.call(&req).unwrap() else {
        panic!("expected coverage");
    };
    assert_eq!(snapshot.len(), 2);
    assert_eq!(snapshot.classes["a.B"].blocks, vec![vec![false, true], vec![false]]);
    assert!(host.auto_dump.load(Ordering::SeqCst));

    let req = request("coverage.get", &[None, None, Some("true")]);
    assert!(matches!(client.call(&req).unwrap(), Payload::Coverage(_)));
    assert!(!host.auto_dump.load(Ordering::SeqCst));
    controller.shutdown();
}

#[test]
fn get_without_store_returns_none() {
    let dir = tempfile::tempdir().unwrap();
    let host = Host::new(None, dir.path());
    let (controller, client) = serve(&host, Duration::from_secs(5));

    let payload = client.call(&request("coverage.get", &[])).unwrap();
    assert_eq!(payload, Payload::None);
    controller.shutdown();
}

#[test]
fn remote_dump_writes_file_on_server() {
    let dir = tempfile::tempdir().unwrap();
    let host = Host::new(Some(sample_data()), dir.path());
    let (controller, client) = serve(&host, Duration::from_secs(5));

    let out = dir.path().join("explicit.ec");
    let req = request(
        "coverage.dump",
        &[Some(out.to_str().unwrap()), Some("false"), Some("no")],
    );
    let Payload::Str(msg) = client.call(&req).unwrap() else {
        panic!("expected a status message");
    };
    assert!(msg.starts_with("runtime coverage data remotely written to ["), "{msg}");
    assert_eq!(covrt::data::load(&out).unwrap().len(), 2);
    assert!(host.auto_dump.load(Ordering::SeqCst));

    let req = request("coverage.dump", &[]);
    client.call(&req).unwrap();
    assert!(dir.path().join("remote.ec").exists());
    assert!(!host.auto_dump.load(Ordering::SeqCst));
    controller.shutdown();
}

#[test]
fn dropped_host_reports_runtime_unavailable() {
    let dir = tempfile::tempdir().unwrap();
    let host = Host::new(None, dir.path());
    let (controller, client) = serve(&host, Duration::from_secs(5));
    drop(host);

    let err = client.call(&request("coverage.reset", &[])).unwrap_err();
    let Error::Remote(remote) = err else {
        panic!("expected a remote error, got {err:?}");
    };
    assert_eq!(remote.kind, "coverage.reset");
    controller.shutdown();
}

#[test]
fn shutdown_closes_queued_requests_unanswered() {
    let dir = tempfile::tempdir().unwrap();
    let host = Host::new(None, dir.path());
    let (controller, client) = serve(&host, Duration::from_secs(2));

    let busy = {
        let client = client.clone();
        thread::spawn(move || client.execute(&request("test.ping", &[Some("5000")])))
    };
    thread::sleep(Duration::from_millis(200));
    let queued = thread::spawn(move || client.execute(&request("test.ping", &[Some("0")])));
    thread::sleep(Duration::from_millis(200));

    controller.shutdown();

    let err = queued.join().unwrap().unwrap_err();
    assert!(is_transport_error(&err), "{err:?}");
    // The in-flight ping is cut short; it may or may not get its echo.
    if let Ok(resp) = busy.join().unwrap() {
        assert_eq!(resp.payload, Payload::Int(5000));
    }
}

#[test]
fn restarted_controller_serves_again() {
    let dir = tempfile::tempdir().unwrap();
    let host = Host::new(None, dir.path());
    let (controller, _client) = serve(&host, Duration::from_secs(5));
    controller.shutdown();

    controller.start().unwrap();
    let payload = client_for(&controller)
        .call(&request("test.ping", &[Some("0")]))
        .unwrap();
    assert_eq!(payload, Payload::Int(0));
    controller.shutdown();
}

#[test]
fn restart_after_timed_out_shutdown_keeps_commands_serial() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("locked.ec");
    let host = Host::with_settings(
        Some(sample_data()),
        Settings {
            file_lock: true,
            lock_port_base: 42_000,
            lock_timeout: Duration::from_millis(3_000),
            lock_retries: 3,
            out_file: out.clone(),
            out_merge: false,
            ..Settings::default()
        },
    );
    let mut held = SocketMutex::for_file(&out, 42_000, Duration::from_secs(1), 0).unwrap();
    held.acquire().unwrap();

    let (controller, client) = serve(&host, Duration::from_millis(100));
    let dump = thread::spawn(move || client.execute(&request("coverage.dump", &[])));
    thread::sleep(Duration::from_millis(200));

    // The executor is stuck in lock backoff and outlives the grace period.
    controller.shutdown();
    controller.start().unwrap();
    held.release();
    thread::sleep(Duration::from_millis(2_500));

    let client = client_for(&controller);
    assert!(concurrent_pings(&client, "400") >= Duration::from_millis(800));
    controller.shutdown();
    let _ = dump.join().unwrap();
}

#[test]
fn oversized_snapshot_is_answered_with_error() {
    let dir = tempfile::tempdir().unwrap();
    let data = Arc::new(CoverageData::new());
    data.add_class(ClassCoverage::new("big.Class", 1, &[17 * 1024 * 1024]));
    let host = Host::new(Some(data), dir.path());
    let (controller, client) = serve(&host, Duration::from_secs(5));

    let err = client
        .call(&request("coverage.get", &[None, None, Some("false")]))
        .unwrap_err();
    let Error::Remote(remote) = err else {
        panic!("expected a remote error, got {err:?}");
    };
    assert_eq!(remote.kind, "coverage.get");
    controller.shutdown();
}
