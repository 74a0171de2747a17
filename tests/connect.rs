//! Client dials: successful completion and the connect-timeout race.

use std::io::Read;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use spillway::{
    Config, Context, Error, EventLoopListener, Handler, Payload, Result, Runtime,
};

struct Greeter;

impl Handler for Greeter {
    fn on_connected(&mut self, ctx: &mut Context<'_>) -> Result<()> {
        ctx.write(Payload::Bytes(bytes::Bytes::from_static(
            b"hello from the loop",
        )));
        ctx.flush();
        Ok(())
    }
}

#[test]
fn dial_completes_and_writes() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let config = Config::builder()
        .host("127.0.0.1")
        .port(0)
        .client_initializer(|pipeline| pipeline.add_last("greeter", Greeter))
        .build()
        .unwrap();
    let runtime = Runtime::start(config).unwrap();
    runtime.connect(addr);

    let (mut peer, _) = listener.accept().unwrap();
    peer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let mut greeting = vec![0u8; 19];
    peer.read_exact(&mut greeting).unwrap();
    assert_eq!(&greeting, b"hello from the loop");
}

#[derive(Clone, Default)]
struct ErrorSink(Arc<Mutex<Vec<String>>>);

impl ErrorSink {
    fn count(&self) -> usize {
        self.0.lock().unwrap().len()
    }
}

struct ErrorProbe {
    sink: ErrorSink,
    connected: Arc<Mutex<bool>>,
}

impl Handler for ErrorProbe {
    fn on_connected(&mut self, ctx: &mut Context<'_>) -> Result<()> {
        *self.connected.lock().unwrap() = true;
        ctx.fire_connected();
        Ok(())
    }
    fn on_error(&mut self, _ctx: &mut Context<'_>, error: Error) -> Result<()> {
        self.sink.0.lock().unwrap().push(error.to_string());
        Ok(())
    }
}

impl EventLoopListener for ErrorSink {
    fn on_error(&self, error: &Error) {
        self.0.lock().unwrap().push(error.to_string());
    }
}

#[test]
fn connect_timeout_fires_exactly_once() {
    let sink = ErrorSink::default();
    let connected = Arc::new(Mutex::new(false));

    let init_sink = sink.clone();
    let init_connected = Arc::clone(&connected);
    let config = Config::builder()
        .host("127.0.0.1")
        .port(0)
        .connect_timeout(Duration::from_millis(500))
        .client_initializer(move |pipeline| {
            pipeline.add_last(
                "probe",
                ErrorProbe {
                    sink: init_sink.clone(),
                    connected: Arc::clone(&init_connected),
                },
            )
        })
        .event_loop_listener(sink.clone())
        .build()
        .unwrap();
    let runtime = Runtime::start(config).unwrap();

    // A blackhole address: packets go nowhere, the dial never completes.
    let start = Instant::now();
    runtime.connect("10.255.255.1:9696".parse().unwrap());

    let deadline = start + Duration::from_secs(5);
    while sink.count() == 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }

    // Exactly one error surfaced, and it was never also "connected".
    assert_eq!(sink.count(), 1, "expected one dial failure");
    assert!(!*connected.lock().unwrap());

    // No late second event once the race has resolved.
    std::thread::sleep(Duration::from_millis(700));
    assert_eq!(sink.count(), 1);
}
