//! Idle detection: a silent peer trips the read timeout and the session
//! closes.

use std::io::Read;
use std::net::TcpStream;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use spillway::{Config, Context, Error, Handler, IdleKind, Result, Runtime};

struct IdleProbe {
    seen: Arc<Mutex<Vec<String>>>,
}

impl Handler for IdleProbe {
    fn on_error(&mut self, ctx: &mut Context<'_>, error: Error) -> Result<()> {
        if matches!(
            error,
            Error::IdleTimeout {
                kind: IdleKind::Read,
                ..
            }
        ) {
            self.seen.lock().unwrap().push(error.to_string());
        }
        // Unhandled at the tail, this closes the session.
        ctx.fire_error(error);
        Ok(())
    }
}

#[test]
fn idle_read_timeout_closes_session() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let init_seen = Arc::clone(&seen);
    let config = Config::builder()
        .host("127.0.0.1")
        .port(0)
        .read_timeout(Duration::from_millis(300))
        .server_initializer(move |pipeline| {
            pipeline.add_last(
                "probe",
                IdleProbe {
                    seen: Arc::clone(&init_seen),
                },
            )
        })
        .build()
        .unwrap();
    let runtime = Runtime::start(config).unwrap();
    let addr = runtime.local_addr().unwrap();

    let start = Instant::now();
    let mut client = TcpStream::connect(addr).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(3)))
        .unwrap();

    // Send nothing: the server should give up and close.
    let n = client.read(&mut [0u8; 8]).unwrap_or(0);
    let elapsed = start.elapsed();

    assert_eq!(n, 0, "expected EOF from the idle close");
    assert!(
        elapsed >= Duration::from_millis(250),
        "closed suspiciously early: {elapsed:?}"
    );
    assert!(
        elapsed < Duration::from_secs(3),
        "idle close did not arrive: {elapsed:?}"
    );
    assert_eq!(seen.lock().unwrap().len(), 1);
}

#[test]
fn traffic_defers_the_idle_timeout() {
    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let init_seen = Arc::clone(&seen);
    let config = Config::builder()
        .host("127.0.0.1")
        .port(0)
        .read_timeout(Duration::from_millis(400))
        .server_initializer(move |pipeline| {
            pipeline.add_last(
                "probe",
                IdleProbe {
                    seen: Arc::clone(&init_seen),
                },
            )
        })
        .build()
        .unwrap();
    let runtime = Runtime::start(config).unwrap();
    let addr = runtime.local_addr().unwrap();

    let mut client = TcpStream::connect(addr).unwrap();

    // Keep the link warm past several timeout windows.
    use std::io::Write;
    for _ in 0..5 {
        client.write_all(b"tick").unwrap();
        std::thread::sleep(Duration::from_millis(150));
    }
    assert!(seen.lock().unwrap().is_empty());

    // Then fall silent and let it trip.
    std::thread::sleep(Duration::from_millis(700));
    assert_eq!(seen.lock().unwrap().len(), 1);
}
