//! Pool exhaustion: with a one-buffer budget, the second session to need
//! memory gets an allocation failure and closes; the first keeps going.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use spillway::{Config, Context, Error, Handler, Result, Runtime};

/// Holds every byte it is given, never consuming, so its session pins
/// its read buffer for the life of the test.
struct Hoarder {
    allocation_failures: Arc<AtomicUsize>,
}

impl Handler for Hoarder {
    fn on_error(&mut self, ctx: &mut Context<'_>, error: Error) -> Result<()> {
        if error.is_allocation() {
            self.allocation_failures.fetch_add(1, Ordering::SeqCst);
        }
        ctx.fire_error(error);
        Ok(())
    }
}

#[test]
fn second_session_starves_and_closes() {
    let failures = Arc::new(AtomicUsize::new(0));
    let init_failures = Arc::clone(&failures);
    let config = Config::builder()
        .host("127.0.0.1")
        .port(0)
        .buffer_size(4096)
        // Exactly one buffer in the whole pool.
        .pool_size(4096)
        .store_size(1 << 20)
        .server_initializer(move |pipeline| {
            pipeline.add_last(
                "hoarder",
                Hoarder {
                    allocation_failures: Arc::clone(&init_failures),
                },
            )
        })
        .build()
        .unwrap();
    let runtime = Runtime::start(config).unwrap();
    let addr = runtime.local_addr().unwrap();

    // First session takes the only buffer and sits on it.
    let mut first = TcpStream::connect(addr).unwrap();
    first.write_all(b"mine now").unwrap();
    std::thread::sleep(Duration::from_millis(200));

    // Second session cannot get a read buffer.
    let mut second = TcpStream::connect(addr).unwrap();
    second.write_all(b"me too?").unwrap();
    second
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    let n = second.read(&mut [0u8; 8]).unwrap_or(0);
    assert_eq!(n, 0, "starved session should be closed");
    assert!(failures.load(Ordering::SeqCst) >= 1);

    // The first session is still alive and still reading... up to its
    // buffer's room, at least.
    first
        .set_read_timeout(Some(Duration::from_millis(300)))
        .unwrap();
    first.write_all(b"still here").unwrap();
    match first.read(&mut [0u8; 1]) {
        Ok(0) => panic!("first session should not have closed"),
        Ok(_) => panic!("nothing should be echoed"),
        Err(e) => {
            assert!(matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
            ));
        }
    }
}
