use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use mill_loop::{ConnectionId, EventLoop, ListenConfig, LoopConfig};
use std::cell::RefCell;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::rc::Rc;
use std::thread;
use std::time::{Duration, Instant};

const ROUNDTRIPS: usize = 100;
const MESSAGE: &[u8] = b"PING\n";

fn wire_echo(lp: &mut EventLoop, id: ConnectionId) {
    let queued: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
    let rq = queued.clone();
    lp.on_read(id, move |lp, id, data| {
        rq.borrow_mut().extend_from_slice(data);
        lp.writing(id);
    });
    lp.on_write(id, move |lp, id| {
        let mut queued = queued.borrow_mut();
        if queued.is_empty() {
            lp.not_writing(id);
            None
        } else {
            Some(std::mem::take(&mut *queued))
        }
    });
}

/// One full server lifetime: accept a client, echo `ROUNDTRIPS`
/// messages, stop when the client hangs up. Returns the client-observed
/// duration of the ping-pong phase.
fn echo_session() -> Duration {
    let mut lp = EventLoop::new(
        LoopConfig::builder()
            .poll_wait(Duration::from_millis(1))
            .build(),
    );
    let info = lp
        .listen(
            ListenConfig::builder().address("127.0.0.1").port(0).build(),
            |lp, id| {
                wire_echo(lp, id);
                lp.on_hangup(id, |lp, _| lp.stop());
                lp.on_error(id, |lp, _, _| lp.stop());
            },
        )
        .unwrap();

    let port = info.port;
    let peer = thread::spawn(move || {
        let mut sock = TcpStream::connect(("127.0.0.1", port)).unwrap();
        sock.set_nodelay(true).unwrap();
        let mut buf = [0u8; MESSAGE.len()];
        let start = Instant::now();
        for _ in 0..ROUNDTRIPS {
            sock.write_all(MESSAGE).unwrap();
            sock.read_exact(&mut buf).unwrap();
        }
        start.elapsed()
    });

    lp.start().unwrap();
    peer.join().unwrap()
}

fn bench_echo_roundtrips(c: &mut Criterion) {
    let mut group = c.benchmark_group("echo");
    group.throughput(Throughput::Elements(ROUNDTRIPS as u64));
    group.sample_size(10);
    group.bench_function("tcp_roundtrips", |b| {
        b.iter_custom(|iters| {
            let mut total = Duration::ZERO;
            for _ in 0..iters {
                total += echo_session();
            }
            total
        })
    });
    group.finish();
}

fn bench_listener_setup(c: &mut Criterion) {
    c.bench_function("listen_teardown", |b| {
        b.iter(|| {
            let mut lp = EventLoop::new(LoopConfig::default());
            lp.listen(
                ListenConfig::builder().address("127.0.0.1").port(0).build(),
                |_, _| {},
            )
            .unwrap()
        })
    });
}

criterion_group!(benches, bench_echo_roundtrips, bench_listener_setup);
criterion_main!(benches);
