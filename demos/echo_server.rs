use mill_loop::{ConnectionId, EventLoop, ListenConfig, LoopConfig};
use std::cell::RefCell;
use std::rc::Rc;

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

fn main() -> mill_loop::Result<()> {
    tracing_subscriber::fmt::init();

    let mut lp = EventLoop::new(LoopConfig::default());
    let info = lp.listen(
        ListenConfig::builder().address("127.0.0.1").port(3000).build(),
        |lp, id| {
            println!("client {} connected", id);
            wire_echo(lp, id);
            lp.on_hangup(id, |_, id| println!("client {} hung up", id));
            lp.on_error(id, |_, id, e| println!("client {} error: {}", id, e));
        },
    )?;

    println!("echo server listening on {}:{}", info.address, info.port);
    lp.start()
}
