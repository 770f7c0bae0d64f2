//! Line-delimited JSON-RPC server on top of the event loop. One request
//! per line, one response per line. Try it with:
//!
//! ```text
//! echo '{"Add":{"a":2,"b":3}}' | nc 127.0.0.1 3100
//! ```

use mill_loop::{ConnectionId, EventLoop, ListenConfig, LoopConfig};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

#[derive(Deserialize, Debug)]
enum RpcRequest {
    Ping,
    Echo { message: String },
    Add { a: i64, b: i64 },
    SetValue { key: String, value: String },
    GetValue { key: String },
    ListKeys,
}

#[derive(Serialize, Debug)]
enum RpcResponse {
    Pong,
    Echo { message: String },
    Sum { result: i64 },
    ValueSet { key: String },
    Value { key: String, value: Option<String> },
    Keys { keys: Vec<String> },
    Error { message: String },
}

type DataStore = Rc<RefCell<HashMap<String, String>>>;

fn handle_request(store: &DataStore, request: RpcRequest) -> RpcResponse {
    match request {
        RpcRequest::Ping => RpcResponse::Pong,
        RpcRequest::Echo { message } => RpcResponse::Echo { message },
        RpcRequest::Add { a, b } => RpcResponse::Sum { result: a + b },
        RpcRequest::SetValue { key, value } => {
            store.borrow_mut().insert(key.clone(), value);
            RpcResponse::ValueSet { key }
        }
        RpcRequest::GetValue { key } => {
            let value = store.borrow().get(&key).cloned();
            RpcResponse::Value { key, value }
        }
        RpcRequest::ListKeys => RpcResponse::Keys {
            keys: store.borrow().keys().cloned().collect(),
        },
    }
}

fn wire_connection(lp: &mut EventLoop, id: ConnectionId, store: DataStore) {
    let input: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
    let output: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));

    let pending = output.clone();
    lp.on_read(id, move |lp, id, data| {
        let mut input = input.borrow_mut();
        input.extend_from_slice(data);

        // One complete line per request; partial lines wait for more.
        while let Some(pos) = input.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = input.drain(..=pos).collect();
            let response = match serde_json::from_slice::<RpcRequest>(&line) {
                Ok(request) => handle_request(&store, request),
                Err(e) => RpcResponse::Error {
                    message: e.to_string(),
                },
            };
            let mut encoded = serde_json::to_vec(&response).unwrap();
            encoded.push(b'\n');
            pending.borrow_mut().extend_from_slice(&encoded);
        }
        if !pending.borrow().is_empty() {
            lp.writing(id);
        }
    });

    lp.on_write(id, move |lp, id| {
        let mut output = output.borrow_mut();
        if output.is_empty() {
            lp.not_writing(id);
            None
        } else {
            Some(std::mem::take(&mut *output))
        }
    });
}

fn main() -> mill_loop::Result<()> {
    tracing_subscriber::fmt::init();

    let store: DataStore = Rc::new(RefCell::new(HashMap::new()));
    let mut lp = EventLoop::new(LoopConfig::default());

    let info = lp.listen(
        ListenConfig::builder().address("127.0.0.1").port(3100).build(),
        move |lp, id| {
            println!("client {} connected", id);
            wire_connection(lp, id, store.clone());
            lp.on_hangup(id, |_, id| println!("client {} hung up", id));
            lp.on_error(id, |_, id, e| println!("client {} error: {}", id, e));
        },
    )?;

    println!("JSON-RPC server listening on {}:{}", info.address, info.port);
    lp.start()
}
