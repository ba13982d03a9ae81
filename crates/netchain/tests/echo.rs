//! S4 — echo: a server asocket echoes what it reads; the client observes
//! the same bytes back, possibly split across multiple `on_data` calls,
//! concatenating to the original (`spec.md §8` property 6 / scenario S4).

use std::cell::RefCell;
use std::io;
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use jiukun_buddy::BuddyParams;
use jiukun_slab::Jiukun;
use mio::net::UnixListener;
use netchain::{Acsocket, AsocketHandler, AsocketId, Assocket, Chain, DisconnectReason, Outbox};

struct EchoHandler;

impl AsocketHandler for EchoHandler {
    fn on_connect(&mut self, _id: AsocketId, _result: io::Result<()>) {}

    fn on_data(&mut self, _id: AsocketId, data: &[u8], outbox: &mut dyn Outbox) -> usize {
        outbox.send(data.to_vec());
        data.len()
    }

    fn on_disconnect(&mut self, _id: AsocketId, _reason: DisconnectReason) {}
    fn on_send_data(&mut self, _id: AsocketId, _result: io::Result<()>) {}
}

struct ClientHandler {
    received: Arc<Mutex<Vec<u8>>>,
    connected: Arc<Mutex<bool>>,
}

impl AsocketHandler for ClientHandler {
    fn on_connect(&mut self, _id: AsocketId, result: io::Result<()>) {
        if result.is_ok() {
            *self.connected.lock().unwrap() = true;
        }
    }

    fn on_data(&mut self, _id: AsocketId, data: &[u8], _outbox: &mut dyn Outbox) -> usize {
        self.received.lock().unwrap().extend_from_slice(data);
        data.len()
    }

    fn on_disconnect(&mut self, _id: AsocketId, _reason: DisconnectReason) {}
    fn on_send_data(&mut self, _id: AsocketId, _result: io::Result<()>) {}
}

#[test]
fn s4_echo_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let sock_path = dir.path().join("echo.sock");

    let pool = Jiukun::new(BuddyParams {
        max_order: 8,
        no_grow: false,
    });

    let mut chain = Chain::new().unwrap();

    let tokens = chain.token_allocator();

    let listener = UnixListener::bind(&sock_path).unwrap();
    let server_handler: Rc<RefCell<dyn AsocketHandler>> = Rc::new(RefCell::new(EchoHandler));
    let assocket = Assocket::new(listener, tokens.clone(), 4, Arc::clone(&pool), server_handler);
    chain.append(Box::new(assocket)).unwrap();

    let received = Arc::new(Mutex::new(Vec::new()));
    let connected = Arc::new(Mutex::new(false));
    let client_handler: Rc<RefCell<dyn AsocketHandler>> = Rc::new(RefCell::new(ClientHandler {
        received: Arc::clone(&received),
        connected: Arc::clone(&connected),
    }));
    let mut acsocket = Acsocket::new(4, tokens, Arc::clone(&pool), client_handler);
    let handle = acsocket.connect_to(&sock_path).unwrap();
    acsocket.send(handle, b"hello".to_vec()).unwrap();
    chain.append(Box::new(acsocket)).unwrap();

    // `chain.run()` must execute on this thread: `Chain` holds
    // `Box<dyn ChainObject>`, which is `!Send` by design (the objects
    // behind it use `Rc`). The waiter thread only carries the `Send`-safe
    // `StopHandle`.
    let stop = chain.stop_handle();
    let received_for_wait = Arc::clone(&received);
    let waiter = std::thread::spawn(move || {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            if received_for_wait.lock().unwrap().as_slice() == b"hello" {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "echo never arrived");
            std::thread::sleep(Duration::from_millis(10));
        }
        stop.stop();
    });

    chain.run().unwrap();
    waiter.join().unwrap();

    assert_eq!(received.lock().unwrap().as_slice(), b"hello");
}
