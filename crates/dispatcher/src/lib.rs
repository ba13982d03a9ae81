//! Per-service XML config loading and message routing between local
//! services over `netchain` stream sockets (`spec.md §4.D`).
//!
//! One [`Dispatcher`] loads every service config under a directory, then
//! for each service opens an inbound `Assocket` listener (receives frames
//! that service publishes) and an outbound `Acsocket` pool dialing every
//! other loaded service that subscribes to one of them. Routing, queueing
//! and reconnect logic live in [`service`]; this module is the directory
//! scan, the `Chain` wiring, and the external lifecycle surface.

pub mod backoff;
pub mod config;
pub mod error;
pub mod frame;
mod queue;
mod service;

pub use backoff::ReconnectBackoff;
pub use config::{MessageConfig, ServiceConfig};
pub use error::DispatcherError;
pub use frame::{Frame, FrameHeader};

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use jiukun_slab::Jiukun;
use netchain::Chain;
use service::ServiceRuntime;

/// Where the dispatcher looks for service configs and service sockets.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub config_dir: PathBuf,
    pub config_extension: String,
    pub socket_dir: PathBuf,
    /// Run the routing runtime for only this one service name, while still
    /// resolving the full subscriber graph from every config file in
    /// `config_dir`. Matches real deployments, where each host runs one
    /// dispatcher process per local service but all processes share the
    /// same configuration directory. `None` runs every loaded service in
    /// this one process (useful for tests and small all-in-one setups).
    pub only_service: Option<String>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            config_dir: PathBuf::from("/etc/jiufeng/dispatcher"),
            config_extension: "xml".to_string(),
            socket_dir: PathBuf::from("/var/run/jiufeng"),
            only_service: None,
        }
    }
}

/// The routing engine: one `netchain::Chain` carrying every loaded
/// service's inbound listener and outbound connection pool.
///
/// `!Send` by construction (`Chain` carries `Box<dyn ChainObject>`, which
/// is `!Send`): build it and call [`Dispatcher::run`] on the same thread;
/// obtain a [`DispatcherStopHandle`] first to stop it from elsewhere.
pub struct Dispatcher {
    chain: Chain,
    services: Vec<ServiceRuntime>,
    pending_total: Arc<AtomicUsize>,
}

impl Dispatcher {
    /// Load every service config under `cfg.config_dir` and wire up
    /// routing between them. A malformed config file is logged and
    /// skipped (`spec.md §7`); the directory itself must be readable.
    pub fn new(cfg: &DispatcherConfig, pool: Arc<Jiukun>) -> Result<Self, DispatcherError> {
        std::fs::create_dir_all(&cfg.socket_dir).map_err(DispatcherError::Io)?;

        let configs = config::scan_dir(&cfg.config_dir, &cfg.config_extension)?;
        let mut chain = Chain::new().map_err(DispatcherError::Io)?;
        let pending_total = Arc::new(AtomicUsize::new(0));

        let mut services = Vec::with_capacity(configs.len());
        for service_config in configs.clone() {
            if let Some(only) = &cfg.only_service {
                if &service_config.name != only {
                    continue;
                }
            }
            let runtime = ServiceRuntime::spawn(
                service_config,
                &configs,
                &cfg.socket_dir,
                &pool,
                &pending_total,
                &mut chain,
            )
            .map_err(DispatcherError::Io)?;
            services.push(runtime);
        }

        tracing::info!(count = services.len(), "dispatcher loaded services");
        Ok(Self {
            chain,
            services,
            pending_total,
        })
    }

    /// A handle that can stop this dispatcher from any thread
    /// (`spec.md §4.D`: "stop() closes listeners first, drains in-flight
    /// messages best-effort within a bounded wait, then closes clients").
    /// Must be obtained before [`Dispatcher::run`] consumes `self`.
    #[must_use]
    pub fn stop_handle(&self) -> DispatcherStopHandle {
        DispatcherStopHandle {
            chain_stop: self.chain.stop_handle(),
            pending_total: Arc::clone(&self.pending_total),
        }
    }

    /// `spec.md §4.D` pause/resume: toggle forwarding for one
    /// `(service, subscriber)` pair without affecting enqueue/eviction,
    /// which continues to apply regardless.
    pub fn pause_subscriber(&self, service: &str, subscriber: &str) -> bool {
        self.set_subscriber_paused(service, subscriber, true)
    }

    pub fn resume_subscriber(&self, service: &str, subscriber: &str) -> bool {
        self.set_subscriber_paused(service, subscriber, false)
    }

    fn set_subscriber_paused(&self, service: &str, subscriber: &str, paused: bool) -> bool {
        self.services
            .iter()
            .find(|s| s.name() == service)
            .map(|s| s.set_subscriber_paused(subscriber, paused))
            .unwrap_or(false)
    }

    /// Run the reactor loop until stopped. Blocks the calling thread.
    pub fn run(mut self) -> io::Result<()> {
        self.chain.run()
    }
}

/// Stops a running [`Dispatcher`] from any thread. Carries only `Arc`-based
/// state (no `Rc`), so unlike `Dispatcher` itself this is `Send`.
#[derive(Clone)]
pub struct DispatcherStopHandle {
    chain_stop: netchain::StopHandle,
    pending_total: Arc<AtomicUsize>,
}

impl DispatcherStopHandle {
    /// Best-effort drain: wait up to `drain_timeout` for every subscriber
    /// queue to empty before halting the reactor (`spec.md §4.D`). Does
    /// not block the reactor thread itself — callers invoke this from a
    /// signal handler or a supervisor thread while `Dispatcher::run`
    /// keeps draining queues on its own thread in the background.
    pub fn stop(&self, drain_timeout: Duration) {
        let deadline = Instant::now() + drain_timeout;
        while self.pending_total.load(Ordering::Relaxed) > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        self.chain_stop.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Frame, FrameHeader, HEADER_LEN};
    use jiukun_buddy::BuddyParams;
    use std::io::{Read, Write};
    use std::os::unix::net::{UnixListener as StdUnixListener, UnixStream as StdUnixStream};

    fn write_config(dir: &Path, file_name: &str, xml: &str) {
        let mut f = std::fs::File::create(dir.join(file_name)).unwrap();
        f.write_all(xml.as_bytes()).unwrap();
    }

    const PUBLISHER_XML: &str = r#"
        <configuration version="1.0">
          <serviceInfo>
            <serviceName>publisher</serviceName>
            <userName>nobody</userName>
            <messagingIn>publisher-in</messagingIn>
            <messagingOut>publisher-out</messagingOut>
            <maxNumMsg>10</maxNumMsg>
            <maxMsgSize>4096</maxMsgSize>
          </serviceInfo>
          <publishedMessage>
            <message id="&quot;101&quot;">event a</message>
          </publishedMessage>
          <subscribedMessage></subscribedMessage>
        </configuration>
    "#;

    const SUBSCRIBER_XML: &str = r#"
        <configuration version="1.0">
          <serviceInfo>
            <serviceName>subscriber</serviceName>
            <userName>nobody</userName>
            <messagingIn>subscriber-in</messagingIn>
            <messagingOut>subscriber-out</messagingOut>
            <maxNumMsg>10</maxNumMsg>
            <maxMsgSize>4096</maxMsgSize>
          </serviceInfo>
          <publishedMessage></publishedMessage>
          <subscribedMessage>
            <message id="&quot;101&quot;">event a</message>
          </subscribedMessage>
        </configuration>
    "#;

    /// S5: a frame published on `publisher`'s inbound endpoint for a message
    /// id it publishes and `subscriber` subscribes to is forwarded, byte for
    /// byte, to `subscriber`'s inbound endpoint; a frame whose id `publisher`
    /// does not publish never arrives there at all.
    ///
    /// Runs the dispatcher scoped to `only_service: Some("publisher")`
    /// (`spec.md §4.D`'s one-dispatcher-process-per-service deployment
    /// shape, also exercised by `DispatcherConfig::only_service`) so that
    /// `subscriber-in` is *not* bound by this process's own `Assocket` — the
    /// test itself stands in for `subscriber`'s owner process and binds a
    /// raw listener there, the only way to observe the exact bytes that
    /// cross the wire rather than trusting that nothing panicked.
    #[test]
    fn s5_routes_published_message_to_subscriber() {
        let config_dir = tempfile::tempdir().unwrap();
        let socket_dir = tempfile::tempdir().unwrap();
        write_config(config_dir.path(), "publisher.xml", PUBLISHER_XML);
        write_config(config_dir.path(), "subscriber.xml", SUBSCRIBER_XML);

        // Stand in for `subscriber`'s own owner process: bind its declared
        // input endpoint before the dispatcher starts, so `publisher`'s
        // outbound `Acsocket` has somewhere to dial from its very first
        // reconnect attempt.
        let subscriber_listener = StdUnixListener::bind(socket_dir.path().join("subscriber-in")).unwrap();

        let pool = Jiukun::new(BuddyParams {
            max_order: 8,
            no_grow: false,
        });

        let dispatcher = Dispatcher::new(
            &DispatcherConfig {
                config_dir: config_dir.path().to_path_buf(),
                config_extension: "xml".to_string(),
                socket_dir: socket_dir.path().to_path_buf(),
                only_service: Some("publisher".to_string()),
            },
            pool,
        )
        .unwrap();

        let stop = dispatcher.stop_handle();
        let socket_dir_path = socket_dir.path().to_path_buf();

        let reader = thread::spawn(move || {
            let (mut conn, _) = subscriber_listener.accept().unwrap();
            conn.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

            let mut header_buf = [0u8; HEADER_LEN];
            conn.read_exact(&mut header_buf).unwrap();
            let header = FrameHeader::decode(&header_buf).unwrap();
            let mut payload = vec![0u8; header.payload_len as usize];
            conn.read_exact(&mut payload).unwrap();

            // A second frame with an unpublished id must never arrive: the
            // connection should now sit idle (read times out) rather than
            // deliver more bytes.
            conn.set_read_timeout(Some(Duration::from_millis(300))).unwrap();
            let mut probe = [0u8; 1];
            let extra = conn.read(&mut probe);
            assert!(
                matches!(extra, Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut),
                "unexpected bytes after the published frame: {extra:?}"
            );

            (header, payload)
        });

        let driver = thread::spawn(move || {
            // Give the reactor a moment to bind/dial, then act as the local
            // producer process, writing straight to publisher's inbound
            // socket.
            thread::sleep(Duration::from_millis(100));
            let mut producer = StdUnixStream::connect(socket_dir_path.join("publisher-in")).unwrap();
            let published = Frame::new(101, 5, 7, b"payload".to_vec());
            producer.write_all(&published.encode()).unwrap();

            // `spec.md §8` property 7 / scenario S5: an id `publisher` does
            // not publish is dropped at the source, never routed anywhere.
            let unpublished = Frame::new(999, 5, 7, b"should not arrive".to_vec());
            producer.write_all(&unpublished.encode()).unwrap();

            thread::sleep(Duration::from_millis(300));
            stop.stop(Duration::from_secs(1));
        });

        dispatcher.run().unwrap();
        driver.join().unwrap();
        let (header, payload) = reader.join().unwrap();
        assert_eq!(header.message_id, 101);
        assert_eq!(header.priority, 5);
        assert_eq!(header.source_tag, 7);
        assert_eq!(payload, b"payload");
    }
}
