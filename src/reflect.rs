use std::io;

use anyhow::bail;
use async_trait::async_trait;
use futures::future::select_all;
use tokio::sync::mpsc;
use tracing::{error, info, trace, warn};

use crate::channel::{DatagramChannel, Received};
use crate::config::ReflectorConfig;

/// Per-endpoint accounting, monotonic for the life of the process. Exposed
///  so callers can print a summary and tests can assert on traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Counters {
    pub received: u64,
    pub transmitted: u64,
    pub errored: u64,
    pub received_bytes: u64,
}

/// A bound listening channel plus its counters. Created once per listen
///  address at setup, never removed or reset while serving.
pub struct Endpoint {
    name: String,
    channel: DatagramChannel,
    counters: Counters,
}

impl Endpoint {
    pub fn new(name: impl Into<String>, channel: DatagramChannel) -> Endpoint {
        Endpoint {
            name: name.into(),
            channel,
            counters: Counters::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn channel(&self) -> &DatagramChannel {
        &self.channel
    }

    pub fn counters(&self) -> Counters {
        self.counters
    }
}

/// How a readable endpoint gets emptied. Two interchangeable
///  implementations: per-datagram receive, and gathering a batch before
///  reflecting. Which one runs must not be observable in the counters or in
///  the replies.
#[async_trait]
pub trait DrainStrategy: Send + Sync {
    /// Drain everything pending on the endpoint, reflecting each datagram
    ///  to its source.
    async fn drain(&self, endpoint: &mut Endpoint, max_datagram: usize);
}

/// Receive and reflect one datagram at a time until the channel reports
///  "would block".
pub struct SingleDrain;

#[async_trait]
impl DrainStrategy for SingleDrain {
    async fn drain(&self, endpoint: &mut Endpoint, max_datagram: usize) {
        loop {
            match endpoint.channel.try_recv(max_datagram) {
                Ok(Some(datagram)) => reflect_one(endpoint, datagram).await,
                Ok(None) => return,
                Err(e) => {
                    warn!("endpoint {}: recv failed: {}", endpoint.name, e);
                    endpoint.counters.errored += 1;
                    return;
                }
            }
        }
    }
}

/// Gather up to `batch_size` datagrams per pass, then reflect them, until
///  the channel reports "would block". Mirrors what a batch receive system
///  call does: sources may interleave within a pass, and each reply must
///  still go to the right one.
pub struct BatchDrain {
    pub batch_size: usize,
}

#[async_trait]
impl DrainStrategy for BatchDrain {
    async fn drain(&self, endpoint: &mut Endpoint, max_datagram: usize) {
        loop {
            let mut batch = Vec::with_capacity(self.batch_size);
            let mut depleted = false;
            while batch.len() < self.batch_size {
                match endpoint.channel.try_recv(max_datagram) {
                    Ok(Some(datagram)) => batch.push(datagram),
                    Ok(None) => {
                        depleted = true;
                        break;
                    }
                    Err(e) => {
                        warn!("endpoint {}: recv failed: {}", endpoint.name, e);
                        endpoint.counters.errored += 1;
                        depleted = true;
                        break;
                    }
                }
            }
            for datagram in batch {
                reflect_one(endpoint, datagram).await;
            }
            if depleted {
                return;
            }
        }
    }
}

/// The strategy matching the platform's capabilities: batching where the OS
///  has a batch receive primitive, one at a time elsewhere. Both are always
///  compiled; tests pick either explicitly.
pub fn platform_drain_strategy(config: &ReflectorConfig) -> Box<dyn DrainStrategy> {
    #[cfg(target_os = "linux")]
    {
        Box::new(BatchDrain {
            batch_size: config.batch_size,
        })
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = config;
        Box::new(SingleDrain)
    }
}

async fn reflect_one(endpoint: &mut Endpoint, datagram: Received) {
    let counters = &mut endpoint.counters;
    counters.received += 1;
    counters.received_bytes += datagram.payload.len() as u64;

    if datagram.truncated {
        warn!(
            "endpoint {}: datagram from {:?} exceeds {} octets, not reflecting",
            endpoint.name,
            datagram.from,
            datagram.payload.len()
        );
        counters.errored += 1;
        return;
    }

    trace!(
        "endpoint {}: reflecting {} octets to {:?}",
        endpoint.name,
        datagram.payload.len(),
        datagram.from
    );
    match endpoint.channel.send_to(&datagram.payload, datagram.from).await {
        Ok(_) => counters.transmitted += 1,
        Err(e) => {
            warn!(
                "endpoint {}: send to {:?} failed: {}",
                endpoint.name, datagram.from, e
            );
            counters.errored += 1;
        }
    }
}

/// Owns a set of bound channels and echoes every datagram back to its
///  sender, from the socket it arrived on. Runs until a fatal readiness
///  failure or until the control channel says stop.
pub struct Reflector {
    endpoints: Vec<Endpoint>,
    strategy: Box<dyn DrainStrategy>,
    max_datagram: usize,
    shutdown: Option<mpsc::Receiver<()>>,
}

impl Reflector {
    pub fn new(config: &ReflectorConfig) -> anyhow::Result<Reflector> {
        config.validate()?;

        Ok(Reflector {
            endpoints: Vec::new(),
            strategy: platform_drain_strategy(config),
            max_datagram: config.max_datagram,
            shutdown: None,
        })
    }

    /// Replace the platform-selected drain strategy. Used by tests to force
    ///  one code path or the other.
    pub fn with_strategy(mut self, strategy: Box<dyn DrainStrategy>) -> Reflector {
        self.strategy = strategy;
        self
    }

    /// Register a control channel: the first message on it stops the serve
    ///  loop.
    pub fn with_shutdown(mut self, shutdown: mpsc::Receiver<()>) -> Reflector {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn add_endpoint(&mut self, name: impl Into<String>, channel: DatagramChannel) {
        let endpoint = Endpoint::new(name, channel);
        info!(
            "registered endpoint {} on {:?}",
            endpoint.name(),
            endpoint.channel().local_addr().ok()
        );
        self.endpoints.push(endpoint);
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    /// The event loop. Waits without timeout for any endpoint to become
    ///  readable and drains it; a readiness error is fatal and ends the
    ///  loop with `Err`, a shutdown signal ends it with `Ok`.
    pub async fn serve(&mut self) -> anyhow::Result<()> {
        if self.endpoints.is_empty() {
            bail!("reflector has no endpoints");
        }
        info!("serving {} endpoint(s)", self.endpoints.len());

        loop {
            let ready = match &mut self.shutdown {
                Some(shutdown) => {
                    tokio::select! {
                        _ = shutdown.recv() => {
                            info!("control channel says stop");
                            return Ok(());
                        }
                        ready = next_readable(&self.endpoints) => ready,
                    }
                }
                None => next_readable(&self.endpoints).await,
            };

            match ready {
                Ok(index) => {
                    let endpoint = &mut self.endpoints[index];
                    self.strategy.drain(endpoint, self.max_datagram).await;
                }
                Err(e) => {
                    error!("readiness wait failed: {}", e);
                    bail!("readiness wait failed: {}", e);
                }
            }
        }
    }
}

/// Multiplex over all endpoints, resolving to the index of the first one
///  that becomes readable.
async fn next_readable(endpoints: &[Endpoint]) -> io::Result<usize> {
    let waits = endpoints.iter().enumerate().map(|(index, endpoint)| {
        Box::pin(async move {
            endpoint.channel().readiness(None).await?;
            Ok(index)
        })
    });

    let (ready, _, _) = select_all(waits).await;
    ready
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MockDatagramSocket;
    use bytes::Bytes;
    use rstest::*;
    use std::collections::VecDeque;
    use std::io;
    use std::net::SocketAddr;
    use std::sync::{Arc, Mutex};

    fn source(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], port))
    }

    /// A fake bound socket with a scripted arrival queue. Entries longer
    ///  than the receive buffer come back truncated, like the real kernel.
    ///  Reflected sends are recorded.
    fn scripted_socket(
        arrivals: Vec<(Vec<u8>, SocketAddr)>,
        sends: Arc<Mutex<Vec<(Vec<u8>, SocketAddr)>>>,
        send_errors: usize,
    ) -> MockDatagramSocket {
        let queue: Arc<Mutex<VecDeque<(Vec<u8>, SocketAddr)>>> =
            Arc::new(Mutex::new(arrivals.into_iter().collect()));
        let mut socket = MockDatagramSocket::new();

        socket
            .expect_try_recv_from()
            .returning(move |buf| match queue.lock().unwrap().pop_front() {
                Some((datagram, from)) => {
                    let n = datagram.len().min(buf.len());
                    buf[..n].copy_from_slice(&datagram[..n]);
                    Ok((n, from))
                }
                None => Err(io::ErrorKind::WouldBlock.into()),
            });

        let remaining_errors = Mutex::new(send_errors);
        socket.expect_send_to().returning(move |buf, to| {
            let mut left = remaining_errors.lock().unwrap();
            if *left > 0 {
                *left -= 1;
                return Err(io::ErrorKind::PermissionDenied.into());
            }
            sends.lock().unwrap().push((buf.to_vec(), to));
            Ok(buf.len())
        });
        socket
    }

    fn endpoint_of(socket: MockDatagramSocket) -> Endpoint {
        Endpoint::new(
            "test",
            DatagramChannel::from_parts(Arc::new(socket), None),
        )
    }

    fn mixed_traffic() -> Vec<(Vec<u8>, SocketAddr)> {
        vec![
            (b"alpha".to_vec(), source(1000)),
            (b"bravo".to_vec(), source(2000)),
            (vec![0xab; 200], source(1000)), // oversize, will be truncated
            (b"charlie".to_vec(), source(3000)),
            (Vec::new(), source(2000)), // empty datagrams are legal
        ]
    }

    fn strategies() -> Vec<Box<dyn DrainStrategy>> {
        vec![
            Box::new(SingleDrain),
            Box::new(BatchDrain { batch_size: 2 }),
            Box::new(BatchDrain { batch_size: 16 }),
        ]
    }

    #[rstest]
    #[tokio::test]
    async fn test_drain_accounting_and_reply_addresses() {
        for strategy in strategies() {
            let sends = Arc::new(Mutex::new(Vec::new()));
            let mut endpoint = endpoint_of(scripted_socket(mixed_traffic(), sends.clone(), 0));

            strategy.drain(&mut endpoint, 100).await;

            let counters = endpoint.counters();
            assert_eq!(counters.received, 5);
            assert_eq!(counters.transmitted, 4);
            assert_eq!(counters.errored, 1); // the truncated one
            assert_eq!(counters.received_bytes, (5 + 5 + 100 + 7 + 0) as u64);

            // each reply went to the exact source, interleaved or not
            let sends = sends.lock().unwrap();
            assert_eq!(
                *sends,
                vec![
                    (b"alpha".to_vec(), source(1000)),
                    (b"bravo".to_vec(), source(2000)),
                    (b"charlie".to_vec(), source(3000)),
                    (Vec::new(), source(2000)),
                ]
            );
        }
    }

    #[rstest]
    #[tokio::test]
    async fn test_drain_strategies_are_equivalent() {
        let mut final_counters = Vec::new();
        for strategy in strategies() {
            let sends = Arc::new(Mutex::new(Vec::new()));
            let mut endpoint = endpoint_of(scripted_socket(mixed_traffic(), sends.clone(), 1));

            strategy.drain(&mut endpoint, 100).await;
            final_counters.push((endpoint.counters(), sends.lock().unwrap().clone()));
        }

        assert!(final_counters.windows(2).all(|w| w[0] == w[1]));
    }

    #[rstest]
    #[tokio::test]
    async fn test_send_failure_counts_as_errored() {
        let sends = Arc::new(Mutex::new(Vec::new()));
        let arrivals = vec![
            (b"one".to_vec(), source(1)),
            (b"two".to_vec(), source(2)),
        ];
        let mut endpoint = endpoint_of(scripted_socket(arrivals, sends.clone(), 1));

        SingleDrain.drain(&mut endpoint, 100).await;

        let counters = endpoint.counters();
        assert_eq!(counters.received, 2);
        assert_eq!(counters.transmitted, 1);
        assert_eq!(counters.errored, 1);
        assert_eq!(sends.lock().unwrap().len(), 1);
    }

    #[rstest]
    #[tokio::test]
    async fn test_serve_requires_endpoints() {
        let mut reflector = Reflector::new(&ReflectorConfig::default()).unwrap();
        assert!(reflector.serve().await.is_err());
    }

    #[rstest]
    #[tokio::test]
    async fn test_serve_stops_on_shutdown() {
        let listener = DatagramChannel::bound("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let (tx, rx) = mpsc::channel(1);
        let mut reflector = Reflector::new(&ReflectorConfig::default())
            .unwrap()
            .with_shutdown(rx);
        reflector.add_endpoint("only", listener);

        tx.send(()).await.unwrap();
        assert!(reflector.serve().await.is_ok());
    }

    #[rstest]
    #[tokio::test]
    async fn test_reflect_one_truncated_is_not_sent() {
        let sends = Arc::new(Mutex::new(Vec::new()));
        let mut endpoint = endpoint_of(scripted_socket(Vec::new(), sends.clone(), 0));

        let datagram = Received {
            payload: Bytes::from_static(&[0u8; 32]),
            truncated: true,
            from: source(7),
        };
        reflect_one(&mut endpoint, datagram).await;

        let counters = endpoint.counters();
        assert_eq!(counters.received, 1);
        assert_eq!(counters.received_bytes, 32);
        assert_eq!(counters.errored, 1);
        assert_eq!(counters.transmitted, 0);
        assert!(sends.lock().unwrap().is_empty());
    }
}
